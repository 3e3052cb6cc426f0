pub mod config;
pub mod context;
pub mod core;
pub mod gpu;
pub mod job_system;
pub mod loader;
pub mod passes;
pub mod render_graph;
pub mod renderer;

pub use context::{EngineContext, EngineError};
