pub mod async_loader;
pub mod decode;
pub mod manager;
pub mod requests;

use glam::UVec2;
use thiserror::Error;

use crate::gpu::DeviceError;

pub use async_loader::{AsyncLoader, LoadFailure, UpdateReport};
pub use decode::DecodeError;
pub use manager::AsyncLoaderManager;
pub use requests::{
    BufferTarget, OverflowPolicy, ReadyFlag, RequestQueue, TextureData, TextureTarget, TextureUpdate,
};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("{queue} queue is full ({capacity} requests)")]
    QueueFull { queue: &'static str, capacity: usize },
    #[error("{0} queue disconnected")]
    Disconnected(&'static str),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("upload needs {size} bytes but the staging buffer holds {capacity}")]
    StagingOverflow { size: u64, capacity: u64 },
    #[error("decoded {decoded} {decoded_format:?} does not match destination {expected} {expected_format:?}")]
    TextureMismatch {
        decoded: UVec2,
        decoded_format: wgpu::TextureFormat,
        expected: UVec2,
        expected_format: wgpu::TextureFormat,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
