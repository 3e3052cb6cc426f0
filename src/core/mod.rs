pub mod resource_pool;

pub use resource_pool::{HandleId, PoolError, ResourcePool};
