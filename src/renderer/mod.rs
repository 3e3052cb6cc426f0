pub mod resource_cache;
pub mod technique;
pub mod technique_watcher;

pub use resource_cache::{
    BufferHandle, BufferResource, CacheError, Material, MaterialCreation, MaterialHandle,
    RendererResourceCache, ResourceKind, SamplerHandle, TeardownReport, Technique,
    TechniqueCreation, TechniqueHandle, TechniquePass, TechniquePassCreation, TextureHandle,
    TextureResource,
};
pub use technique::{LoadedTechnique, TechniqueError};
pub use technique_watcher::TechniqueWatcher;
