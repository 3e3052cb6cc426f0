pub mod command_buffer;
pub mod headless;
mod mipmap;
pub mod types;
pub mod wgpu_device;

use glam::UVec2;
use thiserror::Error;

use crate::core::{HandleId, PoolError};

pub use command_buffer::{ColorAttachment, Command, CommandBuffer, DepthAttachment, ResourceState};
pub use types::{
    BlendFactor, BlendOp, CompareOp, CullMode, LoadOp, PrimitiveTopology, ShaderStage,
};

pub struct _Buffer;
pub struct _Texture;
pub struct _Sampler;
pub struct _Pipeline;
pub struct _Fence;

pub type BufferId = HandleId<_Buffer>;
pub type TextureId = HandleId<_Texture>;
pub type SamplerId = HandleId<_Sampler>;
pub type PipelineId = HandleId<_Pipeline>;
pub type FenceId = HandleId<_Fence>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("unknown {0} handle")]
    InvalidHandle(&'static str),
    #[error("copy out of bounds: {0}")]
    OutOfBounds(String),
    #[error("fence already has a submission in flight")]
    FenceBusy,
    #[error("unsupported by this device: {0}")]
    Unsupported(String),
    #[error("shader compilation failed for '{name}': {message}")]
    Shader { name: String, message: String },
    #[error("no suitable adapter: {0}")]
    Adapter(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Compute,
    Transfer,
}

#[derive(Debug, Clone)]
pub struct BufferCreation {
    pub name: String,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureCreation {
    pub name: String,
    pub extent: UVec2,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
}
impl TextureCreation {
    pub fn new_2d(name: &str, extent: UVec2, format: wgpu::TextureFormat) -> Self {
        Self {
            name: name.to_string(),
            extent,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SamplerCreation {
    pub name: String,
    pub min_filter: wgpu::FilterMode,
    pub mag_filter: wgpu::FilterMode,
    pub mipmap_filter: wgpu::FilterMode,
    pub address_mode: wgpu::AddressMode,
}
impl Default for SamplerCreation {
    fn default() -> Self {
        Self {
            name: String::new(),
            min_filter: wgpu::FilterMode::Linear,
            mag_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            address_mode: wgpu::AddressMode::Repeat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendState {
    pub enable: bool,
    pub src_colour: BlendFactor,
    pub dst_colour: BlendFactor,
    pub op: BlendOp,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthState {
    pub write: bool,
    pub test: Option<CompareOp>,
}

#[derive(Debug, Clone)]
pub struct ShaderStageCreation {
    pub stage: ShaderStage,
    pub name: String,
    pub source: String,
}

/// Attachment formats and load ops a pipeline renders into.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderPassOutput {
    pub color: Vec<(wgpu::TextureFormat, LoadOp)>,
    pub depth: Option<(wgpu::TextureFormat, LoadOp)>,
}
impl RenderPassOutput {
    pub fn swapchain(format: wgpu::TextureFormat) -> Self {
        Self {
            color: vec![(format, LoadOp::Clear)],
            depth: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineCreation {
    pub name: String,
    pub stages: Vec<ShaderStageCreation>,
    pub depth: DepthState,
    pub blend: Vec<BlendState>,
    pub cull: CullMode,
    pub topology: PrimitiveTopology,
    pub render_pass: RenderPassOutput,
}
impl PipelineCreation {
    pub fn is_compute(&self) -> bool {
        self.stages.iter().any(|s| s.stage == ShaderStage::Compute)
    }
}

/// Row pitch and row count of one tightly packed subresource.
pub fn texel_copy_layout(format: wgpu::TextureFormat, extent: UVec2) -> Option<(u64, u32)> {
    let block_size = format.block_copy_size(None)? as u64;
    let (bw, bh) = format.block_dimensions();
    let blocks_x = extent.x.max(1).div_ceil(bw) as u64;
    let blocks_y = extent.y.max(1).div_ceil(bh);
    Some((blocks_x * block_size, blocks_y))
}

pub fn mip_extent(extent: UVec2, mip: u32) -> UVec2 {
    UVec2::new((extent.x >> mip).max(1), (extent.y >> mip).max(1))
}

/// Formats whose mip chains the devices build from level 0 with a 2x2 filter.
pub fn supports_mip_generation(format: wgpu::TextureFormat) -> bool {
    matches!(
        format,
        wgpu::TextureFormat::Rgba8Unorm
            | wgpu::TextureFormat::Rgba8UnormSrgb
            | wgpu::TextureFormat::Bgra8Unorm
            | wgpu::TextureFormat::Bgra8UnormSrgb
    )
}

/// Everything the renderer needs from a GPU backend. All calls take `&self`
/// so a device can be shared between the graphics thread and the loader.
pub trait GpuDevice: Send + Sync {
    fn create_buffer(&self, creation: &BufferCreation) -> Result<BufferId, DeviceError>;
    fn destroy_buffer(&self, buffer: BufferId);
    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError>;
    fn buffer_size(&self, buffer: BufferId) -> Option<u64>;

    fn create_texture(&self, creation: &TextureCreation) -> Result<TextureId, DeviceError>;
    fn destroy_texture(&self, texture: TextureId);
    fn texture_extent(&self, texture: TextureId) -> Option<UVec2>;

    fn create_sampler(&self, creation: &SamplerCreation) -> Result<SamplerId, DeviceError>;
    fn destroy_sampler(&self, sampler: SamplerId);

    fn create_pipeline(&self, creation: &PipelineCreation) -> Result<PipelineId, DeviceError>;
    fn destroy_pipeline(&self, pipeline: PipelineId);

    fn create_fence(&self) -> Result<FenceId, DeviceError>;
    fn destroy_fence(&self, fence: FenceId);
    /// Non-blocking status query.
    fn fence_signaled(&self, fence: FenceId) -> bool;
    fn reset_fence(&self, fence: FenceId);

    fn submit(
        &self,
        queue: QueueType,
        commands: CommandBuffer,
        fence: Option<FenceId>,
    ) -> Result<(), DeviceError>;
    fn wait_idle(&self);

    fn swapchain_extent(&self) -> UVec2;
    fn swapchain_format(&self) -> wgpu::TextureFormat;
    fn swapchain_texture(&self) -> TextureId;
    fn resize_swapchain(&self, extent: UVec2) -> Result<(), DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_layout_handles_blocks_and_mips() {
        let (row, rows) = texel_copy_layout(wgpu::TextureFormat::Rgba8Unorm, UVec2::new(3, 2)).unwrap();
        assert_eq!((row, rows), (12, 2));

        let (row, rows) =
            texel_copy_layout(wgpu::TextureFormat::Bc1RgbaUnorm, UVec2::new(10, 6)).unwrap();
        assert_eq!((row, rows), (24, 2));

        assert_eq!(mip_extent(UVec2::new(8, 2), 2), UVec2::new(2, 1));
        assert_eq!(mip_extent(UVec2::new(8, 2), 5), UVec2::new(1, 1));
    }
}
