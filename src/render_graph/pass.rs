use glam::UVec2;

use super::ResourceType;
use crate::{
    gpu::{BufferId, CommandBuffer, GpuDevice, RenderPassOutput, TextureId},
    job_system::worker_pool::WorkerPool,
    renderer::RendererResourceCache,
};

#[derive(Debug, Clone, PartialEq)]
pub struct BoundResource {
    pub name: String,
    pub kind: ResourceType,
    pub texture: Option<TextureId>,
    pub buffer: Option<BufferId>,
}

/// Resources of the node currently executing, resolved to GPU objects.
#[derive(Debug, Clone, Default)]
pub struct PassIo {
    pub node: String,
    pub inputs: Vec<BoundResource>,
    pub outputs: Vec<BoundResource>,
    pub extent: UVec2,
    pub render_pass: Option<RenderPassOutput>,
}

impl PassIo {
    pub fn input_texture(&self, name: &str) -> Option<TextureId> {
        self.inputs.iter().find(|r| r.name == name).and_then(|r| r.texture)
    }

    pub fn output_texture(&self, name: &str) -> Option<TextureId> {
        self.outputs.iter().find(|r| r.name == name).and_then(|r| r.texture)
    }

    pub fn buffer(&self, name: &str) -> Option<BufferId> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .find(|r| r.name == name)
            .and_then(|r| r.buffer)
    }
}

/// Everything a pass may touch while the graph runs.
pub struct FrameContext<'a> {
    pub device: &'a dyn GpuDevice,
    pub resources: &'a mut RendererResourceCache,
    pub workers: &'a WorkerPool,
    pub frame_index: u64,
    pub swapchain_extent: UVec2,
    pub io: PassIo,
}

/// Behaviour attached to a render graph node. Only `render` is required.
pub trait RenderGraphPass: Send {
    fn pre_render(&mut self, _ctx: &mut FrameContext<'_>, _cmd: &mut CommandBuffer) {}

    fn render(&mut self, ctx: &mut FrameContext<'_>, cmd: &mut CommandBuffer);

    fn post_render(&mut self, _ctx: &mut FrameContext<'_>, _cmd: &mut CommandBuffer) {}

    fn on_resize(&mut self, _ctx: &mut FrameContext<'_>, _width: u32, _height: u32) {}

    fn on_techniques_reloaded(&mut self, _ctx: &mut FrameContext<'_>) {}
}
