//! Passes the demo graph registers by node name.

use crate::{
    gpu::{CommandBuffer, PipelineId},
    job_system::worker_pool::RecordJob,
    render_graph::{FrameContext, RenderGraphPass},
    renderer::TextureHandle,
};

/// Pipeline of `technique` that targets the node being rendered.
fn technique_pipeline(ctx: &FrameContext<'_>, technique: &str) -> Option<PipelineId> {
    let handle = ctx.resources.technique_by_name(technique)?;
    let Some(pass) = ctx.resources.technique(handle)?.pass_for_node(&ctx.io.node) else {
        log::warn!("Technique '{technique}' has no pipeline for node '{}'", ctx.io.node);
        return None;
    };
    Some(pass.pipeline)
}

/// Relies on the node's clear load ops; records nothing itself.
#[derive(Debug, Default)]
pub struct ClearPass;

impl RenderGraphPass for ClearPass {
    fn render(&mut self, _ctx: &mut FrameContext<'_>, _cmd: &mut CommandBuffer) {}
}

/// Draws one fullscreen triangle with a technique pipeline once every
/// texture it samples is ready.
#[derive(Debug)]
pub struct FullscreenPass {
    technique: String,
    textures: Vec<TextureHandle>,
    pipeline: Option<PipelineId>,
}

impl FullscreenPass {
    pub fn new(technique: &str) -> Self {
        Self {
            technique: technique.to_string(),
            textures: Vec::new(),
            pipeline: None,
        }
    }

    pub fn with_textures(mut self, textures: Vec<TextureHandle>) -> Self {
        self.textures = textures;
        self
    }
}

impl RenderGraphPass for FullscreenPass {
    fn pre_render(&mut self, ctx: &mut FrameContext<'_>, _cmd: &mut CommandBuffer) {
        if self.pipeline.is_none() {
            self.pipeline = technique_pipeline(ctx, &self.technique);
        }
    }

    fn render(&mut self, ctx: &mut FrameContext<'_>, cmd: &mut CommandBuffer) {
        let Some(pipeline) = self.pipeline else { return };
        let ready = self
            .textures
            .iter()
            .all(|t| ctx.resources.texture(*t).is_some_and(|t| t.ready.is_ready()));
        if !ready {
            return;
        }
        cmd.bind_pipeline(pipeline);
        cmd.draw(3, 1);
    }

    fn on_techniques_reloaded(&mut self, ctx: &mut FrameContext<'_>) {
        self.pipeline = technique_pipeline(ctx, &self.technique);
    }
}

/// Splits its draws into batches recorded as secondary command buffers on
/// the worker pool, then replays them in batch order.
#[derive(Debug)]
pub struct ParallelDrawPass {
    technique: String,
    batches: u32,
    draws_per_batch: u32,
    pipeline: Option<PipelineId>,
}

impl ParallelDrawPass {
    pub fn new(technique: &str, batches: u32, draws_per_batch: u32) -> Self {
        Self {
            technique: technique.to_string(),
            batches,
            draws_per_batch,
            pipeline: None,
        }
    }
}

impl RenderGraphPass for ParallelDrawPass {
    fn pre_render(&mut self, ctx: &mut FrameContext<'_>, _cmd: &mut CommandBuffer) {
        if self.pipeline.is_none() {
            self.pipeline = technique_pipeline(ctx, &self.technique);
        }
    }

    fn render(&mut self, ctx: &mut FrameContext<'_>, cmd: &mut CommandBuffer) {
        let Some(pipeline) = self.pipeline else { return };
        let draws = self.draws_per_batch;
        let jobs: Vec<RecordJob> = (0..self.batches)
            .map(|batch| {
                Box::new(move |secondary: &mut CommandBuffer| {
                    secondary.bind_pipeline(pipeline);
                    for draw in 0..draws {
                        secondary.draw(3, batch * draws + draw + 1);
                    }
                }) as RecordJob
            })
            .collect();
        match ctx.workers.record_secondary(&ctx.io.node, jobs) {
            Ok(buffers) => {
                for buffer in buffers {
                    cmd.execute_secondary(buffer);
                }
            }
            Err(e) => log::error!("Node '{}' lost its draws: {e}", ctx.io.node),
        }
    }

    fn on_techniques_reloaded(&mut self, ctx: &mut FrameContext<'_>) {
        self.pipeline = technique_pipeline(ctx, &self.technique);
    }
}

/// Dispatches a compute pipeline over the swapchain extent in 8x8 groups.
#[derive(Debug)]
pub struct DispatchPass {
    technique: String,
    pipeline: Option<PipelineId>,
    groups: Option<[u32; 3]>,
}

fn groups_for(width: u32, height: u32) -> [u32; 3] {
    [width.div_ceil(8).max(1), height.div_ceil(8).max(1), 1]
}

impl DispatchPass {
    pub fn new(technique: &str) -> Self {
        Self {
            technique: technique.to_string(),
            pipeline: None,
            groups: None,
        }
    }
}

impl RenderGraphPass for DispatchPass {
    fn pre_render(&mut self, ctx: &mut FrameContext<'_>, _cmd: &mut CommandBuffer) {
        if self.pipeline.is_none() {
            self.pipeline = technique_pipeline(ctx, &self.technique);
        }
        if self.groups.is_none() {
            self.groups = Some(groups_for(ctx.swapchain_extent.x, ctx.swapchain_extent.y));
        }
    }

    fn render(&mut self, _ctx: &mut FrameContext<'_>, cmd: &mut CommandBuffer) {
        let Some(pipeline) = self.pipeline else { return };
        let [x, y, z] = self.groups.unwrap_or([1, 1, 1]);
        cmd.bind_pipeline(pipeline);
        cmd.dispatch(x, y, z);
    }

    fn on_resize(&mut self, _ctx: &mut FrameContext<'_>, width: u32, height: u32) {
        self.groups = Some(groups_for(width, height));
    }

    fn on_techniques_reloaded(&mut self, ctx: &mut FrameContext<'_>) {
        self.pipeline = technique_pipeline(ctx, &self.technique);
    }
}
