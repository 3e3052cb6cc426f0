#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use glam::UVec2;
use render_core::{
    config::PoolConfig,
    gpu::{headless::HeadlessDevice, CommandBuffer},
    job_system::WorkerPool,
    render_graph::{FrameContext, PassIo, RenderGraph, RenderGraphDescription, RenderGraphPass},
    renderer::RendererResourceCache,
};

pub fn device(width: u32, height: u32) -> Arc<HeadlessDevice> {
    Arc::new(HeadlessDevice::new(UVec2::new(width, height)))
}

pub fn graph(json: &str) -> RenderGraph {
    let desc = RenderGraphDescription::from_json(json).unwrap();
    RenderGraph::from_description(&desc, "swapchain", &PoolConfig::default()).unwrap()
}

/// Cache and inline worker pool for building a `FrameContext`.
pub struct Frame {
    pub device: Arc<HeadlessDevice>,
    pub resources: RendererResourceCache,
    pub workers: WorkerPool,
}

impl Frame {
    pub fn new(device: &Arc<HeadlessDevice>) -> Self {
        Self {
            device: device.clone(),
            resources: RendererResourceCache::new(device.clone(), &PoolConfig::default()),
            workers: WorkerPool::init(0).unwrap(),
        }
    }

    pub fn context(&mut self) -> FrameContext<'_> {
        FrameContext {
            device: self.device.as_ref(),
            resources: &mut self.resources,
            workers: &self.workers,
            frame_index: 0,
            swapchain_extent: render_core::gpu::GpuDevice::swapchain_extent(self.device.as_ref()),
            io: PassIo::default(),
        }
    }
}

pub type Events = Arc<Mutex<Vec<String>>>;

/// Logs every callback as "<node>:<callback>".
pub struct RecordingPass {
    pub events: Events,
}

impl RecordingPass {
    pub fn boxed(events: &Events) -> Box<dyn RenderGraphPass> {
        Box::new(Self { events: events.clone() })
    }

    fn log(&self, ctx: &FrameContext<'_>, what: &str) {
        self.events.lock().unwrap().push(format!("{}:{what}", ctx.io.node));
    }
}

impl RenderGraphPass for RecordingPass {
    fn pre_render(&mut self, ctx: &mut FrameContext<'_>, _cmd: &mut CommandBuffer) {
        self.log(ctx, "pre");
    }

    fn render(&mut self, ctx: &mut FrameContext<'_>, _cmd: &mut CommandBuffer) {
        self.log(ctx, "render");
    }

    fn post_render(&mut self, ctx: &mut FrameContext<'_>, _cmd: &mut CommandBuffer) {
        self.log(ctx, "post");
    }

    fn on_resize(&mut self, ctx: &mut FrameContext<'_>, width: u32, height: u32) {
        self.log(ctx, &format!("resize {width}x{height}"));
    }

    fn on_techniques_reloaded(&mut self, ctx: &mut FrameContext<'_>) {
        self.log(ctx, "reload");
    }
}

/// Writes a `width`x`height` RGBA PNG whose texels encode their position.
pub fn write_png(dir: &Path, name: &str, width: u32, height: u32, seed: u8) -> (PathBuf, Vec<u8>) {
    let image = image::RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba([x as u8, y as u8, seed, 255])
    });
    let path = dir.join(name);
    image.save(&path).unwrap();
    (path, image.into_raw())
}
