use std::{path::Path, sync::Arc};

use anyhow::Context;
use clap::Parser;
use render_core::{
    config::{parse_size, Backend, CliArgs, EngineConfig},
    gpu::{headless::HeadlessDevice, wgpu_device::WgpuDevice, GpuDevice, TextureCreation},
    passes::{ClearPass, DispatchPass, FullscreenPass, ParallelDrawPass},
    render_graph::{RenderGraph, RenderGraphPass},
    renderer::TextureHandle,
    EngineContext,
};

/// Demo passes keyed by the node names of `resources/render_graph.json`.
fn demo_pass(node: &str, textures: &[TextureHandle]) -> Option<Box<dyn RenderGraphPass>> {
    Some(match node {
        "gbuffer" => Box::new(ParallelDrawPass::new("geometry", 4, 16)),
        "histogram" => Box::new(DispatchPass::new("histogram")),
        "lighting" => Box::new(FullscreenPass::new("lighting").with_textures(textures.to_vec())),
        "bloom" => Box::new(FullscreenPass::new("bloom")),
        "postprocess" => Box::new(FullscreenPass::new("postprocess")),
        "debug_overlay" => Box::new(ClearPass),
        _ => return None,
    })
}

fn register_passes(graph: &mut RenderGraph, textures: &[TextureHandle]) -> anyhow::Result<()> {
    let nodes: Vec<String> = graph.execution_order().iter().map(|s| s.to_string()).collect();
    for node in nodes {
        match demo_pass(&node, textures) {
            Some(pass) => graph.register_render_pass(&node, pass)?,
            None => log::warn!("No pass for node '{node}'"),
        }
    }
    Ok(())
}

fn request_texture(engine: &mut EngineContext, path: &Path) -> anyhow::Result<TextureHandle> {
    let (width, height) =
        image::image_dimensions(path).with_context(|| format!("reading size of {}", path.display()))?;
    let name = path.display().to_string();
    let creation = TextureCreation::new_2d(&name, glam::UVec2::new(width, height), wgpu::TextureFormat::Rgba8UnormSrgb);
    Ok(engine.request_texture(path, &creation)?)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CliArgs::parse();
    log::trace!("Starting with args: {:?}", args);

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.apply_args(&args);
    let resize_to = args.resize_to.as_deref().map(parse_size).transpose()?;

    let device: Arc<dyn GpuDevice> = match args.backend {
        Backend::Headless => Arc::new(HeadlessDevice::new(config.swapchain_extent())),
        Backend::Wgpu => Arc::new(WgpuDevice::new_offscreen(config.swapchain_extent())?),
    };
    let mut engine = EngineContext::new(config, device)?;

    let mut graph = engine
        .load_render_graph()
        .with_context(|| format!("loading {}", engine.config.render_graph.display()))?;
    let report = graph.compile(engine.device.as_ref())?;
    log::info!(
        "Compiled '{}': {} textures ({} aliased), {} buffers",
        graph.name(),
        report.allocated_textures,
        report.aliased_textures,
        report.allocated_buffers
    );
    for (node, reason) in &report.disabled_nodes {
        log::warn!("Node '{node}' disabled: {reason}");
    }

    let mut textures = Vec::new();
    for path in &args.textures {
        match request_texture(&mut engine, path) {
            Ok(handle) => textures.push(handle),
            Err(e) => log::error!("{e:#}"),
        }
    }
    register_passes(&mut graph, &textures)?;
    for technique in engine.load_techniques(&graph)? {
        for node in &technique.fallbacks {
            log::warn!("Technique '{}' renders to the swapchain instead of '{node}'", technique.creation.name);
        }
    }

    for frame in 0..args.frames {
        engine.run_frame(&mut graph)?;
        if frame == 0 {
            if let Some(size) = resize_to {
                engine.resize(&mut graph, size.x, size.y)?;
            }
        }
    }

    log::info!("Execution order: {:?}", graph.execution_order());
    log::info!(
        "Rendered {} frames, {} loader requests pending",
        engine.frame_index(),
        engine.loader.pending_requests()
    );
    for failure in engine.loader.take_failures() {
        log::warn!("Load of {} failed: {}", failure.source, failure.reason);
    }

    for texture in textures {
        engine.resources.destroy_texture(texture)?;
    }
    let teardown = engine.shutdown(&mut graph);
    if !teardown.leaked.is_empty() {
        log::warn!("{} resources leaked", teardown.leaked.len());
    }
    Ok(())
}
