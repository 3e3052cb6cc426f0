mod common;

use std::{path::Path, sync::Arc};

use common::{device, write_png};
use glam::UVec2;
use render_core::{
    config::{ConfigError, EngineConfig, LoaderMode},
    gpu::{headless::HeadlessDevice, Command, GpuDevice, QueueType, TextureCreation},
    passes::{ClearPass, DispatchPass, FullscreenPass, ParallelDrawPass},
    render_graph::RenderGraph,
    loader::OverflowPolicy,
    EngineContext, EngineError,
};

fn bundled_config() -> EngineConfig {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("resources");
    let mut config = EngineConfig {
        render_graph: root.join("render_graph.json"),
        techniques_dir: root.join("techniques"),
        shaders_dir: root.join("shaders"),
        workers: 2,
        ..EngineConfig::default()
    };
    config.loader.mode = LoaderMode::PerFrame;
    config.loader.staging_size = 1024 * 1024;
    config
}

fn register(graph: &mut RenderGraph) {
    graph
        .register_render_pass("gbuffer", Box::new(ParallelDrawPass::new("geometry", 2, 3)))
        .unwrap();
    graph.register_render_pass("histogram", Box::new(DispatchPass::new("histogram"))).unwrap();
    for node in ["lighting", "bloom", "postprocess"] {
        graph.register_render_pass(node, Box::new(FullscreenPass::new(node))).unwrap();
    }
    graph.register_render_pass("debug_overlay", Box::new(ClearPass)).unwrap();
}

fn frame_commands(device: &HeadlessDevice, label: &str) -> Vec<Command> {
    device
        .submissions()
        .into_iter()
        .find(|s| s.queue == QueueType::Graphics && s.label == label)
        .map(|s| s.commands)
        .unwrap_or_else(|| panic!("no submission labelled '{label}'"))
}

#[test]
fn bundled_graph_renders_and_shuts_down_without_leaks() {
    let device = device(800, 600);
    let mut engine = EngineContext::new(bundled_config(), device.clone() as Arc<dyn GpuDevice>).unwrap();
    let mut graph = engine.load_render_graph().unwrap();
    graph.compile(engine.device.as_ref()).unwrap();
    register(&mut graph);
    assert_eq!(engine.load_techniques(&graph).unwrap().len(), 5);

    engine.run_frame(&mut graph).unwrap();
    assert_eq!(engine.frame_index(), 1);

    let commands = frame_commands(&device, "frame 0");
    let count = |matches: fn(&Command) -> bool| commands.iter().filter(|c| matches(c)).count();
    assert_eq!(count(|c| matches!(c, Command::BeginRenderPass { .. })), 4);
    assert_eq!(count(|c| matches!(c, Command::ExecuteSecondary(_))), 2);
    assert_eq!(count(|c| matches!(c, Command::Draw { .. })), 3, "one fullscreen draw per post node");
    assert!(commands.contains(&Command::Dispatch { groups: [100, 75, 1] }));
    assert!(
        !commands.contains(&Command::PushMarker("debug_overlay".into())),
        "disabled nodes are not recorded"
    );

    let report = engine.shutdown(&mut graph);
    assert!(report.leaked.is_empty(), "{:?}", report.leaked);
    assert_eq!(device.live_pipelines(), 0);
}

#[test]
fn resize_reaches_passes_and_streamed_textures_become_ready() {
    let dir = tempfile::tempdir().unwrap();
    let (path, texels) = write_png(dir.path(), "albedo.png", 4, 4, 9);
    let device = device(800, 600);
    let mut engine = EngineContext::new(bundled_config(), device.clone() as Arc<dyn GpuDevice>).unwrap();
    let mut graph = engine.load_render_graph().unwrap();
    graph.compile(engine.device.as_ref()).unwrap();
    register(&mut graph);
    engine.load_techniques(&graph).unwrap();

    let texture = engine
        .request_texture(
            &path,
            &TextureCreation::new_2d("albedo", UVec2::new(4, 4), wgpu::TextureFormat::Rgba8Unorm),
        )
        .unwrap();

    engine.run_frame(&mut graph).unwrap();
    engine.resize(&mut graph, 1600, 1200).unwrap();
    engine.resize(&mut graph, 0, 1200).unwrap();
    assert_eq!(device.swapchain_extent(), UVec2::new(1600, 1200));

    for _ in 0..16 {
        if engine.resources.texture(texture).is_some_and(|t| t.ready.is_ready()) {
            break;
        }
        engine.run_frame(&mut graph).unwrap();
    }
    let entry = engine.resources.texture(texture).unwrap();
    assert!(entry.ready.is_ready());
    assert_eq!(device.texture_contents(entry.texture, 0, 0).unwrap(), texels);

    engine.run_frame(&mut graph).unwrap();
    let label = format!("frame {}", engine.frame_index() - 1);
    let commands = frame_commands(&device, &label);
    assert!(commands.contains(&Command::Dispatch { groups: [200, 150, 1] }));

    engine.resources.destroy_texture(texture).unwrap();
    let report = engine.shutdown(&mut graph);
    assert!(report.leaked.is_empty(), "{:?}", report.leaked);
}

#[test]
fn per_frame_loading_rejects_blocking_overflow() {
    let mut config = bundled_config();
    config.loader.overflow_policy = OverflowPolicy::Block;
    let result = EngineContext::new(config, device(64, 64) as Arc<dyn GpuDevice>);
    assert!(matches!(result, Err(EngineError::Config(ConfigError::Invalid(_)))));

    let mut config = bundled_config();
    config.loader.overflow_policy = OverflowPolicy::Block;
    config.loader.mode = LoaderMode::Thread;
    let engine = EngineContext::new(config, device(64, 64) as Arc<dyn GpuDevice>).unwrap();
    drop(engine);
}

#[test]
fn passes_skip_techniques_without_a_pipeline_for_their_node() {
    let device = device(800, 600);
    let mut engine = EngineContext::new(bundled_config(), device.clone() as Arc<dyn GpuDevice>).unwrap();
    let mut graph = engine.load_render_graph().unwrap();
    graph.compile(engine.device.as_ref()).unwrap();
    graph
        .register_render_pass("gbuffer", Box::new(ParallelDrawPass::new("geometry", 2, 3)))
        .unwrap();
    graph.register_render_pass("histogram", Box::new(DispatchPass::new("histogram"))).unwrap();
    graph.register_render_pass("lighting", Box::new(FullscreenPass::new("lighting"))).unwrap();
    // The lighting technique only targets the lighting node.
    graph.register_render_pass("bloom", Box::new(FullscreenPass::new("lighting"))).unwrap();
    graph.register_render_pass("postprocess", Box::new(FullscreenPass::new("postprocess"))).unwrap();
    engine.load_techniques(&graph).unwrap();

    engine.run_frame(&mut graph).unwrap();
    let commands = frame_commands(&device, "frame 0");
    let draws = commands.iter().filter(|c| matches!(c, Command::Draw { .. })).count();
    assert_eq!(draws, 2);

    let report = engine.shutdown(&mut graph);
    assert!(report.leaked.is_empty(), "{:?}", report.leaked);
}

#[test]
fn streamed_textures_get_their_mip_chain_built() {
    let dir = tempfile::tempdir().unwrap();
    let (path, texels) = write_png(dir.path(), "albedo.png", 4, 4, 200);
    let device = device(800, 600);
    let mut engine = EngineContext::new(bundled_config(), device.clone() as Arc<dyn GpuDevice>).unwrap();
    let mut graph = engine.load_render_graph().unwrap();
    graph.compile(engine.device.as_ref()).unwrap();
    register(&mut graph);
    engine.load_techniques(&graph).unwrap();

    let mut creation = TextureCreation::new_2d("albedo", UVec2::new(4, 4), wgpu::TextureFormat::Rgba8Unorm);
    creation.mip_levels = 3;
    let texture = engine.request_texture(&path, &creation).unwrap();
    for _ in 0..16 {
        if engine.resources.texture(texture).is_some_and(|t| t.ready.is_ready()) {
            break;
        }
        engine.run_frame(&mut graph).unwrap();
    }
    let entry = engine.resources.texture(texture).unwrap();
    assert!(entry.ready.is_ready());
    let id = entry.texture;
    assert_eq!(device.texture_contents(id, 0, 0).unwrap(), texels);

    // Texel (x, y) stores [x, y, seed, 255]; each mip averages 2x2 blocks.
    assert_eq!(
        device.texture_contents(id, 1, 0).unwrap(),
        vec![1, 1, 200, 255, 3, 1, 200, 255, 1, 3, 200, 255, 3, 3, 200, 255]
    );
    assert_eq!(device.texture_contents(id, 2, 0).unwrap(), vec![2, 2, 200, 255]);

    engine.resources.destroy_texture(texture).unwrap();
    let report = engine.shutdown(&mut graph);
    assert!(report.leaked.is_empty(), "{:?}", report.leaked);
}
