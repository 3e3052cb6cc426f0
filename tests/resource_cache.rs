mod common;

use std::collections::HashSet;

use common::device;
use glam::UVec2;
use render_core::{
    config::PoolConfig,
    core::ResourcePool,
    gpu::{
        CullMode, DepthState, PipelineCreation, PrimitiveTopology, RenderPassOutput, SamplerCreation,
        ShaderStage, ShaderStageCreation, TextureCreation,
    },
    renderer::{
        resource_cache::{MaterialCreation, TechniqueCreation, TechniquePassCreation},
        RendererResourceCache, ResourceKind,
    },
};

fn fullscreen_pipeline(name: &str) -> PipelineCreation {
    PipelineCreation {
        name: name.to_string(),
        stages: vec![ShaderStageCreation {
            stage: ShaderStage::Vertex,
            name: "fullscreen.wgsl".into(),
            source: "@vertex fn vs_main() -> @builtin(position) vec4<f32> { return vec4<f32>(0.0); }".into(),
        }],
        depth: DepthState {
            write: false,
            test: None,
        },
        blend: Vec::new(),
        cull: CullMode::None,
        topology: PrimitiveTopology::TriangleList,
        render_pass: RenderPassOutput::swapchain(wgpu::TextureFormat::Bgra8Unorm),
    }
}

#[test]
fn live_handles_are_unique_and_released_slots_come_back_lifo() {
    let mut pool: ResourcePool<u32> = ResourcePool::new("ids", 8);
    let handles: Vec<_> = (0..8).map(|i| pool.obtain(i).unwrap()).collect();
    let unique: HashSet<_> = handles.iter().copied().collect();
    assert_eq!(unique.len(), 8);
    assert!(pool.obtain(8).is_err());

    pool.release(handles[2]);
    pool.release(handles[5]);
    let first = pool.obtain(50).unwrap();
    let second = pool.obtain(20).unwrap();
    assert_eq!(first.slot(), handles[5].slot());
    assert_eq!(second.slot(), handles[2].slot());
    assert_ne!(first, handles[5], "reused slot gets a new generation");
    assert!(pool.access(handles[5]).is_none());
    assert_eq!(pool.access(first), Some(&50));
}

#[test]
fn teardown_frees_everything_and_reports_leaks() {
    let device = device(64, 64);
    let mut cache = RendererResourceCache::new(device.clone(), &PoolConfig::default());

    let texture = cache
        .create_texture(&TextureCreation::new_2d("albedo", UVec2::new(4, 4), wgpu::TextureFormat::Rgba8Unorm))
        .unwrap();
    let technique = cache
        .create_technique(&TechniqueCreation {
            name: "lighting".into(),
            source: None,
            passes: vec![TechniquePassCreation {
                name: "resolve".into(),
                render_pass: "lighting".into(),
                pipeline: fullscreen_pipeline("lighting/resolve"),
            }],
        })
        .unwrap();
    cache
        .create_material(&MaterialCreation {
            name: "floor".into(),
            technique,
            textures: vec![texture],
            render_index: 0,
        })
        .unwrap();
    let sampler = cache
        .create_sampler(&SamplerCreation {
            name: "linear".into(),
            ..SamplerCreation::default()
        })
        .unwrap();
    assert_eq!(cache.destroy_sampler(sampler).unwrap(), 0);

    assert_eq!(device.live_textures(), 1);
    assert_eq!(device.live_pipelines(), 1);
    assert_eq!(device.live_samplers(), 0);

    let report = cache.teardown();
    assert_eq!(report.destroyed, 3);
    assert_eq!(
        report.leaked,
        vec![
            (ResourceKind::Material, "floor".to_string()),
            (ResourceKind::Technique, "lighting".to_string()),
            (ResourceKind::Texture, "albedo".to_string()),
        ]
    );
    assert_eq!(device.live_textures(), 0);
    assert_eq!(device.live_pipelines(), 0);
    for kind in [ResourceKind::Texture, ResourceKind::Technique, ResourceKind::Material] {
        assert_eq!(cache.len(kind), 0);
    }
    assert!(cache.texture_by_name("albedo").is_none());
}

#[test]
fn replacing_a_technique_keeps_its_handle() {
    let device = device(64, 64);
    let mut cache = RendererResourceCache::new(device.clone(), &PoolConfig::default());
    let creation = TechniqueCreation {
        name: "bloom".into(),
        source: None,
        passes: vec![TechniquePassCreation {
            name: "downsample".into(),
            render_pass: "bloom".into(),
            pipeline: fullscreen_pipeline("bloom/downsample"),
        }],
    };
    let handle = cache.create_technique(&creation).unwrap();
    let before = cache.technique(handle).unwrap().passes[0].pipeline;

    let mut updated = creation.clone();
    updated.passes.push(TechniquePassCreation {
        name: "upsample".into(),
        render_pass: "bloom".into(),
        pipeline: fullscreen_pipeline("bloom/upsample"),
    });
    cache.replace_technique(handle, &updated).unwrap();

    let technique = cache.technique(handle).unwrap();
    assert_eq!(technique.passes.len(), 2);
    assert_ne!(technique.passes[0].pipeline, before);
    assert!(technique.pass("upsample").is_some());
    assert_eq!(technique.pass_for_node("bloom").unwrap().name, "downsample");
    assert_eq!(device.live_pipelines(), 2, "old pipelines are destroyed");
    assert_eq!(cache.technique_by_name("bloom"), Some(handle));
}
