mod common;

use std::sync::{Arc, Mutex};

use common::{device, graph, Frame, RecordingPass};
use glam::UVec2;
use render_core::{
    gpu::{Command, CommandBuffer, GpuDevice, LoadOp, ResourceState},
    render_graph::GraphError,
};

#[test]
fn consumer_runs_after_producer() {
    let device = device(800, 600);
    let mut graph = graph(
        r#"{ "passes": [
            { "name": "A", "outputs": [ { "type": "attachment", "name": "color", "format": "R8G8B8A8_UNORM" } ] },
            { "name": "B", "inputs": [ { "type": "texture", "name": "color" } ],
              "outputs": [ { "type": "attachment", "name": "swapchain", "external": true } ] }
        ] }"#,
    );
    let report = graph.compile(device.as_ref()).unwrap();
    assert_eq!(report.order, vec!["A", "B"]);
    assert!(report.disabled_nodes.is_empty());
    assert_eq!(report.allocated_textures, 1);
    assert!(graph.texture("color").is_some());
}

#[test]
fn declaration_order_does_not_override_dependencies() {
    let device = device(800, 600);
    let mut graph = graph(
        r#"{ "passes": [
            { "name": "B", "inputs": [ { "type": "texture", "name": "color" } ] },
            { "name": "A", "outputs": [ { "type": "attachment", "name": "color", "format": "R8G8B8A8_UNORM" } ] },
            { "name": "C" }
        ] }"#,
    );
    let report = graph.compile(device.as_ref()).unwrap();
    // Independent nodes keep their declaration order.
    assert_eq!(report.order, vec!["A", "B", "C"]);
}

#[test]
fn cycles_fail_compilation() {
    let device = device(800, 600);
    let mut graph = graph(
        r#"{ "passes": [
            { "name": "A", "inputs": [ { "type": "texture", "name": "y" } ],
              "outputs": [ { "type": "attachment", "name": "x", "format": "R8G8B8A8_UNORM" } ] },
            { "name": "B", "inputs": [ { "type": "texture", "name": "x" } ],
              "outputs": [ { "type": "attachment", "name": "y", "format": "R8G8B8A8_UNORM" } ] }
        ] }"#,
    );
    match graph.compile(device.as_ref()) {
        Err(GraphError::Cycle(nodes)) => assert_eq!(nodes, vec!["A", "B"]),
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(!graph.is_compiled());
}

#[test]
fn unresolved_inputs_disable_the_node_and_its_readers() {
    let device = device(800, 600);
    let mut graph = graph(
        r#"{ "passes": [
            { "name": "A", "outputs": [ { "type": "attachment", "name": "color", "format": "R8G8B8A8_UNORM" } ] },
            { "name": "B", "inputs": [ { "type": "texture", "name": "missing" } ],
              "outputs": [ { "type": "attachment", "name": "lit", "format": "R8G8B8A8_UNORM" } ] },
            { "name": "C", "inputs": [ { "type": "texture", "name": "lit" } ] }
        ] }"#,
    );
    let report = graph.compile(device.as_ref()).unwrap();
    let disabled: Vec<&str> = report.disabled_nodes.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(disabled, vec!["B", "C"]);
    assert!(graph.access_node_by_name("A").unwrap().enabled);
    assert!(!graph.access_node_by_name("B").unwrap().enabled);
    assert!(graph.texture("lit").is_none(), "disabled nodes allocate nothing");
}

#[test]
fn a_second_producer_of_a_name_is_disabled() {
    let device = device(800, 600);
    let mut graph = graph(
        r#"{ "passes": [
            { "name": "A", "outputs": [ { "type": "attachment", "name": "color", "format": "R8G8B8A8_UNORM" } ] },
            { "name": "B", "outputs": [ { "type": "attachment", "name": "color", "format": "R8G8B8A8_UNORM" } ] }
        ] }"#,
    );
    let report = graph.compile(device.as_ref()).unwrap();
    assert_eq!(report.disabled_nodes.len(), 1);
    assert_eq!(report.disabled_nodes[0].0, "B");
}

#[test]
fn textures_alias_once_their_last_reader_ran() {
    let device = device(800, 600);
    let mut graph = graph(
        r#"{ "passes": [
            { "name": "A", "outputs": [ { "type": "attachment", "name": "t1", "format": "R8G8B8A8_UNORM" } ] },
            { "name": "B", "inputs": [ { "type": "texture", "name": "t1" } ],
              "outputs": [ { "type": "attachment", "name": "t2", "format": "R8G8B8A8_UNORM" } ] },
            { "name": "C", "inputs": [ { "type": "texture", "name": "t2" } ],
              "outputs": [
                { "type": "attachment", "name": "t3", "format": "R8G8B8A8_UNORM" },
                { "type": "attachment", "name": "t4", "format": "R16G16B16A16_SFLOAT" }
              ] },
            { "name": "D", "inputs": [ { "type": "texture", "name": "t3" }, { "type": "texture", "name": "t4" } ] }
        ] }"#,
    );
    let report = graph.compile(device.as_ref()).unwrap();
    assert_eq!(report.allocated_textures, 3);
    assert_eq!(report.aliased_textures, 1);
    assert_eq!(graph.texture("t3"), graph.texture("t1"));
    assert_ne!(graph.texture("t3"), graph.texture("t2"));
    assert_ne!(graph.texture("t4"), graph.texture("t1"), "formats differ");
    assert_eq!(device.live_textures(), 3);
}

#[test]
fn reference_writers_run_before_readers() {
    let device = device(800, 600);
    let mut graph = graph(
        r#"{ "passes": [
            { "name": "A", "outputs": [ { "type": "attachment", "name": "color", "format": "R8G8B8A8_UNORM" } ] },
            { "name": "C", "inputs": [ { "type": "texture", "name": "color" } ] },
            { "name": "B", "outputs": [ { "type": "reference", "name": "color" } ] }
        ] }"#,
    );
    let report = graph.compile(device.as_ref()).unwrap();
    assert_eq!(report.order, vec!["A", "B", "C"]);

    let framebuffer = graph.access_node_by_name("B").unwrap().framebuffer.clone().unwrap();
    assert_eq!(framebuffer.colors.len(), 1);
    assert_eq!(framebuffer.colors[0].load, LoadOp::Load);
    let output = graph.render_pass_output("B").unwrap();
    assert_eq!(output.color, vec![(wgpu::TextureFormat::Rgba8Unorm, LoadOp::Load)]);
}

#[test]
fn references_to_unproduced_names_disable_the_writer() {
    let device = device(800, 600);
    let mut graph = graph(r#"{ "passes": [ { "name": "A", "outputs": [ { "type": "reference", "name": "nothing" } ] } ] }"#);
    let report = graph.compile(device.as_ref()).unwrap();
    assert_eq!(report.disabled_nodes.len(), 1);
}

#[test]
fn reference_writers_of_a_disabled_producer_are_disabled() {
    let device = device(800, 600);
    let mut graph = graph(
        r#"{ "passes": [
            { "name": "A", "enabled": false, "outputs": [
                { "type": "attachment", "name": "color", "format": "R8G8B8A8_UNORM" }
            ] },
            { "name": "W", "type": "compute", "outputs": [ { "type": "reference", "name": "color" } ] },
            { "name": "G", "outputs": [ { "type": "reference", "name": "color" } ] }
        ] }"#,
    );
    let report = graph.compile(device.as_ref()).unwrap();
    assert_eq!(report.order, vec!["A", "W", "G"]);
    let disabled: Vec<&str> = report.disabled_nodes.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(disabled, vec!["W", "G"]);
    assert!(!graph.access_node_by_name("W").unwrap().enabled);
    assert!(!graph.access_node_by_name("G").unwrap().enabled);
}

#[test]
fn resize_recreates_only_resizable_textures() {
    let device = device(800, 600);
    let mut graph = graph(
        r#"{ "passes": [
            { "name": "A", "outputs": [
                { "type": "attachment", "name": "full", "format": "R8G8B8A8_UNORM", "scale": [1, 1] }
            ] },
            { "name": "H", "outputs": [
                { "type": "attachment", "name": "half", "format": "R8G8B8A8_UNORM", "scale": [0.5, 0.5] }
            ] },
            { "name": "B", "outputs": [
                { "type": "attachment", "name": "fixed", "format": "R8G8B8A8_UNORM", "size": [256, 256] }
            ] },
            { "name": "C", "inputs": [
                { "type": "texture", "name": "full" },
                { "type": "texture", "name": "half" },
                { "type": "texture", "name": "fixed" }
            ] }
        ] }"#,
    );
    graph.compile(device.as_ref()).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    graph.register_render_pass("A", RecordingPass::boxed(&events)).unwrap();

    let full = graph.texture("full").unwrap();
    let fixed = graph.texture("fixed").unwrap();
    assert_eq!(device.texture_extent(full), Some(UVec2::new(800, 600)));
    assert_eq!(device.texture_extent(graph.texture("half").unwrap()), Some(UVec2::new(400, 300)));

    device.resize_swapchain(UVec2::new(1920, 1080)).unwrap();
    let mut frame = Frame::new(&device);
    let mut ctx = frame.context();
    graph.on_resize(&mut ctx, 1920, 1080).unwrap();

    let resized = graph.texture("full").unwrap();
    assert_ne!(resized, full);
    assert_eq!(device.texture_extent(resized), Some(UVec2::new(1920, 1080)));
    assert_eq!(device.texture_extent(full), None, "old texture is destroyed");
    assert_eq!(device.texture_extent(graph.texture("half").unwrap()), Some(UVec2::new(960, 540)));
    assert_eq!(graph.texture("fixed"), Some(fixed));
    assert_eq!(device.texture_extent(fixed), Some(UVec2::new(256, 256)));

    let framebuffer = graph.access_node_by_name("A").unwrap().framebuffer.clone().unwrap();
    assert_eq!(framebuffer.extent, UVec2::new(1920, 1080));
    assert_eq!(*events.lock().unwrap(), vec!["A:resize 1920x1080".to_string()]);
    assert_eq!(device.live_textures(), 3);
}

#[test]
fn zero_sized_resize_is_ignored() {
    let device = device(800, 600);
    let mut graph = graph(
        r#"{ "passes": [ { "name": "A", "outputs": [ { "type": "attachment", "name": "full", "format": "R8G8B8A8_UNORM" } ] } ] }"#,
    );
    graph.compile(device.as_ref()).unwrap();
    let full = graph.texture("full");
    let mut frame = Frame::new(&device);
    let mut ctx = frame.context();
    graph.on_resize(&mut ctx, 0, 600).unwrap();
    assert_eq!(graph.texture("full"), full);
}

#[test]
fn render_runs_callbacks_in_order_with_markers_and_barriers() {
    let device = device(800, 600);
    let mut graph = graph(
        r#"{ "passes": [
            { "name": "A", "outputs": [ { "type": "attachment", "name": "color", "format": "R8G8B8A8_UNORM" } ] },
            { "name": "B", "type": "compute", "inputs": [ { "type": "texture", "name": "color" } ],
              "outputs": [ { "type": "buffer", "name": "histogram", "size": 1024 } ] },
            { "name": "off", "enabled": false }
        ] }"#,
    );
    graph.compile(device.as_ref()).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    for node in ["A", "B", "off"] {
        graph.register_render_pass(node, RecordingPass::boxed(&events)).unwrap();
    }
    let color = graph.texture("color").unwrap();
    assert!(graph.buffer("histogram").is_some());

    let mut frame = Frame::new(&device);
    let mut cmd = CommandBuffer::new("frame");
    {
        let mut ctx = frame.context();
        graph.render(&mut ctx, &mut cmd).unwrap();
    }

    assert_eq!(
        *events.lock().unwrap(),
        vec!["A:pre", "A:render", "A:post", "B:pre", "B:render", "B:post"]
    );

    let commands = cmd.commands();
    assert_eq!(commands[0], Command::PushMarker("A".into()));
    assert_eq!(
        commands[1],
        Command::Barrier {
            texture: color,
            state: ResourceState::RenderTarget
        }
    );
    assert!(matches!(&commands[2], Command::SetViewport { extent, .. } if *extent == UVec2::new(800, 600)));
    assert!(matches!(&commands[3], Command::SetScissor { .. }));
    match &commands[4] {
        Command::BeginRenderPass { label, colors, depth } => {
            assert_eq!(label, "A");
            assert_eq!(colors.len(), 1);
            assert_eq!(colors[0].texture, color);
            assert!(depth.is_none());
        }
        other => panic!("expected a render pass, got {other:?}"),
    }
    assert_eq!(commands[5], Command::EndRenderPass);
    assert_eq!(commands[6], Command::PopMarker);
    assert_eq!(commands[7], Command::PushMarker("B".into()));
    assert_eq!(
        commands[8],
        Command::Barrier {
            texture: color,
            state: ResourceState::ShaderResource
        }
    );
    assert_eq!(commands[9], Command::PopMarker);
    assert_eq!(commands.len(), 10);
}

#[test]
fn rendering_requires_compilation() {
    let device = device(800, 600);
    let mut graph = graph(r#"{ "name": "raw", "passes": [ { "name": "A" } ] }"#);
    let mut frame = Frame::new(&device);
    let mut ctx = frame.context();
    let mut cmd = CommandBuffer::new("frame");
    assert!(matches!(
        graph.render(&mut ctx, &mut cmd),
        Err(GraphError::NotCompiled(name)) if name == "raw"
    ));
}

#[test]
fn reenabling_a_node_needs_a_recompile() {
    let device = device(800, 600);
    let mut graph = graph(
        r#"{ "passes": [ { "name": "A", "enabled": "false", "outputs": [ { "type": "attachment", "name": "color", "format": "R8G8B8A8_UNORM" } ] } ] }"#,
    );
    graph.compile(device.as_ref()).unwrap();
    assert!(graph.texture("color").is_none());

    graph.set_node_enabled("A", true).unwrap();
    assert!(!graph.is_compiled());
    graph.compile(device.as_ref()).unwrap();
    assert!(graph.texture("color").is_some());
    assert!(matches!(graph.set_node_enabled("nope", true), Err(GraphError::NodeNotFound(_))));
}

#[test]
fn destroy_releases_graph_textures() {
    let device = device(800, 600);
    let mut graph = graph(
        r#"{ "passes": [ { "name": "A", "outputs": [
            { "type": "attachment", "name": "color", "format": "R8G8B8A8_UNORM" },
            { "type": "buffer", "name": "counts", "size": 64 }
        ] } ] }"#,
    );
    let buffers_before = device.live_buffers();
    graph.compile(device.as_ref()).unwrap();
    assert_eq!(device.live_textures(), 1);
    assert_eq!(device.live_buffers(), buffers_before + 1);

    graph.destroy(device.as_ref());
    assert_eq!(device.live_textures(), 0);
    assert_eq!(device.live_buffers(), buffers_before);
    assert!(!graph.is_compiled());
}

#[test]
fn attachments_of_one_node_must_share_an_extent() {
    let device = device(800, 600);
    let mut graph = graph(
        r#"{ "passes": [ { "name": "A", "outputs": [
            { "type": "attachment", "name": "full", "format": "R8G8B8A8_UNORM" },
            { "type": "attachment", "name": "half", "format": "R8G8B8A8_UNORM", "scale": [0.5, 0.5] }
        ] } ] }"#,
    );
    assert!(matches!(
        graph.compile(device.as_ref()),
        Err(GraphError::AttachmentExtentMismatch { node, .. }) if node == "A"
    ));
}
