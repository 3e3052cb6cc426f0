use std::collections::HashMap;

use glam::{UVec2, Vec2, Vec4};

use super::{
    description::{InputDescription, OutputDescription, PassDescription, SizeDescription},
    GraphError, NodeHandle, NodeType, RenderGraphPass, ResourceHandle, ResourceType, _GraphNode,
    _GraphResource,
};
use crate::{
    core::ResourcePool,
    gpu::{types::parse_texture_format, BufferId, LoadOp, RenderPassOutput, TextureId},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizePolicy {
    /// Fraction of the swapchain extent.
    Relative(Vec2),
    Absolute(UVec2),
}

impl SizePolicy {
    pub fn resolve(&self, swapchain: UVec2) -> UVec2 {
        match self {
            SizePolicy::Relative(scale) => {
                let extent = (swapchain.as_vec2() * *scale).round().as_uvec2();
                extent.max(UVec2::ONE)
            }
            SizePolicy::Absolute(extent) => *extent,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureInfo {
    pub format: wgpu::TextureFormat,
    pub load_op: LoadOp,
    pub size: SizePolicy,
    /// Recreated at the new size when the swapchain resizes.
    pub resize: bool,
    pub clear_color: Vec4,
    pub clear_depth: f32,
    pub clear_stencil: u32,
    pub extent: UVec2,
    pub usage: wgpu::TextureUsages,
    pub texture: Option<TextureId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferInfo {
    pub size: u64,
    pub buffer: Option<BufferId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceInfo {
    Texture(TextureInfo),
    Buffer(BufferInfo),
    /// Inputs and reference outputs read their info from the resource they
    /// resolve to.
    Unresolved,
}

#[derive(Debug, Clone)]
pub struct RenderGraphResource {
    pub name: String,
    pub kind: ResourceType,
    pub external: bool,
    pub info: ResourceInfo,
    pub producer: Option<NodeHandle>,
    /// The output this entry refers to; itself for producing outputs.
    pub output: Option<ResourceHandle>,
    pub ref_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorTarget {
    pub resource: ResourceHandle,
    pub load: LoadOp,
    pub clear: Vec4,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthTarget {
    pub resource: ResourceHandle,
    pub load: LoadOp,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

/// Attachments a graphics node renders into, by graph resource.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Framebuffer {
    pub colors: Vec<ColorTarget>,
    pub depth: Option<DepthTarget>,
    pub extent: UVec2,
}

pub struct RenderGraphNode {
    pub name: String,
    pub kind: NodeType,
    pub enabled: bool,
    pub(crate) declared_enabled: bool,
    pub inputs: Vec<ResourceHandle>,
    pub outputs: Vec<ResourceHandle>,
    /// Nodes that must run after this one.
    pub edges: Vec<NodeHandle>,
    pub render_pass: Option<RenderPassOutput>,
    pub framebuffer: Option<Framebuffer>,
    pub(crate) pass: Option<Box<dyn RenderGraphPass>>,
    pub(crate) declaration: usize,
}

impl RenderGraphNode {
    pub fn has_pass(&self) -> bool {
        self.pass.is_some()
    }
}

fn invalid(resource: &str, reason: impl Into<String>) -> GraphError {
    GraphError::InvalidResource {
        resource: resource.to_string(),
        reason: reason.into(),
    }
}

fn texture_info(desc: &OutputDescription) -> Result<TextureInfo, GraphError> {
    let format = match &desc.format {
        Some(format) => parse_texture_format(format).map_err(|e| invalid(&desc.name, e.to_string()))?,
        None if desc.external => wgpu::TextureFormat::Rgba8Unorm,
        None => return Err(invalid(&desc.name, "missing format")),
    };
    let load_op = match &desc.op {
        Some(op) => op.parse::<LoadOp>().map_err(|e| invalid(&desc.name, e.to_string()))?,
        None => LoadOp::Clear,
    };
    let size = match (desc.size, desc.scale) {
        (Some(SizeDescription::Extent([w, h])), _) => SizePolicy::Absolute(UVec2::new(w, h)),
        (Some(SizeDescription::Bytes(_)), _) => {
            return Err(invalid(&desc.name, "texture size must be [width, height]"))
        }
        (None, Some([x, y])) => SizePolicy::Relative(Vec2::new(x, y)),
        (None, None) => SizePolicy::Relative(Vec2::ONE),
    };
    Ok(TextureInfo {
        format,
        load_op,
        resize: desc.resize.unwrap_or(matches!(size, SizePolicy::Relative(_))),
        size,
        clear_color: desc.clear_color.map(Vec4::from).unwrap_or(Vec4::new(0.0, 0.0, 0.0, 1.0)),
        clear_depth: desc.clear_depth.unwrap_or(1.0),
        clear_stencil: desc.clear_stencil.unwrap_or(0),
        extent: UVec2::ZERO,
        usage: wgpu::TextureUsages::empty(),
        texture: None,
    })
}

/// Node and resource storage with name lookup.
pub struct RenderGraphBuilder {
    resources: ResourcePool<RenderGraphResource, _GraphResource>,
    nodes: ResourcePool<RenderGraphNode, _GraphNode>,
    resource_map: HashMap<String, ResourceHandle>,
    node_map: HashMap<String, NodeHandle>,
    declared: Vec<NodeHandle>,
}

impl RenderGraphBuilder {
    pub fn new(max_nodes: usize, max_resources: usize) -> Self {
        Self {
            resources: ResourcePool::new("render graph resources", max_resources),
            nodes: ResourcePool::new("render graph nodes", max_nodes),
            resource_map: HashMap::new(),
            node_map: HashMap::new(),
            declared: Vec::new(),
        }
    }

    pub fn create_node(&mut self, desc: &PassDescription) -> Result<NodeHandle, GraphError> {
        if self.node_map.contains_key(&desc.name) {
            return Err(GraphError::DuplicateNode(desc.name.clone()));
        }
        let handle = self.nodes.obtain(RenderGraphNode {
            name: desc.name.clone(),
            kind: desc.kind,
            enabled: desc.enabled,
            declared_enabled: desc.enabled,
            inputs: Vec::with_capacity(desc.inputs.len()),
            outputs: Vec::with_capacity(desc.outputs.len()),
            edges: Vec::new(),
            render_pass: None,
            framebuffer: None,
            pass: None,
            declaration: self.declared.len(),
        })?;

        let mut outputs = Vec::with_capacity(desc.outputs.len());
        for output in &desc.outputs {
            outputs.push(self.create_node_output(output, handle)?);
        }
        let mut inputs = Vec::with_capacity(desc.inputs.len());
        for input in &desc.inputs {
            inputs.push(self.create_node_input(input)?);
        }
        if let Some(node) = self.nodes.access_mut(handle) {
            node.outputs = outputs;
            node.inputs = inputs;
        }

        self.node_map.insert(desc.name.clone(), handle);
        self.declared.push(handle);
        Ok(handle)
    }

    pub fn create_node_output(
        &mut self,
        desc: &OutputDescription,
        producer: NodeHandle,
    ) -> Result<ResourceHandle, GraphError> {
        let kind = desc.kind.unwrap_or(ResourceType::Attachment);
        let info = match kind {
            ResourceType::Attachment | ResourceType::Texture => ResourceInfo::Texture(texture_info(desc)?),
            ResourceType::Buffer => match desc.size {
                Some(SizeDescription::Bytes(size)) => ResourceInfo::Buffer(BufferInfo { size, buffer: None }),
                _ => return Err(invalid(&desc.name, "buffer outputs need a byte size")),
            },
            ResourceType::Reference => ResourceInfo::Unresolved,
        };

        let handle = self.resources.obtain(RenderGraphResource {
            name: desc.name.clone(),
            kind,
            external: desc.external,
            info,
            producer: Some(producer),
            output: None,
            ref_count: 0,
        })?;

        if kind != ResourceType::Reference {
            if let Some(resource) = self.resources.access_mut(handle) {
                resource.output = Some(handle);
            }
            // First producer wins; duplicates are reported at compile time.
            self.resource_map.entry(desc.name.clone()).or_insert(handle);
        }
        Ok(handle)
    }

    pub fn create_node_input(&mut self, desc: &InputDescription) -> Result<ResourceHandle, GraphError> {
        Ok(self.resources.obtain(RenderGraphResource {
            name: desc.name.clone(),
            kind: desc.kind,
            external: desc.external,
            info: ResourceInfo::Unresolved,
            producer: None,
            output: None,
            ref_count: 0,
        })?)
    }

    /// Producer-less resource standing for a texture owned outside the graph.
    pub(crate) fn ensure_import(
        &mut self,
        name: &str,
        format: wgpu::TextureFormat,
    ) -> Result<ResourceHandle, GraphError> {
        if let Some(handle) = self.resource_map.get(name) {
            return Ok(*handle);
        }
        let handle = self.resources.obtain(RenderGraphResource {
            name: name.to_string(),
            kind: ResourceType::Attachment,
            external: true,
            info: ResourceInfo::Texture(TextureInfo {
                format,
                load_op: LoadOp::Load,
                size: SizePolicy::Relative(Vec2::ONE),
                resize: false,
                clear_color: Vec4::ZERO,
                clear_depth: 1.0,
                clear_stencil: 0,
                extent: UVec2::ZERO,
                usage: wgpu::TextureUsages::empty(),
                texture: None,
            }),
            producer: None,
            output: None,
            ref_count: 0,
        })?;
        if let Some(resource) = self.resources.access_mut(handle) {
            resource.output = Some(handle);
        }
        self.resource_map.insert(name.to_string(), handle);
        Ok(handle)
    }

    pub fn bind_external_texture(
        &mut self,
        name: &str,
        texture: TextureId,
        extent: UVec2,
    ) -> Result<(), GraphError> {
        let handle = self.ensure_import(name, wgpu::TextureFormat::Rgba8Unorm)?;
        let resource = self
            .resources
            .access_mut(handle)
            .ok_or_else(|| invalid(name, "stale handle"))?;
        if !resource.external {
            return Err(invalid(name, "only external resources can be bound"));
        }
        match &mut resource.info {
            ResourceInfo::Texture(info) => {
                info.texture = Some(texture);
                info.extent = extent;
                Ok(())
            }
            _ => Err(invalid(name, "not a texture")),
        }
    }

    pub fn register_render_pass(
        &mut self,
        name: &str,
        pass: Box<dyn RenderGraphPass>,
    ) -> Result<(), GraphError> {
        let node = self
            .access_node_by_name_mut(name)
            .ok_or_else(|| GraphError::NodeNotFound(name.to_string()))?;
        if node.pass.is_some() {
            return Err(GraphError::PassAlreadyRegistered(name.to_string()));
        }
        node.pass = Some(pass);
        Ok(())
    }

    pub fn unregister_render_pass(&mut self, name: &str) -> Option<Box<dyn RenderGraphPass>> {
        self.access_node_by_name_mut(name).and_then(|node| node.pass.take())
    }

    pub fn unregister_all_render_passes(&mut self) -> usize {
        self.nodes
            .iter_mut()
            .filter_map(|(_, node)| node.pass.take())
            .count()
    }

    pub fn node_handle(&self, name: &str) -> Option<NodeHandle> {
        self.node_map.get(name).copied()
    }

    pub fn resource_handle(&self, name: &str) -> Option<ResourceHandle> {
        self.resource_map.get(name).copied()
    }

    pub fn access_node(&self, handle: NodeHandle) -> Option<&RenderGraphNode> {
        self.nodes.access(handle)
    }

    pub fn access_node_mut(&mut self, handle: NodeHandle) -> Option<&mut RenderGraphNode> {
        self.nodes.access_mut(handle)
    }

    pub fn access_node_by_name(&self, name: &str) -> Option<&RenderGraphNode> {
        self.node_handle(name).and_then(|h| self.nodes.access(h))
    }

    pub fn access_node_by_name_mut(&mut self, name: &str) -> Option<&mut RenderGraphNode> {
        let handle = self.node_handle(name)?;
        self.nodes.access_mut(handle)
    }

    pub fn access_resource(&self, handle: ResourceHandle) -> Option<&RenderGraphResource> {
        self.resources.access(handle)
    }

    pub fn access_resource_mut(&mut self, handle: ResourceHandle) -> Option<&mut RenderGraphResource> {
        self.resources.access_mut(handle)
    }

    /// The producing output registered under `name`.
    pub fn access_resource_by_name(&self, name: &str) -> Option<&RenderGraphResource> {
        self.resource_handle(name).and_then(|h| self.resources.access(h))
    }

    pub fn declared_nodes(&self) -> &[NodeHandle] {
        &self.declared
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn resources_mut(&mut self) -> impl Iterator<Item = (ResourceHandle, &mut RenderGraphResource)> {
        self.resources.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_graph::RenderGraphDescription;

    const GRAPH: &str = r#"{
        "passes": [
            { "name": "depth_pre", "outputs": [ { "type": "attachment", "name": "depth", "format": "D32_SFLOAT" } ] },
            { "name": "gbuffer",
              "inputs": [ { "type": "attachment", "name": "depth" } ],
              "outputs": [ { "type": "attachment", "name": "albedo", "format": "R8G8B8A8_UNORM", "op": "clear", "clear_color": [0.1, 0.2, 0.3, 1.0] } ] }
        ]
    }"#;

    fn builder() -> RenderGraphBuilder {
        let desc = RenderGraphDescription::from_json(GRAPH).unwrap();
        let mut builder = RenderGraphBuilder::new(8, 16);
        for pass in &desc.passes {
            builder.create_node(pass).unwrap();
        }
        builder
    }

    struct Nop;
    impl RenderGraphPass for Nop {
        fn render(
            &mut self,
            _ctx: &mut crate::render_graph::FrameContext<'_>,
            _cmd: &mut crate::gpu::CommandBuffer,
        ) {
        }
    }

    #[test]
    fn outputs_register_by_name() {
        let builder = builder();
        let albedo = builder.access_resource_by_name("albedo").unwrap();
        let ResourceInfo::Texture(info) = &albedo.info else {
            panic!("albedo is a texture");
        };
        assert_eq!(info.format, wgpu::TextureFormat::Rgba8Unorm);
        assert_eq!(info.clear_color, Vec4::new(0.1, 0.2, 0.3, 1.0));
        assert!(info.resize);
        assert_eq!(albedo.producer, builder.node_handle("gbuffer"));

        let gbuffer = builder.access_node_by_name("gbuffer").unwrap();
        assert_eq!(gbuffer.inputs.len(), 1);
        assert_eq!(gbuffer.outputs.len(), 1);
        assert!(builder.access_node_by_name("missing").is_none());
    }

    #[test]
    fn pass_registration_rules() {
        let mut builder = builder();
        builder.register_render_pass("gbuffer", Box::new(Nop)).unwrap();
        assert!(matches!(
            builder.register_render_pass("gbuffer", Box::new(Nop)),
            Err(GraphError::PassAlreadyRegistered(_))
        ));
        assert!(matches!(
            builder.register_render_pass("nope", Box::new(Nop)),
            Err(GraphError::NodeNotFound(_))
        ));
        assert!(builder.unregister_render_pass("gbuffer").is_some());
        builder.register_render_pass("depth_pre", Box::new(Nop)).unwrap();
        assert_eq!(builder.unregister_all_render_passes(), 1);
    }

    #[test]
    fn duplicate_node_names_are_rejected() {
        let desc = RenderGraphDescription::from_json(
            r#"{ "passes": [ { "name": "a" }, { "name": "a" } ] }"#,
        )
        .unwrap();
        let mut builder = RenderGraphBuilder::new(8, 16);
        builder.create_node(&desc.passes[0]).unwrap();
        assert!(matches!(
            builder.create_node(&desc.passes[1]),
            Err(GraphError::DuplicateNode(_))
        ));
    }

    #[test]
    fn relative_sizes_round_and_never_hit_zero() {
        let half = SizePolicy::Relative(Vec2::splat(0.5));
        assert_eq!(half.resolve(UVec2::new(801, 600)), UVec2::new(401, 300));
        assert_eq!(half.resolve(UVec2::new(1, 1)), UVec2::new(1, 1));
        assert_eq!(
            SizePolicy::Absolute(UVec2::new(64, 32)).resolve(UVec2::new(800, 600)),
            UVec2::new(64, 32)
        );
    }
}
