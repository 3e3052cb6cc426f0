pub mod builder;
pub mod compile;
pub mod description;
pub mod pass;
pub mod runtime;

use std::path::Path;

use glam::UVec2;
use thiserror::Error;

use crate::{
    config::PoolConfig,
    core::{HandleId, PoolError},
    gpu::{BufferId, DeviceError, TextureId},
};

pub use builder::{
    BufferInfo, ColorTarget, DepthTarget, Framebuffer, RenderGraphBuilder, RenderGraphNode,
    RenderGraphResource, ResourceInfo, SizePolicy, TextureInfo,
};
pub use compile::CompileReport;
pub use description::{NodeType, RenderGraphDescription, ResourceType};
pub use pass::{BoundResource, FrameContext, PassIo, RenderGraphPass};

pub struct _GraphResource;
pub struct _GraphNode;

pub type ResourceHandle = HandleId<_GraphResource>;
pub type NodeHandle = HandleId<_GraphNode>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse render graph: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("render graph has a cycle through {0:?}")]
    Cycle(Vec<String>),
    #[error("node '{0}' not found")]
    NodeNotFound(String),
    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),
    #[error("node '{0}' already has a render pass")]
    PassAlreadyRegistered(String),
    #[error("resource '{resource}': {reason}")]
    InvalidResource { resource: String, reason: String },
    #[error("attachments of node '{node}' differ in size: {extents:?}")]
    AttachmentExtentMismatch { node: String, extents: Vec<UVec2> },
    #[error("render graph '{0}' must be compiled first")]
    NotCompiled(String),
}

/// Compiled pass graph: nodes in execution order plus the transient
/// textures and buffers the graph owns.
pub struct RenderGraph {
    name: String,
    presentation_target: String,
    builder: RenderGraphBuilder,
    order: Vec<NodeHandle>,
    compiled: bool,
    owned_textures: Vec<TextureId>,
    owned_buffers: Vec<BufferId>,
}

impl RenderGraph {
    pub fn new(name: &str, presentation_target: &str, pools: &PoolConfig) -> Self {
        Self {
            name: name.to_string(),
            presentation_target: presentation_target.to_string(),
            builder: RenderGraphBuilder::new(pools.graph_nodes, pools.graph_resources),
            order: Vec::new(),
            compiled: false,
            owned_textures: Vec::new(),
            owned_buffers: Vec::new(),
        }
    }

    pub fn from_description(
        desc: &RenderGraphDescription,
        presentation_target: &str,
        pools: &PoolConfig,
    ) -> Result<Self, GraphError> {
        let mut graph = Self::new(
            desc.name.as_deref().unwrap_or("render_graph"),
            presentation_target,
            pools,
        );
        for pass in &desc.passes {
            graph.builder.create_node(pass)?;
        }
        log::info!("Parsed render graph '{}' with {} nodes", graph.name, desc.passes.len());
        Ok(graph)
    }

    pub fn parse_from_file(
        path: &Path,
        presentation_target: &str,
        pools: &PoolConfig,
    ) -> Result<Self, GraphError> {
        let desc = RenderGraphDescription::from_file(path)?;
        Self::from_description(&desc, presentation_target, pools)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn presentation_target(&self) -> &str {
        &self.presentation_target
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub fn builder(&self) -> &RenderGraphBuilder {
        &self.builder
    }

    pub fn builder_mut(&mut self) -> &mut RenderGraphBuilder {
        &mut self.builder
    }

    pub fn register_render_pass(
        &mut self,
        node: &str,
        pass: Box<dyn RenderGraphPass>,
    ) -> Result<(), GraphError> {
        self.builder.register_render_pass(node, pass)
    }

    pub fn unregister_render_pass(&mut self, node: &str) -> Option<Box<dyn RenderGraphPass>> {
        self.builder.unregister_render_pass(node)
    }

    /// Node names in compiled order, disabled nodes included.
    pub fn execution_order(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter_map(|h| self.builder.access_node(*h))
            .map(|n| n.name.as_str())
            .collect()
    }

    pub fn access_node_by_name(&self, name: &str) -> Option<&RenderGraphNode> {
        self.builder.access_node_by_name(name)
    }

    pub fn access_resource_by_name(&self, name: &str) -> Option<&RenderGraphResource> {
        self.builder.access_resource_by_name(name)
    }

    pub fn texture(&self, resource: &str) -> Option<TextureId> {
        match &self.access_resource_by_name(resource)?.info {
            ResourceInfo::Texture(info) => info.texture,
            _ => None,
        }
    }

    pub fn buffer(&self, resource: &str) -> Option<BufferId> {
        match &self.access_resource_by_name(resource)?.info {
            ResourceInfo::Buffer(info) => info.buffer,
            _ => None,
        }
    }

    /// Disabling takes effect on the next frame. Enabling needs a compile
    /// because the node's resources were never allocated.
    pub fn set_node_enabled(&mut self, name: &str, enabled: bool) -> Result<(), GraphError> {
        let node = self
            .builder
            .access_node_by_name_mut(name)
            .ok_or_else(|| GraphError::NodeNotFound(name.to_string()))?;
        node.declared_enabled = enabled;
        if enabled && !node.enabled {
            self.compiled = false;
        } else {
            node.enabled = enabled;
        }
        Ok(())
    }

    /// Binds an externally owned texture to an external resource name.
    pub fn bind_external_texture(
        &mut self,
        name: &str,
        texture: TextureId,
        extent: UVec2,
    ) -> Result<(), GraphError> {
        self.builder.bind_external_texture(name, texture, extent)
    }
}
