use std::collections::{BTreeSet, HashMap};

use glam::UVec2;

use super::{
    ColorTarget, DepthTarget, Framebuffer, GraphError, NodeHandle, NodeType, RenderGraph,
    ResourceHandle, ResourceInfo, ResourceType, SizePolicy, TextureInfo,
};
use crate::gpu::{BufferCreation, GpuDevice, LoadOp, RenderPassOutput, TextureCreation, TextureId};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CompileReport {
    pub order: Vec<String>,
    /// (node, reason) for every node compile had to switch off.
    pub disabled_nodes: Vec<(String, String)>,
    pub allocated_textures: usize,
    pub aliased_textures: usize,
    pub allocated_buffers: usize,
}

/// Textures may only share memory when all of these match.
#[derive(Debug, Clone, PartialEq)]
struct AliasKey {
    format: wgpu::TextureFormat,
    usage: wgpu::TextureUsages,
    size: SizePolicy,
    resize: bool,
}

fn texture_usage(kind: ResourceType, producer: NodeType) -> wgpu::TextureUsages {
    let mut usage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_SRC;
    if kind == ResourceType::Attachment {
        usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    if producer == NodeType::Compute || kind == ResourceType::Texture {
        usage |= wgpu::TextureUsages::STORAGE_BINDING;
    }
    usage
}

pub(crate) fn texture_creation(
    name: &str,
    info: &TextureInfo,
    usage: wgpu::TextureUsages,
    extent: UVec2,
) -> TextureCreation {
    TextureCreation {
        name: name.to_string(),
        extent,
        mip_levels: 1,
        array_layers: 1,
        format: info.format,
        usage,
    }
}

impl RenderGraph {
    /// Resolves inputs, orders nodes, allocates transient resources and
    /// builds per-node render pass descriptions. Safe to call again after
    /// the description changed.
    pub fn compile(&mut self, device: &dyn GpuDevice) -> Result<CompileReport, GraphError> {
        self.compiled = false;
        self.release_owned(device);
        let mut report = CompileReport::default();

        self.reset();
        self.resolve(device, &mut report)?;
        self.order = self.topological_sort()?;
        self.allocate(device, &mut report)?;
        self.build_render_passes(device)?;

        report.order = self.execution_order().iter().map(|s| s.to_string()).collect();
        log::info!("Render graph '{}' order: {:?}", self.name, report.order);
        self.compiled = true;
        Ok(report)
    }

    fn reset(&mut self) {
        let nodes: Vec<NodeHandle> = self.builder.declared_nodes().to_vec();
        for handle in nodes {
            if let Some(node) = self.builder.access_node_mut(handle) {
                node.edges.clear();
                node.render_pass = None;
                node.framebuffer = None;
                node.enabled = node.declared_enabled;
            }
        }
        for (_, resource) in self.builder.resources_mut() {
            resource.ref_count = 0;
        }
    }

    fn disable(&mut self, node: NodeHandle, reason: String, report: &mut CompileReport) {
        if let Some(n) = self.builder.access_node_mut(node) {
            if n.enabled {
                log::error!("Disabling render graph node '{}': {reason}", n.name);
                n.enabled = false;
                report.disabled_nodes.push((n.name.clone(), reason));
            }
        }
    }

    fn add_edge(&mut self, from: NodeHandle, to: NodeHandle) {
        if from == to {
            return;
        }
        if let Some(node) = self.builder.access_node_mut(from) {
            if !node.edges.contains(&to) {
                node.edges.push(to);
            }
        }
    }

    fn resolve(&mut self, device: &dyn GpuDevice, report: &mut CompileReport) -> Result<(), GraphError> {
        let declared: Vec<NodeHandle> = self.builder.declared_nodes().to_vec();

        // Reference writers per name, in declaration order.
        let mut writers: HashMap<String, Vec<NodeHandle>> = HashMap::new();
        for &handle in &declared {
            let Some(node) = self.builder.access_node(handle) else { continue };
            for &output in &node.outputs {
                if let Some(r) = self.builder.access_resource(output) {
                    if r.kind == ResourceType::Reference {
                        writers.entry(r.name.clone()).or_default().push(handle);
                    }
                }
            }
        }

        for &handle in &declared {
            let (outputs, inputs) = match self.builder.access_node(handle) {
                Some(node) => (node.outputs.clone(), node.inputs.clone()),
                None => continue,
            };

            for output in outputs {
                let Some((name, kind)) = self
                    .builder
                    .access_resource(output)
                    .map(|r| (r.name.clone(), r.kind))
                else {
                    continue;
                };
                let canonical = self.builder.resource_handle(&name);
                if kind == ResourceType::Reference {
                    let producer = canonical
                        .and_then(|c| self.builder.access_resource(c))
                        .and_then(|c| c.producer);
                    match (canonical, producer) {
                        (Some(canonical), producer) if producer != Some(handle) => {
                            if let Some(r) = self.builder.access_resource_mut(output) {
                                r.output = Some(canonical);
                            }
                            if let Some(producer) = producer {
                                self.add_edge(producer, handle);
                            }
                            let earlier: Vec<NodeHandle> = writers
                                .get(&name)
                                .map(|w| w.iter().take_while(|w| **w != handle).copied().collect())
                                .unwrap_or_default();
                            for writer in earlier {
                                self.add_edge(writer, handle);
                            }
                        }
                        _ => self.disable(handle, format!("reference to unproduced resource '{name}'"), report),
                    }
                } else if canonical != Some(output) {
                    self.disable(handle, format!("'{name}' is already produced by another node"), report);
                }
            }

            for input in inputs {
                let Some((name, external)) = self
                    .builder
                    .access_resource(input)
                    .map(|r| (r.name.clone(), r.external))
                else {
                    continue;
                };
                let canonical = match self.builder.resource_handle(&name) {
                    Some(canonical) => Some(canonical),
                    None if external => {
                        let format = if name == self.presentation_target {
                            device.swapchain_format()
                        } else {
                            wgpu::TextureFormat::Rgba8Unorm
                        };
                        Some(self.builder.ensure_import(&name, format)?)
                    }
                    None => None,
                };
                let Some(canonical) = canonical else {
                    self.disable(handle, format!("input '{name}' has no producer"), report);
                    continue;
                };
                let producer = self.builder.access_resource(canonical).and_then(|c| c.producer);
                if let Some(r) = self.builder.access_resource_mut(input) {
                    r.output = Some(canonical);
                    r.producer = producer;
                }
                if let Some(producer) = producer {
                    self.add_edge(producer, handle);
                }
                let node_writes = writers.get(&name).map(|w| w.contains(&handle)).unwrap_or(false);
                let before: Vec<NodeHandle> = writers
                    .get(&name)
                    .map(|w| {
                        if node_writes {
                            w.iter().take_while(|w| **w != handle).copied().collect()
                        } else {
                            w.clone()
                        }
                    })
                    .unwrap_or_default();
                for writer in before {
                    self.add_edge(writer, handle);
                }
            }
        }

        // Readers of a disabled producer cannot run either.
        loop {
            let mut newly_disabled = Vec::new();
            for &handle in &declared {
                let Some(node) = self.builder.access_node(handle) else { continue };
                if !node.enabled {
                    continue;
                }
                // Reference outputs depend on the producer of the name they write into.
                let referenced = node.outputs.iter().filter_map(|&output| {
                    let r = self.builder.access_resource(output)?;
                    if r.kind != ResourceType::Reference {
                        return None;
                    }
                    self.builder.access_resource(r.output?)?.producer
                });
                let upstream: Vec<NodeHandle> = node
                    .inputs
                    .iter()
                    .filter_map(|&input| self.builder.access_resource(input).and_then(|r| r.producer))
                    .chain(referenced)
                    .filter(|p| *p != handle)
                    .collect();
                for producer in upstream {
                    let Some(producer) = self.builder.access_node(producer) else { continue };
                    if !producer.enabled {
                        newly_disabled.push((handle, format!("producer '{}' is disabled", producer.name)));
                        break;
                    }
                }
            }
            if newly_disabled.is_empty() {
                break;
            }
            for (handle, reason) in newly_disabled {
                self.disable(handle, reason, report);
            }
        }
        Ok(())
    }

    /// Kahn's algorithm; among ready nodes the earliest declared goes first.
    fn topological_sort(&self) -> Result<Vec<NodeHandle>, GraphError> {
        let declared = self.builder.declared_nodes();
        let slots: HashMap<NodeHandle, usize> =
            declared.iter().enumerate().map(|(slot, h)| (*h, slot)).collect();

        let mut in_degree = vec![0usize; declared.len()];
        for handle in declared {
            if let Some(node) = self.builder.access_node(*handle) {
                for edge in &node.edges {
                    if let Some(slot) = slots.get(edge) {
                        in_degree[*slot] += 1;
                    }
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..declared.len()).filter(|s| in_degree[*s] == 0).collect();
        let mut order = Vec::with_capacity(declared.len());
        while let Some(slot) = ready.pop_first() {
            let handle = declared[slot];
            order.push(handle);
            let Some(node) = self.builder.access_node(handle) else { continue };
            for edge in &node.edges {
                let Some(&next) = slots.get(edge) else { continue };
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != declared.len() {
            let stuck: Vec<String> = declared
                .iter()
                .filter(|h| !order.contains(h))
                .filter_map(|h| self.builder.access_node(*h).map(|n| n.name.clone()))
                .collect();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(order)
    }

    fn allocate(&mut self, device: &dyn GpuDevice, report: &mut CompileReport) -> Result<(), GraphError> {
        let swapchain = device.swapchain_extent();
        let order = self.order.clone();

        for &handle in &order {
            let Some(node) = self.builder.access_node(handle) else { continue };
            if !node.enabled {
                continue;
            }
            let inputs = node.inputs.clone();
            for input in inputs {
                let canonical = self.builder.access_resource(input).and_then(|r| r.output);
                if let Some(resource) = canonical.and_then(|c| self.builder.access_resource_mut(c)) {
                    resource.ref_count += 1;
                }
            }
        }

        let mut free_list: Vec<(TextureId, AliasKey, UVec2)> = Vec::new();
        for &handle in &order {
            let Some(node) = self.builder.access_node(handle) else { continue };
            if !node.enabled {
                continue;
            }
            let (node_name, node_kind) = (node.name.clone(), node.kind);
            let (outputs, inputs) = (node.outputs.clone(), node.inputs.clone());

            for output in outputs {
                let Some(resource) = self.builder.access_resource_mut(output) else { continue };
                if resource.kind == ResourceType::Reference {
                    continue;
                }
                let name = resource.name.clone();
                let kind = resource.kind;
                if resource.external {
                    if let ResourceInfo::Texture(info) = &mut resource.info {
                        if name == self.presentation_target {
                            info.format = device.swapchain_format();
                            info.extent = swapchain;
                        }
                    }
                    continue;
                }
                match &mut resource.info {
                    ResourceInfo::Texture(info) => {
                        let usage = texture_usage(kind, node_kind);
                        let extent = info.size.resolve(swapchain);
                        let key = AliasKey {
                            format: info.format,
                            usage,
                            size: info.size,
                            resize: info.resize,
                        };
                        let reuse = free_list
                            .iter()
                            .position(|(_, k, e)| *k == key && *e == extent)
                            .map(|i| free_list.swap_remove(i).0);
                        let texture = match reuse {
                            Some(texture) => {
                                log::debug!("'{name}' aliases {texture:?} at node '{node_name}'");
                                report.aliased_textures += 1;
                                texture
                            }
                            None => {
                                let texture =
                                    device.create_texture(&texture_creation(&name, info, usage, extent))?;
                                log::debug!("Allocated '{name}' {extent} at node '{node_name}'");
                                self.owned_textures.push(texture);
                                report.allocated_textures += 1;
                                texture
                            }
                        };
                        info.texture = Some(texture);
                        info.extent = extent;
                        info.usage = usage;
                    }
                    ResourceInfo::Buffer(info) => {
                        let buffer = device.create_buffer(&BufferCreation {
                            name: name.clone(),
                            size: info.size,
                            usage: wgpu::BufferUsages::STORAGE
                                | wgpu::BufferUsages::COPY_DST
                                | wgpu::BufferUsages::COPY_SRC,
                        })?;
                        info.buffer = Some(buffer);
                        self.owned_buffers.push(buffer);
                        report.allocated_buffers += 1;
                    }
                    ResourceInfo::Unresolved => {}
                }
            }

            for input in inputs {
                let Some(canonical) = self.builder.access_resource(input).and_then(|r| r.output) else {
                    continue;
                };
                let remaining = match self.builder.access_resource_mut(canonical) {
                    Some(resource) => {
                        resource.ref_count = resource.ref_count.saturating_sub(1);
                        resource.ref_count
                    }
                    None => continue,
                };
                let Some(resource) = self.builder.access_resource(canonical) else { continue };
                if remaining > 0 || resource.external {
                    continue;
                }
                if let ResourceInfo::Texture(info) = &resource.info {
                    if let Some(texture) = info.texture {
                        log::debug!("Releasing '{}' after node '{node_name}'", resource.name);
                        let key = AliasKey {
                            format: info.format,
                            usage: info.usage,
                            size: info.size,
                            resize: info.resize,
                        };
                        free_list.push((texture, key, info.extent));
                    }
                }
            }
        }
        Ok(())
    }

    /// Texture info behind `resource`, following inputs and references to
    /// the producing output.
    pub(crate) fn resolved_texture(&self, resource: ResourceHandle) -> Option<(&str, &TextureInfo)> {
        let r = self.builder.access_resource(resource)?;
        let canonical = self.builder.access_resource(r.output?)?;
        match &canonical.info {
            ResourceInfo::Texture(info) => Some((canonical.name.as_str(), info)),
            _ => None,
        }
    }

    fn build_render_passes(&mut self, device: &dyn GpuDevice) -> Result<(), GraphError> {
        let swapchain = device.swapchain_extent();
        for handle in self.order.clone() {
            let Some(node) = self.builder.access_node(handle) else { continue };
            if !node.enabled || node.kind != NodeType::Graphics {
                continue;
            }
            let node_name = node.name.clone();
            let attachments: Vec<(ResourceHandle, LoadOp)> = node
                .outputs
                .iter()
                .filter_map(|o| {
                    let r = self.builder.access_resource(*o)?;
                    match r.kind {
                        ResourceType::Attachment => Some((*o, None)),
                        ResourceType::Reference => Some((*o, Some(LoadOp::Load))),
                        _ => None,
                    }
                })
                .chain(node.inputs.iter().filter_map(|i| {
                    let r = self.builder.access_resource(*i)?;
                    (r.kind == ResourceType::Attachment).then_some((*i, Some(LoadOp::Load)))
                }))
                .filter_map(|(h, load)| {
                    let (_, info) = self.resolved_texture(h)?;
                    Some((h, load.unwrap_or(info.load_op)))
                })
                .collect();

            let mut render_pass = RenderPassOutput::default();
            let mut framebuffer = Framebuffer::default();
            let mut extents = Vec::new();
            for (resource, load) in attachments {
                let Some((name, info)) = self.resolved_texture(resource) else { continue };
                let canonical = self.builder.access_resource(resource).and_then(|r| r.output);
                let Some(canonical) = canonical else { continue };
                let extent = if name == self.presentation_target {
                    swapchain
                } else {
                    info.extent
                };
                if extent != UVec2::ZERO && !extents.contains(&extent) {
                    extents.push(extent);
                }
                if info.format.is_depth_stencil_format() {
                    if framebuffer.depth.is_some() {
                        return Err(GraphError::InvalidResource {
                            resource: name.to_string(),
                            reason: format!("node '{node_name}' has more than one depth attachment"),
                        });
                    }
                    render_pass.depth = Some((info.format, load));
                    framebuffer.depth = Some(DepthTarget {
                        resource: canonical,
                        load,
                        clear_depth: info.clear_depth,
                        clear_stencil: info.clear_stencil,
                    });
                } else {
                    render_pass.color.push((info.format, load));
                    framebuffer.colors.push(ColorTarget {
                        resource: canonical,
                        load,
                        clear: info.clear_color,
                    });
                }
            }
            if extents.len() > 1 {
                return Err(GraphError::AttachmentExtentMismatch {
                    node: node_name,
                    extents,
                });
            }
            framebuffer.extent = extents.first().copied().unwrap_or(swapchain);

            if let Some(node) = self.builder.access_node_mut(handle) {
                node.render_pass = Some(render_pass);
                node.framebuffer = Some(framebuffer);
            }
        }
        Ok(())
    }

    /// Frees every texture and buffer the graph allocated.
    pub(crate) fn release_owned(&mut self, device: &dyn GpuDevice) {
        for texture in self.owned_textures.drain(..) {
            device.destroy_texture(texture);
        }
        for buffer in self.owned_buffers.drain(..) {
            device.destroy_buffer(buffer);
        }
        for (_, resource) in self.builder.resources_mut() {
            if resource.external {
                continue;
            }
            match &mut resource.info {
                ResourceInfo::Texture(info) => info.texture = None,
                ResourceInfo::Buffer(info) => info.buffer = None,
                ResourceInfo::Unresolved => {}
            }
        }
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        self.release_owned(device);
        self.builder.unregister_all_render_passes();
        self.compiled = false;
    }
}
