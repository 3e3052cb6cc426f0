use std::collections::HashMap;

use glam::UVec2;

use super::{
    compile::texture_creation, BoundResource, Framebuffer, FrameContext, GraphError, NodeHandle,
    NodeType, PassIo, RenderGraph, RenderGraphPass, ResourceHandle, ResourceInfo, ResourceType,
};
use crate::gpu::{
    ColorAttachment, CommandBuffer, DepthAttachment, GpuDevice, RenderPassOutput, ResourceState,
    TextureId,
};

impl RenderGraph {
    /// Records every enabled node in compiled order.
    pub fn render(&mut self, ctx: &mut FrameContext<'_>, cmd: &mut CommandBuffer) -> Result<(), GraphError> {
        if !self.compiled {
            return Err(GraphError::NotCompiled(self.name.clone()));
        }
        self.bind_presentation_target(ctx.device);

        for handle in self.order.clone() {
            let Some(node) = self.builder.access_node(handle) else { continue };
            if !node.enabled {
                continue;
            }
            let (name, kind) = (node.name.clone(), node.kind);
            let framebuffer = node.framebuffer.clone();

            let attachments = match (&framebuffer, kind) {
                (Some(framebuffer), NodeType::Graphics) => match self.attachments(framebuffer) {
                    Some(attachments) => Some(attachments),
                    None => {
                        log::warn!("Skipping node '{name}': an attachment has no texture bound");
                        continue;
                    }
                },
                _ => None,
            };

            cmd.push_marker(&name);
            self.record_barriers(handle, cmd);
            ctx.io = self.pass_io(handle);

            let mut pass = self.builder.access_node_mut(handle).and_then(|n| n.pass.take());
            match kind {
                NodeType::Graphics => {
                    let extent = framebuffer
                        .as_ref()
                        .map(|f| f.extent)
                        .unwrap_or(ctx.swapchain_extent);
                    cmd.set_viewport(UVec2::ZERO, extent);
                    cmd.set_scissor(UVec2::ZERO, extent);
                    if let Some(pass) = pass.as_mut() {
                        pass.pre_render(ctx, cmd);
                    }
                    let (colors, depth) = attachments.unwrap_or_default();
                    cmd.begin_render_pass(&name, colors, depth);
                    if let Some(pass) = pass.as_mut() {
                        pass.render(ctx, cmd);
                    }
                    cmd.end_render_pass();
                    if let Some(pass) = pass.as_mut() {
                        pass.post_render(ctx, cmd);
                    }
                }
                NodeType::Compute => {
                    if let Some(pass) = pass.as_mut() {
                        pass.pre_render(ctx, cmd);
                        pass.render(ctx, cmd);
                        pass.post_render(ctx, cmd);
                    }
                }
            }
            if let Some(node) = self.builder.access_node_mut(handle) {
                node.pass = pass;
            }
            cmd.pop_marker();
        }

        ctx.io = PassIo::default();
        Ok(())
    }

    /// Recreates resize-flagged textures at the new swapchain size, keeping
    /// aliasing intact, then lets the passes react.
    pub fn on_resize(&mut self, ctx: &mut FrameContext<'_>, width: u32, height: u32) -> Result<(), GraphError> {
        if width == 0 || height == 0 {
            log::debug!("Ignoring resize of '{}' to {width}x{height}", self.name);
            return Ok(());
        }
        let swapchain = UVec2::new(width, height);
        let device = ctx.device;

        // Aliased resources share one texture, so recreate once per old id.
        let mut remap: HashMap<TextureId, TextureId> = HashMap::new();
        for (_, resource) in self.builder.resources_mut() {
            if resource.external || resource.kind == ResourceType::Reference {
                continue;
            }
            let ResourceInfo::Texture(info) = &mut resource.info else { continue };
            let Some(old) = info.texture else { continue };
            if !info.resize {
                continue;
            }
            let extent = info.size.resolve(swapchain);
            let texture = match remap.get(&old) {
                Some(texture) => *texture,
                None => {
                    let texture =
                        device.create_texture(&texture_creation(&resource.name, info, info.usage, extent))?;
                    remap.insert(old, texture);
                    texture
                }
            };
            info.texture = Some(texture);
            info.extent = extent;
        }
        for (old, new) in &remap {
            device.destroy_texture(*old);
            if let Some(owned) = self.owned_textures.iter_mut().find(|t| **t == *old) {
                *owned = *new;
            }
        }
        if !remap.is_empty() {
            log::info!("Render graph '{}' recreated {} textures at {swapchain}", self.name, remap.len());
        }

        if let Some(presentation) = self.builder.resource_handle(&self.presentation_target) {
            if let Some(resource) = self.builder.access_resource_mut(presentation) {
                if let ResourceInfo::Texture(info) = &mut resource.info {
                    info.extent = swapchain;
                }
            }
        }

        for handle in self.order.clone() {
            let Some(framebuffer) = self.builder.access_node(handle).and_then(|n| n.framebuffer.clone()) else {
                continue;
            };
            let extent = self.framebuffer_extent(&framebuffer).unwrap_or(swapchain);
            if let Some(fb) = self.builder.access_node_mut(handle).and_then(|n| n.framebuffer.as_mut()) {
                fb.extent = extent;
            }
        }

        for handle in self.order.clone() {
            let enabled = self.builder.access_node(handle).map(|n| n.enabled).unwrap_or(false);
            if !enabled {
                continue;
            }
            ctx.io = self.pass_io(handle);
            self.with_pass(handle, |pass| pass.on_resize(ctx, width, height));
        }
        ctx.io = PassIo::default();
        Ok(())
    }

    /// Lets every registered pass rebuild pipelines after a technique reload.
    pub fn on_techniques_reloaded(&mut self, ctx: &mut FrameContext<'_>) {
        for handle in self.order.clone() {
            ctx.io = self.pass_io(handle);
            self.with_pass(handle, |pass| pass.on_techniques_reloaded(ctx));
        }
        ctx.io = PassIo::default();
    }

    /// Attachment layout of a compiled graphics node.
    pub fn render_pass_output(&self, node: &str) -> Option<RenderPassOutput> {
        self.builder.access_node_by_name(node)?.render_pass.clone()
    }

    fn with_pass(&mut self, handle: NodeHandle, f: impl FnOnce(&mut dyn RenderGraphPass)) {
        let Some(mut pass) = self.builder.access_node_mut(handle).and_then(|n| n.pass.take()) else {
            return;
        };
        f(pass.as_mut());
        if let Some(node) = self.builder.access_node_mut(handle) {
            node.pass = Some(pass);
        }
    }

    fn bind_presentation_target(&mut self, device: &dyn GpuDevice) {
        let Some(handle) = self.builder.resource_handle(&self.presentation_target) else { return };
        let Some(resource) = self.builder.access_resource_mut(handle) else { return };
        if !resource.external {
            return;
        }
        if let ResourceInfo::Texture(info) = &mut resource.info {
            info.texture = Some(device.swapchain_texture());
            info.extent = device.swapchain_extent();
            info.format = device.swapchain_format();
        }
    }

    fn canonical_texture(&self, resource: ResourceHandle) -> Option<TextureId> {
        self.resolved_texture(resource).and_then(|(_, info)| info.texture)
    }

    fn framebuffer_extent(&self, framebuffer: &Framebuffer) -> Option<UVec2> {
        framebuffer
            .colors
            .iter()
            .map(|c| c.resource)
            .chain(framebuffer.depth.as_ref().map(|d| d.resource))
            .filter_map(|r| self.resolved_texture(r))
            .map(|(name, info)| {
                if name == self.presentation_target {
                    UVec2::ZERO
                } else {
                    info.extent
                }
            })
            .find(|e| *e != UVec2::ZERO)
    }

    fn attachments(
        &self,
        framebuffer: &Framebuffer,
    ) -> Option<(Vec<ColorAttachment>, Option<DepthAttachment>)> {
        let mut colors = Vec::with_capacity(framebuffer.colors.len());
        for color in &framebuffer.colors {
            colors.push(ColorAttachment {
                texture: self.canonical_texture(color.resource)?,
                load: color.load,
                clear: color.clear,
            });
        }
        let depth = match &framebuffer.depth {
            Some(depth) => Some(DepthAttachment {
                texture: self.canonical_texture(depth.resource)?,
                load: depth.load,
                clear_depth: depth.clear_depth,
                clear_stencil: depth.clear_stencil,
            }),
            None => None,
        };
        Some((colors, depth))
    }

    fn record_barriers(&self, handle: NodeHandle, cmd: &mut CommandBuffer) {
        let Some(node) = self.builder.access_node(handle) else { return };
        let attachment_state = |format: wgpu::TextureFormat| {
            if format.is_depth_stencil_format() {
                ResourceState::DepthWrite
            } else {
                ResourceState::RenderTarget
            }
        };

        for &input in &node.inputs {
            let Some(resource) = self.builder.access_resource(input) else { continue };
            let Some((_, info)) = self.resolved_texture(input) else { continue };
            let Some(texture) = info.texture else { continue };
            let state = match resource.kind {
                ResourceType::Attachment => attachment_state(info.format),
                _ => ResourceState::ShaderResource,
            };
            cmd.barrier(texture, state);
        }
        for &output in &node.outputs {
            let Some(resource) = self.builder.access_resource(output) else { continue };
            let Some((_, info)) = self.resolved_texture(output) else { continue };
            let Some(texture) = info.texture else { continue };
            let state = match (node.kind, resource.kind) {
                (NodeType::Compute, _) | (_, ResourceType::Texture) => ResourceState::UnorderedAccess,
                _ => attachment_state(info.format),
            };
            cmd.barrier(texture, state);
        }
    }

    fn bound(&self, resource: ResourceHandle) -> Option<BoundResource> {
        let r = self.builder.access_resource(resource)?;
        let canonical = r.output.and_then(|c| self.builder.access_resource(c));
        let (texture, buffer) = match canonical.map(|c| &c.info) {
            Some(ResourceInfo::Texture(info)) => (info.texture, None),
            Some(ResourceInfo::Buffer(info)) => (None, info.buffer),
            _ => (None, None),
        };
        Some(BoundResource {
            name: r.name.clone(),
            kind: r.kind,
            texture,
            buffer,
        })
    }

    fn pass_io(&self, handle: NodeHandle) -> PassIo {
        let Some(node) = self.builder.access_node(handle) else {
            return PassIo::default();
        };
        PassIo {
            node: node.name.clone(),
            inputs: node.inputs.iter().filter_map(|r| self.bound(*r)).collect(),
            outputs: node.outputs.iter().filter_map(|r| self.bound(*r)).collect(),
            extent: node.framebuffer.as_ref().map(|f| f.extent).unwrap_or(UVec2::ZERO),
            render_pass: node.render_pass.clone(),
        }
    }
}
