use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use glam::UVec2;

use super::{
    mipmap::MipBlitter, supports_mip_generation, BufferCreation, BufferId, Command, CommandBuffer, DeviceError, FenceId, GpuDevice, LoadOp,
    PipelineCreation, PipelineId, QueueType, SamplerCreation, SamplerId, ShaderStage,
    TextureCreation, TextureId, _Buffer, _Fence, _Pipeline, _Sampler, _Texture,
};
use crate::core::ResourcePool;

struct WgpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

struct WgpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    creation: TextureCreation,
}

enum WgpuPipeline {
    Render(wgpu::RenderPipeline),
    Compute(wgpu::ComputePipeline),
}

struct WgpuFence {
    signaled: Arc<AtomicBool>,
}

struct WgpuResources {
    buffers: ResourcePool<WgpuBuffer, _Buffer>,
    textures: ResourcePool<WgpuTexture, _Texture>,
    samplers: ResourcePool<wgpu::Sampler, _Sampler>,
    pipelines: ResourcePool<WgpuPipeline, _Pipeline>,
    fences: ResourcePool<WgpuFence, _Fence>,
    swapchain: TextureId,
}

/// wgpu backend rendering into an offscreen presentation image. Window
/// surfaces are owned by the embedding application.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    swapchain_format: wgpu::TextureFormat,
    resources: Mutex<WgpuResources>,
    mips: Mutex<MipBlitter>,
}

impl WgpuDevice {
    pub fn new_offscreen(extent: UVec2) -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .map_err(|e| DeviceError::Adapter(e.to_string()))?;
        log::info!("Using adapter {:?}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("render-core"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| DeviceError::Adapter(e.to_string()))?;

        let swapchain_format = wgpu::TextureFormat::Bgra8Unorm;
        let mut textures = ResourcePool::new("wgpu textures", 1024);
        let swapchain = textures.obtain(create_wgpu_texture(
            &device,
            swapchain_creation(extent, swapchain_format),
        ))?;

        let mips = Mutex::new(MipBlitter::new(&device));
        Ok(Self {
            device,
            queue,
            swapchain_format,
            mips,
            resources: Mutex::new(WgpuResources {
                buffers: ResourcePool::new("wgpu buffers", 4096),
                textures,
                samplers: ResourcePool::new("wgpu samplers", 64),
                pipelines: ResourcePool::new("wgpu pipelines", 256),
                fences: ResourcePool::new("wgpu fences", 16),
                swapchain,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, WgpuResources> {
        self.resources.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_shader_module(&self, name: &str, source: &str) -> Result<wgpu::ShaderModule, DeviceError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(DeviceError::Shader {
                name: name.to_string(),
                message: error.to_string(),
            });
        }
        Ok(module)
    }

    fn build_pipeline(&self, creation: &PipelineCreation) -> Result<WgpuPipeline, DeviceError> {
        let mut vertex = None;
        let mut fragment = None;
        let mut compute = None;
        for stage in &creation.stages {
            let module = match stage.stage {
                ShaderStage::Mesh | ShaderStage::Task => {
                    return Err(DeviceError::Unsupported(format!(
                        "{} shader stage in '{}'",
                        stage.stage.as_str(),
                        creation.name
                    )))
                }
                _ => self.create_shader_module(&stage.name, &stage.source)?,
            };
            match stage.stage {
                ShaderStage::Vertex => vertex = Some(module),
                ShaderStage::Fragment => fragment = Some(module),
                _ => compute = Some(module),
            }
        }

        if let Some(module) = compute {
            let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&creation.name),
                layout: None,
                module: &module,
                entry_point: None,
                compilation_options: Default::default(),
                cache: None,
            });
            return Ok(WgpuPipeline::Compute(pipeline));
        }

        let vertex = vertex.ok_or_else(|| DeviceError::Shader {
            name: creation.name.clone(),
            message: "graphics pipeline without a vertex stage".to_string(),
        })?;

        let targets: Vec<Option<wgpu::ColorTargetState>> = creation
            .render_pass
            .color
            .iter()
            .enumerate()
            .map(|(i, (format, _))| {
                let blend = creation.blend.get(i).filter(|b| b.enable).map(|b| {
                    let component = wgpu::BlendComponent {
                        src_factor: b.src_colour.into(),
                        dst_factor: b.dst_colour.into(),
                        operation: b.op.into(),
                    };
                    wgpu::BlendState {
                        color: component,
                        alpha: component,
                    }
                });
                Some(wgpu::ColorTargetState {
                    format: *format,
                    blend,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let depth_stencil = creation
            .render_pass
            .depth
            .map(|(format, _)| wgpu::DepthStencilState {
                format,
                depth_write_enabled: creation.depth.write,
                depth_compare: creation
                    .depth
                    .test
                    .map(Into::into)
                    .unwrap_or(wgpu::CompareFunction::Always),
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            });

        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&creation.name),
            layout: None,
            vertex: wgpu::VertexState {
                module: &vertex,
                entry_point: None,
                compilation_options: Default::default(),
                buffers: &[],
            },
            primitive: wgpu::PrimitiveState {
                topology: creation.topology.into(),
                cull_mode: creation.cull.to_wgpu(),
                ..Default::default()
            },
            depth_stencil,
            multisample: wgpu::MultisampleState::default(),
            fragment: fragment.as_ref().map(|module| wgpu::FragmentState {
                module,
                entry_point: None,
                compilation_options: Default::default(),
                targets: &targets,
            }),
            multiview: None,
            cache: None,
        });
        Ok(WgpuPipeline::Render(pipeline))
    }
}

fn swapchain_creation(extent: UVec2, format: wgpu::TextureFormat) -> TextureCreation {
    TextureCreation {
        name: "swapchain".to_string(),
        extent,
        mip_levels: 1,
        array_layers: 1,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::TEXTURE_BINDING,
    }
}

fn create_wgpu_texture(device: &wgpu::Device, creation: TextureCreation) -> WgpuTexture {
    let mut usage = creation.usage;
    if creation.mip_levels > 1 && supports_mip_generation(creation.format) {
        usage |= wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
    }
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(&creation.name),
        size: wgpu::Extent3d {
            width: creation.extent.x,
            height: creation.extent.y,
            depth_or_array_layers: creation.array_layers,
        },
        mip_level_count: creation.mip_levels,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: creation.format,
        usage,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    WgpuTexture {
        texture,
        view,
        creation,
    }
}

fn to_color_load(op: LoadOp, clear: glam::Vec4) -> wgpu::LoadOp<wgpu::Color> {
    match op {
        LoadOp::Clear | LoadOp::DontCare => wgpu::LoadOp::Clear(wgpu::Color {
            r: clear.x as f64,
            g: clear.y as f64,
            b: clear.z as f64,
            a: clear.w as f64,
        }),
        LoadOp::Load => wgpu::LoadOp::Load,
    }
}

/// Records a flat command list, opening a wgpu pass for every
/// BeginRenderPass..EndRenderPass range.
fn record(
    device: &wgpu::Device,
    encoder: &mut wgpu::CommandEncoder,
    res: &WgpuResources,
    mips: &mut MipBlitter,
    commands: &[&Command],
) -> Result<(), DeviceError> {
    let mut compute_pipeline: Option<PipelineId> = None;
    // Viewport and scissor recorded ahead of a pass apply once it begins.
    let mut viewport: Option<(UVec2, UVec2)> = None;
    let mut scissor: Option<(UVec2, UVec2)> = None;
    let mut i = 0;
    while i < commands.len() {
        match commands[i] {
            Command::PushMarker(name) => encoder.push_debug_group(name),
            Command::PopMarker => encoder.pop_debug_group(),
            Command::BindPipeline(pipeline) => compute_pipeline = Some(*pipeline),
            Command::Dispatch { groups } => {
                let Some(WgpuPipeline::Compute(pipeline)) =
                    compute_pipeline.and_then(|p| res.pipelines.access(p))
                else {
                    log::error!("Dispatch without a bound compute pipeline");
                    i += 1;
                    continue;
                };
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: None,
                    timestamp_writes: None,
                });
                pass.set_pipeline(pipeline);
                pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
            }
            Command::CopyBufferToBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let src = res.buffers.access(*src).ok_or(DeviceError::InvalidHandle("buffer"))?;
                let dst = res.buffers.access(*dst).ok_or(DeviceError::InvalidHandle("buffer"))?;
                encoder.copy_buffer_to_buffer(&src.buffer, *src_offset, &dst.buffer, *dst_offset, *size);
            }
            Command::CopyBufferToTexture {
                src,
                src_offset,
                bytes_per_row,
                rows_per_image,
                dst,
                mip_level,
                array_layer,
                extent,
            } => {
                let src = res.buffers.access(*src).ok_or(DeviceError::InvalidHandle("buffer"))?;
                let dst = res.textures.access(*dst).ok_or(DeviceError::InvalidHandle("texture"))?;
                encoder.copy_buffer_to_texture(
                    wgpu::TexelCopyBufferInfo {
                        buffer: &src.buffer,
                        layout: wgpu::TexelCopyBufferLayout {
                            offset: *src_offset,
                            bytes_per_row: Some(*bytes_per_row),
                            rows_per_image: Some(*rows_per_image),
                        },
                    },
                    wgpu::TexelCopyTextureInfo {
                        texture: &dst.texture,
                        mip_level: *mip_level,
                        origin: wgpu::Origin3d {
                            x: 0,
                            y: 0,
                            z: *array_layer,
                        },
                        aspect: wgpu::TextureAspect::All,
                    },
                    wgpu::Extent3d {
                        width: extent.x,
                        height: extent.y,
                        depth_or_array_layers: 1,
                    },
                );
            }
            Command::GenerateMipmaps(texture) => {
                let target = res.textures.access(*texture).ok_or(DeviceError::InvalidHandle("texture"))?;
                let creation = &target.creation;
                if !supports_mip_generation(creation.format) {
                    return Err(DeviceError::Unsupported(format!(
                        "mip generation for {:?} in '{}'",
                        creation.format, creation.name
                    )));
                }
                mips.generate(
                    device,
                    encoder,
                    &target.texture,
                    creation.format,
                    creation.mip_levels,
                    creation.array_layers,
                );
            }
            Command::BeginRenderPass { label, colors, depth } => {
                let end = commands[i..]
                    .iter()
                    .position(|c| matches!(c, Command::EndRenderPass))
                    .map(|p| i + p)
                    .unwrap_or(commands.len());

                let mut color_attachments = Vec::with_capacity(colors.len());
                for color in colors {
                    let target = res
                        .textures
                        .access(color.texture)
                        .ok_or(DeviceError::InvalidHandle("texture"))?;
                    color_attachments.push(Some(wgpu::RenderPassColorAttachment {
                        view: &target.view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: to_color_load(color.load, color.clear),
                            store: wgpu::StoreOp::Store,
                        },
                    }));
                }
                let depth_attachment = match depth {
                    Some(depth) => {
                        let target = res
                            .textures
                            .access(depth.texture)
                            .ok_or(DeviceError::InvalidHandle("texture"))?;
                        let load = match depth.load {
                            LoadOp::Load => wgpu::LoadOp::Load,
                            _ => wgpu::LoadOp::Clear(depth.clear_depth),
                        };
                        let stencil_ops = target.creation.format.has_stencil_aspect().then(|| {
                            wgpu::Operations {
                                load: match depth.load {
                                    LoadOp::Load => wgpu::LoadOp::Load,
                                    _ => wgpu::LoadOp::Clear(depth.clear_stencil),
                                },
                                store: wgpu::StoreOp::Store,
                            }
                        });
                        Some(wgpu::RenderPassDepthStencilAttachment {
                            view: &target.view,
                            depth_ops: Some(wgpu::Operations {
                                load,
                                store: wgpu::StoreOp::Store,
                            }),
                            stencil_ops,
                        })
                    }
                    None => None,
                };

                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some(label),
                    color_attachments: &color_attachments,
                    depth_stencil_attachment: depth_attachment,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                if let Some((origin, extent)) = viewport.take() {
                    pass.set_viewport(origin.x as f32, origin.y as f32, extent.x as f32, extent.y as f32, 0.0, 1.0);
                }
                if let Some((origin, extent)) = scissor.take() {
                    pass.set_scissor_rect(origin.x, origin.y, extent.x, extent.y);
                }
                for command in &commands[i + 1..end] {
                    match command {
                        Command::PushMarker(name) => pass.push_debug_group(name),
                        Command::PopMarker => pass.pop_debug_group(),
                        Command::SetViewport { origin, extent } => pass.set_viewport(
                            origin.x as f32,
                            origin.y as f32,
                            extent.x as f32,
                            extent.y as f32,
                            0.0,
                            1.0,
                        ),
                        Command::SetScissor { origin, extent } => {
                            pass.set_scissor_rect(origin.x, origin.y, extent.x, extent.y)
                        }
                        Command::BindPipeline(pipeline) => match res.pipelines.access(*pipeline) {
                            Some(WgpuPipeline::Render(p)) => pass.set_pipeline(p),
                            _ => log::error!("Pipeline {pipeline:?} is not a render pipeline"),
                        },
                        Command::Draw { vertices, instances } => {
                            pass.draw(0..*vertices, 0..*instances)
                        }
                        Command::Barrier { .. } => {}
                        other => log::warn!("Command {other:?} is not valid inside a render pass"),
                    }
                }
                i = end;
            }
            Command::SetViewport { origin, extent } => viewport = Some((*origin, *extent)),
            Command::SetScissor { origin, extent } => scissor = Some((*origin, *extent)),
            // wgpu tracks resource states itself
            Command::Barrier { .. }
            | Command::EndRenderPass
            | Command::Draw { .. }
            | Command::ExecuteSecondary(_) => {}
        }
        i += 1;
    }
    Ok(())
}

impl GpuDevice for WgpuDevice {
    fn create_buffer(&self, creation: &BufferCreation) -> Result<BufferId, DeviceError> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&creation.name),
            size: creation.size,
            usage: creation.usage | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Ok(self.lock().buffers.obtain(WgpuBuffer {
            buffer,
            size: creation.size,
        })?)
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        if let Some(b) = self.lock().buffers.release(buffer) {
            b.buffer.destroy();
        }
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let res = self.lock();
        let b = res.buffers.access(buffer).ok_or(DeviceError::InvalidHandle("buffer"))?;
        if offset + data.len() as u64 > b.size {
            return Err(DeviceError::OutOfBounds(format!(
                "write of {} bytes at {offset} into a {} byte buffer",
                data.len(),
                b.size
            )));
        }
        self.queue.write_buffer(&b.buffer, offset, data);
        Ok(())
    }

    fn buffer_size(&self, buffer: BufferId) -> Option<u64> {
        self.lock().buffers.access(buffer).map(|b| b.size)
    }

    fn create_texture(&self, creation: &TextureCreation) -> Result<TextureId, DeviceError> {
        let texture = create_wgpu_texture(&self.device, creation.clone());
        Ok(self.lock().textures.obtain(texture)?)
    }

    fn destroy_texture(&self, texture: TextureId) {
        let mut res = self.lock();
        if texture == res.swapchain {
            log::warn!("Attempted to destroy the swapchain image");
            return;
        }
        if let Some(t) = res.textures.release(texture) {
            t.texture.destroy();
        }
    }

    fn texture_extent(&self, texture: TextureId) -> Option<UVec2> {
        self.lock().textures.access(texture).map(|t| t.creation.extent)
    }

    fn create_sampler(&self, creation: &SamplerCreation) -> Result<SamplerId, DeviceError> {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(&creation.name),
            address_mode_u: creation.address_mode,
            address_mode_v: creation.address_mode,
            address_mode_w: creation.address_mode,
            mag_filter: creation.mag_filter,
            min_filter: creation.min_filter,
            mipmap_filter: creation.mipmap_filter,
            ..Default::default()
        });
        Ok(self.lock().samplers.obtain(sampler)?)
    }

    fn destroy_sampler(&self, sampler: SamplerId) {
        self.lock().samplers.release(sampler);
    }

    fn create_pipeline(&self, creation: &PipelineCreation) -> Result<PipelineId, DeviceError> {
        let pipeline = self.build_pipeline(creation)?;
        Ok(self.lock().pipelines.obtain(pipeline)?)
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        self.lock().pipelines.release(pipeline);
    }

    fn create_fence(&self) -> Result<FenceId, DeviceError> {
        Ok(self.lock().fences.obtain(WgpuFence {
            signaled: Arc::new(AtomicBool::new(false)),
        })?)
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.lock().fences.release(fence);
    }

    fn fence_signaled(&self, fence: FenceId) -> bool {
        let _ = self.device.poll(wgpu::PollType::Poll);
        self.lock()
            .fences
            .access(fence)
            .map(|f| f.signaled.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn reset_fence(&self, fence: FenceId) {
        if let Some(f) = self.lock().fences.access(fence) {
            f.signaled.store(false, Ordering::Release);
        }
    }

    fn submit(
        &self,
        queue: QueueType,
        commands: CommandBuffer,
        fence: Option<FenceId>,
    ) -> Result<(), DeviceError> {
        let res = self.lock();
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(commands.label()),
        });
        let mut mips = self.mips.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        record(&self.device, &mut encoder, &res, &mut mips, &commands.flattened())?;

        let signal = match fence {
            Some(fence) => {
                let f = res.fences.access(fence).ok_or(DeviceError::InvalidHandle("fence"))?;
                f.signaled.store(false, Ordering::Release);
                Some(f.signaled.clone())
            }
            None => None,
        };
        // wgpu exposes a single hardware queue
        log::trace!("Submitting '{}' on {queue:?}", commands.label());
        self.queue.submit(Some(encoder.finish()));
        if let Some(signal) = signal {
            self.queue
                .on_submitted_work_done(move || signal.store(true, Ordering::Release));
        }
        Ok(())
    }

    fn wait_idle(&self) {
        if let Err(e) = self.device.poll(wgpu::PollType::Wait) {
            log::error!("Device poll failed: {e}");
        }
    }

    fn swapchain_extent(&self) -> UVec2 {
        let res = self.lock();
        res.textures
            .access(res.swapchain)
            .map(|t| t.creation.extent)
            .unwrap_or(UVec2::ZERO)
    }

    fn swapchain_format(&self) -> wgpu::TextureFormat {
        self.swapchain_format
    }

    fn swapchain_texture(&self) -> TextureId {
        self.lock().swapchain
    }

    fn resize_swapchain(&self, extent: UVec2) -> Result<(), DeviceError> {
        let mut res = self.lock();
        let old = res.swapchain;
        if let Some(t) = res.textures.release(old) {
            t.texture.destroy();
        }
        res.swapchain = res.textures.obtain(create_wgpu_texture(
            &self.device,
            swapchain_creation(extent, self.swapchain_format),
        ))?;
        Ok(())
    }
}
