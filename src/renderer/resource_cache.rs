use std::{collections::HashMap, path::PathBuf, sync::Arc};

use crossbeam_queue::SegQueue;
use thiserror::Error;

use crate::{
    config::PoolConfig,
    core::{HandleId, PoolError, ResourcePool},
    gpu::{
        supports_mip_generation, BufferCreation, BufferId, CommandBuffer, DeviceError, GpuDevice,
        PipelineCreation, PipelineId, ResourceState, SamplerCreation, SamplerId, TextureCreation,
        TextureId,
    },
    loader::{BufferTarget, ReadyFlag, TextureTarget, TextureUpdate},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Texture,
    Buffer,
    Sampler,
    Technique,
    Material,
}

pub struct _Texture;
pub struct _Buffer;
pub struct _Sampler;
pub struct _Technique;
pub struct _Material;

pub type TextureHandle = HandleId<_Texture>;
pub type BufferHandle = HandleId<_Buffer>;
pub type SamplerHandle = HandleId<_Sampler>;
pub type TechniqueHandle = HandleId<_Technique>;
pub type MaterialHandle = HandleId<_Material>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("unknown {0:?} handle")]
    InvalidHandle(ResourceKind),
}

#[derive(Debug)]
pub struct TextureResource {
    pub name: String,
    pub texture: TextureId,
    pub creation: TextureCreation,
    pub ready: ReadyFlag,
    pub ref_count: u32,
}

#[derive(Debug)]
pub struct BufferResource {
    pub name: String,
    pub buffer: BufferId,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
    pub ready: ReadyFlag,
    pub ref_count: u32,
}

#[derive(Debug)]
pub struct SamplerResource {
    pub name: String,
    pub sampler: SamplerId,
    pub ref_count: u32,
}

/// One pipeline of a technique and the graph node it renders into.
#[derive(Debug, Clone)]
pub struct TechniquePass {
    pub name: String,
    pub render_pass: String,
    pub pipeline: PipelineId,
    pub creation: PipelineCreation,
}

#[derive(Debug, Clone)]
pub struct TechniquePassCreation {
    pub name: String,
    pub render_pass: String,
    pub pipeline: PipelineCreation,
}

#[derive(Debug, Clone)]
pub struct TechniqueCreation {
    pub name: String,
    /// JSON file the technique was loaded from, used for hot reload.
    pub source: Option<PathBuf>,
    pub passes: Vec<TechniquePassCreation>,
}

#[derive(Debug)]
pub struct Technique {
    pub name: String,
    pub source: Option<PathBuf>,
    pub passes: Vec<TechniquePass>,
    pass_index: HashMap<String, usize>,
    pub ref_count: u32,
}

impl Technique {
    pub fn pass(&self, name: &str) -> Option<&TechniquePass> {
        self.pass_index.get(name).map(|i| &self.passes[*i])
    }

    pub fn pass_for_node(&self, node: &str) -> Option<&TechniquePass> {
        self.passes.iter().find(|p| p.render_pass == node)
    }
}

#[derive(Debug, Clone)]
pub struct MaterialCreation {
    pub name: String,
    pub technique: TechniqueHandle,
    pub textures: Vec<TextureHandle>,
    pub render_index: u32,
}

#[derive(Debug)]
pub struct Material {
    pub name: String,
    pub technique: TechniqueHandle,
    pub textures: Vec<TextureHandle>,
    pub render_index: u32,
    pub ref_count: u32,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TeardownReport {
    pub destroyed: usize,
    /// Entries that still had references when the cache was torn down.
    pub leaked: Vec<(ResourceKind, String)>,
}

/// Name-keyed, reference-counted GPU objects shared between passes.
pub struct RendererResourceCache {
    device: Arc<dyn GpuDevice>,
    textures: ResourcePool<TextureResource, _Texture>,
    buffers: ResourcePool<BufferResource, _Buffer>,
    samplers: ResourcePool<SamplerResource, _Sampler>,
    techniques: ResourcePool<Technique, _Technique>,
    materials: ResourcePool<Material, _Material>,
    texture_names: HashMap<String, TextureHandle>,
    buffer_names: HashMap<String, BufferHandle>,
    sampler_names: HashMap<String, SamplerHandle>,
    technique_names: HashMap<String, TechniqueHandle>,
    material_names: HashMap<String, MaterialHandle>,
    texture_updates: Arc<SegQueue<TextureUpdate>>,
}

fn add_name<H: Copy>(names: &mut HashMap<String, H>, name: &str, handle: H) {
    if !name.is_empty() {
        names.insert(name.to_string(), handle);
    }
}

impl RendererResourceCache {
    pub fn new(device: Arc<dyn GpuDevice>, pools: &PoolConfig) -> Self {
        Self {
            device,
            textures: ResourcePool::new("textures", pools.textures),
            buffers: ResourcePool::new("buffers", pools.buffers),
            samplers: ResourcePool::new("samplers", pools.samplers),
            techniques: ResourcePool::new("techniques", pools.techniques),
            materials: ResourcePool::new("materials", pools.materials),
            texture_names: HashMap::new(),
            buffer_names: HashMap::new(),
            sampler_names: HashMap::new(),
            technique_names: HashMap::new(),
            material_names: HashMap::new(),
            texture_updates: Arc::new(SegQueue::new()),
        }
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    /// Queue the async loader pushes finished textures into.
    pub fn texture_updates(&self) -> Arc<SegQueue<TextureUpdate>> {
        self.texture_updates.clone()
    }

    // Textures

    pub fn create_texture(&mut self, creation: &TextureCreation) -> Result<TextureHandle, CacheError> {
        if let Some(handle) = self.texture_names.get(&creation.name).copied() {
            self.add_texture_ref(handle)?;
            return Ok(handle);
        }
        let texture = self.device.create_texture(creation)?;
        let handle = match self.textures.obtain(TextureResource {
            name: creation.name.clone(),
            texture,
            creation: creation.clone(),
            ready: ReadyFlag::new(true),
            ref_count: 1,
        }) {
            Ok(handle) => handle,
            Err(e) => {
                self.device.destroy_texture(texture);
                return Err(e.into());
            }
        };
        add_name(&mut self.texture_names, &creation.name, handle);
        Ok(handle)
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&TextureResource> {
        self.textures.access(handle)
    }

    pub fn texture_by_name(&self, name: &str) -> Option<TextureHandle> {
        self.texture_names.get(name).copied()
    }

    pub fn add_texture_ref(&mut self, handle: TextureHandle) -> Result<u32, CacheError> {
        let texture = self
            .textures
            .access_mut(handle)
            .ok_or(CacheError::InvalidHandle(ResourceKind::Texture))?;
        texture.ref_count += 1;
        Ok(texture.ref_count)
    }

    /// Drops one reference; the GPU texture goes away with the last one.
    /// Returns the references left.
    pub fn destroy_texture(&mut self, handle: TextureHandle) -> Result<u32, CacheError> {
        let texture = self
            .textures
            .access_mut(handle)
            .ok_or(CacheError::InvalidHandle(ResourceKind::Texture))?;
        texture.ref_count = texture.ref_count.saturating_sub(1);
        if texture.ref_count > 0 {
            return Ok(texture.ref_count);
        }
        if let Some(texture) = self.textures.release(handle) {
            self.device.destroy_texture(texture.texture);
            if self.texture_names.get(&texture.name) == Some(&handle) {
                self.texture_names.remove(&texture.name);
            }
            log::trace!("Destroyed texture '{}'", texture.name);
        }
        Ok(0)
    }

    /// Destination description for `AsyncLoader::request_texture_data`.
    pub fn texture_target(&self, handle: TextureHandle) -> Option<TextureTarget> {
        let texture = self.textures.access(handle)?;
        Some(TextureTarget {
            handle,
            texture: texture.texture,
            extent: texture.creation.extent,
            format: texture.creation.format,
            mip_levels: texture.creation.mip_levels,
            array_layers: texture.creation.array_layers,
            ready: texture.ready.clone(),
        })
    }

    /// Finishes textures the loader uploaded: transitions them for sampling,
    /// builds the mips the upload did not carry, then publishes them as ready.
    pub fn process_texture_updates(&mut self, cmd: &mut CommandBuffer) -> usize {
        let mut processed = 0;
        while let Some(update) = self.texture_updates.pop() {
            let Some(texture) = self.textures.access(update.texture) else {
                log::warn!("Uploaded texture {:?} was destroyed before it became ready", update.texture);
                continue;
            };
            cmd.barrier(texture.texture, ResourceState::ShaderResource);
            if texture.creation.mip_levels > update.uploaded_mips {
                if supports_mip_generation(texture.creation.format) {
                    cmd.generate_mipmaps(texture.texture);
                } else {
                    log::warn!(
                        "Texture '{}' got {} of {} mips and {:?} cannot be filtered",
                        texture.name,
                        update.uploaded_mips,
                        texture.creation.mip_levels,
                        texture.creation.format
                    );
                }
            }
            texture.ready.set_ready();
            log::debug!("Texture '{}' ready", texture.name);
            processed += 1;
        }
        processed
    }

    // Buffers

    pub fn create_buffer(&mut self, creation: &BufferCreation) -> Result<BufferHandle, CacheError> {
        if let Some(handle) = self.buffer_names.get(&creation.name).copied() {
            self.add_buffer_ref(handle)?;
            return Ok(handle);
        }
        let buffer = self.device.create_buffer(creation)?;
        let handle = match self.buffers.obtain(BufferResource {
            name: creation.name.clone(),
            buffer,
            size: creation.size,
            usage: creation.usage,
            ready: ReadyFlag::new(true),
            ref_count: 1,
        }) {
            Ok(handle) => handle,
            Err(e) => {
                self.device.destroy_buffer(buffer);
                return Err(e.into());
            }
        };
        add_name(&mut self.buffer_names, &creation.name, handle);
        Ok(handle)
    }

    pub fn buffer(&self, handle: BufferHandle) -> Option<&BufferResource> {
        self.buffers.access(handle)
    }

    pub fn buffer_by_name(&self, name: &str) -> Option<BufferHandle> {
        self.buffer_names.get(name).copied()
    }

    pub fn add_buffer_ref(&mut self, handle: BufferHandle) -> Result<u32, CacheError> {
        let buffer = self
            .buffers
            .access_mut(handle)
            .ok_or(CacheError::InvalidHandle(ResourceKind::Buffer))?;
        buffer.ref_count += 1;
        Ok(buffer.ref_count)
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle) -> Result<u32, CacheError> {
        let buffer = self
            .buffers
            .access_mut(handle)
            .ok_or(CacheError::InvalidHandle(ResourceKind::Buffer))?;
        buffer.ref_count = buffer.ref_count.saturating_sub(1);
        if buffer.ref_count > 0 {
            return Ok(buffer.ref_count);
        }
        if let Some(buffer) = self.buffers.release(handle) {
            self.device.destroy_buffer(buffer.buffer);
            if self.buffer_names.get(&buffer.name) == Some(&handle) {
                self.buffer_names.remove(&buffer.name);
            }
            log::trace!("Destroyed buffer '{}'", buffer.name);
        }
        Ok(0)
    }

    pub fn buffer_target(&self, handle: BufferHandle) -> Option<BufferTarget> {
        let buffer = self.buffers.access(handle)?;
        Some(BufferTarget {
            buffer: buffer.buffer,
            size: buffer.size,
            ready: buffer.ready.clone(),
        })
    }

    /// Swaps in a fresh device buffer of `new_size` and hands back the old
    /// one with its size. The caller owns the old buffer from here on,
    /// normally by passing it to `request_buffer_reallocate_and_copy`.
    pub fn reallocate_buffer(&mut self, handle: BufferHandle, new_size: u64) -> Result<(BufferId, u64), CacheError> {
        let buffer = self
            .buffers
            .access_mut(handle)
            .ok_or(CacheError::InvalidHandle(ResourceKind::Buffer))?;
        let replacement = self.device.create_buffer(&BufferCreation {
            name: buffer.name.clone(),
            size: new_size,
            usage: buffer.usage,
        })?;
        let old = (buffer.buffer, buffer.size);
        buffer.buffer = replacement;
        buffer.size = new_size;
        log::debug!("Reallocated buffer '{}' {} -> {new_size} bytes", buffer.name, old.1);
        Ok(old)
    }

    // Samplers

    pub fn create_sampler(&mut self, creation: &SamplerCreation) -> Result<SamplerHandle, CacheError> {
        if let Some(handle) = self.sampler_names.get(&creation.name).copied() {
            self.add_sampler_ref(handle)?;
            return Ok(handle);
        }
        let sampler = self.device.create_sampler(creation)?;
        let handle = match self.samplers.obtain(SamplerResource {
            name: creation.name.clone(),
            sampler,
            ref_count: 1,
        }) {
            Ok(handle) => handle,
            Err(e) => {
                self.device.destroy_sampler(sampler);
                return Err(e.into());
            }
        };
        add_name(&mut self.sampler_names, &creation.name, handle);
        Ok(handle)
    }

    pub fn sampler(&self, handle: SamplerHandle) -> Option<&SamplerResource> {
        self.samplers.access(handle)
    }

    pub fn add_sampler_ref(&mut self, handle: SamplerHandle) -> Result<u32, CacheError> {
        let sampler = self
            .samplers
            .access_mut(handle)
            .ok_or(CacheError::InvalidHandle(ResourceKind::Sampler))?;
        sampler.ref_count += 1;
        Ok(sampler.ref_count)
    }

    pub fn destroy_sampler(&mut self, handle: SamplerHandle) -> Result<u32, CacheError> {
        let sampler = self
            .samplers
            .access_mut(handle)
            .ok_or(CacheError::InvalidHandle(ResourceKind::Sampler))?;
        sampler.ref_count = sampler.ref_count.saturating_sub(1);
        if sampler.ref_count > 0 {
            return Ok(sampler.ref_count);
        }
        if let Some(sampler) = self.samplers.release(handle) {
            self.device.destroy_sampler(sampler.sampler);
            if self.sampler_names.get(&sampler.name) == Some(&handle) {
                self.sampler_names.remove(&sampler.name);
            }
        }
        Ok(0)
    }

    // Techniques

    fn create_pipelines(&self, creation: &TechniqueCreation) -> Result<Vec<TechniquePass>, CacheError> {
        let mut passes: Vec<TechniquePass> = Vec::with_capacity(creation.passes.len());
        for pass in &creation.passes {
            match self.device.create_pipeline(&pass.pipeline) {
                Ok(pipeline) => passes.push(TechniquePass {
                    name: pass.name.clone(),
                    render_pass: pass.render_pass.clone(),
                    pipeline,
                    creation: pass.pipeline.clone(),
                }),
                Err(e) => {
                    for created in passes {
                        self.device.destroy_pipeline(created.pipeline);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(passes)
    }

    pub fn create_technique(&mut self, creation: &TechniqueCreation) -> Result<TechniqueHandle, CacheError> {
        if let Some(handle) = self.technique_names.get(&creation.name).copied() {
            self.add_technique_ref(handle)?;
            return Ok(handle);
        }
        let passes = self.create_pipelines(creation)?;
        let pass_index = passes.iter().enumerate().map(|(i, p)| (p.name.clone(), i)).collect();
        let pipelines: Vec<PipelineId> = passes.iter().map(|p| p.pipeline).collect();
        let handle = match self.techniques.obtain(Technique {
            name: creation.name.clone(),
            source: creation.source.clone(),
            passes,
            pass_index,
            ref_count: 1,
        }) {
            Ok(handle) => handle,
            Err(e) => {
                for pipeline in pipelines {
                    self.device.destroy_pipeline(pipeline);
                }
                return Err(e.into());
            }
        };
        add_name(&mut self.technique_names, &creation.name, handle);
        log::info!("Created technique '{}' with {} pipelines", creation.name, creation.passes.len());
        Ok(handle)
    }

    /// Rebuilds a technique's pipelines in place; handles and references
    /// stay valid. On failure the old pipelines are kept.
    pub fn replace_technique(&mut self, handle: TechniqueHandle, creation: &TechniqueCreation) -> Result<(), CacheError> {
        if !self.techniques.contains(handle) {
            return Err(CacheError::InvalidHandle(ResourceKind::Technique));
        }
        let passes = self.create_pipelines(creation)?;
        let Some(technique) = self.techniques.access_mut(handle) else {
            return Err(CacheError::InvalidHandle(ResourceKind::Technique));
        };
        for old in technique.passes.drain(..) {
            self.device.destroy_pipeline(old.pipeline);
        }
        technique.pass_index = passes.iter().enumerate().map(|(i, p)| (p.name.clone(), i)).collect();
        technique.passes = passes;
        technique.source = creation.source.clone().or(technique.source.take());
        log::info!("Reloaded technique '{}'", technique.name);
        Ok(())
    }

    pub fn technique(&self, handle: TechniqueHandle) -> Option<&Technique> {
        self.techniques.access(handle)
    }

    pub fn technique_by_name(&self, name: &str) -> Option<TechniqueHandle> {
        self.technique_names.get(name).copied()
    }

    pub fn techniques(&self) -> impl Iterator<Item = (TechniqueHandle, &Technique)> {
        self.techniques.iter()
    }

    pub fn add_technique_ref(&mut self, handle: TechniqueHandle) -> Result<u32, CacheError> {
        let technique = self
            .techniques
            .access_mut(handle)
            .ok_or(CacheError::InvalidHandle(ResourceKind::Technique))?;
        technique.ref_count += 1;
        Ok(technique.ref_count)
    }

    /// The last reference also destroys every pipeline the technique owns.
    pub fn destroy_technique(&mut self, handle: TechniqueHandle) -> Result<u32, CacheError> {
        let technique = self
            .techniques
            .access_mut(handle)
            .ok_or(CacheError::InvalidHandle(ResourceKind::Technique))?;
        technique.ref_count = technique.ref_count.saturating_sub(1);
        if technique.ref_count > 0 {
            return Ok(technique.ref_count);
        }
        if let Some(technique) = self.techniques.release(handle) {
            for pass in &technique.passes {
                self.device.destroy_pipeline(pass.pipeline);
            }
            if self.technique_names.get(&technique.name) == Some(&handle) {
                self.technique_names.remove(&technique.name);
            }
            log::debug!("Destroyed technique '{}'", technique.name);
        }
        Ok(0)
    }

    // Materials

    /// A material holds a reference on its technique and textures.
    pub fn create_material(&mut self, creation: &MaterialCreation) -> Result<MaterialHandle, CacheError> {
        if let Some(handle) = self.material_names.get(&creation.name).copied() {
            self.add_material_ref(handle)?;
            return Ok(handle);
        }
        if !self.techniques.contains(creation.technique) {
            return Err(CacheError::InvalidHandle(ResourceKind::Technique));
        }
        if creation.textures.iter().any(|t| !self.textures.contains(*t)) {
            return Err(CacheError::InvalidHandle(ResourceKind::Texture));
        }
        let handle = self.materials.obtain(Material {
            name: creation.name.clone(),
            technique: creation.technique,
            textures: creation.textures.clone(),
            render_index: creation.render_index,
            ref_count: 1,
        })?;
        self.add_technique_ref(creation.technique)?;
        for texture in &creation.textures {
            self.add_texture_ref(*texture)?;
        }
        add_name(&mut self.material_names, &creation.name, handle);
        Ok(handle)
    }

    pub fn material(&self, handle: MaterialHandle) -> Option<&Material> {
        self.materials.access(handle)
    }

    pub fn material_by_name(&self, name: &str) -> Option<MaterialHandle> {
        self.material_names.get(name).copied()
    }

    pub fn add_material_ref(&mut self, handle: MaterialHandle) -> Result<u32, CacheError> {
        let material = self
            .materials
            .access_mut(handle)
            .ok_or(CacheError::InvalidHandle(ResourceKind::Material))?;
        material.ref_count += 1;
        Ok(material.ref_count)
    }

    pub fn destroy_material(&mut self, handle: MaterialHandle) -> Result<u32, CacheError> {
        let material = self
            .materials
            .access_mut(handle)
            .ok_or(CacheError::InvalidHandle(ResourceKind::Material))?;
        material.ref_count = material.ref_count.saturating_sub(1);
        if material.ref_count > 0 {
            return Ok(material.ref_count);
        }
        let Some(material) = self.materials.release(handle) else { return Ok(0) };
        if self.material_names.get(&material.name) == Some(&handle) {
            self.material_names.remove(&material.name);
        }
        // Dependencies may already be gone during teardown.
        let _ = self.destroy_technique(material.technique);
        for texture in material.textures {
            let _ = self.destroy_texture(texture);
        }
        Ok(0)
    }

    pub fn len(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Texture => self.textures.len(),
            ResourceKind::Buffer => self.buffers.len(),
            ResourceKind::Sampler => self.samplers.len(),
            ResourceKind::Technique => self.techniques.len(),
            ResourceKind::Material => self.materials.len(),
        }
    }

    /// Force-destroys everything, materials and techniques before the base
    /// pools they reference. Entries still referenced are logged as leaks.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        for (_, material) in self.materials.free_all() {
            if material.ref_count > 0 {
                report.leaked.push((ResourceKind::Material, material.name));
            }
            report.destroyed += 1;
        }
        for (_, technique) in self.techniques.free_all() {
            for pass in &technique.passes {
                self.device.destroy_pipeline(pass.pipeline);
            }
            if technique.ref_count > 0 {
                report.leaked.push((ResourceKind::Technique, technique.name));
            }
            report.destroyed += 1;
        }
        for (_, buffer) in self.buffers.free_all() {
            self.device.destroy_buffer(buffer.buffer);
            if buffer.ref_count > 0 {
                report.leaked.push((ResourceKind::Buffer, buffer.name));
            }
            report.destroyed += 1;
        }
        for (_, texture) in self.textures.free_all() {
            self.device.destroy_texture(texture.texture);
            if texture.ref_count > 0 {
                report.leaked.push((ResourceKind::Texture, texture.name));
            }
            report.destroyed += 1;
        }
        for (_, sampler) in self.samplers.free_all() {
            self.device.destroy_sampler(sampler.sampler);
            if sampler.ref_count > 0 {
                report.leaked.push((ResourceKind::Sampler, sampler.name));
            }
            report.destroyed += 1;
        }

        self.texture_names.clear();
        self.buffer_names.clear();
        self.sampler_names.clear();
        self.technique_names.clear();
        self.material_names.clear();
        while self.texture_updates.pop().is_some() {}

        for (kind, name) in &report.leaked {
            log::warn!("Leaked {kind:?} '{name}' at renderer teardown");
        }
        log::info!(
            "Renderer cache torn down: {} destroyed, {} leaked",
            report.destroyed,
            report.leaked.len()
        );
        report
    }
}
