//! CPU-backed device. Memory lives in host vectors, transfers complete after a
//! configurable number of fence queries and every submission is kept for
//! inspection.

use std::{collections::HashMap, sync::Mutex};

use glam::UVec2;

use super::{
    mip_extent, supports_mip_generation, texel_copy_layout, BufferCreation, BufferId, Command, CommandBuffer,
    DeviceError, FenceId, GpuDevice, PipelineCreation, PipelineId, QueueType, SamplerCreation,
    SamplerId, TextureCreation, TextureId, _Buffer, _Fence, _Pipeline, _Sampler, _Texture,
};
use crate::core::ResourcePool;

const MAX_BUFFERS: usize = 4096;
const MAX_TEXTURES: usize = 1024;
const MAX_SAMPLERS: usize = 64;
const MAX_PIPELINES: usize = 256;
const MAX_FENCES: usize = 16;

#[derive(Debug, Clone)]
pub struct Submission {
    pub queue: QueueType,
    pub label: String,
    pub commands: Vec<Command>,
    pub fenced: bool,
}

struct HeadlessBuffer {
    creation: BufferCreation,
    data: Vec<u8>,
}

struct HeadlessTexture {
    creation: TextureCreation,
    /// Tightly packed texels keyed by (mip, layer).
    subresources: HashMap<(u32, u32), Vec<u8>>,
}

struct PendingWork {
    commands: Vec<Command>,
    polls_left: u32,
}

#[derive(Default)]
struct HeadlessFence {
    signaled: bool,
    pending: Option<PendingWork>,
}

struct HeadlessState {
    buffers: ResourcePool<HeadlessBuffer, _Buffer>,
    textures: ResourcePool<HeadlessTexture, _Texture>,
    samplers: ResourcePool<SamplerCreation, _Sampler>,
    pipelines: ResourcePool<PipelineCreation, _Pipeline>,
    fences: ResourcePool<HeadlessFence, _Fence>,
    swapchain: TextureId,
    swapchain_format: wgpu::TextureFormat,
    /// `None` keeps fenced work pending until `wait_idle`.
    transfer_latency: Option<u32>,
    submissions: Vec<Submission>,
}

pub struct HeadlessDevice {
    state: Mutex<HeadlessState>,
}

impl HeadlessDevice {
    pub fn new(extent: UVec2) -> Self {
        let swapchain_format = wgpu::TextureFormat::Bgra8Unorm;
        let mut textures = ResourcePool::new("headless textures", MAX_TEXTURES);
        let swapchain = textures
            .obtain(HeadlessTexture::new(swapchain_creation(extent, swapchain_format)))
            .unwrap_or_else(|_| TextureId::invalid());
        Self {
            state: Mutex::new(HeadlessState {
                buffers: ResourcePool::new("headless buffers", MAX_BUFFERS),
                textures,
                samplers: ResourcePool::new("headless samplers", MAX_SAMPLERS),
                pipelines: ResourcePool::new("headless pipelines", MAX_PIPELINES),
                fences: ResourcePool::new("headless fences", MAX_FENCES),
                swapchain,
                swapchain_format,
                transfer_latency: Some(0),
                submissions: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of non-blocking fence queries that report "not yet" before
    /// fenced work completes.
    pub fn set_transfer_latency(&self, polls: u32) {
        self.lock().transfer_latency = Some(polls);
    }

    /// Fenced work stays pending until `wait_idle` is called.
    pub fn stall_transfers(&self) {
        self.lock().transfer_latency = None;
    }

    pub fn buffer_contents(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.lock().buffers.access(buffer).map(|b| b.data.clone())
    }

    pub fn texture_contents(&self, texture: TextureId, mip: u32, layer: u32) -> Option<Vec<u8>> {
        self.lock()
            .textures
            .access(texture)
            .and_then(|t| t.subresources.get(&(mip, layer)).cloned())
    }

    pub fn texture_creation(&self, texture: TextureId) -> Option<TextureCreation> {
        self.lock().textures.access(texture).map(|t| t.creation.clone())
    }

    pub fn pipeline_creation(&self, pipeline: PipelineId) -> Option<PipelineCreation> {
        self.lock().pipelines.access(pipeline).cloned()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.lock().submissions.clone()
    }

    pub fn clear_submissions(&self) {
        self.lock().submissions.clear();
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    /// Live textures, not counting the swapchain image.
    pub fn live_textures(&self) -> usize {
        self.lock().textures.len().saturating_sub(1)
    }

    pub fn live_pipelines(&self) -> usize {
        self.lock().pipelines.len()
    }

    pub fn live_samplers(&self) -> usize {
        self.lock().samplers.len()
    }
}

fn swapchain_creation(extent: UVec2, format: wgpu::TextureFormat) -> TextureCreation {
    TextureCreation {
        name: "swapchain".to_string(),
        extent,
        mip_levels: 1,
        array_layers: 1,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
    }
}

impl HeadlessTexture {
    fn new(creation: TextureCreation) -> Self {
        Self {
            creation,
            subresources: HashMap::new(),
        }
    }

    /// Rebuilds mips 1.. of every layer by averaging 2x2 texels of the level
    /// above. Encoded values are averaged directly, sRGB included.
    fn generate_mips(&mut self) {
        let extent = self.creation.extent;
        for layer in 0..self.creation.array_layers {
            for mip in 1..self.creation.mip_levels {
                let Some(src) = self.subresources.get(&(mip - 1, layer)) else { break };
                let next = downsample(src, mip_extent(extent, mip - 1), mip_extent(extent, mip));
                self.subresources.insert((mip, layer), next);
            }
        }
    }
}

/// Box filter over tightly packed 4-byte texels. Edge texels clamp when the
/// source has an odd size.
fn downsample(src: &[u8], from: UVec2, to: UVec2) -> Vec<u8> {
    let texel = |x: u32, y: u32, c: usize| -> u32 {
        let x = x.min(from.x - 1);
        let y = y.min(from.y - 1);
        src[((y * from.x + x) * 4) as usize + c] as u32
    };
    let mut out = Vec::with_capacity((to.x * to.y * 4) as usize);
    for y in 0..to.y {
        for x in 0..to.x {
            for c in 0..4 {
                let (sx, sy) = (x * 2, y * 2);
                let sum = texel(sx, sy, c) + texel(sx + 1, sy, c) + texel(sx, sy + 1, c) + texel(sx + 1, sy + 1, c);
                out.push(((sum + 2) / 4) as u8);
            }
        }
    }
    out
}

impl HeadlessState {
    fn validate(&self, commands: &[Command]) -> Result<(), DeviceError> {
        for command in commands {
            match command {
                Command::CopyBufferToBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let src_len = self.buffer_len(*src)?;
                    let dst_len = self.buffer_len(*dst)?;
                    if src_offset + size > src_len || dst_offset + size > dst_len {
                        return Err(DeviceError::OutOfBounds(format!(
                            "{size} bytes from {src:?}+{src_offset} ({src_len}) to {dst:?}+{dst_offset} ({dst_len})"
                        )));
                    }
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
                    let src_len = self.buffer_len(*src)?;
                    let texture = self
                        .textures
                        .access(*dst)
                        .ok_or(DeviceError::InvalidHandle("texture"))?;
                    let creation = &texture.creation;
                    if *mip_level >= creation.mip_levels || *array_layer >= creation.array_layers {
                        return Err(DeviceError::OutOfBounds(format!(
                            "subresource mip {mip_level} layer {array_layer} of '{}'",
                            creation.name
                        )));
                    }
                    if *extent != mip_extent(creation.extent, *mip_level) {
                        return Err(DeviceError::OutOfBounds(format!(
                            "copy extent {extent} does not match '{}' mip {mip_level}",
                            creation.name
                        )));
                    }
                    let needed = *bytes_per_row as u64 * *rows_per_image as u64;
                    if src_offset + needed > src_len {
                        return Err(DeviceError::OutOfBounds(format!(
                            "{needed} bytes from {src:?}+{src_offset} ({src_len})"
                        )));
                    }
                }
                Command::GenerateMipmaps(texture) => {
                    let texture = self
                        .textures
                        .access(*texture)
                        .ok_or(DeviceError::InvalidHandle("texture"))?;
                    if !supports_mip_generation(texture.creation.format) {
                        return Err(DeviceError::Unsupported(format!(
                            "mip generation for {:?} ('{}')",
                            texture.creation.format, texture.creation.name
                        )));
                    }
                }
                Command::ExecuteSecondary(inner) => self.validate(inner)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn buffer_len(&self, buffer: BufferId) -> Result<u64, DeviceError> {
        self.buffers
            .access(buffer)
            .map(|b| b.data.len() as u64)
            .ok_or(DeviceError::InvalidHandle("buffer"))
    }

    fn execute(&mut self, commands: &[Command]) {
        for command in commands {
            match command {
                Command::CopyBufferToBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let Some(bytes) = self.buffers.access(*src).map(|b| {
                        b.data[*src_offset as usize..(*src_offset + *size) as usize].to_vec()
                    }) else {
                        log::warn!("Copy source {src:?} destroyed before execution");
                        continue;
                    };
                    if let Some(dst) = self.buffers.access_mut(*dst) {
                        let start = *dst_offset as usize;
                        dst.data[start..start + bytes.len()].copy_from_slice(&bytes);
                    }
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
                    let Some(texture) = self.textures.access_mut(*dst) else {
                        continue;
                    };
                    let Some(buffer) = self.buffers.access(*src) else {
                        continue;
                    };
                    let Some((row_bytes, rows)) = texel_copy_layout(texture.creation.format, *extent)
                    else {
                        continue;
                    };
                    let rows = rows.min(*rows_per_image);
                    let mut packed = Vec::with_capacity(row_bytes as usize * rows as usize);
                    for row in 0..rows as u64 {
                        let start = (src_offset + row * *bytes_per_row as u64) as usize;
                        packed.extend_from_slice(&buffer.data[start..start + row_bytes as usize]);
                    }
                    texture.subresources.insert((*mip_level, *array_layer), packed);
                }
                Command::GenerateMipmaps(texture) => {
                    if let Some(texture) = self.textures.access_mut(*texture) {
                        texture.generate_mips();
                    }
                }
                Command::ExecuteSecondary(inner) => self.execute(inner),
                _ => {}
            }
        }
    }

    fn complete_fence(&mut self, fence: FenceId) {
        let pending = match self.fences.access_mut(fence) {
            Some(f) => {
                f.signaled = true;
                f.pending.take()
            }
            None => None,
        };
        if let Some(work) = pending {
            self.execute(&work.commands);
        }
    }
}

impl GpuDevice for HeadlessDevice {
    fn create_buffer(&self, creation: &BufferCreation) -> Result<BufferId, DeviceError> {
        let buffer = HeadlessBuffer {
            creation: creation.clone(),
            data: vec![0; creation.size as usize],
        };
        Ok(self.lock().buffers.obtain(buffer)?)
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        if let Some(b) = self.lock().buffers.release(buffer) {
            log::trace!("Destroyed buffer '{}'", b.creation.name);
        }
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.lock();
        let b = state
            .buffers
            .access_mut(buffer)
            .ok_or(DeviceError::InvalidHandle("buffer"))?;
        let end = offset as usize + data.len();
        if end > b.data.len() {
            return Err(DeviceError::OutOfBounds(format!(
                "write of {} bytes at {offset} into '{}' ({} bytes)",
                data.len(),
                b.creation.name,
                b.data.len()
            )));
        }
        b.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn buffer_size(&self, buffer: BufferId) -> Option<u64> {
        self.lock().buffers.access(buffer).map(|b| b.data.len() as u64)
    }

    fn create_texture(&self, creation: &TextureCreation) -> Result<TextureId, DeviceError> {
        if creation.extent.x == 0 || creation.extent.y == 0 {
            return Err(DeviceError::OutOfBounds(format!(
                "texture '{}' has zero extent",
                creation.name
            )));
        }
        Ok(self.lock().textures.obtain(HeadlessTexture::new(creation.clone()))?)
    }

    fn destroy_texture(&self, texture: TextureId) {
        let mut state = self.lock();
        if texture == state.swapchain {
            log::warn!("Attempted to destroy the swapchain image");
            return;
        }
        state.textures.release(texture);
    }

    fn texture_extent(&self, texture: TextureId) -> Option<UVec2> {
        self.lock().textures.access(texture).map(|t| t.creation.extent)
    }

    fn create_sampler(&self, creation: &SamplerCreation) -> Result<SamplerId, DeviceError> {
        Ok(self.lock().samplers.obtain(creation.clone())?)
    }

    fn destroy_sampler(&self, sampler: SamplerId) {
        self.lock().samplers.release(sampler);
    }

    fn create_pipeline(&self, creation: &PipelineCreation) -> Result<PipelineId, DeviceError> {
        if creation.stages.is_empty() {
            return Err(DeviceError::Shader {
                name: creation.name.clone(),
                message: "no shader stages".to_string(),
            });
        }
        Ok(self.lock().pipelines.obtain(creation.clone())?)
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        self.lock().pipelines.release(pipeline);
    }

    fn create_fence(&self) -> Result<FenceId, DeviceError> {
        Ok(self.lock().fences.obtain(HeadlessFence::default())?)
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.lock().fences.release(fence);
    }

    fn fence_signaled(&self, fence: FenceId) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let stalled = state.transfer_latency.is_none();
        let ready = match state.fences.access_mut(fence) {
            None => return false,
            Some(f) => match f.pending.as_mut() {
                None => return f.signaled,
                Some(work) if work.polls_left == 0 => true,
                Some(work) => {
                    if !stalled {
                        work.polls_left -= 1;
                    }
                    false
                }
            },
        };
        if ready {
            state.complete_fence(fence);
        }
        ready
    }

    fn reset_fence(&self, fence: FenceId) {
        if let Some(f) = self.lock().fences.access_mut(fence) {
            f.signaled = false;
        }
    }

    fn submit(
        &self,
        queue: QueueType,
        commands: CommandBuffer,
        fence: Option<FenceId>,
    ) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.validate(commands.commands())?;
        let label = commands.label().to_string();
        let commands = commands.into_commands();
        state.submissions.push(Submission {
            queue,
            label,
            commands: commands.clone(),
            fenced: fence.is_some(),
        });

        let Some(fence) = fence else {
            state.execute(&commands);
            return Ok(());
        };
        let latency = state.transfer_latency;
        let f = state
            .fences
            .access_mut(fence)
            .ok_or(DeviceError::InvalidHandle("fence"))?;
        if f.pending.is_some() {
            return Err(DeviceError::FenceBusy);
        }
        f.signaled = false;
        f.pending = Some(PendingWork {
            commands,
            polls_left: latency.unwrap_or(u32::MAX),
        });
        if latency == Some(0) {
            state.complete_fence(fence);
        }
        Ok(())
    }

    fn wait_idle(&self) {
        let mut state = self.lock();
        let pending: Vec<FenceId> = state
            .fences
            .iter()
            .filter(|(_, f)| f.pending.is_some())
            .map(|(id, _)| id)
            .collect();
        for fence in pending {
            state.complete_fence(fence);
        }
    }

    fn swapchain_extent(&self) -> UVec2 {
        let state = self.lock();
        state
            .textures
            .access(state.swapchain)
            .map(|t| t.creation.extent)
            .unwrap_or(UVec2::ZERO)
    }

    fn swapchain_format(&self) -> wgpu::TextureFormat {
        self.lock().swapchain_format
    }

    fn swapchain_texture(&self) -> TextureId {
        self.lock().swapchain
    }

    fn resize_swapchain(&self, extent: UVec2) -> Result<(), DeviceError> {
        let mut state = self.lock();
        let old = state.swapchain;
        state.textures.release(old);
        let format = state.swapchain_format;
        state.swapchain = state
            .textures
            .obtain(HeadlessTexture::new(swapchain_creation(extent, format)))?;
        Ok(())
    }
}
