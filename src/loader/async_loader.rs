use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use crossbeam_queue::SegQueue;

use super::{
    decode,
    requests::{FileLoadRequest, UploadRequest},
    BufferTarget, LoaderError, RequestQueue, TextureData, TextureTarget, TextureUpdate,
};
use crate::{
    config::LoaderConfig,
    gpu::{
        mip_extent, texel_copy_layout, BufferCreation, BufferId, CommandBuffer, FenceId,
        GpuDevice, QueueType, ResourceState,
    },
    renderer::TextureHandle,
};

/// Copy offsets and row pitches must be multiples of this.
const COPY_ALIGNMENT: u64 = 256;

fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// A request that was dropped. Its destination never becomes ready.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub source: String,
    pub texture: Option<TextureHandle>,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateReport {
    pub completed: usize,
    pub submitted: usize,
    pub decoded: usize,
    pub failed: usize,
}

impl UpdateReport {
    pub fn did_work(&self) -> bool {
        self.completed + self.submitted + self.decoded + self.failed > 0
    }
}

enum InFlight {
    Texture {
        target: TextureTarget,
        label: String,
        uploaded_mips: u32,
    },
    Buffer {
        cpu: BufferId,
        old: Option<BufferId>,
        target: BufferTarget,
    },
}

#[derive(Default)]
struct LoaderState {
    in_flight: Option<InFlight>,
    /// Decoded upload that found the upload queue full.
    deferred: Option<UploadRequest>,
}

struct SubresourceCopy {
    mip: u32,
    layer: u32,
    extent: glam::UVec2,
    src_offset: u64,
    row_bytes: u64,
    rows: u32,
    staging_offset: u64,
    padded_row: u64,
}

/// Streams file and memory data into GPU resources through one staging
/// buffer, one transfer at a time. `update` may run on a dedicated thread
/// (see `AsyncLoaderManager`) or once per frame; request methods can be
/// called from any thread.
pub struct AsyncLoader {
    device: Arc<dyn GpuDevice>,
    file_loads: RequestQueue<FileLoadRequest>,
    uploads: RequestQueue<UploadRequest>,
    staging: BufferId,
    staging_size: u64,
    transfer_fence: FenceId,
    state: Mutex<LoaderState>,
    outstanding: AtomicUsize,
    texture_updates: Arc<SegQueue<TextureUpdate>>,
    failures: SegQueue<LoadFailure>,
}

impl AsyncLoader {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        config: &LoaderConfig,
        texture_updates: Arc<SegQueue<TextureUpdate>>,
    ) -> Result<Self, LoaderError> {
        let staging = device.create_buffer(&BufferCreation {
            name: "loader staging".to_string(),
            size: config.staging_size,
            usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        })?;
        let transfer_fence = device.create_fence()?;
        log::debug!(
            "Async loader ready: {} byte staging, queues {}/{}",
            config.staging_size,
            config.file_load_capacity,
            config.upload_capacity
        );

        Ok(Self {
            file_loads: RequestQueue::new("file load", config.file_load_capacity, config.overflow_policy),
            uploads: RequestQueue::new("upload", config.upload_capacity, config.overflow_policy),
            staging,
            staging_size: config.staging_size,
            transfer_fence,
            state: Mutex::new(LoaderState::default()),
            outstanding: AtomicUsize::new(0),
            texture_updates,
            failures: SegQueue::new(),
            device,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decode `path` into `target` on the loader thread.
    pub fn request_texture_data(
        &self,
        path: impl Into<PathBuf>,
        target: TextureTarget,
    ) -> Result<(), LoaderError> {
        let request = FileLoadRequest {
            path: path.into(),
            target,
        };
        let was_ready = request.target.ready.is_ready();
        request.target.ready.set_pending();
        self.outstanding.fetch_add(1, Ordering::AcqRel);

        self.file_loads.push(request).map_err(|(error, request)| {
            log::error!("Dropping texture request {}: {error}", request.path.display());
            if was_ready {
                request.target.ready.set_ready();
            }
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            error
        })
    }

    /// Upload already decoded texels into `target`.
    pub fn request_texture_upload(
        &self,
        data: TextureData,
        target: TextureTarget,
    ) -> Result<(), LoaderError> {
        self.enqueue_upload(UploadRequest::Texture {
            source: None,
            data,
            target,
        })
    }

    /// Copy `cpu_size` bytes of the host-visible `cpu` buffer into `target`.
    /// The loader destroys `cpu` once the copy has executed.
    pub fn request_buffer_copy(
        &self,
        cpu: BufferId,
        cpu_size: u64,
        target: BufferTarget,
    ) -> Result<(), LoaderError> {
        if cpu_size > target.size {
            return Err(LoaderError::InvalidRequest(format!(
                "{cpu_size} bytes do not fit a {} byte buffer",
                target.size
            )));
        }
        self.enqueue_upload(UploadRequest::Buffer {
            cpu,
            cpu_size,
            target,
            old: None,
        })
    }

    /// Fill a freshly allocated `target` with `old[0..old_size]` followed by
    /// the `cpu` data. The loader destroys both `old` and `cpu` afterwards.
    pub fn request_buffer_reallocate_and_copy(
        &self,
        cpu: BufferId,
        cpu_size: u64,
        target: BufferTarget,
        old: BufferId,
        old_size: u64,
    ) -> Result<(), LoaderError> {
        if old_size + cpu_size > target.size {
            return Err(LoaderError::InvalidRequest(format!(
                "{old_size} + {cpu_size} bytes do not fit a {} byte buffer",
                target.size
            )));
        }
        self.enqueue_upload(UploadRequest::Buffer {
            cpu,
            cpu_size,
            target,
            old: Some((old, old_size)),
        })
    }

    fn enqueue_upload(&self, request: UploadRequest) -> Result<(), LoaderError> {
        // An earlier queued copy to the same destination keeps it pending.
        let was_ready = request.ready().is_ready();
        request.ready().set_pending();
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.uploads.push(request).map_err(|(error, request)| {
            log::error!("Dropping upload request {}: {error}", request.describe());
            if was_ready {
                request.ready().set_ready();
            }
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            error
        })
    }

    /// True while any accepted request has not completed or failed.
    pub fn has_requests(&self) -> bool {
        self.pending_requests() > 0
    }

    pub fn pending_requests(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn take_failures(&self) -> Vec<LoadFailure> {
        std::iter::from_fn(|| self.failures.pop()).collect()
    }

    /// One loader step: finish a completed transfer, start the next upload,
    /// decode one file.
    pub fn update(&self) -> UpdateReport {
        let mut report = UpdateReport::default();
        let mut state = self.lock_state();

        if state.in_flight.is_some() && self.device.fence_signaled(self.transfer_fence) {
            self.device.reset_fence(self.transfer_fence);
            if let Some(done) = state.in_flight.take() {
                self.finish(done);
                report.completed += 1;
            }
        }

        if state.in_flight.is_none() {
            if let Some(request) = state.deferred.take().or_else(|| self.uploads.pop()) {
                match self.submit_upload(&request) {
                    Ok(()) => {
                        state.in_flight = Some(Self::in_flight(request));
                        report.submitted += 1;
                    }
                    Err(error) => {
                        self.discard(request, &error);
                        report.failed += 1;
                    }
                }
            }
        }

        if state.deferred.is_none() {
            if let Some(load) = self.file_loads.pop() {
                let texture = load.target.handle;
                let srgb = load.target.format.is_srgb();
                match decode::load_texture(&load.path, srgb) {
                    Ok(data) => {
                        report.decoded += 1;
                        let upload = UploadRequest::Texture {
                            source: Some(load.path),
                            data,
                            target: load.target,
                        };
                        if let Err((error, upload)) = self.uploads.try_push(upload) {
                            match error {
                                LoaderError::QueueFull { .. } => state.deferred = Some(upload),
                                error => {
                                    self.discard(upload, &error);
                                    report.failed += 1;
                                }
                            }
                        }
                    }
                    Err(error) => {
                        self.fail(
                            load.path.display().to_string(),
                            Some(texture),
                            &LoaderError::Decode(error),
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }

    /// Runs `update` until every request has completed or failed, or
    /// `max_steps` is reached. Returns whether the loader is idle.
    pub fn pump_until_idle(&self, max_steps: usize) -> bool {
        for _ in 0..max_steps {
            if !self.has_requests() {
                return true;
            }
            if !self.update().did_work() {
                std::thread::yield_now();
            }
        }
        !self.has_requests()
    }

    fn in_flight(request: UploadRequest) -> InFlight {
        match request {
            UploadRequest::Texture { source, data, target } => InFlight::Texture {
                label: source
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| format!("{:?}", target.texture)),
                uploaded_mips: data.mip_levels.min(target.mip_levels),
                target,
            },
            UploadRequest::Buffer {
                cpu, target, old, ..
            } => InFlight::Buffer {
                cpu,
                old: old.map(|(buffer, _)| buffer),
                target,
            },
        }
    }

    fn submit_upload(&self, request: &UploadRequest) -> Result<(), LoaderError> {
        let commands = match request {
            UploadRequest::Texture { data, target, .. } => self.stage_texture(data, target)?,
            UploadRequest::Buffer {
                cpu,
                cpu_size,
                target,
                old,
            } => {
                let mut commands = CommandBuffer::new("buffer upload");
                match old {
                    Some((old, old_size)) => {
                        commands.copy_buffer_to_buffer(*old, 0, target.buffer, 0, *old_size);
                        commands.copy_buffer_to_buffer(*cpu, 0, target.buffer, *old_size, *cpu_size);
                    }
                    None => commands.copy_buffer_to_buffer(*cpu, 0, target.buffer, 0, *cpu_size),
                }
                commands
            }
        };
        self.device
            .submit(QueueType::Transfer, commands, Some(self.transfer_fence))?;
        Ok(())
    }

    fn plan_copies(
        &self,
        data: &TextureData,
        target: &TextureTarget,
    ) -> Result<(Vec<SubresourceCopy>, u64), LoaderError> {
        let mut copies = Vec::new();
        let mut src_offset = 0u64;
        let mut staging_offset = 0u64;
        for layer in 0..data.array_layers {
            for mip in 0..data.mip_levels {
                let extent = mip_extent(data.extent, mip);
                let (row_bytes, rows) = texel_copy_layout(data.format, extent).ok_or_else(|| {
                    LoaderError::InvalidRequest(format!("format {:?} cannot be copied", data.format))
                })?;
                let size = row_bytes * rows as u64;
                if layer < target.array_layers && mip < target.mip_levels {
                    let padded_row = align_to(row_bytes, COPY_ALIGNMENT);
                    copies.push(SubresourceCopy {
                        mip,
                        layer,
                        extent,
                        src_offset,
                        row_bytes,
                        rows,
                        staging_offset,
                        padded_row,
                    });
                    staging_offset = align_to(staging_offset + padded_row * rows as u64, COPY_ALIGNMENT);
                }
                src_offset += size;
            }
        }
        if src_offset > data.data.len() as u64 {
            return Err(LoaderError::InvalidRequest(format!(
                "{} bytes of texel data, {src_offset} expected",
                data.data.len()
            )));
        }
        Ok((copies, staging_offset))
    }

    fn stage_texture(
        &self,
        data: &TextureData,
        target: &TextureTarget,
    ) -> Result<CommandBuffer, LoaderError> {
        if data.extent != target.extent || data.format != target.format {
            return Err(LoaderError::TextureMismatch {
                decoded: data.extent,
                decoded_format: data.format,
                expected: target.extent,
                expected_format: target.format,
            });
        }

        let (copies, staging_bytes) = self.plan_copies(data, target)?;
        if staging_bytes > self.staging_size {
            return Err(LoaderError::StagingOverflow {
                size: staging_bytes,
                capacity: self.staging_size,
            });
        }

        let mut staging = vec![0u8; staging_bytes as usize];
        for copy in &copies {
            for row in 0..copy.rows as u64 {
                let src = (copy.src_offset + row * copy.row_bytes) as usize;
                let dst = (copy.staging_offset + row * copy.padded_row) as usize;
                staging[dst..dst + copy.row_bytes as usize]
                    .copy_from_slice(&data.data[src..src + copy.row_bytes as usize]);
            }
        }
        self.device.write_buffer(self.staging, 0, &staging)?;

        let mut commands = CommandBuffer::new("texture upload");
        commands.barrier(target.texture, ResourceState::CopyDest);
        for copy in &copies {
            commands.copy_buffer_to_texture(
                self.staging,
                copy.staging_offset,
                copy.padded_row as u32,
                copy.rows,
                target.texture,
                copy.mip,
                copy.layer,
                copy.extent,
            );
        }
        Ok(commands)
    }

    fn finish(&self, done: InFlight) {
        match done {
            InFlight::Texture {
                target,
                label,
                uploaded_mips,
            } => {
                log::debug!("Texture {label} uploaded");
                self.texture_updates.push(TextureUpdate {
                    texture: target.handle,
                    uploaded_mips,
                });
            }
            InFlight::Buffer { cpu, old, target } => {
                if let Some(old) = old {
                    self.device.destroy_buffer(old);
                }
                self.device.destroy_buffer(cpu);
                target.ready.set_ready();
            }
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    fn discard(&self, request: UploadRequest, error: &LoaderError) {
        let source = request.describe();
        match request {
            UploadRequest::Texture { target, .. } => self.fail(source, Some(target.handle), error),
            UploadRequest::Buffer { cpu, .. } => {
                self.device.destroy_buffer(cpu);
                self.fail(source, None, error);
            }
        }
    }

    fn fail(&self, source: String, texture: Option<TextureHandle>, error: &LoaderError) {
        log::error!("Load of {source} failed: {error}");
        self.failures.push(LoadFailure {
            source,
            texture,
            reason: error.to_string(),
        });
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for AsyncLoader {
    fn drop(&mut self) {
        if self.lock_state().in_flight.is_some() {
            self.device.wait_idle();
        }
        self.device.destroy_buffer(self.staging);
        self.device.destroy_fence(self.transfer_fence);
        let pending = self.pending_requests();
        if pending > 0 {
            log::warn!("Async loader dropped with {pending} pending requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::UVec2;

    use super::*;
    use crate::{gpu::headless::HeadlessDevice, loader::ReadyFlag};

    fn loader(device: &Arc<HeadlessDevice>, staging_size: u64) -> AsyncLoader {
        let config = LoaderConfig {
            staging_size,
            ..LoaderConfig::default()
        };
        AsyncLoader::new(device.clone(), &config, Arc::new(SegQueue::new())).unwrap()
    }

    fn buffer(device: &HeadlessDevice, name: &str, size: u64) -> BufferId {
        device
            .create_buffer(&BufferCreation {
                name: name.to_string(),
                size,
                usage: wgpu::BufferUsages::COPY_DST,
            })
            .unwrap()
    }

    #[test]
    fn buffer_ready_only_after_fence() {
        let device = Arc::new(HeadlessDevice::new(UVec2::new(8, 8)));
        device.set_transfer_latency(2);
        let loader = loader(&device, 1024);

        let cpu = buffer(&device, "cpu", 64);
        let pattern: Vec<u8> = (0..64).collect();
        device.write_buffer(cpu, 0, &pattern).unwrap();
        let gpu = buffer(&device, "gpu", 64);
        let ready = ReadyFlag::default();
        loader
            .request_buffer_copy(cpu, 64, BufferTarget { buffer: gpu, size: 64, ready: ready.clone() })
            .unwrap();
        assert!(!ready.is_ready());

        let report = loader.update();
        assert_eq!(report.submitted, 1);
        assert!(!ready.is_ready());
        assert_eq!(device.buffer_contents(gpu).unwrap(), vec![0; 64]);

        loader.update();
        loader.update();
        assert!(!ready.is_ready());
        let report = loader.update();
        assert_eq!(report.completed, 1);
        assert!(ready.is_ready());
        assert_eq!(device.buffer_contents(gpu).unwrap(), pattern);
        assert!(device.buffer_contents(cpu).is_none(), "cpu buffer is freed");
        assert!(!loader.has_requests());
    }

    #[test]
    fn reallocate_keeps_old_contents_in_front() {
        let device = Arc::new(HeadlessDevice::new(UVec2::new(8, 8)));
        let loader = loader(&device, 1024);

        let old = buffer(&device, "old", 8);
        device.write_buffer(old, 0, &[1; 8]).unwrap();
        let cpu = buffer(&device, "cpu", 4);
        device.write_buffer(cpu, 0, &[2; 4]).unwrap();
        let grown = buffer(&device, "grown", 12);
        let ready = ReadyFlag::default();

        loader
            .request_buffer_reallocate_and_copy(
                cpu,
                4,
                BufferTarget { buffer: grown, size: 12, ready: ready.clone() },
                old,
                8,
            )
            .unwrap();
        assert!(loader.pump_until_idle(8));
        assert!(ready.is_ready());
        assert_eq!(
            device.buffer_contents(grown).unwrap(),
            vec![1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2]
        );
        assert!(device.buffer_contents(old).is_none());
    }

    #[test]
    fn oversized_requests_are_rejected_up_front() {
        let device = Arc::new(HeadlessDevice::new(UVec2::new(8, 8)));
        let loader = loader(&device, 1024);
        let cpu = buffer(&device, "cpu", 16);
        let gpu = buffer(&device, "gpu", 8);
        let ready = ReadyFlag::default();
        let err = loader
            .request_buffer_copy(cpu, 16, BufferTarget { buffer: gpu, size: 8, ready: ready.clone() })
            .unwrap_err();
        assert!(matches!(err, LoaderError::InvalidRequest(_)));
        assert!(ready.is_ready());
        assert_eq!(loader.pending_requests(), 0);
    }

    #[test]
    fn staging_rows_are_padded() {
        assert_eq!(align_to(12, COPY_ALIGNMENT), 256);
        assert_eq!(align_to(256, COPY_ALIGNMENT), 256);
        assert_eq!(align_to(0, COPY_ALIGNMENT), 0);
    }
}
