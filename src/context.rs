use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use glam::UVec2;
use thiserror::Error;

use crate::{
    config::{ConfigError, EngineConfig, LoaderMode},
    gpu::{CommandBuffer, DeviceError, GpuDevice, QueueType, TextureCreation},
    job_system::{WorkerError, WorkerPool},
    loader::{AsyncLoader, AsyncLoaderManager, LoaderError},
    render_graph::{FrameContext, GraphError, PassIo, RenderGraph},
    renderer::{
        technique::{self, LoadedTechnique},
        CacheError, RendererResourceCache, TeardownReport, TechniqueError, TechniqueHandle,
        TechniqueWatcher, TextureHandle,
    },
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Technique(#[from] TechniqueError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("failed to start thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Everything the renderer core shares, passed explicitly instead of living
/// in a global.
pub struct EngineContext {
    pub config: EngineConfig,
    pub device: Arc<dyn GpuDevice>,
    pub resources: RendererResourceCache,
    pub loader: Arc<AsyncLoader>,
    pub workers: WorkerPool,
    loader_manager: Option<AsyncLoaderManager>,
    technique_watcher: Option<TechniqueWatcher>,
    /// Techniques loaded from files; the context holds one reference each.
    techniques: Vec<TechniqueHandle>,
    frame_index: u64,
}

impl EngineContext {
    pub fn new(config: EngineConfig, device: Arc<dyn GpuDevice>) -> Result<Self, EngineError> {
        config.loader.validate()?;
        let resources = RendererResourceCache::new(device.clone(), &config.pools);
        let loader = Arc::new(AsyncLoader::new(
            device.clone(),
            &config.loader,
            resources.texture_updates(),
        )?);

        let loader_manager = match config.loader.mode {
            LoaderMode::Thread => {
                let manager = AsyncLoaderManager::new(Duration::from_millis(config.loader.idle_sleep_ms))?;
                manager.add_loader(loader.clone());
                Some(manager)
            }
            LoaderMode::PerFrame => None,
        };
        let workers = WorkerPool::init(config.workers)?;

        let technique_watcher = if config.hot_reload {
            match TechniqueWatcher::new(&[&config.techniques_dir, &config.shaders_dir]) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Hot reload disabled: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            config,
            device,
            resources,
            loader,
            workers,
            loader_manager,
            technique_watcher,
            techniques: Vec::new(),
            frame_index: 0,
        })
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn frame_context(&mut self) -> FrameContext<'_> {
        FrameContext {
            device: self.device.as_ref(),
            resources: &mut self.resources,
            workers: &self.workers,
            frame_index: self.frame_index,
            swapchain_extent: self.device.swapchain_extent(),
            io: PassIo::default(),
        }
    }

    /// Parses the configured render graph file.
    pub fn load_render_graph(&self) -> Result<RenderGraph, EngineError> {
        Ok(RenderGraph::parse_from_file(
            &self.config.render_graph,
            &self.config.presentation_target,
            &self.config.pools,
        )?)
    }

    /// Creates a cached texture and streams `path` into it.
    pub fn request_texture(&mut self, path: &Path, creation: &TextureCreation) -> Result<TextureHandle, EngineError> {
        let handle = self.resources.create_texture(creation)?;
        let target = self
            .resources
            .texture_target(handle)
            .ok_or(CacheError::InvalidHandle(crate::renderer::ResourceKind::Texture))?;
        if let Err(e) = self.loader.request_texture_data(path, target) {
            self.resources.destroy_texture(handle)?;
            return Err(e.into());
        }
        Ok(handle)
    }

    /// Records and submits one frame of `graph`.
    pub fn run_frame(&mut self, graph: &mut RenderGraph) -> Result<(), EngineError> {
        if self.loader_manager.is_none() {
            self.loader.update();
        }
        if self.poll_hot_reload() {
            self.reload_techniques(graph)?;
        }

        let mut cmd = CommandBuffer::new(&format!("frame {}", self.frame_index));
        self.resources.process_texture_updates(&mut cmd);
        {
            let mut ctx = self.frame_context();
            graph.render(&mut ctx, &mut cmd)?;
        }
        self.device.submit(QueueType::Graphics, cmd, None)?;
        self.frame_index += 1;
        Ok(())
    }

    fn poll_hot_reload(&self) -> bool {
        let Some(watcher) = &self.technique_watcher else { return false };
        let changed = watcher.poll_changed();
        if changed.is_empty() {
            return false;
        }
        log::info!("Technique sources changed: {changed:?}");
        true
    }

    /// Resizes the swapchain and every size-dependent graph resource.
    pub fn resize(&mut self, graph: &mut RenderGraph, width: u32, height: u32) -> Result<(), EngineError> {
        if width == 0 || height == 0 {
            log::debug!("Ignoring resize to {width}x{height}");
            return Ok(());
        }
        self.device.wait_idle();
        self.device.resize_swapchain(UVec2::new(width, height))?;
        let mut ctx = self.frame_context();
        graph.on_resize(&mut ctx, width, height)?;
        Ok(())
    }

    fn technique_sources(&self) -> Vec<PathBuf> {
        let mut sources = match technique::technique_files(&self.config.techniques_dir) {
            Ok(files) => files,
            Err(e) => {
                log::error!("{e}");
                Vec::new()
            }
        };
        for (_, technique) in self.resources.techniques() {
            if let Some(source) = &technique.source {
                if !sources.contains(source) {
                    sources.push(source.clone());
                }
            }
        }
        sources
    }

    fn load_technique_files(&mut self, graph: &RenderGraph, files: &[PathBuf]) -> Vec<LoadedTechnique> {
        let mut loaded = Vec::with_capacity(files.len());
        for path in files {
            match technique::load_into_cache(&mut self.resources, path, &self.config.shaders_dir, graph) {
                Ok((handle, technique)) => {
                    if !self.techniques.contains(&handle) {
                        self.techniques.push(handle);
                    }
                    loaded.push(technique);
                }
                Err(e) => log::error!("Failed to load technique {}: {e}", path.display()),
            }
        }
        loaded
    }

    /// Loads every technique file of the configured directory. Files that
    /// fail are logged and skipped.
    pub fn load_techniques(&mut self, graph: &RenderGraph) -> Result<Vec<LoadedTechnique>, EngineError> {
        let files = technique::technique_files(&self.config.techniques_dir)?;
        let loaded = self.load_technique_files(graph, &files);
        log::info!("Loaded {} of {} techniques", loaded.len(), files.len());
        Ok(loaded)
    }

    /// Rebuilds every technique from its file and lets the passes pick up
    /// the new pipelines.
    pub fn reload_techniques(&mut self, graph: &mut RenderGraph) -> Result<Vec<LoadedTechnique>, EngineError> {
        self.device.wait_idle();
        let files = self.technique_sources();
        let loaded = self.load_technique_files(graph, &files);
        let mut ctx = self.frame_context();
        graph.on_techniques_reloaded(&mut ctx);
        log::info!("Reloaded {} techniques", loaded.len());
        Ok(loaded)
    }

    /// Stops the loader, drains outstanding work and frees everything in
    /// dependency order.
    pub fn shutdown(&mut self, graph: &mut RenderGraph) -> TeardownReport {
        if let Some(mut manager) = self.loader_manager.take() {
            manager.shutdown();
        }
        if !self.loader.pump_until_idle(10_000) {
            log::warn!("{} loader requests still pending at shutdown", self.loader.pending_requests());
        }
        self.device.wait_idle();
        graph.destroy(self.device.as_ref());
        self.workers.shutdown();
        for technique in self.techniques.drain(..) {
            if let Err(e) = self.resources.destroy_technique(technique) {
                log::warn!("Releasing technique: {e}");
            }
        }
        self.resources.teardown()
    }
}
