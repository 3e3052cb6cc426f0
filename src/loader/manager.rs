use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use super::AsyncLoader;

/// Owns the loader thread. Every registered loader gets one `update` per
/// iteration until `shutdown`.
pub struct AsyncLoaderManager {
    loaders: Arc<Mutex<Vec<Arc<AsyncLoader>>>>,
    valid: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AsyncLoaderManager {
    pub fn new(idle_sleep: Duration) -> std::io::Result<Self> {
        let loaders: Arc<Mutex<Vec<Arc<AsyncLoader>>>> = Arc::new(Mutex::new(Vec::new()));
        let valid = Arc::new(AtomicBool::new(true));

        let thread = {
            let loaders = loaders.clone();
            let valid = valid.clone();
            std::thread::Builder::new()
                .name("async-loader".to_string())
                .spawn(move || {
                    log::info!("Async loader thread started");
                    while valid.load(Ordering::Acquire) {
                        let current: Vec<Arc<AsyncLoader>> = match loaders.lock() {
                            Ok(l) => l.clone(),
                            Err(poisoned) => poisoned.into_inner().clone(),
                        };
                        let mut busy = false;
                        for loader in &current {
                            busy |= loader.update().did_work();
                        }
                        if !busy {
                            std::thread::sleep(idle_sleep);
                        }
                    }
                    log::info!("Async loader thread stopped");
                })?
        };

        Ok(Self {
            loaders,
            valid,
            thread: Some(thread),
        })
    }

    pub fn add_loader(&self, loader: Arc<AsyncLoader>) {
        if let Ok(mut loaders) = self.loaders.lock() {
            if !loaders.iter().any(|l| Arc::ptr_eq(l, &loader)) {
                loaders.push(loader);
            }
        }
    }

    pub fn remove_loader(&self, loader: &Arc<AsyncLoader>) {
        if let Ok(mut loaders) = self.loaders.lock() {
            loaders.retain(|l| !Arc::ptr_eq(l, loader));
        }
    }

    pub fn loader_count(&self) -> usize {
        self.loaders.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    pub fn shutdown(&mut self) {
        self.valid.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Async loader thread panicked");
            }
        }
        if let Ok(mut loaders) = self.loaders.lock() {
            loaders.clear();
        }
    }
}

impl Drop for AsyncLoaderManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use crossbeam_queue::SegQueue;
    use glam::UVec2;

    use super::*;
    use crate::{
        config::LoaderConfig,
        gpu::{headless::HeadlessDevice, BufferCreation, GpuDevice},
        loader::{BufferTarget, ReadyFlag},
    };

    #[test]
    fn thread_drives_registered_loaders() {
        let device = Arc::new(HeadlessDevice::new(UVec2::new(4, 4)));
        device.set_transfer_latency(1);
        let loader = Arc::new(
            AsyncLoader::new(device.clone(), &LoaderConfig::default(), Arc::new(SegQueue::new()))
                .unwrap(),
        );
        let mut manager = AsyncLoaderManager::new(Duration::from_millis(1)).unwrap();
        manager.add_loader(loader.clone());
        manager.add_loader(loader.clone());
        assert_eq!(manager.loader_count(), 1);

        let creation = |name: &str| BufferCreation {
            name: name.to_string(),
            size: 16,
            usage: wgpu::BufferUsages::COPY_DST,
        };
        let cpu = device.create_buffer(&creation("cpu")).unwrap();
        device.write_buffer(cpu, 0, &[9; 16]).unwrap();
        let gpu = device.create_buffer(&creation("gpu")).unwrap();
        let ready = ReadyFlag::default();
        loader
            .request_buffer_copy(cpu, 16, BufferTarget { buffer: gpu, size: 16, ready: ready.clone() })
            .unwrap();

        let start = Instant::now();
        while !ready.is_ready() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(ready.is_ready());
        assert_eq!(device.buffer_contents(gpu).unwrap(), vec![9; 16]);

        manager.remove_loader(&loader);
        assert_eq!(manager.loader_count(), 0);
        manager.shutdown();
        assert!(!manager.is_running());
    }
}
