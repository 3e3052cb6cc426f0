use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError};
use glam::UVec2;
use serde::Deserialize;

use super::LoaderError;
use crate::{
    gpu::{BufferId, TextureId},
    renderer::TextureHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// A push into a full queue fails with `LoaderError::QueueFull`.
    #[default]
    Reject,
    /// A push into a full queue waits for the loader to drain a slot.
    Block,
}

/// Published by the loader once a destination's data is on the GPU.
/// Store-release on set, load-acquire on check.
#[derive(Debug, Clone)]
pub struct ReadyFlag(Arc<AtomicBool>);

impl ReadyFlag {
    pub fn new(ready: bool) -> Self {
        Self(Arc::new(AtomicBool::new(ready)))
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn set_pending(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for ReadyFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Where decoded texels end up.
#[derive(Debug, Clone)]
pub struct TextureTarget {
    pub handle: TextureHandle,
    pub texture: TextureId,
    pub extent: UVec2,
    pub format: wgpu::TextureFormat,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub ready: ReadyFlag,
}

/// A finished texture upload handed to the renderer on the graphics thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureUpdate {
    pub texture: TextureHandle,
    /// Mip levels the upload filled, counted from level 0.
    pub uploaded_mips: u32,
}

#[derive(Debug, Clone)]
pub struct BufferTarget {
    pub buffer: BufferId,
    pub size: u64,
    pub ready: ReadyFlag,
}

/// Decoded texels, subresources ordered layer-major: layer0 mip0, layer0
/// mip1, ..., layer1 mip0, ...
#[derive(Debug, Clone)]
pub struct TextureData {
    pub data: Vec<u8>,
    pub extent: UVec2,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: wgpu::TextureFormat,
}

#[derive(Debug)]
pub struct FileLoadRequest {
    pub path: PathBuf,
    pub target: TextureTarget,
}

#[derive(Debug)]
pub enum UploadRequest {
    Texture {
        source: Option<PathBuf>,
        data: TextureData,
        target: TextureTarget,
    },
    Buffer {
        cpu: BufferId,
        cpu_size: u64,
        target: BufferTarget,
        /// Previous contents to keep at the front of `target`.
        old: Option<(BufferId, u64)>,
    },
}

impl UploadRequest {
    pub(crate) fn describe(&self) -> String {
        match self {
            UploadRequest::Texture { source: Some(path), .. } => path.display().to_string(),
            UploadRequest::Texture { target, .. } => format!("texture {:?}", target.texture),
            UploadRequest::Buffer { target, .. } => format!("buffer {:?}", target.buffer),
        }
    }

    /// Flag of the destination this request publishes.
    pub(crate) fn ready(&self) -> &ReadyFlag {
        match self {
            UploadRequest::Texture { target, .. } => &target.ready,
            UploadRequest::Buffer { target, .. } => &target.ready,
        }
    }
}

/// Bounded FIFO between request producers and the loader. `capacity`
/// requests fit; the next push follows the overflow policy.
pub struct RequestQueue<T> {
    name: &'static str,
    capacity: usize,
    policy: OverflowPolicy,
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> RequestQueue<T> {
    pub fn new(name: &'static str, capacity: usize, policy: OverflowPolicy) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self {
            name,
            capacity,
            policy,
            tx,
            rx,
        }
    }

    pub fn push(&self, request: T) -> Result<(), (LoaderError, T)> {
        match self.policy {
            OverflowPolicy::Reject => self.try_push(request),
            OverflowPolicy::Block => self
                .tx
                .send(request)
                .map_err(|e| (LoaderError::Disconnected(self.name), e.into_inner())),
        }
    }

    pub fn try_push(&self, request: T) -> Result<(), (LoaderError, T)> {
        self.tx.try_send(request).map_err(|e| match e {
            TrySendError::Full(r) => (
                LoaderError::QueueFull {
                    queue: self.name,
                    capacity: self.capacity,
                },
                r,
            ),
            TrySendError::Disconnected(r) => (LoaderError::Disconnected(self.name), r),
        })
    }

    pub fn pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(request) => Some(request),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    #[test]
    fn fifo_up_to_capacity() {
        let queue = RequestQueue::new("test", 4, OverflowPolicy::Reject);
        for i in 0..4 {
            queue.push(i).unwrap();
        }
        let (err, rejected) = queue.push(4).unwrap_err();
        assert_eq!(rejected, 4);
        assert!(matches!(err, LoaderError::QueueFull { capacity: 4, .. }));

        let popped: Vec<i32> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3]);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn block_policy_waits_for_a_free_slot() {
        let queue = Arc::new(RequestQueue::new("test", 1, OverflowPolicy::Block));
        queue.push(1).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(2).map_err(|(e, _)| e))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.pop(), Some(1));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn ready_flag_round_trip() {
        let flag = ReadyFlag::default();
        assert!(flag.is_ready());
        let shared = flag.clone();
        shared.set_pending();
        assert!(!flag.is_ready());
        shared.set_ready();
        assert!(flag.is_ready());
    }
}
