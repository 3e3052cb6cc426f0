use std::path::{Path, PathBuf};

use crossbeam::channel::{Receiver, TryRecvError};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

/// Collects edits to technique and shader files for hot reload.
pub struct TechniqueWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
}

impl TechniqueWatcher {
    pub fn new(dirs: &[&Path]) -> notify::Result<Self> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut watcher = RecommendedWatcher::new(
            move |event| {
                let _ = tx.send(event);
            },
            Config::default(),
        )?;
        for dir in dirs {
            watcher.watch(dir, RecursiveMode::Recursive)?;
            log::info!("Watching {} for technique changes", dir.display());
        }
        Ok(Self { _watcher: watcher, rx })
    }

    /// Files changed since the last call, without editor backup files.
    pub fn poll_changed(&self) -> Vec<PathBuf> {
        let mut changed: Vec<PathBuf> = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(Ok(event)) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        continue;
                    }
                    for path in event.paths {
                        if path.to_string_lossy().ends_with('~') || changed.contains(&path) {
                            continue;
                        }
                        changed.push(path);
                    }
                }
                Ok(Err(e)) => log::warn!("watch error: {e:?}"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        changed
    }
}
