//! Process-wide identifier -> buffer map
//!
//! Buffers normally leave the registry through their own idle timers. The
//! periodic sweep is a backstop for buffers that ended up empty and idle
//! without their timer firing.

use crate::buffer::{BufferMap, BufferSettings, ResourceBuffer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Registry of per-identifier read-ahead buffers
pub struct BufferRegistry {
    buffers: Arc<BufferMap>,
    settings: BufferSettings,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl BufferRegistry {
    pub fn new(settings: BufferSettings, sweep_interval: Duration) -> Self {
        BufferRegistry {
            buffers: Arc::new(RwLock::new(HashMap::new())),
            settings,
            sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> BufferSettings {
        self.settings
    }

    /// Return the buffer for `id`, creating an empty one if needed; always touches it
    pub fn get_or_create(&self, id: &str) -> Arc<ResourceBuffer> {
        loop {
            let buffer = {
                let mut buffers = match self.buffers.write() {
                    Ok(buffers) => buffers,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let entry = buffers.entry(id.to_string()).or_insert_with(|| {
                    debug!("Creating buffer: id={}", id);
                    ResourceBuffer::with_registry(
                        id.to_string(),
                        self.settings,
                        Arc::downgrade(&self.buffers),
                    )
                });
                Arc::clone(entry)
            };

            // Lost a race with destroy(): the entry is gone or going, create a fresh one
            if buffer.touch() {
                return buffer;
            }
            self.remove_if_same(id, &buffer);
        }
    }

    /// Existing buffer for `id`, without touching it
    pub fn get(&self, id: &str) -> Option<Arc<ResourceBuffer>> {
        self.buffers.read().ok()?.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.buffers.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every buffer that is empty and not filling; returns how many
    pub fn sweep(&self) -> usize {
        let candidates: Vec<Arc<ResourceBuffer>> = match self.buffers.read() {
            Ok(buffers) => buffers
                .values()
                .filter(|buffer| buffer.is_idle_and_empty())
                .cloned()
                .collect(),
            Err(_) => return 0,
        };

        for buffer in &candidates {
            buffer.destroy();
            info!("Sweep cleaned empty buffer: id={}", buffer.id());
        }
        candidates.len()
    }

    /// Spawn the periodic sweep task; calling again while it runs is a no-op
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = match self.sweeper.lock() {
            Ok(sweeper) => sweeper,
            Err(poisoned) => poisoned.into_inner(),
        };
        if sweeper.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let registry = Arc::downgrade(self);
        let period = self.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let swept = registry.sweep();
                if swept > 0 {
                    debug!("Sweep removed {} buffers, {} remain", swept, registry.len());
                }
            }
        }));
        info!("Buffer sweep started: interval={:?}", period);
    }

    /// Stop the sweeper and destroy every buffer
    pub fn shutdown(&self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }

        let all: Vec<Arc<ResourceBuffer>> = match self.buffers.read() {
            Ok(buffers) => buffers.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        for buffer in &all {
            buffer.destroy();
        }
        info!("Buffer registry shut down: destroyed {} buffers", all.len());
    }

    fn remove_if_same(&self, id: &str, buffer: &Arc<ResourceBuffer>) {
        if let Ok(mut buffers) = self.buffers.write() {
            if buffers.get(id).map(|b| Arc::ptr_eq(b, buffer)).unwrap_or(false) {
                buffers.remove(id);
            }
        }
    }
}

impl Drop for BufferRegistry {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}
