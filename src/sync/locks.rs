use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ingest::types::EventSource;

/// Set of sources currently mid-sync.
///
/// Membership is taken with [`SourceLocks::try_acquire`] and released when the
/// returned guard drops, so a job that errors or panics still frees its source.
#[derive(Debug, Clone, Default)]
pub struct SourceLocks {
    running: Arc<Mutex<HashSet<EventSource>>>,
}

impl SourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when a job for `source` is already running.
    pub fn try_acquire(&self, source: EventSource) -> Option<SourceLockGuard> {
        let mut running = self.running.lock();
        if !running.insert(source) {
            return None;
        }
        Some(SourceLockGuard {
            source,
            running: Arc::clone(&self.running),
        })
    }

    pub fn is_running(&self, source: EventSource) -> bool {
        self.running.lock().contains(&source)
    }

    pub fn running(&self) -> Vec<EventSource> {
        let mut v: Vec<_> = self.running.lock().iter().copied().collect();
        v.sort();
        v
    }
}

#[derive(Debug)]
pub struct SourceLockGuard {
    source: EventSource,
    running: Arc<Mutex<HashSet<EventSource>>>,
}

impl SourceLockGuard {
    pub fn source(&self) -> EventSource {
        self.source
    }
}

impl Drop for SourceLockGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.source);
    }
}
