use std::time::Duration;

use tokio::sync::OwnedRwLockWriteGuard;
use tokio::time::Instant;

use crate::model::{ResourceKey, ResourceState};

use super::{Engine, EngineError};

/// Write guards over a set of resource timelines, held in resource-key order.
#[derive(Debug)]
pub(crate) struct LockSet {
    guards: Vec<(ResourceKey, OwnedRwLockWriteGuard<ResourceState>)>,
}

impl LockSet {
    pub(crate) fn empty() -> Self {
        Self { guards: Vec::new() }
    }

    pub(crate) fn get(&self, key: &ResourceKey) -> Option<&ResourceState> {
        let pos = self.guards.binary_search_by(|(k, _)| k.cmp(key)).ok()?;
        Some(&self.guards[pos].1)
    }

    pub(crate) fn get_mut(&mut self, key: &ResourceKey) -> Option<&mut ResourceState> {
        let pos = self.guards.binary_search_by(|(k, _)| k.cmp(key)).ok()?;
        Some(&mut self.guards[pos].1)
    }
}

fn sorted_unique(keys: &[ResourceKey]) -> Vec<ResourceKey> {
    let mut keys = keys.to_vec();
    keys.sort();
    keys.dedup();
    keys
}

impl Engine {
    /// Acquire write locks for `keys` in sorted order so that two commits over
    /// overlapping resource sets can never wait on each other in a cycle.
    /// The whole set shares one deadline, the configured lock timeout from now.
    pub(crate) async fn lock_resources(&self, keys: &[ResourceKey]) -> Result<LockSet, EngineError> {
        let keys = sorted_unique(keys);
        let timeout = Duration::from_millis(self.settings.lock_timeout_ms);
        let started = Instant::now();
        let deadline = started + timeout;
        let mut guards = Vec::with_capacity(keys.len());

        for key in keys {
            let rs = self.resource(&key);
            match tokio::time::timeout_at(deadline, rs.write_owned()).await {
                Ok(guard) => guards.push((key, guard)),
                Err(_) => {
                    tracing::warn!("lock timeout on {key} after {timeout:?}");
                    return Err(EngineError::LockTimeout { resource: key });
                }
            }
        }

        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(LockSet { guards })
    }

    /// Non-blocking variant for start-up replay, where nothing else holds the locks.
    pub(crate) fn try_lock_resources(&self, keys: &[ResourceKey]) -> Option<LockSet> {
        let mut guards = Vec::new();
        for key in sorted_unique(keys) {
            let guard = self.resource(&key).try_write_owned().ok()?;
            guards.push((key, guard));
        }
        Some(LockSet { guards })
    }
}
