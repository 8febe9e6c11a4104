//! Process-wide mount registry.
//!
//! An ordered map from mount name to its [`Source`]. Insertions and
//! removals take the write lock; lookups take the read lock. Lock order is
//! registry before source - a caller holding a source lock must never call
//! back in here for a write.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::Config;
use crate::source::{Source, SourceFlags};

/// Longest fallback chain a lookup will walk.
pub const MAX_FALLBACK_DEPTH: usize = 10;

/// Global name -> source map.
pub struct MountRegistry {
    map: RwLock<BTreeMap<String, Arc<Source>>>,
}

impl Default for MountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MountRegistry {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
        }
    }

    /// Claims `mount` for a new producer.
    ///
    /// Creates and inserts a fresh source when the mount is free. When a
    /// source already exists it is returned only if `return_existing` is set
    /// and the source is not mid-transition: a source still syncing its
    /// listeners onto a fallback must not be handed to a new producer, the
    /// two would race over the listener set.
    pub fn reserve(
        &self,
        mount: &str,
        return_existing: bool,
        config: &Config,
    ) -> Option<Arc<Source>> {
        let mut map = self.map.write();
        if let Some(existing) = map.get(mount) {
            let inner = existing.lock();
            if inner.flags.contains(SourceFlags::LISTENERS_SYNC) {
                log::debug!("[Registry] {mount} is mid-sync, refusing reserve");
                return None;
            }
            // A parked shell (no producer) is free to claim; a live source
            // only goes to a caller prepared to take it over.
            if inner.producer.is_some() && !return_existing {
                return None;
            }
            drop(inner);
            return Some(Arc::clone(existing));
        }
        let source = Source::new(mount, config);
        map.insert(mount.to_string(), Arc::clone(&source));
        log::info!("[Registry] Reserved mount {mount}");
        Some(source)
    }

    /// Direct lookup, no fallback walking.
    pub fn find_raw(&self, mount: &str) -> Option<Arc<Source>> {
        self.map.read().get(mount).cloned()
    }

    /// Finds the first available source on `mount` or its fallback chain.
    ///
    /// Walks at most [`MAX_FALLBACK_DEPTH`] configured links, stopping at
    /// the first source that exists, is not terminating, and has a producer.
    pub fn find_with_fallback(&self, mount: &str, config: &Config) -> Option<Arc<Source>> {
        let mut name = mount.to_string();
        for _ in 0..MAX_FALLBACK_DEPTH {
            if let Some(source) = self.find_raw(&name) {
                if source.available() {
                    return Some(source);
                }
            }
            match config.mount(&name).fallback_mount {
                Some(next) => name = next,
                None => break,
            }
        }
        None
    }

    /// Unlinks a source; the caller runs the teardown.
    pub fn remove(&self, mount: &str) -> Option<Arc<Source>> {
        let removed = self.map.write().remove(mount);
        if removed.is_some() {
            log::info!("[Registry] Removed mount {mount}");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.map.read().len()
    }

    /// Mount names in order.
    pub fn mounts(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{unspecified_ip, Client, ClientHandle, Connection, RequestHead};
    use crate::config::MountConfig;
    use crate::net::testing::MockSocket;

    fn dummy_client(id: u64) -> ClientHandle {
        ClientHandle::new(Client::new(
            Connection::new(id, unspecified_ip(), Box::new(MockSocket::new())),
            RequestHead::default(),
        ))
    }

    #[test]
    fn reserve_rejects_second_producer_on_live_mount() {
        let reg = MountRegistry::new();
        let cfg = Config::default();
        let src = reg.reserve("/live", false, &cfg).unwrap();
        src.lock().producer = Some(dummy_client(1));
        assert!(reg.reserve("/live", false, &cfg).is_none());
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn reserve_returns_live_mount_to_hijacker() {
        let reg = MountRegistry::new();
        let cfg = Config::default();
        let a = reg.reserve("/live", false, &cfg).unwrap();
        a.lock().producer = Some(dummy_client(1));
        let b = reg.reserve("/live", true, &cfg).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn reserve_returns_parked_shell_to_anyone() {
        let reg = MountRegistry::new();
        let cfg = Config::default();
        let a = reg.reserve("/live", false, &cfg).unwrap();
        let b = reg.reserve("/live", false, &cfg).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn reserve_refuses_syncing_source() {
        let reg = MountRegistry::new();
        let cfg = Config::default();
        let src = reg.reserve("/live", false, &cfg).unwrap();
        src.lock().flags.insert(SourceFlags::LISTENERS_SYNC);
        assert!(reg.reserve("/live", true, &cfg).is_none());
    }

    #[test]
    fn fallback_walk_stops_at_depth() {
        let reg = MountRegistry::new();
        let mut cfg = Config::default();
        // A cycle of two mounts with no live source must terminate.
        cfg.mounts.insert(
            "/a".into(),
            MountConfig {
                fallback_mount: Some("/b".into()),
                ..MountConfig::default()
            },
        );
        cfg.mounts.insert(
            "/b".into(),
            MountConfig {
                fallback_mount: Some("/a".into()),
                ..MountConfig::default()
            },
        );
        assert!(reg.find_with_fallback("/a", &cfg).is_none());
    }
}
