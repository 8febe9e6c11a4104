//! Published counters for mounts and the server.
//!
//! A flat keyed store the stats/YP/admin layers read from. Writers update
//! it from inside the source lock, so values for one mount are linearised;
//! readers take point-in-time snapshots. The special `global` namespace
//! carries server-wide counters.

use dashmap::DashMap;
use serde_json::{json, Value};

/// Namespace for server-wide counters.
pub const GLOBAL: &str = "global";

/// Keyed counter store, one namespace per mount plus [`GLOBAL`].
#[derive(Default)]
pub struct Stats {
    namespaces: DashMap<String, serde_json::Map<String, Value>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one value under a mount's namespace.
    pub fn set(&self, mount: &str, key: &str, value: impl Into<Value>) {
        self.namespaces
            .entry(mount.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Sets one server-wide value.
    pub fn set_global(&self, key: &str, value: impl Into<Value>) {
        self.set(GLOBAL, key, value);
    }

    /// Adds a signed delta to a numeric counter, creating it at the delta.
    pub fn add(&self, mount: &str, key: &str, delta: i64) {
        let mut ns = self.namespaces.entry(mount.to_string()).or_default();
        let current = ns.get(key).and_then(Value::as_i64).unwrap_or(0);
        ns.insert(key.to_string(), json!(current + delta));
    }

    pub fn get(&self, mount: &str, key: &str) -> Option<Value> {
        self.namespaces.get(mount).and_then(|ns| ns.get(key).cloned())
    }

    /// Point-in-time snapshot of one namespace as a JSON object.
    pub fn snapshot(&self, mount: &str) -> Option<Value> {
        self.namespaces
            .get(mount)
            .map(|ns| Value::Object(ns.clone()))
    }

    /// Drops a mount's namespace after the source is freed.
    pub fn remove_mount(&self, mount: &str) {
        self.namespaces.remove(mount);
    }

    pub fn mounts(&self) -> Vec<String> {
        self.namespaces.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_snapshot_round_trip() {
        let stats = Stats::new();
        stats.set("/live", "listeners", 3);
        stats.set("/live", "server_name", "test");
        let snap = stats.snapshot("/live").unwrap();
        assert_eq!(snap["listeners"], json!(3));
        assert_eq!(snap["server_name"], json!("test"));
    }

    #[test]
    fn add_accumulates_from_zero() {
        let stats = Stats::new();
        stats.add(GLOBAL, "sources", 1);
        stats.add(GLOBAL, "sources", 1);
        stats.add(GLOBAL, "sources", -1);
        assert_eq!(stats.get(GLOBAL, "sources"), Some(json!(1)));
    }

    #[test]
    fn removed_mount_disappears() {
        let stats = Stats::new();
        stats.set("/live", "listeners", 1);
        stats.remove_mount("/live");
        assert!(stats.snapshot("/live").is_none());
    }
}
