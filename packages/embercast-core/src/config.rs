//! Global and per-mount configuration types.
//!
//! [`Config`] carries the server-wide knobs, [`MountConfig`] the per-mount
//! overrides. The engine holds the active config as a reference-counted
//! snapshot; tick code acquires the snapshot, reads, and drops it - nothing
//! retains a snapshot across ticks, so a reload takes effect at the next
//! tick boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default cap on queued stream bytes per mount.
pub const DEFAULT_QUEUE_SIZE_LIMIT: usize = 500_000;

/// Default size of the burst window kept behind the tail.
pub const DEFAULT_MIN_QUEUE_SIZE: usize = 65_536;

/// Default burst handed to a connecting listener.
pub const DEFAULT_BURST_SIZE: usize = 65_536;

/// Default seconds without producer data before a source times out.
pub const DEFAULT_SOURCE_TIMEOUT: u64 = 10;

/// Seconds between per-source stats publications.
pub const DEFAULT_STATS_INTERVAL: u64 = 5;

/// Per-mount configuration.
///
/// Unset numeric fields inherit the global value; `-1` disables a cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Mount listeners migrate to when this one terminates.
    pub fallback_mount: Option<String>,
    /// When this mount starts, steal the fallback mount's listeners.
    pub fallback_override: bool,
    /// When full, hop new listeners to the fallback instead of rejecting.
    pub fallback_when_full: bool,

    /// Maximum concurrent listeners (-1 = unlimited).
    pub max_listeners: i64,
    /// Maximum outgoing bandwidth in bits/sec (-1 = off).
    pub max_bandwidth: i64,
    /// Maximum seconds a listener may stay connected (0 = unlimited).
    pub max_listener_duration: u64,
    /// Maximum seconds the producer may stream (0 = unlimited).
    pub max_stream_duration: u64,

    pub source_timeout: Option<u64>,
    pub queue_size_limit: Option<usize>,
    pub min_queue_size: Option<usize>,
    pub burst_size: Option<usize>,

    /// Expected incoming rate in bits/sec (0 = unknown). Used as the
    /// bandwidth share of a listener before the rolling rate settles.
    pub limit_rate: u64,
    /// Pause between idle listener ticks, in milliseconds.
    pub wait_time: u64,

    /// Dump file path, `%`-expanded against local time at source init.
    pub dumpfile: Option<String>,
    /// File replayed to listeners waiting for the queue to fill.
    pub intro_filename: Option<String>,

    /// Script spawned (detached) when the source starts.
    pub on_connect: Option<String>,
    /// Script spawned (detached) when the source ends.
    pub on_disconnect: Option<String>,

    pub stream_name: Option<String>,
    pub stream_description: Option<String>,
    pub stream_url: Option<String>,
    pub stream_genre: Option<String>,

    /// Content type override (e.g. `audio/mpeg`).
    #[serde(rename = "type")]
    pub stream_type: Option<String>,
    pub subtype: Option<String>,
    pub bitrate: Option<String>,

    pub yp_public: bool,
    pub hidden: bool,

    /// Keep listeners paused instead of dropping them when the source
    /// disconnects without a fallback.
    pub pause_listeners: bool,
    /// Reserve the mount without requiring a connected producer.
    pub on_demand: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fallback_mount: None,
            fallback_override: false,
            fallback_when_full: false,
            max_listeners: -1,
            max_bandwidth: -1,
            max_listener_duration: 0,
            max_stream_duration: 0,
            source_timeout: None,
            queue_size_limit: None,
            min_queue_size: None,
            burst_size: None,
            limit_rate: 0,
            wait_time: 100,
            dumpfile: None,
            intro_filename: None,
            on_connect: None,
            on_disconnect: None,
            stream_name: None,
            stream_description: None,
            stream_url: None,
            stream_genre: None,
            stream_type: None,
            subtype: None,
            bitrate: None,
            yp_public: false,
            hidden: false,
            pause_listeners: false,
            on_demand: false,
        }
    }
}

/// Global configuration for the streaming core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hostname: String,
    pub port: u16,

    /// Cap on queued stream bytes per mount.
    pub queue_size_limit: usize,
    /// Burst window kept behind the tail for reconnecting listeners.
    pub min_queue_size: usize,
    /// Default burst handed to a connecting listener.
    pub burst_size: usize,
    /// Seconds without producer data before a source times out.
    pub source_timeout: u64,
    /// Maximum concurrent sources.
    pub source_limit: usize,
    /// Global outgoing bandwidth cap in bits/sec (0 = off).
    pub max_bandwidth: u64,
    /// Root for intro and fallback files.
    pub webroot_dir: String,
    /// Seconds between per-source stats publications.
    pub stats_interval: u64,

    /// Per-mount overrides keyed by mount name.
    pub mounts: BTreeMap<String, MountConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "localhost".into(),
            port: 8000,
            queue_size_limit: DEFAULT_QUEUE_SIZE_LIMIT,
            min_queue_size: DEFAULT_MIN_QUEUE_SIZE,
            burst_size: DEFAULT_BURST_SIZE,
            source_timeout: DEFAULT_SOURCE_TIMEOUT,
            source_limit: 16,
            max_bandwidth: 0,
            webroot_dir: "webroot".into(),
            stats_interval: DEFAULT_STATS_INTERVAL,
            mounts: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_size_limit == 0 {
            return Err("queue_size_limit must be >= 1".to_string());
        }
        if self.min_queue_size > self.queue_size_limit {
            return Err("min_queue_size must not exceed queue_size_limit".to_string());
        }
        if self.burst_size > self.min_queue_size {
            return Err("burst_size must not exceed min_queue_size".to_string());
        }
        if self.source_limit == 0 {
            return Err("source_limit must be >= 1".to_string());
        }
        for (mount, mc) in &self.mounts {
            let limit = mc.queue_size_limit.unwrap_or(self.queue_size_limit);
            let min = mc.min_queue_size.unwrap_or(self.min_queue_size);
            let burst = mc.burst_size.unwrap_or(self.burst_size);
            if min > limit {
                return Err(format!("{mount}: min_queue_size exceeds queue_size_limit"));
            }
            if burst > min {
                return Err(format!("{mount}: burst_size exceeds min_queue_size"));
            }
        }
        Ok(())
    }

    /// Returns the mount's config, or the default when none is declared.
    pub fn mount(&self, mount: &str) -> MountConfig {
        self.mounts.get(mount).cloned().unwrap_or_default()
    }

    /// Effective queue byte cap for a mount.
    pub fn queue_size_limit_for(&self, mc: &MountConfig) -> usize {
        mc.queue_size_limit.unwrap_or(self.queue_size_limit)
    }

    /// Effective burst window size for a mount.
    pub fn min_queue_size_for(&self, mc: &MountConfig) -> usize {
        mc.min_queue_size.unwrap_or(self.min_queue_size)
    }

    /// Effective default burst for a mount.
    pub fn burst_size_for(&self, mc: &MountConfig) -> usize {
        mc.burst_size.unwrap_or(self.burst_size)
    }

    /// Effective producer timeout for a mount.
    pub fn source_timeout_for(&self, mc: &MountConfig) -> u64 {
        mc.source_timeout.unwrap_or(self.source_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn min_queue_cannot_exceed_limit() {
        let cfg = Config {
            min_queue_size: 600_000,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mount_overrides_are_checked() {
        let mut cfg = Config::default();
        cfg.mounts.insert(
            "/live".into(),
            MountConfig {
                queue_size_limit: Some(1000),
                ..MountConfig::default()
            },
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mount_burst_cannot_exceed_inherited_min_queue() {
        let mut cfg = Config::default();
        // No min_queue_size override, so the burst is checked against the
        // inherited global window.
        cfg.mounts.insert(
            "/live".into(),
            MountConfig {
                burst_size: Some(200_000),
                ..MountConfig::default()
            },
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_mount_gets_defaults() {
        let cfg = Config::default();
        let mc = cfg.mount("/anything");
        assert_eq!(mc.max_listeners, -1);
        assert_eq!(cfg.burst_size_for(&mc), DEFAULT_BURST_SIZE);
    }
}
