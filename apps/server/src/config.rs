//! Server configuration.
//!
//! A thin YAML wrapper around the core [`Config`]: transport knobs live
//! here, everything the streaming core understands nests under `core`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use embercast_core::Config;

/// Configuration loaded from YAML.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the TCP acceptor binds to.
    pub bind_address: String,

    /// Number of cooperative worker threads.
    pub workers: usize,

    /// Streaming core configuration (mounts, limits, timeouts).
    pub core: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            workers: 2,
            core: Config::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, or defaults when none given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {path:?}"))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing {path:?}"))?
        } else {
            Self::default()
        };
        config
            .core
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid core config: {e}"))?;
        if config.workers == 0 {
            anyhow::bail!("workers must be >= 1");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.core.validate().is_ok());
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = r#"
bind_address: "127.0.0.1"
workers: 4
core:
  port: 9000
  burst_size: 32768
  mounts:
    /live:
      fallback_mount: /backup
      max_listeners: 100
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.core.port, 9000);
        let mc = config.core.mount("/live");
        assert_eq!(mc.fallback_mount.as_deref(), Some("/backup"));
        assert_eq!(mc.max_listeners, 100);
    }
}
