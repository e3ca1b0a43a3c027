use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::convert::OverflowPolicy;
use crate::error::{BridgeError, Result};
use crate::layout::{DEFAULT_INPUTS, DEFAULT_OUTPUTS, MAX_CHANNELS};
use crate::session::SessionPaths;

/// Environment variable naming the JSON file read by [`BridgeConfig::from_env`].
pub const CONFIG_ENV: &str = "HARMONIQ_BRIDGE_CONFIG";

pub const DEFAULT_PREFIX: &str = "harmoniq-bridge";

/// Settings shared by the server process and the driver.
///
/// Both sides must agree on `name_prefix` and `shm_dir`; the channel counts
/// only matter to the server, the driver reads them from the control block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Prefix of every shared object name.
    pub name_prefix: String,
    /// Directory holding the shared segments.
    pub shm_dir: PathBuf,
    pub inputs: u32,
    pub outputs: u32,
    /// Collector wait bound for the driver's reply; `null` waits forever.
    pub handshake_timeout_ms: Option<u64>,
    /// How often the driver's callback thread re-checks for shutdown.
    pub poll_interval_ms: u64,
    pub overflow: OverflowPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_PREFIX.to_string(),
            shm_dir: PathBuf::from("/dev/shm"),
            inputs: DEFAULT_INPUTS,
            outputs: DEFAULT_OUTPUTS,
            handshake_timeout_ms: Some(500),
            poll_interval_ms: 100,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|err| BridgeError::Config(format!("{}: {err}", path.display())))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(contents).map_err(|err| BridgeError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the file named by `HARMONIQ_BRIDGE_CONFIG`, or returns the
    /// defaults when the variable is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => {
                tracing::debug!(path = ?path, "loading bridge config");
                Self::load(PathBuf::from(path))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name_prefix.is_empty() {
            return Err(BridgeError::Config("name_prefix is empty".into()));
        }
        if self.name_prefix.contains('/') || self.name_prefix.contains('\0') {
            return Err(BridgeError::Config(format!(
                "name_prefix `{}` must not contain `/`",
                self.name_prefix
            )));
        }
        if self.inputs == 0 && self.outputs == 0 {
            return Err(BridgeError::Config("at least one channel is required".into()));
        }
        if self.inputs > MAX_CHANNELS || self.outputs > MAX_CHANNELS {
            return Err(BridgeError::Config(format!(
                "at most {MAX_CHANNELS} channels per direction are supported"
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(BridgeError::Config("poll_interval_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn paths(&self) -> SessionPaths {
        SessionPaths::new(&self.shm_dir, &self.name_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = BridgeConfig::from_json(r#"{ "inputs": 2, "overflow": "clamp" }"#).unwrap();
        assert_eq!(config.inputs, 2);
        assert_eq!(config.outputs, DEFAULT_OUTPUTS);
        assert_eq!(config.overflow, OverflowPolicy::Clamp);
        assert_eq!(config.handshake_timeout(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn null_timeout_waits_forever() {
        let config = BridgeConfig::from_json(r#"{ "handshake_timeout_ms": null }"#).unwrap();
        assert_eq!(config.handshake_timeout(), None);
    }

    #[test]
    fn bad_prefixes_are_rejected() {
        for prefix in ["", "a/b"] {
            let config = BridgeConfig {
                name_prefix: prefix.into(),
                ..BridgeConfig::default()
            };
            assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
        }
    }

    #[test]
    fn channel_free_session_is_rejected() {
        let config = BridgeConfig {
            inputs: 0,
            outputs: 0,
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn huge_channel_counts_are_a_config_error() {
        let err = BridgeConfig::from_json(r#"{ "inputs": 4294967295 }"#).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        fs::write(&path, r#"{ "name_prefix": "studio-a" }"#).unwrap();
        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.paths().ready, "/studio-a-ready");
        assert!(BridgeConfig::load(dir.path().join("missing.json")).is_err());
    }
}
