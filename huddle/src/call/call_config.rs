use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Tunables for a call session. Every field has a default, so a config file only needs
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// how long to wait for the forwarding capability probe before falling back to mesh
    pub probe_timeout_ms: u64,
    /// how long any correlated request to the forwarding server may take
    pub request_timeout_ms: u64,
    /// STUN/TURN urls used by mesh connections
    pub ice_servers: Vec<String>,
    /// when false the probe is skipped and mesh is always used
    pub allow_forwarding: bool,
    pub event_channel_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 3_000,
            request_timeout_ms: 10_000,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            allow_forwarding: true,
            event_channel_capacity: 1024,
        }
    }
}

impl CallConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        let config: CallConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.probe_timeout_ms == 0 {
            return Err(Error::InvalidConfig("probe_timeout_ms must be > 0".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig("request_timeout_ms must be > 0".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "event_channel_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = CallConfig::from_toml_str(
            r#"
            request_timeout_ms = 2500
            allow_forwarding = false
            "#,
        )
        .expect("valid config");
        assert_eq!(config.request_timeout(), Duration::from_millis(2500));
        assert!(!config.allow_forwarding);
        assert_eq!(config.probe_timeout_ms, CallConfig::default().probe_timeout_ms);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let result = CallConfig::from_toml_str("probe_timeout_ms = 0");
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = CallConfig::load("/nonexistent/huddle-call.toml");
        assert!(matches!(result, Err(Error::IoError(_))));
    }
}
