//! Configuration management
//!
//! Relay settings come from three places: a persisted TOML settings file,
//! command-line overrides, and an exported configuration blob (the text a
//! configuration QR code decodes to). [`RelaySettings`] is the loosely-typed
//! union of those sources; [`RelaySettings::validate`] turns it into the
//! checked [`RelayConfig`] the relay engine starts from.

use crate::masking;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Configuration errors. Missing start parameters are fatal and abort
/// startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Port to listen not specified")]
    MissingListenPort,

    #[error("Target hostname not specified")]
    MissingRemoteHost,

    #[error("Target port not specified")]
    MissingRemotePort,

    #[error("Obfuscation key not specified")]
    MissingKey,

    #[error("Invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Persisted relay settings; every field optional until validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Local port the relay listens on (loopback only)
    pub listen_port: Option<u16>,
    /// Remote tunnel endpoint hostname or address
    pub remote_host: Option<String>,
    /// Remote tunnel endpoint port
    pub remote_port: Option<u16>,
    /// Obfuscation key (raw text, used as bytes)
    pub key: Option<String>,
    /// Masking strategy id from the registry
    #[serde(default = "default_masking")]
    pub masking: String,
}

fn default_masking() -> String {
    "none".to_string()
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen_port: None,
            remote_host: None,
            remote_port: None,
            key: None,
            masking: default_masking(),
        }
    }
}

impl RelaySettings {
    /// Load settings from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save settings to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Parse an exported configuration blob: line-oriented `key = value`
    /// pairs, ignoring blank lines, `#`/`;` comments, and `[section]`
    /// headers. Unrecognized keys are skipped. Recognized keys are merged
    /// over `self`.
    pub fn apply_import(&mut self, text: &str) -> Result<(), ConfigError> {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                debug!("Skipping unparsable import line: {}", line);
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "source-lport" => {
                    let port = value.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                        reason: e.to_string(),
                    })?;
                    self.listen_port = Some(port);
                }
                "target" => {
                    let (host, port) =
                        value
                            .rsplit_once(':')
                            .ok_or_else(|| ConfigError::InvalidValue {
                                key: key.to_string(),
                                value: value.to_string(),
                                reason: "expected host:port".to_string(),
                            })?;
                    let port = port.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                        reason: e.to_string(),
                    })?;
                    self.remote_host = Some(host.to_string());
                    self.remote_port = Some(port);
                }
                "key" => {
                    self.key = Some(value.to_string());
                }
                "masking" => match masking::resolve(value) {
                    Some(kind) => self.masking = kind.id.to_string(),
                    None => {
                        warn!("Unknown masking '{}' in import, using no masking", value);
                        self.masking = default_masking();
                    }
                },
                other => {
                    debug!("Ignoring unrecognized import key '{}'", other);
                }
            }
        }
        Ok(())
    }

    /// Parse a fresh settings record from an exported configuration blob.
    pub fn from_import_str(text: &str) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        settings.apply_import(text)?;
        Ok(settings)
    }

    /// Check that every required start parameter is present and produce the
    /// validated configuration the relay starts from.
    pub fn validate(&self) -> Result<RelayConfig, ConfigError> {
        let listen_port = self.listen_port.ok_or(ConfigError::MissingListenPort)?;
        let remote_host = self
            .remote_host
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or(ConfigError::MissingRemoteHost)?;
        let remote_port = self.remote_port.ok_or(ConfigError::MissingRemotePort)?;
        let key = self
            .key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::MissingKey)?;

        Ok(RelayConfig {
            listen_port,
            remote_host,
            remote_port,
            key: key.into_bytes(),
            masking: self.masking.clone(),
        })
    }
}

/// Validated relay start parameters.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub key: Vec<u8>,
    pub masking: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_parses_exported_blob() {
        let blob = "[main]\n\
                    source-lport = 3333\n\
                    target = 2.2.2.2:1111\n\
                    key = Ipy:SMOQnfxK6>;Ks<?njL#0ta|W:To-e)Vb;+h?O&(|E!7nA73F&;x&uGi_X*Ja\n\
                    masking = NONE\n\
                    verbose = INFO";

        let settings = RelaySettings::from_import_str(blob).unwrap();
        assert_eq!(settings.listen_port, Some(3333));
        assert_eq!(settings.remote_host.as_deref(), Some("2.2.2.2"));
        assert_eq!(settings.remote_port, Some(1111));
        assert_eq!(
            settings.key.as_deref(),
            Some("Ipy:SMOQnfxK6>;Ks<?njL#0ta|W:To-e)Vb;+h?O&(|E!7nA73F&;x&uGi_X*Ja")
        );
        assert_eq!(settings.masking, "none");
    }

    #[test]
    fn import_skips_comments_and_sections() {
        let blob = "# leading comment\n\
                    ; alt comment\n\
                    [section]\n\
                    \n\
                    source-lport = 51820\n\
                    masking = Stun";
        let settings = RelaySettings::from_import_str(blob).unwrap();
        assert_eq!(settings.listen_port, Some(51820));
        assert_eq!(settings.masking, "stun");
    }

    #[test]
    fn import_rejects_bad_port() {
        let err = RelaySettings::from_import_str("source-lport = notaport").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = RelaySettings::from_import_str("target = hostonly").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn import_unknown_masking_falls_back() {
        let settings = RelaySettings::from_import_str("masking = carrier-pigeon").unwrap();
        assert_eq!(settings.masking, "none");
    }

    #[test]
    fn validation_requires_all_parameters() {
        let mut settings = RelaySettings::default();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingListenPort)
        ));

        settings.listen_port = Some(3333);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingRemoteHost)
        ));

        settings.remote_host = Some("demo.wg.example".to_string());
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingRemotePort)
        ));

        settings.remote_port = Some(51820);
        assert!(matches!(settings.validate(), Err(ConfigError::MissingKey)));

        settings.key = Some(String::new());
        assert!(matches!(settings.validate(), Err(ConfigError::MissingKey)));

        settings.key = Some("secret".to_string());
        let config = settings.validate().unwrap();
        assert_eq!(config.listen_port, 3333);
        assert_eq!(config.remote_host, "demo.wg.example");
        assert_eq!(config.remote_port, 51820);
        assert_eq!(config.key, b"secret");
        assert_eq!(config.masking, "none");
    }

    #[test]
    fn settings_toml_round_trip() {
        let settings = RelaySettings {
            listen_port: Some(3333),
            remote_host: Some("2.2.2.2".to_string()),
            remote_port: Some(1111),
            key: Some("secret".to_string()),
            masking: "stun".to_string(),
        };
        let text = toml::to_string_pretty(&settings).unwrap();
        let restored: RelaySettings = toml::from_str(&text).unwrap();
        assert_eq!(restored.listen_port, settings.listen_port);
        assert_eq!(restored.remote_host, settings.remote_host);
        assert_eq!(restored.remote_port, settings.remote_port);
        assert_eq!(restored.key, settings.key);
        assert_eq!(restored.masking, settings.masking);
    }
}
