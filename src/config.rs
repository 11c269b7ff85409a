//! # Stream Pipeline Configuration
//!
//! Runtime knobs for the decoders, harvesters and software store. All
//! fields have defaults, so an empty JSON object is a valid config:
//!
//! ```json
//! {
//!   "stop_after_harvester_match": false,
//!   "custom_regex": "token=([a-f0-9]+)"
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Per-direction byte cap for the SSH decoder. Large enough for the
/// version line plus one KexInit message.
pub const MAX_SSH_BUFFER: usize = 2255;

/// Bytes of the merged conversation handed to the credential harvesters.
pub const DEFAULT_HARVESTER_BANNER_SIZE: usize = 512;

/// Bytes of the server stream handed to the service probes.
pub const DEFAULT_SERVICE_BANNER_SIZE: usize = 512;

/// Worker threads running advisory enrichment.
pub const DEFAULT_ENRICHMENT_WORKERS: usize = 2;

/// Versions longer than this are truncated before they are stored.
pub const DEFAULT_VERSION_MAX_LEN: usize = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Run the credential harvesters and write credential records.
    pub credentials_enabled: bool,
    /// Stop harvesting a conversation after the first credential match.
    pub stop_after_harvester_match: bool,
    /// Stop service probe matching and CMS detection after the first
    /// matching product.
    pub stop_after_service_probe_match: bool,
    /// Skip the full probe sweep when the category expected for the port
    /// has no match.
    pub stop_after_service_category_miss: bool,
    /// Bytes of the server stream matched against the service probes.
    pub service_banner_size: usize,
    /// Bounds the regex input for the harvesters.
    pub harvester_banner_size: usize,
    /// Additional user supplied harvester pattern.
    pub custom_regex: Option<String>,
    /// Bounds the buffered bytes per SSH direction.
    pub ssh_buffer_cap: usize,
    pub version_max_len: usize,
    /// Size of the software enrichment pool.
    pub enrichment_workers: usize,
    /// Scan SMTP banners for `x.y.z` version strings.
    pub enable_generic_version_harvester: bool,
    /// Directory holding the fingerprint databases.
    pub database_dir: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            credentials_enabled: true,
            stop_after_harvester_match: true,
            stop_after_service_probe_match: true,
            stop_after_service_category_miss: false,
            service_banner_size: DEFAULT_SERVICE_BANNER_SIZE,
            harvester_banner_size: DEFAULT_HARVESTER_BANNER_SIZE,
            custom_regex: None,
            ssh_buffer_cap: MAX_SSH_BUFFER,
            version_max_len: DEFAULT_VERSION_MAX_LEN,
            enrichment_workers: DEFAULT_ENRICHMENT_WORKERS,
            enable_generic_version_harvester: true,
            database_dir: None,
        }
    }
}

impl StreamConfig {
    /// Load a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
        let config: StreamConfig = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable the input bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.harvester_banner_size == 0 {
            return Err(ConfigError::Invalid("harvester_banner_size must be > 0".into()));
        }
        if self.ssh_buffer_cap == 0 {
            return Err(ConfigError::Invalid("ssh_buffer_cap must be > 0".into()));
        }
        if self.service_banner_size == 0 {
            return Err(ConfigError::Invalid("service_banner_size must be > 0".into()));
        }
        if self.enrichment_workers == 0 {
            return Err(ConfigError::Invalid("enrichment_workers must be > 0".into()));
        }
        if let Some(re) = &self.custom_regex {
            regex::bytes::Regex::new(re)
                .map_err(|e| ConfigError::Regex(format!("custom_regex: {}", e)))?;
        }
        Ok(())
    }
}

/// Errors raised while loading or validating the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid regex: {0}")]
    Regex(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let c = StreamConfig::default();
        assert!(c.credentials_enabled);
        assert!(c.stop_after_harvester_match);
        assert!(c.stop_after_service_probe_match);
        assert!(!c.stop_after_service_category_miss);
        assert_eq!(c.service_banner_size, 512);
        assert_eq!(c.harvester_banner_size, 512);
        assert_eq!(c.ssh_buffer_cap, 2255);
        assert_eq!(c.version_max_len, 15);
        assert_eq!(c.enrichment_workers, 2);
    }

    #[test]
    fn test_zero_enrichment_workers_rejected() {
        let c = StreamConfig {
            enrichment_workers: 0,
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let c: StreamConfig =
            serde_json::from_str(r#"{"stop_after_harvester_match": false}"#).unwrap();
        assert!(!c.stop_after_harvester_match);
        assert_eq!(c.harvester_banner_size, 512);
    }

    #[test]
    fn test_invalid_custom_regex() {
        let c = StreamConfig {
            custom_regex: Some("(unclosed".into()),
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(ConfigError::Regex(_))));
    }

    #[test]
    fn test_from_json_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"harvester_banner_size": 1024}}"#).unwrap();
        let c = StreamConfig::from_json_file(f.path()).unwrap();
        assert_eq!(c.harvester_banner_size, 1024);
    }

    #[test]
    fn test_from_json_file_missing() {
        assert!(matches!(
            StreamConfig::from_json_file("/nonexistent/napse.json"),
            Err(ConfigError::IoError(_))
        ));
    }
}
