//! Configuration management for the audio relay

use crate::buffer::BufferSettings;
use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Configuration for the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address the HTTP server binds to (default: 127.0.0.1:3001)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// External extractor executable (default: yt-dlp)
    #[serde(default = "default_extractor_program")]
    pub extractor_program: String,

    /// Kill the extractor after this many seconds (default: 30)
    #[serde(default = "default_extractor_timeout")]
    pub extractor_timeout_secs: u64,

    /// Prefix the identifier is appended to when building the extractor input
    #[serde(default = "default_resource_url_prefix")]
    pub resource_url_prefix: String,

    /// Source descriptor cache TTL in seconds (default: 14400 = 4 hours)
    #[serde(default = "default_descriptor_ttl")]
    pub descriptor_ttl_secs: u64,

    /// Bytes served to a client on first contact (default: 2MB)
    #[serde(default = "default_initial_chunk")]
    pub initial_chunk_bytes: u64,

    /// Size of each upstream fetch window (default: 5MB)
    #[serde(default = "default_read_ahead")]
    pub read_ahead_bytes: u64,

    /// Per-resource memory ceiling (default: 50MB)
    #[serde(default = "default_max_buffer")]
    pub max_buffer_bytes: u64,

    /// Buffered bytes ahead of the client below which read-ahead starts (default: 1MB)
    #[serde(default = "default_low_water")]
    pub low_water_bytes: u64,

    /// Idle buffers are destroyed after this many seconds (default: 60)
    #[serde(default = "default_buffer_idle_ttl")]
    pub buffer_idle_ttl_secs: u64,

    /// Interval of the registry safety sweep in seconds (default: 120)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Upstream request timeout in seconds (default: 30)
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Log level for the binary (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions for serde
fn default_listen_address() -> String {
    "127.0.0.1:3001".to_string()
}

fn default_extractor_program() -> String {
    "yt-dlp".to_string()
}

fn default_extractor_timeout() -> u64 {
    30
}

fn default_resource_url_prefix() -> String {
    "https://www.youtube.com/watch?v=".to_string()
}

fn default_descriptor_ttl() -> u64 {
    4 * 60 * 60 // 4 hours
}

fn default_initial_chunk() -> u64 {
    2 * MIB
}

fn default_read_ahead() -> u64 {
    5 * MIB
}

fn default_max_buffer() -> u64 {
    50 * MIB
}

fn default_low_water() -> u64 {
    MIB
}

fn default_buffer_idle_ttl() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    2 * 60
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_address: default_listen_address(),
            extractor_program: default_extractor_program(),
            extractor_timeout_secs: default_extractor_timeout(),
            resource_url_prefix: default_resource_url_prefix(),
            descriptor_ttl_secs: default_descriptor_ttl(),
            initial_chunk_bytes: default_initial_chunk(),
            read_ahead_bytes: default_read_ahead(),
            max_buffer_bytes: default_max_buffer(),
            low_water_bytes: default_low_water(),
            buffer_idle_ttl_secs: default_buffer_idle_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            upstream_timeout_secs: default_upstream_timeout(),
            log_level: default_log_level(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(RelayConfig)` if loading and validation succeed
    /// * `Err(RelayError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            RelayError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let config: RelayConfig = serde_yaml::from_str(&content).map_err(|e| {
            RelayError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - all byte sizes must be > 0
    /// - initial_chunk_bytes <= read_ahead_bytes <= max_buffer_bytes
    /// - low_water_bytes < read_ahead_bytes
    /// - all durations must be > 0
    /// - extractor_program must not be empty
    /// - listen_address must be a socket address
    /// - log_level must be a known level
    pub fn validate(&self) -> Result<()> {
        if self.initial_chunk_bytes == 0
            || self.read_ahead_bytes == 0
            || self.max_buffer_bytes == 0
            || self.low_water_bytes == 0
        {
            return Err(RelayError::ConfigError(
                "buffer sizes must be greater than 0".to_string(),
            ));
        }

        if self.initial_chunk_bytes > self.read_ahead_bytes {
            return Err(RelayError::ConfigError(format!(
                "initial_chunk_bytes ({}) must not exceed read_ahead_bytes ({})",
                self.initial_chunk_bytes, self.read_ahead_bytes
            )));
        }

        if self.read_ahead_bytes > self.max_buffer_bytes {
            return Err(RelayError::ConfigError(format!(
                "read_ahead_bytes ({}) must not exceed max_buffer_bytes ({})",
                self.read_ahead_bytes, self.max_buffer_bytes
            )));
        }

        if self.low_water_bytes >= self.read_ahead_bytes {
            return Err(RelayError::ConfigError(format!(
                "low_water_bytes ({}) must be less than read_ahead_bytes ({})",
                self.low_water_bytes, self.read_ahead_bytes
            )));
        }

        if self.extractor_timeout_secs == 0
            || self.descriptor_ttl_secs == 0
            || self.buffer_idle_ttl_secs == 0
            || self.sweep_interval_secs == 0
            || self.upstream_timeout_secs == 0
        {
            return Err(RelayError::ConfigError(
                "timeouts, TTLs and intervals must be greater than 0".to_string(),
            ));
        }

        if self.extractor_program.trim().is_empty() {
            return Err(RelayError::ConfigError(
                "extractor_program must not be empty".to_string(),
            ));
        }

        self.listen_socket_addr()?;

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(RelayError::ConfigError(format!(
                    "Invalid log_level '{}', must be one of trace, debug, info, warn, error",
                    other
                )));
            }
        }

        Ok(())
    }

    /// Parsed listen address
    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        self.listen_address.parse().map_err(|e| {
            RelayError::ConfigError(format!(
                "Invalid listen_address '{}': {}",
                self.listen_address, e
            ))
        })
    }

    pub fn descriptor_ttl(&self) -> Duration {
        Duration::from_secs(self.descriptor_ttl_secs)
    }

    pub fn buffer_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.buffer_idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn extractor_timeout(&self) -> Duration {
        Duration::from_secs(self.extractor_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Per-resource buffer settings derived from this config
    pub fn buffer_settings(&self) -> BufferSettings {
        BufferSettings {
            capacity: self.max_buffer_bytes,
            idle_ttl: self.buffer_idle_ttl(),
        }
    }

    /// Update configuration from another config
    ///
    /// Validates the new configuration first; on failure `self` is untouched.
    pub fn update_from(&mut self, new_config: &RelayConfig) -> Result<ConfigChanges> {
        new_config.validate()?;
        let changes = ConfigChanges::between(self, new_config);
        *self = new_config.clone();
        Ok(changes)
    }

    /// This config with the settings a running relay can change taken from `other`
    ///
    /// Request sizing and the descriptor TTL are read per request; everything
    /// else is fixed once the relay and its server are built.
    pub fn with_runtime_settings(&self, other: &RelayConfig) -> RelayConfig {
        RelayConfig {
            initial_chunk_bytes: other.initial_chunk_bytes,
            read_ahead_bytes: other.read_ahead_bytes,
            low_water_bytes: other.low_water_bytes,
            descriptor_ttl_secs: other.descriptor_ttl_secs,
            ..self.clone()
        }
    }

    /// Reload configuration from file and apply changes
    pub fn reload_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<ConfigChanges> {
        let new_config = Self::from_file(path)?;
        self.update_from(&new_config)
    }
}

/// Description of configuration changes after hot reload
#[derive(Debug, Default, Clone)]
pub struct ConfigChanges {
    pub listen_address_changed: bool,
    pub extractor_changed: bool,
    pub descriptor_ttl_changed: bool,
    /// Initial chunk, read-ahead window or low-water mark
    pub buffer_sizes_changed: bool,
    pub buffer_capacity_changed: bool,
    pub eviction_changed: bool,
    pub upstream_timeout_changed: bool,
    pub log_level_changed: bool,
}

impl ConfigChanges {
    /// Compare two configurations field group by field group
    pub fn between(old: &RelayConfig, new: &RelayConfig) -> Self {
        ConfigChanges {
            listen_address_changed: old.listen_address != new.listen_address,
            extractor_changed: old.extractor_program != new.extractor_program
                || old.extractor_timeout_secs != new.extractor_timeout_secs
                || old.resource_url_prefix != new.resource_url_prefix,
            descriptor_ttl_changed: old.descriptor_ttl_secs != new.descriptor_ttl_secs,
            buffer_sizes_changed: old.initial_chunk_bytes != new.initial_chunk_bytes
                || old.read_ahead_bytes != new.read_ahead_bytes
                || old.low_water_bytes != new.low_water_bytes,
            buffer_capacity_changed: old.max_buffer_bytes != new.max_buffer_bytes,
            eviction_changed: old.buffer_idle_ttl_secs != new.buffer_idle_ttl_secs
                || old.sweep_interval_secs != new.sweep_interval_secs,
            upstream_timeout_changed: old.upstream_timeout_secs != new.upstream_timeout_secs,
            log_level_changed: old.log_level != new.log_level,
        }
    }

    /// Check if any changes were made
    pub fn has_changes(&self) -> bool {
        !self.summary().is_empty()
    }

    /// Check if any change only takes effect after a restart
    pub fn requires_restart(&self) -> bool {
        !self.restart_fields().is_empty()
    }

    /// Changed settings a running relay cannot apply
    pub fn restart_fields(&self) -> Vec<&'static str> {
        let flags = [
            (self.listen_address_changed, "listen_address"),
            (self.extractor_changed, "extractor"),
            (self.buffer_capacity_changed, "max_buffer_bytes"),
            (self.eviction_changed, "eviction"),
            (self.upstream_timeout_changed, "upstream_timeout_secs"),
            (self.log_level_changed, "log_level"),
        ];
        flags
            .iter()
            .filter(|(changed, _)| *changed)
            .map(|(_, name)| *name)
            .collect()
    }

    /// Get a summary of changes
    pub fn summary(&self) -> Vec<&'static str> {
        let flags = [
            (self.listen_address_changed, "listen_address"),
            (self.extractor_changed, "extractor"),
            (self.descriptor_ttl_changed, "descriptor_ttl_secs"),
            (self.buffer_sizes_changed, "buffer_sizes"),
            (self.buffer_capacity_changed, "max_buffer_bytes"),
            (self.eviction_changed, "eviction"),
            (self.upstream_timeout_changed, "upstream_timeout_secs"),
            (self.log_level_changed, "log_level"),
        ];
        flags
            .iter()
            .filter(|(changed, _)| *changed)
            .map(|(_, name)| *name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.initial_chunk_bytes, 2 * 1024 * 1024);
        assert_eq!(config.read_ahead_bytes, 5 * 1024 * 1024);
        assert_eq!(config.max_buffer_bytes, 50 * 1024 * 1024);
        assert_eq!(config.low_water_bytes, 1024 * 1024);
        assert_eq!(config.descriptor_ttl(), Duration::from_secs(4 * 3600));
        assert_eq!(config.sweep_interval(), Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_size_ordering() {
        let mut config = RelayConfig::default();
        config.initial_chunk_bytes = config.read_ahead_bytes + 1;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.read_ahead_bytes = config.max_buffer_bytes + 1;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.low_water_bytes = config.read_ahead_bytes;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_values() {
        let mut config = RelayConfig::default();
        config.max_buffer_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.descriptor_ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.sweep_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_listen_address_and_log_level() {
        let mut config = RelayConfig::default();
        config.listen_address = "not an address".to_string();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.extractor_program = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_hot_reload() {
        let mut config = RelayConfig::default();
        let mut new_config = RelayConfig::default();

        let changes = config.update_from(&new_config).unwrap();
        assert!(!changes.has_changes());

        new_config.read_ahead_bytes = 8 * 1024 * 1024;
        let changes = config.update_from(&new_config).unwrap();
        assert!(changes.buffer_sizes_changed);
        assert!(!changes.requires_restart());
        assert_eq!(config.read_ahead_bytes, 8 * 1024 * 1024);

        new_config.listen_address = "0.0.0.0:8080".to_string();
        let changes = config.update_from(&new_config).unwrap();
        assert!(changes.requires_restart());
        assert_eq!(changes.summary(), vec!["listen_address"]);
    }

    #[test]
    fn test_runtime_settings_only_take_sizing_and_ttl() {
        let current = RelayConfig::default();
        let mut new_config = RelayConfig::default();
        new_config.low_water_bytes = 512 * 1024;
        new_config.descriptor_ttl_secs = 600;
        new_config.max_buffer_bytes = 100 * 1024 * 1024;
        new_config.listen_address = "0.0.0.0:9000".to_string();

        let applied = current.with_runtime_settings(&new_config);
        assert_eq!(applied.low_water_bytes, 512 * 1024);
        assert_eq!(applied.descriptor_ttl_secs, 600);
        assert_eq!(applied.max_buffer_bytes, current.max_buffer_bytes);
        assert_eq!(applied.listen_address, current.listen_address);

        let changes = ConfigChanges::between(&current, &new_config);
        assert_eq!(
            changes.restart_fields(),
            vec!["listen_address", "max_buffer_bytes"]
        );
    }

    #[test]
    fn test_config_hot_reload_validation() {
        let mut config = RelayConfig::default();
        let mut new_config = RelayConfig::default();

        new_config.max_buffer_bytes = 1;
        assert!(config.update_from(&new_config).is_err());
        assert_eq!(config.max_buffer_bytes, 50 * 1024 * 1024);
    }
}
