//! Gateway configuration, loaded from `sensorhub.toml`.
//!
//! Every section carries `#[serde(default)]`, so a file only needs the keys
//! it wants to override. Missing file means built-in defaults.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_FILE: &str = "sensorhub.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub device: DeviceConfig,
    pub link: LinkConfig,
    pub bus: BusConfig,
    pub publish: PublishConfig,
    pub time: TimeConfig,
    pub uplink: UplinkConfig,
    pub logging: LoggingConfig,
}

/// How radio readings map onto aggregate records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanIn {
    /// Every node feeds the hub's own record.
    #[default]
    SingleHub,
    /// One record per sending node, keyed by its radio address.
    PerNode,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,
    pub fan_in: FanIn,
    /// Upper bound on tracked aggregate records; readings from further
    /// devices are ignored.
    pub max_devices: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "central_hub_01".to_string(),
            fan_in: FanIn::SingleHub,
            max_devices: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub max_retries: u8,
    pub wait_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    /// How long the daemon leaves the link `Failed` before resetting it.
    /// 0 makes the daemon exit with an error instead.
    pub failed_reset_delay_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            wait_timeout_ms: 30_000,
            reconnect_delay_ms: 1_000,
            failed_reset_delay_ms: 60_000,
        }
    }
}

impl LinkConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// `None` when a failed link should stop the daemon.
    pub fn failed_reset_delay(&self) -> Option<Duration> {
        (self.failed_reset_delay_ms > 0).then(|| Duration::from_millis(self.failed_reset_delay_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub capacity: usize,
    pub enqueue_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            enqueue_timeout_ms: 10,
        }
    }
}

impl BusConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub data_topic_prefix: String,
    pub event_topic_prefix: String,
    /// Periodic republish of every aggregate; 0 publishes only on update.
    pub publish_interval_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            data_topic_prefix: "project_data/".to_string(),
            event_topic_prefix: "project_events/".to_string(),
            publish_interval_ms: 0,
        }
    }
}

/// What the publisher does with data while the clock is unsynchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsyncedPolicy {
    /// Skip timestamp-dependent publication until the first sync.
    #[default]
    Withhold,
    /// Publish with milliseconds since boot and flag the payload.
    BootRelative,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    pub unsynced_policy: UnsyncedPolicy,
    pub servers: Vec<String>,
    pub resync_interval_s: u64,
    pub backward_jump_tolerance_ms: u64,
    pub query_timeout_ms: u64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            unsynced_policy: UnsyncedPolicy::Withhold,
            servers: vec![
                "ntp.aliyun.com".to_string(),
                "cn.pool.ntp.org".to_string(),
                "edu.ntp.org.cn".to_string(),
            ],
            resync_interval_s: 3_600,
            backward_jump_tolerance_ms: 1_000,
            query_timeout_ms: 2_000,
        }
    }
}

impl TimeConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_s)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub broker_addr: String,
    /// Inbound commands arrive on this prefix plus the device id.
    pub command_topic_prefix: String,
    pub radio_bind: String,
    pub outbound_queue: usize,
    pub connect_timeout_ms: u64,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            broker_addr: "127.0.0.1:1883".to_string(),
            command_topic_prefix: "project_cmd/".to_string(),
            radio_bind: "0.0.0.0:5555".to_string(),
            outbound_queue: 64,
            connect_timeout_ms: 5_000,
        }
    }
}

impl UplinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub status_interval_s: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            status_interval_s: 60,
        }
    }
}

impl GatewayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Try the given path, then `./sensorhub.toml` and `./config/sensorhub.toml`.
    pub fn load_or_default(explicit: Option<&Path>) -> Self {
        let mut paths: Vec<PathBuf> = Vec::new();
        if let Some(path) = explicit {
            paths.push(path.to_path_buf());
        }
        paths.push(PathBuf::from(DEFAULT_CONFIG_FILE));
        paths.push(PathBuf::from("config").join(DEFAULT_CONFIG_FILE));

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        info!("Loaded configuration from {}", path.display());
                        return config;
                    }
                    Err(e) => warn!("Failed to load {}: {}", path.display(), e),
                }
            }
        }

        warn!("No usable config file found, using defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.id.is_empty() {
            return Err(ConfigError::Invalid("device.id must not be empty".into()));
        }
        if self.link.max_retries == 0 {
            return Err(ConfigError::Invalid("link.max_retries must be at least 1".into()));
        }
        if self.device.max_devices == 0 {
            return Err(ConfigError::Invalid("device.max_devices must be at least 1".into()));
        }
        if self.bus.capacity == 0 {
            return Err(ConfigError::Invalid("bus.capacity must be at least 1".into()));
        }
        if self.uplink.outbound_queue == 0 {
            return Err(ConfigError::Invalid("uplink.outbound_queue must be at least 1".into()));
        }
        for (name, prefix) in [
            ("publish.data_topic_prefix", &self.publish.data_topic_prefix),
            ("publish.event_topic_prefix", &self.publish.event_topic_prefix),
            ("uplink.command_topic_prefix", &self.uplink.command_topic_prefix),
        ] {
            if prefix.is_empty() || !prefix.is_ascii() {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be non-empty ASCII"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_behaviour() {
        let config = GatewayConfig::default();
        assert_eq!(config.bus.capacity, 10);
        assert_eq!(config.bus.enqueue_timeout_ms, 10);
        assert_eq!(config.link.max_retries, 5);
        assert_eq!(config.publish.data_topic_prefix, "project_data/");
        assert_eq!(config.device.fan_in, FanIn::SingleHub);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = GatewayConfig::from_toml(
            r#"
            [link]
            max_retries = 8

            [time]
            unsynced_policy = "boot_relative"
            "#,
        )
        .unwrap();

        assert_eq!(config.link.max_retries, 8);
        assert_eq!(config.link.wait_timeout_ms, 30_000);
        assert_eq!(config.time.unsynced_policy, UnsyncedPolicy::BootRelative);
        assert_eq!(config.device.id, "central_hub_01");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(GatewayConfig::from_toml("[bus]\ncapacity = 0\n").is_err());
        assert!(GatewayConfig::from_toml("[link]\nmax_retries = 0\n").is_err());
        assert!(GatewayConfig::from_toml("[publish]\ndata_topic_prefix = \"\"\n").is_err());
        assert!(GatewayConfig::from_toml("[device]\nfan_in = \"mesh\"\n").is_err());
        assert!(GatewayConfig::from_toml("[device]\nmax_devices = 0\n").is_err());
    }

    #[test]
    fn test_zero_failed_reset_delay_means_exit() {
        let config = GatewayConfig::from_toml("[link]\nfailed_reset_delay_ms = 0\n").unwrap();
        assert_eq!(config.link.failed_reset_delay(), None);
        assert_eq!(
            GatewayConfig::default().link.failed_reset_delay(),
            Some(std::time::Duration::from_secs(60))
        );
    }
}
