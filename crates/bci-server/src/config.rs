//! Server configuration, loaded from a JSON file

use bci_core::{config_error, BciResult};
use bci_device::{BoardConfig, DeviceConfig};
use bci_processing::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broadcast hub and subscriber delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Messages buffered per subscriber before it is dropped
    pub subscriber_queue: usize,
    /// Keep-alive ping period per subscriber
    pub ping_period_ms: u64,
    /// Bound on a single write to a subscriber
    pub write_timeout_ms: u64,
    /// Messages buffered between the pipeline and the hub
    pub broadcast_queue: usize,
    /// Hub control requests buffered in front of the hub
    pub command_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            subscriber_queue: 32,
            ping_period_ms: 54_000,
            write_timeout_ms: 1_000,
            broadcast_queue: 32,
            command_queue: 32,
        }
    }
}

impl HubConfig {
    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn validate(&self) -> BciResult<()> {
        if self.subscriber_queue == 0 || self.broadcast_queue == 0 || self.command_queue == 0 {
            return Err(config_error!("hub queue capacities must be positive"));
        }
        if self.ping_period_ms == 0 || self.write_timeout_ms == 0 {
            return Err(config_error!("ping period and write timeout must be positive"));
        }
        Ok(())
    }
}

/// Top-level configuration; every field is optional in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the subscriber endpoint
    pub bind: String,
    /// Samples buffered in front of the pipeline
    pub sample_queue: usize,
    pub device: DeviceConfig,
    /// Used when `device.port` is unset
    pub board: BoardConfig,
    pub pipeline: PipelineConfig,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "127.0.0.1:8080".to_string(),
            sample_queue: 1024,
            device: DeviceConfig::default(),
            board: BoardConfig::default(),
            pipeline: PipelineConfig::default(),
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_json(text: &str) -> BciResult<Self> {
        let config: ServerConfig = serde_json::from_str(text)
            .map_err(|e| config_error!("malformed configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BciResult<()> {
        if self.sample_queue == 0 {
            return Err(config_error!("sample queue must be positive"));
        }
        self.device.validate()?;
        self.pipeline.validate()?;
        self.hub.validate()
    }
}
