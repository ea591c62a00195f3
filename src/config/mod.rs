use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_yml;
use thiserror::Error;

use crate::templates::{TemplateError, TemplateRegistry};

/* Highest primary address a device can be configured to, 251 to 255 are reserved */
pub const MAX_PRIMARY_ADDRESS: u8 = 250;

fn client_id_default() -> String { return "mbus2mqtt".to_string() }
fn topic_prefix_default() -> String { return "mbus2mqtt".to_string() }
fn device_default() -> String { return "/dev/ttyUSB0".to_string() }
fn baud_rate_default() -> u32 { return 2400 }
fn interval_sec_default() -> u64 { return 60 }
fn read_timeout_ms_default() -> u64 { return 1000 }
fn scan_timeout_ms_default() -> u64 { return 250 }
fn autodiscover_prefix_default() -> String { return "homeassistant".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct AutodiscoverConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default="autodiscover_prefix_default")]
    pub prefix: String,
}

impl Default for AutodiscoverConfig {
    fn default() -> Self {
        return AutodiscoverConfig { enabled: false, prefix: autodiscover_prefix_default() };
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MeterConfig {
    pub address: u8,
    pub template: String,
    pub name: String,
    /* Overrides the bridge wide serial device */
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default="client_id_default")]
    pub client_id: String,
    #[serde(default="topic_prefix_default")]
    pub topic_prefix: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default="device_default")]
    pub device: String,
    #[serde(default="baud_rate_default")]
    pub baud_rate: u32,
    #[serde(default="interval_sec_default")]
    pub interval_sec: u64,
    #[serde(default="read_timeout_ms_default")]
    pub read_timeout_ms: u64,
    #[serde(default="scan_timeout_ms_default")]
    pub scan_timeout_ms: u64,
    #[serde(default)]
    pub autodiscover: AutodiscoverConfig,
    #[serde(default)]
    pub meters: Vec<MeterConfig>,
    #[serde(default)]
    pub templates: TemplateRegistry,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to open file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to decode yaml: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("interval_sec must be greater than 0")]
    InvalidInterval,
    #[error("{0} must be greater than 0")]
    InvalidTimeout(&'static str),
    #[error("Meter {meter} uses address {address}, valid primary addresses are 0 to 250")]
    InvalidAddress { meter: String, address: u8 },
    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        debug!("Reading config from {path}");
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_string(), source })?;
        return Config::parse(&contents);
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yml::from_str(contents)?;
        config.validate()?;
        return Ok(config);
    }

    /// Everything that would make the bridge misbehave later is rejected here
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_sec == 0 {
            return Err(ConfigError::InvalidInterval);
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("read_timeout_ms"));
        }
        if self.scan_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("scan_timeout_ms"));
        }

        for meter in self.meters.iter() {
            if meter.address > MAX_PRIMARY_ADDRESS {
                return Err(ConfigError::InvalidAddress { meter: meter.name.clone(), address: meter.address });
            }
        }

        self.templates.validate(&self.meters)?;

        /* Not fatal, but topics and unique ids will collide */
        for (template, sensor) in self.templates.duplicate_names() {
            warn!("Template {template} uses the sensor name {sensor} more than once");
        }
        let mut names = HashSet::new();
        for meter in self.meters.iter() {
            if !names.insert(meter.name.as_str()) {
                warn!("Meter name {} is used more than once", meter.name);
            }
        }

        return Ok(());
    }

    pub fn meter_device<'a>(&'a self, meter: &'a MeterConfig) -> &'a str {
        return meter.device.as_deref().unwrap_or(&self.device);
    }

    pub fn interval(&self) -> Duration {
        return Duration::from_secs(self.interval_sec);
    }

    pub fn read_timeout(&self) -> Duration {
        return Duration::from_millis(self.read_timeout_ms);
    }

    pub fn scan_timeout(&self) -> Duration {
        return Duration::from_millis(self.scan_timeout_ms);
    }

    pub fn status_topic(&self) -> String {
        return format!("{}/status", self.topic_prefix);
    }
}
