use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, Result, WrapErr};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::blink::DEFAULT_HALF_PERIOD;
use crate::mock::MockPins;
use crate::pin::{PinId, PinInterface, SysfsPins};

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sysfs,
    Mock,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GpioConfig {
    pub backend: Backend,
    pub export_settle_ms: u64,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sysfs,
            export_settle_ms: 90,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SocketConfig {
    pub path: PathBuf,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/beacon.sock"),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BlinkConfig {
    pub half_period_ms: u64,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            half_period_ms: DEFAULT_HALF_PERIOD.as_millis() as u64,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ActuatorConfig {
    pub name: String,
    pub pin: PinId,
}

fn default_true() -> bool {
    true
}

fn default_poll_ms() -> u64 {
    100
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SensorConfig {
    pub name: String,
    pub pin: PinId,
    #[serde(default = "default_true")]
    pub active_low: bool,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub gpio: GpioConfig,
    pub socket: SocketConfig,
    pub blink: BlinkConfig,
    pub sensor: Option<SensorConfig>,
    /// Registration order is file order.
    #[serde(rename = "actuator")]
    pub actuators: Vec<ActuatorConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            gpio: GpioConfig::default(),
            socket: SocketConfig::default(),
            blink: BlinkConfig::default(),
            sensor: None,
            actuators: Vec::new(),
        }
    }
}

impl Config {
    pub fn half_period(&self) -> Duration {
        Duration::from_millis(self.blink.half_period_ms)
    }

    pub fn export_settle(&self) -> Duration {
        Duration::from_millis(self.gpio.export_settle_ms)
    }

    pub fn pins(&self) -> Arc<dyn PinInterface> {
        match self.gpio.backend {
            Backend::Sysfs => Arc::new(SysfsPins::new(self.export_settle())),
            Backend::Mock => Arc::new(MockPins::new()),
        }
    }

    pub fn actuator_entries(&self) -> Vec<(String, PinId)> {
        self.actuators
            .iter()
            .map(|a| (a.name.clone(), a.pin))
            .collect()
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).wrap_err("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects periods the blink task and the poll timer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.blink.half_period_ms == 0 {
            bail!("blink.half_period_ms must be at least 1");
        }
        if let Some(sensor) = &self.sensor {
            if sensor.poll_ms == 0 {
                bail!("sensor.poll_ms must be at least 1");
            }
        }
        Ok(())
    }
}

fn find_config_file() -> Option<PathBuf> {
    xdg::BaseDirectories::with_prefix("beacon")
        .ok()?
        .find_config_file("config.toml")
}

/// Reads `path`, or `$XDG_CONFIG_HOME/beacon/config.toml` when no path is
/// given. Falls back to defaults if neither exists.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match find_config_file() {
            Some(found) => found,
            None => {
                info!("No config file found, using defaults");
                return Ok(Config::default());
            }
        },
    };
    let text = std::fs::read_to_string(&path)
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    let config = Config::from_toml(&text).wrap_err_with(|| format!("parsing {}", path.display()))?;
    info!("Loaded config from {}", path.display());
    debug!("{:#?}", config);
    Ok(config)
}
