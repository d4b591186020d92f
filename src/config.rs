//! Configuration management for the arm-ecd daemon.
//!
//! Handles loading, parsing, and validation of the YAML configuration file.
//! Every field has a default, so the daemon also runs without a file.

use crate::{
    drivers::i2c_ec::{SessionOptions, device_io::RetryPolicy},
    fan_curve::Point,
    models::{IDENTITY_PATH, Model},
    temperature_sensors::thermal_zone::THERMAL_ROOT,
};
use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "ARM_ECD_CONFIG";

/// Main configuration structure.
///
/// # Example
///
/// ```yaml
/// version: 1
/// report_interval_ms: 2000
///
/// bus:
///   adapter: "b94000.i2c"
///   retries: 3
///
/// thermal:
///   zones: ["cpu0-0-top-thermal", "gpuss-0-thermal"]
///
/// effects:
///   max_fan_step: 32
///
/// fan_curve:
///   interval_ms: 2000
///   curve:
///     kind: step-curve
///     tmps: [40.0, 60.0, 80.0]
///     spds: [60, 140, 255]
///
/// keyboard_fire:
///   period_ms: 1000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    #[serde(default)]
    pub bus: BusCfg,

    #[serde(default)]
    pub thermal: ThermalCfg,

    /// File holding the firmware model string.
    #[serde(default = "defaults::identity_path")]
    pub identity_path: PathBuf,

    /// Temperature report period. The model's default when absent.
    #[serde(default)]
    pub report_interval_ms: Option<u64>,

    #[serde(default)]
    pub effects: EffectsCfg,

    /// Manual fan control driven by a curve. Off when absent.
    #[serde(default)]
    pub fan_curve: Option<FanCurveCfg>,

    /// Temperature-coloured keyboard backlight. Off when absent.
    #[serde(default)]
    pub keyboard_fire: Option<KeyboardFireCfg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusCfg {
    /// Platform device name of the I2C controller.
    #[serde(default = "defaults::adapter")]
    pub adapter: String,

    #[serde(default = "defaults::sysfs_root")]
    pub sysfs_root: PathBuf,

    #[serde(default = "defaults::dev_root")]
    pub dev_root: PathBuf,

    /// Attempts per transfer, the first included.
    #[serde(default = "defaults::retries")]
    pub retries: u32,

    #[serde(default = "defaults::retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long to wait for the EC mailbox to become idle.
    #[serde(default = "defaults::settle_timeout_ms")]
    pub settle_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalCfg {
    /// Thermal zone types; the hottest one is reported.
    #[serde(default = "defaults::zones")]
    pub zones: Vec<String>,

    #[serde(default = "defaults::thermal_root")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectsCfg {
    /// Largest fan speed change (0-255 scale) between consecutive writes.
    #[serde(default = "defaults::max_fan_step")]
    pub max_fan_step: u8,

    /// Upper bound on the hold time of one effect sequence.
    #[serde(default = "defaults::max_sequence_ms")]
    pub max_sequence_ms: u64,
}

/// Fan curve variants, temperature in °C to raw speed 0-255.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CurveCfg {
    Constant {
        speed: u8,
    },
    /// Linear interpolation between points.
    StepCurve {
        tmps: Vec<f32>,
        spds: Vec<u8>,
    },
    /// Cubic Bezier through four control points.
    Bezier {
        points: Vec<Point>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanCurveCfg {
    pub curve: CurveCfg,

    /// Fan indices to drive. All fans when absent.
    #[serde(default)]
    pub fans: Option<Vec<u8>>,

    #[serde(default = "defaults::curve_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyboardFireCfg {
    #[serde(default = "defaults::fire_period_ms")]
    pub period_ms: u64,

    /// Below this the backlight is dark.
    #[serde(default = "defaults::fire_min_temp")]
    pub min_temp: f32,

    /// Blue starts mixing in above this.
    #[serde(default = "defaults::fire_blue_temp")]
    pub blue_temp: f32,

    /// Span over which a channel goes from 0 to full.
    #[serde(default = "defaults::fire_temp_range")]
    pub temp_range: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            bus: BusCfg::default(),
            thermal: ThermalCfg::default(),
            identity_path: defaults::identity_path(),
            report_interval_ms: None,
            effects: EffectsCfg::default(),
            fan_curve: None,
            keyboard_fire: None,
        }
    }
}

impl Default for BusCfg {
    fn default() -> Self {
        Self {
            adapter: defaults::adapter(),
            sysfs_root: defaults::sysfs_root(),
            dev_root: defaults::dev_root(),
            retries: defaults::retries(),
            retry_backoff_ms: defaults::retry_backoff_ms(),
            settle_timeout_ms: defaults::settle_timeout_ms(),
        }
    }
}

impl Default for ThermalCfg {
    fn default() -> Self {
        Self {
            zones: defaults::zones(),
            root: defaults::thermal_root(),
        }
    }
}

impl Default for EffectsCfg {
    fn default() -> Self {
        Self {
            max_fan_step: defaults::max_fan_step(),
            max_sequence_ms: defaults::max_sequence_ms(),
        }
    }
}

impl Default for KeyboardFireCfg {
    fn default() -> Self {
        Self {
            period_ms: defaults::fire_period_ms(),
            min_temp: defaults::fire_min_temp(),
            blue_temp: defaults::fire_blue_temp(),
            temp_range: defaults::fire_temp_range(),
        }
    }
}

impl Config {
    /// Validates the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.bus.retries == 0 {
            bail!("bus.retries must be at least 1");
        }
        if self.bus.settle_timeout_ms == 0 {
            bail!("bus.settle_timeout_ms must be positive");
        }
        if self.thermal.zones.is_empty() {
            bail!("thermal.zones cannot be empty");
        }
        if self.report_interval_ms == Some(0) {
            bail!("report_interval_ms must be positive");
        }
        if self.effects.max_fan_step == 0 {
            bail!("effects.max_fan_step must be positive");
        }

        if let Some(fan_curve) = &self.fan_curve {
            if fan_curve.interval_ms == 0 {
                bail!("fan_curve.interval_ms must be positive");
            }
            if fan_curve.fans.as_ref().is_some_and(|fans| fans.is_empty()) {
                bail!("fan_curve.fans cannot be empty");
            }
            match &fan_curve.curve {
                CurveCfg::Constant { .. } => {}
                CurveCfg::StepCurve { tmps, spds } => {
                    if tmps.len() != spds.len() {
                        bail!(
                            "Step curve has mismatched temperatures ({}) and speeds ({})",
                            tmps.len(),
                            spds.len()
                        );
                    }
                    if tmps.is_empty() {
                        bail!("Step curve cannot be empty");
                    }
                    if tmps.windows(2).any(|w| w[0] >= w[1]) {
                        bail!("Step curve temperatures must be strictly increasing");
                    }
                }
                CurveCfg::Bezier { points } => {
                    if points.len() != 4 {
                        bail!("Bezier curve must have 4 points, got {}", points.len());
                    }
                }
            }
        }

        if let Some(fire) = &self.keyboard_fire {
            if fire.temp_range <= 0.0 {
                bail!("keyboard_fire.temp_range must be positive");
            }
            if fire.period_ms == 0 {
                bail!("keyboard_fire.period_ms must be positive");
            }
        }

        Ok(())
    }

    /// Report period, kept between the model's write interval and half its
    /// watchdog.
    pub fn report_interval(&self, model: &Model) -> Duration {
        let timing = model.timing;
        self.report_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(timing.report_interval)
            .clamp(timing.min_write_interval, timing.watchdog_interval / 2)
    }

    /// Longest effect sequence that still leaves the watchdog comfortable.
    pub fn max_sequence_duration(&self, model: &Model) -> Duration {
        let headroom = model
            .timing
            .watchdog_interval
            .saturating_sub(self.report_interval(model) * 2);
        Duration::from_millis(self.effects.max_sequence_ms).min(headroom)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.bus.retries,
            backoff: Duration::from_millis(self.bus.retry_backoff_ms),
        }
    }

    pub fn session_options(&self) -> SessionOptions<'_> {
        SessionOptions {
            adapter: &self.bus.adapter,
            sysfs_root: &self.bus.sysfs_root,
            dev_root: &self.bus.dev_root,
            retry: self.retry_policy(),
            settle_timeout: Duration::from_millis(self.bus.settle_timeout_ms),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn identity_path() -> PathBuf {
        PathBuf::from(super::IDENTITY_PATH)
    }

    pub fn adapter() -> String {
        "b94000.i2c".to_string()
    }

    pub fn sysfs_root() -> PathBuf {
        PathBuf::from("/sys/bus/platform/devices")
    }

    pub fn dev_root() -> PathBuf {
        PathBuf::from("/dev")
    }

    pub fn retries() -> u32 {
        3
    }

    pub fn retry_backoff_ms() -> u64 {
        10
    }

    pub fn settle_timeout_ms() -> u64 {
        1000
    }

    pub fn zones() -> Vec<String> {
        [
            "cpu0-0-top-thermal",
            "cpu1-0-top-thermal",
            "cpu2-0-top-thermal",
            "gpuss-0-thermal",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    pub fn thermal_root() -> PathBuf {
        PathBuf::from(super::THERMAL_ROOT)
    }

    pub fn max_fan_step() -> u8 {
        32
    }

    pub fn max_sequence_ms() -> u64 {
        10_000
    }

    pub fn curve_interval_ms() -> u64 {
        2000
    }

    pub fn fire_period_ms() -> u64 {
        200
    }

    pub fn fire_min_temp() -> f32 {
        40.0
    }

    pub fn fire_blue_temp() -> f32 {
        55.0
    }

    pub fn fire_temp_range() -> f32 {
        30.0
    }
}

fn locate_config() -> Option<PathBuf> {
    if let Ok(env_path) = env::var(CONFIG_ENV) {
        return Some(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("arm-ecd/config.yml");
        if cfg_dir.exists() {
            return Some(cfg_dir);
        }
    }

    let etc = Path::new("/etc/arm-ecd/config.yml");
    etc.exists().then(|| etc.to_path_buf())
}

/// Configuration manager that owns the loaded configuration.
///
/// # Example
///
/// ```no_run
/// use arm_ecd::config::ConfigManager;
/// use std::path::PathBuf;
///
/// # async fn example() -> anyhow::Result<()> {
/// // Load from specific path
/// let config_manager = ConfigManager::load(Some(PathBuf::from("config.yml"))).await?;
///
/// // Standard locations, defaults when nothing is found
/// let config_manager = ConfigManager::load(None).await?;
///
/// let retries = config_manager.get().await.bus.retries;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new(config: Config, path: Option<PathBuf>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Loads configuration from file or standard locations.
    ///
    /// Searches in the following order:
    /// 1. Provided path parameter
    /// 2. ARM_ECD_CONFIG environment variable
    /// 3. XDG_CONFIG_HOME/arm-ecd/config.yml or ~/.config/arm-ecd/config.yml
    /// 4. /etc/arm-ecd/config.yml
    ///
    /// Built-in defaults are used when none of them exists.
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let Some(config_path) = path.or_else(locate_config) else {
            info!("No configuration file found, using defaults");
            return Ok(Self::new(Config::default(), None));
        };

        info!("Loading config from: {}", config_path.display());
        let config = Self::load_config_from_path(&config_path)?;

        Ok(Self::new(config, Some(config_path)))
    }

    pub async fn get(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    /// Path the configuration came from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Clones the current configuration.
    pub async fn clone_config(&self) -> Config {
        self.config.read().await.clone()
    }

    fn load_config_from_path(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

        if config.version != 1 {
            bail!(
                "Unsupported config version {} in file: {}",
                config.version,
                path.display()
            );
        }

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}
