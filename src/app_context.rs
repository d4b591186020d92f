//! Application state and global context management.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use tokio::sync::RwLock;

use crate::{
    config::{Config, ConfigManager},
    drivers::i2c_ec::EcSession,
    effects::{EffectLimits, EffectsEngine},
    models::{self, Model},
    sensors::{TemperatureSample, TemperatureSensor},
    temperature_sensors::ThermalZoneSource,
};

/// Identifies the machine and opens the EC bus for it.
///
/// Fails with [`EcError::UnsupportedDevice`](crate::error::EcError) before
/// touching the bus when the machine is not in the model table.
pub fn open_session(config: &Config) -> Result<EcSession> {
    let model = models::resolve_model(&config.identity_path)
        .context("Failed to identify the machine")?;

    EcSession::open(model, &config.session_options())
        .with_context(|| format!("Failed to open the EC bus on {}", config.bus.adapter))
}

pub fn effect_limits(config: &Config, model: &Model) -> EffectLimits {
    EffectLimits {
        max_fan_step: config.effects.max_fan_step,
        max_sequence: config.max_sequence_duration(model),
    }
}

/// Shared application state.
///
/// Holds the single EC session and everything services need around it.
pub struct AppState {
    pub config_manager: Arc<ConfigManager>,
    pub model: &'static Model,
    pub session: EcSession,
    pub sensor: Arc<dyn TemperatureSensor>,
    pub effects: EffectsEngine,
    /// Last temperature sampled by the reporting loop.
    pub latest_sample: Arc<RwLock<Option<TemperatureSample>>>,
}

impl AppState {
    /// Resolves the model, opens the bus and discovers the thermal zones.
    pub async fn new(config_manager: ConfigManager) -> Result<Self> {
        let config = config_manager.clone_config().await;

        let session = open_session(&config)?;
        let sensor = ThermalZoneSource::discover(&config.thermal.root, &config.thermal.zones)
            .context("Failed to discover thermal zones")?;
        info!("Temperature source: {}", sensor.name());

        Ok(Self::with_session(config_manager, &config, session, Arc::new(sensor)))
    }

    /// Builds the state around an already open session.
    pub fn with_session(
        config_manager: ConfigManager,
        config: &Config,
        session: EcSession,
        sensor: Arc<dyn TemperatureSensor>,
    ) -> Self {
        let model = session.model();
        Self {
            effects: EffectsEngine::new(session.clone(), effect_limits(config, model)),
            config_manager: Arc::new(config_manager),
            model,
            session,
            sensor,
            latest_sample: Arc::new(RwLock::new(None)),
        }
    }

    /// Gets a read-only reference to the current configuration.
    pub async fn config(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config_manager.get().await
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    pub async fn latest_temperature(&self) -> Option<f32> {
        self.latest_sample.read().await.map(|s| s.celsius)
    }
}

/// AppState over the in-memory EC, for service tests.
#[cfg(test)]
pub(crate) fn test_state(
    config: Config,
    fake: &crate::drivers::i2c_ec::fake::FakeEc,
) -> Arc<AppState> {
    let mut sensor = crate::sensors::MockTemperatureSensor::new();
    sensor
        .expect_sample()
        .returning(|| Ok(TemperatureSample::now(50.0)));
    sensor.expect_name().return_const("mock".to_string());

    let session = crate::drivers::i2c_ec::test_session(fake);
    Arc::new(AppState::with_session(
        ConfigManager::new(config.clone(), None),
        &config,
        session,
        Arc::new(sensor),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{drivers::i2c_ec::fake::FakeEc, error::EcError};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn state_shares_one_session() {
        let fake = FakeEc::new();
        let state = test_state(Config::default(), &fake);

        assert_eq!(state.model.name, "ASUS Vivobook S 15");
        assert_eq!(state.effects.limits().max_fan_step, 32);
        assert_eq!(
            state.effects.limits().max_sequence,
            Duration::from_secs(10)
        );
        assert_eq!(state.latest_temperature().await, None);
    }

    #[test]
    fn unknown_machine_is_refused_before_bus_access() {
        let dir = tempfile::tempdir().unwrap();
        let identity = dir.path().join("model");
        std::fs::write(&identity, "Some Other Laptop\0").unwrap();

        let config = Config {
            identity_path: identity,
            ..Config::default()
        };
        let err = open_session(&config).err().expect("open_session should fail");
        assert!(matches!(
            err.downcast_ref::<EcError>(),
            Some(EcError::UnsupportedDevice(_))
        ));
    }
}
