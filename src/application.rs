//! Daemon entry point and its builder.

use crate::{config::ConfigManager, coordinator::SystemCoordinator};
use anyhow::{Result, anyhow};
use log::info;

/// The `arm-ecd run` daemon.
///
/// Identifies the machine, opens the EC, starts the services and blocks
/// until a signal or a fatal EC failure ends the run.
///
/// # Example
///
/// ```no_run
/// use arm_ecd::{application::Application, config::ConfigManager};
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(None).await?;
/// let mut app = Application::builder()
///     .with_config_manager(config_manager)
///     .build()?;
///
/// app.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Application {
    pub coordinator: SystemCoordinator,
    config_manager: ConfigManager,
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    /// Initialize, start services, then run until stopped.
    ///
    /// Returns `Ok` on a signal-driven shutdown and the failure chain when
    /// the EC stops answering.
    pub async fn run(&mut self) -> Result<()> {
        if let Some(path) = self.config_manager.path() {
            info!("Using configuration {}", path.display());
        }

        self.coordinator
            .initialize(self.config_manager.clone())
            .await?;
        self.coordinator.start_all_services().await?;
        self.coordinator.run_main_loop().await
    }
}

pub struct ApplicationBuilder {
    config_manager: Option<ConfigManager>,
}

impl ApplicationBuilder {
    fn new() -> Self {
        Self {
            config_manager: None,
        }
    }

    pub fn with_config_manager(mut self, config_manager: ConfigManager) -> Self {
        self.config_manager = Some(config_manager);
        self
    }

    pub fn build(self) -> Result<Application> {
        let config_manager = self
            .config_manager
            .ok_or_else(|| anyhow!("Configuration manager is required"))?;

        Ok(Application {
            coordinator: SystemCoordinator::new(),
            config_manager,
        })
    }
}
