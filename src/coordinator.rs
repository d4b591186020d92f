//! System coordinator for managing service lifecycle and dependency injection.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use log::{info, warn};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::broadcast::error::RecvError,
};

use crate::{
    app_context::AppState,
    config::ConfigManager,
    event::{Event, EventBus},
    providers::{
        AppStateProvider, AsyncProvider, FanCurveServiceProvider, KeyboardFireServiceProvider,
        PowerMonitorServiceProvider, ServiceProvider, TemperatureReportServiceProvider,
    },
    task_manager::TaskManager,
};

/// Owns the services of the daemon and drives them from start to exit.
///
/// Critical services must start; the rest degrade to a warning. The main
/// loop ends on SIGINT/SIGTERM or on a fatal stop of the reporting loop, in
/// which case the stop reason is returned as error.
pub struct SystemCoordinator {
    task_manager: TaskManager,
    event_bus: EventBus,
    shared_state: Option<Arc<AppState>>,
    service_providers: Vec<Box<dyn ServiceProvider>>,
    watch_power: bool,
}

impl Default for SystemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCoordinator {
    pub fn new() -> Self {
        Self {
            task_manager: TaskManager::new(),
            event_bus: EventBus::new(),
            shared_state: None,
            service_providers: Vec::new(),
            watch_power: true,
        }
    }

    /// Identifies the machine, opens the EC and registers the services.
    pub async fn initialize(&mut self, config_manager: ConfigManager) -> Result<()> {
        info!("Initializing SystemCoordinator...");

        let state = AppStateProvider::new(config_manager)
            .provide()
            .await
            .context("Failed to initialize application state")?;

        self.attach(state).await
    }

    /// Registers the services around an already built state.
    pub async fn attach(&mut self, state: Arc<AppState>) -> Result<()> {
        state
            .session
            .validate()
            .await
            .context("EC did not answer the initial register read")?;

        self.shared_state = Some(state.clone());
        self.register_service_providers(state)
            .await
            .context("Failed to register service providers")?;

        info!("SystemCoordinator initialization completed");
        Ok(())
    }

    async fn register_service_providers(&mut self, state: Arc<AppState>) -> Result<()> {
        let config = state.config_manager().clone_config().await;

        let mut providers: Vec<Box<dyn ServiceProvider>> = vec![Box::new(
            TemperatureReportServiceProvider::new(state.clone(), self.event_bus.clone()),
        )];

        if self.watch_power {
            providers.push(Box::new(PowerMonitorServiceProvider::new(
                self.event_bus.clone(),
            )));
        }
        if let Some(fan_curve) = config.fan_curve {
            providers.push(Box::new(FanCurveServiceProvider::new(
                state.clone(),
                fan_curve,
            )));
        }
        if let Some(keyboard_fire) = config.keyboard_fire {
            providers.push(Box::new(KeyboardFireServiceProvider::new(
                state.clone(),
                keyboard_fire,
            )));
        }

        providers.sort_by_key(|b| std::cmp::Reverse(b.priority()));
        self.service_providers = providers;

        info!(
            "Registered {} service providers in priority order",
            self.service_providers.len()
        );

        Ok(())
    }

    /// Starts all registered services in priority order.
    ///
    /// Critical services must start successfully, while non-critical services
    /// can fail without stopping the system.
    pub async fn start_all_services(&mut self) -> Result<()> {
        info!(
            "Starting {} services in priority order...",
            self.service_providers.len()
        );

        for provider in &self.service_providers {
            let is_critical = provider.is_critical();

            match provider.start(&mut self.task_manager).await {
                Ok(()) => {
                    info!(
                        "Service '{}' started (priority: {}, critical: {})",
                        provider.name(),
                        provider.priority(),
                        is_critical
                    );
                }
                Err(e) if is_critical => {
                    return Err(e).with_context(|| {
                        format!("Critical service '{}' failed to start", provider.name())
                    });
                }
                Err(e) => {
                    warn!(
                        "Non-critical service '{}' failed to start: {e:#}",
                        provider.name()
                    );
                }
            }
        }

        info!("All critical services started successfully");
        Ok(())
    }

    /// Main event loop.
    pub async fn run_main_loop(&mut self) -> Result<()> {
        let mut event_rx = self.event_bus.subscribe();
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to watch SIGTERM")?;
        info!("Starting main event loop");

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for SIGINT")?;
                    info!("Received SIGINT, initiating graceful shutdown...");
                    self.shutdown().await;
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown...");
                    self.shutdown().await;
                    break;
                }
                event = event_rx.recv() => self.handle_event(event).await?,
            }
        }

        info!("Main event loop terminated");
        Ok(())
    }

    async fn handle_event(&mut self, event_result: Result<Event, RecvError>) -> Result<()> {
        match event_result {
            Ok(Event::DaemonStopped(reason)) => {
                log::error!("EC reporting stopped: {reason}");
                let failure = match self.task_manager.shutdown_all().await {
                    Err(e) => e,
                    Ok(()) => anyhow!(reason),
                };
                Err(failure).context("EC daemon stopped")
            }
            Ok(Event::TemperatureReported(_)) => Ok(()),
            Ok(event) => {
                info!("Received event: {event:?}");
                Ok(())
            }
            Err(RecvError::Closed) => {
                bail!("Event bus channel closed unexpectedly");
            }
            Err(RecvError::Lagged(n)) => {
                warn!("Event bus lagged by {n} messages");
                Ok(())
            }
        }
    }

    /// Stops every service. Task errors are logged, not returned.
    async fn shutdown(&mut self) {
        info!("Initiating graceful shutdown...");

        if let Err(e) = self.task_manager.shutdown_all().await {
            log::error!("Error during task shutdown: {e:#}");
        }

        info!("Shutdown complete");
    }

    pub fn state(&self) -> Option<&Arc<AppState>> {
        self.shared_state.as_ref()
    }

    pub const fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn running_services(&self) -> Vec<&'static str> {
        self.service_providers.iter().map(|p| p.name()).collect()
    }

    #[cfg(test)]
    fn without_power_monitor(mut self) -> Self {
        self.watch_power = false;
        self
    }
}
