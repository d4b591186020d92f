use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    app_context::AppState, daemon::EcDaemon, event::EventBus,
    providers::traits::ServiceProvider, task_manager::TaskManager,
};

/// Temperature reporting service provider.
///
/// Runs the [`EcDaemon`] loop that feeds the EC watchdog. Without it the EC
/// eventually forces a power event, so it starts first and is critical.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use arm_ecd::providers::TemperatureReportServiceProvider;
/// use arm_ecd::event::EventBus;
/// use arm_ecd::app_context::AppState;
///
/// # async fn example(state: Arc<AppState>) -> anyhow::Result<()> {
/// let provider = TemperatureReportServiceProvider::new(state, EventBus::new());
/// # Ok(())
/// # }
/// ```
pub struct TemperatureReportServiceProvider {
    state: Arc<AppState>,
    event_bus: EventBus,
}

impl TemperatureReportServiceProvider {
    pub fn new(state: Arc<AppState>, event_bus: EventBus) -> Self {
        Self { state, event_bus }
    }
}

#[async_trait]
impl ServiceProvider for TemperatureReportServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let interval = self.state.config().await.report_interval(self.state.model);
        let daemon = EcDaemon::new(
            self.state.session.clone(),
            self.state.sensor.clone(),
            interval,
        )
        .with_latest(self.state.latest_sample.clone());
        let event_bus = self.event_bus.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| {
                daemon.run(event_bus, cancel_token)
            })
            .await
    }

    fn name(&self) -> &'static str {
        "TemperatureReportService"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn is_critical(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app_context::test_state, config::Config, drivers::i2c_ec::fake::FakeEc, event::Event,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn reports_and_shares_latest_sample() {
        let fake = FakeEc::new();
        let state = test_state(Config::default(), &fake);
        let event_bus = EventBus::new();
        let mut events = event_bus.subscribe();
        let mut task_manager = TaskManager::new();

        let provider = TemperatureReportServiceProvider::new(state.clone(), event_bus);
        assert!(provider.is_critical());
        provider.start(&mut task_manager).await.unwrap();

        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, Event::TemperatureReported(50.0));
        assert_eq!(state.latest_temperature().await, Some(50.0));
        assert_eq!(fake.aux_frames(0x20).len(), 1);

        task_manager.shutdown_all().await.unwrap();
    }
}
