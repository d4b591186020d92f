use anyhow::Result;
use async_trait::async_trait;

use crate::{
    event::EventBus, power::PowerMonitor, providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

/// logind sleep watcher.
///
/// Not critical: without a system bus the daemon keeps reporting, it just
/// cannot warn the EC before suspend.
pub struct PowerMonitorServiceProvider {
    event_bus: EventBus,
}

impl PowerMonitorServiceProvider {
    pub fn new(event_bus: EventBus) -> Self {
        Self { event_bus }
    }
}

#[async_trait]
impl ServiceProvider for PowerMonitorServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let monitor = PowerMonitor::connect().await?;
        let event_bus = self.event_bus.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| {
                monitor.run(event_bus, cancel_token)
            })
            .await
    }

    fn name(&self) -> &'static str {
        "PowerMonitorService"
    }

    fn priority(&self) -> i32 {
        8
    }
}
