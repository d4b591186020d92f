//! Dependency injection providers for service management.
//!
//! Each long-running part of the daemon is a [`ServiceProvider`] started by
//! the coordinator in priority order.

pub mod app_state;
pub mod fan_curve;
pub mod keyboard_fire;
pub mod power_monitor;
pub mod temperature_report;
pub mod traits;

pub use app_state::AppStateProvider;
pub use fan_curve::FanCurveServiceProvider;
pub use keyboard_fire::KeyboardFireServiceProvider;
pub use power_monitor::PowerMonitorServiceProvider;
pub use temperature_report::TemperatureReportServiceProvider;
pub use traits::{AsyncProvider, ServiceProvider};

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::{
        app_context::test_state,
        config::{Config, CurveCfg, FanCurveCfg, KeyboardFireCfg},
        drivers::i2c_ec::fake::FakeEc,
        event::EventBus,
    };
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn providers_share_state_and_order_by_priority() {
        let fake = FakeEc::new();
        let state = test_state(Config::default(), &fake);
        let event_bus = EventBus::new();

        let mut providers: Vec<Box<dyn ServiceProvider>> = vec![
            Box::new(KeyboardFireServiceProvider::new(
                state.clone(),
                KeyboardFireCfg::default(),
            )),
            Box::new(PowerMonitorServiceProvider::new(event_bus.clone())),
            Box::new(FanCurveServiceProvider::new(
                state.clone(),
                FanCurveCfg {
                    curve: CurveCfg::Constant { speed: 100 },
                    fans: None,
                    interval_ms: 2000,
                },
            )),
            Box::new(TemperatureReportServiceProvider::new(
                state.clone(),
                event_bus.clone(),
            )),
        ];
        providers.sort_by_key(|p| std::cmp::Reverse(p.priority()));

        let summary: Vec<_> = providers
            .iter()
            .map(|p| (p.name(), p.priority(), p.is_critical()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("TemperatureReportService", 10, true),
                ("PowerMonitorService", 8, false),
                ("FanCurveService", 4, false),
                ("KeyboardFireService", 2, false),
            ]
        );
    }
}
