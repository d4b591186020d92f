//! Host sleep notifications from systemd-logind.
//!
//! A `delay` inhibitor is held while the host is awake. On
//! `PrepareForSleep(true)` the EC gets told first, and only then is the
//! inhibitor dropped so the host may actually suspend.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use log::{info, warn};
use tokio::sync::broadcast::{Receiver, error::RecvError};
use tokio_util::sync::CancellationToken;
use zbus::Connection;
use zvariant::OwnedFd;

use crate::event::{Event, EventBus};

/// Upper bound on holding the host back; below logind's default
/// `InhibitDelayMaxSec` of 5 s.
pub const INHIBIT_RELEASE_TIMEOUT: Duration = Duration::from_secs(4);

#[zbus::proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1",
    gen_blocking = false
)]
pub trait LoginManager {
    fn inhibit(&self, what: &str, who: &str, why: &str, mode: &str) -> zbus::Result<OwnedFd>;

    #[zbus(signal)]
    fn prepare_for_sleep(&self, start: bool) -> zbus::Result<()>;
}

async fn take_inhibitor(proxy: &LoginManagerProxy<'_>) -> Option<OwnedFd> {
    match proxy
        .inhibit(
            "sleep",
            "arm-ecd",
            "Notify the embedded controller before suspend",
            "delay",
        )
        .await
    {
        Ok(fd) => Some(fd),
        Err(e) => {
            warn!("Cannot take a sleep inhibitor, suspend will not wait for the EC: {e}");
            None
        }
    }
}

/// Waits for the daemon to confirm the EC is in suspend mode.
///
/// Returns `false` when `limit` elapsed first or the bus closed.
pub async fn await_ec_suspended(events: &mut Receiver<Event>, limit: Duration) -> bool {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(Event::EcSuspended) => return true,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return false,
            }
        }
    };
    tokio::time::timeout(limit, wait).await.unwrap_or(false)
}

/// Watches logind for sleep transitions.
pub struct PowerMonitor {
    proxy: LoginManagerProxy<'static>,
}

impl PowerMonitor {
    pub async fn connect() -> Result<Self> {
        let connection = Connection::system()
            .await
            .context("Failed to connect to the system D-Bus")?;
        let proxy = LoginManagerProxy::new(&connection)
            .await
            .context("Failed to reach systemd-logind")?;
        Ok(Self { proxy })
    }

    /// Forwards logind sleep transitions onto the event bus until cancelled.
    pub async fn run(self, event_bus: EventBus, cancel_token: CancellationToken) -> Result<()> {
        let mut sleep_signals = self
            .proxy
            .receive_prepare_for_sleep()
            .await
            .context("Failed to subscribe to PrepareForSleep")?;

        let mut events = event_bus.subscribe();
        let mut inhibitor = take_inhibitor(&self.proxy).await;
        info!("Watching logind for sleep transitions");

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    info!("Power monitor cancelled");
                    break;
                }
                signal = sleep_signals.next() => {
                    let Some(signal) = signal else {
                        warn!("logind PrepareForSleep stream ended, suspend notifications stop");
                        break;
                    };
                    let start = match signal.args() {
                        Ok(args) => args.start,
                        Err(e) => {
                            warn!("Malformed PrepareForSleep signal: {e}");
                            continue;
                        }
                    };

                    if start {
                        info!("Host is preparing for sleep");
                        // Drop anything stale before asking.
                        events = events.resubscribe();
                        publish(&event_bus, Event::SuspendRequested);
                        if !await_ec_suspended(&mut events, INHIBIT_RELEASE_TIMEOUT).await {
                            warn!("EC did not confirm suspend within {INHIBIT_RELEASE_TIMEOUT:?}");
                        }
                        drop(inhibitor.take());
                    } else {
                        info!("Host resumed from sleep");
                        publish(&event_bus, Event::ResumeRequested);
                        if inhibitor.is_none() {
                            inhibitor = take_inhibitor(&self.proxy).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn publish(event_bus: &EventBus, event: Event) {
    if let Err(e) = event_bus.publish(event) {
        warn!("Nobody listens for power events: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confirmation_is_awaited() {
        let event_bus = EventBus::new();
        let mut events = event_bus.subscribe();

        let publisher = event_bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(Event::TemperatureReported(40.0)).unwrap();
            publisher.publish(Event::EcSuspended).unwrap();
        });

        assert!(await_ec_suspended(&mut events, Duration::from_secs(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_confirmation_times_out() {
        let event_bus = EventBus::new();
        let mut events = event_bus.subscribe();
        event_bus.publish(Event::SuspendRequested).unwrap();

        assert!(!await_ec_suspended(&mut events, INHIBIT_RELEASE_TIMEOUT).await);
    }

    #[tokio::test]
    async fn closed_bus_gives_up() {
        let event_bus = EventBus::new();
        let mut events = event_bus.subscribe();
        drop(event_bus);

        assert!(!await_ec_suspended(&mut events, Duration::from_secs(5)).await);
    }
}
