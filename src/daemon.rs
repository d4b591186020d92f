//! Temperature reporting loop keeping the EC watchdog fed.
//!
//! The EC expects a SoC temperature at least once per watchdog interval and
//! forces a power event when it stops arriving, so this loop is the one part
//! of the daemon that must never silently stall.

use std::{fmt, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use log::{debug, error, info, warn};
use tokio::{
    sync::{RwLock, broadcast::error::RecvError},
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

use crate::{
    drivers::i2c_ec::{EcSession, controller::RegisterWrite},
    event::{Event, EventBus},
    sensors::{TemperatureSample, TemperatureSensor},
};

/// Consecutive failed ticks after which reporting gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Idle,
    ActivePolling,
    Suspending,
    Suspended,
    Stopped,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DaemonState::Idle => "idle",
            DaemonState::ActivePolling => "active",
            DaemonState::Suspending => "suspending",
            DaemonState::Suspended => "suspended",
            DaemonState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Result of a single tick that did not end the daemon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    Reported { celsius: f32, raw: u16 },
    /// Not polling; nothing touched the bus.
    Skipped,
    Failed { consecutive: u32 },
}

pub struct EcDaemon {
    session: EcSession,
    sensor: Arc<dyn TemperatureSensor>,
    interval: Duration,
    state: DaemonState,
    failures: u32,
    needs_validation: bool,
    latest: Arc<RwLock<Option<TemperatureSample>>>,
}

impl EcDaemon {
    pub fn new(session: EcSession, sensor: Arc<dyn TemperatureSensor>, interval: Duration) -> Self {
        Self {
            session,
            sensor,
            interval,
            state: DaemonState::Idle,
            failures: 0,
            needs_validation: false,
            latest: Arc::new(RwLock::new(None)),
        }
    }

    /// Publishes every successful sample into `latest`.
    pub fn with_latest(mut self, latest: Arc<RwLock<Option<TemperatureSample>>>) -> Self {
        self.latest = latest;
        self
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn start(&mut self) {
        if self.state == DaemonState::Idle {
            info!(
                "Reporting {} to the EC every {:?}",
                self.sensor.name(),
                self.interval
            );
            self.state = DaemonState::ActivePolling;
        }
    }

    /// Samples the host temperature and pushes it to the EC.
    ///
    /// Returns `Err` only when the failure budget is exhausted; the daemon is
    /// `Stopped` from then on.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        match self.state {
            DaemonState::ActivePolling => {}
            DaemonState::Stopped => return Err(anyhow!("EC daemon is stopped")),
            _ => return Ok(TickOutcome::Skipped),
        }

        match self.report().await {
            Ok((celsius, raw)) => {
                if self.failures > 0 {
                    info!("EC reporting recovered after {} failure(s)", self.failures);
                }
                self.failures = 0;
                Ok(TickOutcome::Reported { celsius, raw })
            }
            Err(e) => {
                self.failures += 1;
                if self.failures >= MAX_CONSECUTIVE_FAILURES {
                    error!("EC reporting failed {} times in a row: {e:#}", self.failures);
                    self.state = DaemonState::Stopped;
                    return Err(e).with_context(|| {
                        format!("EC unreachable after {MAX_CONSECUTIVE_FAILURES} consecutive failures")
                    });
                }
                warn!(
                    "EC report failed ({}/{MAX_CONSECUTIVE_FAILURES}): {e:#}",
                    self.failures
                );
                Ok(TickOutcome::Failed {
                    consecutive: self.failures,
                })
            }
        }
    }

    async fn report(&mut self) -> Result<(f32, u16)> {
        if self.needs_validation {
            self.session
                .run(|ctrl| {
                    ctrl.fan_mode()?;
                    ctrl.apply(RegisterWrite::SuspendMode(false))
                })
                .await
                .context("EC did not answer after resume")?;
            self.needs_validation = false;
            self.session.set_suspended(false);
            info!("EC session validated after resume");
        }

        let sample = self
            .sensor
            .sample()
            .await
            .context("Failed to sample host temperature")?;
        *self.latest.write().await = Some(sample);

        let raw = self
            .session
            .send_temperature(sample.celsius)
            .await
            .context("Failed to send temperature to the EC")?;

        debug!("Reported {:.1}°C (raw {raw})", sample.celsius);
        Ok((sample.celsius, raw))
    }

    /// Tells the EC the host is going to sleep, then goes quiet.
    pub async fn suspend(&mut self) {
        if self.state != DaemonState::ActivePolling {
            debug!("Ignoring suspend while {}", self.state);
            return;
        }

        self.state = DaemonState::Suspending;
        self.session.set_suspended(true);
        self.needs_validation = true;

        let mut entered = self.session.apply(RegisterWrite::SuspendMode(true)).await;
        if let Err(e) = &entered {
            warn!("Failed to enter EC suspend mode, retrying once: {e}");
            entered = self.session.apply(RegisterWrite::SuspendMode(true)).await;
        }
        if let Err(e) = entered {
            error!("EC refused suspend mode and may still expect reports during sleep: {e}");
        }

        self.state = DaemonState::Suspended;
        info!("EC reporting suspended");
    }

    /// Resumes polling; the next tick re-validates the session first and
    /// only then lets effects back onto the bus.
    pub fn resume(&mut self) {
        if self.state != DaemonState::Suspended {
            debug!("Ignoring resume while {}", self.state);
            return;
        }
        self.state = DaemonState::ActivePolling;
        info!("EC reporting resumed");
    }

    /// Drives the daemon until cancelled or fatally failed.
    pub async fn run(mut self, event_bus: EventBus, cancel_token: CancellationToken) -> Result<()> {
        let mut events = event_bus.subscribe();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.start();

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    info!("EC daemon cancelled");
                    break;
                }
                _instant = ticker.tick() => {
                    match self.tick().await {
                        Ok(TickOutcome::Reported { celsius, .. }) => {
                            publish(&event_bus, Event::TemperatureReported(celsius));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            publish(&event_bus, Event::DaemonStopped(format!("{e:#}")));
                            return Err(e);
                        }
                    }
                }
                event = events.recv() => match event {
                    Ok(Event::SuspendRequested) => {
                        self.suspend().await;
                        publish(&event_bus, Event::EcSuspended);
                    }
                    Ok(Event::ResumeRequested) => {
                        self.resume();
                        ticker.reset_immediately();
                        publish(&event_bus, Event::EcResumed);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!("EC daemon lagged by {n} events"),
                    Err(RecvError::Closed) => break,
                }
            }
        }

        self.state = DaemonState::Stopped;
        Ok(())
    }
}

fn publish(event_bus: &EventBus, event: Event) {
    if let Err(e) = event_bus.publish(event) {
        debug!("No subscriber for event: {e}");
    }
}
