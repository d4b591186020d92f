//! EC behind the `b94000.i2c` adapter of Snapdragon laptops.

pub mod controller;
pub mod device_io;
#[cfg(test)]
pub(crate) mod fake;
pub mod protocol;
pub mod rate_limit;

use std::{
    io,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::info;
use tokio::sync::Mutex;

use crate::{error::EcError, models::Model};

use controller::{EcController, RegisterWrite};
use device_io::{BusTransport, LinuxI2c, RetryPolicy, RetryingBus, locate_adapter};

pub type SessionController = EcController<RetryingBus<Box<dyn BusTransport>>>;

/// Where to find the adapter and how patient to be with it.
#[derive(Debug, Clone)]
pub struct SessionOptions<'a> {
    pub adapter: &'a str,
    pub sysfs_root: &'a Path,
    pub dev_root: &'a Path,
    pub retry: RetryPolicy,
    pub settle_timeout: Duration,
}

/// Exclusive handle on the EC bus.
///
/// Cloning shares the same handle. Operations run on the blocking pool, one
/// at a time; the bus is closed when the last clone is dropped.
///
/// The suspended flag is shared too. While it is set, [`run_awake`] refuses
/// to touch the bus; only the reporting loop, which owns the suspend and
/// resume handshake, uses [`run`] directly.
///
/// [`run`]: EcSession::run
/// [`run_awake`]: EcSession::run_awake
#[derive(Clone)]
pub struct EcSession {
    controller: Arc<Mutex<SessionController>>,
    model: &'static Model,
    suspended: Arc<AtomicBool>,
}

impl EcSession {
    /// Opens the model's adapter and verifies that both addresses are free.
    pub fn open(model: &'static Model, options: &SessionOptions<'_>) -> Result<Self, EcError> {
        let path = locate_adapter(options.sysfs_root, options.dev_root, options.adapter)?;
        let dev = LinuxI2c::open(&path)?;
        dev.claim(model.ec_address)?;
        dev.claim(model.aux_address)?;
        info!(
            "EC session open on {} (EC 0x{:02x}, aux 0x{:02x})",
            path.display(),
            model.ec_address,
            model.aux_address
        );
        Ok(Self::with_transport(
            Box::new(dev),
            model,
            options.retry,
            options.settle_timeout,
        ))
    }

    pub fn with_transport(
        io: Box<dyn BusTransport>,
        model: &'static Model,
        retry: RetryPolicy,
        settle_timeout: Duration,
    ) -> Self {
        let bus = RetryingBus::new(io, retry);
        Self {
            controller: Arc::new(Mutex::new(EcController::new(bus, model, settle_timeout))),
            model,
            suspended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn model(&self) -> &'static Model {
        self.model
    }

    /// Runs `op` with exclusive access to the controller.
    ///
    /// Everything inside `op` happens under one lock acquisition, so a
    /// multi-step operation is never interleaved with another caller.
    pub async fn run<F, R>(&self, op: F) -> Result<R, EcError>
    where
        F: FnOnce(&mut SessionController) -> Result<R, EcError> + Send + 'static,
        R: Send + 'static,
    {
        let controller = self.controller.clone();
        let addr = self.model.ec_address;
        tokio::task::spawn_blocking(move || {
            let mut guard = controller.blocking_lock();
            op(&mut guard)
        })
        .await
        .map_err(|e| EcError::Bus {
            addr,
            source: io::Error::other(format!("bus worker failed: {e}")),
        })?
    }

    /// Like [`run`](EcSession::run), but fails with
    /// [`EcError::Suspended`] while the EC is in suspend mode. The flag is
    /// checked under the lock, so nothing queued behind a suspend slips out.
    pub async fn run_awake<F, R>(&self, op: F) -> Result<R, EcError>
    where
        F: FnOnce(&mut SessionController) -> Result<R, EcError> + Send + 'static,
        R: Send + 'static,
    {
        let suspended = self.suspended.clone();
        self.run(move |ctrl| {
            if suspended.load(Ordering::SeqCst) {
                return Err(EcError::Suspended);
            }
            op(ctrl)
        })
        .await
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub async fn send_temperature(&self, celsius: f32) -> Result<u16, EcError> {
        self.run(move |ctrl| ctrl.send_temperature(celsius)).await
    }

    pub async fn apply(&self, write: RegisterWrite) -> Result<(), EcError> {
        self.run(move |ctrl| ctrl.apply(write)).await
    }

    pub async fn fan_rpm(&self, fan: u8) -> Result<u16, EcError> {
        self.run(move |ctrl| ctrl.fan_rpm(fan)).await
    }

    /// Reads a register back to confirm the EC is responsive.
    pub async fn validate(&self) -> Result<(), EcError> {
        self.run(|ctrl| ctrl.fan_mode().map(|_| ())).await
    }
}

/// Session over the in-memory EC, for tests across the crate.
#[cfg(test)]
pub(crate) fn test_session(fake: &fake::FakeEc) -> EcSession {
    EcSession::with_transport(
        Box::new(fake.clone()),
        &crate::models::MODELS[0],
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        },
        Duration::from_millis(200),
    )
}
