//! Error taxonomy for EC communication.
//!
//! Bus-level faults ([`EcError::Bus`], [`EcError::Timeout`]) are transient and
//! retried by the transport. Everything else is surfaced as-is.

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors raised while talking to the embedded controller.
#[derive(Debug, Error)]
pub enum EcError {
    /// I/O failure on the I2C adapter.
    #[error("I2C transfer to 0x{addr:02x} failed: {source}")]
    Bus {
        addr: u16,
        #[source]
        source: io::Error,
    },

    /// The target did not acknowledge within the bounded window.
    #[error("no acknowledgment from 0x{addr:02x} within {waited:?}")]
    Timeout { addr: u16, waited: Duration },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The running machine has no entry in the model table.
    #[error("unsupported device '{0}'")]
    UnsupportedDevice(String),

    /// An effect failed validation; nothing was written.
    #[error("effect '{effect}' rejected: {reason}")]
    Rejected { effect: String, reason: RejectReason },

    /// The EC is in suspend mode and has not been revalidated since.
    #[error("EC is suspended, writes are held until the session is revalidated")]
    Suspended,

    /// The I2C adapter could not be located or opened.
    #[error("cannot open I2C adapter {}: {reason}", path.display())]
    Open { path: PathBuf, reason: String },
}

impl EcError {
    /// Whether a retry at the transport level may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EcError::Bus { .. } | EcError::Timeout { .. })
    }
}

/// Malformed exchanges with the EC.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad acknowledgment for {command}: expected {expected} byte(s), got {got}")]
    BadAck {
        command: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("payload of {0} bytes does not fit an I2C message")]
    Oversized(usize),
}

/// Why an effect sequence was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("fan {fan} step {from} -> {to} exceeds the maximum of {max}")]
    FanStepTooLarge { fan: u8, from: u8, to: u8, max: u8 },

    #[error("register {register} rewritten after {gap:?}, minimum is {min:?}")]
    WriteTooSoon {
        register: String,
        gap: Duration,
        min: Duration,
    },

    #[error("sequence lasts {total:?}, limit is {limit:?}")]
    TooLong { total: Duration, limit: Duration },

    #[error("{0}")]
    Unsupported(String),
}

/// Process exit status for a failed run: 2 when the machine is not
/// supported, 1 for anything else.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    let unsupported = err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<EcError>(), Some(EcError::UnsupportedDevice(_))));
    if unsupported { 2 } else { 1 }
}
