//! I2C transport: the Linux i2c-dev adapter plus a retrying wrapper.

use std::{
    fs::{self, File, OpenOptions},
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info};
use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
    libc::c_int,
};

use crate::error::{EcError, ProtocolError};

const I2C_M_RD: u16 = 0x0001;

mod ioctl {
    use super::I2cRdwrData;

    nix::ioctl_write_int_bad!(
        /// Binds the file descriptor to a target address. Fails with EBUSY
        /// when a kernel driver owns the address.
        i2c_set_target,
        0x0703
    );
    nix::ioctl_write_ptr_bad!(
        /// Runs a combined transaction (repeated start between messages).
        i2c_rdwr,
        0x0707,
        I2cRdwrData
    );
}

#[repr(C)]
struct I2cMsg {
    addr: u16,
    flags: u16,
    len: u16,
    buf: *mut u8,
}

#[repr(C)]
struct I2cRdwrData {
    msgs: *mut I2cMsg,
    nmsgs: u32,
}

/// One message of a combined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Write(&'a [u8]),
    Read(usize),
}

/// Raw access to the I2C bus the EC sits on.
pub trait BusTransport: Send + 'static {
    /// Runs `segments` as a single transaction at `addr` and returns the
    /// concatenated bytes of all read segments.
    fn transfer(&mut self, addr: u16, segments: &[Segment<'_>]) -> Result<Vec<u8>, EcError>;

    fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), EcError> {
        self.transfer(addr, &[Segment::Write(bytes)]).map(|_| ())
    }

    fn read(&mut self, addr: u16, len: usize) -> Result<Vec<u8>, EcError> {
        self.transfer(addr, &[Segment::Read(len)])
    }
}

impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    fn transfer(&mut self, addr: u16, segments: &[Segment<'_>]) -> Result<Vec<u8>, EcError> {
        (**self).transfer(addr, segments)
    }
}

/// Finds the `/dev` node of the I2C adapter registered under `adapter`.
///
/// The platform device directory holds an `i2c-N` child naming the adapter
/// number; the node is `/dev/i2c-N` or, on some setups, `/dev/i2c/N`.
pub fn locate_adapter(sysfs_root: &Path, dev_root: &Path, adapter: &str) -> Result<PathBuf, EcError> {
    let platform_dir = sysfs_root.join(adapter);
    let entries = fs::read_dir(&platform_dir).map_err(|e| EcError::Open {
        path: platform_dir.clone(),
        reason: format!("adapter not present: {e}"),
    })?;

    let bus_number = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .find_map(|name| name.strip_prefix("i2c-").and_then(|n| n.parse::<u32>().ok()))
        .ok_or_else(|| EcError::Open {
            path: platform_dir.clone(),
            reason: "no i2c-N bus registered under the adapter".into(),
        })?;

    [
        dev_root.join(format!("i2c-{bus_number}")),
        dev_root.join("i2c").join(bus_number.to_string()),
    ]
    .into_iter()
    .find(|candidate| candidate.exists())
    .ok_or_else(|| EcError::Open {
        path: dev_root.join(format!("i2c-{bus_number}")),
        reason: "device node missing, is i2c-dev loaded? (modprobe i2c-dev)".into(),
    })
}

/// `/dev/i2c-N` character device.
///
/// Holds an exclusive `flock` on the node for its whole life, so a one-shot
/// command cannot interleave transactions with a running daemon.
#[derive(Debug)]
pub struct LinuxI2c {
    file: Flock<File>,
    path: PathBuf,
}

impl LinuxI2c {
    pub fn open(path: &Path) -> Result<Self, EcError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| EcError::Open {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let file = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            EcError::Open {
                path: path.to_path_buf(),
                reason: if errno == Errno::EWOULDBLOCK {
                    "adapter is in use by another process, is the arm-ecd daemon running?".into()
                } else {
                    format!("cannot lock adapter: {errno}")
                },
            }
        })?;
        info!("Opened I2C adapter {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Checks that no kernel driver is bound to `addr`.
    pub fn claim(&self, addr: u16) -> Result<(), EcError> {
        // SAFETY: I2C_SLAVE takes the address by value and touches no memory.
        unsafe { ioctl::i2c_set_target(self.file.as_raw_fd(), c_int::from(addr)) }
            .map(|_| ())
            .map_err(|errno| EcError::Open {
                path: self.path.clone(),
                reason: match errno {
                    Errno::EBUSY => format!("address 0x{addr:02x} is owned by a kernel driver"),
                    other => format!("cannot select address 0x{addr:02x}: {other}"),
                },
            })
    }
}

impl BusTransport for LinuxI2c {
    fn transfer(&mut self, addr: u16, segments: &[Segment<'_>]) -> Result<Vec<u8>, EcError> {
        let mut reads: Vec<Vec<u8>> = segments
            .iter()
            .filter_map(|segment| match *segment {
                Segment::Read(len) => Some(vec![0u8; len]),
                Segment::Write(_) => None,
            })
            .collect();

        let mut msgs = Vec::with_capacity(segments.len());
        let mut read_bufs = reads.iter_mut();
        for segment in segments {
            let (buf, len, flags) = match *segment {
                Segment::Write(bytes) => (bytes.as_ptr().cast_mut(), bytes.len(), 0),
                Segment::Read(_) => match read_bufs.next() {
                    Some(buf) => (buf.as_mut_ptr(), buf.len(), I2C_M_RD),
                    None => break,
                },
            };
            let len = u16::try_from(len).map_err(|_| ProtocolError::Oversized(len))?;
            msgs.push(I2cMsg {
                addr,
                flags,
                len,
                buf,
            });
        }

        let data = I2cRdwrData {
            msgs: msgs.as_mut_ptr(),
            nmsgs: msgs.len() as u32,
        };
        let started = Instant::now();
        // SAFETY: each message points into a buffer that outlives the call and
        // `len` matches that buffer. Write buffers are only read by the kernel.
        unsafe { ioctl::i2c_rdwr(self.file.as_raw_fd(), &data) }
            .map_err(|errno| classify_errno(addr, errno, started.elapsed()))?;

        Ok(reads.concat())
    }
}

/// Missing acknowledgments surface as ENXIO/EREMOTEIO depending on the
/// controller driver, clock stretching past the limit as ETIMEDOUT.
fn classify_errno(addr: u16, errno: Errno, waited: Duration) -> EcError {
    match errno {
        Errno::ETIMEDOUT | Errno::ENXIO | Errno::EREMOTEIO => EcError::Timeout { addr, waited },
        other => EcError::Bus {
            addr,
            source: io::Error::from(other),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per transfer, the first one included.
    pub attempts: u32,
    /// Backoff after attempt `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

/// Retries transient bus faults a bounded number of times.
#[derive(Debug)]
pub struct RetryingBus<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: BusTransport> RetryingBus<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<T: BusTransport> BusTransport for RetryingBus<T> {
    fn transfer(&mut self, addr: u16, segments: &[Segment<'_>]) -> Result<Vec<u8>, EcError> {
        let mut attempt = 1;
        loop {
            match self.inner.transfer(addr, segments) {
                Err(e) if e.is_transient() && attempt < self.policy.attempts => {
                    debug!(
                        "Transfer to 0x{addr:02x} failed ({e}), retry {attempt}/{}",
                        self.policy.attempts - 1
                    );
                    thread::sleep(self.policy.backoff * attempt);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
