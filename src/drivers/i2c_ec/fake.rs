//! In-memory EC used by unit tests. Emulates direct registers, the mailbox and
//! the auxiliary controller, and records every transfer that reached it.

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::error::EcError;

use super::device_io::{BusTransport, Segment};

const EC: u16 = 0x5b;
const AUX: u16 = 0x76;
const MAILBOX_BANK: u8 = 0xc4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    Bus,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct Transfer {
    pub addr: u16,
    pub writes: Vec<Vec<u8>>,
    pub read_len: usize,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectWrite {
    pub command: u8,
    pub address: u8,
    pub value: u8,
    pub at: Instant,
}

#[derive(Default)]
struct State {
    direct: HashMap<(u8, u8), u8>,
    indirect: HashMap<(u8, u8), u8>,
    staged: bool,
    rpm: HashMap<u8, u16>,
    log: Vec<Transfer>,
    indirect_log: Vec<IndirectWrite>,
    pending_failures: VecDeque<FailKind>,
    fail_always: Option<FailKind>,
    stuck: bool,
    truncate_reads: bool,
}

#[derive(Clone, Default)]
pub struct FakeEc(Arc<Mutex<State>>);

impl FakeEc {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.0.lock().unwrap()
    }

    pub fn fail_next(&self, count: usize, kind: FailKind) {
        self.state().pending_failures.extend(std::iter::repeat_n(kind, count));
    }

    pub fn fail_always(&self, kind: Option<FailKind>) {
        self.state().fail_always = kind;
    }

    pub fn set_mailbox_stuck(&self, stuck: bool) {
        self.state().stuck = stuck;
    }

    pub fn set_truncate_reads(&self, truncate: bool) {
        self.state().truncate_reads = truncate;
    }

    pub fn set_rpm(&self, fan: u8, rpm: u16) {
        self.state().rpm.insert(fan, rpm);
    }

    pub fn indirect(&self, command: u8, address: u8) -> Option<u8> {
        self.state().indirect.get(&(command, address)).copied()
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.state().log.clone()
    }

    pub fn transfer_count(&self) -> usize {
        self.state().log.len()
    }

    pub fn indirect_writes(&self) -> Vec<IndirectWrite> {
        self.state().indirect_log.clone()
    }

    /// Auxiliary frames starting with `opcode`, with their timestamps.
    pub fn aux_frames(&self, opcode: u8) -> Vec<(Vec<u8>, Instant)> {
        self.state()
            .log
            .iter()
            .filter(|t| t.addr == AUX && t.read_len == 0)
            .filter_map(|t| t.writes.first().map(|frame| (frame.clone(), t.at)))
            .filter(|(frame, _)| frame.first() == Some(&opcode))
            .collect()
    }

    pub fn clear_log(&self) {
        let mut state = self.state();
        state.log.clear();
        state.indirect_log.clear();
    }
}

impl State {
    fn write_direct(&mut self, bank: u8, offset: u8, value: u8, at: Instant) {
        self.direct.insert((bank, offset), value);
        if bank != MAILBOX_BANK {
            return;
        }
        match offset {
            0x31 => self.staged = false,
            0x32 => self.staged = true,
            0x30 if value != 0 => {
                let address = self.direct.get(&(MAILBOX_BANK, 0x31)).copied().unwrap_or(0);
                if self.staged {
                    let data = self.direct.get(&(MAILBOX_BANK, 0x32)).copied().unwrap_or(0);
                    self.indirect.insert((value, address), data);
                    self.indirect_log.push(IndirectWrite {
                        command: value,
                        address,
                        value: data,
                        at,
                    });
                } else {
                    let data = self.indirect.get(&(value, address)).copied().unwrap_or(0);
                    self.direct.insert((MAILBOX_BANK, 0x32), data);
                }
                self.staged = false;
                self.direct.insert((MAILBOX_BANK, 0x30), 0);
            }
            _ => {}
        }
    }

    fn read_direct(&self, bank: u8, offset: u8) -> u8 {
        if self.stuck && (bank, offset) == (MAILBOX_BANK, 0x30) {
            return 0x01;
        }
        self.direct.get(&(bank, offset)).copied().unwrap_or(0)
    }
}

impl BusTransport for FakeEc {
    fn transfer(&mut self, addr: u16, segments: &[Segment<'_>]) -> Result<Vec<u8>, EcError> {
        let mut state = self.state();

        if let Some(kind) = state.pending_failures.pop_front().or(state.fail_always) {
            return Err(match kind {
                FailKind::Bus => EcError::Bus {
                    addr,
                    source: io::Error::other("injected bus fault"),
                },
                FailKind::Timeout => EcError::Timeout {
                    addr,
                    waited: Duration::from_millis(1),
                },
            });
        }

        let writes: Vec<Vec<u8>> = segments
            .iter()
            .filter_map(|s| match s {
                Segment::Write(bytes) => Some(bytes.to_vec()),
                Segment::Read(_) => None,
            })
            .collect();
        let read_len: usize = segments
            .iter()
            .map(|s| match s {
                Segment::Read(n) => *n,
                Segment::Write(_) => 0,
            })
            .sum();
        let at = Instant::now();

        let mut response = match (addr, writes.as_slice()) {
            (EC, [select, data]) if select.len() == 3 && select[0] == 0x10 => {
                let (bank, offset) = (select[1], select[2]);
                match data.as_slice() {
                    [0x11] => vec![state.read_direct(bank, offset)],
                    [0x11, value] => {
                        state.write_direct(bank, offset, *value, at);
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            (AUX, [frame]) if frame.len() == 2 && frame[0] == 0x22 => {
                let fan = frame[1].saturating_sub(1);
                let rpm = state.rpm.get(&fan).copied().unwrap_or(0);
                vec![2, (rpm & 0xff) as u8, (rpm >> 8) as u8]
            }
            _ => Vec::new(),
        };
        response.resize(read_len, 0);
        if state.truncate_reads {
            response.truncate(read_len.saturating_sub(1));
        }

        state.log.push(Transfer {
            addr,
            writes,
            read_len,
            at,
        });
        Ok(response)
    }
}
