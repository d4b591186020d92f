//! EC register protocol.
//!
//! Direct EC registers are addressed as `(bank, offset)`: the address is
//! latched with `[0x10, bank, offset]` and the data byte moves through
//! `0x11`. Registers outside the direct window go through the mailbox in
//! bank `0xc4`. The auxiliary controller takes opcode-prefixed frames.

use std::{
    thread,
    time::{Duration, Instant},
};

use crate::error::{EcError, ProtocolError};

use super::device_io::{BusTransport, Segment};

const REG_SELECT: u8 = 0x10;
const REG_DATA: u8 = 0x11;

const MAILBOX_CMD: Register = Register::new(0xc4, 0x30);
const MAILBOX_ADDR: Register = Register::new(0xc4, 0x31);
const MAILBOX_DATA: Register = Register::new(0xc4, 0x32);

/// Poll period while waiting for the mailbox to become idle.
pub const SETTLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub bank: u8,
    pub offset: u8,
}

impl Register {
    pub const fn new(bank: u8, offset: u8) -> Self {
        Self { bank, offset }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    ReadRegister {
        ec: u16,
        reg: Register,
    },
    WriteRegister {
        ec: u16,
        reg: Register,
        value: u8,
    },
    /// Opcode-prefixed write to the auxiliary controller.
    Send {
        device: u16,
        opcode: u8,
        payload: Vec<u8>,
    },
    /// Opcode-prefixed request followed by a fixed-length read.
    Query {
        device: u16,
        opcode: u8,
        args: Vec<u8>,
        response_len: usize,
    },
}

impl Command {
    pub fn address(&self) -> u16 {
        match *self {
            Command::ReadRegister { ec, .. } | Command::WriteRegister { ec, .. } => ec,
            Command::Send { device, .. } | Command::Query { device, .. } => device,
        }
    }

    /// Write messages of the transaction, in order.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        match self {
            Command::ReadRegister { reg, .. } => {
                vec![vec![REG_SELECT, reg.bank, reg.offset], vec![REG_DATA]]
            }
            Command::WriteRegister { reg, value, .. } => {
                vec![vec![REG_SELECT, reg.bank, reg.offset], vec![REG_DATA, *value]]
            }
            Command::Send {
                opcode, payload, ..
            } => {
                let mut frame = Vec::with_capacity(1 + payload.len());
                frame.push(*opcode);
                frame.extend_from_slice(payload);
                vec![frame]
            }
            Command::Query { opcode, args, .. } => {
                let mut frame = Vec::with_capacity(1 + args.len());
                frame.push(*opcode);
                frame.extend_from_slice(args);
                vec![frame]
            }
        }
    }

    pub fn expected_response_len(&self) -> usize {
        match *self {
            Command::ReadRegister { .. } => 1,
            Command::WriteRegister { .. } | Command::Send { .. } => 0,
            Command::Query { response_len, .. } => response_len,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::ReadRegister { .. } => "read-register",
            Command::WriteRegister { .. } => "write-register",
            Command::Send { .. } => "send",
            Command::Query { .. } => "query",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    Ack,
    Byte(u8),
    Bytes(Vec<u8>),
}

impl Response {
    pub fn parse(cmd: &Command, buf: Vec<u8>) -> Result<Self, ProtocolError> {
        let expected = cmd.expected_response_len();
        if buf.len() != expected {
            return Err(ProtocolError::BadAck {
                command: cmd.name(),
                expected,
                got: buf.len(),
            });
        }
        Ok(match cmd {
            Command::WriteRegister { .. } | Command::Send { .. } => Response::Ack,
            Command::ReadRegister { .. } => Response::Byte(buf[0]),
            Command::Query { .. } => Response::Bytes(buf),
        })
    }
}

/// Command layer on top of a [`BusTransport`]. Knows nothing about fans or
/// temperatures; see the controller for that.
#[derive(Debug)]
pub struct RegisterProtocol<Io: BusTransport> {
    io: Io,
    ec: u16,
    settle_timeout: Duration,
}

impl<Io: BusTransport> RegisterProtocol<Io> {
    pub fn new(io: Io, ec: u16, settle_timeout: Duration) -> Self {
        Self {
            io,
            ec,
            settle_timeout,
        }
    }

    pub fn send_command(&mut self, cmd: Command) -> Result<Response, EcError> {
        let frames = cmd.frames();
        let mut segments: Vec<Segment<'_>> =
            frames.iter().map(|frame| Segment::Write(frame)).collect();
        let response_len = cmd.expected_response_len();
        if response_len > 0 {
            segments.push(Segment::Read(response_len));
        }

        let buf = self.io.transfer(cmd.address(), &segments)?;
        Ok(Response::parse(&cmd, buf)?)
    }

    pub fn read_register(&mut self, reg: Register) -> Result<u8, EcError> {
        match self.send_command(Command::ReadRegister { ec: self.ec, reg })? {
            Response::Byte(value) => Ok(value),
            _ => Err(bad_ack("read-register", 1, 0)),
        }
    }

    pub fn write_register(&mut self, reg: Register, value: u8) -> Result<(), EcError> {
        self.send_command(Command::WriteRegister {
            ec: self.ec,
            reg,
            value,
        })
        .map(|_| ())
    }

    pub fn send(&mut self, device: u16, opcode: u8, payload: Vec<u8>) -> Result<(), EcError> {
        self.send_command(Command::Send {
            device,
            opcode,
            payload,
        })
        .map(|_| ())
    }

    pub fn query(
        &mut self,
        device: u16,
        opcode: u8,
        args: Vec<u8>,
        response_len: usize,
    ) -> Result<Vec<u8>, EcError> {
        match self.send_command(Command::Query {
            device,
            opcode,
            args,
            response_len,
        })? {
            Response::Bytes(bytes) => Ok(bytes),
            _ => Err(bad_ack("query", response_len, 0)),
        }
    }

    /// Blocks until the mailbox command register reads zero.
    fn settle(&mut self) -> Result<(), EcError> {
        let started = Instant::now();
        loop {
            if self.read_register(MAILBOX_CMD)? == 0 {
                return Ok(());
            }
            if started.elapsed() >= self.settle_timeout {
                return Err(EcError::Timeout {
                    addr: self.ec,
                    waited: started.elapsed(),
                });
            }
            thread::sleep(SETTLE_POLL);
        }
    }

    /// Reads an indirect register through the mailbox.
    pub fn mailbox_read(&mut self, command: u8, address: u8) -> Result<u8, EcError> {
        self.settle()?;
        self.write_register(MAILBOX_ADDR, address)?;
        self.write_register(MAILBOX_CMD, command)?;
        self.settle()?;
        let value = self.read_register(MAILBOX_DATA)?;
        self.write_register(MAILBOX_DATA, 0)?;
        Ok(value)
    }

    /// Writes an indirect register through the mailbox.
    pub fn mailbox_write(&mut self, command: u8, address: u8, value: u8) -> Result<(), EcError> {
        self.settle()?;
        self.write_register(MAILBOX_ADDR, address)?;
        self.write_register(MAILBOX_DATA, value)?;
        self.write_register(MAILBOX_CMD, command)?;
        self.settle()
    }
}

fn bad_ack(command: &'static str, expected: usize, got: usize) -> EcError {
    EcError::Protocol(ProtocolError::BadAck {
        command,
        expected,
        got,
    })
}
