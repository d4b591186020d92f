use std::{fmt, time::Duration};

#[cfg(debug_assertions)]
use log::debug;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{
    error::{EcError, RejectReason},
    models::Model,
};

use super::{
    device_io::BusTransport,
    protocol::RegisterProtocol,
    rate_limit::{RegisterKey, WriteLimiter},
};

/// Length of the fan RPM reply: byte count, then the RPM little-endian.
const RPM_REPLY_LEN: usize = 3;

/// Default keyboard backlight animation period.
pub const DEFAULT_BACKLIGHT_PERIOD: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FanMode {
    Auto,
    Manual,
}

impl fmt::Display for FanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanMode::Auto => write!(f, "auto"),
            FanMode::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BacklightMode {
    Solid,
    Breathe,
    Rainbow,
    Strobe,
}

impl BacklightMode {
    fn code(self) -> u8 {
        match self {
            BacklightMode::Solid => 1,
            BacklightMode::Breathe => 2,
            BacklightMode::Rainbow => 3,
            BacklightMode::Strobe => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    /// Parses `#rgb` or `#rrggbb` (the `#` is optional).
    pub fn parse_hex(text: &str) -> Option<Self> {
        let hex = text.trim().trim_start_matches('#');
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let channel = |s: &str| u8::from_str_radix(s, 16).ok();
        match hex.len() {
            3 => Some(Self {
                r: channel(&hex[0..1])? * 17,
                g: channel(&hex[1..2])? * 17,
                b: channel(&hex[2..3])? * 17,
            }),
            6 => Some(Self {
                r: channel(&hex[0..2])?,
                g: channel(&hex[2..4])?,
                b: channel(&hex[4..6])?,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backlight {
    pub mode: BacklightMode,
    pub color: Rgb,
    pub period: u8,
}

/// A single write the EC understands, expressed in model-independent terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWrite {
    FanMode(FanMode),
    FanSpeed { fan: u8, speed: u8 },
    Profile(u8),
    SuspendMode(bool),
    KeyboardBacklight(Backlight),
}

impl RegisterWrite {
    pub fn key(&self) -> RegisterKey {
        match *self {
            RegisterWrite::FanMode(_) => RegisterKey::FanMode,
            RegisterWrite::FanSpeed { fan, .. } => RegisterKey::FanSpeed(fan),
            RegisterWrite::Profile(_) => RegisterKey::Profile,
            RegisterWrite::SuspendMode(_) => RegisterKey::SuspendMode,
            RegisterWrite::KeyboardBacklight(_) => RegisterKey::KeyboardBacklight,
        }
    }
}

/// Model-aware EC operations on top of the register protocol.
///
/// Every write passes through the [`WriteLimiter`], so no register is
/// written twice within the model's minimum interval no matter who asks.
#[derive(Debug)]
pub struct EcController<Io: BusTransport> {
    protocol: RegisterProtocol<Io>,
    model: &'static Model,
    limiter: WriteLimiter,
}

impl<Io: BusTransport> EcController<Io> {
    pub fn new(io: Io, model: &'static Model, settle_timeout: Duration) -> Self {
        Self {
            protocol: RegisterProtocol::new(io, model.ec_address, settle_timeout),
            model,
            limiter: WriteLimiter::new(model.timing.min_write_interval),
        }
    }

    pub fn model(&self) -> &'static Model {
        self.model
    }

    /// Encodes and pushes a temperature reading. Returns the raw value sent.
    pub fn send_temperature(&mut self, celsius: f32) -> Result<u16, EcError> {
        let regs = &self.model.registers;
        let raw = self.model.temperature.encode(celsius);

        let mut payload = regs.temperature_header.to_vec();
        payload.extend_from_slice(&raw.to_le_bytes());

        self.limiter.acquire(RegisterKey::Temperature);
        self.protocol
            .send(self.model.aux_address, regs.temperature_opcode, payload)?;
        Ok(raw)
    }

    /// Performs one register write.
    ///
    /// # Errors
    ///
    /// `Rejected` for writes the model cannot express (unknown fan, profile,
    /// missing backlight); bus and protocol errors otherwise.
    pub fn apply(&mut self, write: RegisterWrite) -> Result<(), EcError> {
        self.check(&write)?;

        #[cfg(debug_assertions)]
        {
            debug!("EC write {write:?}");
        }

        let regs = self.model.registers;
        let aux = self.model.aux_address;
        self.limiter.acquire(write.key());

        match write {
            RegisterWrite::FanMode(mode) => {
                let value = match mode {
                    FanMode::Auto => regs.fan_mode_auto,
                    FanMode::Manual => regs.fan_mode_manual,
                };
                self.protocol
                    .mailbox_write(regs.fan_mode.command, regs.fan_mode.address, value)
            }
            RegisterWrite::FanSpeed { fan, speed } => {
                self.protocol
                    .mailbox_write(regs.fan_select.command, regs.fan_select.address, fan)?;
                self.protocol
                    .mailbox_write(regs.fan_speed.command, regs.fan_speed.address, speed)
            }
            RegisterWrite::Profile(profile) => {
                self.protocol.send(aux, regs.profile_opcode, vec![profile])
            }
            RegisterWrite::SuspendMode(on) => {
                self.protocol.send(aux, regs.suspend_opcode, vec![u8::from(on)])
            }
            RegisterWrite::KeyboardBacklight(backlight) => {
                let Some(reg) = regs.keyboard_backlight else {
                    return Err(unsupported("keyboard-backlight", "no keyboard backlight"));
                };
                let mut payload = reg.header.to_vec();
                payload.extend_from_slice(&[
                    backlight.mode.code(),
                    backlight.color.r,
                    backlight.color.g,
                    backlight.color.b,
                    reg.trailer,
                    backlight.period,
                ]);
                payload.resize(payload.len() + reg.padding, 0);
                self.protocol.send(aux, reg.opcode, payload)
            }
        }
    }

    fn check(&self, write: &RegisterWrite) -> Result<(), EcError> {
        match *write {
            RegisterWrite::FanSpeed { fan, .. } if self.model.fan(fan).is_none() => {
                Err(unsupported("fan-speed", &format!("no fan {fan}")))
            }
            RegisterWrite::Profile(profile) if self.model.profile(profile).is_none() => {
                Err(unsupported("profile", &format!("no profile {profile}")))
            }
            _ => Ok(()),
        }
    }

    /// Current fan RPM as reported by the auxiliary controller.
    pub fn fan_rpm(&mut self, fan: u8) -> Result<u16, EcError> {
        self.check(&RegisterWrite::FanSpeed { fan, speed: 0 })?;
        let reply = self.protocol.query(
            self.model.aux_address,
            self.model.registers.fan_rpm_opcode,
            vec![fan + 1],
            RPM_REPLY_LEN,
        )?;
        Ok(u16::from_le_bytes([reply[1], reply[2]]))
    }

    /// Reads the fan mode register back. Used to check that the EC answers.
    pub fn fan_mode(&mut self) -> Result<u8, EcError> {
        let reg = self.model.registers.fan_mode;
        self.protocol.mailbox_read(reg.command, reg.address)
    }
}

fn unsupported(effect: &str, reason: &str) -> EcError {
    EcError::Rejected {
        effect: effect.to_string(),
        reason: RejectReason::Unsupported(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{drivers::i2c_ec::fake::FakeEc, models::MODELS};
    use pretty_assertions::assert_eq;

    fn controller(fake: &FakeEc) -> EcController<FakeEc> {
        EcController::new(fake.clone(), &MODELS[0], Duration::from_millis(200))
    }

    #[test]
    fn temperature_frame_layout() {
        let fake = FakeEc::new();
        let mut ctrl = controller(&fake);

        let raw = ctrl.send_temperature(45.3).unwrap();
        assert_eq!(raw, 453);
        let frames = fake.aux_frames(0x20);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, vec![0x20, 0x01, 0x02, 0xc5, 0x01]);
    }

    #[test]
    fn fan_speed_selects_fan_then_writes_speed() {
        let fake = FakeEc::new();
        let mut ctrl = controller(&fake);

        ctrl.apply(RegisterWrite::FanSpeed { fan: 1, speed: 120 })
            .unwrap();
        let writes: Vec<_> = fake
            .indirect_writes()
            .into_iter()
            .map(|w| (w.command, w.address, w.value))
            .collect();
        assert_eq!(writes, vec![(0x01, 0x8c, 1), (0x01, 0x8a, 120)]);
    }

    #[test]
    fn fan_mode_roundtrip_through_mailbox() {
        let fake = FakeEc::new();
        let mut ctrl = controller(&fake);

        ctrl.apply(RegisterWrite::FanMode(FanMode::Manual)).unwrap();
        assert_eq!(ctrl.fan_mode().unwrap(), 2);
    }

    #[test]
    fn fan_rpm_decodes_little_endian() {
        let fake = FakeEc::new();
        fake.set_rpm(0, 4321);
        let mut ctrl = controller(&fake);
        assert_eq!(ctrl.fan_rpm(0).unwrap(), 4321);
        assert_eq!(fake.transfers()[0].writes, vec![vec![0x22, 0x01]]);
    }

    #[test]
    fn keyboard_backlight_frame() {
        let fake = FakeEc::new();
        let mut ctrl = controller(&fake);

        ctrl.apply(RegisterWrite::KeyboardBacklight(Backlight {
            mode: BacklightMode::Breathe,
            color: Rgb {
                r: 0xff,
                g: 0x80,
                b: 0x00,
            },
            period: DEFAULT_BACKLIGHT_PERIOD,
        }))
        .unwrap();

        let frame = &fake.aux_frames(0x51)[0].0;
        assert_eq!(
            frame[..14],
            [
                0x51, 0x07, 0x66, 0x00, 0x10, 0x00, 0xb3, 2, 0xff, 0x80, 0x00, 0x55, 7, 0
            ]
        );
        assert_eq!(frame.len(), 13 + 9);
    }

    #[test]
    fn unknown_fan_is_rejected_without_traffic() {
        let fake = FakeEc::new();
        let mut ctrl = controller(&fake);
        let err = ctrl
            .apply(RegisterWrite::FanSpeed { fan: 5, speed: 10 })
            .unwrap_err();
        assert!(matches!(err, EcError::Rejected { .. }));
        assert_eq!(fake.transfer_count(), 0);
    }

    #[test]
    fn suspend_and_profile_frames() {
        let fake = FakeEc::new();
        let mut ctrl = controller(&fake);
        ctrl.apply(RegisterWrite::SuspendMode(true)).unwrap();
        ctrl.apply(RegisterWrite::Profile(3)).unwrap();
        assert_eq!(fake.aux_frames(0x23)[0].0, vec![0x23, 1]);
        assert_eq!(fake.aux_frames(0x24)[0].0, vec![0x24, 3]);
        assert!(ctrl.apply(RegisterWrite::Profile(4)).is_err());
    }

    #[test]
    fn rgb_parsing() {
        assert_eq!(
            Rgb::parse_hex("#f80"),
            Some(Rgb {
                r: 0xff,
                g: 0x88,
                b: 0x00
            })
        );
        assert_eq!(
            Rgb::parse_hex("12ab9C"),
            Some(Rgb {
                r: 0x12,
                g: 0xab,
                b: 0x9c
            })
        );
        assert_eq!(Rgb::parse_hex("#12345"), None);
        assert_eq!(Rgb::parse_hex("#xyz"), None);
        assert_eq!(Rgb::parse_hex("#+12"), None);
    }
}
