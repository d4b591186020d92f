//! Device model registry.
//!
//! Every supported machine is one [`Model`] entry in [`MODELS`]: the EC
//! addresses, the register layout, fan descriptions and the timing limits the
//! daemon has to respect. Supporting a new machine means adding an entry.

use std::{fs, path::Path, time::Duration};

use log::{info, warn};
use serde::Serialize;

use crate::error::EcError;

/// Default location of the firmware-provided model string.
pub const IDENTITY_PATH: &str = "/sys/firmware/devicetree/base/model";

/// Indirect (mailbox) EC register: command byte plus sub-address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxRegister {
    pub command: u8,
    pub address: u8,
}

/// Keyboard backlight frame layout on the auxiliary controller.
#[derive(Debug, Clone, Copy)]
pub struct BacklightRegister {
    pub opcode: u8,
    pub header: &'static [u8],
    pub trailer: u8,
    pub padding: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RegisterMap {
    /// Auxiliary opcode and fixed header preceding the encoded temperature.
    pub temperature_opcode: u8,
    pub temperature_header: &'static [u8],
    pub fan_mode: MailboxRegister,
    pub fan_mode_auto: u8,
    pub fan_mode_manual: u8,
    pub fan_select: MailboxRegister,
    pub fan_speed: MailboxRegister,
    pub fan_rpm_opcode: u8,
    pub profile_opcode: u8,
    pub suspend_opcode: u8,
    pub keyboard_backlight: Option<BacklightRegister>,
}

/// Fixed-point temperature encoding understood by the EC.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureFormat {
    /// Raw units per degree Celsius.
    pub scale: f32,
    /// Largest raw value the EC accepts; 0 is the smallest.
    pub max_raw: u16,
}

impl TemperatureFormat {
    /// Encodes a Celsius reading, clamping it into the accepted range.
    pub fn encode(&self, celsius: f32) -> u16 {
        if celsius.is_nan() {
            return 0;
        }
        (celsius * self.scale)
            .round()
            .clamp(0.0, f32::from(self.max_raw)) as u16
    }

    pub fn decode(&self, raw: u16) -> f32 {
        f32::from(raw) / self.scale
    }

    /// Valid Celsius range, inclusive.
    pub fn range(&self) -> (f32, f32) {
        (0.0, self.decode(self.max_raw))
    }
}

/// Quadratic fit of fan RPM against the raw 0-255 speed value.
///
/// `rpm = a·x² + b·x + c`, measured between `min_speed` (lowest value that
/// keeps a spinning fan turning) and 255. `spin_up` is the lowest value that
/// starts a stopped fan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RpmModel {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub min_speed: u8,
    pub spin_up: u8,
    pub max_rpm: u32,
}

impl RpmModel {
    pub fn rpm_for_speed(&self, speed: u8) -> f64 {
        let x = f64::from(speed);
        self.a * x * x + self.b * x + self.c
    }

    /// Raw speed value that should produce roughly `rpm`.
    ///
    /// Uses the rising branch of the fit. Targets above the curve's peak map
    /// to full speed. `None` when the fit is not concave or its
    /// coefficients are not finite, since there is no such branch then.
    pub fn speed_for_rpm(&self, rpm: u32) -> Option<u8> {
        if self.a >= 0.0 || !(self.a.is_finite() && self.b.is_finite() && self.c.is_finite()) {
            return None;
        }
        if rpm == 0 {
            return Some(0);
        }

        let discriminant = self.b * self.b - 4.0 * self.a * (self.c - f64::from(rpm));
        let value = if discriminant < 0.0 {
            256.0
        } else {
            (-self.b + discriminant.sqrt()) / (2.0 * self.a)
        };
        if !value.is_finite() {
            return None;
        }

        if value < f64::from(self.min_speed) || value > 254.0 {
            warn!("Speed for {rpm} RPM is outside the measured range");
        }

        Some(value.round().clamp(0.0, 255.0) as u8)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FanSpec {
    pub name: &'static str,
    pub blades: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpm_model: Option<RpmModel>,
}

impl FanSpec {
    /// Tachometer frequency for a given RPM.
    pub fn hz_for_rpm(&self, rpm: u32) -> f64 {
        f64::from(rpm) * f64::from(self.blades) / 60.0
    }

    pub fn rpm_for_hz(&self, hz: f64) -> f64 {
        hz / f64::from(self.blades) * 60.0
    }
}

/// Timing limits imposed by the EC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Minimum spacing between two writes to the same register.
    pub min_write_interval: Duration,
    /// The EC forces a power-off if temperature reports stop for this long.
    pub watchdog_interval: Duration,
    /// Default temperature report period.
    pub report_interval: Duration,
}

#[derive(Debug)]
pub struct Model {
    /// Firmware model string, matched exactly.
    pub name: &'static str,
    pub ec_address: u16,
    pub aux_address: u16,
    pub registers: RegisterMap,
    pub temperature: TemperatureFormat,
    pub fans: &'static [FanSpec],
    pub profiles: &'static [&'static str],
    pub timing: Timing,
}

impl Model {
    pub fn fan(&self, index: u8) -> Option<&FanSpec> {
        self.fans.get(usize::from(index))
    }

    pub fn profile(&self, index: u8) -> Option<&'static str> {
        self.profiles.get(usize::from(index)).copied()
    }

    pub fn fan_count(&self) -> u8 {
        u8::try_from(self.fans.len()).unwrap_or(u8::MAX)
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            name: self.name,
            profiles: self.profiles.to_vec(),
            fans: self.fans.to_vec(),
            keyboard_backlight: self.registers.keyboard_backlight.is_some(),
            min_write_interval_ms: self.timing.min_write_interval.as_millis() as u64,
            watchdog_interval_s: self.timing.watchdog_interval.as_secs(),
        }
    }
}

/// Serializable view of a model for `arm-ecd models`.
#[derive(Debug, Serialize)]
pub struct ModelSummary {
    pub name: &'static str,
    pub profiles: Vec<&'static str>,
    pub fans: Vec<FanSpec>,
    pub keyboard_backlight: bool,
    pub min_write_interval_ms: u64,
    pub watchdog_interval_s: u64,
}

const ASUS_BACKLIGHT: BacklightRegister = BacklightRegister {
    opcode: 0x51,
    header: &[0x07, 0x66, 0x00, 0x10, 0x00, 0xb3],
    trailer: 0x55,
    padding: 9,
};

pub static MODELS: &[Model] = &[Model {
    name: "ASUS Vivobook S 15",
    ec_address: 0x5b,
    aux_address: 0x76,
    registers: RegisterMap {
        temperature_opcode: 0x20,
        temperature_header: &[0x01, 0x02],
        fan_mode: MailboxRegister {
            command: 0x01,
            address: 0x82,
        },
        fan_mode_auto: 0,
        fan_mode_manual: 2,
        fan_select: MailboxRegister {
            command: 0x01,
            address: 0x8c,
        },
        fan_speed: MailboxRegister {
            command: 0x01,
            address: 0x8a,
        },
        fan_rpm_opcode: 0x22,
        profile_opcode: 0x24,
        suspend_opcode: 0x23,
        keyboard_backlight: Some(ASUS_BACKLIGHT),
    },
    temperature: TemperatureFormat {
        scale: 10.0,
        max_raw: 2000,
    },
    fans: &[
        FanSpec {
            name: "Left Fan",
            blades: 97,
            rpm_model: Some(RpmModel {
                a: -0.06309,
                b: 48.64,
                c: -174.4,
                min_speed: 17,
                spin_up: 22,
                max_rpm: 8340,
            }),
        },
        FanSpec {
            name: "Right Fan",
            blades: 97,
            rpm_model: Some(RpmModel {
                a: -0.07043,
                b: 56.12,
                c: -2255.0,
                min_speed: 55,
                spin_up: 59,
                max_rpm: 8400,
            }),
        },
    ],
    profiles: &["Whisper", "Standard", "Performance", "Full speed"],
    timing: Timing {
        min_write_interval: Duration::from_millis(500),
        watchdog_interval: Duration::from_secs(120),
        report_interval: Duration::from_secs(2),
    },
}];

pub fn find_model(identity: &str) -> Option<&'static Model> {
    MODELS.iter().find(|model| model.name == identity)
}

/// Reads the firmware model string, stripping trailing NULs and whitespace.
pub fn read_identity(path: &Path) -> Result<String, EcError> {
    let raw = fs::read(path).map_err(|e| EcError::Open {
        path: path.to_path_buf(),
        reason: format!("cannot read device identity: {e}"),
    })?;
    Ok(String::from_utf8_lossy(&raw)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string())
}

/// Selects the model for the running machine.
///
/// Fails closed: an identity without a table entry is an error, never a
/// guessed layout.
pub fn resolve_model(identity_path: &Path) -> Result<&'static Model, EcError> {
    let identity = read_identity(identity_path)?;
    match find_model(&identity) {
        Some(model) => {
            info!("Detected supported device '{}'", model.name);
            Ok(model)
        }
        None => Err(EcError::UnsupportedDevice(identity)),
    }
}
