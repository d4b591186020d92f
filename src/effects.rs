//! Multi-step EC write sequences with pre-flight validation.
//!
//! A sequence is checked as a whole before the first write leaves the
//! process. Checks and execution happen under the session lock, so the
//! validated view of the bus cannot go stale halfway through.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use log::info;

use crate::{
    config::KeyboardFireCfg,
    drivers::i2c_ec::{
        EcSession,
        controller::{Backlight, BacklightMode, FanMode, RegisterWrite, Rgb},
        rate_limit::RegisterKey,
    },
    error::{EcError, RejectReason},
    models::Model,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectStep {
    pub write: RegisterWrite,
    /// Pause after the write, before the next step.
    pub hold: Duration,
}

/// Named, ordered list of register writes.
///
/// # Example
///
/// ```
/// use arm_ecd::effects::EffectSequence;
/// use std::time::Duration;
///
/// let ramp = EffectSequence::fan_ramp(0, 64, 128, 32, Duration::from_millis(500));
/// assert_eq!(ramp.steps().len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectSequence {
    name: String,
    steps: Vec<EffectStep>,
}

impl EffectSequence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a write followed by `hold`.
    pub fn then(mut self, write: RegisterWrite, hold: Duration) -> Self {
        self.steps.push(EffectStep { write, hold });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[EffectStep] {
        &self.steps
    }

    pub fn total_hold(&self) -> Duration {
        self.steps.iter().map(|s| s.hold).sum()
    }

    pub fn fan_mode(mode: FanMode) -> Self {
        Self::new("fan-mode").then(RegisterWrite::FanMode(mode), Duration::ZERO)
    }

    pub fn fan_speed(fan: u8, speed: u8) -> Self {
        Self::new("fan-speed").then(RegisterWrite::FanSpeed { fan, speed }, Duration::ZERO)
    }

    /// Moves `fan` from `from` to `to` in increments of at most `step`,
    /// holding each speed for `hold`.
    pub fn fan_ramp(fan: u8, from: u8, to: u8, step: u8, hold: Duration) -> Self {
        let step = step.max(1);
        let mut seq = Self::new("fan-ramp");
        let mut speed = from;
        loop {
            let last = speed == to;
            let pause = if last { Duration::ZERO } else { hold };
            seq = seq.then(RegisterWrite::FanSpeed { fan, speed }, pause);
            if last {
                break seq;
            }
            speed = crate::fan_curve::step_toward(speed, to, step);
        }
    }

    pub fn profile(index: u8) -> Self {
        Self::new("profile").then(RegisterWrite::Profile(index), Duration::ZERO)
    }

    pub fn keyboard_backlight(backlight: Backlight) -> Self {
        Self::new("keyboard-backlight")
            .then(RegisterWrite::KeyboardBacklight(backlight), Duration::ZERO)
    }

    pub fn suspend_mode(on: bool) -> Self {
        Self::new("suspend-mode").then(RegisterWrite::SuspendMode(on), Duration::ZERO)
    }
}

/// Bounds every sequence must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectLimits {
    pub max_fan_step: u8,
    pub max_sequence: Duration,
}

fn reject(seq: &EffectSequence, reason: RejectReason) -> EcError {
    EcError::Rejected {
        effect: seq.name.clone(),
        reason,
    }
}

/// Checks `seq` against the model, the limits and the last speeds written.
pub fn validate(
    seq: &EffectSequence,
    model: &Model,
    limits: &EffectLimits,
    last_speeds: &HashMap<u8, u8>,
) -> Result<(), EcError> {
    let total = seq.total_hold();
    if total > limits.max_sequence {
        return Err(reject(
            seq,
            RejectReason::TooLong {
                total,
                limit: limits.max_sequence,
            },
        ));
    }

    let min_gap = model.timing.min_write_interval;
    let mut speeds = last_speeds.clone();
    // Elapsed hold time at which each register was last written.
    let mut written_at: HashMap<RegisterKey, Duration> = HashMap::new();
    let mut elapsed = Duration::ZERO;

    for step in &seq.steps {
        match step.write {
            RegisterWrite::FanSpeed { fan, speed } => {
                if model.fan(fan).is_none() {
                    return Err(reject(
                        seq,
                        RejectReason::Unsupported(format!("no fan {fan}")),
                    ));
                }
                if let Some(&from) = speeds.get(&fan) {
                    if from.abs_diff(speed) > limits.max_fan_step {
                        return Err(reject(
                            seq,
                            RejectReason::FanStepTooLarge {
                                fan,
                                from,
                                to: speed,
                                max: limits.max_fan_step,
                            },
                        ));
                    }
                }
                speeds.insert(fan, speed);
            }
            RegisterWrite::Profile(index) if model.profile(index).is_none() => {
                return Err(reject(
                    seq,
                    RejectReason::Unsupported(format!("no profile {index}")),
                ));
            }
            RegisterWrite::KeyboardBacklight(_) if model.registers.keyboard_backlight.is_none() => {
                return Err(reject(
                    seq,
                    RejectReason::Unsupported("no keyboard backlight".to_string()),
                ));
            }
            _ => {}
        }

        let key = step.write.key();
        if let Some(&prev) = written_at.get(&key) {
            let gap = elapsed - prev;
            if gap < min_gap {
                return Err(reject(
                    seq,
                    RejectReason::WriteTooSoon {
                        register: key.to_string(),
                        gap,
                        min: min_gap,
                    },
                ));
            }
        }
        written_at.insert(key, elapsed);
        elapsed += step.hold;
    }

    Ok(())
}

/// Runs validated effect sequences on the shared session.
#[derive(Clone)]
pub struct EffectsEngine {
    session: EcSession,
    limits: EffectLimits,
    last_speeds: Arc<Mutex<HashMap<u8, u8>>>,
}

impl EffectsEngine {
    pub fn new(session: EcSession, limits: EffectLimits) -> Self {
        Self {
            session,
            limits,
            last_speeds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn limits(&self) -> EffectLimits {
        self.limits
    }

    /// Whether the session is suspended and effects are being refused.
    pub fn is_held(&self) -> bool {
        self.session.is_suspended()
    }

    /// Last speed this engine wrote to `fan`.
    pub fn last_speed(&self, fan: u8) -> Option<u8> {
        self.last_speeds
            .lock()
            .ok()
            .and_then(|speeds| speeds.get(&fan).copied())
    }

    /// Validates and executes `seq`.
    ///
    /// # Errors
    ///
    /// `Rejected` without any bus traffic when validation fails, and
    /// `Suspended` without any bus traffic while the EC is suspended or not
    /// yet revalidated after resume. Bus and protocol errors from the step
    /// that failed otherwise; steps already sent stay applied.
    pub async fn apply_effect(&self, seq: EffectSequence) -> Result<(), EcError> {
        let limits = self.limits;
        let last_speeds = self.last_speeds.clone();

        self.session
            .run_awake(move |ctrl| {
                let known = last_speeds
                    .lock()
                    .map(|speeds| speeds.clone())
                    .unwrap_or_default();
                validate(&seq, ctrl.model(), &limits, &known)?;

                info!(
                    "Applying effect '{}' ({} step(s), {:?})",
                    seq.name,
                    seq.steps.len(),
                    seq.total_hold()
                );

                for step in &seq.steps {
                    ctrl.apply(step.write)?;
                    if let RegisterWrite::FanSpeed { fan, speed } = step.write {
                        if let Ok(mut speeds) = last_speeds.lock() {
                            speeds.insert(fan, speed);
                        }
                    }
                    if !step.hold.is_zero() {
                        thread::sleep(step.hold);
                    }
                }
                Ok(())
            })
            .await
    }
}

fn channel(fraction: f32) -> u8 {
    (fraction.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Backlight colour for the "fire" effect at `celsius`.
///
/// Red rises first, green follows quadratically at half strength, and blue
/// only joins once the blue threshold is passed.
pub fn fire_color(celsius: f32, cfg: &KeyboardFireCfg) -> Rgb {
    let frac = ((celsius - cfg.min_temp) / cfg.temp_range).clamp(0.0, 1.0);
    let frac2 = ((celsius - cfg.blue_temp) / cfg.temp_range).clamp(0.0, 1.0);
    Rgb {
        r: channel(frac),
        g: channel(frac * frac * 0.5),
        b: channel(frac2),
    }
}

/// Solid backlight showing the fire colour for `celsius`.
pub fn fire_backlight(celsius: f32, cfg: &KeyboardFireCfg) -> Backlight {
    Backlight {
        mode: BacklightMode::Solid,
        color: fire_color(celsius, cfg),
        period: crate::drivers::i2c_ec::controller::DEFAULT_BACKLIGHT_PERIOD,
    }
}
