use std::{
    collections::HashMap,
    fmt, thread,
    time::{Duration, Instant},
};

use log::debug;

/// Logical EC register, the unit of write rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterKey {
    Temperature,
    FanMode,
    FanSpeed(u8),
    Profile,
    SuspendMode,
    KeyboardBacklight,
}

impl fmt::Display for RegisterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterKey::Temperature => write!(f, "temperature"),
            RegisterKey::FanMode => write!(f, "fan-mode"),
            RegisterKey::FanSpeed(fan) => write!(f, "fan-speed[{fan}]"),
            RegisterKey::Profile => write!(f, "profile"),
            RegisterKey::SuspendMode => write!(f, "suspend-mode"),
            RegisterKey::KeyboardBacklight => write!(f, "keyboard-backlight"),
        }
    }
}

/// Enforces the minimum spacing between writes to the same register.
#[derive(Debug)]
pub struct WriteLimiter {
    min_interval: Duration,
    last: HashMap<RegisterKey, Instant>,
}

impl WriteLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: HashMap::new(),
        }
    }

    /// Time left before `key` may be written again.
    pub fn remaining(&self, key: RegisterKey, now: Instant) -> Duration {
        self.last
            .get(&key)
            .map(|last| (*last + self.min_interval).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Sleeps until `key` may be written, then marks it written.
    pub fn acquire(&mut self, key: RegisterKey) {
        let wait = self.remaining(key, Instant::now());
        if !wait.is_zero() {
            debug!("Holding write to {key} for {wait:?}");
            thread::sleep(wait);
        }
        self.last.insert(key, Instant::now());
    }
}
