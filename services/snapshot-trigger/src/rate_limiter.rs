//! Cooldown gate limiting how often snapshot workflows may start.
//!
//! A permit is granted when the cooldown has elapsed since the last granted
//! permit; granting records the new timestamp in the same critical section,
//! so two near-simultaneous triggers can never both pass.

use crate::config::{CooldownScope, RateLimitConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Gate deciding whether a trigger may start a snapshot workflow
pub trait RateLimiter: Send + Sync {
    /// Grant a permit at `now` and record it, or refuse without changing state
    fn try_acquire(&self, device_serial: &str, now: Instant) -> bool;

    /// Time left until a permit could be granted for `device_serial`
    fn remaining(&self, device_serial: &str, now: Instant) -> Duration;
}

/// One cooldown shared by every device
pub struct GlobalCooldown {
    cooldown: Duration,
    last_granted: Mutex<Option<Instant>>,
}

impl GlobalCooldown {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_granted: Mutex::new(None),
        }
    }

    /// Instant of the most recent granted permit
    pub fn last_granted(&self) -> Option<Instant> {
        *self.last_granted.lock()
    }
}

impl RateLimiter for GlobalCooldown {
    fn try_acquire(&self, _device_serial: &str, now: Instant) -> bool {
        let mut last = self.last_granted.lock();
        if !cooled_down(*last, now, self.cooldown) {
            return false;
        }
        *last = Some(now);
        true
    }

    fn remaining(&self, _device_serial: &str, now: Instant) -> Duration {
        remaining(*self.last_granted.lock(), now, self.cooldown)
    }
}

/// Independent cooldown per device serial
pub struct PerDeviceCooldown {
    cooldown: Duration,
    last_granted: Mutex<HashMap<String, Instant>>,
}

impl PerDeviceCooldown {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_granted: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for PerDeviceCooldown {
    fn try_acquire(&self, device_serial: &str, now: Instant) -> bool {
        let mut last = self.last_granted.lock();
        if !cooled_down(last.get(device_serial).copied(), now, self.cooldown) {
            return false;
        }
        last.insert(device_serial.to_string(), now);
        true
    }

    fn remaining(&self, device_serial: &str, now: Instant) -> Duration {
        let last = self.last_granted.lock().get(device_serial).copied();
        remaining(last, now, self.cooldown)
    }
}

/// Build the rate limiter selected by the configuration
pub fn rate_limiter_for(config: &RateLimitConfig) -> Arc<dyn RateLimiter> {
    match config.scope {
        CooldownScope::Global => Arc::new(GlobalCooldown::new(config.cooldown())),
        CooldownScope::PerDevice => Arc::new(PerDeviceCooldown::new(config.cooldown())),
    }
}

fn cooled_down(last: Option<Instant>, now: Instant, cooldown: Duration) -> bool {
    match last {
        None => true,
        Some(last) => now.saturating_duration_since(last) >= cooldown,
    }
}

fn remaining(last: Option<Instant>, now: Instant, cooldown: Duration) -> Duration {
    match last {
        None => Duration::ZERO,
        Some(last) => cooldown.saturating_sub(now.saturating_duration_since(last)),
    }
}
