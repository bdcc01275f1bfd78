use std::time::Duration;

use rand::Rng;

const DEFAULT_INIT: Duration = Duration::ZERO;
const DEFAULT_JITTER: Duration = Duration::from_millis(500);
const DEFAULT_MAX: Duration = Duration::from_secs(5);

/// Jittered, capped backoff for connection attempts.
///
/// A fresh backoff has zero delay. Each failure adds the base jitter plus a
/// random share of it; once the delay passes `max` it is pinned to `max`
/// plus half of the last increment.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    init: Duration,
    jitter: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(init: Duration, jitter: Duration, max: Duration) -> Self {
        Self {
            delay: Duration::ZERO,
            init,
            jitter,
            max,
        }
    }

    /// Seed the delay for a reconnect after a connection was established.
    pub fn init(&mut self) {
        self.delay = self.init;
        self.add_jitter();
    }

    pub fn fail(&mut self) {
        self.add_jitter();
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    fn add_jitter(&mut self) {
        let base = self.jitter.as_nanos() as u64;
        let extra = if base > 0 {
            rand::thread_rng().gen_range(0..base)
        } else {
            0
        };
        let delta = Duration::from_nanos(base + extra);
        self.delay += delta;
        if self.delay > self.max {
            self.delay = self.max + delta / 2;
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_INIT, DEFAULT_JITTER, DEFAULT_MAX)
    }
}
