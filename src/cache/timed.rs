use std::time::{Duration, Instant};

/// A cached value that is usable only until its expiry
#[derive(Debug, Clone)]
pub struct TimedEntry<T> {
    value: T,
    expires_at: Instant,
    valid: bool,
}

impl<T> TimedEntry<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
            valid: true,
        }
    }

    /// The value if still valid at `now`
    pub fn get_at(&self, now: Instant) -> Option<&T> {
        if self.valid && now < self.expires_at {
            Some(&self.value)
        } else {
            None
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.get_at(Instant::now())
    }

    /// Mark the entry unusable without waiting for expiry
    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}
