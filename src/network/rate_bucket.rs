//! Token bucket rate limiter
//!
//! Buckets refill lazily: nothing happens between calls, and every consume
//! first credits the whole refill intervals elapsed since `next_refill_at`.
//! When the credit hits `capacity` the anchor jumps to "now" and the partial
//! interval is discarded. Persisted buckets written by earlier releases rely on
//! that accounting, so it must stay.

use std::fmt;

/// Token bucket state for one (source, endpoint class) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBucket {
    capacity: i32,
    refill_rate_millis: i64,
    tokens: i32,
    next_refill_at: i64,
}

impl RateBucket {
    /// Full bucket anchored at the current time
    pub fn new(capacity: i32, refill_rate_millis: i64) -> Self {
        Self::new_at(capacity, refill_rate_millis, now_millis())
    }

    /// Full bucket anchored at `now`
    pub fn new_at(capacity: i32, refill_rate_millis: i64, now: i64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_rate_millis: refill_rate_millis.max(1),
            tokens: capacity,
            next_refill_at: now,
        }
    }

    pub fn capacity(&self) -> i32 {
        self.capacity
    }

    pub fn refill_rate_millis(&self) -> i64 {
        self.refill_rate_millis
    }

    pub fn tokens(&self) -> i32 {
        self.tokens
    }

    pub fn next_refill_at(&self) -> i64 {
        self.next_refill_at
    }

    pub fn try_consume(&mut self) -> bool {
        self.try_consume_n_at(1, now_millis())
    }

    pub fn try_consume_n(&mut self, n: i32) -> bool {
        self.try_consume_n_at(n, now_millis())
    }

    pub fn try_consume_at(&mut self, now: i64) -> bool {
        self.try_consume_n_at(1, now)
    }

    /// Take `n` tokens if available after refilling up to `now`
    ///
    /// A request larger than the capacity can never succeed and leaves the
    /// bucket untouched, refill included.
    pub fn try_consume_n_at(&mut self, n: i32, now: i64) -> bool {
        if n > self.capacity {
            return false;
        }
        if n <= 0 {
            return true;
        }

        self.refill(now);

        if self.tokens < n {
            return false;
        }
        self.tokens -= n;
        true
    }

    /// Milliseconds until at least one more token is credited
    pub fn millis_until_next_token(&self, now: i64) -> i64 {
        if self.tokens > 0 {
            return 0;
        }
        let elapsed = now.saturating_sub(self.next_refill_at);
        if elapsed >= self.refill_rate_millis {
            0
        } else {
            self.refill_rate_millis - elapsed.max(0)
        }
    }

    fn refill(&mut self, now: i64) {
        let elapsed = now.saturating_sub(self.next_refill_at);
        if elapsed <= 0 {
            return;
        }
        let intervals = elapsed / self.refill_rate_millis;
        if intervals == 0 {
            return;
        }

        let credited = (self.tokens as i64).saturating_add(intervals);
        if credited >= self.capacity as i64 {
            self.tokens = self.capacity;
            self.next_refill_at = now;
        } else {
            self.tokens = credited as i32;
            self.next_refill_at += intervals * self.refill_rate_millis;
        }
    }

    /// `capacity;refillRateMillis;tokens;nextRefillAt`
    pub fn serialize(&self) -> String {
        self.to_string()
    }

    /// Parse the four-field form, rejecting anything that could not have
    /// come from a valid bucket. Out-of-range token counts are clamped.
    pub fn deserialize(value: &str) -> Option<Self> {
        let fields: Vec<&str> = value.trim().split(';').collect();
        if fields.len() != 4 {
            return None;
        }

        let capacity: i32 = fields[0].trim().parse().ok()?;
        let refill_rate_millis: i64 = fields[1].trim().parse().ok()?;
        let tokens: i32 = fields[2].trim().parse().ok()?;
        let next_refill_at: i64 = fields[3].trim().parse().ok()?;

        if capacity <= 0 || refill_rate_millis <= 0 {
            return None;
        }

        Some(Self {
            capacity,
            refill_rate_millis,
            tokens: tokens.clamp(0, capacity),
            next_refill_at,
        })
    }
}

impl fmt::Display for RateBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{}",
            self.capacity, self.refill_rate_millis, self.tokens, self.next_refill_at
        )
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
