//! Rate limiting.
//!
//! Two limiters live here: the per-session [`MessageBudget`] consulted for
//! every inbound envelope, and the per-IP [`IpRateLimiter`] guarding the
//! observer endpoints.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Messages a session may send per window.
pub const RATE_MAX: u32 = 100;

/// Length of the rate window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Messages always admitted at the start of a window, before the
/// proportional budget has grown past them.
const WARMUP_BUDGET: u32 = 10;

/// Sliding proportional message budget.
///
/// Instead of admitting the full window quota the moment a window opens, the
/// budget grows linearly with the elapsed fraction of the window, floored at
/// a small warm-up allowance. A sender that bursts early is throttled to the
/// proportional share; a steady sender is never throttled below the overall
/// quota.
#[derive(Debug)]
pub struct MessageBudget {
    window_start: Instant,
    count: u32,
    max_per_window: u32,
}

impl MessageBudget {
    pub fn new(max_per_window: u32) -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
            max_per_window,
        }
    }

    /// Account for one inbound message. Returns `false` if it must be
    /// dropped. Rejected messages are not counted.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= RATE_WINDOW {
            self.count = 0;
            self.window_start = now;
        } else {
            let proportional = (f64::from(self.max_per_window) * elapsed.as_secs_f64()
                / RATE_WINDOW.as_secs_f64()) as u32;
            if self.count >= proportional.max(WARMUP_BUDGET) {
                return false;
            }
        }

        if self.count >= self.max_per_window {
            return false;
        }
        self.count += 1;
        true
    }
}

/// Per-IP request limiter for the observer endpoints.
///
/// Keeps a timestamp list per address within a rolling window. [`gc`] must
/// run periodically to drop idle addresses.
///
/// [`gc`]: IpRateLimiter::gc
#[derive(Debug)]
pub struct IpRateLimiter {
    max_requests: u32,
    window: Duration,
    entries: HashMap<IpAddr, Vec<Instant>>,
}

impl IpRateLimiter {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_secs),
            entries: HashMap::new(),
        }
    }

    /// Check if a request from `ip` is allowed, and record it if so.
    pub fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let requests = self.entries.entry(ip).or_default();
        requests.retain(|t| now.duration_since(*t) < self.window);

        if requests.len() as u32 >= self.max_requests {
            return false;
        }
        requests.push(now);
        true
    }

    /// Drop expired entries to bound memory on long-running processes.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries.retain(|_, requests| {
            requests.retain(|t| now.duration_since(*t) < window);
            !requests.is_empty()
        });
    }
}
