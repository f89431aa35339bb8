//! Generic "wait until a status is reached" loop.
//!
//! Every waiting operation goes through [`StatusPoller`]: lease activation,
//! lease deletion, server boot and the git checkout of provisioning. Time is
//! read through a [`Clock`] so the same loop drives dry runs on a
//! [`VirtualClock`] without sleeping.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub trait Clock: Send + Sync {
    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock whose `sleep` only advances the reading.
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: Mutex<Duration>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSettings {
    /// Whole-second settings as accepted on the command line. A zero timeout is a
    /// single observation; a zero interval is rejected.
    pub fn from_secs(timeout_seconds: u64, interval_seconds: u64) -> Result<Self> {
        if interval_seconds == 0 {
            return Err(CoreError::Validation(
                "interval must be at least 1 second".to_string(),
            ));
        }
        Ok(Self {
            timeout: Duration::from_secs(timeout_seconds),
            interval: Duration::from_secs(interval_seconds),
        })
    }

    pub fn peek() -> Self {
        Self {
            timeout: Duration::ZERO,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn is_peek(&self) -> bool {
        self.timeout.is_zero()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollExit {
    /// `is_target` held for the last observation.
    Reached,
    /// `is_terminal` held and the target did not.
    Terminal,
    /// The fetch itself failed; the error is in [`PollResult::error`].
    FetchFailed,
    TimedOut,
    /// Timeout was zero and the single observation was neither target nor terminal.
    Peeked,
}

#[derive(Debug, Clone)]
pub struct PollResult<S, E> {
    pub exit: PollExit,
    /// Last successfully fetched status.
    pub final_status: Option<S>,
    pub error: Option<E>,
    pub poll_count: u32,
    pub elapsed: Duration,
}

impl<S, E> PollResult<S, E> {
    pub fn reached(&self) -> bool {
        self.exit == PollExit::Reached
    }

    pub fn timed_out(&self) -> bool {
        self.exit == PollExit::TimedOut
    }

    pub fn elapsed_seconds(&self) -> f64 {
        round_centis(self.elapsed.as_secs_f64())
    }

    pub fn report(&self, settings: &PollSettings) -> PollingReport {
        PollingReport {
            timeout_seconds: settings.timeout.as_secs(),
            interval_seconds: settings.interval.as_secs(),
            poll_count: self.poll_count,
            elapsed_seconds: self.elapsed_seconds(),
        }
    }
}

/// Wait metadata attached to an operation payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingReport {
    pub timeout_seconds: u64,
    pub interval_seconds: u64,
    pub poll_count: u32,
    pub elapsed_seconds: f64,
}

fn round_centis(seconds: f64) -> f64 {
    (seconds * 100.0).round() / 100.0
}

pub struct StatusPoller<'a> {
    clock: &'a dyn Clock,
    settings: PollSettings,
}

impl<'a> StatusPoller<'a> {
    pub fn new(clock: &'a dyn Clock, settings: PollSettings) -> Self {
        Self { clock, settings }
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Fetches until `is_target` or `is_terminal` holds, the fetch fails, or the
    /// timeout elapses. The deadline is inclusive: a fetch is made at exactly
    /// `timeout` when the interval divides it. The last sleep is clipped to the
    /// remaining time, so the loop never oversleeps the deadline.
    pub fn poll<S, E, F, T, X>(&self, mut fetch: F, is_target: T, is_terminal: X) -> PollResult<S, E>
    where
        S: Debug,
        F: FnMut() -> std::result::Result<S, E>,
        T: Fn(&S) -> bool,
        X: Fn(&S) -> bool,
    {
        let started = self.clock.now();
        let mut poll_count = 0u32;
        let mut last_status: Option<S> = None;

        loop {
            let observed = fetch();
            poll_count += 1;
            let elapsed = self.clock.now().saturating_sub(started);

            let status = match observed {
                Ok(status) => status,
                Err(error) => {
                    debug!(poll_count, "status fetch failed; stopping");
                    return PollResult {
                        exit: PollExit::FetchFailed,
                        final_status: last_status,
                        error: Some(error),
                        poll_count,
                        elapsed,
                    };
                }
            };
            debug!(poll_count, status = ?status, elapsed_ms = elapsed.as_millis() as u64, "polled status");

            let exit = if is_target(&status) {
                Some(PollExit::Reached)
            } else if is_terminal(&status) {
                Some(PollExit::Terminal)
            } else if self.settings.is_peek() {
                Some(PollExit::Peeked)
            } else if elapsed >= self.settings.timeout {
                Some(PollExit::TimedOut)
            } else {
                None
            };

            if let Some(exit) = exit {
                return PollResult {
                    exit,
                    final_status: Some(status),
                    error: None,
                    poll_count,
                    elapsed,
                };
            }

            last_status = Some(status);
            let remaining = self.settings.timeout - elapsed;
            self.clock.sleep(self.settings.interval.min(remaining));
        }
    }
}
