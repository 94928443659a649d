//! Rate limits for summarizer calls.
//!
//! Two limits apply to every reservation:
//! - A daily cap that resets when the UTC calendar day changes
//! - A minimum interval between calls derived from requests-per-minute
//!
//! Waiting for the interval happens outside the lock and is interrupted by
//! shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::eventbus::Shutdown;

/// Summary quota settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSettings {
    /// Maximum summaries per UTC day; 0 disables the cap (default: 1000)
    #[serde(default = "default_requests_per_day")]
    pub requests_per_day: u32,

    /// Maximum summaries per minute; 0 disables spacing (default: 15)
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

fn default_requests_per_day() -> u32 {
    1000
}
fn default_requests_per_minute() -> u32 {
    15
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            requests_per_day: default_requests_per_day(),
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("Quota wait cancelled by shutdown")]
    Cancelled,

    #[error("Quota state lock poisoned")]
    Poisoned,
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Default)]
struct QuotaState {
    day: Option<NaiveDate>,
    used_today: u32,
    last_call: Option<DateTime<Utc>>,
}

/// Shared limiter; one instance per process
pub struct SummaryQuota {
    state: Mutex<QuotaState>,
    daily_limit: u32,
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl SummaryQuota {
    pub fn new(settings: &QuotaSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: &QuotaSettings, clock: Arc<dyn Clock>) -> Self {
        let interval = if settings.requests_per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(60) / settings.requests_per_minute
        };
        Self {
            state: Mutex::new(QuotaState::default()),
            daily_limit: settings.requests_per_day,
            interval,
            clock,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reservations made so far on the current UTC day
    pub fn used_today(&self) -> Result<u32, QuotaError> {
        let mut state = self.state.lock().map_err(|_| QuotaError::Poisoned)?;
        roll_day(&mut state, self.clock.now());
        Ok(state.used_today)
    }

    /// Reserve one summarizer call.
    ///
    /// Returns `Ok(false)` when today's cap is exhausted, `Ok(true)` once a slot
    /// is reserved (after waiting out the minimum interval if needed).
    pub async fn wait_and_reserve(&self, shutdown: &Shutdown) -> Result<bool, QuotaError> {
        loop {
            let wait = {
                let mut state = self.state.lock().map_err(|_| QuotaError::Poisoned)?;
                let now = self.clock.now();
                roll_day(&mut state, now);

                if self.daily_limit > 0 && state.used_today >= self.daily_limit {
                    return Ok(false);
                }

                let wait = match state.last_call {
                    Some(last) if !self.interval.is_zero() => {
                        let next_allowed = last
                            + chrono::Duration::from_std(self.interval)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                        (next_allowed - now).to_std().unwrap_or(Duration::ZERO)
                    }
                    _ => Duration::ZERO,
                };

                if wait.is_zero() {
                    state.used_today += 1;
                    state.last_call = Some(now);
                    return Ok(true);
                }
                wait
            };

            if !shutdown.sleep(wait).await {
                return Err(QuotaError::Cancelled);
            }
        }
    }
}

fn roll_day(state: &mut QuotaState, now: DateTime<Utc>) {
    let today = now.date_naive();
    if state.day != Some(today) {
        state.day = Some(today);
        state.used_today = 0;
    }
}
