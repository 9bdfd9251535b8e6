//! Reconnect policy and backoff calculation.
//!
//! - [`RetryPolicy`]: attempt budget, backoff shape, jitter and the
//!   reconnect-on-loss flag
//! - [`calculate_backoff_delay`]: exponential backoff without jitter
//! - [`calculate_backoff_delay_with_random`]: the same with explicit randomness
//!
//! The math is sync and deterministic given its inputs; [`RetryPolicy::delay_for`]
//! draws the random factor from `rand`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default total connect attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;
/// Default growth factor between attempts.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Connect/reconnect policy for a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total connect attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in ms.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in ms.
    pub max_delay_ms: u64,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Symmetric jitter range: 0.2 means ±20%.
    pub jitter_factor: f64,
    /// Reconnect automatically after an unexpected disconnect.
    pub reconnect: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            reconnect: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once and never reconnects.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            reconnect: false,
            ..Self::default()
        }
    }

    /// Effective attempt budget (at least one).
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt `attempt` (zero-based), jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let random: f64 = rand::random();
        Duration::from_millis(calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.multiplier,
            self.jitter_factor,
            random,
        ))
    }

    /// Jitter-free delay for `attempt`, for logs and tests.
    pub fn nominal_delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(calculate_backoff_delay(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.multiplier,
        ))
    }
}

/// Exponential backoff without jitter.
///
/// Formula: `min(max_delay, base_delay * multiplier^attempt)`
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
pub fn calculate_backoff_delay(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    multiplier: f64,
) -> u64 {
    let growth = multiplier.max(1.0).powi(attempt.min(64) as i32);
    let exponential = (base_delay_ms as f64) * growth;
    if !exponential.is_finite() || exponential >= max_delay_ms as f64 {
        return max_delay_ms;
    }
    exponential.round() as u64
}

/// Backoff with explicit randomness.
///
/// `random` should be a value in `[0.0, 1.0)`. It maps to a factor in
/// `[1 - jitter, 1 + jitter]` applied to the capped delay.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let capped = calculate_backoff_delay(attempt, base_delay_ms, max_delay_ms, multiplier);
    let jitter = 1.0 + (random * 2.0 - 1.0) * jitter_factor.clamp(0.0, 1.0);
    ((capped as f64) * jitter).round().max(0.0) as u64
}
