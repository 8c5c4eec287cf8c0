//! Backoff policies for loops that retry transient infrastructure errors.

use std::time::Duration;

/// Default exponential multiplier when not specified
pub const DEFAULT_EXPONENTIAL_MULTIPLIER: f64 = 2.0;

/// Baseline delay for queue/store retries.
pub const DEFAULT_BASE_DELAY_MS: i32 = 500;

/// Upper bound on any single retry delay.
pub const DEFAULT_MAX_DELAY_MS: i64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BackoffConfig {
    /// No delay between retries (immediate retry)
    #[default]
    None,
    /// Linear backoff: delay = base_delay_ms * attempt_number
    Linear { base_delay_ms: i32 },
    /// Exponential backoff: delay = base_delay_ms * multiplier^(attempt_number - 1)
    Exponential { base_delay_ms: i32, multiplier: f64 },
}

impl BackoffConfig {
    pub fn exponential(base_delay_ms: i32) -> Self {
        Self::Exponential {
            base_delay_ms,
            multiplier: DEFAULT_EXPONENTIAL_MULTIPLIER,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            BackoffConfig::None => "none",
            BackoffConfig::Linear { .. } => "linear",
            BackoffConfig::Exponential { .. } => "exponential",
        }
    }

    pub fn base_delay_ms(&self) -> i32 {
        match self {
            BackoffConfig::None => 0,
            BackoffConfig::Linear { base_delay_ms } => *base_delay_ms,
            BackoffConfig::Exponential { base_delay_ms, .. } => *base_delay_ms,
        }
    }

    pub fn multiplier(&self) -> f64 {
        match self {
            BackoffConfig::Exponential { multiplier, .. } => *multiplier,
            _ => DEFAULT_EXPONENTIAL_MULTIPLIER,
        }
    }

    pub fn calculate_delay_ms(&self, attempt_number: i32) -> i64 {
        if attempt_number <= 0 {
            return 0;
        }
        match self {
            BackoffConfig::None => 0,
            BackoffConfig::Linear { base_delay_ms } => {
                if *base_delay_ms <= 0 {
                    return 0;
                }
                (*base_delay_ms as i64) * (attempt_number as i64)
            }
            BackoffConfig::Exponential {
                base_delay_ms,
                multiplier,
            } => {
                if *base_delay_ms <= 0 {
                    return 0;
                }
                // delay = base_delay * multiplier^(attempt - 1)
                let exp = (attempt_number - 1) as f64;
                let factor = multiplier.powf(exp);
                let delay = (*base_delay_ms as f64) * factor;
                if delay.is_finite() && delay < i64::MAX as f64 {
                    delay as i64
                } else {
                    i64::MAX
                }
            }
        }
    }
}

/// Retry counter owned by a single control loop.
///
/// Each stream or connection builds its own `Backoff`; nothing is shared
/// across loops, so one backend's failures never slow down another's.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    max_delay_ms: i64,
    attempt: i32,
}

impl Backoff {
    pub fn new(config: BackoffConfig, max_delay: Duration) -> Self {
        Self {
            config,
            max_delay_ms: max_delay.as_millis().min(i64::MAX as u128) as i64,
            attempt: 0,
        }
    }

    /// Exponential from `DEFAULT_BASE_DELAY_MS`, capped at `DEFAULT_MAX_DELAY_MS`.
    pub fn standard() -> Self {
        Self::new(
            BackoffConfig::exponential(DEFAULT_BASE_DELAY_MS),
            Duration::from_millis(DEFAULT_MAX_DELAY_MS as u64),
        )
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let delay_ms = self
            .config
            .calculate_delay_ms(self.attempt)
            .clamp(0, self.max_delay_ms);
        Duration::from_millis(delay_ms as u64)
    }

    /// Back to baseline after a successful operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms as u64)
    }
}
