use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(250);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_JITTER: f64 = 0.2;

/// Exponential backoff parameters for reconnecting upstream subscriptions.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the computed delay applied as random +/- jitter.
    pub jitter: f64,
    /// `None` retries for as long as someone is listening.
    pub max_attempts: Option<usize>,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
            max_attempts: None,
        }
    }
}

impl BackoffSettings {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

#[derive(Debug)]
pub struct Backoff {
    settings: BackoffSettings,
    attempt: usize,
}

impl Backoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            attempt: 0,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if let Some(max) = self.settings.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let delay = delay_for_attempt(&self.settings, self.attempt, rng);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn delay_for_attempt<R: Rng + ?Sized>(
    settings: &BackoffSettings,
    attempt: usize,
    rng: &mut R,
) -> Duration {
    let max_millis = settings.max_delay.as_millis() as f64;
    let base = (settings.initial_delay.as_millis() as f64
        * settings.multiplier.powi(attempt.min(i32::MAX as usize) as i32))
    .min(max_millis);
    let jitter = if settings.jitter > 0.0 {
        settings.jitter * base * rng.gen_range(-1.0..=1.0)
    } else {
        0.0
    };
    let millis = (base + jitter).round().clamp(0.0, max_millis);
    Duration::from_millis(millis as u64)
}
