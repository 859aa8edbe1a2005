//! Reconnect delays growing exponentially up to a cap

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay after a failure
    #[serde(with = "secs")]
    pub initial: Duration,
    /// Upper bound on the delay
    #[serde(with = "secs")]
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Tracks the delay before the next reconnect attempt
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
            attempt: 0,
        }
    }

    /// Delay to use now; the following one grows by the multiplier
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let delay = self.current;
        let grown = self.current.as_secs_f64() * self.config.multiplier.max(1.0);
        self.current = Duration::from_secs_f64(grown.min(self.config.max.as_secs_f64()));
        delay
    }

    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        debug!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.attempt,
            "Waiting before reconnecting"
        );
        sleep(delay).await;
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

/// Durations as whole seconds in config files
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
