//! Tuning configuration with documented defaults.
//!
//! The fabric's behavioral mechanisms (swap-skip prediction, swap retry
//! budget, bounded waits) are fixed; the constants steering them are not.
//! Every knob lives here as an explicit named field with a default, so a
//! caller overrides exactly what it means to override and nothing is
//! passed positionally.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Configuration loading/validation error.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File I/O error.
    #[error("config I/O error: {source}")]
    Io {
        /// Source I/O error.
        #[from]
        source: std::io::Error,
    },

    /// TOML parse error.
    #[error("config parse error: {reason}")]
    Parse {
        /// Parser diagnostic.
        reason: String,
    },

    /// Parameter validation error.
    #[error("config validation: {reason}")]
    Validation {
        /// What was out of bounds.
        reason: String,
    },
}

/// Fabric tuning knobs.
///
/// All durations are stored in microseconds or milliseconds for TOML
/// friendliness; accessor methods return [`Duration`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TuningConfig {
    /// Numerator of the read-latency smoothing factor.
    ///
    /// The reader's latency estimate is updated as
    /// `est = (num * est + (den - num) * sample) / den`.
    pub smoothing_num: u64,
    /// Denominator of the read-latency smoothing factor. Must be greater
    /// than `smoothing_num` and nonzero.
    pub smoothing_den: u64,
    /// For periodic writers: stop retrying a pending buffer swap once less
    /// than this much time remains in the period [µs].
    pub swap_retry_margin_us: u64,
    /// Sleep between cycles while a task is paused [ms].
    pub pause_poll_ms: u64,
    /// Pacing sleep for soft readers and between sporadic retries [µs].
    pub soft_sleep_us: u64,
    /// Bound on waiting for another process to finish initializing the
    /// kernel registry [ms].
    pub init_wait_ms: u64,
    /// Slice length for interruptible lock/semaphore waits [ms]. A stop
    /// request is observed within one slice.
    pub wait_slice_ms: u64,
    /// Bound on acquiring a registry lock [ms]. Registry critical
    /// sections are short; expiry indicates a wedged peer process.
    pub lock_wait_ms: u64,
    /// Bound on waiting for a task to observe `must_stop` and exit [ms].
    pub stop_wait_ms: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            smoothing_num: 7,
            smoothing_den: 8,
            swap_retry_margin_us: 200,
            pause_poll_ms: 10,
            soft_sleep_us: 500,
            init_wait_ms: 5_000,
            wait_slice_ms: 10,
            lock_wait_ms: 1_000,
            stop_wait_ms: 2_000,
        }
    }
}

impl TuningConfig {
    /// Load tuning from a TOML file, falling back to defaults for any
    /// omitted field.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!("tuning config loaded from {}", path.display());
        Ok(config)
    }

    /// Parse tuning from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate parameter bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smoothing_den == 0 || self.smoothing_num >= self.smoothing_den {
            return Err(ConfigError::Validation {
                reason: format!(
                    "smoothing factor {}/{} must satisfy num < den, den > 0",
                    self.smoothing_num, self.smoothing_den
                ),
            });
        }
        if self.wait_slice_ms == 0 {
            return Err(ConfigError::Validation {
                reason: "wait_slice_ms must be nonzero".to_string(),
            });
        }
        if self.lock_wait_ms == 0 {
            return Err(ConfigError::Validation {
                reason: "lock_wait_ms must be nonzero".to_string(),
            });
        }
        if self.stop_wait_ms == 0 {
            return Err(ConfigError::Validation {
                reason: "stop_wait_ms must be nonzero".to_string(),
            });
        }
        Ok(())
    }

    /// Swap retry margin as a [`Duration`].
    pub fn swap_retry_margin(&self) -> Duration {
        Duration::from_micros(self.swap_retry_margin_us)
    }

    /// Pause poll interval as a [`Duration`].
    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    /// Soft-pacing sleep as a [`Duration`].
    pub fn soft_sleep(&self) -> Duration {
        Duration::from_micros(self.soft_sleep_us)
    }

    /// Registry initialization wait bound as a [`Duration`].
    pub fn init_wait(&self) -> Duration {
        Duration::from_millis(self.init_wait_ms)
    }

    /// Interruptible wait slice as a [`Duration`].
    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms)
    }

    /// Registry lock acquisition bound as a [`Duration`].
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Task stop wait bound as a [`Duration`].
    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }

    /// Fold one latency sample into a smoothed estimate.
    pub fn smooth(&self, estimate_ns: u64, sample_ns: u64) -> u64 {
        (self.smoothing_num * estimate_ns + (self.smoothing_den - self.smoothing_num) * sample_ns)
            / self.smoothing_den
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = TuningConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.smoothing_num, 7);
        assert_eq!(config.smoothing_den, 8);
        assert_eq!(config.swap_retry_margin_us, 200);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = TuningConfig::from_toml("smoothing_num = 3\nsmoothing_den = 4\n").unwrap();
        assert_eq!(config.smoothing_num, 3);
        assert_eq!(config.smoothing_den, 4);
        assert_eq!(config.init_wait_ms, TuningConfig::default().init_wait_ms);
    }

    #[test]
    fn invalid_smoothing_rejected() {
        assert!(TuningConfig::from_toml("smoothing_num = 8\nsmoothing_den = 8\n").is_err());
        assert!(TuningConfig::from_toml("smoothing_den = 0\n").is_err());
    }

    #[test]
    fn smoothing_converges_toward_sample() {
        let config = TuningConfig::default();
        let mut est = 0u64;
        for _ in 0..100 {
            est = config.smooth(est, 8_000);
        }
        assert!(est > 7_000 && est <= 8_000);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pause_poll_ms = 25").unwrap();
        let config = TuningConfig::load(file.path()).unwrap();
        assert_eq!(config.pause_poll_ms, 25);
    }
}
