use std::{collections::BTreeSet, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{ChannelId, EngineError, Result, SourceConfig, WaveShape};

/// Upper bound on the number of simultaneously configured channels.
pub const MAX_CHANNELS: usize = 10;

/// Slowest accepted scheduler rate, one tick every 1000 seconds.
pub const MIN_TICK_RATE_HZ: f32 = 0.001;
/// Fastest accepted scheduler rate.
pub const MAX_TICK_RATE_HZ: f32 = 10_000.0;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            channels: vec![
                ChannelConfig::default(),
                ChannelConfig {
                    id: ChannelId(1),
                    source: SourceConfig::Waveform {
                        shape: WaveShape::Square,
                        frequency: 3.0,
                        amplitude: 0.5,
                        duty_cycle: 25.0,
                    },
                    ..ChannelConfig::default()
                },
            ],
        }
    }
}

impl AppConfig {
    /// Reads and validates a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        validate_channel_set(&self.channels)
    }
}

/// Timing parameters of the analysis loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scheduler ticks per second.
    pub tick_rate_hz: f32,
    /// Upper bound on how long a tick waits for any one channel's pull.
    pub pull_timeout_ms: u64,
    /// Generations buffered per subscriber before notifications are dropped.
    pub subscriber_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 60.0,
            pull_timeout_ms: 20,
            subscriber_capacity: 16,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.tick_period()?;
        if self.pull_timeout_ms == 0 {
            return Err(EngineError::invalid("pull timeout must be non-zero"));
        }
        if self.subscriber_capacity == 0 {
            return Err(EngineError::invalid("subscriber capacity must be non-zero"));
        }
        Ok(())
    }

    /// Time between ticks. Fails for rates outside
    /// [`MIN_TICK_RATE_HZ`]..=[`MAX_TICK_RATE_HZ`].
    pub fn tick_period(&self) -> Result<Duration> {
        let rate = self.tick_rate_hz;
        if !(MIN_TICK_RATE_HZ..=MAX_TICK_RATE_HZ).contains(&rate) {
            return Err(EngineError::invalid(format!(
                "tick rate must be between {MIN_TICK_RATE_HZ} and {MAX_TICK_RATE_HZ} Hz, got {rate}"
            )));
        }
        Duration::try_from_secs_f64(1.0 / f64::from(rate))
            .map_err(|err| EngineError::invalid(format!("tick rate {rate} Hz: {err}")))
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }
}

/// Per-channel parameters consumed when the channel set is (re)applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub id: ChannelId,
    /// Samples per second, strictly positive.
    pub sample_rate: f32,
    /// Ring buffer capacity in samples, strictly positive.
    pub buffer_capacity: usize,
    /// Attack time constant in seconds. Zero means instantaneous.
    pub attack_time_constant: f32,
    /// Release time constant in seconds. Zero means instantaneous.
    pub release_time_constant: f32,
    pub enabled: bool,
    pub source: SourceConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: ChannelId(0),
            sample_rate: 1_000.0,
            buffer_capacity: 1_000,
            attack_time_constant: 0.001,
            release_time_constant: 0.05,
            enabled: true,
            source: SourceConfig::default(),
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<()> {
        let id = self.id;
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(EngineError::invalid(format!(
                "channel {id}: sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.buffer_capacity == 0 {
            return Err(EngineError::invalid(format!(
                "channel {id}: buffer capacity must be non-zero"
            )));
        }
        for (name, tau) in [
            ("attack", self.attack_time_constant),
            ("release", self.release_time_constant),
        ] {
            if tau.is_nan() || tau < 0.0 {
                return Err(EngineError::invalid(format!(
                    "channel {id}: {name} time constant must be >= 0, got {tau}"
                )));
            }
        }
        self.source.validate().map_err(|err| match err {
            EngineError::InvalidConfiguration(reason) => {
                EngineError::invalid(format!("channel {id}: {reason}"))
            }
            other => other,
        })
    }

    /// True when switching from `self` to `other` needs no state reset.
    pub fn analysis_matches(&self, other: &ChannelConfig) -> bool {
        self.sample_rate == other.sample_rate
            && self.buffer_capacity == other.buffer_capacity
            && self.attack_time_constant == other.attack_time_constant
            && self.release_time_constant == other.release_time_constant
    }
}

/// Validates a full channel set: every entry, unique ids and the size cap.
pub fn validate_channel_set(channels: &[ChannelConfig]) -> Result<()> {
    if channels.len() > MAX_CHANNELS {
        return Err(EngineError::invalid(format!(
            "at most {MAX_CHANNELS} channels are supported, got {}",
            channels.len()
        )));
    }

    let mut seen = BTreeSet::new();
    for channel in channels {
        channel.validate()?;
        if !seen.insert(channel.id) {
            return Err(EngineError::invalid(format!(
                "duplicate channel id {}",
                channel.id
            )));
        }
    }
    Ok(())
}
