use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{ChannelConfig, EnvelopeFollower, EnvelopeTiming, Result, RingBuffer, Sample};

/// Stable identifier of a channel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything the engine tracks for one channel: its history, its envelope
/// follower and the configuration they were built from.
#[derive(Debug)]
pub struct ChannelState {
    config: ChannelConfig,
    buffer: RingBuffer,
    envelope: EnvelopeFollower,
    view: Arc<[Sample]>,
}

impl ChannelState {
    /// Builds a channel from a validated configuration. Nothing is allocated
    /// when validation fails.
    pub fn new(config: ChannelConfig) -> Result<Self> {
        config.validate()?;

        let buffer = RingBuffer::new(config.buffer_capacity)?;
        let envelope = EnvelopeFollower::new(
            EnvelopeTiming {
                attack: config.attack_time_constant,
                release: config.release_time_constant,
            },
            config.sample_rate,
        )?;

        Ok(Self {
            config,
            buffer,
            envelope,
            view: Arc::from(Vec::new()),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.config.id
    }

    /// The configuration this channel currently runs with.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Samples per second of the channel's stream.
    pub fn sample_rate(&self) -> f32 {
        self.config.sample_rate
    }

    /// Whether scheduler ticks pull from and publish this channel.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Toggles participation in scheduler ticks. Buffer and envelope are kept.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    /// Replaces configuration fields that do not affect analysis state.
    pub(crate) fn update_config(&mut self, config: ChannelConfig) {
        debug_assert!(self.config.analysis_matches(&config));
        self.config = config;
    }

    /// Pushes `samples` into the history and folds them through the envelope
    /// follower, returning the resulting buffer view and envelope value.
    pub fn ingest(&mut self, samples: &[Sample]) -> (Arc<[Sample]>, f32) {
        if !samples.is_empty() {
            self.buffer.push_slice(samples);
            self.envelope.process(samples);
            self.view = Arc::from(self.buffer.contents());
        }
        (self.view.clone(), self.envelope.value())
    }

    /// Immutable view of the buffer as of the last ingest.
    pub fn view(&self) -> Arc<[Sample]> {
        self.view.clone()
    }

    /// Current envelope value.
    pub fn envelope(&self) -> f32 {
        self.envelope.value()
    }

    /// Copy of the buffer contents, oldest first.
    pub fn history(&self) -> Vec<Sample> {
        self.buffer.contents()
    }

    /// Number of samples held, at most the buffer capacity.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Empties the buffer and zeroes the envelope.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.envelope.reset();
        self.view = Arc::from(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineError;

    fn instantaneous(capacity: usize) -> ChannelConfig {
        ChannelConfig {
            id: ChannelId(7),
            sample_rate: 1_000.0,
            buffer_capacity: capacity,
            attack_time_constant: 0.0,
            release_time_constant: 0.0,
            ..ChannelConfig::default()
        }
    }

    #[test]
    fn ingest_keeps_tail_and_tracks_last_magnitude() {
        let mut channel = ChannelState::new(instantaneous(4)).unwrap();
        let (buffer, envelope) = channel.ingest(&[0.1, 0.9, 0.2, -0.5, 0.05]);

        assert_eq!(&buffer[..], &[0.9, 0.2, -0.5, 0.05]);
        assert_eq!(envelope, 0.05);
        assert_eq!(channel.len(), 4);
    }

    #[test]
    fn zero_capacity_creates_nothing() {
        let err = ChannelState::new(instantaneous(0)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration(_)));
    }

    #[test]
    fn empty_ingest_repeats_previous_view() {
        let mut channel = ChannelState::new(instantaneous(8)).unwrap();
        let (first, env_first) = channel.ingest(&[0.3, -0.4]);
        let (second, env_second) = channel.ingest(&[]);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(env_first, env_second);
    }

    #[test]
    fn disabling_does_not_reset_state() {
        let mut channel = ChannelState::new(instantaneous(8)).unwrap();
        channel.ingest(&[0.5, -0.25]);

        channel.set_enabled(false);
        channel.set_enabled(true);

        assert_eq!(channel.history(), vec![0.5, -0.25]);
        assert_eq!(channel.envelope(), 0.25);
    }

    #[test]
    fn reset_clears_buffer_and_envelope() {
        let mut channel = ChannelState::new(instantaneous(8)).unwrap();
        channel.ingest(&[0.5, -0.25]);
        channel.reset();

        assert!(channel.is_empty());
        assert_eq!(channel.envelope(), 0.0);
        assert!(channel.view().is_empty());
    }
}
