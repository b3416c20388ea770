//! Sample producers feeding the channels.
//!
//! A [`SampleSource`] is pulled once per scheduler tick for at most the
//! number of samples the channel produces in one tick. Sources may return
//! fewer samples than requested, block while waiting on an external feed, or
//! fail; the scheduler bounds and isolates all three.

use std::f32::consts::TAU;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};

use crate::{EngineError, Result, Sample};

pub const FREQUENCY_MIN: f32 = 0.1;
pub const FREQUENCY_MAX: f32 = 1_000.0;
pub const AMPLITUDE_MIN: f32 = 0.1;
pub const AMPLITUDE_MAX: f32 = 10.0;
/// Duty cycle bounds in percent.
pub const DUTY_CYCLE_MIN: f32 = 1.0;
pub const DUTY_CYCLE_MAX: f32 = 99.0;

/// Failure reported by a source. The scheduler attaches the channel id.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason}")]
pub struct SourceError {
    pub reason: String,
}

impl SourceError {
    pub fn new<T: Into<String>>(reason: T) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Pull interface implemented by every producer of samples.
pub trait SampleSource: Send {
    /// Returns up to `max_count` new samples, oldest first.
    fn pull(&mut self, max_count: usize) -> std::result::Result<Vec<Sample>, SourceError>;
}

impl<F> SampleSource for F
where
    F: FnMut(usize) -> std::result::Result<Vec<Sample>, SourceError> + Send,
{
    fn pull(&mut self, max_count: usize) -> std::result::Result<Vec<Sample>, SourceError> {
        self(max_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveShape {
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

/// Declarative description of the source a channel starts with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Waveform {
        shape: WaveShape,
        /// Hz.
        frequency: f32,
        amplitude: f32,
        /// Percent of the period spent high. Only used by square waves.
        #[serde(default = "default_duty_cycle")]
        duty_cycle: f32,
    },
    /// Produces nothing until an external source is attached.
    Silence,
}

fn default_duty_cycle() -> f32 {
    50.0
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Waveform {
            shape: WaveShape::Sine,
            frequency: 5.0,
            amplitude: 1.0,
            duty_cycle: default_duty_cycle(),
        }
    }
}

impl SourceConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Waveform {
                frequency,
                amplitude,
                duty_cycle,
                ..
            } => {
                for (name, value) in [
                    ("frequency", frequency),
                    ("amplitude", amplitude),
                    ("duty cycle", duty_cycle),
                ] {
                    if !value.is_finite() {
                        return Err(EngineError::invalid(format!(
                            "waveform {name} must be finite, got {value}"
                        )));
                    }
                }
                Ok(())
            }
            Self::Silence => Ok(()),
        }
    }

    /// Instantiates the configured source for a channel running at
    /// `sample_rate`.
    pub fn build(&self, sample_rate: f32) -> Box<dyn SampleSource> {
        match *self {
            Self::Waveform {
                shape,
                frequency,
                amplitude,
                duty_cycle,
            } => Box::new(WaveformSource::new(
                shape,
                frequency,
                amplitude,
                duty_cycle,
                sample_rate,
            )),
            Self::Silence => Box::new(SilentSource),
        }
    }
}

/// Phase-continuous periodic signal generator.
#[derive(Debug, Clone)]
pub struct WaveformSource {
    shape: WaveShape,
    amplitude: f32,
    duty: f32,
    phase: f32,
    increment: f32,
}

impl WaveformSource {
    /// Parameters are clamped into their supported ranges.
    pub fn new(
        shape: WaveShape,
        frequency: f32,
        amplitude: f32,
        duty_cycle: f32,
        sample_rate: f32,
    ) -> Self {
        let frequency = frequency.clamp(FREQUENCY_MIN, FREQUENCY_MAX);
        Self {
            shape,
            amplitude: amplitude.clamp(AMPLITUDE_MIN, AMPLITUDE_MAX),
            duty: duty_cycle.clamp(DUTY_CYCLE_MIN, DUTY_CYCLE_MAX) / 100.0,
            phase: 0.0,
            increment: frequency / sample_rate.max(f32::MIN_POSITIVE),
        }
    }

    /// Produces the next sample and advances the phase.
    pub fn next_sample(&mut self) -> Sample {
        let phase = self.phase;
        let value = match self.shape {
            WaveShape::Sine => (TAU * phase).sin(),
            WaveShape::Square => {
                if phase < self.duty {
                    1.0
                } else {
                    -1.0
                }
            }
            WaveShape::Sawtooth => 2.0 * phase - 1.0,
            WaveShape::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
        };

        self.phase = (self.phase + self.increment).fract();
        value * self.amplitude
    }
}

impl SampleSource for WaveformSource {
    fn pull(&mut self, max_count: usize) -> std::result::Result<Vec<Sample>, SourceError> {
        Ok((0..max_count).map(|_| self.next_sample()).collect())
    }
}

/// Source that never yields samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentSource;

impl SampleSource for SilentSource {
    fn pull(&mut self, _max_count: usize) -> std::result::Result<Vec<Sample>, SourceError> {
        Ok(Vec::new())
    }
}

/// Source draining samples pushed by an external producer.
#[derive(Debug)]
pub struct FeedSource {
    rx: Receiver<Sample>,
}

/// Producer half of a [`FeedSource`].
#[derive(Debug, Clone)]
pub struct FeedSender {
    tx: Sender<Sample>,
}

impl FeedSource {
    /// A feed holding at most `capacity` undelivered samples; producers block
    /// when it is full.
    pub fn bounded(capacity: usize) -> (Self, FeedSender) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { rx }, FeedSender { tx })
    }

    pub fn unbounded() -> (Self, FeedSender) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { rx }, FeedSender { tx })
    }
}

impl SampleSource for FeedSource {
    fn pull(&mut self, max_count: usize) -> std::result::Result<Vec<Sample>, SourceError> {
        let mut samples = Vec::with_capacity(max_count.min(self.rx.len()));
        while samples.len() < max_count {
            match self.rx.try_recv() {
                Ok(sample) => samples.push(sample),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if samples.is_empty() {
                        return Err(SourceError::new("feed disconnected"));
                    }
                    break;
                }
            }
        }
        Ok(samples)
    }
}

impl FeedSender {
    pub fn send(&self, sample: Sample) -> Result<()> {
        self.tx
            .send(sample)
            .map_err(|_| EngineError::msg("feed source has been dropped"))
    }

    pub fn send_all(&self, samples: &[Sample]) -> Result<()> {
        samples.iter().try_for_each(|&sample| self.send(sample))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn sine_starts_at_zero_and_peaks_at_quarter_period() {
        let mut source = WaveformSource::new(WaveShape::Sine, 1.0, 2.0, 50.0, 4.0);
        let samples = source.pull(4).unwrap();

        assert_relative_eq!(samples[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(samples[1], 2.0, epsilon = 1e-6);
        assert_relative_eq!(samples[2], 0.0, epsilon = 1e-5);
        assert_relative_eq!(samples[3], -2.0, epsilon = 1e-5);
    }

    #[test]
    fn square_respects_duty_cycle() {
        let mut source = WaveformSource::new(WaveShape::Square, 1.0, 1.0, 25.0, 8.0);
        let samples = source.pull(8).unwrap();
        let high = samples.iter().filter(|&&s| s > 0.0).count();
        assert_eq!(high, 2);
    }

    #[test]
    fn triangle_and_sawtooth_span_full_amplitude() {
        let mut tri = WaveformSource::new(WaveShape::Triangle, 1.0, 1.0, 50.0, 4.0);
        assert_eq!(tri.pull(3).unwrap(), vec![-1.0, 0.0, 1.0]);

        let mut saw = WaveformSource::new(WaveShape::Sawtooth, 1.0, 1.0, 50.0, 4.0);
        assert_eq!(saw.pull(3).unwrap(), vec![-1.0, -0.5, 0.0]);
    }

    #[test]
    fn phase_continues_across_pulls() {
        let mut split = WaveformSource::new(WaveShape::Sine, 7.0, 1.0, 50.0, 100.0);
        let mut whole = split.clone();

        let mut joined = split.pull(13).unwrap();
        joined.extend(split.pull(20).unwrap());
        assert_eq!(joined, whole.pull(33).unwrap());
    }

    #[test]
    fn parameters_are_clamped() {
        let mut source = WaveformSource::new(WaveShape::Square, 5.0, 100.0, 50.0, 1_000.0);
        assert_eq!(source.next_sample(), AMPLITUDE_MAX);
    }

    #[test]
    fn feed_returns_what_is_queued_then_reports_disconnect() {
        let (mut feed, tx) = FeedSource::unbounded();
        tx.send_all(&[0.1, 0.2, 0.3]).unwrap();

        assert_eq!(feed.pull(2).unwrap(), vec![0.1, 0.2]);
        assert_eq!(feed.pull(8).unwrap(), vec![0.3]);
        assert!(feed.pull(8).unwrap().is_empty());

        drop(tx);
        assert!(feed.pull(8).is_err());
    }

    #[test]
    fn closures_act_as_sources() {
        let mut calls = 0;
        let mut source = move |max: usize| -> std::result::Result<Vec<Sample>, SourceError> {
            calls += 1;
            Ok(vec![calls as Sample; max.min(2)])
        };
        assert_eq!(SampleSource::pull(&mut source, 5).unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn source_config_round_trips_through_json() {
        let config = SourceConfig::Waveform {
            shape: WaveShape::Triangle,
            frequency: 12.0,
            amplitude: 0.5,
            duty_cycle: 50.0,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"kind\":\"waveform\""));
        assert_eq!(serde_json::from_str::<SourceConfig>(&json).unwrap(), config);
    }
}
