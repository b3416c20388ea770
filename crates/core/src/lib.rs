//! Core library of the waveform envelope engine.
//!
//! Several channels are sampled concurrently, each keeping a bounded history
//! and an attack/release envelope. A fixed-cadence scheduler drives the
//! analysis and publishes one immutable [`Snapshot`] per tick, which any
//! number of renderers or exporters can read without ever observing a
//! partially applied tick.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod scheduler;
pub mod snapshot;
pub mod source;

/// A single amplitude value. Its timestamp is its position in the stream.
pub type Sample = f32;

pub use buffer::RingBuffer;
pub use channel::{ChannelId, ChannelState};
pub use config::{
    AppConfig, ChannelConfig, EngineConfig, MAX_CHANNELS, MAX_TICK_RATE_HZ, MIN_TICK_RATE_HZ,
};
pub use engine::Engine;
pub use envelope::{EnvelopeFollower, EnvelopeTiming};
pub use error::{EngineError, Result};
pub use scheduler::{AnalysisScheduler, SchedulerState, TickTiming};
pub use snapshot::{
    ChannelReading, ChannelView, EnvelopeBounds, Snapshot, SnapshotPublisher, SnapshotReader,
    TickResult,
};
pub use source::{
    FeedSender, FeedSource, SampleSource, SilentSource, SourceConfig, SourceError, WaveShape,
    WaveformSource,
};
