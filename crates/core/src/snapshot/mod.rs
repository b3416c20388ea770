//! Copy-on-publish view of every enabled channel.
//!
//! The analysis loop is the only writer. Each tick produces a brand new
//! [`Snapshot`] that replaces the current one by swapping a single
//! `Arc`; readers clone that `Arc` and keep a complete generation for as long
//! as they hold it.

use std::{sync::Arc, time::Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};

use crate::{ChannelId, EngineError, Result, Sample};

/// Analysis output for one channel within one tick.
#[derive(Debug, Clone)]
pub struct ChannelReading {
    pub id: ChannelId,
    pub sample_rate: f32,
    pub samples: Arc<[Sample]>,
    pub envelope: f32,
    /// The last pull failed or timed out; `samples` and `envelope` are carried
    /// over from earlier ticks.
    pub stale: bool,
    pub consecutive_failures: u32,
}

/// Everything collected by one scheduler tick, handed to the publisher as a
/// whole.
#[derive(Debug, Clone, Default)]
pub struct TickResult {
    pub channels: Vec<ChannelReading>,
}

/// Published, read-only state of one channel.
#[derive(Debug, Clone)]
pub struct ChannelView {
    pub id: ChannelId,
    /// Generation of the snapshot this view belongs to.
    pub generation: u64,
    pub sample_rate: f32,
    pub samples: Arc<[Sample]>,
    pub envelope: f32,
    pub stale: bool,
    pub consecutive_failures: u32,
}

/// Pointwise maximum and minimum across enabled channels that share a sample
/// rate, aligned on the newest sample of each channel.
///
/// Sample `i` of two channels only refers to the same instant when both run
/// at the same rate, so channels at other rates are left out instead of
/// being resampled.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeBounds {
    /// Rate of every channel that contributed.
    pub sample_rate: f32,
    pub upper: Vec<Sample>,
    pub lower: Vec<Sample>,
}

impl EnvelopeBounds {
    /// Uses the non-empty channels at the rate of the first non-empty channel
    /// in `views`. Needs at least two of them; the result is as long as the
    /// shortest.
    pub fn from_views(views: &[ChannelView]) -> Option<Self> {
        let sample_rate = views
            .iter()
            .find(|view| !view.samples.is_empty())?
            .sample_rate;
        let populated: Vec<&[Sample]> = views
            .iter()
            .filter(|view| view.sample_rate == sample_rate && !view.samples.is_empty())
            .map(|view| &view.samples[..])
            .collect();
        if populated.len() < 2 {
            return None;
        }

        let len = populated.iter().map(|samples| samples.len()).min()?;
        let mut upper = vec![Sample::NEG_INFINITY; len];
        let mut lower = vec![Sample::INFINITY; len];
        for samples in populated {
            let tail = &samples[samples.len() - len..];
            for (i, &value) in tail.iter().enumerate() {
                upper[i] = upper[i].max(value);
                lower[i] = lower[i].min(value);
            }
        }

        Some(Self {
            sample_rate,
            upper,
            lower,
        })
    }
}

/// One complete, immutable generation of analysis results.
#[derive(Debug, Clone)]
pub struct Snapshot {
    generation: u64,
    published_at: Instant,
    channels: Vec<ChannelView>,
    bounds: Option<EnvelopeBounds>,
}

impl Snapshot {
    fn from_tick(generation: u64, tick: TickResult) -> Self {
        let channels: Vec<ChannelView> = tick
            .channels
            .into_iter()
            .map(|reading| ChannelView {
                id: reading.id,
                generation,
                sample_rate: reading.sample_rate,
                samples: reading.samples,
                envelope: reading.envelope,
                stale: reading.stale,
                consecutive_failures: reading.consecutive_failures,
            })
            .collect();
        let bounds = EnvelopeBounds::from_views(&channels);

        Self {
            generation,
            published_at: Instant::now(),
            channels,
            bounds,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When the publishing tick completed.
    pub fn published_at(&self) -> Instant {
        self.published_at
    }

    /// Enabled channels in ascending id order.
    pub fn channels(&self) -> &[ChannelView] {
        &self.channels
    }

    pub fn channel(&self, id: ChannelId) -> Option<&ChannelView> {
        self.channels.iter().find(|view| view.id == id)
    }

    /// Cross-channel max/min traces, present when two or more channels have
    /// data.
    pub fn bounds(&self) -> Option<&EnvelopeBounds> {
        self.bounds.as_ref()
    }

    /// Ids of channels whose last pull failed or timed out.
    pub fn stale_channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels
            .iter()
            .filter(|view| view.stale)
            .map(|view| view.id)
    }
}

struct WriterState {
    generation: u64,
    subscribers: Vec<Sender<Arc<Snapshot>>>,
}

/// Holds the current snapshot and swaps in new generations.
pub struct SnapshotPublisher {
    current: RwLock<Option<Arc<Snapshot>>>,
    writer: Mutex<WriterState>,
    subscriber_capacity: usize,
}

impl SnapshotPublisher {
    pub fn new(subscriber_capacity: usize) -> Self {
        Self {
            current: RwLock::new(None),
            writer: Mutex::new(WriterState {
                generation: 0,
                subscribers: Vec::new(),
            }),
            subscriber_capacity: subscriber_capacity.max(1),
        }
    }

    /// Builds the next generation from `tick` and makes it current.
    pub fn publish(&self, tick: TickResult) -> Arc<Snapshot> {
        let mut writer = self.writer.lock();
        writer.generation += 1;
        let snapshot = Arc::new(Snapshot::from_tick(writer.generation, tick));

        *self.current.write() = Some(snapshot.clone());

        writer.subscribers.retain(|tx| match tx.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!(
                    generation = snapshot.generation,
                    "subscriber lagging, notification dropped"
                );
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });

        snapshot
    }

    /// Latest complete generation.
    pub fn current(&self) -> Result<Arc<Snapshot>> {
        self.current
            .read()
            .clone()
            .ok_or(EngineError::SnapshotUnavailable)
    }

    /// Generation of the current snapshot, zero before the first publish.
    pub fn generation(&self) -> u64 {
        self.current
            .read()
            .as_ref()
            .map(|snapshot| snapshot.generation)
            .unwrap_or(0)
    }

    /// Returns a receiver notified with every generation published from now
    /// on. A subscriber that falls more than the configured capacity behind
    /// misses generations instead of stalling the writer.
    pub fn subscribe(&self) -> Receiver<Arc<Snapshot>> {
        let (tx, rx) = crossbeam_channel::bounded(self.subscriber_capacity);
        self.writer.lock().subscribers.push(tx);
        rx
    }
}

impl std::fmt::Debug for SnapshotPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotPublisher")
            .field("generation", &self.generation())
            .field("subscriber_capacity", &self.subscriber_capacity)
            .finish()
    }
}

/// Cheap, cloneable read handle handed to renderers and exporters.
#[derive(Clone, Debug)]
pub struct SnapshotReader {
    publisher: Arc<SnapshotPublisher>,
}

impl SnapshotReader {
    pub(crate) fn new(publisher: Arc<SnapshotPublisher>) -> Self {
        Self { publisher }
    }

    pub fn current(&self) -> Result<Arc<Snapshot>> {
        self.publisher.current()
    }

    pub fn subscribe(&self) -> Receiver<Arc<Snapshot>> {
        self.publisher.subscribe()
    }

    /// Retained samples of `id`, oldest first, as of the current snapshot.
    pub fn history(&self, id: ChannelId) -> Result<Vec<Sample>> {
        let snapshot = self.current()?;
        snapshot
            .channel(id)
            .map(|view| view.samples.to_vec())
            .ok_or(EngineError::UnknownChannel(id))
    }
}
