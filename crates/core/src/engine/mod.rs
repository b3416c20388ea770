use std::{collections::BTreeMap, mem, sync::Arc};

use crate::{
    config::validate_channel_set,
    scheduler::{run_tick, ChannelSlot, SharedChannels, SourceWorker},
    AnalysisScheduler, AppConfig, ChannelConfig, ChannelId, ChannelState, EngineConfig,
    Result, Sample, SampleSource, SchedulerState, Snapshot, SnapshotPublisher, SnapshotReader,
    TickTiming,
};

/// High level engine façade tying channels, the scheduler and the publisher
/// together.
///
/// Configuration calls (`apply_config`, `attach_source`, `set_enabled`,
/// `reset`) only contend with the short bookkeeping steps of a tick, never
/// with a tick that is waiting on a slow source.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    channels: Arc<SharedChannels>,
    publisher: Arc<SnapshotPublisher>,
    scheduler: AnalysisScheduler,
}

impl Engine {
    /// Creates an engine with no channels.
    ///
    /// Fails with `InvalidConfiguration` when the timing parameters are out
    /// of range.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let publisher = Arc::new(SnapshotPublisher::new(config.subscriber_capacity));
        let scheduler = AnalysisScheduler::new(TickTiming::try_from(&config)?);

        Ok(Self {
            config,
            channels: Arc::new(SharedChannels::default()),
            publisher,
            scheduler,
        })
    }

    /// Creates an engine and applies the configured channel set.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let engine = Self::new(config.engine.clone())?;
        engine.apply_config(&config.channels)?;
        Ok(engine)
    }

    /// Timing parameters the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replaces the channel set.
    ///
    /// Channels whose sample rate, capacity and time constants are unchanged
    /// keep their history, envelope and source; any other change recreates
    /// the channel from scratch. Ids missing from `channels` are dropped.
    /// When any entry is invalid nothing is modified.
    pub fn apply_config(&self, channels: &[ChannelConfig]) -> Result<()> {
        validate_channel_set(channels)?;

        let mut set = self.channels.lock();

        // Build everything fallible before touching the live set.
        let mut prepared = Vec::with_capacity(channels.len());
        for config in channels {
            let plan = match set.slots.get(&config.id) {
                Some(slot) if slot.state.config().analysis_matches(config) => {
                    let worker = if slot.state.config().source == config.source {
                        None
                    } else {
                        Some(spawn_configured_source(config)?)
                    };
                    SlotPlan::Keep(worker)
                }
                _ => SlotPlan::Fresh(ChannelSlot::new(
                    ChannelState::new(config.clone())?,
                    spawn_configured_source(config)?,
                )),
            };
            prepared.push((config.clone(), plan));
        }

        let mut previous = mem::take(&mut set.slots);
        let mut next = BTreeMap::new();
        for (config, plan) in prepared {
            let id = config.id;
            match plan {
                SlotPlan::Fresh(slot) => {
                    next.insert(id, slot);
                }
                SlotPlan::Keep(worker) => {
                    if let Some(mut slot) = previous.remove(&id) {
                        slot.state.update_config(config);
                        if let Some(worker) = worker {
                            slot.replace_worker(worker);
                        }
                        next.insert(id, slot);
                    }
                }
            }
        }
        set.slots = next;

        tracing::info!(
            channels = set.slots.len(),
            removed = previous.len(),
            "channel configuration applied"
        );
        Ok(())
    }

    /// Swaps the sample source of a channel, keeping its analysis state.
    pub fn attach_source(&self, id: ChannelId, source: Box<dyn SampleSource>) -> Result<()> {
        self.channels.lock().attach_source(id, source)
    }

    /// Includes or excludes a channel from ticks. State is preserved either
    /// way.
    pub fn set_enabled(&self, id: ChannelId, enabled: bool) -> Result<()> {
        let mut set = self.channels.lock();
        set.get_mut(id)?.state.set_enabled(enabled);
        tracing::debug!(channel = %id, enabled, "channel toggled");
        Ok(())
    }

    /// Clears a channel's history and envelope.
    pub fn reset(&self, id: ChannelId) -> Result<()> {
        let mut set = self.channels.lock();
        set.get_mut(id)?.state.reset();
        tracing::debug!(channel = %id, "channel reset");
        Ok(())
    }

    /// Ids of every configured channel, enabled or not, in ascending order.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.lock().slots.keys().copied().collect()
    }

    /// The configuration a channel is currently running with.
    pub fn channel_config(&self, id: ChannelId) -> Option<ChannelConfig> {
        self.channels
            .lock()
            .slots
            .get(&id)
            .map(|slot| slot.state.config().clone())
    }

    /// Runs a single tick on the calling thread, accounting for one nominal
    /// tick period of samples per channel.
    ///
    /// Blocks for at most the smaller of the pull timeout and the tick period.
    pub fn tick(&self) -> Arc<Snapshot> {
        let timing = self.scheduler.timing();
        run_tick(&self.channels, &self.publisher, timing, timing.period)
    }

    /// Starts the background analysis loop. Starting a running engine is a
    /// no-op.
    pub fn start(&mut self) -> Result<()> {
        self.scheduler
            .start(self.channels.clone(), self.publisher.clone())
    }

    /// Suspends ticking. Channel state and the last snapshot are kept.
    pub fn pause(&self) {
        self.scheduler.pause();
    }

    /// Continues ticking after [`Engine::pause`].
    pub fn resume(&self) {
        self.scheduler.resume();
    }

    /// Stops the analysis loop after its current tick.
    pub fn stop(&mut self) {
        self.scheduler.stop();
    }

    /// Whether the analysis loop is stopped, running or paused.
    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Read handle for renderers and exporters running on other threads.
    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader::new(self.publisher.clone())
    }

    /// Latest published snapshot, or `SnapshotUnavailable` before the first
    /// tick. Never blocks on the analysis loop.
    pub fn current_snapshot(&self) -> Result<Arc<Snapshot>> {
        self.publisher.current()
    }

    /// Receives every published generation, up to the configured subscriber
    /// capacity of backlog.
    pub fn subscribe(&self) -> crossbeam_channel::Receiver<Arc<Snapshot>> {
        self.publisher.subscribe()
    }

    /// Buffer contents of an enabled channel in the current snapshot, oldest
    /// first.
    pub fn history(&self, id: ChannelId) -> Result<Vec<Sample>> {
        self.reader().history(id)
    }
}

/// How `apply_config` treats one configured channel.
enum SlotPlan {
    /// Keep the live slot, optionally with a new source.
    Keep(Option<SourceWorker>),
    Fresh(ChannelSlot),
}

fn spawn_configured_source(config: &ChannelConfig) -> Result<SourceWorker> {
    SourceWorker::spawn(config.id, config.source.build(config.sample_rate))
}
