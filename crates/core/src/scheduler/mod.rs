//! Fixed-cadence analysis loop.
//!
//! The scheduler owns no channel state of its own. Every tick it briefly locks
//! the shared [`ChannelSet`] to fan pull requests out to each enabled
//! channel's source worker, waits for the replies with the lock released, then
//! locks again to ingest what arrived and publish the whole tick as one
//! snapshot. Waiting is bounded by the smaller of the pull timeout and the tick
//! period, and a pull still running from an earlier tick is only polled, so a
//! hung source cannot slow the cadence of the other channels.

mod worker;

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    ChannelId, ChannelReading, ChannelState, EngineConfig, EngineError, Result, SampleSource,
    Snapshot, SnapshotPublisher, TickResult,
};

pub(crate) use worker::SourceWorker;
use worker::{PullOutcome, Pulled};

/// Longest stretch of wall-clock time a single tick catches up on. After a
/// longer stall the excess is skipped rather than pulled in one batch.
const MAX_CATCH_UP: Duration = Duration::from_secs(1);

/// Lifecycle of the analysis loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

/// Tick period and per-pull timeout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickTiming {
    pub period: Duration,
    pub pull_timeout: Duration,
}

impl TryFrom<&EngineConfig> for TickTiming {
    type Error = EngineError;

    fn try_from(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            period: config.tick_period()?,
            pull_timeout: config.pull_timeout(),
        })
    }
}

impl TickTiming {
    /// How long a tick waits for freshly requested pulls.
    pub fn pull_wait(&self) -> Duration {
        self.pull_timeout.min(self.period)
    }
}

/// A channel together with the worker feeding it and its health counters.
#[derive(Debug)]
pub(crate) struct ChannelSlot {
    pub(crate) state: ChannelState,
    worker: SourceWorker,
    /// Fractional samples owed to the next tick.
    backlog: f64,
    stale: bool,
    consecutive_failures: u32,
}

impl ChannelSlot {
    pub(crate) fn new(state: ChannelState, worker: SourceWorker) -> Self {
        Self {
            state,
            worker,
            backlog: 0.0,
            stale: false,
            consecutive_failures: 0,
        }
    }

    pub(crate) fn replace_worker(&mut self, worker: SourceWorker) {
        self.worker = worker;
        self.stale = false;
        self.consecutive_failures = 0;
    }

    /// Number of samples the channel produced during `elapsed`, carrying the
    /// fractional remainder forward so the long-run rate is exact.
    fn budget(&mut self, elapsed: Duration) -> usize {
        self.backlog += f64::from(self.state.sample_rate()) * elapsed.as_secs_f64();
        let whole = self.backlog.floor();
        self.backlog -= whole;
        whole as usize
    }

    fn record_failure(&mut self, err: &EngineError) {
        self.stale = true;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures == 1 {
            tracing::warn!(%err, "channel source failed, keeping previous data");
        } else {
            tracing::debug!(
                %err,
                failures = self.consecutive_failures,
                "channel source still failing"
            );
        }
    }

    /// Applies a pull outcome to the channel. Outcomes from a worker that has
    /// been replaced since the pull was dispatched are ignored.
    fn settle(&mut self, pulled: Pulled) {
        let Some(outcome) = self.worker.settle(pulled) else {
            return;
        };
        let id = self.state.id();
        match outcome {
            PullOutcome::Samples(samples) => {
                self.record_success();
                self.state.ingest(&samples);
            }
            PullOutcome::Failed(err) => {
                self.record_failure(&EngineError::source_unavailable(id, err.reason));
            }
            PullOutcome::TimedOut => {
                self.record_failure(&EngineError::source_unavailable(id, "pull timed out"));
            }
        }
    }

    fn reading(&self) -> ChannelReading {
        ChannelReading {
            id: self.state.id(),
            sample_rate: self.state.sample_rate(),
            samples: self.state.view(),
            envelope: self.state.envelope(),
            stale: self.stale,
            consecutive_failures: self.consecutive_failures,
        }
    }

    fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            tracing::info!(
                channel = %self.state.id(),
                failures = self.consecutive_failures,
                "channel source recovered"
            );
        }
        self.stale = false;
        self.consecutive_failures = 0;
    }
}

/// Arena of channels keyed by id.
#[derive(Debug, Default)]
pub(crate) struct ChannelSet {
    pub(crate) slots: BTreeMap<ChannelId, ChannelSlot>,
}

impl ChannelSet {
    pub(crate) fn get_mut(&mut self, id: ChannelId) -> Result<&mut ChannelSlot> {
        self.slots.get_mut(&id).ok_or(EngineError::UnknownChannel(id))
    }

    pub(crate) fn attach_source(
        &mut self,
        id: ChannelId,
        source: Box<dyn SampleSource>,
    ) -> Result<()> {
        let slot = self.get_mut(id)?;
        let worker = SourceWorker::spawn(id, source)?;
        slot.replace_worker(worker);
        Ok(())
    }
}

/// The channel arena shared by the engine and the scheduler thread.
///
/// `set` is only held for short bookkeeping steps. `tick` serializes whole
/// ticks, so a manual tick and the background loop never interleave their
/// pulls, and it is never taken by configuration calls.
#[derive(Debug, Default)]
pub(crate) struct SharedChannels {
    set: Mutex<ChannelSet>,
    tick: Mutex<()>,
}

impl SharedChannels {
    #[cfg(test)]
    fn new(set: ChannelSet) -> Self {
        Self {
            set: Mutex::new(set),
            tick: Mutex::new(()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelSet> {
        self.set.lock()
    }
}

/// Runs one tick over every enabled channel and publishes the result.
///
/// `elapsed` is the time the tick accounts for: each channel is asked for
/// `sample_rate * elapsed` samples plus its carried remainder.
pub(crate) fn run_tick(
    channels: &SharedChannels,
    publisher: &SnapshotPublisher,
    timing: TickTiming,
    elapsed: Duration,
) -> Arc<Snapshot> {
    let _tick = channels.tick.lock();
    let deadline = Instant::now() + timing.pull_wait();

    // Fan out first so blocking sources wait in parallel.
    let mut set = channels.lock();
    let pending: Vec<_> = set
        .slots
        .values_mut()
        .filter(|slot| slot.state.is_enabled())
        .filter_map(|slot| {
            let budget = slot.budget(elapsed);
            slot.worker.dispatch(budget, deadline)
        })
        .collect();
    drop(set);

    let pulled: Vec<Pulled> = pending.into_iter().map(|pull| pull.wait()).collect();

    let mut set = channels.lock();
    for pull in pulled {
        // The channel may have been removed while we waited.
        if let Some(slot) = set.slots.get_mut(&pull.channel) {
            slot.settle(pull);
        }
    }
    let readings: Vec<ChannelReading> = set
        .slots
        .values()
        .filter(|slot| slot.state.is_enabled())
        .map(ChannelSlot::reading)
        .collect();
    drop(set);

    let snapshot = publisher.publish(TickResult { channels: readings });
    tracing::trace!(
        generation = snapshot.generation(),
        channels = snapshot.channels().len(),
        "tick published"
    );
    snapshot
}

/// Handle to the background analysis thread.
#[derive(Debug)]
pub struct AnalysisScheduler {
    timing: TickTiming,
    paused: Arc<AtomicBool>,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl AnalysisScheduler {
    /// A stopped scheduler; nothing runs until it is started.
    pub fn new(timing: TickTiming) -> Self {
        Self {
            timing,
            paused: Arc::new(AtomicBool::new(false)),
            shutdown: None,
            handle: None,
        }
    }

    pub fn timing(&self) -> TickTiming {
        self.timing
    }

    pub fn state(&self) -> SchedulerState {
        match (&self.handle, self.paused.load(Ordering::Acquire)) {
            (None, _) => SchedulerState::Stopped,
            (Some(_), false) => SchedulerState::Running,
            (Some(_), true) => SchedulerState::Paused,
        }
    }

    /// Spawns the analysis thread. Starting a running scheduler is a no-op.
    pub(crate) fn start(
        &mut self,
        channels: Arc<SharedChannels>,
        publisher: Arc<SnapshotPublisher>,
    ) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let timing = self.timing;
        let paused = self.paused.clone();
        paused.store(false, Ordering::Release);

        let handle = thread::Builder::new()
            .name("analysis-scheduler".into())
            .spawn(move || run_loop(channels, publisher, timing, paused, shutdown_rx))
            .map_err(EngineError::Io)?;

        tracing::info!(
            period_ms = timing.period.as_secs_f64() * 1_000.0,
            pull_timeout_ms = timing.pull_timeout.as_millis() as u64,
            "analysis scheduler started"
        );
        self.shutdown = Some(shutdown_tx);
        self.handle = Some(handle);
        Ok(())
    }

    /// Suspends ticking without losing channel state. Sources are not pulled
    /// while paused.
    pub fn pause(&self) {
        if self.handle.is_some() {
            self.paused.store(true, Ordering::Release);
        }
    }

    /// Continues ticking after [`AnalysisScheduler::pause`].
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Lets the in-flight tick finish, then joins the thread.
    pub fn stop(&mut self) {
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("analysis scheduler thread panicked");
            }
            tracing::info!("analysis scheduler stopped");
        }
        self.paused.store(false, Ordering::Release);
    }
}

impl Drop for AnalysisScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    channels: Arc<SharedChannels>,
    publisher: Arc<SnapshotPublisher>,
    timing: TickTiming,
    paused: Arc<AtomicBool>,
    shutdown: Receiver<()>,
) {
    let catch_up = timing.period.max(MAX_CATCH_UP);
    let mut next_tick = Instant::now();
    let mut last_tick: Option<Instant> = None;
    loop {
        if paused.load(Ordering::Acquire) {
            // Time spent paused is not owed to the sources.
            last_tick = None;
        } else {
            let now = Instant::now();
            let elapsed = last_tick.map_or(timing.period, |last| (now - last).min(catch_up));
            last_tick = Some(now);
            run_tick(&channels, &publisher, timing, elapsed);
        }

        next_tick += timing.period;
        let now = Instant::now();
        if next_tick < now {
            tracing::debug!(
                behind_ms = (now - next_tick).as_secs_f64() * 1_000.0,
                "analysis tick overran its period"
            );
            next_tick = now;
        }

        match shutdown.recv_deadline(next_tick) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelConfig, Sample, SourceError, WaveformSource, WaveShape};

    fn timing() -> TickTiming {
        TickTiming {
            period: Duration::from_millis(10),
            pull_timeout: Duration::from_millis(50),
        }
    }

    fn slot(id: u32, source: Box<dyn SampleSource>) -> ChannelSlot {
        let config = ChannelConfig {
            id: ChannelId(id),
            sample_rate: 1_000.0,
            buffer_capacity: 32,
            attack_time_constant: 0.0,
            release_time_constant: 0.0,
            ..ChannelConfig::default()
        };
        let state = ChannelState::new(config).unwrap();
        ChannelSlot::new(state, SourceWorker::spawn(ChannelId(id), source).unwrap())
    }

    fn shared(slots: Vec<ChannelSlot>) -> SharedChannels {
        let mut set = ChannelSet::default();
        for slot in slots {
            set.slots.insert(slot.state.id(), slot);
        }
        SharedChannels::new(set)
    }

    fn tick(channels: &SharedChannels, publisher: &SnapshotPublisher) -> Arc<Snapshot> {
        run_tick(channels, publisher, timing(), timing().period)
    }

    fn failing() -> Box<dyn SampleSource> {
        Box::new(|_: usize| -> std::result::Result<Vec<Sample>, SourceError> {
            Err(SourceError::new("offline"))
        })
    }

    fn sine() -> Box<dyn SampleSource> {
        Box::new(WaveformSource::new(WaveShape::Sine, 50.0, 1.0, 50.0, 1_000.0))
    }

    /// A source whose first pull never returns.
    fn hung() -> (Box<dyn SampleSource>, Sender<()>) {
        let (hold_tx, hold_rx) = crossbeam_channel::bounded::<()>(0);
        let source = move |_: usize| -> std::result::Result<Vec<Sample>, SourceError> {
            let _ = hold_rx.recv();
            Ok(Vec::new())
        };
        (Box::new(source), hold_tx)
    }

    #[test]
    fn budget_accumulates_fractional_samples() {
        let mut slot = slot(0, sine());
        let period = Duration::from_secs_f64(1.0 / 60.0);
        let total: usize = (0..60).map(|_| slot.budget(period)).sum();
        assert!((999..=1_000).contains(&total), "got {total}");
    }

    #[test]
    fn budget_follows_elapsed_time_not_nominal_period() {
        let channels = shared(vec![slot(0, sine())]);
        let publisher = SnapshotPublisher::new(4);

        // A tick that ran late accounts for all the time since the last one.
        let late = run_tick(&channels, &publisher, timing(), Duration::from_millis(25));
        assert_eq!(late.channels()[0].samples.len(), 25);

        let early = run_tick(&channels, &publisher, timing(), Duration::from_millis(4));
        assert_eq!(early.channels()[0].samples.len(), 29);
    }

    #[test]
    fn pull_wait_is_capped_by_period() {
        assert_eq!(timing().pull_wait(), Duration::from_millis(10));
        let short = TickTiming {
            period: Duration::from_millis(100),
            pull_timeout: Duration::from_millis(5),
        };
        assert_eq!(short.pull_wait(), Duration::from_millis(5));
    }

    #[test]
    fn tick_publishes_every_enabled_channel() {
        let channels = shared(vec![slot(0, sine()), slot(1, sine())]);
        channels
            .lock()
            .get_mut(ChannelId(1))
            .unwrap()
            .state
            .set_enabled(false);

        let publisher = SnapshotPublisher::new(4);
        let snapshot = tick(&channels, &publisher);

        assert_eq!(snapshot.generation(), 1);
        assert_eq!(snapshot.channels().len(), 1);
        assert_eq!(snapshot.channels()[0].samples.len(), 10);
    }

    #[test]
    fn failing_source_is_isolated_and_marked_stale() {
        let channels = shared(vec![slot(0, failing()), slot(1, sine())]);
        let publisher = SnapshotPublisher::new(4);

        for expected in 1..=3u64 {
            let snapshot = tick(&channels, &publisher);
            assert_eq!(snapshot.generation(), expected);

            let broken = snapshot.channel(ChannelId(0)).unwrap();
            assert!(broken.stale);
            assert_eq!(broken.consecutive_failures, expected as u32);
            assert!(broken.samples.is_empty());

            let healthy = snapshot.channel(ChannelId(1)).unwrap();
            assert!(!healthy.stale);
            assert_eq!(healthy.samples.len(), (expected as usize * 10).min(32));
        }
    }

    #[test]
    fn carried_over_pull_is_polled_not_awaited() {
        let (source, _hold) = hung();
        let channels = shared(vec![slot(0, source), slot(1, sine())]);
        let publisher = SnapshotPublisher::new(16);
        let timing = TickTiming {
            period: Duration::from_millis(100),
            pull_timeout: Duration::from_millis(100),
        };

        // The first tick waits out the deadline on the fresh pull.
        let started = Instant::now();
        run_tick(&channels, &publisher, timing, timing.period);
        assert!(started.elapsed() >= timing.pull_wait());

        // Later ticks only poll it instead of waiting again.
        let started = Instant::now();
        for _ in 0..5 {
            let snapshot = run_tick(&channels, &publisher, timing, timing.period);
            assert!(snapshot.channel(ChannelId(0)).unwrap().stale);
            assert!(!snapshot.channel(ChannelId(1)).unwrap().stale);
        }
        assert!(
            started.elapsed() < Duration::from_millis(250),
            "took {:?}",
            started.elapsed()
        );
        let latest = publisher.current().unwrap();
        assert_eq!(latest.channel(ChannelId(0)).unwrap().consecutive_failures, 6);
    }

    #[test]
    fn channel_lock_is_free_while_pulls_are_awaited() {
        let (source, _hold) = hung();
        let channels = Arc::new(shared(vec![slot(0, source)]));
        let publisher = Arc::new(SnapshotPublisher::new(4));
        let timing = TickTiming {
            period: Duration::from_millis(400),
            pull_timeout: Duration::from_millis(400),
        };

        let ticking = {
            let channels = channels.clone();
            let publisher = publisher.clone();
            thread::spawn(move || run_tick(&channels, &publisher, timing, timing.period))
        };
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        channels
            .lock()
            .get_mut(ChannelId(0))
            .unwrap()
            .state
            .set_enabled(true);
        assert!(started.elapsed() < Duration::from_millis(200));

        let snapshot = ticking.join().unwrap();
        assert!(snapshot.channel(ChannelId(0)).unwrap().stale);
    }

    #[test]
    fn attached_source_clears_failure_state() {
        let channels = shared(vec![slot(0, failing())]);
        let publisher = SnapshotPublisher::new(4);

        tick(&channels, &publisher);
        channels.lock().attach_source(ChannelId(0), sine()).unwrap();
        let snapshot = tick(&channels, &publisher);

        let view = snapshot.channel(ChannelId(0)).unwrap();
        assert!(!view.stale);
        assert_eq!(view.consecutive_failures, 0);
        assert_eq!(view.samples.len(), 10);
        assert!(matches!(
            channels.lock().attach_source(ChannelId(5), sine()),
            Err(EngineError::UnknownChannel(_))
        ));
    }

    #[test]
    fn scheduler_ticks_until_stopped() {
        let channels = Arc::new(shared(vec![slot(0, sine())]));
        let publisher = Arc::new(SnapshotPublisher::new(64));
        let updates = publisher.subscribe();

        let mut scheduler = AnalysisScheduler::new(timing());
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        scheduler.start(channels, publisher.clone()).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);

        let first = updates.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = updates.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(second.generation() > first.generation());

        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        let settled = publisher.generation();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(publisher.generation(), settled);
    }

    #[test]
    fn paused_scheduler_does_not_publish() {
        let channels = Arc::new(shared(vec![slot(0, sine())]));
        let publisher = Arc::new(SnapshotPublisher::new(64));
        let updates = publisher.subscribe();

        let mut scheduler = AnalysisScheduler::new(timing());
        scheduler.start(channels, publisher.clone()).unwrap();
        updates.recv_timeout(Duration::from_secs(2)).unwrap();

        scheduler.pause();
        assert_eq!(scheduler.state(), SchedulerState::Paused);
        // Allow a tick that was already running to land.
        thread::sleep(Duration::from_millis(30));
        let paused_at = publisher.generation();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(publisher.generation(), paused_at);

        scheduler.resume();
        let resumed = loop {
            let snapshot = updates.recv_timeout(Duration::from_secs(2)).unwrap();
            if snapshot.generation() > paused_at {
                break snapshot;
            }
        };
        assert!(resumed.generation() > paused_at);
        scheduler.stop();
    }
}
