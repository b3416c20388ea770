use std::{thread, time::Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::{ChannelId, EngineError, Result, Sample, SampleSource, SourceError};

type PullReply = std::result::Result<Vec<Sample>, SourceError>;

/// What a channel produced for the current tick.
#[derive(Debug)]
pub(crate) enum PullOutcome {
    Samples(Vec<Sample>),
    Failed(SourceError),
    TimedOut,
}

/// How long a tick may wait on a dispatched pull.
#[derive(Debug, Clone, Copy)]
enum Wait {
    /// Issued this tick: block until the tick's deadline.
    Until(Instant),
    /// Left over from an earlier tick: only take a reply that is already there.
    Poll,
    Stopped,
}

/// A pull that has been dispatched and can be awaited without access to the
/// worker, so the channel set need not stay locked while sources run.
#[derive(Debug)]
pub(crate) struct PendingPull {
    channel: ChannelId,
    replies: Receiver<PullReply>,
    wait: Wait,
}

/// The outcome of a [`PendingPull`], still tagged with the worker it came
/// from.
#[derive(Debug)]
pub(crate) struct Pulled {
    pub(crate) channel: ChannelId,
    replies: Receiver<PullReply>,
    outcome: PullOutcome,
}

impl PendingPull {
    pub(crate) fn wait(self) -> Pulled {
        let received = match self.wait {
            Wait::Until(deadline) => self.replies.recv_deadline(deadline),
            Wait::Poll => self.replies.try_recv().map_err(|err| match err {
                TryRecvError::Empty => RecvTimeoutError::Timeout,
                TryRecvError::Disconnected => RecvTimeoutError::Disconnected,
            }),
            Wait::Stopped => Err(RecvTimeoutError::Disconnected),
        };

        let outcome = match received {
            Ok(Ok(samples)) => PullOutcome::Samples(samples),
            Ok(Err(err)) => PullOutcome::Failed(err),
            Err(RecvTimeoutError::Timeout) => PullOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!(channel = %self.channel, "source worker disconnected");
                PullOutcome::Failed(SourceError::new("source worker has stopped"))
            }
        };

        Pulled {
            channel: self.channel,
            replies: self.replies,
            outcome,
        }
    }
}

/// Runs one channel's [`SampleSource`] on its own thread so that a blocking
/// pull only ever stalls that channel.
///
/// At most one request is outstanding. A reply that misses its tick's
/// deadline is picked up on a later tick, so no samples are lost and order is
/// preserved.
#[derive(Debug)]
pub(crate) struct SourceWorker {
    channel: ChannelId,
    requests: Sender<usize>,
    replies: Receiver<PullReply>,
    outstanding: bool,
}

impl SourceWorker {
    pub(crate) fn spawn(channel: ChannelId, mut source: Box<dyn SampleSource>) -> Result<Self> {
        let (requests, request_rx) = crossbeam_channel::unbounded::<usize>();
        let (reply_tx, replies) = crossbeam_channel::bounded::<PullReply>(1);

        thread::Builder::new()
            .name(format!("source-{channel}"))
            .spawn(move || {
                for max_count in request_rx.iter() {
                    if reply_tx.send(source.pull(max_count)).is_err() {
                        break;
                    }
                }
                tracing::trace!(%channel, "source worker exiting");
            })
            .map_err(EngineError::Io)?;

        Ok(Self {
            channel,
            requests,
            replies,
            outstanding: false,
        })
    }

    /// Asks for up to `max_count` samples, waiting at most until `deadline`.
    ///
    /// A pull still running from an earlier tick is polled instead and no new
    /// request is queued. Returns `None` when there is nothing to wait for.
    pub(crate) fn dispatch(&mut self, max_count: usize, deadline: Instant) -> Option<PendingPull> {
        let wait = if self.outstanding {
            Wait::Poll
        } else if max_count == 0 {
            return None;
        } else if self.requests.send(max_count).is_ok() {
            self.outstanding = true;
            Wait::Until(deadline)
        } else {
            Wait::Stopped
        };

        Some(PendingPull {
            channel: self.channel,
            replies: self.replies.clone(),
            wait,
        })
    }

    /// Accepts the outcome of a pull dispatched by this worker. Outcomes of a
    /// worker that has since been replaced are discarded.
    pub(crate) fn settle(&mut self, pulled: Pulled) -> Option<PullOutcome> {
        if !self.replies.same_channel(&pulled.replies) {
            return None;
        }
        if !matches!(pulled.outcome, PullOutcome::TimedOut) {
            self.outstanding = false;
        }
        Some(pulled.outcome)
    }

    /// Dispatches and waits in one step.
    #[cfg(test)]
    fn pull_until(&mut self, max_count: usize, deadline: Instant) -> Option<PullOutcome> {
        let pending = self.dispatch(max_count, deadline)?;
        self.settle(pending.wait())
    }
}
