//! Per-run progress fan-out.
//!
//! Each run has one channel. Subscribers get a snapshot of all stage
//! outcomes first, then every transition in order, then the terminal event,
//! after which their stream ends. Each subscriber has its own bounded queue;
//! a subscriber that falls behind is dropped instead of slowing the run.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{Run, RunId, RunStatus, StageKind, StageOutcome, StageSnapshot};

/// Default per-subscriber queue size.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// One progress event of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: StageEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageEventKind {
    /// Every stage outcome at the time of subscription.
    Snapshot {
        status: RunStatus,
        stages: Vec<StageSnapshot>,
    },
    Transition {
        stage: StageKind,
        outcome: StageOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Last event of the run.
    Finished {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed_stage: Option<StageKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl StageEvent {
    fn new(run_id: RunId, kind: StageEventKind) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn snapshot(run: &Run) -> Self {
        Self::new(
            run.id,
            StageEventKind::Snapshot {
                status: run.status(),
                stages: run.snapshot(),
            },
        )
    }

    pub fn transition(
        run_id: RunId,
        stage: StageKind,
        outcome: StageOutcome,
        error: Option<String>,
    ) -> Self {
        Self::new(
            run_id,
            StageEventKind::Transition {
                stage,
                outcome,
                error,
            },
        )
    }

    pub fn finished(run: &Run) -> Self {
        Self::new(
            run.id,
            StageEventKind::Finished {
                status: run.status(),
                failed_stage: run.failed_stage(),
                error: run.error().map(str::to_string),
            },
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, StageEventKind::Finished { .. })
    }
}

/// State of one run's channel.
struct RunChannel {
    status: RunStatus,
    stages: Vec<StageSnapshot>,
    finished: Option<StageEvent>,
    subscribers: Vec<mpsc::Sender<StageEvent>>,
}

impl RunChannel {
    fn snapshot(&self, run_id: RunId) -> StageEvent {
        StageEvent::new(
            run_id,
            StageEventKind::Snapshot {
                status: self.status,
                stages: self.stages.clone(),
            },
        )
    }

    fn apply(&mut self, event: &StageEvent) {
        match &event.kind {
            StageEventKind::Snapshot { status, stages } => {
                self.status = *status;
                self.stages = stages.clone();
            }
            StageEventKind::Transition { stage, outcome, .. } => {
                if let Some(entry) = self.stages.iter_mut().find(|s| s.stage == *stage) {
                    entry.outcome = *outcome;
                }
            }
            StageEventKind::Finished { status, .. } => {
                self.status = *status;
                self.finished = Some(event.clone());
            }
        }
    }
}

/// Fan-out of progress events to subscribers.
pub struct ProgressEmitter {
    channels: DashMap<RunId, Arc<Mutex<RunChannel>>>,
    capacity: usize,
}

impl ProgressEmitter {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            // Room for at least the snapshot and the terminal event.
            capacity: capacity.max(2),
        }
    }

    /// Open the channel of `run`, seeded with its current outcomes.
    pub fn register(&self, run: &Run) {
        let channel = RunChannel {
            status: run.status(),
            stages: run.snapshot(),
            finished: run.is_terminal().then(|| StageEvent::finished(run)),
            subscribers: Vec::new(),
        };
        self.channels.insert(run.id, Arc::new(Mutex::new(channel)));
    }

    pub fn contains(&self, run_id: &RunId) -> bool {
        self.channels.contains_key(run_id)
    }

    /// Drop the channel of a run. Open streams end.
    pub fn remove(&self, run_id: &RunId) {
        self.channels.remove(run_id);
    }

    pub fn subscriber_count(&self, run_id: &RunId) -> usize {
        self.channel(run_id)
            .map(|c| c.lock().subscribers.len())
            .unwrap_or(0)
    }

    fn channel(&self, run_id: &RunId) -> Option<Arc<Mutex<RunChannel>>> {
        self.channels.get(run_id).map(|c| Arc::clone(c.value()))
    }

    /// Subscribe to a registered run. `None` if the run has no channel.
    pub fn subscribe(&self, run_id: RunId) -> Option<ProgressStream> {
        let channel = self.channel(&run_id)?;
        let mut channel = channel.lock();

        let (tx, rx) = mpsc::channel(self.capacity);
        // The queue is fresh and has room for both events.
        let _ = tx.try_send(channel.snapshot(run_id));

        if let Some(finished) = channel.finished.clone() {
            let _ = tx.try_send(finished);
        } else {
            channel.subscribers.push(tx);
        }

        Some(ProgressStream { rx })
    }

    /// Deliver `event` to every subscriber of its run.
    ///
    /// Never blocks: a subscriber whose queue is full or closed is dropped.
    /// After a terminal event every subscriber is released.
    pub fn publish(&self, event: StageEvent) {
        let Some(channel) = self.channel(&event.run_id) else {
            return;
        };
        let mut channel = channel.lock();
        if channel.finished.is_some() {
            return;
        }

        channel.apply(&event);

        let run_id = event.run_id;
        channel.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(run_id = %run_id, "Dropping slow progress subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if event.is_terminal() {
            channel.subscribers.clear();
        }
    }
}

impl Default for ProgressEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

/// Ordered, finite stream of a run's events.
pub struct ProgressStream {
    rx: mpsc::Receiver<StageEvent>,
}

impl ProgressStream {
    /// A stream that yields `events` and ends.
    pub fn from_events(events: Vec<StageEvent>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            let _ = tx.try_send(event);
        }
        Self { rx }
    }

    /// Replay of a run that has no live channel: its snapshot, plus the
    /// terminal event when it is finished.
    pub fn replay(run: &Run) -> Self {
        let mut events = vec![StageEvent::snapshot(run)];
        if run.is_terminal() {
            events.push(StageEvent::finished(run));
        }
        Self::from_events(events)
    }
}

impl Stream for ProgressStream {
    type Item = StageEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
