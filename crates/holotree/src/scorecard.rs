//! Progress events emitted during builds and recordings.
//!
//! The scorecard is a bounded channel consumed by the surrounding UI. A full
//! channel never stalls a build: events are dropped with a warning instead.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

/// The phase of a build an event belongs to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScorecardPhase {
    /// Staging directory preparation.
    Prepare,
    /// Conda/pip layer provisioning by the toolchain.
    Provision,
    /// Post-install scripts.
    PostInstall,
    /// Recording the staging tree into the library.
    Record,
    /// Projecting a catalog into a space.
    Restore,
}

/// The status of one step within a phase.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StepStatus {
    /// The step started.
    Started,
    /// The step finished successfully.
    Completed,
    /// The step failed; the message carries details.
    Failed,
}

/// One progress event.
#[derive(Debug, Clone)]
pub struct ScorecardEvent {
    /// The phase this event belongs to.
    pub phase: ScorecardPhase,
    /// Zero-based index of the step within its phase.
    pub step_index: usize,
    /// What happened to the step.
    pub status: StepStatus,
    /// Human-readable detail.
    pub message: String,
}

/// The producer half of the progress channel. Cloneable is not needed; the
/// builder owns one and threads it through record.
#[derive(Debug)]
pub struct Scorecard {
    sender: Option<SyncSender<ScorecardEvent>>,
}

impl Scorecard {
    /// A scorecard delivering events into a bounded channel of `capacity`.
    pub fn bounded(capacity: usize) -> (Self, Receiver<ScorecardEvent>) {
        let (sender, receiver) = sync_channel(capacity);
        (
            Scorecard {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A scorecard that swallows every event.
    pub fn disabled() -> Self {
        Scorecard { sender: None }
    }

    /// Posts an event. Never blocks: when the consumer lags behind the event
    /// is dropped with a warning.
    pub fn post(
        &self,
        phase: ScorecardPhase,
        step_index: usize,
        status: StepStatus,
        message: impl Into<String>,
    ) {
        let Some(sender) = &self.sender else {
            return;
        };
        let event = ScorecardEvent {
            phase,
            step_index,
            status,
            message: message.into(),
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    "scorecard consumer is lagging, dropping event: {:?} step {} {:?}",
                    event.phase,
                    event.step_index,
                    event.status
                );
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
