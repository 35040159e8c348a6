//! Read/write phase coordination.
//!
//! The store cannot serve a live read cursor and bulk writes on the same
//! collection at once, so a run is strictly sequenced:
//!
//! ```text
//!   Reading ──complete()──▶ AwaitingDrain ──await_drain()──▶ Writing ──finish()──▶ Done
//!      │                          │                             │
//!      └──────────────────────────┴───────────fail()────────────┴──▶ Failed
//! ```
//!
//! The consumer holds a [`CompletionSignal`] and hands its buffer over through
//! it exactly once. The writer can only obtain the buffer from
//! [`PhaseCoordinator::await_drain`], so it never sees records before the read
//! phase has finished, and the channel handoff publishes every append made by
//! the consumer task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use crate::buffer::{FrozenBuffer, RecordBuffer};
use crate::error::{PipelineError, Result};

/// Phase of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseState {
    Reading,
    AwaitingDrain,
    Writing,
    Done,
    Failed,
}

impl PhaseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseState::Done | PhaseState::Failed)
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseState::Reading => write!(f, "READING"),
            PhaseState::AwaitingDrain => write!(f, "AWAITING_DRAIN"),
            PhaseState::Writing => write!(f, "WRITING"),
            PhaseState::Done => write!(f, "DONE"),
            PhaseState::Failed => write!(f, "FAILED"),
        }
    }
}

fn transition(state: &watch::Sender<PhaseState>, from: PhaseState, to: PhaseState) -> Result<()> {
    let mut observed = from;
    let changed = state.send_if_modified(|current| {
        observed = *current;
        if *current == from {
            *current = to;
            true
        } else {
            false
        }
    });
    if !changed {
        return Err(PipelineError::Runtime(format!(
            "invalid phase transition {} -> {} (current phase: {})",
            from, to, observed
        )));
    }
    debug!(from = %from, to = %to, "phase transition");
    Ok(())
}

/// One-shot read-completion signal held by the consumer.
///
/// `complete` consumes the signal, so completion fires at most once. Dropping
/// it without completing tells the coordinator the read phase failed.
#[derive(Debug)]
pub struct CompletionSignal {
    tx: oneshot::Sender<FrozenBuffer>,
    state: Arc<watch::Sender<PhaseState>>,
}

impl CompletionSignal {
    /// Freeze `buffer`, move to `AwaitingDrain`, and hand the buffer to the
    /// coordinator. Returns the number of records handed over.
    pub fn complete(self, buffer: RecordBuffer) -> Result<usize> {
        let frozen = buffer.freeze();
        let len = frozen.len();
        transition(&self.state, PhaseState::Reading, PhaseState::AwaitingDrain)?;
        self.tx.send(frozen).map_err(|_| {
            PipelineError::Runtime("phase coordinator dropped before read completion".to_string())
        })?;
        Ok(len)
    }
}

/// State machine gating the write phase on read completion.
#[derive(Debug)]
pub struct PhaseCoordinator {
    state: Arc<watch::Sender<PhaseState>>,
    completion: Option<oneshot::Receiver<FrozenBuffer>>,
}

impl PhaseCoordinator {
    /// Create a coordinator in `Reading` together with the consumer's
    /// completion signal.
    pub fn new() -> (Self, CompletionSignal) {
        let (state, _) = watch::channel(PhaseState::Reading);
        let state = Arc::new(state);
        let (tx, rx) = oneshot::channel();
        (
            Self {
                state: state.clone(),
                completion: Some(rx),
            },
            CompletionSignal { tx, state },
        )
    }

    pub fn state(&self) -> PhaseState {
        *self.state.borrow()
    }

    /// Watch phase changes.
    pub fn subscribe(&self) -> watch::Receiver<PhaseState> {
        self.state.subscribe()
    }

    /// Wait for the read phase to complete and enter `Writing`.
    ///
    /// An empty buffer is a valid result: the write phase then has nothing
    /// to do. If the consumer went away without completing, the run is
    /// marked `Failed` and an error is returned.
    pub async fn await_drain(&mut self) -> Result<FrozenBuffer> {
        let rx = self.completion.take().ok_or_else(|| {
            PipelineError::Runtime("read completion already consumed".to_string())
        })?;

        let buffer = match rx.await {
            Ok(buffer) => buffer,
            Err(_) => {
                self.fail();
                return Err(PipelineError::Runtime(
                    "read phase ended without signalling completion".to_string(),
                ));
            }
        };

        transition(&self.state, PhaseState::AwaitingDrain, PhaseState::Writing)?;
        Ok(buffer)
    }

    /// Mark the write phase finished.
    pub fn finish(&self) -> Result<()> {
        transition(&self.state, PhaseState::Writing, PhaseState::Done)
    }

    /// Mark the run failed. Has no effect once the run is `Done`.
    pub fn fail(&self) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = PhaseState::Failed;
                true
            }
        });
    }
}

/// Log "still waiting" lines while the read phase runs.
///
/// Reads only the phase state and the progress counter; it never touches the
/// buffer. Returns when the phase leaves `Reading`, with the number of
/// progress lines emitted.
pub async fn supervise(
    mut phase: watch::Receiver<PhaseState>,
    records_read: Arc<AtomicU64>,
    interval: Duration,
) -> u64 {
    let mut ticks = 0;
    loop {
        if *phase.borrow_and_update() != PhaseState::Reading {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                ticks += 1;
                info!(
                    records = records_read.load(Ordering::Relaxed),
                    "waiting for read phase to finish"
                );
            }
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    ticks
}
