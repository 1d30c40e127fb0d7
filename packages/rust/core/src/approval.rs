//! Per-run approval checkpoint.
//!
//! Each run that needs a decision opens a fresh single-slot channel. A
//! decision can be delivered at most once; the waiting side gives up after a
//! bound and treats silence as approval. The slot is cleared as soon as the
//! wait ends, so a decision that arrives late, or one addressed to an older
//! run, never reaches a later run.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use feedwatch_shared::{CostDecision, DecisionOutcome, RunId};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Default bound on the wait for a decision.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// How a wait in the checkpoint resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Declined,
    /// Nobody answered in time.
    TimedOut,
}

impl ApprovalOutcome {
    /// Whether the gated stage should run. Only an explicit decline stops it.
    pub fn proceeds(&self) -> bool {
        !matches!(self, Self::Declined)
    }
}

struct PendingSlot {
    run_id: RunId,
    sender: oneshot::Sender<CostDecision>,
}

/// Receiving half handed to the run that opened the checkpoint.
#[derive(Debug)]
pub struct ApprovalWaiter {
    run_id: RunId,
    receiver: oneshot::Receiver<CostDecision>,
}

/// Single-slot decision channel owned by the controller.
#[derive(Default)]
pub struct ApprovalRendezvous {
    slot: Mutex<Option<PendingSlot>>,
}

impl ApprovalRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<PendingSlot>> {
        // The slot holds no invariant a panicking holder could break.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the checkpoint for `run_id`, replacing any leftover slot.
    pub fn open(&self, run_id: RunId) -> ApprovalWaiter {
        let (sender, receiver) = oneshot::channel();
        if let Some(stale) = self.slot().replace(PendingSlot { run_id, sender }) {
            debug!(stale_run = %stale.run_id, %run_id, "discarding stale approval slot");
        }
        ApprovalWaiter { run_id, receiver }
    }

    /// Run currently waiting for a decision.
    pub fn pending_run(&self) -> Option<RunId> {
        self.slot().as_ref().map(|slot| slot.run_id)
    }

    /// Deliver a decision to whichever run is waiting.
    pub fn decide(&self, decision: CostDecision) -> DecisionOutcome {
        let Some(slot) = self.slot().take() else {
            return DecisionOutcome::NoPendingDecision;
        };
        deliver(slot, decision)
    }

    /// Deliver a decision only if `run_id` is the run waiting.
    pub fn decide_for(&self, run_id: RunId, decision: CostDecision) -> DecisionOutcome {
        let mut guard = self.slot();
        match guard.as_ref() {
            None => DecisionOutcome::NoPendingDecision,
            Some(slot) if slot.run_id != run_id => {
                warn!(
                    requested = %run_id,
                    pending = %slot.run_id,
                    "ignoring decision addressed to another run"
                );
                DecisionOutcome::StaleRun
            }
            Some(_) => match guard.take() {
                Some(slot) => deliver(slot, decision),
                None => DecisionOutcome::NoPendingDecision,
            },
        }
    }

    /// Wait for the decision on `waiter`, for at most `timeout`.
    ///
    /// The slot is closed before returning whatever the outcome. A decision
    /// whose delivery was reported `Accepted` is always the one returned.
    pub async fn wait(&self, waiter: ApprovalWaiter, timeout: Duration) -> ApprovalOutcome {
        let ApprovalWaiter {
            run_id,
            mut receiver,
        } = waiter;

        let decision = match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(decision)) => Some(decision),
            Ok(Err(_)) => {
                warn!(%run_id, "approval slot dropped without a decision, proceeding");
                None
            }
            Err(_) => {
                let late = settle_after_deadline(&mut receiver);
                if late.is_none() {
                    info!(
                        %run_id,
                        timeout_secs = timeout.as_secs(),
                        "no cost decision received in time, proceeding"
                    );
                }
                late
            }
        };

        self.close(run_id);
        match decision {
            Some(CostDecision::Approved) => ApprovalOutcome::Approved,
            Some(CostDecision::Declined) => ApprovalOutcome::Declined,
            None => ApprovalOutcome::TimedOut,
        }
    }

    pub(crate) fn close(&self, run_id: RunId) {
        let mut guard = self.slot();
        if guard.as_ref().is_some_and(|slot| slot.run_id == run_id) {
            guard.take();
        }
    }
}

/// Refuse further sends, then pick up a decision that got in first.
fn settle_after_deadline(receiver: &mut oneshot::Receiver<CostDecision>) -> Option<CostDecision> {
    receiver.close();
    receiver.try_recv().ok()
}

fn deliver(slot: PendingSlot, decision: CostDecision) -> DecisionOutcome {
    let run_id = slot.run_id;
    match slot.sender.send(decision) {
        Ok(()) => {
            info!(%run_id, ?decision, "cost decision recorded");
            DecisionOutcome::Accepted
        }
        // The waiter already gave up.
        Err(_) => DecisionOutcome::NoPendingDecision,
    }
}
