//! Timer plumbing for the actor loop (spec §4.2.5, §4.3, design note
//! "Timers: abstracted as scheduled callbacks"). The Engine and Recovery
//! Controller never touch a clock directly — they return `TimerRequest`s,
//! and this module is the only place that turns an `Arm` into a real
//! `tokio::time::sleep`, mirroring the teacher's `view_change.rs` pattern of
//! a spawned task racing a sleep, generalized to be per-proposal and
//! cancellable rather than one fixed background loop.

use std::collections::HashMap;

use fedquorum_core::{TimerAction, TimerKind, TimerRequest};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone)]
pub struct FiredTimer {
    pub kind: TimerKind,
    pub proposal_id: String,
}

pub struct TimerWheel {
    cancels: HashMap<(TimerKind, String), oneshot::Sender<()>>,
    fired_tx: mpsc::Sender<FiredTimer>,
}

impl TimerWheel {
    pub fn new(fired_tx: mpsc::Sender<FiredTimer>) -> Self {
        Self { cancels: HashMap::new(), fired_tx }
    }

    /// Applies every timer request the Engine/RecoveryController returned in
    /// one `EngineOutput`, in order.
    pub fn apply(&mut self, requests: Vec<TimerRequest>) {
        for request in requests {
            self.apply_one(request);
        }
    }

    fn apply_one(&mut self, request: TimerRequest) {
        let key = (request.kind, request.proposal_id);
        // Re-arming or cancelling an existing timer always cancels
        // whatever is currently scheduled under the same key first.
        if let Some(previous) = self.cancels.remove(&key) {
            let _ = previous.send(());
        }
        if let TimerAction::Arm(duration) = request.action {
            let (cancel_tx, cancel_rx) = oneshot::channel();
            self.cancels.insert(key.clone(), cancel_tx);
            let fired_tx = self.fired_tx.clone();
            let (kind, proposal_id) = key;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        let _ = fired_tx.send(FiredTimer { kind, proposal_id }).await;
                    }
                    _ = cancel_rx => {}
                }
            });
        }
    }
}
