//! Recovery Controller (spec §4.3): runs only while `isRecovering` is set,
//! polling peers for their view of `currentCount` and adopting the majority
//! answer once at least a quorum of responses is in.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{Destination, Engine, EngineOutput, TimerAction, TimerKind, TimerRequest};
use crate::message::{Envelope, MessageType};
use crate::state::Phase;

#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    pub retry_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { retry_interval: Duration::from_secs(5) }
    }
}

/// Collected `RECOVERY_RESPONSE` answers for the node's current recovery
/// attempt. Kept separate from `NodeState.received_votes` because it tracks
/// a different thing (peer views of `currentCount`, not proposal votes) and
/// is reset on every retry.
#[derive(Debug, Default)]
pub struct RecoveryController {
    responses: HashMap<String, u64>,
    config: RecoveryConfig,
}

/// Sentinel proposal id the recovery retry timer is keyed under (it isn't a
/// real proposal). The binary's timer wheel checks for this id on a `Vote`-
/// kind timer firing to route it to `on_retry_timeout` instead of the
/// Engine's `handle_vote_timeout`.
pub const RECOVERY_TIMER_ID: &str = "recovery";

impl RecoveryController {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { responses: HashMap::new(), config }
    }

    /// Begins (or restarts) recovery: broadcasts `RECOVERY_REQUEST` and arms
    /// the retry timer. Idempotent to call repeatedly while recovering.
    pub fn start(&mut self, engine: &mut Engine) -> EngineOutput {
        self.responses.clear();
        let state = engine.state();
        info!(node = state.node_id(), "starting recovery poll");

        let request = Envelope::broadcast(MessageType::RecoveryRequest, state.node_id());
        EngineOutput::default()
            .broadcast_pub(request)
            .arm_pub(TimerKind::Vote, RECOVERY_TIMER_ID, self.config.retry_interval)
    }

    /// Records one peer's `RECOVERY_RESPONSE` and, once a quorum has
    /// answered, finalizes by adopting the majority-reported count.
    pub fn on_response(&mut self, engine: &mut Engine, envelope: &Envelope) -> EngineOutput {
        if engine.state().phase() != Phase::Recovering {
            return EngineOutput::default();
        }
        let Some(value) = envelope.proposed_value else {
            warn!("RECOVERY_RESPONSE missing proposedValue, dropping");
            return EngineOutput::default();
        };
        self.responses.insert(envelope.source_node_id.clone(), value);

        // A recovering node cannot trust its own currentCount (that is the
        // thing being recovered), so quorum is computed over peer answers
        // alone rather than including a self-vote.
        let quorum = engine.state().known_peers().len() / 2 + 1;
        if self.responses.len() < quorum {
            return EngineOutput::default();
        }

        let majority_value = self.majority_value();
        info!(node = engine.state().node_id(), majority_value, responses = self.responses.len(), "recovery quorum reached");

        engine.adopt_recovered_count(majority_value);
        self.responses.clear();

        EngineOutput::default().cancel_pub(TimerKind::Vote, RECOVERY_TIMER_ID)
    }

    /// Fired when the retry timer elapses without a quorum of answers; if
    /// still recovering, re-broadcasts and re-arms (spec §4.3: "retried
    /// every RECOVERY_RETRY_MS until quorum is reached").
    pub fn on_retry_timeout(&mut self, engine: &mut Engine) -> EngineOutput {
        if engine.state().phase() != Phase::Recovering {
            return EngineOutput::default();
        }
        self.start(engine)
    }

    /// Mode of the reported counts; ties broken by the largest value (spec
    /// §4.3). `max_by_key` alone would pick whichever value a `HashMap`
    /// happens to iterate first, so ties are broken explicitly here.
    fn majority_value(&self) -> u64 {
        let mut counts: HashMap<u64, usize> = HashMap::new();
        for value in self.responses.values() {
            *counts.entry(*value).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .max_by_key(|(value, count)| (*count, *value))
            .map(|(value, _)| value)
            .unwrap_or(0)
    }
}

// Small public extensions on EngineOutput so the recovery controller can
// build outputs without reaching into engine-module-private constructors.
impl EngineOutput {
    pub(crate) fn broadcast_pub(self, message: Envelope) -> Self {
        let mut out = self;
        out.outbound.push(crate::engine::Outbound { to: Destination::Broadcast, message });
        out
    }

    pub(crate) fn arm_pub(self, kind: TimerKind, proposal_id: &str, duration: Duration) -> Self {
        let mut out = self;
        out.timers.push(TimerRequest { kind, proposal_id: proposal_id.to_string(), action: TimerAction::Arm(duration) });
        out
    }

    pub(crate) fn cancel_pub(self, kind: TimerKind, proposal_id: &str) -> Self {
        let mut out = self;
        out.timers.push(TimerRequest { kind, proposal_id: proposal_id.to_string(), action: TimerAction::Cancel });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::state::NodeState;
    use std::collections::HashSet;

    fn peers() -> HashSet<String> {
        (1..=5).map(|i| format!("n{i}")).collect()
    }

    fn recovering_engine() -> Engine {
        Engine::new(NodeState::new("n1", peers()), EngineConfig::default())
    }

    #[test]
    fn s3_recovery_adopts_majority_after_quorum() {
        let mut engine = recovering_engine();
        let mut controller = RecoveryController::new(RecoveryConfig::default());
        let out = controller.start(&mut engine);
        assert_eq!(out.outbound.len(), 1);

        for (peer, value) in [("n2", 7u64), ("n3", 7), ("n4", 7)] {
            let resp = Envelope::to(MessageType::RecoveryResponse, peer, "n1").with_proposal(String::new(), value);
            controller.on_response(&mut engine, &resp);
        }

        assert_eq!(engine.state().current_count(), 7);
        assert_eq!(engine.state().phase(), Phase::Idle);
        assert!(!engine.state().is_recovering());
    }

    #[test]
    fn recovery_waits_for_quorum_before_adopting() {
        let mut engine = recovering_engine();
        let mut controller = RecoveryController::new(RecoveryConfig::default());
        controller.start(&mut engine);

        let resp = Envelope::to(MessageType::RecoveryResponse, "n2", "n1").with_proposal(String::new(), 9);
        controller.on_response(&mut engine, &resp);
        assert_eq!(engine.state().phase(), Phase::Recovering);
        assert!(engine.state().is_recovering());
    }

    #[test]
    fn s4_retry_timeout_rebroadcasts_while_still_recovering() {
        let mut engine = recovering_engine();
        let mut controller = RecoveryController::new(RecoveryConfig::default());
        controller.start(&mut engine);
        let out = controller.on_retry_timeout(&mut engine);
        assert_eq!(out.outbound.len(), 1);
        assert_eq!(out.timers.len(), 1);
    }

    #[test]
    fn s4_majority_wins_over_minority_with_tie_break_on_largest() {
        let mut engine = recovering_engine();
        let mut controller = RecoveryController::new(RecoveryConfig::default());
        controller.start(&mut engine);

        for (peer, value) in [("n2", 10u64), ("n3", 10), ("n4", 8)] {
            let resp = Envelope::to(MessageType::RecoveryResponse, peer, "n1").with_proposal(String::new(), value);
            controller.on_response(&mut engine, &resp);
        }

        assert_eq!(engine.state().current_count(), 10);
    }

    #[test]
    fn retry_timeout_is_noop_once_recovered() {
        let mut engine = recovering_engine();
        let mut controller = RecoveryController::new(RecoveryConfig::default());
        controller.start(&mut engine);
        for (peer, value) in [("n2", 3u64), ("n3", 3), ("n4", 3)] {
            let resp = Envelope::to(MessageType::RecoveryResponse, peer, "n1").with_proposal(String::new(), value);
            controller.on_response(&mut engine, &resp);
        }
        let out = controller.on_retry_timeout(&mut engine);
        assert!(out.outbound.is_empty());
        assert!(out.timers.is_empty());
    }
}
