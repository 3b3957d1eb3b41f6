//! Consensus Engine (spec §4.2): given one inbound message (or a locally
//! originated increment request or timer firing) and the current node
//! state, produces a new state plus zero or more outbound messages. This
//! is the component the spec calls "the hardest engineering" in the
//! system; every branch below maps directly to one subsection of §4.2.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::message::{Envelope, MessageType, TriggerResult, VoteDecision};
use crate::state::{NodeState, Phase};

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub proposal_timeout: Duration,
    pub vote_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proposal_timeout: Duration::from_secs(60),
            vote_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Proposal,
    Vote,
}

#[derive(Debug, Clone)]
pub struct TimerRequest {
    pub kind: TimerKind,
    pub proposal_id: String,
    pub action: TimerAction,
}

#[derive(Debug, Clone, Copy)]
pub enum TimerAction {
    Arm(Duration),
    Cancel,
}

#[derive(Debug, Clone)]
pub enum Destination {
    Unicast(String),
    Broadcast,
}

#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: Destination,
    pub message: Envelope,
}

/// What one call into the Engine produced: outbound messages to hand to the
/// transport, an optional reply to whatever triggered an increment, and any
/// timers the binary should arm or cancel. None of these are acted on by
/// the Engine itself — it only decides, the binary executes.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub outbound: Vec<Outbound>,
    pub response: Option<TriggerResult>,
    pub timers: Vec<TimerRequest>,
}

impl EngineOutput {
    fn unicast(mut self, to: &str, message: Envelope) -> Self {
        self.outbound.push(Outbound { to: Destination::Unicast(to.to_string()), message });
        self
    }

    fn broadcast(mut self, message: Envelope) -> Self {
        self.outbound.push(Outbound { to: Destination::Broadcast, message });
        self
    }

    fn arm(mut self, kind: TimerKind, proposal_id: &str, duration: Duration) -> Self {
        self.timers.push(TimerRequest { kind, proposal_id: proposal_id.to_string(), action: TimerAction::Arm(duration) });
        self
    }

    fn cancel(mut self, kind: TimerKind, proposal_id: &str) -> Self {
        self.timers.push(TimerRequest { kind, proposal_id: proposal_id.to_string(), action: TimerAction::Cancel });
        self
    }
}

pub struct Engine {
    state: NodeState,
    config: EngineConfig,
}

impl Engine {
    pub fn new(state: NodeState, config: EngineConfig) -> Self {
        Self { state, config }
    }

    pub fn state(&self) -> &NodeState { &self.state }

    /// Direct mutable access to the State Store, for test harnesses and
    /// binary-side bootstrap code that needs to seed state outside the
    /// normal message-driven path.
    pub fn state_mut(&mut self) -> &mut NodeState { &mut self.state }

    fn quorum(&self) -> usize {
        self.state.known_peers().len() / 2 + 1
    }

    /// Single entry point for everything arriving over the transport except
    /// `RECOVERY_RESPONSE`, which the Recovery Controller owns (it keeps its
    /// own response tally, separate from the vote bookkeeping here).
    pub fn handle(&mut self, envelope: Envelope) -> EngineOutput {
        self.state.touch_heartbeat();
        match envelope.message_type {
            MessageType::IncrementRequest => self.handle_increment_request(),
            MessageType::Propose => self.handle_propose(&envelope),
            MessageType::Vote => self.handle_vote(&envelope),
            MessageType::Commit => self.handle_commit(&envelope),
            MessageType::RecoveryRequest => self.handle_recovery_request(&envelope),
            MessageType::RecoveryResponse => {
                debug!("RECOVERY_RESPONSE routed to the recovery controller, not the engine");
                EngineOutput::default()
            }
        }
    }

    /// §4.2.1 — initiating a proposal.
    pub fn handle_increment_request(&mut self) -> EngineOutput {
        if self.state.phase() != Phase::Idle || self.state.is_recovering() {
            let reason = if self.state.is_recovering() {
                "node is recovering"
            } else {
                "node is not idle"
            };
            warn!(node = self.state.node_id(), reason, "rejected INCREMENT_REQUEST precondition");
            return EngineOutput {
                response: Some(TriggerResult::failed(self.state.current_count(), reason)),
                ..Default::default()
            };
        }

        let proposed_value = self.state.current_count() + 1;
        let proposal_id = self.state.next_proposal_id();

        self.state.transition_phase(Phase::Proposing, "increment request").expect("Idle->Proposing is legal");
        self.state.begin_proposal(proposal_id.clone(), proposed_value).expect("no active proposal, just checked Idle");
        self.state.record_vote(&proposal_id, self.state.node_id(), VoteDecision::Accept);

        info!(node = self.state.node_id(), %proposal_id, proposed_value, "proposing increment");

        let propose_msg = Envelope::broadcast(MessageType::Propose, self.state.node_id())
            .with_proposal(proposal_id.clone(), proposed_value);

        EngineOutput::default()
            .broadcast(propose_msg)
            .arm(TimerKind::Proposal, &proposal_id, self.config.proposal_timeout)
            .arm(TimerKind::Vote, &proposal_id, self.config.vote_timeout)
    }

    /// §4.2.2 — evaluating a PROPOSE from a peer.
    fn handle_propose(&mut self, envelope: &Envelope) -> EngineOutput {
        let proposal_id = envelope.proposal_id.clone().expect("validated by decode_envelope");
        let proposed_value = envelope.proposed_value.expect("validated by decode_envelope");
        let proposer = envelope.source_node_id.clone();

        let precondition = self.state.phase() == Phase::Idle
            && !self.state.is_recovering()
            && proposed_value == self.state.current_count() + 1;

        if !precondition {
            debug!(node = self.state.node_id(), %proposal_id, proposed_value, current_count = self.state.current_count(), "rejecting PROPOSE");
            let vote = Envelope::to(MessageType::Vote, self.state.node_id(), &proposer)
                .with_vote(proposal_id, VoteDecision::Reject);
            return EngineOutput::default().unicast(&proposer, vote);
        }

        self.state.transition_phase(Phase::Voting, "propose received").expect("Idle->Voting is legal");
        self.state.begin_proposal(proposal_id.clone(), proposed_value).expect("no active proposal, just checked Idle");
        let node_id = self.state.node_id().to_string();
        self.state.record_vote(&proposal_id, &node_id, VoteDecision::Accept);

        let vote = Envelope::to(MessageType::Vote, self.state.node_id(), &proposer)
            .with_vote(proposal_id.clone(), VoteDecision::Accept);

        // The voter does not wait for the outcome; phase returns to Idle
        // immediately (spec §4.2.2 rationale) and the vote/eventual COMMIT
        // carry the commitment instead.
        self.state.end_proposal();
        self.state.transition_phase(Phase::Idle, "vote emitted").expect("Voting->Idle is legal");

        info!(node = self.state.node_id(), %proposal_id, proposer, "voted ACCEPT");

        EngineOutput::default().unicast(&proposer, vote)
    }

    /// §4.2.3 — collecting votes as the proposer.
    fn handle_vote(&mut self, envelope: &Envelope) -> EngineOutput {
        let proposal_id = envelope.proposal_id.clone().expect("validated by decode_envelope");
        let decision = envelope.vote_decision().expect("validated by decode_envelope");
        let voter = envelope.source_node_id.clone();

        if self.state.current_proposal_id() != Some(proposal_id.as_str()) {
            // Either this proposal already resolved, or it was never ours;
            // record for observability only, as the spec requires.
            self.state.record_vote(&proposal_id, &voter, decision);
            debug!(node = self.state.node_id(), %proposal_id, "vote recorded after decision (observability only)");
            return EngineOutput::default();
        }

        self.state.record_vote(&proposal_id, &voter, decision);
        self.evaluate_quorum(&proposal_id)
    }

    fn evaluate_quorum(&mut self, proposal_id: &str) -> EngineOutput {
        let quorum = self.quorum();
        let (accepts, rejects) = self.state.tally(proposal_id);

        if accepts >= quorum {
            return self.commit_decision(proposal_id);
        }
        if rejects >= quorum {
            // An explicit reject quorum means peers disagree with this
            // node's view of currentCount (spec S6): plain abort is not
            // enough, the proposer's own state is the stale one.
            return self.abort_into_recovery(proposal_id, "reject quorum reached, proposer view is stale");
        }
        EngineOutput::default()
    }

    fn commit_decision(&mut self, proposal_id: &str) -> EngineOutput {
        let value = self.state.current_proposed_value().expect("proposer always has a proposed value");

        if value != self.state.current_count() + 1 {
            // A competing proposal's COMMIT landed first (spec S2): this
            // quorum is for a value that no longer extends currentCount.
            return self.abort_into_recovery(proposal_id, "commit value superseded by a concurrent proposal");
        }

        self.state.transition_phase(Phase::Committing, "quorum ACCEPT").expect("Proposing->Committing is legal");

        info!(node = self.state.node_id(), %proposal_id, value, "quorum reached, committing");

        self.state.update_count(value, false).expect("value == current_count + 1, just checked");
        self.state.end_proposal();
        self.state.transition_phase(Phase::Idle, "commit applied").expect("Committing->Idle is legal");

        let commit_msg = Envelope::broadcast(MessageType::Commit, self.state.node_id())
            .with_proposal(proposal_id.to_string(), value);

        EngineOutput {
            response: Some(TriggerResult::ok(value)),
            ..Default::default()
        }
        .broadcast(commit_msg)
        .cancel(TimerKind::Proposal, proposal_id)
        .cancel(TimerKind::Vote, proposal_id)
    }

    fn abort_decision(&mut self, proposal_id: &str, reason: &'static str) -> EngineOutput {
        warn!(node = self.state.node_id(), %proposal_id, reason, "aborting proposal");
        self.state.end_proposal();
        self.state.transition_phase(Phase::Idle, reason).expect("Proposing->Idle is legal");

        EngineOutput {
            response: Some(TriggerResult::failed(self.state.current_count(), reason)),
            ..Default::default()
        }
        .cancel(TimerKind::Proposal, proposal_id)
        .cancel(TimerKind::Vote, proposal_id)
    }

    /// Like [`Self::abort_decision`] but for cases where the abort itself is
    /// evidence this node's view of `currentCount` is wrong: the proposal
    /// ends and the node falls back to recovery instead of returning to
    /// `Idle` (spec S2, S6).
    fn abort_into_recovery(&mut self, proposal_id: &str, reason: &'static str) -> EngineOutput {
        warn!(node = self.state.node_id(), %proposal_id, reason, "aborting and entering recovery");
        let count_at_abort = self.state.current_count();
        self.state.end_proposal();
        self.state.set_recovering(true);
        self.state.transition_phase(Phase::Recovering, reason).expect("Proposing->Recovering is legal");

        EngineOutput {
            response: Some(TriggerResult::failed(count_at_abort, reason)),
            ..Default::default()
        }
        .cancel(TimerKind::Proposal, proposal_id)
        .cancel(TimerKind::Vote, proposal_id)
    }

    /// §4.2.4 — applying a COMMIT, from any phase.
    fn handle_commit(&mut self, envelope: &Envelope) -> EngineOutput {
        let proposal_id = envelope.proposal_id.clone().expect("validated by decode_envelope");
        let value = envelope.proposed_value.expect("validated by decode_envelope");

        let voted_for_it = self
            .state
            .votes_for(&proposal_id)
            .and_then(|votes| votes.get(self.state.node_id()))
            .copied()
            == Some(VoteDecision::Accept);
        let is_own_active_proposal = self.state.current_proposal_id() == Some(proposal_id.as_str());

        if is_own_active_proposal || voted_for_it {
            if value != self.state.current_count() + 1 {
                // An invariant we believed held has been violated: we
                // voted/proposed for a value that no longer fits. Fatal
                // per spec §7 — fall back to recovery.
                return self.enter_recovery("commit value inconsistent with a vote this node cast");
            }
            self.state.update_count(value, false).expect("checked above");
            if is_own_active_proposal {
                self.state.end_proposal();
            }
            if self.state.phase() != Phase::Idle {
                self.state.transition_phase(Phase::Idle, "commit applied").ok();
            }
            info!(node = self.state.node_id(), %proposal_id, value, "commit applied (voted)");
            return EngineOutput::default()
                .cancel(TimerKind::Proposal, &proposal_id)
                .cancel(TimerKind::Vote, &proposal_id);
        }

        // Permissive commit (spec §4.2.4 and the Open Question in §9):
        // never voted on this proposal, but it closes exactly the gap we
        // are waiting on, so adopt it to avoid an unnecessary recovery.
        if value == self.state.current_count() + 1 {
            self.state.update_count(value, false).expect("checked above");
            info!(node = self.state.node_id(), %proposal_id, value, "commit applied (permissive)");
            EngineOutput::default()
        } else {
            self.enter_recovery("missed-update signal: commit does not extend currentCount by one")
        }
    }

    fn enter_recovery(&mut self, reason: &'static str) -> EngineOutput {
        warn!(node = self.state.node_id(), reason, "entering recovery");
        self.state.end_proposal();
        self.state.set_recovering(true);
        // From any phase, invariant violations drive the node back to
        // RECOVERING (spec §7); if already there this is a no-op.
        if self.state.phase() != Phase::Recovering {
            self.state.transition_phase(Phase::Recovering, reason).ok();
        }
        EngineOutput::default()
    }

    /// A RECOVERY_REQUEST from a peer: answered immediately unless this
    /// node is itself recovering (spec §4.3), in which case it stays
    /// silent so recovery never converges on stale data from other
    /// recovering peers.
    fn handle_recovery_request(&mut self, envelope: &Envelope) -> EngineOutput {
        if self.state.is_recovering() {
            return EngineOutput::default();
        }
        let requester = envelope.source_node_id.clone();
        let response = Envelope::to(MessageType::RecoveryResponse, self.state.node_id(), &requester)
            .with_proposal(String::new(), self.state.current_count());
        EngineOutput::default().unicast(&requester, response)
    }

    /// §4.2.5 — proposal timeout: the proposer aborts unconditionally.
    pub fn handle_proposal_timeout(&mut self, proposal_id: &str) -> EngineOutput {
        if self.state.current_proposal_id() != Some(proposal_id) {
            return EngineOutput::default();
        }
        self.abort_decision(proposal_id, "proposal timeout")
    }

    /// §4.2.5 — vote timeout: peers that never replied count as REJECT for
    /// quorum math, without actually overwriting a vote that may still
    /// arrive later.
    pub fn handle_vote_timeout(&mut self, proposal_id: &str) -> EngineOutput {
        if self.state.current_proposal_id() != Some(proposal_id) {
            return EngineOutput::default();
        }
        let quorum = self.quorum();
        let (accepts, rejects) = self.state.tally(proposal_id);
        let voters = self.state.votes_for(proposal_id).map(|v| v.len()).unwrap_or(0);
        let missing = self.state.known_peers().len().saturating_sub(voters);
        let effective_rejects = rejects + missing;

        if accepts >= quorum {
            return self.commit_decision(proposal_id);
        }
        if effective_rejects >= quorum {
            return self.abort_decision(proposal_id, "vote timeout (missing votes counted as REJECT)");
        }
        EngineOutput::default()
    }

    /// Finalizes a recovery attempt: adopts the majority-reported count and
    /// returns the node to `Idle`. Called by the Recovery Controller once it
    /// has gathered a quorum of `RECOVERY_RESPONSE`s; only valid from
    /// `Recovering`.
    pub fn adopt_recovered_count(&mut self, value: u64) {
        self.state.update_count(value, true).expect("recovery path may always set currentCount");
        self.state.set_recovering(false);
        self.state
            .transition_phase(Phase::Idle, "recovery quorum reached")
            .expect("Recovering->Idle is legal");
    }

    pub fn into_state(self) -> NodeState { self.state }
}

#[allow(dead_code)]
fn _assert_send_sync<T: Send + Sync>() {}
#[allow(dead_code)]
fn _engine_is_send_sync() { _assert_send_sync::<Engine>(); }
