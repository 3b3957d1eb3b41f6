//! State Store (spec §4.1): the authoritative per-node state and the only
//! code path allowed to mutate it. Phase transitions are validated against
//! a fixed adjacency; everything else funnels through typed mutators so the
//! invariants of spec §3 hold by construction rather than by caller
//! discipline.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::message::VoteDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Proposing,
    Voting,
    Committing,
    Recovering,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("illegal phase transition from {from:?} to {to:?}: {reason}")]
    IllegalTransition { from: Phase, to: Phase, reason: &'static str },
    #[error("precondition failed: {0}")]
    PreconditionFailed(&'static str),
    #[error("a proposal is already active: {0}")]
    ProposalAlreadyActive(String),
}

pub type ProposalId = String;

#[derive(Debug)]
pub struct NodeState {
    node_id: String,
    current_count: u64,
    phase: Phase,
    known_peers: HashSet<String>,
    current_proposal_id: Option<ProposalId>,
    current_proposed_value: Option<u64>,
    received_votes: HashMap<ProposalId, HashMap<String, VoteDecision>>,
    is_recovering: bool,
    last_heartbeat: DateTime<Utc>,
    local_proposal_counter: u64,
}

/// Fixed adjacency for the phase diagram in spec §4.2. `reason` identifies
/// the triggering event so logs and error messages read the same way the
/// spec names them.
const TRANSITIONS: &[(Phase, Phase)] = &[
    (Phase::Recovering, Phase::Idle),
    (Phase::Idle, Phase::Proposing),
    (Phase::Idle, Phase::Voting),
    (Phase::Voting, Phase::Idle),
    (Phase::Proposing, Phase::Committing),
    (Phase::Proposing, Phase::Idle),
    (Phase::Committing, Phase::Idle),
    // Invariant violations (§7) always fall back to recovery, from any phase.
    (Phase::Idle, Phase::Recovering),
    (Phase::Proposing, Phase::Recovering),
    (Phase::Voting, Phase::Recovering),
    (Phase::Committing, Phase::Recovering),
];

impl NodeState {
    pub fn new(node_id: impl Into<String>, known_peers: HashSet<String>) -> Self {
        Self {
            node_id: node_id.into(),
            current_count: 0,
            phase: Phase::Recovering,
            known_peers,
            current_proposal_id: None,
            current_proposed_value: None,
            received_votes: HashMap::new(),
            is_recovering: true,
            last_heartbeat: Utc::now(),
            local_proposal_counter: 0,
        }
    }

    // --- read-only accessors -------------------------------------------------

    pub fn node_id(&self) -> &str { &self.node_id }
    pub fn current_count(&self) -> u64 { self.current_count }
    pub fn phase(&self) -> Phase { self.phase }
    pub fn known_peers(&self) -> &HashSet<String> { &self.known_peers }
    pub fn current_proposal_id(&self) -> Option<&str> { self.current_proposal_id.as_deref() }
    pub fn current_proposed_value(&self) -> Option<u64> { self.current_proposed_value }
    pub fn is_recovering(&self) -> bool { self.is_recovering }
    pub fn last_heartbeat(&self) -> DateTime<Utc> { self.last_heartbeat }

    pub fn votes_for(&self, proposal_id: &str) -> Option<&HashMap<String, VoteDecision>> {
        self.received_votes.get(proposal_id)
    }

    pub fn peers_except_self(&self) -> impl Iterator<Item = &String> {
        let me = self.node_id.clone();
        self.known_peers.iter().filter(move |p| **p != me)
    }

    // --- mutators -------------------------------------------------------------

    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    /// Allocates a fresh proposal id, unique within this node's lifetime
    /// (spec §3: `nodeId-localCounter-randomSuffix`).
    pub fn next_proposal_id(&mut self) -> ProposalId {
        self.local_proposal_counter += 1;
        let suffix: u32 = rand::random();
        format!("{}-{}-{:08x}", self.node_id, self.local_proposal_counter, suffix)
    }

    pub fn transition_phase(&mut self, to: Phase, reason: &'static str) -> Result<(), CoreError> {
        let from = self.phase;
        if from == to || TRANSITIONS.contains(&(from, to)) {
            self.phase = to;
            Ok(())
        } else {
            Err(CoreError::IllegalTransition { from, to, reason })
        }
    }

    /// Begins a proposal this node either originates (`PROPOSING`) or votes
    /// on (`VOTING`); invariant 1 of spec §3 is enforced here.
    pub fn begin_proposal(&mut self, proposal_id: ProposalId, value: u64) -> Result<(), CoreError> {
        if let Some(existing) = &self.current_proposal_id {
            return Err(CoreError::ProposalAlreadyActive(existing.clone()));
        }
        self.current_proposal_id = Some(proposal_id);
        self.current_proposed_value = Some(value);
        Ok(())
    }

    pub fn end_proposal(&mut self) {
        self.current_proposal_id = None;
        self.current_proposed_value = None;
    }

    /// Idempotent for equal values; only the recovery path may move the
    /// count backwards (spec §4.1).
    pub fn update_count(&mut self, value: u64, from_recovery: bool) -> Result<(), CoreError> {
        if value < self.current_count && !from_recovery {
            return Err(CoreError::PreconditionFailed(
                "updateCount may only decrease currentCount when called by the recovery path",
            ));
        }
        self.current_count = value;
        Ok(())
    }

    /// Duplicate votes are idempotent: the last value received wins (spec
    /// §4.2.3), but votes recorded after a decision has already been made
    /// for that proposal are observational only — callers decide that by
    /// checking the tally *before* calling this.
    pub fn record_vote(&mut self, proposal_id: &str, peer: &str, decision: VoteDecision) {
        self.received_votes
            .entry(proposal_id.to_string())
            .or_default()
            .insert(peer.to_string(), decision);
    }

    pub fn tally(&self, proposal_id: &str) -> (usize, usize) {
        let Some(votes) = self.received_votes.get(proposal_id) else { return (0, 0) };
        let accepts = votes.values().filter(|d| **d == VoteDecision::Accept).count();
        let rejects = votes.values().filter(|d| **d == VoteDecision::Reject).count();
        (accepts, rejects)
    }

    pub fn set_recovering(&mut self, recovering: bool) {
        self.is_recovering = recovering;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> HashSet<String> {
        ["n1", "n2", "n3", "n4", "n5"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn starts_recovering_with_zero_count() {
        let st = NodeState::new("n1", peers());
        assert_eq!(st.current_count(), 0);
        assert_eq!(st.phase(), Phase::Recovering);
        assert!(st.is_recovering());
    }

    #[test]
    fn legal_transition_sequence() {
        let mut st = NodeState::new("n1", peers());
        st.transition_phase(Phase::Idle, "recovery complete").unwrap();
        st.transition_phase(Phase::Proposing, "increment request").unwrap();
        st.transition_phase(Phase::Committing, "quorum accept").unwrap();
        st.transition_phase(Phase::Idle, "commit applied").unwrap();
        assert_eq!(st.phase(), Phase::Idle);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut st = NodeState::new("n1", peers());
        // Recovering -> Proposing is not a legal edge.
        let err = st.transition_phase(Phase::Proposing, "bogus").unwrap_err();
        assert!(matches!(err, CoreError::IllegalTransition { from: Phase::Recovering, to: Phase::Proposing, .. }));
        assert_eq!(st.phase(), Phase::Recovering);
    }

    #[test]
    fn update_count_rejects_regression_outside_recovery() {
        let mut st = NodeState::new("n1", peers());
        st.update_count(5, true).unwrap();
        assert!(st.update_count(3, false).is_err());
        assert_eq!(st.current_count(), 5);
        assert!(st.update_count(3, true).is_ok());
        assert_eq!(st.current_count(), 3);
    }

    #[test]
    fn update_count_is_idempotent_for_equal_values() {
        let mut st = NodeState::new("n1", peers());
        st.update_count(5, true).unwrap();
        assert!(st.update_count(5, false).is_ok());
        assert_eq!(st.current_count(), 5);
    }

    #[test]
    fn at_most_one_active_proposal() {
        let mut st = NodeState::new("n1", peers());
        st.begin_proposal("p1".into(), 1).unwrap();
        assert!(st.begin_proposal("p2".into(), 1).is_err());
        st.end_proposal();
        assert!(st.begin_proposal("p2".into(), 1).is_ok());
    }

    #[test]
    fn duplicate_vote_is_idempotent() {
        let mut st = NodeState::new("n1", peers());
        st.record_vote("p1", "n2", VoteDecision::Accept);
        st.record_vote("p1", "n2", VoteDecision::Accept);
        assert_eq!(st.tally("p1"), (1, 0));
        // Last value wins even though honest peers don't actually flip.
        st.record_vote("p1", "n2", VoteDecision::Reject);
        assert_eq!(st.tally("p1"), (0, 1));
    }

    #[test]
    fn proposal_ids_are_unique_per_node() {
        let mut st = NodeState::new("n1", peers());
        let a = st.next_proposal_id();
        let b = st.next_proposal_id();
        assert_ne!(a, b);
        assert!(a.starts_with("n1-1-"));
        assert!(b.starts_with("n1-2-"));
    }
}
