//! Replays the five-node scenarios end to end with a synchronous
//! in-process router instead of a real queue: `Engine::handle` is pure, so
//! driving five instances by hand is enough to exercise the whole protocol
//! without pulling in tokio or a transport implementation.

use std::collections::{HashSet, VecDeque};

use fedquorum_core::{Engine, EngineConfig, Envelope, MessageType, NodeState, Phase, BROADCAST};

const NODES: [&str; 5] = ["n1", "n2", "n3", "n4", "n5"];

fn known_peers() -> HashSet<String> {
    NODES.iter().map(|s| s.to_string()).collect()
}

struct Federation {
    engines: Vec<Engine>,
}

impl Federation {
    fn new() -> Self {
        let engines = NODES
            .iter()
            .map(|id| {
                let mut state = NodeState::new(*id, known_peers());
                state.set_recovering(false);
                state.transition_phase(Phase::Idle, "federation bootstrap").unwrap();
                Engine::new(state, EngineConfig::default())
            })
            .collect();
        Self { engines }
    }

    fn index_of(&self, node_id: &str) -> usize {
        self.engines.iter().position(|e| e.state().node_id() == node_id).unwrap()
    }

    fn engine_mut(&mut self, node_id: &str) -> &mut Engine {
        let idx = self.index_of(node_id);
        &mut self.engines[idx]
    }

    /// Seeds every node's count directly through the State Store, bypassing
    /// the message-driven path (test setup only, mirrors the recovery path's
    /// own bypass of the "only increases" rule in `update_count`).
    fn seed_count(&mut self, value: u64) {
        for node in NODES {
            let idx = self.index_of(node);
            self.engines[idx].state_mut().update_count(value, true).unwrap();
        }
    }

    /// Delivers one envelope and feeds whatever it produces back into the
    /// queue, fan-out mirroring the `Transport::broadcast` contract
    /// (never loop a message back to its own sender).
    fn drain(&mut self, queue: &mut VecDeque<(String, Envelope)>) {
        while let Some((recipient, envelope)) = queue.pop_front() {
            let idx = self.index_of(&recipient);
            let out = self.engines[idx].handle(envelope);
            for outbound in out.outbound {
                match outbound.to {
                    fedquorum_core::Destination::Broadcast => {
                        for peer in NODES.iter().filter(|p| **p != recipient) {
                            queue.push_back((peer.to_string(), outbound.message.clone()));
                        }
                    }
                    fedquorum_core::Destination::Unicast(target) => {
                        if target != recipient {
                            queue.push_back((target, outbound.message.clone()));
                        }
                    }
                }
            }
        }
    }

    fn count_on(&self, node_id: &str) -> u64 {
        self.engines[self.index_of(node_id)].state().current_count()
    }

    fn phase_of(&self, node_id: &str) -> Phase {
        self.engines[self.index_of(node_id)].state().phase()
    }
}

#[test]
fn s1_happy_path_all_five_nodes_converge() {
    let mut fed = Federation::new();
    let idx = fed.index_of("n1");
    let out = fed.engines[idx].handle_increment_request();
    assert_eq!(out.response, None);

    let mut queue: VecDeque<(String, Envelope)> = VecDeque::new();
    for outbound in out.outbound {
        for peer in NODES.iter().filter(|p| **p != "n1") {
            queue.push_back((peer.to_string(), outbound.message.clone()));
        }
    }
    fed.drain(&mut queue);

    for node in NODES {
        assert_eq!(fed.count_on(node), 1, "node {node} did not converge");
        assert_eq!(fed.phase_of(node), Phase::Idle);
    }
}

/// S2 — two nodes propose the same next value concurrently. Whichever
/// PROPOSE reaches the other three peers first wins the race; the loser's
/// COMMIT (once its own quorum completes) no longer extends `currentCount`
/// and drives the loser itself into recovery, never the winner's peers.
#[test]
fn s2_concurrent_proposals_exactly_one_commits() {
    let mut fed = Federation::new();

    let propose_a = {
        let out = fed.engine_mut("n1").handle_increment_request();
        out.outbound[0].message.clone()
    };
    let propose_b = {
        let out = fed.engine_mut("n3").handle_increment_request();
        out.outbound[0].message.clone()
    };

    // n1's PROPOSE reaches every peer before n3's does.
    let mut queue: VecDeque<(String, Envelope)> = VecDeque::new();
    for peer in ["n2", "n3", "n4", "n5"] {
        queue.push_back((peer.to_string(), propose_a.clone()));
    }
    for peer in ["n1", "n2", "n4", "n5"] {
        queue.push_back((peer.to_string(), propose_b.clone()));
    }
    fed.drain(&mut queue);

    for node in NODES {
        assert_eq!(fed.count_on(node), 1, "node {node} did not converge on the winning proposal");
    }
    // The loser (n3) observed its own COMMIT superseded and fell back to
    // recovery instead of silently losing track of the federation's count.
    assert!(fed.engines[fed.index_of("n3")].state().is_recovering());
}

/// S6 — a proposer whose local view has drifted (it thinks the federation
/// is still at 5 when everyone else already moved past it) gets REJECTed by
/// every peer and falls back to recovery on its own stale view.
#[test]
fn s6_stale_proposer_rejected_and_recovers() {
    let mut fed = Federation::new();
    fed.seed_count(5);
    // Peers silently advance past the proposer (simulating a missed commit).
    for node in ["n2", "n3", "n4", "n5"] {
        fed.engines[fed.index_of(node)].state_mut().update_count(6, true).unwrap();
    }

    let out = fed.engine_mut("n1").handle_increment_request();
    let propose = out.outbound[0].message.clone();
    assert_eq!(propose.proposed_value, Some(6));

    let mut queue: VecDeque<(String, Envelope)> = VecDeque::new();
    for peer in ["n2", "n3", "n4", "n5"] {
        queue.push_back((peer.to_string(), propose.clone()));
    }
    fed.drain(&mut queue);

    for peer in ["n2", "n3", "n4", "n5"] {
        assert_eq!(fed.count_on(peer), 6, "peer {peer} must not have mutated its own count");
        assert_eq!(fed.phase_of(peer), Phase::Idle);
    }

    // Replay the REJECT votes back into n1 to drive its quorum decision.
    let mut reject_queue: VecDeque<(String, Envelope)> = VecDeque::new();
    for peer in ["n2", "n3", "n4", "n5"] {
        let reject = Envelope::to(MessageType::Vote, peer, "n1")
            .with_vote(propose.proposal_id.clone().unwrap(), fedquorum_core::VoteDecision::Reject);
        reject_queue.push_back(("n1".to_string(), reject));
    }
    fed.drain(&mut reject_queue);

    assert!(fed.engines[fed.index_of("n1")].state().is_recovering());
}

#[test]
fn permissive_commit_lets_a_peer_catch_up_without_recovery() {
    let mut fed = Federation::new();
    let commit = Envelope::to(MessageType::Commit, "n1", "n2").with_proposal("n1-1-aaaa", 1);
    let out = fed.engine_mut("n2").handle(commit);
    assert!(out.outbound.is_empty());
    assert_eq!(fed.count_on("n2"), 1);
    assert_eq!(fed.phase_of("n2"), Phase::Idle);
}

#[test]
fn recovery_request_from_a_restarted_peer_is_answered() {
    let mut fed = Federation::new();
    fed.seed_count(10);
    let requester_idx = fed.index_of("n3");
    fed.engines[requester_idx].state_mut().set_recovering(true);
    fed.engines[requester_idx]
        .state_mut()
        .transition_phase(Phase::Recovering, "restart")
        .ok();

    let request = Envelope::broadcast(MessageType::RecoveryRequest, "n3");
    let mut responses = Vec::new();
    for peer in ["n1", "n2", "n4", "n5"] {
        let idx = fed.index_of(peer);
        let out = fed.engines[idx].handle(request.clone());
        assert_eq!(out.outbound.len(), 1);
        responses.push(out.outbound[0].message.clone());
    }
    for response in &responses {
        assert_eq!(response.proposed_value, Some(10));
    }
}

#[test]
fn broadcast_never_reaches_the_sending_node_in_this_harness() {
    let mut fed = Federation::new();
    let out = fed.engine_mut("n1").handle_increment_request();
    let mut queue: VecDeque<(String, Envelope)> = VecDeque::new();
    for outbound in &out.outbound {
        assert!(matches!(outbound.to, fedquorum_core::Destination::Broadcast));
    }
    for outbound in out.outbound {
        for peer in NODES.iter().filter(|p| **p != "n1") {
            queue.push_back((peer.to_string(), outbound.message.clone()));
        }
    }
    assert!(queue.iter().all(|(to, _)| to != BROADCAST && to != "n1"));
}
