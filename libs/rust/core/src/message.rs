//! Message Contract (spec §4.4): the typed envelope every node exchanges
//! over the transport, and the per-type semantics the Consensus Engine and
//! Recovery Controller rely on.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Destination used when targeting a message at all peers rather than one.
pub const BROADCAST: &str = "broadcast";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    IncrementRequest,
    Propose,
    Vote,
    Commit,
    RecoveryRequest,
    RecoveryResponse,
}

/// Every message carries the same fields; absent values serialize as
/// `null` and unknown keys are ignored on decode (spec §6).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub source_node_id: String,
    pub target_node_id: String,
    pub proposed_value: Option<u64>,
    pub proposal_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum VoteDecision {
    Accept,
    Reject,
}

impl Envelope {
    pub fn broadcast(message_type: MessageType, source: &str) -> Self {
        Self {
            message_type,
            source_node_id: source.to_string(),
            target_node_id: BROADCAST.to_string(),
            proposed_value: None,
            proposal_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn to(message_type: MessageType, source: &str, target: &str) -> Self {
        Self {
            message_type,
            source_node_id: source.to_string(),
            target_node_id: target.to_string(),
            proposed_value: None,
            proposal_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_proposal(mut self, proposal_id: impl Into<String>, proposed_value: u64) -> Self {
        self.proposal_id = Some(proposal_id.into());
        self.proposed_value = Some(proposed_value);
        self
    }

    pub fn with_vote(mut self, proposal_id: impl Into<String>, decision: VoteDecision) -> Self {
        self.proposal_id = Some(proposal_id.into());
        self.metadata.insert(
            "accept".to_string(),
            Value::Bool(decision == VoteDecision::Accept),
        );
        self
    }

    pub fn vote_decision(&self) -> Option<VoteDecision> {
        match self.metadata.get("accept")?.as_bool()? {
            true => Some(VoteDecision::Accept),
            false => Some(VoteDecision::Reject),
        }
    }

    pub fn is_for(&self, node_id: &str) -> bool {
        self.target_node_id == BROADCAST || self.target_node_id == node_id
    }
}

/// Decodes a JSON envelope, rejecting anything the Engine can't act on.
/// Malformed input is a transport/contract concern (spec §7: "dropped with
/// a WARN log entry"), not an Engine invariant, so this lives here rather
/// than in `engine.rs`.
pub fn decode_envelope(raw: &[u8]) -> Result<Envelope, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(raw).map_err(|e| DecodeError(e.to_string()))?;
    validate(&envelope)?;
    Ok(envelope)
}

#[derive(Debug, thiserror::Error)]
#[error("malformed message: {0}")]
pub struct DecodeError(pub String);

fn validate(envelope: &Envelope) -> Result<(), DecodeError> {
    use MessageType::*;
    match envelope.message_type {
        Propose | Commit => {
            if envelope.proposal_id.is_none() || envelope.proposed_value.is_none() {
                return Err(DecodeError(format!(
                    "{:?} requires proposal_id and proposed_value",
                    envelope.message_type
                )));
            }
        }
        Vote => {
            if envelope.proposal_id.is_none() || envelope.vote_decision().is_none() {
                return Err(DecodeError(
                    "VOTE requires proposal_id and metadata.accept".into(),
                ));
            }
        }
        RecoveryResponse => {
            if envelope.proposed_value.is_none() {
                return Err(DecodeError(
                    "RECOVERY_RESPONSE requires proposed_value (carries currentCount)".into(),
                ));
            }
        }
        IncrementRequest | RecoveryRequest => {}
    }
    Ok(())
}

pub fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    serde_json::to_vec(envelope).expect("Envelope serialization is infallible")
}

/// The structured response an external trigger receives for an
/// `INCREMENT_REQUEST` (spec §7: "external callers always receive a
/// structured response indicating success/failure and the node's current
/// view").
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerResult {
    pub success: bool,
    pub current_count: u64,
    pub reason: Option<String>,
}

impl TriggerResult {
    pub fn ok(current_count: u64) -> Self {
        Self { success: true, current_count, reason: None }
    }

    pub fn failed(current_count: u64, reason: impl Into<String>) -> Self {
        Self { success: false, current_count, reason: Some(reason.into()) }
    }
}
