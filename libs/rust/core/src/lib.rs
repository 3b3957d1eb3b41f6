//! Replicated counter core: the four components of the federation's
//! consensus algorithm, free of any particular transport or runtime.
//!
//! - [`state`] — the State Store, the only code path allowed to mutate a
//!   node's view of the world.
//! - [`engine`] — the Consensus Engine, the propose/vote/commit state
//!   machine.
//! - [`recovery`] — the Recovery Controller, majority polling after a
//!   restart or a detected invariant violation.
//! - [`message`] — the Message Contract, the wire envelope every node
//!   exchanges.
//! - [`transport`] — the abstract queue boundary the binary wires up.

pub mod engine;
pub mod message;
pub mod recovery;
pub mod state;
pub mod transport;

pub use engine::{Destination, Engine, EngineConfig, EngineOutput, Outbound, TimerAction, TimerKind, TimerRequest};
pub use message::{decode_envelope, encode_envelope, DecodeError, Envelope, MessageType, TriggerResult, VoteDecision, BROADCAST};
pub use recovery::{RecoveryConfig, RecoveryController, RECOVERY_TIMER_ID};
pub use state::{CoreError, NodeState, Phase, ProposalId};
pub use transport::{Transport, TransportError};
