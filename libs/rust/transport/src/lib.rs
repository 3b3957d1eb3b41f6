//! Concrete realizations of `fedquorum_core::Transport` (spec §6.1): a NATS
//! subject-per-node implementation for real deployments, and an in-memory
//! channel implementation for tests and single-process demos.

pub mod channel;
pub mod nats;

pub use channel::ChannelTransport;
pub use nats::NatsTransport;
