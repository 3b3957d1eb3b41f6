//! The external collaborator interface (spec §5): the Core never touches a
//! socket, queue client, or NATS connection directly. Everything it needs
//! from the outside world is this one trait, so the Engine and Recovery
//! Controller stay fully unit-testable and the binary picks whichever
//! concrete queue technology the deployment wants.

use async_trait::async_trait;
use thiserror::Error;

use crate::message::Envelope;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("transport receive failed: {0}")]
    Receive(String),
    #[error("transport is closed")]
    Closed,
}

/// Abstract message queue boundary. `libs/rust/transport` provides a NATS
/// implementation for real deployments and an in-memory channel
/// implementation for tests and local demos.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, target_node_id: &str, envelope: &Envelope) -> Result<(), TransportError>;

    /// Delivers `envelope` to every other known node, returning the count of
    /// peers actually reached (spec §6). Implementations must not loop the
    /// message back to its own sender — the Engine already applies its own
    /// local effects synchronously before a broadcast goes out, so a
    /// self-delivered copy would be redundant at best and, for a `COMMIT`
    /// sent after the proposer already advanced `currentCount`, would look
    /// like a stale echo.
    async fn broadcast(&self, envelope: &Envelope) -> Result<usize, TransportError>;

    async fn receive(&self) -> Result<Envelope, TransportError>;
}
