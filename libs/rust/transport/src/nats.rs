//! `Transport` over NATS subject-per-node queues, generalized from
//! `services/swarm-gossip`'s single stub publish into the full
//! sendTo/broadcast/receive surface (spec §6.1). One inbound subject per
//! node (`federation.<node_id>.inbox`) plus a shared broadcast subject
//! (`federation.broadcast`) every node subscribes to, filtering out its own
//! self-originated broadcasts (the Engine already applies those locally via
//! the synchronous self-vote/self-commit path before the broadcast goes out).
//!
//! NATS publish has no delivery acknowledgment, so `broadcast`'s returned
//! count is the federation's known peer count rather than a confirmed
//! delivery count (spec §6's "count of peers reached" is an at-least-once,
//! best-effort figure here, not a guarantee).

use async_trait::async_trait;
use fedquorum_core::{decode_envelope, encode_envelope, Envelope, Transport, TransportError};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

const INBOUND_BUFFER: usize = 1024;

pub struct NatsTransport {
    client: async_nats::Client,
    broadcast_subject: String,
    inbound: Mutex<mpsc::Receiver<Envelope>>,
    peer_count: usize,
}

impl NatsTransport {
    /// `peer_count` is the number of other known nodes in the federation
    /// (excluding this one); NATS pub/sub has no delivery acknowledgment, so
    /// `broadcast`'s returned count reflects the federation's known size
    /// rather than a confirmed delivery count.
    pub async fn connect(endpoint: &str, node_id: impl Into<String>, peer_count: usize) -> Result<Self, TransportError> {
        let node_id = node_id.into();
        let client = async_nats::connect(endpoint)
            .await
            .map_err(|e| TransportError::Send(format!("connect to {endpoint}: {e}")))?;

        let inbox_subject = format!("federation.{node_id}.inbox");
        let broadcast_subject = "federation.broadcast".to_string();

        let mut inbox_sub = client
            .subscribe(inbox_subject)
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;
        let mut broadcast_sub = client
            .subscribe(broadcast_subject.clone())
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);

        let inbox_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbox_sub.next().await {
                match decode_envelope(&msg.payload) {
                    Ok(envelope) => {
                        if inbox_tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed inbox envelope"),
                }
            }
        });

        let self_id = node_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = broadcast_sub.next().await {
                match decode_envelope(&msg.payload) {
                    Ok(envelope) if envelope.source_node_id == self_id => {
                        // Self-originated broadcast, already applied locally.
                    }
                    Ok(envelope) => {
                        if tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed broadcast envelope"),
                }
            }
        });

        Ok(Self { client, broadcast_subject, inbound: Mutex::new(rx), peer_count })
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn send_to(&self, target_node_id: &str, envelope: &Envelope) -> Result<(), TransportError> {
        let subject = format!("federation.{target_node_id}.inbox");
        let payload = encode_envelope(envelope);
        self.client
            .publish(subject, payload.into())
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn broadcast(&self, envelope: &Envelope) -> Result<usize, TransportError> {
        let payload = encode_envelope(envelope);
        self.client
            .publish(self.broadcast_subject.clone(), payload.into())
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(self.peer_count)
    }

    async fn receive(&self) -> Result<Envelope, TransportError> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(TransportError::Closed)
    }
}
