//! In-memory `Transport` over `tokio::sync::mpsc`, connecting a fixed set of
//! in-process nodes. Used by the core's integration tests and by the
//! single-process demo the node binary can run in `channel:` mode. At-most-
//! once, per-sender-FIFO delivery, matching spec §5's ordering guarantee
//! exactly (a bounded channel per directed sender->receiver pair).

use std::collections::HashMap;

use async_trait::async_trait;
use fedquorum_core::{Envelope, Transport, TransportError};
use tokio::sync::{mpsc, Mutex};

const INBOX_CAPACITY: usize = 1024;

pub struct ChannelTransport {
    node_id: String,
    peers: Vec<String>,
    outboxes: HashMap<String, mpsc::Sender<Envelope>>,
    inbox: Mutex<mpsc::Receiver<Envelope>>,
}

impl ChannelTransport {
    /// Builds one `ChannelTransport` per id in `node_ids`, all wired to each
    /// other's inbox. Every node can reach every other node by
    /// `send_to`/`broadcast`; nothing is shared between the returned
    /// transports except the channels themselves.
    pub fn federation(node_ids: &[&str]) -> HashMap<String, ChannelTransport> {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for id in node_ids {
            let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
            senders.insert(id.to_string(), tx);
            receivers.insert(id.to_string(), rx);
        }

        node_ids
            .iter()
            .map(|id| {
                let inbox = receivers.remove(*id).expect("receiver created above for every id");
                let peers = node_ids.iter().filter(|p| **p != *id).map(|s| s.to_string()).collect();
                let transport = ChannelTransport {
                    node_id: id.to_string(),
                    peers,
                    outboxes: senders.clone(),
                    inbox: Mutex::new(inbox),
                };
                (id.to_string(), transport)
            })
            .collect()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_to(&self, target_node_id: &str, envelope: &Envelope) -> Result<(), TransportError> {
        let tx = self
            .outboxes
            .get(target_node_id)
            .ok_or_else(|| TransportError::Send(format!("unknown peer {target_node_id}")))?;
        tx.send(envelope.clone()).await.map_err(|_| TransportError::Closed)
    }

    async fn broadcast(&self, envelope: &Envelope) -> Result<usize, TransportError> {
        let mut reached = 0;
        for peer in &self.peers {
            if let Some(tx) = self.outboxes.get(peer) {
                // Best-effort: a full/closed peer inbox does not fail the
                // whole broadcast (spec §7: transport failures are never
                // fatal to the state machine).
                if tx.send(envelope.clone()).await.is_ok() {
                    reached += 1;
                }
            }
        }
        Ok(reached)
    }

    async fn receive(&self) -> Result<Envelope, TransportError> {
        let mut inbox = self.inbox.lock().await;
        inbox.recv().await.ok_or(TransportError::Closed)
    }
}

impl ChannelTransport {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedquorum_core::MessageType;

    #[tokio::test]
    async fn send_to_is_fifo_per_sender() {
        let fed = ChannelTransport::federation(&["n1", "n2"]);
        let n1 = &fed["n1"];
        let n2 = &fed["n2"];

        for i in 0..3u64 {
            let env = Envelope::to(MessageType::Vote, "n1", "n2").with_proposal(format!("p{i}"), i);
            n1.send_to("n2", &env).await.unwrap();
        }
        for i in 0..3u64 {
            let got = n2.receive().await.unwrap();
            assert_eq!(got.proposed_value, Some(i));
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer_but_not_self() {
        let fed = ChannelTransport::federation(&["n1", "n2", "n3"]);
        let env = Envelope::broadcast(MessageType::Propose, "n1").with_proposal("p0", 1);
        fed["n1"].broadcast(&env).await.unwrap();

        assert_eq!(fed["n2"].receive().await.unwrap().proposal_id.as_deref(), Some("p0"));
        assert_eq!(fed["n3"].receive().await.unwrap().proposal_id.as_deref(), Some("p0"));
    }
}
