//! Environment-driven configuration (spec §6), loaded through the same
//! `config`-crate layering `fedquorum_support::load_config` uses: defaults
//! set on the builder, an optional file source, then environment variables
//! layered on top so they always win. Unlike `load_config`'s generic
//! service defaults, every field here is specific to running a federation
//! node and `NODE_ID`/`KNOWN_NODES` are required — there is no sane default
//! for either.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub known_peers: HashSet<String>,
    pub transport_endpoint: String,
    pub proposal_timeout: Duration,
    pub vote_timeout: Duration,
    pub recovery_retry: Duration,
    pub shutdown_grace: Duration,
    pub health_port: u16,
    pub metrics_port: u16,
}

/// Mirrors the wire shape of the environment: `config::Environment` lower-
/// cases env var names into flat keys (`NODE_ID` -> `node_id`), so the field
/// names here line up directly with the variables named in spec §6.
#[derive(Debug, Deserialize)]
struct RawNodeConfig {
    node_id: String,
    known_nodes: String,
    transport_endpoint: String,
    proposal_timeout_ms: u64,
    vote_timeout_ms: u64,
    recovery_retry_ms: u64,
    shutdown_grace_ms: u64,
    health_port: u16,
    metrics_port: u16,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("transport_endpoint", "127.0.0.1:4222")?
            .set_default("proposal_timeout_ms", 60_000i64)?
            .set_default("vote_timeout_ms", 10_000i64)?
            .set_default("recovery_retry_ms", 30_000i64)?
            .set_default("shutdown_grace_ms", 5_000i64)?
            .set_default("health_port", 8081i64)?
            .set_default("metrics_port", 9102i64)?;

        if let Ok(file) = std::env::var("NODE_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&file).required(false));
        }
        builder = builder.add_source(config::Environment::default());

        let cfg = builder.build().context("failed to assemble node configuration")?;
        let raw: RawNodeConfig = cfg
            .try_deserialize()
            .context("NODE_ID and KNOWN_NODES are required")?;

        let known_peers: HashSet<String> = raw
            .known_nodes
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !known_peers.contains(&raw.node_id) {
            bail!("KNOWN_NODES ({}) must include this node's own NODE_ID ({})", raw.known_nodes, raw.node_id);
        }

        Ok(Self {
            node_id: raw.node_id,
            known_peers,
            transport_endpoint: raw.transport_endpoint,
            proposal_timeout: Duration::from_millis(raw.proposal_timeout_ms),
            vote_timeout: Duration::from_millis(raw.vote_timeout_ms),
            recovery_retry: Duration::from_millis(raw.recovery_retry_ms),
            shutdown_grace: Duration::from_millis(raw.shutdown_grace_ms),
            health_port: raw.health_port,
            metrics_port: raw.metrics_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests that
    // touch them so they don't interleave under `cargo test`'s thread pool.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in ["NODE_ID", "KNOWN_NODES", "TRANSPORT_ENDPOINT", "PROPOSAL_TIMEOUT_MS", "NODE_CONFIG_FILE"] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn requires_self_to_be_a_known_peer() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("NODE_ID", "n1");
        std::env::set_var("KNOWN_NODES", "n2,n3,n4,n5");
        let err = NodeConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("must include"));
        clear_env();
    }

    #[test]
    fn applies_defaults_and_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("NODE_ID", "n1");
        std::env::set_var("KNOWN_NODES", "n1,n2,n3,n4,n5");
        std::env::set_var("PROPOSAL_TIMEOUT_MS", "1000");
        let cfg = NodeConfig::from_env().unwrap();
        assert_eq!(cfg.known_peers.len(), 5);
        assert_eq!(cfg.proposal_timeout, Duration::from_millis(1000));
        assert_eq!(cfg.vote_timeout, Duration::from_secs(10));
        assert_eq!(cfg.transport_endpoint, "127.0.0.1:4222");
        clear_env();
    }
}
