//! The actor loop (spec §5): one task owns the Engine and drains
//! `Transport::receive()`, exactly the single-cooperative-task model the
//! spec allows, mirroring the teacher's `tokio::select!`-based main loops.
//! Outbound sends run on a second task behind a bounded channel so a slow
//! or failing send never blocks the message loop (spec §5, §7).

use std::sync::Arc;
use std::time::Instant;

use fedquorum_core::{
    Destination, Engine, EngineConfig, EngineOutput, NodeState, RecoveryConfig, RecoveryController, Transport,
    TimerKind, RECOVERY_TIMER_ID,
};
use fedquorum_resilience::retry_async;
use fedquorum_support::metrics::CONSENSUS_METRICS;
use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::timer::{FiredTimer, TimerWheel};

const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const OUTBOUND_SEND_ATTEMPTS: usize = 3;
const OUTBOUND_RETRY_DELAY_MS: u64 = 50;

struct PendingSend {
    to: Destination,
    message: fedquorum_core::Envelope,
}

/// Runs the node until a shutdown signal (or, in tests, the caller dropping
/// its end of things) arrives. Generic over `Transport` so the same loop
/// drives both `ChannelTransport` (tests, local demo) and `NatsTransport`
/// (real deployment).
pub async fn run<T>(config: NodeConfig, transport: T) -> anyhow::Result<u64>
where
    T: Transport + 'static,
{
    run_until(config, transport, shutdown_signal()).await
}

/// Same as [`run`] but takes an explicit shutdown future, so tests can drive
/// the loop for a bounded time instead of waiting on OS signals. Returns the
/// node's `currentCount` at the moment of shutdown.
pub async fn run_until<T>(config: NodeConfig, transport: T, shutdown: impl std::future::Future<Output = ()>) -> anyhow::Result<u64>
where
    T: Transport + 'static,
{
    let transport = Arc::new(transport);

    let state = NodeState::new(config.node_id.clone(), config.known_peers.clone());
    let engine_config = EngineConfig { proposal_timeout: config.proposal_timeout, vote_timeout: config.vote_timeout };
    let mut engine = Engine::new(state, engine_config);
    let mut recovery = RecoveryController::new(RecoveryConfig { retry_interval: config.recovery_retry });

    let (outbound_tx, outbound_rx) = mpsc::channel::<PendingSend>(OUTBOUND_QUEUE_CAPACITY);
    let (fired_tx, mut fired_rx) = mpsc::channel::<FiredTimer>(OUTBOUND_QUEUE_CAPACITY);
    let mut wheel = TimerWheel::new(fired_tx);

    let outbound_worker = tokio::spawn(run_outbound_worker(transport.clone(), outbound_rx));

    // NodeState starts in RECOVERING; kick off the recovery poll immediately
    // rather than waiting for the first inbound message (spec §4.3).
    let started = Instant::now();
    let initial = recovery.start(&mut engine);
    dispatch(&config.node_id, &outbound_tx, &mut wheel, initial, "recovery_start", started.elapsed()).await;

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(node = %config.node_id, "shutdown signal received, finishing in-flight work");
                break;
            }
            fired = fired_rx.recv() => {
                let Some(fired) = fired else { continue };
                let started = Instant::now();
                let output = handle_fired(&mut engine, &mut recovery, &fired);
                dispatch(&config.node_id, &outbound_tx, &mut wheel, output, "timer", started.elapsed()).await;
            }
            received = transport.receive() => {
                match received {
                    Ok(envelope) => {
                        let started = Instant::now();
                        let op = if envelope.message_type == fedquorum_core::MessageType::RecoveryResponse {
                            engine.state_mut().touch_heartbeat();
                            "recovery_response"
                        } else {
                            "message"
                        };
                        let output = if op == "recovery_response" {
                            recovery.on_response(&mut engine, &envelope)
                        } else {
                            engine.handle(envelope)
                        };
                        dispatch(&config.node_id, &outbound_tx, &mut wheel, output, op, started.elapsed()).await;
                    }
                    Err(e) => {
                        warn!(node = %config.node_id, error = %e, "transport receive failed, continuing");
                    }
                }
            }
        }
    }

    drop(outbound_tx);
    if tokio::time::timeout(config.shutdown_grace, outbound_worker).await.is_err() {
        warn!(node = %config.node_id, "outbound worker did not drain within the shutdown grace period");
    }

    Ok(engine.state().current_count())
}

fn handle_fired(engine: &mut Engine, recovery: &mut RecoveryController, fired: &FiredTimer) -> EngineOutput {
    match (fired.kind, fired.proposal_id.as_str()) {
        (TimerKind::Vote, RECOVERY_TIMER_ID) => recovery.on_retry_timeout(engine),
        (TimerKind::Vote, proposal_id) => engine.handle_vote_timeout(proposal_id),
        (TimerKind::Proposal, proposal_id) => engine.handle_proposal_timeout(proposal_id),
    }
}

/// Turns one `EngineOutput` into outbound sends (queued, never awaited
/// inline) and armed/cancelled timers, and logs the `TriggerResult` for
/// visibility (the external trigger utility's reply channel is outside this
/// crate's scope — spec §1 — so the structured response is surfaced via the
/// observability seam instead). `op` labels which kind of operation produced
/// `output` and `elapsed` is how long that operation took to run, reported
/// as the phase latency metric (spec §6.3).
async fn dispatch(
    node_id: &str,
    outbound_tx: &mpsc::Sender<PendingSend>,
    wheel: &mut TimerWheel,
    output: EngineOutput,
    op: &'static str,
    elapsed: std::time::Duration,
) {
    CONSENSUS_METRICS
        .phase_latency_ms
        .record(elapsed.as_secs_f64() * 1000.0, &[KeyValue::new("op", op)]);

    if let Some(result) = output.response {
        if result.success {
            CONSENSUS_METRICS.commits_total.add(1, &[]);
            info!(node = node_id, current_count = result.current_count, "increment request succeeded");
        } else {
            CONSENSUS_METRICS.aborts_total.add(1, &[]);
            warn!(node = node_id, current_count = result.current_count, reason = ?result.reason, "increment request failed");
        }
    }

    for outbound in output.outbound {
        use fedquorum_core::MessageType::*;
        match outbound.message.message_type {
            Propose => CONSENSUS_METRICS.proposals_total.add(1, &[]),
            Vote => CONSENSUS_METRICS.votes_total.add(1, &[]),
            RecoveryRequest => CONSENSUS_METRICS.recoveries_total.add(1, &[]),
            _ => {}
        }
        if outbound_tx.send(PendingSend { to: outbound.to, message: outbound.message }).await.is_err() {
            warn!(node = node_id, "outbound queue closed, dropping message");
        }
    }

    wheel.apply(output.timers);
}

/// Drains the outbound queue on its own task: a slow or failing send can
/// never block the message loop (spec §5). Failures are retried with
/// `fedquorum_resilience::retry_async` and, on exhaustion, logged and
/// dropped — never fatal (spec §7).
async fn run_outbound_worker<T: Transport + 'static>(transport: Arc<T>, mut rx: mpsc::Receiver<PendingSend>) {
    while let Some(pending) = rx.recv().await {
        let transport = transport.clone();
        let message = pending.message.clone();
        match pending.to {
            Destination::Broadcast => {
                let result = retry_async(
                    || {
                        let transport = transport.clone();
                        let message = message.clone();
                        async move { transport.broadcast(&message).await }
                    },
                    OUTBOUND_SEND_ATTEMPTS,
                    std::time::Duration::from_millis(OUTBOUND_RETRY_DELAY_MS),
                )
                .await;
                match result {
                    Ok(reached) => debug!(message_type = ?pending.message.message_type, reached, "broadcast delivered"),
                    Err(e) => warn!(error = %e, message_type = ?pending.message.message_type, "broadcast exhausted retries, dropping"),
                }
            }
            Destination::Unicast(ref target) => {
                let target = target.clone();
                let result = retry_async(
                    || {
                        let transport = transport.clone();
                        let message = message.clone();
                        let target = target.clone();
                        async move { transport.send_to(&target, &message).await }
                    },
                    OUTBOUND_SEND_ATTEMPTS,
                    std::time::Duration::from_millis(OUTBOUND_RETRY_DELAY_MS),
                )
                .await;
                if let Err(e) = result {
                    warn!(error = %e, message_type = ?pending.message.message_type, "outbound send exhausted retries, dropping");
                } else {
                    debug!(message_type = ?pending.message.message_type, "outbound send delivered");
                }
            }
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
