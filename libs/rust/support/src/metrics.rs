//! Consensus metrics registration, trimmed to the counters the federation
//! node actually emits (proposals, votes, commits, recoveries, phase
//! latency). Services opt in by referencing `CONSENSUS_METRICS` lazily.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Meter, Counter, Histogram, Unit};

pub struct ConsensusMetrics {
    pub proposals_total: Counter<u64>,
    pub votes_total: Counter<u64>,
    pub commits_total: Counter<u64>,
    pub aborts_total: Counter<u64>,
    pub recoveries_total: Counter<u64>,
    pub phase_latency_ms: Histogram<f64>,
}

static METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("fedquorum_consensus"));

pub static CONSENSUS_METRICS: Lazy<ConsensusMetrics> = Lazy::new(|| ConsensusMetrics {
    proposals_total: METER.u64_counter("fedquorum_consensus_proposals_total")
        .with_description("Total proposals this node originated").init(),
    votes_total: METER.u64_counter("fedquorum_consensus_votes_total")
        .with_description("Total votes cast or received").init(),
    commits_total: METER.u64_counter("fedquorum_consensus_commits_total")
        .with_description("Total commits applied").init(),
    aborts_total: METER.u64_counter("fedquorum_consensus_aborts_total")
        .with_description("Total proposals aborted (reject quorum or timeout)").init(),
    recoveries_total: METER.u64_counter("fedquorum_consensus_recoveries_total")
        .with_description("Total recovery attempts started").init(),
    phase_latency_ms: METER.f64_histogram("fedquorum_consensus_phase_latency_ms")
        .with_description("Latency spent per consensus phase, in ms")
        .with_unit(Unit::new("ms")).init(),
});
