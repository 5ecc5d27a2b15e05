//! Engine metrics
//!
//! Prometheus counters and gauges registered in a per-engine [`Registry`],
//! so several engines (and tests) can coexist in one process. The binary
//! renders them on `/metrics`.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

const NAMESPACE: &str = "stratastor";

/// All metrics the engine records.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    pub chunks_created: IntCounter,
    pub dedup_hits: IntCounter,
    pub dedup_races: IntCounter,
    pub bytes_ingested: IntCounter,
    pub blocks_allocated: IntCounter,
    pub blocks_committed: IntCounter,
    /// Placement failures by reason
    pub placement_failures: IntCounterVec,
    /// Rebuild outcomes: queued, completed, failed, cancelled
    pub rebuilds: IntCounterVec,
    pub degraded_chunks: IntGauge,
    pub unreadable_chunks: IntGauge,
    pub rebuild_queue_depth: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
                .map_err(metrics_err)?;
            registry.register(Box::new(c.clone())).map_err(metrics_err)?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))
                .map_err(metrics_err)?;
            registry.register(Box::new(g.clone())).map_err(metrics_err)?;
            Ok(g)
        };
        let counter_vec = |name: &str, help: &str, label: &str| -> Result<IntCounterVec> {
            let c = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), &[label])
                .map_err(metrics_err)?;
            registry.register(Box::new(c.clone())).map_err(metrics_err)?;
            Ok(c)
        };

        Ok(Self {
            chunks_created: counter("chunks_created_total", "Chunks encoded and stored")?,
            dedup_hits: counter("dedup_hits_total", "Chunks resolved to existing content")?,
            dedup_races: counter("dedup_races_total", "Chunk inserts that lost a dedup race")?,
            bytes_ingested: counter("bytes_ingested_total", "Plain object bytes written")?,
            blocks_allocated: counter("blocks_allocated_total", "Blocks planned by placement")?,
            blocks_committed: counter("blocks_committed_total", "Blocks written and committed")?,
            placement_failures: counter_vec(
                "placement_failures_total",
                "Placement attempts that found no capacity",
                "reason",
            )?,
            rebuilds: counter_vec("rebuilds_total", "Rebuild requests by outcome", "outcome")?,
            degraded_chunks: gauge("degraded_chunks", "Chunks below full redundancy at last scan")?,
            unreadable_chunks: gauge("unreadable_chunks", "Chunks not decodable at last scan")?,
            rebuild_queue_depth: gauge("rebuild_queue_depth", "Pending rebuild requests")?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("chunks_created", &self.chunks_created.get())
            .field("dedup_hits", &self.dedup_hits.get())
            .finish_non_exhaustive()
    }
}

fn metrics_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
