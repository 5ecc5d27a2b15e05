//! Engine and cluster configuration
//!
//! `EngineConfig` holds the runtime knobs of the engine; `ClusterConfig` is
//! the YAML document the binary loads to build a [`Topology`] and seed the
//! node registry.
//!
//! ```yaml
//! system: sys-1
//! coding_configs:
//!   ec42: { data_frags: 4, parity: { scheme: erasure, parity_frags: 2 } }
//! pools:
//!   - id: pool-a
//! nodes:
//!   - { id: n1, pool_id: pool-a, address: "10.0.0.1:9000", free_bytes: 1099511627776 }
//! tiers:
//!   - id: hot
//!     coding: ec42
//!     data_placement: SPREAD
//!     mirrors: [{ spread_pools: [pool-a] }]
//! tierings:
//!   - id: default
//!     tiers: [{ order: 0, tier: hot }]
//! buckets:
//!   - { id: photos, tiering: default }
//! engine:
//!   liveness_timeout: 30s
//!   rebuild: { scan_interval: 5m, max_retries: 5 }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coding::CodingConfig;
use crate::error::{Error, Result};
use crate::model::{
    Bucket, DataPlacement, NodeInfo, Pool, SystemId, Tier, TierId, TierMirror, Tiering, Topology,
};

// =============================================================================
// Engine Configuration
// =============================================================================

/// Rebuild worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildConfig {
    /// Maximum rebuilds running at once
    pub max_concurrent: usize,
    /// Interval between full health scans
    pub scan_interval: Duration,
    /// Attempts before a rebuild is abandoned until the next scan
    pub max_retries: u32,
    /// First retry delay; doubled on every attempt
    pub base_backoff: Duration,
    /// Upper bound on the retry delay
    pub max_backoff: Duration,
    /// Capacity of the rebuild request channel
    pub queue_capacity: usize,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            scan_interval: Duration::from_secs(300),
            max_retries: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            queue_capacity: 1024,
        }
    }
}

impl RebuildConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Runtime configuration of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// A node whose last heartbeat is older than this is treated as offline
    pub liveness_timeout: Duration,
    /// Concurrent block writes per chunk
    pub write_concurrency: usize,
    pub rebuild: RebuildConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(30),
            write_concurrency: 16,
            rebuild: RebuildConfig::default(),
        }
    }
}

// =============================================================================
// Cluster File
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildSettings {
    pub max_concurrent: Option<usize>,
    pub scan_interval: Option<String>,
    pub max_retries: Option<u32>,
    pub base_backoff: Option<String>,
    pub max_backoff: Option<String>,
    pub queue_capacity: Option<usize>,
}

/// Engine section of the cluster file; durations in Go-style form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub liveness_timeout: Option<String>,
    pub write_concurrency: Option<usize>,
    pub rebuild: RebuildSettings,
}

impl EngineSettings {
    pub fn to_engine_config(&self) -> Result<EngineConfig> {
        let defaults = EngineConfig::default();
        let parse = |value: &Option<String>, default: Duration| -> Result<Duration> {
            value.as_deref().map(parse_duration).unwrap_or(Ok(default))
        };

        let rebuild = RebuildConfig {
            max_concurrent: self
                .rebuild
                .max_concurrent
                .unwrap_or(defaults.rebuild.max_concurrent),
            scan_interval: parse(&self.rebuild.scan_interval, defaults.rebuild.scan_interval)?,
            max_retries: self.rebuild.max_retries.unwrap_or(defaults.rebuild.max_retries),
            base_backoff: parse(&self.rebuild.base_backoff, defaults.rebuild.base_backoff)?,
            max_backoff: parse(&self.rebuild.max_backoff, defaults.rebuild.max_backoff)?,
            queue_capacity: self
                .rebuild
                .queue_capacity
                .unwrap_or(defaults.rebuild.queue_capacity),
        };
        if rebuild.max_concurrent == 0 || rebuild.queue_capacity == 0 {
            return Err(Error::Config(
                "rebuild.max_concurrent and rebuild.queue_capacity must be at least 1".to_string(),
            ));
        }

        let write_concurrency = self.write_concurrency.unwrap_or(defaults.write_concurrency);
        if write_concurrency == 0 {
            return Err(Error::Config("write_concurrency must be at least 1".to_string()));
        }

        Ok(EngineConfig {
            liveness_timeout: parse(&self.liveness_timeout, defaults.liveness_timeout)?,
            write_concurrency,
            rebuild,
        })
    }
}

/// Tier entry of the cluster file; `coding` names an entry of `coding_configs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSettings {
    pub id: TierId,
    pub coding: String,
    #[serde(default)]
    pub data_placement: DataPlacement,
    pub mirrors: Vec<TierMirror>,
}

/// Cluster description loaded by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub system: SystemId,
    #[serde(default)]
    pub coding_configs: BTreeMap<String, CodingConfig>,
    #[serde(default)]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
    #[serde(default)]
    pub tiers: Vec<TierSettings>,
    #[serde(default)]
    pub tierings: Vec<Tiering>,
    #[serde(default)]
    pub buckets: Vec<Bucket>,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl ClusterConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Resolve named coding configs and build a validated topology.
    pub fn topology(&self) -> Result<Topology> {
        let mut topology = Topology::new(self.system.clone());
        for pool in &self.pools {
            topology.add_pool(pool.clone());
        }
        for tier in &self.tiers {
            let coding = self.coding_configs.get(&tier.coding).ok_or_else(|| {
                Error::Config(format!(
                    "tier {} references unknown coding config {}",
                    tier.id, tier.coding
                ))
            })?;
            topology.add_tier(Tier {
                id: tier.id.clone(),
                coding: coding.clone(),
                data_placement: tier.data_placement,
                mirrors: tier.mirrors.clone(),
            });
        }
        for tiering in &self.tierings {
            topology.add_tiering(tiering.clone());
        }
        for bucket in &self.buckets {
            topology.add_bucket(bucket.clone());
        }
        topology.validate()?;

        for node in &self.nodes {
            topology.pool(&node.pool_id).map_err(|_| {
                Error::Config(format!("node {} references unknown pool {}", node.id, node.pool_id))
            })?;
        }
        Ok(topology)
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        self.engine.to_engine_config()
    }
}

// =============================================================================
// Durations
// =============================================================================

/// Parse a Go-style duration such as `30s`, `5m`, `1h30m` or `250ms`.
///
/// A trailing bare number is taken as seconds. Zero durations are rejected.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let unit = match c {
            'd' | 'D' => Duration::from_secs(86400),
            'h' | 'H' => Duration::from_secs(3600),
            'm' | 'M' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_millis(1)
            }
            'm' | 'M' => Duration::from_secs(60),
            's' | 'S' => Duration::from_secs(1),
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };
        total += unit.saturating_mul(num.min(u32::MAX as u64) as u32);
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total += Duration::from_secs(num);
    }

    if total.is_zero() {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(total)
}
