//! Controller configuration
//!
//! Defaults are deployment-ready; every knob can be overridden through
//! `KEYSPAN_*` environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::policy::IndexPolicy;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Identity of the node this controller manages partitions for
    pub local_node: String,
    /// Open fractional-rank interval of partitions eligible for load moves
    pub move_band: (f64, f64),
    /// Moves assigned to any single target node per cycle
    pub max_moves_per_target: usize,
    /// Under-utilized nodes consulted per cycle
    pub max_move_targets: usize,
    /// Partitions the node keeps regardless of load
    pub min_active_partitions: usize,
    /// Deadline for one batched sibling lookup
    pub lookup_timeout: Duration,
    /// Deadline for awaiting all dispatched tasks of a cycle
    pub dispatch_timeout: Duration,
    /// Capacity policy applied to indices without an explicit override
    pub default_policy: IndexPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            local_node: "node-0".to_string(),
            move_band: (0.3, 0.8),
            max_moves_per_target: 3,
            max_move_targets: 3,
            min_active_partitions: 3,
            lookup_timeout: Duration::from_secs(5),
            dispatch_timeout: Duration::from_secs(60),
            default_policy: IndexPolicy::default(),
        }
    }
}

impl ControllerConfig {
    pub fn new(local_node: impl Into<String>) -> Self {
        Self {
            local_node: local_node.into(),
            ..Self::default()
        }
    }

    /// Build a config from the environment, falling back to defaults for
    /// unset variables.
    ///
    /// Recognized variables: `KEYSPAN_NODE`, `KEYSPAN_MOVE_BAND_LOW`,
    /// `KEYSPAN_MOVE_BAND_HIGH`, `KEYSPAN_MAX_MOVES_PER_TARGET`,
    /// `KEYSPAN_MAX_MOVE_TARGETS`, `KEYSPAN_MIN_ACTIVE_PARTITIONS`,
    /// `KEYSPAN_LOOKUP_TIMEOUT_MS`, `KEYSPAN_DISPATCH_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(node) = std::env::var("KEYSPAN_NODE") {
            config.local_node = node;
        }
        if let Some(low) = parse_env::<f64>("KEYSPAN_MOVE_BAND_LOW")? {
            config.move_band.0 = low;
        }
        if let Some(high) = parse_env::<f64>("KEYSPAN_MOVE_BAND_HIGH")? {
            config.move_band.1 = high;
        }
        if let Some(v) = parse_env::<usize>("KEYSPAN_MAX_MOVES_PER_TARGET")? {
            config.max_moves_per_target = v;
        }
        if let Some(v) = parse_env::<usize>("KEYSPAN_MAX_MOVE_TARGETS")? {
            config.max_move_targets = v;
        }
        if let Some(v) = parse_env::<usize>("KEYSPAN_MIN_ACTIVE_PARTITIONS")? {
            config.min_active_partitions = v;
        }
        if let Some(ms) = parse_env::<u64>("KEYSPAN_LOOKUP_TIMEOUT_MS")? {
            config.lookup_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("KEYSPAN_DISPATCH_TIMEOUT_MS")? {
            config.dispatch_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let (low, high) = self.move_band;
        if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low >= high {
            return Err(Error::Config(format!(
                "move band ({}, {}) must satisfy 0 <= low < high <= 1",
                low, high
            )));
        }
        if self.max_move_targets == 0 {
            return Err(Error::Config(
                "max_move_targets must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value {:?} for {}", raw, name))),
        Err(_) => Ok(None),
    }
}
