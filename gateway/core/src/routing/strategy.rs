//! Selection Strategies
//!
//! Each strategy is a plain function over a candidate slice returning the
//! index of the chosen channel. [`Strategy`] is the closed set of names and
//! maps each to its function through [`Strategy::func`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use super::channel::Channel;
use super::stats::StatsTracker;
use crate::error::GatewayError;

/// Mutable state a strategy may consult
pub struct SelectionContext<'a> {
    /// Randomness source
    pub rng: &'a mut dyn RngCore,
    /// Round-robin cursor for the current model
    pub cursor: &'a AtomicUsize,
    /// Live channel statistics
    pub stats: &'a StatsTracker,
}

/// Signature shared by every strategy
pub type StrategyFn = fn(&[Channel], &mut SelectionContext<'_>) -> Option<usize>;

/// Channel selection algorithm
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Random draw proportional to weight
    #[default]
    Weight,
    /// Highest priority tier, weighted within the tier
    Priority,
    /// Cycle through candidates in order
    RoundRobin,
    /// Smallest observed latency
    LowestLatency,
    /// Uniform draw
    Random,
}

impl Strategy {
    /// Every strategy
    pub const ALL: [Strategy; 5] = [
        Self::Weight,
        Self::Priority,
        Self::RoundRobin,
        Self::LowestLatency,
        Self::Random,
    ];

    /// Function implementing this strategy
    pub fn func(self) -> StrategyFn {
        match self {
            Self::Weight => select_weighted,
            Self::Priority => select_priority,
            Self::RoundRobin => select_round_robin,
            Self::LowestLatency => select_lowest_latency,
            Self::Random => select_random,
        }
    }

    /// Canonical name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weight => "weight",
            Self::Priority => "priority",
            Self::RoundRobin => "round_robin",
            Self::LowestLatency => "lowest_latency",
            Self::Random => "random",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "weight" | "weighted" => Ok(Self::Weight),
            "priority" => Ok(Self::Priority),
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "lowest_latency" | "latency" => Ok(Self::LowestLatency),
            "random" => Ok(Self::Random),
            other => Err(GatewayError::Config(format!(
                "unknown selection strategy: {other}"
            ))),
        }
    }
}

// ============================================================================
// Strategy Functions
// ============================================================================

/// Weighted random draw; uniform when every weight is zero
pub fn select_weighted(candidates: &[Channel], ctx: &mut SelectionContext<'_>) -> Option<usize> {
    weighted_among(candidates, (0..candidates.len()).collect(), ctx)
}

/// Restrict to the highest priority, then break ties by weight
pub fn select_priority(candidates: &[Channel], ctx: &mut SelectionContext<'_>) -> Option<usize> {
    let top = candidates.iter().map(|c| c.priority).max()?;
    let tier: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.priority == top)
        .map(|(i, _)| i)
        .collect();
    if tier.len() == 1 {
        return tier.first().copied();
    }
    weighted_among(candidates, tier, ctx)
}

/// Next candidate after the cursor
pub fn select_round_robin(candidates: &[Channel], ctx: &mut SelectionContext<'_>) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    Some(ctx.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len())
}

/// Candidate with the smallest live latency, falling back to the static
/// response-time hint and then to weighted selection
pub fn select_lowest_latency(
    candidates: &[Channel],
    ctx: &mut SelectionContext<'_>,
) -> Option<usize> {
    let best = candidates
        .iter()
        .enumerate()
        .filter_map(|(i, c)| {
            ctx.stats
                .average_latency(c.id)
                .or(c.response_time_ms.map(|ms| ms as f64))
                .map(|latency| (i, latency))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1));

    match best {
        Some((i, _)) => Some(i),
        None => select_weighted(candidates, ctx),
    }
}

/// Uniform draw
pub fn select_random(candidates: &[Channel], ctx: &mut SelectionContext<'_>) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    Some(ctx.rng.gen_range(0..candidates.len()))
}

fn weighted_among(
    candidates: &[Channel],
    indices: Vec<usize>,
    ctx: &mut SelectionContext<'_>,
) -> Option<usize> {
    if indices.is_empty() {
        return None;
    }
    let total: u64 = indices
        .iter()
        .map(|&i| u64::from(candidates[i].weight))
        .sum();
    if total == 0 {
        return Some(indices[ctx.rng.gen_range(0..indices.len())]);
    }

    let mut point = ctx.rng.gen_range(0..total);
    for &i in &indices {
        let weight = u64::from(candidates[i].weight);
        if point < weight {
            return Some(i);
        }
        point -= weight;
    }
    indices.last().copied()
}
