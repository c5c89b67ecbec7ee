//! Priority lanes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SpindleError;

/// A named partition of the task queue.
///
/// Ordering follows priority: `Critical` sorts first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Critical,
    High,
    Medium,
    #[default]
    Default,
    Low,
}

impl Lane {
    pub const ALL: [Lane; 5] = [
        Lane::Critical,
        Lane::High,
        Lane::Medium,
        Lane::Default,
        Lane::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Critical => "critical",
            Lane::High => "high",
            Lane::Medium => "medium",
            Lane::Default => "default",
            Lane::Low => "low",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = SpindleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Lane::Critical),
            "high" => Ok(Lane::High),
            "medium" => Ok(Lane::Medium),
            "default" => Ok(Lane::Default),
            "low" => Ok(Lane::Low),
            other => Err(SpindleError::config(
                "lane",
                format!("unknown lane {other:?}, expected low|default|medium|high|critical"),
            )),
        }
    }
}

/// Lane → weight table.
///
/// Lanes missing from the explicit table are served with `baseline`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneWeights {
    weights: BTreeMap<Lane, u32>,
    baseline: u32,
}

impl LaneWeights {
    pub fn new(weights: BTreeMap<Lane, u32>, baseline: u32) -> Self {
        Self { weights, baseline }
    }

    /// Reference weights: critical=6, high=5, medium=4, default=3, low=1.
    pub fn reference() -> Self {
        let weights = BTreeMap::from([
            (Lane::Critical, 6),
            (Lane::High, 5),
            (Lane::Medium, 4),
            (Lane::Default, 3),
            (Lane::Low, 1),
        ]);
        Self::new(weights, 1)
    }

    /// Weight for `lane`, falling back to the baseline weight.
    pub fn weight(&self, lane: Lane) -> u32 {
        self.weights.get(&lane).copied().unwrap_or(self.baseline)
    }

    pub fn baseline(&self) -> u32 {
        self.baseline
    }

    pub fn explicit(&self) -> &BTreeMap<Lane, u32> {
        &self.weights
    }

    /// All lanes with a positive effective weight, in priority order.
    pub fn served(&self) -> Vec<(Lane, u32)> {
        Lane::ALL
            .iter()
            .map(|&lane| (lane, self.weight(lane)))
            .filter(|&(_, w)| w > 0)
            .collect()
    }

    /// First `(higher, lower)` pair of served lanes where the lower-priority lane
    /// carries more weight than the higher one.
    pub fn inversion(&self) -> Option<(Lane, Lane)> {
        let served = self.served();
        served.iter().enumerate().find_map(|(i, &(higher, weight))| {
            served[i + 1..]
                .iter()
                .find(|&&(_, w)| w > weight)
                .map(|&(lower, _)| (higher, lower))
        })
    }

    /// Parse `critical=6,default=3,low=1`.
    pub fn parse_list(value: &str, baseline: u32) -> Result<Self, SpindleError> {
        let mut weights = BTreeMap::new();
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (lane, weight) = item.split_once('=').ok_or_else(|| {
                SpindleError::config("queue.lanes", format!("expected lane=weight, got {item:?}"))
            })?;
            let lane: Lane = lane.parse()?;
            let weight: u32 = weight.trim().parse().map_err(|_| {
                SpindleError::config("queue.lanes", format!("invalid weight in {item:?}"))
            })?;
            weights.insert(lane, weight);
        }
        Ok(Self::new(weights, baseline))
    }
}

impl Default for LaneWeights {
    fn default() -> Self {
        Self::reference()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("critical", Lane::Critical)]
    #[case("HIGH", Lane::High)]
    #[case(" medium ", Lane::Medium)]
    #[case("default", Lane::Default)]
    #[case("low", Lane::Low)]
    fn lanes_parse_case_insensitively(#[case] input: &str, #[case] expected: Lane) {
        assert_eq!(input.parse::<Lane>().unwrap(), expected);
    }

    #[test]
    fn unknown_lane_is_rejected() {
        assert!("urgent".parse::<Lane>().is_err());
    }

    #[test]
    fn unlisted_lanes_inherit_baseline() {
        let weights = LaneWeights::parse_list("critical=6,default=3", 2).unwrap();
        assert_eq!(weights.weight(Lane::Critical), 6);
        assert_eq!(weights.weight(Lane::Default), 3);
        assert_eq!(weights.weight(Lane::High), 2);
        assert_eq!(weights.weight(Lane::Low), 2);
        assert_eq!(weights.served().len(), 5);
    }

    #[test]
    fn reference_weights_grow_with_priority() {
        let weights = LaneWeights::reference();
        assert!(weights.weight(Lane::High) > weights.weight(Lane::Default));
        assert!(weights.weight(Lane::Medium) > weights.weight(Lane::Default));
        for pair in Lane::ALL.windows(2) {
            assert!(weights.weight(pair[0]) >= weights.weight(pair[1]), "{} < {}", pair[0], pair[1]);
        }
        assert_eq!(weights.inversion(), None);
    }

    #[rstest]
    #[case("critical=6,default=3,low=1", 1, Some((Lane::High, Lane::Default)))]
    #[case("high=5,low=2", 1, Some((Lane::Critical, Lane::High)))]
    #[case("critical=6,low=1", 0, None)]
    #[case("critical=2,high=2,default=2", 2, None)]
    fn inversions_are_detected(#[case] list: &str, #[case] baseline: u32, #[case] expected: Option<(Lane, Lane)>) {
        let weights = LaneWeights::parse_list(list, baseline).unwrap();
        assert_eq!(weights.inversion(), expected);
    }

    #[test]
    fn zero_weight_lanes_are_not_served() {
        let weights = LaneWeights::parse_list("critical=6,low=1", 0).unwrap();
        let served: Vec<Lane> = weights.served().into_iter().map(|(l, _)| l).collect();
        assert_eq!(served, vec![Lane::Critical, Lane::Low]);
    }

    #[test]
    fn lane_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Lane::Critical).unwrap(), "\"critical\"");
    }
}
