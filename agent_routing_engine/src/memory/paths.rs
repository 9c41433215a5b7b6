//! Per `(function, agent)` execution statistics and path ranking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outcome totals of one agent on one function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PathStats {
    pub successes: u64,
    pub failures: u64,
    pub total_exec_ms: u64,
}

impl PathStats {
    pub fn record(&mut self, success: bool, exec_time_ms: u64) {
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_exec_ms = self.total_exec_ms.saturating_add(exec_time_ms);
    }

    pub fn samples(&self) -> u64 {
        self.successes + self.failures
    }

    /// Laplace-smoothed success rate `(s + 1) / (s + f + 2)`.
    pub fn smoothed_success_rate(&self) -> f64 {
        (self.successes as f64 + 1.0) / (self.samples() as f64 + 2.0)
    }

    pub fn average_exec_ms(&self) -> Option<f64> {
        match self.samples() {
            0 => None,
            n => Some(self.total_exec_ms as f64 / n as f64),
        }
    }
}

/// Ranked candidate returned by path selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPathCandidate {
    pub agent_name: String,
    pub score: f64,
    pub samples: u64,
    /// Agent produced the fresh cached result for this exact call.
    pub affinity: bool,
}

pub const NO_DATA_SCORE: f64 = 0.5;
pub const AFFINITY_BONUS: f64 = 0.1;

/// Rank `agents` by their recorded path statistics.
///
/// Agents without data score [`NO_DATA_SCORE`]. The speed factor compares each
/// agent's average time with the fastest candidate that has data. Sorting is
/// stable, so ties keep the order of `agents`.
pub fn rank_paths(
    agents: &[String],
    stats: &HashMap<String, PathStats>,
    affinity_agent: Option<&str>,
) -> Vec<ExecutionPathCandidate> {
    let fastest = agents
        .iter()
        .filter_map(|a| stats.get(a).and_then(|s| s.average_exec_ms()))
        .fold(f64::INFINITY, f64::min);

    let mut ranked: Vec<ExecutionPathCandidate> = agents
        .iter()
        .map(|agent| {
            let path = stats.get(agent).copied().unwrap_or_default();
            let base = match path.average_exec_ms() {
                Some(avg) => path.smoothed_success_rate() * (0.5 + 0.5 * speed_factor(fastest, avg)),
                None => NO_DATA_SCORE,
            };
            let affinity = affinity_agent == Some(agent.as_str());
            let score = if affinity {
                (base + AFFINITY_BONUS).min(1.0)
            } else {
                base
            };
            ExecutionPathCandidate {
                agent_name: agent.clone(),
                score: score.clamp(0.0, 1.0),
                samples: path.samples(),
                affinity,
            }
        })
        .collect();

    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}

/// `fastest / avg`, in [0, 1]. Zero-time samples count as fastest.
pub fn speed_factor(fastest: f64, avg: f64) -> f64 {
    if !fastest.is_finite() || avg <= 0.0 {
        return 1.0;
    }
    (fastest.max(0.0) / avg).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_smoothed_rate() {
        let mut stats = PathStats::default();
        assert!((stats.smoothed_success_rate() - 0.5).abs() < 1e-9);
        stats.record(true, 10);
        stats.record(true, 30);
        stats.record(false, 20);
        assert!((stats.smoothed_success_rate() - 0.6).abs() < 1e-9);
        assert_eq!(stats.average_exec_ms(), Some(20.0));
    }

    #[test]
    fn test_rank_prefers_reliable_fast_agent() {
        let mut stats = HashMap::new();
        let mut fast = PathStats::default();
        fast.record(true, 10);
        fast.record(true, 10);
        let mut slow = PathStats::default();
        slow.record(true, 100);
        slow.record(false, 100);
        stats.insert("fast".to_string(), fast);
        stats.insert("slow".to_string(), slow);

        let ranked = rank_paths(&names(&["slow", "fast", "new"]), &stats, None);
        assert_eq!(ranked[0].agent_name, "fast");
        assert_eq!(ranked.iter().find(|c| c.agent_name == "new").unwrap().score, NO_DATA_SCORE);
    }

    #[test]
    fn test_ties_keep_input_order_and_affinity_caps() {
        let stats = HashMap::new();
        let ranked = rank_paths(&names(&["b", "a", "c"]), &stats, None);
        let order: Vec<_> = ranked.iter().map(|c| c.agent_name.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);

        let ranked = rank_paths(&names(&["b", "a"]), &stats, Some("a"));
        assert_eq!(ranked[0].agent_name, "a");
        assert!(ranked[0].affinity);
        assert!((ranked[0].score - 0.6).abs() < 1e-9);
    }
}
