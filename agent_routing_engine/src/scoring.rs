//! Agent scoring for routing decisions.
//!
//! Four terms, each in [0, 1], combined with weights that sum to 1.0:
//! historical performance, resource availability, context overlap and
//! specialization.

use serde::Serialize;
use serde_json::Value;

use crate::agent::{Capability, FunctionPerformance};
use crate::memory::paths::{speed_factor, NO_DATA_SCORE};
use crate::memory::similarity::ContextFeatures;
use crate::settings::ScoringConfig;

/// Share of the historical term taken from the agent's own window; the rest
/// comes from memory's path ranking.
const OWN_HISTORY_WEIGHT: f64 = 0.7;
const NEUTRAL_CONTEXT: f64 = 0.5;
const PRIMARY_SPECIALIZATION: f64 = 1.0;
const CAPABLE_SPECIALIZATION: f64 = 0.3;

/// Per-term breakdown of one agent's score.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoreBreakdown {
    pub agent_name: String,
    pub historical: f64,
    pub resource: f64,
    pub context: f64,
    pub specialization: f64,
    pub total: f64,
}

/// Inputs shared by every candidate of one selection round.
pub struct ScoringInput<'a> {
    pub function_name: &'a str,
    pub context: Option<&'a Value>,
    /// Fastest average execution time among candidates with samples.
    pub fastest_avg_ms: Option<f64>,
}

impl<'a> ScoringInput<'a> {
    pub fn new(function_name: &'a str, context: Option<&'a Value>, candidates: &[&dyn Capability]) -> Self {
        let fastest_avg_ms = candidates
            .iter()
            .filter_map(|agent| agent.function_performance(function_name))
            .filter_map(|perf| perf.average_exec_ms())
            .reduce(f64::min);
        Self {
            function_name,
            context,
            fastest_avg_ms,
        }
    }
}

/// Weighted score of `agent`; `path_score` is memory's ranking for it, if any.
pub fn calculate_agent_score(
    weights: &ScoringConfig,
    input: &ScoringInput<'_>,
    agent: &dyn Capability,
    path_score: Option<f64>,
) -> ScoreBreakdown {
    let performance = agent.function_performance(input.function_name);

    let historical = historical_score(performance.as_ref(), input.fastest_avg_ms, path_score);
    let resource = agent.resource_usage().availability();
    let context = context_score(input.context, performance.as_ref());
    let specialization = if agent.is_primary(input.function_name) {
        PRIMARY_SPECIALIZATION
    } else {
        CAPABLE_SPECIALIZATION
    };

    let total = weights.historical * historical
        + weights.resource * resource
        + weights.context * context
        + weights.specialization * specialization;

    ScoreBreakdown {
        agent_name: agent.name().to_string(),
        historical,
        resource,
        context,
        specialization,
        total: total.clamp(0.0, 1.0),
    }
}

/// Recent success rate scaled by relative speed, blended with the path score.
pub fn historical_score(
    performance: Option<&FunctionPerformance>,
    fastest_avg_ms: Option<f64>,
    path_score: Option<f64>,
) -> f64 {
    let path = path_score.unwrap_or(NO_DATA_SCORE).clamp(0.0, 1.0);
    let own = performance.and_then(|perf| {
        let rate = perf.recent_success_rate()?;
        let avg = perf.average_exec_ms()?;
        let speed = speed_factor(fastest_avg_ms.unwrap_or(f64::INFINITY), avg);
        Some(rate * (0.5 + 0.5 * speed))
    });
    match own {
        Some(own) => (OWN_HISTORY_WEIGHT * own + (1.0 - OWN_HISTORY_WEIGHT) * path).clamp(0.0, 1.0),
        None => path,
    }
}

/// Best Jaccard overlap with a context this agent previously succeeded in.
pub fn context_score(context: Option<&Value>, performance: Option<&FunctionPerformance>) -> f64 {
    let current = ContextFeatures::from_value(context);
    if current.is_empty() {
        return NEUTRAL_CONTEXT;
    }
    let Some(performance) = performance else {
        return NEUTRAL_CONTEXT;
    };
    let mut best: Option<f64> = None;
    for previous in performance.successful_contexts() {
        let features = ContextFeatures::from_value(Some(previous));
        if features.is_empty() {
            continue;
        }
        let overlap = current.jaccard(&features);
        best = Some(best.map_or(overlap, |b| b.max(overlap)));
    }
    best.unwrap_or(NEUTRAL_CONTEXT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_historical_without_data_is_neutral() {
        assert_eq!(historical_score(None, None, None), NO_DATA_SCORE);
        assert_eq!(historical_score(None, None, Some(0.8)), 0.8);
    }

    #[test]
    fn test_historical_blends_window_and_path() {
        let mut perf = FunctionPerformance::default();
        perf.record(true, 100, None);
        perf.record(true, 100, None);
        // Fastest peer averages 50ms, so speed factor is 0.5.
        let score = historical_score(Some(&perf), Some(50.0), Some(0.5));
        let expected = 0.7 * (1.0 * 0.75) + 0.3 * 0.5;
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_context_score_uses_best_overlap() {
        let mut perf = FunctionPerformance::default();
        perf.record(true, 1, Some(&json!({"view": "track", "organism": "ecoli"})));
        perf.record(true, 1, Some(&json!({"view": "table"})));

        let exact = context_score(Some(&json!({"view": "track", "organism": "ecoli"})), Some(&perf));
        assert!((exact - 1.0).abs() < 1e-9);
        let none = context_score(Some(&json!({"view": "plot"})), Some(&perf));
        assert_eq!(none, 0.0);
        assert_eq!(context_score(None, Some(&perf)), NEUTRAL_CONTEXT);
        assert_eq!(context_score(Some(&json!({"view": "plot"})), None), NEUTRAL_CONTEXT);
    }
}
