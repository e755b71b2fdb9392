//! Metric aggregation and the model-swap recommender.
//!
//! Given baseline metrics from real traffic and per-candidate metrics
//! from replays, produce a structured verdict. Candidates that drop
//! more than 15 percentage points of score are disqualified outright;
//! speed/cost alternatives must stay within 5 points of baseline.

use serde_json::{json, Value};
use serde::{Deserialize, Serialize};

/// Score tolerance for speed/cost alternatives (percentage points).
pub const PERF_TOLERANCE: f64 = 0.05;

/// Score drop that disqualifies a candidate entirely.
pub const PERF_DISQUALIFY: f64 = 0.15;

/// Weight of score improvement in the best-overall composite.
const SCORE_WEIGHT: f64 = 3.0;

/// Metrics of the incumbent model, measured on real traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineMetrics {
    /// Detected incumbent; `None` when traffic carries no model name.
    pub model: Option<String>,
    pub avg_score: f64,
    pub avg_latency_ms: f64,
    pub avg_cost: f64,
}

/// Aggregated replay metrics for one candidate model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model: String,
    pub avg_score: f64,
    pub avg_latency_ms: f64,
    pub total_cost: f64,
    pub avg_cost: f64,
    pub avg_tokens: f64,
    pub success_rate: f64,
    pub samples: usize,
}

/// The recommender's overall call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    SwitchRecommended,
    ConsiderTopPerformer,
    CurrentIsBest,
}

impl Verdict {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::SwitchRecommended => "switch_recommended",
            Verdict::ConsiderTopPerformer => "consider_top_performer",
            Verdict::CurrentIsBest => "current_is_best",
        }
    }
}

/// Structured recommendation with a human-readable summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    pub verdict: Verdict,
    /// Highest score that strictly beats baseline.
    pub top_performer: Option<String>,
    /// Best latency within score tolerance and faster than baseline.
    pub fastest: Option<String>,
    /// Best cost within score tolerance and cheaper than baseline.
    pub cheapest: Option<String>,
    /// Best weighted composite within tolerance.
    pub best_overall: Option<String>,
    /// Candidates dropped for losing too much score.
    pub disqualified: Vec<String>,
    pub summary: String,
}

impl Recommendations {
    /// The model a switch suggestion should name, if any.
    #[must_use]
    pub fn recommended_model(&self) -> Option<&str> {
        match self.verdict {
            Verdict::SwitchRecommended => self.best_overall.as_deref(),
            Verdict::ConsiderTopPerformer => self.top_performer.as_deref(),
            Verdict::CurrentIsBest => None,
        }
    }

    /// JSON form persisted on the job result and the suggestion.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "verdict": self.verdict.as_str(),
            "top_performer": self.top_performer,
            "fastest": self.fastest,
            "cheapest": self.cheapest,
            "best_overall": self.best_overall,
            "disqualified": self.disqualified,
            "summary": self.summary,
        })
    }
}

fn improvement_percent(baseline: f64, candidate: f64) -> f64 {
    if baseline.abs() < f64::EPSILON {
        return 0.0;
    }
    (candidate - baseline) / baseline * 100.0
}

/// Weighted composite: score improvement counts three times as much as
/// latency or cost improvement.
fn composite(baseline: &BaselineMetrics, candidate: &ModelMetrics) -> f64 {
    let score = improvement_percent(baseline.avg_score, candidate.avg_score);
    // Latency and cost improve downward.
    let latency = -improvement_percent(baseline.avg_latency_ms, candidate.avg_latency_ms);
    let cost = -improvement_percent(baseline.avg_cost, candidate.avg_cost);
    SCORE_WEIGHT * score + latency + cost
}

/// Run the recommender over the aggregated metrics.
#[must_use]
pub fn generate_recommendations(
    baseline: &BaselineMetrics,
    candidates: &[ModelMetrics],
) -> Recommendations {
    let mut disqualified = Vec::new();
    let mut qualified: Vec<&ModelMetrics> = Vec::new();
    for candidate in candidates {
        if candidate.avg_score < baseline.avg_score - PERF_DISQUALIFY {
            disqualified.push(candidate.model.clone());
        } else {
            qualified.push(candidate);
        }
    }

    let top_performer = qualified
        .iter()
        .filter(|c| c.avg_score > baseline.avg_score)
        .max_by(|a, b| {
            a.avg_score
                .partial_cmp(&b.avg_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|c| c.model.clone());

    let within_tolerance: Vec<&ModelMetrics> = qualified
        .iter()
        .filter(|c| c.avg_score >= baseline.avg_score - PERF_TOLERANCE)
        .copied()
        .collect();

    let fastest = within_tolerance
        .iter()
        .filter(|c| c.avg_latency_ms < baseline.avg_latency_ms)
        .min_by(|a, b| {
            a.avg_latency_ms
                .partial_cmp(&b.avg_latency_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|c| c.model.clone());

    let cheapest = within_tolerance
        .iter()
        .filter(|c| c.avg_cost < baseline.avg_cost)
        .min_by(|a, b| {
            a.avg_cost
                .partial_cmp(&b.avg_cost)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|c| c.model.clone());

    let best_overall = within_tolerance
        .iter()
        .map(|c| (c, composite(baseline, c)))
        .filter(|(_, score)| *score > 0.0)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(c, _)| c.model.clone());

    let verdict = if best_overall.is_some() {
        Verdict::SwitchRecommended
    } else if top_performer.is_some() {
        Verdict::ConsiderTopPerformer
    } else {
        Verdict::CurrentIsBest
    };

    let current = baseline.model.as_deref().unwrap_or("the current model");
    let summary = match verdict {
        Verdict::SwitchRecommended => {
            let model = best_overall.as_deref().unwrap_or_default();
            format!(
                "{model} beats {current} on the weighted score/latency/cost composite \
                 (baseline score {:.2}).",
                baseline.avg_score
            )
        }
        Verdict::ConsiderTopPerformer => {
            let model = top_performer.as_deref().unwrap_or_default();
            format!(
                "{model} scores above {current} but the overall trade-off is not clearly \
                 better; worth a look."
            )
        }
        Verdict::CurrentIsBest => format!(
            "No candidate beat {current} (baseline score {:.2}); keeping it.",
            baseline.avg_score
        ),
    };

    Recommendations {
        verdict,
        top_performer,
        fastest,
        cheapest,
        best_overall,
        disqualified,
        summary,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn baseline() -> BaselineMetrics {
        BaselineMetrics {
            model: Some("gpt-5-mini".to_string()),
            avg_score: 0.70,
            avg_latency_ms: 800.0,
            avg_cost: 0.001,
        }
    }

    fn candidate(model: &str, score: f64, latency: f64, cost: f64) -> ModelMetrics {
        ModelMetrics {
            model: model.to_string(),
            avg_score: score,
            avg_latency_ms: latency,
            total_cost: cost * 10.0,
            avg_cost: cost,
            avg_tokens: 600.0,
            success_rate: 1.0,
            samples: 10,
        }
    }

    #[test]
    fn better_faster_candidate_wins_a_switch() {
        // Higher score, lower latency, similar cost.
        let candidates = vec![candidate("claude-sonnet-4-6", 0.82, 600.0, 0.001)];
        let rec = generate_recommendations(&baseline(), &candidates);
        assert_eq!(rec.verdict, Verdict::SwitchRecommended);
        assert_eq!(rec.recommended_model(), Some("claude-sonnet-4-6"));
        assert_eq!(rec.best_overall.as_deref(), Some("claude-sonnet-4-6"));
        assert_eq!(rec.top_performer.as_deref(), Some("claude-sonnet-4-6"));
        assert_eq!(rec.fastest.as_deref(), Some("claude-sonnet-4-6"));
    }

    #[test]
    fn big_score_drop_disqualifies() {
        let candidates = vec![candidate("gpt-5-nano", 0.50, 200.0, 0.0001)];
        let rec = generate_recommendations(&baseline(), &candidates);
        assert_eq!(rec.verdict, Verdict::CurrentIsBest);
        assert_eq!(rec.disqualified, vec!["gpt-5-nano".to_string()]);
        assert!(rec.recommended_model().is_none());
    }

    #[test]
    fn within_tolerance_cheaper_candidate_recommends_switch() {
        // Slightly lower score but half the cost and latency.
        let candidates = vec![candidate("gemini-2.5-flash", 0.68, 400.0, 0.0004)];
        let rec = generate_recommendations(&baseline(), &candidates);
        assert_eq!(rec.verdict, Verdict::SwitchRecommended);
        assert_eq!(rec.cheapest.as_deref(), Some("gemini-2.5-flash"));
        assert_eq!(rec.fastest.as_deref(), Some("gemini-2.5-flash"));
        // Not a top performer: it does not beat the baseline score.
        assert!(rec.top_performer.is_none());
    }

    #[test]
    fn equal_candidate_keeps_current() {
        let candidates = vec![candidate("gpt-5", 0.70, 800.0, 0.001)];
        let rec = generate_recommendations(&baseline(), &candidates);
        assert_eq!(rec.verdict, Verdict::CurrentIsBest);
        assert!(rec.summary.contains("gpt-5-mini"));
    }

    #[test]
    fn between_tolerance_and_disqualify_is_kept_but_never_recommended() {
        // 8 points below baseline: qualified, outside tolerance.
        let candidates = vec![candidate("claude-haiku-4-5", 0.62, 100.0, 0.0001)];
        let rec = generate_recommendations(&baseline(), &candidates);
        assert!(rec.disqualified.is_empty());
        assert_eq!(rec.verdict, Verdict::CurrentIsBest);
        assert!(rec.fastest.is_none());
    }

    #[test]
    fn best_overall_weights_score_over_speed() {
        let candidates = vec![
            // Modest score gain.
            candidate("claude-sonnet-4-6", 0.78, 800.0, 0.001),
            // Faster and cheaper, same score.
            candidate("gemini-2.5-flash", 0.70, 500.0, 0.0005),
        ];
        let rec = generate_recommendations(&baseline(), &candidates);
        // 3 x ~11.4% score beats 37.5% latency + 50% cost? 34.3 < 87.5:
        // the speed/cost candidate wins the composite here.
        assert_eq!(rec.best_overall.as_deref(), Some("gemini-2.5-flash"));
        assert_eq!(rec.top_performer.as_deref(), Some("claude-sonnet-4-6"));
    }

    #[test]
    fn verdict_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Verdict::SwitchRecommended).unwrap(),
            "\"switch_recommended\""
        );
    }
}
