//! Analyze-phase consensus evaluation.
//!
//! Scores agreement between two or more [`AnalysisOutput`]s across three
//! categories (claims, risks, recommendations), decides whether the
//! workflow should escalate to cross-critique (V2) or human review, and
//! surfaces per-category divergences and agreements for the checkpoint
//! record.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::similarity::{jaccard, normalized_set};

/// One agent's output for a single Analyze sub-step.
///
/// Each category is carried twice: the `HashSet` used for Jaccard scoring
/// (normalized — lowercased, punctuation-collapsed) and the `Vec` of the
/// original strings as the agent wrote them, used only for surfacing
/// `Divergence` entries a human can actually read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub agent: String,
    pub raw_output: String,
    pub claims: HashSet<String>,
    pub risks: HashSet<String>,
    pub recommendations: HashSet<String>,
    pub raw_claims: Vec<String>,
    pub raw_risks: Vec<String>,
    pub raw_recommendations: Vec<String>,
}

impl AnalysisOutput {
    /// Build from raw category lists, normalizing every item for scoring
    /// while retaining the originals for divergence reporting.
    pub fn new(
        agent: impl Into<String>,
        raw_output: impl Into<String>,
        claims: impl IntoIterator<Item = impl AsRef<str>>,
        risks: impl IntoIterator<Item = impl AsRef<str>>,
        recommendations: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Self {
        let raw_claims: Vec<String> = claims.into_iter().map(|s| s.as_ref().to_string()).collect();
        let raw_risks: Vec<String> = risks.into_iter().map(|s| s.as_ref().to_string()).collect();
        let raw_recommendations: Vec<String> =
            recommendations.into_iter().map(|s| s.as_ref().to_string()).collect();

        Self {
            agent: agent.into(),
            raw_output: raw_output.into(),
            claims: normalized_set(&raw_claims),
            risks: normalized_set(&raw_risks),
            recommendations: normalized_set(&raw_recommendations),
            raw_claims,
            raw_risks,
            raw_recommendations,
        }
    }

    /// An output whose structured sets could not be parsed from the raw
    /// text; the raw text is retained for downstream synthesis/fallback.
    pub fn unparsed(agent: impl Into<String>, raw_output: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            raw_output: raw_output.into(),
            claims: HashSet::new(),
            risks: HashSet::new(),
            recommendations: HashSet::new(),
            raw_claims: Vec::new(),
            raw_risks: Vec::new(),
            raw_recommendations: Vec::new(),
        }
    }

    fn category(&self, category: Category) -> &HashSet<String> {
        match category {
            Category::Claims => &self.claims,
            Category::Risks => &self.risks,
            Category::Recommendations => &self.recommendations,
        }
    }

    fn raw_category(&self, category: Category) -> &[String] {
        match category {
            Category::Claims => &self.raw_claims,
            Category::Risks => &self.raw_risks,
            Category::Recommendations => &self.raw_recommendations,
        }
    }
}

/// The three categories scored by the consensus evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Claims,
    Risks,
    Recommendations,
}

impl Category {
    const ALL: [Category; 3] = [Category::Claims, Category::Risks, Category::Recommendations];

    fn label(self) -> &'static str {
        match self {
            Category::Claims => "claims",
            Category::Risks => "risks",
            Category::Recommendations => "recommendations",
        }
    }
}

/// Weight assigned to each category when computing the overall score.
/// Defaults sum to 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CategoryWeights {
    pub claims: f64,
    pub risks: f64,
    pub recommendations: f64,
}

impl Default for CategoryWeights {
    fn default() -> Self {
        Self {
            claims: 0.40,
            risks: 0.30,
            recommendations: 0.30,
        }
    }
}

impl CategoryWeights {
    fn for_category(&self, category: Category) -> f64 {
        match category {
            Category::Claims => self.claims,
            Category::Risks => self.risks,
            Category::Recommendations => self.recommendations,
        }
    }
}

/// Escalation thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EscalationThresholds {
    pub consensus: f64,
    pub human_review: f64,
}

impl Default for EscalationThresholds {
    fn default() -> Self {
        Self {
            consensus: 0.80,
            human_review: 0.50,
        }
    }
}

/// A pair-category whose similarity fell below the divergence threshold
/// (fixed at 0.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Divergence {
    pub category: Category,
    pub agent_a: String,
    pub agent_b: String,
    pub items_a: Vec<String>,
    pub items_b: Vec<String>,
    pub score: f64,
}

const DIVERGENCE_THRESHOLD: f64 = 0.5;

/// The full outcome of consensus evaluation over a set of outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub overall_score: f64,
    pub category_scores: Vec<(Category, f64)>,
    pub divergences: Vec<Divergence>,
    pub agreement: Vec<(Category, Vec<String>)>,
    pub needs_refinement: bool,
    pub needs_human_review: bool,
}

/// Evaluates consensus across analysis outputs using weighted, pairwise
/// Jaccard scoring per category.
pub struct ConsensusEvaluator {
    weights: CategoryWeights,
    thresholds: EscalationThresholds,
}

impl Default for ConsensusEvaluator {
    fn default() -> Self {
        Self::new(CategoryWeights::default(), EscalationThresholds::default())
    }
}

impl ConsensusEvaluator {
    pub fn new(weights: CategoryWeights, thresholds: EscalationThresholds) -> Self {
        Self { weights, thresholds }
    }

    /// Evaluate consensus over `outputs`. Zero or one output is trivial
    /// consensus (score 1.0, no escalation).
    pub fn evaluate(&self, outputs: &[AnalysisOutput]) -> ConsensusResult {
        if outputs.len() < 2 {
            return ConsensusResult {
                overall_score: 1.0,
                category_scores: Category::ALL.iter().map(|c| (*c, 1.0)).collect(),
                divergences: Vec::new(),
                agreement: Category::ALL
                    .iter()
                    .map(|c| (*c, self.agreement_for(outputs, *c)))
                    .collect(),
                needs_refinement: false,
                needs_human_review: false,
            };
        }

        let mut category_scores = Vec::with_capacity(3);
        let mut overall = 0.0;
        let mut divergences = Vec::new();

        for category in Category::ALL {
            let (mean, divs) = self.score_category(outputs, category);
            overall += mean * self.weights.for_category(category);
            category_scores.push((category, mean));
            divergences.extend(divs);
        }

        let needs_refinement =
            overall < self.thresholds.consensus && overall >= self.thresholds.human_review;
        let needs_human_review = overall < self.thresholds.human_review;

        let agreement = Category::ALL
            .iter()
            .map(|c| (*c, self.agreement_for(outputs, *c)))
            .collect();

        ConsensusResult {
            overall_score: overall,
            category_scores,
            divergences,
            agreement,
            needs_refinement,
            needs_human_review,
        }
    }

    /// Mean of all pairwise Jaccard scores within a category, plus any
    /// divergence entries (pairs scoring below 0.5).
    fn score_category(
        &self,
        outputs: &[AnalysisOutput],
        category: Category,
    ) -> (f64, Vec<Divergence>) {
        let mut sum = 0.0;
        let mut count = 0usize;
        let mut divergences = Vec::new();

        for i in 0..outputs.len() {
            for j in (i + 1)..outputs.len() {
                let a = outputs[i].category(category);
                let b = outputs[j].category(category);
                let score = jaccard(a, b);
                sum += score;
                count += 1;

                if score < DIVERGENCE_THRESHOLD {
                    let mut items_a = outputs[i].raw_category(category).to_vec();
                    let mut items_b = outputs[j].raw_category(category).to_vec();
                    items_a.sort();
                    items_b.sort();
                    divergences.push(Divergence {
                        category,
                        agent_a: outputs[i].agent.clone(),
                        agent_b: outputs[j].agent.clone(),
                        items_a,
                        items_b,
                        score,
                    });
                }
            }
        }

        let mean = if count == 0 { 1.0 } else { sum / count as f64 };
        (mean, divergences)
    }

    /// Intersection of normalized items across *all* outputs, sorted.
    fn agreement_for(&self, outputs: &[AnalysisOutput], category: Category) -> Vec<String> {
        let mut iter = outputs.iter();
        let Some(first) = iter.next() else {
            return Vec::new();
        };

        let mut common = first.category(category).clone();
        for output in iter {
            common = common
                .intersection(output.category(category))
                .cloned()
                .collect();
        }

        sorted(&common)
    }
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut v: Vec<String> = set.iter().cloned().collect();
    v.sort();
    v
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(agent: &str, claims: &[&str], risks: &[&str], recs: &[&str]) -> AnalysisOutput {
        AnalysisOutput::new(agent, "raw", claims.to_vec(), risks.to_vec(), recs.to_vec())
    }

    #[test]
    fn zero_outputs_is_trivial_consensus() {
        let result = ConsensusEvaluator::default().evaluate(&[]);
        assert_eq!(result.overall_score, 1.0);
        assert!(!result.needs_refinement);
        assert!(!result.needs_human_review);
    }

    #[test]
    fn one_output_is_trivial_consensus() {
        let outputs = vec![output("a1", &["claim"], &["risk"], &["rec"])];
        let result = ConsensusEvaluator::default().evaluate(&outputs);
        assert_eq!(result.overall_score, 1.0);
        assert!(!result.needs_refinement);
        assert!(!result.needs_human_review);
    }

    #[test]
    fn identical_outputs_yield_full_consensus() {
        let outputs = vec![
            output("a1", &["a", "b"], &["r"], &["x"]),
            output("a2", &["a", "b"], &["r"], &["x"]),
        ];
        let result = ConsensusEvaluator::default().evaluate(&outputs);
        assert_eq!(result.overall_score, 1.0);
        assert!(!result.needs_refinement);
        assert!(!result.needs_human_review);
        assert!(result.divergences.is_empty());
    }

    #[test]
    fn fully_disjoint_outputs_yield_zero_and_human_review() {
        let outputs = vec![
            output("a1", &["a"], &["r1"], &["x1"]),
            output("a2", &["b"], &["r2"], &["x2"]),
        ];
        let result = ConsensusEvaluator::default().evaluate(&outputs);
        assert_eq!(result.overall_score, 0.0);
        assert!(result.needs_human_review);
        // every category diverges
        assert_eq!(result.divergences.len(), 3);
    }

    #[test]
    fn mid_range_score_needs_refinement_not_human_review() {
        let outputs = vec![
            output("a1", &["a", "b"], &["r1", "r2"], &["x"]),
            output("a2", &["a", "c"], &["r1", "r3"], &["x"]),
        ];
        let result = ConsensusEvaluator::default().evaluate(&outputs);
        // claims: {a,b}∩{a,c}=1, union=3 -> 1/3; risks same shape -> 1/3;
        // recs identical -> 1.0
        // overall = 0.40*(1/3) + 0.30*(1/3) + 0.30*1.0 = 0.5333...
        assert!(result.overall_score > 0.50 && result.overall_score < 0.80);
        assert!(result.needs_refinement);
        assert!(!result.needs_human_review);
    }

    #[test]
    fn score_at_or_above_consensus_threshold_never_escalates() {
        let weights = CategoryWeights::default();
        let thresholds = EscalationThresholds::default();
        let evaluator = ConsensusEvaluator::new(weights, thresholds);

        let outputs = vec![
            output("a1", &["a", "b", "c"], &["r"], &["x"]),
            output("a2", &["a", "b", "c"], &["r"], &["x"]),
        ];
        let result = evaluator.evaluate(&outputs);
        assert!(result.overall_score >= thresholds.consensus);
        assert!(!result.needs_refinement);
        assert!(!result.needs_human_review);
    }

    #[test]
    fn agreement_is_intersection_across_all_outputs_sorted() {
        let outputs = vec![
            output("a1", &["zebra", "apple", "mango"], &[], &[]),
            output("a2", &["apple", "mango", "kiwi"], &[], &[]),
            output("a3", &["apple", "mango"], &[], &[]),
        ];
        let result = ConsensusEvaluator::default().evaluate(&outputs);
        let claims_agreement = result
            .agreement
            .iter()
            .find(|(c, _)| matches!(c, Category::Claims))
            .unwrap();
        assert_eq!(claims_agreement.1, vec!["apple", "mango"]);
    }

    #[test]
    fn divergence_entries_carry_both_agents_raw_items_and_score() {
        let outputs = vec![
            output("a1", &["a"], &[], &[]),
            output("a2", &["b"], &[], &[]),
        ];
        let result = ConsensusEvaluator::default().evaluate(&outputs);
        let claims_div = result
            .divergences
            .iter()
            .find(|d| matches!(d.category, Category::Claims))
            .unwrap();
        assert_eq!(claims_div.agent_a, "a1");
        assert_eq!(claims_div.agent_b, "a2");
        assert_eq!(claims_div.items_a, vec!["a"]);
        assert_eq!(claims_div.items_b, vec!["b"]);
        assert_eq!(claims_div.score, 0.0);
    }

    #[test]
    fn divergence_items_preserve_original_casing_and_punctuation() {
        let outputs = vec![
            output("a1", &["Uses Postgres!"], &[], &[]),
            output("a2", &["No auth on admin routes"], &[], &[]),
        ];
        let result = ConsensusEvaluator::default().evaluate(&outputs);
        let claims_div = result
            .divergences
            .iter()
            .find(|d| matches!(d.category, Category::Claims))
            .unwrap();
        // Raw items are exactly as supplied, not the normalized scoring form.
        assert_eq!(claims_div.items_a, vec!["Uses Postgres!"]);
        assert_eq!(claims_div.items_b, vec!["No auth on admin routes"]);
    }

    #[test]
    fn three_way_consensus_averages_all_pairs() {
        let outputs = vec![
            output("a1", &["a", "b"], &[], &[]),
            output("a2", &["a"], &[], &[]),
            output("a3", &["b"], &[], &[]),
        ];
        let result = ConsensusEvaluator::default().evaluate(&outputs);
        let claims_score = result
            .category_scores
            .iter()
            .find(|(c, _)| matches!(c, Category::Claims))
            .unwrap()
            .1;
        // pairs: (a1,a2)=1/2, (a1,a3)=1/2, (a2,a3)=0 -> mean = 1/3
        assert!((claims_score - (1.0 / 3.0)).abs() < 1e-9);
    }
}
