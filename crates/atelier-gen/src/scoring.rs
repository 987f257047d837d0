//! Multi-criteria evaluation of competing prompt variants
//!
//! Each criterion is scored 0-10 from the prompt text alone, using small
//! lexicons plus the competition context (subject words, style, brand and
//! mood keywords). Scoring is a pure function of its inputs so a competition
//! always resolves to the same winner.

use crate::orchestrator::{CompetitionContext, PromptCompetition, PromptVariant};
use atelier_core::{AssetType, AtelierError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Composite scores closer than this are a tie
const SCORE_EPSILON: f64 = 1e-6;

const EMOTION_WORDS: &[&str] = &[
    "calm", "warm", "inviting", "hopeful", "gentle", "trustworthy", "confident", "friendly",
    "serene", "joyful", "reassuring", "uplifting", "peaceful", "empathetic", "cozy", "soothing",
    "optimistic", "focused", "welcoming", "supportive",
];

const AESTHETIC_WORDS: &[&str] = &[
    "composition", "lighting", "palette", "gradient", "texture", "balanced", "harmonious",
    "minimal", "minimalist", "elegant", "soft", "muted", "pastel", "watercolor", "isometric",
    "geometric", "illustration", "hand-drawn", "negative", "space", "contrast", "depth",
];

const TECHNICAL_WORDS: &[&str] = &[
    "centered", "background", "foreground", "lighting", "angle", "view", "symmetrical",
    "aspect", "resolution", "outline", "silhouette", "flat", "vector", "isolated", "framed",
    "composition", "perspective",
];

const VAGUE_WORDS: &[&str] = &[
    "something", "stuff", "thing", "things", "nice", "good", "cool", "awesome", "various",
    "somehow", "maybe", "etc",
];

const ICON_WORDS: &[&str] = &[
    "icon", "symbol", "simple", "flat", "centered", "minimal", "bold", "clean", "glyph",
    "isolated", "emblem", "readable",
];

const COVER_WORDS: &[&str] = &[
    "banner", "wide", "panoramic", "landscape", "horizontal", "scene", "header", "backdrop",
    "expansive", "cinematic", "vista",
];

const ICON_CLASHES: &[&str] = &["panoramic", "landscape", "crowded", "busy", "photorealistic"];
const COVER_CLASHES: &[&str] = &["icon", "glyph", "tiny", "favicon"];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "onto", "over", "under", "are",
    "was", "its", "their", "our", "your", "has", "have", "but", "not", "all", "any", "use",
];

/// Relative importance of each criterion in the composite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriteriaWeights {
    pub emotional_intelligence: f64,
    pub aesthetic_fit: f64,
    pub technical_clarity: f64,
    pub visual_consistency: f64,
    pub novelty: f64,
    pub domain_relevance: f64,
    pub brand_coherence: f64,
}

impl Default for CriteriaWeights {
    fn default() -> Self {
        Self {
            emotional_intelligence: 0.15,
            aesthetic_fit: 0.15,
            technical_clarity: 0.15,
            visual_consistency: 0.15,
            novelty: 0.10,
            domain_relevance: 0.20,
            brand_coherence: 0.10,
        }
    }
}

impl CriteriaWeights {
    fn as_array(&self) -> [f64; 7] {
        [
            self.emotional_intelligence,
            self.aesthetic_fit,
            self.technical_clarity,
            self.visual_consistency,
            self.novelty,
            self.domain_relevance,
            self.brand_coherence,
        ]
    }

    pub fn total(&self) -> f64 {
        self.as_array().iter().sum()
    }

    /// Weights must be finite, non-negative and not all zero
    pub fn validate(&self) -> Result<()> {
        if self.as_array().iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(AtelierError::Config(
                "scoring weights must be finite and non-negative".to_string(),
            ));
        }
        if self.total() <= 0.0 {
            return Err(AtelierError::Config(
                "scoring weights must not all be zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-criterion scores, each 0-10
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CriterionScores {
    pub emotional_intelligence: f64,
    pub aesthetic_fit: f64,
    pub technical_clarity: f64,
    pub visual_consistency: f64,
    pub novelty: f64,
    pub domain_relevance: f64,
    pub brand_coherence: f64,
}

impl CriterionScores {
    fn as_array(&self) -> [f64; 7] {
        [
            self.emotional_intelligence,
            self.aesthetic_fit,
            self.technical_clarity,
            self.visual_consistency,
            self.novelty,
            self.domain_relevance,
            self.brand_coherence,
        ]
    }

    /// Weighted mean of the criteria
    pub fn composite(&self, weights: &CriteriaWeights) -> f64 {
        let total = weights.total();
        if total <= 0.0 {
            return 0.0;
        }
        self.as_array()
            .iter()
            .zip(weights.as_array())
            .map(|(score, weight)| score * weight)
            .sum::<f64>()
            / total
    }
}

/// One variant's scores within a competition
#[derive(Debug, Clone, Serialize)]
pub struct CompetitiveEvaluation {
    pub variant: PromptVariant,
    pub scores: CriterionScores,
    pub composite: f64,
}

pub struct QualityScorer {
    weights: CriteriaWeights,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new(CriteriaWeights::default())
    }
}

impl QualityScorer {
    pub fn new(weights: CriteriaWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &CriteriaWeights {
        &self.weights
    }

    /// Score a variant on its own, with the scorer's weights
    pub fn score(&self, variant: &PromptVariant, context: &CompetitionContext) -> CompetitiveEvaluation {
        self.score_with(variant, context, &[], &self.weights)
    }

    /// Score a variant against its competitors with explicit weights.
    /// Novelty is measured against `peers`.
    pub fn score_with(
        &self,
        variant: &PromptVariant,
        context: &CompetitionContext,
        peers: &[&PromptVariant],
        weights: &CriteriaWeights,
    ) -> CompetitiveEvaluation {
        let words = tokenize(&variant.prompt);
        let scores = CriterionScores {
            emotional_intelligence: emotional_intelligence(&words, context),
            aesthetic_fit: aesthetic_fit(&words, context),
            technical_clarity: technical_clarity(&words),
            visual_consistency: visual_consistency(&words, context.asset_type),
            novelty: novelty(&words, peers),
            domain_relevance: domain_relevance(&words, context),
            brand_coherence: brand_coherence(&words, context),
        };
        let composite = scores.composite(weights);
        CompetitiveEvaluation {
            variant: variant.clone(),
            scores,
            composite,
        }
    }

    /// Score every variant of a competition, in arrival order
    pub fn evaluate(&self, competition: &PromptCompetition) -> Vec<CompetitiveEvaluation> {
        competition
            .variants
            .iter()
            .map(|variant| {
                let peers: Vec<&PromptVariant> = competition
                    .variants
                    .iter()
                    .filter(|other| other.arrival != variant.arrival)
                    .collect();
                self.score_with(variant, &competition.context, &peers, &self.weights)
            })
            .collect()
    }

    /// Highest composite wins; ties go to the cheaper variant, then the one
    /// that arrived first.
    pub fn select_winner(evaluations: &[CompetitiveEvaluation]) -> Option<&CompetitiveEvaluation> {
        evaluations.iter().min_by(|a, b| rank(a, b))
    }

    /// Evaluations sorted best first
    pub fn ranking(mut evaluations: Vec<CompetitiveEvaluation>) -> Vec<CompetitiveEvaluation> {
        evaluations.sort_by(rank);
        evaluations
    }
}

/// `Less` means `a` ranks above `b`
fn rank(a: &CompetitiveEvaluation, b: &CompetitiveEvaluation) -> Ordering {
    score_bucket(b.composite)
        .cmp(&score_bucket(a.composite))
        .then_with(|| a.variant.cost.total_cmp(&b.variant.cost))
        .then_with(|| a.variant.arrival.cmp(&b.variant.arrival))
}

/// Composite rounded to `SCORE_EPSILON` steps; equal buckets are a tie
fn score_bucket(composite: f64) -> i64 {
    (composite / SCORE_EPSILON).round() as i64
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .map(|w| w.trim_matches('-'))
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

fn lexicon_hits(words: &[String], lexicon: &[&str]) -> usize {
    let unique: BTreeSet<&str> = words.iter().map(String::as_str).collect();
    lexicon.iter().filter(|w| unique.contains(*w)).count()
}

/// Share of the (tokenized) keywords that occur in the prompt
fn keyword_coverage(words: &[String], keywords: &[String]) -> Option<f64> {
    let wanted: BTreeSet<String> = keywords.iter().flat_map(|k| tokenize(k)).collect();
    if wanted.is_empty() {
        return None;
    }
    let present: BTreeSet<&str> = words.iter().map(String::as_str).collect();
    let hits = wanted.iter().filter(|w| present.contains(w.as_str())).count();
    Some(hits as f64 / wanted.len() as f64)
}

fn clamp_score(value: f64) -> f64 {
    value.clamp(0.0, 10.0)
}

fn emotional_intelligence(words: &[String], context: &CompetitionContext) -> f64 {
    let hits = lexicon_hits(words, EMOTION_WORDS);
    let mood = keyword_coverage(words, &context.mood).unwrap_or(0.0);
    clamp_score(3.0 + 2.0 * hits as f64 + 3.0 * mood)
}

fn aesthetic_fit(words: &[String], context: &CompetitionContext) -> f64 {
    let hits = lexicon_hits(words, AESTHETIC_WORDS);
    let base = 2.0 + 1.5 * hits as f64;
    match keyword_coverage(words, &context.style_keywords) {
        Some(coverage) => clamp_score(base * 0.6 + 10.0 * coverage * 0.4),
        None => clamp_score(base),
    }
}

fn technical_clarity(words: &[String]) -> f64 {
    let length = words.len();
    let length_score = match length {
        0..=3 => 2.0,
        4..=7 => 5.0,
        8..=40 => 8.0,
        41..=70 => 6.0,
        _ => 4.0,
    };
    let concrete = lexicon_hits(words, TECHNICAL_WORDS) as f64;
    let vague = words
        .iter()
        .filter(|w| VAGUE_WORDS.contains(&w.as_str()))
        .count() as f64;
    clamp_score(length_score + 0.75 * concrete - 1.5 * vague)
}

fn visual_consistency(words: &[String], asset_type: AssetType) -> f64 {
    let (fits, clashes) = match asset_type {
        AssetType::Icon => (ICON_WORDS, ICON_CLASHES),
        AssetType::Cover => (COVER_WORDS, COVER_CLASHES),
    };
    let hits = lexicon_hits(words, fits) as f64;
    let clash = lexicon_hits(words, clashes) as f64;
    clamp_score(5.0 + 1.5 * hits - 2.5 * clash)
}

/// Lexical variety within the prompt, and distance from competing prompts
fn novelty(words: &[String], peers: &[&PromptVariant]) -> f64 {
    if words.is_empty() {
        return 0.0;
    }
    let own: BTreeSet<&str> = words.iter().map(String::as_str).collect();
    let variety = own.len() as f64 / words.len() as f64;

    let max_overlap = peers
        .iter()
        .map(|peer| {
            let other_words = tokenize(&peer.prompt);
            let other: BTreeSet<&str> = other_words.iter().map(String::as_str).collect();
            jaccard(&own, &other)
        })
        .fold(0.0, f64::max);

    clamp_score(10.0 * (0.5 * variety + 0.5 * (1.0 - max_overlap)))
}

fn jaccard(a: &BTreeSet<&str>, b: &BTreeSet<&str>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn domain_relevance(words: &[String], context: &CompetitionContext) -> f64 {
    let subject = [context.asset_name.clone(), context.description.clone()];
    match keyword_coverage(words, &subject) {
        Some(coverage) => clamp_score(10.0 * coverage),
        None => 5.0,
    }
}

fn brand_coherence(words: &[String], context: &CompetitionContext) -> f64 {
    let base = match keyword_coverage(words, &context.brand_keywords) {
        Some(coverage) => 3.0 + 7.0 * coverage,
        None => 7.0,
    };
    let avoided: BTreeSet<String> = context.avoid.iter().flat_map(|a| tokenize(a)).collect();
    let violations = words.iter().filter(|w| avoided.contains(*w)).count() as f64;
    clamp_score(base - 3.0 * violations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> CompetitionContext {
        CompetitionContext {
            asset_name: "Legal Documents".to_string(),
            description: "Legal Documents icon".to_string(),
            asset_type: AssetType::Icon,
            style_keywords: vec!["watercolor".to_string(), "soft".to_string()],
            brand_keywords: vec!["calm".to_string(), "trustworthy".to_string()],
            mood: vec!["reassuring".to_string()],
            avoid: vec!["photorealistic".to_string()],
        }
    }

    fn variant(prompt: &str, cost: f64, arrival: u32) -> PromptVariant {
        PromptVariant {
            model: format!("model-{}", arrival),
            prompt: prompt.to_string(),
            rationale: None,
            raw_response: String::new(),
            cost,
            arrival,
        }
    }

    #[test]
    fn test_default_weights_are_valid() {
        let weights = CriteriaWeights::default();
        assert!(weights.validate().is_ok());
        assert!((weights.total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let negative = CriteriaWeights {
            novelty: -0.1,
            ..Default::default()
        };
        assert!(negative.validate().is_err());

        let zero = CriteriaWeights {
            emotional_intelligence: 0.0,
            aesthetic_fit: 0.0,
            technical_clarity: 0.0,
            visual_consistency: 0.0,
            novelty: 0.0,
            domain_relevance: 0.0,
            brand_coherence: 0.0,
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_relevant_prompt_outscores_vague_one() {
        let scorer = QualityScorer::default();
        let good = variant(
            "Soft watercolor icon of legal documents, a neat stack of papers with a seal, \
             calm and trustworthy, centered composition, muted palette",
            0.001,
            0,
        );
        let vague = variant("something nice, cool stuff", 0.001, 1);

        let good_eval = scorer.score(&good, &context());
        let vague_eval = scorer.score(&vague, &context());
        assert!(good_eval.composite > vague_eval.composite);
        assert!(good_eval.scores.domain_relevance > vague_eval.scores.domain_relevance);
        assert!(good_eval.scores.technical_clarity > vague_eval.scores.technical_clarity);
    }

    #[test]
    fn test_scores_stay_in_range() {
        let scorer = QualityScorer::default();
        let long = "calm ".repeat(200);
        for prompt in ["", "icon", long.as_str()] {
            let eval = scorer.score(&variant(prompt, 0.0, 0), &context());
            for s in eval.scores.as_array() {
                assert!((0.0..=10.0).contains(&s), "{} out of range", s);
            }
            assert!((0.0..=10.0).contains(&eval.composite));
        }
    }

    #[test]
    fn test_avoided_terms_cost_brand_coherence() {
        let scorer = QualityScorer::default();
        let clean = scorer.score(&variant("calm trustworthy legal icon", 0.0, 0), &context());
        let clashing = scorer.score(
            &variant("calm trustworthy legal icon, photorealistic", 0.0, 1),
            &context(),
        );
        assert!(clean.scores.brand_coherence > clashing.scores.brand_coherence);
    }

    #[test]
    fn test_weights_change_the_composite() {
        let v = variant("calm warm hopeful gentle", 0.0, 0);
        let emotional = CriteriaWeights {
            emotional_intelligence: 1.0,
            aesthetic_fit: 0.0,
            technical_clarity: 0.0,
            visual_consistency: 0.0,
            novelty: 0.0,
            domain_relevance: 0.0,
            brand_coherence: 0.0,
        };
        let scorer = QualityScorer::default();
        let eval = scorer.score_with(&v, &context(), &[], &emotional);
        assert!((eval.composite - eval.scores.emotional_intelligence).abs() < 1e-9);
    }

    #[test]
    fn test_winner_ties_break_on_cost_then_arrival() {
        let scorer = QualityScorer::default();
        let prompt = "soft watercolor legal documents icon, calm";
        let evals = vec![
            scorer.score(&variant(prompt, 0.002, 0), &context()),
            scorer.score(&variant(prompt, 0.001, 2), &context()),
            scorer.score(&variant(prompt, 0.001, 1), &context()),
        ];
        let winner = QualityScorer::select_winner(&evals).unwrap();
        assert_eq!(winner.variant.arrival, 1);

        let ranked = QualityScorer::ranking(evals);
        let order: Vec<u32> = ranked.iter().map(|e| e.variant.arrival).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_near_equal_composites_rank_consistently() {
        let eval = |composite: f64, cost: f64, arrival: u32| CompetitiveEvaluation {
            variant: variant("watercolor legal documents icon", cost, arrival),
            scores: CriterionScores::default(),
            composite,
        };
        // a and b, b and c are within epsilon of each other; a and c are not
        let evals = vec![
            eval(0.5, 0.003, 0),
            eval(0.5 + 0.6e-6, 0.002, 1),
            eval(0.5 + 1.2e-6, 0.001, 2),
            eval(f64::NAN, 0.0, 3),
        ];

        let mut orders = Vec::new();
        for shift in 0..evals.len() {
            let mut shuffled = evals.clone();
            shuffled.rotate_left(shift);
            let ranked = QualityScorer::ranking(shuffled);
            orders.push(ranked.iter().map(|e| e.variant.arrival).collect::<Vec<u32>>());
        }
        assert!(orders.iter().all(|order| order == &orders[0]));
        assert_eq!(&orders[0][..3], &[2, 1, 0]);
    }

    #[test]
    fn test_novelty_penalizes_duplicates() {
        let scorer = QualityScorer::default();
        let a = variant("watercolor legal documents icon calm", 0.0, 0);
        let b = variant("watercolor legal documents icon calm", 0.0, 1);
        let c = variant("isometric folder with brass seal, bold outline", 0.0, 2);

        let dup = scorer.score_with(&a, &context(), &[&b], scorer.weights());
        let distinct = scorer.score_with(&a, &context(), &[&c], scorer.weights());
        assert!(distinct.scores.novelty > dup.scores.novelty);
    }

    #[test]
    fn test_select_winner_empty() {
        assert!(QualityScorer::select_winner(&[]).is_none());
    }
}
