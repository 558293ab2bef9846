use std::collections::HashSet;

use crate::config::ConfidenceConfig;
use crate::providers::RerankResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceTier {
    Answer,
    Caveat,
    Ambiguous,
    Decline,
    Escalate,
    OffTopic,
}

impl ConfidenceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTier::Answer => "ANSWER",
            ConfidenceTier::Caveat => "CAVEAT",
            ConfidenceTier::Ambiguous => "AMBIGUOUS",
            ConfidenceTier::Decline => "DECLINE",
            ConfidenceTier::Escalate => "ESCALATE",
            ConfidenceTier::OffTopic => "OFF_TOPIC",
        }
    }
}

impl std::fmt::Display for ConfidenceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ConfidenceReport {
    pub tier: ConfidenceTier,
    pub top_score: f32,
    pub score_variance: f32,
    pub distinct_topics: usize,
}

/// Classifies a reranked result list into one of the six response tiers.
/// Total: every input yields exactly one tier.
pub struct ConfidenceScorer {
    config: ConfidenceConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, reranked: &[RerankResult]) -> ConfidenceReport {
        if reranked.is_empty() {
            return ConfidenceReport {
                tier: ConfidenceTier::OffTopic,
                top_score: 0.0,
                score_variance: 0.0,
                distinct_topics: 0,
            };
        }

        let top_score = reranked[0].score;

        if top_score < self.config.minimum_relevance {
            return ConfidenceReport {
                tier: ConfidenceTier::OffTopic,
                top_score,
                score_variance: 0.0,
                distinct_topics: 0,
            };
        }

        let score_variance = sample_variance(reranked);
        let distinct_topics = estimate_topic_count(reranked);

        // Several topics scoring nearly the same is an ambiguity signal,
        // not a confidence signal.
        if top_score >= self.config.caveat_threshold
            && score_variance <= self.config.ambiguity_score_variance
            && distinct_topics > 1
        {
            return ConfidenceReport {
                tier: ConfidenceTier::Ambiguous,
                top_score,
                score_variance,
                distinct_topics,
            };
        }

        let tier = if top_score >= self.config.answer_threshold {
            ConfidenceTier::Answer
        } else if top_score >= self.config.caveat_threshold {
            ConfidenceTier::Caveat
        } else if top_score >= self.config.decline_threshold {
            ConfidenceTier::Decline
        } else {
            ConfidenceTier::Escalate
        };

        ConfidenceReport {
            tier,
            top_score,
            score_variance,
            distinct_topics,
        }
    }
}

/// Sample variance; a single score is defined as 1.0 to suppress false
/// ambiguity on one-element lists.
fn sample_variance(reranked: &[RerankResult]) -> f32 {
    if reranked.len() < 2 {
        return 1.0;
    }

    let n = reranked.len() as f64;
    let mean = reranked.iter().map(|r| r.score as f64).sum::<f64>() / n;
    let sum_sq = reranked
        .iter()
        .map(|r| {
            let d = r.score as f64 - mean;
            d * d
        })
        .sum::<f64>();

    (sum_sq / (n - 1.0)) as f32
}

/// Rough topic grouping by the first line of the leading 50 characters,
/// capped at the result count.
fn estimate_topic_count(reranked: &[RerankResult]) -> usize {
    let mut titles: HashSet<String> = HashSet::new();
    for result in reranked {
        let head: String = result.text.chars().take(50).collect();
        let title = head.split('\n').next().unwrap_or("").to_string();
        titles.insert(title);
    }
    titles.len().min(reranked.len())
}
