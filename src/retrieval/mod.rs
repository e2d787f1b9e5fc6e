
use tracing::{debug, warn};

use crate::Result;
use crate::config::RelevanceConfig;
use crate::pipeline::{DocumentPipeline, ScoredPassage};

/// Statistical gate deciding whether retrieved passages are relevant enough
/// to ground an answer.
#[derive(Debug, Clone)]
pub struct RelevanceGate {
    min_avg_score: f32,
    min_max_score: f32,
    high_score_threshold: f32,
    min_high_chunks: usize,
}

/// Score statistics behind a gate decision.
#[derive(Debug, Clone, PartialEq)]
pub struct RelevanceReport {
    pub is_relevant: bool,
    pub avg_score: f32,
    pub max_score: f32,
    pub high_score_count: usize,
}

/// Passages retrieved for a query, post-gate. When the gate rejects the
/// query the passages are cleared so nothing downstream can leak them into
/// a prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedContext {
    pub passages: Vec<ScoredPassage>,
    pub report: RelevanceReport,
}

impl Default for RelevanceGate {
    fn default() -> Self {
        Self::new(&RelevanceConfig::default())
    }
}

impl RelevanceGate {
    pub fn new(config: &RelevanceConfig) -> Self {
        Self {
            min_avg_score: config.min_avg_score,
            min_max_score: config.min_max_score,
            high_score_threshold: config.high_score_threshold,
            min_high_chunks: config.min_high_chunks,
        }
    }

    /// A query is relevant iff at least one passage came back, the best
    /// score clears `min_max_score`, and either the average clears
    /// `min_avg_score` or enough individual scores clear
    /// `high_score_threshold`.
    pub fn evaluate(&self, scores: &[f32]) -> RelevanceReport {
        if scores.is_empty() {
            return RelevanceReport {
                is_relevant: false,
                avg_score: 0.0,
                max_score: 0.0,
                high_score_count: 0,
            };
        }

        let avg_score = scores.iter().sum::<f32>() / scores.len() as f32;
        let max_score = scores.iter().copied().fold(0.0f32, f32::max);
        let high_score_count = scores
            .iter()
            .filter(|s| **s >= self.high_score_threshold)
            .count();

        let is_relevant = max_score >= self.min_max_score
            && (avg_score >= self.min_avg_score || high_score_count >= self.min_high_chunks);

        RelevanceReport {
            is_relevant,
            avg_score,
            max_score,
            high_score_count,
        }
    }
}

/// Retrieve passages for `query` and run them through the gate. An
/// irrelevant query returns an empty context with the report attached.
pub fn search_relevant_content(
    pipeline: &DocumentPipeline,
    gate: &RelevanceGate,
    query: &str,
    namespaces: &[String],
    top_k: usize,
) -> Result<RetrievedContext> {
    if namespaces.is_empty() {
        return Ok(RetrievedContext {
            passages: Vec::new(),
            report: gate.evaluate(&[]),
        });
    }

    let passages = pipeline.query(query, namespaces, top_k)?;
    let scores: Vec<f32> = passages.iter().map(|p| p.score).collect();
    let report = gate.evaluate(&scores);

    debug!(
        "Relevance gate: relevant={} avg={:.3} max={:.3} high={}",
        report.is_relevant, report.avg_score, report.max_score, report.high_score_count
    );

    if !report.is_relevant {
        warn!(
            "Query rejected by relevance gate (avg={:.3}, max={:.3})",
            report.avg_score, report.max_score
        );
        return Ok(RetrievedContext {
            passages: Vec::new(),
            report,
        });
    }

    Ok(RetrievedContext { passages, report })
}

/// Build the system prompt for a completion: grounded in the retrieved
/// passages when the gate passed, an explicit refusal instruction otherwise.
pub fn build_system_prompt(context: &RetrievedContext) -> String {
    if context.report.is_relevant && !context.passages.is_empty() {
        let mut prompt = String::from(
            "You are a study assistant for course exam preparation. Your only \
             source of knowledge is the course material passages below. Do not \
             use outside information. Paraphrase the material in a clear, \
             didactic way instead of copying it, and organize answers with \
             lists or tables where that helps.\n\nCourse material:\n",
        );
        for (i, passage) in context.passages.iter().enumerate() {
            prompt.push_str(&format!("\n[{}] {}\n", i + 1, passage.content));
        }
        prompt
    } else {
        String::from(
            "You are a study assistant for course exam preparation. The user's \
             question is not covered by the course material: the retrieval \
             relevance score is too low. State clearly that the question is \
             outside the course material and do not answer it, not even \
             partially and not from general knowledge. You may suggest \
             rephrasing the question toward topics the material does cover.",
        )
    }
}

/// The canned reply streamed to the user when the gate rejects a query.
pub fn refusal_message() -> &'static str {
    "That question isn't covered by the course material, so I can't answer it. \
     I can help with any topic that is part of the material - try rephrasing \
     your question toward the course content."
}
