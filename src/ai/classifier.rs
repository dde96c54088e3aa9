//! Heuristic task classifier.
//!
//! Maps raw user text to a complexity tier and a suggested model tier. The
//! router consumes only the model tier; the complexity tier is surfaced to
//! telemetry. Pattern and length based, no network, deterministic for a given
//! input.

use serde::{Deserialize, Serialize};

/// Complexity tier of a user request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskTier {
    /// Greetings, short factual questions, single-step commands.
    Simple,
    /// Everyday multi-step requests.
    Moderate,
    /// Larger engineering or analysis tasks.
    Complex,
    /// Tasks that benefit from explicit chain-of-thought models.
    Reasoning,
    /// Open-ended writing and ideation.
    Creative,
}

/// Model capability tier the router should aim for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    Default,
    Best,
    Reasoning,
}

/// Classification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub tier: TaskTier,
    /// Heuristic confidence in `[0, 1]`.
    pub confidence: f32,
    pub suggested_model_tier: ModelTier,
}

const REASONING_MARKERS: &[&str] = &[
    "step by step",
    "prove",
    "derive",
    "theorem",
    "logic puzzle",
    "chain of thought",
    "reason about",
    "formally",
];

const CREATIVE_MARKERS: &[&str] = &[
    "write a story",
    "write a poem",
    "brainstorm",
    "imagine",
    "creative",
    "song",
    "fiction",
    "slogan",
];

const COMPLEX_MARKERS: &[&str] = &[
    "refactor",
    "implement",
    "architecture",
    "design a",
    "migrate",
    "optimize",
    "debug",
    "analyze",
    "analyse",
    "benchmark",
    "security audit",
];

const SIMPLE_MARKERS: &[&str] = &[
    "hello", "hi", "hey", "thanks", "thank you", "what time", "list", "show", "pwd",
];

/// Classify a user request.
pub fn classify(text: &str) -> Classification {
    let lowered = text.to_lowercase();
    let trimmed = lowered.trim();

    if contains_any(trimmed, REASONING_MARKERS) {
        return tiered(TaskTier::Reasoning, 0.9, ModelTier::Reasoning);
    }
    if contains_any(trimmed, CREATIVE_MARKERS) {
        return tiered(TaskTier::Creative, 0.85, ModelTier::Best);
    }
    if contains_any(trimmed, COMPLEX_MARKERS) {
        return tiered(TaskTier::Complex, 0.8, ModelTier::Best);
    }

    // Length heuristics: long multi-sentence prompts lean complex even
    // without a marker hit.
    if trimmed.len() > 600 || trimmed.matches(['.', '\n']).count() > 6 {
        return tiered(TaskTier::Complex, 0.6, ModelTier::Best);
    }

    if trimmed.len() <= 80 && (contains_any(trimmed, SIMPLE_MARKERS) || word_count(trimmed) <= 4) {
        return tiered(TaskTier::Simple, 0.75, ModelTier::Fast);
    }

    tiered(TaskTier::Moderate, 0.5, ModelTier::Default)
}

fn tiered(tier: TaskTier, confidence: f32, model: ModelTier) -> Classification {
    Classification {
        tier,
        confidence,
        suggested_model_tier: model,
    }
}

/// Multi-word markers match as substrings; single-word markers match whole
/// words only, so "improve" never triggers "prove".
fn contains_any(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| {
        if marker.contains(' ') {
            text.contains(marker)
        } else {
            text.split_whitespace()
                .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
                .any(|w| w == *marker)
        }
    })
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
