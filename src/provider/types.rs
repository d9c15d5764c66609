//! Core data model shared by every component: the closed task-kind enum,
//! the user tier ladder, and the Request/Response value types that flow
//! through the pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of task kinds the broker routes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CodeGen,
    ComponentGen,
    Content,
    Analysis,
    Optimisation,
    Summarisation,
    Translation,
    CampaignAnalysis,
    DesignReview,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeGen => "code_generation",
            Self::ComponentGen => "component_generation",
            Self::Content => "content_writing",
            Self::Analysis => "analysis",
            Self::Optimisation => "optimization",
            Self::Summarisation => "summarization",
            Self::Translation => "translation",
            Self::CampaignAnalysis => "campaign_analysis",
            Self::DesignReview => "design_review",
        }
    }
}

/// Subscription tier, determining the monthly spending cap and the
/// router's per-tier model preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    Free,
    Creator,
    Business,
    Agency,
}

/// An immutable incoming generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub task_kind: TaskKind,
    pub complexity: u8,
    pub content: String,
    pub user_tier: UserTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(default)]
    pub requires_vision: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub allow_fallback: bool,
}

impl Request {
    pub fn new(task_kind: TaskKind, complexity: u8, content: impl Into<String>, user_tier: UserTier) -> Self {
        Self {
            task_kind,
            complexity: complexity.clamp(1, 10),
            content: content.into(),
            user_tier,
            max_cost: None,
            requires_vision: false,
            context_length: None,
            user_id: None,
            allow_fallback: false,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    pub fn requiring_vision(mut self) -> Self {
        self.requires_vision = true;
        self
    }

    pub fn allowing_fallback(mut self) -> Self {
        self.allow_fallback = true;
        self
    }

    /// `word_count * 1.3`, the broker's single estimator for input token
    /// count when a provider doesn't report one. Inherited as-is from the
    /// source system; acknowledged as an approximation.
    pub fn estimated_input_tokens(&self) -> u64 {
        estimate_tokens(&self.content)
    }
}

/// Shared `word_count * 1.3` token estimator, used by both the request
/// side (here) and the response side (`Response::estimate_output_tokens`)
/// so the one approximation is not reimplemented in two places.
pub fn estimate_tokens(text: &str) -> u64 {
    let words = text.split_whitespace().count() as f64;
    (words * 1.3).round() as u64
}

/// The generated answer plus everything needed to account for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    pub processing_time_secs: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

/// A scored, ranked model choice with its runners-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub model: String,
    pub confidence: f64,
    pub reason: String,
    pub estimated_cost: f64,
    pub fallbacks: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_round_trips_through_serde() {
        let json = serde_json::to_string(&TaskKind::CampaignAnalysis).unwrap();
        assert_eq!(json, "\"campaign_analysis\"");
        let back: TaskKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_str(), "campaign_analysis");
    }

    #[test]
    fn request_complexity_is_clamped_to_valid_range() {
        let req = Request::new(TaskKind::Analysis, 20, "hi", UserTier::Free);
        assert_eq!(req.complexity, 10);
        let req = Request::new(TaskKind::Analysis, 0, "hi", UserTier::Free);
        assert_eq!(req.complexity, 1);
    }

    #[test]
    fn token_estimate_matches_word_count_times_1_3() {
        assert_eq!(estimate_tokens("one two three four"), 5);
    }
}
