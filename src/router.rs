//! Scores candidate models for a request and picks one, with fallbacks.
//!
//! Mirrors the source system's weighted-score approach: cost efficiency
//! (40%), task suitability (30%), historical performance (20%), and tier
//! appropriateness (10%), adjusted by a load-balancing factor derived from
//! recent selection history.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::RwLock;

use regex::Regex;

use crate::catalogue::{ModelCatalogue, ModelSpec, QualityTier};
use crate::provider::types::{Request, Response, Selection, TaskKind, UserTier};

/// Per-model historical performance, updated after every observed response.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceMetrics {
    pub success_rate: f64,
    pub avg_quality: f64,
    pub avg_response_time_secs: f64,
    pub cost_efficiency: f64,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            success_rate: 0.95,
            avg_quality: 0.8,
            avg_response_time_secs: 5.0,
            cost_efficiency: 1.0,
        }
    }
}

struct SelectionRecord {
    model: String,
}

struct RetaggingPatterns {
    code: Regex,
    analysis: Regex,
}

fn retagging_patterns() -> &'static RetaggingPatterns {
    static PATTERNS: OnceLock<RetaggingPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| RetaggingPatterns {
        code: Regex::new(r"component|function|react|javascript|typescript|css|html|api").unwrap(),
        analysis: Regex::new(r"analyze|review|compare|evaluate|assess|audit").unwrap(),
    })
}

/// Output-token multiplier applied to the router's own pre-call cost
/// estimate, used only for scoring candidates. Distinct from the
/// provider client's `max_tokens` request-shaping formula and from each
/// client's own `estimate_cost` ambient helper.
fn scoring_output_multiplier(task_kind: TaskKind) -> f64 {
    match task_kind {
        TaskKind::CodeGen => 2.0,
        TaskKind::Content => 1.5,
        TaskKind::Analysis => 1.2,
        TaskKind::Optimisation => 1.3,
        TaskKind::ComponentGen => 2.5,
        TaskKind::CampaignAnalysis => 1.8,
        _ => 1.0,
    }
}

fn tier_preference(tier: UserTier) -> &'static [&'static str] {
    match tier {
        UserTier::Free => &["deepseek-v3", "gemini-1.5-flash"],
        UserTier::Creator => &["gemini-1.5-flash", "gemini-1.5-pro", "deepseek-v3"],
        UserTier::Business => &["gemini-1.5-pro", "claude-3.5-sonnet", "gemini-1.5-flash"],
        UserTier::Agency => &["claude-3.5-sonnet", "gpt-4-turbo", "gemini-1.5-pro"],
    }
}

fn tier_fallback(tier: UserTier) -> &'static str {
    match tier {
        UserTier::Free => "deepseek-v3",
        UserTier::Creator => "gemini-1.5-flash",
        UserTier::Business => "gemini-1.5-pro",
        UserTier::Agency => "claude-3.5-sonnet",
    }
}

/// Scores and selects models for incoming requests, tracking the
/// performance of each model over time.
pub struct Router {
    catalogue: ModelCatalogue,
    metrics: RwLock<HashMap<String, PerformanceMetrics>>,
    history: RwLock<Vec<SelectionRecord>>,
    history_window: usize,
}

impl Router {
    pub fn new(catalogue: ModelCatalogue, history_window: usize) -> Self {
        let mut metrics = HashMap::new();
        for model in catalogue.models() {
            metrics.insert(model.id.clone(), PerformanceMetrics::default());
        }
        Self {
            catalogue,
            metrics: RwLock::new(metrics),
            history: RwLock::new(Vec::new()),
            history_window,
        }
    }

    pub fn catalogue(&self) -> &ModelCatalogue {
        &self.catalogue
    }

    /// §4.C `select(request) -> Selection`.
    pub fn select(&self, request: &Request) -> Selection {
        let optimised = self.pre_optimise(request);

        let candidates = self.candidate_models(&optimised);
        if candidates.is_empty() {
            let fallback = self.fallback_model(&optimised);
            tracing::warn!(model = %fallback.id, "no suitable candidates, using smart fallback");
            return Selection {
                model: fallback.id.clone(),
                confidence: 0.5,
                reason: "smart fallback selection - no optimal candidates found".to_string(),
                estimated_cost: self.estimate_scoring_cost(fallback, &optimised),
                fallbacks: vec!["deepseek-v3".to_string()],
            };
        }

        let mut scored: Vec<(&ModelSpec, f64, f64)> = candidates
            .into_iter()
            .map(|model| {
                let score = self.score(model, &optimised);
                let load_factor = self.load_balancing_factor(&model.id);
                (model, score * load_factor, score)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap()
                .then_with(|| {
                    let cost_a = self.estimate_scoring_cost(a.0, &optimised);
                    let cost_b = self.estimate_scoring_cost(b.0, &optimised);
                    cost_a.partial_cmp(&cost_b).unwrap()
                })
        });

        let (best, _adjusted, original_score) = scored[0];
        let fallbacks: Vec<String> = scored.iter().skip(1).take(2).map(|(m, ..)| m.id.clone()).collect();

        let mut confidence = (original_score / 100.0).min(1.0);
        if scored.len() > 1 {
            let second_best = scored[1].2;
            let gap = (original_score - second_best) / 100.0;
            confidence = confidence.min(0.5 + gap);
        }

        let estimated_cost = self.estimate_scoring_cost(best, &optimised);
        let reason = self.explain(best, &optimised, original_score);

        self.record_selection(&best.id);

        Selection {
            model: best.id.clone(),
            confidence,
            reason,
            estimated_cost,
            fallbacks,
        }
    }

    /// §4.C performance metrics update, called after each observed response.
    pub fn update_performance_metrics(&self, response: &Response, observed_success: Option<bool>) {
        let mut metrics = self.metrics.write().unwrap();
        let entry = metrics.entry(response.model.clone()).or_default();

        if let Some(quality) = response.quality_score {
            entry.avg_quality = entry.avg_quality * 0.9 + quality * 0.1;
        }
        entry.avg_response_time_secs = entry.avg_response_time_secs * 0.9 + response.processing_time_secs * 0.1;

        let total_tokens = response.input_tokens + response.output_tokens;
        if total_tokens > 0 {
            let cost_per_token = response.cost / total_tokens as f64;
            let efficiency = 1.0 / cost_per_token.max(1e-6);
            entry.cost_efficiency = entry.cost_efficiency * 0.9 + efficiency * 0.1;
        }

        if let Some(success) = observed_success {
            let success_value = if success { 1.0 } else { 0.0 };
            entry.success_rate = entry.success_rate * 0.95 + success_value * 0.05;
        }

        tracing::debug!(
            model = %response.model,
            quality = entry.avg_quality,
            success_rate = entry.success_rate,
            "updated performance metrics"
        );
    }

    // ---- internal helpers ----

    fn pre_optimise(&self, request: &Request) -> Request {
        let mut optimised = request.clone();
        let content_len = optimised.content.len();

        if content_len < 50 && optimised.complexity > 3 {
            optimised.complexity = (optimised.complexity - 1).max(2);
        } else if content_len > 2000 && optimised.complexity < 6 {
            optimised.complexity = (optimised.complexity + 1).min(8);
        }

        let content_lower = optimised.content.to_lowercase();
        let patterns = retagging_patterns();
        if patterns.code.is_match(&content_lower)
            && matches!(optimised.task_kind, TaskKind::Content | TaskKind::Analysis)
        {
            optimised.task_kind = TaskKind::CodeGen;
        }
        if patterns.analysis.is_match(&content_lower) && matches!(optimised.task_kind, TaskKind::Content) {
            optimised.task_kind = TaskKind::Analysis;
        }

        optimised
    }

    fn candidate_models(&self, request: &Request) -> Vec<&ModelSpec> {
        self.catalogue
            .models()
            .iter()
            .filter(|model| {
                if model.capability.max_complexity < request.complexity {
                    return false;
                }
                if request.requires_vision && !model.capability.vision_capable {
                    return false;
                }
                true
            })
            .collect()
    }

    fn estimate_scoring_cost(&self, model: &ModelSpec, request: &Request) -> f64 {
        let input_tokens = request.estimated_input_tokens();
        let output_tokens = (input_tokens as f64 * scoring_output_multiplier(request.task_kind)) as u64;
        let images = if request.requires_vision { 1 } else { 0 };
        model.price(input_tokens, output_tokens, images)
    }

    fn score(&self, model: &ModelSpec, request: &Request) -> f64 {
        let cost = self.cost_score(model, request) * 0.4;
        let suitability = self.suitability_score(model, request) * 0.3;
        let performance = self.performance_score(model) * 0.2;
        let tier = self.tier_score(model, request) * 0.1;
        cost + suitability + performance + tier
    }

    fn cost_score(&self, model: &ModelSpec, request: &Request) -> f64 {
        let estimated_cost = self.estimate_scoring_cost(model, request);
        if let Some(max_cost) = request.max_cost {
            if estimated_cost > max_cost {
                return 0.0;
            }
        }
        let reference_max_cost = 0.10;
        (100.0 - (estimated_cost / reference_max_cost * 100.0)).max(0.0).min(100.0)
    }

    fn suitability_score(&self, model: &ModelSpec, request: &Request) -> f64 {
        let base = if model.handles(request.task_kind) {
            90.0
        } else if request.complexity <= model.capability.max_complexity {
            70.0
        } else {
            30.0
        };
        let complexity_match = (model.capability.max_complexity as f64 / request.complexity as f64).min(1.0);
        let complexity_bonus = complexity_match * 10.0;
        let quality_bonus = model.capability.quality_tier.suitability_bonus();
        (base + complexity_bonus + quality_bonus).min(100.0)
    }

    fn performance_score(&self, model: &ModelSpec) -> f64 {
        let metrics = self.metrics.read().unwrap();
        let metric = metrics.get(&model.id).copied().unwrap_or_default();
        let score = metric.success_rate * 0.4 + metric.avg_quality * 0.4 + metric.cost_efficiency.min(2.0) * 0.2;
        (score * 100.0).min(100.0)
    }

    fn tier_score(&self, model: &ModelSpec, request: &Request) -> f64 {
        let preferred = tier_preference(request.user_tier);
        if let Some(index) = preferred.iter().position(|id| *id == model.id) {
            (100.0 - (index as f64 * 20.0)).max(0.0)
        } else if request.user_tier == UserTier::Free
            && matches!(model.id.as_str(), "claude-3.5-sonnet" | "gpt-4-turbo")
        {
            10.0
        } else {
            50.0
        }
    }

    fn load_balancing_factor(&self, model_id: &str) -> f64 {
        let history = self.history.read().unwrap();
        let recent = history.iter().rev().take(100);
        let usage_count = recent.filter(|entry| entry.model == model_id).count();
        if usage_count > 40 {
            0.7
        } else if usage_count > 30 {
            0.8
        } else if usage_count > 20 {
            0.9
        } else {
            1.0
        }
    }

    fn fallback_model(&self, request: &Request) -> &ModelSpec {
        if request.requires_vision {
            return self.catalogue.get("gpt-4-vision").expect("catalogue has gpt-4-vision");
        }
        let preferred = tier_fallback(request.user_tier);
        if request.complexity > 7 && !matches!(preferred, "claude-3.5-sonnet" | "gpt-4-turbo") {
            return self.catalogue.get("claude-3.5-sonnet").expect("catalogue has claude-3.5-sonnet");
        }
        self.catalogue.get(preferred).expect("tier fallback model exists in catalogue")
    }

    fn explain(&self, model: &ModelSpec, request: &Request, score: f64) -> String {
        let cost = self.estimate_scoring_cost(model, request);
        let mut reasons = Vec::new();

        if cost < 0.001 {
            reasons.push("ultra-low cost".to_string());
        } else if cost < 0.01 {
            reasons.push("cost-effective".to_string());
        } else if cost < 0.05 {
            reasons.push("balanced cost/quality".to_string());
        } else {
            reasons.push("premium quality justified".to_string());
        }

        if model.handles(request.task_kind) {
            reasons.push(format!("optimised for {}", request.task_kind.as_str()));
        }
        if request.complexity <= model.capability.max_complexity {
            reasons.push("complexity match".to_string());
        }
        if tier_preference(request.user_tier).contains(&model.id.as_str()) {
            reasons.push(format!("tier-appropriate for {:?}", request.user_tier));
        }

        format!("selected {} (score: {:.1}) - {}", model.id, score, reasons.join(", "))
    }

    fn record_selection(&self, model_id: &str) {
        let mut history = self.history.write().unwrap();
        history.push(SelectionRecord {
            model: model_id.to_string(),
        });
        if history.len() > self.history_window {
            let overflow = history.len() - self.history_window;
            history.drain(0..overflow);
        }
    }

    // ---- ambient analytics (supplemented from the source system) ----

    /// Recommended top-3 models for a task kind and tier, computed the
    /// same way selection scoring works but without mutating history.
    pub fn recommendations(&self, task_kind: TaskKind, tier: UserTier) -> Vec<String> {
        let probe = Request::new(task_kind, 5, "sample content for analysis", tier);
        let mut scored: Vec<(String, f64)> = self
            .candidate_models(&probe)
            .into_iter()
            .map(|model| (model.id.clone(), self.score(model, &probe)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        scored.into_iter().take(3).map(|(id, _)| id).collect()
    }

    /// Summary of recent selection activity: total selections retained and
    /// a per-model usage count, used for dashboards and for spotting
    /// starved models.
    pub fn selection_analytics(&self) -> SelectionAnalytics {
        let history = self.history.read().unwrap();
        let mut by_model: HashMap<String, u64> = HashMap::new();
        for entry in history.iter() {
            *by_model.entry(entry.model.clone()).or_insert(0) += 1;
        }
        let never_selected = self
            .catalogue
            .models()
            .iter()
            .filter(|m| !by_model.contains_key(&m.id))
            .map(|m| m.id.clone())
            .collect();
        SelectionAnalytics {
            total_selections: history.len(),
            by_model,
            never_selected,
        }
    }
}

/// Read-only summary over retained selection history, supplemented from
/// the source system's `get_selection_analytics`/`get_model_recommendations`.
#[derive(Debug, Clone)]
pub struct SelectionAnalytics {
    pub total_selections: usize,
    pub by_model: HashMap<String, u64>,
    pub never_selected: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::new(ModelCatalogue::default(), 1000)
    }

    #[test]
    fn short_low_priority_content_reduces_complexity() {
        let router = router();
        let request = Request::new(TaskKind::Analysis, 5, "hi", UserTier::Free);
        let optimised = router.pre_optimise(&request);
        assert_eq!(optimised.complexity, 4);
    }

    #[test]
    fn long_content_increases_complexity() {
        let router = router();
        let long_content = "x ".repeat(1200);
        let request = Request::new(TaskKind::Analysis, 4, long_content, UserTier::Free);
        let optimised = router.pre_optimise(&request);
        assert_eq!(optimised.complexity, 5);
    }

    #[test]
    fn code_keywords_retag_content_writing_as_code_gen() {
        let router = router();
        let request = Request::new(TaskKind::Content, 3, "build a react component", UserTier::Free);
        let optimised = router.pre_optimise(&request);
        assert_eq!(optimised.task_kind, TaskKind::CodeGen);
    }

    #[test]
    fn analysis_keywords_retag_content_writing_as_analysis() {
        let router = router();
        let request = Request::new(TaskKind::Content, 3, "please analyze this report", UserTier::Free);
        let optimised = router.pre_optimise(&request);
        assert_eq!(optimised.task_kind, TaskKind::Analysis);
    }

    #[test]
    fn select_prefers_cheaper_model_for_low_complexity_free_tier() {
        let router = router();
        let request = Request::new(TaskKind::ComponentGen, 3, "blue submit button", UserTier::Creator);
        let selection = router.select(&request);
        assert_eq!(selection.model, "gemini-1.5-flash");
        assert!(selection.estimated_cost < 0.01);
    }

    #[test]
    fn select_returns_at_most_two_fallbacks() {
        let router = router();
        let request = Request::new(TaskKind::Analysis, 4, "analyze this", UserTier::Business);
        let selection = router.select(&request);
        assert!(selection.fallbacks.len() <= 2);
    }

    #[test]
    fn higher_cost_candidate_never_scores_above_a_cheaper_identical_one() {
        let router = router();
        let cheap = router.catalogue.get("deepseek-v3").unwrap();
        let expensive = router.catalogue.get("gpt-4-turbo").unwrap();
        let request = Request::new(TaskKind::Analysis, 4, "analyze this small request", UserTier::Business);
        assert!(router.cost_score(cheap, &request) >= router.cost_score(expensive, &request));
    }

    #[test]
    fn vision_requirement_filters_to_vision_capable_models() {
        let router = router();
        let request = Request::new(TaskKind::DesignReview, 5, "describe this image", UserTier::Agency)
            .requiring_vision();
        let candidates = router.candidate_models(&request);
        assert!(candidates.iter().all(|m| m.capability.vision_capable));
    }

    #[test]
    fn load_balancing_penalizes_overused_model() {
        let router = router();
        for _ in 0..25 {
            router.record_selection("deepseek-v3");
        }
        assert_eq!(router.load_balancing_factor("deepseek-v3"), 0.9);
    }

    #[test]
    fn performance_metrics_default_before_any_update() {
        let router = router();
        let metrics = router.metrics.read().unwrap();
        let default = metrics.get("deepseek-v3").copied().unwrap();
        assert_eq!(default.success_rate, 0.95);
        assert_eq!(default.avg_quality, 0.8);
    }

    #[test]
    fn recommendations_returns_up_to_three_models() {
        let router = router();
        let recs = router.recommendations(TaskKind::Analysis, UserTier::Business);
        assert!(recs.len() <= 3);
    }
}
