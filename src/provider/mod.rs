//! Provider clients: the polymorphic boundary the router/pipeline never
//! needs to know the concrete shape of. Every provider exposes the same
//! capability set — generate, estimate_cost, test_connection — over its
//! own wire format.

pub mod claude;
pub mod deepseek;
pub mod gemini;
pub mod openai;
pub mod types;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::provider::types::{Request, Response, TaskKind};

/// Builds the shared HTTP client each provider uses. Some sandboxed
/// environments panic during reqwest's default proxy auto-detection;
/// fall back to an explicit no-proxy client rather than propagate that.
pub(crate) fn build_http_client(timeout_secs: u64) -> Client {
    let timeout = StdDuration::from_secs(timeout_secs);
    match catch_unwind(AssertUnwindSafe(|| Client::builder().timeout(timeout).build())) {
        Ok(Ok(client)) => client,
        _ => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .expect("failed to construct HTTP client"),
    }
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// §4.A `generate(request, temperature, max_tokens) -> Response`.
    /// `None` for either lets the client fill in the task/complexity-based
    /// defaults itself.
    async fn generate(&self, request: &Request, temperature: Option<f64>, max_tokens: Option<u32>) -> Result<Response>;

    /// Cost estimate for `request` without making the call. Each
    /// provider tunes its own output-token multiplier per task kind;
    /// deliberately distinct from the router's own scoring estimate.
    fn estimate_cost(&self, request: &Request) -> f64;

    async fn test_connection(&self) -> Result<bool>;
}

/// `0.3` for code-shaped tasks (further scaled by `0.8` at low complexity),
/// `0.7` otherwise.
pub fn effective_temperature(task_kind: TaskKind, complexity: u8) -> f64 {
    let base = temperature_for(task_kind);
    if complexity <= 3 {
        base * 0.8
    } else {
        base
    }
}

/// `1000` for summarisation, `4000` for code-shaped tasks, otherwise
/// `min(4000, 2 * ceil(input_word_count * 1.3))`.
pub fn default_max_tokens(task_kind: TaskKind, content: &str) -> u32 {
    match task_kind {
        TaskKind::Summarisation => 1000,
        TaskKind::CodeGen | TaskKind::ComponentGen => 4000,
        _ => {
            let input_tokens = crate::provider::types::estimate_tokens(content);
            (2 * input_tokens).min(4000) as u32
        }
    }
}

/// Output-token multiplier per task kind for the `estimate_cost` ambient
/// helper (§3 of the expanded spec) — distinct from the router's own
/// scoring multiplier and from `default_max_tokens`'s request shaping.
pub fn estimate_cost_output_multiplier(task_kind: TaskKind) -> f64 {
    match task_kind {
        TaskKind::CodeGen => 2.5,
        TaskKind::ComponentGen => 3.0,
        TaskKind::Content => 2.0,
        TaskKind::Analysis => 1.5,
        TaskKind::Optimisation => 1.8,
        TaskKind::CampaignAnalysis => 2.2,
        _ => 1.5,
    }
}

/// Rate-limit bookkeeping shared by providers that report
/// remaining-count/reset-time via response headers (DeepSeek, Claude,
/// OpenAI). Gemini has its own [`LocalRateLimiter`] since it reports
/// neither.
pub(crate) struct HeaderRateLimiter {
    state: Mutex<HeaderRateLimitState>,
    threshold: i64,
    sleep_cap_secs: u64,
}

struct HeaderRateLimitState {
    remaining: i64,
    reset_at: Option<DateTime<Utc>>,
}

impl HeaderRateLimiter {
    pub(crate) fn new(sleep_cap_secs: u64) -> Self {
        Self {
            state: Mutex::new(HeaderRateLimitState {
                remaining: i64::MAX,
                reset_at: None,
            }),
            threshold: 5,
            sleep_cap_secs,
        }
    }

    /// Sleeps up to the reset instant (capped at `sleep_cap_secs`) when
    /// the remaining quota is at or below `threshold` and the reset
    /// instant is still in the future.
    pub(crate) async fn wait_if_needed(&self, provider: &str) {
        let wait = {
            let state = self.state.lock().await;
            if state.remaining > self.threshold {
                None
            } else {
                state.reset_at.and_then(|reset_at| {
                    let now = Utc::now();
                    if reset_at > now {
                        Some((reset_at - now).num_milliseconds().max(0) as u64)
                    } else {
                        None
                    }
                })
            }
        };
        if let Some(wait_ms) = wait {
            let capped_ms = wait_ms.min(self.sleep_cap_secs * 1000);
            tracing::warn!(provider, wait_ms = capped_ms, "rate limit approaching, sleeping");
            tokio::time::sleep(StdDuration::from_millis(capped_ms)).await;
        }
    }

    pub(crate) async fn update(&self, remaining: Option<i64>, reset_at: Option<DateTime<Utc>>) {
        let mut state = self.state.lock().await;
        if let Some(remaining) = remaining {
            state.remaining = remaining;
        }
        if reset_at.is_some() {
            state.reset_at = reset_at;
        }
    }
}

/// Local estimate-based rate limiting for providers (Gemini) whose
/// responses carry no rate-limit headers: decrement a local counter per
/// call and reset it once a minute.
pub(crate) struct LocalRateLimiter {
    state: Mutex<LocalRateLimitState>,
    per_minute: i64,
    sleep_cap_secs: u64,
}

struct LocalRateLimitState {
    remaining: i64,
    window_reset_at: DateTime<Utc>,
}

impl LocalRateLimiter {
    pub(crate) fn new(per_minute: i64, sleep_cap_secs: u64) -> Self {
        Self {
            state: Mutex::new(LocalRateLimitState {
                remaining: per_minute,
                window_reset_at: Utc::now() + Duration::minutes(1),
            }),
            per_minute,
            sleep_cap_secs,
        }
    }

    pub(crate) async fn wait_if_needed(&self, provider: &str) {
        let wait_ms = {
            let state = self.state.lock().await;
            if state.remaining > 3 {
                None
            } else {
                let now = Utc::now();
                if state.window_reset_at > now {
                    Some((state.window_reset_at - now).num_milliseconds().max(0) as u64)
                } else {
                    None
                }
            }
        };
        if let Some(wait_ms) = wait_ms {
            let capped_ms = wait_ms.min(self.sleep_cap_secs * 1000);
            tracing::warn!(provider, wait_ms = capped_ms, "rate limit approaching, sleeping");
            tokio::time::sleep(StdDuration::from_millis(capped_ms)).await;
        }
    }

    /// Decrements the local estimate after every call; resets to
    /// `per_minute` once the rolling window has elapsed.
    pub(crate) async fn record_call(&self) {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if now >= state.window_reset_at {
            state.remaining = self.per_minute;
            state.window_reset_at = now + Duration::minutes(1);
        }
        state.remaining = (state.remaining - 1).max(0);
    }
}

/// System prompt used for one task kind, shared across providers since
/// each asks the same question of the model: "what kind of expert
/// should answer this".
pub fn system_prompt_for(task_kind: TaskKind) -> &'static str {
    match task_kind {
        TaskKind::CodeGen => {
            "You are an expert React and TypeScript developer. Generate clean, \
             production-ready code that follows best practices. Always include proper \
             TypeScript types, use functional components with hooks, and ensure code is \
             accessible and performant."
        }
        TaskKind::ComponentGen => {
            "You are an expert frontend developer specializing in React components. \
             Create reusable, well-structured components with proper TypeScript types, \
             Tailwind CSS styling, and accessibility features. Focus on clean code and \
             modern React patterns."
        }
        TaskKind::Analysis => {
            "You are a senior technical analyst. Provide clear, actionable insights with \
             specific recommendations. Structure your analysis with key findings, \
             implications, and next steps."
        }
        TaskKind::Optimisation => {
            "You are a performance and code optimization expert. Identify bottlenecks, \
             suggest improvements, and provide specific implementation guidance. Focus on \
             measurable performance gains."
        }
        TaskKind::Content => {
            "You are a skilled technical writer. Create clear, engaging content that is \
             well-structured and easy to understand. Use proper formatting and maintain a \
             professional tone."
        }
        TaskKind::CampaignAnalysis => {
            "You are a digital marketing expert specializing in campaign optimization. \
             Analyze performance data, identify improvement opportunities, and provide \
             actionable recommendations with expected impact."
        }
        TaskKind::Summarisation => {
            "You are an expert at distilling long material into short, accurate \
             summaries. Preserve the key facts and omit everything else."
        }
        TaskKind::Translation => {
            "You are a professional translator. Preserve meaning, tone, and register; \
             do not add commentary."
        }
        TaskKind::DesignReview => {
            "You are a senior product designer reviewing a design for usability, \
             accessibility, and visual consistency. Give specific, actionable feedback."
        }
    }
}

/// `0.3` for code-shaped tasks, `0.7` otherwise — lower temperature
/// favours deterministic, syntactically valid output.
pub fn temperature_for(task_kind: TaskKind) -> f64 {
    match task_kind {
        TaskKind::CodeGen | TaskKind::ComponentGen => 0.3,
        _ => 0.7,
    }
}

/// Basic heuristic quality assessment shared by providers that don't
/// return their own quality signal: length, structural markers, and a
/// handful of task-specific content checks.
pub fn assess_quality(content: &str, task_kind: TaskKind) -> f64 {
    if content.trim().len() < 10 {
        return 0.1;
    }

    let mut score = 0.7;

    match task_kind {
        TaskKind::CodeGen | TaskKind::ComponentGen => {
            if content.contains("import") || content.contains("export") {
                score += 0.1;
            }
            if content.contains("function") || content.contains("const") || content.contains("=>") {
                score += 0.1;
            }
            if content.contains('{') && content.contains('}') {
                score += 0.05;
            }
        }
        TaskKind::Analysis => {
            let lower = content.to_lowercase();
            if ["findings", "recommendation", "analysis"].iter().any(|w| lower.contains(w)) {
                score += 0.1;
            }
            if content.matches('\n').count() > 3 {
                score += 0.05;
            }
        }
        _ => {}
    }

    if content.len() > 100 {
        score += 0.05;
    }
    if content.len() > 500 {
        score += 0.05;
    }

    score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_content_scores_minimally() {
        assert_eq!(assess_quality("hi", TaskKind::Content), 0.1);
    }

    #[test]
    fn code_with_structure_scores_above_base() {
        let content = "export function Button() { return <button>Click</button> }";
        assert!(assess_quality(content, TaskKind::CodeGen) > 0.7);
    }

    #[test]
    fn code_tasks_use_lower_temperature() {
        assert_eq!(temperature_for(TaskKind::CodeGen), 0.3);
        assert_eq!(temperature_for(TaskKind::Content), 0.7);
    }
}
