//! Google Gemini client: one instance per model variant (flash/pro),
//! sharing one per-provider HTTP connection pool.
//!
//! Wire format per spec §6.1: `POST {base}/models/{variant}:generateContent?key={k}`;
//! Gemini reports no rate-limit headers, so rate limiting falls back to a
//! local per-minute estimate.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::catalogue::ModelCost;
use crate::error::{Error, Result};
use crate::provider::types::{estimate_tokens, Request, Response, TaskKind, UserTier};
use crate::provider::{default_max_tokens, effective_temperature, estimate_cost_output_multiplier, system_prompt_for, LocalRateLimiter, ProviderClient};

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "topP")]
    top_p: f64,
    #[serde(rename = "topK")]
    top_k: u32,
    #[serde(rename = "candidateCount")]
    candidate_count: u32,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(rename = "safetySettings")]
    safety_settings: Vec<SafetySetting>,
}

fn safety_settings() -> Vec<SafetySetting> {
    const CATEGORIES: &[&str] = &[
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ];
    CATEGORIES
        .iter()
        .map(|category| SafetySetting {
            category,
            threshold: "BLOCK_MEDIUM_AND_ABOVE",
        })
        .collect()
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<PartOut>,
}

#[derive(Deserialize)]
struct PartOut {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct UsageMetadata {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: u64,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: u64,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

pub struct GeminiClient {
    http: Client,
    api_key: String,
    base_url: String,
    variant: &'static str,
    model_id: &'static str,
    cost: ModelCost,
    rate_limiter: LocalRateLimiter,
}

impl GeminiClient {
    pub fn flash(http: Client, api_key: impl Into<String>, base_url: impl Into<String>, sleep_cap_secs: u64) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into(),
            variant: "gemini-1.5-flash",
            model_id: "gemini-1.5-flash",
            cost: ModelCost {
                input_per_million: 0.075,
                output_per_million: 0.30,
                image_cost: 0.0,
            },
            rate_limiter: LocalRateLimiter::new(60, sleep_cap_secs),
        }
    }

    pub fn pro(http: Client, api_key: impl Into<String>, base_url: impl Into<String>, sleep_cap_secs: u64) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into(),
            variant: "gemini-1.5-pro",
            model_id: "gemini-1.5-pro",
            cost: ModelCost {
                input_per_million: 1.25,
                output_per_million: 5.00,
                image_cost: 0.0,
            },
            rate_limiter: LocalRateLimiter::new(60, sleep_cap_secs),
        }
    }

    fn build_payload<'a>(&self, request: &'a Request, temperature: f64, max_tokens: Option<u32>) -> GenerateRequest<'a> {
        GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: &request.content }],
            }],
            generation_config: GenerationConfig {
                temperature,
                top_p: 0.95,
                top_k: 40,
                candidate_count: 1,
                max_output_tokens: max_tokens,
            },
            safety_settings: safety_settings(),
        }
    }

    /// Gemini's own quality heuristic, distinct from the shared
    /// `assess_quality` helper other providers use — it checks for
    /// formatting markers and paragraph breaks rather than the generic
    /// structural signals.
    fn assess_quality(&self, content: &str, task_kind: TaskKind) -> f64 {
        if content.trim().len() < 10 {
            return 0.1;
        }
        let mut score = 0.75;

        match task_kind {
            TaskKind::CodeGen | TaskKind::ComponentGen => {
                if ["import", "export", "function", "const", "=>"].iter().any(|p| content.contains(p)) {
                    score += 0.1;
                }
                if content.contains("interface") || content.contains(": ") {
                    score += 0.05;
                }
                if content.contains("className") {
                    score += 0.05;
                }
            }
            TaskKind::Content => {
                if content.matches("\n\n").count() > 1 {
                    score += 0.1;
                }
                if ["##", "**", "1.", "-"].iter().any(|m| content.contains(m)) {
                    score += 0.05;
                }
            }
            TaskKind::Analysis => {
                let lower = content.to_lowercase();
                if ["analysis", "findings", "recommendation", "conclusion"].iter().any(|w| lower.contains(w)) {
                    score += 0.1;
                }
                if content.matches('\n').count() > 5 {
                    score += 0.05;
                }
            }
            _ => {}
        }

        if content.len() > 200 {
            score += 0.05;
        }
        if content.len() > 1000 {
            score += 0.05;
        }
        if content.ends_with(['.', '!', '?', '}']) || content.ends_with("```") || content.ends_with(");") {
            score += 0.05;
        }

        score.min(1.0)
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate(&self, request: &Request, temperature: Option<f64>, max_tokens: Option<u32>) -> Result<Response> {
        self.rate_limiter.wait_if_needed(self.name()).await;

        let prompt = format!(
            "{}\n\nUser Request: {}\n\nPlease provide a comprehensive response that directly addresses the user's request while following the guidelines above.",
            system_prompt_for(request.task_kind),
            request.content
        );
        let request_with_prompt = Request {
            content: prompt,
            ..request.clone()
        };
        let temperature = temperature.unwrap_or_else(|| effective_temperature(request.task_kind, request.complexity));
        let max_tokens = max_tokens.or_else(|| Some(default_max_tokens(request.task_kind, &request.content)));
        let payload = self.build_payload(&request_with_prompt, temperature, max_tokens);

        let start = Utc::now();
        let url = format!("{}/models/{}:generateContent", self.base_url, self.variant);
        let http_response = self.http.post(&url).query(&[("key", &self.api_key)]).json(&payload).send().await?;
        self.rate_limiter.record_call().await;

        let status = http_response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = http_response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(Error::rate_limited(self.name(), retry_after));
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::invalid_credentials(self.name()));
        }
        if status == StatusCode::BAD_REQUEST {
            let detail = http_response
                .json::<ErrorBody>()
                .await
                .map(|b| b.error.message)
                .unwrap_or_else(|_| "bad request".to_string());
            return Err(Error::bad_request(self.name(), detail));
        }
        if !status.is_success() {
            return Err(Error::protocol(self.name(), format!("unexpected status {status}")));
        }

        let body: GenerateResponse = http_response.json().await.map_err(|e| Error::protocol(self.name(), e.to_string()))?;
        let candidate = body.candidates.into_iter().next().ok_or_else(|| Error::protocol(self.name(), "no candidates in response"))?;
        let content = candidate
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect::<Vec<_>>().join(""))
            .unwrap_or_default();
        if content.is_empty() {
            return Err(Error::protocol(self.name(), "empty content in response"));
        }

        let input_tokens = body
            .usage_metadata
            .as_ref()
            .filter(|u| u.prompt_token_count > 0)
            .map(|u| u.prompt_token_count)
            .unwrap_or_else(|| estimate_tokens(&request.content));
        let output_tokens = body
            .usage_metadata
            .as_ref()
            .filter(|u| u.candidates_token_count > 0)
            .map(|u| u.candidates_token_count)
            .unwrap_or_else(|| estimate_tokens(&content));

        let cost = self.cost.price(input_tokens, output_tokens, 0);
        let processing_time_secs = (Utc::now() - start).num_milliseconds() as f64 / 1000.0;
        let mut quality_score = self.assess_quality(&content, request.task_kind);
        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            tracing::warn!(model = self.model_id, "response blocked by safety filters");
            quality_score *= 0.5;
        }

        Ok(Response {
            content,
            model: self.model_id.to_string(),
            input_tokens,
            output_tokens,
            cost,
            quality_score: Some(quality_score),
            processing_time_secs,
            timestamp: Utc::now(),
            metadata: None,
        })
    }

    fn estimate_cost(&self, request: &Request) -> f64 {
        let input_tokens = estimate_tokens(&request.content);
        let output_tokens = (input_tokens as f64 * estimate_cost_output_multiplier(request.task_kind)) as u64;
        self.cost.price(input_tokens, output_tokens, 0)
    }

    async fn test_connection(&self) -> Result<bool> {
        let probe = Request::new(TaskKind::Content, 1, "Say hello and introduce yourself briefly", UserTier::Free);
        self.generate(&probe, Some(0.1), None).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_and_pro_price_differently() {
        let flash = GeminiClient::flash(Client::new(), "k", "https://example.invalid", 60);
        let pro = GeminiClient::pro(Client::new(), "k", "https://example.invalid", 60);
        assert!(flash.cost.input_per_million < pro.cost.input_per_million);
    }

    #[test]
    fn quality_heuristic_rewards_structured_content() {
        let flash = GeminiClient::flash(Client::new(), "k", "https://example.invalid", 60);
        let plain = flash.assess_quality("a short reply", TaskKind::Content);
        let structured = flash.assess_quality(
            "## Summary\n\nThis has multiple paragraphs.\n\nAnd a second one with **bold** text and plenty more to say here.",
            TaskKind::Content,
        );
        assert!(structured > plain);
    }

    #[test]
    fn empty_content_scores_minimally() {
        let flash = GeminiClient::flash(Client::new(), "k", "https://example.invalid", 60);
        assert_eq!(flash.assess_quality("  ", TaskKind::Analysis), 0.1);
    }
}
