//! Anthropic Claude client: the premium-tier model for content, campaign
//! analysis, and design review.
//!
//! Wire format per spec §6.1: `POST {base}/v1/messages` with Anthropic's
//! `x-api-key`/`anthropic-version` headers and a `system` field separate
//! from the message list; `x-ratelimit-remaining`/`x-ratelimit-reset`
//! response headers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::catalogue::ModelCost;
use crate::error::{Error, Result};
use crate::provider::types::{estimate_tokens, Request, Response, TaskKind, UserTier};
use crate::provider::{
    assess_quality, default_max_tokens, effective_temperature, estimate_cost_output_multiplier,
    system_prompt_for, HeaderRateLimiter, ProviderClient,
};

const MODEL_ID: &str = "claude-3.5-sonnet";
const WIRE_MODEL: &str = "claude-3-5-sonnet-20241022";
const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    max_tokens: u32,
    system: &'a str,
    temperature: f64,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

pub struct ClaudeClient {
    http: Client,
    api_key: String,
    base_url: String,
    cost: ModelCost,
    rate_limiter: HeaderRateLimiter,
}

impl ClaudeClient {
    pub fn new(http: Client, api_key: impl Into<String>, base_url: impl Into<String>, sleep_cap_secs: u64) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into(),
            cost: ModelCost {
                input_per_million: 3.00,
                output_per_million: 15.00,
                image_cost: 0.0,
            },
            rate_limiter: HeaderRateLimiter::new(sleep_cap_secs),
        }
    }

    fn build_payload<'a>(&self, request: &'a Request, temperature: f64, max_tokens: u32) -> MessagesRequest<'a> {
        MessagesRequest {
            model: WIRE_MODEL,
            messages: vec![AnthropicMessage {
                role: "user",
                content: &request.content,
            }],
            max_tokens,
            system: system_prompt_for(request.task_kind),
            temperature,
        }
    }
}

#[async_trait]
impl ProviderClient for ClaudeClient {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn generate(&self, request: &Request, temperature: Option<f64>, max_tokens: Option<u32>) -> Result<Response> {
        self.rate_limiter.wait_if_needed(self.name()).await;

        let temperature = temperature.unwrap_or_else(|| effective_temperature(request.task_kind, request.complexity));
        let max_tokens = max_tokens.unwrap_or_else(|| default_max_tokens(request.task_kind, &request.content));
        let payload = self.build_payload(request, temperature, max_tokens);

        let start = Utc::now();
        let url = format!("{}/v1/messages", self.base_url);
        let http_response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .send()
            .await?;

        let status = http_response.status();
        let remaining = http_response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        let reset_at = http_response
            .headers()
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
        self.rate_limiter.update(remaining, reset_at).await;

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

        let body: MessagesResponse = http_response.json().await.map_err(|e| Error::protocol(self.name(), e.to_string()))?;
        let content = body.content.into_iter().filter_map(|b| b.text).collect::<Vec<_>>().join("");
        if content.is_empty() {
            return Err(Error::protocol(self.name(), "empty content in response"));
        }

        let input_tokens = body
            .usage
            .as_ref()
            .filter(|u| u.input_tokens > 0)
            .map(|u| u.input_tokens)
            .unwrap_or_else(|| estimate_tokens(&request.content));
        let output_tokens = body
            .usage
            .as_ref()
            .filter(|u| u.output_tokens > 0)
            .map(|u| u.output_tokens)
            .unwrap_or_else(|| estimate_tokens(&content));

        let cost = self.cost.price(input_tokens, output_tokens, 0);
        let processing_time_secs = (Utc::now() - start).num_milliseconds() as f64 / 1000.0;
        let quality_score = assess_quality(&content, request.task_kind);

        Ok(Response {
            content,
            model: MODEL_ID.to_string(),
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
        let probe = Request::new(TaskKind::Content, 1, "Say hello", UserTier::Free);
        self.generate(&probe, Some(0.1), Some(50)).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClaudeClient {
        ClaudeClient::new(Client::new(), "test-key", "https://api.anthropic.com", 60)
    }

    #[test]
    fn payload_splits_system_from_messages() {
        let client = client();
        let request = Request::new(TaskKind::Content, 4, "draft a blog post", UserTier::Business);
        let payload = client.build_payload(&request, 0.56, 2000);
        assert_eq!(payload.messages.len(), 1);
        assert_eq!(payload.messages[0].role, "user");
        assert!(!payload.system.is_empty());
    }

    #[test]
    fn estimate_cost_is_positive_for_premium_model() {
        let client = client();
        let request = Request::new(TaskKind::CampaignAnalysis, 6, "analyze this campaign's results", UserTier::Agency);
        assert!(client.estimate_cost(&request) > 0.0);
    }
}
