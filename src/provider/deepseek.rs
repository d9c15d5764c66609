//! DeepSeek V3 client: ultra-low-cost code generation and analysis.
//!
//! Wire format per spec §6.1: `POST {base}/chat/completions` with an
//! OpenAI-shaped chat body; `x-ratelimit-remaining`/`x-ratelimit-reset`
//! response headers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::provider::types::{estimate_tokens, Request, Response, TaskKind};
use crate::provider::{
    assess_quality, default_max_tokens, effective_temperature,
    estimate_cost_output_multiplier, system_prompt_for, HeaderRateLimiter, ProviderClient,
};
use crate::catalogue::ModelCost;

const MODEL_ID: &str = "deepseek-v3";
const WIRE_MODEL: &str = "deepseek-chat";

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    top_p: f64,
    frequency_penalty: f64,
    presence_penalty: f64,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

pub struct DeepSeekClient {
    http: Client,
    api_key: String,
    base_url: String,
    cost: ModelCost,
    rate_limiter: HeaderRateLimiter,
}

impl DeepSeekClient {
    /// `http` is the shared per-provider connection pool (§5: "one HTTP
    /// connection pool per provider").
    pub fn new(http: Client, api_key: impl Into<String>, base_url: impl Into<String>, sleep_cap_secs: u64) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into(),
            cost: ModelCost {
                input_per_million: 0.14,
                output_per_million: 0.28,
                image_cost: 0.0,
            },
            rate_limiter: HeaderRateLimiter::new(sleep_cap_secs),
        }
    }

    fn build_payload<'a>(&self, request: &'a Request, temperature: f64, max_tokens: u32) -> ChatRequest<'a> {
        ChatRequest {
            model: WIRE_MODEL,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt_for(request.task_kind),
                },
                ChatMessage {
                    role: "user",
                    content: &request.content,
                },
            ],
            temperature,
            max_tokens,
            top_p: 0.95,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stream: false,
        }
    }
}

#[async_trait]
impl ProviderClient for DeepSeekClient {
    fn name(&self) -> &'static str {
        "deepseek"
    }

    async fn generate(&self, request: &Request, temperature: Option<f64>, max_tokens: Option<u32>) -> Result<Response> {
        self.rate_limiter.wait_if_needed(self.name()).await;

        let temperature = temperature.unwrap_or_else(|| effective_temperature(request.task_kind, request.complexity));
        let max_tokens = max_tokens.unwrap_or_else(|| default_max_tokens(request.task_kind, &request.content));
        let payload = self.build_payload(request, temperature, max_tokens);

        let start = Utc::now();
        let url = format!("{}/chat/completions", self.base_url);
        let http_response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
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

        let body: ChatResponse = http_response.json().await.map_err(|e| Error::protocol(self.name(), e.to_string()))?;
        let choice = body.choices.into_iter().next().ok_or_else(|| Error::protocol(self.name(), "no choices in response"))?;
        let content = choice.message.content;

        let input_tokens = body
            .usage
            .as_ref()
            .filter(|u| u.prompt_tokens > 0)
            .map(|u| u.prompt_tokens)
            .unwrap_or_else(|| estimate_tokens(&request.content));
        let output_tokens = body
            .usage
            .as_ref()
            .filter(|u| u.completion_tokens > 0)
            .map(|u| u.completion_tokens)
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
        let probe = Request::new(TaskKind::Content, 1, "Say hello", crate::provider::types::UserTier::Free);
        self.generate(&probe, Some(0.1), Some(50)).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> DeepSeekClient {
        DeepSeekClient::new(Client::new(), "test-key", "https://api.deepseek.com/v1", 60)
    }

    #[test]
    fn payload_carries_the_fixed_sampling_parameters() {
        let client = client();
        let request = Request::new(TaskKind::CodeGen, 3, "write a sort function", crate::provider::types::UserTier::Free);
        let payload = client.build_payload(&request, 0.24, 4000);
        assert_eq!(payload.top_p, 0.95);
        assert_eq!(payload.frequency_penalty, 0.0);
        assert_eq!(payload.presence_penalty, 0.0);
        assert!(!payload.stream);
        assert_eq!(payload.messages.len(), 2);
    }

    #[test]
    fn estimate_cost_uses_the_code_gen_multiplier() {
        let client = client();
        let request = Request::new(TaskKind::CodeGen, 5, "one two three four five", crate::provider::types::UserTier::Free);
        let cost = client.estimate_cost(&request);
        assert!(cost > 0.0);
    }
}
