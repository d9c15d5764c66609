//! OpenAI client: two catalogue variants (gpt-4-turbo, gpt-4-vision)
//! sharing one per-provider HTTP connection pool.
//!
//! Wire format per spec §6.1: `POST {base}/v1/chat/completions` with a
//! standard OpenAI chat body; `x-ratelimit-remaining`/`x-ratelimit-reset`
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

pub struct OpenAiClient {
    http: Client,
    api_key: String,
    base_url: String,
    wire_model: &'static str,
    model_id: &'static str,
    vision: bool,
    cost: ModelCost,
    rate_limiter: HeaderRateLimiter,
}

impl OpenAiClient {
    pub fn turbo(http: Client, api_key: impl Into<String>, base_url: impl Into<String>, sleep_cap_secs: u64) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into(),
            wire_model: "gpt-4-turbo",
            model_id: "gpt-4-turbo",
            vision: false,
            cost: ModelCost {
                input_per_million: 10.00,
                output_per_million: 30.00,
                image_cost: 0.0,
            },
            rate_limiter: HeaderRateLimiter::new(sleep_cap_secs),
        }
    }

    pub fn vision(http: Client, api_key: impl Into<String>, base_url: impl Into<String>, sleep_cap_secs: u64) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into(),
            wire_model: "gpt-4-vision-preview",
            model_id: "gpt-4-vision",
            vision: true,
            cost: ModelCost {
                input_per_million: 10.00,
                output_per_million: 30.00,
                image_cost: 0.00765,
            },
            rate_limiter: HeaderRateLimiter::new(sleep_cap_secs),
        }
    }

    fn check_vision_support(&self, request: &Request) -> Result<()> {
        if request.requires_vision && !self.vision {
            return Err(Error::bad_request(self.name(), "model does not support vision input"));
        }
        Ok(())
    }

    fn build_payload<'a>(&self, request: &'a Request, temperature: f64, max_tokens: u32) -> ChatRequest<'a> {
        ChatRequest {
            model: self.wire_model,
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
        }
    }
}

#[async_trait]
impl ProviderClient for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate(&self, request: &Request, temperature: Option<f64>, max_tokens: Option<u32>) -> Result<Response> {
        self.check_vision_support(request)?;

        self.rate_limiter.wait_if_needed(self.name()).await;

        let temperature = temperature.unwrap_or_else(|| effective_temperature(request.task_kind, request.complexity));
        let max_tokens = max_tokens.unwrap_or_else(|| default_max_tokens(request.task_kind, &request.content));
        let payload = self.build_payload(request, temperature, max_tokens);

        let start = Utc::now();
        let url = format!("{}/v1/chat/completions", self.base_url);
        let http_response = self.http.post(&url).bearer_auth(&self.api_key).json(&payload).send().await?;

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

        let images = if request.requires_vision { 1 } else { 0 };
        let cost = self.cost.price(input_tokens, output_tokens, images);
        let processing_time_secs = (Utc::now() - start).num_milliseconds() as f64 / 1000.0;
        let quality_score = assess_quality(&content, request.task_kind);

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
        let images = if request.requires_vision { 1 } else { 0 };
        self.cost.price(input_tokens, output_tokens, images)
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

    #[test]
    fn turbo_rejects_vision_requests() {
        let turbo = OpenAiClient::turbo(Client::new(), "k", "https://api.openai.com", 60);
        let request = Request::new(TaskKind::DesignReview, 5, "review this mockup", UserTier::Agency).requiring_vision();
        assert!(turbo.check_vision_support(&request).is_err());
    }

    #[test]
    fn vision_variant_accepts_vision_requests() {
        let vision = OpenAiClient::vision(Client::new(), "k", "https://api.openai.com", 60);
        let request = Request::new(TaskKind::DesignReview, 5, "review this mockup", UserTier::Agency).requiring_vision();
        assert!(vision.check_vision_support(&request).is_ok());
    }

    #[test]
    fn vision_variant_prices_images() {
        let vision = OpenAiClient::vision(Client::new(), "k", "https://api.openai.com", 60);
        let with_image = vision.cost.price(100, 100, 1);
        let without_image = vision.cost.price(100, 100, 0);
        assert!(with_image > without_image);
    }
}
