//! §4.F orchestration: cache → router → budget → provider → record →
//! fallback. Owns the provider-client registry and is the crate's single
//! public entry point for generating a response.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::FingerprintCache;
use crate::config::BrokerConfig;
use crate::cost::CostTracker;
use crate::error::{Error, Result};
use crate::kv::KeyValueStore;
use crate::provider::claude::ClaudeClient;
use crate::provider::deepseek::DeepSeekClient;
use crate::provider::gemini::GeminiClient;
use crate::provider::openai::OpenAiClient;
use crate::provider::types::{Request, Response};
use crate::provider::{build_http_client, ProviderClient};
use crate::router::Router;
use crate::store::UsageStore;

const CHEAPEST_MODEL: &str = "deepseek-v3";

fn build_provider_registry(config: &BrokerConfig) -> HashMap<String, Arc<dyn ProviderClient>> {
    let mut providers: HashMap<String, Arc<dyn ProviderClient>> = HashMap::new();
    let sleep_cap = config.rate_limit_sleep_cap_seconds;

    if let Some(endpoint) = config.endpoint("deepseek") {
        let http = build_http_client(endpoint.request_timeout_secs);
        let api_key = endpoint.api_key.clone().unwrap_or_default();
        providers.insert(
            "deepseek-v3".to_string(),
            Arc::new(DeepSeekClient::new(http, api_key, endpoint.base_url.clone(), sleep_cap)),
        );
    }
    if let Some(endpoint) = config.endpoint("gemini") {
        let http = build_http_client(endpoint.request_timeout_secs);
        let api_key = endpoint.api_key.clone().unwrap_or_default();
        providers.insert(
            "gemini-1.5-flash".to_string(),
            Arc::new(GeminiClient::flash(http.clone(), api_key.clone(), endpoint.base_url.clone(), sleep_cap)),
        );
        providers.insert(
            "gemini-1.5-pro".to_string(),
            Arc::new(GeminiClient::pro(http, api_key, endpoint.base_url.clone(), sleep_cap)),
        );
    }
    if let Some(endpoint) = config.endpoint("claude") {
        let http = build_http_client(endpoint.request_timeout_secs);
        let api_key = endpoint.api_key.clone().unwrap_or_default();
        providers.insert(
            "claude-3.5-sonnet".to_string(),
            Arc::new(ClaudeClient::new(http, api_key, endpoint.base_url.clone(), sleep_cap)),
        );
    }
    if let Some(endpoint) = config.endpoint("openai") {
        let http = build_http_client(endpoint.request_timeout_secs);
        let api_key = endpoint.api_key.clone().unwrap_or_default();
        providers.insert(
            "gpt-4-turbo".to_string(),
            Arc::new(OpenAiClient::turbo(http.clone(), api_key.clone(), endpoint.base_url.clone(), sleep_cap)),
        );
        providers.insert(
            "gpt-4-vision".to_string(),
            Arc::new(OpenAiClient::vision(http, api_key, endpoint.base_url.clone(), sleep_cap)),
        );
    }

    providers
}

/// Orchestrates a single request end to end. One instance is shared
/// across all concurrent pipelines in a process.
pub struct Pipeline {
    cache: Option<FingerprintCache>,
    router: Router,
    cost_tracker: CostTracker,
    providers: HashMap<String, Arc<dyn ProviderClient>>,
}

impl Pipeline {
    pub fn new(config: Arc<BrokerConfig>, kv: Arc<dyn KeyValueStore>, store: Arc<dyn UsageStore>) -> Self {
        let catalogue = crate::catalogue::ModelCatalogue::default();
        let router = Router::new(catalogue, config.history_window);
        let cache = Some(FingerprintCache::new(kv.clone(), config.cache_quality_floor));
        let cost_tracker = CostTracker::new(kv, store, config.clone());
        let providers = build_provider_registry(&config);

        Self { cache, router, cost_tracker, providers }
    }

    /// Runs the full §4.F state machine for `request` and returns the
    /// Response, recording cache hits, budget downgrades, and the
    /// degraded fallback path along the way.
    pub async fn process(&self, request: Request) -> Result<Response> {
        let user_id = request.user_id.clone();

        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.lookup(&request, user_id.as_deref()).await {
                tracing::info!(model = %cached.model, "cache hit");
                return Ok(cached);
            }
        }

        let selection = self.router.select(&request);
        let mut dispatch_request = request.clone();
        let mut model_id = selection.model.clone();

        if let Some(uid) = user_id.as_deref() {
            let check = self.cost_tracker.check(uid, request.user_tier, selection.estimated_cost).await?;
            if !check.can_proceed {
                let mut constrained = request.clone();
                constrained.complexity = constrained.complexity.saturating_sub(1).max(1);
                constrained.max_cost = Some(check.remaining_budget);

                let re_selection = self.router.select(&constrained);
                if re_selection.estimated_cost > check.remaining_budget {
                    return Err(Error::insufficient_budget(re_selection.estimated_cost, check.remaining_budget));
                }
                model_id = re_selection.model;
                dispatch_request = constrained;
            }
        }

        let provider = self
            .providers
            .get(&model_id)
            .ok_or_else(|| Error::protocol(&model_id, "no provider registered for this model"))?;

        let response = match provider.generate(&dispatch_request, None, None).await {
            Ok(response) => response,
            Err(err) if err.is_fallback_eligible() && dispatch_request.allow_fallback => {
                tracing::warn!(model = %model_id, error = %err, "provider failed, trying fallback");
                let mut fallback_request = dispatch_request.clone();
                fallback_request.complexity = fallback_request.complexity.min(3);
                fallback_request.requires_vision = false;

                let fallback_provider = self
                    .providers
                    .get(CHEAPEST_MODEL)
                    .ok_or_else(|| Error::protocol(CHEAPEST_MODEL, "no provider registered for fallback model"))?;
                match fallback_provider.generate(&fallback_request, None, None).await {
                    Ok(response) => response,
                    Err(fallback_err) => {
                        tracing::warn!(error = %fallback_err, "fallback also failed, surfacing original error");
                        return Err(err);
                    }
                }
            }
            Err(err) => return Err(err),
        };

        if let Some(uid) = user_id.as_deref() {
            let alert = self
                .cost_tracker
                .track(
                    uid,
                    request.user_tier,
                    &response.model,
                    request.task_kind.as_str(),
                    response.cost,
                    response.input_tokens,
                    response.output_tokens,
                )
                .await?;
            if let Some(alert) = alert {
                tracing::warn!(severity = ?alert.severity, message = %alert.message, "cost alert");
            }
        }

        self.router.update_performance_metrics(&response, None);

        if let Some(cache) = &self.cache {
            cache.store(&request, &response, user_id.as_deref()).await;
        }

        tracing::info!(model = %response.model, cost = response.cost, "pipeline complete");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKeyValueStore;
    use crate::provider::types::{TaskKind, UserTier};
    use crate::store::SqliteUsageStore;

    fn pipeline() -> Pipeline {
        Pipeline::new(
            Arc::new(BrokerConfig::default()),
            Arc::new(InMemoryKeyValueStore::new()),
            Arc::new(SqliteUsageStore::in_memory().unwrap()),
        )
    }

    #[test]
    fn registry_has_all_six_catalogue_models() {
        let pipeline = pipeline();
        for id in ["deepseek-v3", "gemini-1.5-flash", "gemini-1.5-pro", "claude-3.5-sonnet", "gpt-4-turbo", "gpt-4-vision"] {
            assert!(pipeline.providers.contains_key(id), "missing provider for {id}");
        }
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_before_selection() {
        let pipeline = pipeline();
        let request = Request::new(TaskKind::Analysis, 3, "analyze this quarterly report", UserTier::Business);
        let cached_response = Response {
            content: "cached analysis".to_string(),
            model: "gemini-1.5-pro".to_string(),
            input_tokens: 10,
            output_tokens: 20,
            cost: 0.01,
            quality_score: Some(0.9),
            processing_time_secs: 0.2,
            timestamp: chrono::Utc::now(),
            metadata: None,
        };
        pipeline.cache.as_ref().unwrap().store(&request, &cached_response, None).await;

        let response = pipeline.process(request).await.unwrap();
        assert_eq!(response.content, "cached analysis");
    }

    #[tokio::test]
    async fn budget_exhausted_user_without_fallback_fails_closed() {
        let pipeline = pipeline();
        pipeline
            .cost_tracker
            .track("broke-user", UserTier::Free, "deepseek-v3", "code_generation", 1.00, 100, 100)
            .await
            .unwrap();

        let request = Request::new(TaskKind::CampaignAnalysis, 9, "a".repeat(5000), UserTier::Free).with_user_id("broke-user");
        let outcome = pipeline.process(request).await;
        assert!(outcome.is_err());
    }
}
