//! The model catalogue: a static, process-wide read-only table of every
//! model the broker can route to, its price, and its capabilities.

use std::collections::HashSet;

use crate::provider::types::TaskKind;

/// Quality tier a model is marketed/perceived at; feeds the router's
/// task-suitability score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    Basic,
    Good,
    High,
    Premium,
    Enterprise,
}

impl QualityTier {
    /// Bonus points added to a candidate's task-suitability score.
    pub fn suitability_bonus(&self) -> f64 {
        match self {
            Self::Basic => 0.0,
            Self::Good => 5.0,
            Self::High => 10.0,
            Self::Premium => 15.0,
            Self::Enterprise => 20.0,
        }
    }
}

/// Price per token for one model, in dollars per 1M tokens.
#[derive(Debug, Clone, Copy)]
pub struct ModelCost {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub image_cost: f64,
}

impl ModelCost {
    /// `(in_tokens/1e6)*in_price + (out_tokens/1e6)*out_price + images*image_price`
    pub fn price(&self, input_tokens: u64, output_tokens: u64, images: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_million
            + images as f64 * self.image_cost
    }
}

/// Static capability record for one model.
#[derive(Debug, Clone)]
pub struct ModelCapability {
    pub strengths: HashSet<TaskKind>,
    pub max_complexity: u8,
    pub context_window: u32,
    pub quality_tier: QualityTier,
    pub vision_capable: bool,
}

/// A fully specified catalogue entry.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub id: String,
    pub cost: ModelCost,
    pub capability: ModelCapability,
}

impl ModelSpec {
    pub fn price(&self, input_tokens: u64, output_tokens: u64, images: u64) -> f64 {
        self.cost.price(input_tokens, output_tokens, images)
    }

    pub fn handles(&self, task_kind: TaskKind) -> bool {
        self.capability.strengths.contains(&task_kind)
    }
}

fn strengths(kinds: &[TaskKind]) -> HashSet<TaskKind> {
    kinds.iter().copied().collect()
}

/// The process-wide model table. Immutable after construction; re-read
/// (reconstructed) only on process restart.
#[derive(Debug, Clone)]
pub struct ModelCatalogue {
    models: Vec<ModelSpec>,
}

impl Default for ModelCatalogue {
    fn default() -> Self {
        use TaskKind::*;

        let models = vec![
            ModelSpec {
                id: "deepseek-v3".to_string(),
                cost: ModelCost {
                    input_per_million: 0.14,
                    output_per_million: 0.28,
                    image_cost: 0.0,
                },
                capability: ModelCapability {
                    strengths: strengths(&[CodeGen, Analysis, Optimisation]),
                    max_complexity: 4,
                    context_window: 32_000,
                    quality_tier: QualityTier::Basic,
                    vision_capable: false,
                },
            },
            ModelSpec {
                id: "gemini-1.5-flash".to_string(),
                cost: ModelCost {
                    input_per_million: 0.075,
                    output_per_million: 0.30,
                    image_cost: 0.0,
                },
                capability: ModelCapability {
                    strengths: strengths(&[Summarisation, Translation, Content]),
                    max_complexity: 3,
                    context_window: 1_000_000,
                    quality_tier: QualityTier::Good,
                    vision_capable: false,
                },
            },
            ModelSpec {
                id: "gemini-1.5-pro".to_string(),
                cost: ModelCost {
                    input_per_million: 1.25,
                    output_per_million: 5.00,
                    image_cost: 0.0,
                },
                capability: ModelCapability {
                    strengths: strengths(&[Analysis, Optimisation, ComponentGen]),
                    max_complexity: 6,
                    context_window: 128_000,
                    quality_tier: QualityTier::High,
                    vision_capable: false,
                },
            },
            ModelSpec {
                id: "claude-3.5-sonnet".to_string(),
                cost: ModelCost {
                    input_per_million: 3.00,
                    output_per_million: 15.00,
                    image_cost: 0.0,
                },
                capability: ModelCapability {
                    strengths: strengths(&[Content, CampaignAnalysis, DesignReview]),
                    max_complexity: 8,
                    context_window: 200_000,
                    quality_tier: QualityTier::Premium,
                    vision_capable: false,
                },
            },
            ModelSpec {
                id: "gpt-4-turbo".to_string(),
                cost: ModelCost {
                    input_per_million: 10.00,
                    output_per_million: 30.00,
                    image_cost: 0.0,
                },
                capability: ModelCapability {
                    strengths: strengths(&[Analysis, DesignReview, CampaignAnalysis]),
                    max_complexity: 10,
                    context_window: 128_000,
                    quality_tier: QualityTier::Enterprise,
                    vision_capable: false,
                },
            },
            ModelSpec {
                id: "gpt-4-vision".to_string(),
                cost: ModelCost {
                    input_per_million: 10.00,
                    output_per_million: 30.00,
                    image_cost: 0.00765,
                },
                capability: ModelCapability {
                    strengths: strengths(&[Analysis, DesignReview, CampaignAnalysis]),
                    max_complexity: 10,
                    context_window: 128_000,
                    quality_tier: QualityTier::Enterprise,
                    vision_capable: true,
                },
            },
        ];

        Self { models }
    }
}

impl ModelCatalogue {
    /// All models, in catalogue insertion order — the order ties are
    /// broken by elsewhere in the router.
    pub fn models(&self) -> &[ModelSpec] {
        &self.models
    }

    pub fn get(&self, id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn price(&self, id: &str, input_tokens: u64, output_tokens: u64, images: u64) -> Option<f64> {
        self.get(id).map(|m| m.price(input_tokens, output_tokens, images))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_matches_the_weighted_formula() {
        let cost = ModelCost {
            input_per_million: 1.0,
            output_per_million: 2.0,
            image_cost: 0.5,
        };
        // 1_000_000 in @ $1/M = $1, 500_000 out @ $2/M = $1, 2 images @ $0.5 = $1
        assert!((cost.price(1_000_000, 500_000, 2) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn catalogue_has_all_six_models() {
        let catalogue = ModelCatalogue::default();
        assert_eq!(catalogue.models().len(), 6);
        assert!(catalogue.get("deepseek-v3").is_some());
        assert!(catalogue.get("gpt-4-vision").unwrap().capability.vision_capable);
    }

    #[test]
    fn unknown_model_price_is_none() {
        let catalogue = ModelCatalogue::default();
        assert!(catalogue.price("nonexistent", 1, 1, 0).is_none());
    }
}
