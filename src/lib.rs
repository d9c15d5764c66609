//! Cost-aware AI request broker: routes generation requests across
//! providers, deduplicates via a fingerprint cache, and enforces
//! per-tier monthly spending budgets.
//!
//! ## Core Components
//!
//! - **Catalogue**: the static table of routable models and their prices
//! - **Router**: scores candidates and picks one, with fallbacks
//! - **Cache**: exact and fuzzy request deduplication
//! - **Cost Tracker**: real-time budget enforcement and alerts
//! - **Pipeline**: orchestrates the above plus the provider clients
//!
//! ## Example
//!
//! ```rust,ignore
//! use ai_broker_core::{BrokerConfig, InMemoryKeyValueStore, Pipeline, Request, SqliteUsageStore, TaskKind, UserTier};
//! use std::sync::Arc;
//!
//! # async fn run() -> ai_broker_core::Result<()> {
//! let config = Arc::new(BrokerConfig::default());
//! let kv = Arc::new(InMemoryKeyValueStore::new());
//! let store = Arc::new(SqliteUsageStore::in_memory()?);
//! let pipeline = Pipeline::new(config, kv, store);
//!
//! let request = Request::new(TaskKind::CodeGen, 4, "write a quicksort", UserTier::Creator)
//!     .with_user_id("user-1");
//! let response = pipeline.process(request).await?;
//! println!("{} answered via {}", response.content, response.model);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod catalogue;
pub mod config;
pub mod cost;
pub mod error;
pub mod kv;
pub mod pipeline;
pub mod provider;
pub mod router;
pub mod store;

pub use cache::{CacheEntry, CacheTaskConfig, FingerprintCache, OptimiseReport, Statistics};
pub use catalogue::{ModelCapability, ModelCatalogue, ModelCost, ModelSpec, QualityTier};
pub use config::{AlertThresholds, BrokerConfig, ProviderEndpoint};
pub use cost::{AlertSeverity, BudgetCheck, BudgetStatus, CostAlert, CostTracker, UsageSummary};
pub use error::{Error, Result};
pub use kv::{InMemoryKeyValueStore, KeyValueStore};
pub use pipeline::Pipeline;
pub use provider::types::{Request, Response, Selection, TaskKind, UserTier};
pub use provider::ProviderClient;
pub use router::{PerformanceMetrics, Router, SelectionAnalytics};
pub use store::{SqliteUsageStore, UsageRecord, UsageStore};
