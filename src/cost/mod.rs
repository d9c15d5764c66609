//! Cost tracking and budget enforcement.

mod tracker;

pub use tracker::{
    AlertSeverity, BudgetCheck, BudgetStatus, CostAlert, CostTracker, UsageSummary,
};
