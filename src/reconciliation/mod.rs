pub mod eligibility;
pub mod engine;

pub use engine::{ReconciliationConfig, ReconciliationEngine};
