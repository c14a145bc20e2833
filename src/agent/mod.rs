//! Agent Orchestration
//!
//! Turns stored anomaly records into actionable recommendations: builds
//! context, runs the rule engine, and persists the result with at-most-one
//! recommendation per anomaly.

pub mod rule_engine;
mod service;

pub use rule_engine::{RuleEngine, RuleOutcome};
pub use service::{AgentError, AgentService, ProcessSummary};
