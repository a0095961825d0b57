//! Degraded-evaluation log: rule runs that did not complete
//!
//! A rule that fails to evaluate, or an alert that fails to persist, must
//! never look like "no alert". Each such failure becomes a `RuleFailure`
//! that is returned to the caller and kept in a `FailureLog` for operators.

use crate::error::Result;
use crate::types::RuleId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// Where in the pipeline a rule run broke down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// The rule's window query or logic failed
    Evaluate,
    /// The rule fired but its alert could not be stored
    PersistAlert,
}

/// A rule run that did not complete for one audit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleFailure {
    /// Audit event being evaluated
    pub event_id: u64,

    pub rule_id: RuleId,

    pub stage: FailureStage,

    pub reason: String,

    pub failed_at: DateTime<Utc>,
}

impl RuleFailure {
    pub fn new(event_id: u64, rule_id: RuleId, stage: FailureStage, reason: impl Into<String>) -> Self {
        Self {
            event_id,
            rule_id,
            stage,
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Sink for degraded evaluations
#[async_trait]
pub trait FailureLog: Send + Sync {
    /// Record a failure
    async fn record(&self, failure: RuleFailure) -> Result<()>;

    /// Number of failures currently retained
    async fn count(&self) -> Result<usize>;

    /// Most recent failures, newest first
    async fn list(&self, limit: usize) -> Result<Vec<RuleFailure>>;
}

/// Bounded in-memory failure log
///
/// Oldest entries are drained once `capacity` is exceeded (0 = unbounded).
pub struct MemoryFailureLog {
    failures: RwLock<VecDeque<RuleFailure>>,
    capacity: usize,
}

impl MemoryFailureLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            failures: RwLock::new(VecDeque::new()),
            capacity,
        }
    }
}

impl Default for MemoryFailureLog {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[async_trait]
impl FailureLog for MemoryFailureLog {
    async fn record(&self, failure: RuleFailure) -> Result<()> {
        tracing::warn!(
            event_id = failure.event_id,
            rule_id = %failure.rule_id,
            stage = ?failure.stage,
            reason = %failure.reason,
            "Detection degraded"
        );

        let mut failures = self.failures.write().await;
        failures.push_back(failure);

        if self.capacity > 0 {
            while failures.len() > self.capacity {
                failures.pop_front();
            }
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.failures.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<RuleFailure>> {
        let failures = self.failures.read().await;
        Ok(failures.iter().rev().take(limit).cloned().collect())
    }
}
