//! Audit store provider trait, the core abstraction for durable backends
//!
//! All storage backends (NATS JetStream, in-memory, etc.) implement
//! `AuditProvider` to give the recorder, rule engine, and alert store a
//! uniform append/query/mutate API.

use crate::error::{AuditError, Result};
use crate::types::{Alert, AlertDraft, AuditEvent, NewAuditEvent, WindowQuery};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

pub mod memory;
pub mod nats;

/// Mutation applied to an alert inside an atomic read-modify-write
///
/// Returning an error aborts the update and leaves the stored alert untouched.
pub type AlertMutation<'a> = &'a (dyn Fn(&mut Alert) -> Result<()> + Send + Sync);

/// Core trait for durable audit/alert backends
///
/// Implementations own id and timestamp assignment. An appended event must
/// be visible to `window` queries issued after `append_event` returns.
#[async_trait]
pub trait AuditProvider: Send + Sync {
    /// Durably append an audit event, assigning its id and timestamp
    async fn append_event(&self, event: NewAuditEvent) -> Result<AuditEvent>;

    /// Events matching a backward-looking window query, oldest first
    async fn window(&self, query: &WindowQuery) -> Result<Vec<AuditEvent>>;

    /// Most recent audit events, newest first
    async fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>>;

    /// Look up a single audit event by id
    async fn get_event(&self, id: u64) -> Result<Option<AuditEvent>>;

    /// Remove every audit event, returning how many were removed
    async fn purge_events(&self) -> Result<u64>;

    /// Persist a new alert, assigning its id and creation time
    async fn insert_alert(&self, draft: AlertDraft) -> Result<Alert>;

    /// Look up a single alert by id
    async fn get_alert(&self, id: u64) -> Result<Option<Alert>>;

    /// Atomically read, mutate, and write back an alert
    ///
    /// Fails with `NotFound` if the alert is absent. Concurrent callers
    /// never observe a lost update.
    async fn modify_alert(&self, id: u64, mutate: AlertMutation<'_>) -> Result<Alert>;

    /// Most recent alerts, newest first
    async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>>;

    /// Delete a single alert; `NotFound` if absent
    async fn delete_alert(&self, id: u64) -> Result<()>;

    /// Remove every alert, returning how many were removed
    async fn purge_alerts(&self) -> Result<u64>;

    /// Get provider info (record counts)
    async fn info(&self) -> Result<ProviderInfo>;

    /// Provider name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Health check, returns true if the provider is reachable
    ///
    /// Default implementation delegates to `info()`.
    async fn health(&self) -> Result<bool> {
        self.info().await.map(|_| true)
    }
}

/// Provider status information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    /// Provider name
    pub provider: String,
    /// Audit events currently stored
    pub events: u64,
    /// Alerts currently stored
    pub alerts: u64,
}

/// Run a store round trip under a deadline
///
/// An elapsed deadline is reported as `StorageUnavailable`, same as a
/// backend failure.
pub(crate) async fn with_deadline<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(AuditError::StorageUnavailable(format!(
            "{} timed out after {}ms",
            operation,
            timeout.as_millis()
        ))),
    }
}
