//! In-memory audit provider for testing and single-process use
//!
//! Keeps the audit trail and alerts in process memory. Nothing survives a
//! restart, so production deployments should use a durable provider.

use super::{AlertMutation, AuditProvider, ProviderInfo};
use crate::error::{AuditError, Result};
use crate::types::{Alert, AlertDraft, AuditEvent, NewAuditEvent, WindowQuery};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Configuration for the in-memory provider
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    /// Artificial delay applied to every store call
    ///
    /// Lets tests exercise deadline handling without a real backend.
    pub latency: Duration,
}

/// In-memory audit provider
///
/// Events live in an id-ordered `Vec`; ids and timestamps are assigned
/// under the write lock so neither ever goes backwards.
pub struct MemoryProvider {
    events: RwLock<Vec<AuditEvent>>,
    alerts: RwLock<BTreeMap<u64, Alert>>,
    next_event_id: AtomicU64,
    next_alert_id: AtomicU64,
    offline: AtomicBool,
    clock_offset_ms: AtomicI64,
    config: MemoryConfig,
}

impl MemoryProvider {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            alerts: RwLock::new(BTreeMap::new()),
            next_event_id: AtomicU64::new(1),
            next_alert_id: AtomicU64::new(1),
            offline: AtomicBool::new(false),
            clock_offset_ms: AtomicI64::new(0),
            config,
        }
    }

    /// Simulate the store becoming unreachable (or reachable again)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Shift the provider clock forward, for replaying time-windowed scenarios
    pub fn advance_clock(&self, by: chrono::Duration) {
        self.clock_offset_ms
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(self.clock_offset_ms.load(Ordering::SeqCst))
    }

    async fn ready(&self) -> Result<()> {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(AuditError::StorageUnavailable(
                "memory provider is offline".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

#[async_trait]
impl AuditProvider for MemoryProvider {
    async fn append_event(&self, event: NewAuditEvent) -> Result<AuditEvent> {
        self.ready().await?;

        let mut events = self.events.write().await;
        let mut timestamp = self.now();
        if let Some(last) = events.last() {
            timestamp = timestamp.max(last.timestamp);
        }
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let event = event.into_event(id, timestamp);
        events.push(event.clone());

        tracing::debug!(event_id = id, action = %event.action, "Audit event appended");
        Ok(event)
    }

    async fn window(&self, query: &WindowQuery) -> Result<Vec<AuditEvent>> {
        self.ready().await?;

        let events = self.events.read().await;
        let mut matched: Vec<AuditEvent> = events
            .iter()
            .rev()
            .skip_while(|e| e.id > query.up_to_id)
            .take_while(|e| e.timestamp >= query.since)
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        matched.reverse();
        Ok(matched)
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        self.ready().await?;
        let events = self.events.read().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }

    async fn get_event(&self, id: u64) -> Result<Option<AuditEvent>> {
        self.ready().await?;
        let events = self.events.read().await;
        Ok(events
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|idx| events[idx].clone()))
    }

    async fn purge_events(&self) -> Result<u64> {
        self.ready().await?;
        let mut events = self.events.write().await;
        let count = events.len() as u64;
        events.clear();
        Ok(count)
    }

    async fn insert_alert(&self, draft: AlertDraft) -> Result<Alert> {
        self.ready().await?;

        let mut alerts = self.alerts.write().await;
        let id = self.next_alert_id.fetch_add(1, Ordering::SeqCst);
        let alert = draft.into_alert(id, self.now());
        alerts.insert(id, alert.clone());
        Ok(alert)
    }

    async fn get_alert(&self, id: u64) -> Result<Option<Alert>> {
        self.ready().await?;
        let alerts = self.alerts.read().await;
        Ok(alerts.get(&id).cloned())
    }

    async fn modify_alert(&self, id: u64, mutate: AlertMutation<'_>) -> Result<Alert> {
        self.ready().await?;

        let mut alerts = self.alerts.write().await;
        let stored = alerts
            .get_mut(&id)
            .ok_or_else(|| AuditError::NotFound(format!("Alert not found: {}", id)))?;

        let mut updated = stored.clone();
        mutate(&mut updated)?;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        self.ready().await?;
        let alerts = self.alerts.read().await;
        Ok(alerts.values().rev().take(limit).cloned().collect())
    }

    async fn delete_alert(&self, id: u64) -> Result<()> {
        self.ready().await?;
        let mut alerts = self.alerts.write().await;
        alerts
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AuditError::NotFound(format!("Alert not found: {}", id)))
    }

    async fn purge_alerts(&self) -> Result<u64> {
        self.ready().await?;
        let mut alerts = self.alerts.write().await;
        let count = alerts.len() as u64;
        alerts.clear();
        Ok(count)
    }

    async fn info(&self) -> Result<ProviderInfo> {
        self.ready().await?;
        Ok(ProviderInfo {
            provider: "memory".to_string(),
            events: self.events.read().await.len() as u64,
            alerts: self.alerts.read().await.len() as u64,
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
