//! NATS JetStream audit provider
//!
//! Implements `AuditProvider` on JetStream: a file-backed stream holds the
//! append-only audit trail and a key-value bucket holds alerts.

mod client;
mod config;

pub use client::{NatsClient, StreamInfo};
pub use config::{NatsConfig, StorageType};

use crate::error::Result;
use crate::provider::{AlertMutation, AuditProvider, ProviderInfo};
use crate::types::{Alert, AlertDraft, AuditEvent, NewAuditEvent, WindowQuery};
use async_trait::async_trait;

/// NATS JetStream audit provider
///
/// Wraps `NatsClient` and implements the `AuditProvider` trait.
pub struct NatsProvider {
    client: NatsClient,
}

impl NatsProvider {
    /// Connect to NATS and initialize the stream and alert bucket
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl AuditProvider for NatsProvider {
    async fn append_event(&self, event: NewAuditEvent) -> Result<AuditEvent> {
        self.client.append_event(event).await
    }

    async fn window(&self, query: &WindowQuery) -> Result<Vec<AuditEvent>> {
        self.client.window(query).await
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        self.client.recent_events(limit).await
    }

    async fn get_event(&self, id: u64) -> Result<Option<AuditEvent>> {
        self.client.get_event(id).await
    }

    async fn purge_events(&self) -> Result<u64> {
        self.client.purge_events().await
    }

    async fn insert_alert(&self, draft: AlertDraft) -> Result<Alert> {
        self.client.insert_alert(draft).await
    }

    async fn get_alert(&self, id: u64) -> Result<Option<Alert>> {
        self.client.get_alert(id).await
    }

    async fn modify_alert(&self, id: u64, mutate: AlertMutation<'_>) -> Result<Alert> {
        self.client.modify_alert(id, mutate).await
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        self.client.recent_alerts(limit).await
    }

    async fn delete_alert(&self, id: u64) -> Result<()> {
        self.client.delete_alert(id).await
    }

    async fn purge_alerts(&self) -> Result<u64> {
        self.client.purge_alerts().await
    }

    async fn info(&self) -> Result<ProviderInfo> {
        let stream = self.client.stream_info().await?;
        Ok(ProviderInfo {
            provider: "nats".to_string(),
            events: stream.messages,
            alerts: self.client.alert_count().await?,
        })
    }

    fn name(&self) -> &str {
        "nats"
    }
}
