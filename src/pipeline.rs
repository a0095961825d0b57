//! Ingestion pipeline, the single entry point for security-relevant actions
//!
//! `AuditPipeline::report` records an event, runs every detection rule
//! against it, and persists any resulting alerts before returning. There
//! is no queue: once `report` returns, its alerts are queryable.

use crate::alerts::{AlertStore, Escalation, Triage};
use crate::config::SentinelConfig;
use crate::detection::DetectionEngine;
use crate::error::{AuditError, Result};
use crate::failures::{FailureLog, FailureStage, MemoryFailureLog, RuleFailure};
use crate::provider::{with_deadline, AuditProvider, ProviderInfo};
use crate::types::{
    actions, Alert, AuditEvent, NewAuditEvent, Outcome, RequestContext,
};
use std::sync::Arc;
use std::time::Duration;

/// Everything that came out of reporting one event
#[derive(Debug, Clone, PartialEq)]
pub struct Ingested {
    /// The committed audit record
    pub event: AuditEvent,

    /// Alerts raised by this event, in rule order
    pub alerts: Vec<Alert>,

    /// Rules that could not evaluate or whose alert could not be stored
    pub degraded: Vec<RuleFailure>,
}

impl Ingested {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Audit recorder, rule engine, and alert store wired to one provider
///
/// `Send + Sync`; share it behind an `Arc`. Every call runs on the
/// caller's task.
pub struct AuditPipeline {
    provider: Arc<dyn AuditProvider>,
    engine: DetectionEngine,
    alerts: AlertStore,
    failures: Arc<dyn FailureLog>,
    config: SentinelConfig,
}

impl AuditPipeline {
    /// Create a pipeline over `provider`
    pub fn new(provider: Arc<dyn AuditProvider>, config: SentinelConfig) -> Result<Self> {
        config.validate()?;

        let failures: Arc<dyn FailureLog> =
            Arc::new(MemoryFailureLog::new(config.failure_log_capacity));

        tracing::info!(
            provider = provider.name(),
            store_timeout_ms = config.store_timeout_ms,
            page_limit = config.page_limit,
            "Audit pipeline ready"
        );

        Ok(Self {
            engine: DetectionEngine::new(config.store_timeout()),
            alerts: AlertStore::new(provider.clone(), &config),
            provider,
            failures,
            config,
        })
    }

    /// Replace the in-memory failure log
    pub fn with_failure_log(mut self, failures: Arc<dyn FailureLog>) -> Self {
        self.failures = failures;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    /// Direct access to the alert store
    pub fn alert_store(&self) -> &AlertStore {
        &self.alerts
    }

    fn timeout(&self) -> Duration {
        self.config.store_timeout()
    }

    /// Record an event and evaluate it
    ///
    /// Fails only if the audit record itself cannot be committed. Rule and
    /// alert persistence problems come back in `Ingested::degraded`.
    pub async fn report(&self, event: NewAuditEvent) -> Result<Ingested> {
        event.validate()?;

        let event = with_deadline(
            self.timeout(),
            "append audit event",
            self.provider.append_event(event),
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Audit record not committed");
            e
        })?;

        tracing::debug!(
            event_id = event.id,
            action = %event.action,
            result = %event.result.as_str(),
            "Audit event recorded"
        );

        let evaluation = self.engine.evaluate(&event, self.provider.as_ref()).await;
        let mut degraded = evaluation.failures;
        let mut alerts = Vec::with_capacity(evaluation.drafts.len());

        for draft in evaluation.drafts {
            let rule_id = draft.rule_id;
            match self.alerts.emit(draft).await {
                Ok(alert) => alerts.push(alert),
                Err(e) => degraded.push(RuleFailure::new(
                    event.id,
                    rule_id,
                    FailureStage::PersistAlert,
                    e.to_string(),
                )),
            }
        }

        for failure in &degraded {
            if let Err(e) = self.failures.record(failure.clone()).await {
                tracing::warn!(event_id = event.id, error = %e, "Failed to record degraded evaluation");
            }
        }

        Ok(Ingested {
            event,
            alerts,
            degraded,
        })
    }

    /// Most recent audit events, newest first
    pub async fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let limit = self.config.clamp_page(limit);
        with_deadline(self.timeout(), "list events", self.provider.recent_events(limit)).await
    }

    /// Most recent alerts, newest first
    pub async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        self.alerts.list(limit).await
    }

    pub async fn alert(&self, alert_id: u64) -> Result<Alert> {
        self.alerts.get(alert_id).await
    }

    pub async fn event(&self, event_id: u64) -> Result<AuditEvent> {
        with_deadline(self.timeout(), "get event", self.provider.get_event(event_id))
            .await?
            .ok_or_else(|| AuditError::NotFound(format!("audit event {}", event_id)))
    }

    /// Change an alert's triage status and audit the change
    pub async fn update_alert_status(
        &self,
        ctx: &RequestContext,
        alert_id: u64,
        status: &str,
    ) -> Result<Alert> {
        let Triage { alert, previous } = self.alerts.triage(alert_id, status).await?;

        self.audit_admin(
            NewAuditEvent::from_context(ctx, actions::ALERT_TRIAGE, Outcome::Success)
                .with_target(format!("alert:{}", alert_id))
                .with_reason(format!(
                    "changed status from {} to {}",
                    previous, alert.triage_status
                )),
        )
        .await?;

        Ok(alert)
    }

    /// Link a remediation ticket and move the alert to `investigating`
    ///
    /// An alert that already has a ticket keeps it; no second escalation is
    /// audited.
    pub async fn escalate_alert(
        &self,
        ctx: &RequestContext,
        alert_id: u64,
        ticket_id: u64,
    ) -> Result<Escalation> {
        let escalation = self.alerts.escalate(alert_id, ticket_id).await?;

        if escalation.newly_linked {
            self.audit_admin(
                NewAuditEvent::from_context(ctx, actions::ALERT_ESCALATE, Outcome::Success)
                    .with_target(format!("ticket:{}", ticket_id))
                    .with_reason(format!("escalated alert {}", alert_id)),
            )
            .await?;
        }

        Ok(escalation)
    }

    pub async fn delete_alert(&self, ctx: &RequestContext, alert_id: u64) -> Result<()> {
        self.alerts.delete(alert_id).await?;

        self.audit_admin(
            NewAuditEvent::from_context(ctx, actions::ALERT_DELETE, Outcome::Success)
                .with_target(format!("alert:{}", alert_id)),
        )
        .await
    }

    /// Delete every alert, returning how many were removed
    pub async fn purge_alerts(&self, ctx: &RequestContext) -> Result<u64> {
        let purged = self.alerts.purge().await?;

        self.audit_admin(
            NewAuditEvent::from_context(ctx, actions::ADMIN_CLEAR_ALERTS, Outcome::Success)
                .with_target("alerts")
                .with_reason(format!("deleted {} alerts", purged)),
        )
        .await?;

        Ok(purged)
    }

    /// Delete the audit trail
    ///
    /// The purge itself is recorded afterwards and becomes the first entry
    /// of the new trail.
    pub async fn purge_events(&self, ctx: &RequestContext) -> Result<u64> {
        let purged =
            with_deadline(self.timeout(), "purge events", self.provider.purge_events()).await?;
        tracing::info!(purged, "Audit trail purged");

        self.audit_admin(
            NewAuditEvent::from_context(ctx, actions::ADMIN_CLEAR_AUDIT, Outcome::Success)
                .with_target("audit_events")
                .with_reason(format!("deleted {} events", purged)),
        )
        .await?;

        Ok(purged)
    }

    async fn audit_admin(&self, event: NewAuditEvent) -> Result<()> {
        let ingested = self.report(event).await?;
        tracing::info!(
            event_id = ingested.event.id,
            action = %ingested.event.action,
            actor = ?ingested.event.actor_subject,
            "Administrative action audited"
        );
        Ok(())
    }

    /// Most recent degraded evaluations, newest first
    pub async fn degraded(&self, limit: usize) -> Result<Vec<RuleFailure>> {
        self.failures.list(limit).await
    }

    /// Provider name and record counts
    pub async fn info(&self) -> Result<ProviderInfo> {
        with_deadline(self.timeout(), "provider info", self.provider.info()).await
    }

    /// Whether the store answers within the deadline
    pub async fn health(&self) -> bool {
        match with_deadline(self.timeout(), "health check", self.provider.health()).await {
            Ok(healthy) => healthy,
            Err(e) => {
                tracing::warn!(provider = self.provider.name(), error = %e, "Store health check failed");
                false
            }
        }
    }
}
