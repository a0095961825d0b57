//! Alert store and triage lifecycle
//!
//! Alerts are append-only at creation. After that only the triage status
//! and the one-time ticket link change, always through the provider's
//! atomic `modify_alert`.

use crate::config::SentinelConfig;
use crate::error::{AuditError, Result};
use crate::provider::{with_deadline, AuditProvider};
use crate::types::{Alert, AlertDraft, TriageStatus};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Result of linking a remediation ticket to an alert
#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub alert: Alert,

    /// False when the alert already carried a link and nothing changed
    pub newly_linked: bool,
}

/// Result of a triage status change
#[derive(Debug, Clone, PartialEq)]
pub struct Triage {
    pub alert: Alert,

    /// Status the update replaced, read in the same atomic update
    pub previous: TriageStatus,
}

/// Persisted alerts plus triage operations
#[derive(Clone)]
pub struct AlertStore {
    provider: Arc<dyn AuditProvider>,
    timeout: Duration,
    config: SentinelConfig,
}

impl AlertStore {
    pub fn new(provider: Arc<dyn AuditProvider>, config: &SentinelConfig) -> Self {
        Self {
            provider,
            timeout: config.store_timeout(),
            config: config.clone(),
        }
    }

    /// Persist a rule's alert draft with status `new`
    pub async fn emit(&self, draft: AlertDraft) -> Result<Alert> {
        let alert = with_deadline(self.timeout, "insert alert", self.provider.insert_alert(draft)).await?;

        tracing::warn!(
            alert_id = alert.id,
            rule_id = %alert.rule_id,
            severity = %alert.severity,
            trigger_event_id = ?alert.trigger_event_id,
            "Alert raised"
        );
        Ok(alert)
    }

    /// Move an alert to a new triage status
    ///
    /// The status string is checked before the store is touched.
    pub async fn set_status(&self, alert_id: u64, status: &str) -> Result<Alert> {
        self.triage(alert_id, status).await.map(|t| t.alert)
    }

    /// Like `set_status`, also reporting the status that was replaced
    pub async fn triage(&self, alert_id: u64, status: &str) -> Result<Triage> {
        let next: TriageStatus = status.parse()?;
        let previous = Mutex::new(None);

        let mutate = |alert: &mut Alert| -> Result<()> {
            // Overwritten on every retry, so it reflects the revision that was stored.
            *previous.lock().unwrap_or_else(|e| e.into_inner()) = Some(alert.triage_status);
            alert.triage_status = alert.triage_status.transition(next)?;
            Ok(())
        };
        let alert = with_deadline(
            self.timeout,
            "update alert",
            self.provider.modify_alert(alert_id, &mutate),
        )
        .await?;

        let previous = previous
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or(alert.triage_status);

        tracing::info!(alert_id, from = %previous, status = %alert.triage_status, "Alert triaged");
        Ok(Triage { alert, previous })
    }

    /// Link a remediation ticket; a second link attempt leaves the first in place
    pub async fn link_ticket(&self, alert_id: u64, ticket_id: u64) -> Result<Alert> {
        self.link(alert_id, ticket_id, false).await.map(|e| e.alert)
    }

    /// Link a ticket and move the alert to `investigating` in one update
    ///
    /// Already-linked alerts are returned unchanged.
    pub async fn escalate(&self, alert_id: u64, ticket_id: u64) -> Result<Escalation> {
        self.link(alert_id, ticket_id, true).await
    }

    async fn link(&self, alert_id: u64, ticket_id: u64, investigate: bool) -> Result<Escalation> {
        let newly_linked = AtomicBool::new(false);

        let mutate = |alert: &mut Alert| -> Result<()> {
            // Providers may retry the closure on contention; only the last run counts.
            newly_linked.store(false, Ordering::SeqCst);
            if alert.is_linked() {
                return Ok(());
            }
            if investigate {
                alert.triage_status = alert.triage_status.transition(TriageStatus::Investigating)?;
            }
            alert.linked_ticket_id = Some(ticket_id);
            newly_linked.store(true, Ordering::SeqCst);
            Ok(())
        };
        let alert = with_deadline(
            self.timeout,
            "link ticket",
            self.provider.modify_alert(alert_id, &mutate),
        )
        .await?;

        let newly_linked = newly_linked.load(Ordering::SeqCst);
        if newly_linked {
            tracing::info!(alert_id, ticket_id, "Alert linked to ticket");
        } else {
            tracing::debug!(
                alert_id,
                existing_ticket_id = ?alert.linked_ticket_id,
                "Alert already linked"
            );
        }

        Ok(Escalation { alert, newly_linked })
    }

    /// Most recent alerts, newest first, at most `page_limit`
    pub async fn list(&self, limit: usize) -> Result<Vec<Alert>> {
        let limit = self.config.clamp_page(limit);
        with_deadline(self.timeout, "list alerts", self.provider.recent_alerts(limit)).await
    }

    pub async fn get(&self, alert_id: u64) -> Result<Alert> {
        with_deadline(self.timeout, "get alert", self.provider.get_alert(alert_id))
            .await?
            .ok_or_else(|| AuditError::NotFound(format!("alert {}", alert_id)))
    }

    pub async fn delete(&self, alert_id: u64) -> Result<()> {
        with_deadline(self.timeout, "delete alert", self.provider.delete_alert(alert_id)).await?;
        tracing::info!(alert_id, "Alert deleted");
        Ok(())
    }

    /// Remove every alert, returning how many were removed
    pub async fn purge(&self) -> Result<u64> {
        let purged = with_deadline(self.timeout, "purge alerts", self.provider.purge_alerts()).await?;
        tracing::info!(purged, "Alerts purged");
        Ok(purged)
    }
}

/// Ticket content proposed when an alert is escalated
///
/// The ticketing system owns ticket creation; this only renders the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketDraft {
    pub title: String,
    pub body: String,
}

impl TicketDraft {
    pub fn for_alert(alert: &Alert) -> Self {
        let context = serde_json::to_string_pretty(&alert.context)
            .unwrap_or_else(|_| alert.context.to_string());

        let body = format!(
            "Security alert escalated for investigation.\n\n\
             Rule: {}\n\
             Severity: {}\n\
             Time: {}\n\
             Source alert: {}\n\n\
             Context:\n{}\n",
            alert.rule_id,
            alert.severity,
            alert.created_at.to_rfc3339(),
            alert.id,
            context,
        );

        Self {
            title: format!("[Security Incident] {} Detected", alert.rule_id),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryProvider;
    use crate::types::{RuleId, Severity};
    use serde_json::json;

    fn store() -> AlertStore {
        AlertStore::new(Arc::new(MemoryProvider::default()), &SentinelConfig::default())
    }

    fn draft() -> AlertDraft {
        AlertDraft::new(
            RuleId::InsecureIdorAccess,
            Severity::High,
            json!({"actor": "u-1", "target": "ticket:9", "endpoint": "insecure_endpoint"}),
            Some(41),
        )
    }

    #[tokio::test]
    async fn test_emit_starts_new_and_unlinked() {
        let store = store();
        let alert = store.emit(draft()).await.unwrap();
        assert_eq!(alert.triage_status, TriageStatus::New);
        assert_eq!(alert.trigger_event_id, Some(41));
        assert!(!alert.is_linked());
        assert_eq!(store.get(alert.id).await.unwrap(), alert);
    }

    #[tokio::test]
    async fn test_set_status_lifecycle() {
        let store = store();
        let alert = store.emit(draft()).await.unwrap();

        let a = store.set_status(alert.id, "investigating").await.unwrap();
        assert_eq!(a.triage_status, TriageStatus::Investigating);
        let a = store.set_status(alert.id, "resolved").await.unwrap();
        assert_eq!(a.triage_status, TriageStatus::Resolved);

        let err = store.set_status(alert.id, "new").await.unwrap_err();
        assert!(matches!(err, AuditError::InvalidTransition { .. }));

        let a = store.set_status(alert.id, "investigating").await.unwrap();
        assert_eq!(a.triage_status, TriageStatus::Investigating);
    }

    #[tokio::test]
    async fn test_set_status_rejects_unknown_without_mutation() {
        let store = store();
        let alert = store.emit(draft()).await.unwrap();

        let err = store.set_status(alert.id, "closed").await.unwrap_err();
        assert!(matches!(err, AuditError::InvalidStatus(ref s) if s == "closed"));
        assert_eq!(store.get(alert.id).await.unwrap().triage_status, TriageStatus::New);

        // Status is parsed before the alert is looked up
        let err = store.set_status(999, "bogus").await.unwrap_err();
        assert!(matches!(err, AuditError::InvalidStatus(_)));
        let err = store.set_status(999, "resolved").await.unwrap_err();
        assert!(matches!(err, AuditError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_triage_reports_actual_previous_status() {
        let store = store();
        let alert = store.emit(draft()).await.unwrap();

        let mut handles = Vec::new();
        for status in ["investigating", "false_positive", "resolved", "investigating"] {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.triage(alert.id, status).await }));
        }

        let mut steps = Vec::new();
        for handle in handles {
            if let Ok(triage) = handle.await.unwrap() {
                steps.push((triage.previous, triage.alert.triage_status));
            }
        }

        // Every reported step is a legal transition, and exactly one left `new`
        assert!(steps.iter().all(|(from, to)| from.can_transition_to(*to)));
        assert_eq!(steps.iter().filter(|(from, _)| *from == TriageStatus::New).count(), 1);
    }

    #[tokio::test]
    async fn test_triage_returns_previous_status() {
        let store = store();
        let alert = store.emit(draft()).await.unwrap();

        let first = store.triage(alert.id, "investigating").await.unwrap();
        assert_eq!(first.previous, TriageStatus::New);
        assert_eq!(first.alert.triage_status, TriageStatus::Investigating);

        let second = store.triage(alert.id, "false_positive").await.unwrap();
        assert_eq!(second.previous, TriageStatus::Investigating);
    }

    #[tokio::test]
    async fn test_link_ticket_is_idempotent() {
        let store = store();
        let alert = store.emit(draft()).await.unwrap();

        let first = store.link_ticket(alert.id, 77).await.unwrap();
        assert_eq!(first.linked_ticket_id, Some(77));
        assert_eq!(first.triage_status, TriageStatus::New);

        let second = store.link_ticket(alert.id, 78).await.unwrap();
        assert_eq!(second.linked_ticket_id, Some(77));
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_escalate_moves_to_investigating_once() {
        let store = store();
        let alert = store.emit(draft()).await.unwrap();

        let first = store.escalate(alert.id, 5).await.unwrap();
        assert!(first.newly_linked);
        assert_eq!(first.alert.triage_status, TriageStatus::Investigating);

        store.set_status(alert.id, "resolved").await.unwrap();
        let again = store.escalate(alert.id, 6).await.unwrap();
        assert!(!again.newly_linked);
        assert_eq!(again.alert.linked_ticket_id, Some(5));
        assert_eq!(again.alert.triage_status, TriageStatus::Resolved);
    }

    #[tokio::test]
    async fn test_concurrent_escalation_links_once() {
        let store = store();
        let alert = store.emit(draft()).await.unwrap();

        let mut handles = Vec::new();
        for ticket in 100..110 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.escalate(alert.id, ticket).await }));
        }

        let mut winners = 0;
        let mut linked = Vec::new();
        for handle in handles {
            let escalation = handle.await.unwrap().unwrap();
            if escalation.newly_linked {
                winners += 1;
            }
            linked.push(escalation.alert.linked_ticket_id);
        }

        assert_eq!(winners, 1);
        let stored = store.get(alert.id).await.unwrap().linked_ticket_id;
        assert!(stored.is_some());
        assert!(linked.iter().all(|l| *l == stored));
    }

    #[tokio::test]
    async fn test_list_is_clamped_and_newest_first() {
        let provider = Arc::new(MemoryProvider::default());
        let config = SentinelConfig {
            page_limit: 3,
            ..SentinelConfig::default()
        };
        let store = AlertStore::new(provider, &config);
        for _ in 0..5 {
            store.emit(draft()).await.unwrap();
        }

        let page = store.list(100).await.unwrap();
        let ids: Vec<u64> = page.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_list_with_zero_page_limit_returns_one() {
        let config = SentinelConfig {
            page_limit: 0,
            ..SentinelConfig::default()
        };
        let store = AlertStore::new(Arc::new(MemoryProvider::default()), &config);
        store.emit(draft()).await.unwrap();
        store.emit(draft()).await.unwrap();

        let page = store.list(5).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, 2);
    }

    #[tokio::test]
    async fn test_delete_and_purge() {
        let store = store();
        let a = store.emit(draft()).await.unwrap();
        store.emit(draft()).await.unwrap();
        store.emit(draft()).await.unwrap();

        store.delete(a.id).await.unwrap();
        assert!(matches!(store.get(a.id).await, Err(AuditError::NotFound(_))));
        assert!(matches!(store.delete(a.id).await, Err(AuditError::NotFound(_))));

        assert_eq!(store.purge().await.unwrap(), 2);
        assert!(store.list(10).await.unwrap().is_empty());
    }

    #[test]
    fn test_ticket_draft() {
        let alert = draft().into_alert(12, chrono::Utc::now());
        let ticket = TicketDraft::for_alert(&alert);
        assert_eq!(ticket.title, "[Security Incident] INSECURE_IDOR_ACCESS Detected");
        assert!(ticket.body.contains("Severity: high"));
        assert!(ticket.body.contains("Source alert: 12"));
        assert!(ticket.body.contains("\"endpoint\": \"insecure_endpoint\""));
    }
}
