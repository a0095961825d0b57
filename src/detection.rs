//! Detection rule engine over a fixed rule set
//!
//! Each rule is evaluated once per newly committed audit event. Windowed
//! rules query the audit trail backward from the triggering event's
//! timestamp, and every count includes the triggering event itself.
//!
//! | rule | trigger | window | threshold |
//! |---|---|---|---|
//! | `AUTH_FAIL_BURST` | `auth:token_invalid` with source IP | 5 min | 10 per IP |
//! | `REPEATED_AUTHZ_DENIED` | `authz:denied` with actor | 10 min | 5 per actor |
//! | `IMPOSSIBLE_TRAVEL` | successful `auth:login` with actor and IP | 5 min | 2 distinct IPs |
//! | `PRIVILEGE_ESCALATION_ATTEMPT` | `authz:denied` on an `admin:` target | 10 min | 3 per actor |
//! | `INSECURE_IDOR_ACCESS` | `tickets:read_insecure` | none | every event |
//! | `BLOCKED_IDOR_ATTEMPT` | `authz:denied` with reason `IDOR prevented` | none | every event |
//!
//! Counts are recomputed from a fresh window query on every qualifying
//! event. Under concurrent appends a count may include or miss events
//! committed at the same instant; rules are detective, so an occasional
//! missed or doubled alert is tolerated.

use crate::error::{AuditError, Result};
use crate::failures::{FailureStage, RuleFailure};
use crate::provider::{with_deadline, AuditProvider};
use crate::types::{actions, AlertDraft, AuditEvent, Outcome, RuleId, Severity, WindowQuery};
use serde_json::json;
use std::time::Duration;

const AUTH_FAIL_WINDOW_MINUTES: i64 = 5;
const AUTH_FAIL_THRESHOLD: usize = 10;

const AUTHZ_DENIED_WINDOW_MINUTES: i64 = 10;
const AUTHZ_DENIED_THRESHOLD: usize = 5;

const TRAVEL_WINDOW_MINUTES: i64 = 5;
const TRAVEL_DISTINCT_IPS: usize = 2;

const ESCALATION_WINDOW_MINUTES: i64 = 10;
const ESCALATION_THRESHOLD: usize = 3;

impl RuleId {
    /// Every rule, in evaluation order
    pub const ALL: [RuleId; 6] = [
        RuleId::AuthFailBurst,
        RuleId::RepeatedAuthzDenied,
        RuleId::ImpossibleTravel,
        RuleId::PrivilegeEscalationAttempt,
        RuleId::InsecureIdorAccess,
        RuleId::BlockedIdorAttempt,
    ];

    pub fn severity(&self) -> Severity {
        match self {
            RuleId::AuthFailBurst
            | RuleId::ImpossibleTravel
            | RuleId::PrivilegeEscalationAttempt
            | RuleId::InsecureIdorAccess => Severity::High,
            RuleId::RepeatedAuthzDenied | RuleId::BlockedIdorAttempt => Severity::Med,
        }
    }

    /// Window length for windowed rules; `None` for fire-every-time rules
    pub fn window_minutes(&self) -> Option<i64> {
        match self {
            RuleId::AuthFailBurst => Some(AUTH_FAIL_WINDOW_MINUTES),
            RuleId::RepeatedAuthzDenied => Some(AUTHZ_DENIED_WINDOW_MINUTES),
            RuleId::ImpossibleTravel => Some(TRAVEL_WINDOW_MINUTES),
            RuleId::PrivilegeEscalationAttempt => Some(ESCALATION_WINDOW_MINUTES),
            RuleId::InsecureIdorAccess | RuleId::BlockedIdorAttempt => None,
        }
    }

    /// Whether this event is one the rule reacts to at all
    pub fn applies_to(&self, event: &AuditEvent) -> bool {
        match self {
            RuleId::AuthFailBurst => {
                event.is(actions::AUTH_TOKEN_INVALID) && event.source_ip.is_some()
            }
            RuleId::RepeatedAuthzDenied => {
                event.is(actions::AUTHZ_DENIED) && event.actor_subject.is_some()
            }
            RuleId::ImpossibleTravel => {
                event.is(actions::AUTH_LOGIN)
                    && event.result == Outcome::Success
                    && event.actor_subject.is_some()
                    && event.source_ip.is_some()
            }
            RuleId::PrivilegeEscalationAttempt => {
                event.is(actions::AUTHZ_DENIED)
                    && event.actor_subject.is_some()
                    && event.target_contains(actions::ADMIN_SCOPE)
            }
            RuleId::InsecureIdorAccess => event.is(actions::TICKETS_READ_INSECURE),
            RuleId::BlockedIdorAttempt => {
                event.is(actions::AUTHZ_DENIED)
                    && event.reason.as_deref() == Some(actions::IDOR_PREVENTED)
            }
        }
    }

    /// Evaluate this rule against a committed event
    ///
    /// Returns at most one alert draft. The event must already be durable in
    /// `store` so windowed counts include it.
    pub async fn evaluate(
        &self,
        event: &AuditEvent,
        store: &dyn AuditProvider,
    ) -> Result<Option<AlertDraft>> {
        if !self.applies_to(event) {
            return Ok(None);
        }

        let context = match self {
            RuleId::AuthFailBurst => {
                let ip = required(event.source_ip.as_deref(), self, "source_ip")?;
                let query = self.window_ending_at(event, actions::AUTH_TOKEN_INVALID).from_ip(ip);
                let count = store.window(&query).await?.len();
                (count >= AUTH_FAIL_THRESHOLD).then(|| {
                    json!({"ip": ip, "count": count, "window_minutes": AUTH_FAIL_WINDOW_MINUTES})
                })
            }
            RuleId::RepeatedAuthzDenied => {
                let actor = required(event.actor_subject.as_deref(), self, "actor_subject")?;
                let query = self.window_ending_at(event, actions::AUTHZ_DENIED).by_actor(actor);
                let count = store.window(&query).await?.len();
                (count >= AUTHZ_DENIED_THRESHOLD).then(|| {
                    json!({"actor": actor, "count": count, "window_minutes": AUTHZ_DENIED_WINDOW_MINUTES})
                })
            }
            RuleId::ImpossibleTravel => {
                let actor = required(event.actor_subject.as_deref(), self, "actor_subject")?;
                let query = self
                    .window_ending_at(event, actions::AUTH_LOGIN)
                    .by_actor(actor)
                    .with_result(Outcome::Success);
                let logins = store.window(&query).await?;

                let mut ips: Vec<&str> = Vec::new();
                for ip in logins.iter().filter_map(|e| e.source_ip.as_deref()) {
                    if !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }

                (ips.len() >= TRAVEL_DISTINCT_IPS).then(|| {
                    json!({"actor": actor, "ips": ips, "window_minutes": TRAVEL_WINDOW_MINUTES})
                })
            }
            RuleId::PrivilegeEscalationAttempt => {
                let actor = required(event.actor_subject.as_deref(), self, "actor_subject")?;
                let query = self
                    .window_ending_at(event, actions::AUTHZ_DENIED)
                    .by_actor(actor)
                    .with_target_containing(actions::ADMIN_SCOPE);
                let count = store.window(&query).await?.len();
                (count >= ESCALATION_THRESHOLD).then(|| {
                    json!({"actor": actor, "count": count, "window_minutes": ESCALATION_WINDOW_MINUTES})
                })
            }
            RuleId::InsecureIdorAccess => Some(json!({
                "actor": event.actor_subject,
                "target": event.target,
                "endpoint": "insecure_endpoint",
            })),
            RuleId::BlockedIdorAttempt => Some(json!({
                "actor": event.actor_subject,
                "target": event.target,
                "reason": "access_control_enforced",
            })),
        };

        Ok(context.map(|context| AlertDraft::new(*self, self.severity(), context, Some(event.id))))
    }

    fn window_ending_at(&self, event: &AuditEvent, action: &str) -> WindowQuery {
        let minutes = self.window_minutes().unwrap_or_default();
        WindowQuery::ending_at(event, action, chrono::Duration::minutes(minutes))
    }
}

fn required<'a>(value: Option<&'a str>, rule: &RuleId, field: &str) -> Result<&'a str> {
    value.ok_or_else(|| AuditError::Rule {
        rule_id: rule.to_string(),
        reason: format!("triggering event has no {}", field),
    })
}

/// Outcome of running every rule against one event
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// Alerts the rules want raised, in rule order
    pub drafts: Vec<AlertDraft>,

    /// Rules that could not complete
    pub failures: Vec<RuleFailure>,
}

impl Evaluation {
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Runs the fixed rule set against committed audit events
///
/// Rules are isolated: a failing or slow rule is recorded as a
/// `RuleFailure` and the remaining rules still run.
#[derive(Debug, Clone)]
pub struct DetectionEngine {
    rules: Vec<RuleId>,
    rule_timeout: Duration,
}

impl DetectionEngine {
    pub fn new(rule_timeout: Duration) -> Self {
        Self {
            rules: RuleId::ALL.to_vec(),
            rule_timeout,
        }
    }

    pub fn rules(&self) -> &[RuleId] {
        &self.rules
    }

    /// Evaluate every rule once against `event`
    pub async fn evaluate(&self, event: &AuditEvent, store: &dyn AuditProvider) -> Evaluation {
        let mut evaluation = Evaluation::default();

        for rule in &self.rules {
            let outcome =
                with_deadline(self.rule_timeout, rule.as_str(), rule.evaluate(event, store)).await;

            match outcome {
                Ok(Some(draft)) => {
                    tracing::debug!(event_id = event.id, rule_id = %rule, "Rule fired");
                    evaluation.drafts.push(draft);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        event_id = event.id,
                        rule_id = %rule,
                        error = %e,
                        "Rule evaluation failed"
                    );
                    evaluation.failures.push(RuleFailure::new(
                        event.id,
                        *rule,
                        FailureStage::Evaluate,
                        e.to_string(),
                    ));
                }
            }
        }

        evaluation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryProvider;
    use crate::provider::{AlertMutation, ProviderInfo};
    use crate::types::{Actor, Alert, NewAuditEvent};
    use async_trait::async_trait;

    fn engine() -> DetectionEngine {
        DetectionEngine::new(Duration::from_secs(5))
    }

    async fn record(store: &MemoryProvider, event: NewAuditEvent) -> AuditEvent {
        store.append_event(event).await.unwrap()
    }

    fn denial(actor: &str, target: &str) -> NewAuditEvent {
        NewAuditEvent::failure(actions::AUTHZ_DENIED)
            .with_actor(&Actor::new(actor))
            .with_target(target)
    }

    fn login(actor: &str, ip: &str) -> NewAuditEvent {
        NewAuditEvent::success(actions::AUTH_LOGIN)
            .with_actor(&Actor::new(actor))
            .with_source_ip(ip)
    }

    #[test]
    fn test_rule_table() {
        assert_eq!(RuleId::ALL.len(), 6);
        assert_eq!(RuleId::AuthFailBurst.severity(), Severity::High);
        assert_eq!(RuleId::RepeatedAuthzDenied.severity(), Severity::Med);
        assert_eq!(RuleId::BlockedIdorAttempt.severity(), Severity::Med);
        assert_eq!(RuleId::ImpossibleTravel.window_minutes(), Some(5));
        assert_eq!(RuleId::PrivilegeEscalationAttempt.window_minutes(), Some(10));
        assert_eq!(RuleId::InsecureIdorAccess.window_minutes(), None);
    }

    #[test]
    fn test_trigger_conditions() {
        let now = chrono::Utc::now();
        let no_ip = NewAuditEvent::failure(actions::AUTH_TOKEN_INVALID).into_event(1, now);
        assert!(!RuleId::AuthFailBurst.applies_to(&no_ip));

        let failed_login = NewAuditEvent::failure(actions::AUTH_LOGIN)
            .with_actor(&Actor::new("u"))
            .with_source_ip("1.1.1.1")
            .into_event(2, now);
        assert!(!RuleId::ImpossibleTravel.applies_to(&failed_login));

        let idor = denial("u", "ticket:7").with_reason("IDOR prevented").into_event(3, now);
        assert!(RuleId::BlockedIdorAttempt.applies_to(&idor));
        assert!(RuleId::RepeatedAuthzDenied.applies_to(&idor));
        assert!(!RuleId::PrivilegeEscalationAttempt.applies_to(&idor));
    }

    #[tokio::test]
    async fn test_auth_fail_burst_threshold() {
        let store = MemoryProvider::default();
        let engine = engine();

        for i in 1..=11 {
            let event = record(
                &store,
                NewAuditEvent::failure(actions::AUTH_TOKEN_INVALID).with_source_ip("6.6.6.6"),
            )
            .await;
            let eval = engine.evaluate(&event, &store).await;

            if i < 10 {
                assert!(eval.drafts.is_empty(), "fired early at {}", i);
            } else {
                assert_eq!(eval.drafts.len(), 1);
                let draft = &eval.drafts[0];
                assert_eq!(draft.rule_id, RuleId::AuthFailBurst);
                assert_eq!(draft.context["count"], i);
                assert_eq!(draft.context["ip"], "6.6.6.6");
                assert_eq!(draft.trigger_event_id, Some(event.id));
            }
        }
    }

    #[tokio::test]
    async fn test_auth_fail_burst_ignores_other_ips_and_expired_events() {
        let store = MemoryProvider::default();
        for _ in 0..9 {
            record(&store, NewAuditEvent::failure(actions::AUTH_TOKEN_INVALID).with_source_ip("6.6.6.6")).await;
        }
        store.advance_clock(chrono::Duration::minutes(5) + chrono::Duration::seconds(1));
        for _ in 0..5 {
            record(&store, NewAuditEvent::failure(actions::AUTH_TOKEN_INVALID).with_source_ip("7.7.7.7")).await;
        }

        let event = record(
            &store,
            NewAuditEvent::failure(actions::AUTH_TOKEN_INVALID).with_source_ip("6.6.6.6"),
        )
        .await;
        let eval = engine().evaluate(&event, &store).await;
        assert!(eval.drafts.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_authz_denied() {
        let store = MemoryProvider::default();
        let engine = engine();

        let mut fired = Vec::new();
        for i in 1..=6 {
            let event = record(&store, denial("u-9", &format!("resource:{}", i))).await;
            let eval = engine.evaluate(&event, &store).await;
            if eval.drafts.iter().any(|d| d.rule_id == RuleId::RepeatedAuthzDenied) {
                fired.push(i);
            }
        }
        assert_eq!(fired, vec![5, 6]);
    }

    #[tokio::test]
    async fn test_repeated_authz_denied_window_expiry() {
        let store = MemoryProvider::default();
        let engine = engine();

        for i in 0..4 {
            record(&store, denial("u-9", &format!("resource:{}", i))).await;
        }
        store.advance_clock(chrono::Duration::minutes(11));

        let mut fired = Vec::new();
        for i in 1..=5 {
            let event = record(&store, denial("u-9", "resource:late")).await;
            let eval = engine.evaluate(&event, &store).await;
            if let Some(d) = eval
                .drafts
                .iter()
                .find(|d| d.rule_id == RuleId::RepeatedAuthzDenied)
            {
                assert_eq!(d.context["count"], 5);
                fired.push(i);
            }
        }
        // The four stale denials would have tripped it on the first late one
        assert_eq!(fired, vec![5]);
    }

    #[tokio::test]
    async fn test_privilege_escalation_window_expiry() {
        let store = MemoryProvider::default();
        let engine = engine();

        record(&store, denial("u-2", "admin:users")).await;
        record(&store, denial("u-2", "admin:users")).await;
        store.advance_clock(chrono::Duration::minutes(11));

        let late = record(&store, denial("u-2", "admin:users")).await;
        let eval = engine.evaluate(&late, &store).await;
        assert!(!eval
            .drafts
            .iter()
            .any(|d| d.rule_id == RuleId::PrivilegeEscalationAttempt));

        record(&store, denial("u-2", "admin:users")).await;
        let third = record(&store, denial("u-2", "admin:users")).await;
        let eval = engine.evaluate(&third, &store).await;
        assert!(eval
            .drafts
            .iter()
            .any(|d| d.rule_id == RuleId::PrivilegeEscalationAttempt));
    }

    #[tokio::test]
    async fn test_impossible_travel_distinct_ips() {
        let store = MemoryProvider::default();
        let engine = engine();

        let first = record(&store, login("u-1", "1.1.1.1")).await;
        assert!(engine.evaluate(&first, &store).await.drafts.is_empty());

        let same_ip = record(&store, login("u-1", "1.1.1.1")).await;
        assert!(engine.evaluate(&same_ip, &store).await.drafts.is_empty());

        // Another actor's login never counts
        record(&store, login("u-2", "3.3.3.3")).await;

        let second = record(&store, login("u-1", "2.2.2.2")).await;
        let eval = engine.evaluate(&second, &store).await;
        assert_eq!(eval.drafts.len(), 1);
        assert_eq!(eval.drafts[0].rule_id, RuleId::ImpossibleTravel);
        assert_eq!(
            eval.drafts[0].context["ips"],
            serde_json::json!(["1.1.1.1", "2.2.2.2"])
        );
    }

    #[tokio::test]
    async fn test_impossible_travel_window_expiry() {
        let store = MemoryProvider::default();
        record(&store, login("u-1", "1.1.1.1")).await;
        store.advance_clock(chrono::Duration::minutes(6));

        let later = record(&store, login("u-1", "2.2.2.2")).await;
        assert!(engine().evaluate(&later, &store).await.drafts.is_empty());
    }

    #[tokio::test]
    async fn test_privilege_escalation_only_counts_admin_targets() {
        let store = MemoryProvider::default();
        let engine = engine();

        record(&store, denial("u-2", "tickets:list")).await;
        record(&store, denial("u-2", "tickets:list")).await;

        let mut fired = Vec::new();
        for i in 1..=3 {
            let event = record(&store, denial("u-2", "admin:export_audit")).await;
            let eval = engine.evaluate(&event, &store).await;
            if let Some(d) = eval
                .drafts
                .iter()
                .find(|d| d.rule_id == RuleId::PrivilegeEscalationAttempt)
            {
                assert_eq!(d.context["count"], 3);
                fired.push(i);
            }
        }
        assert_eq!(fired, vec![3]);
    }

    #[tokio::test]
    async fn test_idor_rules_fire_every_time() {
        let store = MemoryProvider::default();
        let engine = engine();

        for _ in 0..3 {
            let event = record(
                &store,
                NewAuditEvent::success(actions::TICKETS_READ_INSECURE)
                    .with_actor(&Actor::new("u-5"))
                    .with_target("ticket:12"),
            )
            .await;
            let eval = engine.evaluate(&event, &store).await;
            assert_eq!(eval.drafts.len(), 1);
            assert_eq!(eval.drafts[0].rule_id, RuleId::InsecureIdorAccess);
            assert_eq!(eval.drafts[0].context["target"], "ticket:12");
        }

        let blocked = record(&store, denial("u-5", "ticket:12").with_reason("IDOR prevented")).await;
        let eval = engine.evaluate(&blocked, &store).await;
        let rule_ids: Vec<RuleId> = eval.drafts.iter().map(|d| d.rule_id).collect();
        assert_eq!(rule_ids, vec![RuleId::BlockedIdorAttempt]);
        assert_eq!(eval.drafts[0].severity, Severity::Med);
    }

    /// Delegates to memory storage but fails every window query for one action
    struct FlakyProvider {
        inner: MemoryProvider,
        broken_action: &'static str,
    }

    #[async_trait]
    impl AuditProvider for FlakyProvider {
        async fn append_event(&self, event: NewAuditEvent) -> Result<AuditEvent> {
            self.inner.append_event(event).await
        }
        async fn window(&self, query: &WindowQuery) -> Result<Vec<AuditEvent>> {
            if query.action == self.broken_action {
                return Err(AuditError::StorageUnavailable("index offline".into()));
            }
            self.inner.window(query).await
        }
        async fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
            self.inner.recent_events(limit).await
        }
        async fn get_event(&self, id: u64) -> Result<Option<AuditEvent>> {
            self.inner.get_event(id).await
        }
        async fn purge_events(&self) -> Result<u64> {
            self.inner.purge_events().await
        }
        async fn insert_alert(&self, draft: AlertDraft) -> Result<Alert> {
            self.inner.insert_alert(draft).await
        }
        async fn get_alert(&self, id: u64) -> Result<Option<Alert>> {
            self.inner.get_alert(id).await
        }
        async fn modify_alert(&self, id: u64, mutate: AlertMutation<'_>) -> Result<Alert> {
            self.inner.modify_alert(id, mutate).await
        }
        async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
            self.inner.recent_alerts(limit).await
        }
        async fn delete_alert(&self, id: u64) -> Result<()> {
            self.inner.delete_alert(id).await
        }
        async fn purge_alerts(&self) -> Result<u64> {
            self.inner.purge_alerts().await
        }
        async fn info(&self) -> Result<ProviderInfo> {
            self.inner.info().await
        }
        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_failing_rule_does_not_stop_others() {
        let store = FlakyProvider {
            inner: MemoryProvider::default(),
            broken_action: actions::AUTHZ_DENIED,
        };

        let event = store
            .append_event(denial("u-3", "ticket:4").with_reason("IDOR prevented"))
            .await
            .unwrap();
        let eval = engine().evaluate(&event, &store).await;

        // The windowed denial rule broke; the fire-every-time rule still ran
        assert!(eval.is_degraded());
        assert_eq!(eval.failures.len(), 1);
        assert_eq!(eval.failures[0].rule_id, RuleId::RepeatedAuthzDenied);
        assert_eq!(eval.failures[0].stage, FailureStage::Evaluate);
        assert_eq!(eval.drafts.len(), 1);
        assert_eq!(eval.drafts[0].rule_id, RuleId::BlockedIdorAttempt);
    }

    #[tokio::test]
    async fn test_slow_rule_is_reported_as_failure() {
        let store = MemoryProvider::new(crate::provider::memory::MemoryConfig {
            latency: Duration::from_millis(50),
        });
        let event = store
            .append_event(NewAuditEvent::failure(actions::AUTH_TOKEN_INVALID).with_source_ip("1.2.3.4"))
            .await
            .unwrap();

        let engine = DetectionEngine::new(Duration::from_millis(5));
        let eval = engine.evaluate(&event, &store).await;
        assert_eq!(eval.failures.len(), 1);
        assert_eq!(eval.failures[0].rule_id, RuleId::AuthFailBurst);
        assert!(eval.failures[0].reason.contains("timed out"));
    }
}
