//! Core audit and alert types for the sentinel-audit system
//!
//! All types serialize with snake_case JSON so stored records and API
//! payloads share one shape.

use crate::error::{AuditError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Well-known audit actions emitted by the helpdesk
pub mod actions {
    /// Bearer token failed verification
    pub const AUTH_TOKEN_INVALID: &str = "auth:token_invalid";
    /// Successful interactive login
    pub const AUTH_LOGIN: &str = "auth:login";
    /// Permission check refused the request
    pub const AUTHZ_DENIED: &str = "authz:denied";
    /// Ticket read through the endpoint that skips the ownership check
    pub const TICKETS_READ_INSECURE: &str = "tickets:read_insecure";
    pub const ALERT_TRIAGE: &str = "alert:triage";
    pub const ALERT_ESCALATE: &str = "alert:escalate";
    pub const ALERT_DELETE: &str = "alert:delete";
    pub const ADMIN_CLEAR_ALERTS: &str = "admin:clear_alerts";
    pub const ADMIN_CLEAR_AUDIT: &str = "admin:clear_audit";

    /// Denial reason recorded when an ownership check blocks a direct object reference
    pub const IDOR_PREVENTED: &str = "IDOR prevented";
    /// Marker in a target that identifies an admin-scoped resource
    pub const ADMIN_SCOPE: &str = "admin:";
}

/// Outcome of an audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Fail,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Fail => "fail",
        }
    }
}

/// A verified identity supplied by the identity layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Stable subject id (token `sub`)
    pub subject: String,

    /// Human-readable name, when the identity provider supplies one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Actor {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Extract the actor from already-verified token claims
    ///
    /// The display name falls back from `preferred_username` to `upn` to
    /// `email`. Returns `None` when the claims carry no `sub`.
    pub fn from_claims(claims: &serde_json::Value) -> Option<Self> {
        let subject = claims.get("sub")?.as_str()?;
        let display_name = ["preferred_username", "upn", "email"]
            .iter()
            .find_map(|key| claims.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string);

        Some(Self {
            subject: subject.to_string(),
            display_name,
        })
    }
}

/// Per-request identity and transport metadata handed to the pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub actor: Option<Actor>,
    pub source_ip: Option<String>,
}

impl RequestContext {
    pub fn new(actor: Option<Actor>, source_ip: Option<String>) -> Self {
        Self { actor, source_ip }
    }

    /// Context for an unauthenticated request
    pub fn anonymous(source_ip: impl Into<String>) -> Self {
        Self {
            actor: None,
            source_ip: Some(source_ip.into()),
        }
    }

    pub fn actor_subject(&self) -> Option<&str> {
        self.actor.as_ref().map(|a| a.subject.as_str())
    }
}

/// Input for the audit recorder: everything except id and timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEvent {
    #[serde(default)]
    pub actor_subject: Option<String>,
    #[serde(default)]
    pub actor_display_name: Option<String>,
    #[serde(default)]
    pub source_ip: Option<String>,
    pub action: String,
    #[serde(default)]
    pub target: Option<String>,
    pub result: Outcome,
    #[serde(default)]
    pub reason: Option<String>,
}

impl NewAuditEvent {
    pub fn new(action: impl Into<String>, result: Outcome) -> Self {
        Self {
            actor_subject: None,
            actor_display_name: None,
            source_ip: None,
            action: action.into(),
            target: None,
            result,
            reason: None,
        }
    }

    pub fn success(action: impl Into<String>) -> Self {
        Self::new(action, Outcome::Success)
    }

    pub fn failure(action: impl Into<String>) -> Self {
        Self::new(action, Outcome::Fail)
    }

    /// Start from a request context, copying its actor and source IP
    pub fn from_context(ctx: &RequestContext, action: impl Into<String>, result: Outcome) -> Self {
        let mut event = Self::new(action, result);
        if let Some(actor) = &ctx.actor {
            event = event.with_actor(actor);
        }
        event.source_ip = ctx.source_ip.clone();
        event
    }

    pub fn with_actor(mut self, actor: &Actor) -> Self {
        self.actor_subject = Some(actor.subject.clone());
        self.actor_display_name = actor.display_name.clone();
        self
    }

    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Shape check: the action is the only mandatory field
    pub fn validate(&self) -> Result<()> {
        if self.action.trim().is_empty() {
            return Err(AuditError::InvalidEvent("action must not be empty".into()));
        }
        Ok(())
    }

    /// Freeze into an immutable record with store-assigned id and timestamp
    pub fn into_event(self, id: u64, timestamp: DateTime<Utc>) -> AuditEvent {
        AuditEvent {
            id,
            timestamp,
            actor_subject: self.actor_subject,
            actor_display_name: self.actor_display_name,
            source_ip: self.source_ip,
            action: self.action,
            target: self.target,
            result: self.result,
            reason: self.reason,
        }
    }
}

/// An immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Monotonic id assigned by the store
    #[serde(default)]
    pub id: u64,

    /// UTC write time
    pub timestamp: DateTime<Utc>,

    pub actor_subject: Option<String>,
    pub actor_display_name: Option<String>,
    pub source_ip: Option<String>,

    /// Namespaced action (e.g. `auth:login`)
    pub action: String,

    pub target: Option<String>,
    pub result: Outcome,
    pub reason: Option<String>,
}

impl AuditEvent {
    pub fn is(&self, action: &str) -> bool {
        self.action == action
    }

    pub fn target_contains(&self, needle: &str) -> bool {
        self.target.as_deref().is_some_and(|t| t.contains(needle))
    }
}

/// Closed set of detection rule identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleId {
    AuthFailBurst,
    RepeatedAuthzDenied,
    ImpossibleTravel,
    PrivilegeEscalationAttempt,
    InsecureIdorAccess,
    BlockedIdorAttempt,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::AuthFailBurst => "AUTH_FAIL_BURST",
            RuleId::RepeatedAuthzDenied => "REPEATED_AUTHZ_DENIED",
            RuleId::ImpossibleTravel => "IMPOSSIBLE_TRAVEL",
            RuleId::PrivilegeEscalationAttempt => "PRIVILEGE_ESCALATION_ATTEMPT",
            RuleId::InsecureIdorAccess => "INSECURE_IDOR_ACCESS",
            RuleId::BlockedIdorAttempt => "BLOCKED_IDOR_ATTEMPT",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Med,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Med => "med",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Investigative lifecycle state of an alert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageStatus {
    #[default]
    New,
    Investigating,
    Resolved,
    FalsePositive,
}

impl TriageStatus {
    pub const ALL: [TriageStatus; 4] = [
        TriageStatus::New,
        TriageStatus::Investigating,
        TriageStatus::Resolved,
        TriageStatus::FalsePositive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriageStatus::New => "new",
            TriageStatus::Investigating => "investigating",
            TriageStatus::Resolved => "resolved",
            TriageStatus::FalsePositive => "false_positive",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    ///
    /// Staying put is always allowed. Nothing returns to `new`, and a
    /// closed alert can only be re-opened into `investigating`.
    pub fn can_transition_to(self, next: TriageStatus) -> bool {
        use TriageStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (_, New) => false,
            (New, _) => true,
            (Investigating, Resolved | FalsePositive) => true,
            (Resolved | FalsePositive, Investigating) => true,
            _ => false,
        }
    }

    pub fn transition(self, next: TriageStatus) -> Result<TriageStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(AuditError::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TriageStatus::Resolved | TriageStatus::FalsePositive)
    }
}

impl FromStr for TriageStatus {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        TriageStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AuditError::InvalidStatus(s.to_string()))
    }
}

impl fmt::Display for TriageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An alert produced by a rule but not yet persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDraft {
    pub rule_id: RuleId,
    pub severity: Severity,
    pub context: serde_json::Value,
    pub trigger_event_id: Option<u64>,
}

impl AlertDraft {
    pub fn new(
        rule_id: RuleId,
        severity: Severity,
        context: serde_json::Value,
        trigger_event_id: Option<u64>,
    ) -> Self {
        Self {
            rule_id,
            severity,
            context,
            trigger_event_id,
        }
    }

    pub fn into_alert(self, id: u64, created_at: DateTime<Utc>) -> Alert {
        Alert {
            id,
            created_at,
            rule_id: self.rule_id,
            severity: self.severity,
            context: self.context,
            triage_status: TriageStatus::New,
            trigger_event_id: self.trigger_event_id,
            linked_ticket_id: None,
        }
    }
}

/// A flagged anomaly awaiting triage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub rule_id: RuleId,
    pub severity: Severity,

    /// Rule-specific payload (e.g. `{"ip": "...", "count": 10}`)
    pub context: serde_json::Value,

    #[serde(default)]
    pub triage_status: TriageStatus,

    /// Audit event that caused emission (weak reference)
    #[serde(default)]
    pub trigger_event_id: Option<u64>,

    /// Remediation ticket, set at most once
    #[serde(default)]
    pub linked_ticket_id: Option<u64>,
}

impl Alert {
    pub fn is_linked(&self) -> bool {
        self.linked_ticket_id.is_some()
    }
}

/// Backward-looking slice of the audit trail for a single action
///
/// Bounds are inclusive on both ends. `up_to_id` excludes events committed
/// after the triggering event.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowQuery {
    pub action: String,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub up_to_id: u64,
    pub source_ip: Option<String>,
    pub actor_subject: Option<String>,
    pub target_contains: Option<String>,
    pub result: Option<Outcome>,
}

impl WindowQuery {
    /// Window of length `window` ending at (and including) `event`
    pub fn ending_at(event: &AuditEvent, action: impl Into<String>, window: Duration) -> Self {
        Self {
            action: action.into(),
            since: event.timestamp - window,
            until: event.timestamp,
            up_to_id: event.id,
            source_ip: None,
            actor_subject: None,
            target_contains: None,
            result: None,
        }
    }

    pub fn from_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    pub fn by_actor(mut self, subject: impl Into<String>) -> Self {
        self.actor_subject = Some(subject.into());
        self
    }

    pub fn with_target_containing(mut self, needle: impl Into<String>) -> Self {
        self.target_contains = Some(needle.into());
        self
    }

    pub fn with_result(mut self, result: Outcome) -> Self {
        self.result = Some(result);
        self
    }

    /// Whether a stored event falls inside this window and matches every filter
    pub fn matches(&self, event: &AuditEvent) -> bool {
        event.action == self.action
            && event.id <= self.up_to_id
            && event.timestamp >= self.since
            && event.timestamp <= self.until
            && self
                .source_ip
                .as_deref()
                .map_or(true, |ip| event.source_ip.as_deref() == Some(ip))
            && self
                .actor_subject
                .as_deref()
                .map_or(true, |sub| event.actor_subject.as_deref() == Some(sub))
            && self
                .target_contains
                .as_deref()
                .map_or(true, |needle| event.target_contains(needle))
            && self.result.map_or(true, |r| event.result == r)
    }
}
