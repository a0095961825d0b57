//! Attack drill: replays classic attack patterns through the pipeline
//!
//! Used to check end to end that detection is wired up: every pattern goes
//! through `AuditPipeline::report` exactly like real traffic, so the
//! resulting alerts land in the store and the events stay in the trail.

use crate::error::Result;
use crate::pipeline::{AuditPipeline, Ingested};
use crate::types::{actions, NewAuditEvent, Outcome, RequestContext, RuleId};
use std::collections::BTreeMap;

/// Token failures replayed from the caller's address
pub const TOKEN_FAILURES: usize = 12;

/// Generic authorization denials replayed for the caller
pub const GENERIC_DENIALS: usize = 6;

/// Denials on administrative targets replayed for the caller
pub const ADMIN_DENIALS: usize = 4;

/// Login addresses used for the travel pattern (documentation ranges)
pub const TRAVEL_IPS: [&str; 2] = ["203.0.113.10", "192.0.2.20"];

/// What a drill produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrillReport {
    /// Audit events written by the drill
    pub events: usize,

    /// Alerts raised, per rule
    pub alerts: BTreeMap<String, usize>,

    /// Degraded evaluations observed during the drill
    pub degraded: usize,
}

impl DrillReport {
    pub fn alerts_for(&self, rule: RuleId) -> usize {
        self.alerts.get(rule.as_str()).copied().unwrap_or(0)
    }

    pub fn total_alerts(&self) -> usize {
        self.alerts.values().sum()
    }

    fn absorb(&mut self, ingested: Ingested) {
        self.events += 1;
        self.degraded += ingested.degraded.len();
        for alert in ingested.alerts {
            *self.alerts.entry(alert.rule_id.to_string()).or_insert(0) += 1;
        }
    }
}

/// Replay the four attack patterns on behalf of `ctx`
///
/// Token failures are anonymous and come from `ctx.source_ip`; the other
/// patterns are attributed to `ctx.actor`. A context without an address or
/// actor still writes every event, it just cannot trip the rules that key
/// on the missing field.
pub async fn run_attack_drill(pipeline: &AuditPipeline, ctx: &RequestContext) -> Result<DrillReport> {
    let mut report = DrillReport::default();
    let anonymous = RequestContext::new(None, ctx.source_ip.clone());

    tracing::info!(actor = ?ctx.actor_subject(), ip = ?ctx.source_ip, "Attack drill started");

    for _ in 0..TOKEN_FAILURES {
        let event = NewAuditEvent::from_context(&anonymous, actions::AUTH_TOKEN_INVALID, Outcome::Fail)
            .with_target("api")
            .with_reason("simulated_attack");
        report.absorb(pipeline.report(event).await?);
    }

    for ip in TRAVEL_IPS {
        let travelling = RequestContext::new(ctx.actor.clone(), Some(ip.to_string()));
        let event = NewAuditEvent::from_context(&travelling, actions::AUTH_LOGIN, Outcome::Success)
            .with_target("api")
            .with_reason("simulated_travel");
        report.absorb(pipeline.report(event).await?);
    }

    for i in 0..GENERIC_DENIALS {
        let event = NewAuditEvent::from_context(ctx, actions::AUTHZ_DENIED, Outcome::Fail)
            .with_target(format!("resource:{}", i))
            .with_reason("simulated_denial");
        report.absorb(pipeline.report(event).await?);
    }

    for i in 0..ADMIN_DENIALS {
        let event = NewAuditEvent::from_context(ctx, actions::AUTHZ_DENIED, Outcome::Fail)
            .with_target(format!("{}resource:{}", actions::ADMIN_SCOPE, i))
            .with_reason("simulated_privilege_escalation");
        report.absorb(pipeline.report(event).await?);
    }

    tracing::info!(
        events = report.events,
        alerts = report.total_alerts(),
        degraded = report.degraded,
        "Attack drill finished"
    );
    Ok(report)
}
