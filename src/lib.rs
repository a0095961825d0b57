//! # sentinel-audit
//!
//! Security audit trail and inline threat detection for a helpdesk backend.
//!
//! ## Overview
//!
//! Every security-relevant action (token validation failures, logins,
//! authorization denials, insecure reads, administrative changes) is
//! reported to an `AuditPipeline`. The pipeline durably records the event,
//! runs a fixed set of sliding-window detection rules against the audit
//! trail, and persists any alerts before returning. Analysts then triage
//! alerts and escalate them to remediation tickets.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use sentinel_audit::{actions, AuditPipeline, NewAuditEvent, SentinelConfig};
//! use sentinel_audit::provider::memory::MemoryProvider;
//!
//! # async fn example() -> sentinel_audit::Result<()> {
//! let pipeline = AuditPipeline::new(Arc::new(MemoryProvider::default()), SentinelConfig::default())?;
//!
//! let ingested = pipeline
//!     .report(
//!         NewAuditEvent::success(actions::TICKETS_READ_INSECURE)
//!             .with_source_ip("198.51.100.7")
//!             .with_target("ticket:42"),
//!     )
//!     .await?;
//!
//! for alert in &ingested.alerts {
//!     println!("{} ({})", alert.rule_id, alert.severity);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! - **memory**: In-memory provider for testing and single-process use
//! - **nats**: NATS JetStream stream for the audit trail, key-value bucket for alerts
//!
//! ## Architecture
//!
//! - **AuditProvider**: durable storage all backends implement
//! - **DetectionEngine**: evaluates every `RuleId` against a committed event
//! - **AlertStore**: alert persistence and triage lifecycle
//! - **AuditPipeline**: record, detect, persist, plus audited admin actions

pub mod alerts;
pub mod config;
pub mod detection;
pub mod drill;
pub mod error;
pub mod failures;
pub mod pipeline;
pub mod provider;
pub mod types;

// Re-export core types
pub use alerts::{AlertStore, Escalation, TicketDraft, Triage};
pub use config::SentinelConfig;
pub use detection::{DetectionEngine, Evaluation};
pub use drill::{run_attack_drill, DrillReport};
pub use error::{AuditError, Result};
pub use failures::{FailureLog, FailureStage, MemoryFailureLog, RuleFailure};
pub use pipeline::{AuditPipeline, Ingested};
pub use provider::{AlertMutation, AuditProvider, ProviderInfo};
pub use types::{
    actions, Actor, Alert, AlertDraft, AuditEvent, NewAuditEvent, Outcome, RequestContext,
    RuleId, Severity, TriageStatus, WindowQuery,
};

// Re-export providers for convenience
pub use provider::memory::{MemoryConfig, MemoryProvider};
pub use provider::nats::{NatsClient, NatsConfig, NatsProvider, StorageType};
