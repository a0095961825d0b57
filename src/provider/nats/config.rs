//! NATS provider configuration

use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Persist to disk (audit trails must survive restarts)
    #[default]
    File,
    /// Keep in server memory (tests)
    Memory,
}

/// Configuration for the NATS JetStream audit provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Server URL
    pub url: String,

    /// Optional auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Stream holding the audit trail
    pub stream_name: String,

    /// Subject prefix; each event goes to `<prefix>.<action tokens>`
    pub subject_prefix: String,

    /// Key-value bucket holding alerts
    pub alert_bucket: String,

    pub storage: StorageType,

    /// Maximum age of audit events in seconds (0 = keep forever)
    pub max_age_secs: u64,

    /// Maximum stream size in bytes (-1 = unlimited)
    pub max_bytes: i64,

    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,

    /// Upper bound on messages read by a single window query
    pub window_scan_limit: usize,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            token: None,
            stream_name: "SENTINEL_AUDIT".to_string(),
            subject_prefix: "audit".to_string(),
            alert_bucket: "SENTINEL_ALERTS".to_string(),
            storage: StorageType::File,
            max_age_secs: 0,
            max_bytes: -1,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            window_scan_limit: 10_000,
        }
    }
}

impl NatsConfig {
    /// Subjects captured by the audit stream
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![format!("{}.>", self.subject_prefix)]
    }

    /// Subject an action is published to
    ///
    /// `auth:token_invalid` becomes `<prefix>.auth.token_invalid`. Characters
    /// that are not legal in a subject token are replaced with `_`.
    pub fn action_subject(&self, action: &str) -> String {
        let tokens: Vec<String> = action
            .split(':')
            .map(|token| {
                let cleaned: String = token
                    .chars()
                    .map(|c| match c {
                        '.' | '*' | '>' => '_',
                        c if c.is_whitespace() => '_',
                        c => c,
                    })
                    .collect();
                if cleaned.is_empty() {
                    "_".to_string()
                } else {
                    cleaned
                }
            })
            .collect();
        format!("{}.{}", self.subject_prefix, tokens.join("."))
    }

    /// Wildcard subject matching every audit event
    pub fn all_events_subject(&self) -> String {
        format!("{}.>", self.subject_prefix)
    }
}
