//! NATS JetStream client: audit stream append/scan and alert bucket CAS

use super::config::{NatsConfig, StorageType};
use crate::error::{AuditError, Result};
use crate::provider::AlertMutation;
use crate::types::{Alert, AlertDraft, AuditEvent, NewAuditEvent, WindowQuery};
use async_nats::jetstream::{self, consumer::DeliverPolicy, kv};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Key holding the last assigned alert id
const ALERT_SEQ_KEY: &str = "meta.alert_seq";
const ALERT_KEY_PREFIX: &str = "alert.";

/// Retries for revision-checked updates before giving up
const CAS_ATTEMPTS: usize = 16;

/// Server publish time may trail the payload timestamp; window scans start this much earlier
///
/// Timestamps are monotonic per client only. Several processes appending to
/// one stream can still interleave slightly out of order; this margin is
/// what absorbs that.
const CLOCK_SKEW_SECS: i64 = 5;

/// NATS JetStream client
///
/// The audit trail is a stream whose sequence numbers are the event ids.
/// Alerts live in a key-value bucket keyed `alert.<id>`.
pub struct NatsClient {
    /// NATS client connection
    client: async_nats::Client,

    /// JetStream context
    jetstream: jetstream::Context,

    /// Audit stream handle (Mutex for methods requiring &mut self)
    stream: Mutex<jetstream::stream::Stream>,

    /// Alert bucket
    alerts: kv::Store,

    /// Timestamp of the last published event, held across the publish
    last_timestamp: Mutex<DateTime<Utc>>,

    /// Configuration
    config: Arc<NatsConfig>,
}

impl NatsClient {
    /// Connect to NATS and initialize the audit stream and alert bucket
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| AuditError::storage(&format!("connect {}", config.url), e))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let stream = ensure_stream(&jetstream, &config).await?;
        let alerts = ensure_alert_bucket(&jetstream, &config).await?;

        Ok(Self {
            client,
            jetstream,
            stream: Mutex::new(stream),
            alerts,
            last_timestamp: Mutex::new(DateTime::<Utc>::MIN_UTC),
            config: Arc::new(config),
        })
    }

    /// Publish an audit event and wait for the stream ack
    ///
    /// The ack's stream sequence becomes the event id. The timestamp lock is
    /// held until the message is handed to the connection, so events from
    /// this client never carry a timestamp older than an earlier sequence.
    pub async fn append_event(&self, event: NewAuditEvent) -> Result<AuditEvent> {
        let subject = self.config.action_subject(&event.action);

        let (mut record, pending) = {
            let mut last = self.last_timestamp.lock().await;
            let timestamp = next_timestamp(*last, Utc::now());
            let record = event.into_event(0, timestamp);
            let payload = serde_json::to_vec(&record)?;

            let pending = self
                .jetstream
                .publish(subject.clone(), Bytes::from(payload))
                .await
                .map_err(|e| AuditError::storage(&format!("publish to '{}'", subject), e))?;
            *last = timestamp;
            (record, pending)
        };

        let ack = pending
            .await
            .map_err(|e| AuditError::storage(&format!("ack for '{}'", subject), e))?;

        record.id = ack.sequence;

        tracing::debug!(
            event_id = record.id,
            subject = %subject,
            action = %record.action,
            "Audit event appended"
        );

        Ok(record)
    }

    /// Scan the window's action subject and keep exact matches
    ///
    /// The scan runs forward from the window start and stops at `up_to_id`.
    /// If `window_scan_limit` runs out first the count would be short, so
    /// the scan fails instead and the rule is recorded as degraded.
    pub async fn window(&self, query: &WindowQuery) -> Result<Vec<AuditEvent>> {
        let start = to_offset_datetime(query.since - chrono::Duration::seconds(CLOCK_SKEW_SECS));
        let limit = self.config.window_scan_limit;

        let scanned = self
            .scan_until(
                self.config.action_subject(&query.action),
                DeliverPolicy::ByStartTime { start_time: start },
                limit,
                Some(query.up_to_id),
            )
            .await?;

        if window_truncated(&scanned, limit, query.up_to_id) {
            tracing::warn!(
                action = %query.action,
                limit,
                up_to_id = query.up_to_id,
                "Window scan hit its limit before the trigger"
            );
            return Err(AuditError::StorageUnavailable(format!(
                "window scan for '{}' reached {} events before event {}",
                query.action, limit, query.up_to_id
            )));
        }

        Ok(scanned.into_iter().filter(|e| query.matches(e)).collect())
    }

    /// Most recent events across all actions, newest first
    pub async fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let info = self.stream_info().await?;
        if info.messages == 0 || limit == 0 {
            return Ok(Vec::new());
        }

        let start = info
            .last_sequence
            .saturating_sub(limit as u64 - 1)
            .max(info.first_sequence);

        let mut events = self
            .scan(
                self.config.all_events_subject(),
                DeliverPolicy::ByStartSequence {
                    start_sequence: start,
                },
                limit,
            )
            .await?;
        events.reverse();
        Ok(events)
    }

    /// Fetch one event by stream sequence
    pub async fn get_event(&self, id: u64) -> Result<Option<AuditEvent>> {
        if id == 0 {
            return Ok(None);
        }
        let events = self
            .scan(
                self.config.all_events_subject(),
                DeliverPolicy::ByStartSequence { start_sequence: id },
                1,
            )
            .await?;
        Ok(events.into_iter().find(|e| e.id == id))
    }

    /// Purge the audit stream; sequence numbers keep increasing afterwards
    pub async fn purge_events(&self) -> Result<u64> {
        let response = self
            .stream
            .lock()
            .await
            .purge()
            .await
            .map_err(|e| AuditError::storage("purge audit stream", e))?;

        tracing::info!(
            stream = %self.config.stream_name,
            purged = response.purged,
            "Audit stream purged"
        );
        Ok(response.purged)
    }

    /// Create an alert under a freshly reserved id
    pub async fn insert_alert(&self, draft: AlertDraft) -> Result<Alert> {
        let id = self.next_alert_id().await?;
        let alert = draft.into_alert(id, Utc::now());
        let payload = serde_json::to_vec(&alert)?;

        self.alerts
            .create(alert_key(id), Bytes::from(payload))
            .await
            .map_err(|e| AuditError::storage(&format!("create alert {}", id), e))?;

        Ok(alert)
    }

    pub async fn get_alert(&self, id: u64) -> Result<Option<Alert>> {
        Ok(self.alert_entry(id).await?.map(|(alert, _)| alert))
    }

    /// Revision-checked read-modify-write of an alert
    pub async fn modify_alert(&self, id: u64, mutate: AlertMutation<'_>) -> Result<Alert> {
        for _ in 0..CAS_ATTEMPTS {
            let (mut alert, revision) = self
                .alert_entry(id)
                .await?
                .ok_or_else(|| AuditError::NotFound(format!("Alert not found: {}", id)))?;

            mutate(&mut alert)?;
            let payload = serde_json::to_vec(&alert)?;

            match self.alerts.update(alert_key(id), Bytes::from(payload), revision).await {
                Ok(_) => return Ok(alert),
                Err(e) => {
                    tracing::debug!(alert_id = id, error = %e, "Alert update conflict, retrying");
                }
            }
        }

        Err(AuditError::StorageUnavailable(format!(
            "alert {} update did not settle after {} attempts",
            id, CAS_ATTEMPTS
        )))
    }

    /// Most recent alerts (highest ids), newest first
    pub async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        let ids = self.alert_ids().await?;
        let mut alerts = Vec::with_capacity(limit.min(ids.len()));
        for id in ids.into_iter().rev() {
            if alerts.len() >= limit {
                break;
            }
            if let Some(alert) = self.get_alert(id).await? {
                alerts.push(alert);
            }
        }
        Ok(alerts)
    }

    pub async fn delete_alert(&self, id: u64) -> Result<()> {
        if self.alert_entry(id).await?.is_none() {
            return Err(AuditError::NotFound(format!("Alert not found: {}", id)));
        }
        self.alerts
            .delete(alert_key(id))
            .await
            .map_err(|e| AuditError::storage(&format!("delete alert {}", id), e))
    }

    /// Delete every alert; the id sequence is left in place
    pub async fn purge_alerts(&self) -> Result<u64> {
        let ids = self.alert_ids().await?;
        for id in &ids {
            self.alerts
                .delete(alert_key(*id))
                .await
                .map_err(|e| AuditError::storage(&format!("delete alert {}", id), e))?;
        }
        Ok(ids.len() as u64)
    }

    pub async fn alert_count(&self) -> Result<u64> {
        Ok(self.alert_ids().await?.len() as u64)
    }

    /// Get stream info
    pub async fn stream_info(&self) -> Result<StreamInfo> {
        let mut stream = self.stream.lock().await;
        let info = stream
            .info()
            .await
            .map_err(|e| AuditError::storage("audit stream info", e))?;

        Ok(StreamInfo {
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
            consumer_count: info.state.consumer_count,
        })
    }

    /// Get the underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    async fn scan(
        &self,
        filter_subject: String,
        deliver_policy: DeliverPolicy,
        max: usize,
    ) -> Result<Vec<AuditEvent>> {
        self.scan_until(filter_subject, deliver_policy, max, None).await
    }

    /// Read up to `max` events through a throwaway pull consumer
    ///
    /// `fetch` returns what the stream holds right now instead of waiting
    /// for `max` messages to arrive. Events past `stop_after` end the scan.
    async fn scan_until(
        &self,
        filter_subject: String,
        deliver_policy: DeliverPolicy,
        max: usize,
        stop_after: Option<u64>,
    ) -> Result<Vec<AuditEvent>> {
        let config = jetstream::consumer::pull::Config {
            filter_subject,
            deliver_policy,
            ack_policy: jetstream::consumer::AckPolicy::None,
            inactive_threshold: Duration::from_secs(30),
            ..Default::default()
        };

        let consumer = self
            .stream
            .lock()
            .await
            .create_consumer(config)
            .await
            .map_err(|e| AuditError::storage("create scan consumer", e))?;

        let batch = consumer
            .fetch()
            .max_messages(max)
            .expires(Duration::from_secs(self.config.request_timeout_secs))
            .messages()
            .await
            .map_err(|e| AuditError::storage("fetch audit events", e))?;

        let mut events = Vec::new();
        let mut batch = std::pin::pin!(batch);
        while let Some(msg) = batch.next().await {
            let msg = msg.map_err(|e| AuditError::storage("read audit event", e))?;
            match decode_event(&msg) {
                Some(event) if stop_after.is_some_and(|last| event.id > last) => break,
                Some(event) => events.push(event),
                None => tracing::warn!(subject = %msg.subject, "Skipping undecodable audit event"),
            }
            if events.len() >= max {
                break;
            }
        }

        Ok(events)
    }

    async fn alert_entry(&self, id: u64) -> Result<Option<(Alert, u64)>> {
        let entry = self
            .alerts
            .entry(alert_key(id))
            .await
            .map_err(|e| AuditError::storage(&format!("read alert {}", id), e))?;

        match entry {
            Some(entry) if entry.operation == kv::Operation::Put => {
                let alert: Alert = serde_json::from_slice(&entry.value)?;
                Ok(Some((alert, entry.revision)))
            }
            _ => Ok(None),
        }
    }

    async fn alert_ids(&self) -> Result<Vec<u64>> {
        let keys = self
            .alerts
            .keys()
            .await
            .map_err(|e| AuditError::storage("list alert keys", e))?;

        let mut ids = Vec::new();
        let mut keys = std::pin::pin!(keys);
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| AuditError::storage("list alert keys", e))?;
            if let Some(id) = key
                .strip_prefix(ALERT_KEY_PREFIX)
                .and_then(|raw| raw.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Reserve the next alert id with a compare-and-set on the sequence key
    async fn next_alert_id(&self) -> Result<u64> {
        for _ in 0..CAS_ATTEMPTS {
            let current = self
                .alerts
                .entry(ALERT_SEQ_KEY)
                .await
                .map_err(|e| AuditError::storage("read alert sequence", e))?;

            let attempt = match current {
                Some(entry) if entry.operation == kv::Operation::Put => {
                    let last = std::str::from_utf8(&entry.value)
                        .ok()
                        .and_then(|raw| raw.parse::<u64>().ok())
                        .ok_or_else(|| {
                            AuditError::StorageUnavailable("alert sequence is corrupt".to_string())
                        })?;
                    let next = last + 1;
                    self.alerts
                        .update(ALERT_SEQ_KEY, Bytes::from(next.to_string()), entry.revision)
                        .await
                        .map(|_| next)
                        .map_err(|e| e.to_string())
                }
                _ => self
                    .alerts
                    .create(ALERT_SEQ_KEY, Bytes::from_static(b"1"))
                    .await
                    .map(|_| 1)
                    .map_err(|e| e.to_string()),
            };

            match attempt {
                Ok(id) => return Ok(id),
                Err(reason) => {
                    tracing::debug!(reason = %reason, "Alert sequence contention, retrying");
                }
            }
        }

        Err(AuditError::StorageUnavailable(format!(
            "alert id reservation did not settle after {} attempts",
            CAS_ATTEMPTS
        )))
    }
}

/// Summary of stream state
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub consumer_count: usize,
}

/// Timestamp for the next event: wall clock, never behind the previous one
fn next_timestamp(last: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    now.max(last)
}

/// A full scan that never reached `up_to_id` may have missed window events
fn window_truncated(scanned: &[AuditEvent], limit: usize, up_to_id: u64) -> bool {
    scanned.len() >= limit && scanned.last().map_or(true, |e| e.id < up_to_id)
}

fn alert_key(id: u64) -> String {
    format!("{}{}", ALERT_KEY_PREFIX, id)
}

/// Decode a stream message, taking the id from its stream sequence
fn decode_event(msg: &jetstream::Message) -> Option<AuditEvent> {
    let info = msg.info().ok()?;
    let mut event: AuditEvent = serde_json::from_slice(&msg.payload).ok()?;
    event.id = info.stream_sequence;
    Some(event)
}

fn to_offset_datetime(ts: DateTime<Utc>) -> time::OffsetDateTime {
    let nanos = ts.timestamp_nanos_opt().unwrap_or_default() as i128;
    time::OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
}

fn storage_type(storage: StorageType) -> jetstream::stream::StorageType {
    match storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Ensure the audit stream exists with the correct configuration
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream> {
    let max_age = if config.max_age_secs > 0 {
        Duration::from_secs(config.max_age_secs)
    } else {
        Duration::ZERO
    };

    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: config.stream_subjects(),
        storage: storage_type(config.storage),
        max_age,
        max_bytes: config.max_bytes,
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js
        .get_or_create_stream(stream_config)
        .await
        .map_err(|e| {
            AuditError::storage(&format!("create/get stream '{}'", config.stream_name), e)
        })?;

    tracing::info!(
        stream = %config.stream_name,
        subjects = ?config.stream_subjects(),
        "Audit stream ready"
    );

    Ok(stream)
}

/// Ensure the alert key-value bucket exists
async fn ensure_alert_bucket(js: &jetstream::Context, config: &NatsConfig) -> Result<kv::Store> {
    if let Ok(store) = js.get_key_value(config.alert_bucket.as_str()).await {
        return Ok(store);
    }

    let store = js
        .create_key_value(kv::Config {
            bucket: config.alert_bucket.clone(),
            history: 1,
            storage: storage_type(config.storage),
            ..Default::default()
        })
        .await
        .map_err(|e| {
            AuditError::storage(&format!("create alert bucket '{}'", config.alert_bucket), e)
        })?;

    tracing::info!(bucket = %config.alert_bucket, "Alert bucket ready");
    Ok(store)
}
