//! Webhook payload parsing (§6): turns `{doc_id, timestamp}` into a
//! `(relay_id, resource_id, timestamp)` triple ready for
//! `enqueue_change_notification`. The HTTP route itself lives in the
//! `sync-server` binary; this module is the narrowly-scoped parsing logic
//! that's actually in scope.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub doc_id: Option<String>,
    pub timestamp: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub relay_id: String,
    pub resource_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Splits a compound id (`relay-uuid` + `-` + `resource-uuid`) into its two
/// parts. The only place outside `cds_client` allowed to know this format
/// exists — the result is two bare ids, never recombined.
fn split_compound_id(doc_id: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = doc_id.split('-').collect();
    if parts.len() != 10 {
        return None;
    }
    let relay_id = parts[0..5].join("-");
    let resource_id = parts[5..10].join("-");
    if crate::resource::is_uuid(&relay_id) && crate::resource::is_uuid(&resource_id) {
        Some((relay_id, resource_id))
    } else {
        None
    }
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let secs = n.as_f64()?;
            Utc.timestamp_opt(secs.trunc() as i64, 0).single()
        }
        _ => None,
    }
}

/// Missing `doc_id` or `timestamp`, or either failing to parse, is rejected
/// with no queue effect — the caller simply gets `None` and logs a warning.
pub fn parse_webhook_payload(payload: &WebhookPayload) -> Option<ChangeNotification> {
    let doc_id = payload.doc_id.as_deref()?;
    let timestamp_value = payload.timestamp.as_ref()?;

    let (relay_id, resource_id) = match split_compound_id(doc_id) {
        Some(pair) => pair,
        None => {
            tracing::warn!("webhook doc_id does not split into two uuids: {doc_id}");
            return None;
        }
    };

    let timestamp = match parse_timestamp(timestamp_value) {
        Some(ts) => ts,
        None => {
            tracing::warn!("webhook timestamp could not be parsed: {timestamp_value}");
            return None;
        }
    };

    Some(ChangeNotification {
        relay_id,
        resource_id,
        timestamp,
    })
}
