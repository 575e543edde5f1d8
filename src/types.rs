use std::net::SocketAddr;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// One accepted HTTP request, moved into the dispatcher exactly once.
#[derive(Debug)]
pub struct InboundCallback {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source_address: Option<SocketAddr>,
}

impl InboundCallback {
    pub fn new(
        method: Method,
        path: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
        source_address: Option<SocketAddr>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            received_at: Utc::now(),
            method,
            path: path.into(),
            headers,
            body,
            source_address,
        }
    }

    /// JSON-friendly view: body parsed as JSON, falling back to a string.
    pub fn to_record(&self) -> CallbackRecord {
        let body: serde_json::Value = serde_json::from_slice(&self.body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&self.body).into())
        });

        let headers: serde_json::Map<String, serde_json::Value> = self
            .headers
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|s| (k.to_string(), serde_json::Value::String(s.to_string())))
            })
            .collect();

        CallbackRecord {
            id: self.id.to_string(),
            received_at: self.received_at,
            method: self.method.to_string(),
            path: self.path.clone(),
            source_address: self.source_address.map(|a| a.to_string()),
            headers: serde_json::Value::Object(headers),
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackRecord {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub source_address: Option<String>,
    pub headers: serde_json::Value,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReason {
    Accepted,
    Backpressure,
    PipelineFailed(String),
}

/// Outcome of handing a callback to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub accepted: bool,
    pub reason: DeliveryReason,
}

impl DeliveryResult {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: DeliveryReason::Accepted,
        }
    }

    pub fn backpressure() -> Self {
        Self {
            accepted: false,
            reason: DeliveryReason::Backpressure,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: DeliveryReason::PipelineFailed(message.into()),
        }
    }
}

/// Token for an active upstream registration. Consumed by unregister.
#[derive(Debug, PartialEq, Eq)]
pub struct RegistrationHandle {
    id: String,
    url: String,
}

impl RegistrationHandle {
    pub(crate) fn new(id: String, url: String) -> Self {
        Self { id, url }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
