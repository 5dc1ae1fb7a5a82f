use chrono::{DateTime, Local};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::router::Provider;

/// Header map as captured on the wire: name to ordered value list, with
/// header name insertion order preserved through serialization.
pub type Headers = IndexMap<String, Vec<String>>;

/// A single proxied exchange, immutable once handed to the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: String,
    pub timestamp: DateTime<Local>,
    pub provider: Provider,
    pub request: RequestData,
    pub response: ResponseData,
    #[serde(rename = "responseSize")]
    pub response_size: u64,
    pub timing: TimingData,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestData {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseData {
    pub status: u16,
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    pub streaming: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingData {
    pub started_at: DateTime<Local>,
    pub completed_at: DateTime<Local>,
    pub duration_ms: i64,
}

impl Recording {
    /// Creates a skeleton recording at request time. The id carries a local
    /// date prefix so the containing day file can be found without the index.
    pub fn new(
        provider: Provider,
        method: &str,
        path: &str,
        query: &str,
        started_at: DateTime<Local>,
    ) -> Self {
        let timestamp = Local::now();
        let id = format!("{}-{}", timestamp.format("%Y%m%d"), Uuid::new_v4());

        Self {
            id,
            timestamp,
            provider,
            request: RequestData {
                method: method.to_owned(),
                path: path.to_owned(),
                query: query.to_owned(),
                headers: Headers::new(),
                body: None,
            },
            response: ResponseData {
                status: 0,
                headers: Headers::new(),
                body: None,
                streaming: false,
            },
            response_size: 0,
            timing: TimingData {
                started_at,
                completed_at: started_at,
                duration_ms: 0,
            },
            error: String::new(),
        }
    }

    /// Stamps the completion instant; the duration never goes negative even
    /// if the wall clock stepped backwards mid-request.
    pub fn finish_timing(&mut self, completed_at: DateTime<Local>) {
        self.timing.completed_at = completed_at;
        self.timing.duration_ms = (completed_at - self.timing.started_at)
            .num_milliseconds()
            .max(0);
    }
}
