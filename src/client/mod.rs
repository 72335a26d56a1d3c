use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::error::{PanelError, PanelResult};
use crate::schema::{SchemaPayload, TransformResponse};
use crate::validation::{ForecastRequest, TrainingRequest, TransformRequest};

pub mod http;
pub mod stub;

pub use http::HttpBackend;
pub use stub::StubBackend;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Http,
    Null,
}

impl BackendKind {
    pub fn from_env() -> Self {
        match std::env::var("BACKEND").unwrap_or_else(|_| "http".to_string()).as_str() {
            "null" | "offline" => BackendKind::Null,
            _ => BackendKind::Http,
        }
    }

    pub fn build(self, cfg: &Config) -> Result<Box<dyn AnalyticsBackend + Send + Sync>> {
        match self {
            BackendKind::Http => Ok(Box::new(HttpBackend::new(cfg)?)),
            BackendKind::Null => Ok(Box::new(StubBackend::offline())),
        }
    }
}

/// Remote analytics service: schema, exploratory queries, training,
/// preprocessing and forecasting.
///
/// Every method returns the payload with the `{status, data}` envelope
/// already removed.
#[async_trait]
pub trait AnalyticsBackend {
    async fn fetch_schema(&self, filename: &str, sheet: Option<&str>) -> PanelResult<SchemaPayload>;
    /// Sheet names of an uploaded workbook, in workbook order.
    async fn list_sheets(&self, filename: &str) -> PanelResult<Vec<String>>;
    async fn summary(&self, filename: &str, sheet: Option<&str>) -> PanelResult<Value>;
    async fn correlation(&self, filename: &str, sheet: Option<&str>, method: &str) -> PanelResult<Value>;
    async fn stationarity(&self, filename: &str, sheet: Option<&str>, value_column: &str) -> PanelResult<Value>;
    async fn seasonality(
        &self,
        filename: &str,
        sheet: Option<&str>,
        date_column: &str,
        value_column: &str,
    ) -> PanelResult<Value>;
    async fn plots(
        &self,
        filename: &str,
        sheet: Option<&str>,
        date_column: Option<&str>,
        value_column: Option<&str>,
    ) -> PanelResult<Value>;
    async fn train(&self, request: &TrainingRequest) -> PanelResult<Value>;
    async fn fix_stationarity(&self, request: &TransformRequest) -> PanelResult<TransformResponse>;
    async fn fix_seasonality(&self, request: &TransformRequest) -> PanelResult<TransformResponse>;
    async fn forecast(&self, request: &ForecastRequest) -> PanelResult<Value>;
    async fn health(&self) -> PanelResult<bool>;
}

/// Human-readable message from an error body.
///
/// `detail` may be a string or a list of `{loc, msg}` validation entries.
pub fn error_detail(body: &Value) -> Option<String> {
    let detail = body
        .get("detail")
        .or_else(|| body.get("error"))
        .or_else(|| body.get("message"))?;
    match detail {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let msgs: Vec<String> = items
                .iter()
                .filter_map(|i| match i {
                    Value::String(s) => Some(s.clone()),
                    other => other.get("msg").and_then(Value::as_str).map(str::to_string),
                })
                .collect();
            (!msgs.is_empty()).then(|| msgs.join("; "))
        }
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Strip the `{status, data}` envelope.
///
/// A body without `status` is returned unchanged. `status != "success"` is a
/// transport-level failure carrying the backend's message.
pub fn unwrap_envelope(body: Value) -> PanelResult<Value> {
    let status = match body.get("status").and_then(Value::as_str) {
        Some(s) => s.to_string(),
        None => return Ok(body),
    };
    if status != "success" {
        let msg = error_detail(&body).unwrap_or_else(|| format!("backend reported status {}", status));
        return Err(PanelError::Transport(msg));
    }
    match body {
        Value::Object(mut obj) => Ok(obj.remove("data").unwrap_or(Value::Object(obj))),
        other => Ok(other),
    }
}
