use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::client::{unwrap_envelope, AnalyticsBackend};
use crate::error::{PanelError, PanelResult};
use crate::schema::{sheet_list, SchemaPayload, TransformResponse};
use crate::validation::{ForecastRequest, TrainingRequest, TransformRequest};

/// Backend with canned answers keyed by operation name
/// (`schema`, `list_sheets`, `summary`, `correlation`, `stationarity`,
/// `seasonality`, `plots`, `train`, `fix_stationarity`, `fix_seasonality`,
/// `forecast`, `health`). Unscripted operations fail as if offline.
#[derive(Default)]
pub struct StubBackend {
    replies: HashMap<String, PanelResult<Value>>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<String>>,
}

impl StubBackend {
    pub fn offline() -> Self {
        Self::default()
    }

    /// Reply with `body`; a `{status, data}` envelope is unwrapped as the
    /// HTTP backend would.
    pub fn reply(mut self, operation: &str, body: Value) -> Self {
        self.replies.insert(operation.to_string(), Ok(body));
        self
    }

    pub fn fail(mut self, operation: &str, err: PanelError) -> Self {
        self.replies.insert(operation.to_string(), Err(err));
        self
    }

    pub fn delay(mut self, operation: &str, by: Duration) -> Self {
        self.delays.insert(operation.to_string(), by);
        self
    }

    /// Operations called so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    async fn answer(&self, operation: &str) -> PanelResult<Value> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(operation.to_string());
        }
        if let Some(by) = self.delays.get(operation) {
            tokio::time::sleep(*by).await;
        }
        match self.replies.get(operation) {
            Some(Ok(body)) => unwrap_envelope(body.clone()),
            Some(Err(err)) => Err(err.clone()),
            None => Err(PanelError::Transport("no backend configured".to_string())),
        }
    }
}

#[async_trait::async_trait]
impl AnalyticsBackend for StubBackend {
    async fn fetch_schema(&self, _filename: &str, _sheet: Option<&str>) -> PanelResult<SchemaPayload> {
        SchemaPayload::from_value(&self.answer("schema").await?)
    }

    async fn list_sheets(&self, _filename: &str) -> PanelResult<Vec<String>> {
        sheet_list(&self.answer("list_sheets").await?)
    }

    async fn summary(&self, _filename: &str, _sheet: Option<&str>) -> PanelResult<Value> {
        self.answer("summary").await
    }

    async fn correlation(&self, _filename: &str, _sheet: Option<&str>, _method: &str) -> PanelResult<Value> {
        self.answer("correlation").await
    }

    async fn stationarity(&self, _filename: &str, _sheet: Option<&str>, _value_column: &str) -> PanelResult<Value> {
        self.answer("stationarity").await
    }

    async fn seasonality(
        &self,
        _filename: &str,
        _sheet: Option<&str>,
        _date_column: &str,
        _value_column: &str,
    ) -> PanelResult<Value> {
        self.answer("seasonality").await
    }

    async fn plots(
        &self,
        _filename: &str,
        _sheet: Option<&str>,
        _date_column: Option<&str>,
        _value_column: Option<&str>,
    ) -> PanelResult<Value> {
        self.answer("plots").await
    }

    async fn train(&self, _request: &TrainingRequest) -> PanelResult<Value> {
        self.answer("train").await
    }

    async fn fix_stationarity(&self, _request: &TransformRequest) -> PanelResult<TransformResponse> {
        TransformResponse::from_value(&self.answer("fix_stationarity").await?)
    }

    async fn fix_seasonality(&self, _request: &TransformRequest) -> PanelResult<TransformResponse> {
        TransformResponse::from_value(&self.answer("fix_seasonality").await?)
    }

    async fn forecast(&self, _request: &ForecastRequest) -> PanelResult<Value> {
        self.answer("forecast").await
    }

    async fn health(&self) -> PanelResult<bool> {
        match self.answer("health").await {
            Ok(_) => Ok(true),
            Err(PanelError::Transport(_)) if !self.replies.contains_key("health") => Ok(false),
            Err(err) => Err(err),
        }
    }
}
