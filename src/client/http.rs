use reqwest::{Client, Response};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::client::{error_detail, unwrap_envelope, AnalyticsBackend};
use crate::config::Config;
use crate::error::{PanelError, PanelResult};
use crate::logging::{log, log_transport_error, obj, v_str, Domain, Level, ProfileScope};
use crate::schema::{sheet_list, SchemaPayload, TransformResponse};
use crate::validation::{ForecastRequest, TrainingRequest, TransformRequest};

pub struct HttpBackend {
    client: Client,
    base: String,
    health_url: String,
    request_timeout: Duration,
    health_timeout: Duration,
}

impl HttpBackend {
    pub fn new(cfg: &Config) -> PanelResult<Self> {
        // Reject a malformed base before any request is built.
        Url::parse(&cfg.api_base_url)?;
        let client = Client::builder().timeout(cfg.request_timeout()).build()?;
        Ok(Self {
            client,
            base: cfg.api_base_url.trim_end_matches('/').to_string(),
            health_url: cfg.health_url(),
            request_timeout: cfg.request_timeout(),
            health_timeout: Duration::from_secs(cfg.health_timeout_secs),
        })
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> PanelResult<Url> {
        let raw = format!("{}{}", self.base, path);
        let url = if params.is_empty() {
            Url::parse(&raw)?
        } else {
            Url::parse_with_params(&raw, params)?
        };
        Ok(url)
    }

    fn eda_params<'a>(filename: &'a str, sheet: Option<&'a str>) -> Vec<(&'a str, &'a str)> {
        let mut params = vec![("filename", filename)];
        if let Some(sheet) = sheet.filter(|s| !s.is_empty()) {
            params.push(("sheet_name", sheet));
        }
        params
    }

    async fn read_body(operation: &str, resp: Response) -> PanelResult<Value> {
        let status = resp.status();
        let text = resp.text().await?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        if !status.is_success() {
            let msg = error_detail(&body)
                .or_else(|| status.canonical_reason().map(str::to_string))
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            log_transport_error(operation, &msg);
            return Err(PanelError::Transport(msg));
        }
        if body.is_null() && !text.trim().is_empty() {
            return Err(PanelError::Shape(format!("{} returned non-JSON body", operation)));
        }
        unwrap_envelope(body).map_err(|e| {
            log_transport_error(operation, &e.to_string());
            e
        })
    }

    fn timed_out(&self, operation: &str, err: reqwest::Error, limit: Duration) -> PanelError {
        if err.is_timeout() {
            log_transport_error(operation, "timed out");
            PanelError::Timeout { operation: operation.to_string(), secs: limit.as_secs() }
        } else {
            log_transport_error(operation, &err.to_string());
            PanelError::Transport(err.to_string())
        }
    }

    async fn get(&self, operation: &str, path: &str, params: &[(&str, &str)]) -> PanelResult<Value> {
        let _scope = ProfileScope::with_context("http_get", &[("operation", v_str(operation))]);
        let url = self.endpoint(path, params)?;
        log(Level::Debug, Domain::Transport, "request", obj(&[("url", v_str(url.as_str()))]));
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.timed_out(operation, e, self.request_timeout))?;
        Self::read_body(operation, resp).await
    }

    async fn post(&self, operation: &str, path: &str, body: &Value) -> PanelResult<Value> {
        let _scope = ProfileScope::with_context("http_post", &[("operation", v_str(operation))]);
        let url = self.endpoint(path, &[])?;
        log(Level::Debug, Domain::Transport, "request", obj(&[("url", v_str(url.as_str()))]));
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.timed_out(operation, e, self.request_timeout))?;
        Self::read_body(operation, resp).await
    }
}

#[async_trait::async_trait]
impl AnalyticsBackend for HttpBackend {
    async fn fetch_schema(&self, filename: &str, sheet: Option<&str>) -> PanelResult<SchemaPayload> {
        let data = self.get("schema", "/eda/summary", &Self::eda_params(filename, sheet)).await?;
        SchemaPayload::from_value(&data)
    }

    async fn list_sheets(&self, filename: &str) -> PanelResult<Vec<String>> {
        let data = self.get("list_sheets", "/list-sheets", &[("filename", filename)]).await?;
        sheet_list(&data)
    }

    async fn summary(&self, filename: &str, sheet: Option<&str>) -> PanelResult<Value> {
        self.get("summary", "/eda/summary", &Self::eda_params(filename, sheet)).await
    }

    async fn correlation(&self, filename: &str, sheet: Option<&str>, method: &str) -> PanelResult<Value> {
        let mut params = Self::eda_params(filename, sheet);
        params.push(("method", method));
        self.get("correlation", "/eda/correlation", &params).await
    }

    async fn stationarity(&self, filename: &str, sheet: Option<&str>, value_column: &str) -> PanelResult<Value> {
        let mut params = Self::eda_params(filename, sheet);
        params.push(("value_column", value_column));
        self.get("stationarity", "/eda/stationarity", &params).await
    }

    async fn seasonality(
        &self,
        filename: &str,
        sheet: Option<&str>,
        date_column: &str,
        value_column: &str,
    ) -> PanelResult<Value> {
        let mut params = Self::eda_params(filename, sheet);
        params.push(("date_column", date_column));
        params.push(("value_column", value_column));
        self.get("seasonality", "/eda/seasonality", &params).await
    }

    async fn plots(
        &self,
        filename: &str,
        sheet: Option<&str>,
        date_column: Option<&str>,
        value_column: Option<&str>,
    ) -> PanelResult<Value> {
        let mut params = Self::eda_params(filename, sheet);
        params.push(("date_column", date_column.unwrap_or("")));
        params.push(("value_column", value_column.unwrap_or("")));
        self.get("plots", "/eda/plots", &params).await
    }

    async fn train(&self, request: &TrainingRequest) -> PanelResult<Value> {
        self.post("train", "/train/model", &request.to_body()).await
    }

    async fn fix_stationarity(&self, request: &TransformRequest) -> PanelResult<TransformResponse> {
        let data = self
            .post("fix_stationarity", "/preprocess/fix-stationarity", &request.to_body("order"))
            .await?;
        TransformResponse::from_value(&data)
    }

    async fn fix_seasonality(&self, request: &TransformRequest) -> PanelResult<TransformResponse> {
        let data = self
            .post("fix_seasonality", "/preprocess/fix-seasonality", &request.to_body("period"))
            .await?;
        TransformResponse::from_value(&data)
    }

    async fn forecast(&self, request: &ForecastRequest) -> PanelResult<Value> {
        self.post("forecast", "/forecast/predict", &request.to_body()).await
    }

    async fn health(&self) -> PanelResult<bool> {
        let resp = self
            .client
            .get(&self.health_url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| self.timed_out("health", e, self.health_timeout))?;
        Ok(resp.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_encodes_params() {
        let backend = HttpBackend::new(&Config::default()).unwrap();
        let url = backend
            .endpoint("/eda/summary", &HttpBackend::eda_params("my sales.csv", Some("Q1 2024")))
            .unwrap();
        assert_eq!(url.path(), "/api/eda/summary");
        assert_eq!(url.query(), Some("filename=my+sales.csv&sheet_name=Q1+2024"));
    }

    #[test]
    fn test_empty_sheet_omitted() {
        let params = HttpBackend::eda_params("f.csv", Some(""));
        assert_eq!(params, vec![("filename", "f.csv")]);
    }

    #[test]
    fn test_bad_base_url_rejected() {
        let cfg = Config { api_base_url: "not a url".to_string(), ..Config::default() };
        assert!(matches!(HttpBackend::new(&cfg), Err(PanelError::Transport(_))));
    }
}
