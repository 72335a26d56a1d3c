use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// Root of the analytics API, including the `/api` prefix.
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub analysis_timeout_secs: u64,
    pub schema_timeout_secs: u64,
    pub feature_importance_top_n: usize,
    /// Allowed deviation of train+validation+test from 1.0.
    pub split_tolerance: f64,
    pub correlation_method: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api".to_string(),
            request_timeout_secs: 30,
            health_timeout_secs: 3,
            analysis_timeout_secs: 30,
            schema_timeout_secs: 15,
            feature_importance_top_n: 10,
            split_tolerance: 0.01,
            correlation_method: "pearson".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            api_base_url: std::env::var("API_BASE_URL").unwrap_or(d.api_base_url),
            request_timeout_secs: std::env::var("REQUEST_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.request_timeout_secs),
            health_timeout_secs: std::env::var("HEALTH_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.health_timeout_secs),
            analysis_timeout_secs: std::env::var("ANALYSIS_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.analysis_timeout_secs),
            schema_timeout_secs: std::env::var("SCHEMA_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.schema_timeout_secs),
            feature_importance_top_n: std::env::var("FEATURE_IMPORTANCE_TOP_N").ok().and_then(|v| v.parse().ok()).unwrap_or(d.feature_importance_top_n),
            split_tolerance: std::env::var("SPLIT_TOLERANCE").ok().and_then(|v| v.parse().ok()).unwrap_or(d.split_tolerance),
            correlation_method: std::env::var("CORRELATION_METHOD").unwrap_or(d.correlation_method),
        }
    }

    /// Health endpoint lives at the host root, outside `/api`.
    pub fn health_url(&self) -> String {
        let base = self.api_base_url.trim_end_matches('/');
        let root = base.strip_suffix("/api").unwrap_or(base);
        format!("{}/health", root)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    pub fn schema_timeout(&self) -> Duration {
        Duration::from_secs(self.schema_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_url_strips_api_prefix() {
        let cfg = Config::default();
        assert_eq!(cfg.health_url(), "http://localhost:8000/health");
        let cfg = Config { api_base_url: "https://panel.example/api/".to_string(), ..Config::default() };
        assert_eq!(cfg.health_url(), "https://panel.example/health");
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.health_timeout_secs, 3);
        assert_eq!(cfg.feature_importance_top_n, 10);
    }
}
