//! Exploratory analysis fan-out.
//!
//! Five independent queries are issued together; each has its own timeout
//! and a failure in one never hides the others.

use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

use crate::client::AnalyticsBackend;
use crate::error::{PanelError, PanelResult};
use crate::logging::{log_section, log_validation_failure, v_str, ProfileScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSection {
    Summary,
    Correlation,
    Stationarity,
    Seasonality,
    Plots,
}

impl AnalysisSection {
    pub const ALL: [AnalysisSection; 5] = [
        AnalysisSection::Summary,
        AnalysisSection::Correlation,
        AnalysisSection::Stationarity,
        AnalysisSection::Seasonality,
        AnalysisSection::Plots,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisSection::Summary => "summary",
            AnalysisSection::Correlation => "correlation",
            AnalysisSection::Stationarity => "stationarity",
            AnalysisSection::Seasonality => "seasonality",
            AnalysisSection::Plots => "plots",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum SectionOutcome {
    Ready(Value),
    Failed(String),
    /// Not attempted because a required column was not chosen.
    Skipped,
}

impl SectionOutcome {
    fn label(&self) -> &'static str {
        match self {
            SectionOutcome::Ready(_) => "ready",
            SectionOutcome::Failed(_) => "failed",
            SectionOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub filename: String,
    pub sheet: Option<String>,
    pub date_column: Option<String>,
    pub value_column: Option<String>,
    pub correlation_method: String,
}

fn chosen(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.trim().is_empty())
}

impl AnalysisRequest {
    pub fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            sheet: None,
            date_column: None,
            value_column: None,
            correlation_method: "pearson".to_string(),
        }
    }

    pub fn with_columns(mut self, date_column: Option<&str>, value_column: Option<&str>) -> Self {
        self.date_column = date_column.map(str::to_string);
        self.value_column = value_column.map(str::to_string);
        self
    }

    pub fn with_sheet(mut self, sheet: &str) -> Self {
        self.sheet = Some(sheet.to_string());
        self
    }

    pub fn validate(&self) -> PanelResult<()> {
        if self.filename.trim().is_empty() {
            log_validation_failure("analysis", "Please enter filename");
            return Err(PanelError::validation("Please enter filename"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub filename: String,
    sections: Vec<(AnalysisSection, SectionOutcome)>,
}

impl AnalysisReport {
    pub fn get(&self, section: AnalysisSection) -> Option<&SectionOutcome> {
        self.sections.iter().find(|(s, _)| *s == section).map(|(_, o)| o)
    }

    pub fn sections(&self) -> &[(AnalysisSection, SectionOutcome)] {
        &self.sections
    }

    pub fn succeeded(&self) -> Vec<AnalysisSection> {
        self.matching(|o| matches!(o, SectionOutcome::Ready(_)))
    }

    pub fn failed(&self) -> Vec<(AnalysisSection, &str)> {
        self.sections
            .iter()
            .filter_map(|(s, o)| match o {
                SectionOutcome::Failed(msg) => Some((*s, msg.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn skipped(&self) -> Vec<AnalysisSection> {
        self.matching(|o| matches!(o, SectionOutcome::Skipped))
    }

    fn matching(&self, pred: impl Fn(&SectionOutcome) -> bool) -> Vec<AnalysisSection> {
        self.sections.iter().filter(|(_, o)| pred(o)).map(|(s, _)| *s).collect()
    }
}

async fn guarded<F>(section: AnalysisSection, limit: Duration, call: F) -> SectionOutcome
where
    F: Future<Output = PanelResult<Value>>,
{
    let outcome = match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => SectionOutcome::Ready(value),
        Ok(Err(err)) => SectionOutcome::Failed(err.to_string()),
        Err(_) => SectionOutcome::Failed(
            PanelError::Timeout { operation: section.as_str().to_string(), secs: limit.as_secs() }.to_string(),
        ),
    };
    let detail = match &outcome {
        SectionOutcome::Failed(msg) => Some(msg.as_str()),
        _ => None,
    };
    log_section(section.as_str(), outcome.label(), detail);
    outcome
}

/// Run every applicable section concurrently.
///
/// Stationarity needs a value column; seasonality needs both date and
/// value columns. The rest always run.
pub async fn run_analysis<B: AnalyticsBackend + ?Sized>(
    backend: &B,
    request: &AnalysisRequest,
    limit: Duration,
) -> PanelResult<AnalysisReport> {
    request.validate()?;
    let _scope = ProfileScope::with_context("analysis", &[("filename", v_str(&request.filename))]);

    let filename = request.filename.as_str();
    let sheet = chosen(&request.sheet);
    let date = chosen(&request.date_column);
    let value = chosen(&request.value_column);

    let (summary, correlation, stationarity, seasonality, plots) = tokio::join!(
        guarded(AnalysisSection::Summary, limit, backend.summary(filename, sheet)),
        guarded(
            AnalysisSection::Correlation,
            limit,
            backend.correlation(filename, sheet, &request.correlation_method)
        ),
        async {
            match value {
                Some(v) => guarded(AnalysisSection::Stationarity, limit, backend.stationarity(filename, sheet, v)).await,
                None => SectionOutcome::Skipped,
            }
        },
        async {
            match (date, value) {
                (Some(d), Some(v)) => {
                    guarded(AnalysisSection::Seasonality, limit, backend.seasonality(filename, sheet, d, v)).await
                }
                _ => SectionOutcome::Skipped,
            }
        },
        guarded(AnalysisSection::Plots, limit, backend.plots(filename, sheet, date, value)),
    );

    Ok(AnalysisReport {
        filename: request.filename.clone(),
        sections: vec![
            (AnalysisSection::Summary, summary),
            (AnalysisSection::Correlation, correlation),
            (AnalysisSection::Stationarity, stationarity),
            (AnalysisSection::Seasonality, seasonality),
            (AnalysisSection::Plots, plots),
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StubBackend;
    use serde_json::json;

    #[tokio::test]
    async fn test_partial_failure_is_reported_per_section() {
        let backend = StubBackend::offline()
            .reply("summary", json!({"status": "success", "data": {"rows": 100}}))
            .fail("correlation", PanelError::Transport("Correlation failed: no numeric columns".into()))
            .reply("stationarity", json!({"is_stationary": false}))
            .delay("stationarity", Duration::from_secs(5))
            .reply("plots", json!({"histogram": []}));
        let request = AnalysisRequest::new("sales.csv").with_columns(None, Some("sales"));

        let report = run_analysis(&backend, &request, Duration::from_millis(50)).await.unwrap();
        assert_eq!(
            report.get(AnalysisSection::Summary),
            Some(&SectionOutcome::Ready(json!({"rows": 100})))
        );
        assert_eq!(report.succeeded(), vec![AnalysisSection::Summary, AnalysisSection::Plots]);
        assert_eq!(report.skipped(), vec![AnalysisSection::Seasonality]);
        let failed = report.failed();
        assert_eq!(failed.len(), 2);
        assert!(failed[0].1.contains("no numeric columns"));
        assert_eq!(failed[1].0, AnalysisSection::Stationarity);
        assert!(failed[1].1.contains("timed out"));
        assert!(!backend.calls().contains(&"seasonality".to_string()));
    }

    #[tokio::test]
    async fn test_no_columns_skips_dependent_sections() {
        let backend = StubBackend::offline();
        let report = run_analysis(&backend, &AnalysisRequest::new("f.csv"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.skipped(), vec![AnalysisSection::Stationarity, AnalysisSection::Seasonality]);
        assert_eq!(report.failed().len(), 3);
        assert_eq!(report.sections().len(), AnalysisSection::ALL.len());
    }

    #[tokio::test]
    async fn test_empty_filename_rejected_before_any_call() {
        let backend = StubBackend::offline();
        let err = run_analysis(&backend, &AnalysisRequest::new("  "), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PanelError::Validation(_)));
        assert!(backend.calls().is_empty());
    }
}
