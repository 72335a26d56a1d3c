//! Exploratory fan-out and the train/forecast round trip over a scripted backend.

use std::time::Duration;

use serde_json::json;

use forecastpanel::analysis::{run_analysis, AnalysisRequest, AnalysisSection, SectionOutcome};
use forecastpanel::client::{AnalyticsBackend, BackendKind, StubBackend};
use forecastpanel::config::Config;
use forecastpanel::error::PanelError;
use forecastpanel::forecast::{parse_forecast, ForecastSession};
use forecastpanel::normalize::{normalize, NormalizedResult};
use forecastpanel::validation::{ForecastRequest, TrainingRequest, DEFAULT_SPLIT_TOLERANCE};

#[tokio::test]
async fn every_section_answers_independently() {
    let backend = StubBackend::offline()
        .reply("summary", json!({"status": "success", "data": {"rows": 730, "columns": 3}}))
        .reply("correlation", json!({"status": "success", "data": {"matrix": [[1.0]]}}))
        .reply("stationarity", json!({"status": "error", "detail": "series too short"}))
        .reply("seasonality", json!({"has_seasonality": true, "period": 7}))
        .reply("plots", json!({"status": "success", "data": {"line": []}}))
        .delay("plots", Duration::from_millis(20));
    let request = AnalysisRequest::new("sales.csv")
        .with_sheet("Q1")
        .with_columns(Some("date"), Some("sales"));

    let report = run_analysis(&backend, &request, Duration::from_secs(2)).await.unwrap();
    assert_eq!(report.sections().len(), AnalysisSection::ALL.len());
    assert_eq!(
        report.get(AnalysisSection::Seasonality),
        Some(&SectionOutcome::Ready(json!({"has_seasonality": true, "period": 7})))
    );
    assert_eq!(
        report.failed(),
        vec![(AnalysisSection::Stationarity, "transport error: series too short")]
    );
    assert_eq!(report.succeeded().len(), 4);
    assert!(report.skipped().is_empty());
    assert_eq!(backend.calls().len(), 5);
}

#[tokio::test]
async fn offline_backend_fails_every_section_without_panicking() {
    let backend = BackendKind::Null.build(&Config::default()).unwrap();
    let report = run_analysis(backend.as_ref(), &AnalysisRequest::new("x.csv"), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(report.succeeded().is_empty());
    assert_eq!(report.failed().len(), 3);
    assert!(!backend.health().await.unwrap());
}

#[tokio::test]
async fn train_then_forecast_by_category() {
    let backend = StubBackend::offline()
        .reply(
            "train",
            json!({"status": "success", "data": {
                "model_type": "xgboost",
                "category_column": "store",
                "categories": ["s1", "s2"],
                "category_results": {
                    "s1": {"metrics": {"test_mape": 8.0}, "model_filename": "xgb_s1.pkl"},
                    "s2": {"metrics": {"test_mape": 12.0}, "model_filename": "xgb_s2.pkl"},
                },
                "aggregated_metrics": {"test": {"mape": 10.0}},
            }}),
        )
        .reply(
            "forecast",
            json!({"status": "success", "data": {
                "is_category_based": true,
                "category_column": "store",
                "categories": ["s1", "s2"],
                "category_forecasts": {
                    "s1": {"predictions": [10.0, 11.0], "future_dates": ["2024-03-01", "2024-03-02"]},
                    "s2": {"error": "model file missing"},
                },
            }}),
        );

    let train = TrainingRequest::new("sales.csv", "xgboost", "date", "sales").with_category("store");
    train.validate(DEFAULT_SPLIT_TOLERANCE).unwrap();
    let raw = backend.train(&train).await.unwrap();
    let p = match normalize(&raw) {
        NormalizedResult::Partitioned(p) => p,
        other => panic!("expected partitioned, got {:?}", other),
    };
    assert_eq!(p.category_accuracy("s2").unwrap().test, Some(88.0));
    assert_eq!(p.aggregated_accuracy().unwrap().test, Some(90.0));

    let request = ForecastRequest::horizon("xgb_sales", 2);
    request.validate().unwrap();
    let result = parse_forecast(&backend.forecast(&request).await.unwrap()).unwrap();
    assert!(result.is_category_based());
    assert!(!result.categories.as_ref().unwrap().all_produced());
    assert_eq!(result.overall.predictions, vec![10.0, 11.0]);

    let mut session = ForecastSession::new();
    session.record("xgb_sales", Some("sales.csv"), Some("date"), request.requested_horizon(), result);
    assert_eq!(session.horizon, Some(2));
    let csv = session.to_csv();
    assert_eq!(csv.lines().next(), Some("date,forecast"));
    assert_eq!(csv.lines().nth(2), Some("2024-03-02,11"));
}

#[tokio::test]
async fn invalid_requests_never_reach_the_backend() {
    let backend = StubBackend::offline();
    let err = TrainingRequest::new("sales.csv", "arima", "date", "sales")
        .with_splits(0.7, 0.2, 0.2)
        .validate(DEFAULT_SPLIT_TOLERANCE)
        .unwrap_err();
    assert!(matches!(&err, PanelError::Validation(m) if m.starts_with("Split percentages must sum to 1.0")));

    let err = ForecastRequest::between("m", "2024-05-01", "2024-04-01").validate().unwrap_err();
    assert_eq!(err, PanelError::Validation("End date must be after start date".to_string()));
    assert!(backend.calls().is_empty());
}
