//! Upload, transform and refresh flows against a scripted backend.

use std::time::Duration;

use serde_json::json;

use forecastpanel::client::{AnalyticsBackend, StubBackend};
use forecastpanel::error::{ErrorKind, PanelError};
use forecastpanel::schema::{
    ColumnFilter, RefreshOutcome, RefreshTrigger, SchemaEvent, SchemaSyncManager, SyncState, UploadResponse,
};
use forecastpanel::validation::{TrainingRequest, TransformRequest, DEFAULT_SPLIT_TOLERANCE};

const LIMIT: Duration = Duration::from_secs(2);

fn panel() -> SchemaSyncManager {
    let mut m = SchemaSyncManager::new();
    m.register("eda-date-column", ColumnFilter::All, "Select date column");
    m.register("eda-value-column", ColumnFilter::All, "Select value column");
    m.register("train-target-column", ColumnFilter::All, "Select target column");
    m.register(
        "train-category-column",
        ColumnFilter::ExcludeSelectionOf("train-target-column".to_string()),
        "None",
    );
    m.register_multi(
        "train-feature-columns",
        ColumnFilter::ExcludeSelectionOf("train-target-column".to_string()),
        "Select features",
    );
    m.register_sheet_selector("eda-sheet");
    m
}

#[tokio::test]
async fn upload_then_stationarity_fix_repopulates_every_selector() {
    let mut m = panel();
    let mut events = m.subscribe();

    let upload = UploadResponse::from_value(&json!({
        "filename": "sales.csv",
        "columns": ["date", "sales", "store"],
        "rows": 365,
    }))
    .unwrap();
    let applied = m.apply_upload(upload);
    assert!(applied.changed);
    m.select("eda-date-column", Some("date")).unwrap();
    m.select("eda-value-column", Some("sales")).unwrap();
    m.select("train-target-column", Some("sales")).unwrap();
    assert_eq!(
        m.consumer("train-category-column").unwrap().options,
        vec!["date".to_string(), "store".to_string()]
    );

    let backend = StubBackend::offline()
        .reply(
            "fix_stationarity",
            json!({"status": "success", "data": {
                "processed_file": "sales_diff1.csv",
                "new_column_name": "sales_diff1",
                "transformation_applied": "differencing(order=1)",
                "is_stationary_after": true,
            }}),
        )
        .reply(
            "schema",
            json!({"status": "success", "data": {"columns": ["date", "sales_diff1", "store"]}}),
        );

    let request = TransformRequest::new("sales.csv", "date", "sales", "differencing");
    request.validate().unwrap();
    let response = backend.fix_stationarity(&request).await.unwrap();
    assert_eq!(response.check_after, Some(true));

    let outcome = m.apply_transform(&backend, &response, LIMIT).await.unwrap();
    let applied = match outcome {
        RefreshOutcome::Applied(a) => a,
        other => panic!("expected applied refresh, got {:?}", other),
    };
    assert!(applied.warning.is_none());
    assert!(applied.cleared.contains(&"eda-value-column".to_string()));
    assert!(applied.cleared.contains(&"train-target-column".to_string()));

    let schema = m.schema().unwrap();
    assert_eq!(schema.filename, "sales_diff1.csv");
    for c in m.consumers() {
        if c.filter == ColumnFilter::All {
            assert_eq!(c.options, schema.columns, "{}", c.name);
        }
        if let Some(sel) = &c.selection {
            assert!(schema.has_column(sel), "{} kept stale {}", c.name, sel);
        }
    }
    assert_eq!(m.consumer("eda-date-column").unwrap().selection.as_deref(), Some("date"));
    assert_eq!(m.consumer("train-category-column").unwrap().options.len(), 3);

    let mut replaced = 0;
    while let Ok(ev) = events.try_recv() {
        if let SchemaEvent::Replaced { .. } = ev {
            replaced += 1;
        }
    }
    assert_eq!(replaced, 2);
    assert_eq!(m.state(), &SyncState::Stable);
}

#[tokio::test]
async fn missing_transform_column_is_synthesized_with_warning() {
    let mut m = panel();
    let backend = StubBackend::offline()
        .reply(
            "fix_seasonality",
            json!({"processed_file": "sales_deseason.csv", "new_column_name": "sales_deseasonalized"}),
        )
        .reply("schema", json!({"column_names": ["date", "sales"]}));

    let mut request = TransformRequest::new("sales.csv", "date", "sales", "decompose");
    request.param = Some(7);
    let response = backend.fix_seasonality(&request).await.unwrap();
    let outcome = m.apply_transform(&backend, &response, LIMIT).await.unwrap();

    let warning = outcome.warning().unwrap();
    assert_eq!(warning.kind(), ErrorKind::Consistency);
    assert!(m.schema().unwrap().has_column("sales_deseasonalized"));
    assert!(m
        .consumer("eda-value-column")
        .unwrap()
        .options
        .contains(&"sales_deseasonalized".to_string()));
}

#[tokio::test]
async fn failed_refresh_keeps_previous_schema() {
    let mut m = panel();
    m.apply_upload(UploadResponse::from_value(&json!({"filename": "a.csv", "columns": ["d", "v"]})).unwrap());
    m.select("eda-value-column", Some("v")).unwrap();

    let backend = StubBackend::offline().fail("schema", PanelError::Transport("file not found".into()));
    let outcome = m
        .refresh(&backend, "b.csv", None, RefreshTrigger::Manual, LIMIT)
        .await
        .unwrap();
    assert!(matches!(outcome, RefreshOutcome::Failed(PanelError::Transport(_))));
    assert_eq!(m.schema().unwrap().filename, "a.csv");
    assert_eq!(m.consumer("eda-value-column").unwrap().selection.as_deref(), Some("v"));

    // The manager is free for the next refresh.
    let ok = StubBackend::offline().reply("schema", json!({"columns": ["d", "v", "w"]}));
    let outcome = m.refresh(&ok, "b.csv", None, RefreshTrigger::Manual, LIMIT).await.unwrap();
    assert!(outcome.is_applied());
}

#[tokio::test]
async fn workbook_upload_drives_sheet_selector() {
    let mut m = panel();
    let upload = UploadResponse::from_value(&json!({
        "filename": "Book.XLSX",
        "columns": ["date", "units"],
        "available_sheets": ["Jan", "Feb"],
    }))
    .unwrap();
    assert!(upload.is_workbook());
    m.apply_upload(upload);
    let sheets = m.sheet_selector("eda-sheet").unwrap();
    assert_eq!(sheets.options, vec!["Jan".to_string(), "Feb".to_string()]);
    assert_eq!(sheets.selection, None);

    m.select_sheet("eda-sheet", Some("Feb")).unwrap();
    assert!(m.select_sheet("eda-sheet", Some("Mar")).is_err());

    let backend = StubBackend::offline()
        .reply("schema", json!({"columns": ["date", "units", "price"], "sheet_name": "Feb",
                                "available_sheets": ["Jan", "Feb"]}));
    let outcome = m
        .refresh(&backend, "Book.XLSX", Some("Feb"), RefreshTrigger::SheetChange, LIMIT)
        .await
        .unwrap();
    assert!(outcome.is_applied());
    assert_eq!(m.sheet_selector("eda-sheet").unwrap().selection.as_deref(), Some("Feb"));
    assert_eq!(m.schema().unwrap().selected_sheet.as_deref(), Some("Feb"));
}

#[tokio::test]
async fn transform_on_workbook_keeps_sheet_selection() {
    let mut m = panel();
    let upload = UploadResponse::from_value(&json!({
        "filename": "book.xlsx",
        "columns": ["date", "sales"],
        "available_sheets": ["Jan", "Feb"],
        "sheet_name": "Feb",
    }))
    .unwrap();
    m.apply_upload(upload);

    let backend = StubBackend::offline()
        .reply("fix_stationarity", json!({"processed_file": "book_diff.csv", "new_column_name": "sales"}))
        .reply("schema", json!({"columns": ["date", "sales"]}));
    let response = backend
        .fix_stationarity(&TransformRequest::new("book.xlsx", "date", "sales", "differencing"))
        .await
        .unwrap();
    let outcome = m.apply_transform(&backend, &response, LIMIT).await.unwrap();
    assert!(outcome.warning().is_none());
    let sheets = m.sheet_selector("eda-sheet").unwrap();
    assert_eq!(sheets.options, vec!["Jan".to_string(), "Feb".to_string()]);
    assert_eq!(sheets.selection.as_deref(), Some("Feb"));

    let outcome = m
        .refresh(&backend, "book.xlsx", Some("Feb"), RefreshTrigger::SheetChange, LIMIT)
        .await
        .unwrap();
    assert!(outcome.is_applied());
    let schema = m.schema().unwrap();
    assert_eq!(schema.sheets, vec!["Jan".to_string(), "Feb".to_string()]);
    assert_eq!(schema.selected_sheet.as_deref(), Some("Feb"));
    assert_eq!(m.sheet_selector("eda-sheet").unwrap().selection.as_deref(), Some("Feb"));
}

#[tokio::test]
async fn feature_picker_follows_target_and_schema() {
    let mut m = panel();
    m.apply_upload(
        UploadResponse::from_value(&json!({"filename": "sales.csv", "columns": ["date", "sales", "price", "promo"]}))
            .unwrap(),
    );
    m.select("train-target-column", Some("sales")).unwrap();
    assert_eq!(
        m.consumer("train-feature-columns").unwrap().options,
        vec!["date".to_string(), "price".to_string(), "promo".to_string()]
    );
    m.select_many("train-feature-columns", &["price", "promo"]).unwrap();

    let backend = StubBackend::offline().reply("schema", json!({"columns": ["date", "sales", "price"]}));
    let outcome = m
        .refresh(&backend, "sales.csv", None, RefreshTrigger::Manual, LIMIT)
        .await
        .unwrap();
    let RefreshOutcome::Applied(applied) = outcome else {
        panic!("expected applied refresh");
    };
    assert_eq!(applied.cleared, vec!["train-feature-columns".to_string()]);

    let features = m.consumer("train-feature-columns").unwrap();
    assert_eq!(features.selections, vec!["price".to_string()]);
    let request = TrainingRequest::new("sales.csv", "xgboost", "date", "sales")
        .with_features(features.selections.clone());
    request.validate(DEFAULT_SPLIT_TOLERANCE).unwrap();
    assert_eq!(request.to_body()["feature_columns"], json!(["price"]));
}

#[tokio::test]
async fn workbook_upload_without_sheets_lists_them() {
    let mut m = panel();
    let backend = StubBackend::offline().reply("list_sheets", json!({"status": "success", "sheets": ["Q1", "Q2"]}));
    let upload = UploadResponse::from_value(&json!({"filename": "plan.xls", "columns": ["date", "units"]})).unwrap();
    let applied = m.upload(&backend, upload, LIMIT).await;
    assert!(applied.warning.is_none());
    assert_eq!(backend.calls(), vec!["list_sheets"]);
    assert_eq!(
        m.sheet_selector("eda-sheet").unwrap().options,
        vec!["Q1".to_string(), "Q2".to_string()]
    );

    // A csv upload never asks for sheets.
    let csv = UploadResponse::from_value(&json!({"filename": "plain.csv", "columns": ["d"]})).unwrap();
    m.upload(&backend, csv, LIMIT).await;
    assert_eq!(backend.calls().len(), 1);

    // A failed listing still publishes the columns.
    let offline = StubBackend::offline();
    let upload = UploadResponse::from_value(&json!({"filename": "plan.xlsx", "columns": ["date", "units"]})).unwrap();
    let applied = m.upload(&offline, upload, LIMIT).await;
    assert!(matches!(applied.warning, Some(PanelError::Transport(_))));
    assert_eq!(m.schema().unwrap().filename, "plan.xlsx");
    assert!(m.sheet_selector("eda-sheet").unwrap().options.is_empty());
}
