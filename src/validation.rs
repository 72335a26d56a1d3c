//! User-input checks that run before any remote call.

use chrono::NaiveDate;
use serde_json::{json, Map, Value};

use crate::error::{PanelError, PanelResult};
use crate::logging::log_validation_failure;

pub const DEFAULT_TRAIN_SIZE: f64 = 0.6;
pub const DEFAULT_VALIDATION_SIZE: f64 = 0.2;
pub const DEFAULT_TEST_SIZE: f64 = 0.2;
pub const DEFAULT_SPLIT_TOLERANCE: f64 = 0.01;
pub const DEFAULT_CV_FOLDS: u32 = 5;

fn reject(operation: &str, msg: String) -> PanelError {
    log_validation_failure(operation, &msg);
    PanelError::Validation(msg)
}

fn present(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRequest {
    pub filename: String,
    pub sheet_name: Option<String>,
    pub model_type: String,
    pub date_column: String,
    pub target_column: String,
    pub category_column: Option<String>,
    pub train_size: f64,
    pub validation_size: f64,
    pub test_size: f64,
    pub feature_columns: Vec<String>,
    pub model_params: Map<String, Value>,
    pub enable_cross_validation: bool,
    pub cv_folds: u32,
    pub check_data_leakage: bool,
}

impl TrainingRequest {
    pub fn new(filename: &str, model_type: &str, date_column: &str, target_column: &str) -> Self {
        Self {
            filename: filename.to_string(),
            sheet_name: None,
            model_type: model_type.to_string(),
            date_column: date_column.to_string(),
            target_column: target_column.to_string(),
            category_column: None,
            train_size: DEFAULT_TRAIN_SIZE,
            validation_size: DEFAULT_VALIDATION_SIZE,
            test_size: DEFAULT_TEST_SIZE,
            feature_columns: Vec::new(),
            model_params: Map::new(),
            enable_cross_validation: false,
            cv_folds: DEFAULT_CV_FOLDS,
            check_data_leakage: false,
        }
    }

    pub fn with_splits(mut self, train: f64, validation: f64, test: f64) -> Self {
        self.train_size = train;
        self.validation_size = validation;
        self.test_size = test;
        self
    }

    pub fn with_category(mut self, column: &str) -> Self {
        self.category_column = Some(column.to_string());
        self
    }

    pub fn with_features(mut self, columns: Vec<String>) -> Self {
        self.feature_columns = columns;
        self
    }

    pub fn validate(&self, tolerance: f64) -> PanelResult<()> {
        let splits = [self.train_size, self.validation_size, self.test_size];
        if splits.iter().any(|s| !s.is_finite()) {
            return Err(reject("train", "Please enter valid numbers for all split sizes".to_string()));
        }
        let total: f64 = splits.iter().sum();
        if (total - 1.0).abs() > tolerance {
            return Err(reject(
                "train",
                format!(
                    "Split percentages must sum to 1.0 (currently {:.1}%: Train={:.1}%, Val={:.1}%, Test={:.1}%)",
                    total * 100.0,
                    self.train_size * 100.0,
                    self.validation_size * 100.0,
                    self.test_size * 100.0
                ),
            ));
        }
        if self.filename.trim().is_empty()
            || self.date_column.trim().is_empty()
            || self.target_column.trim().is_empty()
        {
            return Err(reject("train", "filename, date column and target column are required".to_string()));
        }
        if let Some(cat) = present(&self.category_column) {
            if cat == self.date_column.trim() || cat == self.target_column.trim() {
                return Err(reject(
                    "train",
                    "Category column must be different from date and target columns".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Request body for `/train/model`. Splits are rounded to 4 places.
    pub fn to_body(&self) -> Value {
        let round4 = |v: f64| (v * 10_000.0).round() / 10_000.0;
        let mut body = json!({
            "filename": self.filename,
            "model_type": self.model_type,
            "date_column": self.date_column,
            "target_column": self.target_column,
            "train_size": round4(self.train_size),
            "validation_size": round4(self.validation_size),
            "test_size": round4(self.test_size),
            "model_params": self.model_params,
            "enable_cross_validation": self.enable_cross_validation,
            "cv_folds": self.cv_folds,
            "check_data_leakage": self.check_data_leakage,
        });
        if let Some(obj) = body.as_object_mut() {
            if let Some(cat) = present(&self.category_column) {
                obj.insert("category_column".to_string(), json!(cat));
            }
            if let Some(sheet) = present(&self.sheet_name) {
                obj.insert("sheet_name".to_string(), json!(sheet));
            }
            if !self.feature_columns.is_empty() {
                obj.insert("feature_columns".to_string(), json!(self.feature_columns));
            }
        }
        body
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForecastRange {
    Horizon(u32),
    /// ISO dates, `YYYY-MM-DD`.
    Dates { start: String, end: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastRequest {
    pub model_name: String,
    pub range: ForecastRange,
    pub filename: Option<String>,
    pub date_column: Option<String>,
    pub include_confidence: bool,
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

impl ForecastRequest {
    pub fn horizon(model_name: &str, steps: u32) -> Self {
        Self {
            model_name: model_name.to_string(),
            range: ForecastRange::Horizon(steps),
            filename: None,
            date_column: None,
            include_confidence: true,
        }
    }

    pub fn between(model_name: &str, start: &str, end: &str) -> Self {
        Self {
            range: ForecastRange::Dates { start: start.to_string(), end: end.to_string() },
            ..Self::horizon(model_name, 0)
        }
    }

    pub fn requested_horizon(&self) -> Option<usize> {
        match self.range {
            ForecastRange::Horizon(h) => Some(h as usize),
            ForecastRange::Dates { .. } => None,
        }
    }

    pub fn validate(&self) -> PanelResult<()> {
        if self.model_name.trim().is_empty() {
            return Err(reject("forecast", "Please enter model name".to_string()));
        }
        match &self.range {
            ForecastRange::Horizon(h) if *h < 1 => {
                Err(reject("forecast", "Please enter a valid forecast horizon".to_string()))
            }
            ForecastRange::Horizon(_) => Ok(()),
            ForecastRange::Dates { start, end } => {
                let (Some(s), Some(e)) = (parse_date(start), parse_date(end)) else {
                    return Err(reject("forecast", "Please select both start and end dates".to_string()));
                };
                if s >= e {
                    return Err(reject("forecast", "End date must be after start date".to_string()));
                }
                Ok(())
            }
        }
    }

    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "model_name": self.model_name,
            "include_confidence": self.include_confidence,
        });
        if let Some(obj) = body.as_object_mut() {
            match &self.range {
                ForecastRange::Horizon(h) => {
                    obj.insert("horizon".to_string(), json!(h));
                }
                ForecastRange::Dates { start, end } => {
                    obj.insert("start_date".to_string(), json!(start));
                    obj.insert("end_date".to_string(), json!(end));
                }
            }
            if let Some(f) = present(&self.filename) {
                obj.insert("filename".to_string(), json!(f));
            }
            if let Some(d) = present(&self.date_column) {
                obj.insert("date_column".to_string(), json!(d));
            }
        }
        body
    }
}

/// Body for `/preprocess/fix-stationarity` and `/preprocess/fix-seasonality`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformRequest {
    pub filename: String,
    pub sheet_name: Option<String>,
    pub date_column: String,
    pub value_column: String,
    pub method: String,
    /// Differencing order or seasonal period, depending on the transform.
    pub param: Option<i64>,
    pub save_as: Option<String>,
}

impl TransformRequest {
    pub fn new(filename: &str, date_column: &str, value_column: &str, method: &str) -> Self {
        Self {
            filename: filename.to_string(),
            sheet_name: None,
            date_column: date_column.to_string(),
            value_column: value_column.to_string(),
            method: method.to_string(),
            param: None,
            save_as: None,
        }
    }

    pub fn validate(&self) -> PanelResult<()> {
        if self.filename.trim().is_empty() {
            return Err(reject("transform", "Please enter filename".to_string()));
        }
        if self.date_column.trim().is_empty() || self.value_column.trim().is_empty() {
            return Err(reject("transform", "Please select date and value columns".to_string()));
        }
        Ok(())
    }

    /// `param_key` is `order` for stationarity and `period` for seasonality.
    pub fn to_body(&self, param_key: &str) -> Value {
        let mut body = json!({
            "filename": self.filename,
            "date_column": self.date_column,
            "value_column": self.value_column,
            "method": self.method,
        });
        if let Some(obj) = body.as_object_mut() {
            if let Some(p) = self.param {
                obj.insert(param_key.to_string(), json!(p));
            }
            if let Some(s) = present(&self.sheet_name) {
                obj.insert("sheet_name".to_string(), json!(s));
            }
            if let Some(s) = present(&self.save_as) {
                obj.insert("save_as".to_string(), json!(s));
            }
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_splits_pass() {
        let req = TrainingRequest::new("sales.csv", "xgboost", "date", "sales");
        assert!(req.validate(DEFAULT_SPLIT_TOLERANCE).is_ok());
    }

    #[test]
    fn test_split_sum_tolerance() {
        let ok = TrainingRequest::new("f", "arima", "d", "v").with_splits(0.7, 0.2, 0.105);
        assert!(ok.validate(0.01).is_ok());
        let bad = TrainingRequest::new("f", "arima", "d", "v").with_splits(0.7, 0.2, 0.2);
        let err = bad.validate(0.01).unwrap_err();
        assert!(matches!(err, PanelError::Validation(ref m) if m.contains("110.0%")));
    }

    #[test]
    fn test_non_finite_split() {
        let req = TrainingRequest::new("f", "arima", "d", "v").with_splits(f64::NAN, 0.2, 0.2);
        assert!(req.validate(0.01).is_err());
    }

    #[test]
    fn test_category_must_differ() {
        let req = TrainingRequest::new("f", "lstm", "date", "sales").with_category("sales");
        assert!(req.validate(0.01).is_err());
        let req = TrainingRequest::new("f", "lstm", "date", " sales").with_category("sales ");
        assert!(req.validate(0.01).is_err());
        let req = TrainingRequest::new("f", "lstm", "date ", "sales").with_category("date");
        assert!(req.validate(0.01).is_err());
        let req = TrainingRequest::new("f", "lstm", "date", "sales").with_category("region");
        assert!(req.validate(0.01).is_ok());
        assert_eq!(req.to_body()["category_column"], "region");
    }

    #[test]
    fn test_forecast_range() {
        assert!(ForecastRequest::horizon("m", 0).validate().is_err());
        assert!(ForecastRequest::horizon("", 5).validate().is_err());
        assert!(ForecastRequest::horizon("m", 5).validate().is_ok());
        assert!(ForecastRequest::between("m", "2024-03-01", "2024-03-01").validate().is_err());
        assert!(ForecastRequest::between("m", "2024-03-01", "not a date").validate().is_err());
        let ok = ForecastRequest::between("m", "2024-03-01", "2024-04-01");
        assert!(ok.validate().is_ok());
        assert_eq!(ok.to_body()["start_date"], "2024-03-01");
        assert!(ok.to_body().get("horizon").is_none());
    }

    #[test]
    fn test_transform_requires_columns() {
        assert!(TransformRequest::new("f.csv", "date", "", "difference").validate().is_err());
        assert!(TransformRequest::new("", "date", "v", "difference").validate().is_err());
        let mut req = TransformRequest::new("f.csv", "date", "v", "difference");
        req.param = Some(1);
        assert_eq!(req.to_body("order")["order"], 1);
    }
}
