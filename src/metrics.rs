//! Canonical numeric result shape shared by every model family.
//!
//! Backends report metrics per split either as nested objects
//! (`{"validation": {"rmse": 1.2}}`) or as flat prefixed fields
//! (`validation_rmse`). Both fold into [`SplitMetrics`]. A value that is
//! missing, null or not finite is stored as `None` and never read as zero.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Validation, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }

    pub fn parse(name: &str) -> Option<Split> {
        match name {
            "train" => Some(Split::Train),
            "validation" => Some(Split::Validation),
            "test" => Some(Split::Test),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Mae,
    Rmse,
    R2,
    Mape,
    Aic,
    Bic,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Mae,
        Metric::Rmse,
        Metric::R2,
        Metric::Mape,
        Metric::Aic,
        Metric::Bic,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Metric::Mae => "mae",
            Metric::Rmse => "rmse",
            Metric::R2 => "r2",
            Metric::Mape => "mape",
            Metric::Aic => "aic",
            Metric::Bic => "bic",
        }
    }

    /// Flat-field name, e.g. `validation_rmse`.
    pub fn flat_key(&self, split: Split) -> String {
        format!("{}_{}", split.as_str(), self.key())
    }
}

/// Read a JSON number (or numeric string) as a finite f64.
pub fn read_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricRecord {
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
    pub r2: Option<f64>,
    /// Percentage value (12.5 means 12.5%).
    pub mape: Option<f64>,
    pub aic: Option<f64>,
    pub bic: Option<f64>,
}

impl MetricRecord {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Mae => self.mae,
            Metric::Rmse => self.rmse,
            Metric::R2 => self.r2,
            Metric::Mape => self.mape,
            Metric::Aic => self.aic,
            Metric::Bic => self.bic,
        }
    }

    /// Store a value, dropping anything non-finite.
    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        let value = value.filter(|v| v.is_finite());
        match metric {
            Metric::Mae => self.mae = value,
            Metric::Rmse => self.rmse = value,
            Metric::R2 => self.r2 = value,
            Metric::Mape => self.mape = value,
            Metric::Aic => self.aic = value,
            Metric::Bic => self.bic = value,
        }
    }

    pub fn with(mut self, metric: Metric, value: f64) -> Self {
        self.set(metric, Some(value));
        self
    }

    pub fn from_object(obj: &Map<String, Value>) -> Self {
        let mut rec = MetricRecord::default();
        for metric in Metric::ALL {
            rec.set(metric, obj.get(metric.key()).and_then(read_number));
        }
        rec
    }

    pub fn is_empty(&self) -> bool {
        Metric::ALL.iter().all(|m| self.get(*m).is_none())
    }

    /// Fill fields that are absent here from `other`.
    pub fn fill_missing(&mut self, other: &MetricRecord) {
        for metric in Metric::ALL {
            if self.get(metric).is_none() {
                self.set(metric, other.get(metric));
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SplitMetrics {
    splits: BTreeMap<Split, MetricRecord>,
}

impl SplitMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, split: Split) -> Option<&MetricRecord> {
        self.splits.get(&split)
    }

    /// Empty records are not stored, so `{"test": {}}` and a missing split agree.
    pub fn insert(&mut self, split: Split, record: MetricRecord) {
        if record.is_empty() {
            self.splits.remove(&split);
        } else {
            self.splits.insert(split, record);
        }
    }

    pub fn remove(&mut self, split: Split) -> Option<MetricRecord> {
        self.splits.remove(&split)
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }

    pub fn splits(&self) -> impl Iterator<Item = (Split, &MetricRecord)> {
        self.splits.iter().map(|(s, r)| (*s, r))
    }

    /// Nested shape: `{"train": {...}, "validation": {...}}`.
    pub fn from_nested(obj: &Map<String, Value>) -> Self {
        let mut out = SplitMetrics::new();
        for split in Split::ALL {
            if let Some(Value::Object(inner)) = obj.get(split.as_str()) {
                out.insert(split, MetricRecord::from_object(inner));
            }
        }
        out
    }

    /// Flat shape: `train_mae`, `validation_rmse`, `test_r2`, ...
    pub fn from_flat(obj: &Map<String, Value>) -> Self {
        let mut out = SplitMetrics::new();
        for split in Split::ALL {
            let mut rec = MetricRecord::default();
            for metric in Metric::ALL {
                rec.set(metric, obj.get(&metric.flat_key(split)).and_then(read_number));
            }
            out.insert(split, rec);
        }
        out
    }

    /// Merge `other` into self, keeping values already present.
    pub fn fill_missing(&mut self, other: &SplitMetrics) {
        for (split, rec) in other.splits() {
            let mut merged = self.get(split).copied().unwrap_or_default();
            merged.fill_missing(rec);
            self.insert(split, merged);
        }
    }

    pub fn has_nested_shape(obj: &Map<String, Value>) -> bool {
        matches!(obj.get("train"), Some(Value::Object(_)))
            && matches!(obj.get("validation"), Some(Value::Object(_)))
    }
}
