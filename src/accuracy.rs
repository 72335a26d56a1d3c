//! Accuracy derivation: raw error metrics to a 0-100% figure.
//!
//! Every display site picks a policy from [`policy_for`]. An absent result
//! means "omit the element"; it is never rendered as 0%.

use serde::Serialize;

use crate::metrics::{MetricRecord, Split, SplitMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyPolicy {
    /// `max(0, 100 - MAPE)`; absent when MAPE is absent. R² is never used.
    MapeOnly,
    /// `clamp(R² * 100, 0, 100)` when R² is usable, otherwise `MapeOnly`.
    R2Preferred,
    /// `MapeOnly` when MAPE is usable, otherwise R² clamped.
    MapePreferred,
}

/// Where an accuracy figure is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplaySite {
    /// Overall dataset card of a category-partitioned run.
    Aggregated,
    /// Per-category summary card (flat metrics).
    Category,
    /// Per-category card when the category result is recurrent-shaped.
    CategoryRecurrent,
    /// Top-level recurrent-network result.
    Recurrent,
    Ensemble,
    SingleModel,
}

pub fn policy_for(site: DisplaySite, split: Split) -> AccuracyPolicy {
    match (site, split) {
        (DisplaySite::Aggregated, _) | (DisplaySite::Category, _) => AccuracyPolicy::MapeOnly,
        (DisplaySite::CategoryRecurrent, Split::Train) => AccuracyPolicy::MapePreferred,
        (DisplaySite::CategoryRecurrent, _) => AccuracyPolicy::MapeOnly,
        (DisplaySite::Recurrent, _) | (DisplaySite::Ensemble, _) | (DisplaySite::SingleModel, _) => {
            AccuracyPolicy::R2Preferred
        }
    }
}

fn from_mape(record: &MetricRecord) -> Option<f64> {
    record
        .mape
        .filter(|m| m.is_finite())
        .map(|m| (100.0 - m).max(0.0))
}

fn from_r2(record: &MetricRecord) -> Option<f64> {
    record
        .r2
        .filter(|r| r.is_finite())
        .map(|r| (r * 100.0).clamp(0.0, 100.0))
}

pub fn derive_accuracy(record: &MetricRecord, policy: AccuracyPolicy) -> Option<f64> {
    match policy {
        AccuracyPolicy::MapeOnly => from_mape(record),
        AccuracyPolicy::R2Preferred => from_r2(record).or_else(|| from_mape(record)),
        AccuracyPolicy::MapePreferred => from_mape(record).or_else(|| from_r2(record)),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SplitAccuracy {
    pub train: Option<f64>,
    pub validation: Option<f64>,
    pub test: Option<f64>,
}

impl SplitAccuracy {
    pub fn derive(metrics: &SplitMetrics, site: DisplaySite) -> Self {
        let pick = |split: Split| {
            metrics
                .get(split)
                .and_then(|rec| derive_accuracy(rec, policy_for(site, split)))
        };
        Self {
            train: pick(Split::Train),
            validation: pick(Split::Validation),
            test: pick(Split::Test),
        }
    }

    pub fn get(&self, split: Split) -> Option<f64> {
        match split {
            Split::Train => self.train,
            Split::Validation => self.validation,
            Split::Test => self.test,
        }
    }

    /// Backend-reported overall figure stands in when test accuracy is absent.
    pub fn or_overall(mut self, overall: Option<f64>) -> Self {
        if self.test.is_none() {
            self.test = overall.filter(|v| v.is_finite()).map(|v| v.clamp(0.0, 100.0));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.train.is_none() && self.validation.is_none() && self.test.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metric;

    fn rec(mape: Option<f64>, r2: Option<f64>) -> MetricRecord {
        let mut r = MetricRecord::default();
        r.set(Metric::Mape, mape);
        r.set(Metric::R2, r2);
        r
    }

    #[test]
    fn test_mape_only_range() {
        for m in [0.0, 12.5, 50.0, 99.9, 100.0, 120.0, 150.0] {
            let got = derive_accuracy(&rec(Some(m), Some(0.9)), AccuracyPolicy::MapeOnly);
            assert_eq!(got, Some((100.0 - m).max(0.0)));
        }
    }

    #[test]
    fn test_mape_only_ignores_r2() {
        assert_eq!(derive_accuracy(&rec(None, Some(0.95)), AccuracyPolicy::MapeOnly), None);
        assert_eq!(
            derive_accuracy(&rec(Some(f64::NAN), Some(0.95)), AccuracyPolicy::MapeOnly),
            None
        );
    }

    #[test]
    fn test_r2_preferred_clamps() {
        for (r, want) in [(-3.0, 0.0), (-0.1, 0.0), (0.0, 0.0), (0.42, 42.0), (1.0, 100.0), (1.2, 100.0)] {
            let got = derive_accuracy(&rec(Some(5.0), Some(r)), AccuracyPolicy::R2Preferred).unwrap();
            assert!((got - want).abs() < 1e-9, "r2={} got={}", r, got);
        }
    }

    #[test]
    fn test_r2_preferred_falls_back_to_mape() {
        assert_eq!(derive_accuracy(&rec(Some(20.0), None), AccuracyPolicy::R2Preferred), Some(80.0));
        assert_eq!(derive_accuracy(&rec(None, None), AccuracyPolicy::R2Preferred), None);
    }

    #[test]
    fn test_mape_preferred() {
        assert_eq!(derive_accuracy(&rec(Some(10.0), Some(0.2)), AccuracyPolicy::MapePreferred), Some(90.0));
        assert_eq!(derive_accuracy(&rec(None, Some(-0.5)), AccuracyPolicy::MapePreferred), Some(0.0));
    }

    #[test]
    fn test_policy_table() {
        assert_eq!(policy_for(DisplaySite::Category, Split::Validation), AccuracyPolicy::MapeOnly);
        assert_eq!(policy_for(DisplaySite::Ensemble, Split::Validation), AccuracyPolicy::R2Preferred);
        assert_eq!(policy_for(DisplaySite::CategoryRecurrent, Split::Train), AccuracyPolicy::MapePreferred);
        assert_eq!(policy_for(DisplaySite::CategoryRecurrent, Split::Test), AccuracyPolicy::MapeOnly);
    }

    #[test]
    fn test_split_accuracy_absent_is_not_zero() {
        let mut metrics = SplitMetrics::new();
        metrics.insert(Split::Train, rec(Some(4.0), None));
        metrics.insert(Split::Validation, rec(None, Some(0.7)));
        let acc = SplitAccuracy::derive(&metrics, DisplaySite::Category);
        assert_eq!(acc.train, Some(96.0));
        assert_eq!(acc.validation, None);
        assert_eq!(acc.test, None);
        assert_eq!(acc.or_overall(Some(88.0)).test, Some(88.0));
    }
}
