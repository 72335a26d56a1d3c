//! Ensemble weighting from constituent validation RMSE.
//!
//! Inverse-RMSE weights, with models worse than 1.35x the best excluded and
//! the best model floored at 80% of the blend.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::PanelError;
use crate::logging::log_ensemble_weights;
use crate::metrics::read_number;

pub const EXCLUSION_RATIO: f64 = 1.35;
pub const BEST_WEIGHT_FLOOR: f64 = 0.80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Constituent {
    /// Trend/seasonal decomposition model.
    Trend,
    /// Autoregressive model with exogenous regressors.
    Exogenous,
    /// Gradient-boosted trees.
    Boosted,
}

impl Constituent {
    pub const ALL: [Constituent; 3] = [Constituent::Trend, Constituent::Exogenous, Constituent::Boosted];

    /// Key used by the training backend.
    pub fn key(&self) -> &'static str {
        match self {
            Constituent::Trend => "prophet",
            Constituent::Exogenous => "sarimax",
            Constituent::Boosted => "gbm",
        }
    }

    fn index(&self) -> usize {
        match self {
            Constituent::Trend => 0,
            Constituent::Exogenous => 1,
            Constituent::Boosted => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstituentOutcome {
    Trained { rmse: f64 },
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstituentStatus {
    Weighted,
    /// Trained, but RMSE exceeded the exclusion ratio.
    Excluded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConstituentWeight {
    pub constituent: Constituent,
    pub weight: f64,
    pub status: ConstituentStatus,
    pub rmse: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsembleWeights {
    entries: [ConstituentWeight; 3],
}

impl EnsembleWeights {
    fn empty() -> Self {
        let blank = |c| ConstituentWeight {
            constituent: c,
            weight: 0.0,
            status: ConstituentStatus::Failed,
            rmse: None,
        };
        Self {
            entries: [
                blank(Constituent::Trend),
                blank(Constituent::Exogenous),
                blank(Constituent::Boosted),
            ],
        }
    }

    pub fn entry(&self, c: Constituent) -> &ConstituentWeight {
        &self.entries[c.index()]
    }

    pub fn weight(&self, c: Constituent) -> f64 {
        self.entry(c).weight
    }

    pub fn status(&self, c: Constituent) -> ConstituentStatus {
        self.entry(c).status
    }

    pub fn entries(&self) -> &[ConstituentWeight] {
        &self.entries
    }

    pub fn sum(&self) -> f64 {
        self.entries.iter().map(|e| e.weight).sum()
    }

    /// Weight triple in (trend, exogenous, boosted) order.
    pub fn triple(&self) -> (f64, f64, f64) {
        (self.entries[0].weight, self.entries[1].weight, self.entries[2].weight)
    }

    /// Weights as reported by the backend (`{"prophet": 0.8, ...}`).
    ///
    /// Absent or invalid weights read as 0. When `models` is given, a
    /// constituent without a `model` entry is reported as failed.
    pub fn from_reported(weights: &Map<String, Value>, models: Option<&Map<String, Value>>) -> Self {
        let mut out = Self::empty();
        for c in Constituent::ALL {
            let weight = weights.get(c.key()).and_then(read_number).unwrap_or(0.0);
            let model = models.and_then(|m| m.get(c.key())).and_then(Value::as_object);
            let trained = match models {
                Some(_) => model
                    .and_then(|m| m.get("model"))
                    .map(|v| !v.is_null() && v != &Value::Bool(false))
                    .unwrap_or(false),
                None => true,
            };
            let rmse = model.and_then(|m| {
                m.get("validation_rmse")
                    .or_else(|| m.get("rmse"))
                    .and_then(read_number)
            });
            let status = if !trained {
                ConstituentStatus::Failed
            } else if weight > 0.0 {
                ConstituentStatus::Weighted
            } else {
                ConstituentStatus::Excluded
            };
            out.entries[c.index()] = ConstituentWeight {
                constituent: c,
                weight: if trained { weight } else { 0.0 },
                status,
                rmse,
            };
        }
        out
    }
}

/// Core weighting over positional RMSEs; `None` marks a failed model.
///
/// Returns `None` when no model has a usable RMSE.
pub fn inverse_rmse_weights(rmses: &[Option<f64>]) -> Option<Vec<f64>> {
    let usable: Vec<Option<f64>> = rmses
        .iter()
        .map(|r| r.filter(|v| v.is_finite() && *v >= 0.0).map(|v| v.max(1e-12)))
        .collect();

    let (best_idx, best) = usable
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.map(|v| (i, v)))
        .min_by(|a, b| a.1.total_cmp(&b.1))?;

    let cutoff = best * EXCLUSION_RATIO;
    let mut weights: Vec<f64> = usable
        .iter()
        .map(|r| match r {
            Some(v) if *v <= cutoff => 1.0 / v,
            _ => 0.0,
        })
        .collect();

    let total: f64 = weights.iter().sum();
    for w in weights.iter_mut() {
        *w /= total;
    }

    if weights[best_idx] < BEST_WEIGHT_FLOOR {
        let others = 1.0 - weights[best_idx];
        let scale = (1.0 - BEST_WEIGHT_FLOOR) / others;
        for (i, w) in weights.iter_mut().enumerate() {
            if i == best_idx {
                *w = BEST_WEIGHT_FLOOR;
            } else {
                *w *= scale;
            }
        }
    }

    Some(weights)
}

/// Resolve blend weights for the three ensemble constituents.
pub fn resolve_weights(outcomes: &[(Constituent, ConstituentOutcome)]) -> Result<EnsembleWeights, PanelError> {
    let mut rmses: [Option<f64>; 3] = [None; 3];
    for (c, outcome) in outcomes {
        if let ConstituentOutcome::Trained { rmse } = outcome {
            rmses[c.index()] = Some(*rmse).filter(|v| v.is_finite() && *v >= 0.0);
        }
    }

    let weights = inverse_rmse_weights(&rmses)
        .ok_or_else(|| PanelError::Shape("no ensemble constituent trained".to_string()))?;

    let mut out = EnsembleWeights::empty();
    for c in Constituent::ALL {
        let i = c.index();
        let status = match rmses[i] {
            None => ConstituentStatus::Failed,
            Some(_) if weights[i] > 0.0 => ConstituentStatus::Weighted,
            Some(_) => ConstituentStatus::Excluded,
        };
        out.entries[i] = ConstituentWeight {
            constituent: c,
            weight: weights[i],
            status,
            rmse: rmses[i],
        };
    }
    log_ensemble_weights(&out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_outlier_excluded() {
        let w = inverse_rmse_weights(&[Some(1.0), Some(1.2), Some(5.0)]).unwrap();
        assert_eq!(w[2], 0.0);
        assert!(close(w.iter().sum::<f64>(), 1.0));
        assert!(close(w[0], 0.8));
        assert!(close(w[1], 0.2));
    }

    #[test]
    fn test_floor_applied_to_close_pair() {
        let w = inverse_rmse_weights(&[Some(1.0), Some(1.05)]).unwrap();
        assert!(close(w[0], 0.80));
        assert!(close(w[1], 0.20));
    }

    #[test]
    fn test_floor_preserves_ratios() {
        let w = inverse_rmse_weights(&[Some(1.0), Some(1.1), Some(1.3)]).unwrap();
        assert!(close(w[0], 0.8));
        let raw_ratio = (1.0 / 1.1) / (1.0 / 1.3);
        assert!(close(w[1] / w[2], raw_ratio));
        assert!(close(w.iter().sum::<f64>(), 1.0));
    }

    #[test]
    fn test_single_survivor_takes_everything() {
        // Within the 1.35x band the raw best share never reaches 0.8.
        let w = inverse_rmse_weights(&[Some(0.1), Some(0.13)]).unwrap();
        let raw = (1.0 / 0.1) / (1.0 / 0.1 + 1.0 / 0.13);
        assert!(raw < 0.8);
        assert!(close(w[0], 0.8));
        let w = inverse_rmse_weights(&[Some(1.0), None, None]).unwrap();
        assert_eq!(w, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_none_trained() {
        assert!(inverse_rmse_weights(&[None, None, None]).is_none());
        let err = resolve_weights(&[(Constituent::Trend, ConstituentOutcome::Failed)]).unwrap_err();
        assert!(matches!(err, PanelError::Shape(_)));
    }

    #[test]
    fn test_failed_reported_distinctly() {
        let w = resolve_weights(&[
            (Constituent::Trend, ConstituentOutcome::Trained { rmse: 1.0 }),
            (Constituent::Exogenous, ConstituentOutcome::Failed),
            (Constituent::Boosted, ConstituentOutcome::Trained { rmse: 9.0 }),
        ])
        .unwrap();
        assert_eq!(w.status(Constituent::Trend), ConstituentStatus::Weighted);
        assert_eq!(w.status(Constituent::Exogenous), ConstituentStatus::Failed);
        assert_eq!(w.status(Constituent::Boosted), ConstituentStatus::Excluded);
        assert_eq!(w.triple(), (1.0, 0.0, 0.0));
    }

    #[test]
    fn test_from_reported() {
        let weights = json!({"prophet": 0.8, "sarimax": 0.2, "gbm": null});
        let models = json!({
            "prophet": {"model": "prophet.pkl"},
            "sarimax": {"model": "sarimax.pkl", "rmse": 1.1},
            "gbm": {"model": null},
        });
        let w = EnsembleWeights::from_reported(
            weights.as_object().unwrap(),
            models.as_object(),
        );
        assert_eq!(w.status(Constituent::Boosted), ConstituentStatus::Failed);
        assert_eq!(w.weight(Constituent::Boosted), 0.0);
        assert_eq!(w.entry(Constituent::Exogenous).rmse, Some(1.1));
        assert!(close(w.sum(), 1.0));
    }
}
