//! Forecast payloads, category aggregation and the forecast session.

use serde::Serialize;
use serde_json::{Map, Value};
use std::borrow::Cow;

use crate::error::{PanelError, PanelResult};
use crate::metrics::read_number;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ForecastSeries {
    pub predictions: Vec<f64>,
    pub lower_bound: Option<Vec<f64>>,
    pub upper_bound: Option<Vec<f64>>,
    pub future_dates: Vec<String>,
}

fn number_series(v: Option<&Value>) -> Option<Vec<f64>> {
    v?.as_array()
        .map(|arr| arr.iter().map(|x| read_number(x).unwrap_or(f64::NAN)).collect())
}

impl ForecastSeries {
    pub fn from_object(obj: &Map<String, Value>) -> Self {
        Self {
            predictions: number_series(obj.get("predictions")).unwrap_or_default(),
            lower_bound: number_series(obj.get("lower_bound")),
            upper_bound: number_series(obj.get("upper_bound")),
            future_dates: obj
                .get("future_dates")
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    pub fn has_bounds(&self) -> bool {
        self.lower_bound.is_some() && self.upper_bound.is_some()
    }

    /// Date for step `i`, or `Step i+1` when the backend sent none.
    pub fn label(&self, i: usize) -> String {
        self.future_dates
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("Step {}", i + 1))
    }

    pub fn date_range(&self) -> Option<(&str, &str)> {
        Some((self.future_dates.first()?, self.future_dates.last()?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CategoryForecast {
    Produced(ForecastSeries),
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryForecasts {
    pub category_column: Option<String>,
    pub categories: Vec<String>,
    pub forecasts: Vec<(String, CategoryForecast)>,
}

impl CategoryForecasts {
    pub fn get(&self, category: &str) -> Option<&CategoryForecast> {
        self.forecasts.iter().find(|(c, _)| c == category).map(|(_, f)| f)
    }

    pub fn all_produced(&self) -> bool {
        self.forecasts
            .iter()
            .all(|(_, f)| matches!(f, CategoryForecast::Produced(_)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastResult {
    /// Single-model forecast, or the sum across categories.
    pub overall: ForecastSeries,
    pub horizon: Option<usize>,
    pub categories: Option<CategoryForecasts>,
}

impl ForecastResult {
    pub fn is_category_based(&self) -> bool {
        self.categories.is_some()
    }
}

fn sum_into(acc: &mut Vec<f64>, series: &[f64], len: usize) {
    acc.truncate(len);
    for (a, v) in acc.iter_mut().zip(series) {
        *a += v;
    }
}

/// Elementwise sum of the produced category forecasts.
///
/// The result covers the shortest produced horizon. Bounds are summed only
/// when every produced category has them. Failed categories are skipped; use
/// [`CategoryForecasts::all_produced`] to know whether the sum is complete.
pub fn aggregate_category_forecasts(forecasts: &[(String, CategoryForecast)]) -> Option<ForecastSeries> {
    let produced: Vec<&ForecastSeries> = forecasts
        .iter()
        .filter_map(|(_, f)| match f {
            CategoryForecast::Produced(s) if !s.is_empty() => Some(s),
            _ => None,
        })
        .collect();
    let len = produced.iter().map(|s| s.len()).min()?;

    let mut predictions = vec![0.0; len];
    for s in &produced {
        sum_into(&mut predictions, &s.predictions, len);
    }

    let bounded = produced.iter().all(|s| s.has_bounds());
    let sum_bound = |pick: fn(&ForecastSeries) -> Option<&Vec<f64>>| -> Option<Vec<f64>> {
        if !bounded {
            return None;
        }
        let mut acc = vec![0.0; len];
        for s in &produced {
            let b = pick(s)?;
            if b.len() < len {
                return None;
            }
            sum_into(&mut acc, b, len);
        }
        Some(acc)
    };
    let lower_bound = sum_bound(|s| s.lower_bound.as_ref());
    let upper_bound = sum_bound(|s| s.upper_bound.as_ref());

    let future_dates = produced
        .iter()
        .find(|s| s.future_dates.len() >= len)
        .map(|s| s.future_dates[..len].to_vec())
        .unwrap_or_default();

    Some(ForecastSeries { predictions, lower_bound, upper_bound, future_dates })
}

/// Decode a `/forecast/predict` payload (envelope already removed).
pub fn parse_forecast(data: &Value) -> PanelResult<ForecastResult> {
    let obj = data
        .as_object()
        .ok_or_else(|| PanelError::Shape("forecast payload is not an object".to_string()))?;
    let horizon = obj.get("horizon").and_then(Value::as_u64).map(|h| h as usize);

    let category_based = obj.get("is_category_based").and_then(Value::as_bool) == Some(true);
    let per_category = obj.get("category_forecasts").and_then(Value::as_object);

    if let (true, Some(per_category)) = (category_based, per_category) {
        let mut categories: Vec<String> = obj
            .get("categories")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        if categories.is_empty() {
            categories = per_category.keys().cloned().collect();
        }
        let forecasts: Vec<(String, CategoryForecast)> = categories
            .iter()
            .map(|c| {
                let f = match per_category.get(c).and_then(Value::as_object) {
                    Some(entry) => match entry.get("error") {
                        Some(err) => CategoryForecast::Failed {
                            error: err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string()),
                        },
                        None => CategoryForecast::Produced(ForecastSeries::from_object(entry)),
                    },
                    None => CategoryForecast::Failed { error: "no forecast returned for category".to_string() },
                };
                (c.clone(), f)
            })
            .collect();

        let mut overall = ForecastSeries::from_object(obj);
        if overall.is_empty() {
            overall = aggregate_category_forecasts(&forecasts).unwrap_or_default();
        }
        return Ok(ForecastResult {
            overall,
            horizon,
            categories: Some(CategoryForecasts {
                category_column: obj
                    .get("category_column")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                categories,
                forecasts,
            }),
        });
    }

    let overall = ForecastSeries::from_object(obj);
    if overall.is_empty() {
        return Err(PanelError::Shape("forecast payload has no predictions".to_string()));
    }
    Ok(ForecastResult { overall, horizon, categories: None })
}

/// Quote a CSV field when it holds a comma, quote or line break.
fn csv_field(raw: &str) -> Cow<'_, str> {
    if raw.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", raw.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastRow {
    pub label: String,
    pub prediction: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

/// The last forecast and what produced it, kept for export.
#[derive(Debug, Clone, Default)]
pub struct ForecastSession {
    pub model_name: Option<String>,
    pub filename: Option<String>,
    pub date_column: Option<String>,
    pub horizon: Option<usize>,
    pub future_dates: Vec<String>,
    last: Option<ForecastResult>,
}

impl ForecastSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        model_name: &str,
        filename: Option<&str>,
        date_column: Option<&str>,
        requested_horizon: Option<usize>,
        result: ForecastResult,
    ) {
        self.model_name = Some(model_name.to_string());
        self.filename = filename.map(str::to_string);
        self.date_column = date_column.map(str::to_string);
        self.horizon = result.horizon.or(requested_horizon);
        self.future_dates = result.overall.future_dates.clone();
        self.last = Some(result);
    }

    pub fn last(&self) -> Option<&ForecastResult> {
        self.last.as_ref()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Rows of the overall forecast.
    pub fn rows(&self) -> Vec<ForecastRow> {
        let Some(result) = &self.last else {
            return Vec::new();
        };
        let s = &result.overall;
        let bounds = s.has_bounds();
        (0..s.len())
            .map(|i| ForecastRow {
                label: s.label(i),
                prediction: s.predictions[i],
                lower: if bounds { s.lower_bound.as_ref().and_then(|b| b.get(i).copied()) } else { None },
                upper: if bounds { s.upper_bound.as_ref().and_then(|b| b.get(i).copied()) } else { None },
            })
            .collect()
    }

    /// Overall forecast as RFC 4180 CSV text.
    pub fn to_csv(&self) -> String {
        let rows = self.rows();
        let bounds = rows.iter().any(|r| r.lower.is_some());
        let header = match (&self.date_column, bounds) {
            (Some(d), true) => format!("{},forecast,lower_bound,upper_bound", csv_field(d)),
            (Some(d), false) => format!("{},forecast", csv_field(d)),
            (None, true) => "step,forecast,lower_bound,upper_bound".to_string(),
            (None, false) => "step,forecast".to_string(),
        };
        let mut out = header;
        out.push('\n');
        for r in rows {
            out.push_str(&csv_field(&r.label));
            out.push(',');
            out.push_str(&r.prediction.to_string());
            if bounds {
                let cell = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();
                out.push(',');
                out.push_str(&cell(r.lower));
                out.push(',');
                out.push_str(&cell(r.upper));
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn series(p: &[f64]) -> ForecastSeries {
        ForecastSeries { predictions: p.to_vec(), ..Default::default() }
    }

    #[test]
    fn test_aggregate_sums_elementwise() {
        let agg = aggregate_category_forecasts(&[
            ("a".to_string(), CategoryForecast::Produced(series(&[1.0, 2.0, 3.0]))),
            ("b".to_string(), CategoryForecast::Produced(series(&[4.0, 5.0, 6.0]))),
        ])
        .unwrap();
        assert_eq!(agg.predictions, vec![5.0, 7.0, 9.0]);
        assert!(agg.lower_bound.is_none());
    }

    #[test]
    fn test_aggregate_bounds_and_dates() {
        let mut a = series(&[1.0, 1.0]);
        a.lower_bound = Some(vec![0.5, 0.5]);
        a.upper_bound = Some(vec![1.5, 1.5]);
        a.future_dates = vec!["2024-01-01".to_string(), "2024-01-02".to_string()];
        let mut b = series(&[2.0, 2.0, 2.0]);
        b.lower_bound = Some(vec![1.0, 1.0, 1.0]);
        b.upper_bound = Some(vec![3.0, 3.0, 3.0]);
        let agg = aggregate_category_forecasts(&[
            ("a".to_string(), CategoryForecast::Produced(a)),
            ("b".to_string(), CategoryForecast::Produced(b)),
            ("c".to_string(), CategoryForecast::Failed { error: "boom".to_string() }),
        ])
        .unwrap();
        assert_eq!(agg.predictions, vec![3.0, 3.0]);
        assert_eq!(agg.lower_bound, Some(vec![1.5, 1.5]));
        assert_eq!(agg.upper_bound, Some(vec![4.5, 4.5]));
        assert_eq!(agg.date_range(), Some(("2024-01-01", "2024-01-02")));
    }

    #[test]
    fn test_aggregate_nothing_produced() {
        assert!(aggregate_category_forecasts(&[(
            "a".to_string(),
            CategoryForecast::Failed { error: "x".to_string() }
        )])
        .is_none());
    }

    #[test]
    fn test_parse_category_forecast_fills_overall() {
        let r = parse_forecast(&json!({
            "is_category_based": true,
            "category_column": "store",
            "categories": ["s1", "s2"],
            "category_forecasts": {
                "s1": {"predictions": [1, 2, 3]},
                "s2": {"predictions": [4, 5, 6]},
            },
            "horizon": 3,
        }))
        .unwrap();
        assert!(r.is_category_based());
        assert_eq!(r.overall.predictions, vec![5.0, 7.0, 9.0]);
        assert!(r.categories.unwrap().all_produced());
    }

    #[test]
    fn test_parse_single_requires_predictions() {
        let err = parse_forecast(&json!({"horizon": 3})).unwrap_err();
        assert!(matches!(err, PanelError::Shape(_)));
    }

    #[test]
    fn test_session_csv() {
        let r = parse_forecast(&json!({
            "predictions": [10.5, 11.0],
            "lower_bound": [9.0, 9.5],
            "upper_bound": [12.0, 12.5],
            "future_dates": ["2024-02-01", "2024-02-02"],
        }))
        .unwrap();
        let mut session = ForecastSession::new();
        session.record("sales_xgb", Some("sales.csv"), Some("date"), Some(2), r);
        assert_eq!(session.horizon, Some(2));
        let csv = session.to_csv();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("date,forecast,lower_bound,upper_bound"));
        assert_eq!(lines.next(), Some("2024-02-01,10.5,9,12"));
        session.clear();
        assert!(session.rows().is_empty());
    }

    #[test]
    fn test_csv_quotes_fields() {
        let r = parse_forecast(&json!({
            "predictions": [1.0],
            "future_dates": ["week 1, \"early\""],
        }))
        .unwrap();
        let mut session = ForecastSession::new();
        session.record("m", None, Some("order date, utc"), None, r);
        let csv = session.to_csv();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("\"order date, utc\",forecast"));
        assert_eq!(lines.next(), Some("\"week 1, \"\"early\"\"\",1"));
        assert_eq!(csv_field("plain"), "plain");
    }
}
