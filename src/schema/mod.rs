//! Dataset schema and the selectors that depend on it.
//!
//! A destructive transform produces a new file whose columns replace the
//! previous schema wholesale. Every registered column or sheet selector is
//! re-rendered from the new schema by [`SchemaSyncManager`].

pub mod sync;

pub use sync::{AppliedRefresh, RefreshOutcome, RefreshTicket, SchemaSyncManager, SyncState};

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{PanelError, PanelResult};

fn string_list(v: Option<&Value>) -> Option<Vec<String>> {
    let arr = v?.as_array()?;
    Some(
        arr.iter()
            .map(|x| x.as_str().map(str::to_string).unwrap_or_else(|| x.to_string()))
            .collect(),
    )
}

/// Deduplicate keeping the first occurrence.
pub fn dedup_columns<I: IntoIterator<Item = String>>(columns: I) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for c in columns {
        if !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSchema {
    pub filename: String,
    pub columns: Vec<String>,
    pub sheets: Vec<String>,
    pub selected_sheet: Option<String>,
    pub rows: Option<u64>,
}

impl DatasetSchema {
    pub fn new(filename: &str, columns: Vec<String>) -> Self {
        Self {
            filename: filename.to_string(),
            columns: dedup_columns(columns),
            sheets: Vec::new(),
            selected_sheet: None,
            rows: None,
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// SHA-256 over filename, selected sheet and columns.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.filename.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.selected_sheet.as_deref().unwrap_or("").as_bytes());
        for c in &self.columns {
            hasher.update([0u8]);
            hasher.update(c.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Column list as returned by a schema fetch.
///
/// `sheets` and `selected_sheet` are `None` when the payload did not carry
/// them; the EDA summary endpoint sends columns only.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaPayload {
    pub columns: Vec<String>,
    pub sheets: Option<Vec<String>>,
    pub selected_sheet: Option<String>,
    pub rows: Option<u64>,
}

impl SchemaPayload {
    /// Accepts the column list under `columns`, `column_names` or
    /// `columns_list`, in that order. `columns` may also be a bare count,
    /// which is skipped.
    pub fn from_value(data: &Value) -> PanelResult<Self> {
        let obj = data
            .as_object()
            .ok_or_else(|| PanelError::Shape("schema payload is not an object".to_string()))?;
        let columns = ["columns", "column_names", "columns_list"]
            .iter()
            .find_map(|k| string_list(obj.get(*k)).filter(|c| !c.is_empty()))
            .ok_or_else(|| {
                PanelError::Shape(format!(
                    "no column list in schema payload (keys: {})",
                    obj.keys().cloned().collect::<Vec<_>>().join(", ")
                ))
            })?;
        Ok(Self {
            columns: dedup_columns(columns),
            sheets: string_list(obj.get("available_sheets")).or_else(|| string_list(obj.get("sheets"))),
            selected_sheet: obj.get("sheet_name").and_then(Value::as_str).map(str::to_string),
            rows: obj.get("rows").and_then(Value::as_u64),
        })
    }

    pub fn into_schema(self, filename: &str) -> DatasetSchema {
        DatasetSchema {
            filename: filename.to_string(),
            columns: dedup_columns(self.columns),
            sheets: self.sheets.unwrap_or_default(),
            selected_sheet: self.selected_sheet,
            rows: self.rows,
        }
    }
}

/// Sheet names from a `/list-sheets` reply: a bare array, or an object
/// carrying `sheets` or `available_sheets`. An empty list is a shape error.
pub fn sheet_list(data: &Value) -> PanelResult<Vec<String>> {
    let sheets = string_list(Some(data))
        .or_else(|| string_list(data.get("sheets")))
        .or_else(|| string_list(data.get("available_sheets")))
        .unwrap_or_default();
    if sheets.is_empty() {
        return Err(PanelError::Shape("No sheets found".to_string()));
    }
    Ok(dedup_columns(sheets))
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadResponse {
    pub filename: String,
    pub schema: SchemaPayload,
}

impl UploadResponse {
    pub fn from_value(data: &Value) -> PanelResult<Self> {
        let filename = data
            .get("filename")
            .and_then(Value::as_str)
            .ok_or_else(|| PanelError::Shape("upload response has no filename".to_string()))?;
        Ok(Self {
            filename: filename.to_string(),
            schema: SchemaPayload::from_value(data)?,
        })
    }

    pub fn is_workbook(&self) -> bool {
        let lower = self.filename.to_lowercase();
        lower.ends_with(".xlsx") || lower.ends_with(".xls")
    }

    /// A workbook whose upload reply did not list its sheets.
    pub fn needs_sheet_listing(&self) -> bool {
        self.is_workbook() && self.schema.sheets.as_ref().map_or(true, Vec::is_empty)
    }
}

/// Result of a destructive preprocessing transform.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformResponse {
    pub processed_file: String,
    pub new_column_name: Option<String>,
    pub transformation_applied: Option<String>,
    /// `is_stationary_after` or `has_seasonality_after`, whichever was sent.
    pub check_after: Option<bool>,
}

impl TransformResponse {
    pub fn from_value(data: &Value) -> PanelResult<Self> {
        let obj: &Map<String, Value> = data
            .as_object()
            .ok_or_else(|| PanelError::Shape("transform response is not an object".to_string()))?;
        let processed_file = obj
            .get("processed_file")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PanelError::Shape("transform response has no processed_file".to_string()))?;
        Ok(Self {
            processed_file: processed_file.to_string(),
            new_column_name: obj.get("new_column_name").and_then(Value::as_str).map(str::to_string),
            transformation_applied: obj
                .get("transformation_applied")
                .and_then(Value::as_str)
                .map(str::to_string),
            check_after: obj
                .get("is_stationary_after")
                .or_else(|| obj.get("has_seasonality_after"))
                .and_then(Value::as_bool),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTrigger {
    Upload,
    Transform,
    SheetChange,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnFilter {
    All,
    /// Every column except the one currently selected in the named consumer.
    ExcludeSelectionOf(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerRegistration {
    pub name: String,
    pub filter: ColumnFilter,
    pub placeholder: String,
    pub options: Vec<String>,
    pub selection: Option<String>,
    /// Multi-select consumers hold their values in `selections` and never
    /// set `selection`.
    pub multiple: bool,
    pub selections: Vec<String>,
}


#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SheetRegistration {
    pub name: String,
    pub options: Vec<String>,
    /// `None` means the first sheet.
    pub selection: Option<String>,
}

pub const DEFAULT_SHEET_PLACEHOLDER: &str = "First Sheet (Default)";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchemaEvent {
    Replaced {
        filename: String,
        generation: u64,
        fingerprint: String,
        changed: bool,
    },
    RefreshFailed {
        filename: String,
        generation: u64,
        error: String,
    },
    RefreshAbandoned {
        filename: String,
        generation: u64,
    },
    ColumnSynthesized {
        filename: String,
        column: String,
    },
    SelectionChanged {
        consumer: String,
        selection: Option<String>,
    },
    SelectionsChanged {
        consumer: String,
        selections: Vec<String>,
    },
}
