//! Schema refresh state machine and dependent-selector re-rendering.
//!
//! ```text
//! Stable --begin_refresh--> Refreshing{generation}
//! Refreshing --complete(ok)--> Stable (schema replaced, consumers re-rendered)
//! Refreshing --complete(err)--> Stable (prior schema kept)
//! Refreshing --abandon--> Stable (late completion is stale)
//! ```
//!
//! Only one refresh may be in flight; a second request is rejected. Every
//! refresh bumps the generation counter and a completion whose generation
//! is no longer current is dropped.

use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::client::AnalyticsBackend;
use crate::error::{PanelError, PanelResult};
use crate::logging::{log_consistency_warning, log_refresh, v_str};
use crate::schema::{
    dedup_columns, ColumnFilter, ConsumerRegistration, DatasetSchema, RefreshTrigger, SchemaEvent, SchemaPayload,
    SheetRegistration, TransformResponse, UploadResponse,
};

pub const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Stable,
    Refreshing {
        generation: u64,
        filename: String,
        trigger: RefreshTrigger,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTicket {
    generation: u64,
    filename: String,
    sheet: Option<String>,
    trigger: RefreshTrigger,
}

impl RefreshTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn sheet(&self) -> Option<&str> {
        self.sheet.as_deref()
    }

    pub fn trigger(&self) -> RefreshTrigger {
        self.trigger
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedRefresh {
    pub generation: u64,
    pub fingerprint: String,
    /// False when the new schema equals the one it replaced.
    pub changed: bool,
    /// Consumers whose selection was dropped by this refresh.
    pub cleared: Vec<String>,
    pub warning: Option<PanelError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Applied(AppliedRefresh),
    Failed(PanelError),
    Stale,
}

impl RefreshOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RefreshOutcome::Applied(_))
    }

    /// Recoverable problem to surface next to the result, if any.
    pub fn warning(&self) -> Option<&PanelError> {
        match self {
            RefreshOutcome::Applied(a) => a.warning.as_ref(),
            RefreshOutcome::Failed(e) => Some(e),
            RefreshOutcome::Stale => None,
        }
    }
}

/// Re-render every consumer against `columns`.
///
/// Exclusion filters see the other consumer's selection after it has been
/// checked against the new columns.
fn render_consumers(
    columns: &[String],
    consumers: &[ConsumerRegistration],
) -> (Vec<ConsumerRegistration>, Vec<String>) {
    let retained: Vec<(Option<String>, Vec<String>)> = consumers
        .iter()
        .map(|c| {
            let single = c.selection.clone().filter(|s| columns.contains(s));
            let many = c.selections.iter().filter(|s| columns.contains(s)).cloned().collect();
            (single, many)
        })
        .collect();
    let selection_of = |name: &str| -> Option<&String> {
        consumers
            .iter()
            .position(|c| c.name == name)
            .and_then(|i| retained[i].0.as_ref())
    };

    let mut cleared = Vec::new();
    let mut rendered = Vec::with_capacity(consumers.len());
    for (c, (kept, kept_many)) in consumers.iter().zip(&retained) {
        let options: Vec<String> = match &c.filter {
            ColumnFilter::All => columns.to_vec(),
            ColumnFilter::ExcludeSelectionOf(other) => {
                let excluded = selection_of(other);
                columns
                    .iter()
                    .filter(|col| excluded != Some(*col))
                    .cloned()
                    .collect()
            }
        };
        let selection = kept.clone().filter(|s| options.contains(s));
        let selections: Vec<String> = kept_many.iter().filter(|s| options.contains(s)).cloned().collect();
        if (c.selection.is_some() && selection.is_none()) || selections.len() < c.selections.len() {
            cleared.push(c.name.clone());
        }
        rendered.push(ConsumerRegistration {
            name: c.name.clone(),
            filter: c.filter.clone(),
            placeholder: c.placeholder.clone(),
            options,
            selection,
            multiple: c.multiple,
            selections,
        });
    }
    (rendered, cleared)
}

fn selection_event(c: &ConsumerRegistration) -> SchemaEvent {
    if c.multiple {
        SchemaEvent::SelectionsChanged { consumer: c.name.clone(), selections: c.selections.clone() }
    } else {
        SchemaEvent::SelectionChanged { consumer: c.name.clone(), selection: c.selection.clone() }
    }
}

fn render_sheets(schema: &DatasetSchema, selectors: &[SheetRegistration]) -> Vec<SheetRegistration> {
    selectors
        .iter()
        .map(|s| {
            let in_list = |v: &String| schema.sheets.contains(v);
            let selection = schema
                .selected_sheet
                .clone()
                .filter(in_list)
                .or_else(|| s.selection.clone().filter(in_list));
            SheetRegistration {
                name: s.name.clone(),
                options: schema.sheets.clone(),
                selection,
            }
        })
        .collect()
}

pub struct SchemaSyncManager {
    state: SyncState,
    generation: u64,
    schema: Option<DatasetSchema>,
    consumers: Vec<ConsumerRegistration>,
    sheets: Vec<SheetRegistration>,
    events: broadcast::Sender<SchemaEvent>,
}

impl Default for SchemaSyncManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaSyncManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: SyncState::Stable,
            generation: 0,
            schema: None,
            consumers: Vec::new(),
            sheets: Vec::new(),
            events,
        }
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn schema(&self) -> Option<&DatasetSchema> {
        self.schema.as_ref()
    }

    pub fn consumer(&self, name: &str) -> Option<&ConsumerRegistration> {
        self.consumers.iter().find(|c| c.name == name)
    }

    pub fn consumers(&self) -> &[ConsumerRegistration] {
        &self.consumers
    }

    pub fn sheet_selector(&self, name: &str) -> Option<&SheetRegistration> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchemaEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SchemaEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Returns the consumers whose selection the re-render dropped.
    fn rerender(&mut self) -> Vec<String> {
        let columns = self.schema.as_ref().map(|s| s.columns.clone()).unwrap_or_default();
        let (rendered, cleared) = render_consumers(&columns, &self.consumers);
        self.consumers = rendered;
        cleared
    }

    fn add_consumer(&mut self, name: &str, filter: ColumnFilter, placeholder: &str, multiple: bool) {
        let (selection, selections) = self
            .consumer(name)
            .map(|c| (c.selection.clone(), c.selections.clone()))
            .unwrap_or_default();
        self.consumers.retain(|c| c.name != name);
        self.consumers.push(ConsumerRegistration {
            name: name.to_string(),
            filter,
            placeholder: placeholder.to_string(),
            options: Vec::new(),
            selection: selection.filter(|_| !multiple),
            multiple,
            selections: if multiple { selections } else { Vec::new() },
        });
        self.rerender();
    }

    /// Add a column selector. Re-registering a name replaces its filter and
    /// placeholder and keeps its selection.
    pub fn register(&mut self, name: &str, filter: ColumnFilter, placeholder: &str) {
        self.add_consumer(name, filter, placeholder, false);
    }

    /// Add a selector that holds any number of columns, such as the
    /// feature picker. Selections that survive a schema replacement are kept.
    pub fn register_multi(&mut self, name: &str, filter: ColumnFilter, placeholder: &str) {
        self.add_consumer(name, filter, placeholder, true);
    }

    fn consumer_mut(&mut self, name: &str) -> PanelResult<&mut ConsumerRegistration> {
        self.consumers
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| PanelError::validation(format!("unknown selector {}", name)))
    }

    /// Announce every consumer other than `changed` that lost a selection.
    fn announce_cleared(&self, changed: &str, cleared: &[String]) {
        for c in self.consumers.iter().filter(|c| c.name != changed && cleared.contains(&c.name)) {
            self.emit(selection_event(c));
        }
    }

    pub fn register_sheet_selector(&mut self, name: &str) {
        self.sheets.retain(|s| s.name != name);
        self.sheets.push(SheetRegistration { name: name.to_string(), options: Vec::new(), selection: None });
        if let Some(schema) = &self.schema {
            self.sheets = render_sheets(schema, &self.sheets);
        }
    }

    /// Set or clear a consumer's selection. The value must be one of its options.
    pub fn select(&mut self, name: &str, value: Option<&str>) -> PanelResult<()> {
        let consumer = self.consumer_mut(name)?;
        if consumer.multiple {
            return Err(PanelError::validation(format!("{} takes several columns", name)));
        }
        if let Some(v) = value {
            if !consumer.options.iter().any(|o| o == v) {
                return Err(PanelError::validation(format!("{} is not an option of {}", v, name)));
            }
        }
        consumer.selection = value.map(str::to_string);
        let cleared = self.rerender();
        self.emit(SchemaEvent::SelectionChanged {
            consumer: name.to_string(),
            selection: value.map(str::to_string),
        });
        self.announce_cleared(name, &cleared);
        Ok(())
    }

    /// Replace a multi-select consumer's selections. Every value must be one
    /// of its options; duplicates are dropped.
    pub fn select_many(&mut self, name: &str, values: &[&str]) -> PanelResult<()> {
        let consumer = self.consumer_mut(name)?;
        if !consumer.multiple {
            return Err(PanelError::validation(format!("{} takes a single column", name)));
        }
        if let Some(v) = values.iter().find(|v| !consumer.options.iter().any(|o| o == **v)) {
            return Err(PanelError::validation(format!("{} is not an option of {}", v, name)));
        }
        consumer.selections = dedup_columns(values.iter().map(|v| v.to_string()));
        let selections = consumer.selections.clone();
        let cleared = self.rerender();
        self.emit(SchemaEvent::SelectionsChanged { consumer: name.to_string(), selections });
        self.announce_cleared(name, &cleared);
        Ok(())
    }

    pub fn select_sheet(&mut self, name: &str, sheet: Option<&str>) -> PanelResult<()> {
        let selector = self
            .sheets
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| PanelError::validation(format!("unknown sheet selector {}", name)))?;
        if let Some(v) = sheet {
            if !selector.options.iter().any(|o| o == v) {
                return Err(PanelError::validation(format!("no sheet named {}", v)));
            }
        }
        selector.selection = sheet.map(str::to_string);
        Ok(())
    }

    fn is_current(&self, ticket: &RefreshTicket) -> bool {
        matches!(&self.state, SyncState::Refreshing { generation, .. } if *generation == ticket.generation)
    }

    pub fn begin_refresh(&mut self, filename: &str, trigger: RefreshTrigger) -> PanelResult<RefreshTicket> {
        self.begin_sheet_refresh(filename, None, trigger)
    }

    /// Start a refresh of one sheet of `filename`; `None` is the first sheet.
    pub fn begin_sheet_refresh(
        &mut self,
        filename: &str,
        sheet: Option<&str>,
        trigger: RefreshTrigger,
    ) -> PanelResult<RefreshTicket> {
        if filename.trim().is_empty() {
            return Err(PanelError::validation("Please enter filename"));
        }
        if let SyncState::Refreshing { filename: busy, generation, .. } = &self.state {
            log_refresh("refresh_rejected", filename, *generation, &[("in_flight", v_str(busy))]);
            return Err(PanelError::RefreshInFlight { filename: busy.clone() });
        }
        self.generation += 1;
        self.state = SyncState::Refreshing {
            generation: self.generation,
            filename: filename.to_string(),
            trigger,
        };
        log_refresh(
            "refresh_started",
            filename,
            self.generation,
            &[("trigger", json!(trigger)), ("sheet", json!(sheet))],
        );
        Ok(RefreshTicket {
            generation: self.generation,
            filename: filename.to_string(),
            sheet: sheet.map(str::to_string),
            trigger,
        })
    }

    pub fn complete_refresh(
        &mut self,
        ticket: &RefreshTicket,
        result: PanelResult<SchemaPayload>,
    ) -> RefreshOutcome {
        self.finish(ticket, result, None)
    }

    /// Schema for a completed fetch. A payload without a sheet list keeps the
    /// current one. The selected sheet falls back to the sheet the fetch asked
    /// for, then to the current selection unless the refresh was a sheet change.
    fn carry_sheets(&self, payload: SchemaPayload, ticket: &RefreshTicket) -> DatasetSchema {
        let prior = self.schema.as_ref();
        let SchemaPayload { columns, sheets, selected_sheet, rows } = payload;
        let mut selected_sheet = selected_sheet.or_else(|| ticket.sheet.clone());
        if selected_sheet.is_none() && ticket.trigger != RefreshTrigger::SheetChange {
            selected_sheet = prior.and_then(|s| s.selected_sheet.clone());
        }
        SchemaPayload {
            columns,
            sheets: sheets.or_else(|| prior.map(|s| s.sheets.clone())),
            selected_sheet,
            rows,
        }
        .into_schema(&ticket.filename)
    }

    /// Apply a fetch result. When `expected` names a column the fetched
    /// schema lacks, it is appended before the schema is published and the
    /// outcome carries a consistency warning.
    fn finish(
        &mut self,
        ticket: &RefreshTicket,
        result: PanelResult<SchemaPayload>,
        expected: Option<&str>,
    ) -> RefreshOutcome {
        if !self.is_current(ticket) {
            log_refresh("refresh_stale", &ticket.filename, ticket.generation, &[("current", json!(self.generation))]);
            return RefreshOutcome::Stale;
        }
        self.state = SyncState::Stable;
        match result {
            Ok(payload) => {
                let mut schema = self.carry_sheets(payload, ticket);
                let missing = expected.filter(|col| !schema.has_column(col));
                let available = schema.columns.len();
                if let Some(column) = missing {
                    schema.columns.push(column.to_string());
                }
                let mut applied = self.install(schema);
                if let Some(column) = missing {
                    log_consistency_warning(&ticket.filename, column, available);
                    self.emit(SchemaEvent::ColumnSynthesized {
                        filename: ticket.filename.clone(),
                        column: column.to_string(),
                    });
                    applied.warning = Some(PanelError::Consistency(format!(
                        "column {} was reported by the transform but missing from the refreshed schema of {}",
                        column, ticket.filename
                    )));
                }
                RefreshOutcome::Applied(applied)
            }
            Err(err) => {
                log_refresh(
                    "refresh_failed",
                    &ticket.filename,
                    ticket.generation,
                    &[("error", v_str(&err.to_string()))],
                );
                self.emit(SchemaEvent::RefreshFailed {
                    filename: ticket.filename.clone(),
                    generation: ticket.generation,
                    error: err.to_string(),
                });
                RefreshOutcome::Failed(err)
            }
        }
    }

    /// Give up on an in-flight refresh. Returns false if the ticket was not current.
    pub fn abandon(&mut self, ticket: &RefreshTicket) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        self.state = SyncState::Stable;
        log_refresh("refresh_abandoned", &ticket.filename, ticket.generation, &[]);
        self.emit(SchemaEvent::RefreshAbandoned {
            filename: ticket.filename.clone(),
            generation: ticket.generation,
        });
        true
    }

    /// Replace the schema and re-render every selector from it.
    fn install(&mut self, schema: DatasetSchema) -> AppliedRefresh {
        let (consumers, cleared) = render_consumers(&schema.columns, &self.consumers);
        let sheets = render_sheets(&schema, &self.sheets);
        let fingerprint = schema.fingerprint();
        let changed = self.schema.as_ref().map(|s| s.fingerprint()) != Some(fingerprint.clone());

        log_refresh(
            "refresh_applied",
            &schema.filename,
            self.generation,
            &[
                ("columns", json!(schema.columns.len())),
                ("changed", json!(changed)),
                ("cleared", json!(cleared)),
            ],
        );
        self.emit(SchemaEvent::Replaced {
            filename: schema.filename.clone(),
            generation: self.generation,
            fingerprint: fingerprint.clone(),
            changed,
        });

        self.consumers = consumers;
        self.sheets = sheets;
        self.schema = Some(schema);
        AppliedRefresh { generation: self.generation, fingerprint, changed, cleared, warning: None }
    }

    /// Publish the schema carried by an upload response.
    ///
    /// An upload supersedes any refresh still in flight.
    pub fn apply_upload(&mut self, upload: UploadResponse) -> AppliedRefresh {
        self.generation += 1;
        self.state = SyncState::Stable;
        let schema = upload.schema.into_schema(&upload.filename);
        self.install(schema)
    }

    /// Publish an upload, asking the backend for the sheet list when a
    /// workbook reply came without one. A failed listing leaves the sheet
    /// selectors empty and is returned as the warning.
    pub async fn upload<B: AnalyticsBackend + ?Sized>(
        &mut self,
        backend: &B,
        mut upload: UploadResponse,
        limit: Duration,
    ) -> AppliedRefresh {
        let mut warning = None;
        if upload.needs_sheet_listing() {
            match tokio::time::timeout(limit, backend.list_sheets(&upload.filename)).await {
                Ok(Ok(sheets)) => upload.schema.sheets = Some(sheets),
                Ok(Err(err)) => warning = Some(err),
                Err(_) => {
                    warning = Some(PanelError::Timeout {
                        operation: "list sheets".to_string(),
                        secs: limit.as_secs(),
                    })
                }
            }
        }
        if let Some(err) = &warning {
            let error = v_str(&err.to_string());
            log_refresh("sheet_listing_failed", &upload.filename, self.generation, &[("error", error)]);
        }
        let mut applied = self.apply_upload(upload);
        applied.warning = warning;
        applied
    }

    /// Fetch the schema for `filename` and apply it, abandoning after `limit`.
    ///
    /// Errors only when the refresh cannot start; a failed or timed-out
    /// fetch is reported through [`RefreshOutcome::Failed`].
    pub async fn refresh<B: AnalyticsBackend + ?Sized>(
        &mut self,
        backend: &B,
        filename: &str,
        sheet: Option<&str>,
        trigger: RefreshTrigger,
        limit: Duration,
    ) -> PanelResult<RefreshOutcome> {
        self.fetch_and_apply(backend, filename, sheet, trigger, limit, None).await
    }

    async fn fetch_and_apply<B: AnalyticsBackend + ?Sized>(
        &mut self,
        backend: &B,
        filename: &str,
        sheet: Option<&str>,
        trigger: RefreshTrigger,
        limit: Duration,
        expected: Option<&str>,
    ) -> PanelResult<RefreshOutcome> {
        let ticket = self.begin_sheet_refresh(filename, sheet, trigger)?;
        match tokio::time::timeout(limit, backend.fetch_schema(filename, sheet)).await {
            Ok(result) => Ok(self.finish(&ticket, result, expected)),
            Err(_) => {
                self.abandon(&ticket);
                Ok(RefreshOutcome::Failed(PanelError::Timeout {
                    operation: "schema refresh".to_string(),
                    secs: limit.as_secs(),
                }))
            }
        }
    }

    /// Refresh after a destructive transform and check that the column it
    /// reported is present. A missing column is appended and reported as a
    /// consistency warning on an otherwise successful outcome.
    pub async fn apply_transform<B: AnalyticsBackend + ?Sized>(
        &mut self,
        backend: &B,
        response: &TransformResponse,
        limit: Duration,
    ) -> PanelResult<RefreshOutcome> {
        self.fetch_and_apply(
            backend,
            &response.processed_file,
            None,
            RefreshTrigger::Transform,
            limit,
            response.new_column_name.as_deref(),
        )
        .await
    }
}
