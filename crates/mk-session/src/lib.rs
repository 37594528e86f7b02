#![forbid(unsafe_code)]

use chrono::Local;
use mk_groupby::{Aggregation, GroupByError, aggregate_columns};
use mk_inspect::{
    ColumnComparison, InspectError, QualityReport, ValidationReport, analyze_data_quality,
    compare_columns, detect_key_columns, validate_before_merge,
};
use mk_io::{
    DEFAULT_MAX_FILE_SIZE_MB, IoError, LoadOptions, load_table, sanitize_filename,
    write_csv_bytes, write_xlsx_bytes,
};
use mk_join::{
    ColumnSelection, JoinDescriptor, JoinError, JoinKind, KeySpec, Side, Suffixes, SummaryStats,
    anti_join, build_summary_stats, filter_columns, join_tables,
};
use mk_table::{Table, TableError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const CRATE_TARGETS: &[&str] = &[
    "mk_types",
    "mk_columnar",
    "mk_table",
    "mk_io",
    "mk_join",
    "mk_inspect",
    "mk_groupby",
    "mk_session",
];

/// Install a fmt subscriber. `RUST_LOG` wins when set; otherwise the
/// workspace crates log at `default_level`. Later calls are no-ops.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives: Vec<String> = CRATE_TARGETS
            .iter()
            .map(|target| format!("{target}={default_level}"))
            .collect();
        EnvFilter::new(directives.join(","))
    });
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ── Configuration ──────────────────────────────────────────────────────

pub const MIN_FILE_SIZE_MB: u64 = 10;
pub const MAX_FILE_SIZE_MB: u64 = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "max file size must be between {min} and {max} MB, got {0}",
        min = MIN_FILE_SIZE_MB,
        max = MAX_FILE_SIZE_MB
    )]
    FileSizeOutOfRange(u64),
    #[error("invalid merge configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Join(#[from] JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub max_file_size_mb: u64,
    /// Read every cell as text.
    pub preserve_format: bool,
    /// Trim text columns before merging.
    pub normalize: bool,
    /// Columns of A to normalise; empty means all.
    pub normalize_columns_a: Vec<String>,
    /// Columns of B to normalise; empty means all.
    pub normalize_columns_b: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_file_size_mb: DEFAULT_MAX_FILE_SIZE_MB,
            preserve_format: true,
            normalize: false,
            normalize_columns_a: Vec::new(),
            normalize_columns_b: Vec::new(),
        }
    }
}

impl SessionSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_FILE_SIZE_MB..=MAX_FILE_SIZE_MB).contains(&self.max_file_size_mb) {
            return Err(ConfigError::FileSizeOutOfRange(self.max_file_size_mb));
        }
        Ok(())
    }

    #[must_use]
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            max_file_size_mb: self.max_file_size_mb,
            preserve_format: self.preserve_format,
        }
    }

    fn normalize_targets(&self, side: Side) -> &[String] {
        match side {
            Side::Left => &self.normalize_columns_a,
            Side::Right => &self.normalize_columns_b,
        }
    }
}

/// The saved merge setup: keys, join type and suffixes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub join_key_a: Option<String>,
    pub join_key_b: Option<String>,
    pub join_keys_a: Vec<String>,
    pub join_keys_b: Vec<String>,
    pub use_multiple_keys: bool,
    pub join_type: JoinKind,
    pub suffixes: Suffixes,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            join_key_a: None,
            join_key_b: None,
            join_keys_a: Vec::new(),
            join_keys_b: Vec::new(),
            use_multiple_keys: false,
            join_type: JoinKind::Inner,
            suffixes: Suffixes::default(),
        }
    }
}

impl MergeConfig {
    /// Single-key configuration.
    pub fn single(key_a: impl Into<String>, key_b: impl Into<String>, join_type: JoinKind) -> Self {
        Self {
            join_key_a: Some(key_a.into()),
            join_key_b: Some(key_b.into()),
            join_type,
            ..Self::default()
        }
    }

    /// Composite-key configuration.
    pub fn composite<A, B>(keys_a: A, keys_b: B, join_type: JoinKind) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        Self {
            join_keys_a: keys_a.into_iter().map(Into::into).collect(),
            join_keys_b: keys_b.into_iter().map(Into::into).collect(),
            use_multiple_keys: true,
            join_type,
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a saved configuration. Unknown fields are ignored and missing
    /// ones take their defaults.
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(input)?;
        config.suffixes.validate()?;
        Ok(config)
    }

    /// Key names in effect for `side`, per the composite-key switch.
    #[must_use]
    pub fn keys(&self, side: Side) -> Vec<String> {
        match (self.use_multiple_keys, side) {
            (true, Side::Left) => self.join_keys_a.clone(),
            (true, Side::Right) => self.join_keys_b.clone(),
            (false, Side::Left) => self.join_key_a.iter().cloned().collect(),
            (false, Side::Right) => self.join_key_b.iter().cloned().collect(),
        }
    }

    pub fn descriptor(&self) -> Result<JoinDescriptor, JoinError> {
        JoinDescriptor::new(
            self.join_type,
            KeySpec::new(Side::Left, self.keys(Side::Left))?,
            KeySpec::new(Side::Right, self.keys(Side::Right))?,
            self.suffixes.clone(),
        )
    }
}

// ── History ────────────────────────────────────────────────────────────

pub const HISTORY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub join_type: JoinKind,
    pub keys_a: Vec<String>,
    pub keys_b: Vec<String>,
    pub rows_result: usize,
}

// ── Session ────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("table {0} has not been loaded")]
    TableNotLoaded(Side),
    #[error("no merge result to export")]
    NoResult,
    #[error("merge blocked by validation: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Inspect(#[from] InspectError),
    #[error(transparent)]
    GroupBy(#[from] GroupByError),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// An uploaded file: its declared name and raw bytes.
#[derive(Debug, Clone, Copy)]
pub struct Upload<'a> {
    pub file_name: &'a str,
    pub bytes: &'a [u8],
}

impl<'a> Upload<'a> {
    #[must_use]
    pub fn new(file_name: &'a str, bytes: &'a [u8]) -> Self {
        Self { file_name, bytes }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedTable {
    pub file_name: String,
    pub table: Table,
    pub quality: QualityReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub table: Table,
    pub stats: SummaryStats,
}

/// A named byte buffer ready for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

pub const DEFAULT_EXPORT_STEM: &str = "resultado_merge";

/// State of one interactive merge session: the two inputs, the merge setup,
/// the latest result and the history of completed merges.
#[derive(Debug, Clone, Default)]
pub struct Session {
    settings: SessionSettings,
    config: MergeConfig,
    selection: ColumnSelection,
    table_a: Option<LoadedTable>,
    table_b: Option<LoadedTable>,
    result: Option<MergeOutcome>,
    history: Vec<HistoryEntry>,
}

impl Session {
    pub fn new(settings: SessionSettings) -> Result<Self, SessionError> {
        settings.validate()?;
        Ok(Self {
            settings,
            ..Self::default()
        })
    }

    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: SessionSettings) -> Result<(), SessionError> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: MergeConfig) {
        self.config = config;
    }

    pub fn save_config(&self) -> Result<String, SessionError> {
        Ok(self.config.to_json()?)
    }

    pub fn load_config(&mut self, json: &str) -> Result<(), SessionError> {
        self.config = MergeConfig::from_json(json)?;
        debug!(join_type = %self.config.join_type, "loaded merge configuration");
        Ok(())
    }

    #[must_use]
    pub fn selection(&self) -> &ColumnSelection {
        &self.selection
    }

    pub fn set_selection(&mut self, selection: ColumnSelection) {
        self.selection = selection;
    }

    /// Parse an upload into table A or B and profile it. `None` means the
    /// user submitted without a file. A successful load drops the previous
    /// result, which no longer matches its inputs.
    pub fn load(&mut self, side: Side, upload: Option<Upload<'_>>) -> Result<&LoadedTable, SessionError> {
        let upload = upload.ok_or(IoError::MissingFile)?;
        let table = load_table(upload.file_name, upload.bytes, &self.settings.load_options())?;
        let quality = analyze_data_quality(&table);
        info!(
            side = %side,
            file_name = upload.file_name,
            rows = table.len(),
            columns = table.width(),
            "loaded table"
        );
        self.result = None;
        let slot = match side {
            Side::Left => &mut self.table_a,
            Side::Right => &mut self.table_b,
        };
        Ok(slot.insert(LoadedTable {
            file_name: upload.file_name.to_owned(),
            table,
            quality,
        }))
    }

    pub fn load_a(&mut self, upload: Option<Upload<'_>>) -> Result<&LoadedTable, SessionError> {
        self.load(Side::Left, upload)
    }

    pub fn load_b(&mut self, upload: Option<Upload<'_>>) -> Result<&LoadedTable, SessionError> {
        self.load(Side::Right, upload)
    }

    #[must_use]
    pub fn loaded(&self, side: Side) -> Option<&LoadedTable> {
        match side {
            Side::Left => self.table_a.as_ref(),
            Side::Right => self.table_b.as_ref(),
        }
    }

    fn require(&self, side: Side) -> Result<&Table, SessionError> {
        self.loaded(side)
            .map(|loaded| &loaded.table)
            .ok_or(SessionError::TableNotLoaded(side))
    }

    #[must_use]
    pub fn quality(&self, side: Side) -> Option<&QualityReport> {
        self.loaded(side).map(|loaded| &loaded.quality)
    }

    /// Shared and exclusive column names of the loaded tables.
    pub fn compare_tables(&self) -> Result<ColumnComparison, SessionError> {
        Ok(compare_columns(
            self.require(Side::Left)?,
            self.require(Side::Right)?,
        ))
    }

    /// Likely key columns of one table, best first.
    pub fn suggest_keys(&self, side: Side) -> Result<Vec<String>, SessionError> {
        Ok(detect_key_columns(self.require(side)?)?)
    }

    /// Pre-merge checks of the loaded tables against the configured keys.
    pub fn validate(&self) -> Result<ValidationReport, SessionError> {
        let descriptor = self.config.descriptor()?;
        Ok(validate_before_merge(
            self.require(Side::Left)?,
            self.require(Side::Right)?,
            descriptor.left_keys(),
            descriptor.right_keys(),
        )?)
    }

    fn prepared(&self, side: Side) -> Result<Table, SessionError> {
        let table = self.require(side)?;
        if !self.settings.normalize {
            return Ok(table.clone());
        }
        Ok(table.normalize(Some(self.settings.normalize_targets(side)))?)
    }

    /// Run the configured merge: normalise (when enabled), join or
    /// anti-join, project onto the selection, compute stats and record the
    /// run in the history.
    pub fn generate(&mut self) -> Result<&MergeOutcome, SessionError> {
        let descriptor = self.config.descriptor()?;
        let report = self.validate()?;
        if !report.is_ok() {
            return Err(SessionError::ValidationFailed(report.errors));
        }

        let a = self.prepared(Side::Left)?;
        let b = self.prepared(Side::Right)?;
        let kind = descriptor.kind();
        let (left_keys, right_keys) = (descriptor.left_keys(), descriptor.right_keys());

        let table = match kind {
            JoinKind::AntiANotInB | JoinKind::AntiBNotInA => {
                let result = anti_join(&a, &b, left_keys, right_keys, kind)?;
                let selection = if kind == JoinKind::AntiANotInB {
                    ColumnSelection {
                        from_a: self.selection.from_a.clone(),
                        from_b: Vec::new(),
                    }
                } else {
                    ColumnSelection {
                        from_a: Vec::new(),
                        from_b: self.selection.from_b.clone(),
                    }
                };
                filter_columns(&result, &selection, descriptor.suffixes())?
            }
            JoinKind::Inner | JoinKind::Left | JoinKind::Right | JoinKind::Outer => {
                let merged = join_tables(
                    &a,
                    &b,
                    left_keys,
                    right_keys,
                    kind,
                    descriptor.suffixes(),
                )?;
                filter_columns(&merged, &self.selection, descriptor.suffixes())?
            }
        };
        let stats = build_summary_stats(&a, &b, left_keys, right_keys, kind, &table)?;

        self.history.push(HistoryEntry {
            timestamp: Local::now().format(HISTORY_TIMESTAMP_FORMAT).to_string(),
            join_type: kind,
            keys_a: left_keys.names().to_vec(),
            keys_b: right_keys.names().to_vec(),
            rows_result: table.len(),
        });
        info!(
            join_type = %kind,
            rows_result = table.len(),
            history_len = self.history.len(),
            "generated merge result"
        );
        Ok(self.result.insert(MergeOutcome { table, stats }))
    }

    #[must_use]
    pub fn result(&self) -> Option<&MergeOutcome> {
        self.result.as_ref()
    }

    fn require_result(&self) -> Result<&Table, SessionError> {
        self.result
            .as_ref()
            .map(|outcome| &outcome.table)
            .ok_or(SessionError::NoResult)
    }

    /// Rows of the current result with a text cell containing `term`.
    pub fn search_result(&self, term: &str) -> Result<Table, SessionError> {
        Ok(self.require_result()?.search(term)?)
    }

    /// Group the current result and aggregate value columns.
    pub fn aggregate_result(
        &self,
        group_by: &[String],
        aggregations: &[Aggregation],
    ) -> Result<Table, SessionError> {
        Ok(aggregate_columns(self.require_result()?, group_by, aggregations)?)
    }

    pub fn export_xlsx(&self, stem: &str) -> Result<Export, SessionError> {
        let bytes = write_xlsx_bytes(self.require_result()?)?;
        Ok(Export {
            file_name: sanitize_filename(&format!("{stem}.xlsx")),
            bytes,
        })
    }

    pub fn export_csv(&self, stem: &str) -> Result<Export, SessionError> {
        let bytes = write_csv_bytes(self.require_result()?)?;
        Ok(Export {
            file_name: sanitize_filename(&format!("{stem}.csv")),
            bytes,
        })
    }

    #[must_use]
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        info!(cleared = self.history.len(), "cleared merge history");
        self.history.clear();
    }

    /// Drop tables, result, selection and history; keep settings and config.
    pub fn reset(&mut self) {
        self.table_a = None;
        self.table_b = None;
        self.result = None;
        self.selection = ColumnSelection::default();
        self.history.clear();
        debug!("reset session");
    }
}
