#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};

use mk_columnar::Column;
use mk_join::{JoinError, KeySpec, Side, key_tuples};
use mk_table::{Table, TableError};
use mk_types::{
    DType, KeyAtom, Scalar, nancount, nanmax, nanmean, nanmin, nanquantile, nanstd,
};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("invalid key-name pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Join(#[from] JoinError),
}

fn distinct_atoms(column: &Column) -> HashSet<KeyAtom<'_>> {
    column.values().iter().filter_map(KeyAtom::from_scalar).collect()
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

// ── Key detection ──────────────────────────────────────────────────────

/// Lowercase column-name patterns that suggest an identifier.
pub const KEY_NAME_PATTERNS: &[&str] = &[
    r"^id$",
    r"_id$",
    r"^id_",
    r"code|codigo|código",
    r"key|clave",
    r"e-?mail|correo",
    r"(^|_)(dni|nif|nie|cedula|cédula|rut|curp|ssn|cpf|rfc)(_|$)",
    r"sku",
];

pub const NAME_MATCH_SCORE: u32 = 10;
pub const HIGH_UNIQUENESS_SCORE: u32 = 5;
pub const MODERATE_UNIQUENESS_SCORE: u32 = 2;
pub const LOW_NULLS_SCORE: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyCandidate {
    pub column: String,
    pub score: u32,
}

/// Ranks columns by how likely they are to be a join key.
#[derive(Debug, Clone)]
pub struct KeyDetector {
    patterns: RegexSet,
}

impl KeyDetector {
    pub fn new() -> Result<Self, InspectError> {
        Ok(Self {
            patterns: RegexSet::new(KEY_NAME_PATTERNS)?,
        })
    }

    #[must_use]
    pub fn score(&self, name: &str, column: &Column) -> u32 {
        let mut score = 0;
        if self.patterns.is_match(&name.to_lowercase()) {
            score += NAME_MATCH_SCORE;
        }

        let non_null = column.len() - column.null_count();
        let uniqueness = ratio(distinct_atoms(column).len(), non_null);
        if uniqueness > 0.9 {
            score += HIGH_UNIQUENESS_SCORE;
        } else if uniqueness > 0.7 {
            score += MODERATE_UNIQUENESS_SCORE;
        }

        if !column.is_empty() && ratio(column.null_count(), column.len()) < 0.1 {
            score += LOW_NULLS_SCORE;
        }
        score
    }

    /// Every column with a positive score, best first; ties keep column order.
    #[must_use]
    pub fn rank(&self, table: &Table) -> Vec<KeyCandidate> {
        let mut candidates: Vec<KeyCandidate> = table
            .columns()
            .map(|(name, column)| KeyCandidate {
                column: name.to_owned(),
                score: self.score(name, column),
            })
            .filter(|candidate| candidate.score > 0)
            .collect();
        candidates.sort_by(|a, b| b.score.cmp(&a.score));
        candidates
    }
}

/// Column names ranked by key suitability, best first.
pub fn detect_key_columns(table: &Table) -> Result<Vec<String>, InspectError> {
    let detector = KeyDetector::new()?;
    let ranked: Vec<String> = detector
        .rank(table)
        .into_iter()
        .map(|candidate| candidate.column)
        .collect();
    debug!(candidates = ranked.len(), "ranked key columns");
    Ok(ranked)
}

// ── Validation ─────────────────────────────────────────────────────────

/// Rows of each side compared when checking whether mismatched key types
/// still look numeric.
pub const TYPE_CHECK_SAMPLE: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicates_a: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicates_b: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nulls_a: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nulls_b: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_a: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_b: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlap: Option<usize>,
}

/// Outcome of the pre-merge checks. `errors` block the merge, `warnings`
/// are advisory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub info: ValidationInfo,
}

impl ValidationReport {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Extra occurrences of repeated non-null values (first occurrence not
/// counted).
fn repeated_occurrences(column: &Column) -> usize {
    let non_null = column.len() - column.null_count();
    non_null - distinct_atoms(column).len()
}

fn looks_numeric(column: &Column) -> bool {
    column
        .values()
        .iter()
        .filter(|value| !value.is_missing())
        .take(TYPE_CHECK_SAMPLE)
        .all(|value| value.coerce_numeric().is_ok())
}

/// Check two tables and their keys before merging.
///
/// Missing key columns end the check with errors. Null counts cover keys of
/// any width; duplicate, type and overlap checks only run for single-column
/// keys.
pub fn validate_before_merge(
    a: &Table,
    b: &Table,
    keys_a: &KeySpec,
    keys_b: &KeySpec,
) -> Result<ValidationReport, InspectError> {
    let mut report = ValidationReport::default();

    for (table, keys, side) in [(a, keys_a, Side::Left), (b, keys_b, Side::Right)] {
        for name in keys.names() {
            if !table.has_column(name) {
                report
                    .errors
                    .push(format!("Column '{name}' does not exist in table {side}"));
            }
        }
    }
    if !report.errors.is_empty() {
        info!(errors = report.errors.len(), "merge validation failed");
        return Ok(report);
    }

    for (table, keys, side) in [(a, keys_a, Side::Left), (b, keys_b, Side::Right)] {
        if let Some(name) = keys.as_single() {
            let duplicates = repeated_occurrences(table.require_column(name)?);
            if duplicates > 0 {
                report.warnings.push(format!(
                    "Table {side} has {duplicates} duplicate value(s) in '{name}'"
                ));
            }
            match side {
                Side::Left => report.info.duplicates_a = Some(duplicates),
                Side::Right => report.info.duplicates_b = Some(duplicates),
            }
        }

        let nulls = key_tuples(table, keys, side)?
            .iter()
            .filter(|tuple| tuple.is_none())
            .count();
        if nulls > 0 {
            report.warnings.push(format!(
                "Table {side} has {nulls} row(s) with a null key"
            ));
        }
        match side {
            Side::Left => report.info.nulls_a = Some(nulls),
            Side::Right => report.info.nulls_b = Some(nulls),
        }
    }

    if let (Some(name_a), Some(name_b)) = (keys_a.as_single(), keys_b.as_single()) {
        let column_a = a.require_column(name_a)?;
        let column_b = b.require_column(name_b)?;

        if column_a.dtype() != column_b.dtype() && looks_numeric(column_a) && looks_numeric(column_b)
        {
            report.warnings.push(format!(
                "Key types differ ({} in A, {} in B); values look numeric and may need conversion",
                column_a.dtype(),
                column_b.dtype()
            ));
        }

        let set_a = distinct_atoms(column_a);
        let set_b = distinct_atoms(column_b);
        let overlap = set_a.intersection(&set_b).count();
        if overlap == 0 {
            report
                .warnings
                .push("No key values in common between A and B".to_owned());
        }
        report.info.unique_a = Some(set_a.len());
        report.info.unique_b = Some(set_b.len());
        report.info.overlap = Some(overlap);
    }

    info!(
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        overlap = ?report.info.overlap,
        "validated merge inputs"
    );
    Ok(report)
}

// ── Duplicates ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DuplicateReport {
    pub has_duplicates: bool,
    /// Rows whose value occurs more than once, every occurrence counted.
    pub duplicate_count: usize,
    /// Each repeated value once, in first-seen order.
    pub duplicate_values: Vec<Scalar>,
}

/// Repeated non-null values of one column.
pub fn detect_duplicates(table: &Table, column: &str) -> Result<DuplicateReport, InspectError> {
    let column = table.require_column(column)?;

    let mut counts = HashMap::<KeyAtom<'_>, usize>::new();
    let mut first_seen = Vec::new();
    for value in column.values() {
        let Some(atom) = KeyAtom::from_scalar(value) else {
            continue;
        };
        let count = counts.entry(atom).or_insert(0);
        if *count == 0 {
            first_seen.push((atom, value));
        }
        *count += 1;
    }

    let mut report = DuplicateReport::default();
    for (atom, value) in first_seen {
        let count = counts.get(&atom).copied().unwrap_or(0);
        if count > 1 {
            report.duplicate_count += count;
            report.duplicate_values.push(value.clone());
        }
    }
    report.has_duplicates = report.duplicate_count > 0;
    Ok(report)
}

// ── Column comparison ──────────────────────────────────────────────────

/// Side-by-side shape of two tables before a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColumnComparison {
    pub rows_a: usize,
    pub rows_b: usize,
    /// Absolute difference of the row counts.
    pub row_difference: usize,
    /// Names present in both tables, in A's order.
    pub common: Vec<String>,
    pub only_a: Vec<String>,
    pub only_b: Vec<String>,
}

#[must_use]
pub fn compare_columns(a: &Table, b: &Table) -> ColumnComparison {
    let (common, only_a): (Vec<String>, Vec<String>) = a
        .column_names()
        .iter()
        .cloned()
        .partition(|name| b.has_column(name));
    let only_b = b
        .column_names()
        .iter()
        .filter(|name| !a.has_column(name))
        .cloned()
        .collect();
    ColumnComparison {
        rows_a: a.len(),
        rows_b: b.len(),
        row_difference: a.len().abs_diff(b.len()),
        common,
        only_a,
        only_b,
    }
}

// ── Data quality ───────────────────────────────────────────────────────

/// `describe()`-style summary of a numeric column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct NumericSummary {
    pub count: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    #[serde(rename = "25%")]
    pub q25: Option<f64>,
    #[serde(rename = "50%")]
    pub q50: Option<f64>,
    #[serde(rename = "75%")]
    pub q75: Option<f64>,
    pub max: Option<f64>,
}

impl NumericSummary {
    #[must_use]
    pub fn of(values: &[Scalar]) -> Self {
        Self {
            count: nancount(values),
            mean: nanmean(values),
            std: nanstd(values, 1),
            min: nanmin(values),
            q25: nanquantile(values, 0.25),
            q50: nanquantile(values, 0.5),
            q75: nanquantile(values, 0.75),
            max: nanmax(values),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityReport {
    pub total_rows: usize,
    pub total_columns: usize,
    pub null_counts: BTreeMap<String, usize>,
    pub null_percentages: BTreeMap<String, f64>,
    pub memory_usage_mb: f64,
    /// Rows identical to an earlier row.
    pub duplicate_rows: usize,
    pub dtypes: BTreeMap<String, DType>,
    pub numeric_summary: BTreeMap<String, NumericSummary>,
}

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[must_use]
pub fn analyze_data_quality(table: &Table) -> QualityReport {
    let mut report = QualityReport {
        total_rows: table.len(),
        total_columns: table.width(),
        memory_usage_mb: table.deep_size() as f64 / BYTES_PER_MB,
        ..QualityReport::default()
    };

    for (name, column) in table.columns() {
        let nulls = column.null_count();
        report.null_counts.insert(name.to_owned(), nulls);
        report
            .null_percentages
            .insert(name.to_owned(), ratio(nulls, table.len()) * 100.0);
        report.dtypes.insert(name.to_owned(), column.dtype());
        if column.dtype().is_numeric() {
            report
                .numeric_summary
                .insert(name.to_owned(), NumericSummary::of(column.values()));
        }
    }

    let columns: Vec<&Column> = table.columns().map(|(_, column)| column).collect();
    let mut seen_rows = HashSet::with_capacity(table.len());
    for row in 0..table.len() {
        let cells: Vec<Option<KeyAtom<'_>>> = columns
            .iter()
            .map(|column| column.value(row).and_then(KeyAtom::from_scalar))
            .collect();
        if !seen_rows.insert(cells) {
            report.duplicate_rows += 1;
        }
    }

    debug!(
        rows = report.total_rows,
        columns = report.total_columns,
        duplicate_rows = report.duplicate_rows,
        "analyzed data quality"
    );
    report
}
