#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::io::Cursor;

use calamine::{Data, Reader, open_workbook_auto_from_rs};
use csv::{ReaderBuilder, WriterBuilder};
use mk_columnar::{Column, ColumnError};
use mk_table::{Table, TableError};
use mk_types::{DType, Scalar};
use rust_xlsxwriter::{DocProperties, ExcelDateTime, Format, Workbook, XlsxError};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 100;
pub const MAX_FILENAME_CHARS: usize = 200;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Tokens read as missing when types are inferred.
const DEFAULT_NA_TOKENS: &[&str] = &[
    "", "#N/A", "#NA", "-NaN", "-nan", "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan",
    "null",
];

#[derive(Debug, Error)]
pub enum IoError {
    #[error("no file was provided")]
    MissingFile,
    #[error("unsupported file format for '{file_name}': expected .csv, .xlsx or .xls")]
    UnsupportedFormat { file_name: String },
    #[error("file is {size_bytes} bytes, larger than the {limit_mb} MB limit")]
    SizeLimitExceeded { size_bytes: u64, limit_mb: u64 },
    #[error("input has no header row")]
    MissingHeaders,
    #[error("line {line}: expected {expected} fields, found {found}")]
    RaggedRow {
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("csv input is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("failed to parse csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to read workbook: {0}")]
    Excel(#[from] calamine::Error),
    #[error("workbook contains no sheets")]
    EmptyWorkbook,
    #[error("table does not fit a worksheet: {rows} rows x {columns} columns")]
    SheetTooLarge { rows: usize, columns: usize },
    #[error("failed to write workbook: {0}")]
    Xlsx(#[from] XlsxError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Xlsx,
    Xls,
}

impl FileFormat {
    /// Resolve the format from the declared file name's extension.
    pub fn from_file_name(file_name: &str) -> Result<Self, IoError> {
        let lower = file_name.trim().to_lowercase();
        let extension = lower.rsplit_once('.').map(|(_, ext)| ext);
        match extension {
            Some("csv") => Ok(Self::Csv),
            Some("xlsx") => Ok(Self::Xlsx),
            Some("xls") => Ok(Self::Xls),
            _ => Err(IoError::UnsupportedFormat {
                file_name: file_name.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub max_file_size_mb: u64,
    /// Keep every cell as literal text instead of inferring column types.
    pub preserve_format: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            max_file_size_mb: DEFAULT_MAX_FILE_SIZE_MB,
            preserve_format: true,
        }
    }
}

/// Load an uploaded CSV or Excel byte stream into a table.
pub fn load_table(file_name: &str, bytes: &[u8], options: &LoadOptions) -> Result<Table, IoError> {
    let size_bytes = bytes.len() as u64;
    if size_bytes > options.max_file_size_mb.saturating_mul(BYTES_PER_MB) {
        warn!(file_name, size_bytes, limit_mb = options.max_file_size_mb, "rejected oversized upload");
        return Err(IoError::SizeLimitExceeded {
            size_bytes,
            limit_mb: options.max_file_size_mb,
        });
    }

    let format = FileFormat::from_file_name(file_name).inspect_err(|_| {
        warn!(file_name, "rejected upload with unsupported extension");
    })?;

    let table = match format {
        FileFormat::Csv => read_csv_bytes(bytes, options.preserve_format)?,
        FileFormat::Xlsx | FileFormat::Xls => read_excel_bytes(bytes, options.preserve_format)?,
    };

    debug!(
        file_name,
        ?format,
        size_bytes,
        rows = table.len(),
        columns = table.width(),
        preserve_format = options.preserve_format,
        "loaded table"
    );
    Ok(table)
}

// ── Cell staging ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Parsed {
    Missing,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text,
}

/// A source cell before its column's dtype is decided: the typed reading
/// plus the literal text to fall back to.
#[derive(Debug, Clone)]
struct RawCell {
    parsed: Parsed,
    text: String,
}

impl RawCell {
    fn missing() -> Self {
        Self {
            parsed: Parsed::Missing,
            text: String::new(),
        }
    }

    fn from_csv_field(field: &str, preserve_format: bool) -> Self {
        if preserve_format {
            return Self {
                parsed: if field.is_empty() {
                    Parsed::Missing
                } else {
                    Parsed::Text
                },
                text: field.to_owned(),
            };
        }

        let trimmed = field.trim();
        let parsed = if DEFAULT_NA_TOKENS.contains(&field) || DEFAULT_NA_TOKENS.contains(&trimmed)
        {
            Parsed::Missing
        } else if let Ok(value) = trimmed.parse::<i64>() {
            Parsed::Int(value)
        } else if let Ok(value) = trimmed.parse::<f64>() {
            Parsed::Float(value)
        } else if trimmed.eq_ignore_ascii_case("true") {
            Parsed::Bool(true)
        } else if trimmed.eq_ignore_ascii_case("false") {
            Parsed::Bool(false)
        } else {
            Parsed::Text
        };
        Self {
            parsed,
            text: field.to_owned(),
        }
    }

    fn from_excel(cell: &Data, preserve_format: bool) -> Self {
        let parsed = match cell {
            Data::Empty => return Self::missing(),
            Data::Int(v) => Parsed::Int(*v),
            Data::Float(v) if v.is_finite() && *v == v.trunc() && v.abs() < 9.0e15 => {
                Parsed::Int(*v as i64)
            }
            Data::Float(v) => Parsed::Float(*v),
            Data::Bool(v) => Parsed::Bool(*v),
            Data::String(_)
            | Data::DateTime(_)
            | Data::DateTimeIso(_)
            | Data::DurationIso(_)
            | Data::Error(_) => Parsed::Text,
        };
        let text = excel_text(cell);
        if preserve_format {
            return Self {
                parsed: if text.is_empty() {
                    Parsed::Missing
                } else {
                    Parsed::Text
                },
                text,
            };
        }
        Self { parsed, text }
    }
}

fn excel_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::Int(v) => v.to_string(),
        Data::Float(v) if v.is_finite() && *v == v.trunc() && v.abs() < 9.0e15 => {
            (*v as i64).to_string()
        }
        Data::Float(v) => v.to_string(),
        Data::Bool(v) => if *v { "True" } else { "False" }.to_owned(),
        Data::String(v) | Data::DateTimeIso(v) | Data::DurationIso(v) => v.clone(),
        Data::DateTime(dt) => dt.as_datetime().map_or_else(
            || dt.as_f64().to_string(),
            |stamp| stamp.format("%Y-%m-%d %H:%M:%S").to_string(),
        ),
        Data::Error(err) => err.to_string(),
    }
}

/// Decide a column's dtype from its staged cells: all integers → int64,
/// all numbers → float64, all booleans → bool, otherwise literal text.
fn finish_column(cells: Vec<RawCell>) -> Result<Column, ColumnError> {
    let present = || cells.iter().filter(|c| c.parsed != Parsed::Missing);

    let dtype = if present().next().is_none() {
        DType::Null
    } else if present().all(|c| matches!(c.parsed, Parsed::Int(_))) {
        DType::Int64
    } else if present().all(|c| matches!(c.parsed, Parsed::Int(_) | Parsed::Float(_))) {
        DType::Float64
    } else if present().all(|c| matches!(c.parsed, Parsed::Bool(_))) {
        DType::Bool
    } else {
        DType::Utf8
    };

    let values = cells
        .into_iter()
        .map(|cell| match (cell.parsed, dtype) {
            (Parsed::Missing, _) => Scalar::missing_for_dtype(dtype),
            (Parsed::Int(v), DType::Int64) => Scalar::Int64(v),
            (Parsed::Int(v), DType::Float64) => Scalar::Float64(v as f64),
            (Parsed::Float(v), DType::Float64) => Scalar::Float64(v),
            (Parsed::Bool(v), DType::Bool) => Scalar::Bool(v),
            _ => Scalar::Utf8(cell.text),
        })
        .collect();

    Column::new(dtype, values)
}

/// Unique, non-empty header names: blanks become `Unnamed: <pos>` and
/// repeats get `.1`, `.2`, ... suffixes.
fn dedupe_headers<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for (pos, name) in raw.enumerate() {
        let base = if name.trim().is_empty() {
            format!("Unnamed: {pos}")
        } else {
            name.to_owned()
        };
        let mut candidate = base.clone();
        let mut counter = 1;
        while seen.contains(&candidate) {
            candidate = format!("{base}.{counter}");
            counter += 1;
        }
        seen.insert(candidate.clone());
        out.push(candidate);
    }
    out
}

fn assemble(headers: Vec<String>, columns: Vec<Vec<RawCell>>) -> Result<Table, IoError> {
    let built = headers
        .into_iter()
        .zip(columns)
        .map(|(name, cells)| Ok((name, finish_column(cells)?)))
        .collect::<Result<Vec<_>, ColumnError>>()?;
    Ok(Table::new(built)?)
}

// ── CSV ────────────────────────────────────────────────────────────────

pub fn read_csv_bytes(bytes: &[u8], preserve_format: bool) -> Result<Table, IoError> {
    let text = std::str::from_utf8(bytes)?;
    read_csv_str(text, preserve_format)
}

pub fn read_csv_str(input: &str, preserve_format: bool) -> Result<Table, IoError> {
    let input = input.strip_prefix('\u{feff}').unwrap_or(input);
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input.as_bytes());

    let headers = reader.headers().cloned()?;
    if headers.is_empty() {
        return Err(IoError::MissingHeaders);
    }

    let header_count = headers.len();
    let row_hint = input.len() / (header_count * 8).max(1);
    let mut columns: Vec<Vec<RawCell>> = (0..header_count)
        .map(|_| Vec::with_capacity(row_hint))
        .collect();

    for row in reader.records() {
        let record = row?;
        if record.len() > header_count {
            return Err(IoError::RaggedRow {
                line: record.position().map_or(0, csv::Position::line),
                expected: header_count,
                found: record.len(),
            });
        }
        for (idx, col) in columns.iter_mut().enumerate() {
            col.push(match record.get(idx) {
                Some(field) => RawCell::from_csv_field(field, preserve_format),
                None => RawCell::missing(),
            });
        }
    }

    assemble(dedupe_headers(headers.iter()), columns)
}

pub fn write_csv_bytes(table: &Table) -> Result<Vec<u8>, IoError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());

    writer.write_record(table.column_names())?;

    let columns: Vec<&Column> = table.columns().map(|(_, column)| column).collect();
    for row_idx in 0..table.len() {
        let row = columns
            .iter()
            .map(|column| {
                column
                    .value(row_idx)
                    .and_then(Scalar::render)
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>();
        writer.write_record(row.iter().map(|cell| cell.as_bytes()))?;
    }

    let bytes = writer.into_inner().map_err(|err| err.into_error())?;
    debug!(rows = table.len(), bytes = bytes.len(), "wrote csv export");
    Ok(bytes)
}

// ── Excel ──────────────────────────────────────────────────────────────

/// Read the first worksheet of an `.xlsx`/`.xls` workbook. The workbook is
/// read in place from the borrowed buffer.
pub fn read_excel_bytes(bytes: &[u8], preserve_format: bool) -> Result<Table, IoError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(IoError::EmptyWorkbook)??;

    let mut rows = range.rows();
    let header_row = rows.next().ok_or(IoError::MissingHeaders)?;
    let header_text: Vec<String> = header_row.iter().map(excel_text).collect();
    let header_count = header_text.len();

    let mut columns: Vec<Vec<RawCell>> = (0..header_count)
        .map(|_| Vec::with_capacity(range.height().saturating_sub(1)))
        .collect();
    for row in rows {
        for (idx, col) in columns.iter_mut().enumerate() {
            col.push(match row.get(idx) {
                Some(cell) => RawCell::from_excel(cell, preserve_format),
                None => RawCell::missing(),
            });
        }
    }

    assemble(dedupe_headers(header_text.iter().map(String::as_str)), columns)
}

/// Serialize a table as a single-sheet workbook with a header row and no
/// index column.
pub fn write_xlsx_bytes(table: &Table) -> Result<Vec<u8>, IoError> {
    let too_large = || IoError::SheetTooLarge {
        rows: table.len(),
        columns: table.width(),
    };

    let mut workbook = Workbook::new();
    // Fixed creation time keeps the output byte-stable.
    let created = ExcelDateTime::from_ymd(2000, 1, 1)?;
    workbook.set_properties(&DocProperties::new().set_creation_datetime(&created));

    let header_format = Format::new().set_bold();
    let worksheet = workbook.add_worksheet();

    for (col_idx, (name, column)) in table.columns().enumerate() {
        let col = u16::try_from(col_idx).map_err(|_| too_large())?;
        worksheet.write_string_with_format(0, col, name, &header_format)?;

        for (row_idx, value) in column.values().iter().enumerate() {
            let row = u32::try_from(row_idx + 1).map_err(|_| too_large())?;
            match value {
                Scalar::Null(_) => {}
                Scalar::Float64(v) if v.is_nan() => {}
                Scalar::Bool(v) => {
                    worksheet.write_boolean(row, col, *v)?;
                }
                Scalar::Int64(v) => {
                    worksheet.write_number(row, col, *v as f64)?;
                }
                Scalar::Float64(v) => {
                    worksheet.write_number(row, col, *v)?;
                }
                Scalar::Utf8(v) => {
                    worksheet.write_string(row, col, v)?;
                }
            }
        }
    }

    let bytes = workbook.save_to_buffer()?;
    debug!(rows = table.len(), bytes = bytes.len(), "wrote xlsx export");
    Ok(bytes)
}

// ── File names ─────────────────────────────────────────────────────────

/// Make a download name safe for common filesystems: reserved characters
/// and control characters become `_`, surrounding spaces and dots are
/// trimmed, and the result is capped at 200 characters.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    let trimmed = replaced.trim_matches(|ch: char| ch == ' ' || ch == '.');
    let truncated: String = trimmed.chars().take(MAX_FILENAME_CHARS).collect();
    if truncated.is_empty() {
        "download".to_owned()
    } else {
        truncated
    }
}
