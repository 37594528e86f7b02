#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use mk_columnar::{Column, ColumnError};
use mk_types::{DType, Scalar};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("column '{column}' has {actual} rows but the table has {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },
    #[error("duplicate column name: '{0}'")]
    DuplicateColumn(String),
    #[error("column '{0}' not found")]
    ColumnNotFound(String),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// Ordered collection of uniquely named, equally long columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: BTreeMap<String, Column>,
    column_order: Vec<String>,
    row_count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::empty()
    }
}

impl Table {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            columns: BTreeMap::new(),
            column_order: Vec::new(),
            row_count: 0,
        }
    }

    /// Build a table from columns in display order.
    pub fn new(columns: Vec<(String, Column)>) -> Result<Self, TableError> {
        let row_count = columns.first().map_or(0, |(_, column)| column.len());
        let mut map = BTreeMap::new();
        let mut column_order = Vec::with_capacity(columns.len());

        for (name, column) in columns {
            if column.len() != row_count {
                return Err(TableError::LengthMismatch {
                    column: name,
                    expected: row_count,
                    actual: column.len(),
                });
            }
            if map.contains_key(&name) {
                return Err(TableError::DuplicateColumn(name));
            }
            column_order.push(name.clone());
            map.insert(name, column);
        }

        Ok(Self {
            columns: map,
            column_order,
            row_count,
        })
    }

    /// Build a table from raw values, inferring each column's dtype.
    pub fn from_values<N, I>(columns: I) -> Result<Self, TableError>
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Vec<Scalar>)>,
    {
        let columns = columns
            .into_iter()
            .map(|(name, values)| Ok((name.into(), Column::from_values(values)?)))
            .collect::<Result<Vec<_>, ColumnError>>()?;
        Self::new(columns)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.row_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.column_order.len()
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_order
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn require_column(&self, name: &str) -> Result<&Column, TableError> {
        self.columns
            .get(name)
            .ok_or_else(|| TableError::ColumnNotFound(name.to_owned()))
    }

    /// Columns in display order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> + '_ {
        self.column_order
            .iter()
            .filter_map(|name| self.columns.get(name).map(|column| (name.as_str(), column)))
    }

    /// Projection onto `names`, in the requested order.
    pub fn select(&self, names: &[String]) -> Result<Self, TableError> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(TableError::DuplicateColumn(name.clone()));
            }
            out.push((name.clone(), self.require_column(name)?.clone()));
        }
        let mut table = Self::new(out)?;
        table.row_count = self.row_count;
        Ok(table)
    }

    /// Copy of the rows at `positions`, in that order.
    pub fn take_rows(&self, positions: &[usize]) -> Result<Self, TableError> {
        let columns = self
            .columns()
            .map(|(name, column)| Ok((name.to_owned(), column.take(positions)?)))
            .collect::<Result<Vec<_>, ColumnError>>()?;
        let mut table = Self::new(columns)?;
        table.row_count = positions.len();
        Ok(table)
    }

    #[must_use]
    pub fn deep_size(&self) -> usize {
        self.columns
            .iter()
            .map(|(name, column)| name.len() + column.deep_size())
            .sum()
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.row_count == other.row_count
            && self.column_order == other.column_order
            && self.columns().all(|(name, column)| {
                other
                    .column(name)
                    .is_some_and(|theirs| column.semantic_eq(theirs))
            })
    }

    /// Trim surrounding whitespace in text columns and turn blank cells into
    /// nulls. `targets` of `None` or an empty slice means every column; names
    /// that are absent or not text are left alone. Returns a new table.
    pub fn normalize(&self, targets: Option<&[String]>) -> Result<Self, TableError> {
        let wanted: Option<BTreeSet<&str>> = targets
            .filter(|names| !names.is_empty())
            .map(|names| names.iter().map(String::as_str).collect());

        let mut touched = 0_usize;
        let mut columns = Vec::with_capacity(self.width());
        for (name, column) in self.columns() {
            let targeted = wanted.as_ref().is_none_or(|set| set.contains(name));
            if !targeted || column.dtype() != DType::Utf8 {
                columns.push((name.to_owned(), column.clone()));
                continue;
            }
            touched += 1;
            columns.push((name.to_owned(), normalize_text_column(column)?));
        }

        debug!(columns = touched, rows = self.row_count, "normalized text columns");
        let mut table = Self::new(columns)?;
        table.row_count = self.row_count;
        Ok(table)
    }

    /// Rows where some text cell contains `term`, ignoring case. Missing
    /// cells never match. An empty term keeps every row.
    pub fn search(&self, term: &str) -> Result<Self, TableError> {
        if term.is_empty() {
            return Ok(self.clone());
        }
        let needle = term.to_lowercase();
        let text_columns: Vec<&Column> = self
            .columns()
            .map(|(_, column)| column)
            .filter(|column| column.dtype() == DType::Utf8)
            .collect();
        let positions: Vec<usize> = (0..self.row_count)
            .filter(|&row| {
                text_columns.iter().any(|column| match column.value(row) {
                    Some(Scalar::Utf8(cell)) => cell.to_lowercase().contains(&needle),
                    _ => false,
                })
            })
            .collect();
        debug!(term, matched = positions.len(), rows = self.row_count, "searched table");
        self.take_rows(&positions)
    }
}

fn normalize_text_column(column: &Column) -> Result<Column, ColumnError> {
    let text = column.cast(DType::Utf8)?;
    let values = text
        .values()
        .iter()
        .map(|value| match value {
            Scalar::Utf8(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    Scalar::null()
                } else {
                    Scalar::Utf8(trimmed.to_owned())
                }
            }
            other => other.clone(),
        })
        .collect();
    Column::new(DType::Utf8, values)
}
