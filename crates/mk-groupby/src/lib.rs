#![forbid(unsafe_code)]

use std::collections::HashMap;

use mk_columnar::{Column, ColumnError};
use mk_table::{Table, TableError};
use mk_types::{DType, KeyAtom, Scalar, nancount, nanmax, nanmean, nanmin, nanquantile, nanstd};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GroupByError {
    #[error("no group-by columns given")]
    NoGroupColumns,
    #[error("cannot apply {func} to column '{column}' of type {dtype}")]
    NonNumericAggregation {
        column: String,
        func: AggFunc,
        dtype: DType,
    },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// Aggregation function selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Sum,
    Mean,
    Count,
    Min,
    Max,
    First,
    Last,
    Std,
    Var,
    Median,
}

impl AggFunc {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::First => "first",
            Self::Last => "last",
            Self::Std => "std",
            Self::Var => "var",
            Self::Median => "median",
        }
    }

    fn accepts(self, dtype: DType) -> bool {
        match self {
            Self::Count | Self::First | Self::Last => true,
            _ => matches!(dtype, DType::Int64 | DType::Float64 | DType::Bool | DType::Null),
        }
    }

    fn output_dtype(self, input: DType) -> DType {
        match self {
            Self::Count => DType::Int64,
            Self::First | Self::Last => input,
            Self::Sum | Self::Min | Self::Max if input == DType::Int64 => DType::Int64,
            _ => DType::Float64,
        }
    }
}

impl std::fmt::Display for AggFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One output column: `func` applied to `column` within each group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub column: String,
    pub func: AggFunc,
}

impl Aggregation {
    pub fn new(column: impl Into<String>, func: AggFunc) -> Self {
        Self {
            column: column.into(),
            func,
        }
    }

    #[must_use]
    pub fn output_name(&self) -> String {
        format!("{}_{}", self.column, self.func.name())
    }
}

/// Group `table` by `group_by` and apply each aggregation.
///
/// Output columns are the group columns followed by `<column>_<func>`, one
/// row per group in first-seen order. Rows with a missing group value are
/// dropped.
pub fn aggregate_columns(
    table: &Table,
    group_by: &[String],
    aggregations: &[Aggregation],
) -> Result<Table, GroupByError> {
    if group_by.is_empty() {
        return Err(GroupByError::NoGroupColumns);
    }
    let key_columns = group_by
        .iter()
        .map(|name| table.require_column(name))
        .collect::<Result<Vec<_>, _>>()?;
    for agg in aggregations {
        let dtype = table.require_column(&agg.column)?.dtype();
        if !agg.func.accepts(dtype) {
            return Err(GroupByError::NonNumericAggregation {
                column: agg.column.clone(),
                func: agg.func,
                dtype,
            });
        }
    }

    let mut ordering = Vec::<Vec<KeyAtom<'_>>>::new();
    let mut groups = HashMap::<Vec<KeyAtom<'_>>, Vec<usize>>::new();
    for row in 0..table.len() {
        let Some(key) = key_columns
            .iter()
            .map(|column| column.value(row).and_then(KeyAtom::from_scalar))
            .collect::<Option<Vec<_>>>()
        else {
            continue;
        };
        groups
            .entry(key)
            .or_insert_with_key(|key| {
                ordering.push(key.clone());
                Vec::new()
            })
            .push(row);
    }

    let members: Vec<&[usize]> = ordering
        .iter()
        .filter_map(|key| groups.get(key).map(Vec::as_slice))
        .collect();
    let first_rows: Vec<usize> = members.iter().filter_map(|rows| rows.first().copied()).collect();

    let mut columns = Vec::with_capacity(group_by.len() + aggregations.len());
    for (name, column) in group_by.iter().zip(&key_columns) {
        columns.push((name.clone(), column.take(&first_rows)?));
    }
    for agg in aggregations {
        let source = table.require_column(&agg.column)?;
        let values = members
            .iter()
            .map(|rows| Ok(reduce(agg.func, &source.take(rows)?)))
            .collect::<Result<Vec<_>, ColumnError>>()?;
        let column = Column::new(agg.func.output_dtype(source.dtype()), values)?;
        columns.push((agg.output_name(), column));
    }

    debug!(
        groups = members.len(),
        aggregations = aggregations.len(),
        "aggregated columns"
    );
    Ok(Table::new(columns)?)
}

fn reduce(func: AggFunc, group: &Column) -> Scalar {
    let values = group.values();
    let float = |value: Option<f64>| value.map_or_else(Scalar::null, Scalar::Float64);
    let ints = || values.iter().filter_map(|value| match value {
        Scalar::Int64(v) => Some(*v),
        _ => None,
    });

    match func {
        AggFunc::Count => Scalar::Int64(nancount(values) as i64),
        AggFunc::First => values
            .iter()
            .find(|value| !value.is_missing())
            .cloned()
            .unwrap_or_else(Scalar::null),
        AggFunc::Last => values
            .iter()
            .rev()
            .find(|value| !value.is_missing())
            .cloned()
            .unwrap_or_else(Scalar::null),
        AggFunc::Sum if group.dtype() == DType::Int64 => {
            Scalar::Int64(ints().fold(0_i64, i64::wrapping_add))
        }
        AggFunc::Sum => Scalar::Float64(
            values
                .iter()
                .filter(|value| !value.is_missing())
                .filter_map(|value| value.to_f64().ok())
                .sum(),
        ),
        AggFunc::Min if group.dtype() == DType::Int64 => {
            ints().min().map_or_else(Scalar::null, Scalar::Int64)
        }
        AggFunc::Max if group.dtype() == DType::Int64 => {
            ints().max().map_or_else(Scalar::null, Scalar::Int64)
        }
        AggFunc::Min => float(nanmin(values)),
        AggFunc::Max => float(nanmax(values)),
        AggFunc::Mean => float(nanmean(values)),
        AggFunc::Std => float(nanstd(values, 1)),
        AggFunc::Var => float(nanstd(values, 1).map(|std| std * std)),
        AggFunc::Median => float(nanquantile(values, 0.5)),
    }
}
