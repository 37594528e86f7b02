#![forbid(unsafe_code)]

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    mem::size_of,
};

use bumpalo::{Bump, collections::Vec as BumpVec};
use mk_columnar::{Column, ColumnError};
use mk_table::{Table, TableError};
use mk_types::{DType, KeyAtom, common_dtype};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Outer,
    #[serde(
        rename = "anti_a_not_in_b",
        alias = "anti A vs B",
        alias = "anti_A_vs_B",
        alias = "A_not_in_B"
    )]
    AntiANotInB,
    #[serde(
        rename = "anti_b_not_in_a",
        alias = "anti B vs A",
        alias = "anti_B_vs_A",
        alias = "B_not_in_A"
    )]
    AntiBNotInA,
}

impl JoinKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inner => "inner",
            Self::Left => "left",
            Self::Right => "right",
            Self::Outer => "outer",
            Self::AntiANotInB => "anti_a_not_in_b",
            Self::AntiBNotInA => "anti_b_not_in_a",
        }
    }

    #[must_use]
    pub fn is_anti(self) -> bool {
        matches!(self, Self::AntiANotInB | Self::AntiBNotInA)
    }
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which input table a name or count refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => f.write_str("A"),
            Self::Right => f.write_str("B"),
        }
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("key specification for table {side} is empty")]
    EmptyKey { side: Side },
    #[error("key arity mismatch: {left} column(s) in A, {right} in B")]
    KeyArityMismatch { left: usize, right: usize },
    #[error("key column '{column}' not found in table {side}")]
    MissingKeyColumn { side: Side, column: String },
    #[error(
        "key columns '{left_column}' ({left}) and '{right_column}' ({right}) have incompatible types"
    )]
    KeyDtypeMismatch {
        left_column: String,
        right_column: String,
        left: DType,
        right: DType,
    },
    #[error("merge would produce duplicate column '{0}'")]
    DuplicateOutputColumn(String),
    #[error("suffixes must differ, both are '{0}'")]
    IdenticalSuffixes(String),
    #[error("{kind} is not an anti-join")]
    NotAntiJoin { kind: JoinKind },
    #[error("{kind} is an anti-join and has no relational merge")]
    AntiJoinKind { kind: JoinKind },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// Ordered, non-empty list of key column names for one side of a join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySpec(Vec<String>);

impl KeySpec {
    pub fn new<I, S>(side: Side, names: I) -> Result<Self, JoinError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() || names.iter().any(|name| name.trim().is_empty()) {
            return Err(JoinError::EmptyKey { side });
        }
        Ok(Self(names))
    }

    pub fn single(side: Side, name: impl Into<String>) -> Result<Self, JoinError> {
        Self::new(side, [name])
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The column name when the key has exactly one column.
    #[must_use]
    pub fn as_single(&self) -> Option<&str> {
        match self.0.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct Suffixes {
    pub left: String,
    pub right: String,
}

impl Suffixes {
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Result<Self, JoinError> {
        let out = Self {
            left: left.into(),
            right: right.into(),
        };
        out.validate()?;
        Ok(out)
    }

    pub fn validate(&self) -> Result<(), JoinError> {
        if self.left == self.right {
            return Err(JoinError::IdenticalSuffixes(self.left.clone()));
        }
        Ok(())
    }

    #[must_use]
    pub fn for_side(&self, side: Side) -> &str {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }
}

impl Default for Suffixes {
    fn default() -> Self {
        Self {
            left: "_A".to_owned(),
            right: "_B".to_owned(),
        }
    }
}

impl From<(String, String)> for Suffixes {
    fn from((left, right): (String, String)) -> Self {
        Self { left, right }
    }
}

impl From<Suffixes> for (String, String) {
    fn from(value: Suffixes) -> Self {
        (value.left, value.right)
    }
}

/// Everything needed to run one merge: kind, key per side, and suffixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinDescriptor {
    kind: JoinKind,
    left_keys: KeySpec,
    right_keys: KeySpec,
    suffixes: Suffixes,
}

impl JoinDescriptor {
    pub fn new(
        kind: JoinKind,
        left_keys: KeySpec,
        right_keys: KeySpec,
        suffixes: Suffixes,
    ) -> Result<Self, JoinError> {
        if left_keys.len() != right_keys.len() {
            return Err(JoinError::KeyArityMismatch {
                left: left_keys.len(),
                right: right_keys.len(),
            });
        }
        suffixes.validate()?;
        Ok(Self {
            kind,
            left_keys,
            right_keys,
            suffixes,
        })
    }

    #[must_use]
    pub fn kind(&self) -> JoinKind {
        self.kind
    }

    #[must_use]
    pub fn left_keys(&self) -> &KeySpec {
        &self.left_keys
    }

    #[must_use]
    pub fn right_keys(&self) -> &KeySpec {
        &self.right_keys
    }

    #[must_use]
    pub fn suffixes(&self) -> &Suffixes {
        &self.suffixes
    }
}

// ── Key tuples ─────────────────────────────────────────────────────────

/// Hashable key of one row. Rows with any missing component have no tuple.
pub type KeyTuple<'a> = Vec<KeyAtom<'a>>;

fn key_columns<'a>(table: &'a Table, keys: &KeySpec, side: Side) -> Result<Vec<&'a Column>, JoinError> {
    keys.names()
        .iter()
        .map(|name| {
            table.column(name).ok_or_else(|| JoinError::MissingKeyColumn {
                side,
                column: name.clone(),
            })
        })
        .collect()
}

/// Per-row key tuples of `table`, `None` where any key component is missing.
pub fn key_tuples<'a>(
    table: &'a Table,
    keys: &KeySpec,
    side: Side,
) -> Result<Vec<Option<KeyTuple<'a>>>, JoinError> {
    let columns = key_columns(table, keys, side)?;
    Ok((0..table.len())
        .map(|row| {
            columns
                .iter()
                .map(|column| column.value(row).and_then(KeyAtom::from_scalar))
                .collect::<Option<Vec<_>>>()
        })
        .collect())
}

/// Distinct non-null key tuples of `table`.
pub fn key_set<'a>(
    table: &'a Table,
    keys: &KeySpec,
    side: Side,
) -> Result<HashSet<KeyTuple<'a>>, JoinError> {
    Ok(key_tuples(table, keys, side)?.into_iter().flatten().collect())
}

fn check_arity(left_keys: &KeySpec, right_keys: &KeySpec) -> Result<(), JoinError> {
    if left_keys.len() != right_keys.len() {
        return Err(JoinError::KeyArityMismatch {
            left: left_keys.len(),
            right: right_keys.len(),
        });
    }
    Ok(())
}

// ── Relational merge ───────────────────────────────────────────────────

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for JoinExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JoinExecutionTrace {
    used_arena: bool,
    output_rows: usize,
    estimated_bytes: usize,
}

/// Run the join described by `descriptor`. Anti kinds dispatch to
/// [`anti_join`].
pub fn merge(left: &Table, right: &Table, descriptor: &JoinDescriptor) -> Result<Table, JoinError> {
    merge_with_options(left, right, descriptor, JoinExecutionOptions::default())
}

pub fn merge_with_options(
    left: &Table,
    right: &Table,
    descriptor: &JoinDescriptor,
    options: JoinExecutionOptions,
) -> Result<Table, JoinError> {
    if descriptor.kind.is_anti() {
        return anti_join(
            left,
            right,
            &descriptor.left_keys,
            &descriptor.right_keys,
            descriptor.kind,
        );
    }
    let (table, _) = merge_with_trace(
        left,
        right,
        &descriptor.left_keys,
        &descriptor.right_keys,
        descriptor.kind,
        &descriptor.suffixes,
        options,
    )?;
    Ok(table)
}

/// Join `left` and `right` on equal key tuples. Anti kinds dispatch to
/// [`anti_join`]; the rest run a relational merge.
///
/// Key pairs sharing a name on both sides collapse into one column (left
/// value, else right). Other columns whose names occur on both sides get the
/// side's suffix. Rows follow the driving side: left for inner, left and
/// outer joins, right for right joins; an outer join appends unmatched right
/// rows after the left-driven rows.
pub fn join_tables(
    left: &Table,
    right: &Table,
    left_keys: &KeySpec,
    right_keys: &KeySpec,
    kind: JoinKind,
    suffixes: &Suffixes,
) -> Result<Table, JoinError> {
    if kind.is_anti() {
        return anti_join(left, right, left_keys, right_keys, kind);
    }
    let (table, _) = merge_with_trace(
        left,
        right,
        left_keys,
        right_keys,
        kind,
        suffixes,
        JoinExecutionOptions::default(),
    )?;
    Ok(table)
}

struct ResolvedKeys {
    /// Common dtype for each shared (same-name) key column.
    shared: HashMap<String, DType>,
}

fn resolve_keys(
    left: &Table,
    right: &Table,
    left_keys: &KeySpec,
    right_keys: &KeySpec,
) -> Result<ResolvedKeys, JoinError> {
    check_arity(left_keys, right_keys)?;
    let left_cols = key_columns(left, left_keys, Side::Left)?;
    let right_cols = key_columns(right, right_keys, Side::Right)?;

    let mut shared = HashMap::new();
    for (idx, (lcol, rcol)) in left_cols.iter().zip(&right_cols).enumerate() {
        let left_name = &left_keys.names()[idx];
        let right_name = &right_keys.names()[idx];
        let dtype = common_dtype(lcol.dtype(), rcol.dtype()).map_err(|_| {
            JoinError::KeyDtypeMismatch {
                left_column: left_name.clone(),
                right_column: right_name.clone(),
                left: lcol.dtype(),
                right: rcol.dtype(),
            }
        })?;
        if left_name == right_name {
            shared.insert(left_name.clone(), dtype);
        }
    }
    Ok(ResolvedKeys { shared })
}

fn merge_with_trace(
    left: &Table,
    right: &Table,
    left_keys: &KeySpec,
    right_keys: &KeySpec,
    kind: JoinKind,
    suffixes: &Suffixes,
    options: JoinExecutionOptions,
) -> Result<(Table, JoinExecutionTrace), JoinError> {
    if kind.is_anti() {
        return Err(JoinError::AntiJoinKind { kind });
    }
    suffixes.validate()?;
    let resolved = resolve_keys(left, right, left_keys, right_keys)?;
    let layout = output_layout(left, right, &resolved, suffixes)?;

    let left_tuples = key_tuples(left, left_keys, Side::Left)?;
    let right_tuples = key_tuples(right, right_keys, Side::Right)?;

    // Right joins are driven from the right; swap roles and swap back below.
    let (driver, probe) = if kind == JoinKind::Right {
        (&right_tuples, &left_tuples)
    } else {
        (&left_tuples, &right_tuples)
    };
    let mut probe_map = HashMap::<&KeyTuple<'_>, Vec<usize>>::new();
    for (pos, tuple) in probe.iter().enumerate() {
        if let Some(tuple) = tuple {
            probe_map.entry(tuple).or_default().push(pos);
        }
    }

    let keep_unmatched_driver = !matches!(kind, JoinKind::Inner);
    let append_unmatched_probe = kind == JoinKind::Outer;
    let output_rows = estimate_output_rows(
        driver,
        probe.len(),
        &probe_map,
        keep_unmatched_driver,
        append_unmatched_probe,
    );
    let estimated_bytes = estimate_intermediate_bytes(output_rows);
    let use_arena = options.use_arena && estimated_bytes <= options.arena_budget_bytes;

    let plan = PositionPlan {
        driver,
        probe_len: probe.len(),
        probe_map: &probe_map,
        keep_unmatched_driver,
        append_unmatched_probe,
    };
    let swap = kind == JoinKind::Right;
    let table = if use_arena {
        let arena = Bump::new();
        let mut driver_positions = BumpVec::<Option<usize>>::with_capacity_in(output_rows, &arena);
        let mut probe_positions = BumpVec::<Option<usize>>::with_capacity_in(output_rows, &arena);
        plan.fill(&mut driver_positions, &mut probe_positions);
        let (lpos, rpos) = if swap {
            (probe_positions.as_slice(), driver_positions.as_slice())
        } else {
            (driver_positions.as_slice(), probe_positions.as_slice())
        };
        assemble(left, right, &layout, lpos, rpos, kind)?
    } else {
        let mut driver_positions = Vec::<Option<usize>>::with_capacity(output_rows);
        let mut probe_positions = Vec::<Option<usize>>::with_capacity(output_rows);
        plan.fill(&mut driver_positions, &mut probe_positions);
        let (lpos, rpos) = if swap {
            (probe_positions.as_slice(), driver_positions.as_slice())
        } else {
            (driver_positions.as_slice(), probe_positions.as_slice())
        };
        assemble(left, right, &layout, lpos, rpos, kind)?
    };

    info!(
        kind = %kind,
        left_rows = left.len(),
        right_rows = right.len(),
        output_rows,
        used_arena = use_arena,
        "merged tables"
    );

    Ok((
        table,
        JoinExecutionTrace {
            used_arena: use_arena,
            output_rows,
            estimated_bytes,
        },
    ))
}

fn estimate_output_rows(
    driver: &[Option<KeyTuple<'_>>],
    probe_len: usize,
    probe_map: &HashMap<&KeyTuple<'_>, Vec<usize>>,
    keep_unmatched_driver: bool,
    append_unmatched_probe: bool,
) -> usize {
    let driven: usize = driver
        .iter()
        .map(|tuple| match tuple.as_ref().and_then(|t| probe_map.get(t)) {
            Some(matches) => matches.len(),
            None if keep_unmatched_driver => 1,
            None => 0,
        })
        .sum();
    if !append_unmatched_probe {
        return driven;
    }
    let driver_keys: HashSet<&KeyTuple<'_>> = driver.iter().flatten().collect();
    let matched_probe: usize = probe_map
        .iter()
        .filter(|(tuple, _)| driver_keys.contains(*tuple))
        .map(|(_, positions)| positions.len())
        .sum();
    driven + (probe_len - matched_probe)
}

fn estimate_intermediate_bytes(output_rows: usize) -> usize {
    output_rows.saturating_mul(size_of::<Option<usize>>().saturating_mul(2))
}

/// Destination for row-position pairs; lets the arena and global allocator
/// paths share one fill loop.
trait PositionSink {
    fn push_position(&mut self, position: Option<usize>);
}

impl PositionSink for Vec<Option<usize>> {
    fn push_position(&mut self, position: Option<usize>) {
        self.push(position);
    }
}

impl PositionSink for BumpVec<'_, Option<usize>> {
    fn push_position(&mut self, position: Option<usize>) {
        self.push(position);
    }
}

struct PositionPlan<'p, 'a> {
    driver: &'p [Option<KeyTuple<'a>>],
    probe_len: usize,
    probe_map: &'p HashMap<&'p KeyTuple<'a>, Vec<usize>>,
    keep_unmatched_driver: bool,
    append_unmatched_probe: bool,
}

impl PositionPlan<'_, '_> {
    fn fill<S: PositionSink>(&self, driver_out: &mut S, probe_out: &mut S) {
        let mut probe_matched = vec![false; self.probe_len];
        for (driver_pos, tuple) in self.driver.iter().enumerate() {
            if let Some(matches) = tuple.as_ref().and_then(|t| self.probe_map.get(t)) {
                for &probe_pos in matches {
                    driver_out.push_position(Some(driver_pos));
                    probe_out.push_position(Some(probe_pos));
                    probe_matched[probe_pos] = true;
                }
                continue;
            }
            if self.keep_unmatched_driver {
                driver_out.push_position(Some(driver_pos));
                probe_out.push_position(None);
            }
        }

        if self.append_unmatched_probe {
            for (probe_pos, matched) in probe_matched.into_iter().enumerate() {
                if !matched {
                    driver_out.push_position(None);
                    probe_out.push_position(Some(probe_pos));
                }
            }
        }
    }
}

enum OutputSource {
    Left(String),
    Right(String),
    /// Shared key: left value, else right value, in the common dtype.
    Coalesced(String, DType),
}

fn output_layout(
    left: &Table,
    right: &Table,
    resolved: &ResolvedKeys,
    suffixes: &Suffixes,
) -> Result<Vec<(String, OutputSource)>, JoinError> {
    let mut layout = Vec::with_capacity(left.width() + right.width());
    for name in left.column_names() {
        if let Some(dtype) = resolved.shared.get(name) {
            layout.push((name.clone(), OutputSource::Coalesced(name.clone(), *dtype)));
        } else if right.has_column(name) {
            layout.push((
                format!("{name}{}", suffixes.left),
                OutputSource::Left(name.clone()),
            ));
        } else {
            layout.push((name.clone(), OutputSource::Left(name.clone())));
        }
    }
    for name in right.column_names() {
        if resolved.shared.contains_key(name) {
            continue;
        }
        let out_name = if left.has_column(name) {
            format!("{name}{}", suffixes.right)
        } else {
            name.clone()
        };
        layout.push((out_name, OutputSource::Right(name.clone())));
    }

    let mut seen = BTreeSet::new();
    for (name, _) in &layout {
        if !seen.insert(name.as_str()) {
            return Err(JoinError::DuplicateOutputColumn(name.clone()));
        }
    }
    Ok(layout)
}

fn assemble(
    left: &Table,
    right: &Table,
    layout: &[(String, OutputSource)],
    left_positions: &[Option<usize>],
    right_positions: &[Option<usize>],
    kind: JoinKind,
) -> Result<Table, JoinError> {
    let mut columns = Vec::with_capacity(layout.len());
    for (out_name, source) in layout {
        let column = match source {
            OutputSource::Left(name) => left
                .require_column(name)?
                .reindex_by_positions(left_positions)?,
            OutputSource::Right(name) => right
                .require_column(name)?
                .reindex_by_positions(right_positions)?,
            OutputSource::Coalesced(name, dtype) => {
                let from_left = left
                    .require_column(name)?
                    .reindex_by_positions(left_positions)?;
                if matches!(kind, JoinKind::Inner | JoinKind::Left) {
                    from_left
                } else {
                    let from_right = right
                        .require_column(name)?
                        .reindex_by_positions(right_positions)?;
                    from_left.coalesce(&from_right, *dtype)?
                }
            }
        };
        columns.push((out_name.clone(), column));
    }
    Ok(Table::new(columns)?)
}

// ── Anti-join ──────────────────────────────────────────────────────────

/// Rows of the query side whose key tuple does not occur on the other side.
///
/// `AntiANotInB` queries `left` against `right`, `AntiBNotInA` the reverse;
/// relational kinds are rejected.
/// Rows with a missing key component are always kept. Only query-side
/// columns appear in the output.
pub fn anti_join(
    left: &Table,
    right: &Table,
    left_keys: &KeySpec,
    right_keys: &KeySpec,
    direction: JoinKind,
) -> Result<Table, JoinError> {
    let (query, query_keys, query_side, exclusion, exclusion_keys, exclusion_side) =
        match direction {
            JoinKind::AntiANotInB => (left, left_keys, Side::Left, right, right_keys, Side::Right),
            JoinKind::AntiBNotInA => (right, right_keys, Side::Right, left, left_keys, Side::Left),
            JoinKind::Inner | JoinKind::Left | JoinKind::Right | JoinKind::Outer => {
                return Err(JoinError::NotAntiJoin { kind: direction });
            }
        };
    check_arity(left_keys, right_keys)?;

    let excluded = key_set(exclusion, exclusion_keys, exclusion_side)?;
    let positions: Vec<usize> = key_tuples(query, query_keys, query_side)?
        .iter()
        .enumerate()
        .filter(|(_, tuple)| tuple.as_ref().is_none_or(|t| !excluded.contains(t)))
        .map(|(pos, _)| pos)
        .collect();

    info!(
        direction = %direction,
        query_rows = query.len(),
        kept_rows = positions.len(),
        "anti-joined tables"
    );
    Ok(query.take_rows(&positions)?)
}

// ── Column filter ──────────────────────────────────────────────────────

/// Map a pre-merge column name to its name in `available`: the name itself
/// when present, else the name with `suffix` appended, else nothing.
#[must_use]
pub fn resolve_column_name(requested: &str, available: &Table, suffix: &str) -> Option<String> {
    if available.has_column(requested) {
        return Some(requested.to_owned());
    }
    let suffixed = format!("{requested}{suffix}");
    available.has_column(&suffixed).then_some(suffixed)
}

/// Columns to keep from each input table, by pre-merge name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSelection {
    pub from_a: Vec<String>,
    pub from_b: Vec<String>,
}

impl ColumnSelection {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.from_a.is_empty() && self.from_b.is_empty()
    }
}

/// Project a merge result onto the selected columns.
///
/// Each requested name resolves through [`resolve_column_name`] with its
/// side's suffix; names that resolve to nothing are skipped and repeats are
/// kept once. Key columns appear only when requested. When nothing resolves,
/// the merged table is returned unchanged.
pub fn filter_columns(
    merged: &Table,
    selection: &ColumnSelection,
    suffixes: &Suffixes,
) -> Result<Table, JoinError> {
    let mut seen = BTreeSet::new();
    let mut resolved = Vec::new();
    let requests = selection
        .from_a
        .iter()
        .map(|name| (name, Side::Left))
        .chain(selection.from_b.iter().map(|name| (name, Side::Right)));
    for (requested, side) in requests {
        if let Some(name) = resolve_column_name(requested, merged, suffixes.for_side(side))
            && seen.insert(name.clone())
        {
            resolved.push(name);
        }
    }

    if resolved.is_empty() {
        debug!(
            requested = selection.from_a.len() + selection.from_b.len(),
            "column selection resolved to nothing, keeping every column"
        );
        return Ok(merged.clone());
    }
    Ok(merged.select(&resolved)?)
}

// ── Summary statistics ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub rows_a: usize,
    pub rows_b: usize,
    pub rows_result: usize,
    pub unique_keys_a: usize,
    pub unique_keys_b: usize,
    pub keys_matched: usize,
    /// Anti-joins only: query-side rows dropped because their key occurs on
    /// the other side.
    pub excluded_rows: usize,
}

pub fn build_summary_stats(
    left: &Table,
    right: &Table,
    left_keys: &KeySpec,
    right_keys: &KeySpec,
    kind: JoinKind,
    result: &Table,
) -> Result<SummaryStats, JoinError> {
    check_arity(left_keys, right_keys)?;
    let left_tuples = key_tuples(left, left_keys, Side::Left)?;
    let right_tuples = key_tuples(right, right_keys, Side::Right)?;
    let left_set: HashSet<&KeyTuple<'_>> = left_tuples.iter().flatten().collect();
    let right_set: HashSet<&KeyTuple<'_>> = right_tuples.iter().flatten().collect();
    let keys_matched = left_set.intersection(&right_set).count();

    let excluded_rows = match kind {
        JoinKind::AntiANotInB => left_tuples
            .iter()
            .flatten()
            .filter(|tuple| right_set.contains(tuple))
            .count(),
        JoinKind::AntiBNotInA => right_tuples
            .iter()
            .flatten()
            .filter(|tuple| left_set.contains(tuple))
            .count(),
        _ => 0,
    };

    Ok(SummaryStats {
        rows_a: left.len(),
        rows_b: right.len(),
        rows_result: result.len(),
        unique_keys_a: left_set.len(),
        unique_keys_b: right_set.len(),
        keys_matched,
        excluded_rows,
    })
}

#[cfg(test)]
mod tests {
    use mk_table::Table;
    use mk_types::{DType, Scalar};

    use super::{
        ColumnSelection, JoinDescriptor, JoinError, JoinExecutionOptions, JoinKind, KeySpec,
        Side, Suffixes, anti_join, build_summary_stats, filter_columns, join_tables, merge,
        merge_with_options, merge_with_trace, resolve_column_name,
    };

    fn ints(values: &[i64]) -> Vec<Scalar> {
        values.iter().map(|v| Scalar::Int64(*v)).collect()
    }

    fn text(values: &[&str]) -> Vec<Scalar> {
        values.iter().map(|v| Scalar::from(*v)).collect()
    }

    fn key(side: Side, name: &str) -> KeySpec {
        KeySpec::single(side, name).expect("key")
    }

    fn table_a() -> Table {
        Table::from_values([("key", ints(&[1, 2, 3])), ("v", text(&["a", "b", "c"]))])
            .expect("a")
    }

    fn table_b() -> Table {
        Table::from_values([("key", ints(&[2, 3, 4])), ("w", text(&["x", "y", "z"]))])
            .expect("b")
    }

    fn run(left: &Table, right: &Table, kind: JoinKind) -> Table {
        join_tables(
            left,
            right,
            &key(Side::Left, "key"),
            &key(Side::Right, "key"),
            kind,
            &Suffixes::default(),
        )
        .expect("join")
    }

    #[test]
    fn inner_join_on_shared_key_keeps_one_key_column() {
        let out = run(&table_a(), &table_b(), JoinKind::Inner);
        assert_eq!(out.column_names(), &["key", "v", "w"]);
        assert_eq!(out.column("key").expect("key").values(), &ints(&[2, 3]));
        assert_eq!(out.column("v").expect("v").values(), &text(&["b", "c"]));
        assert_eq!(out.column("w").expect("w").values(), &text(&["x", "y"]));
    }

    #[test]
    fn left_join_fills_missing_right_values() {
        let out = run(&table_a(), &table_b(), JoinKind::Left);
        assert_eq!(out.len(), 3);
        let w = out.column("w").expect("w");
        assert!(w.values()[0].is_missing());
        assert_eq!(w.values()[1], Scalar::from("x"));
    }

    #[test]
    fn right_join_is_driven_by_right_rows() {
        let out = run(&table_a(), &table_b(), JoinKind::Right);
        assert_eq!(out.column("key").expect("key").values(), &ints(&[2, 3, 4]));
        let v = out.column("v").expect("v");
        assert_eq!(v.values()[0], Scalar::from("b"));
        assert!(v.values()[2].is_missing());
    }

    #[test]
    fn outer_join_appends_unmatched_right_rows() {
        let out = run(&table_a(), &table_b(), JoinKind::Outer);
        assert_eq!(
            out.column("key").expect("key").values(),
            &ints(&[1, 2, 3, 4])
        );
        assert!(out.column("w").expect("w").values()[0].is_missing());
        assert!(out.column("v").expect("v").values()[3].is_missing());
    }

    #[test]
    fn duplicate_keys_multiply_cardinality() {
        let left = Table::from_values([("k", ints(&[1, 1, 2])), ("l", ints(&[10, 11, 12]))])
            .expect("left");
        let right = Table::from_values([("k", ints(&[1, 1, 1])), ("r", ints(&[7, 8, 9]))])
            .expect("right");
        let out = join_tables(
            &left,
            &right,
            &key(Side::Left, "k"),
            &key(Side::Right, "k"),
            JoinKind::Inner,
            &Suffixes::default(),
        )
        .expect("join");
        assert_eq!(out.len(), 6);
        assert_eq!(
            out.column("l").expect("l").values(),
            &ints(&[10, 10, 10, 11, 11, 11])
        );
    }

    #[test]
    fn colliding_columns_get_suffixes() {
        let left = Table::from_values([("id", ints(&[1])), ("name", text(&["a"]))]).expect("l");
        let right = Table::from_values([("ref", ints(&[1])), ("name", text(&["b"]))]).expect("r");
        let out = join_tables(
            &left,
            &right,
            &key(Side::Left, "id"),
            &key(Side::Right, "ref"),
            JoinKind::Inner,
            &Suffixes::default(),
        )
        .expect("join");
        assert_eq!(out.column_names(), &["id", "name_A", "ref", "name_B"]);
    }

    #[test]
    fn differently_named_keys_both_survive() {
        let left = Table::from_values([("id", ints(&[1, 2]))]).expect("l");
        let right = Table::from_values([("customer", ints(&[2, 3]))]).expect("r");
        let out = join_tables(
            &left,
            &right,
            &key(Side::Left, "id"),
            &key(Side::Right, "customer"),
            JoinKind::Outer,
            &Suffixes::default(),
        )
        .expect("join");
        assert_eq!(out.column_names(), &["id", "customer"]);
        assert_eq!(out.len(), 3);
        assert!(out.column("id").expect("id").values()[2].is_missing());
    }

    #[test]
    fn composite_keys_match_as_tuples() {
        let left = Table::from_values([
            ("a", ints(&[1, 1, 2])),
            ("b", text(&["x", "y", "x"])),
            ("v", ints(&[10, 20, 30])),
        ])
        .expect("left");
        let right = Table::from_values([
            ("a", ints(&[1, 2])),
            ("b", text(&["y", "y"])),
            ("w", ints(&[100, 200])),
        ])
        .expect("right");
        let keys_l = KeySpec::new(Side::Left, ["a", "b"]).expect("keys");
        let keys_r = KeySpec::new(Side::Right, ["a", "b"]).expect("keys");
        let out = join_tables(&left, &right, &keys_l, &keys_r, JoinKind::Inner, &Suffixes::default())
            .expect("join");
        assert_eq!(out.len(), 1);
        assert_eq!(out.column("v").expect("v").values(), &ints(&[20]));
        assert_eq!(out.column("w").expect("w").values(), &ints(&[100]));
    }

    #[test]
    fn null_keys_never_match() {
        let left = Table::from_values([
            ("k", vec![Scalar::Int64(1), Scalar::null()]),
            ("l", ints(&[1, 2])),
        ])
        .expect("left");
        let right = Table::from_values([
            ("k", vec![Scalar::null(), Scalar::Int64(1)]),
            ("r", ints(&[3, 4])),
        ])
        .expect("right");
        let out = join_tables(
            &left,
            &right,
            &key(Side::Left, "k"),
            &key(Side::Right, "k"),
            JoinKind::Inner,
            &Suffixes::default(),
        )
        .expect("join");
        assert_eq!(out.len(), 1);
        assert_eq!(out.column("r").expect("r").values(), &ints(&[4]));
    }

    #[test]
    fn integer_and_float_keys_compare_by_value() {
        let left = Table::from_values([("k", ints(&[1, 2]))]).expect("left");
        let right = Table::from_values([
            ("k", vec![Scalar::Float64(2.0), Scalar::Float64(2.5)]),
            ("r", text(&["two", "two and a half"])),
        ])
        .expect("right");
        let out = join_tables(
            &left,
            &right,
            &key(Side::Left, "k"),
            &key(Side::Right, "k"),
            JoinKind::Inner,
            &Suffixes::default(),
        )
        .expect("join");
        assert_eq!(out.len(), 1);
        assert_eq!(out.column("k").expect("k").dtype(), DType::Int64);
    }

    #[test]
    fn text_and_integer_keys_are_rejected() {
        let left = Table::from_values([("k", ints(&[1]))]).expect("left");
        let right = Table::from_values([("k", text(&["1"]))]).expect("right");
        let err = join_tables(
            &left,
            &right,
            &key(Side::Left, "k"),
            &key(Side::Right, "k"),
            JoinKind::Inner,
            &Suffixes::default(),
        )
        .expect_err("mismatch");
        assert!(matches!(err, JoinError::KeyDtypeMismatch { .. }));
    }

    #[test]
    fn missing_key_column_is_reported_with_side() {
        let err = join_tables(
            &table_a(),
            &table_b(),
            &key(Side::Left, "key"),
            &key(Side::Right, "nope"),
            JoinKind::Inner,
            &Suffixes::default(),
        )
        .expect_err("missing");
        assert!(matches!(
            err,
            JoinError::MissingKeyColumn { side: Side::Right, ref column } if column == "nope"
        ));
    }

    #[test]
    fn argument_errors_come_before_any_rows() {
        assert!(matches!(
            KeySpec::new(Side::Left, Vec::<String>::new()),
            Err(JoinError::EmptyKey { side: Side::Left })
        ));
        assert!(matches!(
            KeySpec::single(Side::Right, "  "),
            Err(JoinError::EmptyKey { side: Side::Right })
        ));
        let err = JoinDescriptor::new(
            JoinKind::Inner,
            KeySpec::new(Side::Left, ["a", "b"]).expect("keys"),
            key(Side::Right, "a"),
            Suffixes::default(),
        )
        .expect_err("arity");
        assert!(matches!(err, JoinError::KeyArityMismatch { left: 2, right: 1 }));
        assert!(matches!(
            Suffixes::new("_x", "_x"),
            Err(JoinError::IdenticalSuffixes(_))
        ));
    }

    #[test]
    fn suffix_that_recreates_an_existing_name_is_rejected() {
        let left = Table::from_values([
            ("k", ints(&[1])),
            ("v", ints(&[1])),
            ("v_A", ints(&[2])),
        ])
        .expect("left");
        let right = Table::from_values([("k", ints(&[1])), ("v", ints(&[3]))]).expect("right");
        let err = join_tables(
            &left,
            &right,
            &key(Side::Left, "k"),
            &key(Side::Right, "k"),
            JoinKind::Inner,
            &Suffixes::default(),
        )
        .expect_err("duplicate");
        assert!(matches!(err, JoinError::DuplicateOutputColumn(name) if name == "v_A"));
    }

    #[test]
    fn anti_join_a_not_in_b() {
        let out = anti_join(
            &table_a(),
            &table_b(),
            &key(Side::Left, "key"),
            &key(Side::Right, "key"),
            JoinKind::AntiANotInB,
        )
        .expect("anti");
        assert_eq!(out.column_names(), &["key", "v"]);
        assert_eq!(out.column("key").expect("key").values(), &ints(&[1]));
    }

    #[test]
    fn anti_join_b_not_in_a_returns_right_rows() {
        let out = anti_join(
            &table_a(),
            &table_b(),
            &key(Side::Left, "key"),
            &key(Side::Right, "key"),
            JoinKind::AntiBNotInA,
        )
        .expect("anti");
        assert_eq!(out.column_names(), &["key", "w"]);
        assert_eq!(out.column("w").expect("w").values(), &text(&["z"]));
    }

    #[test]
    fn join_tables_dispatches_anti_kinds() {
        let a_not_in_b = join_tables(
            &table_a(),
            &table_b(),
            &key(Side::Left, "key"),
            &key(Side::Right, "key"),
            JoinKind::AntiANotInB,
            &Suffixes::default(),
        )
        .expect("anti a");
        assert_eq!(a_not_in_b.column_names(), &["key", "v"]);
        assert_eq!(a_not_in_b.column("key").expect("key").values(), &ints(&[1]));

        let b_not_in_a = join_tables(
            &table_a(),
            &table_b(),
            &key(Side::Left, "key"),
            &key(Side::Right, "key"),
            JoinKind::AntiBNotInA,
            &Suffixes::default(),
        )
        .expect("anti b");
        assert_eq!(b_not_in_a.column_names(), &["key", "w"]);
        assert_eq!(b_not_in_a.column("key").expect("key").values(), &ints(&[4]));
    }

    #[test]
    fn anti_join_rejects_relational_kinds() {
        for kind in [JoinKind::Inner, JoinKind::Left, JoinKind::Right, JoinKind::Outer] {
            let err = anti_join(
                &table_a(),
                &table_b(),
                &key(Side::Left, "key"),
                &key(Side::Right, "key"),
                kind,
            )
            .expect_err("relational kind");
            assert!(matches!(err, JoinError::NotAntiJoin { kind: k } if k == kind));
        }
    }

    #[test]
    fn anti_join_keeps_rows_with_null_keys() {
        let left = Table::from_values([("k", vec![Scalar::null(), Scalar::Int64(2)])]).expect("l");
        let right = Table::from_values([("k", vec![Scalar::null(), Scalar::Int64(2)])]).expect("r");
        let out = anti_join(
            &left,
            &right,
            &key(Side::Left, "k"),
            &key(Side::Right, "k"),
            JoinKind::AntiANotInB,
        )
        .expect("anti");
        assert_eq!(out.len(), 1);
        assert!(out.column("k").expect("k").values()[0].is_missing());
    }

    #[test]
    fn merge_dispatches_on_descriptor_kind() {
        let descriptor = JoinDescriptor::new(
            JoinKind::AntiANotInB,
            key(Side::Left, "key"),
            key(Side::Right, "key"),
            Suffixes::default(),
        )
        .expect("descriptor");
        let out = merge(&table_a(), &table_b(), &descriptor).expect("merge");
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn arena_join_matches_global_allocator_behavior() {
        let descriptor = JoinDescriptor::new(
            JoinKind::Outer,
            key(Side::Left, "key"),
            key(Side::Right, "key"),
            Suffixes::default(),
        )
        .expect("descriptor");
        let global = merge_with_options(
            &table_a(),
            &table_b(),
            &descriptor,
            JoinExecutionOptions {
                use_arena: false,
                arena_budget_bytes: 0,
            },
        )
        .expect("global");
        let arena = merge_with_options(
            &table_a(),
            &table_b(),
            &descriptor,
            JoinExecutionOptions::default(),
        )
        .expect("arena");
        assert_eq!(arena, global);
    }

    #[test]
    fn arena_join_falls_back_when_budget_is_too_small() {
        let options = JoinExecutionOptions {
            use_arena: true,
            arena_budget_bytes: 1,
        };
        let (table, trace) = merge_with_trace(
            &table_a(),
            &table_b(),
            &key(Side::Left, "key"),
            &key(Side::Right, "key"),
            JoinKind::Outer,
            &Suffixes::default(),
            options,
        )
        .expect("join");
        assert!(!trace.used_arena);
        assert_eq!(trace.output_rows, 4);
        assert_eq!(table.len(), trace.output_rows);
        assert!(trace.estimated_bytes > options.arena_budget_bytes);
    }

    #[test]
    fn resolve_column_name_prefers_exact_then_suffix() {
        let merged = Table::from_values([
            ("key", ints(&[1])),
            ("v_A", ints(&[1])),
            ("v_B", ints(&[2])),
        ])
        .expect("merged");
        assert_eq!(resolve_column_name("key", &merged, "_A").as_deref(), Some("key"));
        assert_eq!(resolve_column_name("v", &merged, "_B").as_deref(), Some("v_B"));
        assert_eq!(resolve_column_name("zzz", &merged, "_A"), None);
    }

    #[test]
    fn filter_columns_resolves_and_drops_unknown() {
        let left = Table::from_values([("key", ints(&[1])), ("v", text(&["a"]))]).expect("l");
        let right = Table::from_values([("key", ints(&[1])), ("v", text(&["b"]))]).expect("r");
        let merged = run(&left, &right, JoinKind::Inner);
        let selection = ColumnSelection {
            from_a: vec!["v".into(), "ghost".into()],
            from_b: vec!["v".into()],
        };
        let out = filter_columns(
            &merged,
            &selection,
            &Suffixes::default(),
        )
        .expect("filter");
        assert_eq!(out.column_names(), &["v_A", "v_B"]);
    }

    #[test]
    fn filter_columns_empty_selection_is_identity() {
        let merged = run(&table_a(), &table_b(), JoinKind::Inner);
        let out = filter_columns(
            &merged,
            &ColumnSelection::default(),
            &Suffixes::default(),
        )
        .expect("filter");
        assert_eq!(out, merged);

        let unresolvable = ColumnSelection {
            from_a: vec!["nothing".into()],
            from_b: Vec::new(),
        };
        let out = filter_columns(
            &merged,
            &unresolvable,
            &Suffixes::default(),
        )
        .expect("filter");
        assert_eq!(out, merged);
    }

    #[test]
    fn filter_columns_dedupes_shared_key_requests() {
        let merged = run(&table_a(), &table_b(), JoinKind::Inner);
        let selection = ColumnSelection {
            from_a: vec!["key".into(), "v".into()],
            from_b: vec!["key".into(), "w".into()],
        };
        let out = filter_columns(
            &merged,
            &selection,
            &Suffixes::default(),
        )
        .expect("filter");
        assert_eq!(out.column_names(), &["key", "v", "w"]);
    }

    #[test]
    fn summary_stats_for_inner_join() {
        let a = table_a();
        let b = table_b();
        let result = run(&a, &b, JoinKind::Inner);
        let stats = build_summary_stats(
            &a,
            &b,
            &key(Side::Left, "key"),
            &key(Side::Right, "key"),
            JoinKind::Inner,
            &result,
        )
        .expect("stats");
        assert_eq!(stats.rows_a, 3);
        assert_eq!(stats.rows_b, 3);
        assert_eq!(stats.rows_result, 2);
        assert_eq!(stats.unique_keys_a, 3);
        assert_eq!(stats.keys_matched, 2);
        assert_eq!(stats.excluded_rows, 0);
    }

    #[test]
    fn summary_stats_count_excluded_rows_for_anti_joins() {
        let a = Table::from_values([("key", ints(&[1, 2, 2, 3]))]).expect("a");
        let b = Table::from_values([("key", ints(&[2, 5]))]).expect("b");
        let keys_a = key(Side::Left, "key");
        let keys_b = key(Side::Right, "key");
        let result = anti_join(&a, &b, &keys_a, &keys_b, JoinKind::AntiANotInB).expect("anti");
        let stats =
            build_summary_stats(&a, &b, &keys_a, &keys_b, JoinKind::AntiANotInB, &result)
                .expect("stats");
        assert_eq!(stats.rows_result, 2);
        assert_eq!(stats.excluded_rows, 2);
        assert_eq!(stats.rows_result + stats.excluded_rows, stats.rows_a);

        let result = anti_join(&a, &b, &keys_a, &keys_b, JoinKind::AntiBNotInA).expect("anti");
        let stats =
            build_summary_stats(&a, &b, &keys_a, &keys_b, JoinKind::AntiBNotInA, &result)
                .expect("stats");
        assert_eq!(stats.rows_result, 1);
        assert_eq!(stats.excluded_rows, 1);
    }

    #[test]
    fn summary_stats_on_empty_tables_are_zero() {
        let a = Table::from_values([("key", Vec::new())]).expect("a");
        let b = Table::from_values([("key", Vec::new())]).expect("b");
        let stats = build_summary_stats(
            &a,
            &b,
            &key(Side::Left, "key"),
            &key(Side::Right, "key"),
            JoinKind::Outer,
            &a,
        )
        .expect("stats");
        assert_eq!(stats, super::SummaryStats::default());
    }

    #[test]
    fn join_kind_accepts_legacy_labels() {
        let kind: JoinKind = serde_json::from_str("\"anti A vs B\"").expect("legacy");
        assert_eq!(kind, JoinKind::AntiANotInB);
        let kind: JoinKind = serde_json::from_str("\"anti_B_vs_A\"").expect("legacy");
        assert_eq!(kind, JoinKind::AntiBNotInA);
        assert_eq!(
            serde_json::to_string(&JoinKind::Outer).expect("json"),
            "\"outer\""
        );
        let suffixes: Suffixes = serde_json::from_str("[\"_l\", \"_r\"]").expect("suffixes");
        assert_eq!(suffixes.left, "_l");
    }
}
