#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Null,
    Bool,
    Int64,
    Float64,
    Utf8,
}

impl DType {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Utf8 => "text",
        }
    }

    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int64 | Self::Float64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullKind {
    Null,
    NaN,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null(NullKind),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl Scalar {
    #[must_use]
    pub fn null() -> Self {
        Self::Null(NullKind::Null)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Null(_) => DType::Null,
            Self::Bool(_) => DType::Bool,
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Utf8(_) => DType::Utf8,
        }
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null(_) => true,
            Self::Float64(v) => v.is_nan(),
            _ => false,
        }
    }

    #[must_use]
    pub fn missing_for_dtype(dtype: DType) -> Self {
        match dtype {
            DType::Float64 => Self::Null(NullKind::NaN),
            DType::Null | DType::Bool | DType::Int64 | DType::Utf8 => Self::Null(NullKind::Null),
        }
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (a, b) if a.is_missing() && b.is_missing() => true,
            (Self::Float64(a), Self::Float64(b)) => a == b,
            _ => self == other,
        }
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Int64(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            Self::Null(kind) => Err(TypeError::ValueIsMissing { kind: *kind }),
            Self::Utf8(v) => Err(TypeError::NonNumericValue {
                value: v.clone(),
                dtype: DType::Utf8,
            }),
        }
    }

    /// Numeric coercion that also accepts numeric-looking text, the way a
    /// spreadsheet user expects `" 42 "` to read as a number.
    pub fn coerce_numeric(&self) -> Result<f64, TypeError> {
        match self {
            Self::Utf8(text) => text
                .trim()
                .parse::<f64>()
                .map_err(|_| TypeError::NonNumericValue {
                    value: text.clone(),
                    dtype: DType::Utf8,
                }),
            other => other.to_f64(),
        }
    }

    /// Text rendering used for exports and text casts. Missing values have
    /// no rendering.
    #[must_use]
    pub fn render(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Null(_) => None,
            Self::Float64(v) if v.is_nan() => None,
            Self::Bool(v) => Some(Cow::Owned(if *v { "True" } else { "False" }.to_owned())),
            Self::Int64(v) => Some(Cow::Owned(v.to_string())),
            Self::Float64(v) => Some(Cow::Owned(render_float(*v))),
            Self::Utf8(v) => Some(Cow::Borrowed(v.as_str())),
        }
    }

    /// Approximate heap + inline footprint of this cell in bytes.
    #[must_use]
    pub fn deep_size(&self) -> usize {
        let inline = std::mem::size_of::<Self>();
        match self {
            Self::Utf8(v) => inline + v.capacity(),
            _ => inline,
        }
    }
}

/// Integral floats keep a trailing `.0` so a float column never reads back
/// as integers.
fn render_float(value: f64) -> String {
    if value.is_finite() && value == value.trunc() && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("dtype coercion from {left:?} to {right:?} has no compatible common type")]
    IncompatibleDtypes { left: DType, right: DType },
    #[error("cannot cast scalar of dtype {from:?} to {to:?}")]
    InvalidCast { from: DType, to: DType },
    #[error("cannot cast float {value} to int64 without loss")]
    LossyFloatToInt { value: f64 },
    #[error("value {value:?} has non-numeric dtype {dtype:?}")]
    NonNumericValue { value: String, dtype: DType },
    #[error("value is missing ({kind:?})")]
    ValueIsMissing { kind: NullKind },
}

pub fn common_dtype(left: DType, right: DType) -> Result<DType, TypeError> {
    use DType::{Bool, Float64, Int64, Null};

    let out = match (left, right) {
        (a, b) if a == b => a,
        (Null, other) | (other, Null) => other,
        (Bool, Int64) | (Int64, Bool) => Int64,
        (Bool, Float64) | (Float64, Bool) => Float64,
        (Int64, Float64) | (Float64, Int64) => Float64,
        _ => return Err(TypeError::IncompatibleDtypes { left, right }),
    };

    Ok(out)
}

pub fn infer_dtype(values: &[Scalar]) -> Result<DType, TypeError> {
    let mut current = DType::Null;
    for value in values {
        current = common_dtype(current, value.dtype())?;
    }
    Ok(current)
}

/// Cast a scalar to a target dtype, taking ownership so values that already
/// have the target dtype pass through without a clone.
pub fn cast_scalar_owned(value: Scalar, target: DType) -> Result<Scalar, TypeError> {
    let from = value.dtype();
    if matches!(value, Scalar::Null(_)) {
        return Ok(Scalar::missing_for_dtype(target));
    }
    if from == target {
        return Ok(value);
    }

    match target {
        DType::Null => Ok(Scalar::null()),
        DType::Int64 => match &value {
            Scalar::Bool(v) => Ok(Scalar::Int64(i64::from(*v))),
            Scalar::Float64(v) => {
                if !v.is_finite() || *v != v.trunc() {
                    return Err(TypeError::LossyFloatToInt { value: *v });
                }
                if *v < i64::MIN as f64 || *v > i64::MAX as f64 {
                    return Err(TypeError::LossyFloatToInt { value: *v });
                }
                Ok(Scalar::Int64(*v as i64))
            }
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Float64 => match &value {
            Scalar::Bool(v) => Ok(Scalar::Float64(if *v { 1.0 } else { 0.0 })),
            Scalar::Int64(v) => Ok(Scalar::Float64(*v as f64)),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Utf8 => match value.render() {
            Some(text) => Ok(Scalar::Utf8(text.into_owned())),
            None => Ok(Scalar::null()),
        },
        DType::Bool => Err(TypeError::InvalidCast { from, to: target }),
    }
}

// ── Key atoms ──────────────────────────────────────────────────────────

/// Borrowed hashable form of a non-missing cell, used to compare join keys.
///
/// Integral floats and booleans fold into the integer domain so that `2`,
/// `2.0` and a float column holding `2` compare equal across tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyAtom<'a> {
    Int(i64),
    FloatBits(u64),
    Text(&'a str),
}

impl<'a> KeyAtom<'a> {
    /// Returns `None` for missing values; nulls never participate in key
    /// matching.
    #[must_use]
    pub fn from_scalar(value: &'a Scalar) -> Option<Self> {
        match value {
            Scalar::Null(_) => None,
            Scalar::Bool(v) => Some(Self::Int(i64::from(*v))),
            Scalar::Int64(v) => Some(Self::Int(*v)),
            Scalar::Float64(v) if v.is_nan() => None,
            Scalar::Float64(v) => {
                if v.is_finite()
                    && *v == v.trunc()
                    && *v >= i64::MIN as f64
                    && *v <= i64::MAX as f64
                {
                    Some(Self::Int(*v as i64))
                } else {
                    Some(Self::FloatBits(v.to_bits()))
                }
            }
            Scalar::Utf8(v) => Some(Self::Text(v.as_str())),
        }
    }
}

// ── Nanops: null-skipping numeric reductions ───────────────────────────

fn collect_finite(values: &[Scalar]) -> Vec<f64> {
    values
        .iter()
        .filter(|v| !v.is_missing())
        .filter_map(|v| v.to_f64().ok())
        .collect()
}

pub fn nancount(values: &[Scalar]) -> usize {
    values.iter().filter(|v| !v.is_missing()).count()
}

pub fn nanmean(values: &[Scalar]) -> Option<f64> {
    let nums = collect_finite(values);
    if nums.is_empty() {
        return None;
    }
    Some(nums.iter().sum::<f64>() / nums.len() as f64)
}

pub fn nanmin(values: &[Scalar]) -> Option<f64> {
    let nums = collect_finite(values);
    if nums.is_empty() {
        return None;
    }
    Some(nums.iter().copied().fold(f64::INFINITY, f64::min))
}

pub fn nanmax(values: &[Scalar]) -> Option<f64> {
    let nums = collect_finite(values);
    if nums.is_empty() {
        return None;
    }
    Some(nums.iter().copied().fold(f64::NEG_INFINITY, f64::max))
}

pub fn nanstd(values: &[Scalar], ddof: usize) -> Option<f64> {
    let nums = collect_finite(values);
    if nums.len() <= ddof {
        return None;
    }
    let mean: f64 = nums.iter().sum::<f64>() / nums.len() as f64;
    let sum_sq: f64 = nums.iter().map(|x| (x - mean).powi(2)).sum();
    Some((sum_sq / (nums.len() - ddof) as f64).sqrt())
}

/// Linear-interpolated quantile over the non-missing values, `q` in `[0, 1]`.
pub fn nanquantile(values: &[Scalar], q: f64) -> Option<f64> {
    let mut nums = collect_finite(values);
    if nums.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    nums.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let position = q * (nums.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(nums[lower] + (nums[upper] - nums[lower]) * fraction)
}
