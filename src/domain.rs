use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReportError;

/// Last addressable row of an xlsx worksheet.
pub const MAX_ROW: u32 = 1_048_576;
/// Last addressable column (`XFD`) of an xlsx worksheet.
pub const MAX_COLUMN: u32 = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellRef {
    pub row: u32,
    pub column: u32,
}

impl CellRef {
    pub fn new(row: u32, column: u32) -> Result<Self, ReportError> {
        if row == 0 || column == 0 || row > MAX_ROW || column > MAX_COLUMN {
            return Err(ReportError::InvalidCell(format!("R{row}C{column}")));
        }
        Ok(Self { row, column })
    }

    /// The cell `rows` down and `columns` right of this one, if it is still
    /// inside the sheet.
    pub fn offset(&self, rows: u32, columns: u32) -> Result<Self, ReportError> {
        let row = self.row.saturating_add(rows);
        let column = self.column.saturating_add(columns);
        Self::new(row, column)
    }

    pub fn column_letters(&self) -> String {
        column_letters(self.column)
    }
}

pub fn column_letters(column: u32) -> String {
    let mut letters = Vec::new();
    let mut n = column;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(char::from(b'A' + rem as u8));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.column_letters(), self.row)
    }
}

impl Serialize for CellRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for CellRef {
    type Err = ReportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().replace('$', "").to_ascii_uppercase();
        let split = normalized
            .find(|ch: char| ch.is_ascii_digit())
            .ok_or_else(|| ReportError::InvalidCell(value.to_string()))?;
        let (letters, digits) = normalized.split_at(split);
        let is_valid = !letters.is_empty()
            && letters.len() <= 3
            && letters.chars().all(|ch| ch.is_ascii_uppercase())
            && digits.chars().all(|ch| ch.is_ascii_digit());
        if !is_valid {
            return Err(ReportError::InvalidCell(value.to_string()));
        }
        let column = letters
            .bytes()
            .fold(0u32, |acc, b| acc * 26 + u32::from(b - b'A' + 1));
        let row = digits
            .parse::<u32>()
            .map_err(|_| ReportError::InvalidCell(value.to_string()))?;
        Self::new(row, column).map_err(|_| ReportError::InvalidCell(value.to_string()))
    }
}

/// A single cell value as returned by the query service.
///
/// Integers that fit `i64` are kept exact rather than widened to `f64`.
/// Ordering is total: nulls first, then booleans, numbers (numerically, across
/// both numeric variants) and finally text (lexicographically). Pivot sorting
/// relies on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Scalar::Null,
            Value::Bool(flag) => Scalar::Bool(*flag),
            Value::Number(number) => number
                .as_i64()
                .map(Scalar::Integer)
                .or_else(|| number.as_f64().map(Scalar::Number))
                .unwrap_or(Scalar::Null),
            Value::String(text) => Scalar::Text(text.clone()),
            other => Scalar::Text(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    fn rank(&self) -> u8 {
        match self {
            Scalar::Null => 0,
            Scalar::Bool(_) => 1,
            Scalar::Integer(_) | Scalar::Number(_) => 2,
            Scalar::Text(_) => 3,
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Number(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Integer(value)
    }
}

/// Orders an integer against a float without rounding the integer through
/// `f64`. NaN sits at the ends, as it does under `f64::total_cmp`.
fn cmp_integer_float(integer: i64, float: f64) -> Ordering {
    if float.is_nan() {
        return if float.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    // 2^63 as f64; everything at or above it is out of i64 range.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if float >= LIMIT {
        return Ordering::Less;
    }
    if float < -LIMIT {
        return Ordering::Greater;
    }
    let whole = float.floor();
    match integer.cmp(&(whole as i64)) {
        Ordering::Equal if float > whole => Ordering::Less,
        ordering => ordering,
    }
}

impl Ord for Scalar {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
            (Scalar::Integer(a), Scalar::Integer(b)) => a.cmp(b),
            (Scalar::Integer(a), Scalar::Number(b)) => cmp_integer_float(*a, *b),
            (Scalar::Number(a), Scalar::Integer(b)) => cmp_integer_float(*b, *a).reverse(),
            (Scalar::Number(a), Scalar::Number(b)) => a.total_cmp(b),
            (Scalar::Text(a), Scalar::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Scalar {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scalar {}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => Ok(()),
            Scalar::Bool(flag) => write!(f, "{flag}"),
            Scalar::Integer(integer) => write!(f, "{integer}"),
            Scalar::Number(number) if number.fract() == 0.0 && number.abs() < 1e15 => {
                write!(f, "{}", *number as i64)
            }
            Scalar::Number(number) => write!(f, "{number}"),
            Scalar::Text(text) => write!(f, "{text}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(String);

impl QueryId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueryId {
    type Err = ReportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !is_valid {
            return Err(ReportError::ConfigParse(format!("invalid query id: {value}")));
        }
        Ok(Self(normalized))
    }
}

impl From<u64> for QueryId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuerySpec {
    pub name: String,
    pub group: String,
    pub query_id: QueryId,
    pub destination_sheet: String,
    pub destination_cell: CellRef,
    pub date_cell: Option<CellRef>,
    pub pivot: bool,
    pub include_row_labels: bool,
    #[serde(skip_serializing)]
    pub credential: String,
    pub fixed_parameters: BTreeMap<String, String>,
}

impl QuerySpec {
    /// Parameters as sent on the wire: the fixed parameters plus the credential
    /// under `api_key`.
    pub fn request_parameters(&self) -> BTreeMap<String, String> {
        let mut params = self.fixed_parameters.clone();
        if !self.credential.is_empty() {
            params.insert("api_key".to_string(), self.credential.clone());
        }
        params
    }
}

pub type Row = BTreeMap<String, Scalar>;

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RawResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl RawResult {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn value(&self, row: usize, column: &str) -> &Scalar {
        const NULL: &Scalar = &Scalar::Null;
        self.rows
            .get(row)
            .and_then(|record| record.get(column))
            .unwrap_or(NULL)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
}

impl Table {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.headers.len()
    }

    pub fn column_index(&self, header: &str) -> Option<usize> {
        self.headers.iter().position(|name| name == header)
    }
}
