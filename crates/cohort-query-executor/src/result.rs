//! Tabular values returned by backends and held by completed tasks.

use std::collections::BTreeSet;

/// A single cell value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Integer value.
    Integer(i64),
    /// Decimal value.
    Decimal(f64),
    /// Text value.
    Text(String),
}

impl Value {
    /// The value as a patient identifier, or `None` for NULL.
    pub fn as_identifier(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(i.to_string()),
            Value::Decimal(d) => Some(d.to_string()),
            Value::Text(s) => Some(s.clone()),
        }
    }

    /// Whether the value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

/// An explicit SQL type for a column of a table being created.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ColumnType {
    /// Column name.
    pub name: String,
    /// SQL type text, e.g. `varchar(10)`.
    pub sql_type: String,
}

impl ColumnType {
    /// Creates a column type.
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

/// A fully materialized result set.
///
/// # Example
///
/// ```rust
/// use cohort_query_executor::DataTable;
///
/// let table = DataTable::single_column("chi", ["0101010101", "0202020202", "0101010101"]);
/// assert_eq!(table.row_count(), 3);
/// assert_eq!(table.identifiers().len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl DataTable {
    /// Creates an empty table with the given columns.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Creates a table from columns and rows.
    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// Creates a one-column table.
    pub fn single_column<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self {
            columns: vec![column.to_string()],
            rows: values.into_iter().map(|v| vec![v.into()]).collect(),
        }
    }

    /// Appends a row.
    pub fn add_row(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    /// Column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in fetch order.
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column, matched case-insensitively.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Every value of one column.
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let index = self.column_index(name)?;
        Some(self.rows.iter().filter_map(|row| row.get(index)).collect())
    }

    /// Distinct non-null values of the first column.
    pub fn identifiers(&self) -> BTreeSet<String> {
        self.rows
            .iter()
            .filter_map(|row| row.first())
            .filter_map(Value::as_identifier)
            .collect()
    }

    /// A copy holding at most `limit` rows.
    pub fn truncated(&self, limit: usize) -> DataTable {
        Self {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(limit).cloned().collect(),
        }
    }
}
