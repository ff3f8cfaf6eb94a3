//! Typed value tree
//!
//! Everything a frame can carry decodes into a [`Value`]: scalars, typed
//! vectors, and tables. The shapes a subscriber actually routes are narrow
//! (zero-row tables and any-vectors of column vectors), but cells inside a
//! column can be any scalar type or an array-typed cell (itself a vector),
//! so the model is recursive.

use crate::{ProtocolError, Result};

// =============================================================================
// Wire discriminators
// =============================================================================

/// Data form: the high byte of the form/type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataForm {
    Scalar = 0,
    Vector = 1,
    Table = 2,
}

impl DataForm {
    /// Parse from raw byte value
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Scalar),
            1 => Some(Self::Vector),
            2 => Some(Self::Table),
            _ => None,
        }
    }

    /// Get string representation
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::Vector => "vector",
            Self::Table => "table",
        }
    }
}

impl std::fmt::Display for DataForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Data type: the low byte of the form/type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Void = 0,
    Bool = 1,
    Char = 2,
    Short = 3,
    Int = 4,
    Long = 5,
    Float = 6,
    Double = 7,
    String = 8,
    Blob = 9,
    Symbol = 10,
    Timestamp = 11,
    Any = 12,
}

impl DataType {
    /// Parse from raw byte value
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Void),
            1 => Some(Self::Bool),
            2 => Some(Self::Char),
            3 => Some(Self::Short),
            4 => Some(Self::Int),
            5 => Some(Self::Long),
            6 => Some(Self::Float),
            7 => Some(Self::Double),
            8 => Some(Self::String),
            9 => Some(Self::Blob),
            10 => Some(Self::Symbol),
            11 => Some(Self::Timestamp),
            12 => Some(Self::Any),
            _ => None,
        }
    }

    /// Get string representation
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::Char => "char",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Blob => "blob",
            Self::Symbol => "symbol",
            Self::Timestamp => "timestamp",
            Self::Any => "any",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pack a form/type pair into the wire discriminator
#[inline]
pub(crate) const fn pack_form_type(form: DataForm, data_type: DataType) -> u16 {
    ((form as u16) << 8) | (data_type as u16)
}

/// Split the wire discriminator into its form/type pair
pub(crate) fn unpack_form_type(raw: u16) -> Result<(DataForm, DataType)> {
    let form = DataForm::from_u8((raw >> 8) as u8)
        .ok_or(ProtocolError::InvalidForm((raw >> 8) as u8))?;
    let data_type =
        DataType::from_u8((raw & 0xff) as u8).ok_or(ProtocolError::InvalidType((raw & 0xff) as u8))?;
    Ok((form, data_type))
}

// =============================================================================
// Value
// =============================================================================

/// A decoded wire value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Bool(bool),
    Char(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Blob(Vec<u8>),
    Symbol(String),
    Timestamp(i64),
    Vector(Vector),
    Table(Table),
}

impl Value {
    /// The data type this value carries on the wire
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Void => DataType::Void,
            Self::Bool(_) => DataType::Bool,
            Self::Char(_) => DataType::Char,
            Self::Short(_) => DataType::Short,
            Self::Int(_) => DataType::Int,
            Self::Long(_) => DataType::Long,
            Self::Float(_) => DataType::Float,
            Self::Double(_) => DataType::Double,
            Self::String(_) => DataType::String,
            Self::Blob(_) => DataType::Blob,
            Self::Symbol(_) => DataType::Symbol,
            Self::Timestamp(_) => DataType::Timestamp,
            Self::Vector(v) => v.data_type,
            Self::Table(_) => DataType::Any,
        }
    }

    /// The data form this value carries on the wire
    pub fn form(&self) -> DataForm {
        match self {
            Self::Vector(_) => DataForm::Vector,
            Self::Table(_) => DataForm::Table,
            _ => DataForm::Scalar,
        }
    }

    #[inline]
    pub fn is_vector(&self) -> bool {
        matches!(self, Self::Vector(_))
    }

    #[inline]
    pub fn is_table(&self) -> bool {
        matches!(self, Self::Table(_))
    }

    /// Borrow as a vector, if this value is one
    pub fn as_vector(&self) -> Option<&Vector> {
        match self {
            Self::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow as a table, if this value is one
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Borrow blob bytes, if this value is a blob
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }
}

// =============================================================================
// Vector
// =============================================================================

/// A typed vector of values
///
/// Homogeneous for concrete types; `Any` vectors hold elements of mixed
/// form/type, each serialized with its own discriminator. The row-data
/// payload is an `Any` vector whose elements are same-length column vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct Vector {
    pub data_type: DataType,
    pub values: Vec<Value>,
}

impl Vector {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            values: Vec::new(),
        }
    }

    pub fn any(values: Vec<Value>) -> Self {
        Self {
            data_type: DataType::Any,
            values,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Number of rows when this vector is an any-vector of column vectors.
    ///
    /// Defined by the first column; [`check_columns`](Self::check_columns)
    /// verifies the rest agree.
    pub fn row_count(&self) -> usize {
        match self.values.first() {
            Some(Value::Vector(col)) => col.len(),
            Some(_) => 1,
            None => 0,
        }
    }

    /// Number of columns when this vector is an any-vector of column vectors
    #[inline]
    pub fn column_count(&self) -> usize {
        self.values.len()
    }

    /// Verify every column holds the same number of rows
    pub fn check_columns(&self) -> Result<()> {
        let expected = self.row_count();
        for (i, col) in self.values.iter().enumerate() {
            let actual = match col {
                Value::Vector(v) => v.len(),
                _ => 1,
            };
            if actual != expected {
                return Err(ProtocolError::ColumnLengthMismatch {
                    column: i,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Whether the columns of this any-vector are bare cell values rather
    /// than column vectors (the single-row 1-D shape some publishers emit).
    pub fn is_flat_row(&self) -> bool {
        !self.values.is_empty() && !self.values.iter().any(Value::is_vector)
    }

    /// Promote a 1-D row into 1xC column shape.
    ///
    /// Each scalar column becomes a one-element typed vector; an array cell
    /// becomes a one-element any-vector holding it.
    pub fn promote_flat_row(&self) -> Vector {
        let columns = self
            .values
            .iter()
            .map(|cell| match cell {
                Value::Vector(v) => Value::Vector(Vector {
                    data_type: DataType::Any,
                    values: vec![Value::Vector(v.clone())],
                }),
                other => Value::Vector(Vector {
                    data_type: other.data_type(),
                    values: vec![other.clone()],
                }),
            })
            .collect();
        Vector::any(columns)
    }

    /// Split an any-vector of column vectors into per-row any-vectors.
    ///
    /// Row `i` holds cell `i` of every column, in column order. The caller
    /// is expected to have validated column lengths first.
    pub fn split_rows(&self) -> Vec<Vector> {
        let rows = self.row_count();
        let cols = self.column_count();
        let mut out = Vec::with_capacity(rows);
        for row_idx in 0..rows {
            let mut cells = Vec::with_capacity(cols);
            for col in &self.values {
                let cell = match col {
                    Value::Vector(v) => v.values.get(row_idx).cloned().unwrap_or(Value::Void),
                    other => other.clone(),
                };
                cells.push(cell);
            }
            out.push(Vector::any(cells));
        }
        out
    }
}

// =============================================================================
// Table
// =============================================================================

/// A named table of columns
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub col_names: Vec<String>,
    pub columns: Vec<Vector>,
}

impl Table {
    /// Number of rows (length of the first column, 0 when empty)
    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, Vector::len)
    }

    /// Number of columns
    #[inline]
    pub fn cols(&self) -> usize {
        self.columns.len()
    }

    /// Build a table from an any-vector of column vectors and the column
    /// names learned at subscribe time.
    ///
    /// Columns beyond the named count are dropped; a bare cell value is
    /// treated as a one-row column.
    pub fn from_any_columns(name: impl Into<String>, col_names: &[String], data: &Vector) -> Table {
        let columns = data
            .values
            .iter()
            .take(col_names.len())
            .map(|col| match col {
                Value::Vector(v) => v.clone(),
                other => Vector {
                    data_type: other.data_type(),
                    values: vec![other.clone()],
                },
            })
            .collect();
        Table {
            name: name.into(),
            col_names: col_names.to_vec(),
            columns,
        }
    }

    /// Column-wise append of another table's rows onto this one.
    ///
    /// Used by table-mode coalescing; appends by position, ignoring any
    /// columns the other table has beyond this one's width.
    pub fn append_rows(&mut self, other: &Table) {
        for (dst, src) in self.columns.iter_mut().zip(other.columns.iter()) {
            dst.values.extend(src.values.iter().cloned());
        }
    }

    /// Split rows `at..` off into a new table, keeping `..at` here.
    ///
    /// The coalescing window uses this to stop exactly at its row target
    /// and carry the spill into the next delivery.
    pub fn split_off_rows(&mut self, at: usize) -> Table {
        let columns = self
            .columns
            .iter_mut()
            .map(|col| Vector {
                data_type: col.data_type,
                values: col.values.split_off(at.min(col.values.len())),
            })
            .collect();
        Table {
            name: self.name.clone(),
            col_names: self.col_names.clone(),
            columns,
        }
    }
}
