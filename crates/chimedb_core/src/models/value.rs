//! Backend-neutral parameter and result values.

use crate::error::{ChimeDbError, ChimeDbResult};

use bytes::BytesMut;
use std::error::Error;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

/// Which database engine a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// SQLite file or in-memory database
    Sqlite,
    /// PostgreSQL server
    Postgres,
}

impl Backend {
    /// Display name used in connector descriptions.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "Sqlite",
            Self::Postgres => "PostgreSQL",
        }
    }
}

/// A single SQL value, used both for bound parameters and result cells.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Any integer (booleans are read back as 0/1)
    Integer(i64),
    /// Floating point
    Real(f64),
    /// Text (JSON columns are read back as text)
    Text(String),
    /// Raw bytes
    Blob(Vec<u8>),
}

impl Value {
    /// Check for SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer value, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Float value; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Text value, if this is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Blob value, if this is a blob.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Integer(_) => "INTEGER",
            Self::Real(_) => "REAL",
            Self::Text(_) => "TEXT",
            Self::Blob(_) => "BLOB",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

// ========== SQLite binding ==========

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, ValueRef};

        Ok(ToSqlOutput::Borrowed(match self {
            Self::Null => ValueRef::Null,
            Self::Integer(i) => ValueRef::Integer(*i),
            Self::Real(f) => ValueRef::Real(*f),
            Self::Text(s) => ValueRef::Text(s.as_bytes()),
            Self::Blob(b) => ValueRef::Blob(b),
        }))
    }
}

impl From<rusqlite::types::ValueRef<'_>> for Value {
    fn from(v: rusqlite::types::ValueRef<'_>) -> Self {
        use rusqlite::types::ValueRef;

        match v {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(i) => Self::Integer(i),
            ValueRef::Real(f) => Self::Real(f),
            ValueRef::Text(t) => Self::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Self::Blob(b.to_vec()),
        }
    }
}

// ========== PostgreSQL binding ==========

/// Values adapt to the declared parameter type, so `Value::Integer` can bind
/// an INT2, INT4 or INT8 column alike.
impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Integer(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::BOOL => (*i != 0).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                    i.to_string().to_sql(ty, out)
                }
                _ => i.to_sql(ty, out),
            },
            Self::Real(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            Self::Text(s) => match *ty {
                Type::JSON | Type::JSONB => {
                    serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out)
                }
                _ => s.as_str().to_sql(ty, out),
            },
            Self::Blob(b) => b.as_slice().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Read one cell of a PostgreSQL row.
pub(crate) fn value_from_pg(row: &tokio_postgres::Row, idx: usize) -> ChimeDbResult<Value> {
    let ty = row.columns()[idx].type_().clone();
    let value: Value = match ty {
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(i64::from).into(),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(i64::from).into(),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.into(),
        Type::OID => row.try_get::<_, Option<u32>>(idx)?.map(i64::from).into(),
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.into(),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(f64::from).into(),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.into(),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.into(),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|v| v.to_string())
            .into(),
        _ => row.try_get::<_, Option<String>>(idx).map_err(|e| {
            ChimeDbError::database(format!(
                "Unsupported column type {ty} for column '{}': {e}",
                row.columns()[idx].name()
            ))
        })?.into(),
    };
    Ok(value)
}

/// A result row: column names plus values in select order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a row from parallel column/value lists.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column names in select order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in select order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value by position.
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.iter().position(|c| c == name).and_then(|idx| self.values.get(idx))
    }

    /// Required integer column.
    pub fn try_i64(&self, name: &str) -> ChimeDbResult<i64> {
        let value = self.require(name)?;
        value.as_i64().ok_or_else(|| {
            ChimeDbError::validation(format!(
                "Column '{name}' holds {}, expected INTEGER",
                value.type_name()
            ))
        })
    }

    /// Required text column.
    pub fn try_str(&self, name: &str) -> ChimeDbResult<&str> {
        let value = self.require(name)?;
        value.as_str().ok_or_else(|| {
            ChimeDbError::validation(format!(
                "Column '{name}' holds {}, expected TEXT",
                value.type_name()
            ))
        })
    }

    fn require(&self, name: &str) -> ChimeDbResult<&Value> {
        self.get_by_name(name)
            .ok_or_else(|| ChimeDbError::validation(format!("No column named '{name}' in row")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_conversion() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".to_string()));
        assert_eq!(Value::from(true), Value::Integer(1));
    }

    #[test]
    fn test_row_lookup() {
        let row = Row::new(
            vec!["id".to_string(), "name".to_string()],
            vec![Value::Integer(7), Value::Text("crate".to_string())],
        );
        assert_eq!(row.try_i64("id").unwrap(), 7);
        assert_eq!(row.try_str("name").unwrap(), "crate");
        assert!(matches!(row.try_i64("name"), Err(ChimeDbError::Validation { .. })));
        assert!(row.get_by_name("missing").is_none());
    }

    #[test]
    fn test_integer_binds_to_narrow_pg_types() {
        let mut buf = BytesMut::new();
        Value::Integer(5).to_sql_checked(&Type::INT4, &mut buf).unwrap();
        assert_eq!(buf.len(), 4);

        let mut buf = BytesMut::new();
        assert!(Value::Integer(1 << 40).to_sql_checked(&Type::INT4, &mut buf).is_err());

        let mut buf = BytesMut::new();
        let null = Value::Null.to_sql_checked(&Type::INT8, &mut buf).unwrap();
        assert!(matches!(null, IsNull::Yes));
    }
}
