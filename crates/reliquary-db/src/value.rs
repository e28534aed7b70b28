//! Attribute values and their SQL column types.
//!
//! [`Value`] is the only currency between records and backends. Every kind
//! it can hold has a column type, so inferring a column for a new attribute
//! is a total match; only `Null` carries no kind and cannot seed a column.

use chrono::{DateTime, Utc};
use reliquary_core::{Error, Result};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
    Boolean(bool),
    Real(f64),
    /// Stored as integer epoch milliseconds.
    Timestamp(DateTime<Utc>),
    Blob(Vec<u8>),
    /// Stored in its canonical hyphenated text form.
    Uuid(Uuid),
}

/// Column type of a declared field or an inferred dynamic attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Integer,
    Text,
    Boolean,
    Real,
    Timestamp,
    Blob,
    Uuid,
}

impl ColumnType {
    /// Infer the column type for a previously unseen attribute.
    pub fn infer(sample: &Value) -> Result<ColumnType> {
        sample.kind().ok_or_else(|| {
            Error::unsupported_type("null carries no type; set a concrete value first")
        })
    }

    /// Map a type name reported by backend introspection back to a column type.
    ///
    /// Timestamps and UUIDs are indistinguishable from integers and text once
    /// stored, so they come back as those.
    pub fn from_declared(declared: &str) -> ColumnType {
        let declared = declared.trim().to_ascii_lowercase();
        if declared.starts_with("bool") || declared.starts_with("tinyint(1)") {
            ColumnType::Boolean
        } else if declared.contains("int") {
            ColumnType::Integer
        } else if declared.contains("real")
            || declared.contains("double")
            || declared.contains("float")
            || declared.contains("decimal")
        {
            ColumnType::Real
        } else if declared.contains("blob") || declared.contains("binary") {
            ColumnType::Blob
        } else {
            ColumnType::Text
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Integer => "integer",
            ColumnType::Text => "text",
            ColumnType::Boolean => "boolean",
            ColumnType::Real => "real",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Blob => "blob",
            ColumnType::Uuid => "uuid",
        };
        f.write_str(name)
    }
}

impl Value {
    /// Runtime kind of this value, `None` for `Null`.
    pub fn kind(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Real(_) => Some(ColumnType::Real),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
            Value::Blob(_) => Some(ColumnType::Blob),
            Value::Uuid(_) => Some(ColumnType::Uuid),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Read this value as `T`, failing with [`Error::Conversion`] on mismatch.
    pub fn decode<T: FromValue>(&self) -> Result<T> {
        T::from_value(self).ok_or_else(|| {
            Error::conversion(format!(
                "cannot read {} value as {}",
                self.kind_name(),
                std::any::type_name::<T>()
            ))
        })
    }

    /// Convert a raw backend value into the representation of `column_type`.
    ///
    /// Backends hand back what they stored: booleans as 0/1, UUIDs as text,
    /// timestamps as epoch milliseconds, and MySQL text as bytes.
    pub fn coerce(self, column_type: ColumnType) -> Result<Value> {
        let kind = self.kind_name();
        self.try_coerce(column_type).map_err(|_| {
            Error::conversion(format!("cannot coerce {kind} value to {column_type}"))
        })
    }

    /// Like [`Value::coerce`], but hands the value back unchanged on mismatch.
    pub fn coerce_or_keep(self, column_type: ColumnType) -> Value {
        match self.try_coerce(column_type) {
            Ok(value) | Err(value) => value,
        }
    }

    fn try_coerce(self, column_type: ColumnType) -> std::result::Result<Value, Value> {
        match (self, column_type) {
            (Value::Null, _) => Ok(Value::Null),
            (v @ Value::Integer(_), ColumnType::Integer)
            | (v @ Value::Text(_), ColumnType::Text)
            | (v @ Value::Boolean(_), ColumnType::Boolean)
            | (v @ Value::Real(_), ColumnType::Real)
            | (v @ Value::Timestamp(_), ColumnType::Timestamp)
            | (v @ Value::Blob(_), ColumnType::Blob)
            | (v @ Value::Uuid(_), ColumnType::Uuid) => Ok(v),

            (Value::Integer(i), ColumnType::Boolean) => Ok(Value::Boolean(i != 0)),
            (Value::Boolean(b), ColumnType::Integer) => Ok(Value::Integer(i64::from(b))),
            (Value::Integer(i), ColumnType::Real) => Ok(Value::Real(i as f64)),
            // `as` saturates; only whole reals inside the i64 range convert.
            (Value::Real(f), ColumnType::Integer)
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 =>
            {
                Ok(Value::Integer(f as i64))
            }
            (Value::Integer(ms), ColumnType::Timestamp) => DateTime::from_timestamp_millis(ms)
                .map(Value::Timestamp)
                .ok_or(Value::Integer(ms)),
            (Value::Timestamp(t), ColumnType::Integer) => Ok(Value::Integer(t.timestamp_millis())),

            (Value::Text(s), ColumnType::Uuid) => match Uuid::parse_str(&s) {
                Ok(uuid) => Ok(Value::Uuid(uuid)),
                Err(_) => Err(Value::Text(s)),
            },
            (Value::Uuid(u), ColumnType::Text) => Ok(Value::Text(u.to_string())),
            (Value::Text(s), ColumnType::Integer) => match s.trim().parse::<i64>() {
                Ok(i) => Ok(Value::Integer(i)),
                Err(_) => Err(Value::Text(s)),
            },
            (Value::Text(s), ColumnType::Real) => match s.trim().parse::<f64>() {
                Ok(f) => Ok(Value::Real(f)),
                Err(_) => Err(Value::Text(s)),
            },
            (Value::Text(s), ColumnType::Timestamp) => match DateTime::parse_from_rfc3339(&s) {
                Ok(t) => Ok(Value::Timestamp(t.with_timezone(&Utc))),
                Err(_) => Err(Value::Text(s)),
            },
            (Value::Text(s), ColumnType::Blob) => Ok(Value::Blob(s.into_bytes())),
            (Value::Blob(bytes), ColumnType::Text) => match String::from_utf8(bytes) {
                Ok(s) => Ok(Value::Text(s)),
                Err(e) => Err(Value::Blob(e.into_bytes())),
            },
            (Value::Blob(bytes), ColumnType::Uuid) => {
                let parsed = Uuid::from_slice(&bytes)
                    .ok()
                    .or_else(|| std::str::from_utf8(&bytes).ok().and_then(|s| Uuid::parse_str(s).ok()));
                parsed.map(Value::Uuid).ok_or(Value::Blob(bytes))
            }

            (other, _) => Err(other),
        }
    }

    fn kind_name(&self) -> String {
        match self.kind() {
            Some(kind) => kind.to_string(),
            None => "null".to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Text(s) => f.write_str(s),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
            Value::Uuid(u) => write!(f, "{u}"),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    i64 => Integer,
    i32 => Integer,
    u32 => Integer,
    i16 => Integer,
    u8 => Integer,
    String => Text,
    &str => Text,
    bool => Boolean,
    f64 => Real,
    f32 => Real,
    DateTime<Utc> => Timestamp,
    Vec<u8> => Blob,
    &[u8] => Blob,
    Uuid => Uuid,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Typed read access to a [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(*i),
            Value::Boolean(b) => Some(i64::from(*b)),
            Value::Timestamp(t) => Some(t.timestamp_millis()),
            _ => None,
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Option<Self> {
        i64::from_value(value).and_then(|i| i32::try_from(i).ok())
    }
}

impl FromValue for u32 {
    fn from_value(value: &Value) -> Option<Self> {
        i64::from_value(value).and_then(|i| u32::try_from(i).ok())
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Real(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Boolean(b) => Some(*b),
            Value::Integer(0) => Some(false),
            Value::Integer(1) => Some(true),
            _ => None,
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Text(s) => Some(s.clone()),
            Value::Uuid(u) => Some(u.to_string()),
            _ => None,
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Blob(b) => Some(b.clone()),
            _ => None,
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Timestamp(t) => Some(*t),
            Value::Integer(ms) => DateTime::from_timestamp_millis(*ms),
            _ => None,
        }
    }
}

impl FromValue for Uuid {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Uuid(u) => Some(*u),
            Value::Text(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}
