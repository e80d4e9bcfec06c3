//! Defines an enum of all the values a decoded TopSpeed field can carry.
//!
//! Values are one of the SQLite storage classes, plus `Null`.  The SQLite
//! binder dispatches on the variant, so a decoded row can be handed to a
//! prepared statement without further conversion.

use enum_as_inner::EnumAsInner;

#[derive(Debug, Clone, PartialEq, EnumAsInner)]
/// can hold any value that can be stored in a converted column.
pub enum Value {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(x) => write!(f, "{}", x),
            Value::Real(x) => write!(f, "{}", x),
            Value::Text(x) => write!(f, "{}", x),
            Value::Blob(_) => write!(f, "<BLOB>"),
        }
    }
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, ValueRef};
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Int(x) => ToSqlOutput::Borrowed(ValueRef::Integer(*x)),
            Value::Real(x) => ToSqlOutput::Borrowed(ValueRef::Real(*x)),
            Value::Text(x) => ToSqlOutput::Borrowed(ValueRef::Text(x.as_bytes())),
            Value::Blob(x) => ToSqlOutput::Borrowed(ValueRef::Blob(x)),
        })
    }
}

impl Value {
    /// Renders the value as a JSON fragment for array columns.
    ///
    /// A non-finite Real has no JSON representation and becomes null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Int(x) => serde_json::Value::from(*x),
            Value::Real(x) => {
                serde_json::Number::from_f64(*x).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            Value::Text(x) => serde_json::Value::from(x.as_str()),
            Value::Blob(x) => serde_json::Value::from(hex::encode(x)),
        }
    }
}

#[test]
fn test_value_to_json() {
    let cases: Vec<(Value, serde_json::Value)> = vec![
        (Value::Null, serde_json::Value::Null),
        (Value::Int(42), serde_json::json!(42)),
        (Value::Real(1.5), serde_json::json!(1.5)),
        (Value::Real(f64::NAN), serde_json::Value::Null),
        (Value::Text("Ten".to_string()), serde_json::json!("Ten")),
        (Value::Blob(vec![0xab, 0xcd]), serde_json::json!("abcd")),
    ];
    for (i, case) in cases.iter().enumerate() {
        println!("Testing case {}: {:?}", i, case.0);
        assert_eq!(case.0.to_json(), case.1);
    }
}

#[test]
fn test_value_display() {
    assert_eq!(format!("{}", Value::Null), "NULL");
    assert_eq!(format!("{}", Value::Int(-7)), "-7");
    assert_eq!(format!("{}", Value::Text("x".to_string())), "x");
    assert_eq!(format!("{}", Value::Blob(vec![1])), "<BLOB>");
}
