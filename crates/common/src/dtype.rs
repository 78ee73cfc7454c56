use std::{
    fmt,
    str::FromStr,
};

use serde::{
    Deserialize,
    Serialize,
};

/// The closed set of column types the federation understands. Each value
/// maps to one SQL type on the worker store and one JSON representation on
/// the wire.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DType {
    Int,
    Float,
    Str,
    Json,
    Binary,
}

impl DType {
    pub fn to_sql(self) -> &'static str {
        match self {
            DType::Int => "INT",
            DType::Float => "DOUBLE",
            DType::Str => "VARCHAR(500)",
            DType::Json => "CLOB",
            DType::Binary => "BLOB",
        }
    }

    pub fn from_sql(sql: &str) -> anyhow::Result<Self> {
        let dtype = match sql.to_ascii_uppercase().as_str() {
            "INT" | "BIGINT" => DType::Int,
            "DOUBLE" | "REAL" | "FLOAT" => DType::Float,
            "CLOB" => DType::Json,
            "BLOB" => DType::Binary,
            s if s.starts_with("VARCHAR") => DType::Str,
            s => anyhow::bail!("Unknown SQL type: {s}"),
        };
        Ok(dtype)
    }

    /// The dtype of a JSON literal, used when inferring deferred schemas.
    pub fn from_json_value(value: &serde_json::Value) -> anyhow::Result<Self> {
        let dtype = match value {
            serde_json::Value::Bool(_) => DType::Int,
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => DType::Int,
            serde_json::Value::Number(_) => DType::Float,
            serde_json::Value::String(_) => DType::Str,
            v => anyhow::bail!("No column dtype for JSON value {v}"),
        };
        Ok(dtype)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DType::Int => "INT",
            DType::Float => "FLOAT",
            DType::Str => "STR",
            DType::Json => "JSON",
            DType::Binary => "BINARY",
        };
        write!(f, "{name}")
    }
}

impl FromStr for DType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let dtype = match s {
            "INT" => DType::Int,
            "FLOAT" => DType::Float,
            "STR" => DType::Str,
            "JSON" => DType::Json,
            "BINARY" => DType::Binary,
            _ => anyhow::bail!("Unknown dtype: {s}"),
        };
        Ok(dtype)
    }
}
