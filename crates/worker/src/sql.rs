//! Small SQL building helpers shared by the task handlers.

use common::{
    TableSchema,
    TableType,
};
use itertools::Itertools;

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a JSON value as a SQL literal.
pub fn sql_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_owned(),
        serde_json::Value::Bool(true) => "TRUE".to_owned(),
        serde_json::Value::Bool(false) => "FALSE".to_owned(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        v => format!("'{}'", v.to_string().replace('\'', "''")),
    }
}

pub fn column_defs(schema: &TableSchema) -> String {
    schema
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.dtype.to_sql()))
        .join(",")
}

pub fn drop_statement(table_type: TableType, name: &str) -> String {
    match table_type {
        TableType::View => format!("DROP VIEW {name};"),
        _ => format!("DROP TABLE {name};"),
    }
}

#[cfg(test)]
mod tests {
    use common::{
        ColumnInfo,
        DType,
    };

    use super::*;

    #[test]
    fn test_sql_literal_escaping() {
        assert_eq!(sql_literal(&serde_json::json!(1.5)), "1.5");
        assert_eq!(sql_literal(&serde_json::json!("o'neill")), "'o''neill'");
        assert_eq!(sql_literal(&serde_json::Value::Null), "NULL");
    }

    #[test]
    fn test_column_defs() {
        let schema = TableSchema::new(vec![
            ColumnInfo::new("row_id", DType::Int),
            ColumnInfo::new("x", DType::Float),
            ColumnInfo::new("label", DType::Str),
        ]);
        assert_eq!(
            column_defs(&schema),
            "\"row_id\" INT,\"x\" DOUBLE,\"label\" VARCHAR(500)"
        );
    }
}
