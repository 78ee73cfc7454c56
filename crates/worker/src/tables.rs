//! Table lifecycle tasks: creation, inserts, merges, remote mounts, data
//! fetch and per-context cleanup.

use std::{
    collections::BTreeMap,
    str::FromStr,
};

use common::{
    knobs::PROTECT_LOCAL_DATA,
    ColumnData,
    CommandId,
    ContextId,
    DType,
    NodeId,
    TableData,
    TableInfo,
    TableName,
    TableSchema,
    TableType,
};
use itertools::Itertools;

use crate::{
    sql::{
        column_defs,
        drop_statement,
        quote_ident,
        sql_literal,
    },
    store::StoreClient,
};

pub async fn create_table(
    store: &dyn StoreClient,
    node_id: &NodeId,
    context_id: &ContextId,
    command_id: &CommandId,
    schema: &TableSchema,
) -> anyhow::Result<TableInfo> {
    let name = TableName::new(
        TableType::Normal,
        node_id.clone(),
        context_id.clone(),
        command_id.clone(),
        "0",
    )?
    .to_string();
    store
        .execute(&format!("CREATE TABLE {name}({});", column_defs(schema)))
        .await?;
    Ok(TableInfo::new(name, schema.clone(), TableType::Normal))
}

pub async fn insert_data_to_table(
    store: &dyn StoreClient,
    table_name: &str,
    rows: &[Vec<serde_json::Value>],
) -> anyhow::Result<()> {
    anyhow::ensure!(!rows.is_empty(), "Cannot insert zero rows");
    let width = rows[0].len();
    anyhow::ensure!(
        rows.iter().all(|r| r.len() == width),
        "Rows to insert have inconsistent widths"
    );
    let values = rows
        .iter()
        .map(|row| format!("({})", row.iter().map(sql_literal).join(", ")))
        .join(", ");
    store
        .execute(&format!("INSERT INTO {table_name} VALUES {values};"))
        .await
}

pub async fn create_merge_table(
    store: &dyn StoreClient,
    node_id: &NodeId,
    context_id: &ContextId,
    command_id: &CommandId,
    source_tables: &[TableInfo],
) -> anyhow::Result<TableInfo> {
    let first = source_tables
        .first()
        .ok_or_else(|| anyhow::anyhow!("A merge table needs at least one source table"))?;
    anyhow::ensure!(
        source_tables.iter().all(|t| t.schema == first.schema),
        "Merge table sources do not share one schema"
    );
    let name = TableName::new(
        TableType::Merge,
        node_id.clone(),
        context_id.clone(),
        command_id.clone(),
        "0",
    )?
    .to_string();
    let mut statements = vec![format!(
        "CREATE MERGE TABLE {name}({});",
        column_defs(&first.schema)
    )];
    for source in source_tables {
        statements.push(format!(
            "ALTER TABLE {name} ADD TABLE {};",
            quote_ident(&source.name)
        ));
    }
    store.execute(&statements.join("")).await?;
    Ok(TableInfo::new(name, first.schema.clone(), TableType::Merge))
}

/// Mount a table living on another worker's store under the exact name it
/// has there. Reads go through the source at query time; no rows move.
pub async fn create_remote_table(
    store: &dyn StoreClient,
    table_name: &str,
    schema: &TableSchema,
    source_db_address: &str,
) -> anyhow::Result<()> {
    store
        .execute(&format!(
            "CREATE REMOTE TABLE {table_name}({}) ON 'mapi:monetdb://{source_db_address}/db';",
            column_defs(schema),
        ))
        .await
}

pub async fn get_table_data(
    store: &dyn StoreClient,
    table_name: &str,
) -> anyhow::Result<TableData> {
    if *PROTECT_LOCAL_DATA {
        // Views are row-level slices of the primary data; only derived
        // artifacts may leave the worker.
        let parsed = TableName::from_str(table_name);
        match parsed {
            Ok(name) if name.table_type != TableType::View => {},
            _ => anyhow::bail!("Table {table_name} holds local data and cannot be read remotely"),
        }
    }
    let rows = store
        .query(&format!("SELECT * FROM {table_name};"))
        .await?;
    let columns = rows
        .columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let values: Vec<serde_json::Value> =
                rows.rows.iter().map(|r| r[i].clone()).collect();
            let dtype = values
                .iter()
                .find_map(|v| DType::from_json_value(v).ok())
                .unwrap_or(DType::Str);
            ColumnData {
                name: column.clone(),
                dtype,
                values,
            }
        })
        .collect();
    Ok(TableData {
        name: table_name.to_owned(),
        columns,
    })
}

/// Drop every artifact of a context in one transactional batch, ordered so
/// that dependents go before their dependencies.
pub async fn cleanup(store: &dyn StoreClient, context_id: &ContextId) -> anyhow::Result<()> {
    let names = store
        .list_tables(&format!("_{context_id}_"))
        .await?;
    let mut by_type: BTreeMap<TableType, Vec<String>> = BTreeMap::new();
    for name in names {
        let Ok(parsed) = TableName::from_str(&name) else {
            continue;
        };
        if parsed.in_context(context_id) {
            by_type.entry(parsed.table_type).or_default().push(name);
        }
    }
    let query = get_drop_tables_query(&by_type);
    if !query.is_empty() {
        store.execute(&query).await?;
    }
    tracing::info!(context_id = %context_id, "Dropped context artifacts");
    Ok(())
}

fn get_drop_tables_query(tables_by_type: &BTreeMap<TableType, Vec<String>>) -> String {
    TableType::drop_order()
        .iter()
        .flat_map(|table_type| {
            tables_by_type
                .get(table_type)
                .into_iter()
                .flatten()
                .map(|name| drop_statement(*table_type, name))
        })
        .join("")
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;

    #[test]
    fn test_drop_query_orders_merge_remote_view_normal() {
        let tables = btreemap! {
            TableType::Normal => vec!["table1".to_owned()],
            TableType::View => vec!["view_table1".to_owned()],
            TableType::Remote => vec!["remote_table1".to_owned()],
            TableType::Merge => vec!["merge_table1".to_owned()],
        };
        assert_eq!(
            get_drop_tables_query(&tables),
            "DROP TABLE merge_table1;DROP TABLE remote_table1;DROP VIEW view_table1;\
             DROP TABLE table1;"
        );
    }

    #[test]
    fn test_drop_query_skips_missing_types() {
        let tables = btreemap! {
            TableType::View => vec!["view_table1".to_owned()],
            TableType::Merge => vec!["merge_table1".to_owned()],
        };
        assert_eq!(
            get_drop_tables_query(&tables),
            "DROP TABLE merge_table1;DROP VIEW view_table1;"
        );
    }

    #[test]
    fn test_drop_query_empty() {
        assert_eq!(get_drop_tables_query(&BTreeMap::new()), "");
    }
}
