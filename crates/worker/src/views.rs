//! View creation over the worker's primary data.

use common::{
    knobs::MINIMUM_ROW_COUNT,
    task_dtos::ViewSpec,
    ColumnInfo,
    CommandId,
    ContextId,
    DType,
    DataModelId,
    NodeId,
    TableInfo,
    TableName,
    TableSchema,
    TableType,
};
use errors::ErrorMetadata;
use itertools::Itertools;

use crate::{
    catalog::CatalogSource,
    filters::build_filter_clause,
    sql::{
        quote_ident,
        sql_literal,
    },
    store::StoreClient,
};

async fn create_view_table(
    store: &dyn StoreClient,
    name: &str,
    base_table: &str,
    columns: &[String],
    where_clauses: &[String],
    check_min_rows: bool,
) -> anyhow::Result<()> {
    let select_cols = columns.iter().map(|c| quote_ident(c)).join(", ");
    let mut sql = format!("CREATE VIEW {name} AS SELECT {select_cols} FROM {base_table}");
    if !where_clauses.is_empty() {
        sql.push_str(&format!(" WHERE {}", where_clauses.iter().join(" AND ")));
    }
    sql.push(';');
    store.execute(&sql).await?;

    if check_min_rows {
        let count = store
            .query(&format!("SELECT COUNT(*) FROM {name};"))
            .await?
            .single_count()?;
        let minimum = *MINIMUM_ROW_COUNT as u64;
        if count < minimum {
            return Err(ErrorMetadata::bad_user_input(
                "InsufficientData",
                format!(
                    "The data view has {count} rows, fewer than the minimum row count \
                     threshold of {minimum}. The computation cannot run on this data \
                     selection."
                ),
            )
            .into());
        }
    }
    Ok(())
}

pub async fn create_view(
    store: &dyn StoreClient,
    node_id: &NodeId,
    context_id: &ContextId,
    command_id: &CommandId,
    base_table: &str,
    view: &ViewSpec,
) -> anyhow::Result<TableInfo> {
    let name = TableName::new(
        TableType::View,
        node_id.clone(),
        context_id.clone(),
        command_id.clone(),
        "0",
    )?
    .to_string();
    let mut where_clauses = Vec::new();
    if let Some(filters) = &view.filters {
        where_clauses.push(build_filter_clause(filters)?);
    }
    if view.dropna {
        where_clauses.extend(
            view.columns
                .iter()
                .map(|c| format!("{} IS NOT NULL", quote_ident(c))),
        );
    }
    create_view_table(
        store,
        &name,
        base_table,
        &view.columns,
        &where_clauses,
        view.check_min_rows,
    )
    .await?;
    let schema = store.table_schema(&name).await?;
    Ok(TableInfo::new(name, schema, TableType::View))
}

/// Create one view per variable group over the primary data of
/// `data_model`, restricted to this worker's slice of `datasets`. The
/// schemas come from the CDE definitions, so no store introspection is
/// needed.
pub async fn create_data_model_views(
    store: &dyn StoreClient,
    catalog: &dyn CatalogSource,
    node_id: &NodeId,
    context_id: &ContextId,
    command_id: &CommandId,
    data_model: &DataModelId,
    datasets: &[String],
    variable_groups: &[Vec<String>],
    filters: Option<&serde_json::Value>,
    dropna: bool,
    check_min_rows: bool,
) -> anyhow::Result<Vec<TableInfo>> {
    anyhow::ensure!(!datasets.is_empty(), "No datasets requested for the data model views");
    let cdes = catalog.data_model_cdes(data_model).await?;
    let base_table = catalog.primary_data_table(data_model);

    let mut views = Vec::with_capacity(variable_groups.len());
    for (group_idx, variables) in variable_groups.iter().enumerate() {
        let mut columns = vec!["row_id".to_owned()];
        let mut schema = vec![ColumnInfo::new("row_id", DType::Int)];
        for variable in variables {
            let cde = cdes.get(variable).ok_or_else(|| {
                ErrorMetadata::bad_user_input(
                    "UnknownVariable",
                    format!("Variable {variable} is not part of data model {data_model}"),
                )
            })?;
            columns.push(variable.clone());
            schema.push(ColumnInfo::new(variable.clone(), cde.sql_type));
        }

        let mut where_clauses = vec![format!(
            "\"dataset\" IN ({})",
            datasets
                .iter()
                .map(|ds| sql_literal(&serde_json::Value::String(ds.clone())))
                .join(","),
        )];
        if let Some(filters) = filters {
            where_clauses.push(build_filter_clause(filters)?);
        }
        if dropna {
            where_clauses.extend(
                variables
                    .iter()
                    .map(|c| format!("{} IS NOT NULL", quote_ident(c))),
            );
        }

        let name = TableName::new(
            TableType::View,
            node_id.clone(),
            context_id.clone(),
            command_id.clone(),
            group_idx.to_string(),
        )?
        .to_string();
        create_view_table(store, &name, &base_table, &columns, &where_clauses, check_min_rows)
            .await?;
        views.push(TableInfo::new(
            name,
            TableSchema::new(schema),
            TableType::View,
        ));
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::Mutex,
    };

    use async_trait::async_trait;
    use common::{
        CommonDataElement,
        CommonDataElements,
        DATASET_CDE_CODE,
    };
    use errors::ErrorMetadataAnyhowExt;
    use maplit::btreemap;

    use crate::store::Rows;

    use super::*;

    /// Records the SQL it executes and answers every count query with a
    /// fixed number.
    struct RecordingStore {
        executed: Mutex<Vec<String>>,
        count: u64,
    }

    impl RecordingStore {
        fn new(count: u64) -> Self {
            Self {
                executed: Mutex::new(Vec::new()),
                count,
            }
        }
    }

    #[async_trait]
    impl StoreClient for RecordingStore {
        async fn execute(&self, sql: &str) -> anyhow::Result<()> {
            self.executed.lock().unwrap().push(sql.to_owned());
            Ok(())
        }

        async fn query(&self, _sql: &str) -> anyhow::Result<Rows> {
            Ok(Rows {
                columns: vec!["count".to_owned()],
                rows: vec![vec![serde_json::json!(self.count)]],
            })
        }

        async fn list_tables(&self, _fragment: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }

        async fn table_schema(&self, _table_name: &str) -> anyhow::Result<TableSchema> {
            Ok(TableSchema::new(vec![]))
        }
    }

    struct StaticCatalog;

    #[async_trait]
    impl CatalogSource for StaticCatalog {
        async fn datasets_per_data_model(
            &self,
        ) -> anyhow::Result<BTreeMap<DataModelId, BTreeMap<String, String>>> {
            Ok(BTreeMap::new())
        }

        async fn data_model_cdes(
            &self,
            _data_model: &DataModelId,
        ) -> anyhow::Result<CommonDataElements> {
            Ok(CommonDataElements::new(btreemap! {
                "age".to_owned() => CommonDataElement {
                    code: "age".to_owned(),
                    label: "Age".to_owned(),
                    sql_type: DType::Int,
                    is_categorical: false,
                    enumerations: None,
                    min: None,
                    max: None,
                },
                DATASET_CDE_CODE.to_owned() => CommonDataElement {
                    code: DATASET_CDE_CODE.to_owned(),
                    label: "Dataset".to_owned(),
                    sql_type: DType::Str,
                    is_categorical: true,
                    enumerations: Some(BTreeMap::new()),
                    min: None,
                    max: None,
                },
            }))
        }
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn test_data_model_view_sql() {
        let store = RecordingStore::new(100);
        let views = block_on(create_data_model_views(
            &store,
            &StaticCatalog,
            &"localnode1".parse().unwrap(),
            &"ctx1".parse().unwrap(),
            &"0".parse().unwrap(),
            &"dementia:0.1".parse().unwrap(),
            &["ds1".to_owned(), "ds2".to_owned()],
            &[vec!["age".to_owned()]],
            None,
            true,
            true,
        ))
        .unwrap();

        assert_eq!(views.len(), 1);
        assert_eq!(views[0].name, "view_localnode1_ctx1_0_0");
        assert_eq!(
            views[0].schema.columns,
            vec![
                ColumnInfo::new("row_id", DType::Int),
                ColumnInfo::new("age", DType::Int),
            ]
        );
        let executed = store.executed.lock().unwrap();
        assert_eq!(
            executed[0],
            "CREATE VIEW view_localnode1_ctx1_0_0 AS SELECT \"row_id\", \"age\" FROM \
             \"dementia:0.1\".\"primary_data\" WHERE \"dataset\" IN ('ds1','ds2') AND \
             \"age\" IS NOT NULL;"
        );
    }

    #[test]
    fn test_min_row_count_violation_is_a_user_error() {
        let store = RecordingStore::new(3);
        let err = block_on(create_data_model_views(
            &store,
            &StaticCatalog,
            &"localnode1".parse().unwrap(),
            &"ctx1".parse().unwrap(),
            &"0".parse().unwrap(),
            &"dementia:0.1".parse().unwrap(),
            &["ds1".to_owned()],
            &[vec!["age".to_owned()]],
            None,
            false,
            true,
        ))
        .unwrap_err();
        assert!(err.is_bad_user_input());
        assert!(err.msg().contains("minimum row count"));
    }

    #[test]
    fn test_unknown_variable_is_a_user_error() {
        let store = RecordingStore::new(100);
        let err = block_on(create_data_model_views(
            &store,
            &StaticCatalog,
            &"localnode1".parse().unwrap(),
            &"ctx1".parse().unwrap(),
            &"0".parse().unwrap(),
            &"dementia:0.1".parse().unwrap(),
            &["ds1".to_owned()],
            &[vec!["weight".to_owned()]],
            None,
            true,
            true,
        ))
        .unwrap_err();
        assert!(err.is_bad_user_input());
        assert!(err.msg().contains("weight"));
    }
}
