use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use common::{
    knobs::{
        CELERY_RUN_UDF_TASK_TIMEOUT,
        CELERY_TASKS_TIMEOUT,
    },
    CommandId,
    CommonDataElements,
    ContextId,
    DataModelId,
    NodeId,
    RequestId,
    TableData,
    TableInfo,
    TableSchema,
    WorkerInfo,
};
use common::task_dtos::{
    RunUdfParams,
    TaskRequest,
    UdfArgument,
    UdfResult,
    ViewSpec,
};
use serde_json::json;

use crate::channel::TaskChannel;

/// The narrow, typed surface of one worker. Every method is one task
/// submission with a bounded timeout; results and failures come back
/// through the channel's error mapping.
#[derive(Clone)]
pub struct WorkerClient {
    node_id: NodeId,
    queue_address: String,
    request_id: RequestId,
    channel: Arc<dyn TaskChannel>,
    tasks_timeout: Duration,
    run_udf_timeout: Duration,
}

impl WorkerClient {
    pub fn new(
        node_id: NodeId,
        queue_address: impl Into<String>,
        request_id: RequestId,
        channel: Arc<dyn TaskChannel>,
    ) -> Self {
        Self {
            node_id,
            queue_address: queue_address.into(),
            request_id,
            channel,
            tasks_timeout: *CELERY_TASKS_TIMEOUT,
            run_udf_timeout: *CELERY_RUN_UDF_TASK_TIMEOUT,
        }
    }

    /// Build a client for a worker known only by address, before its id has
    /// been learned from the info task. Used by the landscape aggregator.
    pub fn for_address(
        queue_address: impl Into<String>,
        request_id: RequestId,
        channel: Arc<dyn TaskChannel>,
    ) -> Self {
        Self::new(
            NodeId::try_from("unknown".to_owned()).expect("static id is valid"),
            queue_address,
            request_id,
            channel,
        )
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn queue_address(&self) -> &str {
        &self.queue_address
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        task: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> anyhow::Result<T> {
        tracing::debug!(
            request_id = %self.request_id,
            node_id = %self.node_id,
            task,
            "Submitting worker task"
        );
        let request = TaskRequest {
            task: task.to_owned(),
            request_id: self.request_id.clone(),
            params,
        };
        let result = self
            .channel
            .call(&self.queue_address, request, timeout)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn get_worker_info(&self) -> anyhow::Result<WorkerInfo> {
        self.call("get_worker_info", json!({}), self.tasks_timeout)
            .await
    }

    /// Datasets advertised by this worker, per data model, as
    /// `code -> label` pairs.
    pub async fn get_datasets_per_data_model(
        &self,
    ) -> anyhow::Result<BTreeMap<DataModelId, BTreeMap<String, String>>> {
        self.call(
            "get_worker_datasets_per_data_model",
            json!({}),
            self.tasks_timeout,
        )
        .await
    }

    pub async fn get_data_model_cdes(
        &self,
        data_model: &DataModelId,
    ) -> anyhow::Result<CommonDataElements> {
        self.call(
            "get_data_model_cdes",
            json!({ "data_model": data_model }),
            self.tasks_timeout,
        )
        .await
    }

    pub async fn create_table(
        &self,
        context_id: &ContextId,
        command_id: &CommandId,
        schema: &TableSchema,
    ) -> anyhow::Result<TableInfo> {
        self.call(
            "create_table",
            json!({
                "context_id": context_id,
                "command_id": command_id,
                "schema": schema,
            }),
            self.tasks_timeout,
        )
        .await
    }

    pub async fn insert_rows(
        &self,
        table_name: &str,
        rows: Vec<Vec<serde_json::Value>>,
    ) -> anyhow::Result<()> {
        self.call(
            "insert_data_to_table",
            json!({ "table_name": table_name, "rows": rows }),
            self.tasks_timeout,
        )
        .await
    }

    /// Create a view over an existing table.
    pub async fn create_view(
        &self,
        context_id: &ContextId,
        command_id: &CommandId,
        base_table: &str,
        view: &ViewSpec,
    ) -> anyhow::Result<TableInfo> {
        self.call(
            "create_view",
            json!({
                "context_id": context_id,
                "command_id": command_id,
                "base_table": base_table,
                "view": view,
            }),
            self.tasks_timeout,
        )
        .await
    }

    /// Create one view per variable group over the worker's primary data
    /// for `data_model`, restricted to `datasets`. Views enforce the
    /// privacy floor when `check_min_rows` is set.
    pub async fn create_data_model_views(
        &self,
        context_id: &ContextId,
        command_id: &CommandId,
        data_model: &DataModelId,
        datasets: &[String],
        variable_groups: &[Vec<String>],
        filters: Option<&serde_json::Value>,
        dropna: bool,
        check_min_rows: bool,
    ) -> anyhow::Result<Vec<TableInfo>> {
        self.call(
            "create_data_model_views",
            json!({
                "context_id": context_id,
                "command_id": command_id,
                "data_model": data_model,
                "datasets": datasets,
                "variable_groups": variable_groups,
                "filters": filters,
                "dropna": dropna,
                "check_min_rows": check_min_rows,
            }),
            self.tasks_timeout,
        )
        .await
    }

    /// Create a merge table that reads as the union of `source_tables`,
    /// which must share one schema.
    pub async fn create_merge_table(
        &self,
        context_id: &ContextId,
        command_id: &CommandId,
        source_tables: &[TableInfo],
    ) -> anyhow::Result<TableInfo> {
        self.call(
            "create_merge_table",
            json!({
                "context_id": context_id,
                "command_id": command_id,
                "source_tables": source_tables,
            }),
            self.tasks_timeout,
        )
        .await
    }

    /// Mount a zero-copy pointer to a table living on another worker. The
    /// table keeps the exact name it has at the source so that any
    /// participant can find it without coordination.
    pub async fn create_remote_table(
        &self,
        table_name: &str,
        schema: &TableSchema,
        source_db_address: &str,
    ) -> anyhow::Result<()> {
        self.call(
            "create_remote_table",
            json!({
                "table_name": table_name,
                "schema": schema,
                "source_db_address": source_db_address,
            }),
            self.tasks_timeout,
        )
        .await
    }

    pub async fn get_table_data(&self, table_name: &str) -> anyhow::Result<TableData> {
        self.call(
            "get_table_data",
            json!({ "table_name": table_name }),
            self.tasks_timeout,
        )
        .await
    }

    pub async fn run_udf(
        &self,
        context_id: &ContextId,
        command_id: &CommandId,
        func_name: &str,
        positional_args: Vec<UdfArgument>,
        keyword_args: BTreeMap<String, UdfArgument>,
        use_smpc: bool,
        output_schema: Option<TableSchema>,
    ) -> anyhow::Result<Vec<UdfResult>> {
        let params = RunUdfParams {
            context_id: context_id.clone(),
            command_id: command_id.clone(),
            func_name: func_name.to_owned(),
            positional_args,
            keyword_args,
            use_smpc,
            output_schema,
        };
        self.call(
            "run_udf",
            serde_json::to_value(&params)?,
            self.run_udf_timeout,
        )
        .await
    }

    /// Fetch the SQL statements a `run_udf` call would execute, without
    /// executing them. Debugging aid.
    pub async fn get_run_udf_query(
        &self,
        context_id: &ContextId,
        command_id: &CommandId,
        func_name: &str,
        positional_args: Vec<UdfArgument>,
        keyword_args: BTreeMap<String, UdfArgument>,
        use_smpc: bool,
    ) -> anyhow::Result<Vec<String>> {
        let params = RunUdfParams {
            context_id: context_id.clone(),
            command_id: command_id.clone(),
            func_name: func_name.to_owned(),
            positional_args,
            keyword_args,
            use_smpc,
            output_schema: None,
        };
        self.call(
            "get_run_udf_query",
            serde_json::to_value(&params)?,
            self.tasks_timeout,
        )
        .await
    }

    /// Drop every artifact on this worker whose name carries `context_id`.
    pub async fn cleanup(&self, context_id: &ContextId) -> anyhow::Result<()> {
        self.call(
            "cleanup",
            json!({ "context_id": context_id }),
            self.tasks_timeout,
        )
        .await
    }
}
