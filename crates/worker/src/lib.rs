//! The worker-side task layer.
//!
//! A worker process consumes [`common::task_dtos::TaskRequest`]s from its
//! queue (the broker bridge is external) and executes them against its
//! columnar store through the [`StoreClient`] seam. Every table the tasks
//! create is named by the shared grammar, so cleanup needs nothing but a
//! context id.

pub mod catalog;
pub mod filters;
pub mod info;
pub mod sql;
pub mod store;
pub mod tables;
pub mod udfs;
pub mod views;

use std::sync::Arc;

use common::{
    task_dtos::{
        RemoteErrorKind,
        RunUdfParams,
        TaskRequest,
        TaskResponse,
        ViewSpec,
    },
    NodeId,
    NodeRole,
};
use errors::ErrorMetadataAnyhowExt;
use serde::Deserialize;

use crate::{
    catalog::CatalogSource,
    store::StoreClient,
};

/// Static identity and privacy configuration of one worker process.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub identifier: NodeId,
    pub role: NodeRole,
    pub queue_address: String,
    pub db_address: String,
}

impl WorkerConfig {
    /// Read the worker's identity from the environment. The queue address
    /// is the broker endpoint this process consumes from, advertised back
    /// to the controller through the info task.
    pub fn from_env() -> anyhow::Result<Self> {
        let identifier: NodeId = common::env::env_config(
            "WORKER_IDENTIFIER",
            "localworker".to_owned(),
        )
        .parse()?;
        let role = match common::env::env_config("WORKER_ROLE", "LOCAL".to_owned()).as_str() {
            "GLOBAL" => NodeRole::Global,
            "LOCAL" => NodeRole::Local,
            other => anyhow::bail!("Unknown worker role: {other}"),
        };
        Ok(Self {
            identifier,
            role,
            queue_address: common::knobs::RABBITMQ_ENDPOINT.clone(),
            db_address: common::env::env_config("MONETDB_ADDRESS", "localhost:50000".to_owned()),
        })
    }
}

/// Dispatches incoming task requests to their handlers and wraps the
/// outcome in the response envelope. User-actionable failures keep their
/// classification; everything else becomes an internal remote error.
pub struct WorkerTaskService {
    config: WorkerConfig,
    store: Arc<dyn StoreClient>,
    catalog: Arc<dyn CatalogSource>,
    udf_registry: Arc<udfgen::UdfRegistry>,
}

impl WorkerTaskService {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn StoreClient>,
        catalog: Arc<dyn CatalogSource>,
        udf_registry: Arc<udfgen::UdfRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            catalog,
            udf_registry,
        }
    }

    pub async fn handle(&self, request: TaskRequest) -> TaskResponse {
        tracing::debug!(
            request_id = %request.request_id,
            node_id = %self.config.identifier,
            task = %request.task,
            "Handling worker task"
        );
        match self.dispatch(&request).await {
            Ok(result) => TaskResponse::Success { result },
            Err(e) => {
                let kind = if e.is_bad_user_input() {
                    RemoteErrorKind::User
                } else {
                    errors::report_error(&e);
                    RemoteErrorKind::Internal
                };
                TaskResponse::Error {
                    kind,
                    message: e.msg().to_owned(),
                }
            },
        }
    }

    async fn dispatch(&self, request: &TaskRequest) -> anyhow::Result<serde_json::Value> {
        let params = request.params.clone();
        let result = match request.task.as_str() {
            "get_worker_info" => to_json(info::get_worker_info(&self.config))?,
            "get_worker_datasets_per_data_model" => {
                to_json(self.catalog.datasets_per_data_model().await?)?
            },
            "get_data_model_cdes" => {
                let p: DataModelParams = parse(params)?;
                to_json(self.catalog.data_model_cdes(&p.data_model).await?)?
            },
            "create_table" => {
                let p: CreateTableParams = parse(params)?;
                to_json(
                    tables::create_table(
                        self.store.as_ref(),
                        &self.config.identifier,
                        &p.context_id,
                        &p.command_id,
                        &p.schema,
                    )
                    .await?,
                )?
            },
            "insert_data_to_table" => {
                let p: InsertParams = parse(params)?;
                to_json(tables::insert_data_to_table(self.store.as_ref(), &p.table_name, &p.rows).await?)?
            },
            "create_view" => {
                let p: CreateViewParams = parse(params)?;
                to_json(
                    views::create_view(
                        self.store.as_ref(),
                        &self.config.identifier,
                        &p.context_id,
                        &p.command_id,
                        &p.base_table,
                        &p.view,
                    )
                    .await?,
                )?
            },
            "create_data_model_views" => {
                let p: CreateDataModelViewsParams = parse(params)?;
                to_json(
                    views::create_data_model_views(
                        self.store.as_ref(),
                        self.catalog.as_ref(),
                        &self.config.identifier,
                        &p.context_id,
                        &p.command_id,
                        &p.data_model,
                        &p.datasets,
                        &p.variable_groups,
                        p.filters.as_ref(),
                        p.dropna,
                        p.check_min_rows,
                    )
                    .await?,
                )?
            },
            "create_merge_table" => {
                let p: CreateMergeTableParams = parse(params)?;
                to_json(
                    tables::create_merge_table(
                        self.store.as_ref(),
                        &self.config.identifier,
                        &p.context_id,
                        &p.command_id,
                        &p.source_tables,
                    )
                    .await?,
                )?
            },
            "create_remote_table" => {
                let p: CreateRemoteTableParams = parse(params)?;
                to_json(
                    tables::create_remote_table(
                        self.store.as_ref(),
                        &p.table_name,
                        &p.schema,
                        &p.source_db_address,
                    )
                    .await?,
                )?
            },
            "get_table_data" => {
                let p: TableNameParams = parse(params)?;
                to_json(tables::get_table_data(self.store.as_ref(), &p.table_name).await?)?
            },
            "run_udf" => {
                let p: RunUdfParams = parse(params)?;
                to_json(
                    udfs::run_udf(
                        self.store.as_ref(),
                        &self.udf_registry,
                        &self.config.identifier,
                        &request.request_id,
                        p,
                    )
                    .await?,
                )?
            },
            "get_run_udf_query" => {
                let p: RunUdfParams = parse(params)?;
                to_json(udfs::get_run_udf_query(
                    &self.udf_registry,
                    &self.config.identifier,
                    &request.request_id,
                    p,
                )?)?
            },
            "cleanup" => {
                let p: CleanupParams = parse(params)?;
                to_json(tables::cleanup(self.store.as_ref(), &p.context_id).await?)?
            },
            task => anyhow::bail!("Unknown worker task: {task}"),
        };
        Ok(result)
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: serde_json::Value) -> anyhow::Result<T> {
    serde_json::from_value(params).map_err(|e| {
        anyhow::Error::from(errors::ErrorMetadata::bad_request(
            "MalformedTaskParams",
            format!("Task parameters did not parse: {e}"),
        ))
    })
}

fn to_json<T: serde::Serialize>(value: T) -> anyhow::Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

#[derive(Deserialize)]
struct DataModelParams {
    data_model: common::DataModelId,
}

#[derive(Deserialize)]
struct CreateTableParams {
    context_id: common::ContextId,
    command_id: common::CommandId,
    schema: common::TableSchema,
}

#[derive(Deserialize)]
struct InsertParams {
    table_name: String,
    rows: Vec<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct CreateViewParams {
    context_id: common::ContextId,
    command_id: common::CommandId,
    base_table: String,
    view: ViewSpec,
}

#[derive(Deserialize)]
struct CreateDataModelViewsParams {
    context_id: common::ContextId,
    command_id: common::CommandId,
    data_model: common::DataModelId,
    datasets: Vec<String>,
    variable_groups: Vec<Vec<String>>,
    filters: Option<serde_json::Value>,
    dropna: bool,
    check_min_rows: bool,
}

#[derive(Deserialize)]
struct CreateMergeTableParams {
    context_id: common::ContextId,
    command_id: common::CommandId,
    source_tables: Vec<common::TableInfo>,
}

#[derive(Deserialize)]
struct CreateRemoteTableParams {
    table_name: String,
    schema: common::TableSchema,
    source_db_address: String,
}

#[derive(Deserialize)]
struct TableNameParams {
    table_name: String,
}

#[derive(Deserialize)]
struct CleanupParams {
    context_id: common::ContextId,
}
