//! The algorithm executor: drives one algorithm's step plan across the
//! selected workers.
//!
//! Each step allocates a fresh command id, resolves its inputs to concrete
//! tables on the workers it runs on, fans the UDF call out, and applies
//! the declared sharing policy to the outputs: local outputs become a
//! merge table on the global worker (through zero-copy remote tables), a
//! global output becomes a remote table on every local, and
//! secure-transfer outputs go through the SMPC cluster when it is enabled.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

use algorithms::{
    AlgorithmPlan,
    Step,
    StepInput,
    StepTarget,
};
use common::{
    knobs::{
        CELERY_RUN_UDF_TASK_TIMEOUT,
        CELERY_TASKS_TIMEOUT,
        STEP_RETRY_LIMIT,
    },
    task_dtos::{
        SmpcTablesInfo,
        UdfArgument,
        UdfResult,
    },
    CommandId,
    ContextId,
    DataModelId,
    NodeId,
    RequestId,
    TableData,
    TableInfo,
    TableSchema,
    WorkerInfo,
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use futures::future::join_all;
use tokio::sync::mpsc;
use worker_client::WorkerClient;

use crate::{
    cleaner::{
        CleanupEvent,
        NodeRef,
    },
    smpc::{
        wait_for_smpc_result,
        SmpcCluster,
        SmpcOperation,
        SmpcTableRef,
    },
};

#[derive(Clone)]
pub struct WorkerHandle {
    pub info: WorkerInfo,
    pub client: WorkerClient,
}

impl WorkerHandle {
    fn node_ref(&self) -> NodeRef {
        NodeRef {
            node_id: self.info.id.clone(),
            queue_address: self.info.queue_address.clone(),
        }
    }
}

/// Where one step output currently lives. "Not shared" outputs stay on the
/// producing side; sharing converts between the local and global forms.
#[derive(Clone, Debug)]
enum StepValue {
    LocalTables(BTreeMap<NodeId, TableInfo>),
    LocalSmpc(BTreeMap<NodeId, SmpcTablesInfo>),
    GlobalTable(TableInfo),
    GlobalSmpc(SmpcTablesInfo),
}

pub struct ExecutionEngine {
    request_id: RequestId,
    context_id: ContextId,
    data_model: DataModelId,
    filters: Option<serde_json::Value>,
    global: WorkerHandle,
    locals: Vec<WorkerHandle>,
    datasets_per_local: BTreeMap<NodeId, Vec<String>>,
    use_smpc: bool,
    smpc: Arc<dyn SmpcCluster>,
    cleanup_events: mpsc::UnboundedSender<CleanupEvent>,
    command_seq: AtomicU64,
}

fn plan_error(msg: String) -> anyhow::Error {
    ErrorMetadata::udf_contract_violation("InvalidStepPlan", msg).into()
}

impl ExecutionEngine {
    pub fn new(
        request_id: RequestId,
        context_id: ContextId,
        data_model: DataModelId,
        filters: Option<serde_json::Value>,
        global: WorkerHandle,
        locals: Vec<WorkerHandle>,
        datasets_per_local: BTreeMap<NodeId, Vec<String>>,
        use_smpc: bool,
        smpc: Arc<dyn SmpcCluster>,
        cleanup_events: mpsc::UnboundedSender<CleanupEvent>,
    ) -> Self {
        Self {
            request_id,
            context_id,
            data_model,
            filters,
            global,
            locals,
            datasets_per_local,
            use_smpc,
            smpc,
            cleanup_events,
            command_seq: AtomicU64::new(0),
        }
    }

    pub fn context_id(&self) -> &ContextId {
        &self.context_id
    }

    fn fresh_command_id(&self) -> CommandId {
        CommandId::from_sequence(self.command_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn touch(&self, node: NodeRef) {
        let _ = self.cleanup_events.send(CleanupEvent::NodeTouched {
            context_id: self.context_id.clone(),
            node,
        });
    }

    fn local(&self, node_id: &NodeId) -> anyhow::Result<&WorkerHandle> {
        self.locals
            .iter()
            .find(|w| w.info.id == *node_id)
            .ok_or_else(|| anyhow::anyhow!("Worker {node_id} is not part of this execution"))
    }

    /// Run the whole plan and fetch the terminal step's output table.
    pub async fn run(&self, plan: &AlgorithmPlan) -> anyhow::Result<TableData> {
        let step_timeout = *CELERY_RUN_UDF_TASK_TIMEOUT + *CELERY_TASKS_TIMEOUT;
        let views = self.create_data_model_views(plan).await?;

        let mut step_values: Vec<Vec<StepValue>> = Vec::with_capacity(plan.steps.len());
        for (step_idx, step) in plan.steps.iter().enumerate() {
            tracing::info!(
                request_id = %self.request_id,
                context_id = %self.context_id,
                step = step_idx,
                func_name = %step.func_name,
                "Dispatching step"
            );
            let outputs = tokio::time::timeout(step_timeout, async {
                match step.target {
                    StepTarget::LocalWorkers => {
                        self.run_local_step(step, &views, &step_values).await
                    },
                    StepTarget::GlobalWorker => self.run_global_step(step, &step_values).await,
                }
            })
            .await
            .map_err(|_| {
                ErrorMetadata::timeout(
                    "StepTimeout",
                    format!(
                        "Step {step_idx} ({}) did not finish within {step_timeout:?}",
                        step.func_name
                    ),
                )
            })??;
            step_values.push(outputs);
        }

        let terminal = step_values
            .last()
            .and_then(|outputs| outputs.first())
            .ok_or_else(|| plan_error("The plan has no steps".to_owned()))?;
        let StepValue::GlobalTable(info) = terminal else {
            return Err(plan_error(
                "The terminal step's first output must be a table on the global worker"
                    .to_owned(),
            ));
        };
        self.global.client.get_table_data(&info.name).await
    }

    /// One data view per variable group, on every participating local.
    async fn create_data_model_views(
        &self,
        plan: &AlgorithmPlan,
    ) -> anyhow::Result<Vec<BTreeMap<NodeId, TableInfo>>> {
        let command_id = self.fresh_command_id();
        let futures = self.locals.iter().map(|worker| {
            let command_id = command_id.clone();
            async move {
                let datasets = self
                    .datasets_per_local
                    .get(&worker.info.id)
                    .cloned()
                    .unwrap_or_default();
                let views = worker
                    .client
                    .create_data_model_views(
                        &self.context_id,
                        &command_id,
                        &self.data_model,
                        &datasets,
                        &plan.variable_groups,
                        self.filters.as_ref(),
                        plan.dropna,
                        plan.check_min_rows,
                    )
                    .await?;
                anyhow::Ok((worker.info.id.clone(), views))
            }
        });
        let mut per_group: Vec<BTreeMap<NodeId, TableInfo>> =
            vec![BTreeMap::new(); plan.variable_groups.len()];
        for result in join_all(futures).await {
            let (node_id, views) = result?;
            anyhow::ensure!(
                views.len() == per_group.len(),
                "Worker {node_id} returned {} views for {} variable groups",
                views.len(),
                per_group.len(),
            );
            for (group, view) in views.into_iter().enumerate() {
                per_group[group].insert(node_id.clone(), view);
            }
        }
        Ok(per_group)
    }

    fn resolve_local_input(
        &self,
        input: &StepInput,
        node_id: &NodeId,
        views: &[BTreeMap<NodeId, TableInfo>],
        step_values: &[Vec<StepValue>],
    ) -> anyhow::Result<UdfArgument> {
        match input {
            StepInput::Literal(value) => Ok(UdfArgument::Literal {
                value: value.clone(),
            }),
            StepInput::DataView { group } => {
                let view = views
                    .get(*group)
                    .and_then(|group_views| group_views.get(node_id))
                    .ok_or_else(|| {
                        plan_error(format!("No data view for group {group} on {node_id}"))
                    })?;
                Ok(UdfArgument::Table { info: view.clone() })
            },
            StepInput::Previous { step, output } => {
                let value = step_values
                    .get(*step)
                    .and_then(|outputs| outputs.get(*output))
                    .ok_or_else(|| {
                        plan_error(format!("Step input references missing output {step}/{output}"))
                    })?;
                match value {
                    StepValue::LocalTables(tables) => {
                        let info = tables.get(node_id).ok_or_else(|| {
                            plan_error(format!("Output {step}/{output} is missing on {node_id}"))
                        })?;
                        Ok(UdfArgument::Table { info: info.clone() })
                    },
                    StepValue::LocalSmpc(bundles) => {
                        let info = bundles.get(node_id).ok_or_else(|| {
                            plan_error(format!("Output {step}/{output} is missing on {node_id}"))
                        })?;
                        Ok(UdfArgument::SmpcTables { info: info.clone() })
                    },
                    StepValue::GlobalTable(_) | StepValue::GlobalSmpc(_) => {
                        Err(plan_error(format!(
                            "Output {step}/{output} lives on the global worker and was not \
                             shared to the locals"
                        )))
                    },
                }
            },
        }
    }

    fn resolve_global_input(
        &self,
        input: &StepInput,
        step_values: &[Vec<StepValue>],
    ) -> anyhow::Result<UdfArgument> {
        match input {
            StepInput::Literal(value) => Ok(UdfArgument::Literal {
                value: value.clone(),
            }),
            StepInput::DataView { .. } => Err(plan_error(
                "Data views live on the local workers and cannot feed a global step".to_owned(),
            )),
            StepInput::Previous { step, output } => {
                let value = step_values
                    .get(*step)
                    .and_then(|outputs| outputs.get(*output))
                    .ok_or_else(|| {
                        plan_error(format!("Step input references missing output {step}/{output}"))
                    })?;
                match value {
                    StepValue::GlobalTable(info) => Ok(UdfArgument::Table { info: info.clone() }),
                    StepValue::GlobalSmpc(info) => Ok(UdfArgument::SmpcTables {
                        info: info.clone(),
                    }),
                    StepValue::LocalTables(_) | StepValue::LocalSmpc(_) => {
                        Err(plan_error(format!(
                            "Output {step}/{output} lives on the local workers and was not \
                             shared to the global"
                        )))
                    },
                }
            },
        }
    }

    /// Fan a UDF call out to `workers` and wait for all of them. Workers
    /// failing with a retryable error are re-dispatched under a fresh
    /// command id up to the configured bound; command ids are never
    /// reused.
    async fn fan_out_udf(
        &self,
        step: &Step,
        workers: Vec<(&WorkerHandle, Vec<(String, UdfArgument)>)>,
        output_schema: Option<TableSchema>,
    ) -> anyhow::Result<BTreeMap<NodeId, Vec<UdfResult>>> {
        let mut pending = workers;
        let mut results: BTreeMap<NodeId, Vec<UdfResult>> = BTreeMap::new();
        let mut attempts = 0u32;
        loop {
            let command_id = self.fresh_command_id();
            let futures = pending.iter().map(|(worker, kwargs)| {
                let command_id = command_id.clone();
                let output_schema = output_schema.clone();
                async move {
                    let result = worker
                        .client
                        .run_udf(
                            &self.context_id,
                            &command_id,
                            &step.func_name,
                            Vec::new(),
                            kwargs.iter().cloned().collect(),
                            self.use_smpc,
                            output_schema,
                        )
                        .await;
                    (worker.info.id.clone(), result)
                }
            });

            let mut retryable: Vec<NodeId> = Vec::new();
            let mut first_error: Option<anyhow::Error> = None;
            for (node_id, result) in join_all(futures).await {
                match result {
                    Ok(outputs) => {
                        results.insert(node_id, outputs);
                    },
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(
                            request_id = %self.request_id,
                            node_id = %node_id,
                            func_name = %step.func_name,
                            "Step failed on worker, may retry: {e:#}"
                        );
                        retryable.push(node_id);
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    },
                    Err(e) => return Err(e),
                }
            }
            if retryable.is_empty() {
                return Ok(results);
            }
            attempts += 1;
            if attempts > *STEP_RETRY_LIMIT {
                return Err(first_error.unwrap_or_else(|| {
                    anyhow::anyhow!("Step failed on workers {retryable:?}")
                }));
            }
            pending.retain(|(worker, _)| retryable.contains(&worker.info.id));
        }
    }

    async fn run_local_step(
        &self,
        step: &Step,
        views: &[BTreeMap<NodeId, TableInfo>],
        step_values: &[Vec<StepValue>],
    ) -> anyhow::Result<Vec<StepValue>> {
        let mut workers = Vec::with_capacity(self.locals.len());
        for worker in &self.locals {
            let kwargs = step
                .keyword_args
                .iter()
                .map(|(name, input)| {
                    Ok((
                        name.clone(),
                        self.resolve_local_input(input, &worker.info.id, views, step_values)?,
                    ))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            workers.push((worker, kwargs));
        }
        let output_schema = step
            .output_schema
            .as_ref()
            .map(|schema| to_table_schema(schema));
        let results = self.fan_out_udf(step, workers, output_schema).await?;

        let output_count = step.share_outputs.len();
        let mut outputs = Vec::with_capacity(output_count);
        for (output_idx, share) in step.share_outputs.iter().enumerate() {
            let mut tables: BTreeMap<NodeId, TableInfo> = BTreeMap::new();
            let mut bundles: BTreeMap<NodeId, SmpcTablesInfo> = BTreeMap::new();
            for (node_id, worker_results) in &results {
                let result = worker_results.get(output_idx).ok_or_else(|| {
                    plan_error(format!(
                        "Worker {node_id} returned fewer outputs than step {} declares",
                        step.func_name
                    ))
                })?;
                match result {
                    UdfResult::Table { info } => {
                        tables.insert(node_id.clone(), info.clone());
                    },
                    UdfResult::SmpcTables { info } => {
                        bundles.insert(node_id.clone(), info.clone());
                    },
                }
            }
            anyhow::ensure!(
                tables.is_empty() || bundles.is_empty(),
                "Workers disagree on the shape of output {output_idx} of {}",
                step.func_name,
            );
            let value = match (share, bundles.is_empty()) {
                (false, true) => StepValue::LocalTables(tables),
                (false, false) => StepValue::LocalSmpc(bundles),
                (true, true) => self.share_locals_to_global(tables).await?,
                (true, false) => self.share_smpc_to_global(bundles).await?,
            };
            outputs.push(value);
        }
        Ok(outputs)
    }

    async fn run_global_step(
        &self,
        step: &Step,
        step_values: &[Vec<StepValue>],
    ) -> anyhow::Result<Vec<StepValue>> {
        let kwargs = step
            .keyword_args
            .iter()
            .map(|(name, input)| {
                Ok((name.clone(), self.resolve_global_input(input, step_values)?))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let output_schema = step
            .output_schema
            .as_ref()
            .map(|schema| to_table_schema(schema));
        let results = self
            .fan_out_udf(step, vec![(&self.global, kwargs)], output_schema)
            .await?;
        let worker_results = results
            .get(&self.global.info.id)
            .ok_or_else(|| anyhow::anyhow!("The global worker returned no results"))?;

        let mut outputs = Vec::with_capacity(step.share_outputs.len());
        for (output_idx, share) in step.share_outputs.iter().enumerate() {
            let result = worker_results.get(output_idx).ok_or_else(|| {
                plan_error(format!(
                    "The global worker returned fewer outputs than step {} declares",
                    step.func_name
                ))
            })?;
            let UdfResult::Table { info } = result else {
                return Err(plan_error(format!(
                    "Sharing a secure-transfer output of a global step is not supported \
                     (step {})",
                    step.func_name
                )));
            };
            let value = if *share {
                self.share_global_to_locals(info).await?
            } else {
                StepValue::GlobalTable(info.clone())
            };
            outputs.push(value);
        }
        Ok(outputs)
    }

    /// Locals-to-global sharing: mount every local output on the global
    /// worker as a remote table and union them in a merge table.
    async fn share_locals_to_global(
        &self,
        tables: BTreeMap<NodeId, TableInfo>,
    ) -> anyhow::Result<StepValue> {
        let mut remote_infos = Vec::with_capacity(tables.len());
        for (node_id, info) in &tables {
            let local = self.local(node_id)?;
            self.global
                .client
                .create_remote_table(&info.name, &info.schema, &local.info.db_address)
                .await?;
            self.touch(self.global.node_ref());
            remote_infos.push(TableInfo::new(
                info.name.clone(),
                info.schema.clone(),
                common::TableType::Remote,
            ));
        }
        let command_id = self.fresh_command_id();
        let merge = self
            .global
            .client
            .create_merge_table(&self.context_id, &command_id, &remote_infos)
            .await?;
        Ok(StepValue::GlobalTable(merge))
    }

    /// Global-to-locals sharing: mount the global output on every local
    /// worker as a remote table.
    async fn share_global_to_locals(&self, info: &TableInfo) -> anyhow::Result<StepValue> {
        let mut tables = BTreeMap::new();
        for local in &self.locals {
            local
                .client
                .create_remote_table(&info.name, &info.schema, &self.global.info.db_address)
                .await?;
            self.touch(local.node_ref());
            tables.insert(
                local.info.id.clone(),
                TableInfo::new(
                    info.name.clone(),
                    info.schema.clone(),
                    common::TableType::Remote,
                ),
            );
        }
        Ok(StepValue::LocalTables(tables))
    }

    /// The SMPC path: operation bundles go to the cluster; the template
    /// plus the per-operation results are materialized on the global
    /// worker for the downstream step.
    async fn share_smpc_to_global(
        &self,
        bundles: BTreeMap<NodeId, SmpcTablesInfo>,
    ) -> anyhow::Result<StepValue> {
        let (first_node, first_bundle) = bundles
            .iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No SMPC bundles to share"))?;

        // The template is zeroed data, identical on every worker; fetch it
        // once.
        let template_data = self
            .local(first_node)?
            .client
            .get_table_data(&first_bundle.template.name)
            .await?;
        let template_json = template_data.column("secure_transfer")?.values[0]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("The SMPC template cell is not text"))?
            .to_owned();

        let mut op_jobs: Vec<(SmpcOperation, String)> = Vec::new();
        for (operation, pick) in [
            (SmpcOperation::Sum, sum_table as OpPick),
            (SmpcOperation::Min, min_table as OpPick),
            (SmpcOperation::Max, max_table as OpPick),
        ] {
            let mut refs = Vec::new();
            for (node_id, bundle) in &bundles {
                if let Some(table) = pick(bundle) {
                    let local = self.local(node_id)?;
                    refs.push(SmpcTableRef {
                        node_id: node_id.clone(),
                        queue_address: local.info.queue_address.clone(),
                        table_name: table.name.clone(),
                    });
                }
            }
            if refs.is_empty() {
                continue;
            }
            anyhow::ensure!(
                refs.len() == bundles.len(),
                "Workers disagree on the declared SMPC operations"
            );
            let job_id = self.smpc.load_data(operation, refs).await?;
            op_jobs.push((operation, job_id));
        }

        let template_info = self
            .materialize_secure_transfer_row(template_json)
            .await?;
        let mut result = SmpcTablesInfo {
            template: template_info,
            sum_op: None,
            min_op: None,
            max_op: None,
        };
        for (operation, job_id) in op_jobs {
            let values = wait_for_smpc_result(self.smpc.as_ref(), &job_id).await?;
            let info = self
                .materialize_secure_transfer_row(serde_json::to_string(&values)?)
                .await?;
            match operation {
                SmpcOperation::Sum => result.sum_op = Some(info),
                SmpcOperation::Min => result.min_op = Some(info),
                SmpcOperation::Max => result.max_op = Some(info),
            }
        }
        Ok(StepValue::GlobalSmpc(result))
    }

    /// One single-row secure-transfer table on the global worker.
    async fn materialize_secure_transfer_row(&self, json: String) -> anyhow::Result<TableInfo> {
        let command_id = self.fresh_command_id();
        let info = self
            .global
            .client
            .create_table(&self.context_id, &command_id, &TableSchema::secure_transfer())
            .await?;
        self.global
            .client
            .insert_rows(&info.name, vec![vec![serde_json::Value::String(json)]])
            .await?;
        Ok(info)
    }
}

type OpPick = fn(&SmpcTablesInfo) -> Option<&TableInfo>;

fn sum_table(bundle: &SmpcTablesInfo) -> Option<&TableInfo> {
    bundle.sum_op.as_ref()
}

fn min_table(bundle: &SmpcTablesInfo) -> Option<&TableInfo> {
    bundle.min_op.as_ref()
}

fn max_table(bundle: &SmpcTablesInfo) -> Option<&TableInfo> {
    bundle.max_op.as_ref()
}

fn to_table_schema(schema: &[(String, common::DType)]) -> TableSchema {
    TableSchema::new(
        schema
            .iter()
            .map(|(name, dtype)| common::ColumnInfo::new(name.clone(), *dtype))
            .collect(),
    )
}
