//! An in-memory federation: every worker's task surface implemented at the
//! task level against in-memory tables, addressable through the regular
//! [`TaskChannel`] seam. UDF execution is delegated to natively registered
//! kernels, so scenario tests can run whole algorithms without a store.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use common::{
    knobs::MINIMUM_ROW_COUNT,
    task_dtos::{
        RemoteErrorKind,
        RunUdfParams,
        SmpcTablesInfo,
        TaskRequest,
        TaskResponse,
        UdfArgument,
        UdfResult,
    },
    ColumnData,
    CommonDataElements,
    ContextId,
    DType,
    DataModelId,
    NodeId,
    NodeRole,
    TableData,
    TableInfo,
    TableName,
    TableSchema,
    TableType,
    WorkerInfo,
};
use errors::ErrorMetadata;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    channel::{
        result_from_response,
        TaskChannel,
    },
    testing::secure,
};

/// One resolved argument as a kernel sees it.
#[derive(Clone, Debug)]
pub enum KernelArg {
    Literal(Value),
    /// Schema and rows of a relation or tensor input.
    Relation {
        schema: TableSchema,
        rows: Vec<Vec<Value>>,
    },
    /// All transfer blobs of the table (one for plain transfers, one per
    /// worker for merge transfers).
    Transfers(Vec<Value>),
    State(Value),
    /// The merged `{key: data}` form, whichever path produced it.
    SecureTransfer(Value),
}

impl KernelArg {
    pub fn as_f64_column(&self, column: &str) -> anyhow::Result<Vec<f64>> {
        let KernelArg::Relation { schema, rows } = self else {
            anyhow::bail!("Argument is not a relation");
        };
        let idx = schema
            .columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| anyhow::anyhow!("No column {column}"))?;
        rows.iter()
            .map(|row| {
                row[idx]
                    .as_f64()
                    .ok_or_else(|| anyhow::anyhow!("Column {column} is not numeric"))
            })
            .collect()
    }
}

/// One output as a kernel produces it.
#[derive(Clone, Debug)]
pub enum KernelOutput {
    Transfer(Value),
    State(Value),
    SecureTransfer(Value),
    Relation {
        schema: TableSchema,
        rows: Vec<Vec<Value>>,
    },
}

pub type UdfKernel =
    Arc<dyn Fn(&BTreeMap<String, KernelArg>) -> anyhow::Result<Vec<KernelOutput>> + Send + Sync>;

#[derive(Clone, Debug)]
enum TableBody {
    Stored(Vec<Vec<Value>>),
    Remote { source_db_address: String },
    Merge { parts: Vec<String> },
}

#[derive(Clone, Debug)]
struct FakeTable {
    info: TableInfo,
    body: TableBody,
}

struct DataModelData {
    datasets: BTreeMap<String, String>,
    cdes: CommonDataElements,
    /// Primary data rows, each holding the `dataset` code plus variables.
    rows: Vec<BTreeMap<String, Value>>,
}

struct FakeWorker {
    info: WorkerInfo,
    data_models: BTreeMap<DataModelId, DataModelData>,
    tables: BTreeMap<String, FakeTable>,
}

/// The in-memory federation, used as the [`TaskChannel`] of tests.
#[derive(Default)]
pub struct InMemoryCluster {
    workers: Mutex<BTreeMap<String, FakeWorker>>,
    kernels: Mutex<BTreeMap<String, UdfKernel>>,
    /// When set, every `run_udf` call is checked against the UDF contract
    /// layer before its kernel runs, exactly like the real worker task.
    udf_registry: Mutex<Option<Arc<udfgen::UdfRegistry>>>,
    /// Addresses currently unreachable; calls to them fail like a dead
    /// queue.
    outages: Mutex<BTreeSet<String>>,
    task_failures: Mutex<Vec<FailureRule>>,
    calls: Mutex<Vec<(String, String)>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InjectedFailure {
    /// The task ran remotely and failed.
    Internal,
    /// The queue could not be reached at all.
    Unreachable,
}

struct FailureRule {
    queue_address: String,
    task: String,
    func_name: Option<String>,
    kind: InjectedFailure,
    remaining: usize,
}

impl InMemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_worker(&self, queue_address: &str, id: &str, role: NodeRole) {
        let node_id: NodeId = id.parse().expect("worker ids in tests are valid");
        let info = WorkerInfo {
            id: node_id,
            role,
            queue_address: queue_address.to_owned(),
            db_address: format!("{queue_address}-db"),
        };
        self.workers.lock().insert(
            queue_address.to_owned(),
            FakeWorker {
                info,
                data_models: BTreeMap::new(),
                tables: BTreeMap::new(),
            },
        );
    }

    pub fn load_data_model(
        &self,
        queue_address: &str,
        data_model: &DataModelId,
        cdes: CommonDataElements,
        datasets: BTreeMap<String, String>,
        rows: Vec<BTreeMap<String, Value>>,
    ) {
        let mut workers = self.workers.lock();
        let worker = workers
            .get_mut(queue_address)
            .expect("worker must be added before data is loaded");
        worker.data_models.insert(
            data_model.clone(),
            DataModelData {
                datasets,
                cdes,
                rows,
            },
        );
    }

    pub fn register_kernel(
        &self,
        func_name: &str,
        kernel: impl Fn(&BTreeMap<String, KernelArg>) -> anyhow::Result<Vec<KernelOutput>>
            + Send
            + Sync
            + 'static,
    ) {
        self.kernels
            .lock()
            .insert(func_name.to_owned(), Arc::new(kernel));
    }

    pub fn set_unreachable(&self, queue_address: &str) {
        self.outages.lock().insert(queue_address.to_owned());
    }

    pub fn set_reachable(&self, queue_address: &str) {
        self.outages.lock().remove(queue_address);
    }

    pub fn set_udf_registry(&self, registry: Arc<udfgen::UdfRegistry>) {
        *self.udf_registry.lock() = Some(registry);
    }

    /// Make the next invocation of `task` on `queue_address` fail with an
    /// internal worker error.
    pub fn fail_task_once(&self, queue_address: &str, task: &str) {
        self.task_failures.lock().push(FailureRule {
            queue_address: queue_address.to_owned(),
            task: task.to_owned(),
            func_name: None,
            kind: InjectedFailure::Internal,
            remaining: 1,
        });
    }

    /// Make the next `times` `run_udf` invocations of `func_name` on
    /// `queue_address` fail as if the worker's queue were unreachable.
    pub fn fail_udf_unreachable(&self, queue_address: &str, func_name: &str, times: usize) {
        self.task_failures.lock().push(FailureRule {
            queue_address: queue_address.to_owned(),
            task: "run_udf".to_owned(),
            func_name: Some(func_name.to_owned()),
            kind: InjectedFailure::Unreachable,
            remaining: times,
        });
    }

    /// The distinct context ids appearing in any table name on a worker.
    pub fn contexts(&self, queue_address: &str) -> BTreeSet<ContextId> {
        let workers = self.workers.lock();
        let Some(worker) = workers.get(queue_address) else {
            return BTreeSet::new();
        };
        worker
            .tables
            .keys()
            .filter_map(|name| TableName::from_str(name).ok())
            .map(|parsed| parsed.context_id)
            .collect()
    }

    pub fn calls_of(&self, task: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(_, t)| t == task)
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Names of all tables on a worker whose name carries `context_id`.
    pub fn context_tables(&self, queue_address: &str, context_id: &ContextId) -> Vec<String> {
        let workers = self.workers.lock();
        let Some(worker) = workers.get(queue_address) else {
            return Vec::new();
        };
        worker
            .tables
            .keys()
            .filter(|name| {
                TableName::from_str(name).is_ok_and(|parsed| parsed.in_context(context_id))
            })
            .cloned()
            .collect()
    }

    fn worker_by_db_address(
        workers: &BTreeMap<String, FakeWorker>,
        db_address: &str,
    ) -> anyhow::Result<String> {
        workers
            .values()
            .find(|w| w.info.db_address == db_address)
            .map(|w| w.info.queue_address.clone())
            .ok_or_else(|| anyhow::anyhow!("No worker has db address {db_address}"))
    }

    /// Follow remote and merge indirections to concrete rows.
    fn resolve_rows(
        workers: &BTreeMap<String, FakeWorker>,
        queue_address: &str,
        table_name: &str,
    ) -> anyhow::Result<Vec<Vec<Value>>> {
        let worker = workers
            .get(queue_address)
            .ok_or_else(|| anyhow::anyhow!("No worker at {queue_address}"))?;
        let table = worker.tables.get(table_name).ok_or_else(|| {
            anyhow::anyhow!("Table {table_name} does not exist on {queue_address}")
        })?;
        match &table.body {
            TableBody::Stored(rows) => Ok(rows.clone()),
            TableBody::Remote { source_db_address } => {
                let source = Self::worker_by_db_address(workers, source_db_address)?;
                Self::resolve_rows(workers, &source, table_name)
            },
            TableBody::Merge { parts } => {
                let mut rows = Vec::new();
                for part in parts {
                    rows.extend(Self::resolve_rows(workers, queue_address, part)?);
                }
                Ok(rows)
            },
        }
    }

    fn dispatch(&self, queue_address: &str, request: &TaskRequest) -> anyhow::Result<Value> {
        let params = request.params.clone();
        match request.task.as_str() {
            "get_worker_info" => {
                let workers = self.workers.lock();
                let worker = workers
                    .get(queue_address)
                    .ok_or_else(|| anyhow::anyhow!("No worker at {queue_address}"))?;
                Ok(serde_json::to_value(&worker.info)?)
            },
            "get_worker_datasets_per_data_model" => {
                let workers = self.workers.lock();
                let worker = workers
                    .get(queue_address)
                    .ok_or_else(|| anyhow::anyhow!("No worker at {queue_address}"))?;
                let datasets: BTreeMap<&DataModelId, &BTreeMap<String, String>> = worker
                    .data_models
                    .iter()
                    .map(|(dm, data)| (dm, &data.datasets))
                    .collect();
                Ok(serde_json::to_value(&datasets)?)
            },
            "get_data_model_cdes" => {
                let data_model: DataModelId =
                    serde_json::from_value(params["data_model"].clone())?;
                let workers = self.workers.lock();
                let worker = workers
                    .get(queue_address)
                    .ok_or_else(|| anyhow::anyhow!("No worker at {queue_address}"))?;
                let data = worker
                    .data_models
                    .get(&data_model)
                    .ok_or_else(|| anyhow::anyhow!("No data model {data_model}"))?;
                Ok(serde_json::to_value(&data.cdes)?)
            },
            "create_table" => self.create_table(queue_address, &params),
            "insert_data_to_table" => self.insert_rows(queue_address, &params),
            "create_data_model_views" => self.create_data_model_views(queue_address, &params),
            "create_merge_table" => self.create_merge_table(queue_address, &params),
            "create_remote_table" => self.create_remote_table(queue_address, &params),
            "get_table_data" => self.get_table_data(queue_address, &params),
            "run_udf" => self.run_udf(queue_address, &params),
            "cleanup" => self.cleanup(queue_address, &params),
            task => anyhow::bail!("Unknown task {task}"),
        }
    }

    fn make_table_name(
        &self,
        worker: &FakeWorker,
        table_type: TableType,
        params: &Value,
        result_id: &str,
    ) -> anyhow::Result<TableName> {
        let context_id: ContextId = serde_json::from_value(params["context_id"].clone())?;
        let command_id = serde_json::from_value(params["command_id"].clone())?;
        TableName::new(
            table_type,
            worker.info.id.clone(),
            context_id,
            command_id,
            result_id,
        )
    }

    fn create_table(&self, queue_address: &str, params: &Value) -> anyhow::Result<Value> {
        let schema: TableSchema = serde_json::from_value(params["schema"].clone())?;
        let mut workers = self.workers.lock();
        let worker = workers
            .get_mut(queue_address)
            .ok_or_else(|| anyhow::anyhow!("No worker at {queue_address}"))?;
        let name = self
            .make_table_name(worker, TableType::Normal, params, "0")?
            .to_string();
        let info = TableInfo::new(name.clone(), schema, TableType::Normal);
        worker.tables.insert(
            name,
            FakeTable {
                info: info.clone(),
                body: TableBody::Stored(Vec::new()),
            },
        );
        Ok(serde_json::to_value(&info)?)
    }

    fn insert_rows(&self, queue_address: &str, params: &Value) -> anyhow::Result<Value> {
        let table_name = params["table_name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("table_name missing"))?;
        let rows: Vec<Vec<Value>> = serde_json::from_value(params["rows"].clone())?;
        let mut workers = self.workers.lock();
        let worker = workers
            .get_mut(queue_address)
            .ok_or_else(|| anyhow::anyhow!("No worker at {queue_address}"))?;
        let table = worker
            .tables
            .get_mut(table_name)
            .ok_or_else(|| anyhow::anyhow!("Table {table_name} does not exist"))?;
        let TableBody::Stored(stored) = &mut table.body else {
            anyhow::bail!("Cannot insert into a remote or merge table");
        };
        stored.extend(rows);
        Ok(Value::Null)
    }

    fn create_data_model_views(
        &self,
        queue_address: &str,
        params: &Value,
    ) -> anyhow::Result<Value> {
        let data_model: DataModelId = serde_json::from_value(params["data_model"].clone())?;
        let datasets: Vec<String> = serde_json::from_value(params["datasets"].clone())?;
        let variable_groups: Vec<Vec<String>> =
            serde_json::from_value(params["variable_groups"].clone())?;
        let dropna = params["dropna"].as_bool().unwrap_or(true);
        let check_min_rows = params["check_min_rows"].as_bool().unwrap_or(true);

        let mut workers = self.workers.lock();
        let worker = workers
            .get_mut(queue_address)
            .ok_or_else(|| anyhow::anyhow!("No worker at {queue_address}"))?;
        let data = worker
            .data_models
            .get(&data_model)
            .ok_or_else(|| anyhow::anyhow!("No data model {data_model}"))?;

        let mut views = Vec::new();
        let mut new_tables = Vec::new();
        for (group_idx, variables) in variable_groups.iter().enumerate() {
            let mut columns = vec![common::ColumnInfo::new("row_id", DType::Int)];
            for variable in variables {
                let cde = data.cdes.get(variable).ok_or_else(|| {
                    ErrorMetadata::bad_user_input(
                        "UnknownVariable",
                        format!("Variable {variable} is not part of data model {data_model}"),
                    )
                })?;
                columns.push(common::ColumnInfo::new(variable.clone(), cde.sql_type));
            }
            let mut rows = Vec::new();
            for (row_id, row) in data.rows.iter().enumerate() {
                let in_datasets = row
                    .get("dataset")
                    .and_then(|d| d.as_str())
                    .is_some_and(|d| datasets.iter().any(|ds| ds == d));
                if !in_datasets {
                    continue;
                }
                let values: Vec<Value> = variables
                    .iter()
                    .map(|v| row.get(v).cloned().unwrap_or(Value::Null))
                    .collect();
                if dropna && values.iter().any(|v| v.is_null()) {
                    continue;
                }
                let mut full_row = vec![Value::from(row_id as u64)];
                full_row.extend(values);
                rows.push(full_row);
            }
            if check_min_rows && rows.len() < *MINIMUM_ROW_COUNT {
                return Err(ErrorMetadata::bad_user_input(
                    "InsufficientData",
                    format!(
                        "The data view has {} rows, fewer than the minimum row count \
                         threshold of {}. The computation cannot run on this data selection.",
                        rows.len(),
                        *MINIMUM_ROW_COUNT,
                    ),
                )
                .into());
            }
            let name = self
                .make_table_name(worker, TableType::View, params, &group_idx.to_string())?
                .to_string();
            let info = TableInfo::new(name.clone(), TableSchema::new(columns), TableType::View);
            new_tables.push((name, info.clone(), rows));
            views.push(info);
        }
        for (name, info, rows) in new_tables {
            worker.tables.insert(
                name,
                FakeTable {
                    info,
                    body: TableBody::Stored(rows),
                },
            );
        }
        Ok(serde_json::to_value(&views)?)
    }

    fn create_merge_table(&self, queue_address: &str, params: &Value) -> anyhow::Result<Value> {
        let source_tables: Vec<TableInfo> =
            serde_json::from_value(params["source_tables"].clone())?;
        let first = source_tables
            .first()
            .ok_or_else(|| anyhow::anyhow!("A merge table needs at least one source table"))?;
        let mut workers = self.workers.lock();
        let worker = workers
            .get_mut(queue_address)
            .ok_or_else(|| anyhow::anyhow!("No worker at {queue_address}"))?;
        for source in &source_tables {
            anyhow::ensure!(
                worker.tables.contains_key(&source.name),
                "Merge part {} is not mounted on this worker",
                source.name,
            );
        }
        let name = self
            .make_table_name(worker, TableType::Merge, params, "0")?
            .to_string();
        let info = TableInfo::new(name.clone(), first.schema.clone(), TableType::Merge);
        worker.tables.insert(
            name,
            FakeTable {
                info: info.clone(),
                body: TableBody::Merge {
                    parts: source_tables.iter().map(|t| t.name.clone()).collect(),
                },
            },
        );
        Ok(serde_json::to_value(&info)?)
    }

    fn create_remote_table(&self, queue_address: &str, params: &Value) -> anyhow::Result<Value> {
        let table_name = params["table_name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("table_name missing"))?;
        let schema: TableSchema = serde_json::from_value(params["schema"].clone())?;
        let source_db_address = params["source_db_address"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("source_db_address missing"))?;
        let mut workers = self.workers.lock();
        let worker = workers
            .get_mut(queue_address)
            .ok_or_else(|| anyhow::anyhow!("No worker at {queue_address}"))?;
        worker.tables.insert(
            table_name.to_owned(),
            FakeTable {
                info: TableInfo::new(table_name, schema, TableType::Remote),
                body: TableBody::Remote {
                    source_db_address: source_db_address.to_owned(),
                },
            },
        );
        Ok(Value::Null)
    }

    fn get_table_data(&self, queue_address: &str, params: &Value) -> anyhow::Result<Value> {
        let table_name = params["table_name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("table_name missing"))?;
        let workers = self.workers.lock();
        let worker = workers
            .get(queue_address)
            .ok_or_else(|| anyhow::anyhow!("No worker at {queue_address}"))?;
        let table = worker
            .tables
            .get(table_name)
            .ok_or_else(|| anyhow::anyhow!("Table {table_name} does not exist"))?;
        let schema = table.info.schema.clone();
        let rows = Self::resolve_rows(&workers, queue_address, table_name)?;
        let columns = schema
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| ColumnData {
                name: column.name.clone(),
                dtype: column.dtype,
                values: rows.iter().map(|r| r[i].clone()).collect(),
            })
            .collect();
        let table_data = TableData {
            name: table_name.to_owned(),
            columns,
        };
        Ok(serde_json::to_value(&table_data)?)
    }

    fn resolve_kernel_arg(
        workers: &BTreeMap<String, FakeWorker>,
        queue_address: &str,
        arg: &UdfArgument,
    ) -> anyhow::Result<KernelArg> {
        match arg {
            UdfArgument::Literal { value } => Ok(KernelArg::Literal(value.clone())),
            UdfArgument::Table { info } => {
                let rows = Self::resolve_rows(workers, queue_address, &info.name)?;
                match info.schema.columns.as_slice() {
                    [c] if c.name == "transfer" => {
                        let transfers = rows
                            .iter()
                            .map(|r| parse_json_cell(&r[0]))
                            .collect::<anyhow::Result<Vec<Value>>>()?;
                        Ok(KernelArg::Transfers(transfers))
                    },
                    [c] if c.name == "state" => {
                        let cell = rows
                            .first()
                            .and_then(|r| r.first())
                            .ok_or_else(|| anyhow::anyhow!("State table {} is empty", info.name))?;
                        let hex_str = cell
                            .as_str()
                            .ok_or_else(|| anyhow::anyhow!("State cell is not hex text"))?;
                        let bytes = hex::decode(hex_str)?;
                        Ok(KernelArg::State(serde_json::from_slice(&bytes)?))
                    },
                    [c] if c.name == "secure_transfer" => {
                        let transfers = rows
                            .iter()
                            .map(|r| parse_json_cell(&r[0]))
                            .collect::<anyhow::Result<Vec<Value>>>()?;
                        Ok(KernelArg::SecureTransfer(
                            secure::secure_transfers_to_merged_dict(&transfers)?,
                        ))
                    },
                    _ => Ok(KernelArg::Relation {
                        schema: info.schema.clone(),
                        rows,
                    }),
                }
            },
            UdfArgument::SmpcTables { info } => {
                let read_single = |table: &TableInfo| -> anyhow::Result<Value> {
                    let rows = Self::resolve_rows(workers, queue_address, &table.name)?;
                    let cell = rows
                        .first()
                        .and_then(|r| r.first())
                        .ok_or_else(|| anyhow::anyhow!("SMPC table {} is empty", table.name))?;
                    parse_json_cell(cell)
                };
                let template = read_single(&info.template)?;
                let sum_values = info.sum_op.as_ref().map(&read_single).transpose()?;
                let min_values = info.min_op.as_ref().map(&read_single).transpose()?;
                let max_values = info.max_op.as_ref().map(&read_single).transpose()?;
                Ok(KernelArg::SecureTransfer(
                    secure::construct_secure_transfer_dict(
                        &template,
                        sum_values.as_ref(),
                        min_values.as_ref(),
                        max_values.as_ref(),
                    )?,
                ))
            },
        }
    }

    fn run_udf(&self, queue_address: &str, params: &Value) -> anyhow::Result<Value> {
        let params: RunUdfParams = serde_json::from_value(params.clone())?;
        if let Some(registry) = self.udf_registry.lock().clone() {
            // Enforce the UDF contract before any "database" activity,
            // exactly like the real worker task does.
            let (positional_args, keyword_args) =
                udfgen::convert_arguments(&params.positional_args, &params.keyword_args)?;
            udfgen::generate_udf_queries(udfgen::UdfGenRequest {
                registry: &registry,
                func_name: &params.func_name,
                positional_args,
                keyword_args,
                smpc_used: params.use_smpc,
                output_schema: params.output_schema.as_ref().map(|s| {
                    s.columns.iter().map(|c| (c.name.clone(), c.dtype)).collect()
                }),
            })?;
        }
        let kernel = self
            .kernels
            .lock()
            .get(&params.func_name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No kernel registered for {}", params.func_name))?;

        let mut workers = self.workers.lock();
        let mut args: BTreeMap<String, KernelArg> = BTreeMap::new();
        for (name, arg) in &params.keyword_args {
            args.insert(
                name.clone(),
                Self::resolve_kernel_arg(&workers, queue_address, arg)?,
            );
        }
        anyhow::ensure!(
            params.positional_args.is_empty(),
            "The in-memory worker only supports keyword arguments"
        );
        let outputs = kernel(&args)?;

        let worker = workers
            .get_mut(queue_address)
            .ok_or_else(|| anyhow::anyhow!("No worker at {queue_address}"))?;
        let node_id = worker.info.id.clone();
        let mut results = Vec::new();
        for (index, output) in outputs.into_iter().enumerate() {
            let node_id = node_id.clone();
            let context_id = params.context_id.clone();
            let command_id = params.command_id.clone();
            let make_name = move |result_id: String| -> anyhow::Result<String> {
                Ok(TableName::new(
                    TableType::Normal,
                    node_id.clone(),
                    context_id.clone(),
                    command_id.clone(),
                    result_id,
                )?
                .to_string())
            };
            let result = match output {
                KernelOutput::Transfer(value) => UdfResult::Table {
                    info: store_blob_table(
                        worker,
                        make_name(index.to_string())?,
                        TableSchema::transfer(),
                        Value::String(serde_json::to_string(&value)?),
                    ),
                },
                KernelOutput::State(value) => UdfResult::Table {
                    info: store_blob_table(
                        worker,
                        make_name(index.to_string())?,
                        TableSchema::state(),
                        Value::String(hex::encode(serde_json::to_vec(&value)?)),
                    ),
                },
                KernelOutput::Relation { schema, rows } => {
                    let name = make_name(index.to_string())?;
                    let info = TableInfo::new(name.clone(), schema, TableType::Normal);
                    worker.tables.insert(
                        name,
                        FakeTable {
                            info: info.clone(),
                            body: TableBody::Stored(rows),
                        },
                    );
                    UdfResult::Table { info }
                },
                KernelOutput::SecureTransfer(value) if !params.use_smpc => UdfResult::Table {
                    info: store_blob_table(
                        worker,
                        make_name(index.to_string())?,
                        TableSchema::secure_transfer(),
                        Value::String(serde_json::to_string(&value)?),
                    ),
                },
                KernelOutput::SecureTransfer(value) => {
                    let (template, sums, mins, maxes) =
                        secure::split_secure_transfer_dict(&value)?;
                    let template_info = store_blob_table(
                        worker,
                        make_name(index.to_string())?,
                        TableSchema::secure_transfer(),
                        Value::String(serde_json::to_string(&template)?),
                    );
                    let mut op_table = |values: Vec<Value>,
                                        op: &str|
                     -> anyhow::Result<Option<TableInfo>> {
                        if values.is_empty() {
                            return Ok(None);
                        }
                        Ok(Some(store_blob_table(
                            worker,
                            make_name(format!("{index}{op}op"))?,
                            TableSchema::secure_transfer(),
                            Value::String(serde_json::to_string(&Value::Array(values))?),
                        )))
                    };
                    let sum_op = op_table(sums, "sum")?;
                    let min_op = op_table(mins, "min")?;
                    let max_op = op_table(maxes, "max")?;
                    UdfResult::SmpcTables {
                        info: SmpcTablesInfo {
                            template: template_info,
                            sum_op,
                            min_op,
                            max_op,
                        },
                    }
                },
            };
            results.push(result);
        }
        Ok(serde_json::to_value(&results)?)
    }

    fn cleanup(&self, queue_address: &str, params: &Value) -> anyhow::Result<Value> {
        let context_id: ContextId = serde_json::from_value(params["context_id"].clone())?;
        let mut workers = self.workers.lock();
        let worker = workers
            .get_mut(queue_address)
            .ok_or_else(|| anyhow::anyhow!("No worker at {queue_address}"))?;
        worker.tables.retain(|name, _| {
            !TableName::from_str(name).is_ok_and(|parsed| parsed.in_context(&context_id))
        });
        Ok(Value::Null)
    }
}

fn parse_json_cell(cell: &Value) -> anyhow::Result<Value> {
    let text = cell
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Expected a JSON text cell"))?;
    Ok(serde_json::from_str(text)?)
}

fn store_blob_table(
    worker: &mut FakeWorker,
    name: String,
    schema: TableSchema,
    cell: Value,
) -> TableInfo {
    let info = TableInfo::new(name.clone(), schema, TableType::Normal);
    worker.tables.insert(
        name,
        FakeTable {
            info: info.clone(),
            body: TableBody::Stored(vec![vec![cell]]),
        },
    );
    info
}

#[async_trait]
impl TaskChannel for InMemoryCluster {
    async fn call(
        &self,
        queue_address: &str,
        request: TaskRequest,
        _timeout: Duration,
    ) -> anyhow::Result<Value> {
        self.calls
            .lock()
            .push((queue_address.to_owned(), request.task.clone()));
        if self.outages.lock().contains(queue_address) {
            return Err(ErrorMetadata::unreachable(
                "WorkerUnreachable",
                format!("Could not reach worker queue at {queue_address}"),
            )
            .into());
        }
        let injected = {
            let mut failures = self.task_failures.lock();
            let matched = failures.iter_mut().find(|rule| {
                rule.remaining > 0
                    && rule.queue_address == queue_address
                    && rule.task == request.task
                    && rule
                        .func_name
                        .as_ref()
                        .is_none_or(|f| request.params["func_name"] == f.as_str())
            });
            matched.map(|rule| {
                rule.remaining -= 1;
                rule.kind
            })
        };
        match injected {
            Some(InjectedFailure::Unreachable) => {
                return Err(ErrorMetadata::unreachable(
                    "WorkerUnreachable",
                    format!("Could not reach worker queue at {queue_address}"),
                )
                .into());
            },
            Some(InjectedFailure::Internal) => {
                return result_from_response(
                    &request.task,
                    TaskResponse::Error {
                        kind: RemoteErrorKind::Internal,
                        message: "injected failure".to_owned(),
                    },
                );
            },
            None => {},
        }
        match self.dispatch(queue_address, &request) {
            Ok(result) => Ok(result),
            // Classified errors keep their tag across the in-memory
            // channel; everything else is shaped like the wire would
            // shape it.
            Err(e) if e.downcast_ref::<ErrorMetadata>().is_some() => Err(e),
            Err(e) => result_from_response(
                &request.task,
                TaskResponse::Error {
                    kind: RemoteErrorKind::Internal,
                    message: format!("{e:#}"),
                },
            ),
        }
    }
}
