//! Wire DTOs of the worker task protocol, shared by the controller-side
//! client and the worker-side task service.

use std::collections::BTreeMap;

use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    ids::{
        CommandId,
        ContextId,
        RequestId,
    },
    tables::{
        TableInfo,
        TableSchema,
    },
};

/// One task submission, addressed to a worker's queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task: String,
    pub request_id: RequestId,
    pub params: serde_json::Value,
}

/// Classification of an error raised by worker-side task code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemoteErrorKind {
    /// The task refused the computation for a reason the requesting user
    /// can act on (e.g. a transformation rejecting the data). Surfaces as
    /// HTTP 460 at the facade.
    User,
    /// The task failed internally. Fatal for the running algorithm.
    Internal,
}

/// The envelope a worker task returns through the queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResponse {
    Success {
        result: serde_json::Value,
    },
    Error {
        kind: RemoteErrorKind,
        message: String,
    },
}

/// The table bundle standing in for one secure-transfer artifact when SMPC
/// is enabled: a zeroed template plus one value table per aggregation
/// operation the step declared.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SmpcTablesInfo {
    pub template: TableInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum_op: Option<TableInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_op: Option<TableInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_op: Option<TableInfo>,
}

/// One argument of a UDF call, as sent to the worker. A plain table and a
/// secure-transfer bundle are distinct wire shapes; feeding one where the
/// other is declared is a contract violation the UDF layer rejects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UdfArgument {
    Literal { value: serde_json::Value },
    Table { info: TableInfo },
    SmpcTables { info: SmpcTablesInfo },
}

/// One output produced by a UDF call on the worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UdfResult {
    Table { info: TableInfo },
    SmpcTables { info: SmpcTablesInfo },
}

impl UdfResult {
    pub fn as_table(&self) -> anyhow::Result<&TableInfo> {
        match self {
            UdfResult::Table { info } => Ok(info),
            UdfResult::SmpcTables { .. } => {
                anyhow::bail!("Expected a table result, got an SMPC bundle")
            },
        }
    }
}

/// A view over a base table: the requested columns, an optional row filter
/// and the privacy options applied at creation time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewSpec {
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
    pub dropna: bool,
    pub check_min_rows: bool,
}

/// Parameters of the `run_udf` task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunUdfParams {
    pub context_id: ContextId,
    pub command_id: CommandId,
    pub func_name: String,
    pub positional_args: Vec<UdfArgument>,
    pub keyword_args: BTreeMap<String, UdfArgument>,
    pub use_smpc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<TableSchema>,
}
