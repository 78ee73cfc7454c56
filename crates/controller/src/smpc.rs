//! Client for the external secure multi-party computation cluster.
//!
//! When SMPC is enabled, a local step's secure-transfer output is split
//! into a template plus per-operation value tables; the executor hands
//! references to those tables to the cluster, which aggregates the masked
//! values without revealing per-party contributions, and polls for the
//! results here.

use std::time::{
    Duration,
    Instant,
};

use async_trait::async_trait;
use common::{
    backoff::Backoff,
    knobs::{
        SMPC_COORDINATOR_URL,
        SMPC_GET_RESULT_MAX_WAIT,
    },
    NodeId,
};
use errors::ErrorMetadata;
use rand::SeedableRng;
use serde::{
    Deserialize,
    Serialize,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmpcOperation {
    Sum,
    Min,
    Max,
}

/// A reference to one worker's operation value table; the cluster pulls
/// the masked values from the worker itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SmpcTableRef {
    pub node_id: NodeId,
    pub queue_address: String,
    pub table_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SmpcJobStatus {
    Pending,
    /// The aggregated flat value list, in template order.
    Completed(serde_json::Value),
    Failed(String),
}

#[async_trait]
pub trait SmpcCluster: Send + Sync + 'static {
    /// Start one aggregation job over the per-worker tables of one
    /// operation. Returns a job handle.
    async fn load_data(
        &self,
        operation: SmpcOperation,
        tables: Vec<SmpcTableRef>,
    ) -> anyhow::Result<String>;

    async fn get_result(&self, job_id: &str) -> anyhow::Result<SmpcJobStatus>;
}

/// Poll a job until it completes, fails, or the bounded wait expires.
pub async fn wait_for_smpc_result(
    cluster: &dyn SmpcCluster,
    job_id: &str,
) -> anyhow::Result<serde_json::Value> {
    let deadline = Instant::now() + *SMPC_GET_RESULT_MAX_WAIT;
    let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
    let mut rng = rand::rngs::StdRng::from_os_rng();
    loop {
        match cluster.get_result(job_id).await? {
            SmpcJobStatus::Completed(values) => return Ok(values),
            SmpcJobStatus::Failed(reason) => {
                return Err(ErrorMetadata::smpc_failure(
                    "SmpcJobFailed",
                    format!("SMPC job {job_id} failed: {reason}"),
                )
                .into());
            },
            SmpcJobStatus::Pending => {},
        }
        if Instant::now() >= deadline {
            return Err(ErrorMetadata::smpc_failure(
                "SmpcJobTimeout",
                format!(
                    "SMPC job {job_id} did not complete within {:?}",
                    *SMPC_GET_RESULT_MAX_WAIT
                ),
            )
            .into());
        }
        tokio::time::sleep(backoff.next_delay(&mut rng)).await;
    }
}

/// The HTTP coordinator client used in production deployments.
pub struct HttpSmpcCluster {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSmpcCluster {
    pub fn from_knobs() -> Self {
        Self {
            base_url: SMPC_COORDINATOR_URL.clone(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct LoadDataRequest {
    operation: SmpcOperation,
    tables: Vec<SmpcTableRef>,
}

#[derive(Deserialize)]
struct LoadDataResponse {
    job_id: String,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
enum GetResultResponse {
    InProgress,
    Completed { values: serde_json::Value },
    Failed { reason: String },
}

#[async_trait]
impl SmpcCluster for HttpSmpcCluster {
    async fn load_data(
        &self,
        operation: SmpcOperation,
        tables: Vec<SmpcTableRef>,
    ) -> anyhow::Result<String> {
        let response: LoadDataResponse = self
            .client
            .post(format!("{}/api/secure-aggregation/job", self.base_url))
            .json(&LoadDataRequest { operation, tables })
            .send()
            .await
            .map_err(|e| {
                ErrorMetadata::smpc_failure(
                    "SmpcUnreachable",
                    format!("Could not reach the SMPC coordinator: {e}"),
                )
            })?
            .json()
            .await
            .map_err(|e| {
                ErrorMetadata::smpc_failure(
                    "SmpcBadResponse",
                    format!("SMPC coordinator returned a malformed response: {e}"),
                )
            })?;
        Ok(response.job_id)
    }

    async fn get_result(&self, job_id: &str) -> anyhow::Result<SmpcJobStatus> {
        let response: GetResultResponse = self
            .client
            .get(format!(
                "{}/api/secure-aggregation/job/{job_id}",
                self.base_url
            ))
            .send()
            .await
            .map_err(|e| {
                ErrorMetadata::smpc_failure(
                    "SmpcUnreachable",
                    format!("Could not reach the SMPC coordinator: {e}"),
                )
            })?
            .json()
            .await
            .map_err(|e| {
                ErrorMetadata::smpc_failure(
                    "SmpcBadResponse",
                    format!("SMPC coordinator returned a malformed response: {e}"),
                )
            })?;
        Ok(match response {
            GetResultResponse::InProgress => SmpcJobStatus::Pending,
            GetResultResponse::Completed { values } => SmpcJobStatus::Completed(values),
            GetResultResponse::Failed { reason } => SmpcJobStatus::Failed(reason),
        })
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::sync::Arc;

    use common::task_dtos::TaskRequest;
    use parking_lot::Mutex;
    use worker_client::{
        testing::secure,
        TaskChannel,
    };

    use super::*;

    /// Aggregates the per-worker value lists element-wise, reading the
    /// tables through the same channel the controller uses.
    pub struct FakeSmpcCluster {
        channel: Arc<dyn TaskChannel>,
        jobs: Mutex<Vec<SmpcJobStatus>>,
    }

    impl FakeSmpcCluster {
        pub fn new(channel: Arc<dyn TaskChannel>) -> Self {
            Self {
                channel,
                jobs: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SmpcCluster for FakeSmpcCluster {
        async fn load_data(
            &self,
            operation: SmpcOperation,
            tables: Vec<SmpcTableRef>,
        ) -> anyhow::Result<String> {
            let mut contributions = Vec::new();
            for table in &tables {
                let request = TaskRequest {
                    task: "get_table_data".to_owned(),
                    request_id: "smpccluster".parse().expect("static request id is valid"),
                    params: serde_json::json!({ "table_name": table.table_name }),
                };
                let result = self
                    .channel
                    .call(&table.queue_address, request, Duration::from_secs(5))
                    .await?;
                let table_data: common::TableData = serde_json::from_value(result)?;
                let cell = table_data.column("secure_transfer")?.values[0]
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("Operation table cell is not text"))?
                    .to_owned();
                let values: serde_json::Value = serde_json::from_str(&cell)?;
                // Per-operation payloads are flat lists; wrap each entry
                // as a one-key transfer so the shared merge helper can
                // combine them element-wise.
                let op_name = match operation {
                    SmpcOperation::Sum => "sum",
                    SmpcOperation::Min => "min",
                    SmpcOperation::Max => "max",
                };
                contributions.push(serde_json::json!({
                    "values": {"data": values, "operation": op_name, "type": "float"},
                }));
            }
            let merged = secure::secure_transfers_to_merged_dict(&contributions)?;
            let job_id = {
                let mut jobs = self.jobs.lock();
                jobs.push(SmpcJobStatus::Completed(merged["values"].clone()));
                (jobs.len() - 1).to_string()
            };
            Ok(job_id)
        }

        async fn get_result(&self, job_id: &str) -> anyhow::Result<SmpcJobStatus> {
            let index: usize = job_id.parse()?;
            Ok(self.jobs.lock()[index].clone())
        }
    }
}
