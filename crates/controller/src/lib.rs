//! The controller facade.
//!
//! Accepts one algorithm request, locates the workers covering the
//! requested datasets through the landscape snapshot, runs the algorithm's
//! step plan under a fresh context id, and returns the terminal result.
//! The captured snapshot stays stable for the whole run; a mid-run
//! landscape refresh never perturbs worker selection.

pub mod cleaner;
pub mod executor;
pub mod smpc;

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use algorithms::{
    AlgorithmInput,
    AlgorithmRegistry,
    AlgorithmSpecification,
};
use common::{
    knobs::{
        SMPC_ENABLED,
        SMPC_OPTIONAL,
    },
    ContextId,
    DataModelId,
    RequestId,
};
use errors::ErrorMetadata;
use landscape::{
    LandscapeAggregator,
    RegistrySnapshot,
};
use serde::{
    Deserialize,
    Serialize,
};
use tokio::sync::mpsc;
use worker_client::{
    TaskChannel,
    WorkerClient,
};

use crate::{
    cleaner::{
        CleanupEvent,
        NodeRef,
    },
    executor::{
        ExecutionEngine,
        WorkerHandle,
    },
    smpc::SmpcCluster,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InputData {
    pub data_model: DataModelId,
    pub datasets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AlgorithmRequest {
    pub inputdata: InputData,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
}

/// SMPC deployment settings, captured at startup.
#[derive(Clone, Copy, Debug)]
pub struct SmpcSettings {
    pub enabled: bool,
    pub optional: bool,
}

impl SmpcSettings {
    pub fn from_knobs() -> Self {
        Self {
            enabled: *SMPC_ENABLED,
            optional: *SMPC_OPTIONAL,
        }
    }
}

pub struct Controller {
    channel: Arc<dyn TaskChannel>,
    aggregator: Arc<LandscapeAggregator>,
    smpc: Arc<dyn SmpcCluster>,
    smpc_settings: SmpcSettings,
    algorithms: AlgorithmRegistry,
    cleanup_events: mpsc::UnboundedSender<CleanupEvent>,
}

/// Releases the context to the cleaner when dropped, so cancellation and
/// failure hand artifacts over exactly like completion does.
struct ReleaseGuard {
    context_id: ContextId,
    events: mpsc::UnboundedSender<CleanupEvent>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let _ = self.events.send(CleanupEvent::ContextReleased {
            context_id: self.context_id.clone(),
        });
    }
}

impl Controller {
    pub fn new(
        channel: Arc<dyn TaskChannel>,
        aggregator: Arc<LandscapeAggregator>,
        smpc: Arc<dyn SmpcCluster>,
        smpc_settings: SmpcSettings,
        algorithms: AlgorithmRegistry,
        cleanup_events: mpsc::UnboundedSender<CleanupEvent>,
    ) -> Self {
        Self {
            channel,
            aggregator,
            smpc,
            smpc_settings,
            algorithms,
            cleanup_events,
        }
    }

    pub fn algorithm_specifications(&self) -> Vec<&AlgorithmSpecification> {
        self.algorithms.specifications()
    }

    /// The flattened registry view served by `GET /datasets`.
    pub fn datasets_catalog(&self) -> BTreeMap<DataModelId, BTreeMap<String, String>> {
        self.aggregator
            .snapshot()
            .data_model_registry
            .dataset_labels
            .clone()
    }

    pub async fn exec_algorithm(
        &self,
        request_id: RequestId,
        algorithm_name: &str,
        request: AlgorithmRequest,
    ) -> anyhow::Result<serde_json::Value> {
        let snapshot = self.aggregator.snapshot();
        self.validate_data_availability(&snapshot, &request)?;

        let algorithm = self.algorithms.get(algorithm_name)?;
        let input = AlgorithmInput {
            x: request.inputdata.x.clone().unwrap_or_default(),
            y: request.inputdata.y.clone().unwrap_or_default(),
            parameters: request.parameters.clone(),
        };
        let plan = (algorithm.build_plan)(&input)?;
        let use_smpc = self.resolve_smpc_usage(request.flags.get("smpc").copied())?;

        let data_model = request.inputdata.data_model.clone();
        let datasets = request.inputdata.datasets.clone();
        let global = snapshot.node_registry.global_worker()?;
        let local_ids = snapshot
            .data_model_registry
            .workers_with_any_of_datasets(&data_model, &datasets);
        let mut locals = Vec::with_capacity(local_ids.len());
        let mut datasets_per_local = BTreeMap::new();
        for node_id in &local_ids {
            let info = snapshot.node_registry.get(node_id)?.clone();
            datasets_per_local.insert(
                node_id.clone(),
                snapshot.data_model_registry.worker_specific_datasets(
                    node_id,
                    &data_model,
                    &datasets,
                ),
            );
            locals.push(self.handle_for(info));
        }

        let context_id = ContextId::fresh();
        tracing::info!(
            request_id = %request_id,
            context_id = %context_id,
            algorithm = algorithm_name,
            workers = ?local_ids,
            "Starting algorithm execution"
        );
        let global_handle = self.handle_for(global.clone());
        let mut nodes: Vec<NodeRef> = vec![NodeRef {
            node_id: global_handle.info.id.clone(),
            queue_address: global_handle.info.queue_address.clone(),
        }];
        nodes.extend(locals.iter().map(|w| NodeRef {
            node_id: w.info.id.clone(),
            queue_address: w.info.queue_address.clone(),
        }));
        let _ = self.cleanup_events.send(CleanupEvent::ContextCreated {
            context_id: context_id.clone(),
            nodes,
        });
        let _release = ReleaseGuard {
            context_id: context_id.clone(),
            events: self.cleanup_events.clone(),
        };

        let engine = ExecutionEngine::new(
            request_id.clone(),
            context_id,
            data_model,
            request.inputdata.filters.clone(),
            global_handle,
            locals,
            datasets_per_local,
            use_smpc,
            self.smpc.clone(),
            self.cleanup_events.clone(),
        );
        let table_data = engine.run(&plan).await?;
        let result = (plan.result)(&table_data)?;
        tracing::info!(
            request_id = %request_id,
            algorithm = algorithm_name,
            "Algorithm execution finished"
        );
        Ok(result)
    }

    fn handle_for(&self, info: common::WorkerInfo) -> WorkerHandle {
        let client = WorkerClient::new(
            info.id.clone(),
            info.queue_address.clone(),
            RequestId::fresh(),
            self.channel.clone(),
        );
        WorkerHandle { info, client }
    }

    fn validate_data_availability(
        &self,
        snapshot: &RegistrySnapshot,
        request: &AlgorithmRequest,
    ) -> anyhow::Result<()> {
        let data_model = &request.inputdata.data_model;
        if !snapshot.data_model_registry.data_model_exists(data_model) {
            return Err(ErrorMetadata::bad_user_input(
                "DataModelUnavailable",
                format!("Data model {data_model} is not available in the federation"),
            )
            .into());
        }
        if request.inputdata.datasets.is_empty() {
            return Err(ErrorMetadata::bad_user_input(
                "NoDatasets",
                "At least one dataset must be requested",
            )
            .into());
        }
        let missing: Vec<&String> = request
            .inputdata
            .datasets
            .iter()
            .filter(|dataset| {
                !snapshot
                    .data_model_registry
                    .dataset_exists(data_model, dataset)
            })
            .collect();
        if !missing.is_empty() {
            return Err(ErrorMetadata::bad_user_input(
                "DatasetUnavailable",
                format!("Datasets {missing:?} are not available in data model {data_model}"),
            )
            .into());
        }
        Ok(())
    }

    fn resolve_smpc_usage(&self, flag: Option<bool>) -> anyhow::Result<bool> {
        match flag {
            Some(true) if !self.smpc_settings.enabled => Err(ErrorMetadata::bad_user_input(
                "SmpcNotEnabled",
                "The request asks for SMPC but it is not enabled in this federation",
            )
            .into()),
            Some(false) if self.smpc_settings.enabled && !self.smpc_settings.optional => {
                Err(ErrorMetadata::bad_user_input(
                    "SmpcMandatory",
                    "SMPC is mandatory in this federation and cannot be disabled per request",
                )
                .into())
            },
            Some(flag) => Ok(flag),
            None => Ok(self.smpc_settings.enabled),
        }
    }
}
