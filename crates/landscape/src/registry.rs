use std::collections::BTreeMap;

use common::{
    CommonDataElements,
    DataModelId,
    NodeId,
    NodeRole,
    WorkerInfo,
};
use errors::ErrorMetadata;

/// Everything one worker advertised during a scan: which data models it
/// holds, the datasets of each (`code -> label`) and the CDE definitions.
#[derive(Clone, Debug, Default)]
pub struct WorkerMetadata {
    pub data_models: BTreeMap<DataModelId, (BTreeMap<String, String>, CommonDataElements)>,
}

/// The workers the most recent scan saw, by role.
#[derive(Clone, Debug, Default)]
pub struct NodeRegistry {
    workers_per_id: BTreeMap<NodeId, WorkerInfo>,
}

impl NodeRegistry {
    pub fn new(workers: Vec<WorkerInfo>) -> Self {
        Self {
            workers_per_id: workers.into_iter().map(|w| (w.id.clone(), w)).collect(),
        }
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerInfo> {
        self.workers_per_id.values()
    }

    pub fn get(&self, node_id: &NodeId) -> anyhow::Result<&WorkerInfo> {
        self.workers_per_id
            .get(node_id)
            .ok_or_else(|| anyhow::anyhow!("Worker {node_id} is not in the current registry"))
    }

    /// The unique global worker. Its absence is a deployment configuration
    /// error, not a transient condition.
    pub fn global_worker(&self) -> anyhow::Result<&WorkerInfo> {
        let mut globals = self
            .workers_per_id
            .values()
            .filter(|w| w.role == NodeRole::Global);
        let global = globals
            .next()
            .ok_or_else(|| anyhow::anyhow!("No global worker is registered in the federation"))?;
        anyhow::ensure!(
            globals.next().is_none(),
            "More than one global worker is registered in the federation"
        );
        Ok(global)
    }

    pub fn local_workers(&self) -> impl Iterator<Item = &WorkerInfo> {
        self.workers_per_id
            .values()
            .filter(|w| w.role == NodeRole::Local)
    }
}

/// The reconciled data-model view of the federation: which compatible data
/// models exist, and on which single worker each dataset lives.
#[derive(Clone, Debug, Default)]
pub struct DataModelRegistry {
    pub data_models: BTreeMap<DataModelId, CommonDataElements>,
    pub datasets_locations: BTreeMap<DataModelId, BTreeMap<String, NodeId>>,
    pub dataset_labels: BTreeMap<DataModelId, BTreeMap<String, String>>,
}

impl DataModelRegistry {
    pub fn data_model_exists(&self, data_model: &DataModelId) -> bool {
        self.datasets_locations.contains_key(data_model)
    }

    pub fn dataset_exists(&self, data_model: &DataModelId, dataset: &str) -> bool {
        self.datasets_locations
            .get(data_model)
            .is_some_and(|datasets| datasets.contains_key(dataset))
    }

    pub fn cdes(&self, data_model: &DataModelId) -> anyhow::Result<&CommonDataElements> {
        self.data_models.get(data_model).ok_or_else(|| {
            ErrorMetadata::bad_user_input(
                "DataModelUnavailable",
                format!("Data model {data_model} is not available in the federation"),
            )
            .into()
        })
    }

    /// Every dataset currently available, per data model, without
    /// duplicates.
    pub fn all_datasets_per_data_model(&self) -> BTreeMap<DataModelId, Vec<String>> {
        self.datasets_locations
            .iter()
            .map(|(dm, datasets)| (dm.clone(), datasets.keys().cloned().collect()))
            .collect()
    }

    /// The workers holding any of the requested datasets.
    pub fn workers_with_any_of_datasets(
        &self,
        data_model: &DataModelId,
        datasets: &[String],
    ) -> Vec<NodeId> {
        let Some(locations) = self.datasets_locations.get(data_model) else {
            return Vec::new();
        };
        let mut workers: Vec<NodeId> = locations
            .iter()
            .filter(|(dataset, _)| datasets.contains(dataset))
            .map(|(_, node_id)| node_id.clone())
            .collect();
        workers.sort();
        workers.dedup();
        workers
    }

    /// Of `wanted_datasets`, the ones located on `node_id`.
    pub fn worker_specific_datasets(
        &self,
        node_id: &NodeId,
        data_model: &DataModelId,
        wanted_datasets: &[String],
    ) -> Vec<String> {
        let Some(locations) = self.datasets_locations.get(data_model) else {
            return Vec::new();
        };
        locations
            .iter()
            .filter(|(dataset, owner)| wanted_datasets.contains(dataset) && *owner == node_id)
            .map(|(dataset, _)| dataset.clone())
            .collect()
    }
}

/// The immutable pair the aggregator publishes. Readers always see a
/// consistent node set and data-model map.
#[derive(Clone, Debug, Default)]
pub struct RegistrySnapshot {
    pub node_registry: NodeRegistry,
    pub data_model_registry: DataModelRegistry,
}
