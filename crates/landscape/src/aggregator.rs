use std::{
    collections::BTreeMap,
    sync::Arc,
};

use common::{
    knobs::NODE_LANDSCAPE_AGGREGATOR_UPDATE_INTERVAL,
    CommonDataElements,
    DataModelId,
    NodeId,
    NodeRole,
    RequestId,
    WorkerInfo,
    DATASET_CDE_CODE,
};
use futures::future::join_all;
use parking_lot::RwLock;
use worker_client::{
    TaskChannel,
    WorkerClient,
};

use crate::registry::{
    DataModelRegistry,
    NodeRegistry,
    RegistrySnapshot,
    WorkerMetadata,
};

/// Continuously discovers workers and reconciles their advertised data
/// models into the published [`RegistrySnapshot`].
pub struct LandscapeAggregator {
    channel: Arc<dyn TaskChannel>,
    /// Queue addresses of the workers this federation is configured with.
    worker_addresses: Vec<String>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

fn aggregator_request_id() -> RequestId {
    "landscapeaggregator"
        .parse()
        .expect("static request id is valid")
}

impl LandscapeAggregator {
    pub fn new(channel: Arc<dyn TaskChannel>, worker_addresses: Vec<String>) -> Self {
        Self {
            channel,
            worker_addresses,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    /// The current snapshot: one atomic load, never blocked by a refresh.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().clone()
    }

    /// Run refresh cycles forever with the configured period.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.update_once().await;
            tokio::time::sleep(*NODE_LANDSCAPE_AGGREGATOR_UPDATE_INTERVAL).await;
        }
    }

    /// One full refresh cycle. Per-worker failures are logged and the
    /// worker dropped from the new snapshot; they never propagate.
    pub async fn update_once(&self) {
        let workers = self.fetch_worker_infos().await;
        let metadata = self.fetch_worker_metadata(&workers).await;
        let data_model_registry = crunch_data_model_registry(&metadata);
        let node_registry =
            NodeRegistry::new(workers.into_iter().map(|(_, info)| info).collect());

        let new_snapshot = RegistrySnapshot {
            node_registry,
            data_model_registry,
        };
        let old_snapshot = self.snapshot();
        log_federation_changes(&old_snapshot, &new_snapshot);
        *self.snapshot.write() = Arc::new(new_snapshot);
    }

    async fn fetch_worker_infos(&self) -> Vec<(String, WorkerInfo)> {
        let futures = self.worker_addresses.iter().map(|address| async move {
            let client = WorkerClient::for_address(
                address.clone(),
                aggregator_request_id(),
                self.channel.clone(),
            );
            match client.get_worker_info().await {
                Ok(info) => Some((address.clone(), info)),
                Err(e) => {
                    tracing::warn!(
                        address = %address,
                        "Dropping unresponsive worker from this scan: {e:#}"
                    );
                    None
                },
            }
        });
        join_all(futures).await.into_iter().flatten().collect()
    }

    async fn fetch_worker_metadata(
        &self,
        workers: &[(String, WorkerInfo)],
    ) -> BTreeMap<NodeId, WorkerMetadata> {
        let futures = workers
            .iter()
            .filter(|(_, info)| info.role == NodeRole::Local)
            .map(|(address, info)| async move {
                let client = WorkerClient::new(
                    info.id.clone(),
                    address.clone(),
                    aggregator_request_id(),
                    self.channel.clone(),
                );
                let mut metadata = WorkerMetadata::default();
                let datasets_per_data_model = match client.get_datasets_per_data_model().await {
                    Ok(datasets) => datasets,
                    Err(e) => {
                        tracing::warn!(node_id = %info.id, "Could not fetch datasets: {e:#}");
                        return (info.id.clone(), metadata);
                    },
                };
                for (data_model, datasets) in datasets_per_data_model {
                    match client.get_data_model_cdes(&data_model).await {
                        Ok(cdes) => {
                            metadata.data_models.insert(data_model, (datasets, cdes));
                        },
                        Err(e) => {
                            tracing::warn!(
                                node_id = %info.id,
                                data_model = %data_model,
                                "Could not fetch CDEs: {e:#}"
                            );
                        },
                    }
                }
                (info.id.clone(), metadata)
            });
        join_all(futures).await.into_iter().collect()
    }
}

/// Reconcile the per-worker metadata into one registry:
/// incompatibly-defined data models are rejected outright, the `dataset`
/// enumerations of the survivors are unioned across workers, and a dataset
/// advertised by more than one worker is dropped from the union.
pub fn crunch_data_model_registry(
    metadata_per_worker: &BTreeMap<NodeId, WorkerMetadata>,
) -> DataModelRegistry {
    let incompatible = find_incompatible_data_models(metadata_per_worker);

    // Dataset locations and labels, with duplicates removed.
    let mut locations: BTreeMap<DataModelId, BTreeMap<String, Vec<NodeId>>> = BTreeMap::new();
    let mut labels: BTreeMap<DataModelId, BTreeMap<String, String>> = BTreeMap::new();
    let mut cdes_per_model: BTreeMap<DataModelId, CommonDataElements> = BTreeMap::new();
    for (node_id, metadata) in metadata_per_worker {
        for (data_model, (datasets, cdes)) in &metadata.data_models {
            if incompatible.contains(data_model) {
                continue;
            }
            cdes_per_model.insert(data_model.clone(), cdes.clone());
            let model_locations = locations.entry(data_model.clone()).or_default();
            let model_labels = labels.entry(data_model.clone()).or_default();
            for (code, label) in datasets {
                model_locations
                    .entry(code.clone())
                    .or_default()
                    .push(node_id.clone());
                model_labels.insert(code.clone(), label.clone());
            }
        }
    }

    let mut datasets_locations: BTreeMap<DataModelId, BTreeMap<String, NodeId>> = BTreeMap::new();
    for (data_model, model_locations) in locations {
        let model_labels = labels.entry(data_model.clone()).or_default();
        let deduplicated = datasets_locations.entry(data_model.clone()).or_default();
        for (dataset, owners) in model_locations {
            match owners.as_slice() {
                [owner] => {
                    deduplicated.insert(dataset, owner.clone());
                },
                owners => {
                    model_labels.remove(&dataset);
                    tracing::info!(
                        data_model = %data_model,
                        dataset = %dataset,
                        workers = ?owners,
                        "Dataset is not unique in the federation; dropping it"
                    );
                },
            }
        }
    }

    // Patch the dataset CDE of every surviving data model with the unioned
    // enumerations.
    let data_models = cdes_per_model
        .into_iter()
        .map(|(data_model, cdes)| {
            let enumerations = labels.get(&data_model).cloned().unwrap_or_default();
            let cdes = cdes.with_dataset_enumerations(enumerations);
            (data_model, cdes)
        })
        .collect();

    DataModelRegistry {
        data_models,
        datasets_locations,
        dataset_labels: labels,
    }
}

fn find_incompatible_data_models(
    metadata_per_worker: &BTreeMap<NodeId, WorkerMetadata>,
) -> Vec<DataModelId> {
    let mut first_seen: BTreeMap<&DataModelId, (&NodeId, &CommonDataElements)> = BTreeMap::new();
    let mut incompatible = Vec::new();
    for (node_id, metadata) in metadata_per_worker {
        for (data_model, (_, cdes)) in &metadata.data_models {
            if incompatible.contains(data_model) {
                continue;
            }
            match first_seen.get(data_model) {
                Some((seen_node, seen_cdes)) => {
                    if !seen_cdes.is_compatible_with(cdes) {
                        tracing::info!(
                            data_model = %data_model,
                            workers = ?[seen_node, &node_id],
                            "Workers disagree on the data model definition; rejecting it"
                        );
                        incompatible.push(data_model.clone());
                    }
                },
                None => {
                    first_seen.insert(data_model, (node_id, cdes));
                },
            }
        }
    }
    incompatible
}

fn log_federation_changes(old: &RegistrySnapshot, new: &RegistrySnapshot) {
    let old_ids: Vec<&NodeId> = old.node_registry.workers().map(|w| &w.id).collect();
    let new_ids: Vec<&NodeId> = new.node_registry.workers().map(|w| &w.id).collect();
    for joined in new_ids.iter().filter(|id| !old_ids.contains(id)) {
        tracing::info!(node_id = %joined, "Worker joined the federation");
    }
    for left in old_ids.iter().filter(|id| !new_ids.contains(id)) {
        tracing::info!(node_id = %left, "Worker left the federation");
    }

    let old_models = &old.data_model_registry.datasets_locations;
    let new_models = &new.data_model_registry.datasets_locations;
    for (data_model, datasets) in new_models {
        match old_models.get(data_model) {
            None => tracing::info!(data_model = %data_model, "Data model became available"),
            Some(old_datasets) => {
                for added in datasets.keys().filter(|d| !old_datasets.contains_key(*d)) {
                    tracing::info!(data_model = %data_model, dataset = %added, "Dataset added");
                }
                for removed in old_datasets.keys().filter(|d| !datasets.contains_key(*d)) {
                    tracing::info!(data_model = %data_model, dataset = %removed, "Dataset removed");
                }
            },
        }
    }
    for data_model in old_models.keys().filter(|dm| !new_models.contains_key(dm)) {
        tracing::info!(data_model = %data_model, "Data model became unavailable");
    }
}
