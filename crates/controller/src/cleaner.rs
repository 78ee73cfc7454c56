//! The cleaner guarantees eventual release of per-execution resources.
//!
//! The executor never holds a reference to the cleaner; it emits
//! [`CleanupEvent`]s into a channel the cleaner consumes. Each context maps
//! to the set of workers that observed any of its artifacts; the drain
//! loop keeps issuing `cleanup` to those workers until every one has
//! confirmed, however long a worker stays unreachable.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use common::{
    knobs::{
        CLEANUP_GRACE_PERIOD,
        CLEANUP_INTERVAL,
    },
    ContextId,
    NodeId,
    RequestId,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use worker_client::{
    TaskChannel,
    WorkerClient,
};

/// A worker as the cleaner needs to address it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRef {
    pub node_id: NodeId,
    pub queue_address: String,
}

#[derive(Clone, Debug)]
pub enum CleanupEvent {
    /// A context was accepted; these workers may hold its artifacts.
    ContextCreated {
        context_id: ContextId,
        nodes: Vec<NodeRef>,
    },
    /// A worker observed an artifact of the context after creation (e.g. a
    /// remote table was mounted on it).
    NodeTouched {
        context_id: ContextId,
        node: NodeRef,
    },
    /// The executor finished with the context; after the grace period its
    /// artifacts may be dropped.
    ContextReleased { context_id: ContextId },
}

struct ContextEntry {
    nodes: BTreeMap<NodeId, String>,
    released_at: Option<Instant>,
}

pub struct Cleaner {
    channel: Arc<dyn TaskChannel>,
    grace_period: Duration,
    contexts: Mutex<BTreeMap<ContextId, ContextEntry>>,
}

fn cleaner_request_id() -> RequestId {
    "cleaner".parse().expect("static request id is valid")
}

impl Cleaner {
    pub fn new(channel: Arc<dyn TaskChannel>, grace_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            channel,
            grace_period,
            contexts: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn from_knobs(channel: Arc<dyn TaskChannel>) -> Arc<Self> {
        Self::new(channel, *CLEANUP_GRACE_PERIOD)
    }

    pub fn apply_event(&self, event: CleanupEvent) {
        let mut contexts = self.contexts.lock();
        match event {
            CleanupEvent::ContextCreated { context_id, nodes } => {
                let entry = contexts.entry(context_id).or_insert(ContextEntry {
                    nodes: BTreeMap::new(),
                    released_at: None,
                });
                for node in nodes {
                    entry.nodes.insert(node.node_id, node.queue_address);
                }
            },
            CleanupEvent::NodeTouched { context_id, node } => {
                let entry = contexts.entry(context_id).or_insert(ContextEntry {
                    nodes: BTreeMap::new(),
                    released_at: None,
                });
                entry.nodes.insert(node.node_id, node.queue_address);
            },
            CleanupEvent::ContextReleased { context_id } => {
                if let Some(entry) = contexts.get_mut(&context_id) {
                    entry.released_at = Some(Instant::now());
                } else {
                    tracing::warn!(
                        context_id = %context_id,
                        "Release for an unknown context; nothing to clean"
                    );
                }
            },
        }
    }

    /// Contexts still awaiting cleanup on at least one worker.
    pub fn pending_contexts(&self) -> Vec<ContextId> {
        self.contexts.lock().keys().cloned().collect()
    }

    /// Visit every released context past its grace period and try to drop
    /// its artifacts on each remaining worker. Workers that confirm are
    /// removed; unreachable ones stay for the next sweep.
    pub async fn sweep_once(&self) {
        let due: Vec<(ContextId, Vec<NodeRef>)> = {
            let contexts = self.contexts.lock();
            contexts
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .released_at
                        .is_some_and(|at| at.elapsed() >= self.grace_period)
                })
                .map(|(context_id, entry)| {
                    let nodes = entry
                        .nodes
                        .iter()
                        .map(|(node_id, queue_address)| NodeRef {
                            node_id: node_id.clone(),
                            queue_address: queue_address.clone(),
                        })
                        .collect();
                    (context_id.clone(), nodes)
                })
                .collect()
        };

        for (context_id, nodes) in due {
            for node in nodes {
                let client = WorkerClient::new(
                    node.node_id.clone(),
                    node.queue_address.clone(),
                    cleaner_request_id(),
                    self.channel.clone(),
                );
                match client.cleanup(&context_id).await {
                    Ok(()) => {
                        let mut contexts = self.contexts.lock();
                        if let Some(entry) = contexts.get_mut(&context_id) {
                            entry.nodes.remove(&node.node_id);
                            if entry.nodes.is_empty() {
                                contexts.remove(&context_id);
                                tracing::info!(
                                    context_id = %context_id,
                                    "Context fully cleaned up"
                                );
                            }
                        }
                    },
                    Err(e) => {
                        tracing::warn!(
                            context_id = %context_id,
                            node_id = %node.node_id,
                            "Cleanup attempt failed; will retry next sweep: {e:#}"
                        );
                    },
                }
            }
        }
    }

    /// Consume executor events and sweep on the configured period.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<CleanupEvent>) {
        let mut interval = tokio::time::interval(*CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.apply_event(event),
                    // All senders dropped: drain what is left, then stop.
                    None => {
                        self.sweep_once().await;
                        return;
                    },
                },
                _ = interval.tick() => self.sweep_once().await,
            }
        }
    }
}
