//! The node landscape aggregator.
//!
//! A long-running background task that periodically polls every configured
//! worker for its identity and data-model metadata, reconciles the answers
//! into an immutable [`RegistrySnapshot`], and atomically publishes it.
//! Readers obtain the current snapshot with a single cheap load and are
//! never blocked by a refresh; refresh failures never disturb the snapshot
//! already published.

mod aggregator;
mod registry;

pub use aggregator::LandscapeAggregator;
pub use registry::{
    DataModelRegistry,
    NodeRegistry,
    RegistrySnapshot,
    WorkerMetadata,
};
