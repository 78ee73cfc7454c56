//! Tunable limits and parameters for the federation services.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. Each one should have a comment explaining what it is for so an
//! oncall engineer can adjust it safely.

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

/// Advertised address of this worker's task queue broker. Returned by the
/// worker info task so the controller can route follow-up calls.
pub static RABBITMQ_ENDPOINT: LazyLock<String> =
    LazyLock::new(|| env_config("RABBITMQ_ENDPOINT", "localhost:5672".to_owned()));

/// Deadline for ordinary worker tasks (table creation, views, cleanup).
pub static CELERY_TASKS_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("CELERY_TASKS_TIMEOUT", 120)));

/// Deadline for `run_udf` tasks, which may run long numeric kernels.
pub static CELERY_RUN_UDF_TASK_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("CELERY_RUN_UDF_TASK_TIMEOUT", 600)));

/// Whether secure-transfer outputs are aggregated through the SMPC cluster
/// instead of in-database.
pub static SMPC_ENABLED: LazyLock<bool> = LazyLock::new(|| env_config("SMPC_ENABLED", false));

/// When SMPC is enabled, whether algorithms may still opt out per request.
pub static SMPC_OPTIONAL: LazyLock<bool> = LazyLock::new(|| env_config("SMPC_OPTIONAL", false));

/// Base URL of the SMPC coordinator.
pub static SMPC_COORDINATOR_URL: LazyLock<String> =
    LazyLock::new(|| env_config("SMPC_COORDINATOR_URL", "http://localhost:12314".to_owned()));

/// How long to wait for an SMPC job before failing the step.
pub static SMPC_GET_RESULT_MAX_WAIT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SMPC_GET_RESULT_MAX_WAIT", 120)));

/// Period of the node landscape aggregator's refresh loop.
pub static NODE_LANDSCAPE_AGGREGATOR_UPDATE_INTERVAL: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("NODE_LANDSCAPE_AGGREGATOR_UPDATE_INTERVAL", 30))
});

/// When set, worker tables holding row-level data are never readable through
/// the cross-worker table data task. Only disable in test deployments.
pub static PROTECT_LOCAL_DATA: LazyLock<bool> =
    LazyLock::new(|| env_config("PROTECT_LOCAL_DATA", true));

/// Privacy floor: a data view with fewer rows than this fails creation.
pub static MINIMUM_ROW_COUNT: LazyLock<usize> =
    LazyLock::new(|| env_config("MINIMUM_ROW_COUNT", 10));

/// Period of the cleaner's drain loop.
pub static CLEANUP_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("CLEANUP_INTERVAL", 30)));

/// How long a released context may linger before its first cleanup attempt.
pub static CLEANUP_GRACE_PERIOD: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("CLEANUP_GRACE_PERIOD", 60)));

/// How many times the executor re-dispatches a step that failed with a
/// retryable error before aborting the algorithm.
pub static STEP_RETRY_LIMIT: LazyLock<u32> = LazyLock::new(|| env_config("STEP_RETRY_LIMIT", 1));
