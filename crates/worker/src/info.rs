use common::WorkerInfo;

use crate::WorkerConfig;

pub fn get_worker_info(config: &WorkerConfig) -> WorkerInfo {
    WorkerInfo {
        id: config.identifier.clone(),
        role: config.role,
        queue_address: config.queue_address.clone(),
        db_address: config.db_address.clone(),
    }
}
