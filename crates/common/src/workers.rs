use serde::{
    Deserialize,
    Serialize,
};

use crate::ids::NodeId;

/// Whether a worker holds a private data slice (LOCAL) or acts as the
/// aggregation point of the federation (GLOBAL).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeRole {
    Global,
    Local,
}

/// A worker as advertised by its own info task. Known to the controller
/// only while the most recent landscape scan saw it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: NodeId,
    pub role: NodeRole,
    /// Address of the worker's task queue, e.g. `localnode1.example:5672`.
    pub queue_address: String,
    /// Address of the worker's columnar store, used when other workers
    /// mount remote tables against it.
    pub db_address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_format() {
        let info = WorkerInfo {
            id: "globalnode".parse().unwrap(),
            role: NodeRole::Global,
            queue_address: "global.example:5672".to_owned(),
            db_address: "global.example:50000".to_owned(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["role"], "GLOBAL");
        let back: WorkerInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
    }
}
