//! Types and helpers shared by every crate in the federation workspace:
//! identifiers, the table name grammar, data model metadata, environment
//! knobs and the tracing setup.

pub mod backoff;
pub mod data_model;
pub mod dtype;
pub mod env;
pub mod ids;
pub mod knobs;
pub mod tables;
pub mod task_dtos;
pub mod workers;

pub use data_model::{
    CommonDataElement,
    CommonDataElements,
    DataModelId,
    DATASET_CDE_CODE,
};
pub use dtype::DType;
pub use ids::{
    CommandId,
    ContextId,
    NodeId,
    RequestId,
};
pub use tables::{
    ColumnData,
    ColumnInfo,
    TableData,
    TableInfo,
    TableName,
    TableSchema,
    TableType,
};
pub use workers::{
    NodeRole,
    WorkerInfo,
};
