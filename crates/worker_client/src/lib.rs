//! Typed RPC client for one worker's task queue.
//!
//! The broker itself is an external collaborator: this crate only defines
//! the [`TaskChannel`] seam it is consumed through, an HTTP/JSON channel
//! implementation, and the typed [`WorkerClient`] surface the rest of the
//! controller calls. Every call carries a `request_id` for log correlation
//! and a bounded timeout. The wire DTOs live in [`common::task_dtos`],
//! shared with the worker-side task service.

mod channel;
mod client;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use channel::{
    HttpTaskChannel,
    TaskChannel,
};
pub use client::WorkerClient;
pub use common::task_dtos::{
    RemoteErrorKind,
    SmpcTablesInfo,
    TaskRequest,
    TaskResponse,
    UdfArgument,
    UdfResult,
    ViewSpec,
};
