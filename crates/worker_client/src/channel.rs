use std::time::Duration;

use async_trait::async_trait;
use common::task_dtos::{
    RemoteErrorKind,
    TaskRequest,
    TaskResponse,
};
use errors::ErrorMetadata;

/// The transport seam between the controller and a worker's task queue.
///
/// Implementations deliver [`TaskRequest`]s to the queue at
/// `queue_address`, wait at most `timeout` for the task to finish, and
/// surface failures as tagged errors: `Unreachable` for connect/queue
/// problems, `Timeout` for expired deadlines, and the worker's own error
/// classification for everything that ran remotely.
#[async_trait]
pub trait TaskChannel: Send + Sync + 'static {
    async fn call(
        &self,
        queue_address: &str,
        request: TaskRequest,
        timeout: Duration,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Convert a worker's response envelope into the controller-side error
/// taxonomy. Shared by every [`TaskChannel`] implementation.
pub fn result_from_response(
    task: &str,
    response: TaskResponse,
) -> anyhow::Result<serde_json::Value> {
    match response {
        TaskResponse::Success { result } => Ok(result),
        TaskResponse::Error {
            kind: RemoteErrorKind::User,
            message,
        } => Err(ErrorMetadata::bad_user_input("WorkerUserError", message).into()),
        TaskResponse::Error {
            kind: RemoteErrorKind::Internal,
            message,
        } => Err(ErrorMetadata::remote_internal(
            "WorkerTaskFailed",
            format!("Task {task} failed on worker: {message}"),
        )
        .into()),
    }
}

/// Task transport over HTTP/JSON: `POST http://{queue_address}/tasks/{task}`
/// with the request as body. Stands in front of whatever broker bridge the
/// deployment runs; the controller only sees this surface.
pub struct HttpTaskChannel {
    client: reqwest::Client,
}

impl HttpTaskChannel {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TaskChannel for HttpTaskChannel {
    async fn call(
        &self,
        queue_address: &str,
        request: TaskRequest,
        timeout: Duration,
    ) -> anyhow::Result<serde_json::Value> {
        let url = format!("http://{}/tasks/{}", queue_address, request.task);
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::Error::from(ErrorMetadata::timeout(
                        "WorkerTimeout",
                        format!(
                            "Task {} on {queue_address} exceeded its {:?} deadline",
                            request.task, timeout
                        ),
                    ))
                } else {
                    anyhow::Error::from(ErrorMetadata::unreachable(
                        "WorkerUnreachable",
                        format!("Could not reach worker queue at {queue_address}: {e}"),
                    ))
                }
            })?;
        let response: TaskResponse = response.json().await.map_err(|e| {
            ErrorMetadata::remote_internal(
                "WorkerBadResponse",
                format!("Worker at {queue_address} returned a malformed envelope: {e}"),
            )
        })?;
        result_from_response(&request.task, response)
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;

    use super::*;

    #[test]
    fn test_user_error_maps_to_bad_user_input() {
        let response = TaskResponse::Error {
            kind: RemoteErrorKind::User,
            message: "Log transformation cannot be applied to non-positive values in column 'x1'."
                .to_owned(),
        };
        let err = result_from_response("run_udf", response).unwrap_err();
        assert!(err.is_bad_user_input());
        assert!(err.msg().contains("non-positive values"));
    }

    #[test]
    fn test_internal_error_is_fatal() {
        let response = TaskResponse::Error {
            kind: RemoteErrorKind::Internal,
            message: "db exploded".to_owned(),
        };
        let err = result_from_response("create_table", response).unwrap_err();
        assert!(!err.is_bad_user_input());
        assert!(!err.is_retryable());
        assert_eq!(err.short_msg(), "WorkerTaskFailed");
    }
}
