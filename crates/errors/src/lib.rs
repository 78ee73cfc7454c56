use std::{
    borrow::Cow,
    sync::LazyLock,
};

use http::StatusCode;

/// HTTP status returned to clients when a request was well formed but named
/// data the federation cannot serve (unknown data model, missing dataset,
/// parameter out of range). Kept distinct from 400 so that portals can show
/// the message verbatim to the requesting researcher.
pub static BAD_USER_INPUT_STATUS: LazyLock<StatusCode> =
    LazyLock::new(|| StatusCode::from_u16(460).expect("460 is within the valid status range"));

/// `ErrorMetadata` can be attached to an anyhow error chain via
/// `.context(e /* ErrorMetadata */)`. It tags an error with enough
/// information to classify it at every boundary: retry policy in the
/// executor, status code at the HTTP facade, log level in the aggregator.
///
/// The `msg` is conveyed as a user facing message if the error reaches the
/// facade. The `short_msg` is a stable tag (ScreamingCamelCase) usable in
/// tests and metrics, resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// Short ScreamingCamelCase tag, e.g. `DatasetUnavailable`.
    pub short_msg: Cow<'static, str>,
    /// Human readable description targeted at the caller.
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The request body did not parse or named an unknown algorithm.
    BadRequest,
    /// The request was well formed but references data the federation does
    /// not hold, or a worker rejected the computation as a user error.
    BadUserInput,
    /// The registry rejected a data model advertised inconsistently.
    Incompatible,
    /// A worker's task queue could not be reached.
    Unreachable,
    /// A worker call exceeded its deadline.
    Timeout,
    /// A worker failed internally while executing a task.
    RemoteInternal,
    /// The SMPC cluster rejected or failed an aggregation job.
    SmpcFailure,
    /// An algorithm definition violated the UDF I/O contract.
    UdfContractViolation,
    /// The algorithm's driving task was cancelled.
    Cancelled,
}

impl ErrorMetadata {
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Bad user input. Maps to 460 at the facade; never retried.
    pub fn bad_user_input(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadUserInput,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn incompatible(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Incompatible,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Worker unreachable. Retryable by the caller's policy.
    pub fn unreachable(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unreachable,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Worker call deadline exceeded. Retryable by the caller's policy.
    pub fn timeout(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Timeout,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Worker-side internal failure. Fatal for the running algorithm.
    pub fn remote_internal(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::RemoteInternal,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn smpc_failure(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::SmpcFailure,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Always fatal: indicates a bug in an algorithm definition, not in the
    /// request.
    pub fn udf_contract_violation(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::UdfContractViolation,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn cancelled(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Cancelled,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn is_bad_user_input(&self) -> bool {
        matches!(self.code, ErrorCode::BadUserInput)
    }

    /// Unreachable and Timeout are the only codes a caller may retry; every
    /// other code reflects a deterministic failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code, ErrorCode::Unreachable | ErrorCode::Timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.code, ErrorCode::Cancelled)
    }

    pub fn http_status_code(&self) -> StatusCode {
        match self.code {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::BadUserInput => *BAD_USER_INPUT_STATUS,
            ErrorCode::Unreachable | ErrorCode::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Cancelled => StatusCode::REQUEST_TIMEOUT,
            ErrorCode::Incompatible
            | ErrorCode::RemoteInternal
            | ErrorCode::SmpcFailure
            | ErrorCode::UdfContractViolation => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Extension trait mirroring the `ErrorMetadata` helpers on an entire
/// `anyhow::Error` chain. An untagged error is treated as internal.
pub trait ErrorMetadataAnyhowExt {
    fn is_bad_user_input(&self) -> bool;
    fn is_retryable(&self) -> bool;
    fn is_cancelled(&self) -> bool;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn http_status(&self) -> StatusCode;
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self;
}

pub const INTERNAL_SERVER_ERROR_MSG: &str = "Internal server error";
const INTERNAL_SERVER_ERROR_TAG: &str = "InternalServerError";

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn is_bad_user_input(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(|e| e.is_bad_user_input())
    }

    fn is_retryable(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(|e| e.is_retryable())
    }

    fn is_cancelled(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(|e| e.is_cancelled())
    }

    fn short_msg(&self) -> &str {
        self.downcast_ref::<ErrorMetadata>()
            .map(|e| &*e.short_msg)
            .unwrap_or(INTERNAL_SERVER_ERROR_TAG)
    }

    fn msg(&self) -> &str {
        self.downcast_ref::<ErrorMetadata>()
            .map(|e| &*e.msg)
            .unwrap_or(INTERNAL_SERVER_ERROR_MSG)
    }

    fn http_status(&self) -> StatusCode {
        self.downcast_ref::<ErrorMetadata>()
            .map(|e| e.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self {
        match self.downcast::<ErrorMetadata>() {
            Ok(e) => f(e).into(),
            Err(other) => other,
        }
    }
}

/// Log an error that is being swallowed rather than propagated (the
/// aggregator's policy for per-worker failures).
pub fn report_error(e: &anyhow::Error) {
    tracing::error!("Caught error (actual error may be reported above): {e:#}");
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use http::StatusCode;

    use super::*;

    #[test]
    fn test_tagged_error_roundtrips_through_anyhow() {
        let e: anyhow::Error = ErrorMetadata::bad_user_input(
            "DatasetUnavailable",
            "Dataset 'ppmi0' is not available in data model 'dementia:0.1'",
        )
        .into();
        let e = e.context("while validating request");
        assert!(e.is_bad_user_input());
        assert!(!e.is_retryable());
        assert_eq!(e.short_msg(), "DatasetUnavailable");
        assert_eq!(e.http_status(), StatusCode::from_u16(460).unwrap());
    }

    #[test]
    fn test_untagged_error_is_internal() {
        let e = anyhow::anyhow!("plain failure");
        assert!(!e.is_bad_user_input());
        assert_eq!(e.short_msg(), "InternalServerError");
        assert_eq!(e.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_retryable_codes() {
        let unreachable: anyhow::Error =
            ErrorMetadata::unreachable("WorkerUnreachable", "queue down").into();
        let timeout: anyhow::Error = ErrorMetadata::timeout("WorkerTimeout", "call expired").into();
        let internal: anyhow::Error =
            ErrorMetadata::remote_internal("WorkerFailed", "db exploded").into();
        assert!(unreachable.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!internal.is_retryable());
    }

    #[test]
    fn test_map_error_metadata_preserves_untagged() {
        let e = anyhow::anyhow!("plain failure")
            .map_error_metadata(|m| ErrorMetadata::bad_request("X", m.msg));
        assert_eq!(e.short_msg(), "InternalServerError");
    }
}
