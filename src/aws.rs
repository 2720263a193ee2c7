//! Shared AWS SDK plumbing: configuration loading and error classification.

use aws_config::BehaviorVersion;
use aws_config::meta::region::RegionProviderChain;
use aws_config::retry::{RetryConfig, RetryMode};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::RemoteError;

const NOT_FOUND_CODES: &[&str] = &[
    "NotFound",
    "NoSuchKey",
    "NoSuchBucket",
    "NoSuchEntity",
    "ResourceNotFoundException",
];

const DENIED_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "Forbidden",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "UnrecognizedClientException",
];

const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "TooManyRequestsException",
    "LimitExceededException",
    "SlowDown",
    "RequestTimeout",
    "InternalError",
    "InternalFailure",
    "InternalServerException",
    "ServiceUnavailable",
    "ServiceUnavailableException",
];

const CONFLICT_CODES: &[&str] = &[
    "BucketAlreadyOwnedByYou",
    "EntityAlreadyExists",
    "ConflictException",
];

/// Load the shared SDK configuration once per run.
pub async fn load_sdk_config(storage: &StorageConfig) -> aws_config::SdkConfig {
    let retry_config = RetryConfig::standard()
        .with_max_attempts(3)
        .with_retry_mode(RetryMode::Standard);

    let region_provider = RegionProviderChain::first_try(storage.region.clone().map(aws_config::Region::new))
        .or_default_provider()
        .or_else("us-east-1");

    aws_config::defaults(BehaviorVersion::latest())
        .region(region_provider)
        .retry_config(retry_config)
        .load()
        .await
}

/// Map an SDK error of any AWS service onto a [`RemoteError`].
pub fn classify<E, R>(err: SdkError<E, R>) -> RemoteError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            RemoteError::Transient(message)
        }
        SdkError::ConstructionFailure(_) => RemoteError::Invalid(message),
        _ => {
            let code = err.code().unwrap_or_default();
            debug!("AWS error code '{}': {}", code, message);
            classify_code(code, message)
        }
    }
}

/// Map a service error code onto a [`RemoteError`].
pub fn classify_code(code: &str, message: String) -> RemoteError {
    if NOT_FOUND_CODES.contains(&code) {
        RemoteError::NotFound(message)
    } else if DENIED_CODES.contains(&code) {
        RemoteError::Denied(message)
    } else if TRANSIENT_CODES.contains(&code) {
        RemoteError::Transient(message)
    } else if CONFLICT_CODES.contains(&code) {
        RemoteError::Conflict(message)
    } else {
        RemoteError::Invalid(message)
    }
}
