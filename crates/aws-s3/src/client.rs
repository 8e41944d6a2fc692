//! Functionality for building AWS clients
use std::marker::PhantomData;

use aws_sdk_s3::{
    config::{
        interceptors::InterceptorContext,
        retry::{ClassifyRetry, RetryAction, RetryConfig},
    },
    error::ProvideErrorMetadata,
    operation::put_object::PutObjectError,
};
use aws_smithy_runtime_api::client::retries::classifiers::SharedRetryClassifier;

/// Build a configuration for the S3 client that will retry failed uploads, including
/// rate-limited requests.
pub fn build_s3_client_config(sdk_config: &aws_config::SdkConfig) -> aws_sdk_s3::config::Builder {
    let mut builder = aws_sdk_s3::config::Builder::from(sdk_config);

    let retry_config = RetryConfig::adaptive()
        .with_initial_backoff(std::time::Duration::from_secs(1))
        .with_max_attempts(4)
        .with_max_backoff(std::time::Duration::from_secs(10));

    builder.set_retry_config(Some(retry_config));

    // Uploads are the only operation the replicator performs.
    builder.push_retry_classifier(SharedRetryClassifier::new(RateLimitErrorClassifier::<
        PutObjectError,
    >::new()));

    builder
}

/// An error classifier that triggers retries on throttling errors that the SDK does not
/// classify on its own.
#[derive(Debug, Default)]
pub struct RateLimitErrorClassifier<E> {
    _marker: PhantomData<E>,
}

impl<E> RateLimitErrorClassifier<E> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

fn is_throttling_code(code: &str) -> bool {
    matches!(
        code,
        "ThrottlingException" | "SlowDown" | "RequestLimitExceeded"
    )
}

impl<E> ClassifyRetry for RateLimitErrorClassifier<E>
where
    // ProvideErrorMetadata lets us inspect the error code.
    E: std::error::Error + ProvideErrorMetadata + Send + Sync + 'static,
{
    fn classify_retry(&self, ctx: &InterceptorContext) -> RetryAction {
        let error = match ctx.output_or_error() {
            Some(Ok(_)) | None => return RetryAction::NoActionIndicated,
            Some(Err(err)) => err,
        };

        let throttled = error
            .as_operation_error()
            .and_then(|err| err.downcast_ref::<aws_sdk_s3::error::SdkError<E>>())
            .and_then(|err| err.as_service_error())
            .and_then(|err| err.code())
            .map(is_throttling_code)
            .unwrap_or(false);

        if throttled {
            RetryAction::throttling_error()
        } else {
            // Another classifier may still decide to retry.
            RetryAction::NoActionIndicated
        }
    }

    fn name(&self) -> &'static str {
        "S3 Throttling Classifier"
    }
}
