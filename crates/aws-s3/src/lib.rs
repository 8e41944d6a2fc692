//! Copies trained model artifacts to Amazon S3.

use std::fmt::Debug;

use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use thiserror::Error;

mod client;
mod replicator;

pub use client::{build_s3_client_config, RateLimitErrorClassifier};
pub use replicator::{create_s3_client, S3Replicator};

/// An error from the AWS SDK, flattened to a message that includes the whole chain of causes.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct AwsError(String);

impl<E, R> From<SdkError<E, R>> for AwsError
where
    E: std::error::Error + 'static,
    R: Debug,
{
    fn from(err: SdkError<E, R>) -> Self {
        Self(DisplayErrorContext(&err).to_string())
    }
}
