use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use error_stack::{Report, ResultExt};
use marketsight_job_manager::{JobError, ReplicationConfig, Replicator};
use tracing::{event, instrument, Level};

use crate::{build_s3_client_config, AwsError};

/// Create an S3 client from the default AWS configuration, optionally overriding the region.
pub async fn create_s3_client(region: Option<String>) -> aws_sdk_s3::Client {
    let mut loader = aws_config::from_env();
    if let Some(region) = region {
        loader = loader.region(aws_config::Region::new(region));
    }

    let sdk_config = loader.load().await;
    aws_sdk_s3::Client::from_conf(build_s3_client_config(&sdk_config).build())
}

/// A [Replicator] that uploads artifacts to a single S3 bucket.
#[derive(Clone)]
pub struct S3Replicator {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl std::fmt::Debug for S3Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Replicator")
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl S3Replicator {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a replicator for the configured bucket and region.
    pub async fn from_config(config: &ReplicationConfig) -> Self {
        let client = create_s3_client(config.region.clone()).await;
        Self::new(client, &config.bucket)
    }

    /// The URI of the object stored under `key`.
    pub fn object_uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl Replicator for S3Replicator {
    #[instrument(level = "debug", skip(self), fields(bucket = %self.bucket))]
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String, Report<JobError>> {
        let key = key.trim_start_matches('/');
        let body = ByteStream::from_path(local_path)
            .await
            .change_context(JobError::Replication)
            .attach_printable_lazy(|| format!("Reading {}", local_path.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(AwsError::from)
            .change_context(JobError::Replication)
            .attach_printable_lazy(|| format!("Writing artifact {}", self.object_uri(key)))?;

        let uri = self.object_uri(key);
        event!(Level::DEBUG, %uri, "Uploaded artifact");
        Ok(uri)
    }
}
