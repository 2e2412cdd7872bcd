use aws_config::SdkConfig;
use aws_sdk_s3::error::{BuildError, DisplayErrorContext};
use aws_sdk_s3::types::{
    BucketLifecycleConfiguration, BucketLocationConstraint, CreateBucketConfiguration,
    ExpirationStatus, LifecycleExpiration, LifecycleRule, LifecycleRuleFilter,
};
use tracing::info;

use crate::config::{Config, Region};
use crate::error::ApplicationError;
use crate::store::S3ClientPool;

/// Lifecycle rule id installed on every cache bucket.
pub const LIFECYCLE_RULE_ID: &str = "proxxy";

/// Create each region's bucket and install the expiration rule.
///
/// Safe to run repeatedly: a bucket we already own is left as is and the
/// lifecycle configuration is overwritten.
pub async fn provision_buckets(config: &Config, sdk_config: &SdkConfig) -> crate::Result<()> {
    let pool = S3ClientPool::new(sdk_config, config);
    let lifecycle = lifecycle_configuration(config.expiration_days)
        .map_err(|err| ApplicationError::Internal(err.to_string()))?;

    for region in &config.regions {
        let client = pool
            .client(&region.id)
            .map_err(|err| ApplicationError::Store(err.to_string()))?
            .client;

        create_bucket(&client, region).await?;

        client
            .put_bucket_lifecycle_configuration()
            .bucket(&region.bucket)
            .lifecycle_configuration(lifecycle.clone())
            .send()
            .await
            .map_err(|err| {
                ApplicationError::Store(format!(
                    "put lifecycle on {}: {}",
                    region.bucket,
                    DisplayErrorContext(&err)
                ))
            })?;

        info!(
            region = %region.id,
            bucket = %region.bucket,
            expiration_days = config.expiration_days,
            "bucket provisioned"
        );
    }

    Ok(())
}

async fn create_bucket(client: &aws_sdk_s3::Client, region: &Region) -> crate::Result<()> {
    let mut request = client.create_bucket().bucket(&region.bucket);
    if let Some(configuration) = bucket_configuration(region) {
        request = request.create_bucket_configuration(configuration);
    }

    match request.send().await {
        Ok(_) => {
            info!(bucket = %region.bucket, location = %region.location, "created bucket");
            Ok(())
        }
        Err(err)
            if err
                .as_service_error()
                .is_some_and(|err| err.is_bucket_already_owned_by_you()) =>
        {
            info!(bucket = %region.bucket, "bucket already exists");
            Ok(())
        }
        Err(err) => Err(ApplicationError::Store(format!(
            "create bucket {}: {}",
            region.bucket,
            DisplayErrorContext(&err)
        ))),
    }
}

/// `None` for the store's default location, which must not be sent explicitly.
fn bucket_configuration(region: &Region) -> Option<CreateBucketConfiguration> {
    if region.location.is_empty() {
        return None;
    }

    Some(
        CreateBucketConfiguration::builder()
            .location_constraint(BucketLocationConstraint::from(region.location.as_str()))
            .build(),
    )
}

/// Expire every object in the bucket `days` after it was written.
pub fn lifecycle_configuration(days: i32) -> Result<BucketLifecycleConfiguration, BuildError> {
    let rule = LifecycleRule::builder()
        .id(LIFECYCLE_RULE_ID)
        .filter(LifecycleRuleFilter::builder().prefix("").build())
        .status(ExpirationStatus::Enabled)
        .expiration(LifecycleExpiration::builder().days(days).build())
        .build()?;

    BucketLifecycleConfiguration::builder().rules(rule).build()
}
