//! AWS implementation of the [`CloudAutoscaler`] trait.
//!
//! Region discovery order: the `AWS_REGION` environment variable, then the
//! instance metadata service under a short timeout. When neither yields a
//! region the adapter runs in dry-run mode: every operation reports
//! `Ok(None)` and the service keeps working for debugging, issuing no cloud
//! mutations.

use async_trait::async_trait;
use aws_config::meta::region::ProvideRegion;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_autoscaling::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_cloudwatch::types::{Dimension, MetricDatum, StandardUnit};
use ci_scaler_core::{AsgDescription, CloudAutoscaler, CloudError};
use std::time::Duration;
use tracing::info;

/// Namespace all fleet metrics are published under.
pub const METRIC_NAMESPACE: &str = "ci-storage/metrics";

const METADATA_TIMEOUT: Duration = Duration::from_secs(3);

struct Clients {
    autoscaling: aws_sdk_autoscaling::Client,
    cloudwatch: aws_sdk_cloudwatch::Client,
}

/// The AWS-backed cloud adapter.
pub struct AwsCloud {
    region: Option<String>,
    clients: Option<Clients>,
}

impl AwsCloud {
    /// Resolve the region and build the API clients; enters dry-run mode
    /// when no region is discoverable.
    pub async fn connect() -> Self {
        let Some(region) = resolve_region().await else {
            return Self::disconnected();
        };
        info!(%region, "using AWS region");
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .load()
            .await;
        Self {
            region: Some(region),
            clients: Some(Clients {
                autoscaling: aws_sdk_autoscaling::Client::new(&shared),
                cloudwatch: aws_sdk_cloudwatch::Client::new(&shared),
            }),
        }
    }

    /// A dry-run adapter that never talks to the cloud.
    pub fn disconnected() -> Self {
        Self {
            region: None,
            clients: None,
        }
    }

    async fn set_desired_capacity(
        &self,
        clients: &Clients,
        name: &str,
        desired: i64,
    ) -> Result<(), SdkError<aws_sdk_autoscaling::operation::set_desired_capacity::SetDesiredCapacityError>>
    {
        clients
            .autoscaling
            .set_desired_capacity()
            .auto_scaling_group_name(name)
            .desired_capacity(desired as i32)
            .send()
            .await?;
        Ok(())
    }

    async fn terminate(
        &self,
        clients: &Clients,
        instance_id: &str,
        decrement_desired: bool,
    ) -> Result<
        (),
        SdkError<
            aws_sdk_autoscaling::operation::terminate_instance_in_auto_scaling_group::TerminateInstanceInAutoScalingGroupError,
        >,
    > {
        clients
            .autoscaling
            .terminate_instance_in_auto_scaling_group()
            .instance_id(instance_id)
            .should_decrement_desired_capacity(decrement_desired)
            .send()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CloudAutoscaler for AwsCloud {
    fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    async fn describe_asg(&self, name: &str) -> Result<Option<AsgDescription>, CloudError> {
        let Some(clients) = &self.clients else {
            return Ok(None);
        };
        let output = clients
            .autoscaling
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(name)
            .send()
            .await
            .map_err(to_cloud_error)?;
        let group = output
            .auto_scaling_groups()
            .first()
            .ok_or_else(|| CloudError::AsgNotFound {
                name: name.to_string(),
            })?;
        Ok(Some(AsgDescription {
            desired_capacity: i64::from(group.desired_capacity().unwrap_or(0)),
            min_size: i64::from(group.min_size().unwrap_or(0)),
            max_size: i64::from(group.max_size().unwrap_or(0)),
        }))
    }

    async fn increment_desired_capacity(
        &self,
        name: &str,
        inc: i64,
    ) -> Result<Option<()>, CloudError> {
        let Some(clients) = &self.clients else {
            return Ok(None);
        };
        let Some(description) = self.describe_asg(name).await? else {
            return Ok(None);
        };
        let desired = clamped_target(&description, inc);
        match self.set_desired_capacity(clients, name, desired).await {
            Ok(()) => Ok(Some(())),
            // "New SetDesiredCapacity value N is above max value M for the
            // AutoScalingGroup" - re-read and settle for the max once, in
            // case another writer raced us.
            Err(e) if message_contains(&e, "above") => {
                let Some(description) = self.describe_asg(name).await? else {
                    return Ok(None);
                };
                self.set_desired_capacity(clients, name, description.max_size)
                    .await
                    .map_err(to_cloud_error)?;
                Ok(Some(()))
            }
            Err(e) => Err(to_cloud_error(e)),
        }
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<Option<()>, CloudError> {
        let Some(clients) = &self.clients else {
            return Ok(None);
        };
        match self.terminate(clients, instance_id, true).await {
            Ok(()) => Ok(Some(())),
            // "Terminating instance without replacement will violate group's
            // min size constraint. Either set shouldDecrementDesiredCapacity
            // flag to false or lower group's min size." - retry keeping the
            // desired capacity.
            Err(e) if message_contains(&e, "shouldDecrementDesiredCapacity") => {
                self.terminate(clients, instance_id, false)
                    .await
                    .map_err(to_cloud_error)?;
                Ok(Some(()))
            }
            // The instance is already gone; mission accomplished.
            Err(e) if message_contains(&e, "not found") => Ok(Some(())),
            Err(e) => Err(to_cloud_error(e)),
        }
    }

    async fn put_metric_data(
        &self,
        metrics: &[(String, i64)],
        dimensions: &[(String, String)],
    ) -> Result<Option<()>, CloudError> {
        let Some(clients) = &self.clients else {
            return Ok(None);
        };
        let dimensions: Vec<Dimension> = dimensions
            .iter()
            .map(|(name, value)| Dimension::builder().name(name).value(value).build())
            .collect();
        let data: Vec<MetricDatum> = metrics
            .iter()
            .map(|(name, value)| {
                MetricDatum::builder()
                    .metric_name(name)
                    .value(*value as f64)
                    .unit(StandardUnit::None)
                    .storage_resolution(1)
                    .set_dimensions(Some(dimensions.clone()))
                    .build()
            })
            .collect();
        clients
            .cloudwatch
            .put_metric_data()
            .namespace(METRIC_NAMESPACE)
            .set_metric_data(Some(data))
            .send()
            .await
            .map_err(to_cloud_error)?;
        Ok(Some(()))
    }
}

/// The capacity to command: the increment applied to the current desired
/// value, clamped into the group's `[min, max]`.
fn clamped_target(description: &AsgDescription, inc: i64) -> i64 {
    (description.desired_capacity + inc).clamp(description.min_size, description.max_size)
}

async fn resolve_region() -> Option<String> {
    if let Ok(region) = std::env::var("AWS_REGION") {
        if !region.is_empty() {
            return Some(region);
        }
    }
    let provider = aws_config::imds::region::ImdsRegionProvider::builder().build();
    match tokio::time::timeout(METADATA_TIMEOUT, provider.region()).await {
        Ok(Some(region)) => Some(region.to_string()),
        _ => None,
    }
}

fn message_contains<E, R>(error: &SdkError<E, R>, needle: &str) -> bool
where
    E: ProvideErrorMetadata,
{
    error
        .as_service_error()
        .and_then(ProvideErrorMetadata::message)
        .is_some_and(|message| message.contains(needle))
}

fn to_cloud_error<E, R>(error: SdkError<E, R>) -> CloudError
where
    E: ProvideErrorMetadata,
    SdkError<E, R>: std::fmt::Display,
{
    let message = error
        .as_service_error()
        .and_then(ProvideErrorMetadata::message)
        .map(str::to_owned)
        .unwrap_or_else(|| error.to_string());
    CloudError::Api { message }
}

#[cfg(test)]
#[path = "aws_tests.rs"]
mod tests;
