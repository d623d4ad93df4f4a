//! AWS SDK implementations of the collaborator traits.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_autoscaling::Client as AutoscalingClient;
use aws_sdk_ec2::types::{Filter, Tag};
use aws_sdk_ec2::Client as Ec2Client;
use aws_sdk_sns::Client as SnsClient;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client as SqsClient;
use tracing::{debug, info};

use super::{
    ApiError, GroupClient, GroupDescription, InstanceClient, QueueClient, RawMessage, Result,
    TopicClient, INSTANCE_LAUNCH_EVENT,
};
use crate::tagger::TagSet;

/// Maximum records requested when describing specific groups.
const DESCRIBE_GROUPS_MAX_RECORDS: i32 = 100;

/// Connection settings for the AWS clients.
#[derive(Clone, Debug, Default)]
pub struct AwsSettings {
    /// AWS region (e.g., "us-east-1"). Uses default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack or testing).
    pub endpoint_url: Option<String>,
}

/// All four AWS service clients, sharing one loaded SDK config.
#[derive(Clone, Debug)]
pub struct SdkClients {
    sqs: SqsClient,
    sns: SnsClient,
    autoscaling: AutoscalingClient,
    ec2: Ec2Client,
}

impl SdkClients {
    /// Load AWS configuration from the default provider chain.
    pub async fn load(settings: &AwsSettings) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region) = settings.region {
            aws_config_builder =
                aws_config_builder.region(aws_config::Region::new(region.clone()));
        }

        if let Some(ref endpoint) = settings.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        info!(
            region = ?settings.region,
            endpoint = ?settings.endpoint_url,
            "Loaded AWS configuration"
        );

        Self::from_conf(&aws_config)
    }

    /// Create clients from an existing SDK config.
    pub fn from_conf(config: &aws_config::SdkConfig) -> Self {
        Self {
            sqs: SqsClient::new(config),
            sns: SnsClient::new(config),
            autoscaling: AutoscalingClient::new(config),
            ec2: Ec2Client::new(config),
        }
    }
}

/// Some output members are modelled as required (`&str`) and others as
/// optional (`Option<&str>`); accept either.
fn text<'a>(value: impl Into<Option<&'a str>>) -> Option<&'a str> {
    value.into()
}

#[async_trait]
impl QueueClient for SdkClients {
    async fn queue_url(&self, queue_name: &str) -> Result<String> {
        let output = self
            .sqs
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| {
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_queue_does_not_exist())
                {
                    ApiError::NotFound(queue_name.to_string())
                } else {
                    ApiError::Service(format!("Failed to get SQS queue URL: {}", e))
                }
            })?;

        output
            .queue_url()
            .map(str::to_string)
            .ok_or(ApiError::MissingField("QueueUrl"))
    }

    async fn queue_arn(&self, queue_url: &str) -> Result<String> {
        let output = self
            .sqs
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| ApiError::Service(format!("Failed to get queue ARN: {}", e)))?;

        output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or(ApiError::MissingField("QueueArn"))
    }

    async fn receive(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_secs: i32,
    ) -> Result<Vec<RawMessage>> {
        let output = self
            .sqs
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_time_secs)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| ApiError::Service(format!("Failed to receive SQS messages: {}", e)))?;

        Ok(output
            .messages()
            .iter()
            .map(|m| RawMessage {
                receipt_handle: m.receipt_handle().map(str::to_string),
                body: m.body().map(str::to_string),
            })
            .collect())
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        self.sqs
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| ApiError::Service(format!("Failed to delete SQS message: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl TopicClient for SdkClients {
    async fn topic_attributes(&self, topic_arn: &str) -> Result<()> {
        self.sns
            .get_topic_attributes()
            .topic_arn(topic_arn)
            .send()
            .await
            .map_err(|e| {
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_not_found_exception())
                {
                    ApiError::NotFound(topic_arn.to_string())
                } else {
                    ApiError::Service(format!("Failed to get SNS topic attributes: {}", e))
                }
            })?;
        Ok(())
    }

    async fn subscribe_queue(&self, topic_arn: &str, queue_arn: &str) -> Result<Option<String>> {
        // Envelope delivery (no RawMessageDelivery): the daemon decodes the SNS wrapper.
        let output = self
            .sns
            .subscribe()
            .topic_arn(topic_arn)
            .protocol("sqs")
            .endpoint(queue_arn)
            .send()
            .await
            .map_err(|e| ApiError::Service(format!("Failed to subscribe queue to topic: {}", e)))?;

        debug!(queue_arn = %queue_arn, topic_arn = %topic_arn, "Subscribed queue to topic");
        Ok(output.subscription_arn().map(str::to_string))
    }
}

#[async_trait]
impl GroupClient for SdkClients {
    async fn list_group_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut pages = self
            .autoscaling
            .describe_auto_scaling_groups()
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                ApiError::Service(format!("Failed to describe Auto Scaling groups: {}", e))
            })?;
            for group in page.auto_scaling_groups() {
                if let Some(name) = text(group.auto_scaling_group_name()) {
                    names.push(name.to_string());
                }
            }
        }

        Ok(names)
    }

    async fn describe_groups(&self, names: &[String]) -> Result<Vec<GroupDescription>> {
        let output = self
            .autoscaling
            .describe_auto_scaling_groups()
            .set_auto_scaling_group_names(Some(names.to_vec()))
            .max_records(DESCRIBE_GROUPS_MAX_RECORDS)
            .send()
            .await
            .map_err(|e| {
                ApiError::Service(format!("Failed to describe Auto Scaling groups: {}", e))
            })?;

        Ok(output
            .auto_scaling_groups()
            .iter()
            .map(|group| GroupDescription {
                name: text(group.auto_scaling_group_name())
                    .unwrap_or_default()
                    .to_string(),
                instance_ids: group
                    .instances()
                    .iter()
                    .filter_map(|instance| text(instance.instance_id()))
                    .map(str::to_string)
                    .collect(),
            })
            .collect())
    }

    async fn put_launch_notifications(&self, group_name: &str, topic_arn: &str) -> Result<()> {
        self.autoscaling
            .put_notification_configuration()
            .auto_scaling_group_name(group_name)
            .topic_arn(topic_arn)
            .notification_types(INSTANCE_LAUNCH_EVENT)
            .send()
            .await
            .map_err(|e| {
                ApiError::Service(format!("Failed to put notification configuration: {}", e))
            })?;
        Ok(())
    }
}

#[async_trait]
impl InstanceClient for SdkClients {
    async fn instance_tags(&self, instance_id: &str, max_results: i32) -> Result<TagSet> {
        let output = self
            .ec2
            .describe_tags()
            .max_results(max_results)
            .filters(
                Filter::builder()
                    .name("resource-id")
                    .values(instance_id)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| ApiError::Service(format!("Failed to describe instance tags: {}", e)))?;

        Ok(output
            .tags()
            .iter()
            .filter_map(|tag| match (tag.key(), tag.value()) {
                (Some(k), Some(v)) => Some((k.to_string(), v.to_string())),
                _ => None,
            })
            .collect())
    }

    async fn attached_volumes(&self, instance_id: &str) -> Result<Vec<String>> {
        let output = self
            .ec2
            .describe_volumes()
            .filters(
                Filter::builder()
                    .name("attachment.instance-id")
                    .values(instance_id)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| ApiError::Service(format!("Failed to describe volumes: {}", e)))?;

        Ok(output
            .volumes()
            .iter()
            .filter_map(|v| v.volume_id())
            .map(str::to_string)
            .collect())
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &TagSet) -> Result<()> {
        let ec2_tags: Vec<Tag> = tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect();

        self.ec2
            .create_tags()
            .set_resources(Some(resource_ids.to_vec()))
            .set_tags(Some(ec2_tags))
            .send()
            .await
            .map_err(|e| ApiError::Service(format!("Failed to create tags: {}", e)))?;
        Ok(())
    }
}
