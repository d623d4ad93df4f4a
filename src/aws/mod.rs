//! Cloud collaborators used by the daemon.
//!
//! Each component depends only on the narrow capability it needs:
//! - `QueueClient`: SQS queue lookup, long-poll receive, delete
//! - `TopicClient`: SNS topic lookup and queue subscription
//! - `GroupClient`: Auto Scaling group inventory and notifications
//! - `InstanceClient`: EC2 instance tags, attached volumes, tag writes
//!
//! Implementations: `sdk` (AWS SDK), `mock` (in-memory, for testing).

use async_trait::async_trait;

use crate::tagger::TagSet;

pub mod mock;
pub mod sdk;

pub use mock::MockAws;
pub use sdk::{AwsSettings, SdkClients};

/// Auto Scaling notification type for an instance joining a group.
pub const INSTANCE_LAUNCH_EVENT: &str = "autoscaling:EC2_INSTANCE_LAUNCH";

/// Result type for collaborator calls.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors surfaced by cloud collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The service reported that the addressed resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other transport or service failure.
    #[error("Service error: {0}")]
    Service(String),

    /// The service answered without a field the caller requires.
    #[error("Response missing field: {0}")]
    MissingField(&'static str),
}

/// A message pulled from the queue, not yet interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Token used to delete the message.
    pub receipt_handle: Option<String>,
    /// Raw message body.
    pub body: Option<String>,
}

/// One Auto Scaling group as reported by the inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDescription {
    pub name: String,
    pub instance_ids: Vec<String>,
}

/// SQS queue operations.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Resolve a queue URL by name. `NotFound` when the queue does not exist.
    async fn queue_url(&self, queue_name: &str) -> Result<String>;

    /// Read the queue's own ARN.
    async fn queue_arn(&self, queue_url: &str) -> Result<String>;

    /// Long-poll for messages.
    async fn receive(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_secs: i32,
    ) -> Result<Vec<RawMessage>>;

    /// Delete a message so it is not redelivered.
    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<()>;
}

/// SNS topic operations.
#[async_trait]
pub trait TopicClient: Send + Sync {
    /// Check a topic. `NotFound` when the topic does not exist.
    async fn topic_attributes(&self, topic_arn: &str) -> Result<()>;

    /// Subscribe an SQS queue to the topic, returning the subscription ARN.
    async fn subscribe_queue(&self, topic_arn: &str, queue_arn: &str) -> Result<Option<String>>;
}

/// Auto Scaling group operations.
#[async_trait]
pub trait GroupClient: Send + Sync {
    /// Names of every group visible to the account, across all pages.
    async fn list_group_names(&self) -> Result<Vec<String>>;

    /// Describe the named groups, including their member instances.
    async fn describe_groups(&self, names: &[String]) -> Result<Vec<GroupDescription>>;

    /// Deliver instance-launch notifications for a group to a topic.
    async fn put_launch_notifications(&self, group_name: &str, topic_arn: &str) -> Result<()>;
}

/// EC2 instance and volume operations.
#[async_trait]
pub trait InstanceClient: Send + Sync {
    /// Existing tags of an instance, at most `max_results` of them.
    async fn instance_tags(&self, instance_id: &str, max_results: i32) -> Result<TagSet>;

    /// IDs of the volumes currently attached to an instance.
    async fn attached_volumes(&self, instance_id: &str) -> Result<Vec<String>>;

    /// Write `tags` to every resource in one call.
    async fn create_tags(&self, resource_ids: &[String], tags: &TagSet) -> Result<()>;
}
