//! SQS queue / SNS topic pair carrying Auto Scaling launch events.
//!
//! The channel verifies that its queue (and topic, when one is managed here)
//! exists at construction, subscribes the queue to the topic once at daemon
//! start, and then long-polls the queue one message at a time.
//!
//! The subscription is never torn down: launch events must keep reaching
//! the queue while the daemon restarts.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::aws::{ApiError, QueueClient, RawMessage, TopicClient};
use crate::utils::shutdown::Shutdown;


/// Long-poll wait per receive call, in seconds.
pub const LONG_POLL_WAIT_SECS: i32 = 20;

/// Messages requested per receive call.
pub const RECEIVE_BATCH_SIZE: i32 = 1;

/// Overall bound on a single receive call.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(LONG_POLL_WAIT_SECS as u64 + 10);

/// Bound on each existence check at construction.
pub const EXISTENCE_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors that can occur during channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("queue {0} doesn't exist")]
    QueueMissing(String),

    #[error("topic {0} doesn't exist")]
    TopicMissing(String),

    #[error("Failed to get queue ARN: {0}")]
    QueueArn(ApiError),

    #[error("Failed to subscribe to topic: {0}")]
    Subscribe(ApiError),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// The queue/topic pair shared by every watched group.
pub struct NotificationChannel {
    name: String,
    url: String,
    arn: Option<String>,
    topic_arn: Option<String>,
    subscription_arn: Option<String>,
    queues: Arc<dyn QueueClient>,
    topics: Arc<dyn TopicClient>,
}

impl NotificationChannel {
    /// Build the channel and check its resources exist.
    ///
    /// An empty or absent `topic_arn` means the queue's subscription is
    /// managed elsewhere; the topic is then neither checked nor subscribed.
    pub async fn connect(
        queue_name: impl Into<String>,
        topic_arn: Option<String>,
        queues: Arc<dyn QueueClient>,
        topics: Arc<dyn TopicClient>,
    ) -> Result<Self> {
        let mut channel = Self {
            name: queue_name.into(),
            url: String::new(),
            arn: None,
            topic_arn: topic_arn.filter(|arn| !arn.is_empty()),
            subscription_arn: None,
            queues,
            topics,
        };

        if channel.topic_arn.is_some() {
            tokio::time::timeout(EXISTENCE_CHECK_TIMEOUT, channel.verify_topic())
                .await
                .map_err(|_| ChannelError::Timeout {
                    operation: "topic existence check",
                    after: EXISTENCE_CHECK_TIMEOUT,
                })??;
        }

        channel.url = tokio::time::timeout(EXISTENCE_CHECK_TIMEOUT, channel.verify_queue())
            .await
            .map_err(|_| ChannelError::Timeout {
                operation: "queue existence check",
                after: EXISTENCE_CHECK_TIMEOUT,
            })??;

        info!(queue = %channel.name, url = %channel.url, "Found SQS queue");
        Ok(channel)
    }

    /// Resolve the queue URL by name.
    pub async fn verify_queue(&self) -> Result<String> {
        match self.queues.queue_url(&self.name).await {
            Ok(url) => Ok(url),
            Err(ApiError::NotFound(_)) => Err(ChannelError::QueueMissing(self.name.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Check the configured topic exists. No-op without a topic.
    pub async fn verify_topic(&self) -> Result<()> {
        let Some(topic_arn) = self.topic_arn.as_deref() else {
            return Ok(());
        };
        match self.topics.topic_attributes(topic_arn).await {
            Ok(()) => Ok(()),
            Err(ApiError::NotFound(_)) => Err(ChannelError::TopicMissing(topic_arn.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Subscribe the queue to the topic. No-op without a topic.
    pub async fn subscribe(&mut self) -> Result<()> {
        let Some(topic_arn) = self.topic_arn.clone() else {
            debug!("No topic configured, assuming externally managed subscription");
            return Ok(());
        };

        let queue_arn = self.queue_arn().await?;
        let subscription_arn = self
            .topics
            .subscribe_queue(&topic_arn, &queue_arn)
            .await
            .map_err(ChannelError::Subscribe)?;

        info!(
            topic_arn = %topic_arn,
            queue_arn = %queue_arn,
            subscription_arn = ?subscription_arn,
            "Subscribed SQS queue to SNS topic"
        );
        self.subscription_arn = subscription_arn;
        Ok(())
    }

    /// The queue's own ARN, read once and cached.
    async fn queue_arn(&mut self) -> Result<String> {
        if let Some(ref arn) = self.arn {
            return Ok(arn.clone());
        }
        let arn = self
            .queues
            .queue_arn(&self.url)
            .await
            .map_err(ChannelError::QueueArn)?;
        self.arn = Some(arn.clone());
        Ok(arn)
    }

    /// Long-poll for at most one message.
    ///
    /// Shutdown during the wait yields no messages rather than an error.
    pub async fn receive(&self, shutdown: &mut Shutdown) -> Result<Vec<RawMessage>> {
        let call = self
            .queues
            .receive(&self.url, RECEIVE_BATCH_SIZE, LONG_POLL_WAIT_SECS);

        tokio::select! {
            biased;
            _ = shutdown.triggered() => Ok(Vec::new()),
            result = tokio::time::timeout(RECEIVE_TIMEOUT, call) => match result {
                Ok(messages) => Ok(messages?),
                Err(_) => Err(ChannelError::Timeout {
                    operation: "receive",
                    after: RECEIVE_TIMEOUT,
                }),
            },
        }
    }

    /// Delete a message so it is not redelivered.
    ///
    /// Shutdown during the call is treated as success.
    pub async fn acknowledge(&self, receipt_handle: &str, shutdown: &mut Shutdown) -> Result<()> {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => Ok(()),
            result = self.queues.delete(&self.url, receipt_handle) => Ok(result?),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn topic_arn(&self) -> Option<&str> {
        self.topic_arn.as_deref()
    }

    pub fn subscription_arn(&self) -> Option<&str> {
        self.subscription_arn.as_deref()
    }
}
