//! The tagging daemon.
//!
//! Lifecycle:
//! ```text
//! Resolving -> Subscribing -> EnablingNotifications -> Backfilling -> Polling -> Stopped
//! ```
//! `Subscribing` and `EnablingNotifications` only run when a topic is
//! configured; `Backfilling` only when enabled.
//!
//! Each poll iteration receives at most one message and deletes it before
//! reading its body. Delivery is therefore at-most-once from the daemon's
//! point of view: a crash after the delete loses that event. Tag writes are
//! set-overwrites, so a later backfill or launch repairs any gap.
//!
//! The watched group set is resolved once at construction; groups created
//! afterwards are picked up on restart.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::aws::{
    ApiError, GroupClient, InstanceClient, QueueClient, RawMessage, TopicClient,
    INSTANCE_LAUNCH_EVENT,
};
use crate::channel::{ChannelError, NotificationChannel};
use crate::config::Config;
use crate::tagger::GroupTagger;
use crate::utils::retry::ReceiveBackoff;
use crate::utils::shutdown::Shutdown;

pub mod event;
pub mod resolve;

#[cfg(test)]
mod tests;

pub use event::{Envelope, InboundEvent};
pub use resolve::{glob_matches, resolve_groups};

/// Bound on paging through every group in the account.
pub const GROUP_LISTING_TIMEOUT: Duration = Duration::from_secs(60);

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Fatal daemon errors. Everything else is logged and skipped.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Failed to list Auto Scaling groups: {0}")]
    GroupListing(ApiError),

    #[error("Listing Auto Scaling groups timed out after {0:?}")]
    GroupListingTimeout(Duration),

    #[error(transparent)]
    Subscribe(ChannelError),
}

/// Where the daemon is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Resolving,
    Subscribing,
    EnablingNotifications,
    Backfilling,
    Polling,
    Stopped,
}

/// What happened to one received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The message had no body.
    EmptyBody,
    /// The outer envelope was not valid JSON.
    MalformedEnvelope,
    /// The envelope's `Message` was not valid JSON.
    MalformedPayload,
    /// The event is for a group this daemon does not watch.
    UnmanagedGroup(String),
    /// The event is not an instance launch.
    IgnoredEvent(String),
    /// Volumes were tagged.
    Tagged {
        group: String,
        instance_id: String,
        volumes: usize,
    },
    /// Tagging was attempted and failed.
    TaggingFailed {
        group: String,
        instance_id: String,
    },
}

/// Cloud collaborators the daemon is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub queues: Arc<dyn QueueClient>,
    pub topics: Arc<dyn TopicClient>,
    pub groups: Arc<dyn GroupClient>,
    pub instances: Arc<dyn InstanceClient>,
}

impl Collaborators {
    /// Use one client for every capability.
    pub fn shared<C>(client: Arc<C>) -> Self
    where
        C: QueueClient + TopicClient + GroupClient + InstanceClient + 'static,
    {
        Self {
            queues: client.clone(),
            topics: client.clone(),
            groups: client.clone(),
            instances: client,
        }
    }
}

/// Watches Auto Scaling groups and tags their instances' volumes.
pub struct Daemon {
    config: Config,
    channel: NotificationChannel,
    taggers: BTreeMap<String, GroupTagger>,
    state: DaemonState,
}

impl Daemon {
    /// Check the channel's resources and resolve which groups to watch.
    pub async fn new(config: Config, clients: Collaborators) -> Result<Self> {
        let channel = NotificationChannel::connect(
            config.queue_name.clone(),
            config.topic_arn.clone(),
            clients.queues.clone(),
            clients.topics.clone(),
        )
        .await?;

        let live_names = tokio::time::timeout(GROUP_LISTING_TIMEOUT, clients.groups.list_group_names())
            .await
            .map_err(|_| DaemonError::GroupListingTimeout(GROUP_LISTING_TIMEOUT))?
            .map_err(DaemonError::GroupListing)?;

        let taggers: BTreeMap<String, GroupTagger> = resolve_groups(&config.tag_config, &live_names)
            .into_iter()
            .map(|(name, group)| {
                let tagger = GroupTagger::new(group, clients.groups.clone(), clients.instances.clone());
                (name, tagger)
            })
            .collect();

        info!(
            live_groups = live_names.len(),
            watched = ?taggers.keys().collect::<Vec<_>>(),
            "Resolved ASGs to watch"
        );

        Ok(Self {
            config,
            channel,
            taggers,
            state: DaemonState::Resolving,
        })
    }

    /// Run until `shutdown` fires.
    ///
    /// Returns an error only when subscribing to the topic fails; every
    /// later failure is logged and the loop continues.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> Result<()> {
        info!("Starting daemon");

        if let Some(topic_arn) = self.channel.topic_arn().map(str::to_string) {
            self.state = DaemonState::Subscribing;
            debug!(topic = %topic_arn, "Subscribing SQS queue to SNS topic");
            self.channel
                .subscribe()
                .await
                .map_err(DaemonError::Subscribe)?;

            self.state = DaemonState::EnablingNotifications;
            self.enable_notifications(&topic_arn).await;
        }

        if self.config.backfill {
            self.state = DaemonState::Backfilling;
            self.backfill().await;
        }

        self.state = DaemonState::Polling;
        debug!(queue_url = %self.channel.url(), "Listening to SQS queue...");
        let mut backoff = ReceiveBackoff::default();

        while !shutdown.is_triggered() {
            match self.poll_once(&mut shutdown).await {
                Ok(_) => backoff.reset(),
                Err(e) => {
                    warn!(error = %e, "Failed to get messages from SQS");
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = shutdown.triggered() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.state = DaemonState::Stopped;
        info!("Daemon stopped");
        Ok(())
    }

    /// Point every watched group's launch notifications at the topic.
    async fn enable_notifications(&self, topic_arn: &str) {
        debug!("Enabling notifications to ASGs");
        for tagger in self.taggers.values() {
            if let Err(e) = tagger.enable_notifications(topic_arn).await {
                error!(asg = %tagger.name(), error = %e, "Failed to enable notifications for ASG");
            }
        }
    }

    /// Tag every current member of every watched group.
    ///
    /// Returns the number of instances handled successfully.
    pub async fn backfill(&self) -> usize {
        debug!("Backfilling enabled, processing...");
        let mut handled = 0;

        for tagger in self.taggers.values() {
            info!(asg = %tagger.name(), "Processing existing disks for ASG");
            let instances = match tagger.list_members().await {
                Ok(instances) => instances,
                Err(e) => {
                    error!(asg = %tagger.name(), error = %e, "Failed to look up instances for ASG");
                    continue;
                }
            };

            let total = instances.len();
            for (i, instance_id) in instances.iter().enumerate() {
                info!(
                    asg = %tagger.name(),
                    "[{}/{}] Tagging existing instance {}",
                    i + 1,
                    total,
                    instance_id
                );
                match tagger.handle(instance_id).await {
                    Ok(_) => handled += 1,
                    Err(e) => {
                        error!(asg = %tagger.name(), instance_id = %instance_id, error = %e, "Failed to tag existing instance")
                    }
                }
            }
        }

        handled
    }

    /// One poll iteration: receive up to one message and process it.
    ///
    /// Only a failed receive is an error.
    pub async fn poll_once(
        &self,
        shutdown: &mut Shutdown,
    ) -> std::result::Result<Vec<MessageOutcome>, ChannelError> {
        debug!(queue_url = %self.channel.url(), "Polling SQS for messages");
        let messages = self.channel.receive(shutdown).await?;

        let mut outcomes = Vec::with_capacity(messages.len());
        for message in &messages {
            outcomes.push(self.process_message(message, shutdown).await);
        }
        Ok(outcomes)
    }

    /// Acknowledge, decode, route and handle one message.
    ///
    /// The message is deleted before its body is read, whatever the outcome.
    pub async fn process_message(
        &self,
        message: &RawMessage,
        shutdown: &mut Shutdown,
    ) -> MessageOutcome {
        match message.receipt_handle.as_deref() {
            Some(receipt_handle) => {
                if let Err(e) = self.channel.acknowledge(receipt_handle, shutdown).await {
                    warn!(error = %e, "Failed to delete SQS message");
                }
            }
            None => warn!("SQS message has no receipt handle, cannot delete it"),
        }

        let Some(body) = message.body.as_deref() else {
            error!("SQS message has no body");
            return MessageOutcome::EmptyBody;
        };

        let envelope = match Envelope::decode(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "Failed to unmarshal envelope");
                return MessageOutcome::MalformedEnvelope;
            }
        };

        debug!(
            kind = %envelope.kind,
            subject = %envelope.subject,
            "Received an SQS message"
        );

        let event = match envelope.payload() {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "Failed to unmarshal autoscaling message");
                return MessageOutcome::MalformedPayload;
            }
        };

        let Some(tagger) = self.taggers.get(&event.group_name) else {
            debug!(asg = %event.group_name, "Skipping message, not a managed ASG");
            return MessageOutcome::UnmanagedGroup(event.group_name);
        };

        if event.kind != INSTANCE_LAUNCH_EVENT {
            debug!(
                asg = %event.group_name,
                event = %event.kind,
                "Skipping autoscaling event, not EC2_INSTANCE_LAUNCH"
            );
            return MessageOutcome::IgnoredEvent(event.kind);
        }

        info!(
            asg = %event.group_name,
            instance_id = %event.instance_id,
            time = ?event.time,
            "Instance launched"
        );

        match tagger.handle(&event.instance_id).await {
            Ok(volumes) => MessageOutcome::Tagged {
                group: event.group_name,
                instance_id: event.instance_id,
                volumes,
            },
            Err(e) => {
                error!(
                    asg = %event.group_name,
                    instance_id = %event.instance_id,
                    error = %e,
                    "Failed to tag launched instance"
                );
                MessageOutcome::TaggingFailed {
                    group: event.group_name,
                    instance_id: event.instance_id,
                }
            }
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn channel(&self) -> &NotificationChannel {
        &self.channel
    }

    /// Names of the watched groups, in order.
    pub fn watched_groups(&self) -> Vec<&str> {
        self.taggers.keys().map(String::as_str).collect()
    }

    pub fn tagger(&self, group_name: &str) -> Option<&GroupTagger> {
        self.taggers.get(group_name)
    }
}
