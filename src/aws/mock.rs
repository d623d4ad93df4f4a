//! In-memory AWS stand-in for testing.
//!
//! `MockAws` implements every collaborator trait against local state and
//! records each call in order, so tests can assert both effects and
//! sequencing (e.g. a message is deleted before its body is acted on).

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    ApiError, GroupClient, GroupDescription, InstanceClient, QueueClient, RawMessage, Result,
    TopicClient,
};
use crate::tagger::TagSet;

/// How long an empty receive waits before returning nothing.
const EMPTY_RECEIVE_DELAY: Duration = Duration::from_millis(20);

/// Operations that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    QueueUrl,
    QueueArn,
    Receive,
    Delete,
    TopicAttributes,
    Subscribe,
    ListGroups,
    DescribeGroups,
    PutNotifications,
    InstanceTags,
    AttachedVolumes,
    CreateTags,
}

/// A recorded call, in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    QueueArn(String),
    Receive,
    Delete(String),
    Subscribe { topic_arn: String, queue_arn: String },
    DescribeGroups(Vec<String>),
    PutNotifications { group: String, topic_arn: String },
    InstanceTags(String),
    AttachedVolumes(String),
    CreateTags { resources: Vec<String>, tags: TagSet },
}

#[derive(Default)]
struct MockState {
    queues: HashMap<String, (String, String)>,
    topics: HashSet<String>,
    inbox: VecDeque<RawMessage>,
    groups: Vec<GroupDescription>,
    instance_tags: HashMap<String, TagSet>,
    volumes: HashMap<String, Vec<String>>,
    failing: HashSet<MockOp>,
    failing_groups: HashSet<String>,
    empty_receive_wait: Option<Duration>,
    calls: Vec<MockCall>,
}

impl MockState {
    fn check(&self, op: MockOp) -> Result<()> {
        if self.failing.contains(&op) {
            return Err(ApiError::Service(format!("Mock {:?} failure", op)));
        }
        Ok(())
    }
}

/// Mock AWS account for testing.
#[derive(Default)]
pub struct MockAws {
    state: RwLock<MockState>,
}

impl MockAws {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue by name, with its URL and ARN.
    pub fn with_queue(mut self, name: &str, url: &str, arn: &str) -> Self {
        self.state
            .get_mut()
            .queues
            .insert(name.to_string(), (url.to_string(), arn.to_string()));
        self
    }

    /// Register an existing topic.
    pub fn with_topic(mut self, arn: &str) -> Self {
        self.state.get_mut().topics.insert(arn.to_string());
        self
    }

    /// Register a group and its current members.
    pub fn with_group(mut self, name: &str, instance_ids: &[&str]) -> Self {
        self.state.get_mut().groups.push(GroupDescription {
            name: name.to_string(),
            instance_ids: instance_ids.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Set the existing tags of an instance.
    pub fn with_instance_tags(mut self, instance_id: &str, tags: &[(&str, &str)]) -> Self {
        self.state.get_mut().instance_tags.insert(
            instance_id.to_string(),
            tags.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    /// Attach volumes to an instance.
    pub fn with_volumes(mut self, instance_id: &str, volume_ids: &[&str]) -> Self {
        self.state.get_mut().volumes.insert(
            instance_id.to_string(),
            volume_ids.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    /// Queue a message body for delivery.
    pub async fn push_message(&self, receipt_handle: &str, body: &str) {
        self.state.write().await.inbox.push_back(RawMessage {
            receipt_handle: Some(receipt_handle.to_string()),
            body: Some(body.to_string()),
        });
    }

    pub async fn set_failing(&self, op: MockOp, fail: bool) {
        let mut state = self.state.write().await;
        if fail {
            state.failing.insert(op);
        } else {
            state.failing.remove(&op);
        }
    }

    /// Fail group-scoped calls (describe, notifications) for one group only.
    pub async fn set_failing_group(&self, group: &str) {
        self.state
            .write()
            .await
            .failing_groups
            .insert(group.to_string());
    }

    /// How long a receive on an empty queue blocks, like a long poll.
    pub async fn set_empty_receive_wait(&self, wait: Duration) {
        self.state.write().await.empty_receive_wait = Some(wait);
    }

    pub async fn pending_messages(&self) -> usize {
        self.state.read().await.inbox.len()
    }

    pub async fn calls(&self) -> Vec<MockCall> {
        self.state.read().await.calls.clone()
    }

    /// Every `create_tags` call made so far.
    pub async fn tag_writes(&self) -> Vec<(Vec<String>, TagSet)> {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::CreateTags { resources, tags } => {
                    Some((resources.clone(), tags.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl QueueClient for MockAws {
    async fn queue_url(&self, queue_name: &str) -> Result<String> {
        let state = self.state.read().await;
        state.check(MockOp::QueueUrl)?;
        state
            .queues
            .get(queue_name)
            .map(|(url, _)| url.clone())
            .ok_or_else(|| ApiError::NotFound(queue_name.to_string()))
    }

    async fn queue_arn(&self, queue_url: &str) -> Result<String> {
        let mut state = self.state.write().await;
        state.calls.push(MockCall::QueueArn(queue_url.to_string()));
        state.check(MockOp::QueueArn)?;
        state
            .queues
            .values()
            .find(|(url, _)| url == queue_url)
            .map(|(_, arn)| arn.clone())
            .ok_or(ApiError::MissingField("QueueArn"))
    }

    async fn receive(
        &self,
        _queue_url: &str,
        max_messages: i32,
        _wait_time_secs: i32,
    ) -> Result<Vec<RawMessage>> {
        let (batch, wait): (Vec<RawMessage>, Duration) = {
            let mut state = self.state.write().await;
            state.calls.push(MockCall::Receive);
            state.check(MockOp::Receive)?;
            let take = (max_messages.max(0) as usize).min(state.inbox.len());
            let wait = state.empty_receive_wait.unwrap_or(EMPTY_RECEIVE_DELAY);
            (state.inbox.drain(..take).collect(), wait)
        };

        if batch.is_empty() {
            tokio::time::sleep(wait).await;
        }
        Ok(batch)
    }

    async fn delete(&self, _queue_url: &str, receipt_handle: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.calls.push(MockCall::Delete(receipt_handle.to_string()));
        state.check(MockOp::Delete)
    }
}

#[async_trait]
impl TopicClient for MockAws {
    async fn topic_attributes(&self, topic_arn: &str) -> Result<()> {
        let state = self.state.read().await;
        state.check(MockOp::TopicAttributes)?;
        if state.topics.contains(topic_arn) {
            Ok(())
        } else {
            Err(ApiError::NotFound(topic_arn.to_string()))
        }
    }

    async fn subscribe_queue(&self, topic_arn: &str, queue_arn: &str) -> Result<Option<String>> {
        let mut state = self.state.write().await;
        state.calls.push(MockCall::Subscribe {
            topic_arn: topic_arn.to_string(),
            queue_arn: queue_arn.to_string(),
        });
        state.check(MockOp::Subscribe)?;
        Ok(Some(format!("{}:subscription-1", topic_arn)))
    }
}

#[async_trait]
impl GroupClient for MockAws {
    async fn list_group_names(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        state.check(MockOp::ListGroups)?;
        Ok(state.groups.iter().map(|g| g.name.clone()).collect())
    }

    async fn describe_groups(&self, names: &[String]) -> Result<Vec<GroupDescription>> {
        let mut state = self.state.write().await;
        state.calls.push(MockCall::DescribeGroups(names.to_vec()));
        state.check(MockOp::DescribeGroups)?;
        if names.iter().any(|n| state.failing_groups.contains(n)) {
            return Err(ApiError::Service("Mock describe failure".to_string()));
        }
        Ok(state
            .groups
            .iter()
            .filter(|g| names.contains(&g.name))
            .cloned()
            .collect())
    }

    async fn put_launch_notifications(&self, group_name: &str, topic_arn: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.calls.push(MockCall::PutNotifications {
            group: group_name.to_string(),
            topic_arn: topic_arn.to_string(),
        });
        state.check(MockOp::PutNotifications)?;
        if state.failing_groups.contains(group_name) {
            return Err(ApiError::Service("Mock notification failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceClient for MockAws {
    async fn instance_tags(&self, instance_id: &str, max_results: i32) -> Result<TagSet> {
        let mut state = self.state.write().await;
        state
            .calls
            .push(MockCall::InstanceTags(instance_id.to_string()));
        state.check(MockOp::InstanceTags)?;
        Ok(state
            .instance_tags
            .get(instance_id)
            .map(|tags| {
                tags.iter()
                    .take(max_results.max(0) as usize)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn attached_volumes(&self, instance_id: &str) -> Result<Vec<String>> {
        let mut state = self.state.write().await;
        state
            .calls
            .push(MockCall::AttachedVolumes(instance_id.to_string()));
        state.check(MockOp::AttachedVolumes)?;
        Ok(state.volumes.get(instance_id).cloned().unwrap_or_default())
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &TagSet) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(MockOp::CreateTags)?;
        state.calls.push(MockCall::CreateTags {
            resources: resource_ids.to_vec(),
            tags: tags.clone(),
        });
        Ok(())
    }
}
