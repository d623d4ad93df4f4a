//! Per-group volume tagging.
//!
//! A `GroupTagger` owns one watched Auto Scaling group. Backfill and live
//! launch events both go through `GroupTagger::handle`, so an instance is
//! tagged the same way regardless of how it was discovered.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::aws::{ApiError, GroupClient, InstanceClient};


/// Per-resource tag limit.
pub const MAX_TAGS: usize = 50;

/// Tag key to tag value.
pub type TagSet = BTreeMap<String, String>;

/// Result type for tagger operations.
pub type Result<T> = std::result::Result<T, TaggerError>;

/// Errors that can occur while tagging a group's instances.
#[derive(Debug, thiserror::Error)]
pub enum TaggerError {
    #[error("Failed to list members of group {group}: {source}")]
    Members { group: String, source: ApiError },

    #[error("Failed to enable notifications for group {group}: {source}")]
    Notifications { group: String, source: ApiError },

    #[error("Failed to read tags of instance {instance_id}: {source}")]
    InstanceTags {
        instance_id: String,
        source: ApiError,
    },

    #[error("Failed to look up volumes of instance {instance_id}: {source}")]
    Volumes {
        instance_id: String,
        source: ApiError,
    },

    #[error("Failed to tag volumes of instance {instance_id}: {source}")]
    TagWrite {
        instance_id: String,
        source: ApiError,
    },
}

/// One resolved Auto Scaling group under management.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchedGroup {
    /// Live group name (not the pattern that matched it).
    pub name: String,
    /// Tags applied verbatim; these win over copied tags.
    pub tags: TagSet,
    /// Case-insensitive key prefixes of instance tags to copy.
    pub key_prefixes: Vec<String>,
}

/// Copy instance tags whose key starts with any prefix (case-insensitive),
/// then overlay the static tags.
///
/// If the result exceeds `MAX_TAGS`, copied tags are dropped in descending
/// key order until it fits; static tags are never dropped, so a rule with
/// more than `MAX_TAGS` static tags still yields an oversized set.
pub fn merge_tags(instance_tags: &TagSet, key_prefixes: &[String], static_tags: &TagSet) -> TagSet {
    let prefixes: Vec<String> = key_prefixes.iter().map(|p| p.to_uppercase()).collect();

    let mut merged: TagSet = instance_tags
        .iter()
        .filter(|(key, _)| {
            let key = key.to_uppercase();
            prefixes.iter().any(|p| key.starts_with(p.as_str()))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    merged.extend(static_tags.iter().map(|(k, v)| (k.clone(), v.clone())));

    if merged.len() > MAX_TAGS {
        let excess = merged.len() - MAX_TAGS;
        let dropped: Vec<String> = merged
            .keys()
            .rev()
            .filter(|k| !static_tags.contains_key(*k))
            .take(excess)
            .cloned()
            .collect();
        for key in &dropped {
            merged.remove(key);
        }
        if !dropped.is_empty() {
            warn!(
                dropped = ?dropped,
                limit = MAX_TAGS,
                "Tag set exceeds per-resource limit, dropping copied tags"
            );
        }
        if merged.len() > MAX_TAGS {
            warn!(
                count = merged.len(),
                limit = MAX_TAGS,
                "Static tags alone exceed per-resource limit"
            );
        }
    }

    merged
}

/// Tags the volumes of one watched group's instances.
pub struct GroupTagger {
    group: WatchedGroup,
    groups: Arc<dyn GroupClient>,
    instances: Arc<dyn InstanceClient>,
}

impl GroupTagger {
    pub fn new(
        group: WatchedGroup,
        groups: Arc<dyn GroupClient>,
        instances: Arc<dyn InstanceClient>,
    ) -> Self {
        Self {
            group,
            groups,
            instances,
        }
    }

    /// Name of the watched group.
    pub fn name(&self) -> &str {
        &self.group.name
    }

    pub fn group(&self) -> &WatchedGroup {
        &self.group
    }

    /// Instance IDs currently in the group.
    ///
    /// If the inventory reports more than one group under this name, the
    /// members of all of them are returned.
    pub async fn list_members(&self) -> Result<Vec<String>> {
        let groups = self
            .groups
            .describe_groups(std::slice::from_ref(&self.group.name))
            .await
            .map_err(|source| TaggerError::Members {
                group: self.group.name.clone(),
                source,
            })?;

        if groups.len() > 1 {
            warn!(
                asg = %self.group.name,
                count = groups.len(),
                "Instance lookup returned more than 1 ASG"
            );
        }

        Ok(groups.into_iter().flat_map(|g| g.instance_ids).collect())
    }

    /// Tag set for an instance: copied prefix tags overlaid with static tags.
    ///
    /// Instance tags are only read when prefix rules are configured.
    pub async fn compute_tags(&self, instance_id: &str) -> Result<TagSet> {
        if self.group.key_prefixes.is_empty() {
            return Ok(self.group.tags.clone());
        }

        debug!(asg = %self.group.name, instance_id = %instance_id, "Processing tags for instance");
        let instance_tags = self
            .instances
            .instance_tags(instance_id, MAX_TAGS as i32)
            .await
            .map_err(|source| TaggerError::InstanceTags {
                instance_id: instance_id.to_string(),
                source,
            })?;

        Ok(merge_tags(
            &instance_tags,
            &self.group.key_prefixes,
            &self.group.tags,
        ))
    }

    /// Write `tags` to every volume attached to the instance in one call.
    ///
    /// Returns the number of volumes tagged; an instance without volumes is
    /// not an error.
    pub async fn apply_to_volumes(&self, instance_id: &str, tags: &TagSet) -> Result<usize> {
        info!(asg = %self.group.name, instance_id = %instance_id, "Tagging disks attached to instance");

        let volume_ids = self
            .instances
            .attached_volumes(instance_id)
            .await
            .map_err(|source| TaggerError::Volumes {
                instance_id: instance_id.to_string(),
                source,
            })?;

        if volume_ids.is_empty() {
            debug!(instance_id = %instance_id, "No volumes found on instance");
            return Ok(0);
        }

        for volume_id in &volume_ids {
            debug!(volume_id = %volume_id, "Found volume");
        }

        self.instances
            .create_tags(&volume_ids, tags)
            .await
            .map_err(|source| TaggerError::TagWrite {
                instance_id: instance_id.to_string(),
                source,
            })?;

        debug!(
            instance_id = %instance_id,
            volumes = volume_ids.len(),
            "Tagged volume(s) attached to instance"
        );
        Ok(volume_ids.len())
    }

    /// Ask the group to publish instance-launch notifications to `topic_arn`.
    pub async fn enable_notifications(&self, topic_arn: &str) -> Result<()> {
        debug!(asg = %self.group.name, topic_arn = %topic_arn, "Enabling SNS notification");
        self.groups
            .put_launch_notifications(&self.group.name, topic_arn)
            .await
            .map_err(|source| TaggerError::Notifications {
                group: self.group.name.clone(),
                source,
            })
    }

    /// Compute and apply the tag set for one instance.
    pub async fn handle(&self, instance_id: &str) -> Result<usize> {
        let tags = self.compute_tags(instance_id).await?;
        self.apply_to_volumes(instance_id, &tags).await
    }
}
