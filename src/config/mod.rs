//! Daemon configuration.
//!
//! Tagging rules come from a YAML file; process-level settings (queue,
//! topic, backfill) are supplied by the binary from flags or `TAGD_*`
//! environment variables and merged in before the daemon is built.
//!
//! ```yaml
//! tagConfig:
//!   - asgName: "my-asg*"
//!     tags:
//!       team: storage
//!     keyPrefix:
//!       - kubernetes.io/
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::tagger::{TagSet, WatchedGroup, MAX_TAGS};

/// Default configuration file path.
pub const DEFAULT_CONFIG_FILE: &str = "./config.yaml";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TAGD_LOG";

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Please provide --sqs-queue-name")]
    MissingQueueName,

    #[error("Tagging rule {0} has an empty asgName")]
    EmptyPattern(usize),

    #[error("Tagging rule {index} has {count} tags, more than the limit of {limit}")]
    TooManyTags {
        index: usize,
        count: usize,
        limit: usize,
    },
}

/// Which groups to watch and how to tag their volumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggingRule {
    /// Glob pattern (`*` wildcard) matched against live group names.
    pub asg_name: String,
    /// Static tags.
    #[serde(default)]
    pub tags: TagSet,
    /// Instance tag key prefixes to copy (case-insensitive).
    #[serde(default)]
    pub key_prefix: Vec<String>,
}

impl TaggingRule {
    /// The watched group this rule yields for a matching live group name.
    pub fn watched_group(&self, group_name: &str) -> WatchedGroup {
        WatchedGroup {
            name: group_name.to_string(),
            tags: self.tags.clone(),
            key_prefixes: self.key_prefix.clone(),
        }
    }
}

/// Main daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ordered tagging rules.
    #[serde(rename = "tagConfig")]
    pub tag_config: Vec<TaggingRule>,
    /// SQS queue to consume launch events from.
    #[serde(skip)]
    pub queue_name: String,
    /// SNS topic to subscribe the queue to. `None` when managed externally.
    #[serde(skip)]
    pub topic_arn: Option<String>,
    /// Tag existing instances before listening for events.
    #[serde(skip)]
    pub backfill: bool,
}

impl Config {
    /// Load tagging rules from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.display().to_string(), e.to_string()))?;
        Self::from_yaml(&contents)
    }

    /// Parse tagging rules from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not a mapping.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Merge process-level settings. An empty topic ARN means no topic.
    pub fn with_settings(
        mut self,
        queue_name: impl Into<String>,
        topic_arn: Option<String>,
        backfill: bool,
    ) -> Self {
        self.queue_name = queue_name.into();
        self.topic_arn = topic_arn.filter(|arn| !arn.is_empty());
        self.backfill = backfill;
        self
    }

    /// Check the settings required to start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.is_empty() {
            return Err(ConfigError::MissingQueueName);
        }
        if let Some(index) = self.tag_config.iter().position(|r| r.asg_name.is_empty()) {
            return Err(ConfigError::EmptyPattern(index));
        }
        if let Some((index, rule)) = self
            .tag_config
            .iter()
            .enumerate()
            .find(|(_, r)| r.tags.len() > MAX_TAGS)
        {
            return Err(ConfigError::TooManyTags {
                index,
                count: rule.tags.len(),
                limit: MAX_TAGS,
            });
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test(queue_name: &str, rules: Vec<TaggingRule>) -> Self {
        Self {
            tag_config: rules,
            queue_name: queue_name.to_string(),
            ..Self::default()
        }
    }
}
