//! tagd - Auto Scaling volume tagging daemon
//!
//! Keeps the EBS volumes attached to Auto Scaling group instances tagged
//! consistently with the group that launched them. Launch notifications
//! arrive through an SNS topic / SQS queue pair; each one is matched to a
//! watched group and its tag set is written to the instance's volumes.

pub mod aws;
pub mod channel;
pub mod config;
pub mod daemon;
pub mod tagger;
pub mod utils;
