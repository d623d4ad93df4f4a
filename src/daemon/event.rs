//! Launch event wire format.
//!
//! Messages arrive as an SNS envelope whose `Message` field holds the
//! Auto Scaling notification as a JSON string:
//!
//! ```text
//! outer: { Type, Subject, Time, Message: "<inner JSON>" }
//! inner: { AutoScalingGroupName, Event, Cause, EC2InstanceId, Time }
//! ```

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Outer delivery envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Envelope {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Subject")]
    pub subject: String,
    #[serde(rename = "Time")]
    pub time: Option<DateTime<Utc>>,
    #[serde(rename = "Message")]
    pub message: String,
}

impl Envelope {
    pub fn decode(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }

    /// Decode the Auto Scaling notification carried in `Message`.
    pub fn payload(&self) -> serde_json::Result<InboundEvent> {
        serde_json::from_str(&self.message)
    }
}

/// Auto Scaling notification for one group membership change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InboundEvent {
    #[serde(rename = "AutoScalingGroupName")]
    pub group_name: String,
    #[serde(rename = "Event")]
    pub kind: String,
    #[serde(rename = "Cause")]
    pub cause: String,
    #[serde(rename = "EC2InstanceId")]
    pub instance_id: String,
    #[serde(rename = "Time")]
    pub time: Option<DateTime<Utc>>,
}
