//! Will message handling.
//!
//! A will travels with its CONNECT, is published when the connection ends
//! without DISCONNECT, and is dropped on a graceful DISCONNECT or a session
//! takeover.

use mqflow_core::topic::{validate_topic_limits, validate_topic_name};
use mqflow_core::{ProtocolError, Publish, Will};

/// Convert a will into the PUBLISH that is fanned out for it.
pub fn will_to_publish(will: &Will) -> Publish {
    Publish::new(will.topic.clone(), will.message.clone(), will.qos, will.retain)
}

/// Check a will topic against the topic name rules and configured limits.
pub fn validate_will(
    will: &Will,
    max_topic_length: usize,
    max_topic_levels: usize,
) -> Result<(), ProtocolError> {
    validate_topic_name(&will.topic)?;
    validate_topic_limits(&will.topic, max_topic_length, max_topic_levels)
}
