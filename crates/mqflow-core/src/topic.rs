//! Topic name and topic filter rules.

use crate::error::ProtocolError;

type Result<T> = std::result::Result<T, ProtocolError>;

/// Validate a topic name used in PUBLISH or a will.
///
/// Topic names are non-empty and never contain wildcards.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(ProtocolError::InvalidTopic(
            "topic name must not be empty".into(),
        ));
    }
    // MQTT-3.3.2-2: wildcards are not allowed in topic names
    if topic.contains(['+', '#']) {
        return Err(ProtocolError::InvalidTopic(format!(
            "wildcard in topic name '{}'",
            topic
        )));
    }
    Ok(())
}

/// Validate a topic filter used in SUBSCRIBE or UNSUBSCRIBE.
///
/// `+` must occupy a whole level; `#` must occupy the whole last level.
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(ProtocolError::InvalidTopic(
            "topic filter must not be empty".into(),
        ));
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" if levels.peek().is_some() => {
                return Err(ProtocolError::InvalidTopic(format!(
                    "'#' must be the last level in '{}'",
                    filter
                )));
            }
            "#" | "+" => {}
            _ if level.contains(['+', '#']) => {
                return Err(ProtocolError::InvalidTopic(format!(
                    "wildcard must occupy a whole level in '{}'",
                    filter
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Whether a filter uses `+` or `#`.
pub fn has_wildcards(filter: &str) -> bool {
    filter.contains(['+', '#'])
}

/// Validate a topic name or filter against length and depth limits.
///
/// A limit of 0 disables that check.
#[inline]
pub fn validate_topic_limits(topic: &str, max_length: usize, max_levels: usize) -> Result<()> {
    if max_length > 0 && topic.len() > max_length {
        return Err(ProtocolError::TopicTooLong {
            len: topic.len(),
            max: max_length,
        });
    }

    if max_levels > 0 {
        let mut levels = 1usize;
        for b in topic.bytes() {
            if b == b'/' {
                levels += 1;
                if levels > max_levels {
                    return Err(ProtocolError::TopicTooDeep {
                        levels,
                        max: max_levels,
                    });
                }
            }
        }
    }

    Ok(())
}

/// Check if a topic name matches a topic filter.
///
/// Topics starting with `$` are not matched by filters starting with a
/// wildcard (MQTT-4.7.2-1).
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // "a/#" also matches "a"
            (Some("#"), _) => return true,
            // '+' needs a non-empty level
            (Some("+"), Some(t)) if !t.is_empty() => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
