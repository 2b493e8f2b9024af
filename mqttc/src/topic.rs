//! Topic name and topic filter validation.

use crate::error::{Error, Result};

/// Longest topic or filter that fits a length-prefixed string.
pub const MAX_TOPIC_LEN: usize = u16::MAX as usize;

/// Validate a topic filter used in SUBSCRIBE / UNSUBSCRIBE.
///
/// `+` must occupy a whole level and `#` must be the whole last level.
pub fn validate_filter(filter: &str) -> Result<()> {
    check_common(filter)?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err(Error::InvalidTopic(format!(
                "'#' must be the whole last level: {}",
                filter
            )));
        }
        if level.contains('+') && level != "+" {
            return Err(Error::InvalidTopic(format!(
                "'+' must be a whole level: {}",
                filter
            )));
        }
    }

    Ok(())
}

/// Validate a topic name used in PUBLISH.
pub fn validate_topic(topic: &str) -> Result<()> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(Error::InvalidTopic(format!(
            "wildcards are not allowed in topic names: {}",
            topic
        )));
    }
    Ok(())
}

fn check_common(s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::InvalidTopic("empty topic".to_string()));
    }
    if s.len() > MAX_TOPIC_LEN {
        return Err(Error::InvalidTopic(format!("topic too long: {} bytes", s.len())));
    }
    if s.contains('\0') {
        return Err(Error::InvalidTopic("topic contains NUL".to_string()));
    }
    Ok(())
}
