//! Topic validation and filter matching.

/// Validate a topic that will be published to.
///
/// Publish topics must be non-empty, must not contain wildcards and must not
/// contain the NUL character.
pub fn valid_publish_topic(topic: &str) -> Result<(), String> {
    validate_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(format!("wildcards are not allowed in publish topic: {}", topic));
    }
    Ok(())
}

/// Validate a topic filter that will be subscribed to.
///
/// `+` must occupy a whole level; `#` must occupy the whole last level.
pub fn valid_subscribe_topic(topic: &str) -> Result<(), String> {
    validate_common(topic)?;

    let levels: Vec<&str> = topic.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('+') && *level != "+" {
            return Err(format!(
                "single-level wildcard must occupy an entire level: {}",
                topic
            ));
        }
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(format!(
                "multi-level wildcard must be the last level: {}",
                topic
            ));
        }
    }
    Ok(())
}

fn validate_common(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic must not be empty".to_string());
    }
    if topic.contains('\0') {
        return Err(format!("topic must not contain NUL: {:?}", topic));
    }
    if topic.len() > 65535 {
        return Err("topic is longer than 65535 bytes".to_string());
    }
    Ok(())
}

/// Check whether `topic` is matched by the subscription `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    // Wildcards at the first level never match topics starting with '$'
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
