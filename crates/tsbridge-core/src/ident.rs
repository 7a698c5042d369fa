use std::fmt;

use crate::error::CoreError;

/// Longest topic accepted by brokers (MQTT UTF-8 string limit).
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Connection role, used as the client-id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    pub fn prefix(self) -> &'static str {
        match self {
            Role::Publisher => "pub",
            Role::Subscriber => "sub",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Normalizes an optional instance name for deterministic derivation.
///
/// Empty/whitespace-only names map to `"default"`.
pub fn normalize_instance(instance: &str) -> String {
    let normalized = instance.trim().to_lowercase();
    if normalized.is_empty() {
        "default".to_string()
    } else {
        normalized
    }
}

/// Derives a stable client id:
/// `<role>-hex(H("client" || role || 0 || topic || 0 || instance)[..8])`.
///
/// Two processes configured with the same role, topic and instance derive the
/// same id, which a broker treats as a takeover of the older session.
pub fn derive_client_id(role: Role, topic: &str, instance: &str) -> String {
    let instance = normalize_instance(instance);
    let mut buf = Vec::with_capacity(6 + 3 + topic.len() + instance.len() + 2);
    buf.extend_from_slice(b"client");
    buf.extend_from_slice(role.prefix().as_bytes());
    buf.push(0);
    buf.extend_from_slice(topic.as_bytes());
    buf.push(0);
    buf.extend_from_slice(instance.as_bytes());
    let digest = blake3::hash(&buf);
    format!("{}-{}", role.prefix(), hex::encode(&digest.as_bytes()[..8]))
}

/// Validates a concrete topic name used for publishing.
pub fn validate_topic(topic: &str) -> Result<(), CoreError> {
    validate_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(CoreError::InvalidTopic("wildcards are not allowed in topic names"));
    }
    Ok(())
}

/// Validates a subscription filter, allowing single-level `+` and trailing `#`.
pub fn validate_topic_filter(filter: &str) -> Result<(), CoreError> {
    validate_common(filter)?;
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i + 1 != levels.len()) {
            return Err(CoreError::InvalidTopic("'#' must be the whole final level"));
        }
        if level.contains('+') && *level != "+" {
            return Err(CoreError::InvalidTopic("'+' must occupy a whole level"));
        }
    }
    Ok(())
}

fn validate_common(topic: &str) -> Result<(), CoreError> {
    if topic.is_empty() {
        return Err(CoreError::InvalidTopic("topic must not be empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(CoreError::InvalidTopic("topic exceeds 65535 bytes"));
    }
    if topic.contains('\0') {
        return Err(CoreError::InvalidTopic("topic must not contain NUL"));
    }
    Ok(())
}

/// Returns whether `topic` matches the subscription `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        derive_client_id, normalize_instance, topic_matches, validate_topic,
        validate_topic_filter, Role,
    };

    #[test]
    fn client_id_is_deterministic_and_role_prefixed() {
        let a = derive_client_id(Role::Publisher, "sensors/temp", "");
        let b = derive_client_id(Role::Publisher, "sensors/temp", " Default ");
        assert_eq!(a, b);
        assert!(a.starts_with("pub-"));
        assert_eq!(a.len(), 4 + 16);
    }

    #[test]
    fn client_id_has_role_and_topic_separation() {
        let publisher = derive_client_id(Role::Publisher, "t", "x");
        let subscriber = derive_client_id(Role::Subscriber, "t", "x");
        assert_ne!(publisher[4..], subscriber[4..]);
        assert_ne!(
            derive_client_id(Role::Subscriber, "a", "x"),
            derive_client_id(Role::Subscriber, "b", "x")
        );
    }

    #[test]
    fn instance_normalization_is_stable() {
        assert_eq!(normalize_instance("  Left "), "left");
        assert_eq!(normalize_instance(""), "default");
    }

    #[test]
    fn topic_validation_rejects_wildcards_and_empty() {
        assert!(validate_topic("a/b").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("a/+").is_err());
        assert!(validate_topic("a\0b").is_err());
    }

    #[test]
    fn filter_validation_enforces_wildcard_placement() {
        assert!(validate_topic_filter("a/+/c").is_ok());
        assert!(validate_topic_filter("a/#").is_ok());
        assert!(validate_topic_filter("a/#/c").is_err());
        assert!(validate_topic_filter("a/b+").is_err());
    }

    #[test]
    fn filter_matching_follows_level_rules() {
        assert!(topic_matches("a/b", "a/b"));
        assert!(topic_matches("a/+", "a/b"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("#", "anything"));
        assert!(!topic_matches("a/b", "a/c"));
    }
}
