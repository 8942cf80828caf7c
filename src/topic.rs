//! Topic name and topic filter validation
//!
//! Subscriptions accept filters where `+` matches exactly one level and `#`
//! (final level only) matches the remainder. Publish topics must be concrete.

use thiserror::Error;

/// Maximum topic length in bytes (UTF-8 encoded)
pub const MAX_TOPIC_LENGTH: usize = 65535;

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL_WILDCARD: &str = "+";
const MULTI_LEVEL_WILDCARD: &str = "#";

/// Topic validation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic cannot be empty")]
    Empty,
    #[error("topic exceeds maximum length of {MAX_TOPIC_LENGTH} bytes")]
    TooLong,
    #[error("topic cannot contain a null character")]
    ContainsNullChar,
    #[error("wildcard characters (+, #) are not allowed in publish topics")]
    WildcardInPublishTopic,
    #[error("single-level wildcard (+) must occupy an entire topic level")]
    InvalidSingleLevelWildcard,
    #[error("multi-level wildcard (#) must be the last level and occupy it entirely")]
    InvalidMultiLevelWildcard,
}

fn validate_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::TooLong);
    }
    if topic.contains('\0') {
        return Err(TopicError::ContainsNullChar);
    }
    Ok(())
}

/// Validate a concrete topic used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    validate_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInPublishTopic);
    }
    Ok(())
}

/// Validate a subscription topic filter
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    validate_common(filter)?;

    let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
    let last = levels.len() - 1;

    for (index, level) in levels.iter().enumerate() {
        if level.contains('+') && *level != SINGLE_LEVEL_WILDCARD {
            return Err(TopicError::InvalidSingleLevelWildcard);
        }
        if level.contains('#') && (*level != MULTI_LEVEL_WILDCARD || index != last) {
            return Err(TopicError::InvalidMultiLevelWildcard);
        }
    }

    Ok(())
}

/// Whether the filter contains any wildcard level
pub fn is_wildcard_filter(filter: &str) -> bool {
    filter
        .split(LEVEL_SEPARATOR)
        .any(|level| level == SINGLE_LEVEL_WILDCARD || level == MULTI_LEVEL_WILDCARD)
}

/// Match a concrete topic against a (validated) filter
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split(LEVEL_SEPARATOR);
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn concrete_topic_matches_itself(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,4}") {
            prop_assert!(validate_topic_name(&topic).is_ok());
            prop_assert!(validate_topic_filter(&topic).is_ok());
            prop_assert!(topic_matches(&topic, &topic));
        }

        #[test]
        fn hash_matches_everything(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,4}") {
            prop_assert!(topic_matches("#", &topic));
        }

        #[test]
        fn wildcards_never_valid_for_publish(prefix in "[a-z]{0,5}", wildcard in "[+#]") {
            let topic = format!("{prefix}/{wildcard}");
            prop_assert_eq!(validate_topic_name(&topic), Err(TopicError::WildcardInPublishTopic));
        }
    }

    #[test]
    fn test_malformed_topics() {
        assert_eq!(validate_topic_name(""), Err(TopicError::Empty));
        assert_eq!(validate_topic_filter(""), Err(TopicError::Empty));
        assert_eq!(
            validate_topic_name("a\0b"),
            Err(TopicError::ContainsNullChar)
        );
        let long = "x".repeat(MAX_TOPIC_LENGTH + 1);
        assert_eq!(validate_topic_filter(&long), Err(TopicError::TooLong));
    }

    #[test]
    fn test_filter_wildcard_placement() {
        assert!(validate_topic_filter("traffic/+/updates").is_ok());
        assert!(validate_topic_filter("traffic/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+").is_ok());

        assert_eq!(
            validate_topic_filter("traffic/up+"),
            Err(TopicError::InvalidSingleLevelWildcard)
        );
        assert_eq!(
            validate_topic_filter("traffic/#/updates"),
            Err(TopicError::InvalidMultiLevelWildcard)
        );
        assert_eq!(
            validate_topic_filter("traffic/up#"),
            Err(TopicError::InvalidMultiLevelWildcard)
        );
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("traffic/updates", "traffic/updates"));
        assert!(!topic_matches("traffic/updates", "traffic/updates/extra"));
        assert!(!topic_matches("traffic/updates", "routes/updates"));

        assert!(topic_matches("traffic/+", "traffic/updates"));
        assert!(!topic_matches("traffic/+", "traffic/updates/north"));
        assert!(topic_matches("+/updates", "routes/updates"));

        assert!(topic_matches("traffic/#", "traffic"));
        assert!(topic_matches("traffic/#", "traffic/updates/north"));
        assert!(!topic_matches("traffic/#", "routes/updates"));
    }

    #[test]
    fn test_is_wildcard_filter() {
        assert!(is_wildcard_filter("a/+/c"));
        assert!(is_wildcard_filter("a/#"));
        assert!(!is_wildcard_filter("a/b/c"));
    }
}
