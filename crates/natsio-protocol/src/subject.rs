//! Subject validation and wildcard matching.
//!
//! Subjects are `.`-separated tokens. Subscription patterns may use `*` to
//! match exactly one token and `>` as the final token to match one or more
//! trailing tokens.

use crate::error::{NatsError, Result};

pub const SINGLE_WILDCARD: &str = "*";
pub const FULL_WILDCARD: &str = ">";

/// Returns true when `pattern` matches `subject`.
///
/// Empty or malformed inputs never match. Matching walks both token streams
/// in lockstep without allocating.
#[must_use]
pub fn matches(pattern: &str, subject: &str) -> bool {
    if pattern.is_empty() || subject.is_empty() {
        return false;
    }

    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(FULL_WILDCARD), Some(token)) => {
                return pattern_tokens.next().is_none()
                    && !token.is_empty()
                    && subject_tokens.all(|t| !t.is_empty());
            }
            (Some(SINGLE_WILDCARD), Some(token)) => {
                if token.is_empty() {
                    return false;
                }
            }
            (Some(literal), Some(token)) => {
                if literal.is_empty() || literal != token {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validates a subject used for publishing: non-empty tokens, no wildcards,
/// no whitespace.
pub fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty() {
        return Err(NatsError::InvalidSubject(subject.to_string()));
    }
    for token in subject.split('.') {
        if token.is_empty()
            || token == SINGLE_WILDCARD
            || token == FULL_WILDCARD
            || token.chars().any(char::is_whitespace)
        {
            return Err(NatsError::InvalidSubject(subject.to_string()));
        }
    }
    Ok(())
}

/// Validates a subscription pattern: non-empty tokens, no whitespace, and
/// `>` only as the last token.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(NatsError::InvalidSubject(pattern.to_string()));
    }
    let mut tokens = pattern.split('.').peekable();
    while let Some(token) = tokens.next() {
        if token.is_empty() || token.chars().any(char::is_whitespace) {
            return Err(NatsError::InvalidSubject(pattern.to_string()));
        }
        if token == FULL_WILDCARD && tokens.peek().is_some() {
            return Err(NatsError::InvalidSubject(pattern.to_string()));
        }
    }
    Ok(())
}

pub fn validate_queue_group(queue: &str) -> Result<()> {
    if queue.is_empty() || queue.chars().any(char::is_whitespace) {
        return Err(NatsError::InvalidQueueGroup(queue.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_literal_matching() {
        assert!(matches("foo", "foo"));
        assert!(matches("foo.bar", "foo.bar"));
        assert!(!matches("foo.bar", "foo.baz"));
        assert!(!matches("foo", "foo.bar"));
        assert!(!matches("foo.bar", "foo"));
    }

    #[test]
    fn test_single_wildcard() {
        assert!(matches("foo.*", "foo.bar"));
        assert!(!matches("foo.*", "foo"));
        assert!(!matches("foo.*", "foo.bar.baz"));
        assert!(matches("*.bar", "foo.bar"));
        assert!(matches("foo.*.baz", "foo.x.baz"));
        assert!(!matches("foo.*.baz", "foo.x.y.baz"));
    }

    #[test]
    fn test_full_wildcard() {
        assert!(matches("foo.>", "foo.bar"));
        assert!(matches("foo.>", "foo.bar.baz"));
        assert!(!matches("foo.>", "foo"));
        assert!(!matches("foo.>", "bar"));
        assert!(matches(">", "foo"));
        assert!(matches(">", "foo.bar"));
        assert!(matches("*.>", "a.b.c"));
        assert!(!matches("*.>", "a"));
    }

    #[test]
    fn test_full_wildcard_must_be_last() {
        assert!(!matches("foo.>.bar", "foo.x.bar"));
        assert!(validate_pattern("foo.>.bar").is_err());
        assert!(validate_pattern("foo.>").is_ok());
    }

    #[test]
    fn test_empty_inputs_rejected() {
        assert!(!matches("", "foo"));
        assert!(!matches("foo", ""));
        assert!(!matches("", ""));
        assert!(!matches("foo..bar", "foo..bar"));
        assert!(!matches("foo.*", "foo."));
        assert!(validate_subject("").is_err());
        assert!(validate_pattern("").is_err());
        assert!(validate_subject("foo..bar").is_err());
    }

    #[test]
    fn test_publish_subject_validation() {
        assert!(validate_subject("foo.bar").is_ok());
        assert!(validate_subject("_INBOX.abc.def").is_ok());
        assert!(validate_subject("foo.*").is_err());
        assert!(validate_subject("foo.>").is_err());
        assert!(validate_subject("foo bar").is_err());
    }

    #[test]
    fn test_queue_group_validation() {
        assert!(validate_queue_group("workers").is_ok());
        assert!(validate_queue_group("").is_err());
        assert!(validate_queue_group("a b").is_err());
    }

    fn token() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,6}"
    }

    proptest! {
        #[test]
        fn prop_subject_matches_itself(tokens in prop::collection::vec(token(), 1..6)) {
            let subject = tokens.join(".");
            prop_assert!(matches(&subject, &subject));
        }

        #[test]
        fn prop_star_matches_exactly_one_token(
            prefix in prop::collection::vec(token(), 0..4),
            last in token(),
            extra in prop::collection::vec(token(), 1..3)
        ) {
            let mut pattern_tokens = prefix.clone();
            pattern_tokens.push("*".to_string());
            let pattern = pattern_tokens.join(".");

            let mut exact = prefix.clone();
            exact.push(last.clone());
            prop_assert!(matches(&pattern, &exact.join(".")));

            let mut longer = exact.clone();
            longer.extend(extra);
            prop_assert!(!matches(&pattern, &longer.join(".")));

            if !prefix.is_empty() {
                prop_assert!(!matches(&pattern, &prefix.join(".")));
            }
        }

        #[test]
        fn prop_full_wildcard_needs_at_least_one_token(
            prefix in prop::collection::vec(token(), 1..4),
            tail in prop::collection::vec(token(), 0..4)
        ) {
            let pattern = format!("{}.>", prefix.join("."));
            prop_assert!(!matches(&pattern, &prefix.join(".")));

            let mut subject = prefix.clone();
            subject.push("x".to_string());
            subject.extend(tail);
            prop_assert!(matches(&pattern, &subject.join(".")));
        }
    }
}
