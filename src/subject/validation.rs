//! Subject and pattern validation
//!
//! Key rules:
//! - Tokens are separated by `.` and must not be empty
//! - Whitespace is never allowed
//! - Subjects used for publishing must not contain wildcard tokens
//! - `*` matches exactly one token and must occupy the whole token
//! - `>` matches one or more trailing tokens and must be the last token

use super::SubjectError;

/// Token separator
pub const SEPARATOR: char = '.';
/// Single-token wildcard
pub const SINGLE_WILDCARD: &str = "*";
/// Multi-token wildcard
pub const FULL_WILDCARD: &str = ">";

/// Represents a token in a pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    /// Literal token
    Literal(&'a str),
    /// Single-token wildcard (*)
    SingleWildcard,
    /// Multi-token wildcard (>)
    FullWildcard,
}

/// Split a pattern into tokens
pub fn tokens(pattern: &str) -> impl Iterator<Item = Token<'_>> {
    pattern.split(SEPARATOR).map(|token| match token {
        SINGLE_WILDCARD => Token::SingleWildcard,
        FULL_WILDCARD => Token::FullWildcard,
        s => Token::Literal(s),
    })
}

fn has_whitespace(s: &str) -> bool {
    s.chars().any(char::is_whitespace)
}

/// Validate a concrete subject (used in PUB)
pub fn validate_subject(subject: &str) -> Result<(), SubjectError> {
    if subject.is_empty() || has_whitespace(subject) {
        return Err(SubjectError::InvalidSubject(subject.to_string()));
    }
    for token in subject.split(SEPARATOR) {
        if token.is_empty() || token == SINGLE_WILDCARD || token == FULL_WILDCARD {
            return Err(SubjectError::InvalidSubject(subject.to_string()));
        }
    }
    Ok(())
}

/// Validate a subscription pattern (used in SUB)
pub fn validate_pattern(pattern: &str) -> Result<(), SubjectError> {
    if pattern.is_empty() || has_whitespace(pattern) {
        return Err(SubjectError::InvalidPattern(pattern.to_string()));
    }

    let mut iter = pattern.split(SEPARATOR).peekable();
    while let Some(token) = iter.next() {
        let is_last = iter.peek().is_none();
        if token.is_empty() {
            return Err(SubjectError::InvalidPattern(pattern.to_string()));
        }
        if token == FULL_WILDCARD && !is_last {
            return Err(SubjectError::InvalidPattern(pattern.to_string()));
        }
        // Wildcard characters must occupy the whole token
        if token.len() > 1 && (token.contains('*') || token.contains('>')) {
            return Err(SubjectError::InvalidPattern(pattern.to_string()));
        }
    }
    Ok(())
}

/// Validate a queue group name
pub fn validate_queue(queue: &str) -> Result<(), SubjectError> {
    if queue.is_empty() || has_whitespace(queue) {
        return Err(SubjectError::InvalidPattern(queue.to_string()));
    }
    Ok(())
}

/// Check whether a pattern contains a wildcard token
pub fn is_wildcard(pattern: &str) -> bool {
    tokens(pattern).any(|t| !matches!(t, Token::Literal(_)))
}

/// Check if a pattern matches a concrete subject
///
/// Matching rules:
/// - literal tokens compare byte for byte
/// - `*` matches exactly one token
/// - `>` matches one or more remaining tokens
pub fn subject_matches_pattern(subject: &str, pattern: &str) -> bool {
    let mut subject_tokens = subject.split(SEPARATOR);

    for token in tokens(pattern) {
        match token {
            Token::FullWildcard => return subject_tokens.next().is_some(),
            Token::SingleWildcard => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            Token::Literal(lit) => match subject_tokens.next() {
                Some(s) if s == lit => {}
                _ => return false,
            },
        }
    }

    subject_tokens.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_subject() {
        assert!(validate_subject("foo").is_ok());
        assert!(validate_subject("foo.bar.baz").is_ok());
        assert!(validate_subject("foo*.bar").is_ok());

        assert!(validate_subject("").is_err());
        assert!(validate_subject("foo..bar").is_err());
        assert!(validate_subject(".foo").is_err());
        assert!(validate_subject("foo.").is_err());
        assert!(validate_subject("foo bar").is_err());
        assert!(validate_subject("foo.*").is_err());
        assert!(validate_subject("foo.>").is_err());
    }

    #[test]
    fn test_validate_pattern() {
        assert!(validate_pattern("foo").is_ok());
        assert!(validate_pattern("*").is_ok());
        assert!(validate_pattern(">").is_ok());
        assert!(validate_pattern("foo.*").is_ok());
        assert!(validate_pattern("foo.*.bar").is_ok());
        assert!(validate_pattern("foo.>").is_ok());
        assert!(validate_pattern("*.*.>").is_ok());

        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("foo.>.bar").is_err());
        assert!(validate_pattern("foo*").is_err());
        assert!(validate_pattern("foo.b>").is_err());
        assert!(validate_pattern("foo..bar").is_err());
        assert!(validate_pattern("foo\tbar").is_err());
    }

    #[test]
    fn test_subject_matches() {
        // Literals
        assert!(subject_matches_pattern("foo.bar", "foo.bar"));
        assert!(!subject_matches_pattern("foo.bar", "foo.baz"));
        assert!(!subject_matches_pattern("foo", "foo.bar"));
        assert!(!subject_matches_pattern("Foo.bar", "foo.bar"));

        // Single-token wildcard
        assert!(subject_matches_pattern("foo.bar", "foo.*"));
        assert!(subject_matches_pattern("foo.bar", "*.bar"));
        assert!(!subject_matches_pattern("foo", "foo.*"));
        assert!(!subject_matches_pattern("foo.bar.baz", "foo.*"));

        // Multi-token wildcard
        assert!(subject_matches_pattern("foo.bar", "foo.>"));
        assert!(subject_matches_pattern("foo.bar.baz", "foo.>"));
        assert!(subject_matches_pattern("foo", ">"));
        assert!(!subject_matches_pattern("foo", "foo.>"));
        assert!(!subject_matches_pattern("bar.baz", "foo.>"));
    }

    #[test]
    fn test_is_wildcard() {
        assert!(is_wildcard("foo.*"));
        assert!(is_wildcard(">"));
        assert!(!is_wildcard("foo.bar"));
    }
}
