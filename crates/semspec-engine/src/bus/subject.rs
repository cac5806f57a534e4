//! Subject pattern matching
//!
//! Subjects are dot-separated token hierarchies. A pattern token `*`
//! matches exactly one subject token; a terminal `>` matches one or more
//! remaining tokens.

/// Check whether a subject matches a subscription pattern
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (Some(_), Some(_)) => return false,
            (None, None) => return true,
            // Pattern exhausted with subject tokens left, or vice versa
            _ => return false,
        }
    }
}

/// Check whether a string is a literal subject (no wildcards)
pub fn is_literal(subject: &str) -> bool {
    subject.split('.').all(|token| token != "*" && token != ">")
}
