//! Subject validation and wildcard matching.
//!
//! Subjects are dot-separated token strings.  The wildcards `*` (exactly one
//! token) and `>` (one or more trailing tokens) are only legal on
//! subscription subjects, never on publish subjects.  Tokens must be
//! non-empty and free of whitespace; by default subjects are ASCII, with an
//! opt-in lenient mode that accepts UTF-8 (some deployments allow it on
//! publish).

/// Validate a subject string.
///
/// `allow_wildcards` permits `*` and `>` tokens (subscription side);
/// `allow_utf8` relaxes the ASCII requirement.
pub fn validate_subject(
    subject: &str,
    allow_wildcards: bool,
    allow_utf8: bool,
) -> Result<(), &'static str> {
    if subject.is_empty() {
        return Err("empty subject");
    }
    if !allow_utf8 && !subject.is_ascii() {
        return Err("subject must be ASCII");
    }
    if subject
        .chars()
        .any(|c| c == ' ' || c == '\t' || c == '\r' || c == '\n')
    {
        return Err("subject contains whitespace");
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err("empty subject token");
        }
        match *token {
            "*" => {
                if !allow_wildcards {
                    return Err("wildcard not allowed here");
                }
            }
            ">" => {
                if !allow_wildcards {
                    return Err("wildcard not allowed here");
                }
                if i != tokens.len() - 1 {
                    return Err("'>' must be the last token");
                }
            }
            t => {
                // Wildcard characters embedded in a longer token are literal
                // in the protocol grammar but almost always a caller bug.
                if t.contains('*') || t.contains('>') {
                    return Err("wildcard must be a whole token");
                }
            }
        }
    }
    Ok(())
}

/// Validate a publish subject (no wildcards).
pub fn validate_publish_subject(subject: &str, allow_utf8: bool) -> Result<(), &'static str> {
    validate_subject(subject, false, allow_utf8)
}

/// Whether `filter` (which may contain wildcards) matches `subject`.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            _ => return false,
        }
    }
}
