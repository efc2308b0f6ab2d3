//! Title sanitization for scratch filenames.

/// Reduces an arbitrary media title to a filesystem-safe token.
///
/// Everything outside ASCII alphanumerics (path separators, quotes,
/// whitespace, commas, hyphens, brackets and whatever else a title may carry)
/// becomes an underscore, runs of underscores collapse to one, and edge
/// underscores are trimmed. Titles with nothing left yield `"untitled"` so
/// the token is never empty. The mapping is total and idempotent.
pub fn sanitize_title(title: &str) -> String {
    let mut token = String::with_capacity(title.len());
    let mut last_was_underscore = false;

    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            token.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            token.push('_');
            last_was_underscore = true;
        }
    }

    let trimmed = token.trim_matches('_');
    if trimmed.is_empty() {
        "untitled".to_owned()
    } else {
        trimmed.to_owned()
    }
}
