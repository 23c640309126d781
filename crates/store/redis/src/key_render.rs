/// Render a logical key into the Redis key with the given prefix.
///
/// The format is `prefix:key`, or just `key` when the prefix is empty.
pub fn render_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{prefix}:{key}")
    }
}

/// Inverse of [`render_key`] for keys the server hands back.
pub fn strip_key<'a>(prefix: &str, rendered: &'a str) -> &'a str {
    if prefix.is_empty() {
        return rendered;
    }
    rendered
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(rendered)
}
