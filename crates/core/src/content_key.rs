//! Filesystem-safe deduplication keys.

use crate::resolver::SourceId;

/// Characters that may not appear in a content key.
const UNSAFE_CHARS: &[char] = &['/', '\\', '?', '%', '*', ':', '|', '"', '<', '>'];

/// Replace every filesystem-unsafe character with `_`.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if UNSAFE_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Derive the content key for a resolved source: `sanitize(provider-id)`.
pub fn content_key(source: &SourceId) -> String {
    sanitize(&format!("{}-{}", source.provider, source.id))
}
