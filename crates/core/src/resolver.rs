//! Source-reference resolution.
//!
//! Maps an arbitrary user-supplied string to a canonical `(provider, id)`
//! pair. Resolution is the only input to content-key derivation, so two
//! different URLs pointing at the same video deduplicate to one job.

use serde::{Deserialize, Serialize};
use url::Url;

/// A resolved source: the provider name plus its canonical identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId {
    pub provider: String,
    pub id: String,
}

impl SourceId {
    pub fn new(provider: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            id: id.into(),
        }
    }
}

/// Resolves source references for one provider.
pub trait SourceResolver: Send + Sync {
    /// Return the canonical id, or `None` if this resolver does not
    /// recognise the reference.
    fn resolve(&self, source: &str) -> Option<SourceId>;
}

// ---------------------------------------------------------------------------
// Resolver chain
// ---------------------------------------------------------------------------

/// Tries each resolver in order and returns the first match.
pub struct ResolverChain {
    resolvers: Vec<Box<dyn SourceResolver>>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<Box<dyn SourceResolver>>) -> Self {
        Self { resolvers }
    }
}

impl Default for ResolverChain {
    fn default() -> Self {
        Self::new(vec![Box::new(YoutubeResolver)])
    }
}

impl SourceResolver for ResolverChain {
    fn resolve(&self, source: &str) -> Option<SourceId> {
        self.resolvers.iter().find_map(|r| r.resolve(source))
    }
}

// ---------------------------------------------------------------------------
// YouTube
// ---------------------------------------------------------------------------

pub const YOUTUBE_PROVIDER: &str = "youtube";

/// Recognises `watch?v=`, `embed/` and `youtu.be/` links.
#[derive(Debug, Clone, Copy, Default)]
pub struct YoutubeResolver;

impl SourceResolver for YoutubeResolver {
    fn resolve(&self, source: &str) -> Option<SourceId> {
        let url = parse_lenient(source)?;
        let host = url.host_str()?.to_ascii_lowercase();
        let mut segments = url.path_segments()?.filter(|s| !s.is_empty());

        let id = match host.as_str() {
            "www.youtube.com" => match segments.next()?.to_ascii_lowercase().as_str() {
                "watch" => url
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned())?,
                "embed" => segments.next()?.to_string(),
                _ => return None,
            },
            "youtu.be" => segments.next()?.to_string(),
            _ => return None,
        };

        if id.is_empty() {
            return None;
        }
        Some(SourceId::new(YOUTUBE_PROVIDER, id))
    }
}

/// Parse `source` as a URL, assuming `https://` when no scheme is present.
fn parse_lenient(source: &str) -> Option<Url> {
    let has_scheme = source
        .split_once("://")
        .is_some_and(|(scheme, _)| !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphabetic()));
    if has_scheme {
        Url::parse(source).ok()
    } else {
        Url::parse(&format!("https://{source}")).ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn youtube(source: &str) -> Option<String> {
        YoutubeResolver.resolve(source).map(|s| {
            assert_eq!(s.provider, YOUTUBE_PROVIDER);
            s.id
        })
    }

    #[test]
    fn normal_url() {
        assert_eq!(
            youtube("https://www.youtube.com/watch?v=dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
    }

    #[test]
    fn url_without_scheme() {
        assert_eq!(
            youtube("www.youtube.com/watch?v=dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
    }

    #[test]
    fn share_url() {
        assert_eq!(youtube("https://youtu.be/dQw4w9WgXcQ").as_deref(), Some("dQw4w9WgXcQ"));
    }

    #[test]
    fn embed_url() {
        assert_eq!(
            youtube("https://www.youtube.com/embed/dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
    }

    #[test]
    fn extra_query_parameters_are_ignored() {
        assert_eq!(
            youtube("https://www.youtube.com/watch?list=abc&v=dQw4w9WgXcQ&t=10").as_deref(),
            Some("dQw4w9WgXcQ")
        );
    }

    #[test]
    fn raw_id_is_not_resolved() {
        assert_eq!(youtube("dQw4w9WgXcQ"), None);
    }

    #[test]
    fn other_hosts_are_not_resolved() {
        assert_eq!(youtube("https://example.com/watch?v=abc"), None);
        assert_eq!(youtube("https://www.youtube.com/"), None);
    }

    #[test]
    fn chain_returns_first_match() {
        struct Fixed;
        impl SourceResolver for Fixed {
            fn resolve(&self, source: &str) -> Option<SourceId> {
                Some(SourceId::new("fixed", source))
            }
        }

        let chain = ResolverChain::new(vec![Box::new(YoutubeResolver), Box::new(Fixed)]);
        assert_eq!(
            chain.resolve("https://youtu.be/xyz"),
            Some(SourceId::new(YOUTUBE_PROVIDER, "xyz"))
        );
        assert_eq!(chain.resolve("anything"), Some(SourceId::new("fixed", "anything")));
    }
}
