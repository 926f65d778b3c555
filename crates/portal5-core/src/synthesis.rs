//! URL synthesis.
//!
//! The interception layer only sees proxy-form URLs such as
//! `https://proxy.example/https://target.example/page`. This module turns what
//! it observes back into real-world URLs: the page the user believes they are
//! viewing (the *represented* URL), the referrer to forward and the real
//! destination of the request.
//!
//! ## Architecture
//!
//! ```text
//! location ──> resolve_represented ──┐
//!                  (recorded) ───────┤ mutual defaulting
//! referrer ──> resolve_referrer ─────┘          │
//!                                               ▼
//! requested ────────────────────────> destination ──> canonicalize
//! ```
//!
//! Every function here is pure and never fails: parse errors fall back to the
//! next source of truth, and at worst the request is forwarded to the server
//! origin with its original path.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::marker;

/// Errors raised when configuring the server origin.
#[derive(Debug, Error)]
pub enum OriginError {
    /// The origin could not be parsed as a URL.
    #[error("invalid server origin '{input}': {reason}")]
    Invalid { input: String, reason: String },

    /// Only http and https origins can host the proxy.
    #[error("server origin must use http or https, got '{0}'")]
    UnsupportedScheme(String),
}

/// Returns true for the schemes the proxy is willing to synthesize.
pub fn is_web_scheme(scheme: &str) -> bool {
    scheme == "http" || scheme == "https"
}

/// The single origin every proxied page is served from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerOrigin {
    url: Url,
    serialized: String,
}

impl ServerOrigin {
    /// Parses a server origin. Any path, query or fragment is discarded.
    pub fn parse(input: &str) -> Result<Self, OriginError> {
        let invalid = |reason: String| OriginError::Invalid {
            input: input.to_string(),
            reason,
        };

        let url = Url::parse(input).map_err(|e| invalid(e.to_string()))?;
        if !is_web_scheme(url.scheme()) {
            return Err(OriginError::UnsupportedScheme(url.scheme().to_string()));
        }

        let serialized = url.origin().ascii_serialization();
        let url = Url::parse(&serialized).map_err(|e| invalid(e.to_string()))?;

        Ok(Self { url, serialized })
    }

    /// Returns the serialized origin, e.g. `https://proxy.example`.
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Returns the origin as a root URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the literal prefix stripped during canonicalization.
    pub fn prefix(&self) -> String {
        format!("{}/", self.serialized)
    }

    /// Returns true if `url` is on this origin.
    pub fn matches(&self, url: &Url) -> bool {
        url.origin().ascii_serialization() == self.serialized
    }

    /// Embeds a real-world URL into the proxy URL space.
    ///
    /// URLs already on the server origin are returned unchanged.
    pub fn embed(&self, destination: &Url) -> Url {
        if self.matches(destination) {
            return destination.clone();
        }
        self.url
            .join(&format!("/{}", destination.as_str()))
            .unwrap_or_else(|_| destination.clone())
    }
}

impl TryFrom<String> for ServerOrigin {
    type Error = OriginError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ServerOrigin> for String {
    fn from(origin: ServerOrigin) -> Self {
        origin.serialized
    }
}

impl std::fmt::Display for ServerOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.serialized)
    }
}

/// Result of synthesizing one intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesized {
    /// The page the requesting context represents, if it could be recovered.
    pub represented: Option<Url>,
    /// The de-prefixed referrer, if any.
    pub referrer: Option<Url>,
    /// The canonical real-world destination.
    pub destination: Url,
}

/// Strips every leading repetition of `prefix` from `input`.
pub fn trim_prefix<'a>(input: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return input;
    }
    let mut rest = input;
    while let Some(stripped) = rest.strip_prefix(prefix) {
        rest = stripped;
    }
    rest
}

/// Parses the absolute URL embedded in a proxy-form pathname.
///
/// Returns `None` unless the remainder is an absolute http(s) URL.
pub fn parse_embedded(pathname: &str) -> Option<Url> {
    let candidate = pathname.strip_prefix('/').unwrap_or(pathname);
    let url = Url::parse(candidate).ok()?;
    if is_web_scheme(url.scheme()) && url.has_host() {
        Some(url)
    } else {
        None
    }
}

/// Copies scheme, host and port from `source` into `target`.
fn adopt_origin(target: &mut Url, source: &Url) {
    // Scheme changes between http and https never fail for these URLs.
    let _ = target.set_scheme(source.scheme());
    let _ = target.set_host(source.host_str());
    let _ = target.set_port(source.port());
}

/// Recovers the represented URL of a browsing context.
///
/// The embedded URL in `location`'s path wins. Otherwise the
/// `_portal5origin` marker, then the `recorded` represented URL, supply the
/// origin and the location's path is re-applied. Query and fragment always
/// come from the location.
pub fn resolve_represented(location: &Url, recorded: Option<&Url>) -> Option<Url> {
    let mut represented = match parse_embedded(location.path()) {
        Some(url) => url,
        None => {
            let mut base = marker::pinned_origin(location)
                .or_else(|| recorded.cloned())?;
            base.set_path(location.path());
            base
        }
    };

    represented.set_query(location.query());
    marker::strip_origin_marker(&mut represented);
    represented.set_fragment(location.fragment());
    Some(represented)
}

/// Recovers the real referrer from the browser-supplied one.
///
/// Falls back to the referrer's path on the represented origin; the
/// referrer is dropped when neither is available.
pub fn resolve_referrer(referrer: Option<&Url>, represented: Option<&Url>) -> Option<Url> {
    let referrer = referrer?;
    match parse_embedded(referrer.path()) {
        Some(mut url) => {
            url.set_query(referrer.query());
            url.set_fragment(referrer.fragment());
            Some(url)
        }
        None => {
            let represented = represented?;
            let mut url = referrer.clone();
            adopt_origin(&mut url, represented);
            Some(url)
        }
    }
}

/// Derives the real destination of `requested`.
fn destination(requested: &Url, referrer: Option<&Url>, server: &ServerOrigin) -> Url {
    let mut destination = if !server.matches(requested) {
        requested.clone()
    } else {
        match parse_embedded(requested.path()) {
            Some(url) => url,
            None => {
                let mut url = referrer
                    .cloned()
                    .unwrap_or_else(|| server.url().clone());
                url.set_path(requested.path());
                url
            }
        }
    };

    destination.set_query(requested.query());
    destination.set_fragment(requested.fragment());
    destination
}

/// Synthesizes the represented URL, referrer and destination of a request.
///
/// `represented` is the context's already-resolved represented URL (see
/// [`resolve_represented`]); `referrer` is the raw browser referrer.
pub fn synthesize(
    requested: &Url,
    referrer: Option<&Url>,
    represented: Option<&Url>,
    server: &ServerOrigin,
) -> Synthesized {
    let resolved_referrer = resolve_referrer(referrer, represented);

    let represented = represented.cloned().or_else(|| resolved_referrer.clone());
    let referrer = resolved_referrer.or_else(|| represented.clone());

    let destination = canonicalize(
        &destination(requested, referrer.as_ref(), server),
        server,
    );

    Synthesized {
        represented,
        referrer,
        destination,
    }
}

/// Strips redundant proxy prefixes and re-resolves against the server.
///
/// `canonicalize(canonicalize(u)) == canonicalize(u)` for every input.
pub fn canonicalize(destination: &Url, server: &ServerOrigin) -> Url {
    let prefix = server.prefix();
    let trimmed = trim_prefix(destination.as_str(), &prefix);
    server
        .url()
        .join(trimmed)
        .unwrap_or_else(|_| destination.clone())
}

/// Removes repeated `/<origin>` segments the destination carries for its own
/// origin, e.g. `https://t.example/https://t.example/a` becomes
/// `https://t.example/a`.
pub fn collapse_self_origin(destination: &Url) -> Url {
    let origin = destination.origin().ascii_serialization();
    let prefix = format!("/{origin}");
    let path = destination.path();

    let mut trimmed = path;
    while let Some(rest) = trimmed.strip_prefix(prefix.as_str()) {
        // Only whole segments: `/https://t.example.evil` is a different origin.
        if !(rest.is_empty() || rest.starts_with('/')) {
            break;
        }
        trimmed = rest;
    }
    if trimmed.len() == path.len() {
        return destination.clone();
    }

    let mut collapsed = destination.clone();
    collapsed.set_path(if trimmed.is_empty() { "/" } else { trimmed });
    collapsed
}

/// Returns the proxy-form URL a client should be sent to for `destination`.
pub fn final_url(destination: &Url, server: &ServerOrigin) -> Url {
    server.embed(&collapse_self_origin(destination))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn server() -> ServerOrigin {
        ServerOrigin::parse("https://proxy.example").unwrap()
    }

    // ==================== ServerOrigin Tests ====================

    #[test]
    fn test_server_origin_discards_path() {
        let origin = ServerOrigin::parse("https://proxy.example/some/path?q=1").unwrap();
        assert_eq!(origin.as_str(), "https://proxy.example");
        assert_eq!(origin.prefix(), "https://proxy.example/");
        assert_eq!(origin.url().as_str(), "https://proxy.example/");
    }

    #[test]
    fn test_server_origin_rejects_other_schemes() {
        assert!(matches!(
            ServerOrigin::parse("ftp://proxy.example"),
            Err(OriginError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            ServerOrigin::parse("not a url"),
            Err(OriginError::Invalid { .. })
        ));
    }

    #[test]
    fn test_server_origin_serde() {
        let json = serde_json::to_string(&server()).unwrap();
        assert_eq!(json, "\"https://proxy.example\"");
        let back: ServerOrigin = serde_json::from_str(&json).unwrap();
        assert_eq!(back, server());
    }

    #[test]
    fn test_embed() {
        let s = server();
        assert_eq!(
            s.embed(&url("https://target.example/a?b=1")).as_str(),
            "https://proxy.example/https://target.example/a?b=1"
        );
        let local = url("https://proxy.example/settings");
        assert_eq!(s.embed(&local), local);
    }

    // ==================== Helper Tests ====================

    #[test]
    fn test_trim_prefix_is_iterative() {
        assert_eq!(trim_prefix("abababc", "ab"), "c");
        assert_eq!(trim_prefix("c", "ab"), "c");
        assert_eq!(trim_prefix("abc", ""), "abc");
    }

    #[test]
    fn test_parse_embedded() {
        assert_eq!(
            parse_embedded("/https://target.example/page").unwrap().as_str(),
            "https://target.example/page"
        );
        assert!(parse_embedded("/assets/app.js").is_none());
        assert!(parse_embedded("/javascript:alert(1)").is_none());
        assert!(parse_embedded("/").is_none());
    }

    // ==================== Represented / Referrer Tests ====================

    #[test]
    fn test_resolve_represented_from_location() {
        let location = url("https://proxy.example/https://target.example/app?x=1#top");
        let represented = resolve_represented(&location, None).unwrap();
        assert_eq!(represented.as_str(), "https://target.example/app?x=1#top");
    }

    #[test]
    fn test_resolve_represented_falls_back_to_record() {
        let location = url("https://proxy.example/next?y=2");
        let recorded = url("https://target.example/app?old=1");
        let represented = resolve_represented(&location, Some(&recorded)).unwrap();
        assert_eq!(represented.as_str(), "https://target.example/next?y=2");
    }

    #[test]
    fn test_resolve_represented_uses_marker() {
        let location = url(
            "https://proxy.example/docs?_portal5origin=https%3A%2F%2Ftarget.example&page=2",
        );
        let recorded = url("https://other.example/");
        let represented = resolve_represented(&location, Some(&recorded)).unwrap();
        assert_eq!(represented.as_str(), "https://target.example/docs?page=2");
    }

    #[test]
    fn test_resolve_represented_without_any_source() {
        let location = url("https://proxy.example/next");
        assert!(resolve_represented(&location, None).is_none());
    }

    #[test]
    fn test_resolve_referrer_embedded() {
        let referrer = url("https://proxy.example/https://target.example/from?a=1");
        let resolved = resolve_referrer(Some(&referrer), None).unwrap();
        assert_eq!(resolved.as_str(), "https://target.example/from?a=1");
    }

    #[test]
    fn test_resolve_referrer_adopts_represented_origin() {
        let referrer = url("https://proxy.example/from");
        let represented = url("http://target.example:8080/app");
        let resolved = resolve_referrer(Some(&referrer), Some(&represented)).unwrap();
        assert_eq!(resolved.as_str(), "http://target.example:8080/from");
    }

    #[test]
    fn test_resolve_referrer_dropped_without_context() {
        let referrer = url("https://proxy.example/from");
        assert!(resolve_referrer(Some(&referrer), None).is_none());
        assert!(resolve_referrer(None, None).is_none());
    }

    // ==================== Synthesis Tests ====================

    #[test]
    fn test_synthesize_embedded_destination() {
        let requested = url("https://proxy.example/https://target.example/page?x=1");
        let result = synthesize(&requested, None, None, &server());
        assert_eq!(result.destination.as_str(), "https://target.example/page?x=1");
        assert!(result.referrer.is_none());
        assert!(result.represented.is_none());
    }

    #[test]
    fn test_synthesize_relative_to_represented() {
        let requested = url("https://proxy.example/assets/app.js");
        let represented = url("https://target.example/app");
        let result = synthesize(&requested, None, Some(&represented), &server());
        assert_eq!(
            result.destination.as_str(),
            "https://target.example/assets/app.js"
        );
        assert_eq!(result.referrer.as_ref(), Some(&represented));
    }

    #[test]
    fn test_synthesize_cross_origin_request_is_kept() {
        let requested = url("https://cdn.example/lib.js?v=3");
        let represented = url("https://target.example/app");
        let result = synthesize(&requested, None, Some(&represented), &server());
        assert_eq!(result.destination, requested);
    }

    #[test]
    fn test_synthesize_falls_back_to_server() {
        let requested = url("https://proxy.example/favicon.ico?x=1");
        let result = synthesize(&requested, None, None, &server());
        assert_eq!(
            result.destination.as_str(),
            "https://proxy.example/favicon.ico?x=1"
        );
    }

    #[test]
    fn test_synthesize_mutual_defaulting() {
        let requested = url("https://proxy.example/img.png");
        let referrer = url("https://proxy.example/https://target.example/gallery");
        let result = synthesize(&requested, Some(&referrer), None, &server());
        assert_eq!(
            result.represented.unwrap().as_str(),
            "https://target.example/gallery"
        );
        assert_eq!(result.destination.as_str(), "https://target.example/img.png");
    }

    #[test]
    fn test_synthesize_search_and_hash_from_request() {
        let requested = url("https://proxy.example/https://target.example/p?q=2#frag");
        let result = synthesize(&requested, None, None, &server());
        assert_eq!(result.destination.query(), Some("q=2"));
        assert_eq!(result.destination.fragment(), Some("frag"));
    }

    // ==================== Canonicalization Tests ====================

    #[test]
    fn test_canonicalize_strips_repeated_prefix() {
        let s = server();
        let nested =
            url("https://proxy.example/https://proxy.example/https://target.example/a");
        assert_eq!(canonicalize(&nested, &s).as_str(), "https://target.example/a");
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let s = server();
        let inputs = [
            "https://proxy.example/https://proxy.example/https://target.example/a?b=1",
            "https://target.example/a",
            "https://proxy.example/local",
            "http://plain.example:8080/x#y",
        ];
        for input in inputs {
            let once = canonicalize(&url(input), &s);
            let twice = canonicalize(&once, &s);
            assert_eq!(once, twice, "not idempotent for {input}");
        }
    }

    #[test]
    fn test_collapse_self_origin() {
        let dest = url("https://target.example/https://target.example/https://target.example/a?x=1");
        assert_eq!(
            collapse_self_origin(&dest).as_str(),
            "https://target.example/a?x=1"
        );
        let plain = url("https://target.example/a");
        assert_eq!(collapse_self_origin(&plain), plain);
        let lookalike = url("https://target.example/https://target.example.evil/a");
        assert_eq!(collapse_self_origin(&lookalike), lookalike);
    }

    #[test]
    fn test_final_url() {
        let s = server();
        let dest = url("https://target.example/https://target.example/page");
        assert_eq!(
            final_url(&dest, &s).as_str(),
            "https://proxy.example/https://target.example/page"
        );
        let local = url("https://proxy.example/settings");
        assert_eq!(final_url(&local, &s), local);
    }
}
