//! Upstream fetching.
//!
//! The pipeline only ever talks to an [`Upstream`]. [`HttpUpstream`] sends
//! requests addressed to the public server origin to the origin-fetching
//! backend over HTTP.

use async_trait::async_trait;
use hyper::header::{HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CACHE_CONTROL, COOKIE};
use hyper::HeaderMap;
use portal5_core::request::{CacheMode, Credentials, RedirectMode};
use portal5_core::ServerOrigin;
use tracing::debug;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::request::{OutboundRequest, ProxyResponse};

/// Something that can answer outbound requests.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Sends `request` and returns the full response.
    async fn fetch(&self, request: OutboundRequest) -> Result<ProxyResponse>;
}

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// [`Upstream`] over HTTP using reqwest.
pub struct HttpUpstream {
    follow: reqwest::Client,
    manual: reqwest::Client,
    server: ServerOrigin,
    backend: Url,
}

impl std::fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("server", &self.server.as_str())
            .field("backend", &self.backend.as_str())
            .finish()
    }
}

impl HttpUpstream {
    /// Creates an upstream that maps `server` to `backend`.
    pub fn new(server: ServerOrigin, backend: Url) -> Result<Self> {
        let follow = reqwest::Client::builder()
            .build()
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;
        let manual = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        Ok(Self {
            follow,
            manual,
            server,
            backend,
        })
    }

    /// Returns where a request for `url` is actually sent.
    pub fn backend_url(&self, url: &Url) -> Url {
        if !self.server.matches(url) {
            return url.clone();
        }
        let mut mapped = self.backend.clone();
        mapped.set_path(url.path());
        mapped.set_query(url.query());
        mapped
    }
}

/// Applies fetch options that have a header equivalent.
fn apply_options(headers: &mut HeaderMap, request: &OutboundRequest) {
    strip_hop_by_hop(headers);
    // Bodies may be rewritten; ask for an identity encoding.
    headers.remove(ACCEPT_ENCODING);

    if request.credentials == Credentials::Omit {
        headers.remove(COOKIE);
        headers.remove(AUTHORIZATION);
    }

    if matches!(
        request.cache,
        CacheMode::NoStore | CacheMode::Reload | CacheMode::NoCache
    ) && !headers.contains_key(CACHE_CONTROL)
    {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: OutboundRequest) -> Result<ProxyResponse> {
        let url = self.backend_url(&request.url);
        let client = match request.redirect {
            RedirectMode::Follow => &self.follow,
            RedirectMode::Error | RedirectMode::Manual => &self.manual,
        };

        let mut headers = request.headers.clone();
        apply_options(&mut headers, &request);

        debug!(method = %request.method, url = %url, "Sending upstream request");

        let mut builder = client.request(request.method.clone(), url).headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        let status = response.status();
        if request.redirect == RedirectMode::Error && status.is_redirection() {
            return Err(ProxyError::Upstream(format!(
                "redirect ({status}) on a request that forbids redirects"
            )));
        }

        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HOST;
    use hyper::Method;

    fn upstream() -> HttpUpstream {
        HttpUpstream::new(
            ServerOrigin::parse("https://proxy.example").unwrap(),
            Url::parse("http://127.0.0.1:5000").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_backend_url_maps_server_origin() {
        let upstream = upstream();
        let mapped = upstream.backend_url(
            &Url::parse("https://proxy.example/https://t.example/a?x=1").unwrap(),
        );
        assert_eq!(
            mapped.as_str(),
            "http://127.0.0.1:5000/https://t.example/a?x=1"
        );

        let foreign = Url::parse("https://cdn.example/lib.js").unwrap();
        assert_eq!(upstream.backend_url(&foreign), foreign);
    }

    #[test]
    fn test_options_become_headers() {
        let mut request = OutboundRequest::new(
            Method::GET,
            Url::parse("https://proxy.example/").unwrap(),
        );
        request.credentials = Credentials::Omit;
        request.cache = CacheMode::NoStore;

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("a=1"));
        headers.insert(HOST, HeaderValue::from_static("proxy.example"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("accept", HeaderValue::from_static("text/html"));

        apply_options(&mut headers, &request);
        assert!(headers.get(COOKIE).is_none());
        assert!(headers.get(HOST).is_none());
        assert!(headers.get(ACCEPT_ENCODING).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert_eq!(headers.get(CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(headers.get("accept").unwrap(), "text/html");
    }
}
