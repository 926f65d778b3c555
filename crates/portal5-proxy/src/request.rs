//! Intercepted requests, outbound requests and responses.
//!
//! The host fills an [`InterceptedRequest`] from whatever it observes; the
//! pipeline turns it into an [`OutboundRequest`] for the [`Upstream`] and
//! hands a [`ProxyResponse`] back.
//!
//! [`Upstream`]: crate::upstream::Upstream

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::{HeaderMap, Method, StatusCode};
use portal5_core::protocol::{SessionEnvelope, TransmissionMode, SESSION_HEADER};
use portal5_core::request::{CacheMode, Credentials, RedirectMode};
use portal5_core::{Destination, ReferrerPolicy, RequestMode};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::error::{ProxyError, Result};

/// A request as seen by the interception layer.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    /// Requested URL, usually on the server origin.
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub mode: RequestMode,
    pub destination: Destination,
    /// Browser-supplied referrer, still in proxy form.
    pub referrer: Option<Url>,
    pub referrer_policy: ReferrerPolicy,
    /// Id of the browsing context that issued the request, if known.
    pub context_id: Option<String>,
    pub credentials: Credentials,
    pub cache: CacheMode,
    pub redirect: RedirectMode,
    pub integrity: Option<String>,
}

impl InterceptedRequest {
    /// Creates a request with browser defaults.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            mode: RequestMode::default(),
            destination: Destination::default(),
            referrer: None,
            referrer_policy: ReferrerPolicy::default(),
            context_id: None,
            credentials: Credentials::default(),
            cache: CacheMode::default(),
            redirect: RedirectMode::default(),
            integrity: None,
        }
    }

    /// Sets the request mode.
    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the request destination.
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Sets the referrer.
    pub fn with_referrer(mut self, referrer: Option<Url>) -> Self {
        self.referrer = referrer;
        self
    }

    /// Sets the referrer policy.
    pub fn with_referrer_policy(mut self, policy: ReferrerPolicy) -> Self {
        self.referrer_policy = policy;
        self
    }

    /// Sets the browsing context id.
    pub fn with_context_id(mut self, id: impl Into<String>) -> Self {
        self.context_id = Some(id.into());
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Appends a header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Returns a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Clones the request onto `url`, keeping method, headers, body and
    /// fetch options.
    pub fn forward_to(&self, url: Url) -> OutboundRequest {
        OutboundRequest {
            method: self.method.clone(),
            url,
            headers: self.headers.clone(),
            body: (!self.body.is_empty()).then(|| self.body.clone()),
            mode: self.mode,
            credentials: self.credentials,
            cache: self.cache,
            redirect: self.redirect,
            integrity: self.integrity.clone(),
        }
    }

    /// Clones the request unchanged.
    pub fn forward(&self) -> OutboundRequest {
        self.forward_to(self.url.clone())
    }

    /// Captures the replayable options of the request.
    pub fn options(&self) -> RequestOptions {
        RequestOptions {
            method: self.method.as_str().to_string(),
            headers: self
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
            body: (!self.body.is_empty()).then(|| STANDARD.encode(&self.body)),
            mode: self.mode.outbound(),
            credentials: self.credentials,
            cache: self.cache,
            redirect: self.redirect,
            integrity: self.integrity.clone(),
            referrer_policy: self.referrer_policy,
        }
    }
}

/// Serializable options of a parked request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Base64 body, absent when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub mode: RequestMode,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub cache: CacheMode,
    #[serde(default)]
    pub redirect: RedirectMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default)]
    pub referrer_policy: ReferrerPolicy,
}

impl RequestOptions {
    /// Rebuilds an outbound request to `url` from the options.
    pub fn into_outbound(self, url: Url) -> Result<OutboundRequest> {
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|_| ProxyError::InvalidRequest(format!("bad method '{}'", self.method)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(header = %name, "Dropping unreplayable header"),
            }
        }

        let body = match self.body {
            Some(encoded) => Some(Bytes::from(STANDARD.decode(encoded).map_err(|e| {
                ProxyError::InvalidRequest(format!("bad body encoding: {e}"))
            })?)),
            None => None,
        };

        Ok(OutboundRequest {
            method,
            url,
            headers,
            body,
            mode: self.mode,
            credentials: self.credentials,
            cache: self.cache,
            redirect: self.redirect,
            integrity: self.integrity,
        })
    }
}

/// A request about to be sent upstream.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub credentials: Credentials,
    pub cache: CacheMode,
    pub redirect: RedirectMode,
    pub integrity: Option<String>,
}

impl OutboundRequest {
    /// Creates a bodiless request with default options.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::Cors,
            credentials: Credentials::default(),
            cache: CacheMode::default(),
            redirect: RedirectMode::default(),
            integrity: None,
        }
    }

    /// Sets the redirect mode.
    pub fn with_redirect(mut self, redirect: RedirectMode) -> Self {
        self.redirect = redirect;
        self
    }

    /// Writes `envelope` in `mode` onto the `X-Portal5` header.
    pub fn set_envelope(
        &mut self,
        envelope: &SessionEnvelope,
        mode: TransmissionMode,
    ) -> Result<()> {
        let encoded = envelope.encode(mode)?;
        let value =
            HeaderValue::from_str(&encoded).map_err(|e| ProxyError::InvalidHeader(e.to_string()))?;
        self.headers.insert(SESSION_HEADER, value);
        Ok(())
    }

    /// Returns the decoded `X-Portal5` envelope, if present.
    pub fn envelope(&self) -> Option<SessionEnvelope> {
        self.headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|raw| SessionEnvelope::decode(raw).ok())
    }
}

/// A response on its way back to the browser.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    /// Creates an empty response.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a plain-text response.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response.body = Bytes::from(body.into());
        response
    }

    /// Creates a `307 Temporary Redirect` to `location`.
    pub fn redirect(location: &Url) -> Self {
        let mut response = Self::new(StatusCode::TEMPORARY_REDIRECT);
        if let Ok(value) = HeaderValue::from_str(location.as_str()) {
            response.headers.insert(LOCATION, value);
        }
        response
    }

    /// Returns a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Converts into a hyper response.
    pub fn into_http(self) -> hyper::Response<Full<Bytes>> {
        let mut response = hyper::Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_options_replay() {
        let request = InterceptedRequest::new(Method::POST, url("https://proxy.example/form"))
            .with_mode(RequestMode::Navigate)
            .with_header("content-type", "application/x-www-form-urlencoded")
            .with_body("a=1&b=2");

        let options = request.options();
        assert_eq!(options.mode, RequestMode::Cors);
        assert_eq!(options.body.as_deref(), Some("YT0xJmI9Mg=="));

        let json = serde_json::to_value(&options).unwrap();
        assert!(json.get("referrerPolicy").is_some());
        let decoded: RequestOptions = serde_json::from_value(json).unwrap();

        let outbound = decoded
            .into_outbound(url("https://proxy.example/~deflect"))
            .unwrap();
        assert_eq!(outbound.method, Method::POST);
        assert_eq!(outbound.body.as_deref(), Some(&b"a=1&b=2"[..]));
        assert_eq!(
            outbound.headers.get("content-type").unwrap(),
            "application/x-www-form-urlencoded"
        );
    }

    #[test]
    fn test_bad_options_rejected() {
        let mut options = InterceptedRequest::new(Method::GET, url("https://proxy.example/"))
            .options();
        options.body = Some("not base64!".to_string());
        assert!(options
            .clone()
            .into_outbound(url("https://proxy.example/"))
            .is_err());

        options.body = None;
        options.method = "BAD METHOD".to_string();
        assert!(options.into_outbound(url("https://proxy.example/")).is_err());
    }

    #[test]
    fn test_forward_keeps_empty_body_absent() {
        let request = InterceptedRequest::new(Method::GET, url("https://proxy.example/a"))
            .with_header("accept", "text/html");
        let outbound = request.forward();
        assert!(outbound.body.is_none());
        assert_eq!(outbound.url, request.url);
        assert_eq!(outbound.headers.get("accept").unwrap(), "text/html");
    }

    #[test]
    fn test_envelope_header() {
        let mut outbound = OutboundRequest::new(Method::GET, url("https://proxy.example/"));
        assert!(outbound.envelope().is_none());

        let envelope = SessionEnvelope {
            id: Some("w1".to_string()),
            version: "0.5.0".to_string(),
            ..SessionEnvelope::default()
        };
        outbound
            .set_envelope(&envelope, TransmissionMode::Identity)
            .unwrap();
        assert_eq!(outbound.envelope().unwrap().id.as_deref(), Some("w1"));
    }

    #[test]
    fn test_redirect_response() {
        let response = ProxyResponse::redirect(&url("https://proxy.example/https://t.example/"));
        assert_eq!(response.status, StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.header("location"),
            Some("https://proxy.example/https://t.example/")
        );

        let http = ProxyResponse::text(StatusCode::FORBIDDEN, "no").into_http();
        assert_eq!(http.status(), StatusCode::FORBIDDEN);
    }
}
