//! The interception pipeline.
//!
//! Every request the host intercepts runs through one pipeline pass:
//!
//! ```text
//! SecurityCheck ─► StaticRoute ─► PassthroughCheck ─► Synthesize
//!                      │                 │                 │
//!                   handler        forward as-is           ▼
//!                                                    Disambiguate ─► hand-off
//!                                                          │
//!                                    307 redirect ◄── final URL check
//!                                                          │
//!            Respond ◄─ ContentRewrite ◄─ ExtractDirectives ◄─ Fetch ◄─ BuildOutbound
//! ```
//!
//! Parse failures along the way degrade to documented fallbacks; only an
//! upstream failure surfaces as an error.

use std::collections::HashMap;
use std::sync::Arc;

use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, ORIGIN, REFERER};
use hyper::{Method, StatusCode};
use portal5_core::context::candidate_contexts;
use portal5_core::marker::ORIGIN_MARKER;
use portal5_core::preferences::Feature;
use portal5_core::protocol::{
    Directive, DirectiveSet, TransmissionMode, DIRECTIVE_HEADER, SESSION_HEADER,
};
use portal5_core::referrer;
use portal5_core::request::{Credentials, RedirectMode};
use portal5_core::rewrite::ContentRewriter;
use portal5_core::routes::RouteHandler;
use portal5_core::synthesis::{
    collapse_self_origin, final_url, is_web_scheme, resolve_represented, synthesize,
};
use portal5_core::{Destination, ReferrerPolicy, RequestMode, SessionEnvelope};
use tracing::{debug, info, warn};
use url::Url;

use crate::context::ProxyContext;
use crate::disambiguation::{Candidate, HandOff};
use crate::error::Result;
use crate::request::{InterceptedRequest, OutboundRequest, ProxyResponse};

/// Runs intercepted requests against a [`ProxyContext`].
#[derive(Debug, Clone)]
pub struct InterceptionPipeline {
    ctx: Arc<ProxyContext>,
}

impl InterceptionPipeline {
    /// Creates a pipeline over `ctx`.
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    /// Returns the shared context.
    pub fn context(&self) -> &ProxyContext {
        &self.ctx
    }

    /// Handles one intercepted request.
    pub async fn handle(&self, request: InterceptedRequest) -> Result<ProxyResponse> {
        if request.headers.contains_key(SESSION_HEADER) {
            warn!(url = %request.url, "Rejected inbound request carrying a session header");
            return Ok(ProxyResponse::text(
                StatusCode::FORBIDDEN,
                "Session headers are not accepted on inbound requests",
            ));
        }

        let route = self.ctx.routes.lookup(
            request.url.path(),
            request.mode,
            request.method.as_str(),
            request.referrer.is_some(),
        );
        if let Some(handler) = route {
            debug!(path = request.url.path(), handler = handler.as_str(), "Static route");
            return match handler {
                RouteHandler::Passthrough => self.passthrough(&request).await,
                RouteHandler::Forbidden => Ok(ProxyResponse::new(StatusCode::FORBIDDEN)),
                RouteHandler::Restricted => self.restricted(&request).await,
                RouteHandler::Disambiguate => self.resume(&request).await,
            };
        }

        if self.skips_rewriting(&request) {
            return self.passthrough(&request).await;
        }

        self.intercept(request).await
    }

    /// Requests forwarded without any URL synthesis.
    fn skips_rewriting(&self, request: &InterceptedRequest) -> bool {
        let url = &request.url;
        if !is_web_scheme(url.scheme()) {
            return true;
        }
        if !self.ctx.settings.prefs.is_enabled(Feature::BasicRewriteCrosssite)
            && !self.ctx.settings.origin.matches(url)
        {
            return true;
        }
        request.mode.is_navigation() && url.path().starts_with("/direct/")
    }

    async fn passthrough(&self, request: &InterceptedRequest) -> Result<ProxyResponse> {
        debug!(url = %request.url, "Passing request through");
        self.ctx.upstream.fetch(request.forward()).await
    }

    /// Navigations to restricted pages go out with the worker identity and
    /// nothing else from the browser.
    async fn restricted(&self, request: &InterceptedRequest) -> Result<ProxyResponse> {
        if request.mode != RequestMode::Navigate {
            return Ok(ProxyResponse::text(
                StatusCode::FORBIDDEN,
                format!("Unacceptable request mode {}", request.mode),
            ));
        }
        if request.destination != Destination::Document {
            return Ok(ProxyResponse::text(
                StatusCode::FORBIDDEN,
                format!(
                    "Unacceptable request destination {}",
                    request.destination.as_str()
                ),
            ));
        }

        let mut outbound = OutboundRequest::new(request.method.clone(), request.url.clone())
            .with_redirect(RedirectMode::Manual);
        outbound.mode = RequestMode::SameOrigin;
        outbound.credentials = Credentials::SameOrigin;
        // Same-origin credentials travel as cookies.
        if let Some(cookie) = request.headers.get(COOKIE) {
            outbound.headers.insert(COOKIE, cookie.clone());
        }
        if request.method == Method::POST {
            outbound.body = Some(request.body.clone());
        }

        let mut envelope = self.ctx.settings.envelope();
        self.ctx.directives.apply(&mut envelope, true);
        outbound.set_envelope(&envelope, TransmissionMode::Identity)?;

        let response = self.ctx.upstream.fetch(outbound).await?;
        Ok(self.complete(response, None))
    }

    /// Replays a parked request once the user picked a destination.
    async fn resume(&self, request: &InterceptedRequest) -> Result<ProxyResponse> {
        let form: HashMap<String, String> = if request.method == Method::GET {
            request.url.query_pairs().into_owned().collect()
        } else if request.method == Method::POST {
            url::form_urlencoded::parse(&request.body)
                .into_owned()
                .collect()
        } else {
            return Ok(ProxyResponse::new(StatusCode::BAD_REQUEST));
        };

        let dest = form.get("dest").map(String::as_str).unwrap_or_default();
        let mut resume_url = self.ctx.settings.origin.url().clone();
        resume_url.set_path("/~deflect");
        resume_url
            .query_pairs_mut()
            .append_pair("to", &format!("/{dest}"));

        let parked = form
            .get("request_opts")
            .and_then(|id| self.ctx.disambiguation.take_parked(id));
        let (mut outbound, policy) = match parked {
            Some(options) => {
                let policy = options.referrer_policy;
                (options.into_outbound(resume_url)?, policy)
            }
            None => {
                warn!(dest, "No parked request to resume, replaying as GET");
                (
                    OutboundRequest::new(Method::GET, resume_url),
                    Default::default(),
                )
            }
        };

        strip_referrer_headers(&mut outbound);

        let mut envelope = self.ctx.settings.envelope();
        envelope.mode = Some(outbound.mode);
        let referrer = form.get("referrer").and_then(|r| Url::parse(r).ok());
        if let (Some(referrer), Ok(destination)) = (referrer, Url::parse(dest)) {
            set_referrer(&mut envelope, policy, &destination, &referrer);
        }
        outbound.set_envelope(&envelope, TransmissionMode::Regular)?;

        info!(dest, "Resuming disambiguated request");
        let response = self.ctx.upstream.fetch(outbound).await?;
        Ok(self.complete(response, None))
    }

    async fn intercept(&self, request: InterceptedRequest) -> Result<ProxyResponse> {
        let candidates = self.synthesize(&request).await;
        let probe = self
            .ctx
            .settings
            .prefs
            .is_enabled(Feature::DisambiguationTestUrl);
        let resolved = self.ctx.disambiguation.resolve(candidates, probe).await;

        if resolved.len() > 1 {
            if request.mode.is_navigation() {
                return self.multiple_choices(&request, resolved).await;
            }
            debug!(
                candidates = resolved.len(),
                destination = %resolved[0].destination,
                "Ambiguous subresource, using first candidate"
            );
        }
        let Some(chosen) = resolved.into_iter().next() else {
            return self.passthrough(&request).await;
        };

        let destination = collapse_self_origin(&chosen.destination);
        if self.ctx.passthrough.matches(&destination) {
            debug!(destination = %destination, "Destination is on the passthrough list");
            return self.passthrough(&request).await;
        }

        let target = final_url(&destination, &self.ctx.settings.origin);
        if destination.origin() != request.url.origin()
            && target != request.url
            && request.destination.requires_redirect()
        {
            debug!(from = %request.url, to = %target, "Redirecting to canonical URL");
            return Ok(ProxyResponse::redirect(&target));
        }

        let outbound =
            self.build_outbound(&request, chosen.referrer.as_ref(), &destination, target)?;
        let response = self.ctx.upstream.fetch(outbound).await?;
        Ok(self.complete(response, Some(&destination)))
    }

    /// Builds one candidate per browsing context that could have issued the
    /// request, recording every represented URL recovered on the way.
    async fn synthesize(&self, request: &InterceptedRequest) -> Vec<Candidate> {
        let server = &self.ctx.settings.origin;
        let oracle = &self.ctx.oracle;

        let known = match request.context_id.as_deref() {
            Some(id) => oracle.get(id).await,
            None => None,
        };
        let contexts = match known {
            Some(context) => vec![context],
            None => candidate_contexts(oracle.match_all().await, request.referrer.as_ref()),
        };

        let mut candidates: Vec<Candidate> = Vec::with_capacity(contexts.len().max(1));
        for context in contexts {
            let recorded = self.ctx.clients.represented(&context.id);
            let Some(represented) = resolve_represented(&context.url, recorded.as_ref()) else {
                continue;
            };
            self.ctx.clients.record(&context.id, &represented);
            candidates.push(
                synthesize(
                    &request.url,
                    request.referrer.as_ref(),
                    Some(&represented),
                    server,
                )
                .into(),
            );
        }

        if candidates.is_empty() {
            candidates.push(synthesize(&request.url, request.referrer.as_ref(), None, server).into());
        }
        debug!(url = %request.url, candidates = candidates.len(), "Synthesized request");
        candidates
    }

    fn build_outbound(
        &self,
        request: &InterceptedRequest,
        referrer: Option<&Url>,
        destination: &Url,
        target: Url,
    ) -> Result<OutboundRequest> {
        let mut outbound = request.forward_to(target);
        strip_referrer_headers(&mut outbound);
        outbound.mode = request.mode.outbound();
        if request.mode.is_navigation() {
            outbound.redirect = RedirectMode::Manual;
        }

        let mut envelope = self.ctx.settings.envelope();
        envelope.mode = Some(request.mode);
        if let Some(referrer) = referrer {
            set_referrer(&mut envelope, request.referrer_policy, destination, referrer);
        }
        let eligible = request.method == Method::GET && request.mode.is_navigation();
        self.ctx.directives.apply(&mut envelope, eligible);

        outbound.set_envelope(&envelope, TransmissionMode::Regular)?;
        Ok(outbound)
    }

    /// Hands an ambiguous navigation to `/~multiple-choices`, parking the
    /// request so the user's choice can replay it.
    async fn multiple_choices(
        &self,
        request: &InterceptedRequest,
        candidates: Vec<Candidate>,
    ) -> Result<ProxyResponse> {
        let options = request.options();
        let id = self.ctx.disambiguation.park(&options)?;
        info!(
            id = %id,
            candidates = candidates.len(),
            "Handing ambiguous navigation to disambiguation"
        );

        let hand_off = serde_json::to_value(HandOff {
            request: options,
            candidates,
            id,
        })?;

        let mut api = self.ctx.settings.origin.url().clone();
        api.set_path("/~multiple-choices");
        let pinned = request
            .url
            .query_pairs()
            .find(|(key, _)| key == ORIGIN_MARKER)
            .map(|(_, value)| value.into_owned());
        if let Some(origin) = pinned {
            api.query_pairs_mut().append_pair(ORIGIN_MARKER, &origin);
        }

        let mut outbound = OutboundRequest::new(request.method.clone(), api)
            .with_redirect(RedirectMode::Manual);
        let mut envelope = self.ctx.settings.envelope();
        if request.method == Method::GET {
            envelope.signal("disambiguate", hand_off);
        } else {
            outbound.body = Some(Bytes::from(hand_off.to_string()));
            outbound
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        outbound.set_envelope(&envelope, TransmissionMode::Regular)?;

        let response = self.ctx.upstream.fetch(outbound).await?;
        Ok(self.complete(response, None))
    }

    /// Strips and applies the response directives. `rewrite_base` enables
    /// content rewriting against that base when the hijack feature is on.
    fn complete(&self, mut response: ProxyResponse, rewrite_base: Option<&Url>) -> ProxyResponse {
        let header = response.headers.remove(DIRECTIVE_HEADER);
        let mut directives = DirectiveSet::parse(header.as_ref().and_then(|v| v.to_str().ok()));

        if let Some(base) = rewrite_base {
            if self
                .ctx
                .settings
                .prefs
                .is_enabled(Feature::InjectionDomHijack)
                && directives.take(Directive::Hijack)
            {
                response = self.rewrite(response, base);
            }
        }

        self.ctx.directives.merge(directives);
        response
    }

    fn rewrite(&self, mut response: ProxyResponse, base: &Url) -> ProxyResponse {
        let content_type = response
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        if !ContentRewriter::is_html(content_type) {
            return response;
        }

        match self.ctx.rewriter.rewrite_body(&response.body, base) {
            Some(body) => {
                debug!(base = %base, "Injected observer into document");
                response.body = Bytes::from(body);
                response.headers.remove(CONTENT_LENGTH);
            }
            None => debug!(base = %base, "Document left unmodified"),
        }
        response
    }
}

/// The browser's referrer is proxy-form; only the envelope carries the
/// decided one.
fn strip_referrer_headers(outbound: &mut OutboundRequest) {
    outbound.headers.remove(REFERER);
    outbound.headers.remove(ORIGIN);
}

/// Fills the envelope's referrer and origin the way the page's policy would.
fn set_referrer(
    envelope: &mut SessionEnvelope,
    policy: ReferrerPolicy,
    destination: &Url,
    referrer: &Url,
) {
    envelope.set_referrer(
        referrer::decide(policy, destination, referrer),
        Some(referrer.origin().ascii_serialization()),
    );
}
