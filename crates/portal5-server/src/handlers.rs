//! Route handlers.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::REFERER;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use portal5_core::{BrowsingContext, Destination, ReferrerPolicy, RequestMode, ServerOrigin};
use portal5_proxy::InterceptedRequest;
use tracing::{debug, info};
use url::Url;

use crate::error::{ApiError, Result};
use crate::models::{ForgetResponse, HeartbeatRequest, HeartbeatResponse};
use crate::state::AppState;
use crate::{CLIENT_HEADER, REFERRER_POLICY_HEADER};

/// POST /~context - Records a browsing context heartbeat.
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>> {
    let url = Url::parse(&req.url)
        .map_err(|e| ApiError::BadRequest(format!("invalid context url: {e}")))?;

    state.registry.heartbeat(BrowsingContext {
        id: req.id,
        url,
        focused: req.focused,
        visible: req.visible,
    });

    Ok(Json(HeartbeatResponse {
        live: state.registry.len(),
    }))
}

/// DELETE /~context/{id} - Forgets a closed browsing context.
pub async fn forget_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ForgetResponse> {
    let removed = state.registry.remove(&id);
    if removed {
        info!(id = %id, "Context closed");
    }
    Json(ForgetResponse { removed })
}

/// Fallback - Runs every other request through the interception pipeline.
pub async fn intercept(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    mut headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let url = request_url(state.origin(), &uri)?;

    let context_id = headers
        .remove(CLIENT_HEADER)
        .and_then(|v| v.to_str().ok().map(str::to_string));
    let mode = header_str(&headers, "sec-fetch-mode")
        .and_then(RequestMode::parse)
        .unwrap_or_default();
    let destination = header_str(&headers, "sec-fetch-dest")
        .map(Destination::parse)
        .unwrap_or_default();
    let referrer = header_str(&headers, REFERER.as_str()).and_then(|r| Url::parse(r).ok());
    let referrer_policy = headers
        .remove(REFERRER_POLICY_HEADER)
        .and_then(|v| v.to_str().ok().map(ReferrerPolicy::parse))
        .unwrap_or_default();

    debug!(
        method = %method,
        url = %url,
        mode = %mode,
        destination = destination.as_str(),
        context = ?context_id,
        policy = referrer_policy.as_str(),
        "Intercepted request"
    );

    let mut request = InterceptedRequest::new(method, url)
        .with_mode(mode)
        .with_destination(destination)
        .with_referrer(referrer)
        .with_referrer_policy(referrer_policy)
        .with_body(body);
    request.headers = headers;
    request.context_id = context_id;

    let response = state.pipeline.handle(request).await?;
    Ok(response.into_http().into_response())
}

/// Rebuilds the absolute URL the browser requested.
fn request_url(origin: &ServerOrigin, uri: &Uri) -> Result<Url> {
    if uri.scheme().is_some() {
        return Url::parse(&uri.to_string())
            .map_err(|e| ApiError::BadRequest(format!("invalid request target: {e}")));
    }

    let mut url = origin.url().clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    Ok(url)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
