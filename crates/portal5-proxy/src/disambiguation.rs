//! Disambiguation of requests with more than one plausible destination.
//!
//! When several browsing contexts could have issued a request, each yields
//! a [`Candidate`]. The coordinator narrows them down:
//!
//! ```text
//! candidates ─► dedupe by destination ─► one left? ─► done
//!                                          │ no
//!                                          ▼
//!                        probe HEAD /direct/<dest> (optional)
//!                                          │
//!                                          ▼
//!                  still ambiguous ─► park request, hand off to
//!                                     /~multiple-choices
//! ```
//!
//! Parked requests live in the `request` namespace of the transient store
//! and are consumed by the `/~disambiguate` resume endpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use hyper::Method;
use portal5_core::request::RedirectMode;
use portal5_core::{ServerOrigin, Synthesized};
use portal5_storage::TransientStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::Result;
use crate::request::{OutboundRequest, RequestOptions};
use crate::upstream::Upstream;

/// Namespace of parked requests.
pub const REQUEST_NAMESPACE: &str = "request";

/// How long a parked request waits for the user's choice.
pub const PARKED_REQUEST_TTL: Duration = Duration::from_secs(600);

/// Default time limit for a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One plausible reading of an ambiguous request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(rename = "ref")]
    pub referrer: Option<Url>,
    #[serde(rename = "dest")]
    pub destination: Url,
}

impl From<Synthesized> for Candidate {
    fn from(synthesized: Synthesized) -> Self {
        Self {
            referrer: synthesized.referrer,
            destination: synthesized.destination,
        }
    }
}

/// Payload of the `/~multiple-choices` hand-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandOff {
    pub request: RequestOptions,
    pub candidates: Vec<Candidate>,
    pub id: String,
}

/// Which probe statuses count as "this destination exists".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbePolicy {
    /// Inclusive status ranges.
    pub accept: Vec<(u16, u16)>,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        // 405: the destination exists but refuses HEAD.
        Self {
            accept: vec![(200, 299), (405, 405)],
        }
    }
}

impl ProbePolicy {
    /// Returns true if `status` passes the probe.
    pub fn accepts(&self, status: u16) -> bool {
        self.accept
            .iter()
            .any(|&(low, high)| (low..=high).contains(&status))
    }
}

/// Picks the referrer to keep when two candidates share a destination.
fn merge_referrer(existing: Option<Url>, incoming: Option<Url>, destination: &Url) -> Option<Url> {
    match (existing, incoming) {
        (None, kept) | (kept, None) => kept,
        (Some(existing), Some(incoming)) => {
            if existing.origin() == incoming.origin() || incoming.origin() == destination.origin()
            {
                Some(incoming)
            } else {
                Some(existing)
            }
        }
    }
}

/// Collapses candidates with the same destination, keeping first-seen order.
pub fn dedupe(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut merged: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match merged
            .iter_mut()
            .find(|c| c.destination == candidate.destination)
        {
            Some(existing) => {
                let referrer = existing.referrer.take();
                existing.referrer =
                    merge_referrer(referrer, candidate.referrer, &existing.destination);
            }
            None => merged.push(candidate),
        }
    }
    merged
}

/// Narrows candidates and parks requests awaiting a choice.
pub struct DisambiguationCoordinator {
    upstream: Arc<dyn Upstream>,
    server: ServerOrigin,
    store: Arc<TransientStore>,
    policy: ProbePolicy,
    probe_timeout: Duration,
}

impl std::fmt::Debug for DisambiguationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisambiguationCoordinator")
            .field("server", &self.server.as_str())
            .field("policy", &self.policy)
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

impl DisambiguationCoordinator {
    /// Creates a coordinator with the default probe policy and timeout.
    pub fn new(
        upstream: Arc<dyn Upstream>,
        server: ServerOrigin,
        store: Arc<TransientStore>,
    ) -> Self {
        Self {
            upstream,
            server,
            store,
            policy: ProbePolicy::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Sets the probe policy.
    pub fn with_policy(mut self, policy: ProbePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the per-probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Narrows `candidates`. Probing only happens when `probe` is set and
    /// more than one distinct destination remains.
    pub async fn resolve(&self, candidates: Vec<Candidate>, probe: bool) -> Vec<Candidate> {
        if candidates.len() <= 1 {
            return candidates;
        }

        let deduped = dedupe(candidates);
        if deduped.len() == 1 || !probe {
            return deduped;
        }

        let probed = self.probe(&deduped).await;
        if probed.is_empty() {
            debug!(
                candidates = deduped.len(),
                "No candidate passed the probe, keeping all"
            );
            deduped
        } else {
            probed
        }
    }

    /// Probes every candidate concurrently and keeps those that pass.
    pub async fn probe(&self, candidates: &[Candidate]) -> Vec<Candidate> {
        let results = join_all(candidates.iter().map(|c| self.probe_one(c))).await;
        candidates
            .iter()
            .zip(results)
            .filter(|(_, passed)| *passed)
            .map(|(candidate, _)| candidate.clone())
            .collect()
    }

    async fn probe_one(&self, candidate: &Candidate) -> bool {
        let Ok(url) = self
            .server
            .url()
            .join(&format!("/direct/{}", candidate.destination))
        else {
            return false;
        };

        let request = OutboundRequest::new(Method::HEAD, url).with_redirect(RedirectMode::Manual);
        match tokio::time::timeout(self.probe_timeout, self.upstream.fetch(request)).await {
            Ok(Ok(response)) => {
                let passed = self.policy.accepts(response.status.as_u16());
                debug!(
                    destination = %candidate.destination,
                    status = response.status.as_u16(),
                    passed,
                    "Probed candidate"
                );
                passed
            }
            Ok(Err(e)) => {
                debug!(destination = %candidate.destination, error = %e, "Probe failed");
                false
            }
            Err(_) => {
                debug!(destination = %candidate.destination, "Probe timed out");
                false
            }
        }
    }

    /// Parks `options` until the user picks a destination. Returns the id.
    pub fn park(&self, options: &RequestOptions) -> Result<String> {
        let id = format!("{}.{}", Utc::now().timestamp_millis(), rand::random::<u32>());
        self.store
            .add_as(REQUEST_NAMESPACE, &id, options, Some(PARKED_REQUEST_TTL))?;
        Ok(id)
    }

    /// Takes a parked request. A request can be taken at most once.
    pub fn take_parked(&self, id: &str) -> Option<RequestOptions> {
        let value = self.store.remove(REQUEST_NAMESPACE, id)?;
        match serde_json::from_value(value) {
            Ok(options) => Some(options),
            Err(e) => {
                warn!(id, error = %e, "Discarding undecodable parked request");
                None
            }
        }
    }
}
