//! Referrer policy emulation.
//!
//! The browser only ever sends proxy-form referrers, so the proxy decides
//! itself what the real destination would have received under the page's
//! referrer policy.

use serde::{Deserialize, Serialize};
use url::Url;

/// The referrer policies a request can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReferrerPolicy {
    NoReferrer,
    NoReferrerWhenDowngrade,
    Origin,
    OriginWhenCrossOrigin,
    SameOrigin,
    StrictOrigin,
    StrictOriginWhenCrossOrigin,
    /// Also used for empty and unrecognized policy strings.
    #[default]
    UnsafeUrl,
}

impl ReferrerPolicy {
    /// Parses a policy token. Unknown values behave like `unsafe-url`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "no-referrer" => Self::NoReferrer,
            "no-referrer-when-downgrade" => Self::NoReferrerWhenDowngrade,
            "origin" => Self::Origin,
            "origin-when-cross-origin" => Self::OriginWhenCrossOrigin,
            "same-origin" => Self::SameOrigin,
            "strict-origin" => Self::StrictOrigin,
            "strict-origin-when-cross-origin" => Self::StrictOriginWhenCrossOrigin,
            _ => Self::UnsafeUrl,
        }
    }

    /// Returns the policy token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoReferrer => "no-referrer",
            Self::NoReferrerWhenDowngrade => "no-referrer-when-downgrade",
            Self::Origin => "origin",
            Self::OriginWhenCrossOrigin => "origin-when-cross-origin",
            Self::SameOrigin => "same-origin",
            Self::StrictOrigin => "strict-origin",
            Self::StrictOriginWhenCrossOrigin => "strict-origin-when-cross-origin",
            Self::UnsafeUrl => "unsafe-url",
        }
    }

    /// Returns all policies.
    pub fn all() -> &'static [ReferrerPolicy] {
        &[
            Self::NoReferrer,
            Self::NoReferrerWhenDowngrade,
            Self::Origin,
            Self::OriginWhenCrossOrigin,
            Self::SameOrigin,
            Self::StrictOrigin,
            Self::StrictOriginWhenCrossOrigin,
            Self::UnsafeUrl,
        ]
    }
}

impl From<String> for ReferrerPolicy {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ReferrerPolicy> for String {
    fn from(policy: ReferrerPolicy) -> Self {
        policy.as_str().to_string()
    }
}

/// Serialized origin of a URL, e.g. `https://a.example:8443`.
fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Decides the referrer value forwarded to `destination`.
///
/// Returns `None` when the policy withholds the referrer.
pub fn decide(policy: ReferrerPolicy, destination: &Url, referrer: &Url) -> Option<String> {
    let same_origin = origin_of(destination) == origin_of(referrer);
    let same_protocol = destination.scheme() == referrer.scheme();

    let full = || Some(referrer.as_str().to_string());
    let origin = || Some(origin_of(referrer));

    match policy {
        ReferrerPolicy::NoReferrer => None,
        ReferrerPolicy::NoReferrerWhenDowngrade if same_protocol => full(),
        ReferrerPolicy::NoReferrerWhenDowngrade => None,
        ReferrerPolicy::Origin => origin(),
        ReferrerPolicy::OriginWhenCrossOrigin if same_origin => full(),
        ReferrerPolicy::OriginWhenCrossOrigin => origin(),
        ReferrerPolicy::SameOrigin if same_origin => full(),
        ReferrerPolicy::SameOrigin => None,
        ReferrerPolicy::StrictOrigin if same_protocol => origin(),
        ReferrerPolicy::StrictOrigin => None,
        ReferrerPolicy::StrictOriginWhenCrossOrigin if same_origin => full(),
        ReferrerPolicy::StrictOriginWhenCrossOrigin if same_protocol => origin(),
        ReferrerPolicy::StrictOriginWhenCrossOrigin => None,
        ReferrerPolicy::UnsafeUrl => full(),
    }
}
