//! Browsing contexts.
//!
//! A browsing context is the tab or frame that issued a request. The proxy
//! cannot enumerate contexts itself; it asks a [`ContextOracle`] supplied by
//! the host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

/// A browsing context as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowsingContext {
    /// Opaque context id.
    pub id: String,
    /// Current (proxy-form) location of the context.
    pub url: Url,
    /// Whether the context has focus.
    #[serde(default)]
    pub focused: bool,
    /// Whether the context is visible.
    #[serde(default)]
    pub visible: bool,
}

/// Source of truth for which browsing contexts exist.
#[async_trait]
pub trait ContextOracle: Send + Sync {
    /// Returns the context with `id`, if it still exists.
    async fn get(&self, id: &str) -> Option<BrowsingContext>;

    /// Returns every window context.
    async fn match_all(&self) -> Vec<BrowsingContext>;

    /// Returns true if the context with `id` still exists.
    async fn is_alive(&self, id: &str) -> bool {
        self.get(id).await.is_some()
    }
}

/// Picks the contexts that may have issued a request without a context id:
/// windows showing the referrer, or the focused window.
pub fn candidate_contexts(
    contexts: Vec<BrowsingContext>,
    referrer: Option<&Url>,
) -> Vec<BrowsingContext> {
    contexts
        .into_iter()
        .filter(|c| referrer.is_some_and(|r| &c.url == r) || c.focused)
        .collect()
}
