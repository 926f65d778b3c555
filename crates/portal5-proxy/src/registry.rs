//! Heartbeat-fed browsing context registry.
//!
//! Pages report their context through `POST /~context`. A context is alive
//! while its last heartbeat is younger than the timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use portal5_core::{BrowsingContext, ContextOracle};
use tracing::debug;

/// Default age after which a silent context is considered closed.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

struct Heartbeat {
    context: BrowsingContext,
    seen: Instant,
}

/// [`ContextOracle`] backed by heartbeats.
pub struct ContextRegistry {
    contexts: RwLock<HashMap<String, Heartbeat>>,
    timeout: Duration,
}

impl std::fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("contexts", &self.contexts.read().len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextRegistry {
    /// Creates a registry with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HEARTBEAT_TIMEOUT)
    }

    /// Creates a registry with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Records a heartbeat. A focused context takes focus from all others.
    pub fn heartbeat(&self, context: BrowsingContext) {
        let mut contexts = self.contexts.write();
        if context.focused {
            for other in contexts.values_mut() {
                other.context.focused = false;
            }
        }
        debug!(id = %context.id, url = %context.url, "Context heartbeat");
        contexts.insert(
            context.id.clone(),
            Heartbeat {
                context,
                seen: Instant::now(),
            },
        );
    }

    /// Forgets a context.
    pub fn remove(&self, id: &str) -> bool {
        self.contexts.write().remove(id).is_some()
    }

    /// Drops contexts whose heartbeat timed out. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut contexts = self.contexts.write();
        let before = contexts.len();
        contexts.retain(|_, hb| hb.seen.elapsed() < self.timeout);
        before - contexts.len()
    }

    /// Returns the number of live contexts.
    pub fn len(&self) -> usize {
        self.contexts
            .read()
            .values()
            .filter(|hb| self.is_fresh(hb))
            .count()
    }

    /// Returns true if no context is alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_fresh(&self, heartbeat: &Heartbeat) -> bool {
        heartbeat.seen.elapsed() < self.timeout
    }

    /// Creates a background task that prunes silent contexts every
    /// `interval`.
    ///
    /// Returns a future that should be spawned as a background task.
    pub fn start_pruning(
        self: Arc<Self>,
        interval: Duration,
    ) -> impl std::future::Future<Output = ()> + Send {
        async move {
            loop {
                tokio::time::sleep(interval).await;
                let pruned = self.prune();
                if pruned > 0 {
                    debug!(pruned, "Pruned silent contexts");
                }
            }
        }
    }
}

#[async_trait]
impl ContextOracle for ContextRegistry {
    async fn get(&self, id: &str) -> Option<BrowsingContext> {
        self.contexts
            .read()
            .get(id)
            .filter(|hb| self.is_fresh(hb))
            .map(|hb| hb.context.clone())
    }

    async fn match_all(&self) -> Vec<BrowsingContext> {
        let mut contexts: Vec<BrowsingContext> = self
            .contexts
            .read()
            .values()
            .filter(|hb| self.is_fresh(hb))
            .map(|hb| hb.context.clone())
            .collect();
        contexts.sort_by(|a, b| a.id.cmp(&b.id));
        contexts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn context(id: &str, focused: bool) -> BrowsingContext {
        BrowsingContext {
            id: id.to_string(),
            url: Url::parse("https://proxy.example/https://t.example/").unwrap(),
            focused,
            visible: true,
        }
    }

    #[tokio::test]
    async fn test_heartbeat_and_lookup() {
        let registry = ContextRegistry::new();
        registry.heartbeat(context("a", false));
        registry.heartbeat(context("b", false));

        assert!(registry.is_alive("a").await);
        assert!(!registry.is_alive("c").await);
        assert_eq!(registry.match_all().await.len(), 2);
        assert!(registry.remove("a"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_focus_is_exclusive() {
        let registry = ContextRegistry::new();
        registry.heartbeat(context("a", true));
        registry.heartbeat(context("b", true));

        let focused: Vec<String> = registry
            .match_all()
            .await
            .into_iter()
            .filter(|c| c.focused)
            .map(|c| c.id)
            .collect();
        assert_eq!(focused, vec!["b"]);
    }

    #[tokio::test]
    async fn test_expired_contexts_are_dead() {
        let registry = ContextRegistry::with_timeout(Duration::ZERO);
        registry.heartbeat(context("a", false));

        assert!(registry.get("a").await.is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.prune(), 1);
    }
}
