//! Client context records.
//!
//! Remembers the last represented URL of each browsing context so requests
//! that lose their context (e.g. a location without an embedded URL) can
//! still be synthesized. Records live in the `client` namespace of the
//! [`TransientStore`].
//!
//! Two eviction paths keep the namespace small:
//!
//! - a periodic sweep drops records whose context no longer exists according
//!   to the [`ContextOracle`];
//! - a cap drops the least recently written records beyond
//!   [`DEFAULT_RECORD_CAP`], alive or not. Every successful synthesis
//!   rewrites its record, so reads through [`ClientContextTracker::get`]
//!   leave the eviction order untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use portal5_core::ContextOracle;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::transient::TransientStore;

/// Namespace of client context records.
pub const CLIENT_NAMESPACE: &str = "client";

/// Default maximum number of records.
pub const DEFAULT_RECORD_CAP: usize = 100;

/// Default interval between liveness sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Last known state of one browsing context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientContextRecord {
    /// The represented URL.
    pub represented: Url,
    /// When the record was last written. Reads do not refresh it.
    pub atime: DateTime<Utc>,
    /// Insertion sequence, breaks ties on `atime`.
    #[serde(default)]
    pub seq: u64,
}

/// Tracks represented URLs per browsing context.
pub struct ClientContextTracker {
    store: Arc<TransientStore>,
    cap: usize,
    sweep_interval: Duration,
    seq: AtomicU64,
}

impl std::fmt::Debug for ClientContextTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContextTracker")
            .field("cap", &self.cap)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

impl ClientContextTracker {
    /// Creates a tracker with the default cap and sweep interval.
    pub fn new(store: Arc<TransientStore>) -> Self {
        let seq = store
            .keys(CLIENT_NAMESPACE)
            .iter()
            .filter_map(|key| store.get_as::<ClientContextRecord>(CLIENT_NAMESPACE, key))
            .map(|record| record.seq + 1)
            .max()
            .unwrap_or(0);

        Self {
            store,
            cap: DEFAULT_RECORD_CAP,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            seq: AtomicU64::new(seq),
        }
    }

    /// Sets the record cap.
    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }

    /// Sets the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Returns the record cap.
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Records the represented URL of `context_id`, then enforces the cap.
    pub fn record(&self, context_id: &str, represented: &Url) {
        let record = ClientContextRecord {
            represented: represented.clone(),
            atime: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };

        if let Err(e) = self
            .store
            .add_as(CLIENT_NAMESPACE, context_id, &record, None)
        {
            warn!(context_id, error = %e, "Failed to encode client record");
            return;
        }

        self.enforce_cap();
    }

    /// Returns the record of `context_id`.
    pub fn get(&self, context_id: &str) -> Option<ClientContextRecord> {
        self.store.get_as(CLIENT_NAMESPACE, context_id)
    }

    /// Returns the recorded represented URL of `context_id`.
    pub fn represented(&self, context_id: &str) -> Option<Url> {
        self.get(context_id).map(|record| record.represented)
    }

    /// Drops the record of `context_id`.
    pub fn forget(&self, context_id: &str) -> bool {
        self.store.remove(CLIENT_NAMESPACE, context_id).is_some()
    }

    /// Returns the ids of all recorded contexts.
    pub fn context_ids(&self) -> Vec<String> {
        self.store.keys(CLIENT_NAMESPACE)
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.context_ids().len()
    }

    /// Returns true if there are no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts the oldest records beyond the cap. Returns how many were
    /// evicted.
    pub fn enforce_cap(&self) -> usize {
        let snapshot = self.eviction_order();
        if snapshot.len() <= self.cap {
            return 0;
        }
        let excess = snapshot.len() - self.cap;
        self.evict_oldest(snapshot, excess)
    }

    /// Lists `(id, seq)` oldest first. Undecodable records have no sequence
    /// and sort first.
    fn eviction_order(&self) -> Vec<(String, Option<u64>)> {
        let mut records: Vec<(String, DateTime<Utc>, Option<u64>)> = self
            .context_ids()
            .into_iter()
            .map(|id| match self.get(&id) {
                Some(record) => (id, record.atime, Some(record.seq)),
                None => (id, DateTime::<Utc>::MIN_UTC, None),
            })
            .collect();
        records.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
        records.into_iter().map(|(id, _, seq)| (id, seq)).collect()
    }

    /// Evicts up to `excess` records from `snapshot`, skipping any record
    /// rewritten since the snapshot was taken.
    fn evict_oldest(&self, snapshot: Vec<(String, Option<u64>)>, excess: usize) -> usize {
        let mut evicted = 0;
        for (id, seq) in snapshot {
            if evicted == excess {
                break;
            }

            let mut removed = false;
            self.store.update(CLIENT_NAMESPACE, &id, |current| {
                let current = current?;
                let stored = serde_json::from_value::<ClientContextRecord>(current.clone())
                    .ok()
                    .map(|record| record.seq);
                if stored == seq {
                    removed = true;
                    None
                } else {
                    Some(current)
                }
            });

            if removed {
                evicted += 1;
            } else {
                debug!(context_id = %id, "Client record refreshed during eviction, kept");
            }
        }

        if evicted > 0 {
            debug!(evicted, cap = self.cap, "Evicted client records over cap");
        }
        evicted
    }

    /// Removes records whose context no longer exists. Returns how many were
    /// removed.
    pub async fn sweep(&self, oracle: &dyn ContextOracle) -> usize {
        let mut removed = 0;
        for id in self.context_ids() {
            if !oracle.is_alive(&id).await && self.forget(&id) {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Swept client records of closed contexts");
        }
        removed
    }

    /// Creates a background sweep task.
    ///
    /// Returns a future that should be spawned as a background task.
    pub fn start_sweeping(
        self: Arc<Self>,
        oracle: Arc<dyn ContextOracle>,
    ) -> impl std::future::Future<Output = ()> + Send {
        async move {
            loop {
                tokio::time::sleep(self.sweep_interval).await;
                self.sweep(oracle.as_ref()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use portal5_core::BrowsingContext;
    use std::collections::HashSet;

    struct AliveSet(HashSet<String>);

    #[async_trait]
    impl ContextOracle for AliveSet {
        async fn get(&self, id: &str) -> Option<BrowsingContext> {
            self.0.contains(id).then(|| BrowsingContext {
                id: id.to_string(),
                url: Url::parse("https://proxy.example/").unwrap(),
                focused: false,
                visible: true,
            })
        }

        async fn match_all(&self) -> Vec<BrowsingContext> {
            Vec::new()
        }
    }

    fn tracker(cap: usize) -> ClientContextTracker {
        ClientContextTracker::new(Arc::new(TransientStore::in_memory())).with_cap(cap)
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_record_and_get() {
        let tracker = tracker(10);
        tracker.record("ctx", &url("https://target.example/app"));
        assert_eq!(
            tracker.represented("ctx"),
            Some(url("https://target.example/app"))
        );

        tracker.record("ctx", &url("https://target.example/next"));
        assert_eq!(
            tracker.represented("ctx"),
            Some(url("https://target.example/next"))
        );
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_cap_evicts_exactly_the_oldest() {
        let tracker = tracker(3);
        for id in ["a", "b", "c"] {
            tracker.record(id, &url("https://target.example/"));
        }
        // Refresh "a" so "b" becomes the oldest.
        tracker.record("a", &url("https://target.example/again"));
        tracker.record("d", &url("https://target.example/"));

        assert_eq!(tracker.context_ids(), vec!["a", "c", "d"]);
        assert_eq!(tracker.enforce_cap(), 0);
    }

    #[test]
    fn test_record_refreshed_during_eviction_survives() {
        let mut tracker = tracker(10);
        for id in ["b", "c", "d"] {
            tracker.record(id, &url("https://target.example/"));
        }

        let snapshot = tracker.eviction_order();
        assert_eq!(snapshot[0], ("b".to_string(), Some(0)));

        // "b" is rewritten after the snapshot but before eviction.
        tracker.record("b", &url("https://target.example/fresh"));
        tracker.cap = 2;
        assert_eq!(tracker.evict_oldest(snapshot, 1), 1);

        assert_eq!(tracker.context_ids(), vec!["b", "d"]);
        assert_eq!(
            tracker.represented("b"),
            Some(url("https://target.example/fresh"))
        );
    }

    #[test]
    fn test_reads_do_not_refresh_eviction_order() {
        let tracker = tracker(2);
        tracker.record("a", &url("https://target.example/"));
        tracker.record("b", &url("https://target.example/"));

        let before = tracker.get("a").unwrap();
        assert!(tracker.represented("a").is_some());
        assert_eq!(tracker.get("a").unwrap(), before);

        tracker.record("c", &url("https://target.example/"));
        assert_eq!(tracker.context_ids(), vec!["b", "c"]);
    }

    #[test]
    fn test_sweep_removes_dead_contexts() {
        let tracker = tracker(10);
        tracker.record("alive", &url("https://target.example/"));
        tracker.record("dead", &url("https://target.example/"));

        let oracle = AliveSet(["alive".to_string()].into_iter().collect());
        let removed = tokio_test::block_on(tracker.sweep(&oracle));
        assert_eq!(removed, 1);
        assert_eq!(tracker.context_ids(), vec!["alive"]);
    }

    #[test]
    fn test_sequence_resumes_after_restart() {
        let store = Arc::new(TransientStore::in_memory());
        let first = ClientContextTracker::new(store.clone());
        first.record("a", &url("https://target.example/"));
        first.record("b", &url("https://target.example/"));

        let second = ClientContextTracker::new(store);
        second.record("c", &url("https://target.example/"));
        assert_eq!(second.get("c").unwrap().seq, 2);
    }

    #[test]
    fn test_undecodable_record_is_ignored() {
        let store = Arc::new(TransientStore::in_memory());
        store.add(CLIENT_NAMESPACE, "bad", serde_json::json!("garbage"), None);
        let tracker = ClientContextTracker::new(store).with_cap(1);
        assert!(tracker.get("bad").is_none());

        tracker.record("good", &url("https://target.example/"));
        assert_eq!(tracker.context_ids(), vec!["good"]);
    }
}
