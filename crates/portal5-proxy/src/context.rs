//! Everything a pipeline run needs, injected explicitly.

use std::sync::Arc;
use std::time::Duration;

use portal5_core::rewrite::ContentRewriter;
use portal5_core::routes::{PassthroughTable, RouteTable};
use portal5_core::{ContextOracle, DirectiveState, WorkerSettings};
use portal5_storage::{ClientContextTracker, TransientStore};

use crate::disambiguation::{DisambiguationCoordinator, ProbePolicy};
use crate::upstream::Upstream;

/// Shared state of the interception pipeline.
pub struct ProxyContext {
    /// Worker identity, preferences and server origin.
    pub settings: WorkerSettings,
    pub routes: RouteTable,
    pub passthrough: PassthroughTable,
    /// Directives waiting for an eligible request.
    pub directives: DirectiveState,
    pub clients: Arc<ClientContextTracker>,
    pub oracle: Arc<dyn ContextOracle>,
    pub upstream: Arc<dyn Upstream>,
    pub disambiguation: DisambiguationCoordinator,
    pub rewriter: ContentRewriter,
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("origin", &self.settings.origin.as_str())
            .field("routes", &self.routes.len())
            .field("passthrough", &self.passthrough)
            .field("clients", &self.clients)
            .field("disambiguation", &self.disambiguation)
            .finish()
    }
}

impl ProxyContext {
    /// Creates a context with the default route table.
    ///
    /// Client records and parked requests share `store`.
    pub fn new(
        settings: WorkerSettings,
        store: Arc<TransientStore>,
        oracle: Arc<dyn ContextOracle>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        let disambiguation = DisambiguationCoordinator::new(
            upstream.clone(),
            settings.origin.clone(),
            store.clone(),
        );

        Self {
            settings,
            routes: RouteTable::with_defaults(),
            passthrough: PassthroughTable::default(),
            directives: DirectiveState::new(),
            clients: Arc::new(ClientContextTracker::new(store)),
            oracle,
            upstream,
            disambiguation,
            rewriter: ContentRewriter::new(),
        }
    }

    /// Replaces the route table.
    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    /// Sets the passthrough table.
    pub fn with_passthrough(mut self, passthrough: PassthroughTable) -> Self {
        self.passthrough = passthrough;
        self
    }

    /// Uses an existing client tracker.
    pub fn with_clients(mut self, clients: Arc<ClientContextTracker>) -> Self {
        self.clients = clients;
        self
    }

    /// Sets the probe policy and timeout.
    pub fn with_probing(mut self, policy: ProbePolicy, timeout: Duration) -> Self {
        self.disambiguation = self
            .disambiguation
            .with_policy(policy)
            .with_probe_timeout(timeout);
        self
    }
}
