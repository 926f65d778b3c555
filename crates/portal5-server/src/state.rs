//! Application state for the HTTP front end.

use std::sync::Arc;

use portal5_core::ServerOrigin;
use portal5_proxy::{ContextRegistry, InterceptionPipeline};

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The interception pipeline.
    pub pipeline: InterceptionPipeline,
    /// Heartbeat registry; usually also the pipeline's context oracle.
    pub registry: Arc<ContextRegistry>,
}

impl AppState {
    /// Creates the state from a pipeline and its registry.
    pub fn new(pipeline: InterceptionPipeline, registry: Arc<ContextRegistry>) -> Self {
        Self { pipeline, registry }
    }

    /// Returns the public server origin.
    pub fn origin(&self) -> &ServerOrigin {
        &self.pipeline.context().settings.origin
    }
}
