//! Portal5 Proxy - the request interception pipeline.
//!
//! This crate turns one intercepted browser request into exactly one
//! response: a forwarded fetch, a redirect, a disambiguation hand-off or a
//! rejection. All collaborators are injected through [`ProxyContext`].
//!
//! ## Features
//!
//! - Recovers the real destination of requests issued by proxied pages
//! - Tracks represented URLs per browsing context
//! - Probes and hands off ambiguous navigations
//! - Emulates referrer policies in the `X-Portal5` envelope
//! - Applies `X-Portal5-Signal` directives from upstream responses
//!
//! ## Architecture
//!
//! ```text
//! Browser ─► InterceptedRequest ─► InterceptionPipeline ─► Upstream
//!                                        │    ▲               │
//!                      ContextOracle ◄───┘    └── ProxyResponse
//!                      ClientContextTracker
//!                      DisambiguationCoordinator
//! ```

mod context;
pub mod disambiguation;
mod error;
pub mod pipeline;
pub mod registry;
pub mod request;
pub mod upstream;

pub use context::ProxyContext;
pub use disambiguation::{Candidate, DisambiguationCoordinator, HandOff, ProbePolicy};
pub use error::{ProxyError, Result};
pub use pipeline::InterceptionPipeline;
pub use registry::{ContextRegistry, DEFAULT_HEARTBEAT_TIMEOUT};
pub use request::{InterceptedRequest, OutboundRequest, ProxyResponse, RequestOptions};
pub use upstream::{HttpUpstream, Upstream};

/// Default port of the proxy front end.
pub const DEFAULT_PROXY_PORT: u16 = 8766;
