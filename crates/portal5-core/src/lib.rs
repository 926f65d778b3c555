//! Portal5 Core - URL synthesis, referrer policy and session protocol.
//!
//! This crate holds the pure logic of the Portal5 rewriting proxy. It does no
//! I/O; storage, HTTP and scheduling live in the other workspace crates.
//!
//! ## Modules
//!
//! - [`synthesis`]: recovers represented, referrer and destination URLs
//! - [`referrer`]: referrer policy emulation
//! - [`protocol`]: `X-Portal5` envelopes and `X-Portal5-Signal` directives
//! - [`preferences`]: feature bitmask and the preference cookie
//! - [`routes`]: static route and passthrough tables
//! - [`context`]: browsing contexts and the oracle trait
//! - [`rewrite`]: HTML injection and the DOM rewriting engine

pub mod context;
pub mod marker;
pub mod preferences;
pub mod protocol;
pub mod referrer;
pub mod request;
pub mod rewrite;
pub mod routes;
pub mod settings;
pub mod synthesis;

pub use context::{BrowsingContext, ContextOracle};
pub use preferences::{Feature, Preferences};
pub use protocol::{Directive, DirectiveSet, DirectiveState, SessionEnvelope, TransmissionMode};
pub use referrer::ReferrerPolicy;
pub use request::{Destination, RequestMode};
pub use settings::WorkerSettings;
pub use synthesis::{ServerOrigin, Synthesized};
