//! Content and DOM rewriting.
//!
//! - [`html`]: server-side injection of the observer script into HTML
//!   responses.
//! - [`dom`]: the engine that keeps a live document's URL attributes on the
//!   proxy origin.

pub mod dom;
pub mod html;

pub use dom::{DomRewriter, Document, Mutation, NodeId, RewriteMark, RewriteStats};
pub use html::{observer_script_src, ContentRewriter, OBSERVER_PATH};
