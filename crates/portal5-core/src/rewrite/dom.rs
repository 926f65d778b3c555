//! Client-side DOM rewriting engine.
//!
//! Keeps URL-bearing attributes of a live document pointing at the proxy. The
//! engine is driven by its host: the host reports mutations through
//! [`DomRewriter::observe`] and calls [`DomRewriter::tick`] from its event
//! loop. Nothing here spawns tasks or timers.
//!
//! ## Architecture
//!
//! ```text
//!  mutations ──> observe ──┬─ before load ──────────────> process now
//!                          ├─ idle ──> process now ──> Draining
//!                          └─ draining ──> bounded queue
//!                                              │ overflow: drop + full rescan
//!                                              ▼
//!  host event loop ──> tick ──> drain queue ──> rescan a/form/iframe ──> Idle
//! ```
//!
//! Each rewritten attribute records its original and current value in
//! `data-p5-<attr>-original` / `data-p5-<attr>-current` on the element, so a
//! value the engine wrote itself is never rewritten twice.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;

use url::Url;

use crate::synthesis::{is_web_scheme, trim_prefix, ServerOrigin};

/// Attributes that carry URLs.
pub const TARGET_ATTRIBUTES: [&str; 5] = ["href", "src", "action", "data", "formaction"];

/// Elements carrying this attribute are never rewritten.
pub const IGNORE_ATTRIBUTE: &str = "data-p5-ignore";

/// Tags rescanned by a forced update.
pub const RESCAN_TAGS: [&str; 3] = ["a", "form", "iframe"];

/// Interval at which hosts should call [`DomRewriter::request_rescan`].
pub const RESCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Default capacity of the mutation queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Handle to an element in a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
struct Element {
    tag: String,
    attributes: BTreeMap<String, String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Minimal arena-backed element tree.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Element>,
}

impl Document {
    /// Creates a document with an `html` root element.
    pub fn new() -> Self {
        Self {
            nodes: vec![Element {
                tag: "html".to_string(),
                attributes: BTreeMap::new(),
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    /// Returns the root element.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Creates a detached element.
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.nodes.push(Element {
            tag: tag.to_ascii_lowercase(),
            attributes: BTreeMap::new(),
            parent: None,
            children: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    /// Appends `child` to `parent`, detaching it from any previous parent.
    ///
    /// Returns false, leaving the tree unchanged, when `child` is `parent`
    /// or one of its ancestors.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> bool {
        if self.is_ancestor_or_self(child, parent) {
            return false;
        }
        if let Some(old) = self.nodes[child.0].parent {
            self.nodes[old.0].children.retain(|c| *c != child);
        }
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
        true
    }

    fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes[id.0].parent;
        }
        false
    }

    /// Returns the tag name of `node`.
    pub fn tag(&self, node: NodeId) -> &str {
        &self.nodes[node.0].tag
    }

    /// Returns an attribute value.
    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        self.nodes[node.0].attributes.get(name).map(String::as_str)
    }

    /// Returns true if `node` has the attribute.
    pub fn has_attribute(&self, node: NodeId, name: &str) -> bool {
        self.nodes[node.0].attributes.contains_key(name)
    }

    /// Sets an attribute value.
    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) {
        self.nodes[node.0]
            .attributes
            .insert(name.to_string(), value.to_string());
    }

    /// Removes an attribute.
    pub fn remove_attribute(&mut self, node: NodeId, name: &str) {
        self.nodes[node.0].attributes.remove(name);
    }

    /// Returns `node`'s descendants in document order.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[node.0].children.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.nodes[next.0].children.iter().rev().copied());
        }
        out
    }

    /// Returns every attached element, root included, in document order.
    pub fn all_elements(&self) -> Vec<NodeId> {
        let mut out = vec![self.root()];
        out.extend(self.descendants(self.root()));
        out
    }

    /// Returns attached elements with `tag`.
    pub fn elements_by_tag(&self, tag: &str) -> Vec<NodeId> {
        self.all_elements()
            .into_iter()
            .filter(|n| self.tag(*n).eq_ignore_ascii_case(tag))
            .collect()
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

/// The recorded original and current value of a rewritten attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteMark {
    pub original: String,
    pub current: String,
}

fn original_key(attr: &str) -> String {
    format!("data-p5-{attr}-original")
}

fn current_key(attr: &str) -> String {
    format!("data-p5-{attr}-current")
}

/// Returns the rewrite mark of `attr` on `node`.
pub fn mark(doc: &Document, node: NodeId, attr: &str) -> Option<RewriteMark> {
    Some(RewriteMark {
        original: doc.attribute(node, &original_key(attr))?.to_string(),
        current: doc.attribute(node, &current_key(attr))?.to_string(),
    })
}

/// A mutation reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Elements were inserted.
    ChildList { added: Vec<NodeId> },
    /// An attribute changed.
    Attribute { target: NodeId, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerState {
    Idle,
    Draining,
}

/// Counters exposed to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStats {
    /// Number of attributes rewritten.
    pub update_count: u64,
    /// Whether the document finished loading.
    pub loaded: bool,
}

/// Rewrites URL attributes of one document.
#[derive(Debug)]
pub struct DomRewriter {
    prefix: String,
    base: Url,
    origins: HashSet<String>,
    state: SchedulerState,
    queue: VecDeque<NodeId>,
    queued: HashSet<NodeId>,
    capacity: usize,
    rescan_anchors: bool,
    rescan_all: bool,
    observing: bool,
    stats: RewriteStats,
}

impl DomRewriter {
    /// Creates a rewriter for a document representing `base`.
    pub fn new(server: &ServerOrigin, base: Url) -> Self {
        Self {
            prefix: server.prefix(),
            base,
            origins: HashSet::new(),
            state: SchedulerState::Idle,
            queue: VecDeque::new(),
            queued: HashSet::new(),
            capacity: DEFAULT_QUEUE_CAPACITY,
            rescan_anchors: false,
            rescan_all: false,
            observing: true,
            stats: RewriteStats::default(),
        }
    }

    /// Sets the mutation queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Returns the logical base URL.
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Returns the counters.
    pub fn stats(&self) -> RewriteStats {
        self.stats
    }

    /// Returns true if nothing is queued or scheduled.
    pub fn is_idle(&self) -> bool {
        self.state == SchedulerState::Idle && !self.rescan_anchors && !self.rescan_all
    }

    /// Returns the number of queued elements.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Starts or stops reacting to mutations.
    pub fn set_observing(&mut self, observing: bool) {
        self.observing = observing;
    }

    /// Rewrites one attribute. Returns true if the value changed.
    pub fn rewrite_attribute(&mut self, doc: &mut Document, node: NodeId, attr: &str) -> bool {
        if doc.has_attribute(node, IGNORE_ATTRIBUTE) {
            return false;
        }
        let Some(value) = doc.attribute(node, attr).map(str::to_string) else {
            return false;
        };
        if value.is_empty() || value.starts_with('#') {
            return false;
        }
        if doc.attribute(node, &current_key(attr)) == Some(value.as_str()) {
            return false;
        }
        if let Some(embedded) = value.strip_prefix('/') {
            if let Ok(url) = Url::parse(embedded) {
                if self.origins.contains(&url.origin().ascii_serialization()) {
                    return false;
                }
            }
        }

        let Ok(url) = self.base.join(&value) else {
            return false;
        };
        if !is_web_scheme(url.scheme()) {
            return false;
        }

        let resolved = format!("/{}", trim_prefix(url.as_str(), &self.prefix));
        doc.set_attribute(node, &original_key(attr), &value);
        doc.set_attribute(node, &current_key(attr), &resolved);
        doc.set_attribute(node, attr, &resolved);
        self.stats.update_count += 1;
        self.origins.insert(url.origin().ascii_serialization());
        true
    }

    /// Rewrites every target attribute of `nodes`. Returns the number of
    /// attributes changed.
    pub fn process_nodes(&mut self, doc: &mut Document, nodes: &[NodeId]) -> usize {
        let mut changed = 0;
        for node in nodes {
            for attr in TARGET_ATTRIBUTES {
                if doc.has_attribute(*node, attr) && self.rewrite_attribute(doc, *node, attr) {
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Handles a batch of mutations reported by the host.
    pub fn observe(&mut self, doc: &mut Document, mutations: Vec<Mutation>) {
        if !self.observing {
            return;
        }
        for mutation in mutations {
            match mutation {
                Mutation::ChildList { added } => self.on_added(doc, added),
                Mutation::Attribute { target, name } => {
                    if TARGET_ATTRIBUTES.contains(&name.as_str()) {
                        self.rewrite_attribute(doc, target, &name);
                    }
                }
            }
        }
    }

    fn on_added(&mut self, doc: &mut Document, added: Vec<NodeId>) {
        if !self.stats.loaded {
            self.process_nodes(doc, &added);
            return;
        }

        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        for node in added {
            for n in std::iter::once(node).chain(doc.descendants(node)) {
                if seen.insert(n) {
                    nodes.push(n);
                }
            }
        }

        match self.state {
            SchedulerState::Idle => {
                self.process_nodes(doc, &nodes);
                self.state = SchedulerState::Draining;
            }
            SchedulerState::Draining => self.enqueue(nodes),
        }
    }

    fn enqueue(&mut self, nodes: Vec<NodeId>) {
        if self.rescan_all {
            return;
        }
        for node in nodes {
            if self.queued.contains(&node) {
                continue;
            }
            if self.queue.len() >= self.capacity {
                tracing::debug!(
                    capacity = self.capacity,
                    "Mutation queue overflow, scheduling full rescan"
                );
                self.queue.clear();
                self.queued.clear();
                self.rescan_all = true;
                return;
            }
            self.queued.insert(node);
            self.queue.push_back(node);
        }
    }

    /// Runs one scheduler step. Returns true if any work was done.
    pub fn tick(&mut self, doc: &mut Document) -> bool {
        let draining = self.state == SchedulerState::Draining;
        if !draining && !self.rescan_anchors && !self.rescan_all {
            return false;
        }

        if self.rescan_all {
            let all = doc.all_elements();
            self.process_nodes(doc, &all);
        } else {
            let pending: Vec<NodeId> = self.queue.iter().copied().collect();
            self.process_nodes(doc, &pending);
        }
        self.queue.clear();
        self.queued.clear();
        self.force_rescan(doc);

        self.rescan_all = false;
        self.rescan_anchors = false;
        self.state = SchedulerState::Idle;
        true
    }

    /// Marks the document as loaded and schedules a forced rescan.
    pub fn document_loaded(&mut self) {
        self.stats.loaded = true;
        self.rescan_anchors = true;
    }

    /// Schedules a forced rescan for the next tick.
    pub fn request_rescan(&mut self) {
        self.rescan_anchors = true;
    }

    /// Immediately rescans every `a`, `form` and `iframe`.
    pub fn force_rescan(&mut self, doc: &mut Document) -> usize {
        let mut changed = 0;
        for tag in RESCAN_TAGS {
            let nodes = doc.elements_by_tag(tag);
            changed += self.process_nodes(doc, &nodes);
        }
        changed
    }

    /// Re-derives the base after a history update to `path_and_query`,
    /// dropping the origin marker.
    pub fn update_base(&mut self, path_and_query: &str) {
        if let Ok(mut base) = self.base.join(path_and_query) {
            crate::marker::strip_origin_marker(&mut base);
            self.base = base;
        }
    }
}
