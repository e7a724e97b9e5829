//! RPC handler registry.
//!
//! Handler IDs are never assigned by hand. Every handler is registered under
//! a name, and [`HandlerRegistry::index`] sorts the names byte-wise; a
//! handler's ID is its position in that order. Two peers therefore agree on
//! every ID exactly when they registered the same set of names, in whatever
//! order they did so.
//!
//! The registry has an explicit two-phase lifecycle: register everything,
//! call `index()` once, then share it read-only (behind an `Arc`) with every
//! node. Nodes refuse to start with a registry that has not been indexed.

use crate::error::HandlerError;
use crate::node::NodeInterface;
use crate::packet::Packet;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Wire identifier of a registered handler
pub type HandlerId = u16;

/// RPC entry point.
///
/// Receives the node that is dispatching (so it can compose replies or query
/// [`NodeInterface::sender_index`]) and the packet positioned at the
/// handler's arguments. A handler must extract exactly the arguments it was
/// composed with; the next message in the same packet starts right after.
pub type HandlerFn =
    Arc<dyn Fn(&mut dyn NodeInterface, &mut Packet) -> Result<(), HandlerError> + Send + Sync>;

/// Name to handler table with deterministic IDs
#[derive(Default)]
pub struct HandlerRegistry {
    raw: HashMap<String, HandlerFn>,
    names: Vec<String>,
    funcs: Vec<HandlerFn>,
    indexed: bool,
}

impl HandlerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered or if the registry has
    /// already been indexed.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&mut dyn NodeInterface, &mut Packet) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        assert!(
            !self.indexed,
            "handler '{name}' registered after the registry was indexed"
        );
        assert!(
            !self.raw.contains_key(&name),
            "handler '{name}' registered twice"
        );
        self.raw.insert(name, Arc::new(handler));
        self
    }

    /// Freeze the registry and assign IDs by sorted name.
    ///
    /// # Panics
    ///
    /// Panics if called twice or if more handlers were registered than a
    /// `HandlerId` can address.
    pub fn index(&mut self) {
        assert!(!self.indexed, "handler registry indexed twice");

        let mut entries: Vec<(String, HandlerFn)> = self.raw.drain().collect();
        assert!(
            entries.len() <= usize::from(HandlerId::MAX) + 1,
            "{} handlers exceed the HandlerId range",
            entries.len()
        );
        entries.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        let (names, funcs) = entries.into_iter().unzip();
        self.names = names;
        self.funcs = funcs;
        self.indexed = true;

        tracing::debug!("Indexed {} RPC handlers", self.names.len());
        for (id, name) in self.names.iter().enumerate() {
            tracing::debug!("  handler {:>5} = {}", id, name);
        }
    }

    /// Whether [`index`](Self::index) has run
    #[must_use]
    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    /// Number of registered handlers
    #[must_use]
    pub fn len(&self) -> usize {
        if self.indexed {
            self.names.len()
        } else {
            self.raw.len()
        }
    }

    /// Whether no handler is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up the ID assigned to `name`. Linear in the number of handlers.
    ///
    /// Returns `None` before indexing or for an unknown name.
    #[must_use]
    pub fn id_with_name(&self, name: &str) -> Option<HandlerId> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| HandlerId::try_from(i).ok())
    }

    /// Look up the name registered under `id`
    #[must_use]
    pub fn name_with_id(&self, id: HandlerId) -> Option<&str> {
        self.names.get(usize::from(id)).map(String::as_str)
    }

    /// Constant-time lookup used on the receive path
    #[must_use]
    pub fn handler_with_id(&self, id: HandlerId) -> Option<&HandlerFn> {
        self.funcs.get(usize::from(id))
    }

    /// Sorted handler names, indexed by ID
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("indexed", &self.indexed)
            .field("handlers", &self.len())
            .field("names", &self.names)
            .finish()
    }
}
