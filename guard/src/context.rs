//! Ambient execution contexts.
//!
//! A [Context] is a node in a tree of execution contexts. Code always runs "inside" some
//! context: the one installed by the nearest enclosing [Context::run] or [Context::enter], or the
//! root context when none is installed. Children may carry a [Marker] that identifies the
//! [crate::Tracker] that created them, which lets a tracker tell whether the current code is
//! running inside the body of one of its scopes.
//!
//! ```txt
//! root
//!   |
//!   +-- child(Some(m)) ---> scope A (marked)
//!   |                          |
//!   |                          +-- child(None) ---> harness context (unmarked)
//!   |                                                  |
//!   |                                                  +-- owner(m) == scope A
//!   |
//!   +-- owner(m) == None
//! ```
//!
//! The ambient context is stored in task-local storage, so it follows a future across polls
//! but is not inherited by independently spawned tasks.

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::task::futures::TaskLocalFuture;

tokio::task_local! {
    static CURRENT: Context;
}

/// Identifier of the root context.
const ROOT: u64 = 0;

/// Source of unique context and marker identifiers.
static NEXT: AtomicU64 = AtomicU64::new(ROOT + 1);

fn next_id() -> u64 {
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Opaque tag identifying the owner of a [Context].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Marker(u64);

impl Marker {
    /// Create a marker that is distinct from every other marker in the process.
    pub fn unique() -> Self {
        Self(next_id())
    }
}

struct Inner {
    id: u64,
    marker: Option<Marker>,
    parent: Option<Context>,
}

/// Handle to a node in the execution-context tree.
///
/// Cloning is cheap and yields a handle to the same node. Two handles are equal if and only if
/// they refer to the same node.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Return the root context.
    pub fn root() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: ROOT,
                marker: None,
                parent: None,
            }),
        }
    }

    /// Return the ambient context (or the root context if none is installed).
    pub fn current() -> Self {
        CURRENT.try_with(Clone::clone).unwrap_or_else(|_| Self::root())
    }

    /// Derive a new child of this context, optionally tagged with `marker`.
    ///
    /// Every child is distinct from every other context ever created.
    pub fn child(&self, marker: Option<Marker>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: next_id(),
                marker,
                parent: Some(self.clone()),
            }),
        }
    }

    /// Returns the marker carried by this context, if any.
    pub fn marker(&self) -> Option<Marker> {
        self.inner.marker
    }

    /// Returns the parent of this context (`None` for the root).
    pub fn parent(&self) -> Option<&Context> {
        self.inner.parent.as_ref()
    }

    /// Walk from this context toward the root and return the first context tagged with
    /// `marker` (including this context itself).
    pub fn owner(&self, marker: Marker) -> Option<Context> {
        let mut next = Some(self);
        while let Some(context) = next {
            if context.marker() == Some(marker) {
                return Some(context.clone());
            }
            next = context.parent();
        }
        None
    }

    /// Run `future` with this context installed as the ambient context on every poll.
    pub fn run<F: Future>(&self, future: F) -> TaskLocalFuture<Context, F> {
        CURRENT.scope(self.clone(), future)
    }

    /// Run `f` synchronously with this context installed as the ambient context.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(self.clone(), f)
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("marker", &self.inner.marker)
            .finish()
    }
}
