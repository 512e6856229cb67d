//! Resource accounting as an injected observer.
//!
//! The switch and sessions report every open/close of a tracked resource to
//! a `ResourceTracker`. The production default does nothing; tests install
//! `CountingTracker` and assert that every resource opened was also closed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Kinds of tracked resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Connection,
    SecureChannel,
    MuxSession,
    MuxChannel,
}

pub trait ResourceTracker: Send + Sync {
    fn opened(&self, resource: Resource);
    fn closed(&self, resource: Resource);
}

/// Production default: no accounting.
pub struct NoopTracker;

impl ResourceTracker for NoopTracker {
    fn opened(&self, _resource: Resource) {}
    fn closed(&self, _resource: Resource) {}
}

/// Shared tracker handle.
pub type SharedTracker = Arc<dyn ResourceTracker>;

pub fn noop() -> SharedTracker {
    Arc::new(NoopTracker)
}

/// Test tracker: net open count per resource kind.
#[derive(Default)]
pub struct CountingTracker {
    connections: AtomicI64,
    secure: AtomicI64,
    sessions: AtomicI64,
    channels: AtomicI64,
}

impl CountingTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn cell(&self, resource: Resource) -> &AtomicI64 {
        match resource {
            Resource::Connection => &self.connections,
            Resource::SecureChannel => &self.secure,
            Resource::MuxSession => &self.sessions,
            Resource::MuxChannel => &self.channels,
        }
    }

    /// Net open count for one resource kind.
    pub fn live(&self, resource: Resource) -> i64 {
        self.cell(resource).load(Ordering::SeqCst)
    }

    /// True when every tracked resource has been closed.
    pub fn balanced(&self) -> bool {
        [
            Resource::Connection,
            Resource::SecureChannel,
            Resource::MuxSession,
            Resource::MuxChannel,
        ]
        .iter()
        .all(|r| self.live(*r) == 0)
    }
}

impl ResourceTracker for CountingTracker {
    fn opened(&self, resource: Resource) {
        self.cell(resource).fetch_add(1, Ordering::SeqCst);
    }

    fn closed(&self, resource: Resource) {
        self.cell(resource).fetch_sub(1, Ordering::SeqCst);
    }
}
