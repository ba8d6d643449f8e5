use std::fmt;
use std::sync::Arc;

/// Canonical identifier of a source document.
///
/// Keys are opaque to the scheduler: equality is the primary identity, and
/// the total order only exists to keep iteration deterministic. Cloning is
/// cheap, so keys are passed around freely between the scheduler, worker
/// threads, and listeners.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentKey(Arc<str>);

impl DocumentKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DocumentKey").field(&self.0).finish()
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for DocumentKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DocumentKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Per-document edit revision.
///
/// Revisions are minted by the external document registry and increase
/// monotonically for a given document. The scheduler only snapshots and
/// compares them; it never invents or reorders revisions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Revision(u64);

impl Revision {
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }
}
