//! Monotonic connection identifiers.
//!
//! A cached driver statement needs to know whether its owning connection is
//! still around without holding a strong reference to it. Rust has no
//! GC-integrated weak pointer for a plain owned value, so a process-wide
//! monotonically increasing id stands in for "(connection id, generation)":
//! a monotonic, never-reused id doubles as its own generation counter. Because
//! the counter never wraps in practice and ids are never reused, a bare id
//! already carries the generation: once a connection is discarded its id is
//! retired forever, so a stale cache entry is detected by id lookup alone.
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one physical connection for as long as the pool keeps it alive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

static NEXT: AtomicU64 = AtomicU64::new(1);

impl ConnId {
    pub(crate) fn next() -> Self {
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Debug for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnId({})", self.0)
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut buf = itoa::Buffer::new();
        f.write_str(buf.format(self.0))
    }
}
