use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(0);

/// Opaque identifier for a session server instance, unique within the
/// lifetime of the process. Assigned when a `SessionServerApp` is created,
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(u64);

impl ServerId {
    /// Allocates the next `ServerId` from the process-global counter.
    pub fn next() -> Self {
        ServerId(NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Builds a `ServerId` from a raw value, for use when decoding ids that
    /// crossed an RPC boundary (e.g. in a `StateChanged` event).
    pub fn from_raw(value: u64) -> Self {
        ServerId(value)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_unique() {
        let a = ServerId::next();
        let b = ServerId::next();
        assert_ne!(a, b);
        assert!(b.as_raw() > a.as_raw());
    }
}
