use std::cmp::Ordering;

/// A pending expiry, ordered soonest-first.
///
/// The heap may hold several events for the same key (TTL updates push a new
/// event instead of rewriting the old one) and events for keys that no longer
/// exist. The entry in the map is authoritative; the sweeper discards events
/// that no longer match it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryEvent {
    pub key: String,
    pub expiry_ms: i64,
}

// Reverse because BinaryHeap is a max-heap
impl Ord for ExpiryEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other.expiry_ms.cmp(&self.expiry_ms)
    }
}

impl PartialOrd for ExpiryEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
