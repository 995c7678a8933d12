use std::sync::atomic::{AtomicU64, Ordering};

/// Per-process request numbering. Sequence numbers feed synthesized
/// response ids; the UUID form is used for log correlation.
pub(crate) struct RequestIdGenerator {
    seed: u128,
    counter: AtomicU64,
}

impl RequestIdGenerator {
    #[must_use]
    pub(crate) fn new() -> Self {
        let seed_hi = u128::from(fastrand::u64(..));
        let seed_lo = u128::from(fastrand::u64(..));
        Self {
            seed: (seed_hi << 64) | seed_lo,
            counter: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub(crate) fn request_uuid(&self, request_seq: u64) -> uuid::Uuid {
        uuid::Uuid::from_u128(self.seed ^ u128::from(request_seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic() {
        let ids = RequestIdGenerator::new();
        let first = ids.next_seq();
        assert_eq!(ids.next_seq(), first + 1);
    }

    #[test]
    fn test_uuid_distinct_per_sequence() {
        let ids = RequestIdGenerator::new();
        assert_ne!(ids.request_uuid(1), ids.request_uuid(2));
        assert_eq!(ids.request_uuid(3), ids.request_uuid(3));
    }
}
