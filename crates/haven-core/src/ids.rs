//! Opaque identifier generation and timestamps.
//!
//! All broker-assigned ids (session tokens, request ids, message ids) are
//! opaque strings built from a timestamp plus an atomic counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Atomic counter for ensuring unique ids even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Current Unix time in milliseconds.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Generate a unique id with the given prefix (e.g. `sess`, `req`, `msg`).
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    // Combine timestamp with atomic counter for guaranteed uniqueness
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}_{:x}", prefix, timestamp.wrapping_add(counter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ids() {
        let id1 = generate_id("sess");
        let id2 = generate_id("sess");
        assert_ne!(id1, id2);
        assert!(id1.starts_with("sess_"));
    }

    #[test]
    fn test_now_ms_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
