//! The WISDOM pleasantry: a tiny built-in fortune file.

use std::sync::atomic::{AtomicUsize, Ordering};

const SAYINGS: &[&str] = &[
    "He who holds the write lock writes history.",
    "Many may read, but only one may write.",
    "Patience is a lock with a generous timeout.",
    "A lock held forever is a bug, not a possession.",
    "The fastest critical section is the one you never enter.",
    "Readers flock, writers queue.",
    "Release early, release often.",
    "Deadlock is two friends each waiting for the other to call first.",
];

static NEXT: AtomicUsize = AtomicUsize::new(0);

/// Returns the next saying, round-robin across the process.
pub fn dispense() -> &'static str {
    let idx = NEXT.fetch_add(1, Ordering::Relaxed) % SAYINGS.len();
    SAYINGS[idx]
}
