//! Process-wide counters, carried over from the original's `open_fifo_count`
//! and cumulative prefetch-count globals (spec §3 supplement). Not a metrics
//! layer — just the two numbers the original tracked.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

static OPEN_FIFOS: AtomicI64 = AtomicI64::new(0);
static PAGES_ENQUEUED: AtomicU64 = AtomicU64::new(0);

pub(crate) fn fifo_opened() {
    OPEN_FIFOS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn fifo_closed() {
    OPEN_FIFOS.fetch_sub(1, Ordering::Relaxed);
}

pub(crate) fn page_enqueued() {
    PAGES_ENQUEUED.fetch_add(1, Ordering::Relaxed);
}

/// Number of `TupleFifo` instances currently alive.
pub fn open_fifo_count() -> i64 {
    OPEN_FIFOS.load(Ordering::Relaxed)
}

/// Cumulative count of pages published by any fifo's writer side.
pub fn pages_enqueued() -> u64 {
    PAGES_ENQUEUED.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_move_independently() {
        let before = open_fifo_count();
        fifo_opened();
        assert_eq!(open_fifo_count(), before + 1);
        fifo_closed();
        assert_eq!(open_fifo_count(), before);
    }
}
