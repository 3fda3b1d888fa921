//! Integration coverage for the boundary scenarios named in the design
//! notes: sort of a small unsorted run, the worked hash-join example with
//! and without an outer join, and cleanup after a terminated probe.

use std::cmp::Ordering;
use std::sync::Arc;

use flowstage::adaptor::StageAdaptor;
use flowstage::dispatcher::Dispatcher;
use flowstage::fifo::TupleFifo;
use flowstage::ops::hash_join::{HashJoinOperator, JoinSpec};
use flowstage::ops::sort::{SortOperator, SortSpec};
use flowstage::packet::{ExecCtx, Operator};
use flowstage::pool::MallocPagePool;

struct I32Sort;
impl SortSpec for I32Sort {
    fn tuple_size(&self) -> usize {
        4
    }
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        i32::from_le_bytes(a.try_into().unwrap()).cmp(&i32::from_le_bytes(b.try_into().unwrap()))
    }
}

#[test]
fn sort_of_small_unsorted_run() {
    let pool = MallocPagePool::shared(64);
    let input = TupleFifo::new(pool.clone(), 4, 8, 1);
    for v in [3i32, 1, 4, 1, 5, 9, 2, 6] {
        input.append(&v.to_le_bytes()).unwrap();
    }
    input.send_eof().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let op = SortOperator::new(input, Arc::new(I32Sort), 2, 3, pool.clone(), dir.path().to_path_buf());

    let output = TupleFifo::new(pool, 4, 8, 1);
    let dispatcher = Dispatcher::new();
    let adaptor = StageAdaptor::new(output.clone(), None, None);
    let ctx = ExecCtx { dispatcher, adaptor };
    Box::new(op).run(&ctx).unwrap();
    ctx.adaptor.close();

    let mut out = Vec::new();
    let mut buf = Vec::new();
    while output.get_tuple(&mut buf).unwrap() {
        out.push(i32::from_le_bytes(buf.clone().try_into().unwrap()));
    }
    assert_eq!(out, vec![1, 1, 2, 3, 4, 5, 6, 9]);
}

/// Tuples are `(i32 key, u8 tag)`; join output packs the two tags as
/// ASCII bytes for easy comparison against the worked example.
struct TagJoin;
impl JoinSpec for TagJoin {
    fn left_tuple_size(&self) -> usize {
        5
    }
    fn right_tuple_size(&self) -> usize {
        5
    }
    fn left_key(&self, tuple: &[u8]) -> Vec<u8> {
        tuple[0..4].to_vec()
    }
    fn right_key(&self, tuple: &[u8]) -> Vec<u8> {
        tuple[0..4].to_vec()
    }
    fn join(&self, left: &[u8], right: &[u8]) -> Vec<u8> {
        vec![left[4], right[4]]
    }
    fn outer_join(&self, left: &[u8]) -> Vec<u8> {
        vec![left[4], 0]
    }
}

fn tuple(key: i32, tag: u8) -> Vec<u8> {
    let mut t = key.to_le_bytes().to_vec();
    t.push(tag);
    t
}

fn run_worked_example(outer: bool) -> Vec<(u8, u8)> {
    let pool = MallocPagePool::shared(256);
    let left = TupleFifo::new(pool.clone(), 5, 8, 1);
    for (k, t) in [(1, b'a'), (2, b'b'), (1, b'c')] {
        left.append(&tuple(k, t)).unwrap();
    }
    left.send_eof().unwrap();

    let right = TupleFifo::new(pool.clone(), 5, 8, 1);
    for (k, t) in [(1, b'x'), (3, b'y'), (1, b'z')] {
        right.append(&tuple(k, t)).unwrap();
    }
    right.send_eof().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let op = HashJoinOperator::new(left, right, Arc::new(TagJoin), outer, false, 4, 8, pool.clone(), dir.path().to_path_buf());

    let output = TupleFifo::new(pool, 2, 16, 1);
    let dispatcher = Dispatcher::new();
    let adaptor = StageAdaptor::new(output.clone(), None, None);
    let ctx = ExecCtx { dispatcher, adaptor };
    Box::new(op).run(&ctx).unwrap();
    ctx.adaptor.close();

    let mut out = Vec::new();
    let mut buf = Vec::new();
    while output.get_tuple(&mut buf).unwrap() {
        out.push((buf[0], buf[1]));
    }
    out.sort();
    out
}

#[test]
fn worked_example_inner_join() {
    let mut out = run_worked_example(false);
    out.sort();
    let mut expected = vec![(b'a', b'x'), (b'a', b'z'), (b'c', b'x'), (b'c', b'z')];
    expected.sort();
    assert_eq!(out, expected);
}

#[test]
fn worked_example_outer_join_adds_unmatched_left() {
    let out = run_worked_example(true);
    assert!(out.contains(&(b'b', 0)));
    assert_eq!(out.len(), 5);
}

/// Terminating the join's output fifo mid-probe: the blocked write must
/// surface as an error, the still-open probe input must observe the
/// termination too, and any partition that had already spilled to disk
/// must still have its temp files cleaned up.
#[test]
fn terminated_output_mid_probe_cleans_up() {
    // Two partitions; key parity decides which bucket a key lands in
    // (fnv1a(key) % 2). Odd keys share a bucket that we starve into
    // spilling; the even key is the one the probe actually matches.
    let small_page_pool = MallocPagePool::shared(18); // capacity_for(18, 5) == 2
    let right = TupleFifo::new(small_page_pool.clone(), 5, 8, 1);
    for t in [b'p', b'q', b'r', b's'] {
        right.append(&tuple(1, t)).unwrap(); // odd key -> forces a spill
    }
    right.append(&tuple(2, b'x')).unwrap(); // even key -> the probe's match
    right.send_eof().unwrap();

    // capacity_for(13, 5) == 1: the second append flushes the first tuple
    // to a readable page without ever calling send_eof.
    let left_pool = MallocPagePool::shared(13);
    let left = TupleFifo::new(left_pool, 5, 8, 1);
    left.append(&tuple(2, b'a')).unwrap(); // matches right's even-key row
    left.append(&tuple(99, b'z')).unwrap(); // unread placeholder, just flushes the above

    let dir = tempfile::tempdir().unwrap();
    let op = HashJoinOperator::new(
        left.clone(),
        right,
        Arc::new(TagJoin),
        false,
        false,
        2,
        1,
        small_page_pool,
        dir.path().to_path_buf(),
    );

    // capacity_for(16, 2) == 4, max_pages == 1: pre-fill to exactly one
    // queued full page plus a full-but-unflushed write page, so the very
    // first tuple the join emits blocks on `not_full`.
    let output_pool = MallocPagePool::shared(16);
    let output = TupleFifo::new(output_pool, 2, 1, 1);
    for _ in 0..8 {
        output.append(&[0u8, 0u8]).unwrap();
    }

    let dispatcher = Dispatcher::new();
    let adaptor = StageAdaptor::new(output.clone(), None, None);
    let ctx = ExecCtx { dispatcher, adaptor };

    let handle = std::thread::spawn(move || Box::new(op).run(&ctx));

    // Give the worker time to reach the blocked append before pulling the
    // output fifo out from under it; the teacher's own concurrency tests
    // (e.g. `enterprise_optimization::memory_integration_tests`) use the
    // same short-sleep handoff instead of an extra signaling channel.
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert!(output.terminate());

    let result = handle.join().unwrap();
    assert!(result.is_err());

    // The probe's input fifo never reached EOF; it must now observe the
    // termination that the join's own cleanup path triggered.
    let mut buf = Vec::new();
    assert!(left.get_tuple(&mut buf).is_err());

    // Any temp file the forced spill created must be gone once the
    // operator (and its locally-owned `Partition`s) finished unwinding.
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}
