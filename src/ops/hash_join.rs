//! Hash join with quota-driven disk-spilling partitions (spec §4.4).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{FlowError, Result};
use crate::fifo::TupleFifo;
use crate::packet::{ExecCtx, Operator, OperatorKind};
use crate::page::Page;
use crate::pool::{self, PagePool};
use crate::tempio::TempFile;

use super::merge::{FifoSource, FileTupleSource, TupleSource};

/// Recursion is bounded because each level doubles the partition count;
/// this is a safety margin against pathological key distributions, not a
/// normal-case limit.
const MAX_SPILL_DEPTH: u32 = 8;

/// Per-join callbacks. `left`/`right` tuples are flat, fixed-width byte
/// records whose interpretation is private to the caller.
pub trait JoinSpec: Send + Sync + 'static {
    fn left_tuple_size(&self) -> usize;
    fn right_tuple_size(&self) -> usize;
    fn left_key(&self, tuple: &[u8]) -> Vec<u8>;
    fn right_key(&self, tuple: &[u8]) -> Vec<u8>;
    fn join(&self, left: &[u8], right: &[u8]) -> Vec<u8>;
    fn outer_join(&self, left: &[u8]) -> Vec<u8>;
}

/// Probe side is `left`, build side is `right` (spec naming).
pub struct HashJoinOperator {
    left: Arc<TupleFifo>,
    right: Arc<TupleFifo>,
    spec: Arc<dyn JoinSpec>,
    outer: bool,
    distinct: bool,
    num_partitions: usize,
    page_quota: usize,
    pool: Arc<dyn PagePool>,
    temp_dir: PathBuf,
}

impl HashJoinOperator {
    pub fn new(
        left: Arc<TupleFifo>,
        right: Arc<TupleFifo>,
        spec: Arc<dyn JoinSpec>,
        outer: bool,
        distinct: bool,
        num_partitions: usize,
        page_quota: usize,
        pool: Arc<dyn PagePool>,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            left,
            right,
            spec,
            outer,
            distinct,
            num_partitions,
            page_quota,
            pool,
            temp_dir,
        }
    }
}

impl Operator for HashJoinOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::HashJoin
    }

    fn run(self: Box<Self>, ctx: &ExecCtx) -> Result<()> {
        let left: Box<dyn TupleSource> = Box::new(FifoSource::new(self.left.clone()));
        let right: Box<dyn TupleSource> = Box::new(FifoSource::new(self.right.clone()));

        let result = run_core(
            left,
            right,
            &self.spec,
            self.outer,
            self.distinct,
            self.num_partitions.max(1),
            self.page_quota.max(1),
            &self.pool,
            &self.temp_dir,
            0,
            &mut |tuple| ctx.adaptor.output(tuple),
        );

        if result.is_err() {
            self.left.terminate();
            self.right.terminate();
        }
        result
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn partition_of(key: &[u8], n: usize) -> usize {
    (fnv1a(key) % n as u64) as usize
}

enum Partition {
    Memory(Vec<Page>),
    Spilled {
        right_file: TempFile,
        left_file: Option<TempFile>,
        current: Page,
    },
}

fn spill_largest_memory_partition(
    partitions: &mut [Partition],
    resident_pages: &mut usize,
    right_tuple_size: usize,
    pool: &Arc<dyn PagePool>,
    temp_dir: &Path,
    depth: u32,
) -> Result<()> {
    let victim = partitions
        .iter()
        .enumerate()
        .filter_map(|(i, p)| match p {
            Partition::Memory(pages) => Some((i, pages.len())),
            Partition::Spilled { .. } => None,
        })
        .max_by_key(|&(_, len)| len)
        .map(|(i, _)| i)
        .ok_or_else(|| FlowError::Join("no in-memory partition left to spill".into()))?;

    let Partition::Memory(pages) = std::mem::replace(&mut partitions[victim], Partition::Memory(Vec::new())) else {
        unreachable!("victim index was filtered to Memory partitions")
    };

    let mut right_file = TempFile::create(temp_dir, &format!("hjoin-r-d{depth}-p{victim}"))?;
    for page in &pages {
        page.write_to(right_file.file_mut())?;
    }
    *resident_pages -= pages.len();

    let current = pool::alloc(pool, right_tuple_size)?;
    partitions[victim] = Partition::Spilled {
        right_file,
        left_file: None,
        current,
    };
    Ok(())
}

/// The algorithm proper, generic over its tuple sources so it can run both
/// against live fifos (top-level call) and against spilled run files
/// (recursive re-join of an over-full partition).
#[allow(clippy::too_many_arguments)]
fn run_core(
    mut left: Box<dyn TupleSource>,
    mut right: Box<dyn TupleSource>,
    spec: &Arc<dyn JoinSpec>,
    outer: bool,
    distinct: bool,
    num_partitions: usize,
    page_quota: usize,
    pool: &Arc<dyn PagePool>,
    temp_dir: &Path,
    depth: u32,
    emit: &mut dyn FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    if depth > MAX_SPILL_DEPTH {
        return Err(FlowError::Join(
            "spilled hash-join recursion exceeded its depth limit".into(),
        ));
    }

    let mut partitions: Vec<Partition> = (0..num_partitions).map(|_| Partition::Memory(Vec::new())).collect();
    let mut resident_pages = 0usize;

    // Phase 1: build-side partitioning with quota.
    while let Some(tuple) = right.next()? {
        let h = partition_of(&spec.right_key(&tuple), num_partitions);

        let needs_new_page = matches!(&partitions[h], Partition::Memory(pages) if pages.last().map(Page::full).unwrap_or(true));
        if needs_new_page && resident_pages >= page_quota {
            spill_largest_memory_partition(&mut partitions, &mut resident_pages, spec.right_tuple_size(), pool, temp_dir, depth)?;
        }

        match &mut partitions[h] {
            Partition::Memory(pages) => {
                if pages.last().map(Page::full).unwrap_or(true) {
                    pages.push(pool::alloc(pool, spec.right_tuple_size())?);
                    resident_pages += 1;
                }
                pages.last_mut().expect("just pushed or already present").append(&tuple)?;
            }
            Partition::Spilled { right_file, current, .. } => {
                if current.full() {
                    current.write_to(right_file.file_mut())?;
                    current.clear();
                }
                current.append(&tuple)?;
            }
        }
    }

    // Phase 2: finalize the right side.
    let mut tables: Vec<Option<HashMap<Vec<u8>, Vec<Vec<u8>>>>> = Vec::with_capacity(num_partitions);
    for partition in partitions.iter_mut() {
        match partition {
            Partition::Memory(pages) => {
                let mut table: HashMap<Vec<u8>, Vec<Vec<u8>>> = HashMap::new();
                for page in pages.iter() {
                    for tuple in page.iter() {
                        let key = spec.right_key(tuple);
                        let bucket = table.entry(key).or_default();
                        if distinct && !bucket.is_empty() {
                            continue;
                        }
                        bucket.push(tuple.to_vec());
                    }
                }
                tables.push(Some(table));
            }
            Partition::Spilled { right_file, current, .. } => {
                if !current.empty() {
                    current.write_to(right_file.file_mut())?;
                    current.clear();
                }
                *current = pool::alloc(pool, spec.left_tuple_size())?;
                tables.push(None);
            }
        }
    }

    // Phase 3: probe side.
    while let Some(tuple) = left.next()? {
        let h = partition_of(&spec.left_key(&tuple), num_partitions);
        match (&mut partitions[h], &tables[h]) {
            (Partition::Memory(_), Some(table)) => {
                let key = spec.left_key(&tuple);
                match table.get(&key) {
                    Some(matches) if !matches.is_empty() => {
                        for right_tuple in matches {
                            emit(&spec.join(&tuple, right_tuple))?;
                        }
                    }
                    _ => {
                        if outer {
                            emit(&spec.outer_join(&tuple))?;
                        }
                    }
                }
            }
            (Partition::Spilled { left_file, current, .. }, None) => {
                if left_file.is_none() {
                    *left_file = Some(TempFile::create(temp_dir, &format!("hjoin-l-d{depth}-p{h}"))?);
                }
                if current.full() {
                    current.write_to(left_file.as_mut().expect("just set").file_mut())?;
                    current.clear();
                }
                current.append(&tuple)?;
            }
            _ => unreachable!("partitions and tables are built with matching shapes"),
        }
    }

    // Flush any still-buffered left-side tail pages before recursing.
    for partition in partitions.iter_mut() {
        if let Partition::Spilled { left_file, current, .. } = partition {
            if let Some(left_file) = left_file {
                if !current.empty() {
                    current.write_to(left_file.file_mut())?;
                    current.clear();
                }
            }
        }
    }

    // Phase 4: recursively re-join spilled partition pairs with a larger N.
    for partition in partitions {
        if let Partition::Spilled { right_file, left_file, .. } = partition {
            let Some(left_file) = left_file else {
                // No probe tuple ever hashed here: nothing to join.
                continue;
            };
            let page_size = pool.page_size();
            let right_source: Box<dyn TupleSource> = Box::new(FileTupleSource::new(
                right_file.reopen_read()?,
                pool.clone(),
                spec.right_tuple_size(),
                page_size,
            ));
            let left_source: Box<dyn TupleSource> = Box::new(FileTupleSource::new(
                left_file.reopen_read()?,
                pool.clone(),
                spec.left_tuple_size(),
                page_size,
            ));
            run_core(
                left_source,
                right_source,
                spec,
                outer,
                distinct,
                num_partitions * 2,
                page_quota,
                pool,
                temp_dir,
                depth + 1,
                emit,
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::pool::MallocPagePool;

    /// Tuples are `(i32 key, u8 tag)` packed into 5 bytes; join output packs
    /// `(left_tag, right_tag)` as 2 bytes for easy assertions.
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

    fn run_join(
        left_rows: &[(i32, u8)],
        right_rows: &[(i32, u8)],
        outer: bool,
        distinct: bool,
    ) -> Vec<(u8, u8)> {
        let pool = MallocPagePool::shared(256);
        let left = TupleFifo::new(pool.clone(), 5, 8, 1);
        for (k, t) in left_rows {
            left.append(&tuple(*k, *t)).unwrap();
        }
        left.send_eof().unwrap();

        let right = TupleFifo::new(pool.clone(), 5, 8, 1);
        for (k, t) in right_rows {
            right.append(&tuple(*k, *t)).unwrap();
        }
        right.send_eof().unwrap();

        let dir = std::env::temp_dir().join("flowstage-hashjoin-test");
        let op = HashJoinOperator::new(
            left,
            right,
            Arc::new(TagJoin),
            outer,
            distinct,
            4,
            2,
            pool.clone(),
            dir,
        );

        let output = TupleFifo::new(pool, 2, 16, 1);
        let dispatcher = Dispatcher::new();
        let adaptor = crate::adaptor::StageAdaptor::new(output.clone(), None, None);
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
    fn inner_join_produces_exact_multiset() {
        // left [(1,'a'),(2,'b'),(1,'c')], right [(1,'x'),(3,'y'),(1,'z')]
        let left = [(1, b'a'), (2, b'b'), (1, b'c')];
        let right = [(1, b'x'), (3, b'y'), (1, b'z')];
        let mut out = run_join(&left, &right, false, false);
        out.sort();
        let mut expected = vec![
            (b'a', b'x'),
            (b'a', b'z'),
            (b'c', b'x'),
            (b'c', b'z'),
        ];
        expected.sort();
        assert_eq!(out, expected);
    }

    #[test]
    fn outer_join_adds_unmatched_left_tuples() {
        let left = [(1, b'a'), (2, b'b'), (1, b'c')];
        let right = [(1, b'x'), (3, b'y'), (1, b'z')];
        let out = run_join(&left, &right, true, false);
        assert!(out.contains(&(b'b', 0)));
        assert_eq!(out.iter().filter(|&&(l, _)| l == b'a').count(), 2);
    }

    #[test]
    fn join_still_works_when_partitions_spill() {
        // num_partitions=4, page_quota=2 forces spills once more than 2
        // pages are resident; exercise with enough rows to guarantee it.
        let right: Vec<(i32, u8)> = (0..200).map(|i| (i % 37, b'r')).collect();
        let left: Vec<(i32, u8)> = (0..50).map(|i| (i % 37, b'l')).collect();
        let out = run_join(&left, &right, false, false);
        let expected_count = left
            .iter()
            .map(|(lk, _)| right.iter().filter(|(rk, _)| rk == lk).count())
            .sum::<usize>();
        assert_eq!(out.len(), expected_count);
    }

    #[test]
    fn distinct_keeps_first_right_occurrence_only() {
        let left = [(1, b'a')];
        let right = [(1, b'x'), (1, b'y')];
        let out = run_join(&left, &right, false, true);
        assert_eq!(out.len(), 1);
    }
}
