//! Fixed-size tuple pages (spec §3/§4.1).
//!
//! A `Page` is a fixed-capacity array of flat, fixed-width tuples owned by a
//! `PagePool`. The intrusive "next" pointer the original design uses to
//! thread pages into lists is deliberately not present here — callers hold
//! pages in `Vec<Page>`/`VecDeque<Page>` instead (see Design Notes on
//! re-expressing intrusive pointers as owning containers).

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{FlowError, Result};
use crate::pool::PagePool;

pub const DEFAULT_PAGE_SIZE: usize = 8192;
const PAGE_HEADER_BYTES: usize = 8; // tuple_count: u32, tuple_size: u32

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
static PAGE_SIZE_LOCKED: AtomicBool = AtomicBool::new(false);

/// Sets the process-wide default page size. Must be called before any page
/// is created; a second call (or a call after the default has already been
/// read) is a contract violation.
pub fn set_default_page_size(size: usize) -> Result<()> {
    if PAGE_SIZE_LOCKED.swap(true, Ordering::SeqCst) {
        return Err(FlowError::ContractViolation(
            "set_default_page_size called after the default page size was fixed".into(),
        ));
    }
    PAGE_SIZE.store(size, Ordering::SeqCst);
    Ok(())
}

/// Reads (and locks in) the process-wide default page size.
pub fn default_page_size() -> usize {
    PAGE_SIZE_LOCKED.store(true, Ordering::SeqCst);
    match PAGE_SIZE.load(Ordering::SeqCst) {
        0 => DEFAULT_PAGE_SIZE,
        n => n,
    }
}

/// Number of tuples of `tuple_size` that fit in a page of `page_size` bytes,
/// leaving room for the on-disk header.
pub fn capacity_for(page_size: usize, tuple_size: usize) -> usize {
    if tuple_size == 0 {
        return 0;
    }
    page_size.saturating_sub(PAGE_HEADER_BYTES) / tuple_size
}

#[derive(Debug)]
pub enum PageStorage {
    Heap(Box<[u8]>),
    Mmap { ptr: *mut u8, len: usize },
    Sentinel,
}

// SAFETY: the raw pointer in `Mmap` only ever refers to memory owned by the
// `MmapPagePool` that handed it out, freed exactly once via `PagePool::free`.
unsafe impl Send for PageStorage {}

/// A fixed-size frame holding up to `capacity` fixed-width tuples.
///
/// A page whose `capacity` is zero (the sentinel page) is simultaneously
/// empty, full, and at its own end — see [`Page::sentinel`].
pub struct Page {
    pool: Arc<dyn PagePool>,
    storage: PageStorage,
    tuple_size: usize,
    tuple_count: usize,
    capacity: usize,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("tuple_size", &self.tuple_size)
            .field("tuple_count", &self.tuple_count)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Page {
    pub(crate) fn new(
        pool: Arc<dyn PagePool>,
        storage: PageStorage,
        tuple_size: usize,
        capacity: usize,
    ) -> Self {
        Self {
            pool,
            storage,
            tuple_size,
            tuple_count: 0,
            capacity,
        }
    }

    /// The distinguished sentinel page: `empty() && full() && begin() == end()`.
    pub fn sentinel(pool: Arc<dyn PagePool>, tuple_size: usize) -> Self {
        Self {
            pool,
            storage: PageStorage::Sentinel,
            tuple_size,
            tuple_count: 0,
            capacity: 0,
        }
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    pub fn tuple_count(&self) -> usize {
        self.tuple_count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn full(&self) -> bool {
        self.tuple_count >= self.capacity
    }

    pub fn empty(&self) -> bool {
        self.tuple_count == 0
    }

    pub fn clear(&mut self) {
        self.tuple_count = 0;
    }

    /// Appends a tuple. The caller must check `full()` first; appending past
    /// capacity is a contract violation.
    pub fn append(&mut self, tuple: &[u8]) -> Result<()> {
        if tuple.len() != self.tuple_size {
            return Err(FlowError::ContractViolation(format!(
                "tuple of {} bytes does not match page tuple size {}",
                tuple.len(),
                self.tuple_size
            )));
        }
        if self.full() {
            return Err(FlowError::ContractViolation(
                "append on a full page".into(),
            ));
        }
        let offset = self.tuple_count * self.tuple_size;
        match &mut self.storage {
            PageStorage::Heap(buf) => buf[offset..offset + self.tuple_size].copy_from_slice(tuple),
            PageStorage::Mmap { ptr, .. } => unsafe {
                std::ptr::copy_nonoverlapping(tuple.as_ptr(), ptr.add(offset), self.tuple_size);
            },
            PageStorage::Sentinel => unreachable!("sentinel page is always full"),
        }
        self.tuple_count += 1;
        Ok(())
    }

    pub fn get(&self, idx: usize) -> &[u8] {
        assert!(idx < self.tuple_count, "tuple index out of range");
        let offset = idx * self.tuple_size;
        match &self.storage {
            PageStorage::Heap(buf) => &buf[offset..offset + self.tuple_size],
            PageStorage::Mmap { ptr, .. } => unsafe {
                std::slice::from_raw_parts(ptr.add(offset), self.tuple_size)
            },
            PageStorage::Sentinel => &[],
        }
    }

    pub fn iter(&self) -> PageIter<'_> {
        PageIter { page: self, idx: 0 }
    }

    /// Writes the whole page image (header included) to `w`, padded to the
    /// owning pool's page size. This is the unit of temp-file I/O (spec §6).
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let page_size = self.pool.page_size();
        let mut buf = vec![0u8; page_size];
        buf[0..4].copy_from_slice(&(self.tuple_count as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&(self.tuple_size as u32).to_le_bytes());
        for i in 0..self.tuple_count {
            let off = PAGE_HEADER_BYTES + i * self.tuple_size;
            buf[off..off + self.tuple_size].copy_from_slice(self.get(i));
        }
        w.write_all(&buf)?;
        Ok(())
    }

    /// Reads one whole page image back from `r`. Returns `Ok(None)` at EOF.
    pub fn read_from<R: Read>(
        r: &mut R,
        pool: Arc<dyn PagePool>,
        tuple_size: usize,
        page_size: usize,
    ) -> Result<Option<Page>> {
        let mut buf = vec![0u8; page_size];
        let mut read_total = 0;
        while read_total < page_size {
            let n = r.read(&mut buf[read_total..])?;
            if n == 0 {
                if read_total == 0 {
                    return Ok(None);
                }
                return Err(FlowError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "truncated page image",
                )));
            }
            read_total += n;
        }
        let tuple_count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let stored_tuple_size = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        if stored_tuple_size != tuple_size {
            return Err(FlowError::ContractViolation(format!(
                "page image tuple size {} does not match expected {}",
                stored_tuple_size, tuple_size
            )));
        }
        let capacity = capacity_for(page_size, tuple_size);
        let mut page = crate::pool::alloc(&pool, tuple_size)?;
        page.capacity = capacity.max(tuple_count);
        for i in 0..tuple_count {
            let off = PAGE_HEADER_BYTES + i * tuple_size;
            page.append(&buf[off..off + tuple_size])?;
        }
        Ok(Some(page))
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let storage = std::mem::replace(&mut self.storage, PageStorage::Sentinel);
        if !matches!(storage, PageStorage::Sentinel) {
            self.pool.free_storage(storage);
        }
    }
}

pub struct PageIter<'a> {
    page: &'a Page,
    idx: usize,
}

impl<'a> Iterator for PageIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.page.tuple_count {
            return None;
        }
        let t = self.page.get(self.idx);
        self.idx += 1;
        Some(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MallocPagePool;

    #[test]
    fn append_and_iterate() {
        let pool: Arc<dyn PagePool> = Arc::new(MallocPagePool::new(256));
        let mut page = crate::pool::alloc(&pool, 4).unwrap();
        assert!(page.empty());
        page.append(&1i32.to_le_bytes()).unwrap();
        page.append(&2i32.to_le_bytes()).unwrap();
        assert_eq!(page.tuple_count(), 2);
        let vals: Vec<i32> = page
            .iter()
            .map(|t| i32::from_le_bytes(t.try_into().unwrap()))
            .collect();
        assert_eq!(vals, vec![1, 2]);
    }

    #[test]
    fn full_rejects_overflow() {
        let pool: Arc<dyn PagePool> = Arc::new(MallocPagePool::new(16));
        let mut page = crate::pool::alloc(&pool, 4).unwrap();
        while !page.full() {
            page.append(&0i32.to_le_bytes()).unwrap();
        }
        assert!(page.append(&0i32.to_le_bytes()).is_err());
    }

    #[test]
    fn sentinel_is_always_empty_and_full() {
        let pool: Arc<dyn PagePool> = Arc::new(MallocPagePool::new(256));
        let page = Page::sentinel(pool, 4);
        assert!(page.empty());
        assert!(page.full());
        assert_eq!(page.iter().count(), 0);
    }

    #[test]
    fn set_default_page_size_after_a_page_exists_is_a_contract_violation() {
        let pool: Arc<dyn PagePool> = Arc::new(MallocPagePool::new(64));
        let _page = crate::pool::alloc(&pool, 4).unwrap();
        assert!(set_default_page_size(128).is_err());
    }

    #[test]
    fn round_trips_through_bytes() {
        let pool: Arc<dyn PagePool> = Arc::new(MallocPagePool::new(64));
        let mut page = crate::pool::alloc(&pool, 4).unwrap();
        page.append(&7i32.to_le_bytes()).unwrap();
        page.append(&9i32.to_le_bytes()).unwrap();
        let mut bytes = Vec::new();
        page.write_to(&mut bytes).unwrap();

        let mut cursor = std::io::Cursor::new(bytes);
        let read_back = Page::read_from(&mut cursor, pool.clone(), 4, 64).unwrap().unwrap();
        let vals: Vec<i32> = read_back
            .iter()
            .map(|t| i32::from_le_bytes(t.try_into().unwrap()))
            .collect();
        assert_eq!(vals, vec![7, 9]);
    }
}
