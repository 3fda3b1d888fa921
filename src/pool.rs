//! Page pool allocator strategies (spec §4.1).

use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{FlowError, Result};
use crate::page::{capacity_for, Page, PageStorage};

/// Allocates and frees fixed-size page frames.
///
/// `alloc_storage`/`free_storage` are the pool-specific primitives; use the
/// free function [`alloc`] to get a fully-formed [`Page`] that carries a
/// back-reference to its owning pool, so `Page::drop` can call
/// `free_storage` without the caller needing to remember which pool produced
/// the page.
pub trait PagePool: Send + Sync + std::fmt::Debug {
    fn page_size(&self) -> usize;

    fn alloc_storage(&self, tuple_size: usize) -> Result<PageStorage>;

    /// Returns a page's storage to the pool. Called by `Page::drop`.
    fn free_storage(&self, storage: PageStorage);
}

/// Allocates a page from `pool`, tagged with a back-reference so it can
/// free itself on drop.
///
/// Every real page, from whichever pool, is minted here, so this is also
/// where the process-wide default page size latches: calling
/// `default_page_size()` for its side effect means `set_default_page_size`
/// can no longer succeed once the first page anywhere has been created,
/// even if that page came from a `MallocPagePool`/`MmapPagePool` built with
/// its own explicit size rather than the default.
pub fn alloc(pool: &Arc<dyn PagePool>, tuple_size: usize) -> Result<Page> {
    let _ = crate::page::default_page_size();
    let storage = pool.alloc_storage(tuple_size)?;
    let capacity = capacity_for(pool.page_size(), tuple_size);
    Ok(Page::new(pool.clone(), storage, tuple_size, capacity))
}

/// Thin wrapper over the system allocator.
#[derive(Debug)]
pub struct MallocPagePool {
    page_size: usize,
}

impl MallocPagePool {
    pub fn new(page_size: usize) -> Self {
        Self { page_size }
    }

    pub fn shared(page_size: usize) -> Arc<dyn PagePool> {
        Arc::new(Self::new(page_size))
    }
}

impl PagePool for MallocPagePool {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn alloc_storage(&self, tuple_size: usize) -> Result<PageStorage> {
        let capacity = capacity_for(self.page_size, tuple_size);
        Ok(PageStorage::Heap(
            vec![0u8; capacity * tuple_size].into_boxed_slice(),
        ))
    }

    fn free_storage(&self, _storage: PageStorage) {}
}

/// Hands out a single page that is simultaneously empty, full, and at EOF
/// (spec §4.1 sentinel page). All instances are value-equivalent, so unlike
/// the original's single static page, this pool mints a fresh zero-capacity
/// page per call — indistinguishable to callers since a sentinel page never
/// carries data.
#[derive(Debug)]
pub struct SentinelPagePool {
    page_size: usize,
}

impl SentinelPagePool {
    pub fn new(page_size: usize) -> Self {
        Self { page_size }
    }
}

fn shared_sentinel_pool() -> &'static Arc<dyn PagePool> {
    static POOL: OnceLock<Arc<dyn PagePool>> = OnceLock::new();
    POOL.get_or_init(|| Arc::new(SentinelPagePool::new(crate::page::default_page_size())))
}

/// Returns a shared sentinel-pool handle, used to mint sentinel pages
/// without every fifo needing to own its own instance.
pub fn sentinel_pool() -> Arc<dyn PagePool> {
    shared_sentinel_pool().clone()
}

impl PagePool for SentinelPagePool {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn alloc_storage(&self, _tuple_size: usize) -> Result<PageStorage> {
        Ok(PageStorage::Sentinel)
    }

    fn free_storage(&self, _storage: PageStorage) {}
}

/// mmap-backed pool: allocates anonymous memory in ~1008 KiB chunks,
/// carving pages off a contiguous "available" region and coalescing freed
/// pages into a contiguous "free" region to amortize `munmap` calls.
pub struct MmapPagePool {
    page_size: usize,
    inner: Mutex<MmapRegions>,
    outstanding: AtomicUsize,
}

struct MmapRegions {
    available_start: *mut u8,
    available_end: *mut u8,
    free_start: *mut u8,
    free_end: *mut u8,
}

// SAFETY: all access to the raw pointers goes through `inner`'s mutex.
unsafe impl Send for MmapRegions {}
unsafe impl Sync for MmapRegions {}

const MMAP_CHUNK_BYTES: usize = 1008 * 1024;

impl MmapPagePool {
    pub fn new(page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            page_size,
            inner: Mutex::new(MmapRegions {
                available_start: null_mut(),
                available_end: null_mut(),
                free_start: null_mut(),
                free_end: null_mut(),
            }),
            outstanding: AtomicUsize::new(0),
        })
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    unsafe fn unmap(start: *mut u8, end: *mut u8) {
        if start.is_null() || start == end {
            return;
        }
        libc::munmap(start as *mut libc::c_void, end as usize - start as usize);
    }
}

impl std::fmt::Debug for MmapPagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapPagePool")
            .field("page_size", &self.page_size)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl PagePool for MmapPagePool {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn alloc_storage(&self, _tuple_size: usize) -> Result<PageStorage> {
        let mut regions = self.inner.lock();
        if regions.available_start == regions.available_end {
            if regions.free_start != regions.free_end {
                regions.available_start = regions.free_start;
                regions.available_end = regions.free_end;
                regions.free_start = null_mut();
                regions.free_end = null_mut();
            } else {
                let ptr = unsafe {
                    libc::mmap(
                        null_mut(),
                        MMAP_CHUNK_BYTES,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANON,
                        -1,
                        0,
                    )
                };
                if ptr == libc::MAP_FAILED {
                    return Err(FlowError::AllocationFailure(
                        "mmap() failed for page pool chunk".into(),
                    ));
                }
                regions.available_start = ptr as *mut u8;
                regions.available_end =
                    unsafe { regions.available_start.add(MMAP_CHUNK_BYTES) };
            }
        }

        let next = regions.available_start;
        regions.available_start = unsafe { next.add(self.page_size) };
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(PageStorage::Mmap {
            ptr: next,
            len: self.page_size,
        })
    }

    fn free_storage(&self, storage: PageStorage) {
        let (ptr, len) = match storage {
            PageStorage::Mmap { ptr, len } => (ptr, len),
            _ => return,
        };

        let mut regions = self.inner.lock();
        if regions.free_end != ptr {
            unsafe { Self::unmap(regions.free_start, regions.free_end) };
            regions.free_start = ptr;
            regions.free_end = ptr;
        }
        regions.free_end = unsafe { regions.free_end.add(len) };

        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Outstanding count just hit zero: there is no in-flight page
            // left anywhere, so both regions can be released now instead of
            // waiting for the pool object itself to be dropped.
            unsafe {
                Self::unmap(regions.available_start, regions.available_end);
                Self::unmap(regions.free_start, regions.free_end);
            }
            regions.available_start = null_mut();
            regions.available_end = null_mut();
            regions.free_start = null_mut();
            regions.free_end = null_mut();
        }
    }
}

impl Drop for MmapPagePool {
    fn drop(&mut self) {
        let regions = self.inner.get_mut();
        unsafe {
            Self::unmap(regions.available_start, regions.available_end);
            Self::unmap(regions.free_start, regions.free_end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_pool_round_trip() {
        let pool: Arc<dyn PagePool> = MallocPagePool::shared(256);
        let page = alloc(&pool, 4).unwrap();
        assert!(page.empty());
        drop(page);
    }

    #[test]
    fn sentinel_pool_always_yields_sentinel() {
        let pool: Arc<dyn PagePool> = Arc::new(SentinelPagePool::new(256));
        let page = alloc(&pool, 4).unwrap();
        assert!(page.empty());
        assert!(page.full());
    }

    #[test]
    fn mmap_pool_tracks_outstanding_and_drains() {
        let pool = MmapPagePool::new(4096);
        let dyn_pool: Arc<dyn PagePool> = pool.clone();
        let p1 = alloc(&dyn_pool, 8).unwrap();
        let p2 = alloc(&dyn_pool, 8).unwrap();
        assert_eq!(pool.outstanding(), 2);
        drop(p1);
        assert_eq!(pool.outstanding(), 1);
        drop(p2);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn mmap_pool_recycles_across_chunks() {
        let pool = MmapPagePool::new(4096);
        let dyn_pool: Arc<dyn PagePool> = pool.clone();
        // Allocate enough pages to span more than one ~1008KiB chunk and
        // free them all; outstanding must return to zero.
        let mut pages = Vec::new();
        for _ in 0..300 {
            pages.push(alloc(&dyn_pool, 8).unwrap());
        }
        assert_eq!(pool.outstanding(), 300);
        pages.clear();
        assert_eq!(pool.outstanding(), 0);
    }
}
