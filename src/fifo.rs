//! Paged bounded SPSC channel between a writer and a reader context
//! (spec §3/§4.2).

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{FlowError, Result};
use crate::page::Page;
use crate::pool::{self, PagePool};
use crate::stats;

struct Inner {
    pages: VecDeque<Page>,
    write_page: Page,
    read_page: Page,
    read_idx: usize,
    curr_pages: usize,
    done_writing: bool,
    terminated: bool,
}

impl Inner {
    fn available_writes(&self, max_pages: usize) -> usize {
        max_pages.saturating_sub(self.curr_pages)
    }
}

/// A paged, bounded, ordered queue between exactly one writer and one
/// reader. Sharable via `Arc` so both sides can hold a handle.
pub struct TupleFifo {
    inner: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Condvar,
    pool: Arc<dyn PagePool>,
    tuple_size: usize,
    max_pages: usize,
    threshold: usize,
}

impl TupleFifo {
    pub fn new(
        pool: Arc<dyn PagePool>,
        tuple_size: usize,
        max_pages: usize,
        threshold: usize,
    ) -> Arc<Self> {
        let sentinel = pool::sentinel_pool();
        stats::fifo_opened();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                pages: VecDeque::new(),
                write_page: Page::sentinel(sentinel.clone(), tuple_size),
                read_page: Page::sentinel(sentinel, tuple_size),
                read_idx: 0,
                curr_pages: 0,
                done_writing: false,
                terminated: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            pool,
            tuple_size,
            max_pages,
            threshold,
        })
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    /// Copy-writes a tuple into the write page, publishing and rotating the
    /// page first if it is full. Errs if the fifo is terminated or `done
    /// writing` has already been announced.
    pub fn append(&self, tuple: &[u8]) -> Result<()> {
        let mut st = self.inner.lock();
        if st.terminated {
            return Err(FlowError::TerminatedFifo);
        }
        if st.done_writing {
            return Err(FlowError::ContractViolation(
                "append called on a fifo that already sent EOF".into(),
            ));
        }
        if st.write_page.full() {
            self.publish_write_page(&mut st, false)?;
        }
        st.write_page.append(tuple)
    }

    /// Publishes any partial write page, marks the fifo done-writing, and
    /// wakes the reader. Unlike the original, this returns control to the
    /// caller instead of handing off to a cooperative reader context that
    /// never returns (see Design Notes on re-expressing context switches as
    /// OS threads).
    pub fn send_eof(&self) -> Result<()> {
        let mut st = self.inner.lock();
        if st.terminated {
            return Err(FlowError::TerminatedFifo);
        }
        if st.done_writing {
            return Err(FlowError::ContractViolation(
                "send_eof called twice on the same fifo".into(),
            ));
        }
        self.publish_write_page(&mut st, true)
    }

    /// Marks the fifo terminated and wakes both sides. Returns `false` if
    /// EOF was already sent (the reader owns teardown) or termination was
    /// already requested.
    pub fn terminate(&self) -> bool {
        let mut st = self.inner.lock();
        if st.terminated || st.done_writing {
            return false;
        }
        st.terminated = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        true
    }

    /// Dequeues the next tuple into `out`. Returns `Ok(false)` at EOF.
    pub fn get_tuple(&self, out: &mut Vec<u8>) -> Result<bool> {
        let mut st = self.inner.lock();
        loop {
            if st.terminated {
                return Err(FlowError::TerminatedFifo);
            }
            if st.read_idx < st.read_page.tuple_count() {
                out.clear();
                out.extend_from_slice(st.read_page.get(st.read_idx));
                st.read_idx += 1;
                return Ok(true);
            }
            if !self.fetch_read_page(&mut st)? {
                return Ok(false);
            }
        }
    }

    /// Hands the reader an entire full page, replacing the internal read
    /// page with the sentinel. Only valid at a page boundary: the current
    /// read page must not have had any of its tuples consumed yet.
    pub fn get_page(&self) -> Result<Option<Page>> {
        let mut st = self.inner.lock();
        if st.terminated {
            return Err(FlowError::TerminatedFifo);
        }
        if st.read_idx >= st.read_page.tuple_count() && !self.fetch_read_page(&mut st)? {
            return Ok(None);
        }
        if st.read_idx != 0 {
            return Err(FlowError::ContractViolation(
                "get_page called off a page boundary".into(),
            ));
        }
        let sentinel = Page::sentinel(pool::sentinel_pool(), self.tuple_size);
        let page = std::mem::replace(&mut st.read_page, sentinel);
        Ok(Some(page))
    }

    fn publish_write_page(&self, st: &mut MutexGuard<'_, Inner>, done: bool) -> Result<()> {
        if st.terminated {
            return Err(FlowError::TerminatedFifo);
        }

        // Space for one page must be free; once we've slept because of a
        // full buffer, `threshold` pages must be free before we try again.
        let mut threshold = 1usize;
        while st.available_writes(self.max_pages) < threshold {
            self.not_full.wait(st);
            if st.terminated {
                return Err(FlowError::TerminatedFifo);
            }
            threshold = self.threshold;
        }

        if !st.write_page.empty() {
            let sentinel = Page::sentinel(pool::sentinel_pool(), self.tuple_size);
            let full_page = std::mem::replace(&mut st.write_page, sentinel);
            st.pages.push_back(full_page);
            st.curr_pages += 1;
            stats::page_enqueued();
        }

        if done {
            st.done_writing = true;
        } else {
            st.write_page = pool::alloc(&self.pool, self.tuple_size)?;
        }

        if st.curr_pages >= self.threshold || done {
            self.not_empty.notify_one();
        }
        Ok(())
    }

    fn fetch_read_page(&self, st: &mut MutexGuard<'_, Inner>) -> Result<bool> {
        if st.terminated {
            return Err(FlowError::TerminatedFifo);
        }

        let mut threshold = 1usize;
        while !st.done_writing && st.curr_pages < threshold {
            self.not_empty.wait(st);
            if st.terminated {
                return Err(FlowError::TerminatedFifo);
            }
            threshold = self.threshold;
        }

        if st.curr_pages == 0 {
            debug_assert!(st.done_writing);
            return Ok(false);
        }

        let page = st
            .pages
            .pop_front()
            .expect("curr_pages tracks pages.len()");
        st.read_page = page;
        st.read_idx = 0;
        st.curr_pages -= 1;

        if st.available_writes(self.max_pages) >= self.threshold && !st.done_writing {
            self.not_full.notify_one();
        }
        Ok(true)
    }
}

impl Drop for TupleFifo {
    fn drop(&mut self) {
        stats::fifo_closed();
    }
}
