//! Per-running-packet I/O surface (spec §3/§4.3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::fifo::TupleFifo;
use crate::packet::OutputFilter;
use crate::page::Page;

struct Follower {
    output: Arc<TupleFifo>,
    filter: Option<OutputFilter>,
}

/// Mediates `output`/`output_page` and fan-out to merged followers. One
/// instance per running packet; destroyed once `process_packet` returns.
pub struct StageAdaptor {
    host_output: Arc<TupleFifo>,
    host_filter: Option<OutputFilter>,
    merge_tag: Option<String>,
    accepting: AtomicBool,
    followers: Mutex<Vec<Follower>>,
}

impl StageAdaptor {
    pub fn new(
        host_output: Arc<TupleFifo>,
        host_filter: Option<OutputFilter>,
        merge_tag: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            host_output,
            host_filter,
            merge_tag,
            accepting: AtomicBool::new(true),
            followers: Mutex::new(Vec::new()),
        })
    }

    pub fn merge_tag(&self) -> Option<&str> {
        self.merge_tag.as_deref()
    }

    /// Attaches a newcomer packet's fifo as a follower of this host. Returns
    /// `false` once the host has stopped accepting mergers (its operator
    /// body has already returned).
    pub fn attach_follower(&self, output: Arc<TupleFifo>, filter: Option<OutputFilter>) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }
        let mut followers = self.followers.lock();
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }
        followers.push(Follower { output, filter });
        true
    }

    fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Writes one tuple to the host output and, after evaluating each
    /// follower's own filter, to every follower's fifo too.
    pub fn output(&self, tuple: &[u8]) -> Result<()> {
        if let Some(out) = Self::apply(&self.host_filter, tuple) {
            self.host_output.append(&out)?;
        }
        for follower in self.followers.lock().iter() {
            if let Some(out) = Self::apply(&follower.filter, tuple) {
                follower.output.append(&out)?;
            }
        }
        Ok(())
    }

    /// Writes a whole page's tuples at once.
    pub fn output_page(&self, page: &Page) -> Result<()> {
        for tuple in page.iter() {
            self.output(tuple)?;
        }
        Ok(())
    }

    fn apply(filter: &Option<OutputFilter>, tuple: &[u8]) -> Option<Vec<u8>> {
        match filter {
            Some(f) => f(tuple),
            None => Some(tuple.to_vec()),
        }
    }

    /// Clean completion: closes the host output and every follower's.
    pub fn close(&self) {
        self.stop_accepting();
        let _ = self.host_output.send_eof();
        for follower in self.followers.lock().iter() {
            let _ = follower.output.send_eof();
        }
    }

    /// Failure path: terminates the host output and every follower's.
    pub fn terminate(&self) {
        self.stop_accepting();
        self.host_output.terminate();
        for follower in self.followers.lock().iter() {
            follower.output.terminate();
        }
    }
}
