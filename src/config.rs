use std::path::PathBuf;

/// Process-wide knobs for the execution core.
///
/// Mirrors the teacher's top-level `Config`: a single struct handed to
/// constructors rather than scattered globals (see Design Notes on
/// re-expressing global mutable state as a context object).
#[derive(Debug, Clone)]
pub struct Config {
    /// Default page size for pools that don't override it explicitly.
    pub page_size: usize,
    /// Directory temp-file helpers create spill files in.
    pub temp_dir: PathBuf,
    /// Bound on the number of full pages a `TupleFifo` may queue.
    pub fifo_max_pages: usize,
    /// Hysteresis threshold: pages of progress required before a sleeping
    /// side resumes.
    pub fifo_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: crate::page::DEFAULT_PAGE_SIZE,
            temp_dir: std::env::temp_dir().join("flowstage"),
            fifo_max_pages: 8,
            fifo_threshold: 3,
        }
    }
}
