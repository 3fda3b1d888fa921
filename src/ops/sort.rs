//! External sort: run generation, leveled run merging, final merge
//! (spec §4.5).

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::fifo::TupleFifo;
use crate::packet::{ExecCtx, Operator, OperatorKind};
use crate::page::capacity_for;
use crate::pool::{self, PagePool};
use crate::tempio::TempFile;

use super::merge::{FileTupleSource, KWayMerger, TupleSource};

pub trait SortSpec: Send + Sync + 'static {
    fn tuple_size(&self) -> usize;
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

pub struct SortOperator {
    input: Arc<TupleFifo>,
    spec: Arc<dyn SortSpec>,
    pages_per_run: usize,
    merge_factor: usize,
    pool: Arc<dyn PagePool>,
    temp_dir: std::path::PathBuf,
}

impl SortOperator {
    pub fn new(
        input: Arc<TupleFifo>,
        spec: Arc<dyn SortSpec>,
        pages_per_run: usize,
        merge_factor: usize,
        pool: Arc<dyn PagePool>,
        temp_dir: std::path::PathBuf,
    ) -> Self {
        Self {
            input,
            spec,
            pages_per_run: pages_per_run.max(1),
            merge_factor: merge_factor.max(2),
            pool,
            temp_dir,
        }
    }
}

impl Operator for SortOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Sort
    }

    fn run(self: Box<Self>, ctx: &ExecCtx) -> Result<()> {
        let result = self.run_inner(ctx);
        if result.is_err() {
            self.input.terminate();
        }
        result
    }
}

impl SortOperator {
    fn run_inner(&self, ctx: &ExecCtx) -> Result<()> {
        let tuple_size = self.spec.tuple_size();
        let run_capacity = self.pages_per_run * capacity_for(self.pool.page_size(), tuple_size).max(1);

        let mut levels: Vec<Vec<TempFile>> = Vec::new();
        let mut buf = Vec::new();
        let mut run: Vec<Vec<u8>> = Vec::with_capacity(run_capacity);

        loop {
            let more = self.input.get_tuple(&mut buf)?;
            if more {
                run.push(buf.clone());
            }
            if run.len() >= run_capacity || (!more && !run.is_empty()) {
                let file = self.spill_run(std::mem::take(&mut run))?;
                self.promote(&mut levels, file)?;
            }
            if !more {
                break;
            }
        }

        let remaining: Vec<TempFile> = levels.into_iter().flatten().collect();
        match remaining.len() {
            0 => {}
            1 => {
                let mut file = remaining.into_iter().next().expect("checked len == 1");
                self.stream_file(&mut file, &mut |tuple| ctx.adaptor.output(tuple))?;
            }
            _ => {
                self.merge_into(remaining, &mut |tuple| ctx.adaptor.output(tuple))?;
            }
        }

        Ok(())
    }

    /// Sorts `tuples` in memory and spills them as one run file.
    fn spill_run(&self, mut tuples: Vec<Vec<u8>>) -> Result<TempFile> {
        tuples.sort_by(|a, b| self.spec.compare(a, b));
        let tuple_size = self.spec.tuple_size();
        let mut file = TempFile::create(&self.temp_dir, "sort-run")?;
        let mut page = pool::alloc(&self.pool, tuple_size)?;
        for tuple in &tuples {
            if page.full() {
                page.write_to(file.file_mut())?;
                page.clear();
            }
            page.append(tuple)?;
        }
        if !page.empty() {
            page.write_to(file.file_mut())?;
        }
        Ok(file)
    }

    /// Eagerly folds finished levels once they reach `merge_factor` files,
    /// checked after every run (spec §7 open question: eager over lazy).
    fn promote(&self, levels: &mut Vec<Vec<TempFile>>, file: TempFile) -> Result<()> {
        let mut level = 0;
        let mut carry = Some(file);
        while let Some(f) = carry.take() {
            if levels.len() <= level {
                levels.push(Vec::new());
            }
            levels[level].push(f);
            if levels[level].len() >= self.merge_factor {
                let files = std::mem::take(&mut levels[level]);
                carry = Some(self.merge_files(files)?);
                level += 1;
            }
        }
        Ok(())
    }

    fn merge_files(&self, files: Vec<TempFile>) -> Result<TempFile> {
        let tuple_size = self.spec.tuple_size();
        let mut out = TempFile::create(&self.temp_dir, "sort-merge")?;
        let mut page = pool::alloc(&self.pool, tuple_size)?;
        self.merge_into(files, &mut |tuple: &[u8]| {
            if page.full() {
                page.write_to(out.file_mut())?;
                page.clear();
            }
            page.append(tuple)
        })?;
        if !page.empty() {
            page.write_to(out.file_mut())?;
        }
        Ok(out)
    }

    fn merge_into(&self, files: Vec<TempFile>, emit: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        let tuple_size = self.spec.tuple_size();
        let page_size = self.pool.page_size();
        let spec = self.spec.clone();
        let compare: Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync> =
            Arc::new(move |a: &[u8], b: &[u8]| spec.compare(a, b));

        let mut sources = Vec::with_capacity(files.len());
        for file in &files {
            sources.push(FileTupleSource::new(
                file.reopen_read()?,
                self.pool.clone(),
                tuple_size,
                page_size,
            ));
        }
        let merger = KWayMerger::new(sources, compare)?;
        merger.drain_into(|tuple| emit(tuple))
    }

    fn stream_file(&self, file: &mut TempFile, emit: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        let mut source = FileTupleSource::new(
            file.reopen_read()?,
            self.pool.clone(),
            self.spec.tuple_size(),
            self.pool.page_size(),
        );
        while let Some(tuple) = source.next()? {
            emit(&tuple)?;
        }
        Ok(())
    }
}
