//! Small stateful and I/O shims exercising the same operator contract
//! (spec §4.7).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::fifo::TupleFifo;
use crate::packet::{ExecCtx, Operator, OperatorKind};
use crate::page::Page;
use crate::pool::PagePool;

/// Copies an input fifo to the output, one whole page at a time.
pub struct EchoOperator {
    input: Arc<TupleFifo>,
}

impl EchoOperator {
    pub fn new(input: Arc<TupleFifo>) -> Self {
        Self { input }
    }
}

impl Operator for EchoOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Echo
    }

    fn run(self: Box<Self>, ctx: &ExecCtx) -> Result<()> {
        while let Some(page) = self.input.get_page()? {
            ctx.adaptor.output_page(&page)?;
        }
        Ok(())
    }
}

/// Per-tuple transform with an end-of-stream flush, e.g. a running filter or
/// a stateful rewrite that buffers a tail.
pub trait Sieve: Send + 'static {
    fn pass(&mut self, tuple: &[u8], emit: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()>;

    /// Called once at EOF to emit any state buffered by `pass`.
    fn flush(&mut self, _emit: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        Ok(())
    }
}

pub struct SieveOperator<F: Sieve> {
    input: Arc<TupleFifo>,
    sieve: F,
}

impl<F: Sieve> SieveOperator<F> {
    pub fn new(input: Arc<TupleFifo>, sieve: F) -> Self {
        Self { input, sieve }
    }
}

impl<F: Sieve> Operator for SieveOperator<F> {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Sieve
    }

    fn run(mut self: Box<Self>, ctx: &ExecCtx) -> Result<()> {
        let mut buf = Vec::new();
        let mut emit = |tuple: &[u8]| ctx.adaptor.output(tuple);
        while self.input.get_tuple(&mut buf)? {
            self.sieve.pass(&buf, &mut emit)?;
        }
        self.sieve.flush(&mut emit)
    }
}

/// Invokes a producer callback with the running context and finishes —
/// used for externally-driven sources such as table scans (out of scope
/// here, but the same shape they'd plug into).
pub struct FuncCallOperator {
    producer: Box<dyn FnOnce(&ExecCtx) -> Result<()> + Send>,
}

impl FuncCallOperator {
    pub fn new(producer: impl FnOnce(&ExecCtx) -> Result<()> + Send + 'static) -> Self {
        Self {
            producer: Box::new(producer),
        }
    }
}

impl Operator for FuncCallOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::FuncCall
    }

    fn run(self: Box<Self>, ctx: &ExecCtx) -> Result<()> {
        (self.producer)(ctx)
    }
}

/// Reads packed page images from a file into the output fifo.
pub struct FScanOperator {
    path: PathBuf,
    pool: Arc<dyn PagePool>,
    tuple_size: usize,
    page_size: usize,
}

impl FScanOperator {
    pub fn new(path: PathBuf, pool: Arc<dyn PagePool>, tuple_size: usize, page_size: usize) -> Self {
        Self {
            path,
            pool,
            tuple_size,
            page_size,
        }
    }
}

impl Operator for FScanOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::FScan
    }

    fn run(self: Box<Self>, ctx: &ExecCtx) -> Result<()> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        while let Some(page) = Page::read_from(&mut reader, self.pool.clone(), self.tuple_size, self.page_size)? {
            ctx.adaptor.output_page(&page)?;
        }
        Ok(())
    }

    fn merge_tag(&self) -> Option<String> {
        Some(format!("fscan:{}", self.path.display()))
    }
}

/// Reads an input fifo and writes packed page images into a file.
pub struct FDumpOperator {
    input: Arc<TupleFifo>,
    path: PathBuf,
}

impl FDumpOperator {
    pub fn new(input: Arc<TupleFifo>, path: PathBuf) -> Self {
        Self { input, path }
    }
}

impl Operator for FDumpOperator {
    fn kind(&self) -> OperatorKind {
        OperatorKind::FDump
    }

    fn run(self: Box<Self>, _ctx: &ExecCtx) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        while let Some(page) = self.input.get_page()? {
            page.write_to(&mut writer)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Per-group accumulation, finalized and emitted at EOF.
pub trait Aggregator: Send + 'static {
    fn key(&self, tuple: &[u8]) -> Vec<u8>;
    fn initial(&self, group: &[u8]) -> Vec<u8>;
    fn accumulate(&mut self, group: &[u8], acc: &mut Vec<u8>, tuple: &[u8]);
    fn finalize(&self, group: &[u8], acc: &[u8]) -> Vec<u8>;
}

pub struct AggregateOperator<A: Aggregator> {
    input: Arc<TupleFifo>,
    aggregator: A,
}

impl<A: Aggregator> AggregateOperator<A> {
    pub fn new(input: Arc<TupleFifo>, aggregator: A) -> Self {
        Self { input, aggregator }
    }
}

impl<A: Aggregator> Operator for AggregateOperator<A> {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Aggregate
    }

    fn run(mut self: Box<Self>, ctx: &ExecCtx) -> Result<()> {
        let mut groups: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        let mut order: Vec<Vec<u8>> = Vec::new();
        let mut buf = Vec::new();

        while self.input.get_tuple(&mut buf)? {
            let key = self.aggregator.key(&buf);
            if !groups.contains_key(&key) {
                order.push(key.clone());
                let initial = self.aggregator.initial(&key);
                groups.insert(key.clone(), initial);
            }
            let acc = groups.get_mut(&key).expect("just inserted");
            self.aggregator.accumulate(&key, acc, &buf);
        }

        for key in order {
            let acc = groups.remove(&key).expect("tracked in order");
            let out = self.aggregator.finalize(&key, &acc);
            ctx.adaptor.output(&out)?;
        }
        Ok(())
    }
}
