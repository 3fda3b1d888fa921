//! The unit of work submitted to a container (spec §3/§6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::adaptor::StageAdaptor;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::fifo::TupleFifo;

pub type PacketId = u64;

static NEXT_PACKET_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_packet_id() -> PacketId {
    NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// Routes a packet to its per-kind worker pool and OSP merge table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    HashJoin,
    Sort,
    Merge,
    Aggregate,
    Sieve,
    Echo,
    FuncCall,
    FScan,
    FDump,
}

/// Projection/predicate callback evaluated against a raw output tuple.
/// Returns `None` to drop the tuple.
pub type OutputFilter = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Handed to a running operator body: its own I/O surface plus access to the
/// dispatcher for recursively dispatching child packets.
pub struct ExecCtx {
    pub dispatcher: Arc<Dispatcher>,
    pub adaptor: Arc<StageAdaptor>,
}

/// Per-kind operator body. Consumes `self` on `run` so a packet that gets
/// merged into a host instead can never be run twice.
pub trait Operator: Send + 'static {
    fn kind(&self) -> OperatorKind;

    fn run(self: Box<Self>, ctx: &ExecCtx) -> Result<()>;

    /// Opportunistic-sharing key (spec §4.3 OSP): operators of the same kind
    /// returning equal `Some(tag)` may be merged into a single running
    /// instance, with the newcomer observing the host's output. The default
    /// of `None` means "never shareable".
    fn merge_tag(&self) -> Option<String> {
        None
    }
}

/// The unit of work submitted to a container.
pub struct Packet {
    pub id: PacketId,
    pub kind: OperatorKind,
    pub output: Arc<TupleFifo>,
    pub filter: Option<OutputFilter>,
    pub op: Box<dyn Operator>,
}

impl Packet {
    pub fn new(output: Arc<TupleFifo>, op: Box<dyn Operator>) -> Self {
        Self {
            id: next_packet_id(),
            kind: op.kind(),
            output,
            filter: None,
            op,
        }
    }

    pub fn with_filter(mut self, filter: OutputFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}
