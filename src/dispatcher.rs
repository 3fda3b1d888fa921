//! Global registry: operator kind → container (spec §3/§4.3).

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{FlowError, Result};
use crate::packet::{OperatorKind, Packet};
use crate::stage::StageContainer;

pub struct Dispatcher {
    containers: DashMap<OperatorKind, Arc<StageContainer>>,
}

impl Dispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            containers: DashMap::new(),
        })
    }

    /// Creates a container for `kind` with a fixed worker pool, wiring its
    /// workers to dispatch back through `self` for child packets.
    pub fn register_stage(
        self: &Arc<Self>,
        kind: OperatorKind,
        worker_count: usize,
        sharing_enabled: bool,
    ) {
        let container = StageContainer::new(kind, worker_count, sharing_enabled, self.clone());
        self.containers.insert(kind, container);
    }

    /// The sole entry point for submitting work: looks up the container for
    /// `packet.kind` and either merges the packet into a compatible running
    /// one or enqueues it for a worker.
    pub fn dispatch(&self, packet: Packet) -> Result<()> {
        let container = self
            .containers
            .get(&packet.kind)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                FlowError::InvalidState(format!("no stage registered for {:?}", packet.kind))
            })?;
        container.dispatch(packet);
        Ok(())
    }
}
