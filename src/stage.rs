//! Per-operator-kind worker pool, request queue, and OSP merge table
//! (spec §3/§4.3).

use std::sync::Arc;

use crossbeam::channel::{self, Sender};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::adaptor::StageAdaptor;
use crate::dispatcher::Dispatcher;
use crate::packet::{ExecCtx, OperatorKind, Packet, PacketId};

pub struct StageContainer {
    kind: OperatorKind,
    sharing_enabled: bool,
    sender: Sender<Packet>,
    running: Arc<DashMap<PacketId, Arc<StageAdaptor>>>,
}

impl StageContainer {
    /// Registers `worker_count` long-lived OS threads that drain the
    /// container's request queue for the lifetime of the process.
    pub fn new(
        kind: OperatorKind,
        worker_count: usize,
        sharing_enabled: bool,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        let (sender, receiver) = channel::unbounded::<Packet>();
        let running: Arc<DashMap<PacketId, Arc<StageAdaptor>>> = Arc::new(DashMap::new());

        for idx in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let dispatcher = dispatcher.clone();
            let running = running.clone();
            std::thread::Builder::new()
                .name(format!("{kind:?}-worker-{idx}"))
                .spawn(move || Self::worker_loop(receiver, dispatcher, running))
                .expect("failed to spawn stage worker thread");
        }

        Arc::new(Self {
            kind,
            sharing_enabled,
            sender,
            running,
        })
    }

    pub fn kind(&self) -> OperatorKind {
        self.kind
    }

    /// Either merges `packet` into a compatible running instance of the
    /// same kind, or enqueues it for a worker (spec §4.3 `dispatch`).
    pub fn dispatch(&self, packet: Packet) {
        if self.sharing_enabled {
            if let Some(tag) = packet.op.merge_tag() {
                for entry in self.running.iter() {
                    if entry.value().merge_tag() != Some(tag.as_str()) {
                        continue;
                    }
                    if entry
                        .value()
                        .attach_follower(packet.output.clone(), packet.filter.clone())
                    {
                        debug!(kind = ?self.kind, packet = packet.id, "merged into running host");
                        return;
                    }
                }
            }
        }

        if self.sender.send(packet).is_err() {
            warn!(kind = ?self.kind, "stage container has no live workers");
        }
    }

    fn worker_loop(
        receiver: channel::Receiver<Packet>,
        dispatcher: Arc<Dispatcher>,
        running: Arc<DashMap<PacketId, Arc<StageAdaptor>>>,
    ) {
        while let Ok(packet) = receiver.recv() {
            let packet_id = packet.id;
            let merge_tag = packet.op.merge_tag();
            let adaptor = StageAdaptor::new(packet.output.clone(), packet.filter.clone(), merge_tag);
            running.insert(packet_id, adaptor.clone());

            let ctx = ExecCtx {
                dispatcher: dispatcher.clone(),
                adaptor: adaptor.clone(),
            };
            let result = packet.op.run(&ctx);

            // Stop accepting new followers (and close/terminate the fifos)
            // before this packet disappears from `running`, so a concurrent
            // dispatch can never attach a follower to a host that has
            // already finished producing output.
            match result {
                Ok(()) => adaptor.close(),
                Err(err) => {
                    warn!(packet = packet_id, error = %err, "operator failed");
                    adaptor.terminate();
                }
            }
            running.remove(&packet_id);
        }
    }
}
