//! Top-level driver: dispatch the root packet and drain its output fifo
//! into the caller's sink (spec §6).

use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::packet::Packet;

/// Dispatches `root` and feeds every tuple it eventually produces to
/// `sink`, in order, until EOF. Propagates the root fifo's own error (a
/// terminated/failed pipeline) to the caller; `sink` errors abort the drain
/// and are returned as-is.
pub fn process_query(
    dispatcher: &Arc<Dispatcher>,
    root: Packet,
    mut sink: impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    let output = root.output.clone();
    dispatcher.dispatch(root)?;

    let mut buf = Vec::new();
    while output.get_tuple(&mut buf)? {
        sink(&buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::TupleFifo;
    use crate::ops::shims::EchoOperator;
    use crate::packet::OperatorKind;
    use crate::pool::MallocPagePool;

    #[test]
    fn drains_dispatched_packet_into_sink() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_stage(OperatorKind::Echo, 1, false);

        let pool = MallocPagePool::shared(256);
        let input = TupleFifo::new(pool.clone(), 4, 4, 1);
        for v in [1i32, 2, 3] {
            input.append(&v.to_le_bytes()).unwrap();
        }
        input.send_eof().unwrap();

        let output = TupleFifo::new(pool, 4, 4, 1);
        let root = Packet::new(output, Box::new(EchoOperator::new(input)));

        let mut collected = Vec::new();
        process_query(&dispatcher, root, |tuple| {
            collected.push(i32::from_le_bytes(tuple.try_into().unwrap()));
            Ok(())
        })
        .unwrap();

        assert_eq!(collected, vec![1, 2, 3]);
    }

    #[test]
    fn missing_registration_surfaces_as_an_error() {
        let dispatcher = Dispatcher::new();
        let pool = MallocPagePool::shared(256);
        let input = TupleFifo::new(pool.clone(), 4, 4, 1);
        input.send_eof().unwrap();
        let output = TupleFifo::new(pool, 4, 4, 1);
        let root = Packet::new(output, Box::new(EchoOperator::new(input)));

        let result = process_query(&dispatcher, root, |_| Ok(()));
        assert!(result.is_err());
    }
}
