//! `CxlConnection` bundles the four per-class FIFO pairs that make up one
//! logical endpoint-to-endpoint link. Each class gets its own pair of
//! queues in each direction, so a slow CXL.cache consumer cannot stall
//! CXL.io traffic on the same connection.

use crate::fifo::{Fifo, FifoConsumer, FifoProducer, DEFAULT_DEPTH};
use crate::packet::PayloadType;

/// One direction's four class queues.
pub struct ClassQueues<P> {
    pub io: P,
    pub mem: P,
    pub cache: P,
    pub cci: P,
}

impl<P> ClassQueues<P> {
    pub fn get(&self, class: PayloadType) -> &P {
        match class {
            PayloadType::Io => &self.io,
            PayloadType::Mem => &self.mem,
            PayloadType::Cache => &self.cache,
            PayloadType::Cci => &self.cci,
        }
    }
}

/// A full duplex connection: `host_to_target` carries requests downstream,
/// `target_to_host` carries responses/requests upstream (CXL.mem BI and
/// CXL.cache snoops travel target -> host even though they are
/// "requests").
pub struct CxlConnection {
    pub host_to_target_tx: ClassQueues<FifoProducer>,
    pub host_to_target_rx: ClassQueues<FifoConsumer>,
    pub target_to_host_tx: ClassQueues<FifoProducer>,
    pub target_to_host_rx: ClassQueues<FifoConsumer>,
}

impl CxlConnection {
    pub fn new() -> Self {
        Self::with_depth(DEFAULT_DEPTH)
    }

    pub fn with_depth(depth: usize) -> Self {
        let (h_io_tx, h_io_rx) = Fifo::bounded(depth);
        let (h_mem_tx, h_mem_rx) = Fifo::bounded(depth);
        let (h_cache_tx, h_cache_rx) = Fifo::bounded(depth);
        let (h_cci_tx, h_cci_rx) = Fifo::bounded(depth);

        let (t_io_tx, t_io_rx) = Fifo::bounded(depth);
        let (t_mem_tx, t_mem_rx) = Fifo::bounded(depth);
        let (t_cache_tx, t_cache_rx) = Fifo::bounded(depth);
        let (t_cci_tx, t_cci_rx) = Fifo::bounded(depth);

        CxlConnection {
            host_to_target_tx: ClassQueues {
                io: h_io_tx,
                mem: h_mem_tx,
                cache: h_cache_tx,
                cci: h_cci_tx,
            },
            host_to_target_rx: ClassQueues {
                io: h_io_rx,
                mem: h_mem_rx,
                cache: h_cache_rx,
                cci: h_cci_rx,
            },
            target_to_host_tx: ClassQueues {
                io: t_io_tx,
                mem: t_mem_tx,
                cache: t_cache_tx,
                cci: t_cci_tx,
            },
            target_to_host_rx: ClassQueues {
                io: t_io_rx,
                mem: t_mem_rx,
                cache: t_cache_rx,
                cci: t_cci_rx,
            },
        }
    }

    /// Signals end-of-stream on every queue in both directions. Used when
    /// a socket disconnects so downstream consumers unblock instead of
    /// waiting forever on a dead producer.
    pub fn close(&self) {
        self.host_to_target_tx.io.close();
        self.host_to_target_tx.mem.close();
        self.host_to_target_tx.cache.close();
        self.host_to_target_tx.cci.close();
        self.target_to_host_tx.io.close();
        self.target_to_host_tx.mem.close();
        self.target_to_host_tx.cache.close();
        self.target_to_host_tx.cci.close();
    }
}

impl Default for CxlConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::FifoItem;
    use crate::packet::{CxlMemRead, Packet};

    #[test]
    fn classes_are_isolated() {
        let conn = CxlConnection::new();
        conn.host_to_target_tx
            .io
            .send_packet(Packet::CxlMemRead(CxlMemRead {
                ld_id: 0,
                tag: 0,
                address: 0,
            }))
            .unwrap();
        assert!(!conn.host_to_target_rx.io.is_empty());
        assert!(conn.host_to_target_rx.mem.is_empty());
    }

    #[test]
    fn close_unblocks_every_queue() {
        let conn = CxlConnection::new();
        conn.close();
        assert_eq!(conn.host_to_target_rx.io.recv().unwrap(), FifoItem::Closed);
        assert_eq!(conn.target_to_host_rx.cci.recv().unwrap(), FifoItem::Closed);
    }
}
