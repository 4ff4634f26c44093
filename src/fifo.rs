//! Bounded FIFO queues used for every inter-task hop in the fabric. Built
//! directly on `crossbeam_channel::bounded`, which already gives us the
//! "producers block on full, consumers block on empty" contract this
//! transport needs.

use crossbeam_channel::{Receiver, RecvError, SendError, Sender};

use crate::packet::Packet;

/// Default queue depth used where a caller does not have a more specific
/// figure; chosen to absorb a few in-flight packets without unbounded
/// growth.
pub const DEFAULT_DEPTH: usize = 64;

/// An item flowing through a `Fifo`. `Closed` is an explicit end-of-stream
/// sentinel rather than relying on channel disconnect, so that a draining
/// consumer can tell "producer is done" apart from "producer died".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FifoItem {
    Packet(Packet),
    Closed,
}

/// One direction of a bounded handoff queue.
#[derive(Clone)]
pub struct FifoProducer {
    tx: Sender<FifoItem>,
}

impl FifoProducer {
    /// Blocks if the queue is full.
    pub fn send(&self, item: FifoItem) -> Result<(), SendError<FifoItem>> {
        self.tx.send(item)
    }

    pub fn send_packet(&self, packet: Packet) -> Result<(), SendError<FifoItem>> {
        self.send(FifoItem::Packet(packet))
    }

    /// Signals end-of-stream to the consumer. Idempotent from the caller's
    /// perspective: sending `Closed` twice is harmless, the consumer just
    /// sees two sentinels.
    pub fn close(&self) {
        let _ = self.tx.send(FifoItem::Closed);
    }
}

#[derive(Clone)]
pub struct FifoConsumer {
    rx: Receiver<FifoItem>,
}

impl FifoConsumer {
    /// Blocks until an item is available.
    pub fn recv(&self) -> Result<FifoItem, RecvError> {
        self.rx.recv()
    }

    /// Non-blocking poll, used by drain loops (e.g. `PortBinder::unbind`).
    pub fn try_recv(&self) -> Option<FifoItem> {
        self.rx.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Exposes the underlying channel so callers can fan several
    /// `FifoConsumer`s into one `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<FifoItem> {
        &self.rx
    }
}

/// A bounded producer/consumer pair for one traffic class on one
/// connection. `CxlConnection` holds four of these, one per class.
pub struct Fifo;

impl Fifo {
    pub fn bounded(depth: usize) -> (FifoProducer, FifoConsumer) {
        let (tx, rx) = crossbeam_channel::bounded(depth);
        (FifoProducer { tx }, FifoConsumer { rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{CxlMemRead, Packet};

    fn sample_packet() -> Packet {
        Packet::CxlMemRead(CxlMemRead {
            ld_id: 0,
            tag: 0,
            address: 0,
        })
    }

    #[test]
    fn send_then_recv_preserves_order() {
        let (tx, rx) = Fifo::bounded(4);
        tx.send_packet(sample_packet()).unwrap();
        tx.close();
        assert_eq!(rx.recv().unwrap(), FifoItem::Packet(sample_packet()));
        assert_eq!(rx.recv().unwrap(), FifoItem::Closed);
    }

    #[test]
    fn full_queue_blocks_producer() {
        let (tx, rx) = Fifo::bounded(1);
        tx.send_packet(sample_packet()).unwrap();
        let tx2 = tx.clone();
        let handle = std::thread::spawn(move || {
            tx2.send_packet(sample_packet()).unwrap();
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());
        rx.recv().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn try_recv_on_empty_queue_returns_none() {
        let (_tx, rx) = Fifo::bounded(4);
        assert!(rx.try_recv().is_none());
    }
}
