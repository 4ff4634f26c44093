//! `CxlPacketProcessor` demultiplexes a single socket into the four
//! per-class queues of a `CxlConnection`, and merges the reverse direction
//! back onto the same socket. It is the single place where bytes meet
//! queues; everything upstream of it only ever sees `Packet` values.
//!
//! One thread owns the socket's read half and only ever pushes into
//! queues, one thread owns the write half and only ever pulls from
//! queues, so neither thread blocks the other on backpressure from a
//! single class.

use std::io::Read;
use std::net::TcpStream;
use std::thread::{self, JoinHandle};

use crossbeam_channel::select;
use log::{debug, trace, warn};

use crate::connection::ClassQueues;
use crate::fifo::{FifoConsumer, FifoItem, FifoProducer};
use crate::framing::{PacketReader, PacketWriter};

/// Runs the ingress half: reads packets off `stream` and pushes each one
/// onto the queue matching its payload type. On EOF or a fatal framing
/// error, closes every inbound queue so consumers waiting on them
/// unblock rather than hang.
pub fn spawn_ingress<R>(mut reader: PacketReader<R>, inbound: ClassQueues<FifoProducer>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        loop {
            match reader.get_packet() {
                Ok(Some(packet)) => {
                    trace!(
                        "ingress: demuxed {:?} packet for ld {}",
                        packet.payload_type(),
                        packet.ld_id()
                    );
                    let queue = inbound.get(packet.payload_type());
                    if queue.send_packet(packet).is_err() {
                        warn!("ingress: inbound queue disconnected, stopping");
                        break;
                    }
                }
                Ok(None) => {
                    debug!("ingress: clean EOF, closing inbound queues");
                    break;
                }
                Err(e) => {
                    warn!("ingress: framing error, closing inbound queues: {e}");
                    break;
                }
            }
        }
        inbound.close_all();
    })
}

impl ClassQueues<FifoProducer> {
    pub fn close_all(&self) {
        self.io.close();
        self.mem.close();
        self.cache.close();
        self.cci.close();
    }
}

/// Runs the egress half: pulls packets out of whichever outbound queue has
/// one ready and writes it to `stream`, giving every class a fair shot via
/// `crossbeam_channel::select!`.
pub fn spawn_egress<W>(mut writer: PacketWriter<W>, outbound: ClassQueues<FifoConsumer>) -> JoinHandle<()>
where
    W: std::io::Write + Send + 'static,
{
    thread::spawn(move || loop {
        let item = select! {
            recv(outbound.io.receiver()) -> msg => msg,
            recv(outbound.mem.receiver()) -> msg => msg,
            recv(outbound.cache.receiver()) -> msg => msg,
            recv(outbound.cci.receiver()) -> msg => msg,
        };
        match item {
            Ok(FifoItem::Packet(packet)) => {
                if let Err(e) = writer.write(&packet) {
                    warn!("egress: write failed, stopping: {e}");
                    break;
                }
            }
            Ok(FifoItem::Closed) => {
                debug!("egress: upstream producer closed its queue");
                break;
            }
            Err(_) => {
                debug!("egress: all outbound queues disconnected");
                break;
            }
        }
    })
}

/// Ties the ingress and egress halves of a socket to one `CxlConnection`.
/// `inbound` is the direction this socket produces into (e.g. a
/// downstream device connection produces into `target_to_host`), `outbound`
/// is the direction it consumes from (`host_to_target`).
pub struct CxlPacketProcessor {
    ingress: JoinHandle<()>,
    egress: JoinHandle<()>,
}

impl CxlPacketProcessor {
    pub fn start(
        stream: TcpStream,
        inbound: ClassQueues<FifoProducer>,
        outbound: ClassQueues<FifoConsumer>,
    ) -> std::io::Result<Self> {
        let read_half = stream.try_clone()?;
        let write_half = stream;
        let reader = PacketReader::new(read_half);
        let writer = PacketWriter::new(write_half);
        let ingress = spawn_ingress(reader, inbound);
        let egress = spawn_egress(writer, outbound);
        Ok(CxlPacketProcessor { ingress, egress })
    }

    pub fn join(self) {
        let _ = self.ingress.join();
        let _ = self.egress.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CxlConnection;
    use crate::packet::{CxlCacheReq, CxlIoCfgRd, CxlMemRead, Packet};
    use std::net::{TcpListener, TcpStream};

    fn connect_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn demuxes_by_payload_type() {
        let (client, server) = connect_pair();
        let conn = CxlConnection::new();
        let outbound_dummy = CxlConnection::new();

        let processor = CxlPacketProcessor::start(
            server,
            ClassQueues {
                io: conn.target_to_host_tx.io.clone(),
                mem: conn.target_to_host_tx.mem.clone(),
                cache: conn.target_to_host_tx.cache.clone(),
                cci: conn.target_to_host_tx.cci.clone(),
            },
            ClassQueues {
                io: outbound_dummy.host_to_target_rx.io.clone(),
                mem: outbound_dummy.host_to_target_rx.mem.clone(),
                cache: outbound_dummy.host_to_target_rx.cache.clone(),
                cci: outbound_dummy.host_to_target_rx.cci.clone(),
            },
        )
        .unwrap();

        let mut writer = PacketWriter::new(client);
        writer
            .write(&Packet::CxlIoCfgRd(CxlIoCfgRd {
                ld_id: 0,
                tag: 0,
                bus: 0,
                device: 1,
                function: 0,
                register: 0,
            }))
            .unwrap();
        writer
            .write(&Packet::CxlCacheReq(CxlCacheReq {
                ld_id: 0,
                tag: 0,
                snoop_id: 1,
                address: 0x2000,
            }))
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!conn.target_to_host_rx.io.is_empty());
        assert!(!conn.target_to_host_rx.cache.is_empty());
        assert!(conn.target_to_host_rx.mem.is_empty());

        drop(writer);
        processor.join();
    }

    #[test]
    fn egress_drains_whichever_class_is_ready() {
        let (client, server) = connect_pair();
        let conn = CxlConnection::new();
        let dummy_inbound = CxlConnection::new();

        let processor = CxlPacketProcessor::start(
            server,
            ClassQueues {
                io: dummy_inbound.target_to_host_tx.io.clone(),
                mem: dummy_inbound.target_to_host_tx.mem.clone(),
                cache: dummy_inbound.target_to_host_tx.cache.clone(),
                cci: dummy_inbound.target_to_host_tx.cci.clone(),
            },
            ClassQueues {
                io: conn.host_to_target_rx.io.clone(),
                mem: conn.host_to_target_rx.mem.clone(),
                cache: conn.host_to_target_rx.cache.clone(),
                cci: conn.host_to_target_rx.cci.clone(),
            },
        )
        .unwrap();

        conn.host_to_target_tx
            .mem
            .send_packet(Packet::CxlMemRead(CxlMemRead {
                ld_id: 0,
                tag: 0,
                address: 0x1000,
            }))
            .unwrap();

        let mut reader = PacketReader::new(client);
        let got = reader.get_packet().unwrap().unwrap();
        assert_eq!(got.payload_type(), crate::packet::PayloadType::Mem);

        conn.host_to_target_tx.close_all();
        processor.join();
    }
}
