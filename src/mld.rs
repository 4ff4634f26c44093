//! Multi-Logical-Device fan-out: one physical socket carries traffic for
//! several logical devices, each of which looks like its own
//! `CxlConnection` to the rest of the fabric. The MLD demuxes inbound
//! packets by `ld_id` and merges every logical device's outbound traffic
//! back onto the one socket.
//!
//! Unlike `CxlPacketProcessor`'s fixed four-way class select, the number
//! of logical devices is only known at construction time, so the egress
//! side uses `crossbeam_channel::Select` (the dynamic counterpart of the
//! `select!` macro) instead of a fixed set of `recv()` arms.

use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Select;
use log::{debug, trace, warn};

use crate::connection::CxlConnection;
use crate::error::CxlError;
use crate::fifo::FifoItem;
use crate::framing::{PacketReader, PacketWriter};
use crate::packet::Packet;

/// A multi-logical-device endpoint: `ld_count` independent `CxlConnection`s
/// sharing one socket.
pub struct Mld {
    connections: Vec<Arc<CxlConnection>>,
}

impl Mld {
    pub fn new(ld_count: usize) -> Result<Self, CxlError> {
        if ld_count == 0 {
            return Err(CxlError::InvalidLdId(0));
        }
        let connections = (0..ld_count).map(|_| Arc::new(CxlConnection::new())).collect();
        Ok(Mld { connections })
    }

    pub fn ld_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, ld_id: u8) -> Result<&Arc<CxlConnection>, CxlError> {
        self.connections
            .get(ld_id as usize)
            .ok_or(CxlError::InvalidLdId(ld_id))
    }

    pub fn connections(&self) -> &[Arc<CxlConnection>] {
        &self.connections
    }

    /// Spawns the ingress/egress pair that bridges `stream` to every
    /// logical device's connection.
    pub fn start(&self, stream: TcpStream) -> std::io::Result<MldHandles> {
        let read_half = stream.try_clone()?;
        let write_half = stream;
        let ingress = spawn_mld_ingress(PacketReader::new(read_half), self.connections.clone());
        let egress = spawn_mld_egress(PacketWriter::new(write_half), self.connections.clone());
        Ok(MldHandles { ingress, egress })
    }
}

pub struct MldHandles {
    ingress: JoinHandle<()>,
    egress: JoinHandle<()>,
}

impl MldHandles {
    pub fn join(self) {
        let _ = self.ingress.join();
        let _ = self.egress.join();
    }
}

fn spawn_mld_ingress<R>(mut reader: PacketReader<R>, connections: Vec<Arc<CxlConnection>>) -> JoinHandle<()>
where
    R: std::io::Read + Send + 'static,
{
    thread::spawn(move || {
        loop {
            match reader.get_packet() {
                Ok(Some(packet)) => {
                    let ld_id = packet.ld_id() as usize;
                    match connections.get(ld_id) {
                        Some(conn) => {
                            trace!("mld ingress: routing {:?} to ld {}", packet.payload_type(), ld_id);
                            let queue = conn.host_to_target_tx.get(packet.payload_type());
                            if queue.send_packet(packet).is_err() {
                                warn!("mld ingress: ld {} queue disconnected", ld_id);
                            }
                        }
                        None => warn!("mld ingress: packet for out-of-range ld {}", ld_id),
                    }
                }
                Ok(None) => {
                    debug!("mld ingress: clean EOF");
                    break;
                }
                Err(e) => {
                    warn!("mld ingress: framing error: {e}");
                    break;
                }
            }
        }
        for conn in &connections {
            conn.host_to_target_tx.close_all();
        }
    })
}

fn spawn_mld_egress<W>(mut writer: PacketWriter<W>, connections: Vec<Arc<CxlConnection>>) -> JoinHandle<()>
where
    W: std::io::Write + Send + 'static,
{
    thread::spawn(move || {
        let mut receivers = Vec::new();
        for conn in &connections {
            receivers.push(conn.target_to_host_rx.io.receiver().clone());
            receivers.push(conn.target_to_host_rx.mem.receiver().clone());
            receivers.push(conn.target_to_host_rx.cache.receiver().clone());
            receivers.push(conn.target_to_host_rx.cci.receiver().clone());
        }
        let mut live: Vec<bool> = vec![true; receivers.len()];

        loop {
            let mut sel = Select::new();
            let mut indices = Vec::new();
            for (i, live) in live.iter().enumerate() {
                if *live {
                    sel.recv(&receivers[i]);
                    indices.push(i);
                }
            }
            if indices.is_empty() {
                debug!("mld egress: every logical device closed its queues");
                break;
            }
            let oper = sel.select();
            let sel_index = oper.index();
            let real_index = indices[sel_index];
            match oper.recv(&receivers[real_index]) {
                Ok(FifoItem::Packet(packet)) => {
                    if let Err(e) = writer.write(&packet) {
                        warn!("mld egress: write failed: {e}");
                        break;
                    }
                }
                Ok(FifoItem::Closed) => {
                    live[real_index] = false;
                }
                Err(_) => {
                    live[real_index] = false;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{CxlIoCfgRd, CxlMemRead};
    use std::net::{TcpListener, TcpStream};

    fn connect_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn routes_inbound_packets_by_ld_id() {
        let (client, server) = connect_pair();
        let mld = Mld::new(4).unwrap();
        let handles = mld.start(server).unwrap();

        let mut writer = PacketWriter::new(client);
        writer
            .write(&Packet::CxlIoCfgRd(CxlIoCfgRd {
                ld_id: 2,
                tag: 0,
                bus: 0,
                device: 0,
                function: 0,
                register: 0,
            }))
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!mld.connection(2).unwrap().host_to_target_rx.io.is_empty());
        assert!(mld.connection(0).unwrap().host_to_target_rx.io.is_empty());

        drop(writer);
        handles.join();
    }

    #[test]
    fn merges_outbound_packets_from_every_ld() {
        let (client, server) = connect_pair();
        let mld = Mld::new(2).unwrap();
        let handles = mld.start(server).unwrap();

        mld.connection(0)
            .unwrap()
            .target_to_host_tx
            .mem
            .send_packet(Packet::CxlMemRead(CxlMemRead {
                ld_id: 0,
                tag: 0,
                address: 0,
            }))
            .unwrap();
        mld.connection(1)
            .unwrap()
            .target_to_host_tx
            .mem
            .send_packet(Packet::CxlMemRead(CxlMemRead {
                ld_id: 1,
                tag: 0,
                address: 4096,
            }))
            .unwrap();

        let mut reader = PacketReader::new(client);
        let mut seen = std::collections::HashSet::new();
        seen.insert(reader.get_packet().unwrap().unwrap().ld_id());
        seen.insert(reader.get_packet().unwrap().unwrap().ld_id());
        assert_eq!(seen, [0u8, 1u8].into_iter().collect());

        for conn in mld.connections() {
            conn.close();
        }
        handles.join();
    }

    #[test]
    fn rejects_zero_ld_count() {
        assert!(Mld::new(0).is_err());
    }
}
