//! Class-specific forwarding between the upstream vPPB and bound DSPs.
//! Each router owns a downstream task (host -> device) and an upstream
//! task (device -> host); the two are independent so a slow downstream
//! device never stalls another device's upstream traffic.
//!
//! Downstream routing keys: CXL.io config requests route by the PCI
//! "device" field of the BDF (taken directly as the vPPB index); CXL.io
//! MMIO and CXL.mem requests route by address through the `HdmDecoder`;
//! CXL.cache traffic routes by snoop id through the `SnoopTable`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Select;
use log::{trace, warn};

use crate::bind::PhysicalPort;
use crate::connection::CxlConnection;
use crate::fifo::FifoItem;
use crate::hdm::{HdmDecoder, SnoopTable};
use crate::packet::{CxlIoCompletion, Packet, CXL_IO_STATUS_UR};
use crate::routing::RoutingTable;

/// How often the upstream-direction task re-scans bound ports for new
/// traffic or a change in which vPPBs are bound. Bind/unbind events are
/// rare compared to packet traffic, so a short poll interval is simpler
/// than threading bind-change notifications through every router.
const UPSTREAM_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct RouterHandles {
    stop: Arc<AtomicBool>,
    downstream: JoinHandle<()>,
    upstream: JoinHandle<()>,
}

impl RouterHandles {
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn join(self) {
        let _ = self.downstream.join();
        let _ = self.upstream.join();
    }
}

fn unsupported_request(packet: &Packet) -> Packet {
    Packet::CxlIoCompletion(CxlIoCompletion {
        ld_id: packet.ld_id(),
        tag: packet.tag(),
        status: CXL_IO_STATUS_UR,
    })
}

/// Looks up the bound DSP for `vppb` and forwards `packet` if one exists;
/// otherwise applies the class's no-route policy.
fn forward_or_handle_miss(
    vppb: Option<usize>,
    packet: Packet,
    routing_table: &RoutingTable,
    ports: &[PhysicalPort],
    upstream: &CxlConnection,
    class_queue: impl Fn(&CxlConnection) -> &crate::fifo::FifoProducer,
    synthesize_ur: bool,
) {
    let port_id = vppb.and_then(|v| routing_table.lookup(v));
    match port_id.and_then(|p| ports.get(p)) {
        Some(port) => {
            if class_queue(&port.connection).send_packet(packet).is_err() {
                warn!("router: bound DSP queue disconnected");
            }
        }
        None if synthesize_ur => {
            let ur = unsupported_request(&packet);
            let _ = upstream.target_to_host_tx.io.send_packet(ur);
        }
        None => {
            trace!("router: no coherent target, dropping packet");
        }
    }
}

pub fn spawn_io_router(
    upstream: Arc<CxlConnection>,
    routing_table: Arc<RoutingTable>,
    ports: Arc<Vec<PhysicalPort>>,
    hdm: Arc<HdmDecoder>,
) -> RouterHandles {
    let stop = Arc::new(AtomicBool::new(false));

    let downstream = {
        let upstream = upstream.clone();
        let routing_table = routing_table.clone();
        let ports = ports.clone();
        let hdm = hdm.clone();
        thread::spawn(move || loop {
            match upstream.host_to_target_rx.io.recv() {
                Ok(FifoItem::Packet(packet)) => {
                    let vppb = io_routing_key(&packet, &hdm);
                    forward_or_handle_miss(
                        vppb,
                        packet,
                        &routing_table,
                        &ports,
                        &upstream,
                        |conn| &conn.host_to_target_tx.io,
                        true,
                    );
                }
                Ok(FifoItem::Closed) | Err(_) => break,
            }
        })
    };

    let upstream_task = {
        let stop = stop.clone();
        thread::spawn(move || {
            poll_upstream(&stop, &ports, &routing_table, |conn| &conn.target_to_host_rx.io, |packet| {
                let _ = upstream.target_to_host_tx.io.send_packet(packet);
            });
        })
    };

    RouterHandles {
        stop,
        downstream,
        upstream: upstream_task,
    }
}

fn io_routing_key(packet: &Packet, hdm: &HdmDecoder) -> Option<usize> {
    match packet {
        Packet::CxlIoCfgRd(p) => Some(p.device as usize),
        Packet::CxlIoCfgWr(p) => Some(p.device as usize),
        Packet::CxlIoMemRd(p) => hdm.resolve(p.address),
        Packet::CxlIoMemWr(p) => hdm.resolve(p.address),
        _ => None,
    }
}

pub fn spawn_mem_router(
    upstream: Arc<CxlConnection>,
    routing_table: Arc<RoutingTable>,
    ports: Arc<Vec<PhysicalPort>>,
    hdm: Arc<HdmDecoder>,
    bi_enable_override: Option<bool>,
    bi_forward_override: Option<bool>,
) -> RouterHandles {
    let stop = Arc::new(AtomicBool::new(false));

    let downstream = {
        let upstream = upstream.clone();
        let routing_table = routing_table.clone();
        let ports = ports.clone();
        thread::spawn(move || loop {
            match upstream.host_to_target_rx.mem.recv() {
                Ok(FifoItem::Packet(packet)) => {
                    let vppb = mem_routing_key(&packet, &hdm);
                    forward_or_handle_miss(
                        vppb,
                        packet,
                        &routing_table,
                        &ports,
                        &upstream,
                        |conn| &conn.host_to_target_tx.mem,
                        false,
                    );
                }
                Ok(FifoItem::Closed) | Err(_) => break,
            }
        })
    };

    let upstream_task = {
        let stop = stop.clone();
        thread::spawn(move || {
            poll_upstream(&stop, &ports, &routing_table, |conn| &conn.target_to_host_rx.mem, move |packet| {
                let packet = apply_bi_override(packet, bi_enable_override, bi_forward_override);
                let _ = upstream.target_to_host_tx.mem.send_packet(packet);
            });
        })
    };

    RouterHandles {
        stop,
        downstream,
        upstream: upstream_task,
    }
}

fn mem_routing_key(packet: &Packet, hdm: &HdmDecoder) -> Option<usize> {
    match packet {
        Packet::CxlMemRead(p) => hdm.resolve(p.address),
        Packet::CxlMemWrite(p) => hdm.resolve(p.address),
        Packet::CxlMemBiSnp(p) => hdm.resolve(p.address),
        _ => None,
    }
}

/// Forces `bi_enable`/`bi_forward` to the test-mode override, if one is
/// configured, on every mem packet carrying those bits.
fn apply_bi_override(packet: Packet, bi_enable: Option<bool>, bi_forward: Option<bool>) -> Packet {
    if bi_enable.is_none() && bi_forward.is_none() {
        return packet;
    }
    match packet {
        Packet::CxlMemReadData(mut p) => {
            if let Some(v) = bi_enable {
                p.bi_enable = v;
            }
            if let Some(v) = bi_forward {
                p.bi_forward = v;
            }
            Packet::CxlMemReadData(p)
        }
        Packet::CxlMemBiRsp(mut p) => {
            if let Some(v) = bi_enable {
                p.bi_enable = v;
            }
            if let Some(v) = bi_forward {
                p.bi_forward = v;
            }
            Packet::CxlMemBiRsp(p)
        }
        other => other,
    }
}

pub fn spawn_cache_router(
    upstream: Arc<CxlConnection>,
    routing_table: Arc<RoutingTable>,
    ports: Arc<Vec<PhysicalPort>>,
    snoop: Arc<SnoopTable>,
) -> RouterHandles {
    let stop = Arc::new(AtomicBool::new(false));

    let downstream = {
        let upstream = upstream.clone();
        let routing_table = routing_table.clone();
        let ports = ports.clone();
        thread::spawn(move || loop {
            match upstream.host_to_target_rx.cache.recv() {
                Ok(FifoItem::Packet(packet)) => {
                    let vppb = cache_routing_key(&packet, &snoop);
                    forward_or_handle_miss(
                        vppb,
                        packet,
                        &routing_table,
                        &ports,
                        &upstream,
                        |conn| &conn.host_to_target_tx.cache,
                        false,
                    );
                }
                Ok(FifoItem::Closed) | Err(_) => break,
            }
        })
    };

    let upstream_task = {
        let stop = stop.clone();
        thread::spawn(move || {
            poll_upstream(&stop, &ports, &routing_table, |conn| &conn.target_to_host_rx.cache, |packet| {
                let _ = upstream.target_to_host_tx.cache.send_packet(packet);
            });
        })
    };

    RouterHandles {
        stop,
        downstream,
        upstream: upstream_task,
    }
}

fn cache_routing_key(packet: &Packet, snoop: &SnoopTable) -> Option<usize> {
    match packet {
        Packet::CxlCacheReq(p) => snoop.resolve(p.snoop_id),
        Packet::CxlCacheRsp(p) => snoop.resolve(p.snoop_id),
        _ => None,
    }
}

/// Shared upstream-direction loop: for every currently-bound vPPB, drain
/// whatever is ready on its DSP's outbound queue for this class and hand
/// it to `emit`. Rebuilding the `Select` set each sweep keeps this correct
/// across rebinds without threading bind-change notifications through the
/// router, and ensures no bound queue starves indefinitely.
fn poll_upstream(
    stop: &AtomicBool,
    ports: &[PhysicalPort],
    routing_table: &RoutingTable,
    class_queue: impl Fn(&CxlConnection) -> &crate::fifo::FifoConsumer,
    emit: impl Fn(Packet),
) {
    while !stop.load(Ordering::Acquire) {
        let bound_ports: Vec<usize> = (0..routing_table.vppb_count())
            .filter_map(|vppb| routing_table.lookup(vppb))
            .collect();

        if bound_ports.is_empty() {
            thread::sleep(UPSTREAM_POLL_INTERVAL);
            continue;
        }

        let receivers: Vec<_> = bound_ports
            .iter()
            .filter_map(|&port_id| ports.get(port_id))
            .map(|p| class_queue(&p.connection).receiver().clone())
            .collect();

        let mut sel = Select::new();
        for r in &receivers {
            sel.recv(r);
        }
        if let Ok(oper) = sel.select_timeout(UPSTREAM_POLL_INTERVAL) {
            let index = oper.index();
            if let Ok(FifoItem::Packet(packet)) = oper.recv(&receivers[index]) {
                emit(packet);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{CxlIoCfgRd, CxlMemRead};

    fn dsp_port() -> PhysicalPort {
        PhysicalPort {
            port_type: crate::bind::PortType::Dsp,
            connection: Arc::new(CxlConnection::new()),
        }
    }

    #[test]
    fn io_router_forwards_cfg_rd_by_device_field() {
        let upstream = Arc::new(CxlConnection::new());
        let table = Arc::new(RoutingTable::new(1));
        let ports = Arc::new(vec![dsp_port()]);
        let hdm = Arc::new(HdmDecoder::new());
        table.set_target(0, 0);
        table.activate(0);

        let handles = spawn_io_router(upstream.clone(), table, ports.clone(), hdm);

        upstream
            .host_to_target_tx
            .io
            .send_packet(Packet::CxlIoCfgRd(CxlIoCfgRd {
                ld_id: 0,
                tag: 1,
                bus: 0,
                device: 0,
                function: 0,
                register: 0,
            }))
            .unwrap();

        let got = ports[0].connection.host_to_target_rx.io.recv().unwrap();
        assert!(matches!(got, FifoItem::Packet(Packet::CxlIoCfgRd(_))));

        handles.request_stop();
        upstream.close();
        handles.join();
    }

    #[test]
    fn io_router_synthesizes_ur_on_unrouted_address() {
        let upstream = Arc::new(CxlConnection::new());
        let table = Arc::new(RoutingTable::new(1));
        let ports = Arc::new(vec![dsp_port()]);
        let hdm = Arc::new(HdmDecoder::new());

        let handles = spawn_io_router(upstream.clone(), table, ports, hdm);

        upstream
            .host_to_target_tx
            .io
            .send_packet(Packet::CxlIoCfgRd(CxlIoCfgRd {
                ld_id: 0,
                tag: 9,
                bus: 0,
                device: 5,
                function: 0,
                register: 0,
            }))
            .unwrap();

        let got = upstream.target_to_host_rx.io.recv().unwrap();
        match got {
            FifoItem::Packet(Packet::CxlIoCompletion(c)) => {
                assert_eq!(c.tag, 9);
                assert_eq!(c.status, CXL_IO_STATUS_UR);
            }
            other => panic!("expected UR completion, got {other:?}"),
        }

        handles.request_stop();
        upstream.close();
        handles.join();
    }

    #[test]
    fn mem_router_drops_silently_on_unrouted_address() {
        let upstream = Arc::new(CxlConnection::new());
        let table = Arc::new(RoutingTable::new(1));
        let ports = Arc::new(vec![dsp_port()]);
        let hdm = Arc::new(HdmDecoder::new());

        let handles = spawn_mem_router(upstream.clone(), table, ports, hdm, None, None);

        upstream
            .host_to_target_tx
            .mem
            .send_packet(Packet::CxlMemRead(CxlMemRead {
                ld_id: 0,
                tag: 0,
                address: 0x1000,
            }))
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert!(upstream.target_to_host_rx.mem.is_empty());

        handles.request_stop();
        upstream.close();
        handles.join();
    }

    #[test]
    fn mem_router_forwards_upstream_with_bi_override() {
        let upstream = Arc::new(CxlConnection::new());
        let table = Arc::new(RoutingTable::new(1));
        let ports = Arc::new(vec![dsp_port()]);
        let hdm = Arc::new(HdmDecoder::new());
        table.set_target(0, 0);
        table.activate(0);

        let handles = spawn_mem_router(upstream.clone(), table, ports.clone(), hdm, Some(true), Some(false));

        ports[0]
            .connection
            .target_to_host_tx
            .mem
            .send_packet(Packet::CxlMemReadData(crate::packet::CxlMemReadData {
                ld_id: 0,
                tag: 0,
                data: vec![1, 2, 3, 4],
                bi_enable: false,
                bi_forward: true,
            }))
            .unwrap();

        let got = upstream.target_to_host_rx.mem.recv().unwrap();
        match got {
            FifoItem::Packet(Packet::CxlMemReadData(p)) => {
                assert!(p.bi_enable);
                assert!(!p.bi_forward);
            }
            other => panic!("unexpected {other:?}"),
        }

        handles.request_stop();
        upstream.close();
        handles.join();
    }
}
