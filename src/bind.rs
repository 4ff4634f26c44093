//! Lifecycle of vPPB <-> DSP bindings. `PortBinder` is the single writer of
//! both `BindState` and the `RoutingTable` entries it drives; routers only
//! ever read the table.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::connection::CxlConnection;
use crate::error::CxlError;
use crate::fifo::FifoItem;
use crate::packet::{CxlIoCompletion, Packet, CXL_IO_STATUS_UR};
use crate::routing::{PortId, RoutingTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    Usp,
    Dsp,
}

/// A physical switch port: its type plus the `CxlConnection` that carries
/// traffic to/from whatever is plugged into it.
pub struct PhysicalPort {
    pub port_type: PortType,
    pub connection: Arc<CxlConnection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    Binding,
    Bound(PortId),
    Unbinding,
}

pub struct PortBinder {
    routing_table: Arc<RoutingTable>,
    ports: Arc<Vec<PhysicalPort>>,
    /// Upstream vPPB connection; UR completions synthesized while draining
    /// an unbind are emitted onto its `target_to_host.io` queue.
    upstream: Arc<CxlConnection>,
    states: Mutex<Vec<BindState>>,
}

impl PortBinder {
    pub fn new(
        routing_table: Arc<RoutingTable>,
        ports: Arc<Vec<PhysicalPort>>,
        upstream: Arc<CxlConnection>,
        vppb_count: usize,
    ) -> Self {
        PortBinder {
            routing_table,
            ports,
            upstream,
            states: Mutex::new(vec![BindState::Unbound; vppb_count]),
        }
    }

    pub fn bind_status(&self, vppb_id: usize) -> Option<BindState> {
        self.states.lock().unwrap().get(vppb_id).copied()
    }

    pub fn bound_port(&self, vppb_id: usize) -> Option<PortId> {
        match self.bind_status(vppb_id) {
            Some(BindState::Bound(port)) => Some(port),
            _ => None,
        }
    }

    pub fn bound_count(&self) -> usize {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|s| matches!(s, BindState::Bound(_)))
            .count()
    }

    /// Binds `vppb_id` to the DSP at `port_id`: mark `Binding`, update the
    /// routing table, then mark `Bound`.
    pub fn bind(&self, port_id: PortId, vppb_id: usize) -> Result<(), CxlError> {
        let port = self
            .ports
            .get(port_id)
            .ok_or(CxlError::PortTypeMismatch { port: port_id })?;
        if port.port_type != PortType::Dsp {
            return Err(CxlError::PortTypeMismatch { port: port_id });
        }

        let mut states = self.states.lock().unwrap();
        let state = states
            .get(vppb_id)
            .copied()
            .ok_or(CxlError::VppbOutOfRange {
                index: vppb_id,
                counts: states.len(),
            })?;
        if matches!(state, BindState::Bound(_)) {
            return Err(CxlError::AlreadyBound(vppb_id));
        }
        if states
            .iter()
            .any(|s| matches!(s, BindState::Bound(p) if *p == port_id))
        {
            return Err(CxlError::PortAlreadyBound(port_id));
        }

        states[vppb_id] = BindState::Binding;
        debug!("vppb {vppb_id}: binding to physical port {port_id}");
        self.routing_table.set_target(vppb_id, port_id);
        self.routing_table.activate(vppb_id);
        states[vppb_id] = BindState::Bound(port_id);
        info!("vppb {vppb_id}: bound to physical port {port_id}");
        Ok(())
    }

    /// Unbinds `vppb_id`, draining any CXL.io request already sitting in
    /// the old DSP's inbound queue into a synthesized Unsupported-Request
    /// completion, and dropping any CXL.mem/CXL.cache traffic found there.
    pub fn unbind(&self, vppb_id: usize) -> Result<(), CxlError> {
        let mut states = self.states.lock().unwrap();
        let port_id = match states.get(vppb_id) {
            Some(BindState::Bound(port)) => *port,
            Some(_) => return Err(CxlError::NotBound(vppb_id)),
            None => {
                return Err(CxlError::VppbOutOfRange {
                    index: vppb_id,
                    counts: states.len(),
                })
            }
        };

        states[vppb_id] = BindState::Unbinding;
        debug!("vppb {vppb_id}: unbinding from physical port {port_id}");
        // Step (2): stop new packets from matching this vppb immediately.
        self.routing_table.deactivate(vppb_id);

        if let Some(port) = self.ports.get(port_id) {
            self.drain_in_flight(&port.connection);
        }

        states[vppb_id] = BindState::Unbound;
        info!("vppb {vppb_id}: unbound from physical port {port_id}");
        Ok(())
    }

    fn drain_in_flight(&self, port: &CxlConnection) {
        while let Some(item) = port.host_to_target_rx.io.try_recv() {
            match item {
                FifoItem::Packet(packet) => {
                    warn!("draining in-flight CXL.io packet for unbound vppb, synthesizing UR");
                    let ur = ur_completion(&packet);
                    let _ = self.upstream.target_to_host_tx.io.send_packet(ur);
                }
                FifoItem::Closed => break,
            }
        }
        while port.host_to_target_rx.mem.try_recv().is_some() {
            warn!("dropping in-flight CXL.mem packet for unbound vppb");
        }
        while port.host_to_target_rx.cache.try_recv().is_some() {
            warn!("dropping in-flight CXL.cache packet for unbound vppb");
        }
    }
}

fn ur_completion(request: &Packet) -> Packet {
    Packet::CxlIoCompletion(CxlIoCompletion {
        ld_id: request.ld_id(),
        tag: request.tag(),
        status: CXL_IO_STATUS_UR,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::CxlIoCfgRd;

    fn new_binder(vppb_count: usize, ports: Vec<PhysicalPort>) -> (Arc<RoutingTable>, PortBinder) {
        let table = Arc::new(RoutingTable::new(vppb_count));
        let upstream = Arc::new(CxlConnection::new());
        let binder = PortBinder::new(table.clone(), Arc::new(ports), upstream, vppb_count);
        (table, binder)
    }

    fn dsp() -> PhysicalPort {
        PhysicalPort {
            port_type: PortType::Dsp,
            connection: Arc::new(CxlConnection::new()),
        }
    }

    #[test]
    fn bind_then_unbind_round_trips_state() {
        let (table, binder) = new_binder(1, vec![dsp()]);
        assert_eq!(binder.bind_status(0), Some(BindState::Unbound));
        binder.bind(0, 0).unwrap();
        assert_eq!(binder.bind_status(0), Some(BindState::Bound(0)));
        assert_eq!(table.lookup(0), Some(0));
        assert_eq!(binder.bound_count(), 1);

        binder.unbind(0).unwrap();
        assert_eq!(binder.bind_status(0), Some(BindState::Unbound));
        assert_eq!(table.lookup(0), None);
        assert_eq!(binder.bound_count(), 0);
    }

    #[test]
    fn double_bind_is_rejected() {
        let (_table, binder) = new_binder(1, vec![dsp()]);
        binder.bind(0, 0).unwrap();
        assert!(matches!(binder.bind(0, 0), Err(CxlError::AlreadyBound(0))));
    }

    #[test]
    fn binding_same_port_to_two_vppbs_is_rejected() {
        let (_table, binder) = new_binder(2, vec![dsp()]);
        binder.bind(0, 0).unwrap();
        assert!(matches!(
            binder.bind(0, 1),
            Err(CxlError::PortAlreadyBound(0))
        ));
        assert_eq!(binder.bind_status(1), Some(BindState::Unbound));
    }

    #[test]
    fn unbind_without_bind_is_rejected() {
        let (_table, binder) = new_binder(1, vec![dsp()]);
        assert!(matches!(binder.unbind(0), Err(CxlError::NotBound(0))));
    }

    #[test]
    fn binding_to_usp_port_is_rejected() {
        let usp = PhysicalPort {
            port_type: PortType::Usp,
            connection: Arc::new(CxlConnection::new()),
        };
        let (_table, binder) = new_binder(1, vec![usp]);
        assert!(matches!(
            binder.bind(0, 0),
            Err(CxlError::PortTypeMismatch { port: 0 })
        ));
    }

    #[test]
    fn unbind_drains_in_flight_io_packet_into_ur_completion() {
        let (_table, binder) = new_binder(1, vec![dsp()]);
        binder.bind(0, 0).unwrap();
        let port_conn = binder.ports[0].connection.clone();
        port_conn
            .host_to_target_tx
            .io
            .send_packet(Packet::CxlIoCfgRd(CxlIoCfgRd {
                ld_id: 0,
                tag: 5,
                bus: 0,
                device: 0,
                function: 0,
                register: 0,
            }))
            .unwrap();

        binder.unbind(0).unwrap();

        let reply = binder.upstream.target_to_host_rx.io.recv().unwrap();
        match reply {
            FifoItem::Packet(Packet::CxlIoCompletion(c)) => {
                assert_eq!(c.tag, 5);
                assert_eq!(c.status, CXL_IO_STATUS_UR);
            }
            other => panic!("expected UR completion, got {other:?}"),
        }
    }
}
