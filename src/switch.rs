//! Virtual CXL switch. Composes one upstream vPPB, `N` downstream vPPBs,
//! the three routers, the port binder, the routing table, and an IRQ
//! manager; exposes the Fabric Manager's bind/unbind API.

use std::sync::{Arc, Mutex};

use log::info;

use crate::bind::{PhysicalPort, PortBinder, PortType};
use crate::error::{CxlError, Result};
use crate::hdm::{HdmDecoder, SnoopTable};
use crate::irq::{Irq, IrqManager};
use crate::lifecycle::Lifecycle;
use crate::routing::RoutingTable;
use crate::router::{self, RouterHandles};

/// Omits a separate "bound to physical port" stage: binding here goes
/// straight from vPPB to logical device in one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStatus {
    BindOrUnbindInProgress,
    BoundLd,
    Unbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchUpdateEvent {
    pub vcs_id: u32,
    pub vppb_id: usize,
    pub binding_status: BindingStatus,
}

pub type EventHandler = dyn Fn(SwitchUpdateEvent) + Send + Sync;

pub struct VirtualSwitch {
    id: u32,
    vppb_counts: usize,
    upstream_port_index: usize,
    ports: Arc<Vec<PhysicalPort>>,
    routing_table: Arc<RoutingTable>,
    port_binder: Arc<PortBinder>,
    hdm: Arc<HdmDecoder>,
    snoop: Arc<SnoopTable>,
    irq_manager: Arc<IrqManager>,
    event_handler: Mutex<Option<Box<EventHandler>>>,
    lifecycle: Lifecycle,
    routers: Mutex<Vec<RouterHandles>>,
    bi_enable_override_for_test: Option<bool>,
    bi_forward_override_for_test: Option<bool>,
}

impl VirtualSwitch {
    /// Validates `upstream_port_index`/`initial_bounds` against
    /// `vppb_counts` and the upstream port's type before constructing
    /// anything, so a rejected construction never leaves partial state
    /// behind.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        upstream_port_index: usize,
        vppb_counts: usize,
        initial_bounds: Vec<i64>,
        ports: Vec<PhysicalPort>,
        bi_enable_override_for_test: Option<bool>,
        bi_forward_override_for_test: Option<bool>,
        irq_host: &str,
        irq_port: u16,
    ) -> Result<Arc<Self>> {
        if initial_bounds.len() != vppb_counts {
            return Err(CxlError::VppbOutOfRange {
                index: initial_bounds.len(),
                counts: vppb_counts,
            });
        }
        let upstream_port = ports
            .get(upstream_port_index)
            .ok_or(CxlError::PortTypeMismatch {
                port: upstream_port_index,
            })?;
        if upstream_port.port_type != PortType::Usp {
            return Err(CxlError::PortTypeMismatch {
                port: upstream_port_index,
            });
        }

        let ports = Arc::new(ports);
        let routing_table = Arc::new(RoutingTable::new(vppb_counts));
        let upstream_connection = ports[upstream_port_index].connection.clone();
        let port_binder = Arc::new(PortBinder::new(
            routing_table.clone(),
            ports.clone(),
            upstream_connection,
            vppb_counts,
        ));
        let irq_manager = IrqManager::new(&format!("VCS{id}"), irq_host, irq_port, false, id as u8);

        let switch = Arc::new(VirtualSwitch {
            id,
            vppb_counts,
            upstream_port_index,
            ports,
            routing_table,
            port_binder,
            hdm: Arc::new(HdmDecoder::new()),
            snoop: Arc::new(SnoopTable::new()),
            irq_manager,
            event_handler: Mutex::new(None),
            lifecycle: Lifecycle::new(),
            routers: Mutex::new(Vec::new()),
            bi_enable_override_for_test,
            bi_forward_override_for_test,
        });

        switch.apply_initial_bounds(&initial_bounds)?;
        Ok(switch)
    }

    fn apply_initial_bounds(&self, initial_bounds: &[i64]) -> Result<()> {
        for (vppb_index, &port_index) in initial_bounds.iter().enumerate() {
            if port_index < 0 {
                // Already unbound by construction; nothing to do.
                continue;
            }
            self.bind_vppb(port_index as usize, vppb_index)?;
        }
        Ok(())
    }

    /// Starts the IRQ manager and the three class routers, then transitions
    /// to `Running`. Routers are constructed here, after `initial_bounds`
    /// has already run in `new`.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.lifecycle.mark_starting();
        self.irq_manager.start()?;

        let upstream_connection = self.ports[self.upstream_port_index].connection.clone();

        let io = router::spawn_io_router(
            upstream_connection.clone(),
            self.routing_table.clone(),
            self.ports.clone(),
            self.hdm.clone(),
        );
        let mem = router::spawn_mem_router(
            upstream_connection.clone(),
            self.routing_table.clone(),
            self.ports.clone(),
            self.hdm.clone(),
            self.bi_enable_override_for_test,
            self.bi_forward_override_for_test,
        );
        let cache = router::spawn_cache_router(
            upstream_connection,
            self.routing_table.clone(),
            self.ports.clone(),
            self.snoop.clone(),
        );
        *self.routers.lock().unwrap() = vec![io, mem, cache];

        self.lifecycle.mark_running();
        info!("VCS{}: running", self.id);
        Ok(())
    }

    pub fn stop(&self) {
        self.lifecycle.mark_stopping();
        for router in self.routers.lock().unwrap().drain(..) {
            router.request_stop();
        }
        self.ports[self.upstream_port_index].connection.close();
        for router in std::mem::take(&mut *self.routers.lock().unwrap()) {
            router.join();
        }
        self.irq_manager.stop();
        self.lifecycle.mark_stopped();
    }

    pub fn wait_for_ready(&self) {
        self.lifecycle.wait_for_ready();
    }

    pub fn register_event_handler<F>(&self, handler: F)
    where
        F: Fn(SwitchUpdateEvent) + Send + Sync + 'static,
    {
        *self.event_handler.lock().unwrap() = Some(Box::new(handler));
    }

    fn call_event_handler(&self, vppb_id: usize, binding_status: BindingStatus) {
        if let Some(handler) = self.event_handler.lock().unwrap().as_ref() {
            handler(SwitchUpdateEvent {
                vcs_id: self.id,
                vppb_id,
                binding_status,
            });
        }
    }

    pub fn bind_vppb(&self, port_index: usize, vppb_index: usize) -> Result<()> {
        self.call_event_handler(vppb_index, BindingStatus::BindOrUnbindInProgress);
        self.port_binder.bind(port_index, vppb_index)?;
        self.call_event_handler(vppb_index, BindingStatus::BoundLd);
        Ok(())
    }

    pub fn unbind_vppb(&self, vppb_index: usize) -> Result<()> {
        self.call_event_handler(vppb_index, BindingStatus::BindOrUnbindInProgress);
        self.port_binder.unbind(vppb_index)?;
        self.call_event_handler(vppb_index, BindingStatus::Unbound);
        Ok(())
    }

    pub fn fm_bind_vppb(&self, port_index: usize, vppb_index: usize) -> Result<()> {
        self.bind_vppb(port_index, vppb_index)?;
        self.irq_manager.send_irq_request(Irq::DevAdded, vppb_index)?;
        Ok(())
    }

    pub fn fm_unbind_vppb(&self, vppb_index: usize) -> Result<()> {
        self.unbind_vppb(vppb_index)?;
        self.irq_manager.send_irq_request(Irq::DevRemoved, vppb_index)?;
        Ok(())
    }

    pub fn vppb_counts(&self) -> usize {
        self.vppb_counts
    }

    pub fn bound_vppb_counts(&self) -> usize {
        self.port_binder.bound_count()
    }

    pub fn is_vppb_bound(&self, vppb_index: usize) -> Result<bool> {
        if vppb_index >= self.vppb_counts {
            return Err(CxlError::VppbOutOfRange {
                index: vppb_index,
                counts: self.vppb_counts,
            });
        }
        Ok(self.port_binder.bound_port(vppb_index).is_some())
    }

    pub fn usp_port_id(&self) -> usize {
        self.upstream_port_index
    }

    pub fn bound_port_id(&self, vppb_id: usize) -> Option<usize> {
        self.port_binder.bound_port(vppb_id)
    }

    /// Control-plane entry point for populating the HDM decoder:
    /// associates the address range decoding to `vppb` for the mem/IO-mem
    /// routers.
    pub fn set_hdm_range(&self, base: u64, size: u64, vppb: usize) {
        self.hdm.set_range(base, size, vppb);
    }

    pub fn set_snoop_id(&self, snoop_id: u16, vppb: usize) {
        self.snoop.set(snoop_id, vppb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CxlConnection;

    fn port(port_type: PortType) -> PhysicalPort {
        PhysicalPort {
            port_type,
            connection: Arc::new(CxlConnection::new()),
        }
    }

    #[test]
    fn rejects_non_usp_upstream_port() {
        let ports = vec![port(PortType::Dsp)];
        let err = VirtualSwitch::new(0, 0, 0, vec![], ports, None, None, "127.0.0.1", 0).unwrap_err();
        assert!(matches!(err, CxlError::PortTypeMismatch { port: 0 }));
    }

    #[test]
    fn rejects_mismatched_initial_bounds_length() {
        let ports = vec![port(PortType::Usp), port(PortType::Dsp)];
        let err =
            VirtualSwitch::new(0, 0, 2, vec![-1], ports, None, None, "127.0.0.1", 0).unwrap_err();
        assert!(matches!(err, CxlError::VppbOutOfRange { .. }));
    }

    #[test]
    fn initial_bounds_bind_eagerly() {
        let ports = vec![port(PortType::Usp), port(PortType::Dsp)];
        let switch =
            VirtualSwitch::new(0, 0, 1, vec![1], ports, None, None, "127.0.0.1", 0).unwrap();
        assert!(switch.is_vppb_bound(0).unwrap());
        assert_eq!(switch.bound_port_id(0), Some(1));
    }
}
