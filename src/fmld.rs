//! Fabric-Manager-to-LD CCI command processor. Handles the three Get/Set
//! LD commands a Fabric Manager issues over the CCI mailbox against an
//! MLD.
//!
//! `memory_granularity` on the wire is a granularity *code*, not a byte
//! count (real CXL encodes 0 => 256 MiB, 1 => 512 MiB, ...); since this
//! fabric fixes every LD's unit to `G` = 256 MiB, the response always
//! reports code `0` (see `DESIGN.md`).

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{info, warn};

use crate::connection::CxlConnection;
use crate::error::CxlError;
use crate::fifo::FifoItem;
use crate::packet::{
    GetLdAllocationsRequest, GetLdAllocationsResponse, GetLdInfoRequest, GetLdInfoResponse,
    Packet, SetLdAllocationsRequest, SetLdAllocationsResponse,
};

/// Granularity code for a fixed 256 MiB unit (real CXL: 0 => 256 MiB).
const MEMORY_GRANULARITY_CODE: u8 = 0;

/// Bytes of memory backing one granted allocation unit (`G`).
pub const MEMORY_UNIT_BYTES: u64 = 256 * 1024 * 1024;

/// Per-LD allocation ledger. Each LD starts with one unallocated unit
/// (`1`); `Set LD Allocations` decrements it as the FM grants units to
/// hosts, `Get LD Allocations` reports which LDs still have a unit free.
pub struct Fmld {
    ld_count: u8,
    ld_dict: Mutex<Vec<u8>>,
}

impl Fmld {
    pub fn new(ld_count: u8) -> Self {
        Fmld {
            ld_count,
            ld_dict: Mutex::new(vec![1; ld_count as usize]),
        }
    }

    pub fn ld_count(&self) -> u8 {
        self.ld_count
    }

    pub fn handle_get_ld_info(&self, req: &GetLdInfoRequest) -> GetLdInfoResponse {
        let memory_size = self.ld_count as u64 * MEMORY_UNIT_BYTES;
        info!("fmld: get ld info -> {} lds, {memory_size} bytes", self.ld_count);
        GetLdInfoResponse {
            ld_id: req.ld_id,
            tag: req.tag,
            memory_size,
            ld_count: self.ld_count,
        }
    }

    /// Reports up to `ld_allocation_list_limit` LDs starting at
    /// `start_ld_id`, stopping the list early at the first allocated
    /// (unavailable) LD.
    pub fn handle_get_ld_allocations(
        &self,
        req: &GetLdAllocationsRequest,
    ) -> Result<GetLdAllocationsResponse, CxlError> {
        let ld_dict = self.ld_dict.lock().unwrap();
        if req.start_ld_id as usize >= ld_dict.len() {
            return Err(CxlError::InvalidLdId(req.start_ld_id));
        }

        let max_len = ld_dict.len() - req.start_ld_id as usize;
        let ld_length = (req.ld_allocation_list_limit as usize).min(max_len);

        let number_of_lds = (0..max_len)
            .filter(|&i| ld_dict[req.start_ld_id as usize + i] == 1)
            .count() as u8;

        let mut ld_allocation_list = Vec::with_capacity(ld_length);
        for i in 0..ld_length {
            match ld_dict[req.start_ld_id as usize + i] {
                1 => ld_allocation_list.push(1),
                0 => break,
                _ => ld_allocation_list.push(0),
            }
        }

        Ok(GetLdAllocationsResponse {
            ld_id: req.ld_id,
            tag: req.tag,
            number_of_lds,
            memory_granularity: MEMORY_GRANULARITY_CODE,
            start_ld_id: req.start_ld_id,
            ld_allocation_list,
        })
    }

    /// Grants up to `ld_allocation_list[i]` units to LD `start_ld_id + i`,
    /// capped by what remains in the ledger, and reports what was actually
    /// granted.
    pub fn handle_set_ld_allocations(
        &self,
        req: &SetLdAllocationsRequest,
    ) -> Result<SetLdAllocationsResponse, CxlError> {
        let mut ld_dict = self.ld_dict.lock().unwrap();
        if req.start_ld_id as usize >= ld_dict.len() {
            return Err(CxlError::InvalidLdId(req.start_ld_id));
        }

        let max_count = ld_dict.len() - req.start_ld_id as usize;
        let count = req.ld_allocation_list.len().min(max_count);

        let mut response_list = Vec::with_capacity(count);
        let mut number_of_lds = 0u8;
        for i in 0..count {
            let idx = req.start_ld_id as usize + i;
            let available = ld_dict[idx];
            let requested = req.ld_allocation_list[i];
            let granted = available.min(requested);
            ld_dict[idx] -= granted;
            if granted != 0 {
                number_of_lds += 1;
            }
            response_list.push(granted);
        }

        Ok(SetLdAllocationsResponse {
            ld_id: req.ld_id,
            tag: req.tag,
            number_of_lds,
            start_ld_id: req.start_ld_id,
            ld_allocation_list: response_list,
        })
    }
}

/// Dispatches one CCI request packet, returning the response to send back
/// upstream. Anything other than the three Get/Set LD commands is not this
/// component's concern and is passed through unchanged.
fn dispatch(fmld: &Fmld, packet: Packet) -> Option<Packet> {
    match packet {
        Packet::GetLdInfoRequest(req) => Some(Packet::GetLdInfoResponse(fmld.handle_get_ld_info(&req))),
        Packet::GetLdAllocationsRequest(req) => match fmld.handle_get_ld_allocations(&req) {
            Ok(resp) => Some(Packet::GetLdAllocationsResponse(resp)),
            Err(e) => {
                warn!("fmld: get ld allocations rejected: {e}");
                None
            }
        },
        Packet::SetLdAllocationsRequest(req) => match fmld.handle_set_ld_allocations(&req) {
            Ok(resp) => Some(resp.into_packet()),
            Err(e) => {
                warn!("fmld: set ld allocations rejected: {e}");
                None
            }
        },
        other => Some(other),
    }
}

/// Runs the FMLD's two directions as one thread pair: FM -> LD command
/// dispatch, and (when `downstream` is set) LD -> FM passthrough of
/// whatever the managed LD puts on its own CCI upstream queue (spec
/// "LD to FM API", currently passthrough only).
pub struct FmldHandles {
    fm_to_target: JoinHandle<()>,
    target_to_fm: Option<JoinHandle<()>>,
}

impl FmldHandles {
    pub fn join(self) {
        let _ = self.fm_to_target.join();
        if let Some(h) = self.target_to_fm {
            let _ = h.join();
        }
    }
}

pub fn spawn(
    fmld: Arc<Fmld>,
    upstream: Arc<CxlConnection>,
    downstream: Option<Arc<CxlConnection>>,
) -> FmldHandles {
    let fm_to_target = {
        let upstream = upstream.clone();
        thread::spawn(move || loop {
            match upstream.host_to_target_rx.cci.recv() {
                Ok(FifoItem::Packet(packet)) => {
                    if let Some(response) = dispatch(&fmld, packet) {
                        let _ = upstream.target_to_host_tx.cci.send_packet(response);
                    }
                }
                Ok(FifoItem::Closed) | Err(_) => break,
            }
        })
    };

    let target_to_fm = downstream.map(|downstream| {
        let upstream = upstream.clone();
        thread::spawn(move || loop {
            match downstream.target_to_host_rx.cci.recv() {
                Ok(FifoItem::Packet(packet)) => {
                    let _ = upstream.target_to_host_tx.cci.send_packet(packet);
                }
                Ok(FifoItem::Closed) | Err(_) => break,
            }
        })
    });

    FmldHandles {
        fm_to_target,
        target_to_fm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(ld_id: u8, tag: u8) -> GetLdInfoRequest {
        GetLdInfoRequest { ld_id, tag }
    }

    #[test]
    fn get_ld_info_reports_fixed_granularity_total() {
        let fmld = Fmld::new(4);
        let resp = fmld.handle_get_ld_info(&req(0, 0));
        assert_eq!(resp.ld_count, 4);
        assert_eq!(resp.memory_size, 4 * MEMORY_UNIT_BYTES);
    }

    #[test]
    fn get_ld_allocations_stops_at_first_allocated_ld() {
        let fmld = Fmld::new(4);
        fmld.ld_dict.lock().unwrap()[1] = 0;
        let resp = fmld
            .handle_get_ld_allocations(&GetLdAllocationsRequest {
                ld_id: 0,
                tag: 0,
                start_ld_id: 0,
                ld_allocation_list_limit: 4,
            })
            .unwrap();
        assert_eq!(resp.number_of_lds, 3);
        assert_eq!(resp.ld_allocation_list, vec![1]);
        assert_eq!(resp.memory_granularity, 0);
    }

    #[test]
    fn get_ld_allocations_rejects_out_of_range_start() {
        let fmld = Fmld::new(2);
        let err = fmld
            .handle_get_ld_allocations(&GetLdAllocationsRequest {
                ld_id: 0,
                tag: 0,
                start_ld_id: 5,
                ld_allocation_list_limit: 1,
            })
            .unwrap_err();
        assert!(matches!(err, CxlError::InvalidLdId(5)));
    }

    #[test]
    fn set_ld_allocations_grants_up_to_what_remains() {
        // Matches the worked scenario: four LDs each with one free unit,
        // a request for [1, 1, 1, 1] grants all four, draining the ledger.
        let fmld = Fmld::new(4);
        let resp = fmld
            .handle_set_ld_allocations(&SetLdAllocationsRequest {
                ld_id: 0,
                tag: 0,
                start_ld_id: 0,
                ld_allocation_list: vec![1, 1, 1, 1],
            })
            .unwrap();
        assert_eq!(resp.ld_allocation_list, vec![1, 1, 1, 1]);
        assert_eq!(resp.number_of_lds, 4);
        assert_eq!(*fmld.ld_dict.lock().unwrap(), vec![0, 0, 0, 0]);

        // A second request against the now-empty ledger grants nothing.
        let resp2 = fmld
            .handle_set_ld_allocations(&SetLdAllocationsRequest {
                ld_id: 0,
                tag: 0,
                start_ld_id: 0,
                ld_allocation_list: vec![1, 1, 1, 1],
            })
            .unwrap();
        assert_eq!(resp2.ld_allocation_list, vec![0, 0, 0, 0]);
        assert_eq!(resp2.number_of_lds, 0);
    }

    #[test]
    fn set_ld_allocations_clamps_each_grant_to_available_units() {
        let fmld = Fmld::new(4);
        let resp = fmld
            .handle_set_ld_allocations(&SetLdAllocationsRequest {
                ld_id: 0,
                tag: 0,
                start_ld_id: 0,
                ld_allocation_list: vec![0, 1, 2],
            })
            .unwrap();
        assert_eq!(resp.ld_allocation_list, vec![0, 1, 1]);
        // The LD 0 grant is min(1, 0) = 0, a no-op; only LDs 1 and 2 count.
        assert_eq!(resp.number_of_lds, 2);
        assert_eq!(*fmld.ld_dict.lock().unwrap(), vec![1, 0, 0, 1]);
    }

    #[test]
    fn set_ld_allocations_clamps_to_available_ledger_range() {
        let fmld = Fmld::new(2);
        let resp = fmld
            .handle_set_ld_allocations(&SetLdAllocationsRequest {
                ld_id: 0,
                tag: 0,
                start_ld_id: 1,
                ld_allocation_list: vec![1, 1, 1],
            })
            .unwrap();
        // Only one LD (index 1) exists from start_ld_id=1, so the extra
        // requested entries are ignored rather than erroring.
        assert_eq!(resp.ld_allocation_list, vec![1]);
    }
}
