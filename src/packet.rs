//! Wire-level packet model for the four CXL traffic classes plus CCI
//! control messages.
//!
//! Every packet starts with a 7 byte common prefix: `length: u16`,
//! `payload_type: u8`, `ld_id: u8`, `opcode: u16`, `tag: u8`, all
//! little-endian. `length` covers the whole packet, header included. Class
//! specific fields follow the prefix.

use nom::bytes::streaming::take;
use nom::number::streaming::{le_u16, le_u32, le_u64, u8 as nom_u8};
use nom::sequence::tuple;
use nom::IResult;

use crate::error::ParseError;

pub const HEADER_LEN: usize = 7;

pub const CCI_OPCODE_GET_LD_INFO: u16 = 0x5400;
pub const CCI_OPCODE_GET_LD_ALLOCATIONS: u16 = 0x5401;
pub const CCI_OPCODE_SET_LD_ALLOCATIONS: u16 = 0x5402;
/// Internal-only wire marker for the Set LD Allocations *response* half of
/// the 0x5402 exchange. Real CXL reuses one opcode for request and
/// response and relies on channel direction to disambiguate; this codec
/// has no notion of direction once a packet is in hand and the round-trip
/// law must hold for both halves independently, so the response is tagged
/// with a private opcode the same way the generic `CciRequest`/
/// `CciResponse` pair already is (0x0030 / 0x0031 below).
const CCI_OPCODE_SET_LD_ALLOCATIONS_RESPONSE: u16 = 0x5403;

/// CXL.io completion status used whenever the fabric has no coherent
/// target for a request (a router lookup miss on CXL.io produces an
/// Unsupported-Request completion).
pub const CXL_IO_STATUS_UR: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    Io = 0,
    Mem = 1,
    Cache = 2,
    Cci = 3,
}

impl PayloadType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PayloadType::Io),
            1 => Some(PayloadType::Mem),
            2 => Some(PayloadType::Cache),
            3 => Some(PayloadType::Cci),
            _ => None,
        }
    }
}

/// nom's streaming number/byte-string parsers report a short buffer as
/// `Err(Incomplete)` rather than panicking or reading out of bounds; this
/// turns that (or any other combinator failure) into the crate's own
/// `ParseError::TruncatedPacket`, the only way a fixed-header class parser
/// can fail short of an unknown opcode.
fn to_parse_error(input: &[u8], e: nom::Err<nom::error::Error<&[u8]>>) -> ParseError {
    let needed = match e {
        nom::Err::Incomplete(nom::Needed::Size(n)) => input.len() + n,
        _ => input.len() + 1,
    };
    ParseError::TruncatedPacket {
        needed,
        have: input.len(),
    }
}

/// Runs a nom parser over `input`, keeping the unconsumed remainder for a
/// following variable-length `take`.
fn step<'a, T>(
    input: &'a [u8],
    result: IResult<&'a [u8], T>,
) -> Result<(&'a [u8], T), ParseError> {
    result.map_err(|e| to_parse_error(input, e))
}

/// Runs a nom parser over `input` and discards whatever is left over; used
/// for a message's last field, where trailing bytes (if any) are ignored.
fn finish<'a, T>(input: &'a [u8], result: IResult<&'a [u8], T>) -> Result<T, ParseError> {
    step(input, result).map(|(_, v)| v)
}

/// The 7 byte prefix shared by every packet on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Prefix {
    length: u16,
    payload_type: u8,
    ld_id: u8,
    opcode: u16,
    tag: u8,
}

impl Prefix {
    fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        let (length, payload_type, ld_id, opcode, tag) = finish(
            buf,
            tuple((le_u16, nom_u8, nom_u8, le_u16, nom_u8))(buf),
        )?;
        Ok(Prefix {
            length,
            payload_type,
            ld_id,
            opcode,
            tag,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.length.to_le_bytes());
        out.push(self.payload_type);
        out.push(self.ld_id);
        out.extend_from_slice(&self.opcode.to_le_bytes());
        out.push(self.tag);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlIoCfgRd {
    pub ld_id: u8,
    pub tag: u8,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub register: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlIoCfgWr {
    pub ld_id: u8,
    pub tag: u8,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub register: u16,
    pub data: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlIoMemRd {
    pub ld_id: u8,
    pub tag: u8,
    pub address: u64,
    pub length: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlIoMemWr {
    pub ld_id: u8,
    pub tag: u8,
    pub address: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlIoCompletion {
    pub ld_id: u8,
    pub tag: u8,
    pub status: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlIoCompletionWithData {
    pub ld_id: u8,
    pub tag: u8,
    pub status: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlMemRead {
    pub ld_id: u8,
    pub tag: u8,
    pub address: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlMemReadData {
    pub ld_id: u8,
    pub tag: u8,
    pub data: Vec<u8>,
    pub bi_enable: bool,
    pub bi_forward: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlMemWrite {
    pub ld_id: u8,
    pub tag: u8,
    pub address: u64,
    pub data: Vec<u8>,
    pub bi_enable: bool,
    pub bi_forward: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlMemWriteAck {
    pub ld_id: u8,
    pub tag: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlMemBiSnp {
    pub ld_id: u8,
    pub tag: u8,
    pub address: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlMemBiRsp {
    pub ld_id: u8,
    pub tag: u8,
    pub bi_enable: bool,
    pub bi_forward: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlCacheReq {
    pub ld_id: u8,
    pub tag: u8,
    pub snoop_id: u16,
    pub address: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxlCacheRsp {
    pub ld_id: u8,
    pub tag: u8,
    pub snoop_id: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CciRequest {
    pub ld_id: u8,
    pub tag: u8,
    pub opcode: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CciResponse {
    pub ld_id: u8,
    pub tag: u8,
    pub return_code: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetLdInfoRequest {
    pub ld_id: u8,
    pub tag: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetLdInfoResponse {
    pub ld_id: u8,
    pub tag: u8,
    pub memory_size: u64,
    pub ld_count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetLdAllocationsRequest {
    pub ld_id: u8,
    pub tag: u8,
    pub start_ld_id: u8,
    pub ld_allocation_list_limit: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetLdAllocationsResponse {
    pub ld_id: u8,
    pub tag: u8,
    pub number_of_lds: u8,
    pub memory_granularity: u8,
    pub start_ld_id: u8,
    pub ld_allocation_list: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetLdAllocationsRequest {
    pub ld_id: u8,
    pub tag: u8,
    pub start_ld_id: u8,
    /// One requested-unit byte per LD; the wire form is opaque and carries
    /// no structure beyond that.
    pub ld_allocation_list: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetLdAllocationsResponse {
    pub ld_id: u8,
    pub tag: u8,
    /// Count of LDs whose grant was a non-no-op update. Can be smaller
    /// than `ld_allocation_list.len()` when some requests grant zero
    /// units.
    pub number_of_lds: u8,
    pub start_ld_id: u8,
    pub ld_allocation_list: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    CxlIoCfgRd(CxlIoCfgRd),
    CxlIoCfgWr(CxlIoCfgWr),
    CxlIoMemRd(CxlIoMemRd),
    CxlIoMemWr(CxlIoMemWr),
    CxlIoCompletion(CxlIoCompletion),
    CxlIoCompletionWithData(CxlIoCompletionWithData),
    CxlMemRead(CxlMemRead),
    CxlMemReadData(CxlMemReadData),
    CxlMemWrite(CxlMemWrite),
    CxlMemWriteAck(CxlMemWriteAck),
    CxlMemBiSnp(CxlMemBiSnp),
    CxlMemBiRsp(CxlMemBiRsp),
    CxlCacheReq(CxlCacheReq),
    CxlCacheRsp(CxlCacheRsp),
    CciRequest(CciRequest),
    CciResponse(CciResponse),
    GetLdInfoRequest(GetLdInfoRequest),
    GetLdInfoResponse(GetLdInfoResponse),
    GetLdAllocationsRequest(GetLdAllocationsRequest),
    GetLdAllocationsResponse(GetLdAllocationsResponse),
    SetLdAllocationsRequest(SetLdAllocationsRequest),
    SetLdAllocationsResponse(SetLdAllocationsResponse),
}

// Opcodes for the non-CCI classes. These are internal to this crate; they
// only need to be distinct within their payload_type.
mod opcode {
    pub const IO_CFG_RD: u16 = 0x0001;
    pub const IO_CFG_WR: u16 = 0x0002;
    pub const IO_MEM_RD: u16 = 0x0003;
    pub const IO_MEM_WR: u16 = 0x0004;
    pub const IO_COMPLETION: u16 = 0x0005;
    pub const IO_COMPLETION_DATA: u16 = 0x0006;

    pub const MEM_READ: u16 = 0x0010;
    pub const MEM_READ_DATA: u16 = 0x0011;
    pub const MEM_WRITE: u16 = 0x0012;
    pub const MEM_WRITE_ACK: u16 = 0x0013;
    pub const MEM_BI_SNP: u16 = 0x0014;
    pub const MEM_BI_RSP: u16 = 0x0015;

    pub const CACHE_REQ: u16 = 0x0020;
    pub const CACHE_RSP: u16 = 0x0021;

    pub const CCI_REQUEST: u16 = 0x0030;
    pub const CCI_RESPONSE: u16 = 0x0031;
}

impl Packet {
    pub fn ld_id(&self) -> u8 {
        use Packet::*;
        match self {
            CxlIoCfgRd(p) => p.ld_id,
            CxlIoCfgWr(p) => p.ld_id,
            CxlIoMemRd(p) => p.ld_id,
            CxlIoMemWr(p) => p.ld_id,
            CxlIoCompletion(p) => p.ld_id,
            CxlIoCompletionWithData(p) => p.ld_id,
            CxlMemRead(p) => p.ld_id,
            CxlMemReadData(p) => p.ld_id,
            CxlMemWrite(p) => p.ld_id,
            CxlMemWriteAck(p) => p.ld_id,
            CxlMemBiSnp(p) => p.ld_id,
            CxlMemBiRsp(p) => p.ld_id,
            CxlCacheReq(p) => p.ld_id,
            CxlCacheRsp(p) => p.ld_id,
            CciRequest(p) => p.ld_id,
            CciResponse(p) => p.ld_id,
            GetLdInfoRequest(p) => p.ld_id,
            GetLdInfoResponse(p) => p.ld_id,
            GetLdAllocationsRequest(p) => p.ld_id,
            GetLdAllocationsResponse(p) => p.ld_id,
            SetLdAllocationsRequest(p) => p.ld_id,
            SetLdAllocationsResponse(p) => p.ld_id,
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        use Packet::*;
        match self {
            CxlIoCfgRd(_) | CxlIoCfgWr(_) | CxlIoMemRd(_) | CxlIoMemWr(_) | CxlIoCompletion(_)
            | CxlIoCompletionWithData(_) => PayloadType::Io,
            CxlMemRead(_) | CxlMemReadData(_) | CxlMemWrite(_) | CxlMemWriteAck(_)
            | CxlMemBiSnp(_) | CxlMemBiRsp(_) => PayloadType::Mem,
            CxlCacheReq(_) | CxlCacheRsp(_) => PayloadType::Cache,
            CciRequest(_) | CciResponse(_) | GetLdInfoRequest(_) | GetLdInfoResponse(_)
            | GetLdAllocationsRequest(_) | GetLdAllocationsResponse(_)
            | SetLdAllocationsRequest(_) | SetLdAllocationsResponse(_) => PayloadType::Cci,
        }
    }

    /// Parses a single packet out of `buf`, which must hold exactly one
    /// frame (the caller, `PacketReader`, is responsible for slicing the
    /// stream at `length` boundaries).
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        let prefix = Prefix::parse(buf)?;
        if prefix.length as usize != buf.len() {
            return Err(ParseError::InvalidLength(prefix.length as usize));
        }
        let payload_type = PayloadType::from_u8(prefix.payload_type)
            .ok_or(ParseError::UnknownOpcode(prefix.opcode))?;
        let body = &buf[HEADER_LEN..];

        match payload_type {
            PayloadType::Io => parse_io(&prefix, body),
            PayloadType::Mem => parse_mem(&prefix, body),
            PayloadType::Cache => parse_cache(&prefix, body),
            PayloadType::Cci => parse_cci(&prefix, body),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let (payload_type, opcode) = self.write_body(&mut body);
        let prefix = Prefix {
            length: (HEADER_LEN + body.len()) as u16,
            payload_type: payload_type as u8,
            ld_id: self.ld_id(),
            opcode,
            tag: self.tag(),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        prefix.write(&mut out);
        out.extend_from_slice(&body);
        out
    }

    pub(crate) fn tag(&self) -> u8 {
        use Packet::*;
        match self {
            CxlIoCfgRd(p) => p.tag,
            CxlIoCfgWr(p) => p.tag,
            CxlIoMemRd(p) => p.tag,
            CxlIoMemWr(p) => p.tag,
            CxlIoCompletion(p) => p.tag,
            CxlIoCompletionWithData(p) => p.tag,
            CxlMemRead(p) => p.tag,
            CxlMemReadData(p) => p.tag,
            CxlMemWrite(p) => p.tag,
            CxlMemWriteAck(p) => p.tag,
            CxlMemBiSnp(p) => p.tag,
            CxlMemBiRsp(p) => p.tag,
            CxlCacheReq(p) => p.tag,
            CxlCacheRsp(p) => p.tag,
            CciRequest(p) => p.tag,
            CciResponse(p) => p.tag,
            GetLdInfoRequest(p) => p.tag,
            GetLdInfoResponse(p) => p.tag,
            GetLdAllocationsRequest(p) => p.tag,
            GetLdAllocationsResponse(p) => p.tag,
            SetLdAllocationsRequest(p) => p.tag,
            SetLdAllocationsResponse(p) => p.tag,
        }
    }

    fn write_body(&self, out: &mut Vec<u8>) -> (PayloadType, u16) {
        use Packet::*;
        match self {
            CxlIoCfgRd(p) => {
                out.push(p.bus);
                out.push(p.device);
                out.push(p.function);
                out.extend_from_slice(&p.register.to_le_bytes());
                (PayloadType::Io, opcode::IO_CFG_RD)
            }
            CxlIoCfgWr(p) => {
                out.push(p.bus);
                out.push(p.device);
                out.push(p.function);
                out.extend_from_slice(&p.register.to_le_bytes());
                out.extend_from_slice(&p.data.to_le_bytes());
                (PayloadType::Io, opcode::IO_CFG_WR)
            }
            CxlIoMemRd(p) => {
                out.extend_from_slice(&p.address.to_le_bytes());
                out.extend_from_slice(&p.length.to_le_bytes());
                (PayloadType::Io, opcode::IO_MEM_RD)
            }
            CxlIoMemWr(p) => {
                out.extend_from_slice(&p.address.to_le_bytes());
                out.extend_from_slice(&(p.data.len() as u16).to_le_bytes());
                out.extend_from_slice(&p.data);
                (PayloadType::Io, opcode::IO_MEM_WR)
            }
            CxlIoCompletion(p) => {
                out.push(p.status);
                (PayloadType::Io, opcode::IO_COMPLETION)
            }
            CxlIoCompletionWithData(p) => {
                out.push(p.status);
                out.extend_from_slice(&(p.data.len() as u16).to_le_bytes());
                out.extend_from_slice(&p.data);
                (PayloadType::Io, opcode::IO_COMPLETION_DATA)
            }
            CxlMemRead(p) => {
                out.extend_from_slice(&p.address.to_le_bytes());
                (PayloadType::Mem, opcode::MEM_READ)
            }
            CxlMemReadData(p) => {
                out.push((p.bi_enable as u8) | ((p.bi_forward as u8) << 1));
                out.extend_from_slice(&(p.data.len() as u16).to_le_bytes());
                out.extend_from_slice(&p.data);
                (PayloadType::Mem, opcode::MEM_READ_DATA)
            }
            CxlMemWrite(p) => {
                out.extend_from_slice(&p.address.to_le_bytes());
                out.push((p.bi_enable as u8) | ((p.bi_forward as u8) << 1));
                out.extend_from_slice(&(p.data.len() as u16).to_le_bytes());
                out.extend_from_slice(&p.data);
                (PayloadType::Mem, opcode::MEM_WRITE)
            }
            CxlMemWriteAck(_) => (PayloadType::Mem, opcode::MEM_WRITE_ACK),
            CxlMemBiSnp(p) => {
                out.extend_from_slice(&p.address.to_le_bytes());
                (PayloadType::Mem, opcode::MEM_BI_SNP)
            }
            CxlMemBiRsp(p) => {
                out.push((p.bi_enable as u8) | ((p.bi_forward as u8) << 1));
                (PayloadType::Mem, opcode::MEM_BI_RSP)
            }
            CxlCacheReq(p) => {
                out.extend_from_slice(&p.snoop_id.to_le_bytes());
                out.extend_from_slice(&p.address.to_le_bytes());
                (PayloadType::Cache, opcode::CACHE_REQ)
            }
            CxlCacheRsp(p) => {
                out.extend_from_slice(&p.snoop_id.to_le_bytes());
                out.extend_from_slice(&(p.data.len() as u16).to_le_bytes());
                out.extend_from_slice(&p.data);
                (PayloadType::Cache, opcode::CACHE_RSP)
            }
            CciRequest(p) => {
                out.extend_from_slice(&p.payload);
                (PayloadType::Cci, p.opcode)
            }
            CciResponse(p) => {
                out.extend_from_slice(&p.return_code.to_le_bytes());
                out.extend_from_slice(&p.payload);
                (PayloadType::Cci, opcode::CCI_RESPONSE)
            }
            GetLdInfoRequest(_) => (PayloadType::Cci, CCI_OPCODE_GET_LD_INFO),
            GetLdInfoResponse(p) => {
                out.extend_from_slice(&p.memory_size.to_le_bytes());
                out.push(p.ld_count);
                (PayloadType::Cci, CCI_OPCODE_GET_LD_INFO)
            }
            GetLdAllocationsRequest(p) => {
                out.push(p.start_ld_id);
                out.push(p.ld_allocation_list_limit);
                (PayloadType::Cci, CCI_OPCODE_GET_LD_ALLOCATIONS)
            }
            GetLdAllocationsResponse(p) => {
                out.push(p.number_of_lds);
                out.push(p.memory_granularity);
                out.push(p.start_ld_id);
                out.push(p.ld_allocation_list.len() as u8);
                out.extend_from_slice(&p.ld_allocation_list);
                (PayloadType::Cci, CCI_OPCODE_GET_LD_ALLOCATIONS)
            }
            SetLdAllocationsRequest(p) => {
                out.push(p.ld_allocation_list.len() as u8);
                out.push(p.start_ld_id);
                out.extend_from_slice(&[0u8, 0u8]);
                out.extend_from_slice(&p.ld_allocation_list);
                (PayloadType::Cci, CCI_OPCODE_SET_LD_ALLOCATIONS)
            }
            SetLdAllocationsResponse(p) => {
                out.push(p.number_of_lds);
                out.push(p.start_ld_id);
                out.extend_from_slice(&[0u8, 0u8]);
                out.push(p.ld_allocation_list.len() as u8);
                out.extend_from_slice(&p.ld_allocation_list);
                (PayloadType::Cci, CCI_OPCODE_SET_LD_ALLOCATIONS_RESPONSE)
            }
        }
    }
}

fn parse_io(prefix: &Prefix, body: &[u8]) -> Result<Packet, ParseError> {
    let (ld_id, tag) = (prefix.ld_id, prefix.tag);
    Ok(match prefix.opcode {
        opcode::IO_CFG_RD => {
            let (bus, device, function, register) =
                finish(body, tuple((nom_u8, nom_u8, nom_u8, le_u16))(body))?;
            Packet::CxlIoCfgRd(CxlIoCfgRd {
                ld_id,
                tag,
                bus,
                device,
                function,
                register,
            })
        }
        opcode::IO_CFG_WR => {
            let (bus, device, function, register, data) = finish(
                body,
                tuple((nom_u8, nom_u8, nom_u8, le_u16, le_u32))(body),
            )?;
            Packet::CxlIoCfgWr(CxlIoCfgWr {
                ld_id,
                tag,
                bus,
                device,
                function,
                register,
                data,
            })
        }
        opcode::IO_MEM_RD => {
            let (address, length) = finish(body, tuple((le_u64, le_u16))(body))?;
            Packet::CxlIoMemRd(CxlIoMemRd {
                ld_id,
                tag,
                address,
                length,
            })
        }
        opcode::IO_MEM_WR => {
            let (rest, (address, len)) = step(body, tuple((le_u64, le_u16))(body))?;
            let data = finish(rest, take(len as usize)(rest))?;
            Packet::CxlIoMemWr(CxlIoMemWr {
                ld_id,
                tag,
                address,
                data: data.to_vec(),
            })
        }
        opcode::IO_COMPLETION => {
            let status = finish(body, nom_u8(body))?;
            Packet::CxlIoCompletion(CxlIoCompletion { ld_id, tag, status })
        }
        opcode::IO_COMPLETION_DATA => {
            let (rest, (status, len)) = step(body, tuple((nom_u8, le_u16))(body))?;
            let data = finish(rest, take(len as usize)(rest))?;
            Packet::CxlIoCompletionWithData(CxlIoCompletionWithData {
                ld_id,
                tag,
                status,
                data: data.to_vec(),
            })
        }
        other => return Err(ParseError::UnknownOpcode(other)),
    })
}

fn parse_mem(prefix: &Prefix, body: &[u8]) -> Result<Packet, ParseError> {
    let (ld_id, tag) = (prefix.ld_id, prefix.tag);
    Ok(match prefix.opcode {
        opcode::MEM_READ => {
            let address = finish(body, le_u64(body))?;
            Packet::CxlMemRead(CxlMemRead { ld_id, tag, address })
        }
        opcode::MEM_READ_DATA => {
            let (rest, (flags, len)) = step(body, tuple((nom_u8, le_u16))(body))?;
            let data = finish(rest, take(len as usize)(rest))?;
            Packet::CxlMemReadData(CxlMemReadData {
                ld_id,
                tag,
                bi_enable: flags & 0x1 != 0,
                bi_forward: flags & 0x2 != 0,
                data: data.to_vec(),
            })
        }
        opcode::MEM_WRITE => {
            let (rest, (address, flags, len)) =
                step(body, tuple((le_u64, nom_u8, le_u16))(body))?;
            let data = finish(rest, take(len as usize)(rest))?;
            Packet::CxlMemWrite(CxlMemWrite {
                ld_id,
                tag,
                address,
                bi_enable: flags & 0x1 != 0,
                bi_forward: flags & 0x2 != 0,
                data: data.to_vec(),
            })
        }
        opcode::MEM_WRITE_ACK => Packet::CxlMemWriteAck(CxlMemWriteAck { ld_id, tag }),
        opcode::MEM_BI_SNP => {
            let address = finish(body, le_u64(body))?;
            Packet::CxlMemBiSnp(CxlMemBiSnp { ld_id, tag, address })
        }
        opcode::MEM_BI_RSP => {
            let flags = finish(body, nom_u8(body))?;
            Packet::CxlMemBiRsp(CxlMemBiRsp {
                ld_id,
                tag,
                bi_enable: flags & 0x1 != 0,
                bi_forward: flags & 0x2 != 0,
            })
        }
        other => return Err(ParseError::UnknownOpcode(other)),
    })
}

fn parse_cache(prefix: &Prefix, body: &[u8]) -> Result<Packet, ParseError> {
    let (ld_id, tag) = (prefix.ld_id, prefix.tag);
    Ok(match prefix.opcode {
        opcode::CACHE_REQ => {
            let (snoop_id, address) = finish(body, tuple((le_u16, le_u64))(body))?;
            Packet::CxlCacheReq(CxlCacheReq {
                ld_id,
                tag,
                snoop_id,
                address,
            })
        }
        opcode::CACHE_RSP => {
            let (rest, (snoop_id, len)) = step(body, tuple((le_u16, le_u16))(body))?;
            let data = finish(rest, take(len as usize)(rest))?;
            Packet::CxlCacheRsp(CxlCacheRsp {
                ld_id,
                tag,
                snoop_id,
                data: data.to_vec(),
            })
        }
        other => return Err(ParseError::UnknownOpcode(other)),
    })
}

fn parse_cci(prefix: &Prefix, body: &[u8]) -> Result<Packet, ParseError> {
    let (ld_id, tag) = (prefix.ld_id, prefix.tag);
    match prefix.opcode {
        CCI_OPCODE_GET_LD_INFO => {
            if body.is_empty() {
                Ok(Packet::GetLdInfoRequest(GetLdInfoRequest { ld_id, tag }))
            } else {
                let (memory_size, ld_count) = finish(body, tuple((le_u64, nom_u8))(body))?;
                Ok(Packet::GetLdInfoResponse(GetLdInfoResponse {
                    ld_id,
                    tag,
                    memory_size,
                    ld_count,
                }))
            }
        }
        CCI_OPCODE_GET_LD_ALLOCATIONS => {
            if body.len() == 2 {
                let (start_ld_id, ld_allocation_list_limit) =
                    finish(body, tuple((nom_u8, nom_u8))(body))?;
                Ok(Packet::GetLdAllocationsRequest(GetLdAllocationsRequest {
                    ld_id,
                    tag,
                    start_ld_id,
                    ld_allocation_list_limit,
                }))
            } else {
                let (rest, (number_of_lds, memory_granularity, start_ld_id, list_len)) = step(
                    body,
                    tuple((nom_u8, nom_u8, nom_u8, nom_u8))(body),
                )?;
                let list = finish(rest, take(list_len as usize)(rest))?;
                Ok(Packet::GetLdAllocationsResponse(GetLdAllocationsResponse {
                    ld_id,
                    tag,
                    number_of_lds,
                    memory_granularity,
                    start_ld_id,
                    ld_allocation_list: list.to_vec(),
                }))
            }
        }
        CCI_OPCODE_SET_LD_ALLOCATIONS => {
            let (rest, (count, start_ld_id, _reserved)) =
                step(body, tuple((nom_u8, nom_u8, le_u16))(body))?;
            let list = finish(rest, take(count as usize)(rest))?;
            Ok(Packet::SetLdAllocationsRequest(SetLdAllocationsRequest {
                ld_id,
                tag,
                start_ld_id,
                ld_allocation_list: list.to_vec(),
            }))
        }
        CCI_OPCODE_SET_LD_ALLOCATIONS_RESPONSE => {
            let (rest, (number_of_lds, start_ld_id, _reserved, list_len)) = step(
                body,
                tuple((nom_u8, nom_u8, le_u16, nom_u8))(body),
            )?;
            let list = finish(rest, take(list_len as usize)(rest))?;
            Ok(Packet::SetLdAllocationsResponse(SetLdAllocationsResponse {
                ld_id,
                tag,
                number_of_lds,
                start_ld_id,
                ld_allocation_list: list.to_vec(),
            }))
        }
        other => {
            if other == opcode::CCI_RESPONSE {
                let (rest, return_code) = step(body, le_u16(body))?;
                Ok(Packet::CciResponse(CciResponse {
                    ld_id,
                    tag,
                    return_code,
                    payload: rest.to_vec(),
                }))
            } else if other == opcode::CCI_REQUEST {
                Ok(Packet::CciRequest(CciRequest {
                    ld_id,
                    tag,
                    opcode: other,
                    payload: body.to_vec(),
                }))
            } else {
                Err(ParseError::UnknownOpcode(other))
            }
        }
    }
}

impl SetLdAllocationsResponse {
    pub fn into_packet(self) -> Packet {
        Packet::SetLdAllocationsResponse(self)
    }
}
