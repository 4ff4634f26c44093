/*!
This crate is a software model of a CXL (Compute Express Link) fabric: the
transport, routing, and fabric-management core of a virtual switch that
tunnels CXL.io/mem/cache traffic between hosts and Multi-Logical Devices
(MLDs) over plain sockets.

# Core components

* [`packet`] decodes and encodes the wire format shared by every CXL
  traffic class plus the CCI mailbox used for fabric management.
* [`fifo`] and [`connection`] provide the bounded, per-class queues that
  carry packets between ingress/egress tasks and the routing layer.
* [`framing`]/[`processor`] turn a raw byte stream into framed packets
  demultiplexed onto those queues; [`mld`] does the same for one socket
  shared by several logical devices.
* [`routing`], [`bind`], and [`hdm`] hold the state a virtual switch
  mutates when the Fabric Manager binds or unbinds a vPPB.
* [`router`] forwards packets between the upstream vPPB and whichever DSP
  a vPPB is currently bound to.
* [`fmld`] answers the Get/Set LD Allocations and Get LD Info CCI commands
  an MLD's Fabric-Manager-LD channel exposes.
* [`irq`] is the out-of-band interrupt channel used for device hotplug
  notifications.
* [`switch`] composes all of the above into one virtual switch instance,
  and [`config`] describes the shapes its initial configuration takes.
* [`lifecycle`] gives every long-lived component here the same
  start/ready/stop contract.

Persisting device memory to backing files, parsing the switch's
configuration source, and modeling the endpoint device itself (BAR sizing,
MMIO-backed storage) are outside this crate's scope; see the crate's
design notes for the full list of non-goals.
*/

pub mod bind;
pub mod config;
pub mod connection;
pub mod error;
pub mod fifo;
pub mod fmld;
pub mod framing;
pub mod hdm;
pub mod irq;
pub mod lifecycle;
pub mod mld;
pub mod packet;
pub mod processor;
pub mod router;
pub mod routing;
pub mod switch;

pub use bind::{BindState, PhysicalPort, PortBinder, PortType};
pub use connection::{ClassQueues, CxlConnection};
pub use error::{CxlError, ParseError, Result};
pub use fifo::{Fifo, FifoConsumer, FifoItem, FifoProducer};
pub use fmld::Fmld;
pub use framing::{PacketReader, PacketWriter};
pub use hdm::{HdmDecoder, SnoopTable};
pub use irq::{Irq, IrqManager};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use mld::Mld;
pub use packet::{Packet, PayloadType};
pub use routing::RoutingTable;
pub use switch::{BindingStatus, SwitchUpdateEvent, VirtualSwitch};
