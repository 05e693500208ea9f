//! An EtherCAT fieldbus master with a cooperative FSM core.
//!
//! `fieldcat` owns a raw Ethernet device, issues EtherCAT frames carrying one or more datagrams
//! to a ring of slave devices, scans the bus topology, configures each slave's communication
//! primitives (sync managers, FMMUs, mailbox), drives slaves through the application layer state
//! machine (`INIT` → `PRE-OP` → `SAFE-OP` → `OP`) and sustains a cyclic process data exchange
//! that realtime applications bind to through typed domains.
//!
//! # Architecture
//!
//! Nothing in the core blocks and nothing spawns threads: all bus activity is driven by step
//! functions. Discovery, configuration and mailbox protocols (CoE, FoE) are cooperative state
//! machines that advance one transition per tick; the realtime application drives the cyclic
//! path explicitly with paired [`Master::receive`]/[`Master::send`] calls. Timestamps are
//! supplied by the caller in nanoseconds, so the core never touches an OS clock.
//!
//! The NIC boundary is the [`EthernetPort`] trait: driver glue hands complete Ethernet frames in
//! and out, a [`Registry`] maps registered ports to masters, and applications reserve a master
//! with [`Registry::request`].
//!
//! # Example
//!
//! ```no_run
//! use fieldcat::{MasterOptions, Registry};
//! # fn now() -> u64 { 0 }
//! # struct NullPort;
//! # impl fieldcat::EthernetPort for NullPort {
//! #     fn link_state(&self) -> fieldcat::LinkState { fieldcat::LinkState::Up }
//! #     fn transmit(&mut self, _frame: &[u8]) -> Result<(), ()> { Ok(()) }
//! #     fn poll(&mut self, _handler: &mut dyn FnMut(&[u8])) {}
//! # }
//!
//! # fn main() -> Result<(), fieldcat::error::Error> {
//! let mut registry = Registry::new(1);
//!
//! // NIC glue registers the interface...
//! let index = registry.register_port(NullPort, MasterOptions::default())?;
//!
//! // ...the application reserves the master and declares its expectations
//! let mut master = registry.request(index)?;
//!
//! let domain = master.create_domain()?;
//! let config = master.slave_config(0, 0, 0x0000_0002, 0x03ec_3052)?;
//!
//! // Let the background FSM scan and configure the bus
//! for _ in 0..1000 {
//!     master.idle_cycle(now())?;
//! }
//!
//! let offset = master.register_pdo_entry(config, 0x6000, 1, domain)?;
//!
//! master.activate()?;
//!
//! // Cyclic realtime loop
//! loop {
//!     master.receive(now())?;
//!     master.domain_process(domain)?;
//!
//!     let _inputs = master.domain_data(domain)?[offset];
//!
//!     master.domain_queue(domain)?;
//!     master.send(now())?;
//! }
//! # }
//! ```

mod al_control;
mod al_status_code;
mod coe;
mod command;
mod datagram;
mod device;
mod domain;
pub mod error;
mod fmmu;
mod foe;
mod frame;
mod fsm;
mod mailbox;
mod master;
mod pdo;
mod pdu_loop;
mod register;
mod registry;
mod requests;
mod sii;
mod slave;
mod slave_config;
mod slave_state;
mod sync_manager_channel;

pub use al_control::AlControl;
pub use al_status_code::AlStatusCode;
pub use coe::abort::AbortCode;
pub use command::Command;
pub use datagram::{Datagram, DatagramState};
pub use device::{EthernetPort, LinkState};
pub use domain::{DomainHandle, DomainState, WcState};
pub use fmmu::Fmmu;
pub use mailbox::{MailboxHeader, MailboxRegion, MailboxType};
pub use master::{Master, MasterOptions, MasterPhase, MasterState};
pub use pdo::{Pdo, PdoDirection, PdoEntry};
pub use pdu_loop::PduStats;
pub use register::RegisterAddress;
pub use registry::Registry;
pub use requests::{FoeRequestHandle, RegRequestHandle, SiiRequestHandle};
pub use sii::categories::{CoeDetails, MailboxProtocols};
pub use slave::{SdoEntryInfo, SdoInfo, Slave, SlaveIdentity};
pub use slave_config::{
    RequestState, SdoRequestHandle, SlaveConfigHandle, WatchdogMode,
};
pub use slave_state::{AlState, AlStateSet};
pub use sync_manager_channel::SyncManagerChannel;
