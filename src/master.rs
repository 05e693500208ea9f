//! The EtherCAT master: owner of the device, the slaves, the configs and the domains, and the
//! public realtime API.

use crate::device::{Device, EthernetPort, LinkState};
use crate::domain::{Domain, DomainHandle, DomainState};
use crate::error::{ConfigError, Error, Item};
use crate::fsm::master::{FsmOptions, MasterFsm, attach_configs};
use crate::pdo::PdoDirection;
use crate::pdu_loop::{PduLoop, PduStats};
use crate::requests::{
    FoeRequest, FoeRequestHandle, RegRequest, RegRequestHandle, SiiRequestHandle, SiiWriteRequest,
};
use crate::slave::Slave;
use crate::slave_config::{
    PdoConfig, PdoEntryConfig, RequestDirection, RequestState, SdoConfig, SdoRequest,
    SdoRequestHandle, SlaveConfig, SlaveConfigHandle, SYNC_CONFIG_COUNT, WatchdogMode,
};
use crate::slave_state::AlStateSet;
use crate::sii::word as sii_word;

/// Default timeout for datagrams issued by the background FSM.
const IDLE_PDU_TIMEOUT_NS: u64 = 100_000_000;

/// Lifecycle phase of a master.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum MasterPhase {
    /// No Ethernet device is attached. Masters in a [`Registry`](crate::Registry) slot without a
    /// registered port are in this phase.
    Orphaned,
    /// Device attached, background FSM running, no application has activated the master.
    #[default]
    Idle,
    /// Activated: configuration is frozen and the realtime context owns `send`/`receive`.
    Operation,
}

/// Tunable master behaviour.
#[derive(Debug, Copy, Clone)]
pub struct MasterOptions {
    /// Treat broadcast working counter anomalies (e.g. during address clear) as errors instead
    /// of warnings.
    pub strict_topology: bool,
    /// Fetch CoE object dictionaries in the background once slaves sit in PREOP.
    pub fetch_dictionaries: bool,
    /// Response timeout for background (scan/configuration) datagrams.
    pub pdu_timeout_ns: u64,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            strict_topology: false,
            fetch_dictionaries: true,
            pdu_timeout_ns: IDLE_PDU_TIMEOUT_NS,
        }
    }
}

/// Aggregate bus state published to the realtime application.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MasterState {
    /// Number of slaves that answered the last broadcast probe.
    pub slaves_responding: u16,
    /// OR of all responding slaves' application layer states.
    pub al_states: AlStateSet,
    /// Whether the Ethernet link is up.
    pub link_up: bool,
}

/// The central EtherCAT controller.
///
/// Owns exactly one Ethernet device and everything reachable from it: the discovered slaves, the
/// user-declared slave configs, the process data domains and the datagram machinery. The
/// exclusive `&mut` borrow of this struct is the synchronisation token between the background
/// FSM and the realtime cyclic path: the FSM only runs inside [`send`](Master::send) and
/// [`idle_cycle`](Master::idle_cycle), so FSM and cyclic traffic never interleave within a
/// frame unpredictably.
pub struct Master<P> {
    phase: MasterPhase,
    options: MasterOptions,
    device: Device<P>,
    pdu: PduLoop,
    fsm: MasterFsm,
    slaves: Vec<Slave>,
    configs: Vec<SlaveConfig>,
    domains: Vec<Domain>,
}

impl<P> Master<P>
where
    P: EthernetPort,
{
    /// Create a master owning `port`, in the `Idle` phase.
    pub fn new(port: P, options: MasterOptions) -> Self {
        let mut pdu = PduLoop::new();
        let fsm = MasterFsm::new(&mut pdu);

        Self {
            phase: MasterPhase::Idle,
            options,
            device: Device::new(port),
            pdu,
            fsm,
            slaves: Vec::new(),
            configs: Vec::new(),
            domains: Vec::new(),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> MasterPhase {
        self.phase
    }

    /// Transport statistics.
    pub fn stats(&self) -> PduStats {
        self.pdu.stats()
    }

    /// Aggregate bus state.
    pub fn state(&self) -> MasterState {
        MasterState {
            slaves_responding: self.fsm.slaves_responding,
            al_states: self.fsm.al_states,
            link_up: self.device.link_state() == LinkState::Up,
        }
    }

    /// Number of scanned slaves.
    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    /// Access a scanned slave by ring position.
    pub fn slave(&self, ring_position: u16) -> Option<&Slave> {
        self.slaves
            .iter()
            .find(|slave| slave.ring_position() == ring_position)
    }

    /// Force a bus rescan on the next FSM round, e.g. after clearing a slave error externally.
    pub fn request_rescan(&mut self) {
        self.fsm.request_rescan();
    }

    // ------------------------------------------------------------------
    // Configuration surface (before `activate`)
    // ------------------------------------------------------------------

    /// Allocate a new, empty process data domain.
    pub fn create_domain(&mut self) -> Result<DomainHandle, Error> {
        self.check_phase(MasterPhase::Idle)?;

        let handle = DomainHandle(self.domains.len());

        self.domains.push(Domain::new(handle.0));

        Ok(handle)
    }

    /// Declare (or look up) the expected slave at `(alias, position)`.
    ///
    /// Re-declaring the same address with the same identity returns the existing config;
    /// a mismatched identity fails with [`ConfigError::Conflict`].
    pub fn slave_config(
        &mut self,
        alias: u16,
        position: u16,
        vendor_id: u32,
        product_code: u32,
    ) -> Result<SlaveConfigHandle, Error> {
        self.check_phase(MasterPhase::Idle)?;

        if let Some(existing) = self
            .configs
            .iter()
            .position(|config| config.address() == (alias, position))
        {
            if self.configs[existing].expected_identity() != (vendor_id, product_code) {
                return Err(Error::Config(ConfigError::Conflict));
            }

            return Ok(SlaveConfigHandle(existing));
        }

        let handle = SlaveConfigHandle(self.configs.len());

        self.configs
            .push(SlaveConfig::new(alias, position, vendor_id, product_code));

        // If the bus has been scanned already, try to bind the new config right away so PDO
        // entry registration can resolve against the live slave
        attach_configs(&mut self.slaves, &mut self.configs, false);

        Ok(handle)
    }

    fn config_mut(&mut self, handle: SlaveConfigHandle) -> Result<&mut SlaveConfig, Error> {
        self.configs.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(handle.0),
        })
    }

    /// Shared config accessor.
    pub fn config(&self, handle: SlaveConfigHandle) -> Result<&SlaveConfig, Error> {
        self.configs.get(handle.0).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(handle.0),
        })
    }

    /// Declare the direction and watchdog mode of a sync manager.
    pub fn config_sync_manager(
        &mut self,
        handle: SlaveConfigHandle,
        sync_index: u8,
        direction: PdoDirection,
        watchdog: WatchdogMode,
    ) -> Result<(), Error> {
        self.check_phase(MasterPhase::Idle)?;

        let sync = usize::from(sync_index);

        if sync >= SYNC_CONFIG_COUNT {
            return Err(Error::NotFound {
                item: Item::SyncManager,
                index: Some(sync),
            });
        }

        let config = self.config_mut(handle)?;

        config.sync_configs[sync].direction = Some(direction);
        config.sync_configs[sync].watchdog = watchdog;

        Ok(())
    }

    /// Append a PDO to a sync manager's declared assignment.
    pub fn pdo_assign_add(
        &mut self,
        handle: SlaveConfigHandle,
        sync_index: u8,
        pdo_index: u16,
    ) -> Result<(), Error> {
        self.check_phase(MasterPhase::Idle)?;

        let sync = usize::from(sync_index);

        if sync >= SYNC_CONFIG_COUNT {
            return Err(Error::NotFound {
                item: Item::SyncManager,
                index: Some(sync),
            });
        }

        self.config_mut(handle)?.sync_configs[sync]
            .pdos
            .push(PdoConfig {
                index: pdo_index,
                entries: None,
            });

        Ok(())
    }

    /// Clear a sync manager's declared assignment.
    pub fn pdo_assign_clear(
        &mut self,
        handle: SlaveConfigHandle,
        sync_index: u8,
    ) -> Result<(), Error> {
        self.check_phase(MasterPhase::Idle)?;

        let sync = usize::from(sync_index);

        if sync >= SYNC_CONFIG_COUNT {
            return Err(Error::NotFound {
                item: Item::SyncManager,
                index: Some(sync),
            });
        }

        self.config_mut(handle)?.sync_configs[sync].pdos.clear();

        Ok(())
    }

    /// Append an entry to a declared PDO's mapping, creating the explicit mapping list if the
    /// PDO so far used its default.
    pub fn pdo_mapping_add(
        &mut self,
        handle: SlaveConfigHandle,
        pdo_index: u16,
        entry_index: u16,
        entry_subindex: u8,
        bit_length: u8,
    ) -> Result<(), Error> {
        self.check_phase(MasterPhase::Idle)?;

        let config = self.config_mut(handle)?;

        let pdo = config
            .sync_configs
            .iter_mut()
            .flat_map(|sync| sync.pdos.iter_mut())
            .find(|pdo| pdo.index == pdo_index)
            .ok_or(Error::NotFound {
                item: Item::Pdo,
                index: Some(usize::from(pdo_index)),
            })?;

        pdo.entries.get_or_insert_with(Vec::new).push(PdoEntryConfig {
            index: entry_index,
            subindex: entry_subindex,
            bit_length,
        });

        Ok(())
    }

    /// Reset a declared PDO to an empty explicit mapping.
    pub fn pdo_mapping_clear(
        &mut self,
        handle: SlaveConfigHandle,
        pdo_index: u16,
    ) -> Result<(), Error> {
        self.check_phase(MasterPhase::Idle)?;

        let config = self.config_mut(handle)?;

        let pdo = config
            .sync_configs
            .iter_mut()
            .flat_map(|sync| sync.pdos.iter_mut())
            .find(|pdo| pdo.index == pdo_index)
            .ok_or(Error::NotFound {
                item: Item::Pdo,
                index: Some(usize::from(pdo_index)),
            })?;

        pdo.entries = Some(Vec::new());

        Ok(())
    }

    /// Queue a configuration SDO download, applied on every (re)configuration of the slave.
    pub fn sdo(
        &mut self,
        handle: SlaveConfigHandle,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<(), Error> {
        self.check_phase(MasterPhase::Idle)?;

        self.config_mut(handle)?.sdo_configs.push(SdoConfig {
            index,
            subindex,
            data: data.to_vec(),
        });

        Ok(())
    }

    /// Queue an 8 bit configuration SDO.
    pub fn sdo8(
        &mut self,
        handle: SlaveConfigHandle,
        index: u16,
        subindex: u8,
        value: u8,
    ) -> Result<(), Error> {
        self.sdo(handle, index, subindex, &value.to_le_bytes())
    }

    /// Queue a 16 bit configuration SDO; endianness is corrected for the wire.
    pub fn sdo16(
        &mut self,
        handle: SlaveConfigHandle,
        index: u16,
        subindex: u8,
        value: u16,
    ) -> Result<(), Error> {
        self.sdo(handle, index, subindex, &value.to_le_bytes())
    }

    /// Queue a 32 bit configuration SDO; endianness is corrected for the wire.
    pub fn sdo32(
        &mut self,
        handle: SlaveConfigHandle,
        index: u16,
        subindex: u8,
        value: u32,
    ) -> Result<(), Error> {
        self.sdo(handle, index, subindex, &value.to_le_bytes())
    }

    /// Configure distributed clock SYNC signal generation for a slave.
    pub fn config_dc(
        &mut self,
        handle: SlaveConfigHandle,
        assign_activate: u16,
        sync0_cycle_ns: u32,
        sync0_shift_ns: i32,
        sync1_cycle_ns: u32,
        sync1_shift_ns: i32,
    ) -> Result<(), Error> {
        self.check_phase(MasterPhase::Idle)?;

        let config = self.config_mut(handle)?;

        config.dc_assign_activate = assign_activate;
        config.dc_sync_signals[0].cycle_time_ns = sync0_cycle_ns;
        config.dc_sync_signals[0].shift_time_ns = sync0_shift_ns;
        config.dc_sync_signals[1].cycle_time_ns = sync1_cycle_ns;
        config.dc_sync_signals[1].shift_time_ns = sync1_shift_ns;

        Ok(())
    }

    /// Override the slave's watchdog divider and sync manager watchdog intervals.
    pub fn config_watchdog(
        &mut self,
        handle: SlaveConfigHandle,
        divider: u16,
        intervals: u16,
    ) -> Result<(), Error> {
        self.check_phase(MasterPhase::Idle)?;

        let config = self.config_mut(handle)?;

        config.watchdog_divider = divider;
        config.watchdog_intervals = intervals;

        Ok(())
    }

    // ------------------------------------------------------------------
    // PDO entry registration
    // ------------------------------------------------------------------

    /// Register a PDO entry for process data exchange in `domain`, returning the byte offset of
    /// the entry inside the domain image.
    ///
    /// Fails with [`ConfigError::PdoEntryNotByteAligned`] if the entry does not start on a byte
    /// boundary; use [`register_pdo_entry_bits`](Master::register_pdo_entry_bits) for bit
    /// granular access.
    pub fn register_pdo_entry(
        &mut self,
        config: SlaveConfigHandle,
        entry_index: u16,
        entry_subindex: u8,
        domain: DomainHandle,
    ) -> Result<usize, Error> {
        let bit_offset = self.register_pdo_entry_bits(config, entry_index, entry_subindex, domain)?;

        if bit_offset % 8 != 0 {
            return Err(Error::Config(ConfigError::PdoEntryNotByteAligned));
        }

        Ok(bit_offset as usize / 8)
    }

    /// Register a PDO entry, returning its raw bit offset inside the domain image.
    pub fn register_pdo_entry_bits(
        &mut self,
        config: SlaveConfigHandle,
        entry_index: u16,
        entry_subindex: u8,
        domain: DomainHandle,
    ) -> Result<u32, Error> {
        self.check_phase(MasterPhase::Idle)?;

        let resolved = self
            .resolve_entry(config, entry_index, entry_subindex)
            .ok_or(Error::Config(ConfigError::PdoEntryNotFound {
                index: entry_index,
                subindex: entry_subindex,
            }))?;

        let domain = self
            .domains
            .get_mut(domain.0)
            .ok_or(Error::NotFound {
                item: Item::Domain,
                index: Some(domain.0),
            })?;

        let slice_start = domain.fmmu_for(
            config.0,
            resolved.sync_index,
            resolved.direction,
            resolved.sync_bit_length,
        )?;

        Ok(slice_start + resolved.entry_bit_offset)
    }

    /// Resolve an entry against the declared config, falling back to the attached slave's
    /// runtime PDO tree.
    fn resolve_entry(
        &self,
        handle: SlaveConfigHandle,
        entry_index: u16,
        entry_subindex: u8,
    ) -> Option<ResolvedEntry> {
        let config = self.configs.get(handle.0)?;

        if config.has_pdo_assignment() {
            return resolve_declared_entry(config, &self.slaves, entry_index, entry_subindex);
        }

        let slave = config
            .attached_slave
            .and_then(|index| self.slaves.get(index))?;

        let (sync_index, direction, entry_bit_offset) =
            slave.pdo_entry_bit_offset(entry_index, entry_subindex)?;

        Some(ResolvedEntry {
            sync_index,
            direction,
            entry_bit_offset,
            sync_bit_length: slave.sync_manager_bit_length(sync_index),
        })
    }

    // ------------------------------------------------------------------
    // Application SDO requests
    // ------------------------------------------------------------------

    /// Pre-allocate an asynchronous SDO request bound to a slave config.
    pub fn create_sdo_request(
        &mut self,
        handle: SlaveConfigHandle,
        index: u16,
        subindex: u8,
        capacity: usize,
    ) -> Result<SdoRequestHandle, Error> {
        let config = self.config_mut(handle)?;

        let request_index = config.sdo_requests.len();

        config
            .sdo_requests
            .push(SdoRequest::new(index, subindex, capacity));

        Ok(SdoRequestHandle {
            config: handle.0,
            index: request_index,
        })
    }

    fn sdo_request_mut(&mut self, handle: SdoRequestHandle) -> Result<&mut SdoRequest, Error> {
        self.configs
            .get_mut(handle.config)
            .and_then(|config| config.sdo_requests.get_mut(handle.index))
            .ok_or(Error::NotFound {
                item: Item::SdoRequest,
                index: Some(handle.index),
            })
    }

    /// Arm an SDO request for reading. Non-blocking; poll
    /// [`sdo_request_state`](Master::sdo_request_state).
    pub fn sdo_request_read(&mut self, handle: SdoRequestHandle, now: u64) -> Result<(), Error> {
        let request = self.sdo_request_mut(handle)?;

        if !request.state.is_idle() {
            return Err(Error::Busy);
        }

        request.direction = RequestDirection::Read;
        request.state = RequestState::Queued;
        request.queued_at = now;
        request.abort_code = None;

        Ok(())
    }

    /// Arm an SDO request for writing the given value. Non-blocking.
    pub fn sdo_request_write(
        &mut self,
        handle: SdoRequestHandle,
        data: &[u8],
        now: u64,
    ) -> Result<(), Error> {
        let request = self.sdo_request_mut(handle)?;

        if !request.state.is_idle() {
            return Err(Error::Busy);
        }

        if data.len() > request.capacity {
            return Err(Error::Capacity(Item::SdoRequest));
        }

        request.direction = RequestDirection::Write;
        request.data = data.to_vec();
        request.state = RequestState::Queued;
        request.queued_at = now;
        request.abort_code = None;

        Ok(())
    }

    /// Current state of an SDO request.
    pub fn sdo_request_state(&self, handle: SdoRequestHandle) -> RequestState {
        self.configs
            .get(handle.config)
            .and_then(|config| config.sdo_requests.get(handle.index))
            .map(|request| request.state)
            .unwrap_or(RequestState::Failure)
    }

    /// Data of the last completed transfer of an SDO request.
    pub fn sdo_request_data(&self, handle: SdoRequestHandle) -> &[u8] {
        self.configs
            .get(handle.config)
            .and_then(|config| config.sdo_requests.get(handle.index))
            .map(|request| request.data.as_slice())
            .unwrap_or(&[])
    }

    /// Abort code of the last failed transfer, if the slave sent one.
    pub fn sdo_request_abort_code(
        &self,
        handle: SdoRequestHandle,
    ) -> Option<crate::coe::abort::AbortCode> {
        self.configs
            .get(handle.config)
            .and_then(|config| config.sdo_requests.get(handle.index))
            .and_then(|request| request.abort_code)
    }

    /// Set the per-request timeout.
    pub fn sdo_request_timeout(
        &mut self,
        handle: SdoRequestHandle,
        timeout_ns: u64,
    ) -> Result<(), Error> {
        self.sdo_request_mut(handle)?.timeout_ns = timeout_ns;

        Ok(())
    }

    // ------------------------------------------------------------------
    // SII, register and FoE requests
    // ------------------------------------------------------------------

    /// Queue a station alias write into a slave's SII.
    ///
    /// The header words are patched in the master's cached image, the checksum over words 0..=6
    /// is recomputed, and all eight header words are written back.
    pub fn write_station_alias(
        &mut self,
        ring_position: u16,
        alias: u16,
    ) -> Result<SiiRequestHandle, Error> {
        let slave = self
            .slaves
            .iter()
            .find(|slave| slave.ring_position() == ring_position)
            .ok_or(Error::NotFound {
                item: Item::Slave,
                index: Some(usize::from(ring_position)),
            })?;

        let mut image = slave.sii.clone();

        if image.len_words() < 8 {
            return Err(Error::Sii(crate::error::SiiError::Decode));
        }

        image.set_word(sii_word::ALIAS, alias);
        image.update_checksum();

        let words = (0..8)
            .map(|address| image.word(address).unwrap_or(0))
            .collect();

        let handle = SiiRequestHandle(self.fsm.sii_requests.len());

        self.fsm.sii_requests.push(SiiWriteRequest {
            position: ring_position,
            word_offset: 0,
            words,
            pos: 0,
            state: RequestState::Queued,
        });

        Ok(handle)
    }

    /// State of a queued SII write.
    pub fn sii_request_state(&self, handle: SiiRequestHandle) -> RequestState {
        self.fsm
            .sii_requests
            .get(handle.0)
            .map(|request| request.state)
            .unwrap_or(RequestState::Failure)
    }

    /// Queue a raw register read from a slave.
    pub fn register_read_request(
        &mut self,
        ring_position: u16,
        address: u16,
        length: usize,
    ) -> Result<RegRequestHandle, Error> {
        let handle = RegRequestHandle(self.fsm.reg_requests.len());

        self.fsm.reg_requests.push(RegRequest {
            position: ring_position,
            address,
            data: Vec::new(),
            length,
            direction: RequestDirection::Read,
            state: RequestState::Queued,
        });

        Ok(handle)
    }

    /// Queue a raw register write to a slave.
    pub fn register_write_request(
        &mut self,
        ring_position: u16,
        address: u16,
        data: &[u8],
    ) -> Result<RegRequestHandle, Error> {
        let handle = RegRequestHandle(self.fsm.reg_requests.len());

        self.fsm.reg_requests.push(RegRequest {
            position: ring_position,
            address,
            data: data.to_vec(),
            length: data.len(),
            direction: RequestDirection::Write,
            state: RequestState::Queued,
        });

        Ok(handle)
    }

    /// State of a queued register request.
    pub fn register_request_state(&self, handle: RegRequestHandle) -> RequestState {
        self.fsm
            .reg_requests
            .get(handle.0)
            .map(|request| request.state)
            .unwrap_or(RequestState::Failure)
    }

    /// Data returned by a completed register read.
    pub fn register_request_data(&self, handle: RegRequestHandle) -> &[u8] {
        self.fsm
            .reg_requests
            .get(handle.0)
            .map(|request| request.data.as_slice())
            .unwrap_or(&[])
    }

    /// Queue an FoE file write to a slave.
    pub fn foe_write_request(
        &mut self,
        ring_position: u16,
        file_name: &str,
        password: u32,
        data: Vec<u8>,
    ) -> Result<FoeRequestHandle, Error> {
        let handle = FoeRequestHandle(self.fsm.foe_requests.len());

        self.fsm.foe_requests.push(FoeRequest {
            position: ring_position,
            file_name: file_name.to_string(),
            password,
            data,
            max_size: 0,
            direction: RequestDirection::Write,
            state: RequestState::Queued,
            error: None,
        });

        Ok(handle)
    }

    /// Queue an FoE file read from a slave.
    pub fn foe_read_request(
        &mut self,
        ring_position: u16,
        file_name: &str,
        password: u32,
        max_size: usize,
    ) -> Result<FoeRequestHandle, Error> {
        let handle = FoeRequestHandle(self.fsm.foe_requests.len());

        self.fsm.foe_requests.push(FoeRequest {
            position: ring_position,
            file_name: file_name.to_string(),
            password,
            data: Vec::new(),
            max_size,
            direction: RequestDirection::Read,
            state: RequestState::Queued,
            error: None,
        });

        Ok(handle)
    }

    /// State of a queued FoE transfer.
    pub fn foe_request_state(&self, handle: FoeRequestHandle) -> RequestState {
        self.fsm
            .foe_requests
            .get(handle.0)
            .map(|request| request.state)
            .unwrap_or(RequestState::Failure)
    }

    /// Data of a completed FoE read.
    pub fn foe_request_data(&self, handle: FoeRequestHandle) -> &[u8] {
        self.fsm
            .foe_requests
            .get(handle.0)
            .map(|request| request.data.as_slice())
            .unwrap_or(&[])
    }

    // ------------------------------------------------------------------
    // Activation and the cyclic path
    // ------------------------------------------------------------------

    /// Freeze the configuration, lay out all domains and enter the `Operation` phase.
    ///
    /// After this returns, the cyclic caller owns [`send`](Master::send) and
    /// [`receive`](Master::receive); configuration calls fail until the master is released.
    pub fn activate(&mut self) -> Result<(), Error> {
        self.check_phase(MasterPhase::Idle)?;

        let mut base = 0u32;

        for domain in &mut self.domains {
            base = domain.finalize(base, &mut self.pdu)?;
        }

        log::info!(
            "Master activated: {} domain(s), {} byte(s) of process data, {} config(s)",
            self.domains.len(),
            base,
            self.configs.len()
        );

        self.phase = MasterPhase::Operation;

        // Configured slaves now head for OP; the configuration FSM revisits each of them with
        // the final domain layout
        for config in &self.configs {
            if let Some(index) = config.attached_slave {
                if let Some(slave) = self.slaves.get_mut(index) {
                    slave.requested_state = crate::slave_state::AlState::Op;
                    slave.self_configured = false;
                }
            }
        }

        Ok(())
    }

    /// Leave the `Operation` phase and return to `Idle`.
    ///
    /// Slaves are reconfigured (and thus pass through `INIT` again) on the next activation.
    pub fn deactivate(&mut self) {
        if self.phase != MasterPhase::Operation {
            return;
        }

        self.phase = MasterPhase::Idle;

        for slave in &mut self.slaves {
            slave.self_configured = false;

            if slave.config.is_some() {
                slave.requested_state = crate::slave_state::AlState::PreOp;
            }
        }
    }

    /// Emit one frame of queued datagrams.
    ///
    /// In the `Operation` phase this is the realtime context's transmit point: any datagram
    /// still unanswered from the previous cycle is expired first, then the background FSM gets
    /// one step (its datagrams ride along in the same frame), then the frame is sent.
    pub fn send(&mut self, now: u64) -> Result<(), Error> {
        if self.phase == MasterPhase::Operation {
            // Responses to cyclic traffic arrive within one cycle; whatever is still pending
            // from the last cycle is gone
            self.pdu.check_timeouts(now, 0);
        } else {
            self.pdu.check_timeouts(now, self.options.pdu_timeout_ns);
        }

        let fsm_options = FsmOptions {
            strict_topology: self.options.strict_topology,
            fetch_dictionaries: self.options.fetch_dictionaries,
            operation: self.phase == MasterPhase::Operation,
        };

        self.fsm.exec(
            &mut self.pdu,
            &mut self.slaves,
            &mut self.configs,
            &self.domains,
            &fsm_options,
            now,
        );

        self.pdu.emit(&mut self.device, now)?;
        self.pdu.log_stats(now);

        Ok(())
    }

    /// Take delivery of received frames and match their datagrams.
    ///
    /// Must be called cyclically, paired with [`send`](Master::send).
    pub fn receive(&mut self, now: u64) -> Result<(), Error> {
        self.device.update_link_state();

        let mut frames: Vec<Vec<u8>> = Vec::new();

        self.device.poll(now, |payload| frames.push(payload.to_vec()));

        for frame in frames {
            self.pdu.receive_frame(&frame, now);
        }

        Ok(())
    }

    /// One background round: receive, FSM step, send. The idle-phase driver loop.
    pub fn idle_cycle(&mut self, now: u64) -> Result<(), Error> {
        self.receive(now)?;
        self.send(now)
    }

    /// Queue a domain's datagrams for the next [`send`](Master::send).
    pub fn domain_queue(&mut self, handle: DomainHandle) -> Result<(), Error> {
        let domain = self.domains.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::Domain,
            index: Some(handle.0),
        })?;

        domain.queue(&mut self.pdu)
    }

    /// Interpret the last cycle's responses for a domain.
    pub fn domain_process(&mut self, handle: DomainHandle) -> Result<(), Error> {
        let domain = self.domains.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::Domain,
            index: Some(handle.0),
        })?;

        domain.process(&mut self.pdu);

        Ok(())
    }

    /// Published state of a domain.
    pub fn domain_state(&self, handle: DomainHandle) -> Result<DomainState, Error> {
        self.domains
            .get(handle.0)
            .map(Domain::state)
            .ok_or(Error::NotFound {
                item: Item::Domain,
                index: Some(handle.0),
            })
    }

    /// The process data image of a domain.
    pub fn domain_data(&mut self, handle: DomainHandle) -> Result<&mut [u8], Error> {
        self.domains
            .get_mut(handle.0)
            .map(|domain| domain.data.as_mut_slice())
            .ok_or(Error::NotFound {
                item: Item::Domain,
                index: Some(handle.0),
            })
    }

    /// Supply an externally allocated buffer as a domain's process data image.
    ///
    /// Activation verifies the buffer holds at least the domain's computed size instead of
    /// allocating internally.
    pub fn set_domain_buffer(
        &mut self,
        handle: DomainHandle,
        buffer: Vec<u8>,
    ) -> Result<(), Error> {
        self.check_phase(MasterPhase::Idle)?;

        let domain = self.domains.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::Domain,
            index: Some(handle.0),
        })?;

        domain.data = buffer;
        domain.external_buffer = true;

        Ok(())
    }

    /// Whether the background FSM sits at a point whose traffic may be starved in favour of
    /// cyclic data, e.g. by skipping [`send`](Master::send)'s FSM step under cycle pressure.
    pub fn background_idle(&self) -> bool {
        self.fsm.idle
    }

    /// Failure detail of an FoE transfer, beyond its [`RequestState`].
    pub fn foe_request_error(&self, handle: FoeRequestHandle) -> Option<&Error> {
        self.fsm
            .foe_requests
            .get(handle.0)
            .and_then(|request| request.error.as_ref())
    }

    /// Byte size of a domain's image.
    pub fn domain_size(&self, handle: DomainHandle) -> Result<usize, Error> {
        self.domains
            .get(handle.0)
            .map(Domain::data_size)
            .ok_or(Error::NotFound {
                item: Item::Domain,
                index: Some(handle.0),
            })
    }

    // ------------------------------------------------------------------
    // Blocking configuration-time helpers
    // ------------------------------------------------------------------

    /// Synchronously read a slave register, busy-polling the device.
    ///
    /// Only valid in the `Idle` phase; the realtime context never blocks. `now_fn` supplies
    /// monotonic nanosecond timestamps for the internal 100 ms round trip timeout.
    pub fn blocking_register_read(
        &mut self,
        ring_position: u16,
        address: u16,
        length: usize,
        now_fn: impl FnMut() -> u64,
    ) -> Result<Vec<u8>, Error> {
        self.check_phase(MasterPhase::Idle)?;

        let station = self.station_address_of(ring_position)?;
        let datagram = self.pdu.alloc("blocking-io");

        self.pdu.get_mut(datagram).init_nprd(station, address, length)?;

        let wkc = self.pdu.simple_io(&mut self.device, datagram, now_fn)?;

        if wkc == 0 {
            return Err(Error::Slave(crate::error::SlaveError::Offline));
        }

        Ok(self.pdu.get(datagram).payload().to_vec())
    }

    /// Synchronously write a slave register, busy-polling the device.
    pub fn blocking_register_write(
        &mut self,
        ring_position: u16,
        address: u16,
        data: &[u8],
        now_fn: impl FnMut() -> u64,
    ) -> Result<(), Error> {
        self.check_phase(MasterPhase::Idle)?;

        let station = self.station_address_of(ring_position)?;
        let datagram = self.pdu.alloc("blocking-io");

        let dg = self.pdu.get_mut(datagram);

        dg.init_npwr(station, address, data.len())?;
        dg.payload_mut().copy_from_slice(data);

        let wkc = self.pdu.simple_io(&mut self.device, datagram, now_fn)?;

        if wkc == 0 {
            return Err(Error::Slave(crate::error::SlaveError::Offline));
        }

        Ok(())
    }

    /// Read the per-port RX error (CRC) counters of a slave.
    ///
    /// A diagnosis helper for the tooling surface; reads the four port counters at `0x0300`.
    pub fn blocking_crc_error_counters(
        &mut self,
        ring_position: u16,
        now_fn: impl FnMut() -> u64,
    ) -> Result<[u16; 4], Error> {
        let raw = self.blocking_register_read(
            ring_position,
            crate::register::RegisterAddress::RxErrorCounter.into(),
            8,
            now_fn,
        )?;

        let mut counters = [0u16; 4];

        for (counter, chunk) in counters.iter_mut().zip(raw.chunks_exact(2)) {
            *counter = u16::from_le_bytes([chunk[0], chunk[1]]);
        }

        Ok(counters)
    }

    fn station_address_of(&self, ring_position: u16) -> Result<u16, Error> {
        self.slaves
            .iter()
            .find(|slave| slave.ring_position() == ring_position)
            .map(Slave::station_address)
            .ok_or(Error::NotFound {
                item: Item::Slave,
                index: Some(usize::from(ring_position)),
            })
    }

    /// Reset application state when the master is released back to a registry.
    pub(crate) fn reset(&mut self) {
        self.deactivate();

        self.configs.clear();
        self.domains.clear();

        for slave in &mut self.slaves {
            slave.config = None;
            slave.self_configured = false;
            slave.requested_state = crate::slave_state::AlState::Init;
        }
    }

    /// Access the underlying Ethernet port.
    pub fn port(&self) -> &P {
        self.device.port()
    }

    /// Mutably access the underlying Ethernet port.
    pub fn port_mut(&mut self) -> &mut P {
        self.device.port_mut()
    }

    /// Consume the master and hand back its Ethernet port.
    pub fn into_port(self) -> P {
        self.device.into_port()
    }

    fn check_phase(&self, required: MasterPhase) -> Result<(), Error> {
        if self.phase != required {
            return Err(Error::Config(ConfigError::WrongPhase));
        }

        Ok(())
    }
}

/// A PDO entry resolved to its position in a slave's process data.
struct ResolvedEntry {
    sync_index: u8,
    direction: PdoDirection,
    entry_bit_offset: u32,
    sync_bit_length: u32,
}

/// Resolve an entry inside a declared assignment, taking entry layouts from the declaration or
/// from the attached slave's SII as available.
fn resolve_declared_entry(
    config: &SlaveConfig,
    slaves: &[Slave],
    entry_index: u16,
    entry_subindex: u8,
) -> Option<ResolvedEntry> {
    let slave = config.attached_slave.and_then(|index| slaves.get(index));

    for (sync_index, sync) in config.sync_configs.iter().enumerate() {
        if sync.pdos.is_empty() {
            continue;
        }

        let mut sync_bits = 0u32;
        let mut found: Option<(u32, PdoDirection)> = None;

        for pdo in &sync.pdos {
            let direction = sync.direction.unwrap_or({
                if (0x1600..=0x17ff).contains(&pdo.index) {
                    PdoDirection::Output
                } else {
                    PdoDirection::Input
                }
            });

            // Entry layout: the declared mapping wins, the SII description is the fallback
            let entries: Vec<(u16, u8, u8)> = match &pdo.entries {
                Some(entries) => entries
                    .iter()
                    .map(|entry| (entry.index, entry.subindex, entry.bit_length))
                    .collect(),
                None => slave
                    .map(|slave| {
                        slave
                            .categories
                            .tx_pdos
                            .iter()
                            .chain(&slave.categories.rx_pdos)
                            .filter(|record| record.desc.index == pdo.index)
                            .flat_map(|record| record.entries.iter())
                            .map(|entry| (entry.index, entry.subindex, entry.bit_length))
                            .collect()
                    })
                    .unwrap_or_default(),
            };

            for (index, subindex, bit_length) in entries {
                if index == entry_index && subindex == entry_subindex && found.is_none() {
                    found = Some((sync_bits, direction));
                }

                sync_bits += u32::from(bit_length);
            }
        }

        if let Some((entry_bit_offset, direction)) = found {
            return Some(ResolvedEntry {
                sync_index: sync_index as u8,
                direction,
                entry_bit_offset,
                sync_bit_length: sync_bits,
            });
        }
    }

    None
}
