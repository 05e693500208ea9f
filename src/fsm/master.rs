//! The top-level master FSM: a strictly cooperative round over bus supervision, scanning,
//! configuration and pending requests.
//!
//! One [`exec`](MasterFsm::exec) call per tick advances at most one transition (possibly inside
//! a nested sub-FSM). The round is
//!
//! ```text
//! Start -> Broadcast -> (topology change? -> ClearAddresses -> Scan*)
//!       -> ReadState (per slave) -> (Acknowledge?)
//!       -> Configure | SdoRequest | SiiWrite | RegAccess | FoeTransfer | SdoDict
//!       -> End -> Start
//! ```

use super::change::ChangeFsm;
use super::coe::CoeFsm;
use super::config::ConfigFsm;
use super::foe::FoeFsm;
use super::scan::ScanFsm;
use super::sii::SiiFsm;
use super::{FsmResult, Poll, poll_datagram};
use crate::al_control::AlControl;
use crate::datagram::DatagramId;
use crate::domain::Domain;
use crate::pdu_loop::PduLoop;
use crate::register::RegisterAddress;
use crate::requests::{FoeRequest, RegRequest, SiiWriteRequest};
use crate::slave::Slave;
use crate::slave_config::{RequestDirection, RequestState, SlaveConfig};
use crate::slave_state::AlStateSet;
use ethercrab_wire::EtherCrabWireRead;

/// Delay after the PREOP transition before the dictionary fetch may run.
const SDO_DICT_DELAY_NS: u64 = 1_000_000_000;

/// Policy options for the master FSM, a subset of
/// [`MasterOptions`](crate::master::MasterOptions).
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct FsmOptions {
    /// Treat topology anomalies (working counter mismatches on broadcast traffic) as errors
    /// instead of warnings.
    pub strict_topology: bool,
    /// Fetch CoE object dictionaries in the background.
    pub fetch_dictionaries: bool,
    /// The master is activated: configured slaves are driven all the way to `OP` instead of
    /// being parked in `PRE-OP`.
    pub operation: bool,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum State {
    #[default]
    Start,
    /// The broadcast AL status probe is on the wire.
    Broadcast,
    /// The broadcast station address clear is on the wire.
    ClearAddresses,
    /// Scanning one slave.
    Scan(usize),
    /// One slave's AL status read is on the wire.
    ReadState(usize),
    /// Acknowledging one slave's error bit.
    Acknowledge(usize),
    /// Configuring one slave.
    Configure(usize),
    /// Serving one application SDO request.
    SdoRequest {
        config: usize,
        request: usize,
    },
    /// Serving one queued SII write.
    SiiWrite(usize),
    /// Serving one queued register access.
    RegAccess(usize),
    /// Serving one queued FoE transfer.
    FoeTransfer(usize),
    /// Fetching one slave's object dictionary.
    SdoDict(usize),
    /// Round complete.
    End,
}

/// The master finite state machine and its request queues.
pub(crate) struct MasterFsm {
    datagram: DatagramId,
    state: State,
    scan: ScanFsm,
    change: ChangeFsm,
    config_fsm: ConfigFsm,
    coe: CoeFsm,
    sii: SiiFsm,
    foe: FoeFsm,
    /// Number of slaves that answered the last broadcast probe.
    pub(crate) slaves_responding: u16,
    /// OR of all responding slaves' AL status nibbles.
    pub(crate) al_states: AlStateSet,
    /// A rescan has been detected but not yet started.
    rescan_pending: bool,
    /// Queued SII write requests.
    pub(crate) sii_requests: Vec<SiiWriteRequest>,
    /// Queued raw register requests.
    pub(crate) reg_requests: Vec<RegRequest>,
    /// Queued FoE transfer requests.
    pub(crate) foe_requests: Vec<FoeRequest>,
    /// The current state may be starved in favour of cyclic traffic.
    pub(crate) idle: bool,
    retries: u8,
}

impl MasterFsm {
    pub fn new(pdu: &mut PduLoop) -> Self {
        Self {
            datagram: pdu.alloc("master-fsm"),
            state: State::Start,
            scan: ScanFsm::new(pdu),
            change: ChangeFsm::new(pdu),
            config_fsm: ConfigFsm::new(pdu),
            coe: CoeFsm::new(pdu),
            sii: SiiFsm::new(pdu),
            foe: FoeFsm::new(pdu),
            slaves_responding: 0,
            al_states: AlStateSet::default(),
            rescan_pending: false,
            sii_requests: Vec::new(),
            reg_requests: Vec::new(),
            foe_requests: Vec::new(),
            idle: true,
            retries: 0,
        }
    }

    /// Force a bus rescan on the next round.
    pub fn request_rescan(&mut self) {
        self.rescan_pending = true;
    }

    /// Advance the FSM by at most one transition.
    pub fn exec(
        &mut self,
        pdu: &mut PduLoop,
        slaves: &mut Vec<Slave>,
        configs: &mut [SlaveConfig],
        domains: &[Domain],
        options: &FsmOptions,
        now: u64,
    ) {
        self.idle = matches!(
            self.state,
            State::Start | State::Broadcast | State::ReadState(_) | State::End
        );

        match self.state {
            State::Start => {
                let datagram = pdu.get_mut(self.datagram);

                if datagram.init_brd(RegisterAddress::AlStatus.into(), 2).is_ok() {
                    pdu.queue(self.datagram);

                    self.state = State::Broadcast;
                }
            }

            State::Broadcast => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => (),
                Poll::GaveUp => {
                    // Bus unreachable; try again next round
                    self.state = State::Start;
                }
                Poll::Response(wkc) => {
                    let al_states = AlStateSet::from_bits_truncate(
                        pdu.get(self.datagram).payload().first().copied().unwrap_or(0),
                    );

                    if al_states != self.al_states {
                        log::debug!("AL states on bus: {:?}", al_states);

                        self.al_states = al_states;
                    }

                    let topology_changed = wkc != self.slaves_responding;

                    if topology_changed {
                        log::info!("{} slave(s) responding", wkc);

                        self.slaves_responding = wkc;
                        self.rescan_pending = true;
                    }

                    if self.rescan_pending {
                        self.rescan_pending = false;

                        if self.slaves_responding == 0 {
                            slaves.clear();
                            detach_configs(configs);

                            self.state = State::End;

                            return;
                        }

                        let datagram = pdu.get_mut(self.datagram);

                        if datagram
                            .init_bwr(RegisterAddress::ConfiguredStationAddress.into(), 2)
                            .is_ok()
                        {
                            pdu.queue(self.datagram);

                            self.state = State::ClearAddresses;
                        }

                        return;
                    }

                    if slaves.is_empty() {
                        self.state = State::End;
                    } else {
                        self.state = State::ReadState(0);

                        self.queue_state_read(pdu, slaves, 0);
                    }
                }
            },

            State::ClearAddresses => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => (),
                Poll::GaveUp => self.state = State::Start,
                Poll::Response(wkc) => {
                    if wkc != self.slaves_responding {
                        log::warn!(
                            "Address clear answered by {} of {} slaves",
                            wkc,
                            self.slaves_responding
                        );

                        if options.strict_topology {
                            self.state = State::Start;

                            return;
                        }
                    }

                    // Rebuild the slave list and scan each slave in ring order
                    *slaves = (0..self.slaves_responding).map(Slave::new).collect();

                    detach_configs(configs);

                    if let Err(e) = self.scan.start(pdu, &mut slaves[0], now) {
                        log::error!("Failed to start scan: {}", e);

                        self.state = State::End;

                        return;
                    }

                    self.state = State::Scan(0);
                }
            },

            State::Scan(index) => {
                let result = self.scan.exec(pdu, &mut slaves[index], now);

                if result.is_finished() {
                    let next = index + 1;

                    if next < slaves.len() {
                        if let Err(e) = self.scan.start(pdu, &mut slaves[next], now) {
                            log::error!("Failed to start scan: {}", e);

                            self.state = State::End;

                            return;
                        }

                        self.state = State::Scan(next);
                    } else {
                        attach_configs(slaves, configs, options.operation);

                        self.state = State::End;
                    }
                }
            }

            State::ReadState(index) => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => (),
                Poll::GaveUp | Poll::Response(0) => {
                    slaves[index].set_offline();

                    self.next_state_read(pdu, slaves, index);
                }
                Poll::Response(_) => {
                    let slave = &mut slaves[index];

                    slave.online = true;

                    if let Ok(status) =
                        AlControl::unpack_from_slice(pdu.get(self.datagram).payload())
                    {
                        slave.current_state = status.state;

                        if status.error && !slave.error_ack_pending {
                            slave.error_ack_pending = true;

                            log::warn!(
                                "Slave {}: error flag set in state {}",
                                slave.ring_position,
                                status.state
                            );

                            if self.change.start_ack(pdu, slave, now).is_ok() {
                                self.state = State::Acknowledge(index);

                                return;
                            }
                        }
                    }

                    self.next_state_read(pdu, slaves, index);
                }
            },

            State::Acknowledge(index) => {
                let result = self.change.exec(pdu, &mut slaves[index], now);

                if result.is_finished() {
                    self.next_state_read(pdu, slaves, index);
                }
            }

            State::Configure(index) => {
                let slave = &mut slaves[index];

                let Some(config_index) = slave.config.map(|handle| handle.0) else {
                    self.state = State::End;

                    return;
                };

                let result = self.config_fsm.exec(
                    pdu,
                    slave,
                    &mut configs[config_index],
                    config_index,
                    domains,
                    now,
                );

                if result.is_finished() {
                    self.state = State::End;
                }
            }

            State::SdoRequest { config, request } => {
                let Some(slave_index) = configs[config].attached_slave else {
                    configs[config].sdo_requests[request].state = RequestState::Failure;

                    self.state = State::End;

                    return;
                };

                let slave = &mut slaves[slave_index];
                let result = self.coe.exec(pdu, slave, now);

                match result {
                    FsmResult::Pending => (),
                    FsmResult::Done => {
                        let req = &mut configs[config].sdo_requests[request];

                        if req.direction == RequestDirection::Read {
                            let data = self.coe.take_data();

                            if data.len() > req.capacity {
                                req.state = RequestState::Failure;
                            } else {
                                req.data = data;
                                req.state = RequestState::Success;
                            }
                        } else {
                            req.state = RequestState::Success;
                        }

                        self.state = State::End;
                    }
                    FsmResult::Failed(_) => {
                        let req = &mut configs[config].sdo_requests[request];

                        req.abort_code = self.coe.abort_code();
                        req.state = RequestState::Failure;

                        self.state = State::End;
                    }
                }
            }

            State::SiiWrite(index) => match self.sii.exec(pdu, now) {
                FsmResult::Pending => (),
                FsmResult::Done => {
                    let request = &mut self.sii_requests[index];

                    request.pos += 1;

                    if request.pos >= request.words.len() {
                        request.state = RequestState::Success;

                        log::info!(
                            "SII write to slave {} complete ({} word(s))",
                            request.position,
                            request.words.len()
                        );

                        self.state = State::End;

                        return;
                    }

                    let (position, word, value) = (
                        request.position,
                        request.word_offset + request.pos as u16,
                        request.words[request.pos],
                    );

                    let Some(station) = station_address(slaves, position) else {
                        self.sii_requests[index].state = RequestState::Failure;

                        self.state = State::End;

                        return;
                    };

                    if self
                        .sii
                        .start_write(pdu, station, word, value, now)
                        .is_err()
                    {
                        self.sii_requests[index].state = RequestState::Failure;

                        self.state = State::End;
                    }
                }
                FsmResult::Failed(e) => {
                    log::error!("SII write failed: {}", e);

                    self.sii_requests[index].state = RequestState::Failure;

                    self.state = State::End;
                }
            },

            State::RegAccess(index) => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => (),
                Poll::GaveUp | Poll::Response(0) => {
                    self.reg_requests[index].state = RequestState::Failure;

                    self.state = State::End;
                }
                Poll::Response(_) => {
                    let request = &mut self.reg_requests[index];

                    if request.direction == RequestDirection::Read {
                        request.data = pdu.get(self.datagram).payload().to_vec();
                    }

                    request.state = RequestState::Success;

                    self.state = State::End;
                }
            },

            State::FoeTransfer(index) => {
                let position = self.foe_requests[index].position;

                let Some(slave_index) = slaves
                    .iter()
                    .position(|slave| slave.ring_position == position)
                else {
                    self.foe_requests[index].state = RequestState::Failure;

                    self.state = State::End;

                    return;
                };

                match self.foe.exec(pdu, &mut slaves[slave_index], now) {
                    FsmResult::Pending => (),
                    FsmResult::Done => {
                        let request = &mut self.foe_requests[index];

                        if request.direction == RequestDirection::Read {
                            request.data = self.foe.take_data();
                        }

                        request.state = RequestState::Success;

                        self.state = State::End;
                    }
                    FsmResult::Failed(e) => {
                        let request = &mut self.foe_requests[index];

                        request.error = Some(e);
                        request.state = RequestState::Failure;

                        self.state = State::End;
                    }
                }
            }

            State::SdoDict(index) => {
                let result = self.coe.exec(pdu, &mut slaves[index], now);

                match result {
                    FsmResult::Pending => (),
                    FsmResult::Done => {
                        slaves[index].sdo_dictionary = self.coe.take_dictionary();

                        log::info!(
                            "Slave {}: fetched dictionary with {} object(s)",
                            slaves[index].ring_position,
                            slaves[index].sdo_dictionary.len()
                        );

                        self.state = State::End;
                    }
                    FsmResult::Failed(e) => {
                        log::warn!(
                            "Slave {}: dictionary fetch failed: {}",
                            slaves[index].ring_position,
                            e
                        );

                        self.state = State::End;
                    }
                }
            }

            State::End => {
                self.state = State::Start;
            }
        }

        // Dispatch pending work once the supervision part of the round has finished
        if self.state == State::End {
            self.dispatch(pdu, slaves, configs, options, now);
        }
    }

    /// Queue the AL status read for one slave.
    fn queue_state_read(&mut self, pdu: &mut PduLoop, slaves: &[Slave], index: usize) {
        let slave = &slaves[index];
        let datagram = pdu.get_mut(self.datagram);

        if datagram
            .init_nprd(slave.station_address, RegisterAddress::AlStatus.into(), 2)
            .is_ok()
        {
            pdu.queue(self.datagram);
        }
    }

    /// Move to the next slave's status read, or end the round.
    fn next_state_read(&mut self, pdu: &mut PduLoop, slaves: &mut [Slave], index: usize) {
        let next = index + 1;

        if next < slaves.len() {
            self.state = State::ReadState(next);

            self.queue_state_read(pdu, slaves, next);

            return;
        }

        self.state = State::End;
    }

    /// Select the next pending unit of work: configuration first, then application requests,
    /// then the background dictionary fetch.
    fn dispatch(
        &mut self,
        pdu: &mut PduLoop,
        slaves: &mut [Slave],
        configs: &mut [SlaveConfig],
        options: &FsmOptions,
        now: u64,
    ) {
        // Configuration
        if let Some(index) = slaves.iter().position(|slave| {
            slave.online
                && !slave.error_flag
                && slave.config.is_some()
                && (!slave.self_configured || slave.current_state != slave.requested_state)
        }) {
            if self.config_fsm.start(pdu, &mut slaves[index], now).is_ok() {
                self.state = State::Configure(index);

                return;
            }
        }

        // Application SDO requests, oldest first, one per visit
        for (config_index, config) in configs.iter_mut().enumerate() {
            let Some(slave_index) = config.attached_slave else {
                continue;
            };

            for (request_index, request) in config.sdo_requests.iter_mut().enumerate() {
                if request.state != RequestState::Queued {
                    continue;
                }

                if now.saturating_sub(request.queued_at) > request.timeout_ns {
                    request.state = RequestState::Failure;

                    continue;
                }

                let slave = &mut slaves[slave_index];

                let started = match request.direction {
                    RequestDirection::Read => self
                        .coe
                        .start_upload(pdu, slave, request.index, request.subindex, now),
                    RequestDirection::Write => self.coe.start_download(
                        pdu,
                        slave,
                        request.index,
                        request.subindex,
                        request.data.clone(),
                        now,
                    ),
                };

                match started {
                    Ok(()) => {
                        request.state = RequestState::Busy;

                        self.state = State::SdoRequest {
                            config: config_index,
                            request: request_index,
                        };

                        return;
                    }
                    Err(_) => {
                        request.state = RequestState::Failure;
                    }
                }
            }
        }

        // SII writes
        if let Some(index) = self
            .sii_requests
            .iter()
            .position(|request| request.state == RequestState::Queued)
        {
            let request = &mut self.sii_requests[index];

            if let Some(station) = station_address(slaves, request.position) {
                request.state = RequestState::Busy;
                request.pos = 0;

                let (word, value) = (request.word_offset, request.words[0]);

                if self.sii.start_write(pdu, station, word, value, now).is_ok() {
                    self.state = State::SiiWrite(index);

                    return;
                }

                self.sii_requests[index].state = RequestState::Failure;
            } else {
                request.state = RequestState::Failure;
            }
        }

        // Raw register access
        if let Some(index) = self
            .reg_requests
            .iter()
            .position(|request| request.state == RequestState::Queued)
        {
            let request = &mut self.reg_requests[index];

            if let Some(station) = station_address(slaves, request.position) {
                let datagram = pdu.get_mut(self.datagram);

                let init = match request.direction {
                    RequestDirection::Read => {
                        datagram.init_nprd(station, request.address, request.length)
                    }
                    RequestDirection::Write => datagram
                        .init_npwr(station, request.address, request.length)
                        .map(|()| {
                            datagram.payload_mut().copy_from_slice(&request.data);
                        }),
                };

                if init.is_ok() {
                    pdu.queue(self.datagram);

                    request.state = RequestState::Busy;
                    self.state = State::RegAccess(index);

                    return;
                }
            }

            self.reg_requests[index].state = RequestState::Failure;
        }

        // FoE transfers
        if let Some(index) = self
            .foe_requests
            .iter()
            .position(|request| request.state == RequestState::Queued)
        {
            let position = self.foe_requests[index].position;

            if let Some(slave_index) = slaves
                .iter()
                .position(|slave| slave.ring_position == position)
            {
                let request = &self.foe_requests[index];
                let (file_name, password, max_size, direction, data) = (
                    request.file_name.clone(),
                    request.password,
                    request.max_size,
                    request.direction,
                    request.data.clone(),
                );

                let slave = &mut slaves[slave_index];

                let started = match direction {
                    RequestDirection::Read => {
                        self.foe.start_read(pdu, slave, &file_name, password, max_size, now)
                    }
                    RequestDirection::Write => {
                        self.foe.start_write(pdu, slave, &file_name, password, data, now)
                    }
                };

                if started.is_ok() {
                    self.foe_requests[index].state = RequestState::Busy;
                    self.state = State::FoeTransfer(index);

                    return;
                }
            }

            self.foe_requests[index].state = RequestState::Failure;
        }

        // Background dictionary fetch, once per slave lifetime, only on an otherwise idle bus
        if options.fetch_dictionaries {
            if let Some(index) = slaves.iter().position(|slave| {
                slave.online
                    && !slave.error_flag
                    && slave.supports_coe()
                    && !slave.dictionary_fetched
                    && slave.preop_at != 0
                    && now.saturating_sub(slave.preop_at) > SDO_DICT_DELAY_NS
            }) {
                let slave = &mut slaves[index];

                slave.dictionary_fetched = true;

                if self.coe.start_dictionary(pdu, slave, now).is_ok() {
                    self.state = State::SdoDict(index);
                }
            }
        }
    }
}

/// Resolve a ring position to a configured station address.
fn station_address(slaves: &[Slave], position: u16) -> Option<u16> {
    slaves
        .iter()
        .find(|slave| slave.ring_position == position)
        .map(Slave::station_address)
}

/// Detach every config from its slave, e.g. ahead of a rescan.
fn detach_configs(configs: &mut [SlaveConfig]) {
    for config in configs {
        config.attached_slave = None;
    }
}

/// Attach configs to matching scanned slaves. The first config declared for an address wins.
///
/// Attached slaves are requested into `PRE-OP` while the master idles and into `OP` once it is
/// activated.
pub(crate) fn attach_configs(slaves: &mut [Slave], configs: &mut [SlaveConfig], operation: bool) {
    for slave in slaves.iter_mut() {
        slave.config = None;
    }

    for (config_index, config) in configs.iter_mut().enumerate() {
        config.attached_slave = None;

        // Alias addressing: `position` counts from the first slave carrying the alias.
        // Absolute addressing uses alias zero and the plain ring position.
        let target = if config.alias == 0 {
            Some(config.position)
        } else {
            slaves
                .iter()
                .find(|slave| slave.alias == config.alias)
                .map(|base| base.ring_position + config.position)
        };

        let Some(target) = target else {
            continue;
        };

        let Some(slave_index) = slaves
            .iter()
            .position(|slave| slave.ring_position == target)
        else {
            continue;
        };

        let slave = &mut slaves[slave_index];

        if slave.config.is_some() {
            log::warn!(
                "Slave {} already has a config attached; ignoring config {}",
                slave.ring_position,
                config_index
            );

            continue;
        }

        if slave.identity.vendor_id != config.vendor_id
            || slave.identity.product_code != config.product_code
        {
            log::warn!(
                "Slave {}: identity {} does not match config ({:#010x}, {:#010x})",
                slave.ring_position,
                slave.identity,
                config.vendor_id,
                config.product_code
            );

            continue;
        }

        slave.config = Some(crate::slave_config::SlaveConfigHandle(config_index));
        slave.requested_state = if operation {
            crate::slave_state::AlState::Op
        } else {
            crate::slave_state::AlState::PreOp
        };
        config.attached_slave = Some(slave_index);

        log::debug!("Config {} attached to slave {}", config_index, target);
    }
}
