//! Slave configuration sub-FSM: drive one attached slave from `INIT` all the way to `OP`.
//!
//! The sequence follows the register model of ETG1000.4: reset FMMUs and sync managers in
//! `INIT`, program the mailbox sync managers, move to `PRE-OP`, apply the configuration SDOs and
//! any declared PDO assignment/mapping over CoE, program the process data sync managers and
//! FMMUs from the attached domains, optionally set up DC SYNC signals, then request `SAFE-OP`
//! and `OP`.

use super::change::ChangeFsm;
use super::coe::CoeFsm;
use super::{FsmResult, Poll, poll_datagram};
use crate::datagram::DatagramId;
use crate::domain::Domain;
use crate::error::{Error, SlaveError};
use crate::fmmu::Fmmu;
use crate::pdo::{Pdo, PdoDirection, PdoEntry};
use crate::pdu_loop::PduLoop;
use crate::register::RegisterAddress;
use crate::slave::Slave;
use crate::slave_config::{SdoConfig, SlaveConfig, WatchdogMode};
use crate::slave_state::AlState;
use crate::sync_manager_channel::{Control, Direction, Enable, OperationMode, SyncManagerChannel};
use ethercrab_wire::{EtherCrabWireWrite, EtherCrabWireWriteSized};

/// CoE object range carrying the per sync manager PDO assignment.
const PDO_ASSIGN_BASE: u16 = 0x1c10;

/// RxPDO (output) index range.
const RX_PDO_RANGE: core::ops::RangeInclusive<u16> = 0x1600..=0x17ff;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum State {
    #[default]
    Idle,
    /// Driving the slave to `INIT`.
    InitRequest,
    /// Zeroing the FMMU table.
    ClearFmmus,
    /// Zeroing the sync manager table.
    ClearSyncs,
    /// Writing the watchdog divider.
    WatchdogDivider,
    /// Writing the sync manager watchdog intervals.
    WatchdogIntervals,
    /// Programming SM0/SM1 for mailbox operation.
    MailboxSms,
    /// Driving the slave to `PRE-OP`.
    PreopRequest,
    /// Reading the PDO assignment count of one sync manager over CoE.
    AssignCount,
    /// Reading one PDO assignment entry over CoE.
    AssignEntry,
    /// Applying one queued SDO download.
    SdoDownload,
    /// Programming one process data sync manager or FMMU.
    DataWrite,
    /// Writing one DC SYNC register.
    DcWrite,
    /// Driving the slave to `SAFE-OP`.
    SafeopRequest,
    /// Driving the slave to `OP`.
    OpRequest,
}

/// Outcome of a plain register write round trip.
enum Ack {
    Waiting,
    Offline,
    Ok,
}

/// Configures one slave from its attached [`SlaveConfig`].
#[derive(Debug)]
pub(crate) struct ConfigFsm {
    datagram: DatagramId,
    change: ChangeFsm,
    coe: CoeFsm,
    state: State,
    /// Flattened SDO downloads: user configuration SDOs plus generated mapping/assignment
    /// writes.
    sdo_queue: Vec<SdoConfig>,
    sdo_pos: usize,
    /// Sync manager channels to program for process data.
    sm_writes: heapless::Vec<(u8, SyncManagerChannel), 16>,
    /// FMMU entities to program.
    fmmu_writes: heapless::Vec<Fmmu, 16>,
    /// Progress through `sm_writes` then `fmmu_writes`.
    write_pos: usize,
    /// DC register writes remaining, as `(register, value bytes, length)` triples.
    dc_writes: Vec<(u16, [u8; 4], usize)>,
    dc_pos: usize,
    /// Sync manager currently probed for its CoE PDO assignment.
    assign_sm: u8,
    /// Number of assigned PDOs reported for `assign_sm`.
    assign_count: u8,
    /// 1-based assignment entry currently being read.
    assign_pos: u8,
    retries: u8,
}

impl ConfigFsm {
    pub fn new(pdu: &mut PduLoop) -> Self {
        Self {
            datagram: pdu.alloc("config"),
            change: ChangeFsm::new(pdu),
            coe: CoeFsm::new(pdu),
            state: State::Idle,
            sdo_queue: Vec::new(),
            sdo_pos: 0,
            sm_writes: heapless::Vec::new(),
            fmmu_writes: heapless::Vec::new(),
            write_pos: 0,
            dc_writes: Vec::new(),
            dc_pos: 0,
            assign_sm: 0,
            assign_count: 0,
            assign_pos: 0,
            retries: 0,
        }
    }

    /// Begin configuring `slave`.
    pub fn start(&mut self, pdu: &mut PduLoop, slave: &mut Slave, now: u64) -> Result<(), Error> {
        debug_assert!(self.state == State::Idle);

        log::debug!("Configuring slave {}", slave.ring_position);

        slave.self_configured = false;

        self.change.start(pdu, slave, AlState::Init, now)?;

        self.state = State::InitRequest;
        self.retries = 0;

        Ok(())
    }

    fn fail(&mut self, slave: &mut Slave, error: Error) -> FsmResult {
        log::error!(
            "Slave {}: configuration failed: {}",
            slave.ring_position,
            error
        );

        slave.error_flag = true;
        self.state = State::Idle;

        FsmResult::Failed(error)
    }

    fn queue_write(
        &mut self,
        pdu: &mut PduLoop,
        slave: &Slave,
        register: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        let datagram = pdu.get_mut(self.datagram);

        datagram.init_npwr(slave.station_address, register, data.len())?;
        datagram.payload_mut().copy_from_slice(data);

        pdu.queue(self.datagram);

        Ok(())
    }

    fn ack(&mut self, pdu: &mut PduLoop, slave: &mut Slave) -> Ack {
        match poll_datagram(pdu, self.datagram, &mut self.retries) {
            Poll::Waiting => Ack::Waiting,
            Poll::GaveUp | Poll::Response(0) => {
                slave.set_offline();

                Ack::Offline
            }
            Poll::Response(_) => Ack::Ok,
        }
    }

    /// Advance by at most one transition.
    pub fn exec(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        config: &mut SlaveConfig,
        config_index: usize,
        domains: &[Domain],
        now: u64,
    ) -> FsmResult {
        match self.state {
            State::Idle => FsmResult::Done,

            State::InitRequest => match self.change.exec(pdu, slave, now) {
                FsmResult::Pending => FsmResult::Pending,
                FsmResult::Failed(e) => self.fail(slave, e),
                FsmResult::Done => {
                    // FMMU table: 16 entities of 16 bytes each
                    if let Err(e) =
                        self.queue_write(pdu, slave, RegisterAddress::fmmu(0), &[0u8; 256])
                    {
                        return self.fail(slave, e);
                    }

                    self.state = State::ClearFmmus;

                    FsmResult::Pending
                }
            },

            State::ClearFmmus => match self.ack(pdu, slave) {
                Ack::Waiting => FsmResult::Pending,
                Ack::Offline => self.fail(slave, Error::Slave(SlaveError::Offline)),
                Ack::Ok => {
                    let sync_bytes = usize::from(slave.base.sync_count.max(8)) * 8;
                    let zeroes = vec![0u8; sync_bytes];

                    if let Err(e) =
                        self.queue_write(pdu, slave, RegisterAddress::sync_manager(0), &zeroes)
                    {
                        return self.fail(slave, e);
                    }

                    self.state = State::ClearSyncs;

                    FsmResult::Pending
                }
            },

            State::ClearSyncs => match self.ack(pdu, slave) {
                Ack::Waiting => FsmResult::Pending,
                Ack::Offline => self.fail(slave, Error::Slave(SlaveError::Offline)),
                Ack::Ok => {
                    self.enter_watchdog_phase(pdu, slave, config, config_index, domains, now)
                }
            },

            State::WatchdogDivider => match self.ack(pdu, slave) {
                Ack::Waiting => FsmResult::Pending,
                Ack::Offline => self.fail(slave, Error::Slave(SlaveError::Offline)),
                Ack::Ok => {
                    if config.watchdog_intervals != 0 {
                        let intervals = config.watchdog_intervals.to_le_bytes();

                        if let Err(e) = self.queue_write(
                            pdu,
                            slave,
                            RegisterAddress::SyncManagerWatchdog.into(),
                            &intervals,
                        ) {
                            return self.fail(slave, e);
                        }

                        self.state = State::WatchdogIntervals;

                        return FsmResult::Pending;
                    }

                    self.enter_mailbox_phase(pdu, slave, config, config_index, domains, now)
                }
            },

            State::WatchdogIntervals => match self.ack(pdu, slave) {
                Ack::Waiting => FsmResult::Pending,
                Ack::Offline => self.fail(slave, Error::Slave(SlaveError::Offline)),
                Ack::Ok => self.enter_mailbox_phase(pdu, slave, config, config_index, domains, now),
            },

            State::MailboxSms => match self.ack(pdu, slave) {
                Ack::Waiting => FsmResult::Pending,
                Ack::Offline => self.fail(slave, Error::Slave(SlaveError::Offline)),
                Ack::Ok => match self.change.start(pdu, slave, AlState::PreOp, now) {
                    Ok(()) => {
                        self.state = State::PreopRequest;

                        FsmResult::Pending
                    }
                    Err(e) => self.fail(slave, e),
                },
            },

            State::PreopRequest => match self.change.exec(pdu, slave, now) {
                FsmResult::Pending => FsmResult::Pending,
                FsmResult::Failed(e) => self.fail(slave, e),
                FsmResult::Done => {
                    slave.preop_at = now;

                    if slave.requested_state == AlState::PreOp {
                        // Idle phase: slaves are parked in PRE-OP until activation
                        slave.self_configured = true;
                        self.state = State::Idle;

                        return FsmResult::Done;
                    }

                    if slave.supports_coe() && !config.has_pdo_assignment() {
                        // Best effort: refine the SII PDO tree from the live assignment objects
                        self.assign_sm = 0;

                        return self.queue_assign_count(
                            pdu,
                            slave,
                            config,
                            config_index,
                            domains,
                            now,
                        );
                    }

                    self.start_sdo_phase(pdu, slave, config, config_index, domains, now)
                }
            },

            State::AssignCount => match self.coe.exec(pdu, slave, now) {
                FsmResult::Pending => FsmResult::Pending,
                FsmResult::Failed(e) => {
                    // The assignment read is best effort only
                    log::debug!(
                        "Slave {}: no PDO assignment readable for SM{} ({})",
                        slave.ring_position,
                        self.assign_sm,
                        e
                    );

                    self.assign_sm += 1;

                    self.queue_assign_count(pdu, slave, config, config_index, domains, now)
                }
                FsmResult::Done => {
                    self.assign_count = self.coe.take_data().first().copied().unwrap_or(0);
                    self.assign_pos = 0;

                    self.next_assign_entry(pdu, slave, config, config_index, domains, now)
                }
            },

            State::AssignEntry => match self.coe.exec(pdu, slave, now) {
                FsmResult::Pending => FsmResult::Pending,
                FsmResult::Failed(e) => {
                    log::debug!(
                        "Slave {}: PDO assignment entry read failed ({})",
                        slave.ring_position,
                        e
                    );

                    self.assign_sm += 1;

                    self.queue_assign_count(pdu, slave, config, config_index, domains, now)
                }
                FsmResult::Done => {
                    let data = self.coe.take_data();

                    let pdo_index = u16::from(data.first().copied().unwrap_or(0))
                        | u16::from(data.get(1).copied().unwrap_or(0)) << 8;

                    if pdo_index != 0 {
                        apply_assignment(slave, self.assign_sm, pdo_index);
                    }

                    self.next_assign_entry(pdu, slave, config, config_index, domains, now)
                }
            },

            State::SdoDownload => match self.coe.exec(pdu, slave, now) {
                FsmResult::Pending => FsmResult::Pending,
                FsmResult::Failed(e) => self.fail(slave, e),
                FsmResult::Done => {
                    self.sdo_pos += 1;

                    self.next_sdo(pdu, slave, config, config_index, domains, now)
                }
            },

            State::DataWrite => match self.ack(pdu, slave) {
                Ack::Waiting => FsmResult::Pending,
                Ack::Offline => self.fail(slave, Error::Slave(SlaveError::Offline)),
                Ack::Ok => {
                    self.write_pos += 1;

                    self.next_data_write(pdu, slave, config, now)
                }
            },

            State::DcWrite => match self.ack(pdu, slave) {
                Ack::Waiting => FsmResult::Pending,
                Ack::Offline => self.fail(slave, Error::Slave(SlaveError::Offline)),
                Ack::Ok => {
                    self.dc_pos += 1;

                    self.next_dc_write(pdu, slave, now)
                }
            },

            State::SafeopRequest => match self.change.exec(pdu, slave, now) {
                FsmResult::Pending => FsmResult::Pending,
                FsmResult::Failed(e) => self.fail(slave, e),
                FsmResult::Done => match self.change.start(pdu, slave, AlState::Op, now) {
                    Ok(()) => {
                        self.state = State::OpRequest;

                        FsmResult::Pending
                    }
                    Err(e) => self.fail(slave, e),
                },
            },

            State::OpRequest => match self.change.exec(pdu, slave, now) {
                FsmResult::Pending => FsmResult::Pending,
                FsmResult::Failed(e) => self.fail(slave, e),
                FsmResult::Done => {
                    slave.self_configured = true;
                    self.state = State::Idle;

                    log::info!("Slave {}: configured and operational", slave.ring_position);

                    FsmResult::Done
                }
            },
        }
    }

    /// Write watchdog registers if the config overrides them, otherwise go straight to the
    /// mailbox phase.
    fn enter_watchdog_phase(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        config: &mut SlaveConfig,
        config_index: usize,
        domains: &[Domain],
        now: u64,
    ) -> FsmResult {
        if config.watchdog_divider != 0 {
            let divider = config.watchdog_divider.to_le_bytes();

            if let Err(e) =
                self.queue_write(pdu, slave, RegisterAddress::WatchdogDivider.into(), &divider)
            {
                return self.fail(slave, e);
            }

            self.state = State::WatchdogDivider;

            return FsmResult::Pending;
        }

        if config.watchdog_intervals != 0 {
            let intervals = config.watchdog_intervals.to_le_bytes();

            if let Err(e) = self.queue_write(
                pdu,
                slave,
                RegisterAddress::SyncManagerWatchdog.into(),
                &intervals,
            ) {
                return self.fail(slave, e);
            }

            self.state = State::WatchdogIntervals;

            return FsmResult::Pending;
        }

        self.enter_mailbox_phase(pdu, slave, config, config_index, domains, now)
    }

    fn enter_mailbox_phase(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        config: &mut SlaveConfig,
        config_index: usize,
        domains: &[Domain],
        now: u64,
    ) -> FsmResult {
        let _ = (config, config_index, domains);

        if !slave.supports_mailbox() {
            // No mailbox sync managers to program; go straight for PRE-OP
            return match self.change.start(pdu, slave, AlState::PreOp, now) {
                Ok(()) => {
                    self.state = State::PreopRequest;

                    FsmResult::Pending
                }
                Err(e) => self.fail(slave, e),
            };
        }

        let mut channels = [0u8; 16];

        SyncManagerChannel {
            physical_start: slave.rx_mailbox.offset,
            length: slave.rx_mailbox.size,
            control: Control {
                mode: OperationMode::Mailbox,
                direction: Direction::MasterWrite,
                ecat_event_enable: false,
                pdi_event_enable: true,
                watchdog_enable: false,
            },
            status: Default::default(),
            enable: Enable {
                enable: true,
                ..Default::default()
            },
        }
        .pack_to_slice_unchecked(&mut channels[0..8]);

        SyncManagerChannel {
            physical_start: slave.tx_mailbox.offset,
            length: slave.tx_mailbox.size,
            control: Control {
                mode: OperationMode::Mailbox,
                direction: Direction::MasterRead,
                ecat_event_enable: false,
                pdi_event_enable: true,
                watchdog_enable: false,
            },
            status: Default::default(),
            enable: Enable {
                enable: true,
                ..Default::default()
            },
        }
        .pack_to_slice_unchecked(&mut channels[8..16]);

        if let Err(e) = self.queue_write(pdu, slave, RegisterAddress::sync_manager(0), &channels) {
            return self.fail(slave, e);
        }

        self.state = State::MailboxSms;

        FsmResult::Pending
    }

    fn queue_assign_count(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        config: &mut SlaveConfig,
        config_index: usize,
        domains: &[Domain],
        now: u64,
    ) -> FsmResult {
        if u16::from(self.assign_sm) >= u16::from(slave.base.sync_count).min(8) {
            return self.start_sdo_phase(pdu, slave, config, config_index, domains, now);
        }

        match self.coe.start_upload(
            pdu,
            slave,
            PDO_ASSIGN_BASE + u16::from(self.assign_sm),
            0,
            now,
        ) {
            Ok(()) => {
                self.state = State::AssignCount;

                FsmResult::Pending
            }
            Err(e) => self.fail(slave, e),
        }
    }

    fn next_assign_entry(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        config: &mut SlaveConfig,
        config_index: usize,
        domains: &[Domain],
        now: u64,
    ) -> FsmResult {
        if self.assign_pos >= self.assign_count {
            self.assign_sm += 1;

            return self.queue_assign_count(pdu, slave, config, config_index, domains, now);
        }

        self.assign_pos += 1;

        match self.coe.start_upload(
            pdu,
            slave,
            PDO_ASSIGN_BASE + u16::from(self.assign_sm),
            self.assign_pos,
            now,
        ) {
            Ok(()) => {
                self.state = State::AssignEntry;

                FsmResult::Pending
            }
            Err(e) => self.fail(slave, e),
        }
    }

    /// Build the SDO download list and start applying it.
    fn start_sdo_phase(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        config: &mut SlaveConfig,
        config_index: usize,
        domains: &[Domain],
        now: u64,
    ) -> FsmResult {
        if config.has_pdo_assignment() {
            apply_declared_pdos(slave, config);
        }

        self.sdo_queue = config.sdo_configs.clone();
        self.sdo_queue.extend(pdo_sdo_writes(config));
        self.sdo_pos = 0;

        // The data phase layout only depends on state that is fixed by now
        self.build_data_writes(slave, config, config_index, domains);

        self.next_sdo(pdu, slave, config, config_index, domains, now)
    }

    fn next_sdo(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        config: &mut SlaveConfig,
        config_index: usize,
        domains: &[Domain],
        now: u64,
    ) -> FsmResult {
        let _ = (config_index, domains);

        let Some(sdo) = self.sdo_queue.get(self.sdo_pos) else {
            self.write_pos = 0;

            return self.next_data_write(pdu, slave, config, now);
        };

        log::debug!(
            "Slave {}: SDO config {:#06x}:{}, {} byte(s)",
            slave.ring_position,
            sdo.index,
            sdo.subindex,
            sdo.data.len()
        );

        let (index, subindex, data) = (sdo.index, sdo.subindex, sdo.data.clone());

        match self.coe.start_download(pdu, slave, index, subindex, data, now) {
            Ok(()) => {
                self.state = State::SdoDownload;

                FsmResult::Pending
            }
            Err(e) => self.fail(slave, e),
        }
    }

    /// Compute the process data sync manager and FMMU programs from the attached domains.
    fn build_data_writes(
        &mut self,
        slave: &mut Slave,
        config: &SlaveConfig,
        config_index: usize,
        domains: &[Domain],
    ) {
        self.sm_writes.clear();
        self.fmmu_writes.clear();

        for domain in domains {
            for slice in domain
                .fmmus
                .iter()
                .filter(|slice| slice.config == config_index)
            {
                let length = slice.bit_length.div_ceil(8) as u16;

                let sm_desc = slave
                    .categories
                    .sync_managers
                    .get(usize::from(slice.sync_index))
                    .copied()
                    .unwrap_or_default();

                if sm_desc.start == 0 {
                    log::warn!(
                        "Slave {}: no SII descriptor for SM{}, skipping",
                        slave.ring_position,
                        slice.sync_index
                    );

                    continue;
                }

                let direction = match slice.direction {
                    PdoDirection::Input => Direction::MasterRead,
                    PdoDirection::Output => Direction::MasterWrite,
                };

                let watchdog_enable = match config
                    .sync_configs
                    .get(usize::from(slice.sync_index))
                    .map(|sync| sync.watchdog)
                    .unwrap_or_default()
                {
                    WatchdogMode::Default => sm_desc.control.watchdog_enable,
                    WatchdogMode::Enable => true,
                    WatchdogMode::Disable => false,
                };

                let sm_write = (
                    slice.sync_index,
                    SyncManagerChannel {
                        physical_start: sm_desc.start,
                        length,
                        control: Control {
                            mode: OperationMode::Buffered,
                            direction,
                            ecat_event_enable: false,
                            pdi_event_enable: true,
                            watchdog_enable,
                        },
                        status: Default::default(),
                        enable: Enable {
                            enable: true,
                            ..Default::default()
                        },
                    },
                );

                if self.sm_writes.push(sm_write).is_err() {
                    log::warn!(
                        "Slave {}: more than 16 process data sync managers, skipping",
                        slave.ring_position
                    );

                    continue;
                }

                let logical_byte = domain.logical_base + slice.logical_start_bit / 8;
                let start_bit = (slice.logical_start_bit % 8) as u8;
                let end_bit = ((slice.logical_start_bit % 8 + slice.bit_length - 1) % 8) as u8;

                let fmmu = Fmmu {
                    logical_start: logical_byte,
                    length: ((u32::from(start_bit) + slice.bit_length).div_ceil(8)) as u16,
                    logical_start_bit: start_bit,
                    logical_end_bit: end_bit,
                    physical_start: sm_desc.start,
                    physical_start_bit: 0,
                    read_enable: slice.direction == PdoDirection::Input,
                    write_enable: slice.direction == PdoDirection::Output,
                    enable: true,
                };

                if self.fmmu_writes.push(fmmu).is_err() {
                    log::warn!(
                        "Slave {}: more than 16 FMMU mappings, skipping",
                        slave.ring_position
                    );
                }
            }
        }
    }

    /// Queue the next SM or FMMU write, or fall through to the DC phase.
    fn next_data_write(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        config: &SlaveConfig,
        now: u64,
    ) -> FsmResult {
        if self.write_pos < self.sm_writes.len() {
            let (sm_index, channel) = self.sm_writes[self.write_pos];
            let data = channel.pack();

            log::debug!("Slave {}: SM{}: {}", slave.ring_position, sm_index, channel);

            if let Err(e) =
                self.queue_write(pdu, slave, RegisterAddress::sync_manager(sm_index), &data)
            {
                return self.fail(slave, e);
            }

            self.state = State::DataWrite;

            return FsmResult::Pending;
        }

        let fmmu_pos = self.write_pos - self.sm_writes.len();

        if fmmu_pos < self.fmmu_writes.len() {
            let fmmu = self.fmmu_writes[fmmu_pos];
            let data = fmmu.pack();

            log::debug!("Slave {}: FMMU{}: {}", slave.ring_position, fmmu_pos, fmmu);

            if let Err(e) = self.queue_write(pdu, slave, RegisterAddress::fmmu(fmmu_pos as u8), &data)
            {
                return self.fail(slave, e);
            }

            self.state = State::DataWrite;

            return FsmResult::Pending;
        }

        self.enter_dc_phase(pdu, slave, config, now)
    }

    /// Queue the DC SYNC register writes, or go straight to `SAFE-OP`.
    fn enter_dc_phase(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        config: &SlaveConfig,
        now: u64,
    ) -> FsmResult {
        self.dc_writes.clear();
        self.dc_pos = 0;

        if config.dc_assign_activate != 0 {
            let sync0 = config.dc_sync_signals[0];
            let sync1 = config.dc_sync_signals[1];

            let mut start = [0u8; 4];
            start.copy_from_slice(&(sync0.shift_time_ns.max(0) as u32).to_le_bytes());

            let mut cycle0 = [0u8; 4];
            cycle0.copy_from_slice(&sync0.cycle_time_ns.to_le_bytes());

            let mut cycle1 = [0u8; 4];
            cycle1.copy_from_slice(&sync1.cycle_time_ns.to_le_bytes());

            self.dc_writes.push((
                RegisterAddress::DcSync0CycleTime.into(),
                cycle0,
                4,
            ));
            self.dc_writes.push((
                RegisterAddress::DcSync1CycleTime.into(),
                cycle1,
                4,
            ));
            self.dc_writes
                .push((RegisterAddress::DcSyncStartTime.into(), start, 4));

            let active = [(config.dc_assign_activate & 0x00ff) as u8, 0, 0, 0];

            self.dc_writes
                .push((RegisterAddress::DcSyncActive.into(), active, 1));
        }

        self.next_dc_write(pdu, slave, now)
    }

    fn next_dc_write(&mut self, pdu: &mut PduLoop, slave: &mut Slave, now: u64) -> FsmResult {
        let Some(&(register, value, len)) = self.dc_writes.get(self.dc_pos) else {
            return match self.change.start(pdu, slave, AlState::SafeOp, now) {
                Ok(()) => {
                    self.state = State::SafeopRequest;

                    FsmResult::Pending
                }
                Err(e) => self.fail(slave, e),
            };
        };

        if let Err(e) = self.queue_write(pdu, slave, register, &value[0..len]) {
            return self.fail(slave, e);
        }

        self.state = State::DcWrite;

        FsmResult::Pending
    }
}

/// Update a slave's runtime PDO tree from one live assignment entry read over CoE.
fn apply_assignment(slave: &mut Slave, sync_index: u8, pdo_index: u16) {
    if let Some(pdo) = slave.pdos.iter_mut().find(|pdo| pdo.index == pdo_index) {
        if pdo.sync_index != sync_index {
            log::debug!(
                "Slave {}: PDO {:#06x} reassigned to SM{}",
                slave.ring_position,
                pdo_index,
                sync_index
            );

            pdo.sync_index = sync_index;
        }
    } else {
        slave.pdos.push(Pdo {
            index: pdo_index,
            sync_index,
            direction: direction_for_index(pdo_index),
            name: String::new(),
            entries: Vec::new(),
        });
    }
}

/// Rebuild a slave's runtime PDO tree for sync managers the user declared assignments for.
pub(crate) fn apply_declared_pdos(slave: &mut Slave, config: &SlaveConfig) {
    for (sm_index, sync) in config.sync_configs.iter().enumerate() {
        if sync.pdos.is_empty() {
            continue;
        }

        let sm_index = sm_index as u8;

        // Everything previously assigned to this SM is superseded
        slave.pdos.retain(|pdo| pdo.sync_index != sm_index);

        for declared in &sync.pdos {
            let direction = sync
                .direction
                .unwrap_or_else(|| direction_for_index(declared.index));

            let entries = match &declared.entries {
                Some(entries) => entries
                    .iter()
                    .map(|entry| PdoEntry {
                        index: entry.index,
                        subindex: entry.subindex,
                        bit_length: entry.bit_length,
                        name: String::new(),
                    })
                    .collect(),
                None => slave
                    .categories
                    .tx_pdos
                    .iter()
                    .chain(&slave.categories.rx_pdos)
                    .find(|record| record.desc.index == declared.index)
                    .map(|record| {
                        record
                            .entries
                            .iter()
                            .map(|entry| PdoEntry {
                                index: entry.index,
                                subindex: entry.subindex,
                                bit_length: entry.bit_length,
                                name: String::new(),
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            };

            slave.pdos.push(Pdo {
                index: declared.index,
                sync_index: sm_index,
                direction,
                name: String::new(),
                entries,
            });
        }
    }
}

/// The conventional direction of a PDO index range.
fn direction_for_index(index: u16) -> PdoDirection {
    if RX_PDO_RANGE.contains(&index) {
        PdoDirection::Output
    } else {
        PdoDirection::Input
    }
}

/// Generate the CoE writes for a declared PDO mapping and assignment.
fn pdo_sdo_writes(config: &SlaveConfig) -> Vec<SdoConfig> {
    let mut writes = Vec::new();

    for (sm_index, sync) in config.sync_configs.iter().enumerate() {
        if sync.pdos.is_empty() {
            continue;
        }

        let assign_index = PDO_ASSIGN_BASE + sm_index as u16;

        // Clear the assignment before touching any mapping objects
        writes.push(SdoConfig {
            index: assign_index,
            subindex: 0,
            data: vec![0u8],
        });

        for pdo in &sync.pdos {
            let Some(entries) = &pdo.entries else {
                continue;
            };

            writes.push(SdoConfig {
                index: pdo.index,
                subindex: 0,
                data: vec![0u8],
            });

            for (position, entry) in entries.iter().enumerate() {
                let raw = u32::from(entry.index) << 16
                    | u32::from(entry.subindex) << 8
                    | u32::from(entry.bit_length);

                writes.push(SdoConfig {
                    index: pdo.index,
                    subindex: position as u8 + 1,
                    data: raw.to_le_bytes().to_vec(),
                });
            }

            writes.push(SdoConfig {
                index: pdo.index,
                subindex: 0,
                data: vec![entries.len() as u8],
            });
        }

        for (position, pdo) in sync.pdos.iter().enumerate() {
            writes.push(SdoConfig {
                index: assign_index,
                subindex: position as u8 + 1,
                data: pdo.index.to_le_bytes().to_vec(),
            });
        }

        writes.push(SdoConfig {
            index: assign_index,
            subindex: 0,
            data: vec![sync.pdos.len() as u8],
        });
    }

    writes
}
