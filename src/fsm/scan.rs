//! Slave scan sub-FSM: assign the station address, read base registers, pull in the SII image
//! and materialise the slave's identity, mailbox and PDO information.

use super::sii::SiiFsm;
use super::{FsmResult, Poll, poll_datagram};
use crate::datagram::DatagramId;
use crate::error::{Error, SlaveError};
use crate::pdu_loop::PduLoop;
use crate::register::RegisterAddress;
use crate::sii::categories::{self, MailboxProtocols};
use crate::sii::{SiiImage, word};
use crate::mailbox::MailboxRegion;
use crate::slave::{BaseInfo, MAX_FMMUS, MAX_SYNC_MANAGERS, Slave, SlaveIdentity};
use ethercrab_wire::EtherCrabWireRead;

/// Hard bound on the SII image size to stop a corrupt category chain from walking forever.
const MAX_SII_WORDS: u16 = 0x4000;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum State {
    #[default]
    Idle,
    /// The station address write is on the wire.
    StationWrite,
    /// The base register read is on the wire.
    Base,
    /// Reading the fixed SII header words.
    SiiHeader,
    /// Reading a category header (type and length words).
    CategoryHeader,
    /// Reading category data words up to `data_end`.
    CategoryData,
}

/// Scans one slave after the broadcast address clear.
#[derive(Debug)]
pub(crate) struct ScanFsm {
    datagram: DatagramId,
    sii: SiiFsm,
    state: State,
    /// Next SII word address to read.
    next_word: u16,
    /// First word past the current category's data.
    data_end: u16,
    retries: u8,
}

impl ScanFsm {
    pub fn new(pdu: &mut PduLoop) -> Self {
        Self {
            datagram: pdu.alloc("scan"),
            sii: SiiFsm::new(pdu),
            state: State::Idle,
            next_word: 0,
            data_end: 0,
            retries: 0,
        }
    }

    /// Begin scanning `slave`.
    pub fn start(&mut self, pdu: &mut PduLoop, slave: &mut Slave, _now: u64) -> Result<(), Error> {
        debug_assert!(self.state == State::Idle);

        log::debug!(
            "Scanning slave {}, station address {:#06x}",
            slave.ring_position,
            slave.station_address
        );

        slave.sii = SiiImage::new();

        let datagram = pdu.get_mut(self.datagram);

        datagram.init_apwr(
            slave.ring_position,
            RegisterAddress::ConfiguredStationAddress.into(),
            2,
        )?;
        datagram
            .payload_mut()
            .copy_from_slice(&slave.station_address.to_le_bytes());

        pdu.queue(self.datagram);

        self.state = State::StationWrite;
        self.retries = 0;

        Ok(())
    }

    fn fail(&mut self, slave: &mut Slave, error: Error) -> FsmResult {
        slave.error_flag = true;
        self.state = State::Idle;

        FsmResult::Failed(error)
    }

    /// Advance by at most one transition.
    pub fn exec(&mut self, pdu: &mut PduLoop, slave: &mut Slave, now: u64) -> FsmResult {
        match self.state {
            State::Idle => FsmResult::Done,

            State::StationWrite => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => FsmResult::Pending,
                Poll::GaveUp | Poll::Response(0) => {
                    slave.set_offline();

                    self.fail(slave, Error::Slave(SlaveError::Offline))
                }
                Poll::Response(_) => {
                    let datagram = pdu.get_mut(self.datagram);

                    if let Err(e) =
                        datagram.init_nprd(slave.station_address, RegisterAddress::Type.into(), 10)
                    {
                        return self.fail(slave, e);
                    }

                    pdu.queue(self.datagram);

                    self.state = State::Base;

                    FsmResult::Pending
                }
            },

            State::Base => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => FsmResult::Pending,
                Poll::GaveUp | Poll::Response(0) => {
                    slave.set_offline();

                    self.fail(slave, Error::Slave(SlaveError::Offline))
                }
                Poll::Response(_) => {
                    let base = match BaseInfo::unpack_from_slice(pdu.get(self.datagram).payload()) {
                        Ok(base) => base,
                        Err(e) => return self.fail(slave, e.into()),
                    };

                    slave.base = base;
                    slave.base.fmmu_count = base.fmmu_count.min(MAX_FMMUS);
                    slave.base.sync_count = base.sync_count.min(MAX_SYNC_MANAGERS);

                    log::debug!(
                        "Slave {}: {} FMMUs, {} sync managers, DC {}",
                        slave.ring_position,
                        slave.base.fmmu_count,
                        slave.base.sync_count,
                        if base.support.dc_supported {
                            "supported"
                        } else {
                            "not supported"
                        }
                    );

                    self.next_word = 0;

                    if let Err(e) =
                        self.sii
                            .start_read(pdu, slave.station_address, self.next_word, now)
                    {
                        return self.fail(slave, e);
                    }

                    self.state = State::SiiHeader;

                    FsmResult::Pending
                }
            },

            State::SiiHeader => self.sii_step(pdu, slave, now),
            State::CategoryHeader => self.sii_step(pdu, slave, now),
            State::CategoryData => self.sii_step(pdu, slave, now),
        }
    }

    /// Drive the nested SII read and feed its result into the image walk.
    fn sii_step(&mut self, pdu: &mut PduLoop, slave: &mut Slave, now: u64) -> FsmResult {
        match self.sii.exec(pdu, now) {
            FsmResult::Pending => return FsmResult::Pending,
            FsmResult::Failed(e) => return self.fail(slave, e),
            FsmResult::Done => (),
        }

        let value = self.sii.result();

        slave.sii.set_word(self.next_word, (value & 0xffff) as u16);
        slave.sii.set_word(self.next_word + 1, (value >> 16) as u16);

        match self.state {
            State::SiiHeader => {
                self.next_word += 2;

                if self.next_word < word::FIRST_CATEGORY {
                    return self.queue_sii_read(pdu, slave, now);
                }

                self.state = State::CategoryHeader;

                self.queue_sii_read(pdu, slave, now)
            }

            State::CategoryHeader => {
                let category_type = (value & 0xffff) as u16;
                let len_words = (value >> 16) as u16;

                if category_type == 0xffff {
                    return self.finish(slave);
                }

                let data_start = self.next_word + 2;
                let data_end = data_start.saturating_add(len_words);

                if data_end > MAX_SII_WORDS {
                    log::warn!(
                        "Slave {}: SII category chain exceeds {} words, stopping walk",
                        slave.ring_position,
                        MAX_SII_WORDS
                    );

                    return self.finish(slave);
                }

                if len_words == 0 {
                    self.next_word = data_end;

                    return self.queue_sii_read(pdu, slave, now);
                }

                self.data_end = data_end;
                self.next_word = data_start;
                self.state = State::CategoryData;

                self.queue_sii_read(pdu, slave, now)
            }

            State::CategoryData => {
                self.next_word += 2;

                if self.next_word < self.data_end {
                    return self.queue_sii_read(pdu, slave, now);
                }

                self.next_word = self.data_end;
                self.state = State::CategoryHeader;

                self.queue_sii_read(pdu, slave, now)
            }

            _ => self.fail(slave, Error::Internal),
        }
    }

    fn queue_sii_read(&mut self, pdu: &mut PduLoop, slave: &mut Slave, now: u64) -> FsmResult {
        if let Err(e) = self
            .sii
            .start_read(pdu, slave.station_address, self.next_word, now)
        {
            return self.fail(slave, e);
        }

        FsmResult::Pending
    }

    /// The image is complete; decode the fixed fields and the category chain.
    fn finish(&mut self, slave: &mut Slave) -> FsmResult {
        self.state = State::Idle;

        if !slave.sii.checksum_valid() {
            log::warn!(
                "Slave {}: SII header checksum is invalid",
                slave.ring_position
            );
        }

        slave.alias = slave.sii.word(word::ALIAS).unwrap_or(0);

        slave.identity = SlaveIdentity {
            vendor_id: slave.sii.dword(word::VENDOR_ID).unwrap_or(0),
            product_code: slave.sii.dword(word::PRODUCT_CODE).unwrap_or(0),
            revision: slave.sii.dword(word::REVISION).unwrap_or(0),
            serial: slave.sii.dword(word::SERIAL).unwrap_or(0),
        };

        slave.mailbox_protocols = MailboxProtocols::from_bits_truncate(
            slave.sii.word(word::MAILBOX_PROTOCOLS).unwrap_or(0),
        );

        if !slave.mailbox_protocols.is_empty() {
            slave.rx_mailbox = MailboxRegion {
                offset: slave.sii.word(word::STD_MAILBOX).unwrap_or(0),
                size: slave.sii.word(word::STD_MAILBOX + 1).unwrap_or(0),
            };
            slave.tx_mailbox = MailboxRegion {
                offset: slave.sii.word(word::STD_MAILBOX + 2).unwrap_or(0),
                size: slave.sii.word(word::STD_MAILBOX + 3).unwrap_or(0),
            };
        }

        match categories::parse(&slave.sii) {
            Ok(parsed) => slave.categories = parsed,
            Err(e) => {
                log::warn!(
                    "Slave {}: failed to parse SII categories: {}",
                    slave.ring_position,
                    e
                );
            }
        }

        slave.resolve_sii_pdos();

        log::info!(
            "Slave {}: \"{}\" ({}), {} PDO(s), mailbox protocols {:?}",
            slave.ring_position,
            slave.name(),
            slave.identity,
            slave.pdos.len(),
            slave.mailbox_protocols
        );

        FsmResult::Done
    }
}
