//! FoE sub-FSM: file reads and writes over the mailbox with packet numbering and BUSY/ERR
//! handling.

use super::FsmResult;
use super::mailbox::{MailboxIo, MbxPoll};
use crate::error::{Error, FoeError, MailboxError};
use crate::foe::{self, FOE_HEADER_LEN, FoeMessage};
use crate::mailbox::{self, MAILBOX_HEADER_LEN, MailboxType};
use crate::pdu_loop::PduLoop;
use crate::slave::Slave;

/// Bound on each FoE response.
const FOE_TIMEOUT_NS: u64 = 3_000_000_000;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum State {
    #[default]
    Idle,
    /// Write: awaiting the zero acknowledge of the write request.
    WrqSent,
    /// Write: awaiting the acknowledge of a data packet.
    DataSent,
    /// Read: awaiting the first data packet.
    RrqSent,
    /// Read: awaiting the data packet following an acknowledge.
    AckSent,
    /// Read: delivering the final acknowledge, no reply expected.
    FinalAck,
}

/// Drives one FoE file transfer against one slave.
#[derive(Debug)]
pub(crate) struct FoeFsm {
    io: MailboxIo,
    state: State,
    /// File contents: source for writes, accumulator for reads.
    buffer: Vec<u8>,
    /// Write progress in bytes.
    offset: usize,
    /// Packet number of the last sent or acknowledged packet.
    packet: u32,
    /// The last sent data packet was the final one.
    last_sent: bool,
    /// Length of the last sent data chunk, for BUSY retransmission.
    last_chunk_len: usize,
    /// Upper bound for a read; exceeding it fails with `FoeBufferFull`.
    max_size: usize,
    /// Remote error of the last failed transfer.
    remote_error: Option<(u32, Option<String>)>,
}

impl FoeFsm {
    pub fn new(pdu: &mut PduLoop) -> Self {
        Self {
            io: MailboxIo::new(pdu, "foe"),
            state: State::Idle,
            buffer: Vec::new(),
            offset: 0,
            packet: 0,
            last_sent: false,
            last_chunk_len: 0,
            max_size: 0,
            remote_error: None,
        }
    }

    /// Begin writing `data` to the file `file_name` on the slave.
    pub fn start_write(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        file_name: &str,
        password: u32,
        data: Vec<u8>,
        now: u64,
    ) -> Result<(), Error> {
        debug_assert!(self.state == State::Idle);

        if !slave.supports_foe() {
            return Err(Error::Mailbox(MailboxError::NotSupported));
        }

        self.buffer = data;
        self.offset = 0;
        self.packet = 0;
        self.last_sent = false;
        self.remote_error = None;

        self.io.start(
            pdu,
            slave,
            MailboxType::Foe,
            &foe::write_request(file_name, password),
            FOE_TIMEOUT_NS,
            now,
        )?;

        self.state = State::WrqSent;

        Ok(())
    }

    /// Begin reading the file `file_name` from the slave, up to `max_size` bytes.
    pub fn start_read(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        file_name: &str,
        password: u32,
        max_size: usize,
        now: u64,
    ) -> Result<(), Error> {
        debug_assert!(self.state == State::Idle);

        if !slave.supports_foe() {
            return Err(Error::Mailbox(MailboxError::NotSupported));
        }

        self.buffer = Vec::new();
        self.packet = 0;
        self.max_size = max_size;
        self.remote_error = None;

        self.io.start(
            pdu,
            slave,
            MailboxType::Foe,
            &foe::read_request(file_name, password),
            FOE_TIMEOUT_NS,
            now,
        )?;

        self.state = State::RrqSent;

        Ok(())
    }

    /// The file read by the last completed transfer.
    pub fn take_data(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.buffer)
    }

    /// Remote error code and text of the last failed transfer.
    pub fn remote_error(&self) -> Option<&(u32, Option<String>)> {
        self.remote_error.as_ref()
    }

    /// Bytes of file data per full mailbox fragment.
    fn fragment_size(slave: &Slave) -> usize {
        usize::from(slave.rx_mailbox.size)
            .saturating_sub(MAILBOX_HEADER_LEN + FOE_HEADER_LEN)
            .max(1)
    }

    fn fail(&mut self, error: Error) -> FsmResult {
        self.state = State::Idle;
        self.io.reset();

        FsmResult::Failed(error)
    }

    /// Advance by at most one transition.
    pub fn exec(&mut self, pdu: &mut PduLoop, slave: &mut Slave, now: u64) -> FsmResult {
        if self.state == State::Idle {
            return FsmResult::Done;
        }

        let region = match self.io.poll(pdu, slave, now) {
            MbxPoll::Waiting => return FsmResult::Pending,
            MbxPoll::Failed(Error::Mailbox(MailboxError::NoResponse)) => {
                return self.fail(Error::Foe(FoeError::Timeout));
            }
            MbxPoll::Failed(e) => return self.fail(e),
            MbxPoll::Mail(region) => region,
        };

        if self.state == State::FinalAck {
            // The concluding acknowledge went out; the transfer is complete
            self.state = State::Idle;

            return FsmResult::Done;
        }

        let (_header, payload) = match mailbox::parse(&region, MailboxType::Foe) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(e),
        };

        let message = match foe::parse(payload) {
            Ok(message) => message,
            Err(e) => return self.fail(e),
        };

        if let FoeMessage::Error { code, text } = &message {
            log::error!(
                "Slave {}: FoE error {:#010x}{}",
                slave.ring_position,
                code,
                text.as_deref()
                    .map(|text| format!(" \"{}\"", text))
                    .unwrap_or_default()
            );

            let (code, text) = (*code, text.clone());

            self.remote_error = Some((code, text.clone()));

            return self.fail(Error::Foe(FoeError::Remote { code, text }));
        }

        match self.state {
            State::Idle | State::FinalAck => FsmResult::Done,

            State::WrqSent => match message {
                FoeMessage::Ack { packet: 0 } => self.queue_data(pdu, slave, now),
                FoeMessage::Ack { .. } | FoeMessage::Data { .. } => {
                    self.fail(Error::Foe(FoeError::Protocol))
                }
                FoeMessage::Busy => self.retransmit_request(pdu, slave, now),
                FoeMessage::Error { .. } => unreachable!(),
            },

            State::DataSent => match message {
                FoeMessage::Ack { packet } if packet == self.packet => {
                    if self.last_sent {
                        self.state = State::Idle;

                        return FsmResult::Done;
                    }

                    self.queue_data(pdu, slave, now)
                }
                FoeMessage::Busy => {
                    // Retransmit the packet the slave could not take
                    self.offset -= self.last_chunk_len;
                    self.packet -= 1;

                    self.queue_data(pdu, slave, now)
                }
                _ => self.fail(Error::Foe(FoeError::Protocol)),
            },

            State::RrqSent | State::AckSent => match message {
                FoeMessage::Data { packet, data } => {
                    if packet != self.packet + 1 {
                        return self.fail(Error::Foe(FoeError::Protocol));
                    }

                    if self.buffer.len() + data.len() > self.max_size {
                        return self.fail(Error::Foe(FoeError::BufferFull));
                    }

                    self.packet = packet;
                    self.buffer.extend_from_slice(&data);

                    let full = Self::fragment_size(slave);
                    let is_last = data.len() < full;

                    if let Err(e) = if is_last {
                        self.io.start_send_only(
                            pdu,
                            slave,
                            MailboxType::Foe,
                            &foe::ack(packet),
                            FOE_TIMEOUT_NS,
                            now,
                        )
                    } else {
                        self.io.start(
                            pdu,
                            slave,
                            MailboxType::Foe,
                            &foe::ack(packet),
                            FOE_TIMEOUT_NS,
                            now,
                        )
                    } {
                        return self.fail(e);
                    }

                    self.state = if is_last {
                        State::FinalAck
                    } else {
                        State::AckSent
                    };

                    FsmResult::Pending
                }
                FoeMessage::Busy => FsmResult::Pending,
                _ => self.fail(Error::Foe(FoeError::Protocol)),
            },
        }
    }

    fn retransmit_request(&mut self, _pdu: &mut PduLoop, _slave: &mut Slave, _now: u64) -> FsmResult {
        // A BUSY before any data is unusual; surface it as a protocol issue after logging
        log::warn!("FoE: slave busy before transfer start");

        self.fail(Error::Foe(FoeError::Protocol))
    }

    fn queue_data(&mut self, pdu: &mut PduLoop, slave: &mut Slave, now: u64) -> FsmResult {
        let full = Self::fragment_size(slave);

        let remaining = self.buffer.len() - self.offset;
        let chunk_len = remaining.min(full);

        let chunk = &self.buffer[self.offset..self.offset + chunk_len];

        self.packet += 1;
        self.last_sent = chunk_len < full;
        self.last_chunk_len = chunk_len;

        let message = foe::data(self.packet, chunk);

        self.offset += chunk_len;

        if let Err(e) = self
            .io
            .start(pdu, slave, MailboxType::Foe, &message, FOE_TIMEOUT_NS, now)
        {
            return self.fail(e);
        }

        self.state = State::DataSent;

        FsmResult::Pending
    }
}
