//! Shared mailbox round trip: send a mail, poll the send-mailbox status, fetch the reply.

use super::{Poll, poll_datagram};
use crate::datagram::DatagramId;
use crate::error::{Error, MailboxError, SlaveError};
use crate::mailbox::{self, MailboxType};
use crate::pdu_loop::PduLoop;
use crate::register::RegisterAddress;
use crate::slave::Slave;
use crate::sync_manager_channel::SyncManagerChannel;
use ethercrab_wire::EtherCrabWireRead;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum State {
    #[default]
    Idle,
    /// The mail write is on the wire.
    Sending,
    /// Polling the send-mailbox sync manager status.
    Checking,
    /// Fetching the full send-mailbox region.
    Fetching,
}

/// Result of polling a [`MailboxIo`] round trip.
#[derive(Debug)]
pub(crate) enum MbxPoll {
    /// Still in progress.
    Waiting,
    /// The reply mailbox region, starting with its mailbox header.
    Mail(Vec<u8>),
    /// The round trip failed.
    Failed(Error),
}

/// One outstanding mailbox round trip on one slave.
///
/// Sending writes the slave's whole receive-mailbox region; a working counter of zero on that
/// write means the slave has not yet emptied its mailbox, so the write is repeated. The reply is
/// awaited by polling the send mailbox's sync manager status byte, then fetched as the whole
/// send-mailbox region.
#[derive(Debug)]
pub(crate) struct MailboxIo {
    datagram: DatagramId,
    state: State,
    started_at: u64,
    timeout_ns: u64,
    retries: u8,
    /// Complete after the send, without awaiting a reply mail.
    send_only: bool,
}

impl MailboxIo {
    pub fn new(pdu: &mut PduLoop, name: &'static str) -> Self {
        Self {
            datagram: pdu.alloc(name),
            state: State::Idle,
            started_at: 0,
            timeout_ns: 0,
            retries: 0,
            send_only: false,
        }
    }

    /// Whether a round trip is in progress.
    pub fn is_busy(&self) -> bool {
        self.state != State::Idle
    }

    /// Abandon any in-flight round trip.
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }

    /// Send `payload` framed as `mailbox_type` mail and await the reply.
    ///
    /// `timeout_ns` bounds the whole round trip, from send to fetched reply.
    pub fn start(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        mailbox_type: MailboxType,
        payload: &[u8],
        timeout_ns: u64,
        now: u64,
    ) -> Result<(), Error> {
        debug_assert!(self.state == State::Idle);

        if !slave.supports_mailbox() {
            return Err(Error::Mailbox(MailboxError::NotSupported));
        }

        let counter = mailbox::next_counter(&mut slave.mailbox_counter);

        let datagram = pdu.get_mut(self.datagram);

        datagram.init_npwr(
            slave.station_address,
            slave.rx_mailbox.offset,
            usize::from(slave.rx_mailbox.size),
        )?;

        mailbox::frame(datagram.payload_mut(), mailbox_type, counter, payload)?;

        pdu.queue(self.datagram);

        self.state = State::Sending;
        self.started_at = now;
        self.timeout_ns = timeout_ns;
        self.retries = 0;
        self.send_only = false;

        Ok(())
    }

    /// Send `payload` as `mailbox_type` mail without awaiting any reply.
    ///
    /// Completes with an empty [`MbxPoll::Mail`] once the slave has accepted the mail.
    pub fn start_send_only(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        mailbox_type: MailboxType,
        payload: &[u8],
        timeout_ns: u64,
        now: u64,
    ) -> Result<(), Error> {
        self.start(pdu, slave, mailbox_type, payload, timeout_ns, now)?;

        self.send_only = true;

        Ok(())
    }

    /// Await a further reply without sending anything, e.g. the next fragment of a multi-mail
    /// response.
    pub fn start_fetch(&mut self, pdu: &mut PduLoop, slave: &Slave, timeout_ns: u64, now: u64) {
        debug_assert!(self.state == State::Idle);

        self.queue_check(pdu, slave);

        self.state = State::Checking;
        self.started_at = now;
        self.timeout_ns = timeout_ns;
        self.retries = 0;
        self.send_only = false;
    }

    /// Advance the round trip by at most one transition.
    pub fn poll(&mut self, pdu: &mut PduLoop, slave: &mut Slave, now: u64) -> MbxPoll {
        if self.state != State::Idle && now.saturating_sub(self.started_at) > self.timeout_ns {
            self.state = State::Idle;

            return MbxPoll::Failed(Error::Mailbox(MailboxError::NoResponse));
        }

        match self.state {
            State::Idle => MbxPoll::Failed(Error::Internal),

            State::Sending => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => MbxPoll::Waiting,
                Poll::GaveUp => {
                    self.state = State::Idle;
                    slave.set_offline();

                    MbxPoll::Failed(Error::Slave(SlaveError::Offline))
                }
                Poll::Response(0) => {
                    // Receive mailbox still full; try again
                    pdu.queue(self.datagram);

                    MbxPoll::Waiting
                }
                Poll::Response(_) => {
                    if self.send_only {
                        self.state = State::Idle;

                        return MbxPoll::Mail(Vec::new());
                    }

                    self.queue_check(pdu, slave);

                    self.state = State::Checking;

                    MbxPoll::Waiting
                }
            },

            State::Checking => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => MbxPoll::Waiting,
                Poll::GaveUp | Poll::Response(0) => {
                    self.state = State::Idle;
                    slave.set_offline();

                    MbxPoll::Failed(Error::Slave(SlaveError::Offline))
                }
                Poll::Response(_) => {
                    let channel =
                        match SyncManagerChannel::unpack_from_slice(pdu.get(self.datagram).payload())
                        {
                            Ok(channel) => channel,
                            Err(e) => {
                                self.state = State::Idle;

                                return MbxPoll::Failed(e.into());
                            }
                        };

                    if !channel.status.mailbox_full {
                        // No mail yet, poll again
                        self.queue_check(pdu, slave);

                        return MbxPoll::Waiting;
                    }

                    let datagram = pdu.get_mut(self.datagram);

                    if let Err(e) = datagram.init_nprd(
                        slave.station_address,
                        slave.tx_mailbox.offset,
                        usize::from(slave.tx_mailbox.size),
                    ) {
                        self.state = State::Idle;

                        return MbxPoll::Failed(e);
                    }

                    pdu.queue(self.datagram);

                    self.state = State::Fetching;

                    MbxPoll::Waiting
                }
            },

            State::Fetching => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => MbxPoll::Waiting,
                Poll::GaveUp | Poll::Response(0) => {
                    self.state = State::Idle;
                    slave.set_offline();

                    MbxPoll::Failed(Error::Slave(SlaveError::Offline))
                }
                Poll::Response(_) => {
                    self.state = State::Idle;

                    MbxPoll::Mail(pdu.get(self.datagram).payload().to_vec())
                }
            },
        }
    }

    fn queue_check(&mut self, pdu: &mut PduLoop, slave: &Slave) {
        let datagram = pdu.get_mut(self.datagram);

        if datagram
            .init_nprd(slave.station_address, RegisterAddress::sync_manager(1), 8)
            .is_ok()
        {
            pdu.queue(self.datagram);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::DatagramState;
    use crate::mailbox::MailboxRegion;

    fn mailbox_slave() -> Slave {
        let mut slave = Slave::new(0);

        slave.mailbox_protocols = crate::sii::categories::MailboxProtocols::COE;
        slave.rx_mailbox = MailboxRegion {
            offset: 0x1000,
            size: 48,
        };
        slave.tx_mailbox = MailboxRegion {
            offset: 0x1080,
            size: 48,
        };

        slave
    }

    fn respond(pdu: &mut PduLoop, id: DatagramId, payload: &[u8], wkc: u16) {
        let datagram = pdu.get_mut(id);

        datagram.payload_mut()[0..payload.len()].copy_from_slice(payload);
        datagram.working_counter = wkc;
        datagram.state = DatagramState::Received;
    }

    #[test]
    fn full_round_trip() {
        let mut pdu = PduLoop::new();
        let mut io = MailboxIo::new(&mut pdu, "test");
        let mut slave = mailbox_slave();

        io.start(&mut pdu, &mut slave, MailboxType::Coe, &[0xaa; 10], 1_000_000, 0)
            .unwrap();

        // Send datagram covers the whole receive mailbox
        assert_eq!(pdu.get(io.datagram).len(), 48);

        // Send accepted
        respond(&mut pdu, io.datagram, &[0; 48], 1);
        assert!(matches!(io.poll(&mut pdu, &mut slave, 100), MbxPoll::Waiting));

        // First check: no mail yet
        respond(&mut pdu, io.datagram, &[0; 8], 1);
        assert!(matches!(io.poll(&mut pdu, &mut slave, 200), MbxPoll::Waiting));

        // Second check: mailbox full bit set in the SM1 status byte
        let mut check = [0u8; 8];
        check[5] = 0x08;
        respond(&mut pdu, io.datagram, &check, 1);
        assert!(matches!(io.poll(&mut pdu, &mut slave, 300), MbxPoll::Waiting));

        // Fetch returns the send mailbox region
        let mut mail = [0u8; 48];
        mail[0] = 0x04; // Length 4
        mail[5] = 0x03; // CoE
        respond(&mut pdu, io.datagram, &mail, 1);

        match io.poll(&mut pdu, &mut slave, 400) {
            MbxPoll::Mail(region) => assert_eq!(region.len(), 48),
            other => panic!("expected mail, got {:?}", other),
        }

        assert!(!io.is_busy());
    }

    #[test]
    fn send_retries_while_mailbox_full() {
        let mut pdu = PduLoop::new();
        let mut io = MailboxIo::new(&mut pdu, "test");
        let mut slave = mailbox_slave();

        io.start(&mut pdu, &mut slave, MailboxType::Coe, &[0; 10], 1_000_000, 0)
            .unwrap();

        // Working counter 0: mailbox not emptied yet
        respond(&mut pdu, io.datagram, &[0; 48], 0);
        assert!(matches!(io.poll(&mut pdu, &mut slave, 100), MbxPoll::Waiting));

        // Datagram was re-queued for another attempt
        assert_eq!(pdu.get(io.datagram).state(), DatagramState::Queued);
    }

    #[test]
    fn round_trip_timeout() {
        let mut pdu = PduLoop::new();
        let mut io = MailboxIo::new(&mut pdu, "test");
        let mut slave = mailbox_slave();

        io.start(&mut pdu, &mut slave, MailboxType::Coe, &[0; 10], 1_000_000, 0)
            .unwrap();

        assert!(matches!(
            io.poll(&mut pdu, &mut slave, 2_000_000),
            MbxPoll::Failed(Error::Mailbox(MailboxError::NoResponse))
        ));
    }

    #[test]
    fn no_mailbox_is_rejected() {
        let mut pdu = PduLoop::new();
        let mut io = MailboxIo::new(&mut pdu, "test");
        let mut slave = Slave::new(0);

        assert_eq!(
            io.start(&mut pdu, &mut slave, MailboxType::Coe, &[0; 4], 1_000_000, 0),
            Err(Error::Mailbox(MailboxError::NotSupported))
        );
    }
}
