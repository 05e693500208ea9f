//! SII (EEPROM) access sub-FSM: one word-addressed read or write through registers
//! `0x0502`–`0x050B`.

use super::{FsmResult, Poll, poll_datagram};
use crate::datagram::DatagramId;
use crate::error::{Error, SiiError, SlaveError};
use crate::pdu_loop::PduLoop;
use crate::register::RegisterAddress;
use crate::sii::{self, SiiControl};
use ethercrab_wire::EtherCrabWireRead;

/// How long the busy bit may stay set before the operation is abandoned.
const SII_TIMEOUT_NS: u64 = 100_000_000;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum State {
    #[default]
    Idle,
    /// The request write is on the wire.
    Request,
    /// Polling the interface until the busy bit clears.
    Poll,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Op {
    Read,
    Write(u16),
}

/// Reads one 32 bit chunk (two words) from, or writes one word to, a slave's SII.
///
/// Addressing always uses the configured station address; the scan FSM assigns station
/// addresses before any SII traffic happens.
#[derive(Debug)]
pub(crate) struct SiiFsm {
    datagram: DatagramId,
    state: State,
    op: Op,
    station_address: u16,
    word_address: u16,
    started_at: u64,
    retries: u8,
    /// The two words returned by the last completed read.
    result: u32,
}

impl SiiFsm {
    pub fn new(pdu: &mut PduLoop) -> Self {
        Self {
            datagram: pdu.alloc("sii"),
            state: State::Idle,
            op: Op::Read,
            station_address: 0,
            word_address: 0,
            started_at: 0,
            retries: 0,
            result: 0,
        }
    }

    /// Begin reading two words at `word_address`.
    pub fn start_read(
        &mut self,
        pdu: &mut PduLoop,
        station_address: u16,
        word_address: u16,
        now: u64,
    ) -> Result<(), Error> {
        debug_assert!(self.state == State::Idle);

        self.op = Op::Read;
        self.station_address = station_address;
        self.word_address = word_address;
        self.started_at = now;
        self.retries = 0;

        let datagram = pdu.get_mut(self.datagram);

        datagram.init_npwr(station_address, RegisterAddress::SiiControl.into(), 6)?;
        datagram
            .payload_mut()
            .copy_from_slice(&sii::read_request(word_address));

        pdu.queue(self.datagram);

        self.state = State::Request;

        Ok(())
    }

    /// Begin writing one word at `word_address`.
    pub fn start_write(
        &mut self,
        pdu: &mut PduLoop,
        station_address: u16,
        word_address: u16,
        value: u16,
        now: u64,
    ) -> Result<(), Error> {
        debug_assert!(self.state == State::Idle);

        self.op = Op::Write(value);
        self.station_address = station_address;
        self.word_address = word_address;
        self.started_at = now;
        self.retries = 0;

        let datagram = pdu.get_mut(self.datagram);

        datagram.init_npwr(station_address, RegisterAddress::SiiControl.into(), 8)?;
        datagram
            .payload_mut()
            .copy_from_slice(&sii::write_request(word_address, value));

        pdu.queue(self.datagram);

        self.state = State::Request;

        Ok(())
    }

    /// The 32 bits (two consecutive words) returned by the last completed read.
    pub fn result(&self) -> u32 {
        self.result
    }

    fn fail(&mut self, error: Error) -> FsmResult {
        self.state = State::Idle;

        FsmResult::Failed(error)
    }

    /// Advance by at most one transition.
    pub fn exec(&mut self, pdu: &mut PduLoop, now: u64) -> FsmResult {
        match self.state {
            State::Idle => FsmResult::Done,

            State::Request => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => FsmResult::Pending,
                Poll::GaveUp => self.fail(Error::Slave(SlaveError::Offline)),
                Poll::Response(0) => self.fail(Error::Slave(SlaveError::Offline)),
                Poll::Response(_) => {
                    self.queue_status_poll(pdu);

                    self.state = State::Poll;

                    FsmResult::Pending
                }
            },

            State::Poll => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => FsmResult::Pending,
                Poll::GaveUp => self.fail(Error::Slave(SlaveError::Offline)),
                Poll::Response(0) => self.fail(Error::Slave(SlaveError::Offline)),
                Poll::Response(_) => {
                    let payload = pdu.get(self.datagram).payload();

                    let control = match SiiControl::unpack_from_slice(payload) {
                        Ok(control) => control,
                        Err(e) => return self.fail(e.into()),
                    };

                    if control.is_busy() {
                        if now.saturating_sub(self.started_at) > SII_TIMEOUT_NS {
                            return self.fail(Error::Sii(SiiError::Timeout));
                        }

                        self.queue_status_poll(pdu);

                        return FsmResult::Pending;
                    }

                    if let Some(error) = control.error() {
                        return self.fail(Error::Sii(error));
                    }

                    if matches!(self.op, Op::Read) {
                        let raw = &payload[6..10];

                        self.result = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                    }

                    self.state = State::Idle;

                    FsmResult::Done
                }
            },
        }
    }

    fn queue_status_poll(&mut self, pdu: &mut PduLoop) {
        let datagram = pdu.get_mut(self.datagram);

        // Control/status, address and data registers in one read
        if datagram
            .init_nprd(self.station_address, RegisterAddress::SiiControl.into(), 10)
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

    fn respond(pdu: &mut PduLoop, id: DatagramId, payload: &[u8], wkc: u16) {
        let datagram = pdu.get_mut(id);

        datagram.payload_mut()[0..payload.len()].copy_from_slice(payload);
        datagram.working_counter = wkc;
        datagram.state = DatagramState::Received;
    }

    #[test]
    fn read_round_trip() {
        let mut pdu = PduLoop::new();
        let mut fsm = SiiFsm::new(&mut pdu);

        fsm.start_read(&mut pdu, 0x0001, 0x0008, 0).unwrap();

        // Request datagram is in flight
        assert!(matches!(fsm.exec(&mut pdu, 1000), FsmResult::Pending));

        // Slave acknowledges the request write
        respond(&mut pdu, fsm.datagram, &[0; 6], 1);
        assert!(matches!(fsm.exec(&mut pdu, 2000), FsmResult::Pending));

        // First poll: still busy
        let mut busy = [0u8; 10];
        busy[1] = 0x81; // Busy + read pending
        respond(&mut pdu, fsm.datagram, &busy, 1);
        assert!(matches!(fsm.exec(&mut pdu, 3000), FsmResult::Pending));

        // Second poll: done, vendor id 0x00000002 in the data register
        let mut done = [0u8; 10];
        done[6..10].copy_from_slice(&0x0000_0002u32.to_le_bytes());
        respond(&mut pdu, fsm.datagram, &done, 1);

        assert!(matches!(fsm.exec(&mut pdu, 4000), FsmResult::Done));
        assert_eq!(fsm.result(), 0x0000_0002);
    }

    #[test]
    fn busy_past_deadline_times_out() {
        let mut pdu = PduLoop::new();
        let mut fsm = SiiFsm::new(&mut pdu);

        fsm.start_read(&mut pdu, 0x0001, 0x0000, 0).unwrap();

        respond(&mut pdu, fsm.datagram, &[0; 6], 1);
        fsm.exec(&mut pdu, 1000);

        let mut busy = [0u8; 10];
        busy[1] = 0x80;
        respond(&mut pdu, fsm.datagram, &busy, 1);

        let result = fsm.exec(&mut pdu, SII_TIMEOUT_NS + 2000);

        assert!(matches!(
            result,
            FsmResult::Failed(Error::Sii(SiiError::Timeout))
        ));
    }

    #[test]
    fn write_refused_surfaces_error() {
        let mut pdu = PduLoop::new();
        let mut fsm = SiiFsm::new(&mut pdu);

        fsm.start_write(&mut pdu, 0x0001, 0x0004, 0x00ab, 0).unwrap();

        respond(&mut pdu, fsm.datagram, &[0; 8], 1);
        fsm.exec(&mut pdu, 1000);

        // Write error bit set, not busy
        let mut status = [0u8; 10];
        status[1] = 0x40;
        respond(&mut pdu, fsm.datagram, &status, 1);

        assert!(matches!(
            fsm.exec(&mut pdu, 2000),
            FsmResult::Failed(Error::Sii(SiiError::WriteRefused))
        ));
    }
}
