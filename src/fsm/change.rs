//! AL state change sub-FSM: request a state via `0x0120`, poll `0x0130`, acknowledge refusals.

use super::{FsmResult, Poll, poll_datagram};
use crate::al_control::AlControl;
use crate::al_status_code::AlStatusCode;
use crate::datagram::DatagramId;
use crate::error::{Error, SlaveError};
use crate::pdu_loop::PduLoop;
use crate::register::RegisterAddress;
use crate::slave::Slave;
use crate::slave_state::AlState;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWriteSized};

/// Deadline for the slave to reach the requested state.
const STATE_CHANGE_TIMEOUT_NS: u64 = 10_000_000;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum State {
    #[default]
    Idle,
    /// The AL control write is on the wire.
    Request,
    /// Polling AL status until it matches or errors.
    Status,
    /// Reading the AL status code after a refusal.
    Code,
    /// The acknowledge write is on the wire.
    Ack,
    /// Polling AL status until the error bit clears.
    AckStatus,
}

/// Drives one slave through a single AL state transition.
#[derive(Debug)]
pub(crate) struct ChangeFsm {
    datagram: DatagramId,
    state: State,
    target: AlState,
    /// The state the slave reported alongside the error bit.
    refused_in: AlState,
    /// One clean retry is allowed after a successful acknowledge.
    retried_after_ack: bool,
    started_at: u64,
    retries: u8,
}

impl ChangeFsm {
    pub fn new(pdu: &mut PduLoop) -> Self {
        Self {
            datagram: pdu.alloc("al-change"),
            state: State::Idle,
            target: AlState::Init,
            refused_in: AlState::Unknown,
            retried_after_ack: false,
            started_at: 0,
            retries: 0,
        }
    }

    /// Request `target` from a slave.
    pub fn start(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        target: AlState,
        now: u64,
    ) -> Result<(), Error> {
        debug_assert!(self.state == State::Idle);

        log::debug!(
            "Slave {}: requesting state {}",
            slave.ring_position,
            target
        );

        slave.requested_state = target;

        self.target = target;
        self.retried_after_ack = false;
        self.started_at = now;
        self.retries = 0;

        self.queue_control(pdu, slave, AlControl::new(target))?;

        self.state = State::Request;

        Ok(())
    }

    /// Acknowledge a refused transition without requesting a new state.
    ///
    /// Used by the master FSM when a status poll finds the error bit set outside of a change
    /// operation.
    pub fn start_ack(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        now: u64,
    ) -> Result<(), Error> {
        debug_assert!(self.state == State::Idle);

        self.target = slave.current_state;
        self.refused_in = slave.current_state;
        // Suppress the retry path; an ack-only run ends after the error bit clears
        self.retried_after_ack = true;
        self.started_at = now;
        self.retries = 0;

        self.queue_control(pdu, slave, AlControl::acknowledge(slave.current_state))?;

        self.state = State::Ack;

        Ok(())
    }

    fn queue_control(
        &mut self,
        pdu: &mut PduLoop,
        slave: &Slave,
        control: AlControl,
    ) -> Result<(), Error> {
        let datagram = pdu.get_mut(self.datagram);

        datagram.init_npwr(
            slave.station_address,
            RegisterAddress::AlControl.into(),
            2,
        )?;
        datagram.payload_mut().copy_from_slice(&control.pack());

        pdu.queue(self.datagram);

        Ok(())
    }

    fn queue_status_read(&mut self, pdu: &mut PduLoop, slave: &Slave, register: RegisterAddress) {
        let datagram = pdu.get_mut(self.datagram);

        if datagram
            .init_nprd(slave.station_address, register.into(), 2)
            .is_ok()
        {
            pdu.queue(self.datagram);
        }
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

            State::Request => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => FsmResult::Pending,
                Poll::GaveUp | Poll::Response(0) => {
                    slave.set_offline();

                    self.fail(slave, Error::Slave(SlaveError::Offline))
                }
                Poll::Response(_) => {
                    self.queue_status_read(pdu, slave, RegisterAddress::AlStatus);

                    self.state = State::Status;

                    FsmResult::Pending
                }
            },

            State::Status => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => FsmResult::Pending,
                Poll::GaveUp | Poll::Response(0) => {
                    slave.set_offline();

                    self.fail(slave, Error::Slave(SlaveError::Offline))
                }
                Poll::Response(_) => {
                    let status =
                        match AlControl::unpack_from_slice(pdu.get(self.datagram).payload()) {
                            Ok(status) => status,
                            Err(e) => return self.fail(slave, e.into()),
                        };

                    if status.error {
                        self.refused_in = status.state;

                        log::warn!(
                            "Slave {}: refused {} in state {}",
                            slave.ring_position,
                            self.target,
                            status.state
                        );

                        self.queue_status_read(pdu, slave, RegisterAddress::AlStatusCode);

                        self.state = State::Code;

                        return FsmResult::Pending;
                    }

                    if status.state == self.target {
                        slave.current_state = self.target;
                        slave.error_ack_pending = false;
                        self.state = State::Idle;

                        log::debug!(
                            "Slave {}: now in {}",
                            slave.ring_position,
                            self.target
                        );

                        return FsmResult::Done;
                    }

                    if now.saturating_sub(self.started_at) > STATE_CHANGE_TIMEOUT_NS {
                        slave.current_state = status.state;

                        return self.fail(
                            slave,
                            Error::Slave(SlaveError::StateChangeTimeout {
                                requested: self.target,
                            }),
                        );
                    }

                    self.queue_status_read(pdu, slave, RegisterAddress::AlStatus);

                    FsmResult::Pending
                }
            },

            State::Code => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => FsmResult::Pending,
                Poll::GaveUp => self.fail(slave, Error::Slave(SlaveError::Offline)),
                Poll::Response(wkc) => {
                    let code = if wkc == 0 {
                        // Some slaves do not implement 0x0134
                        AlStatusCode::UNSPECIFIED
                    } else {
                        AlStatusCode::unpack_from_slice(pdu.get(self.datagram).payload())
                            .unwrap_or(AlStatusCode::UNSPECIFIED)
                    };

                    log::error!(
                        "Slave {}: AL status code {}",
                        slave.ring_position,
                        code
                    );

                    slave.last_al_status_code = Some(code);

                    // Mirror the refused state with the error flag to acknowledge
                    if let Err(e) =
                        self.queue_control(pdu, slave, AlControl::acknowledge(self.refused_in))
                    {
                        return self.fail(slave, e);
                    }

                    self.state = State::Ack;

                    FsmResult::Pending
                }
            },

            State::Ack => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => FsmResult::Pending,
                Poll::GaveUp | Poll::Response(0) => {
                    slave.set_offline();

                    self.fail(slave, Error::Slave(SlaveError::Offline))
                }
                Poll::Response(_) => {
                    self.queue_status_read(pdu, slave, RegisterAddress::AlStatus);

                    self.state = State::AckStatus;

                    FsmResult::Pending
                }
            },

            State::AckStatus => match poll_datagram(pdu, self.datagram, &mut self.retries) {
                Poll::Waiting => FsmResult::Pending,
                Poll::GaveUp | Poll::Response(0) => {
                    slave.set_offline();

                    self.fail(slave, Error::Slave(SlaveError::Offline))
                }
                Poll::Response(_) => {
                    let status =
                        match AlControl::unpack_from_slice(pdu.get(self.datagram).payload()) {
                            Ok(status) => status,
                            Err(e) => return self.fail(slave, e.into()),
                        };

                    if status.error {
                        if now.saturating_sub(self.started_at) > STATE_CHANGE_TIMEOUT_NS {
                            return self.fail(
                                slave,
                                Error::Slave(SlaveError::StateChangeTimeout {
                                    requested: self.target,
                                }),
                            );
                        }

                        self.queue_status_read(pdu, slave, RegisterAddress::AlStatus);

                        return FsmResult::Pending;
                    }

                    // Error bit cleared; the slave settled in its refused state
                    slave.current_state = status.state;
                    slave.error_ack_pending = false;

                    log::info!(
                        "Slave {}: acknowledged error, now in {}",
                        slave.ring_position,
                        status.state
                    );

                    if !self.retried_after_ack {
                        // One clean retry of the original request
                        self.retried_after_ack = true;
                        self.started_at = now;

                        if let Err(e) = self.queue_control(pdu, slave, AlControl::new(self.target))
                        {
                            return self.fail(slave, e);
                        }

                        self.state = State::Request;

                        return FsmResult::Pending;
                    }

                    self.state = State::Idle;

                    if slave.current_state == self.target {
                        FsmResult::Done
                    } else {
                        slave.error_flag = true;

                        FsmResult::Failed(Error::Slave(SlaveError::StateChangeRefused {
                            requested: self.target,
                            code: slave.last_al_status_code.unwrap_or_default(),
                        }))
                    }
                }
            },
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
    fn clean_transition() {
        let mut pdu = PduLoop::new();
        let mut fsm = ChangeFsm::new(&mut pdu);
        let mut slave = Slave::new(0);

        fsm.start(&mut pdu, &mut slave, AlState::PreOp, 0).unwrap();

        assert_eq!(slave.requested_state, AlState::PreOp);

        // Control write acknowledged
        respond(&mut pdu, fsm.datagram, &[0; 2], 1);
        assert!(matches!(fsm.exec(&mut pdu, &mut slave, 0), FsmResult::Pending));

        // Status reads PREOP
        respond(&mut pdu, fsm.datagram, &[0x02, 0x00], 1);
        assert!(matches!(fsm.exec(&mut pdu, &mut slave, 0), FsmResult::Done));
        assert_eq!(slave.current_state, AlState::PreOp);
    }

    #[test]
    fn refusal_ack_and_retry() {
        let mut pdu = PduLoop::new();
        let mut fsm = ChangeFsm::new(&mut pdu);
        let mut slave = Slave::new(0);

        slave.current_state = AlState::SafeOp;

        fsm.start(&mut pdu, &mut slave, AlState::Op, 0).unwrap();

        // Control write acknowledged
        respond(&mut pdu, fsm.datagram, &[0; 2], 1);
        fsm.exec(&mut pdu, &mut slave, 0);

        // Status reads SAFEOP + error: the transition was refused
        respond(&mut pdu, fsm.datagram, &[0x14, 0x00], 1);
        assert!(matches!(fsm.exec(&mut pdu, &mut slave, 0), FsmResult::Pending));

        // Status code read
        respond(&mut pdu, fsm.datagram, &0x001du16.to_le_bytes(), 1);
        assert!(matches!(fsm.exec(&mut pdu, &mut slave, 0), FsmResult::Pending));

        // Ack write acknowledged
        respond(&mut pdu, fsm.datagram, &[0; 2], 1);
        assert!(matches!(fsm.exec(&mut pdu, &mut slave, 0), FsmResult::Pending));

        // Status now reads SAFEOP cleanly; the FSM retries the OP request
        respond(&mut pdu, fsm.datagram, &[0x04, 0x00], 1);
        assert!(matches!(fsm.exec(&mut pdu, &mut slave, 0), FsmResult::Pending));

        // Retry round trip: control write, then status reads OP
        respond(&mut pdu, fsm.datagram, &[0; 2], 1);
        fsm.exec(&mut pdu, &mut slave, 0);
        respond(&mut pdu, fsm.datagram, &[0x08, 0x00], 1);

        assert!(matches!(fsm.exec(&mut pdu, &mut slave, 0), FsmResult::Done));
        assert_eq!(slave.current_state, AlState::Op);
        assert!(!slave.error_flag);
    }

    #[test]
    fn offline_slave_fails() {
        let mut pdu = PduLoop::new();
        let mut fsm = ChangeFsm::new(&mut pdu);
        let mut slave = Slave::new(0);

        fsm.start(&mut pdu, &mut slave, AlState::Init, 0).unwrap();

        // Nobody answers the control write
        respond(&mut pdu, fsm.datagram, &[0; 2], 0);

        assert!(matches!(
            fsm.exec(&mut pdu, &mut slave, 0),
            FsmResult::Failed(Error::Slave(SlaveError::Offline))
        ));
        assert!(!slave.online);
        assert!(slave.error_flag);
    }
}
