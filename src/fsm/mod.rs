//! The cooperative finite state machines driving bus discovery, configuration and mailbox
//! traffic.
//!
//! Every FSM here is a step function: one `exec` call inspects the response of the datagram it
//! issued on a previous tick, advances by at most one transition and possibly queues the next
//! datagram. Nothing blocks; multi-millisecond operations simply span many ticks.

pub(crate) mod change;
pub(crate) mod coe;
pub(crate) mod mailbox;
pub(crate) mod config;
pub(crate) mod foe;
pub(crate) mod master;
pub(crate) mod scan;
pub(crate) mod sii;

use crate::datagram::{DatagramId, DatagramState};
use crate::error::Error;
use crate::pdu_loop::PduLoop;

/// Outcome of one FSM step.
#[derive(Debug)]
pub(crate) enum FsmResult {
    /// The FSM made progress (or is waiting for a response) and wants to be called again.
    Pending,
    /// The operation finished successfully.
    Done,
    /// The operation failed.
    Failed(Error),
}

impl FsmResult {
    /// Whether this step ended the operation, successfully or not.
    pub fn is_finished(&self) -> bool {
        !matches!(self, FsmResult::Pending)
    }
}

/// Number of datagram round trips a sub-FSM retries before giving up on a transient timeout.
pub(crate) const DATAGRAM_RETRIES: u8 = 3;

/// What became of the last issued datagram, folded over the retry counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Poll {
    /// Still waiting for the response.
    Waiting,
    /// A response arrived; its working counter is attached.
    Response(u16),
    /// The datagram timed out more often than the retry budget allows.
    GaveUp,
}

/// Check a previously queued datagram, re-queueing it on timeout until the retry budget is
/// exhausted.
pub(crate) fn poll_datagram(
    pdu: &mut PduLoop,
    id: DatagramId,
    retries: &mut u8,
) -> Poll {
    match pdu.get(id).state() {
        DatagramState::Queued | DatagramState::Sent => Poll::Waiting,
        DatagramState::Received => {
            *retries = 0;

            Poll::Response(pdu.get(id).working_counter())
        }
        DatagramState::TimedOut | DatagramState::Error | DatagramState::Init => {
            if *retries >= DATAGRAM_RETRIES {
                *retries = 0;

                return Poll::GaveUp;
            }

            *retries += 1;

            log::trace!(
                "Retrying {} ({}/{})",
                pdu.get(id).name,
                retries,
                DATAGRAM_RETRIES
            );

            pdu.queue(id);

            Poll::Waiting
        }
    }
}
