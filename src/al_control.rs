use crate::slave_state::AlState;

/// The AL control/status word for an individual slave device.
///
/// Written to register `0x0120` to request a state, read back from `0x0130` to poll it. Defined
/// in ETG1000.6 Table 9 - AL Control Description.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct AlControl {
    /// AL state.
    #[wire(bits = 4)]
    pub state: AlState,
    /// Error flag.
    ///
    /// Set by the slave in AL status when a transition was refused; set by the master in AL
    /// control to acknowledge that refusal.
    #[wire(bits = 1)]
    pub error: bool,
    /// ID request flag.
    #[wire(bits = 1, post_skip = 10)]
    pub id_request: bool,
}

impl AlControl {
    /// A request for the given state with no flags set.
    pub fn new(state: AlState) -> Self {
        Self {
            state,
            error: false,
            id_request: false,
        }
    }

    /// An error acknowledge request: the refused state with the error flag set.
    pub fn acknowledge(state: AlState) -> Self {
        Self {
            state,
            error: true,
            id_request: false,
        }
    }

    /// Reset all slaves to `INIT`, acknowledging any pending error.
    pub fn reset() -> Self {
        Self {
            state: AlState::Init,
            error: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWriteSized};

    #[test]
    fn pack() {
        let value = AlControl {
            state: AlState::SafeOp,
            error: true,
            id_request: false,
        };

        assert_eq!(value.pack(), [0x04 | 0x10, 0x00]);
    }

    #[test]
    fn unpack() {
        let parsed = AlControl::unpack_from_slice(&[0x04 | 0x10, 0x00]).unwrap();

        assert_eq!(
            parsed,
            AlControl {
                state: AlState::SafeOp,
                error: true,
                id_request: false,
            }
        );
    }

    #[test]
    fn unpack_short() {
        assert!(AlControl::unpack_from_slice(&[0x02]).is_err());
    }

    #[test]
    fn acknowledge_scenario() {
        // SAFEOP with error flag as reported by a slave that refused OP
        let status = AlControl::unpack_from_slice(&[0x14, 0x00]).unwrap();

        assert!(status.error);

        // The acknowledge write mirrors the refused state with the error bit set
        assert_eq!(AlControl::acknowledge(status.state).pack(), [0x14, 0x00]);
    }
}
