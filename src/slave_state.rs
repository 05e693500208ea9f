/// Application layer (AL) state of a single slave.
///
/// Read from register `0x0130`
/// ([`RegisterAddress::AlStatus`](crate::register::RegisterAddress::AlStatus)), requested via
/// register `0x0120`.
///
/// Defined in ETG1000.6 6.4.1, ETG1000.6 Table 9.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum AlState {
    /// No state has been read from the slave yet.
    #[default]
    Unknown = 0x00,
    /// EtherCAT `INIT` state.
    Init = 0x01,
    /// EtherCAT `PRE-OP` state.
    PreOp = 0x02,
    /// EtherCAT `BOOT` state.
    Boot = 0x03,
    /// EtherCAT `SAFE-OP` state.
    SafeOp = 0x04,
    /// EtherCAT `OP` state.
    Op = 0x08,
    /// A state outside of the ETG1000.6 set was read back.
    #[wire(catch_all)]
    Other(u8),
}

impl AlState {
    /// Whether this is one of the four well-defined application layer states.
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Init | Self::PreOp | Self::SafeOp | Self::Op)
            || matches!(self, Self::Boot)
    }

    /// The raw low-nibble wire representation of the state.
    pub(crate) fn raw(self) -> u8 {
        match self {
            Self::Unknown => 0x00,
            Self::Init => 0x01,
            Self::PreOp => 0x02,
            Self::Boot => 0x03,
            Self::SafeOp => 0x04,
            Self::Op => 0x08,
            Self::Other(raw) => raw,
        }
    }
}

impl core::fmt::Display for AlState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AlState::Unknown => f.write_str("Unknown"),
            AlState::Init => f.write_str("Init"),
            AlState::PreOp => f.write_str("Pre-Operational"),
            AlState::Boot => f.write_str("Bootstrap"),
            AlState::SafeOp => f.write_str("Safe-Operational"),
            AlState::Op => f.write_str("Operational"),
            AlState::Other(value) => write!(f, "Other({:#04x})", value),
        }
    }
}

bitflags::bitflags! {
    /// A set of application layer states, as accumulated by the broadcast AL status probe.
    ///
    /// A `BRD` of register `0x0130` ORs together the status bytes of every responding slave, so
    /// the result is a bitset of all states present on the bus rather than a single state.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct AlStateSet: u8 {
        /// At least one slave is in `INIT`.
        const INIT = 0x01;
        /// At least one slave is in `PRE-OP`.
        const PRE_OP = 0x02;
        /// At least one slave is in `SAFE-OP`.
        const SAFE_OP = 0x04;
        /// At least one slave is in `OP`.
        const OP = 0x08;
    }
}

impl AlStateSet {
    /// Add a single slave's state to the set.
    pub(crate) fn insert_state(&mut self, state: AlState) {
        *self |= Self::from_bits_truncate(state.raw());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWriteSized};

    #[test]
    fn roundtrip_known_states() {
        for (raw, state) in [
            (0x01u8, AlState::Init),
            (0x02, AlState::PreOp),
            (0x03, AlState::Boot),
            (0x04, AlState::SafeOp),
            (0x08, AlState::Op),
        ] {
            assert_eq!(AlState::unpack_from_slice(&[raw]), Ok(state));
            assert_eq!(state.pack(), [raw]);
        }
    }

    #[test]
    fn catch_all() {
        // SAFEOP + error flag as sometimes seen when reading the whole status byte raw
        assert_eq!(AlState::unpack_from_slice(&[0x14]), Ok(AlState::Other(0x14)));
    }

    #[test]
    fn state_set() {
        let mut set = AlStateSet::default();

        set.insert_state(AlState::Init);
        set.insert_state(AlState::Op);

        assert_eq!(set, AlStateSet::INIT | AlStateSet::OP);
    }
}
