use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite};

/// AL (Application Layer) status code.
///
/// Read from register `0x0134` after a slave refuses a state transition. The raw code is carried
/// verbatim; [`message`](AlStatusCode::message) maps the codes of ETG1000.6 Table 11 to their
/// human readable descriptions for log output.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AlStatusCode(pub u16);

impl AlStatusCode {
    /// No error.
    pub const NO_ERROR: Self = Self(0x0000);
    /// Unspecified error.
    pub const UNSPECIFIED: Self = Self(0x0001);
    /// Invalid requested state change.
    pub const INVALID_STATE_CHANGE: Self = Self(0x0011);
    /// Unknown requested state.
    pub const UNKNOWN_REQUESTED_STATE: Self = Self(0x0012);
    /// Invalid mailbox configuration.
    pub const INVALID_MAILBOX_CONFIG: Self = Self(0x0016);
    /// Invalid sync manager configuration.
    pub const INVALID_SM_CONFIG: Self = Self(0x0017);

    /// The ETG1000.6 Table 11 description of this code.
    pub fn message(self) -> &'static str {
        match self.0 {
            0x0000 => "No error",
            0x0001 => "Unspecified error",
            0x0002 => "No memory",
            0x0003 => "Invalid device setup",
            0x0011 => "Invalid requested state change",
            0x0012 => "Unknown requested state",
            0x0013 => "Bootstrap not supported",
            0x0014 => "No valid firmware",
            0x0015 | 0x0016 => "Invalid mailbox configuration",
            0x0017 => "Invalid sync manager configuration",
            0x0018 => "No valid inputs available",
            0x0019 => "No valid outputs",
            0x001A => "Synchronization error",
            0x001B => "Sync manager watchdog",
            0x001C => "Invalid sync manager types",
            0x001D => "Invalid output configuration",
            0x001E => "Invalid input configuration",
            0x001F => "Invalid watchdog configuration",
            0x0020 => "Slave needs cold start",
            0x0021 => "Slave needs INIT",
            0x0022 => "Slave needs PREOP",
            0x0023 => "Slave needs SAFEOP",
            0x0024 => "Invalid input mapping",
            0x0025 => "Invalid output mapping",
            0x0026 => "Inconsistent settings",
            0x0027 => "Freerun not supported",
            0x0028 => "Syncmode not supported",
            0x0029 => "Freerun needs 3 buffer mode",
            0x002A => "Background watchdog",
            0x002B => "No valid inputs and outputs",
            0x002C => "Fatal sync error",
            0x002D => "No sync error",
            0x0030 => "Invalid DC SYNC configuration",
            0x0031 => "Invalid DC latch configuration",
            0x0032 => "PLL error",
            0x0033 => "DC sync IO error",
            0x0034 => "DC sync timeout error",
            0x0035 => "DC invalid sync cycle time",
            0x0036 => "DC Sync0 cycle time",
            0x0037 => "DC Sync1 cycle time",
            0x0041 => "Mailbox AoE",
            0x0042 => "Mailbox EoE",
            0x0043 => "Mailbox CoE",
            0x0044 => "Mailbox FoE",
            0x0045 => "Mailbox SoE",
            0x004F => "Mailbox VoE",
            0x0050 => "EEPROM no access",
            0x0051 => "EEPROM error",
            0x0060 => "Slave restarted locally",
            0x0061 => "Device identification value updated",
            0x00F0 => "Application controller available",
            0x8000..=0xFFFF => "(vendor specific)",
            _ => "(reserved)",
        }
    }
}

impl From<u16> for AlStatusCode {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl EtherCrabWireSized for AlStatusCode {
    const PACKED_LEN: usize = 2;

    type Buffer = [u8; 2];

    fn buffer() -> Self::Buffer {
        [0u8; 2]
    }
}

impl EtherCrabWireRead for AlStatusCode {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, ethercrab_wire::WireError> {
        u16::unpack_from_slice(buf).map(Self)
    }
}

impl EtherCrabWireWrite for AlStatusCode {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        self.0.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl core::fmt::Display for AlStatusCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#06x}: {}", self.0, self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode() {
        assert_eq!(
            AlStatusCode::unpack_from_slice(&[0x11, 0x00]),
            Ok(AlStatusCode::INVALID_STATE_CHANGE)
        );
    }

    #[test]
    fn display() {
        assert_eq!(
            AlStatusCode(0x001B).to_string(),
            "0x001b: Sync manager watchdog"
        );
        assert_eq!(AlStatusCode(0x9000).to_string(), "0x9000: (vendor specific)");
    }
}
