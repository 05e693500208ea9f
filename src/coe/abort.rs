//! SDO abort codes.

/// A 32 bit EtherCAT SDO abort code, carried verbatim.
///
/// [`message`](AbortCode::message) maps the well-known codes of ETG1000.6 Table 31 to readable
/// text for log output; unknown codes display as their raw value.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AbortCode(pub u32);

impl AbortCode {
    /// The description of this abort code.
    pub fn message(self) -> &'static str {
        match self.0 {
            0x0503_0000 => "Toggle bit not changed",
            0x0504_0000 => "SDO protocol timeout",
            0x0504_0001 => "Client/server command specifier not valid or unknown",
            0x0504_0005 => "Out of memory",
            0x0601_0000 => "Unsupported access to an object",
            0x0601_0001 => "Attempt to read a write-only object",
            0x0601_0002 => "Attempt to write a read-only object",
            0x0602_0000 => "This object does not exist in the object directory",
            0x0604_0041 => "The object cannot be mapped into the PDO",
            0x0604_0042 => "The number and length of the mapped objects would exceed the PDO length",
            0x0604_0043 => "General parameter incompatibility",
            0x0604_0047 => "General internal incompatibility in device",
            0x0606_0000 => "Access failure due to a hardware error",
            0x0607_0010 => "Data type does not match, length of service parameter does not match",
            0x0607_0012 => "Data type does not match, length of service parameter too high",
            0x0607_0013 => "Data type does not match, length of service parameter too low",
            0x0609_0011 => "Subindex does not exist",
            0x0609_0030 => "Value range of parameter exceeded",
            0x0609_0031 => "Value of parameter written too high",
            0x0609_0032 => "Value of parameter written too low",
            0x0609_0036 => "Maximum value is less than minimum value",
            0x0800_0000 => "General error",
            0x0800_0020 => "Data cannot be transferred or stored to the application",
            0x0800_0021 => {
                "Data cannot be transferred or stored to the application because of local control"
            }
            0x0800_0022 => {
                "Data cannot be transferred or stored to the application because of the present device state"
            }
            0x0800_0023 => {
                "Object dictionary dynamic generation fails or no object dictionary is present"
            }
            _ => "(unknown abort code)",
        }
    }
}

impl From<u32> for AbortCode {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl core::fmt::Display for AbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x}: {}", self.0, self.message())
    }
}
