//! Fieldbus Memory Management Unit (FMMU) entity.

use core::fmt;

/// One FMMU mapping entry as written to registers `0x0600`–`0x06FF`.
///
/// Maps a logical address slice (as addressed by `LRW` datagrams) onto a physical address and bit
/// range inside one slave. ETG1000.4 Table 56.
#[derive(Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 16)]
pub struct Fmmu {
    /// Start address in octets in the logical memory area.
    #[wire(bytes = 4)]
    pub logical_start: u32,

    /// Mapping length in octets.
    ///
    /// For a purely bit-wise mapping inside one byte this is 1.
    #[wire(bytes = 2)]
    pub length: u16,

    /// First mapped bit inside the first logical octet.
    #[wire(bits = 3, post_skip = 5)]
    pub logical_start_bit: u8,

    /// Last mapped bit inside the last logical octet.
    #[wire(bits = 3, post_skip = 5)]
    pub logical_end_bit: u8,

    /// Physical start address inside the slave memory.
    #[wire(bytes = 2)]
    pub physical_start: u16,

    /// First mapped bit inside the first physical octet.
    #[wire(bits = 3, post_skip = 5)]
    pub physical_start_bit: u8,

    /// Mapping is used for reads.
    #[wire(bits = 1)]
    pub read_enable: bool,

    /// Mapping is used for writes.
    #[wire(bits = 1, post_skip = 6)]
    pub write_enable: bool,

    /// Entity is active.
    #[wire(bits = 1, post_skip = 31)]
    pub enable: bool,
}

impl fmt::Debug for Fmmu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fmmu")
            .field("logical_start", &format_args!("{:#010x}", self.logical_start))
            .field("length", &self.length)
            .field("logical_start_bit", &self.logical_start_bit)
            .field("logical_end_bit", &self.logical_end_bit)
            .field(
                "physical_start",
                &format_args!("{:#06x}", self.physical_start),
            )
            .field("physical_start_bit", &self.physical_start_bit)
            .field("read_enable", &self.read_enable)
            .field("write_enable", &self.write_enable)
            .field("enable", &self.enable)
            .finish()
    }
}

impl fmt::Display for Fmmu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "log {:#010x}.{}-{}, {} bytes, phys {:#06x}.{}, {}{}, {}",
            self.logical_start,
            self.logical_start_bit,
            self.logical_end_bit,
            self.length,
            self.physical_start,
            self.physical_start_bit,
            if self.read_enable { "R" } else { "-" },
            if self.write_enable { "W" } else { "-" },
            if self.enable { "enabled" } else { "disabled" },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWriteSized};

    #[test]
    fn size() {
        assert_eq!(Fmmu::PACKED_LEN, 16);
    }

    #[test]
    fn default_is_zero() {
        assert_eq!(Fmmu::default().pack(), [0u8; 16]);
    }

    #[test]
    fn pack_output_mapping() {
        // 4 byte output image at logical 0x0000_0010 -> physical 0x0f00
        let fmmu = Fmmu {
            logical_start: 0x10,
            length: 4,
            logical_start_bit: 0,
            logical_end_bit: 7,
            physical_start: 0x0f00,
            physical_start_bit: 0,
            read_enable: false,
            write_enable: true,
            enable: true,
        };

        assert_eq!(
            fmmu.pack(),
            [
                0x10, 0x00, 0x00, 0x00, // Logical start
                0x04, 0x00, // Length
                0x00, // Logical start bit
                0x07, // Logical end bit
                0x00, 0x0f, // Physical start
                0x00, // Physical start bit
                0x02, // Write enable
                0x01, // Enable
                0x00, 0x00, 0x00, // Reserved
            ]
        );
    }

    #[test]
    fn roundtrip_bitwise_mapping() {
        // Single status bit mapped read-only
        let fmmu = Fmmu {
            logical_start: 0x0000_0100,
            length: 1,
            logical_start_bit: 3,
            logical_end_bit: 3,
            physical_start: 0x1000,
            physical_start_bit: 0,
            read_enable: true,
            write_enable: false,
            enable: true,
        };

        let packed = fmmu.pack();

        assert_eq!(Fmmu::unpack_from_slice(&packed), Ok(fmmu));
    }
}
