//! Slave Information Interface (SII): the slave's on-board EEPROM.
//!
//! The SII is addressed in 16 bit words through the register interface at `0x0502`–`0x050B`. The
//! master reads the whole image once during bus scanning ([`crate::fsm::scan`]) and parses the
//! fixed header fields plus the category chain ([`categories`]) from the local copy.

pub mod categories;

use crate::error::SiiError;
use crc::{Algorithm, Crc};
use ethercrab_wire::EtherCrabWireWriteSized;

/// Fixed SII word addresses, ETG1000.6 Table 16.
pub mod word {
    /// PDI control word; start of the checksummed header.
    pub const PDI_CONTROL: u16 = 0x0000;
    /// Configured station alias.
    pub const ALIAS: u16 = 0x0004;
    /// Checksum of words 0..=6 in the low byte.
    pub const CHECKSUM: u16 = 0x0007;
    /// Vendor id, 2 words.
    pub const VENDOR_ID: u16 = 0x0008;
    /// Product code, 2 words.
    pub const PRODUCT_CODE: u16 = 0x000A;
    /// Revision number, 2 words.
    pub const REVISION: u16 = 0x000C;
    /// Serial number, 2 words.
    pub const SERIAL: u16 = 0x000E;
    /// Standard receive mailbox offset, then size, send offset, send size.
    pub const STD_MAILBOX: u16 = 0x0018;
    /// Supported mailbox protocols bitset.
    pub const MAILBOX_PROTOCOLS: u16 = 0x001C;
    /// First category header.
    pub const FIRST_CATEGORY: u16 = 0x0040;
}

/// The SII checksum algorithm: CRC-8 with polynomial `x^8 + x^2 + x + 1`, initial value `0xFF`,
/// computed over the 14 bytes of words 0..=6.
const SII_CRC: Crc<u8> = Crc::<u8>::new(&Algorithm {
    width: 8,
    poly: 0x07,
    init: 0xff,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xfb,
    residue: 0x00,
});

/// Compute the checksum over the first 14 bytes of an SII image.
pub fn checksum(header_bytes: &[u8]) -> u8 {
    SII_CRC.checksum(&header_bytes[0..14])
}

/// SII control/status register `0x0502`, ETG1000.4 6.4.3.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
#[wire(bytes = 2)]
pub struct SiiControl {
    /// EtherCAT side write access is enabled.
    #[wire(bits = 1, post_skip = 4)]
    pub write_access: bool,
    /// EEPROM is emulated by the PDI application.
    #[wire(bits = 1)]
    pub emulation: bool,
    /// Reads return 8 bytes per operation instead of 4.
    #[wire(bits = 1)]
    pub read_size_8: bool,
    /// Two address octets are supported.
    #[wire(bits = 1)]
    pub two_byte_address: bool,

    /// Read operation trigger/busy.
    #[wire(bits = 1)]
    pub read: bool,
    /// Write operation trigger/busy.
    #[wire(bits = 1)]
    pub write: bool,
    /// Reload operation trigger/busy.
    #[wire(bits = 1)]
    pub reload: bool,
    /// The loaded image failed its checksum.
    #[wire(bits = 1)]
    pub checksum_error: bool,
    /// The device information section is invalid.
    #[wire(bits = 1)]
    pub device_info_error: bool,
    /// The last command could not be executed.
    #[wire(bits = 1)]
    pub command_error: bool,
    /// The last write failed.
    #[wire(bits = 1)]
    pub write_error: bool,
    /// An operation is in progress.
    #[wire(bits = 1)]
    pub busy: bool,
}

impl SiiControl {
    /// Whether any error bit is set.
    pub fn has_error(&self) -> bool {
        self.checksum_error || self.device_info_error || self.command_error || self.write_error
    }

    /// Whether an operation (or its trigger bit) is still pending.
    pub fn is_busy(&self) -> bool {
        self.busy || self.read || self.write || self.reload
    }

    /// Classify the error bits of a finished operation.
    pub fn error(&self) -> Option<SiiError> {
        if self.write_error {
            Some(SiiError::WriteRefused)
        } else if self.command_error {
            Some(SiiError::Nack)
        } else {
            None
        }
    }
}

/// An SII read request as written to register `0x0502`: control word plus word address.
pub fn read_request(word_address: u16) -> [u8; 6] {
    let mut buf = [0u8; 6];

    let control = SiiControl {
        read: true,
        ..SiiControl::default()
    };

    buf[0..2].copy_from_slice(&control.pack());
    buf[2..4].copy_from_slice(&word_address.to_le_bytes());

    buf
}

/// An SII write request: control word, word address, reserved word and the data word for
/// register `0x0508`.
pub fn write_request(word_address: u16, value: u16) -> [u8; 8] {
    let mut buf = [0u8; 8];

    let control = SiiControl {
        write_access: true,
        write: true,
        ..SiiControl::default()
    };

    buf[0..2].copy_from_slice(&control.pack());
    buf[2..4].copy_from_slice(&word_address.to_le_bytes());
    buf[6..8].copy_from_slice(&value.to_le_bytes());

    buf
}

/// A local copy of a slave's SII contents, stored as the raw little endian byte image.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SiiImage {
    data: Vec<u8>,
}

impl SiiImage {
    /// An empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an image from raw bytes. The length is rounded down to a whole word.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        let mut data = data.into();

        data.truncate(data.len() & !1);

        Self { data }
    }

    /// Image length in words.
    pub fn len_words(&self) -> u16 {
        (self.data.len() / 2) as u16
    }

    /// Whether nothing has been read into this image yet.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw byte view.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Read one word.
    pub fn word(&self, address: u16) -> Option<u16> {
        let offset = usize::from(address) * 2;

        self.data
            .get(offset..offset + 2)
            .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a 32 bit value from two consecutive words.
    pub fn dword(&self, address: u16) -> Option<u32> {
        let low = self.word(address)?;
        let high = self.word(address + 1)?;

        Some(u32::from(high) << 16 | u32::from(low))
    }

    /// Overwrite one word, growing the image with zeroes if needed.
    pub fn set_word(&mut self, address: u16, value: u16) {
        let offset = usize::from(address) * 2;

        if self.data.len() < offset + 2 {
            self.data.resize(offset + 2, 0);
        }

        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Append two words read from the SII data register.
    pub fn push_dword(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Whether the stored checksum in word 7 matches the header contents.
    pub fn checksum_valid(&self) -> bool {
        if self.data.len() < 16 {
            return false;
        }

        let stored = self
            .word(word::CHECKSUM)
            .map(|word| (word & 0x00ff) as u8);

        stored == Some(checksum(&self.data))
    }

    /// Recompute the checksum over the current header and store it into word 7.
    pub fn update_checksum(&mut self) {
        debug_assert!(self.data.len() >= 16);

        let crc = checksum(&self.data);
        let high = self.word(word::CHECKSUM).unwrap_or(0) & 0xff00;

        self.set_word(word::CHECKSUM, high | u16::from(crc));
    }
}
