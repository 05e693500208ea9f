//! Mailbox framing on top of sync managers 0/1.

use crate::error::{Error, MailboxError};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};

/// Length of the mailbox header preceding every mailbox payload.
pub const MAILBOX_HEADER_LEN: usize = 6;

/// Minimum usable mailbox size: header plus nothing.
pub const MIN_MAILBOX_SIZE: u16 = MAILBOX_HEADER_LEN as u16;

/// Mailbox message priority.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum Priority {
    /// Lowest.
    #[default]
    Lowest = 0x00,
    /// Low.
    Low = 0x01,
    /// High.
    High = 0x02,
    /// Highest.
    Highest = 0x03,
}

/// Mailbox sub-protocol type, ETG1000.6 Table 29.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum MailboxType {
    /// Error reply.
    Err = 0x00,
    /// ADS over EtherCAT.
    Aoe = 0x01,
    /// Ethernet over EtherCAT.
    Eoe = 0x02,
    /// CANopen over EtherCAT.
    Coe = 0x03,
    /// File access over EtherCAT.
    Foe = 0x04,
    /// Servo profile over EtherCAT.
    Soe = 0x05,
    /// Vendor specific.
    VendorSpecific = 0x0f,
    /// Reserved type.
    #[wire(catch_all)]
    Other(u8),
}

impl MailboxType {
    pub(crate) fn raw(self) -> u8 {
        match self {
            Self::Err => 0x00,
            Self::Aoe => 0x01,
            Self::Eoe => 0x02,
            Self::Coe => 0x03,
            Self::Foe => 0x04,
            Self::Soe => 0x05,
            Self::VendorSpecific => 0x0f,
            Self::Other(raw) => raw,
        }
    }
}

/// Mailbox header, ETG1000.6 `MbxHeader`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 6)]
pub struct MailboxHeader {
    /// Payload length following this header.
    #[wire(bytes = 2)]
    pub length: u16,
    /// Station address of the message originator.
    #[wire(bytes = 2)]
    pub address: u16,
    /// Priority.
    #[wire(pre_skip = 6, bits = 2)]
    pub priority: Priority,
    /// Sub-protocol carried in the payload.
    #[wire(bits = 4)]
    pub mailbox_type: MailboxType,
    /// Sequence counter, 1..=7, wrapping back to 1. Zero means counting is unsupported.
    #[wire(bits = 3, post_skip = 1)]
    pub counter: u8,
}

/// The physical location of one mailbox inside a slave.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MailboxRegion {
    /// Physical start address.
    pub offset: u16,
    /// Region size in bytes, including the mailbox header.
    pub size: u16,
}

impl MailboxRegion {
    /// Whether this mailbox exists and can hold at least a header.
    pub fn is_usable(&self) -> bool {
        self.offset != 0 && self.size >= MIN_MAILBOX_SIZE
    }

    /// Payload capacity in bytes.
    pub fn payload_capacity(&self) -> u16 {
        self.size.saturating_sub(MAILBOX_HEADER_LEN as u16)
    }
}

/// Advance a mailbox sequence counter, wrapping 7 back around to 1.
pub(crate) fn next_counter(counter: &mut u8) -> u8 {
    *counter = if *counter >= 7 { 1 } else { *counter + 1 };

    *counter
}

/// Frame a mailbox message into a full receive-mailbox region.
///
/// The datagram written to the slave must cover the whole sync manager window, so `region` is
/// expected to be `rx_mailbox.size` bytes long; everything after the payload is zeroed.
pub(crate) fn frame(
    region: &mut [u8],
    mailbox_type: MailboxType,
    counter: u8,
    payload: &[u8],
) -> Result<(), Error> {
    let required = MAILBOX_HEADER_LEN + payload.len();

    if region.len() < required {
        return Err(Error::Mailbox(MailboxError::TooSmall {
            mailbox: region.len() as u16,
            required: required as u16,
        }));
    }

    MailboxHeader {
        length: payload.len() as u16,
        address: 0x0000,
        priority: Priority::Lowest,
        mailbox_type,
        counter,
    }
    .pack_to_slice_unchecked(&mut region[0..MAILBOX_HEADER_LEN]);

    region[MAILBOX_HEADER_LEN..required].copy_from_slice(payload);
    region[required..].fill(0);

    Ok(())
}

/// Parse a fetched send-mailbox region, checking the protocol type.
///
/// Returns the header and the `length` bytes of payload following it.
pub(crate) fn parse(
    region: &[u8],
    expected: MailboxType,
) -> Result<(MailboxHeader, &[u8]), Error> {
    let header = MailboxHeader::unpack_from_slice(region)
        .map_err(|_| Error::Mailbox(MailboxError::Corrupt))?;

    if header.mailbox_type != expected {
        return Err(Error::Mailbox(MailboxError::UnexpectedProtocol {
            expected: expected.raw(),
            received: header.mailbox_type.raw(),
        }));
    }

    let payload = region
        .get(MAILBOX_HEADER_LEN..MAILBOX_HEADER_LEN + usize::from(header.length))
        .ok_or(Error::Mailbox(MailboxError::Corrupt))?;

    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWriteSized};

    #[test]
    fn header_pack() {
        let packed = MailboxHeader {
            length: 10,
            address: 0x0000,
            priority: Priority::Lowest,
            mailbox_type: MailboxType::Coe,
            counter: 3,
        }
        .pack();

        assert_eq!(packed, [0x0a, 0x00, 0x00, 0x00, 0x00, 0x33]);
    }

    #[test]
    fn header_unpack() {
        let parsed = MailboxHeader::unpack_from_slice(&[0x0a, 0x00, 0x00, 0x00, 0x00, 0x23]).unwrap();

        assert_eq!(
            parsed,
            MailboxHeader {
                length: 10,
                address: 0x0000,
                priority: Priority::Lowest,
                mailbox_type: MailboxType::Coe,
                counter: 2,
            }
        );
    }

    #[test]
    fn counter_wraps_to_one() {
        let mut counter = 5;

        assert_eq!(next_counter(&mut counter), 6);
        assert_eq!(next_counter(&mut counter), 7);
        assert_eq!(next_counter(&mut counter), 1);
        assert_eq!(next_counter(&mut counter), 2);
    }

    #[test]
    fn frame_zero_pads() {
        let mut region = [0xaau8; 16];

        frame(&mut region, MailboxType::Foe, 1, &[1, 2, 3, 4]).unwrap();

        assert_eq!(
            region,
            [
                0x04, 0x00, // Length
                0x00, 0x00, // Address
                0x00, // Channel/priority
                0x14, // Type FoE, counter 1
                1, 2, 3, 4, // Payload
                0, 0, 0, 0, 0, 0, // Zeroed remainder
            ]
        );
    }

    #[test]
    fn frame_too_small() {
        let mut region = [0u8; 8];

        assert_eq!(
            frame(&mut region, MailboxType::Coe, 1, &[0; 4]),
            Err(Error::Mailbox(MailboxError::TooSmall {
                mailbox: 8,
                required: 10
            }))
        );
    }

    #[test]
    fn parse_type_mismatch() {
        let mut region = [0u8; 16];

        frame(&mut region, MailboxType::Coe, 1, &[0; 4]).unwrap();

        assert_eq!(
            parse(&region, MailboxType::Foe),
            Err(Error::Mailbox(MailboxError::UnexpectedProtocol {
                expected: 0x04,
                received: 0x03
            }))
        );
    }

    #[test]
    fn parse_extracts_payload() {
        let mut region = [0u8; 16];

        frame(&mut region, MailboxType::Coe, 2, &[0xde, 0xad]).unwrap();

        let (header, payload) = parse(&region, MailboxType::Coe).unwrap();

        assert_eq!(header.length, 2);
        assert_eq!(header.counter, 2);
        assert_eq!(payload, &[0xde, 0xad]);
    }

    #[test]
    fn region_usability() {
        assert!(!MailboxRegion::default().is_usable());
        assert!(
            MailboxRegion {
                offset: 0x1000,
                size: 128
            }
            .is_usable()
        );
        assert_eq!(
            MailboxRegion {
                offset: 0x1000,
                size: 128
            }
            .payload_capacity(),
            122
        );
    }
}
