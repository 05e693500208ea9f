//! EtherCAT frame and datagram headers.

use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite};

/// Mask for the 11 bit length fields in frame and datagram headers.
pub(crate) const LEN_MASK: u16 = 0b0000_0111_1111_1111;

/// The EtherType of EtherCAT frames.
pub(crate) const ETHERCAT_ETHERTYPE: u16 = 0x88a4;

/// Source MAC address used for all transmitted frames.
///
/// The first slave sets the U/L bit of the source MAC when forwarding a frame, so received
/// frames originated by this master carry `0x12, 0x10, ...` instead and self-sent broadcasts can
/// be filtered out.
pub(crate) const MASTER_ADDR: [u8; 6] = [0x10, 0x10, 0x10, 0x10, 0x10, 0x10];

/// Destination MAC address used for all transmitted frames.
pub(crate) const BROADCAST_ADDR: [u8; 6] = [0xff; 6];

/// Length of the Ethernet II header.
pub(crate) const ETHERNET_HEADER_LEN: usize = 14;

/// Length of the EtherCAT frame header following the Ethernet II header.
pub(crate) const FRAME_HEADER_LEN: usize = 2;

/// Length of a datagram header: command, index, address, flags, IRQ.
pub(crate) const DATAGRAM_HEADER_LEN: usize = 10;

/// Length of the working counter trailing each datagram.
pub(crate) const DATAGRAM_FOOTER_LEN: usize = 2;

/// Minimum Ethernet payload; shorter EtherCAT frames are padded up to this.
pub(crate) const MIN_ETHERNET_PAYLOAD: usize = 46;

/// Overhead of one datagram in a frame.
pub(crate) const DATAGRAM_OVERHEAD: usize = DATAGRAM_HEADER_LEN + DATAGRAM_FOOTER_LEN;

/// EtherCAT frame protocol types, ETG1000.4 Table 12.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireRead)]
#[repr(u8)]
pub(crate) enum ProtocolType {
    /// EtherCAT commands (DL PDUs); the only type this master emits or accepts.
    DlPdu = 0x01u8,
}

/// The 2 byte EtherCAT frame header: payload length and protocol type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub payload_len: u16,
    pub protocol: ProtocolType,
}

impl EtherCrabWireSized for FrameHeader {
    const PACKED_LEN: usize = 2;

    type Buffer = [u8; 2];

    fn buffer() -> Self::Buffer {
        [0u8; 2]
    }
}

impl EtherCrabWireRead for FrameHeader {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, ethercrab_wire::WireError> {
        let raw = u16::unpack_from_slice(buf)?;

        Ok(Self {
            payload_len: raw & LEN_MASK,
            protocol: ProtocolType::try_from((raw >> 12) as u8)?,
        })
    }
}

impl EtherCrabWireWrite for FrameHeader {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let raw = (self.payload_len & LEN_MASK) | (self.protocol as u16) << 12;

        raw.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl FrameHeader {
    /// A command frame header for `len` bytes of datagrams.
    pub fn pdu(len: u16) -> Self {
        debug_assert!(
            len <= LEN_MASK,
            "frame length may not exceed {} bytes",
            LEN_MASK
        );

        Self {
            payload_len: len & LEN_MASK,
            protocol: ProtocolType::DlPdu,
        }
    }
}

/// The `LEN`/`C`/`NEXT` word following the address field of every datagram header.
///
/// ETG1000.4 Table 14.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct DatagramFlags {
    /// Payload length of this datagram.
    pub length: u16,
    /// Set by the bus when the frame has circulated once already.
    pub circulated: bool,
    /// Another datagram follows in the same frame.
    pub more_follows: bool,
}

impl DatagramFlags {
    pub const fn with_len(length: u16) -> Self {
        Self {
            length,
            circulated: false,
            more_follows: false,
        }
    }
}

impl EtherCrabWireSized for DatagramFlags {
    const PACKED_LEN: usize = 2;

    type Buffer = [u8; 2];

    fn buffer() -> Self::Buffer {
        [0u8; 2]
    }
}

impl EtherCrabWireRead for DatagramFlags {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, ethercrab_wire::WireError> {
        let raw = u16::unpack_from_slice(buf)?;

        Ok(Self {
            length: raw & LEN_MASK,
            circulated: (raw >> 14) & 0x01 == 0x01,
            more_follows: (raw >> 15) & 0x01 == 0x01,
        })
    }
}

impl EtherCrabWireWrite for DatagramFlags {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let raw = (self.length & LEN_MASK)
            | (self.circulated as u16) << 14
            | (self.more_follows as u16) << 15;

        raw.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

/// Write an Ethernet II header into the start of `buf`.
pub(crate) fn write_ethernet_header(buf: &mut [u8]) {
    buf[0..6].copy_from_slice(&BROADCAST_ADDR);
    buf[6..12].copy_from_slice(&MASTER_ADDR);
    buf[12..14].copy_from_slice(&ETHERCAT_ETHERTYPE.to_be_bytes());
}

/// Validate an incoming Ethernet frame, returning its EtherCAT payload.
///
/// Returns `None` for non-EtherCAT frames and for the master's own outgoing broadcasts arriving
/// on a looped-back interface.
pub(crate) fn ethercat_payload(frame: &[u8]) -> Option<&[u8]> {
    let (header, payload) = frame.split_at_checked(ETHERNET_HEADER_LEN)?;

    if header[12..14] != ETHERCAT_ETHERTYPE.to_be_bytes() {
        return None;
    }

    // Frames sent by this master have the locally administered bit of the source MAC clear; the
    // first slave sets it when processing the frame.
    if header[6..12] == MASTER_ADDR {
        return None;
    }

    Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbitrary::{Arbitrary, Unstructured};

    // Manual impl because `length` only has 11 valid bits
    impl<'a> Arbitrary<'a> for DatagramFlags {
        fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
            Ok(Self {
                length: u16::arbitrary(u)? & LEN_MASK,
                circulated: Arbitrary::arbitrary(u)?,
                more_follows: Arbitrary::arbitrary(u)?,
            })
        }
    }

    #[test]
    fn datagram_flags_fuzz() {
        heckcheck::check(|flags: DatagramFlags| {
            let mut buf = [0u8; 2];

            flags.pack_to_slice_unchecked(&mut buf);

            pretty_assertions::assert_eq!(DatagramFlags::unpack_from_slice(&buf), Ok(flags));

            Ok(())
        });
    }

    #[test]
    fn frame_header_pack() {
        let header = FrameHeader::pdu(0x28);

        let mut buf = [0u8; 2];

        let packed = header.pack_to_slice_unchecked(&mut buf);

        assert_eq!(packed, &0b0001_0000_0010_1000u16.to_le_bytes());
    }

    #[test]
    fn frame_header_decode() {
        let header = FrameHeader::unpack_from_slice(&[0x3c, 0x10]).unwrap();

        assert_eq!(header.payload_len, 0x3c);
        assert_eq!(header.protocol, ProtocolType::DlPdu);
    }

    #[test]
    fn frame_header_rejects_unknown_protocol() {
        // Type nibble 0x04 (network variables) is not supported
        assert!(FrameHeader::unpack_from_slice(&[0x3c, 0x40]).is_err());
    }

    #[test]
    fn datagram_flags_roundtrip() {
        let flags = DatagramFlags {
            length: 0x110,
            circulated: false,
            more_follows: true,
        };

        let mut buf = [0u8; 2];

        flags.pack_to_slice_unchecked(&mut buf);

        assert_eq!(buf, [0x10, 0x81]);
        assert_eq!(DatagramFlags::unpack_from_slice(&buf), Ok(flags));
    }

    #[test]
    fn payload_extraction() {
        let mut frame = vec![0u8; 60];

        // Destination, source, EtherType
        frame[0..6].copy_from_slice(&BROADCAST_ADDR);
        frame[6..12].copy_from_slice(&[0x12, 0x10, 0x10, 0x10, 0x10, 0x10]);
        frame[12..14].copy_from_slice(&[0x88, 0xa4]);

        assert!(ethercat_payload(&frame).is_some());

        // Our own un-mangled source address is filtered
        frame[6..12].copy_from_slice(&MASTER_ADDR);
        assert!(ethercat_payload(&frame).is_none());

        // Non-EtherCAT EtherType is filtered
        frame[6..12].copy_from_slice(&[0x12, 0x10, 0x10, 0x10, 0x10, 0x10]);
        frame[12..14].copy_from_slice(&[0x08, 0x00]);
        assert!(ethercat_payload(&frame).is_none());
    }
}
