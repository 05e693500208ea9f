//! FoE (File access over EtherCAT) wire structures.
//!
//! Every FoE mailbox payload starts with a fixed 6 byte header: opcode, a reserved byte and a 32
//! bit field that carries the packet number for `DATA`/`ACK`, the password for `RRQ`/`WRQ` and
//! the error code for `ERR`. The transfer logic lives in [`crate::fsm::foe`].

use crate::error::{Error, FoeError};
use ethercrab_wire::EtherCrabWireRead;

/// Length of the FoE header at the start of every message.
pub const FOE_HEADER_LEN: usize = 6;

/// FoE operations, ETG1000.6 Table 40.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum OpCode {
    /// Read request.
    Rrq = 0x01,
    /// Write request.
    Wrq = 0x02,
    /// File data.
    Data = 0x03,
    /// Acknowledge.
    Ack = 0x04,
    /// Error.
    Err = 0x05,
    /// Busy, retransmit the last data packet.
    Busy = 0x06,
    /// Reserved opcode.
    #[wire(catch_all)]
    Other(u8),
}

/// Build a read request for `file_name`.
pub fn read_request(file_name: &str, password: u32) -> Vec<u8> {
    request(OpCode::Rrq, file_name, password)
}

/// Build a write request for `file_name`.
pub fn write_request(file_name: &str, password: u32) -> Vec<u8> {
    request(OpCode::Wrq, file_name, password)
}

fn request(op: OpCode, file_name: &str, password: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(FOE_HEADER_LEN + file_name.len());

    payload.push(u8::from(op));
    payload.push(0x00);
    payload.extend_from_slice(&password.to_le_bytes());
    payload.extend_from_slice(file_name.as_bytes());

    payload
}

/// Build a data message for packet number `packet`.
pub fn data(packet: u32, chunk: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(FOE_HEADER_LEN + chunk.len());

    payload.push(u8::from(OpCode::Data));
    payload.push(0x00);
    payload.extend_from_slice(&packet.to_le_bytes());
    payload.extend_from_slice(chunk);

    payload
}

/// Build an acknowledge for packet number `packet`.
pub fn ack(packet: u32) -> [u8; FOE_HEADER_LEN] {
    let mut payload = [0u8; FOE_HEADER_LEN];

    payload[0] = u8::from(OpCode::Ack);
    payload[2..6].copy_from_slice(&packet.to_le_bytes());

    payload
}

/// A decoded FoE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoeMessage {
    /// File data for the given packet number.
    Data {
        /// Packet number, starting at 1.
        packet: u32,
        /// Data bytes following the header.
        data: Vec<u8>,
    },
    /// Acknowledge of the given packet number.
    Ack {
        /// Acknowledged packet number; 0 acknowledges a write request.
        packet: u32,
    },
    /// The slave is busy; the last data packet must be retransmitted.
    Busy,
    /// The slave terminated the transfer.
    Error {
        /// FoE error code.
        code: u32,
        /// Optional error text.
        text: Option<String>,
    },
}

/// Decode an FoE mailbox payload.
pub fn parse(payload: &[u8]) -> Result<FoeMessage, Error> {
    if payload.len() < FOE_HEADER_LEN {
        return Err(Error::Foe(FoeError::Protocol));
    }

    let op = OpCode::unpack_from_slice(&payload[0..1])?;
    let field = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]);
    let rest = &payload[FOE_HEADER_LEN..];

    match op {
        OpCode::Data => Ok(FoeMessage::Data {
            packet: field,
            data: rest.to_vec(),
        }),
        OpCode::Ack => Ok(FoeMessage::Ack { packet: field }),
        OpCode::Busy => Ok(FoeMessage::Busy),
        OpCode::Err => {
            let text = if rest.is_empty() {
                None
            } else {
                Some(
                    rest.iter()
                        .take_while(|&&byte| byte != 0)
                        .map(|&byte| if byte.is_ascii() { byte as char } else { '?' })
                        .collect(),
                )
            };

            Ok(FoeMessage::Error { code: field, text })
        }
        _ => Err(Error::Foe(FoeError::Protocol)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_request_image() {
        assert_eq!(
            write_request("firmware.bin", 0),
            [
                &[0x02, 0x00, 0x00, 0x00, 0x00, 0x00][..],
                b"firmware.bin".as_slice()
            ]
            .concat()
        );
    }

    #[test]
    fn data_image() {
        assert_eq!(
            data(1, &[0xca, 0xfe]),
            [0x03, 0x00, 0x01, 0x00, 0x00, 0x00, 0xca, 0xfe]
        );
    }

    #[test]
    fn ack_image() {
        assert_eq!(ack(2), [0x04, 0x00, 0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn parse_error_with_text() {
        let mut payload = vec![0x05, 0x00];

        payload.extend_from_slice(&0x8001u32.to_le_bytes());
        payload.extend_from_slice(b"not found\0");

        assert_eq!(
            parse(&payload).unwrap(),
            FoeMessage::Error {
                code: 0x8001,
                text: Some("not found".to_string()),
            }
        );
    }

    #[test]
    fn parse_busy() {
        assert_eq!(
            parse(&[0x06, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap(),
            FoeMessage::Busy
        );
    }

    #[test]
    fn parse_rejects_short() {
        assert_eq!(
            parse(&[0x03, 0x00]),
            Err(Error::Foe(FoeError::Protocol))
        );
    }
}
