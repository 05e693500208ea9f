//! CoE (CANopen over EtherCAT) wire structures and service builders.
//!
//! Everything here maps one-to-one onto ETG1000.6 section 5.6: the 2 byte CoE header, the 4 byte
//! SDO headers for initiate/segment services, and the SDO information service used for object
//! dictionary discovery. The transfer logic lives in [`crate::fsm::coe`].

pub mod abort;

use crate::error::{CoeError, Error};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite};

/// Payload length of every initiate/segment SDO request: CoE header, SDO header, 4 data bytes.
pub const SDO_REQUEST_LEN: usize = 10;

/// CoE header, ETG1000.6 Table 29.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct CoeHeader {
    /// PDO number for (R)xPDO services, zero otherwise.
    #[wire(bits = 9, post_skip = 3)]
    pub number: u16,
    /// Service carried after this header.
    #[wire(bits = 4)]
    pub service: CoeService,
}

impl CoeHeader {
    /// A header carrying the given service and no PDO number.
    pub fn service(service: CoeService) -> Self {
        Self {
            number: 0,
            service,
        }
    }
}

/// CoE service numbers, ETG1000.6 Table 29.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum CoeService {
    /// Emergency message.
    Emergency = 0x01,
    /// SDO request.
    SdoRequest = 0x02,
    /// SDO response.
    SdoResponse = 0x03,
    /// TxPDO transmission.
    TxPdo = 0x04,
    /// RxPDO transmission.
    RxPdo = 0x05,
    /// TxPDO remote request.
    TxPdoRemoteRequest = 0x06,
    /// RxPDO remote request.
    RxPdoRemoteRequest = 0x07,
    /// SDO information service.
    SdoInformation = 0x08,
    /// Reserved service number.
    #[wire(catch_all)]
    Other(u8),
}

/// Flags byte of an initiate SDO header, ETG1000.6 5.6.2.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 1)]
pub struct InitSdoFlags {
    /// A data set size is specified.
    #[wire(bits = 1)]
    pub size_indicator: bool,
    /// The transfer is expedited: 1–4 data bytes travel inside the initiate service.
    #[wire(bits = 1)]
    pub expedited: bool,
    /// Number of unused bytes in the expedited data field.
    #[wire(bits = 2)]
    pub size: u8,
    /// The whole object is accessed instead of one subindex.
    #[wire(bits = 1)]
    pub complete_access: bool,
    /// Command specifier.
    #[wire(bits = 3)]
    pub command: u8,
}

impl InitSdoFlags {
    /// Download request command specifier.
    pub const DOWNLOAD_REQUEST: u8 = 0x01;
    /// Download response command specifier.
    pub const DOWNLOAD_RESPONSE: u8 = 0x03;
    /// Upload request command specifier.
    pub const UPLOAD_REQUEST: u8 = 0x02;
    /// Upload response command specifier.
    pub const UPLOAD_RESPONSE: u8 = 0x02;
    /// Abort command specifier.
    pub const ABORT: u8 = 0x04;
}

/// Initiate SDO header: flags, index, subindex.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 4)]
pub struct InitSdoHeader {
    /// Flags byte.
    #[wire(bytes = 1)]
    pub flags: InitSdoFlags,
    /// Object index.
    #[wire(bytes = 2)]
    pub index: u16,
    /// Object subindex.
    #[wire(bytes = 1)]
    pub subindex: u8,
}

/// Segment SDO header, ETG1000.6 5.6.2.3.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 1)]
pub struct SegmentSdoHeader {
    /// This is the final segment of the transfer.
    #[wire(bits = 1)]
    pub is_last: bool,
    /// Number of unused bytes in a 7 byte segment data field.
    #[wire(bits = 3)]
    pub segment_data_size: u8,
    /// Alternates between consecutive segments, starting at `false`.
    #[wire(bits = 1)]
    pub toggle: bool,
    /// Command specifier.
    #[wire(bits = 3)]
    pub command: u8,
}

impl SegmentSdoHeader {
    /// Download segment request command specifier.
    pub const DOWNLOAD_SEGMENT_REQUEST: u8 = 0x00;
    /// Download segment response command specifier.
    pub const DOWNLOAD_SEGMENT_RESPONSE: u8 = 0x01;
    /// Upload segment request command specifier.
    pub const UPLOAD_SEGMENT_REQUEST: u8 = 0x03;
    /// Upload segment response command specifier.
    pub const UPLOAD_SEGMENT_RESPONSE: u8 = 0x00;
}

/// Build an expedited or normal initiate download request.
///
/// Values up to 4 bytes travel expedited inside the request; anything larger announces its total
/// size here and is chased with download segments.
pub fn download_request(index: u16, subindex: u8, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![0u8; SDO_REQUEST_LEN];

    CoeHeader::service(CoeService::SdoRequest).pack_to_slice_unchecked(&mut payload[0..2]);

    if data.len() <= 4 {
        InitSdoHeader {
            flags: InitSdoFlags {
                size_indicator: true,
                expedited: true,
                size: 4u8.saturating_sub(data.len() as u8),
                complete_access: false,
                command: InitSdoFlags::DOWNLOAD_REQUEST,
            },
            index,
            subindex,
        }
        .pack_to_slice_unchecked(&mut payload[2..6]);

        payload[6..6 + data.len()].copy_from_slice(data);
    } else {
        InitSdoHeader {
            flags: InitSdoFlags {
                size_indicator: true,
                expedited: false,
                size: 0,
                complete_access: false,
                command: InitSdoFlags::DOWNLOAD_REQUEST,
            },
            index,
            subindex,
        }
        .pack_to_slice_unchecked(&mut payload[2..6]);

        payload[6..10].copy_from_slice(&(data.len() as u32).to_le_bytes());
    }

    payload
}

/// Build a download segment request carrying `data`.
///
/// Segments shorter than 7 bytes are padded; the header's size field records the padding.
pub fn download_segment_request(toggle: bool, is_last: bool, data: &[u8]) -> Vec<u8> {
    let seg_len = data.len().max(7);
    let mut payload = vec![0u8; 3 + seg_len];

    CoeHeader::service(CoeService::SdoRequest).pack_to_slice_unchecked(&mut payload[0..2]);

    SegmentSdoHeader {
        is_last,
        segment_data_size: 7u8.saturating_sub(data.len().min(7) as u8),
        toggle,
        command: SegmentSdoHeader::DOWNLOAD_SEGMENT_REQUEST,
    }
    .pack_to_slice_unchecked(&mut payload[2..3]);

    payload[3..3 + data.len()].copy_from_slice(data);

    payload
}

/// Build an initiate upload request.
pub fn upload_request(index: u16, subindex: u8) -> [u8; SDO_REQUEST_LEN] {
    let mut payload = [0u8; SDO_REQUEST_LEN];

    CoeHeader::service(CoeService::SdoRequest).pack_to_slice_unchecked(&mut payload[0..2]);

    InitSdoHeader {
        flags: InitSdoFlags {
            size_indicator: false,
            expedited: false,
            size: 0,
            complete_access: false,
            command: InitSdoFlags::UPLOAD_REQUEST,
        },
        index,
        subindex,
    }
    .pack_to_slice_unchecked(&mut payload[2..6]);

    payload
}

/// Build an upload segment request.
pub fn upload_segment_request(toggle: bool) -> [u8; SDO_REQUEST_LEN] {
    let mut payload = [0u8; SDO_REQUEST_LEN];

    CoeHeader::service(CoeService::SdoRequest).pack_to_slice_unchecked(&mut payload[0..2]);

    SegmentSdoHeader {
        is_last: false,
        segment_data_size: 0,
        toggle,
        command: SegmentSdoHeader::UPLOAD_SEGMENT_REQUEST,
    }
    .pack_to_slice_unchecked(&mut payload[2..3]);

    payload
}

/// A decoded initiate SDO response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdoResponse {
    /// An expedited upload response with up to 4 inline data bytes.
    Expedited {
        /// Object index echoed by the slave.
        index: u16,
        /// Object subindex echoed by the slave.
        subindex: u8,
        /// Inline data.
        data: [u8; 4],
        /// Number of valid bytes in `data`.
        len: u8,
    },
    /// A normal upload response: total size followed by the first data bytes.
    Normal {
        /// Object index echoed by the slave.
        index: u16,
        /// Object subindex echoed by the slave.
        subindex: u8,
        /// Complete size of the value being uploaded.
        complete_size: u32,
        /// Data bytes carried in this response.
        data: Vec<u8>,
    },
    /// A download acknowledge.
    DownloadAck {
        /// Object index echoed by the slave.
        index: u16,
        /// Object subindex echoed by the slave.
        subindex: u8,
    },
    /// An upload segment response.
    UploadSegment {
        /// Toggle bit of this segment.
        toggle: bool,
        /// This was the final segment.
        is_last: bool,
        /// Segment data with padding removed where the header allows it.
        data: Vec<u8>,
    },
    /// A download segment acknowledge.
    DownloadSegmentAck {
        /// Toggle bit echoed by the slave.
        toggle: bool,
    },
    /// The slave aborted the transfer.
    Abort {
        /// Object index echoed by the slave.
        index: u16,
        /// Object subindex echoed by the slave.
        subindex: u8,
        /// Abort code.
        code: abort::AbortCode,
    },
}

/// Decode an SDO response mailbox payload.
///
/// `segment_expected` selects between the initiate and segment header layouts, which cannot be
/// told apart from the bytes alone.
pub fn parse_response(payload: &[u8], segment_expected: bool) -> Result<SdoResponse, Error> {
    let header = CoeHeader::unpack_from_slice(payload)?;

    if header.service != CoeService::SdoResponse && header.service != CoeService::SdoRequest {
        return Err(Error::Coe(CoeError::Protocol));
    }

    let rest = payload.get(2..).ok_or(Error::Coe(CoeError::Protocol))?;

    // An abort is always in initiate layout, regardless of what was expected
    if let Ok(init) = InitSdoHeader::unpack_from_slice(rest) {
        if init.flags.command == InitSdoFlags::ABORT {
            let code = rest
                .get(4..8)
                .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
                .unwrap_or(0);

            return Ok(SdoResponse::Abort {
                index: init.index,
                subindex: init.subindex,
                code: abort::AbortCode(code),
            });
        }
    }

    if segment_expected {
        let seg = SegmentSdoHeader::unpack_from_slice(rest)?;
        let data = rest.get(1..).ok_or(Error::Coe(CoeError::Protocol))?;

        return match seg.command {
            SegmentSdoHeader::UPLOAD_SEGMENT_RESPONSE => {
                let len = data.len().saturating_sub(usize::from(seg.segment_data_size));

                Ok(SdoResponse::UploadSegment {
                    toggle: seg.toggle,
                    is_last: seg.is_last,
                    data: data[0..len].to_vec(),
                })
            }
            SegmentSdoHeader::DOWNLOAD_SEGMENT_RESPONSE => Ok(SdoResponse::DownloadSegmentAck {
                toggle: seg.toggle,
            }),
            _ => Err(Error::Coe(CoeError::Protocol)),
        };
    }

    let init = InitSdoHeader::unpack_from_slice(rest)?;
    let data = rest.get(4..).ok_or(Error::Coe(CoeError::Protocol))?;

    match init.flags.command {
        InitSdoFlags::UPLOAD_RESPONSE if init.flags.expedited => {
            let len = 4u8.saturating_sub(init.flags.size);
            let mut inline = [0u8; 4];

            inline[0..data.len().min(4)].copy_from_slice(&data[0..data.len().min(4)]);

            Ok(SdoResponse::Expedited {
                index: init.index,
                subindex: init.subindex,
                data: inline,
                len,
            })
        }
        InitSdoFlags::UPLOAD_RESPONSE => {
            let complete_size = data
                .get(0..4)
                .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
                .ok_or(Error::Coe(CoeError::Protocol))?;

            Ok(SdoResponse::Normal {
                index: init.index,
                subindex: init.subindex,
                complete_size,
                data: data[4..].to_vec(),
            })
        }
        InitSdoFlags::DOWNLOAD_RESPONSE => Ok(SdoResponse::DownloadAck {
            index: init.index,
            subindex: init.subindex,
        }),
        _ => Err(Error::Coe(CoeError::Protocol)),
    }
}

/// SDO information service opcodes, ETG1000.6 Table 33.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum SdoInfoOpCode {
    /// Get OD list request.
    GetOdListRequest = 0x01,
    /// Get OD list response.
    GetOdListResponse = 0x02,
    /// Get object description request.
    GetObjectDescRequest = 0x03,
    /// Get object description response.
    GetObjectDescResponse = 0x04,
    /// Get entry description request.
    GetEntryDescRequest = 0x05,
    /// Get entry description response.
    GetEntryDescResponse = 0x06,
    /// SDO information error.
    Error = 0x07,
    /// Reserved opcode.
    #[wire(catch_all)]
    Other(u8),
}

/// SDO information service header following the CoE header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 4)]
pub struct SdoInfoHeader {
    /// Operation.
    #[wire(bits = 7)]
    pub op_code: SdoInfoOpCode,
    /// More fragments follow this response.
    #[wire(bits = 1, post_skip = 8)]
    pub incomplete: bool,
    /// Number of fragments still pending after this one.
    #[wire(bytes = 2)]
    pub fragments_left: u16,
}

/// Build a Get OD List request for all objects.
pub fn od_list_request() -> [u8; 8] {
    let mut payload = [0u8; 8];

    CoeHeader::service(CoeService::SdoInformation).pack_to_slice_unchecked(&mut payload[0..2]);

    SdoInfoHeader {
        op_code: SdoInfoOpCode::GetOdListRequest,
        incomplete: false,
        fragments_left: 0,
    }
    .pack_to_slice_unchecked(&mut payload[2..6]);

    // List type 0x01: all objects
    payload[6..8].copy_from_slice(&0x0001u16.to_le_bytes());

    payload
}

/// Build a Get Object Description request.
pub fn object_desc_request(index: u16) -> [u8; 8] {
    let mut payload = [0u8; 8];

    CoeHeader::service(CoeService::SdoInformation).pack_to_slice_unchecked(&mut payload[0..2]);

    SdoInfoHeader {
        op_code: SdoInfoOpCode::GetObjectDescRequest,
        incomplete: false,
        fragments_left: 0,
    }
    .pack_to_slice_unchecked(&mut payload[2..6]);

    payload[6..8].copy_from_slice(&index.to_le_bytes());

    payload
}

/// Build a Get Entry Description request.
pub fn entry_desc_request(index: u16, subindex: u8) -> [u8; 10] {
    let mut payload = [0u8; 10];

    CoeHeader::service(CoeService::SdoInformation).pack_to_slice_unchecked(&mut payload[0..2]);

    SdoInfoHeader {
        op_code: SdoInfoOpCode::GetEntryDescRequest,
        incomplete: false,
        fragments_left: 0,
    }
    .pack_to_slice_unchecked(&mut payload[2..6]);

    payload[6..8].copy_from_slice(&index.to_le_bytes());
    payload[8] = subindex;
    // Value info byte: none requested
    payload[9] = 0x00;

    payload
}

/// A decoded SDO information response fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoInfoResponse {
    /// Operation of this fragment.
    pub op_code: SdoInfoOpCode,
    /// More fragments follow.
    pub incomplete: bool,
    /// Service data after the info header.
    pub data: Vec<u8>,
}

/// Decode an SDO information response mailbox payload.
pub fn parse_info_response(payload: &[u8]) -> Result<SdoInfoResponse, Error> {
    let header = CoeHeader::unpack_from_slice(payload)?;

    if header.service != CoeService::SdoInformation {
        return Err(Error::Coe(CoeError::Protocol));
    }

    let info = SdoInfoHeader::unpack_from_slice(
        payload.get(2..6).ok_or(Error::Coe(CoeError::Protocol))?,
    )?;

    if info.op_code == SdoInfoOpCode::Error {
        let code = payload
            .get(6..10)
            .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            .unwrap_or(0);

        return Err(Error::Coe(CoeError::Abort {
            code: abort::AbortCode(code),
            index: 0,
            subindex: 0,
        }));
    }

    Ok(SdoInfoResponse {
        op_code: info.op_code,
        incomplete: info.incomplete,
        data: payload.get(6..).unwrap_or(&[]).to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expedited_download_image() {
        // Write 0x0002 (u16) to 0x1c12:00
        let payload = download_request(0x1c12, 0, &[0x02, 0x00]);

        assert_eq!(
            payload,
            [
                0x00, 0x20, // CoE header: SDO request
                0x2b, // Flags: expedited, size indicator, 2 empty bytes, download
                0x12, 0x1c, // Index
                0x00, // Subindex
                0x02, 0x00, 0x00, 0x00, // Data
            ]
        );
    }

    #[test]
    fn normal_download_announces_size() {
        let data = [0u8; 16];
        let payload = download_request(0x2000, 1, &data);

        // Size indicator without expedited flag; total length in the data field
        assert_eq!(payload[2], 0x21);
        assert_eq!(&payload[6..10], &16u32.to_le_bytes());
    }

    #[test]
    fn upload_request_image() {
        let payload = upload_request(0x1000, 0);

        assert_eq!(
            payload,
            [0x00, 0x20, 0x40, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn parse_expedited_upload() {
        // Device type response: 4 valid bytes
        let payload = [
            0x00, 0x30, // CoE header: SDO response
            0x43, // Upload response, expedited, size indicated, 0 empty
            0x00, 0x10, // Index 0x1000
            0x00, // Subindex
            0x91, 0x01, 0x0f, 0x00, // Data
        ];

        assert_eq!(
            parse_response(&payload, false).unwrap(),
            SdoResponse::Expedited {
                index: 0x1000,
                subindex: 0,
                data: [0x91, 0x01, 0x0f, 0x00],
                len: 4,
            }
        );
    }

    #[test]
    fn parse_abort() {
        let payload = [
            0x00, 0x30, // CoE header: SDO response
            0x80, // Abort
            0x30, 0x1c, // Index
            0x01, // Subindex
            0x11, 0x00, 0x09, 0x06, // 0x06090011 subindex does not exist
        ];

        assert_eq!(
            parse_response(&payload, false).unwrap(),
            SdoResponse::Abort {
                index: 0x1c30,
                subindex: 1,
                code: abort::AbortCode(0x0609_0011),
            }
        );
    }

    #[test]
    fn parse_upload_segment() {
        let payload = [
            0x00, 0x30, // CoE header
            0b0000_0001, // Segment response, not toggled, last, no padding
            b'h', b'e', b'l', b'l', b'o', b'!', b'!',
        ];

        assert_eq!(
            parse_response(&payload, true).unwrap(),
            SdoResponse::UploadSegment {
                toggle: false,
                is_last: true,
                data: b"hello!!".to_vec(),
            }
        );
    }

    #[test]
    fn od_list_request_image() {
        assert_eq!(
            od_list_request(),
            [0x00, 0x80, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00]
        );
    }
}
