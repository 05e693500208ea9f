//! CoE sub-FSM: SDO upload, download and object dictionary discovery over the mailbox.

use super::FsmResult;
use super::mailbox::{MailboxIo, MbxPoll};
use crate::coe::{self, SdoInfoOpCode, SdoResponse};
use crate::error::{CoeError, Error};
use crate::mailbox::{self, MailboxType};
use crate::pdu_loop::PduLoop;
use crate::slave::{SdoEntryInfo, SdoInfo, Slave};

/// Bound on each mailbox round trip of an SDO transfer.
const COE_TIMEOUT_NS: u64 = 1_000_000_000;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum State {
    #[default]
    Idle,
    /// Awaiting the initiate upload response.
    Upload,
    /// Awaiting an upload segment response.
    UploadSegment,
    /// Awaiting the initiate download response.
    Download,
    /// Awaiting a download segment response.
    DownloadSegment,
    /// Awaiting (more of) the OD list.
    DictList,
    /// Awaiting an object description.
    DictObject,
    /// Awaiting an entry description.
    DictEntry,
}

/// Drives one SDO operation (or a whole dictionary fetch) against one slave.
#[derive(Debug)]
pub(crate) struct CoeFsm {
    io: MailboxIo,
    state: State,
    index: u16,
    subindex: u8,
    /// Upload destination or download source.
    buffer: Vec<u8>,
    /// Download progress in bytes.
    offset: usize,
    /// Announced total size of a segmented upload.
    expected_size: usize,
    toggle: bool,
    /// Abort code of the last failed transfer.
    abort_code: Option<crate::coe::abort::AbortCode>,
    /// Object indices collected from the OD list.
    od_indices: Vec<u16>,
    od_pos: usize,
    /// Object currently being described.
    current_object: Option<SdoInfo>,
    entry_subindex: u8,
    dictionary: Vec<SdoInfo>,
}

impl CoeFsm {
    pub fn new(pdu: &mut PduLoop) -> Self {
        Self {
            io: MailboxIo::new(pdu, "coe"),
            state: State::Idle,
            index: 0,
            subindex: 0,
            buffer: Vec::new(),
            offset: 0,
            expected_size: 0,
            toggle: false,
            abort_code: None,
            od_indices: Vec::new(),
            od_pos: 0,
            current_object: None,
            entry_subindex: 0,
            dictionary: Vec::new(),
        }
    }

    /// Begin an SDO upload (slave to master).
    pub fn start_upload(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        index: u16,
        subindex: u8,
        now: u64,
    ) -> Result<(), Error> {
        debug_assert!(self.state == State::Idle);

        self.index = index;
        self.subindex = subindex;
        self.buffer.clear();
        self.expected_size = 0;
        self.toggle = false;
        self.abort_code = None;

        self.io.start(
            pdu,
            slave,
            MailboxType::Coe,
            &coe::upload_request(index, subindex),
            COE_TIMEOUT_NS,
            now,
        )?;

        self.state = State::Upload;

        Ok(())
    }

    /// Begin an SDO download (master to slave) of `data`.
    pub fn start_download(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        index: u16,
        subindex: u8,
        data: Vec<u8>,
        now: u64,
    ) -> Result<(), Error> {
        debug_assert!(self.state == State::Idle);

        self.index = index;
        self.subindex = subindex;
        self.buffer = data;
        self.offset = 0;
        self.toggle = false;
        self.abort_code = None;

        self.io.start(
            pdu,
            slave,
            MailboxType::Coe,
            &coe::download_request(index, subindex, &self.buffer),
            COE_TIMEOUT_NS,
            now,
        )?;

        self.state = State::Download;

        Ok(())
    }

    /// Begin fetching the slave's whole object dictionary.
    pub fn start_dictionary(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        now: u64,
    ) -> Result<(), Error> {
        debug_assert!(self.state == State::Idle);

        self.od_indices.clear();
        self.od_pos = 0;
        self.dictionary.clear();
        self.current_object = None;
        self.abort_code = None;

        self.io.start(
            pdu,
            slave,
            MailboxType::Coe,
            &coe::od_list_request(),
            COE_TIMEOUT_NS,
            now,
        )?;

        self.state = State::DictList;

        Ok(())
    }

    /// The value read by the last completed upload.
    pub fn take_data(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.buffer)
    }

    /// The dictionary collected by the last completed fetch.
    pub fn take_dictionary(&mut self) -> Vec<SdoInfo> {
        core::mem::take(&mut self.dictionary)
    }

    /// Abort code of the last failed transfer, if the slave sent one.
    pub fn abort_code(&self) -> Option<crate::coe::abort::AbortCode> {
        self.abort_code
    }

    fn fail(&mut self, error: Error) -> FsmResult {
        self.state = State::Idle;
        self.io.reset();

        FsmResult::Failed(error)
    }

    fn abort(&mut self, code: crate::coe::abort::AbortCode) -> FsmResult {
        log::error!(
            "SDO {:#06x}:{} aborted: {}",
            self.index,
            self.subindex,
            code
        );

        self.abort_code = Some(code);

        self.fail(Error::Coe(CoeError::Abort {
            code,
            index: self.index,
            subindex: self.subindex,
        }))
    }

    /// Advance by at most one transition.
    pub fn exec(&mut self, pdu: &mut PduLoop, slave: &mut Slave, now: u64) -> FsmResult {
        if self.state == State::Idle {
            return FsmResult::Done;
        }

        let region = match self.io.poll(pdu, slave, now) {
            MbxPoll::Waiting => return FsmResult::Pending,
            MbxPoll::Failed(Error::Mailbox(crate::error::MailboxError::NoResponse)) => {
                return self.fail(Error::Coe(CoeError::Timeout));
            }
            MbxPoll::Failed(e) => return self.fail(e),
            MbxPoll::Mail(region) => region,
        };

        let (_header, payload) = match mailbox::parse(&region, MailboxType::Coe) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(e),
        };

        // An emergency can arrive in place of the expected response; log it and keep waiting
        if let Ok(coe_header) = <coe::CoeHeader as ethercrab_wire::EtherCrabWireRead>::unpack_from_slice(payload)
        {
            if coe_header.service == coe::CoeService::Emergency {
                let error_code = payload
                    .get(2..4)
                    .map(|raw| u16::from_le_bytes([raw[0], raw[1]]))
                    .unwrap_or(0);

                log::warn!(
                    "Slave {}: CoE emergency, error code {:#06x}",
                    slave.ring_position,
                    error_code
                );

                self.io.start_fetch(pdu, slave, COE_TIMEOUT_NS, now);

                return FsmResult::Pending;
            }
        }

        match self.state {
            State::Idle => FsmResult::Done,
            State::Upload => self.on_upload_response(pdu, slave, payload, now),
            State::UploadSegment => self.on_upload_segment(pdu, slave, payload, now),
            State::Download => self.on_download_response(pdu, slave, payload, now),
            State::DownloadSegment => self.on_download_segment(pdu, slave, payload, now),
            State::DictList => self.on_od_list(pdu, slave, payload, now),
            State::DictObject => self.on_object_desc(pdu, slave, payload, now),
            State::DictEntry => self.on_entry_desc(pdu, slave, payload, now),
        }
    }

    fn on_upload_response(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        payload: &[u8],
        now: u64,
    ) -> FsmResult {
        match coe::parse_response(payload, false) {
            Ok(SdoResponse::Abort { code, .. }) => self.abort(code),
            Ok(SdoResponse::Expedited {
                index,
                subindex,
                data,
                len,
            }) => {
                if index != self.index || subindex != self.subindex {
                    return self.fail(Error::Coe(CoeError::Protocol));
                }

                self.buffer = data[0..usize::from(len)].to_vec();
                self.state = State::Idle;

                FsmResult::Done
            }
            Ok(SdoResponse::Normal {
                index,
                subindex,
                complete_size,
                data,
            }) => {
                if index != self.index || subindex != self.subindex {
                    return self.fail(Error::Coe(CoeError::Protocol));
                }

                self.expected_size = complete_size as usize;
                self.buffer = data;

                if self.buffer.len() >= self.expected_size {
                    self.buffer.truncate(self.expected_size);
                    self.state = State::Idle;

                    return FsmResult::Done;
                }

                self.toggle = false;

                self.queue_upload_segment(pdu, slave, now)
            }
            Ok(_) | Err(_) => self.fail(Error::Coe(CoeError::Protocol)),
        }
    }

    fn queue_upload_segment(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        now: u64,
    ) -> FsmResult {
        if let Err(e) = self.io.start(
            pdu,
            slave,
            MailboxType::Coe,
            &coe::upload_segment_request(self.toggle),
            COE_TIMEOUT_NS,
            now,
        ) {
            return self.fail(e);
        }

        self.state = State::UploadSegment;

        FsmResult::Pending
    }

    fn on_upload_segment(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        payload: &[u8],
        now: u64,
    ) -> FsmResult {
        match coe::parse_response(payload, true) {
            Ok(SdoResponse::Abort { code, .. }) => self.abort(code),
            Ok(SdoResponse::UploadSegment {
                toggle,
                is_last,
                data,
            }) => {
                if toggle != self.toggle {
                    log::error!(
                        "SDO {:#06x}:{}: toggle bit mismatch",
                        self.index,
                        self.subindex
                    );

                    return self.fail(Error::Coe(CoeError::Protocol));
                }

                self.buffer.extend_from_slice(&data);

                if is_last || self.buffer.len() >= self.expected_size {
                    self.buffer.truncate(self.expected_size);
                    self.state = State::Idle;

                    return FsmResult::Done;
                }

                self.toggle = !self.toggle;

                self.queue_upload_segment(pdu, slave, now)
            }
            Ok(_) | Err(_) => self.fail(Error::Coe(CoeError::Protocol)),
        }
    }

    fn on_download_response(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        payload: &[u8],
        now: u64,
    ) -> FsmResult {
        match coe::parse_response(payload, false) {
            Ok(SdoResponse::Abort { code, .. }) => self.abort(code),
            Ok(SdoResponse::DownloadAck { index, subindex }) => {
                if index != self.index || subindex != self.subindex {
                    return self.fail(Error::Coe(CoeError::Protocol));
                }

                if self.buffer.len() <= 4 {
                    // Expedited transfer, all done
                    self.state = State::Idle;

                    return FsmResult::Done;
                }

                self.toggle = false;

                self.queue_download_segment(pdu, slave, now)
            }
            Ok(_) | Err(_) => self.fail(Error::Coe(CoeError::Protocol)),
        }
    }

    fn queue_download_segment(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        now: u64,
    ) -> FsmResult {
        let capacity = usize::from(slave.rx_mailbox.payload_capacity()).saturating_sub(3).max(7);

        let remaining = self.buffer.len() - self.offset;
        let chunk_len = remaining.min(capacity);
        let is_last = self.offset + chunk_len >= self.buffer.len();

        let chunk = &self.buffer[self.offset..self.offset + chunk_len];
        let request = coe::download_segment_request(self.toggle, is_last, chunk);

        self.offset += chunk_len;

        if let Err(e) = self
            .io
            .start(pdu, slave, MailboxType::Coe, &request, COE_TIMEOUT_NS, now)
        {
            return self.fail(e);
        }

        self.state = State::DownloadSegment;

        FsmResult::Pending
    }

    fn on_download_segment(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        payload: &[u8],
        now: u64,
    ) -> FsmResult {
        match coe::parse_response(payload, true) {
            Ok(SdoResponse::Abort { code, .. }) => self.abort(code),
            Ok(SdoResponse::DownloadSegmentAck { toggle }) => {
                if toggle != self.toggle {
                    return self.fail(Error::Coe(CoeError::Protocol));
                }

                if self.offset >= self.buffer.len() {
                    self.state = State::Idle;

                    return FsmResult::Done;
                }

                self.toggle = !self.toggle;

                self.queue_download_segment(pdu, slave, now)
            }
            Ok(_) | Err(_) => self.fail(Error::Coe(CoeError::Protocol)),
        }
    }

    fn on_od_list(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        payload: &[u8],
        now: u64,
    ) -> FsmResult {
        let response = match coe::parse_info_response(payload) {
            Ok(response) => response,
            Err(e) => return self.fail(e),
        };

        if response.op_code != SdoInfoOpCode::GetOdListResponse {
            return self.fail(Error::Coe(CoeError::Protocol));
        }

        // The first fragment leads with the list type word
        let indices = if self.od_indices.is_empty() {
            response.data.get(2..).unwrap_or(&[])
        } else {
            &response.data[..]
        };

        self.od_indices.extend(
            indices
                .chunks_exact(2)
                .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]])),
        );

        if response.incomplete {
            self.io.start_fetch(pdu, slave, COE_TIMEOUT_NS, now);

            return FsmResult::Pending;
        }

        log::debug!(
            "Slave {}: dictionary lists {} objects",
            slave.ring_position,
            self.od_indices.len()
        );

        self.od_pos = 0;

        self.queue_next_object(pdu, slave, now)
    }

    fn queue_next_object(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        now: u64,
    ) -> FsmResult {
        let Some(&index) = self.od_indices.get(self.od_pos) else {
            self.state = State::Idle;

            return FsmResult::Done;
        };

        if let Err(e) = self.io.start(
            pdu,
            slave,
            MailboxType::Coe,
            &coe::object_desc_request(index),
            COE_TIMEOUT_NS,
            now,
        ) {
            return self.fail(e);
        }

        self.state = State::DictObject;

        FsmResult::Pending
    }

    fn on_object_desc(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        payload: &[u8],
        now: u64,
    ) -> FsmResult {
        let response = match coe::parse_info_response(payload) {
            Ok(response) => response,
            Err(e) => return self.fail(e),
        };

        if response.op_code != SdoInfoOpCode::GetObjectDescResponse || response.data.len() < 6 {
            return self.fail(Error::Coe(CoeError::Protocol));
        }

        let data = &response.data;

        let object = SdoInfo {
            index: u16::from_le_bytes([data[0], data[1]]),
            object_code: data[5],
            max_subindex: data[4],
            name: ascii_string(&data[6..]),
            entries: Vec::new(),
        };

        self.entry_subindex = 0;

        let request = coe::entry_desc_request(object.index, 0);

        self.current_object = Some(object);

        if let Err(e) = self
            .io
            .start(pdu, slave, MailboxType::Coe, &request, COE_TIMEOUT_NS, now)
        {
            return self.fail(e);
        }

        self.state = State::DictEntry;

        FsmResult::Pending
    }

    fn on_entry_desc(
        &mut self,
        pdu: &mut PduLoop,
        slave: &mut Slave,
        payload: &[u8],
        now: u64,
    ) -> FsmResult {
        match coe::parse_info_response(payload) {
            Ok(response) => {
                if response.op_code != SdoInfoOpCode::GetEntryDescResponse
                    || response.data.len() < 10
                {
                    return self.fail(Error::Coe(CoeError::Protocol));
                }

                let data = &response.data;

                if let Some(object) = self.current_object.as_mut() {
                    object.entries.push(SdoEntryInfo {
                        subindex: data[2],
                        data_type: u16::from_le_bytes([data[4], data[5]]),
                        bit_length: u16::from_le_bytes([data[6], data[7]]),
                        access: u16::from_le_bytes([data[8], data[9]]),
                        name: ascii_string(&data[10..]),
                    });
                }
            }
            // A missing subindex inside a record is not fatal; skip it
            Err(Error::Coe(CoeError::Abort { .. })) => (),
            Err(e) => return self.fail(e),
        }

        self.queue_next_entry(pdu, slave, now)
    }

    fn queue_next_entry(&mut self, pdu: &mut PduLoop, slave: &mut Slave, now: u64) -> FsmResult {
        let Some(object) = self.current_object.as_ref() else {
            return self.fail(Error::Internal);
        };

        if self.entry_subindex < object.max_subindex {
            self.entry_subindex += 1;

            let request = coe::entry_desc_request(object.index, self.entry_subindex);

            if let Err(e) = self
                .io
                .start(pdu, slave, MailboxType::Coe, &request, COE_TIMEOUT_NS, now)
            {
                return self.fail(e);
            }

            self.state = State::DictEntry;

            return FsmResult::Pending;
        }

        if let Some(object) = self.current_object.take() {
            log::trace!(
                "Slave {}: object {:#06x} \"{}\", {} entries",
                slave.ring_position,
                object.index,
                object.name,
                object.entries.len()
            );

            self.dictionary.push(object);
        }

        self.od_pos += 1;

        self.queue_next_object(pdu, slave, now)
    }
}

fn ascii_string(raw: &[u8]) -> String {
    raw.iter()
        .take_while(|&&byte| byte != 0)
        .map(|&byte| if byte.is_ascii() { byte as char } else { '?' })
        .collect()
}
