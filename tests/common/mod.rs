//! An in-memory EtherCAT bus emulation.
//!
//! `SimBus` implements [`EthernetPort`] and models a ring of `SimSlave`s at the register level:
//! auto increment/node/broadcast addressing, the SII register interface backed by a word image,
//! a CoE mailbox with an object dictionary, the AL state machine and FMMU-mapped logical
//! read/write. Responses are produced for each transmitted frame exactly as a real ring would,
//! then handed back on the next `poll`.

use fieldcat::{EthernetPort, LinkState};
use std::collections::{BTreeMap, VecDeque};

/// Build a minimal valid SII image for an emulated slave.
pub struct SiiBuilder {
    words: Vec<u16>,
}

impl SiiBuilder {
    pub fn new(vendor_id: u32, product_code: u32) -> Self {
        let mut words = vec![0u16; 0x40];

        words[0x0000] = 0x0064; // PDI control
        words[0x0008] = (vendor_id & 0xffff) as u16;
        words[0x0009] = (vendor_id >> 16) as u16;
        words[0x000a] = (product_code & 0xffff) as u16;
        words[0x000b] = (product_code >> 16) as u16;
        words[0x000c] = 0x0001; // Revision
        words[0x000e] = 0x0001; // Serial

        let mut this = Self { words };

        this.update_checksum();

        this
    }

    pub fn alias(mut self, alias: u16) -> Self {
        self.words[0x0004] = alias;
        self.update_checksum();

        self
    }

    /// Standard mailbox configuration and supported protocols (SII words 0x18..=0x1C).
    pub fn mailbox(mut self, rx_offset: u16, rx_size: u16, tx_offset: u16, tx_size: u16, protocols: u16) -> Self {
        self.words[0x0018] = rx_offset;
        self.words[0x0019] = rx_size;
        self.words[0x001a] = tx_offset;
        self.words[0x001b] = tx_size;
        self.words[0x001c] = protocols;

        self
    }

    /// Append a raw category.
    pub fn category(mut self, category_type: u16, data: &[u8]) -> Self {
        assert_eq!(data.len() % 2, 0, "category data must be a whole number of words");

        self.words.push(category_type);
        self.words.push((data.len() / 2) as u16);

        for chunk in data.chunks_exact(2) {
            self.words.push(u16::from_le_bytes([chunk[0], chunk[1]]));
        }

        self
    }

    /// String category from a list of strings.
    pub fn strings(self, strings: &[&str]) -> Self {
        let mut data = vec![strings.len() as u8];

        for string in strings {
            data.push(string.len() as u8);
            data.extend_from_slice(string.as_bytes());
        }

        if data.len() % 2 != 0 {
            data.push(0);
        }

        self.category(10, &data)
    }

    /// General category naming the device via 1-based string indices.
    pub fn general(self, name_string_idx: u8, coe_details: u8) -> Self {
        let mut data = [0u8; 18];

        data[3] = name_string_idx;
        data[5] = coe_details;

        self.category(30, &data)
    }

    /// Sync manager category entry data for one channel.
    pub fn sync_managers(self, descs: &[(u16, u16, u8, u8)]) -> Self {
        let mut data = Vec::new();

        for &(start, length, control, usage) in descs {
            data.extend_from_slice(&start.to_le_bytes());
            data.extend_from_slice(&length.to_le_bytes());
            data.push(control);
            data.push(0x00); // Status
            data.push(0x01); // Enable
            data.push(usage);
        }

        self.category(41, &data)
    }

    /// A TxPDO category with one PDO and its entries `(index, subindex, bit_length)`.
    pub fn tx_pdo(self, pdo_index: u16, sync_manager: u8, entries: &[(u16, u8, u8)]) -> Self {
        self.pdo(50, pdo_index, sync_manager, entries)
    }

    /// An RxPDO category with one PDO and its entries.
    pub fn rx_pdo(self, pdo_index: u16, sync_manager: u8, entries: &[(u16, u8, u8)]) -> Self {
        self.pdo(51, pdo_index, sync_manager, entries)
    }

    fn pdo(self, category: u16, pdo_index: u16, sync_manager: u8, entries: &[(u16, u8, u8)]) -> Self {
        let mut data = Vec::new();

        data.extend_from_slice(&pdo_index.to_le_bytes());
        data.push(entries.len() as u8);
        data.push(sync_manager);
        data.push(0x00); // DC sync
        data.push(0x00); // Name string index
        data.extend_from_slice(&0u16.to_le_bytes());

        for &(index, subindex, bit_length) in entries {
            data.extend_from_slice(&index.to_le_bytes());
            data.push(subindex);
            data.push(0x00); // Name string index
            data.push(0x00); // Data type
            data.push(bit_length);
            data.extend_from_slice(&0u16.to_le_bytes());
        }

        self.category(category, &data)
    }

    pub fn build(mut self) -> Vec<u16> {
        self.words.push(0xffff);

        self.words
    }

    fn update_checksum(&mut self) {
        let mut bytes = Vec::with_capacity(14);

        for word in &self.words[0..7] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }

        self.words[7] = u16::from(crc8(&bytes));
    }
}

fn foe_header(opcode: u8, field: u32) -> Vec<u8> {
    let mut header = vec![opcode, 0x00];

    header.extend_from_slice(&field.to_le_bytes());

    header
}

/// CRC-8, polynomial 0x07, initial value 0xFF, as used by the SII header checksum.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0xffu8;

    for &byte in data {
        crc ^= byte;

        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }

    crc
}

/// One emulated slave.
pub struct SimSlave {
    /// Sparse physical memory.
    pub regs: BTreeMap<u16, u8>,
    /// SII image in words.
    pub sii: Vec<u16>,
    /// CoE object dictionary: `(index, subindex)` to value bytes.
    pub objects: BTreeMap<(u16, u8), Vec<u8>>,
    /// Input process data served through read FMMUs.
    pub inputs: Vec<u8>,
    /// Output process data captured through write FMMUs.
    pub outputs: Vec<u8>,
    /// Refuse the next OP request with this AL status code.
    pub refuse_op_with: Option<u16>,
    /// Refuse SII writes (write protection).
    pub sii_write_protected: bool,
    /// Files served and stored over FoE.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Pending outgoing mailbox payload.
    tx_mail: Option<Vec<u8>>,
    /// Upload currently being segmented: remaining data.
    upload_rest: Vec<u8>,
    upload_toggle: bool,
    /// FoE state: file being written, or file and offset being read.
    foe_write: Option<String>,
    foe_read: Option<(String, usize)>,
}

const AL_STATUS: u16 = 0x0130;
const AL_STATUS_CODE: u16 = 0x0134;

impl SimSlave {
    pub fn new(sii: Vec<u16>) -> Self {
        let mut slave = Self {
            regs: BTreeMap::new(),
            sii,
            objects: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            refuse_op_with: None,
            sii_write_protected: false,
            files: BTreeMap::new(),
            tx_mail: None,
            upload_rest: Vec::new(),
            upload_toggle: false,
            foe_write: None,
            foe_read: None,
        };

        // Base registers: type, revision, build, 8 FMMUs, 8 SMs, DC support
        slave.write_reg(0x0000, &[0x11, 0x02, 0x01, 0x00, 0x08, 0x08, 0x01, 0x0f, 0x04, 0x00]);
        // Boot in INIT
        slave.write_reg(AL_STATUS, &[0x01, 0x00]);

        slave
    }

    pub fn station_address(&self) -> u16 {
        self.read_u16(0x0010)
    }

    pub fn al_state(&self) -> u8 {
        self.read_u8(AL_STATUS) & 0x0f
    }

    fn read_u8(&self, address: u16) -> u8 {
        self.regs.get(&address).copied().unwrap_or(0)
    }

    fn read_u16(&self, address: u16) -> u16 {
        u16::from_le_bytes([self.read_u8(address), self.read_u8(address + 1)])
    }

    fn write_reg(&mut self, address: u16, data: &[u8]) {
        for (offset, &byte) in data.iter().enumerate() {
            self.regs.insert(address + offset as u16, byte);
        }
    }

    fn read_regs(&self, address: u16, len: usize) -> Vec<u8> {
        (0..len)
            .map(|offset| self.read_u8(address + offset as u16))
            .collect()
    }

    fn rx_mailbox(&self) -> (u16, u16) {
        (self.sii[0x18], self.sii[0x19])
    }

    fn tx_mailbox(&self) -> (u16, u16) {
        (self.sii[0x1a], self.sii[0x1b])
    }

    fn has_mailbox(&self) -> bool {
        self.sii.len() > 0x1c && self.sii[0x1c] != 0
    }

    /// Apply a physical write to this slave.
    fn physical_write(&mut self, address: u16, data: &[u8]) {
        // AL control register drives the state machine
        if address == 0x0120 && data.len() >= 2 {
            self.al_control(data[0]);

            return;
        }

        // SII interface
        if address == 0x0502 {
            self.sii_command(data);

            return;
        }

        // Receive mailbox
        if self.has_mailbox() {
            let (rx_offset, rx_size) = self.rx_mailbox();

            if address == rx_offset && data.len() == usize::from(rx_size) {
                self.mailbox_written(data.to_vec());

                return;
            }
        }

        self.write_reg(address, data);
    }

    /// Serve a physical read from this slave.
    fn physical_read(&mut self, address: u16, len: usize) -> Vec<u8> {
        // SM1 status byte carries the "mail pending" flag
        if self.has_mailbox() {
            let (tx_offset, tx_size) = self.tx_mailbox();

            if address == tx_offset && len == usize::from(tx_size) {
                let mut region = vec![0u8; len];

                if let Some(mail) = self.tx_mail.take() {
                    region[0..mail.len()].copy_from_slice(&mail);
                }

                return region;
            }

            if address == 0x0808 && len == 8 {
                let mut channel = self.read_regs(address, len);

                channel[5] = if self.tx_mail.is_some() { 0x08 } else { 0x00 };

                return channel;
            }
        }

        self.read_regs(address, len)
    }

    fn al_control(&mut self, control: u8) {
        let target = control & 0x0f;
        let ack = control & 0x10 != 0;
        let current = self.al_state();

        if ack {
            // Clear the error bit, stay in the current state
            self.write_reg(AL_STATUS, &[current, 0x00]);

            return;
        }

        if target == 0x08 {
            if let Some(code) = self.refuse_op_with.take() {
                // Refuse: error bit plus status code, state unchanged
                self.write_reg(AL_STATUS, &[current | 0x10, 0x00]);
                self.write_reg(AL_STATUS_CODE, &code.to_le_bytes());

                return;
            }
        }

        self.write_reg(AL_STATUS, &[target, 0x00]);
    }

    fn sii_command(&mut self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }

        let control = u16::from_le_bytes([data[0], data[1]]);
        let word_addr = usize::from(u16::from_le_bytes([data[2], data[3]]));

        let read_op = control & 0x0100 != 0;
        let write_op = control & 0x0200 != 0;

        // Status register: idle, no errors (or write error if protected)
        let mut status: u16 = 0;

        if read_op {
            let low = self.sii.get(word_addr).copied().unwrap_or(0xffff);
            let high = self.sii.get(word_addr + 1).copied().unwrap_or(0xffff);

            self.write_reg(0x0508, &low.to_le_bytes());
            self.write_reg(0x050a, &high.to_le_bytes());
        }

        if write_op && data.len() >= 8 {
            if self.sii_write_protected {
                status |= 0x4000; // Write error
            } else {
                let value = u16::from_le_bytes([data[6], data[7]]);

                if self.sii.len() <= word_addr {
                    self.sii.resize(word_addr + 1, 0);
                }

                self.sii[word_addr] = value;
            }
        }

        self.write_reg(0x0502, &status.to_le_bytes());
        self.write_reg(0x0504, &(word_addr as u16).to_le_bytes());
    }

    /// Process a mail landing in the receive mailbox.
    fn mailbox_written(&mut self, region: Vec<u8>) {
        let length = usize::from(u16::from_le_bytes([region[0], region[1]]));
        let mailbox_type = region[5] & 0x0f;
        let payload = &region[6..6 + length];

        if mailbox_type == 0x03 {
            let response = self.coe_request(payload);

            self.post_mail(0x03, &response);
        } else if mailbox_type == 0x04 {
            if let Some(response) = self.foe_request(payload) {
                self.post_mail(0x04, &response);
            }
        }
    }

    /// Emulate the FoE server. Returns `None` when no reply is due (final acknowledge).
    fn foe_request(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        let opcode = payload[0];
        let field = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]);
        let rest = &payload[6..];

        // Fragment capacity of the send mailbox
        let fragment = usize::from(self.tx_mailbox().1) - 12;

        match opcode {
            // WRQ: accept and acknowledge with packet 0
            0x02 => {
                let name = String::from_utf8_lossy(rest).to_string();

                self.files.insert(name.clone(), Vec::new());
                self.foe_write = Some(name);

                Some(foe_header(0x04, 0))
            }

            // DATA: append and acknowledge
            0x03 => {
                let name = self.foe_write.clone()?;

                self.files.get_mut(&name)?.extend_from_slice(rest);

                Some(foe_header(0x04, field))
            }

            // RRQ: serve the first data packet
            0x01 => {
                let name = String::from_utf8_lossy(rest).to_string();

                let Some(file) = self.files.get(&name).cloned() else {
                    let mut response = foe_header(0x05, 0x8001);

                    response.extend_from_slice(b"not found");

                    return Some(response);
                };

                self.foe_read = Some((name, 0));

                let chunk = &file[0..file.len().min(fragment)];
                let mut response = foe_header(0x03, 1);

                response.extend_from_slice(chunk);

                if let Some(read) = self.foe_read.as_mut() {
                    read.1 = chunk.len();
                }

                Some(response)
            }

            // ACK: serve the next data packet if any remain
            0x04 => {
                let (name, offset) = self.foe_read.clone()?;
                let file = self.files.get(&name)?.clone();

                if offset >= file.len() {
                    self.foe_read = None;

                    return None;
                }

                let chunk = &file[offset..file.len().min(offset + fragment)];
                let mut response = foe_header(0x03, field + 1);

                response.extend_from_slice(chunk);

                self.foe_read = Some((name, offset + chunk.len()));

                Some(response)
            }

            _ => None,
        }
    }

    /// Frame and store an outgoing mail.
    fn post_mail(&mut self, mailbox_type: u8, payload: &[u8]) {
        let mut mail = Vec::with_capacity(6 + payload.len());

        mail.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        mail.extend_from_slice(&self.station_address().to_le_bytes());
        mail.push(0x00);
        mail.push(mailbox_type);
        mail.extend_from_slice(payload);

        self.tx_mail = Some(mail);
    }

    /// Emulate the CoE SDO server.
    fn coe_request(&mut self, payload: &[u8]) -> Vec<u8> {
        let service = payload[1] >> 4;

        // SDO information service: serve the dictionary
        if service == 0x08 {
            return self.sdo_info_request(payload);
        }

        let command = payload[2] >> 5;
        let index = u16::from_le_bytes([payload[3], payload[4]]);
        let subindex = payload[5];

        match command {
            // Initiate upload
            0x02 => match self.objects.get(&(index, subindex)).cloned() {
                Some(value) if value.len() <= 4 => {
                    let mut response = vec![0u8; 10];

                    response[1] = 0x30; // SDO response
                    response[2] = 0x43 | ((4 - value.len() as u8) << 2);
                    response[3..5].copy_from_slice(&index.to_le_bytes());
                    response[5] = subindex;
                    response[6..6 + value.len()].copy_from_slice(&value);

                    response
                }
                Some(value) => {
                    // Normal response announcing the size; data follows in segments
                    self.upload_rest = value.clone();
                    self.upload_toggle = false;

                    let mut response = vec![0u8; 10];

                    response[1] = 0x30;
                    response[2] = 0x41; // Upload response, size indicated
                    response[3..5].copy_from_slice(&index.to_le_bytes());
                    response[5] = subindex;
                    response[6..10].copy_from_slice(&(value.len() as u32).to_le_bytes());

                    response
                }
                None => self.abort(index, subindex, 0x0602_0000),
            },

            // Upload segment
            0x03 => {
                let toggle = payload[2] & 0x10 != 0;

                if toggle != self.upload_toggle {
                    return self.abort(0, 0, 0x0503_0000);
                }

                self.upload_toggle = !self.upload_toggle;

                let chunk_len = self.upload_rest.len().min(7);
                let chunk: Vec<u8> = self.upload_rest.drain(0..chunk_len).collect();
                let is_last = self.upload_rest.is_empty();

                let mut response = vec![0u8; 3 + chunk.len().max(7)];

                response[1] = 0x30;
                response[2] = (is_last as u8)
                    | ((7 - chunk.len().min(7) as u8) << 1)
                    | ((toggle as u8) << 4);
                response[3..3 + chunk.len()].copy_from_slice(&chunk);

                response
            }

            // Initiate download
            0x01 => {
                let expedited = payload[2] & 0x02 != 0;

                if expedited {
                    let empty = usize::from((payload[2] >> 2) & 0x03);
                    let value = payload[6..10 - empty].to_vec();

                    self.objects.insert((index, subindex), value);
                } else {
                    // Segmented downloads land as zero-length placeholders; the tests only use
                    // expedited downloads against the emulated dictionary
                    self.objects.insert((index, subindex), Vec::new());
                }

                let mut response = vec![0u8; 10];

                response[1] = 0x30;
                response[2] = 0x60; // Download response
                response[3..5].copy_from_slice(&index.to_le_bytes());
                response[5] = subindex;

                response
            }

            _ => self.abort(index, subindex, 0x0504_0001),
        }
    }

    fn abort(&self, index: u16, subindex: u8, code: u32) -> Vec<u8> {
        let mut response = vec![0u8; 10];

        response[1] = 0x30;
        response[2] = 0x80;
        response[3..5].copy_from_slice(&index.to_le_bytes());
        response[5] = subindex;
        response[6..10].copy_from_slice(&code.to_le_bytes());

        response
    }

    fn sdo_info_request(&mut self, payload: &[u8]) -> Vec<u8> {
        let op = payload[2] & 0x7f;

        match op {
            // Get OD list
            0x01 => {
                let mut response = vec![0u8; 8];

                response[1] = 0x80;
                response[2] = 0x02;
                response[6..8].copy_from_slice(&0x0001u16.to_le_bytes());

                let indices: Vec<u16> = {
                    let mut indices: Vec<u16> =
                        self.objects.keys().map(|&(index, _)| index).collect();

                    indices.dedup();

                    indices
                };

                for index in indices {
                    response.extend_from_slice(&index.to_le_bytes());
                }

                response
            }

            // Get object description
            0x03 => {
                let index = u16::from_le_bytes([payload[6], payload[7]]);

                let max_subindex = self
                    .objects
                    .keys()
                    .filter(|&&(object, _)| object == index)
                    .map(|&(_, subindex)| subindex)
                    .max()
                    .unwrap_or(0);

                let mut response = vec![0u8; 6];

                response[1] = 0x80;
                response[2] = 0x04;

                response.extend_from_slice(&index.to_le_bytes());
                response.extend_from_slice(&0x0007u16.to_le_bytes()); // Data type
                response.push(max_subindex);
                response.push(0x07); // Object code: variable
                response.extend_from_slice(b"Obj");

                response
            }

            // Get entry description
            0x05 => {
                let index = u16::from_le_bytes([payload[6], payload[7]]);
                let subindex = payload[8];

                let Some(value) = self.objects.get(&(index, subindex)) else {
                    let mut response = vec![0u8; 10];

                    response[1] = 0x80;
                    response[2] = 0x07;
                    response[6..10].copy_from_slice(&0x0602_0000u32.to_le_bytes());

                    return response;
                };

                let mut response = vec![0u8; 6];

                response[1] = 0x80;
                response[2] = 0x06;

                response.extend_from_slice(&index.to_le_bytes());
                response.push(subindex);
                response.push(0x00); // Value info
                response.extend_from_slice(&0x0007u16.to_le_bytes()); // Data type
                response.extend_from_slice(&((value.len() * 8) as u16).to_le_bytes());
                response.extend_from_slice(&0x0007u16.to_le_bytes()); // Access
                response.extend_from_slice(b"Entry");

                response
            }

            _ => {
                let mut response = vec![0u8; 10];

                response[1] = 0x80;
                response[2] = 0x07;
                response[6..10].copy_from_slice(&0x0504_0001u32.to_le_bytes());

                response
            }
        }
    }

    /// Contribution of this slave to an LRW datagram. Returns the working counter increment.
    fn logical_read_write(&mut self, logical: u32, data: &mut [u8]) -> u16 {
        let mut wkc = 0u16;

        for fmmu_index in 0..16u16 {
            let base = 0x0600 + fmmu_index * 0x10;
            let entity = self.read_regs(base, 16);

            let enabled = entity[12] & 0x01 != 0;

            if !enabled {
                continue;
            }

            let fmmu_logical = u32::from_le_bytes([entity[0], entity[1], entity[2], entity[3]]);
            let length = usize::from(u16::from_le_bytes([entity[4], entity[5]]));
            let read = entity[11] & 0x01 != 0;
            let write = entity[11] & 0x02 != 0;

            let datagram_start = logical as usize;
            let datagram_end = datagram_start + data.len();
            let fmmu_start = fmmu_logical as usize;
            let fmmu_end = fmmu_start + length;

            let overlap_start = datagram_start.max(fmmu_start);
            let overlap_end = datagram_end.min(fmmu_end);

            if overlap_start >= overlap_end {
                continue;
            }

            let span = overlap_end - overlap_start;

            if read {
                self.inputs.resize(self.inputs.len().max(length), 0);

                let src = &self.inputs[overlap_start - fmmu_start..overlap_start - fmmu_start + span];

                data[overlap_start - datagram_start..overlap_start - datagram_start + span]
                    .copy_from_slice(src);

                wkc += 1;
            }

            if write {
                self.outputs.resize(self.outputs.len().max(length), 0);

                let dst =
                    &mut self.outputs[overlap_start - fmmu_start..overlap_start - fmmu_start + span];

                dst.copy_from_slice(
                    &data[overlap_start - datagram_start..overlap_start - datagram_start + span],
                );

                wkc += 2;
            }
        }

        wkc
    }
}

/// The emulated ring.
pub struct SimBus {
    pub slaves: Vec<SimSlave>,
    rx: VecDeque<Vec<u8>>,
    pub tx_log: Vec<Vec<u8>>,
}

impl SimBus {
    pub fn new(slaves: Vec<SimSlave>) -> Self {
        Self {
            slaves,
            rx: VecDeque::new(),
            tx_log: Vec::new(),
        }
    }

    /// Process every datagram of one transmitted frame, producing the response frame.
    fn process_frame(&mut self, frame: &[u8]) -> Vec<u8> {
        let mut response = frame.to_vec();

        // The first slave sets the locally administered bit of the source MAC
        response[6] |= 0x02;

        let payload_len = usize::from(u16::from_le_bytes([frame[14], frame[15]]) & 0x07ff);
        let mut offset = 16;
        let end = 16 + payload_len;

        while offset + 12 <= end {
            let command = response[offset];
            let address = [
                response[offset + 2],
                response[offset + 3],
                response[offset + 4],
                response[offset + 5],
            ];
            let len = usize::from(
                u16::from_le_bytes([response[offset + 6], response[offset + 7]]) & 0x07ff,
            );

            let data_start = offset + 10;
            let data_end = data_start + len;
            let mut wkc = 0u16;

            match command {
                // APRD/APWR: the slave seeing position zero executes; each slave increments
                0x01 | 0x02 => {
                    let position = u16::from_le_bytes([address[0], address[1]]);
                    let register = u16::from_le_bytes([address[2], address[3]]);
                    let target = 0u16.wrapping_sub(position);

                    if let Some(slave) = self.slaves.get_mut(usize::from(target)) {
                        if command == 0x01 {
                            let data = slave.physical_read(register, len);

                            response[data_start..data_end].copy_from_slice(&data);
                        } else {
                            let data = response[data_start..data_end].to_vec();

                            slave.physical_write(register, &data);
                        }

                        wkc = 1;
                    }
                }

                // NPRD/NPWR
                0x04 | 0x05 => {
                    let station = u16::from_le_bytes([address[0], address[1]]);
                    let register = u16::from_le_bytes([address[2], address[3]]);

                    for slave in &mut self.slaves {
                        if slave.station_address() != station {
                            continue;
                        }

                        if command == 0x04 {
                            let data = slave.physical_read(register, len);

                            response[data_start..data_end].copy_from_slice(&data);
                        } else {
                            let data = response[data_start..data_end].to_vec();

                            slave.physical_write(register, &data);
                        }

                        wkc += 1;
                    }
                }

                // BRD: OR together all slaves' bytes
                0x07 => {
                    let register = u16::from_le_bytes([address[2], address[3]]);

                    for slave in &mut self.slaves {
                        let data = slave.physical_read(register, len);

                        for (position, byte) in data.iter().enumerate() {
                            response[data_start + position] |= byte;
                        }

                        wkc += 1;
                    }
                }

                // BWR
                0x08 => {
                    let register = u16::from_le_bytes([address[2], address[3]]);
                    let data = response[data_start..data_end].to_vec();

                    for slave in &mut self.slaves {
                        slave.physical_write(register, &data);

                        wkc += 1;
                    }
                }

                // LRW
                0x0c => {
                    let logical = u32::from_le_bytes(address);
                    let mut data = response[data_start..data_end].to_vec();

                    for slave in &mut self.slaves {
                        wkc += slave.logical_read_write(logical, &mut data);
                    }

                    response[data_start..data_end].copy_from_slice(&data);
                }

                _ => (),
            }

            response[data_end..data_end + 2].copy_from_slice(&wkc.to_le_bytes());

            offset = data_end + 2;
        }

        response
    }
}

impl EthernetPort for SimBus {
    fn link_state(&self) -> LinkState {
        LinkState::Up
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), ()> {
        self.tx_log.push(frame.to_vec());

        let response = self.process_frame(frame);

        self.rx.push_back(response);

        Ok(())
    }

    fn poll(&mut self, handler: &mut dyn FnMut(&[u8])) {
        while let Some(frame) = self.rx.pop_front() {
            handler(&frame);
        }
    }
}
