//! SII category records: strings, general info, sync managers and PDO descriptions.

use super::{SiiImage, word};
use crate::error::{Error, Item, SiiError};
use crate::sync_manager_channel::Control;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized};

/// Category record types, ETG1000.6 Table 19.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u16)]
pub enum CategoryType {
    /// Padding, no content.
    Nop = 0,
    /// String table.
    Strings = 10,
    /// Data type definitions.
    DataTypes = 20,
    /// General device information.
    General = 30,
    /// FMMU usage hints.
    Fmmu = 40,
    /// Sync manager descriptors.
    SyncManager = 41,
    /// Extended FMMU descriptions.
    FmmuExtended = 42,
    /// Sync unit descriptions.
    SyncUnit = 43,
    /// TxPDO (slave to master) descriptions.
    TxPdo = 50,
    /// RxPDO (master to slave) descriptions.
    RxPdo = 51,
    /// Distributed clock descriptions.
    DistributedClock = 60,
    /// End of category chain.
    End = 0xffff,
    /// Vendor specific or unknown category.
    #[wire(catch_all)]
    Other(u16) = 1,
}

bitflags::bitflags! {
    /// Mailbox protocols supported by a slave, from SII word `0x001C`.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct MailboxProtocols: u16 {
        /// ADS over EtherCAT.
        const AOE = 0x0001;
        /// Ethernet over EtherCAT.
        const EOE = 0x0002;
        /// CANopen over EtherCAT.
        const COE = 0x0004;
        /// File access over EtherCAT.
        const FOE = 0x0008;
        /// Servo profile over EtherCAT.
        const SOE = 0x0010;
        /// Vendor specific protocol.
        const VOE = 0x0020;
    }
}

bitflags::bitflags! {
    /// CoE feature details from the General category.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct CoeDetails: u8 {
        /// SDO transfers are supported.
        const ENABLE_SDO = 0x01;
        /// SDO information service (dictionary discovery) is supported.
        const ENABLE_SDO_INFO = 0x02;
        /// PDO assignment objects may be written.
        const ENABLE_PDO_ASSIGN = 0x04;
        /// PDO mapping objects may be written.
        const ENABLE_PDO_CONFIG = 0x08;
        /// Startup upload of configuration is requested.
        const ENABLE_STARTUP_UPLOAD = 0x10;
        /// SDO complete access is supported.
        const ENABLE_SDO_COMPLETE = 0x20;
    }
}

bitflags::bitflags! {
    /// General category flags.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct GeneralFlags: u8 {
        /// Slave supports `SAFE-OP`.
        const ENABLE_SAFE_OP = 0x01;
        /// Slave must not be addressed with `LRW`.
        const ENABLE_NOT_LRW = 0x02;
        /// Mailbox data link layer supported.
        const MAILBOX_DLL = 0x04;
        /// Identification via AL status code.
        const IDENT_AL_STATUS = 0x08;
    }
}

/// SII "General" category, ETG1000.6 Table 21.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct General {
    /// String index of the device group.
    pub group_string_idx: u8,
    /// String index of the device image name.
    pub image_string_idx: u8,
    /// String index of the order number.
    pub order_string_idx: u8,
    /// String index of the device name.
    pub name_string_idx: u8,
    /// CoE feature details.
    pub coe_details: CoeDetails,
    /// FoE is supported.
    pub foe_enabled: bool,
    /// EoE is supported.
    pub eoe_enabled: bool,
    /// Category flags.
    pub flags: GeneralFlags,
    /// E-bus current consumption in mA; negative values feed current into the bus.
    pub ebus_current: i16,
}

impl General {
    /// Minimum category payload, up to and including the current field.
    const MIN_LEN: usize = 14;

    fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < Self::MIN_LEN {
            return Err(Error::Sii(SiiError::Decode));
        }

        Ok(Self {
            group_string_idx: data[0],
            image_string_idx: data[1],
            order_string_idx: data[2],
            name_string_idx: data[3],
            coe_details: CoeDetails::from_bits_truncate(data[5]),
            foe_enabled: data[6] != 0,
            eoe_enabled: data[7] != 0,
            flags: GeneralFlags::from_bits_truncate(data[11]),
            ebus_current: i16::from_le_bytes([data[12], data[13]]),
        })
    }
}

/// Intended use of a sync manager, from the SII SyncManager category.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum SmUsage {
    /// Not used or unknown.
    #[default]
    Unused = 0x00,
    /// Mailbox written by the master (receive mailbox).
    MailboxOut = 0x01,
    /// Mailbox written by the slave (send mailbox).
    MailboxIn = 0x02,
    /// Process data written by the master (outputs).
    ProcessOut = 0x03,
    /// Process data written by the slave (inputs).
    ProcessIn = 0x04,
    /// A usage value outside the ETG set.
    #[wire(catch_all)]
    Other(u8),
}

/// One sync manager descriptor from the SyncManager category, ETG1000.6 Table 22.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 8)]
pub struct SyncManagerDesc {
    /// Physical start address.
    #[wire(bytes = 2)]
    pub start: u16,
    /// Window length in bytes.
    #[wire(bytes = 2)]
    pub length: u16,
    /// Initial value of the channel control byte.
    #[wire(bytes = 1)]
    pub control: Control,
    /// Status byte, unused in the SII.
    #[wire(bytes = 1)]
    pub status: u8,
    /// Enable flags; bit 0 activates the channel.
    #[wire(bytes = 1)]
    pub enable: u8,
    /// Intended use of this channel.
    #[wire(bytes = 1)]
    pub usage: SmUsage,
}

impl SyncManagerDesc {
    /// Whether the channel should be activated during configuration.
    pub fn enabled(&self) -> bool {
        self.enable & 0x01 != 0
    }
}

/// FMMU usage hint from the FMMU category, ETG1000.6 Table 23.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum FmmuUsage {
    /// Not used.
    #[default]
    #[wire(alternatives = [0xff])]
    Unused = 0x00,
    /// Maps outputs.
    Outputs = 0x01,
    /// Maps inputs.
    Inputs = 0x02,
    /// Maps the sync manager status bytes.
    SyncManagerStatus = 0x03,
    /// A usage value outside the ETG set.
    #[wire(catch_all)]
    Other(u8),
}

/// PDO descriptor header inside a TxPDO/RxPDO category, ETG1000.6 Table 24.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 8)]
pub struct PdoDesc {
    /// PDO index, `0x1600`–`0x17ff` for RxPDO, `0x1a00`–`0x1bff` for TxPDO.
    #[wire(bytes = 2)]
    pub index: u16,
    /// Number of entry records following this header.
    #[wire(bytes = 1)]
    pub num_entries: u8,
    /// Index of the sync manager this PDO is exchanged through.
    #[wire(bytes = 1)]
    pub sync_manager: u8,
    /// Index of the DC sync unit.
    #[wire(bytes = 1)]
    pub dc_sync: u8,
    /// String index of the PDO name.
    #[wire(bytes = 1)]
    pub name_string_idx: u8,
    /// Flags, ETG2010 Table 14.
    #[wire(bytes = 2)]
    pub flags: u16,
}

/// One PDO entry record, ETG1000.6 Table 25.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 8)]
pub struct PdoEntryDesc {
    /// Object index, or zero for padding entries.
    #[wire(bytes = 2)]
    pub index: u16,
    /// Object subindex.
    #[wire(bytes = 1)]
    pub subindex: u8,
    /// String index of the entry name.
    #[wire(bytes = 1)]
    pub name_string_idx: u8,
    /// CoE base data type of the entry.
    #[wire(bytes = 1)]
    pub data_type: u8,
    /// Entry size in bits.
    #[wire(bytes = 1)]
    pub bit_length: u8,
    /// Reserved flags.
    #[wire(bytes = 2)]
    pub flags: u16,
}

/// A PDO with its entries as described by the SII.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PdoRecord {
    /// Descriptor header.
    pub desc: PdoDesc,
    /// Entry records in mapping order.
    pub entries: Vec<PdoEntryDesc>,
}

/// The parsed category data of one slave.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Categories {
    /// 1-indexed string table.
    pub strings: Vec<String>,
    /// General device information, if present.
    pub general: Option<General>,
    /// Sync manager descriptors in channel order. ETG1000.4 allows at most 16 channels.
    pub sync_managers: heapless::Vec<SyncManagerDesc, 16>,
    /// Per-FMMU usage hints, at most one per FMMU entity.
    pub fmmu_usage: heapless::Vec<FmmuUsage, 16>,
    /// TxPDOs (inputs, read by the master).
    pub tx_pdos: Vec<PdoRecord>,
    /// RxPDOs (outputs, written by the master).
    pub rx_pdos: Vec<PdoRecord>,
}

/// Placeholder returned for string indices that cannot be resolved.
pub const UNRESOLVED_STRING: &str = "(unresolved)";

impl Categories {
    /// Resolve a 1-based SII string index.
    ///
    /// Index 0 denotes "no string" and resolves to an empty string; an index past the end of the
    /// table resolves to [`UNRESOLVED_STRING`] rather than being dropped.
    pub fn string(&self, index: u8) -> &str {
        if index == 0 {
            return "";
        }

        self.strings
            .get(usize::from(index) - 1)
            .map(String::as_str)
            .unwrap_or(UNRESOLVED_STRING)
    }

    /// The device name from the General category.
    pub fn name(&self) -> &str {
        self.general
            .map(|general| self.string(general.name_string_idx))
            .unwrap_or("")
    }
}

/// Walk the category chain of a complete SII image.
///
/// Unknown category types are skipped with a warning. The walk ends at the `0xffff` end marker
/// or at the end of the image, whichever comes first.
pub fn parse(image: &SiiImage) -> Result<Categories, Error> {
    let mut categories = Categories::default();

    let mut word_addr = word::FIRST_CATEGORY;

    loop {
        let Some(category_type) = image.word(word_addr) else {
            break;
        };

        let category_type = CategoryType::try_from(category_type).unwrap_or(CategoryType::End);

        if category_type == CategoryType::End {
            break;
        }

        let Some(len_words) = image.word(word_addr + 1) else {
            break;
        };

        let start = usize::from(word_addr + 2) * 2;
        let end = start + usize::from(len_words) * 2;

        let data = image
            .as_bytes()
            .get(start..end)
            .ok_or(Error::Sii(SiiError::SectionOverrun))?;

        match category_type {
            CategoryType::Strings => categories.strings = parse_strings(data),
            CategoryType::General => categories.general = Some(General::parse(data)?),
            CategoryType::SyncManager => {
                for chunk in data.chunks_exact(SyncManagerDesc::PACKED_LEN) {
                    categories
                        .sync_managers
                        .push(SyncManagerDesc::unpack_from_slice(chunk)?)
                        .map_err(|_| Error::Capacity(Item::SyncManager))?;
                }
            }
            CategoryType::Fmmu => {
                for &raw in data {
                    categories
                        .fmmu_usage
                        .push(FmmuUsage::try_from(raw).unwrap_or(FmmuUsage::Other(raw)))
                        .map_err(|_| Error::Capacity(Item::Fmmu))?;
                }
            }
            CategoryType::TxPdo => categories.tx_pdos.extend(parse_pdos(data)?),
            CategoryType::RxPdo => categories.rx_pdos.extend(parse_pdos(data)?),
            CategoryType::Nop | CategoryType::DataTypes | CategoryType::End => (),
            other => {
                log::warn!("Skipping unknown SII category {:?} ({} words)", other, len_words);
            }
        }

        word_addr = word_addr + 2 + len_words;
    }

    Ok(categories)
}

/// Parse the Strings category: a count byte followed by length-prefixed strings.
fn parse_strings(data: &[u8]) -> Vec<String> {
    let Some((&count, mut rest)) = data.split_first() else {
        return Vec::new();
    };

    let mut strings = Vec::with_capacity(usize::from(count));

    for _ in 0..count {
        let Some((&len, tail)) = rest.split_first() else {
            break;
        };

        let Some((raw, tail)) = tail.split_at_checked(usize::from(len)) else {
            break;
        };

        // Visible strings are specified as ASCII; real devices occasionally contain other
        // encodings, so replace anything non-ASCII instead of failing the whole scan.
        let string: String = raw
            .iter()
            .filter(|&&byte| byte != 0)
            .map(|&byte| if byte.is_ascii() { byte as char } else { '?' })
            .collect();

        strings.push(string);
        rest = tail;
    }

    strings
}

/// Parse a TxPDO/RxPDO category: PDO headers each followed by their entry records.
fn parse_pdos(mut data: &[u8]) -> Result<Vec<PdoRecord>, Error> {
    let mut pdos = Vec::new();

    while data.len() >= PdoDesc::PACKED_LEN {
        let desc = PdoDesc::unpack_from_slice(data)?;

        data = &data[PdoDesc::PACKED_LEN..];

        let mut entries = Vec::with_capacity(usize::from(desc.num_entries));

        for _ in 0..desc.num_entries {
            if data.len() < PdoEntryDesc::PACKED_LEN {
                return Err(Error::Sii(SiiError::Decode));
            }

            entries.push(PdoEntryDesc::unpack_from_slice(data)?);

            data = &data[PdoEntryDesc::PACKED_LEN..];
        }

        pdos.push(PdoRecord { desc, entries });
    }

    Ok(pdos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_manager_channel::{Direction, OperationMode};

    fn image_with_categories(categories: &[(u16, &[u8])]) -> SiiImage {
        let mut bytes = vec![0u8; usize::from(word::FIRST_CATEGORY) * 2];

        for (category_type, data) in categories {
            assert_eq!(data.len() % 2, 0);

            bytes.extend_from_slice(&category_type.to_le_bytes());
            bytes.extend_from_slice(&((data.len() / 2) as u16).to_le_bytes());
            bytes.extend_from_slice(data);
        }

        bytes.extend_from_slice(&0xffffu16.to_le_bytes());

        SiiImage::from_bytes(bytes)
    }

    #[test]
    fn strings_category() {
        let data = [
            2, // Two strings
            6, b'E', b'K', b'1', b'1', b'0', b'0', // "EK1100"
            7, b'C', b'o', b'u', b'p', b'l', b'e', b'r', // "Coupler"
        ];

        let parsed = parse(&image_with_categories(&[(10, &data)])).unwrap();

        assert_eq!(parsed.strings, vec!["EK1100", "Coupler"]);
        assert_eq!(parsed.string(1), "EK1100");
        assert_eq!(parsed.string(2), "Coupler");
        assert_eq!(parsed.string(0), "");
        assert_eq!(parsed.string(3), UNRESOLVED_STRING);
    }

    #[test]
    fn sync_manager_category() {
        let data = [
            // SM0: 128 byte receive mailbox at 0x1000
            0x00, 0x10, 0x80, 0x00, 0x26, 0x00, 0x01, 0x01, //
            // SM1: 128 byte send mailbox at 0x1080
            0x80, 0x10, 0x80, 0x00, 0x22, 0x00, 0x01, 0x02,
        ];

        let parsed = parse(&image_with_categories(&[(41, &data)])).unwrap();

        assert_eq!(parsed.sync_managers.len(), 2);

        let sm0 = parsed.sync_managers[0];

        assert_eq!(sm0.start, 0x1000);
        assert_eq!(sm0.length, 0x0080);
        assert_eq!(sm0.control.mode, OperationMode::Mailbox);
        assert_eq!(sm0.control.direction, Direction::MasterWrite);
        assert_eq!(sm0.usage, SmUsage::MailboxOut);
        assert!(sm0.enabled());

        assert_eq!(parsed.sync_managers[1].usage, SmUsage::MailboxIn);
        assert_eq!(
            parsed.sync_managers[1].control.direction,
            Direction::MasterRead
        );
    }

    #[test]
    fn pdo_category_with_entries() {
        let data = [
            // TxPDO 0x1a00, 2 entries, SM3
            0x00, 0x1a, 0x02, 0x03, 0x00, 0x05, 0x00, 0x00, //
            // Entry 0x6000:01, 1 bit
            0x00, 0x60, 0x01, 0x06, 0x01, 0x01, 0x00, 0x00, //
            // Entry padding, 7 bits
            0x00, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00,
        ];

        let parsed = parse(&image_with_categories(&[(50, &data)])).unwrap();

        assert_eq!(parsed.tx_pdos.len(), 1);

        let pdo = &parsed.tx_pdos[0];

        assert_eq!(pdo.desc.index, 0x1a00);
        assert_eq!(pdo.desc.sync_manager, 3);
        assert_eq!(pdo.entries.len(), 2);
        assert_eq!(pdo.entries[0].index, 0x6000);
        assert_eq!(pdo.entries[0].bit_length, 1);
        assert_eq!(pdo.entries[1].index, 0x0000);
        assert_eq!(pdo.entries[1].bit_length, 7);
    }

    #[test]
    fn general_category() {
        let mut data = [0u8; 18];

        data[0] = 2; // Group string
        data[2] = 1; // Order string
        data[3] = 4; // Name string
        data[5] = 0x0d; // SDO + PDO assign + PDO config
        data[6] = 1; // FoE
        data[11] = 0x05; // SAFE-OP + mailbox DLL
        data[12..14].copy_from_slice(&(-2000i16).to_le_bytes());

        let parsed = parse(&image_with_categories(&[(30, &data)])).unwrap();

        let general = parsed.general.unwrap();

        assert_eq!(general.name_string_idx, 4);
        assert_eq!(
            general.coe_details,
            CoeDetails::ENABLE_SDO | CoeDetails::ENABLE_PDO_ASSIGN | CoeDetails::ENABLE_PDO_CONFIG
        );
        assert!(general.foe_enabled);
        assert!(!general.eoe_enabled);
        assert_eq!(
            general.flags,
            GeneralFlags::ENABLE_SAFE_OP | GeneralFlags::MAILBOX_DLL
        );
        assert_eq!(general.ebus_current, -2000);
    }

    #[test]
    fn unknown_category_is_skipped() {
        let strings = [1, 4, b'T', b'e', b's', b't', 0, 0]; // Padded to even length

        let parsed = parse(&image_with_categories(&[
            (0x0800, &[0xaa, 0xbb]), // Vendor specific
            (10, &strings),
        ]))
        .unwrap();

        assert_eq!(parsed.strings, vec!["Test"]);
    }

    #[test]
    fn fmmu_category() {
        let parsed = parse(&image_with_categories(&[(40, &[0x01, 0x02, 0x03, 0xff])])).unwrap();

        assert_eq!(
            parsed.fmmu_usage.as_slice(),
            &[
                FmmuUsage::Outputs,
                FmmuUsage::Inputs,
                FmmuUsage::SyncManagerStatus,
                FmmuUsage::Unused
            ]
        );
    }
}
