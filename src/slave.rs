//! The master's view of one slave device on the ring.

use crate::mailbox::MailboxRegion;
use crate::pdo::{Pdo, PdoDirection, PdoEntry};
use crate::sii::SiiImage;
use crate::sii::categories::{Categories, MailboxProtocols};
use crate::slave_config::SlaveConfigHandle;
use crate::slave_state::AlState;

/// Slave identity as stored in SII words `0x0008`–`0x000F`.
#[derive(Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireRead)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[wire(bytes = 16)]
pub struct SlaveIdentity {
    /// Vendor id.
    #[wire(bytes = 4)]
    pub vendor_id: u32,
    /// Product code.
    #[wire(bytes = 4)]
    pub product_code: u32,
    /// Revision number.
    #[wire(bytes = 4)]
    pub revision: u32,
    /// Serial number.
    #[wire(bytes = 4)]
    pub serial: u32,
}

impl core::fmt::Debug for SlaveIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlaveIdentity")
            .field("vendor_id", &format_args!("{:#010x}", self.vendor_id))
            .field("product_code", &format_args!("{:#010x}", self.product_code))
            .field("revision", &self.revision)
            .field("serial", &self.serial)
            .finish()
    }
}

impl core::fmt::Display for SlaveIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "vendor {:#010x}, product {:#010x}, rev {}, serial {}",
            self.vendor_id, self.product_code, self.revision, self.serial
        )
    }
}

/// EtherCAT feature support register `0x0008`, ETG1000.4 Table 33.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct SupportFlags {
    /// FMMUs support bit granular mappings.
    #[wire(bits = 1, pre_skip = 2)]
    pub dc_supported: bool,
    /// Distributed clock timestamps are 64 bit wide.
    #[wire(bits = 1, post_skip = 5)]
    pub dc_64bit: bool,
    /// LRW commands are supported.
    #[wire(bits = 1, post_skip = 6)]
    pub lrw_supported: bool,
}

/// Base registers `0x0000`–`0x0009`: type, revision, build and resource counts.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireRead)]
#[wire(bytes = 10)]
pub struct BaseInfo {
    /// Base type.
    #[wire(bytes = 1)]
    pub base_type: u8,
    /// EtherCAT revision.
    #[wire(bytes = 1)]
    pub revision: u8,
    /// Build number.
    #[wire(bytes = 2)]
    pub build: u16,
    /// Number of supported FMMU entities.
    #[wire(bytes = 1)]
    pub fmmu_count: u8,
    /// Number of supported sync manager channels.
    #[wire(bytes = 1)]
    pub sync_count: u8,
    /// RAM size in KiB.
    #[wire(bytes = 1)]
    pub ram_size: u8,
    /// Port descriptors.
    #[wire(bytes = 1)]
    pub ports: u8,
    /// Feature support flags.
    #[wire(bytes = 2)]
    pub support: SupportFlags,
}

/// Maximum number of FMMU entities the master will program.
pub const MAX_FMMUS: u8 = 16;

/// Maximum number of sync manager channels the master will program.
pub const MAX_SYNC_MANAGERS: u8 = 16;

/// One entry of a dictionary object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoEntryInfo {
    /// Subindex.
    pub subindex: u8,
    /// CoE data type index.
    pub data_type: u16,
    /// Size in bits.
    pub bit_length: u16,
    /// Access rights bitmask as reported by the slave.
    pub access: u16,
    /// Entry description.
    pub name: String,
}

/// One object of the slave's SDO dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoInfo {
    /// Object index.
    pub index: u16,
    /// Object code (variable, array, record).
    pub object_code: u8,
    /// Highest subindex.
    pub max_subindex: u8,
    /// Object name.
    pub name: String,
    /// Described entries.
    pub entries: Vec<SdoEntryInfo>,
}

/// The master's model of one physical slave.
///
/// Populated by the scan FSM from the base registers and the SII image; the configuration FSM
/// then drives `current_state` towards `requested_state` and maintains the bookkeeping flags.
#[derive(Debug, Default)]
pub struct Slave {
    /// 0-based position along the physical ring.
    pub(crate) ring_position: u16,
    /// Configured station address, `ring_position + 1`.
    pub(crate) station_address: u16,
    /// Base register contents.
    pub(crate) base: BaseInfo,
    /// Identity from the SII.
    pub(crate) identity: SlaveIdentity,
    /// Station alias from the SII.
    pub(crate) alias: u16,
    /// Raw SII image.
    pub(crate) sii: SiiImage,
    /// Parsed SII categories.
    pub(crate) categories: Categories,
    /// Mailbox protocols from SII word `0x001C`.
    pub(crate) mailbox_protocols: MailboxProtocols,
    /// Receive mailbox (master to slave), SM0.
    pub(crate) rx_mailbox: MailboxRegion,
    /// Send mailbox (slave to master), SM1.
    pub(crate) tx_mailbox: MailboxRegion,
    /// Resolved runtime PDOs, from the SII and optionally refined over CoE.
    pub(crate) pdos: Vec<Pdo>,
    /// SDO dictionary, filled once by the dictionary fetch.
    pub(crate) sdo_dictionary: Vec<SdoInfo>,
    /// The dictionary fetch has run for this slave.
    pub(crate) dictionary_fetched: bool,
    /// Mailbox sequence counter, advanced per outgoing mail.
    pub(crate) mailbox_counter: u8,
    /// Last read application layer state.
    pub(crate) current_state: AlState,
    /// The AL status error flag was set at the last read.
    pub(crate) error_ack_pending: bool,
    /// State the master wants this slave in.
    pub(crate) requested_state: AlState,
    /// A sub-FSM failed on this slave; it is skipped until the error is cleared.
    pub(crate) error_flag: bool,
    /// AL status code captured at the last refused transition.
    pub(crate) last_al_status_code: Option<crate::al_status_code::AlStatusCode>,
    /// The slave answered its last addressed datagram.
    pub(crate) online: bool,
    /// The configuration FSM has completed for this slave.
    pub(crate) self_configured: bool,
    /// Attached slave config, if any.
    pub(crate) config: Option<SlaveConfigHandle>,
    /// Timestamp of the PREOP transition, for the dictionary fetch delay.
    pub(crate) preop_at: u64,
}

impl Slave {
    /// A freshly discovered slave at a ring position.
    pub(crate) fn new(ring_position: u16) -> Self {
        Self {
            ring_position,
            station_address: ring_position + 1,
            requested_state: AlState::Init,
            online: true,
            ..Self::default()
        }
    }

    /// 0-based ring position.
    pub fn ring_position(&self) -> u16 {
        self.ring_position
    }

    /// Configured station address.
    pub fn station_address(&self) -> u16 {
        self.station_address
    }

    /// Identity from the SII.
    pub fn identity(&self) -> SlaveIdentity {
        self.identity
    }

    /// Station alias from the SII.
    pub fn alias(&self) -> u16 {
        self.alias
    }

    /// Device name from the SII General category.
    pub fn name(&self) -> &str {
        self.categories.name()
    }

    /// Last read application layer state.
    pub fn state(&self) -> AlState {
        self.current_state
    }

    /// Whether the slave responded to its last status poll.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Whether a sub-FSM failure is latched for this slave.
    pub fn has_error(&self) -> bool {
        self.error_flag
    }

    /// Supported mailbox protocols.
    pub fn mailbox_protocols(&self) -> MailboxProtocols {
        self.mailbox_protocols
    }

    /// Whether the slave has usable mailboxes.
    pub fn supports_mailbox(&self) -> bool {
        !self.mailbox_protocols.is_empty()
            && self.rx_mailbox.is_usable()
            && self.tx_mailbox.is_usable()
    }

    /// Whether the slave supports CoE.
    pub fn supports_coe(&self) -> bool {
        self.supports_mailbox() && self.mailbox_protocols.contains(MailboxProtocols::COE)
    }

    /// Whether the slave supports FoE.
    pub fn supports_foe(&self) -> bool {
        self.supports_mailbox() && self.mailbox_protocols.contains(MailboxProtocols::FOE)
    }

    /// Resolved PDOs.
    pub fn pdos(&self) -> &[Pdo] {
        &self.pdos
    }

    /// The fetched SDO dictionary, empty until dictionary discovery has run.
    pub fn sdo_dictionary(&self) -> &[SdoInfo] {
        &self.sdo_dictionary
    }

    /// Find a PDO entry by object address, together with its containing PDO.
    pub fn find_pdo_entry(&self, index: u16, subindex: u8) -> Option<(&Pdo, &PdoEntry)> {
        self.pdos.iter().find_map(|pdo| {
            pdo.find_entry(index, subindex).map(|entry| (pdo, entry))
        })
    }

    /// Bit offset of an entry within the process data of its sync manager.
    ///
    /// PDOs assigned to the same sync manager are laid out in assignment order, entries in
    /// mapping order.
    pub(crate) fn pdo_entry_bit_offset(&self, index: u16, subindex: u8) -> Option<(u8, PdoDirection, u32)> {
        let (target_pdo, _) = self.find_pdo_entry(index, subindex)?;

        let mut offset = 0u32;

        for pdo in self
            .pdos
            .iter()
            .filter(|pdo| pdo.sync_index == target_pdo.sync_index)
        {
            for entry in &pdo.entries {
                if pdo.index == target_pdo.index && entry.index == index && entry.subindex == subindex
                {
                    return Some((pdo.sync_index, pdo.direction, offset));
                }

                offset += u32::from(entry.bit_length);
            }
        }

        None
    }

    /// Total process data size in bits for one sync manager.
    pub(crate) fn sync_manager_bit_length(&self, sync_index: u8) -> u32 {
        self.pdos
            .iter()
            .filter(|pdo| pdo.sync_index == sync_index)
            .map(|pdo| u32::from(pdo.bit_length()))
            .sum()
    }

    /// Rebuild the runtime PDO list from the parsed SII categories.
    pub(crate) fn resolve_sii_pdos(&mut self) {
        self.pdos.clear();

        for record in &self.categories.tx_pdos {
            self.pdos
                .push(Pdo::from_sii(record, PdoDirection::Input, &self.categories));
        }

        for record in &self.categories.rx_pdos {
            self.pdos
                .push(Pdo::from_sii(record, PdoDirection::Output, &self.categories));
        }
    }

    /// Mark the slave offline and forget its known state.
    pub(crate) fn set_offline(&mut self) {
        if self.online {
            log::warn!("Slave {} is offline", self.ring_position);
        }

        self.online = false;
        self.current_state = AlState::Unknown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::EtherCrabWireRead;

    #[test]
    fn base_info_decode() {
        let raw = [
            0x11, // Type
            0x02, // Revision
            0x03, 0x00, // Build
            0x08, // FMMU count
            0x08, // SM count
            0x01, // RAM size
            0x0f, // Ports
            0x04, 0x00, // Support flags: DC
        ];

        let base = BaseInfo::unpack_from_slice(&raw).unwrap();

        assert_eq!(base.fmmu_count, 8);
        assert_eq!(base.sync_count, 8);
        assert!(base.support.dc_supported);
        assert!(!base.support.dc_64bit);
    }

    #[test]
    fn identity_decode() {
        let raw = [
            0x02, 0x00, 0x00, 0x00, // Vendor
            0x52, 0x30, 0xec, 0x03, // Product
            0x01, 0x00, 0x10, 0x00, // Revision
            0xaa, 0xbb, 0xcc, 0xdd, // Serial
        ];

        let identity = SlaveIdentity::unpack_from_slice(&raw).unwrap();

        assert_eq!(identity.vendor_id, 0x0000_0002);
        assert_eq!(identity.product_code, 0x03ec_3052);
    }

    #[test]
    fn station_address_follows_ring_position() {
        let slave = Slave::new(3);

        assert_eq!(slave.station_address(), 4);
    }

    #[test]
    fn pdo_entry_bit_offsets() {
        let mut slave = Slave::new(0);

        slave.pdos = vec![
            Pdo {
                index: 0x1a00,
                sync_index: 3,
                direction: PdoDirection::Input,
                name: String::new(),
                entries: vec![
                    PdoEntry {
                        index: 0x6000,
                        subindex: 1,
                        bit_length: 1,
                        name: String::new(),
                    },
                    PdoEntry::padding(7),
                ],
            },
            Pdo {
                index: 0x1a01,
                sync_index: 3,
                direction: PdoDirection::Input,
                name: String::new(),
                entries: vec![PdoEntry {
                    index: 0x6010,
                    subindex: 1,
                    bit_length: 16,
                    name: String::new(),
                }],
            },
        ];

        assert_eq!(
            slave.pdo_entry_bit_offset(0x6000, 1),
            Some((3, PdoDirection::Input, 0))
        );
        assert_eq!(
            slave.pdo_entry_bit_offset(0x6010, 1),
            Some((3, PdoDirection::Input, 8))
        );
        assert_eq!(slave.pdo_entry_bit_offset(0x7000, 1), None);
        assert_eq!(slave.sync_manager_bit_length(3), 24);
    }
}
