//! Fieldcat error types.

pub use crate::coe::abort::AbortCode;
use crate::al_status_code::AlStatusCode;
use crate::slave_state::AlState;
use core::num::TryFromIntError;

/// Top level fieldcat error.
///
/// Every fallible operation in the crate surfaces one of these. The variants group errors by the
/// layer they originate from; cyclic-path callers will normally only ever observe the working
/// counter state of their domains, while configuration-time callers get the full tree.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Error {
    /// A low level error occurred when producing, sending or matching a datagram.
    Pdu(PduError),
    /// A slave misbehaved or could not be driven to the requested state.
    Slave(SlaveError),
    /// An SII (EEPROM) access failed.
    Sii(SiiError),
    /// A mailbox exchange failed below the protocol layer.
    Mailbox(MailboxError),
    /// A CoE (CANopen over EtherCAT) transfer failed.
    Coe(CoeError),
    /// An FoE (File over EtherCAT) transfer failed.
    Foe(FoeError),
    /// The requested configuration is invalid or conflicts with an existing one.
    Config(ConfigError),
    /// An item could not be encoded to or decoded from its wire representation.
    Wire(ethercrab_wire::WireError),
    /// An item in a list could not be found.
    NotFound {
        /// Item kind.
        item: Item,
        /// An index into a list of items.
        index: Option<usize>,
    },
    /// A fixed size list was not large enough to hold a given item type.
    Capacity(Item),
    /// A buffer could not be allocated or grown.
    OutOfMemory,
    /// The resource is already reserved by another client.
    Busy,
    /// A value could not be converted into a narrower integer type.
    IntegerTypeConversion,
    /// An internal error occurred. This indicates a bug in fieldcat itself.
    Internal,
}

impl std::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Pdu(e) => write!(f, "pdu: {}", e),
            Error::Slave(e) => write!(f, "slave: {}", e),
            Error::Sii(e) => write!(f, "sii: {}", e),
            Error::Mailbox(e) => write!(f, "mailbox: {}", e),
            Error::Coe(e) => write!(f, "coe: {}", e),
            Error::Foe(e) => write!(f, "foe: {}", e),
            Error::Config(e) => write!(f, "config: {}", e),
            Error::Wire(e) => write!(f, "wire encode/decode error: {}", e),
            Error::NotFound { item, index } => {
                write!(f, "item kind {:?} not found (index: {:?})", item, index)
            }
            Error::Capacity(item) => write!(f, "not enough capacity for {:?}", item),
            Error::OutOfMemory => f.write_str("out of memory"),
            Error::Busy => f.write_str("resource is busy"),
            Error::IntegerTypeConversion => f.write_str("failed to convert between integer types"),
            Error::Internal => f.write_str("internal error"),
        }
    }
}

/// The kind of item being looked for or stored.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Item {
    /// An EtherCAT master.
    Master,
    /// An EtherCAT slave device.
    Slave,
    /// A user-declared slave configuration.
    SlaveConfig,
    /// A process data domain.
    Domain,
    /// Fieldbus Memory Management Unit.
    Fmmu,
    /// Sync manager.
    SyncManager,
    /// Process Data Object.
    Pdo,
    /// A PDO entry.
    PdoEntry,
    /// A queued SDO request.
    SdoRequest,
    /// A queued register request.
    RegRequest,
    /// An EtherCAT datagram.
    Datagram,
    /// An SII string.
    String,
}

/// Low-level datagram/frame transport error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PduError {
    /// The Ethernet link of the device is down.
    LinkDown,
    /// A received frame is shorter than its headers claim.
    FrameTooShort,
    /// A received frame failed validation.
    FrameCorrupt,
    /// No response to a sent datagram arrived within the timeout.
    TimedOut,
    /// A received datagram matched no queued datagram.
    Unmatched,
    /// Datagram payload is too long to fit in the frame buffer.
    TooLong,
    /// The network interface failed to transmit a frame.
    SendFailed,
}

impl core::fmt::Display for PduError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PduError::LinkDown => f.write_str("link is down"),
            PduError::FrameTooShort => f.write_str("frame too short"),
            PduError::FrameCorrupt => f.write_str("frame corrupt"),
            PduError::TimedOut => f.write_str("datagram timed out"),
            PduError::Unmatched => f.write_str("datagram unmatched"),
            PduError::TooLong => f.write_str("data too long to fit in frame"),
            PduError::SendFailed => f.write_str("failed to transmit frame"),
        }
    }
}

/// A slave could not be driven to where the master wanted it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum SlaveError {
    /// The slave did not respond to an addressed datagram.
    Offline,
    /// The slave refused an AL state change.
    StateChangeRefused {
        /// State that was requested.
        requested: AlState,
        /// AL status code reported by the slave.
        code: AlStatusCode,
    },
    /// The slave did not reach the requested AL state in time.
    StateChangeTimeout {
        /// State that was requested.
        requested: AlState,
    },
}

impl core::fmt::Display for SlaveError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SlaveError::Offline => f.write_str("slave is offline"),
            SlaveError::StateChangeRefused { requested, code } => {
                write!(f, "change to {} refused: {}", requested, code)
            }
            SlaveError::StateChangeTimeout { requested } => {
                write!(f, "change to {} timed out", requested)
            }
        }
    }
}

/// SII (EEPROM) interface error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum SiiError {
    /// The SII interface did not complete the operation in time.
    Timeout,
    /// The slave reported a command error for the SII operation.
    Nack,
    /// The slave refused an SII write, e.g. due to write protection.
    WriteRefused,
    /// SII contents could not be decoded.
    Decode,
    /// A category claims more data than the SII image holds.
    SectionOverrun,
}

impl core::fmt::Display for SiiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SiiError::Timeout => f.write_str("operation timed out"),
            SiiError::Nack => f.write_str("command not acknowledged"),
            SiiError::WriteRefused => f.write_str("write refused"),
            SiiError::Decode => f.write_str("failed to decode contents"),
            SiiError::SectionOverrun => f.write_str("category overruns image"),
        }
    }
}

/// Mailbox framing/transport error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum MailboxError {
    /// The slave has no mailbox but one is required for the operation.
    NotSupported,
    /// The payload does not fit into the slave's receive mailbox.
    TooSmall {
        /// Mailbox size in bytes.
        mailbox: u16,
        /// Required size in bytes.
        required: u16,
    },
    /// The mailbox response header is inconsistent with the mailbox region.
    Corrupt,
    /// The mailbox response carries an unexpected protocol type.
    UnexpectedProtocol {
        /// Protocol type that was expected.
        expected: u8,
        /// Protocol type that was received.
        received: u8,
    },
    /// The slave did not post a mailbox response in time.
    NoResponse,
}

impl core::fmt::Display for MailboxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MailboxError::NotSupported => f.write_str("no mailbox support"),
            MailboxError::TooSmall { mailbox, required } => write!(
                f,
                "data of {} bytes does not fit in {} byte mailbox",
                required, mailbox
            ),
            MailboxError::Corrupt => f.write_str("corrupt response"),
            MailboxError::UnexpectedProtocol { expected, received } => write!(
                f,
                "unexpected protocol {:#04x} (expected {:#04x})",
                received, expected
            ),
            MailboxError::NoResponse => f.write_str("no response"),
        }
    }
}

/// CoE (SDO transfer) error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum CoeError {
    /// The slave aborted the SDO transfer.
    Abort {
        /// EtherCAT SDO abort code, verbatim.
        code: AbortCode,
        /// The object index used in the transfer.
        index: u16,
        /// The object subindex used in the transfer.
        subindex: u8,
    },
    /// The response violated the SDO protocol (bad command, toggle or addressing).
    Protocol,
    /// The SDO transfer timed out.
    Timeout,
    /// The returned value is larger than the destination buffer.
    TooLong {
        /// The object index used in the transfer.
        index: u16,
        /// The object subindex used in the transfer.
        subindex: u8,
    },
}

impl core::fmt::Display for CoeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CoeError::Abort {
                code,
                index,
                subindex,
            } => write!(f, "{:#06x}:{} aborted: {}", index, subindex, code),
            CoeError::Protocol => f.write_str("protocol violation"),
            CoeError::Timeout => f.write_str("transfer timed out"),
            CoeError::TooLong { index, subindex } => {
                write!(f, "{:#06x}:{} returned data is too long", index, subindex)
            }
        }
    }
}

/// FoE (file transfer) error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FoeError {
    /// The response violated the FoE protocol (bad opcode or packet number).
    Protocol,
    /// The transfer timed out.
    Timeout,
    /// The slave terminated the transfer with an error message.
    Remote {
        /// FoE error code.
        code: u32,
        /// Optional error text sent by the slave.
        text: Option<String>,
    },
    /// The receive buffer cannot hold the next full fragment.
    BufferFull,
}

impl core::fmt::Display for FoeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FoeError::Protocol => f.write_str("protocol violation"),
            FoeError::Timeout => f.write_str("transfer timed out"),
            FoeError::Remote { code, text } => match text {
                Some(text) => write!(f, "remote error {:#010x}: {}", code, text),
                None => write!(f, "remote error {:#010x}", code),
            },
            FoeError::BufferFull => f.write_str("receive buffer full"),
        }
    }
}

/// Configuration error surfaced synchronously by the public API.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ConfigError {
    /// The requested PDO entry is not part of the slave's resolved PDO assignment.
    PdoEntryNotFound {
        /// PDO entry index.
        index: u16,
        /// PDO entry subindex.
        subindex: u8,
    },
    /// A byte-granular registration was requested for an entry not on a byte boundary.
    PdoEntryNotByteAligned,
    /// The total size of all domains exceeds the implementation limit.
    DomainTooLarge,
    /// An `(alias, position)` address does not resolve to a slave on the bus.
    InvalidSlaveAddress,
    /// The declared config conflicts with an existing one at the same address.
    Conflict,
    /// The master is in the wrong phase for this call, e.g. mutating PDO mappings after
    /// `activate`.
    WrongPhase,
    /// An externally supplied domain buffer is smaller than the domain image.
    ExternalBufferTooSmall {
        /// Supplied buffer length in bytes.
        supplied: usize,
        /// Required length in bytes.
        required: usize,
    },
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::PdoEntryNotFound { index, subindex } => {
                write!(f, "PDO entry {:#06x}:{} not found", index, subindex)
            }
            ConfigError::PdoEntryNotByteAligned => f.write_str("PDO entry is not byte aligned"),
            ConfigError::DomainTooLarge => f.write_str("domain too large"),
            ConfigError::InvalidSlaveAddress => f.write_str("invalid slave address"),
            ConfigError::Conflict => f.write_str("conflicting configuration"),
            ConfigError::WrongPhase => f.write_str("wrong master phase"),
            ConfigError::ExternalBufferTooSmall { supplied, required } => write!(
                f,
                "external buffer of {} bytes is smaller than the {} byte domain",
                supplied, required
            ),
        }
    }
}

impl From<PduError> for Error {
    fn from(e: PduError) -> Self {
        Self::Pdu(e)
    }
}

impl From<SlaveError> for Error {
    fn from(e: SlaveError) -> Self {
        Self::Slave(e)
    }
}

impl From<SiiError> for Error {
    fn from(e: SiiError) -> Self {
        Self::Sii(e)
    }
}

impl From<MailboxError> for Error {
    fn from(e: MailboxError) -> Self {
        Self::Mailbox(e)
    }
}

impl From<CoeError> for Error {
    fn from(e: CoeError) -> Self {
        Self::Coe(e)
    }
}

impl From<FoeError> for Error {
    fn from(e: FoeError) -> Self {
        Self::Foe(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<ethercrab_wire::WireError> for Error {
    fn from(e: ethercrab_wire::WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<TryFromIntError> for Error {
    fn from(_e: TryFromIntError) -> Self {
        Self::IntegerTypeConversion
    }
}
