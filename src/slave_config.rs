//! User-declared slave configuration: what the application expects at a bus position and how its
//! process data and parameters should be set up.

use crate::coe::abort::AbortCode;
use crate::pdo::PdoDirection;

/// Handle to a [`SlaveConfig`] owned by a master.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlaveConfigHandle(pub(crate) usize);

/// Handle to an [`SdoRequest`] owned by a slave config.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SdoRequestHandle {
    pub(crate) config: usize,
    pub(crate) index: usize,
}

/// Number of configurable sync managers per slave config.
pub const SYNC_CONFIG_COUNT: usize = 8;

/// Default SDO request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_NS: u64 = 1_000_000_000;

/// Sync manager watchdog behaviour for configured process data sync managers.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum WatchdogMode {
    /// Keep the control byte from the SII descriptor.
    #[default]
    Default,
    /// Force the watchdog on.
    Enable,
    /// Force the watchdog off.
    Disable,
}

/// One entry of a declared PDO mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdoEntryConfig {
    /// Object index.
    pub index: u16,
    /// Object subindex.
    pub subindex: u8,
    /// Size in bits.
    pub bit_length: u8,
}

/// One PDO of a declared assignment, optionally with an explicit entry mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdoConfig {
    /// PDO index.
    pub index: u16,
    /// Entry mapping to write into the slave, or `None` to keep the slave's own mapping.
    pub entries: Option<Vec<PdoEntryConfig>>,
}

/// Declared configuration of one sync manager.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Transfer direction; `None` leaves the SII default untouched.
    pub direction: Option<PdoDirection>,
    /// Watchdog behaviour.
    pub watchdog: WatchdogMode,
    /// Declared PDO assignment. Empty means "keep the slave's default assignment".
    pub pdos: Vec<PdoConfig>,
}

/// One queued configuration SDO download, applied on every (re)configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoConfig {
    /// Object index.
    pub index: u16,
    /// Object subindex.
    pub subindex: u8,
    /// Raw little endian value bytes.
    pub data: Vec<u8>,
}

/// State of an asynchronous request ([`SdoRequest`], register or SII requests).
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum RequestState {
    /// No transfer pending; any data is from the last completed transfer.
    #[default]
    Complete,
    /// Waiting for the master FSM to pick the request up.
    Queued,
    /// The transfer is in progress.
    Busy,
    /// The transfer finished successfully.
    Success,
    /// The transfer failed.
    Failure,
}

impl RequestState {
    /// Whether the request can be (re-)armed.
    pub fn is_idle(self) -> bool {
        !matches!(self, Self::Queued | Self::Busy)
    }
}

/// Transfer direction of a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum RequestDirection {
    /// Slave to master.
    Read,
    /// Master to slave.
    Write,
}

/// An application-owned asynchronous SDO transfer.
///
/// Created before `activate` via [`Master::create_sdo_request`](crate::Master::create_sdo_request)
/// and driven by the master FSM; the realtime context polls
/// [`state`](crate::Master::sdo_request_state) without blocking.
#[derive(Debug)]
pub struct SdoRequest {
    /// Object index.
    pub(crate) index: u16,
    /// Object subindex.
    pub(crate) subindex: u8,
    /// Value buffer.
    pub(crate) data: Vec<u8>,
    /// Fixed buffer capacity reserved at creation.
    pub(crate) capacity: usize,
    /// Current state.
    pub(crate) state: RequestState,
    /// Abort code of the last failed transfer.
    pub(crate) abort_code: Option<AbortCode>,
    /// Per-request timeout.
    pub(crate) timeout_ns: u64,
    /// Direction of the pending transfer.
    pub(crate) direction: RequestDirection,
    /// Timestamp at which the request was queued.
    pub(crate) queued_at: u64,
}

impl SdoRequest {
    pub(crate) fn new(index: u16, subindex: u8, capacity: usize) -> Self {
        Self {
            index,
            subindex,
            data: Vec::with_capacity(capacity),
            capacity,
            state: RequestState::Complete,
            abort_code: None,
            timeout_ns: DEFAULT_REQUEST_TIMEOUT_NS,
            direction: RequestDirection::Read,
            queued_at: 0,
        }
    }
}

/// Distributed clock SYNC signal parameters.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DcSyncSignal {
    /// Cycle time in ns; zero deactivates the signal.
    pub cycle_time_ns: u32,
    /// Shift relative to the cycle start in ns.
    pub shift_time_ns: i32,
}

/// A user-declared expected slave at `(alias, position)`.
///
/// A config is valid independently of any physical slave being present; the master FSM attaches
/// it to a matching slave after every bus scan and configures the slave from it.
#[derive(Debug)]
pub struct SlaveConfig {
    /// Alias addressing base, or zero for absolute ring positions.
    pub(crate) alias: u16,
    /// Ring position relative to the alias base.
    pub(crate) position: u16,
    /// Expected vendor id.
    pub(crate) vendor_id: u32,
    /// Expected product code.
    pub(crate) product_code: u32,
    /// Per sync manager declarations.
    pub(crate) sync_configs: [SyncConfig; SYNC_CONFIG_COUNT],
    /// Configuration SDOs, applied in order during PREOP.
    pub(crate) sdo_configs: Vec<SdoConfig>,
    /// Application-owned SDO requests.
    pub(crate) sdo_requests: Vec<SdoRequest>,
    /// DC AssignActivate word; zero disables DC for this slave.
    pub(crate) dc_assign_activate: u16,
    /// SYNC0/SYNC1 signal parameters.
    pub(crate) dc_sync_signals: [DcSyncSignal; 2],
    /// Watchdog divider register value, zero keeps the slave default.
    pub(crate) watchdog_divider: u16,
    /// Watchdog intervals register value, zero keeps the slave default.
    pub(crate) watchdog_intervals: u16,
    /// Index of the attached slave in the master's slave list.
    pub(crate) attached_slave: Option<usize>,
}

impl SlaveConfig {
    pub(crate) fn new(alias: u16, position: u16, vendor_id: u32, product_code: u32) -> Self {
        Self {
            alias,
            position,
            vendor_id,
            product_code,
            sync_configs: core::array::from_fn(|_| SyncConfig::default()),
            sdo_configs: Vec::new(),
            sdo_requests: Vec::new(),
            dc_assign_activate: 0,
            dc_sync_signals: [DcSyncSignal::default(); 2],
            watchdog_divider: 0,
            watchdog_intervals: 0,
            attached_slave: None,
        }
    }

    /// Bus address this config was declared for.
    pub fn address(&self) -> (u16, u16) {
        (self.alias, self.position)
    }

    /// Expected identity.
    pub fn expected_identity(&self) -> (u32, u32) {
        (self.vendor_id, self.product_code)
    }

    /// Whether this config is currently attached to a discovered slave.
    pub fn is_attached(&self) -> bool {
        self.attached_slave.is_some()
    }

    /// Whether any sync manager declares a PDO assignment.
    pub(crate) fn has_pdo_assignment(&self) -> bool {
        self.sync_configs.iter().any(|sync| !sync.pdos.is_empty())
    }

    /// The declared direction for a sync manager, if any.
    pub(crate) fn sync_direction(&self, sync_index: u8) -> Option<PdoDirection> {
        self.sync_configs
            .get(usize::from(sync_index))
            .and_then(|sync| sync.direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_config_is_detached() {
        let config = SlaveConfig::new(0, 1, 0x0000_0002, 0x03ec_3052);

        assert!(!config.is_attached());
        assert_eq!(config.address(), (0, 1));
        assert!(!config.has_pdo_assignment());
    }

    #[test]
    fn request_state_idle() {
        assert!(RequestState::Complete.is_idle());
        assert!(RequestState::Success.is_idle());
        assert!(RequestState::Failure.is_idle());
        assert!(!RequestState::Queued.is_idle());
        assert!(!RequestState::Busy.is_idle());
    }

    #[test]
    fn assignment_declaration() {
        let mut config = SlaveConfig::new(0, 0, 0, 0);

        config.sync_configs[3].direction = Some(PdoDirection::Input);
        config.sync_configs[3].pdos.push(PdoConfig {
            index: 0x1a00,
            entries: None,
        });

        assert!(config.has_pdo_assignment());
        assert_eq!(config.sync_direction(3), Some(PdoDirection::Input));
        assert_eq!(config.sync_direction(2), None);
    }
}
