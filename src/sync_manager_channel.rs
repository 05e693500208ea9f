//! Sync manager channel registers.

use core::fmt;

/// One sync manager channel as written to registers `0x0800`–`0x088F`.
///
/// Defined in ETG1000.4 6.7.2.
#[derive(Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 8)]
pub struct SyncManagerChannel {
    /// Physical start address of the managed memory window.
    #[wire(bytes = 2)]
    pub physical_start: u16,
    /// Window length in bytes.
    #[wire(bytes = 2)]
    pub length: u16,
    /// Control byte.
    #[wire(bytes = 1)]
    pub control: Control,
    /// Status byte, read only.
    #[wire(bytes = 1)]
    pub status: Status,
    /// Activation word.
    #[wire(bytes = 2)]
    pub enable: Enable,
}

impl SyncManagerChannel {
    /// A disabled channel; written to clear a sync manager.
    pub fn disabled() -> Self {
        Self::default()
    }
}

impl fmt::Debug for SyncManagerChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncManagerChannel")
            .field(
                "physical_start",
                &format_args!("{:#06x}", self.physical_start),
            )
            .field("length", &format_args!("{:#06x} ({})", self.length, self.length))
            .field("control", &self.control)
            .field("status", &self.status)
            .field("enable", &self.enable)
            .finish()
    }
}

impl fmt::Display for SyncManagerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "start {:#06x}, {} bytes, {:?} {:?}, {}",
            self.physical_start,
            self.length,
            self.control.mode,
            self.control.direction,
            if self.enable.enable {
                "enabled"
            } else {
                "disabled"
            },
        ))
    }
}

/// Sync manager control byte.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 1)]
pub struct Control {
    /// Buffer operation mode.
    #[wire(bits = 2)]
    pub mode: OperationMode,
    /// Transfer direction.
    #[wire(bits = 2)]
    pub direction: Direction,
    /// Interrupt the master on buffer events.
    #[wire(bits = 1)]
    pub ecat_event_enable: bool,
    /// Interrupt the slave application on buffer events.
    #[wire(bits = 1, post_skip = 1)]
    pub pdi_event_enable: bool,
    /// Trigger the sync manager watchdog on writes.
    #[wire(bits = 1)]
    pub watchdog_enable: bool,
}

/// Sync manager status byte.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 1)]
pub struct Status {
    /// A write interrupt is pending.
    #[wire(bits = 1)]
    pub interrupt_write: bool,
    /// A read interrupt is pending.
    #[wire(bits = 1, post_skip = 1)]
    pub interrupt_read: bool,
    /// In mailbox mode: the mailbox holds unread mail.
    #[wire(bits = 1)]
    pub mailbox_full: bool,
    /// Last written buffer.
    #[wire(bits = 2)]
    pub buffer_state: u8,
    /// A read buffer access is in progress.
    #[wire(bits = 1)]
    pub read_buffer_open: bool,
    /// A write buffer access is in progress.
    #[wire(bits = 1)]
    pub write_buffer_open: bool,
}

/// Sync manager activation word.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct Enable {
    /// Channel is active.
    #[wire(bits = 1)]
    pub enable: bool,
    /// Repeat request toggle.
    #[wire(bits = 1, post_skip = 4)]
    pub repeat: bool,
    /// Generate a DC event 0 on EtherCAT writes.
    #[wire(bits = 1)]
    pub dc_event_bus_write: bool,
    /// Generate a DC event 0 on local writes.
    #[wire(bits = 1)]
    pub dc_event_local_write: bool,
    /// Channel deactivated from the PDI side.
    #[wire(bits = 1)]
    pub pdi_disabled: bool,
    /// Repeat acknowledge toggle.
    #[wire(bits = 1, post_skip = 6)]
    pub repeat_ack: bool,
}

/// Buffer operation mode, ETG1000.4 Table 58.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum OperationMode {
    /// Triple buffered process data exchange.
    #[default]
    Buffered = 0x00,
    /// Handshaked single buffer, used for mailboxes.
    Mailbox = 0x02,
}

/// Transfer direction from the master's point of view, ETG1000.4 Table 58.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum Direction {
    /// Slave writes, master reads (inputs).
    #[default]
    MasterRead = 0x00,
    /// Master writes, slave reads (outputs).
    MasterWrite = 0x01,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWriteSized};

    #[test]
    fn size() {
        assert_eq!(SyncManagerChannel::PACKED_LEN, 8);
    }

    #[test]
    fn pack_mailbox_rx() {
        // SM0: 128 byte receive mailbox at 0x1000
        let sm = SyncManagerChannel {
            physical_start: 0x1000,
            length: 0x0080,
            control: Control {
                mode: OperationMode::Mailbox,
                direction: Direction::MasterWrite,
                ecat_event_enable: false,
                pdi_event_enable: true,
                watchdog_enable: false,
            },
            status: Status::default(),
            enable: Enable {
                enable: true,
                ..Enable::default()
            },
        };

        assert_eq!(sm.pack(), [0x00, 0x10, 0x80, 0x00, 0x26, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn decode_mailbox_full() {
        let status = Status::unpack_from_slice(&[0x09]).unwrap();

        assert!(status.mailbox_full);
        assert!(status.interrupt_write);
    }

    #[test]
    fn decode_process_data_channel() {
        let parsed =
            SyncManagerChannel::unpack_from_slice(&[0x00, 0x11, 0x04, 0x00, 0x20, 0x00, 0x01, 0x00])
                .unwrap();

        assert_eq!(
            parsed,
            SyncManagerChannel {
                physical_start: 0x1100,
                length: 4,
                control: Control {
                    mode: OperationMode::Buffered,
                    direction: Direction::MasterRead,
                    ecat_event_enable: false,
                    pdi_event_enable: true,
                    watchdog_enable: false,
                },
                status: Status::default(),
                enable: Enable {
                    enable: true,
                    ..Enable::default()
                },
            }
        );
    }
}
