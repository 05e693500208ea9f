/// Slave register address abstraction.
///
/// This enum gives the raw physical memory addresses used by the master nicer names.
///
/// Defined in ETG1000.4, Table 31.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum RegisterAddress {
    /// Base type, `u8`.
    Type = 0x0000u16,
    /// EtherCAT revision, `u8`.
    Revision = 0x0001,
    /// Slave build number, `u16`.
    Build = 0x0002,
    /// Number of supported FMMU entities, `u8`.
    FmmuCount = 0x0004,
    /// Number of supported sync manager channels, `u8`.
    SyncManagerCount = 0x0005,
    /// RAM size in kilo-octets (1024 octets), `u8`.
    RamSize = 0x0006,
    /// EtherCAT port descriptors 0-3, `u8`.
    PortDescriptors = 0x0007,
    /// EtherCAT features supported by the slave, `u16`.
    SupportFlags = 0x0008,
    /// The slave's configured station address, `u16`.
    ConfiguredStationAddress = 0x0010,
    /// The slave's station alias, `u16`.
    ConfiguredStationAlias = 0x0012,

    /// DL status, `u16`. Defined in ETG1000.4 Table 34.
    DlStatus = 0x0110,

    /// Application Layer (AL) control register, `u16`. See ETG1000.6 Table 9.
    AlControl = 0x0120,
    /// Application Layer (AL) status register, `u16`.
    AlStatus = 0x0130,
    /// Application Layer (AL) status code register, `u16`.
    AlStatusCode = 0x0134,

    /// First RX error (CRC) counter; one `u16` per port at consecutive addresses.
    RxErrorCounter = 0x0300,

    /// Watchdog divider, `u16`.
    WatchdogDivider = 0x0400,
    /// Sync manager watchdog timeout, `u16`.
    SyncManagerWatchdog = 0x0420,

    /// SII (EEPROM) access configuration register, `u16`.
    SiiConfig = 0x0500,
    /// SII control/status register, `u16`.
    SiiControl = 0x0502,
    /// SII word address register, `u16`.
    SiiAddress = 0x0504,
    /// SII data register; 4 bytes on read, 2 bytes on write.
    SiiData = 0x0508,

    /// First Fieldbus Memory Management Unit (FMMU) entity.
    ///
    /// 16 byte entities at consecutive addresses, defined in ETG1000.4 Table 57.
    Fmmu0 = 0x0600,

    /// First sync manager channel.
    ///
    /// 8 byte channels at consecutive addresses, defined in ETG1000.4 Table 59.
    Sm0 = 0x0800,

    /// DC SYNC activation (`AssignActivate` low byte), `u8`.
    ///
    /// ETG1000.6 Table 27, AKA ETG1000.4 Table 61 DC user P1.
    DcSyncActive = 0x0981,
    /// DC SYNC cyclic operation start time, `u32`.
    DcSyncStartTime = 0x0990,
    /// DC SYNC0 cycle time in ns, `u32`.
    DcSync0CycleTime = 0x09A0,
    /// DC SYNC1 cycle time in ns, `u32`.
    DcSync1CycleTime = 0x09A4,
}

impl From<RegisterAddress> for u16 {
    fn from(reg: RegisterAddress) -> Self {
        reg as u16
    }
}

impl RegisterAddress {
    /// Address of the FMMU entity with the given index.
    pub fn fmmu(index: u8) -> u16 {
        debug_assert!(index < 16, "FMMU index {} out of range", index);

        Self::Fmmu0 as u16 + u16::from(index) * 0x10
    }

    /// Address of the sync manager channel with the given index.
    pub fn sync_manager(index: u8) -> u16 {
        debug_assert!(index < 16, "SM index {} out of range", index);

        Self::Sm0 as u16 + u16::from(index) * 0x08
    }

    /// Address of a sync manager's status byte.
    ///
    /// The status register is the 6th byte of the channel.
    pub fn sync_manager_status(index: u8) -> u16 {
        Self::sync_manager(index) + 5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables() {
        assert_eq!(RegisterAddress::fmmu(0), 0x0600);
        assert_eq!(RegisterAddress::fmmu(15), 0x06f0);
        assert_eq!(RegisterAddress::sync_manager(0), 0x0800);
        assert_eq!(RegisterAddress::sync_manager(1), 0x0808);
        assert_eq!(RegisterAddress::sync_manager_status(1), 0x080d);
    }
}
