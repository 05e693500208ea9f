//! A single EtherCAT command on the wire and its lifecycle.

use crate::command::Command;
use crate::error::Error;

/// Lifecycle state of a [`Datagram`].
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DatagramState {
    /// Initialised but not yet queued.
    #[default]
    Init,
    /// On the master queue, waiting for the next frame.
    Queued,
    /// Packed into a frame and transmitted; awaiting its response.
    Sent,
    /// The response was matched and copied back.
    Received,
    /// No response arrived within the timeout.
    TimedOut,
    /// The datagram could not be sent or matched.
    Error,
}

impl DatagramState {
    /// Whether the datagram is owned by the queue/dispatcher in this state.
    pub(crate) fn in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Sent)
    }

    /// Whether a round trip has finished, successfully or not.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Received | Self::TimedOut | Self::Error)
    }
}

/// Stable handle to a datagram in the master's datagram arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DatagramId(pub(crate) usize);

/// A single EtherCAT datagram: command, payload buffer and response bookkeeping.
///
/// Datagrams are long lived: FSMs and domains allocate one (or a few) up front and re-`init` them
/// for every exchange. The payload buffer only ever grows; re-initialising with a smaller size
/// keeps the larger allocation around.
#[derive(Debug, Default)]
pub struct Datagram {
    /// The command this datagram carries.
    command: Command,
    /// Payload buffer; length equals the wire payload size.
    data: Vec<u8>,
    /// Wire index assigned by the dispatcher at emit time.
    pub(crate) index: u8,
    /// Working counter of the last response.
    pub(crate) working_counter: u16,
    /// Lifecycle state.
    pub(crate) state: DatagramState,
    /// Timestamp of the last transmission in ns.
    pub(crate) sent_at: u64,
    /// Timestamp of the last matched response in ns.
    pub(crate) received_at: u64,
    /// Number of times this datagram was re-queued while still in flight.
    pub(crate) skip_count: u32,
    /// Owner label for diagnostics.
    pub(crate) name: &'static str,
}

impl Datagram {
    /// Create an empty datagram with an owner label.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    /// Grow the payload buffer to at least `size` bytes.
    ///
    /// The buffer is never shrunk.
    pub fn prealloc(&mut self, size: usize) -> Result<(), Error> {
        if size <= self.data.capacity() {
            return Ok(());
        }

        self.data
            .try_reserve_exact(size - self.data.len())
            .map_err(|_| Error::OutOfMemory)
    }

    fn init(&mut self, command: Command, size: usize) -> Result<(), Error> {
        self.prealloc(size)?;

        self.command = command;
        self.data.clear();
        self.data.resize(size, 0);
        self.index = 0;
        self.working_counter = 0;
        self.state = DatagramState::Init;

        Ok(())
    }

    /// Initialise as an auto increment read of `size` bytes.
    pub fn init_aprd(&mut self, ring_position: u16, register: u16, size: usize) -> Result<(), Error> {
        self.init(Command::aprd(ring_position, register), size)
    }

    /// Initialise as an auto increment write of `size` bytes.
    pub fn init_apwr(&mut self, ring_position: u16, register: u16, size: usize) -> Result<(), Error> {
        self.init(Command::apwr(ring_position, register), size)
    }

    /// Initialise as a node read of `size` bytes.
    pub fn init_nprd(&mut self, address: u16, register: u16, size: usize) -> Result<(), Error> {
        if address == 0 {
            log::warn!("Using node command with station address 0");
        }

        self.init(Command::nprd(address, register), size)
    }

    /// Initialise as a node write of `size` bytes.
    pub fn init_npwr(&mut self, address: u16, register: u16, size: usize) -> Result<(), Error> {
        if address == 0 {
            log::warn!("Using node command with station address 0");
        }

        self.init(Command::npwr(address, register), size)
    }

    /// Initialise as a broadcast read of `size` bytes.
    pub fn init_brd(&mut self, register: u16, size: usize) -> Result<(), Error> {
        self.init(Command::brd(register), size)
    }

    /// Initialise as a broadcast write of `size` bytes.
    pub fn init_bwr(&mut self, register: u16, size: usize) -> Result<(), Error> {
        self.init(Command::bwr(register), size)
    }

    /// Initialise as a logical read/write of `size` bytes.
    pub fn init_lrw(&mut self, logical_address: u32, size: usize) -> Result<(), Error> {
        self.init(Command::lrw(logical_address), size)
    }

    /// The command this datagram currently carries.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DatagramState {
        self.state
    }

    /// Working counter of the last response.
    pub fn working_counter(&self) -> u16 {
        self.working_counter
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Mutable payload bytes.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Wire payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Round trip time of the last completed exchange in ns.
    pub fn round_trip_time(&self) -> u64 {
        self.received_at.saturating_sub(self.sent_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_zeroes_payload() {
        let mut dg = Datagram::new("test");

        dg.init_brd(0x0130, 2).unwrap();

        dg.payload_mut().copy_from_slice(&[0xaa, 0xbb]);
        dg.working_counter = 3;
        dg.state = DatagramState::Received;

        dg.init_brd(0x0130, 2).unwrap();

        assert_eq!(dg.payload(), &[0x00, 0x00]);
        assert_eq!(dg.working_counter(), 0);
        assert_eq!(dg.state(), DatagramState::Init);
        assert_eq!(dg.index, 0);
    }

    #[test]
    fn buffer_never_shrinks() {
        let mut dg = Datagram::new("test");

        dg.init_nprd(0x1001, 0x0000, 128).unwrap();
        assert_eq!(dg.len(), 128);

        dg.init_nprd(0x1001, 0x0000, 4).unwrap();
        assert_eq!(dg.len(), 4);
        assert!(dg.payload_mut().len() == 4);

        // Capacity from the larger init is retained
        assert!(dg.data.capacity() >= 128);
    }

    #[test]
    fn command_is_stored() {
        let mut dg = Datagram::new("test");

        dg.init_lrw(0x0001_0000, 8).unwrap();

        assert_eq!(
            dg.command(),
            Command::Lrw {
                address: 0x0001_0000
            }
        );
        assert_eq!(dg.len(), 8);
    }
}
