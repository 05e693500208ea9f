//! Scoped ownership of one Ethernet interface.

use crate::error::{Error, PduError};
use crate::frame::{self, ETHERNET_HEADER_LEN, MIN_ETHERNET_PAYLOAD};

/// Carrier state of the Ethernet interface.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum LinkState {
    /// No carrier.
    #[default]
    Down,
    /// Carrier present.
    Up,
}

impl core::fmt::Display for LinkState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LinkState::Down => f.write_str("DOWN"),
            LinkState::Up => f.write_str("UP"),
        }
    }
}

/// The boundary implemented by the NIC driver glue.
///
/// The master is sans-IO with respect to the operating system: it assembles complete Ethernet II
/// frames and hands them to [`transmit`](EthernetPort::transmit), and pulls received frames in
/// via [`poll`](EthernetPort::poll). An implementation typically wraps a raw socket, a DPDK-style
/// queue pair or, in tests, an in-memory bus emulation.
pub trait EthernetPort {
    /// Current carrier state of the interface.
    fn link_state(&self) -> LinkState;

    /// Transmit one complete Ethernet II frame.
    fn transmit(&mut self, frame: &[u8]) -> Result<(), ()>;

    /// Deliver every pending received frame to `handler`.
    ///
    /// Must not block; an implementation drains whatever the interface has buffered and returns.
    fn poll(&mut self, handler: &mut dyn FnMut(&[u8]));
}

/// Maximum Ethernet payload carried per frame.
pub(crate) const MAX_FRAME_DATA: usize = 1500;

const MAX_ETHERNET_PAYLOAD: usize = MAX_FRAME_DATA;

/// An Ethernet interface owned by exactly one master.
///
/// Holds the single TX buffer with its pre-built Ethernet II header, tracks link state and
/// traffic statistics. One frame is in flight from the master's point of view at any time.
pub struct Device<P> {
    port: P,
    link_state: LinkState,
    tx_buffer: [u8; ETHERNET_HEADER_LEN + MAX_ETHERNET_PAYLOAD],
    /// Frames transmitted since attach.
    pub(crate) tx_count: u64,
    /// Frames received since attach.
    pub(crate) rx_count: u64,
    /// Timestamp of the last transmission in ns.
    pub(crate) last_tx: u64,
    /// Timestamp of the last reception in ns.
    pub(crate) last_rx: u64,
}

impl<P> Device<P>
where
    P: EthernetPort,
{
    /// Take ownership of a port, pre-building the TX frame header.
    pub fn new(port: P) -> Self {
        let mut tx_buffer = [0u8; ETHERNET_HEADER_LEN + MAX_ETHERNET_PAYLOAD];

        frame::write_ethernet_header(&mut tx_buffer);

        let link_state = port.link_state();

        Self {
            port,
            link_state,
            tx_buffer,
            tx_count: 0,
            rx_count: 0,
            last_tx: 0,
            last_rx: 0,
        }
    }

    /// The region of the TX buffer available for EtherCAT frame data.
    pub(crate) fn frame_data_mut(&mut self) -> &mut [u8] {
        &mut self.tx_buffer[ETHERNET_HEADER_LEN..]
    }

    /// Maximum number of EtherCAT frame bytes (header plus datagrams) per Ethernet frame.
    pub(crate) const fn max_frame_data() -> usize {
        MAX_ETHERNET_PAYLOAD
    }

    /// Transmit `size` bytes of assembled EtherCAT frame data.
    ///
    /// Short frames are padded to the Ethernet minimum. A no-op if the link is down; the
    /// datagrams of the skipped frame will time out and be retried by their owners.
    pub(crate) fn send(&mut self, size: usize, now: u64) -> Result<(), Error> {
        if self.link_state != LinkState::Up {
            log::trace!("Skipping transmit of {} bytes, link is down", size);

            return Ok(());
        }

        let padded = size.max(MIN_ETHERNET_PAYLOAD);

        // Zero any padding so no stale data leaks out on the wire
        self.tx_buffer[ETHERNET_HEADER_LEN + size..ETHERNET_HEADER_LEN + padded].fill(0);

        let frame = &self.tx_buffer[0..ETHERNET_HEADER_LEN + padded];

        self.port
            .transmit(frame)
            .map_err(|_| Error::Pdu(PduError::SendFailed))?;

        self.tx_count += 1;
        self.last_tx = now;

        Ok(())
    }

    /// Poll the port, handing the EtherCAT payload of each received frame to `handler`.
    pub(crate) fn poll(&mut self, now: u64, mut handler: impl FnMut(&[u8])) {
        let rx_count = &mut self.rx_count;
        let last_rx = &mut self.last_rx;

        self.port.poll(&mut |raw| {
            let Some(payload) = frame::ethercat_payload(raw) else {
                return;
            };

            *rx_count += 1;
            *last_rx = now;

            handler(payload);
        });
    }

    /// Refresh the cached link state from the port, logging transitions.
    pub(crate) fn update_link_state(&mut self) -> LinkState {
        let state = self.port.link_state();

        if state != self.link_state {
            log::info!("Link state changed to {}", state);

            self.link_state = state;
        }

        state
    }

    /// Cached link state.
    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    /// Access the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Mutably access the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Release the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct LoopbackPort {
        up: bool,
        sent: Vec<Vec<u8>>,
        rx: VecDeque<Vec<u8>>,
    }

    impl EthernetPort for LoopbackPort {
        fn link_state(&self) -> LinkState {
            if self.up { LinkState::Up } else { LinkState::Down }
        }

        fn transmit(&mut self, frame: &[u8]) -> Result<(), ()> {
            self.sent.push(frame.to_vec());

            Ok(())
        }

        fn poll(&mut self, handler: &mut dyn FnMut(&[u8])) {
            while let Some(frame) = self.rx.pop_front() {
                handler(&frame);
            }
        }
    }

    #[test]
    fn pads_short_frames() {
        let mut device = Device::new(LoopbackPort {
            up: true,
            sent: Vec::new(),
            rx: VecDeque::new(),
        });

        device.send(12, 0).unwrap();

        assert_eq!(device.port.sent[0].len(), 60);
        assert_eq!(device.tx_count, 1);
    }

    #[test]
    fn link_down_is_noop() {
        let mut device = Device::new(LoopbackPort {
            up: false,
            sent: Vec::new(),
            rx: VecDeque::new(),
        });

        device.send(12, 0).unwrap();

        assert!(device.port.sent.is_empty());
        assert_eq!(device.tx_count, 0);
    }

    #[test]
    fn poll_filters_non_ethercat() {
        let mut ecat = vec![0u8; 60];
        ecat[6] = 0x12;
        ecat[12..14].copy_from_slice(&[0x88, 0xa4]);

        let mut ip = vec![0u8; 60];
        ip[12..14].copy_from_slice(&[0x08, 0x00]);

        let mut device = Device::new(LoopbackPort {
            up: true,
            sent: Vec::new(),
            rx: VecDeque::from([ecat, ip]),
        });

        let mut delivered = 0;

        device.poll(100, |_| delivered += 1);

        assert_eq!(delivered, 1);
        assert_eq!(device.rx_count, 1);
        assert_eq!(device.last_rx, 100);
    }
}
