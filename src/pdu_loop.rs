//! Datagram queueing, frame assembly and response matching.

use crate::datagram::{Datagram, DatagramId, DatagramState};
use crate::device::{Device, EthernetPort};
use crate::error::{Error, PduError};
use crate::frame::{
    DATAGRAM_HEADER_LEN, DATAGRAM_OVERHEAD, DatagramFlags, FRAME_HEADER_LEN, FrameHeader,
};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite};

/// Interval between statistics log lines.
const STATS_LOG_INTERVAL_NS: u64 = 1_000_000_000;

/// Round trip timeout used by [`PduLoop::simple_io`].
const SIMPLE_IO_TIMEOUT_NS: u64 = 100_000_000;

/// Transport layer statistics.
///
/// Counters accumulate over the lifetime of the master and are logged at most once per second
/// while any of them is moving.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PduStats {
    /// Datagrams that were sent but never answered.
    pub timeouts: u64,
    /// Received datagrams that matched no sent datagram.
    pub unmatched: u64,
    /// Frames that failed header validation.
    pub corrupted: u64,
    /// Datagrams that were re-queued while still in flight.
    pub skipped: u64,
}

impl PduStats {
    fn delta(&self, since: &PduStats) -> PduStats {
        PduStats {
            timeouts: self.timeouts - since.timeouts,
            unmatched: self.unmatched - since.unmatched,
            corrupted: self.corrupted - since.corrupted,
            skipped: self.skipped - since.skipped,
        }
    }

    fn any(&self) -> bool {
        self.timeouts > 0 || self.unmatched > 0 || self.corrupted > 0 || self.skipped > 0
    }
}

/// The master's datagram arena plus the queue/emit/match machinery.
///
/// Datagrams live in a slab for the lifetime of the master and are referenced by [`DatagramId`]
/// everywhere else, so FSMs, domains and requests can all hold onto their datagrams without any
/// cross-references into each other.
pub struct PduLoop {
    datagrams: Vec<Datagram>,
    /// Ids of datagrams in `Queued` or `Sent` state, in queueing order.
    queue: Vec<DatagramId>,
    /// Wire index handed to the next emitted datagram.
    next_index: u8,
    stats: PduStats,
    stats_logged: PduStats,
    stats_logged_at: u64,
}

impl PduLoop {
    pub(crate) fn new() -> Self {
        Self {
            datagrams: Vec::new(),
            queue: Vec::new(),
            next_index: 0,
            stats: PduStats::default(),
            stats_logged: PduStats::default(),
            stats_logged_at: 0,
        }
    }

    /// Allocate a fresh datagram in the arena.
    pub(crate) fn alloc(&mut self, name: &'static str) -> DatagramId {
        let id = DatagramId(self.datagrams.len());

        self.datagrams.push(Datagram::new(name));

        id
    }

    /// Borrow a datagram by handle.
    pub(crate) fn get(&self, id: DatagramId) -> &Datagram {
        &self.datagrams[id.0]
    }

    /// Mutably borrow a datagram by handle.
    pub(crate) fn get_mut(&mut self, id: DatagramId) -> &mut Datagram {
        &mut self.datagrams[id.0]
    }

    /// Transport statistics.
    pub(crate) fn stats(&self) -> PduStats {
        self.stats
    }

    /// Append a datagram to the send queue.
    ///
    /// Re-queueing a datagram that is still in flight re-arms it in place and counts a skip; the
    /// pending response (if any still arrives) will be matched as usual.
    pub(crate) fn queue(&mut self, id: DatagramId) {
        if self.queue.contains(&id) {
            let datagram = self.get_mut(id);

            datagram.skip_count += 1;
            datagram.state = DatagramState::Queued;

            self.stats.skipped += 1;

            return;
        }

        self.get_mut(id).state = DatagramState::Queued;
        self.queue.push(id);
    }

    /// Whether any datagram is waiting to be put on the wire.
    pub(crate) fn has_queued(&self) -> bool {
        self.datagrams
            .iter()
            .any(|datagram| datagram.state == DatagramState::Queued)
    }

    /// Pack all queued datagrams into the device TX buffer and transmit one frame.
    ///
    /// Datagrams that do not fit stay queued for the next frame. Emitting with an empty queue is
    /// a no-op.
    pub(crate) fn emit<P>(&mut self, device: &mut Device<P>, now: u64) -> Result<(), Error>
    where
        P: EthernetPort,
    {
        let capacity = Device::<P>::max_frame_data() - FRAME_HEADER_LEN;

        // First pass: select the run of leading queued datagrams that fit into this frame.
        let mut datagram_bytes = 0;
        let mut emit_ids: Vec<DatagramId> = Vec::new();

        for &id in &self.queue {
            let datagram = self.get(id);

            if datagram.state != DatagramState::Queued {
                continue;
            }

            let needed = DATAGRAM_OVERHEAD + datagram.len();

            if datagram_bytes + needed > capacity {
                break;
            }

            datagram_bytes += needed;
            emit_ids.push(id);
        }

        if emit_ids.is_empty() {
            return Ok(());
        }

        let frame_data = device.frame_data_mut();

        FrameHeader::pdu(datagram_bytes as u16).pack_to_slice_unchecked(&mut frame_data[0..2]);

        let mut offset = FRAME_HEADER_LEN;
        let last = *emit_ids.last().unwrap_or(&emit_ids[0]);

        for &id in &emit_ids {
            let index = self.next_index;
            self.next_index = self.next_index.wrapping_add(1);

            let more_follows = id != last;
            let datagram = &mut self.datagrams[id.0];

            datagram.index = index;

            let len = datagram.len() as u16;

            let frame_data = device.frame_data_mut();

            frame_data[offset] = datagram.command().code();
            frame_data[offset + 1] = index;
            frame_data[offset + 2..offset + 6].copy_from_slice(&datagram.command().address_bytes());

            DatagramFlags {
                length: len,
                circulated: false,
                more_follows,
            }
            .pack_to_slice_unchecked(&mut frame_data[offset + 6..offset + 8]);

            // IRQ field, unused by this master
            frame_data[offset + 8..offset + 10].fill(0);

            offset += DATAGRAM_HEADER_LEN;

            frame_data[offset..offset + datagram.len()].copy_from_slice(datagram.payload());

            offset += datagram.len();

            // Working counter placeholder
            frame_data[offset..offset + 2].fill(0);

            offset += 2;

            datagram.state = DatagramState::Sent;
            datagram.sent_at = now;

            log::trace!(
                "TX {} idx {:#04x}, {} byte(s), {}",
                datagram.command(),
                index,
                len,
                datagram.name
            );
        }

        device.send(FRAME_HEADER_LEN + datagram_bytes, now)
    }

    /// Match the datagrams of one received EtherCAT frame payload against the queue.
    pub(crate) fn receive_frame(&mut self, payload: &[u8], now: u64) {
        let Ok(header) = FrameHeader::unpack_from_slice(payload) else {
            self.stats.corrupted += 1;

            return;
        };

        let Some(mut rest) = payload
            .get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + usize::from(header.payload_len))
        else {
            self.stats.corrupted += 1;

            return;
        };

        loop {
            let Some(dg_header) = rest.get(0..DATAGRAM_HEADER_LEN) else {
                self.stats.corrupted += 1;

                return;
            };

            let code = dg_header[0];
            let index = dg_header[1];

            let Ok(flags) = DatagramFlags::unpack_from_slice(&dg_header[6..8]) else {
                self.stats.corrupted += 1;

                return;
            };

            let len = usize::from(flags.length);

            let Some(data) = rest.get(DATAGRAM_HEADER_LEN..DATAGRAM_HEADER_LEN + len) else {
                self.stats.corrupted += 1;

                return;
            };

            let Some(wkc_bytes) = rest.get(DATAGRAM_HEADER_LEN + len..DATAGRAM_HEADER_LEN + len + 2)
            else {
                self.stats.corrupted += 1;

                return;
            };

            let working_counter = u16::from_le_bytes([wkc_bytes[0], wkc_bytes[1]]);

            self.match_datagram(code, index, data, working_counter, now);

            rest = &rest[DATAGRAM_OVERHEAD + len..];

            if !flags.more_follows {
                break;
            }
        }
    }

    fn match_datagram(&mut self, code: u8, index: u8, data: &[u8], working_counter: u16, now: u64) {
        let position = self.queue.iter().position(|&id| {
            let datagram = self.get(id);

            datagram.state == DatagramState::Sent
                && datagram.index == index
                && datagram.command().code() == code
                && datagram.len() == data.len()
        });

        let Some(position) = position else {
            log::trace!(
                "RX unmatched datagram, code {:#04x} idx {:#04x}, {} byte(s)",
                code,
                index,
                data.len()
            );

            self.stats.unmatched += 1;

            return;
        };

        let id = self.queue.remove(position);
        let datagram = &mut self.datagrams[id.0];

        datagram.payload_mut().copy_from_slice(data);
        datagram.working_counter = working_counter;
        datagram.received_at = now;
        datagram.state = DatagramState::Received;

        log::trace!(
            "RX {} idx {:#04x}, WKC {}, {}",
            datagram.command(),
            index,
            working_counter,
            datagram.name
        );
    }

    /// Move any sent datagram older than `timeout_ns` to `TimedOut` and drop it from the queue.
    pub(crate) fn check_timeouts(&mut self, now: u64, timeout_ns: u64) {
        let mut position = 0;

        while position < self.queue.len() {
            let id = self.queue[position];
            let datagram = &mut self.datagrams[id.0];

            if datagram.state == DatagramState::Sent
                && now.saturating_sub(datagram.sent_at) > timeout_ns
            {
                log::trace!(
                    "Timeout on {} idx {:#04x} after {} us, {}",
                    datagram.command(),
                    datagram.index,
                    now.saturating_sub(datagram.sent_at) / 1000,
                    datagram.name
                );

                datagram.state = DatagramState::TimedOut;
                self.stats.timeouts += 1;
                self.queue.remove(position);
            } else {
                position += 1;
            }
        }
    }

    /// Log moving statistics counters, at most once per [`STATS_LOG_INTERVAL_NS`].
    pub(crate) fn log_stats(&mut self, now: u64) {
        if now.saturating_sub(self.stats_logged_at) < STATS_LOG_INTERVAL_NS {
            return;
        }

        let delta = self.stats.delta(&self.stats_logged);

        if delta.any() {
            log::warn!(
                "Datagram statistics: {} timed out, {} unmatched, {} corrupted, {} skipped",
                delta.timeouts,
                delta.unmatched,
                delta.corrupted,
                delta.skipped
            );
        }

        self.stats_logged = self.stats;
        self.stats_logged_at = now;
    }

    /// Synchronous round trip of a single datagram, used only during configuration.
    ///
    /// Queues the datagram, then busy-polls the device until the response is matched or the
    /// 100 ms timeout fires. The realtime context never calls this.
    pub(crate) fn simple_io<P>(
        &mut self,
        device: &mut Device<P>,
        id: DatagramId,
        mut now_fn: impl FnMut() -> u64,
    ) -> Result<u16, Error>
    where
        P: EthernetPort,
    {
        self.queue(id);

        let start = now_fn();

        loop {
            let now = now_fn();

            self.emit(device, now)?;

            // Local borrow dance: deliver frames from the port into the matcher
            let mut frames: Vec<Vec<u8>> = Vec::new();

            device.poll(now, |payload| frames.push(payload.to_vec()));

            for payload in frames {
                self.receive_frame(&payload, now);
            }

            match self.get(id).state() {
                DatagramState::Received => return Ok(self.get(id).working_counter()),
                DatagramState::Error => return Err(Error::Pdu(PduError::FrameCorrupt)),
                DatagramState::TimedOut => return Err(Error::Pdu(PduError::TimedOut)),
                _ => (),
            }

            if now.saturating_sub(start) > SIMPLE_IO_TIMEOUT_NS {
                self.check_timeouts(now, SIMPLE_IO_TIMEOUT_NS);

                if self.get(id).state() != DatagramState::Received {
                    return Err(Error::Pdu(PduError::TimedOut));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LinkState;
    use std::collections::VecDeque;

    struct TestPort {
        sent: Vec<Vec<u8>>,
        rx: VecDeque<Vec<u8>>,
    }

    impl EthernetPort for TestPort {
        fn link_state(&self) -> LinkState {
            LinkState::Up
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

    fn test_device() -> Device<TestPort> {
        Device::new(TestPort {
            sent: Vec::new(),
            rx: VecDeque::new(),
        })
    }

    #[test]
    fn emit_single_brd() {
        let mut pdu = PduLoop::new();
        let mut device = test_device();

        let id = pdu.alloc("test");

        pdu.get_mut(id).init_brd(0x0130, 2).unwrap();
        pdu.queue(id);
        pdu.emit(&mut device, 1000).unwrap();

        assert_eq!(pdu.get(id).state(), DatagramState::Sent);

        let frame = &device.port_mut().sent[0];

        assert_eq!(
            &frame[14..30],
            &[
                0x0e, 0x10, // Frame header: 14 bytes, type 1
                0x07, // BRD
                0x00, // Index 0
                0x00, 0x00, 0x30, 0x01, // Address position 0, register 0x0130
                0x02, 0x00, // Flags: 2 bytes, last datagram
                0x00, 0x00, // IRQ
                0x00, 0x00, // Payload
                0x00, 0x00, // Working counter
            ]
        );
    }

    #[test]
    fn index_increments_per_emit() {
        let mut pdu = PduLoop::new();
        let mut device = test_device();

        let a = pdu.alloc("a");
        let b = pdu.alloc("b");

        pdu.get_mut(a).init_brd(0x0130, 2).unwrap();
        pdu.get_mut(b).init_brd(0x0000, 1).unwrap();

        pdu.queue(a);
        pdu.queue(b);
        pdu.emit(&mut device, 0).unwrap();

        assert_eq!(pdu.get(a).index, 0);
        assert_eq!(pdu.get(b).index, 1);

        // `more_follows` set on first datagram only
        let frame = &device.port_mut().sent[0];
        let first_flags = u16::from_le_bytes([frame[22], frame[23]]);

        assert_ne!(first_flags & 0x8000, 0);
    }

    #[test]
    fn response_is_matched_and_dequeued() {
        let mut pdu = PduLoop::new();
        let mut device = test_device();

        let id = pdu.alloc("test");

        pdu.get_mut(id).init_brd(0x0130, 2).unwrap();
        pdu.queue(id);
        pdu.emit(&mut device, 0).unwrap();

        // Build the response: same frame with payload + working counter filled in
        let mut response = device.port_mut().sent[0][14..].to_vec();

        response[12..14].copy_from_slice(&[0x21, 0x00]); // AL status sum
        response[14..16].copy_from_slice(&[0x02, 0x00]); // 2 responders

        pdu.receive_frame(&response, 500);

        let datagram = pdu.get(id);

        assert_eq!(datagram.state(), DatagramState::Received);
        assert_eq!(datagram.working_counter(), 2);
        assert_eq!(datagram.payload(), &[0x21, 0x00]);
        assert!(!pdu.has_queued());
    }

    #[test]
    fn double_response_is_unmatched() {
        let mut pdu = PduLoop::new();
        let mut device = test_device();

        let id = pdu.alloc("test");

        pdu.get_mut(id).init_brd(0x0130, 2).unwrap();
        pdu.queue(id);
        pdu.emit(&mut device, 0).unwrap();

        let response = device.port_mut().sent[0][14..].to_vec();

        pdu.receive_frame(&response, 1);
        pdu.receive_frame(&response, 2);

        assert_eq!(pdu.stats().unmatched, 1);
    }

    #[test]
    fn requeue_in_flight_counts_skip() {
        let mut pdu = PduLoop::new();
        let mut device = test_device();

        let id = pdu.alloc("test");

        pdu.get_mut(id).init_brd(0x0130, 2).unwrap();
        pdu.queue(id);
        pdu.emit(&mut device, 0).unwrap();

        pdu.queue(id);

        assert_eq!(pdu.get(id).skip_count, 1);
        assert_eq!(pdu.stats().skipped, 1);
    }

    #[test]
    fn timeout_moves_state() {
        let mut pdu = PduLoop::new();
        let mut device = test_device();

        let id = pdu.alloc("test");

        pdu.get_mut(id).init_nprd(0x1001, 0x0130, 2).unwrap();
        pdu.queue(id);
        pdu.emit(&mut device, 0).unwrap();

        pdu.check_timeouts(50_000_000, 100_000_000);
        assert_eq!(pdu.get(id).state(), DatagramState::Sent);

        pdu.check_timeouts(150_000_000, 100_000_000);
        assert_eq!(pdu.get(id).state(), DatagramState::TimedOut);
        assert_eq!(pdu.stats().timeouts, 1);
    }

    #[test]
    fn oversize_datagram_stays_queued() {
        let mut pdu = PduLoop::new();
        let mut device = test_device();

        let big = pdu.alloc("big");
        let small = pdu.alloc("small");

        pdu.get_mut(big).init_lrw(0, 1400).unwrap();
        pdu.get_mut(small).init_lrw(0x1000, 600).unwrap();

        pdu.queue(big);
        pdu.queue(small);
        pdu.emit(&mut device, 0).unwrap();

        // Only the first datagram fits; the second is left for the next frame
        assert_eq!(pdu.get(big).state(), DatagramState::Sent);
        assert_eq!(pdu.get(small).state(), DatagramState::Queued);

        pdu.emit(&mut device, 1).unwrap();

        assert_eq!(pdu.get(small).state(), DatagramState::Sent);
        assert_eq!(device.port_mut().sent.len(), 2);
    }
}
