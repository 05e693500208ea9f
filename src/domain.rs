//! Process data domains: contiguous logical address windows exchanged cyclically via LRW.

use crate::datagram::{DatagramId, DatagramState};
use crate::error::{ConfigError, Error};
use crate::frame::{DATAGRAM_OVERHEAD, FRAME_HEADER_LEN};
use crate::pdo::PdoDirection;
use crate::pdu_loop::PduLoop;

/// Handle to a [`Domain`] owned by a master.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DomainHandle(pub(crate) usize);

/// Upper bound on the process data image of a single domain.
pub const MAX_DOMAIN_SIZE: usize = 0x1_0000;

/// Largest LRW payload that still fits a frame alongside its headers.
const MAX_LRW_PAYLOAD: usize = crate::device::MAX_FRAME_DATA - FRAME_HEADER_LEN - DATAGRAM_OVERHEAD;

/// Aggregate state of a domain's last cyclic exchange.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum WcState {
    /// No slave processed the domain's datagrams.
    #[default]
    Zero,
    /// Some but not all registered slaves processed their data.
    Incomplete,
    /// The working counter matched the expected value.
    Complete,
}

/// Published domain state, see [`Master::domain_state`](crate::Master::domain_state).
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DomainState {
    /// Sum of the working counters of the domain's datagrams in the last cycle.
    pub working_counter: u16,
    /// Interpretation of the working counter.
    pub wc_state: WcState,
}

/// One FMMU-mapped slice of a domain: the full process image of one sync manager of one
/// configured slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DomainFmmu {
    /// Owning slave config index.
    pub config: usize,
    /// Sync manager index inside the slave.
    pub sync_index: u8,
    /// Direction of the mapped data.
    pub direction: PdoDirection,
    /// Bit offset of this slice inside the domain image.
    pub logical_start_bit: u32,
    /// Slice length in bits.
    pub bit_length: u32,
}

impl DomainFmmu {
    /// Working counter contribution of this mapping: reads count 1, writes count 2.
    fn wc_increment(&self) -> u16 {
        match self.direction {
            PdoDirection::Input => 1,
            PdoDirection::Output => 2,
        }
    }
}

/// A contiguous logical address window of process data.
///
/// Built up by PDO entry registration before activation; after
/// [`activate`](crate::Master::activate) it owns one or more LRW datagrams that the realtime
/// context queues and processes every cycle.
#[derive(Debug, Default)]
pub struct Domain {
    /// Position in the master's domain list.
    pub(crate) index: usize,
    /// Registered FMMU slices in registration order.
    pub(crate) fmmus: Vec<DomainFmmu>,
    /// Total registered bits.
    pub(crate) bit_size: u32,
    /// Logical base address, assigned at activation.
    pub(crate) logical_base: u32,
    /// Process data image.
    pub(crate) data: Vec<u8>,
    /// The application supplied `data` and its length must not be changed.
    pub(crate) external_buffer: bool,
    /// LRW datagrams, one per `MAX_LRW_PAYLOAD` sized chunk.
    pub(crate) datagrams: Vec<DatagramId>,
    /// Expected working counter, computed at activation.
    pub(crate) expected_working_counter: u16,
    /// Working counter sum of the last processed cycle.
    pub(crate) working_counter: u16,
    /// Interpretation of `working_counter`.
    pub(crate) wc_state: WcState,
    /// Last logged working counter, for change detection.
    last_logged_wc: u16,
}

impl Domain {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    /// Image size in bytes.
    pub fn data_size(&self) -> usize {
        self.bit_size.div_ceil(8) as usize
    }

    /// Find or create the FMMU slice for `(config, sync_index)`, extending the image by
    /// `grow_bits` if the slice is new, and return the slice's start bit.
    pub(crate) fn fmmu_for(
        &mut self,
        config: usize,
        sync_index: u8,
        direction: PdoDirection,
        bit_length: u32,
    ) -> Result<u32, Error> {
        if let Some(fmmu) = self
            .fmmus
            .iter()
            .find(|fmmu| fmmu.config == config && fmmu.sync_index == sync_index)
        {
            return Ok(fmmu.logical_start_bit);
        }

        let logical_start_bit = self.bit_size;

        if (self.bit_size + bit_length).div_ceil(8) as usize > MAX_DOMAIN_SIZE {
            return Err(Error::Config(ConfigError::DomainTooLarge));
        }

        self.fmmus.push(DomainFmmu {
            config,
            sync_index,
            direction,
            logical_start_bit,
            bit_length,
        });

        self.bit_size += bit_length;

        Ok(logical_start_bit)
    }

    /// Assign the logical base address, size the image and build the LRW datagrams.
    ///
    /// Returns the first logical address after this domain.
    pub(crate) fn finalize(&mut self, base: u32, pdu: &mut PduLoop) -> Result<u32, Error> {
        self.logical_base = base;

        let size = self.data_size();

        if self.external_buffer {
            if self.data.len() < size {
                return Err(Error::Config(ConfigError::ExternalBufferTooSmall {
                    supplied: self.data.len(),
                    required: size,
                }));
            }
        } else {
            self.data.clear();
            self.data.resize(size, 0);
        }

        self.expected_working_counter = self
            .fmmus
            .iter()
            .map(DomainFmmu::wc_increment)
            .sum();

        self.datagrams.clear();

        let mut offset = 0usize;

        while offset < size {
            let chunk = (size - offset).min(MAX_LRW_PAYLOAD);

            let id = pdu.alloc("domain");

            pdu.get_mut(id).init_lrw(base + offset as u32, chunk)?;

            self.datagrams.push(id);

            offset += chunk;
        }

        log::debug!(
            "Domain {}: logical base {:#010x}, {} byte(s), {} datagram(s), expected WC {}",
            self.index,
            self.logical_base,
            size,
            self.datagrams.len(),
            self.expected_working_counter
        );

        base.checked_add(size as u32)
            .ok_or(Error::Config(ConfigError::DomainTooLarge))
    }

    /// Copy the image into the LRW datagrams and queue them for the next send.
    pub(crate) fn queue(&mut self, pdu: &mut PduLoop) -> Result<(), Error> {
        let mut offset = 0usize;

        for &id in &self.datagrams {
            // Re-init to reset lifecycle state; the payload buffer is already sized
            let len = pdu.get(id).len();
            let datagram = pdu.get_mut(id);

            datagram.init_lrw(self.logical_base + offset as u32, len)?;
            datagram
                .payload_mut()
                .copy_from_slice(&self.data[offset..offset + len]);

            pdu.queue(id);

            offset += len;
        }

        Ok(())
    }

    /// Interpret the responses of the last cycle: copy read data back into the image and derive
    /// the working counter state.
    pub(crate) fn process(&mut self, pdu: &mut PduLoop) {
        let mut sum = 0u16;
        let mut offset = 0usize;

        for &id in &self.datagrams {
            let datagram = pdu.get(id);
            let len = datagram.len();

            if datagram.state() == DatagramState::Received {
                self.data[offset..offset + len].copy_from_slice(datagram.payload());
                sum = sum.wrapping_add(datagram.working_counter());
            }

            offset += len;
        }

        self.working_counter = sum;

        self.wc_state = if sum == 0 && self.expected_working_counter != 0 {
            WcState::Zero
        } else if sum == self.expected_working_counter {
            WcState::Complete
        } else {
            WcState::Incomplete
        };

        if sum != self.last_logged_wc {
            log::debug!(
                "Domain {}: working counter changed to {}/{}",
                self.index,
                sum,
                self.expected_working_counter
            );

            self.last_logged_wc = sum;
        }
    }

    /// Current domain state.
    pub(crate) fn state(&self) -> DomainState {
        DomainState {
            working_counter: self.working_counter,
            wc_state: self.wc_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmmu_slices_are_shared_per_sync_manager() {
        let mut domain = Domain::new(0);

        let first = domain.fmmu_for(0, 3, PdoDirection::Input, 16).unwrap();
        let again = domain.fmmu_for(0, 3, PdoDirection::Input, 16).unwrap();
        let other = domain.fmmu_for(1, 2, PdoDirection::Output, 8).unwrap();

        assert_eq!(first, 0);
        assert_eq!(again, 0);
        assert_eq!(other, 16);
        assert_eq!(domain.fmmus.len(), 2);
        assert_eq!(domain.data_size(), 3);
    }

    #[test]
    fn bitwise_size_rounds_up() {
        let mut domain = Domain::new(0);

        domain.fmmu_for(0, 0, PdoDirection::Input, 3).unwrap();

        assert_eq!(domain.bit_size, 3);
        assert_eq!(domain.data_size(), 1);
    }

    #[test]
    fn expected_wc_rule() {
        let mut pdu = PduLoop::new();
        let mut domain = Domain::new(0);

        domain.fmmu_for(0, 3, PdoDirection::Input, 8).unwrap();
        domain.fmmu_for(0, 2, PdoDirection::Output, 8).unwrap();
        domain.fmmu_for(1, 3, PdoDirection::Input, 8).unwrap();

        domain.finalize(0, &mut pdu).unwrap();

        // 1 + 2 + 1
        assert_eq!(domain.expected_working_counter, 4);
    }

    #[test]
    fn finalize_assigns_contiguous_addresses() {
        let mut pdu = PduLoop::new();

        let mut first = Domain::new(0);
        let mut second = Domain::new(1);

        first.fmmu_for(0, 3, PdoDirection::Input, 32).unwrap();
        second.fmmu_for(1, 2, PdoDirection::Output, 16).unwrap();

        let next = first.finalize(0, &mut pdu).unwrap();
        let end = second.finalize(next, &mut pdu).unwrap();

        assert_eq!(next, 4);
        assert_eq!(second.logical_base, 4);
        assert_eq!(end, 6);
    }

    #[test]
    fn large_domain_splits_datagrams() {
        let mut pdu = PduLoop::new();
        let mut domain = Domain::new(0);

        domain
            .fmmu_for(0, 3, PdoDirection::Input, 2000 * 8)
            .unwrap();

        domain.finalize(0x0001_0000, &mut pdu).unwrap();

        assert_eq!(domain.datagrams.len(), 2);

        let first_len = pdu.get(domain.datagrams[0]).len();
        let second_len = pdu.get(domain.datagrams[1]).len();

        assert_eq!(first_len + second_len, 2000);
        assert_eq!(
            pdu.get(domain.datagrams[1]).command(),
            crate::command::Command::Lrw {
                address: 0x0001_0000 + first_len as u32
            }
        );
    }

    #[test]
    fn process_updates_wc_state() {
        let mut pdu = PduLoop::new();
        let mut domain = Domain::new(0);

        domain.fmmu_for(0, 3, PdoDirection::Input, 32).unwrap();
        domain.finalize(0, &mut pdu).unwrap();

        // No response at all
        domain.process(&mut pdu);
        assert_eq!(domain.state().wc_state, WcState::Zero);

        // Simulate a matched response with the expected working counter
        let id = domain.datagrams[0];

        pdu.get_mut(id).state = DatagramState::Received;
        pdu.get_mut(id).working_counter = 1;
        pdu.get_mut(id).payload_mut().copy_from_slice(&[1, 2, 3, 4]);

        domain.process(&mut pdu);

        assert_eq!(
            domain.state(),
            DomainState {
                working_counter: 1,
                wc_state: WcState::Complete
            }
        );
        assert_eq!(domain.data, [1, 2, 3, 4]);
    }

    #[test]
    fn oversize_registration_fails() {
        let mut domain = Domain::new(0);

        assert_eq!(
            domain.fmmu_for(0, 3, PdoDirection::Input, (MAX_DOMAIN_SIZE as u32 + 1) * 8),
            Err(Error::Config(ConfigError::DomainTooLarge))
        );
    }
}
