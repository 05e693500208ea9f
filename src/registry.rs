//! Bounded registry of masters, the attach point for NIC driver glue.
//!
//! The registry replaces a module-global master table: the process creates one registry with a
//! fixed number of slots, NIC glue registers Ethernet ports into slots, and applications reserve
//! masters by index. A slot without a port is `Orphaned`; registering a port creates the master
//! and moves it to `Idle`; `request` hands the master to exactly one client until `release`.

use crate::device::EthernetPort;
use crate::error::{Error, Item};
use crate::master::{Master, MasterOptions, MasterPhase};

enum Slot<P> {
    /// No Ethernet device registered.
    Orphaned,
    /// Device registered, master available.
    Idle(Box<Master<P>>),
    /// Reserved by a client via [`Registry::request`].
    Requested,
}

/// A fixed size set of master slots.
pub struct Registry<P> {
    slots: Vec<Slot<P>>,
}

impl<P> Registry<P>
where
    P: EthernetPort,
{
    /// Create a registry with `capacity` master slots, all orphaned.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::Orphaned).collect(),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The phase of the master in `index`, or `Orphaned` for a portless slot.
    pub fn phase(&self, index: usize) -> Option<MasterPhase> {
        self.slots.get(index).map(|slot| match slot {
            Slot::Orphaned => MasterPhase::Orphaned,
            Slot::Idle(master) => master.phase(),
            Slot::Requested => MasterPhase::Operation,
        })
    }

    /// Register an Ethernet port into the first orphaned slot, creating its master.
    ///
    /// Called by the NIC driver glue at start-up. Returns the slot index.
    pub fn register_port(&mut self, port: P, options: MasterOptions) -> Result<usize, Error> {
        let index = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Slot::Orphaned))
            .ok_or(Error::Capacity(Item::Master))?;

        self.slots[index] = Slot::Idle(Box::new(Master::new(port, options)));

        log::info!("Registered Ethernet device as master {}", index);

        Ok(index)
    }

    /// Reserve the master at `index` for exclusive use.
    ///
    /// Fails with [`Error::Busy`] if another client holds it and
    /// [`Error::NotFound`] if the slot has no device.
    pub fn request(&mut self, index: usize) -> Result<Box<Master<P>>, Error> {
        let slot = self.slots.get_mut(index).ok_or(Error::NotFound {
            item: Item::Master,
            index: Some(index),
        })?;

        match core::mem::replace(slot, Slot::Requested) {
            Slot::Idle(master) => Ok(master),
            Slot::Orphaned => {
                *slot = Slot::Orphaned;

                Err(Error::NotFound {
                    item: Item::Master,
                    index: Some(index),
                })
            }
            Slot::Requested => Err(Error::Busy),
        }
    }

    /// Return a previously requested master.
    ///
    /// Detaches all configs, frees domains and puts the master back into the `Idle` phase.
    /// Releasing into a slot that was never requested simply overwrites it, so the call is
    /// idempotent with respect to repeated request/release cycles.
    pub fn release(&mut self, index: usize, mut master: Box<Master<P>>) -> Result<(), Error> {
        if index >= self.slots.len() {
            return Err(Error::NotFound {
                item: Item::Master,
                index: Some(index),
            });
        }

        master.reset();

        self.slots[index] = Slot::Idle(master);

        Ok(())
    }

    /// Tear a slot down entirely, returning its port to the NIC driver glue.
    pub fn unregister_port(&mut self, index: usize) -> Option<P> {
        let slot = self.slots.get_mut(index)?;

        match core::mem::replace(slot, Slot::Orphaned) {
            Slot::Idle(master) => Some(master.into_port()),
            other => {
                *slot = other;

                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LinkState;

    struct NullPort;

    impl EthernetPort for NullPort {
        fn link_state(&self) -> LinkState {
            LinkState::Down
        }

        fn transmit(&mut self, _frame: &[u8]) -> Result<(), ()> {
            Ok(())
        }

        fn poll(&mut self, _handler: &mut dyn FnMut(&[u8])) {}
    }

    #[test]
    fn request_release_lifecycle() {
        let mut registry = Registry::new(2);

        assert_eq!(registry.phase(0), Some(MasterPhase::Orphaned));

        // Requesting an orphaned slot fails
        assert!(matches!(
            registry.request(0),
            Err(Error::NotFound { item: Item::Master, .. })
        ));

        let index = registry
            .register_port(NullPort, MasterOptions::default())
            .unwrap();

        assert_eq!(index, 0);
        assert_eq!(registry.phase(0), Some(MasterPhase::Idle));

        let master = registry.request(0).unwrap();

        // Double request is refused
        assert!(matches!(registry.request(0), Err(Error::Busy)));

        registry.release(0, master).unwrap();

        assert!(registry.request(0).is_ok());
    }

    #[test]
    fn out_of_slots() {
        let mut registry = Registry::new(1);

        registry
            .register_port(NullPort, MasterOptions::default())
            .unwrap();

        assert_eq!(
            registry
                .register_port(NullPort, MasterOptions::default())
                .err(),
            Some(Error::Capacity(Item::Master))
        );
    }
}
