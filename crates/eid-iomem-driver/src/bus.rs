//! PCI bus model
//!
//! Delivers hot-plug events to drivers the way the PCI core does: a card that
//! appears is probed by the first registered driver whose id table matches;
//! a card that disappears is removed from the driver it is bound to. After a
//! remove or a failed probe, the card's managed resources are released and
//! the card is disabled.
//!
//! Events are serialized by the bus lock, so at most one probe or remove is in
//! flight per card.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use eid_iomem_chip::pcie::PciDeviceId;
use parking_lot::Mutex;

use crate::card::PciCard;
use crate::error::{IomemError, Result};

/// A driver the bus can bind cards to
pub trait PciDriver: Debug + Send + Sync {
    /// Driver name, unique on the bus
    fn name(&self) -> &str;

    /// Cards this driver handles
    fn id_table(&self) -> &[PciDeviceId];

    /// Bind to `card`
    ///
    /// # Errors
    ///
    /// Returns an error if the card cannot be brought up; the card is left
    /// unbound.
    fn probe(&self, card: &Arc<PciCard>, id: &PciDeviceId) -> Result<()>;

    /// Unbind from `card`. Must always complete.
    fn remove(&self, card: &Arc<PciCard>);
}

#[derive(Debug)]
struct Slot {
    card: Arc<PciCard>,
    driver: Option<Arc<dyn PciDriver>>,
}

#[derive(Debug, Default)]
struct BusState {
    slots: BTreeMap<String, Slot>,
    drivers: Vec<Arc<dyn PciDriver>>,
}

/// In-process PCI bus
#[derive(Debug, Default)]
pub struct PciBus {
    state: Mutex<BusState>,
}

impl PciBus {
    /// Empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver and probe every unbound card it matches
    ///
    /// Probe failures are logged; they do not fail the registration.
    ///
    /// # Errors
    ///
    /// Returns `IomemError::DeviceRegistrationFailure` if a driver with the
    /// same name is already registered.
    pub fn register_driver(&self, driver: Arc<dyn PciDriver>) -> Result<()> {
        let mut state = self.state.lock();
        if state.drivers.iter().any(|d| d.name() == driver.name()) {
            return Err(IomemError::registration(driver.name(), "driver already registered"));
        }
        state.drivers.push(Arc::clone(&driver));

        for slot in state.slots.values_mut().filter(|s| s.driver.is_none()) {
            if let Err(e) = Self::try_bind(slot, &driver) {
                tracing::warn!("{}: probe with {} failed: {e}", slot.card.address(), driver.name());
            }
        }

        tracing::debug!("bus: registered driver {}", driver.name());
        Ok(())
    }

    /// Unregister a driver, removing it from every card it is bound to
    pub fn unregister_driver(&self, name: &str) {
        let mut state = self.state.lock();
        for slot in state.slots.values_mut() {
            if slot.driver.as_ref().is_some_and(|d| d.name() == name) {
                Self::unbind(slot);
            }
        }
        state.drivers.retain(|d| d.name() != name);
        tracing::debug!("bus: unregistered driver {name}");
    }

    /// A card appeared (hot-plug arrival)
    ///
    /// # Errors
    ///
    /// Returns `IomemError::DeviceRegistrationFailure` if a card with the same
    /// address is already on the bus, or the matching driver's probe error.
    /// A card whose probe failed stays on the bus, unbound.
    pub fn add_card(&self, card: Arc<PciCard>) -> Result<()> {
        let mut state = self.state.lock();
        let address = card.address().to_string();
        if state.slots.contains_key(&address) {
            return Err(IomemError::registration(&address, "address already on the bus"));
        }
        card.set_present(true);
        tracing::debug!(
            "bus: {address} arrived ({:04x}:{:04x})",
            card.vendor(),
            card.device()
        );

        let drivers = state.drivers.clone();
        let slot = state
            .slots
            .entry(address)
            .or_insert(Slot { card, driver: None });

        for driver in &drivers {
            if Self::try_bind(slot, driver)? {
                break;
            }
        }
        Ok(())
    }

    /// A card disappeared (hot-plug departure)
    ///
    /// Returns the card, or `None` if nothing was at `address`.
    pub fn remove_card(&self, address: &str) -> Option<Arc<PciCard>> {
        let mut state = self.state.lock();
        let mut slot = state.slots.remove(address)?;
        slot.card.set_present(false);
        Self::unbind(&mut slot);
        tracing::debug!("bus: {address} departed");
        Some(slot.card)
    }

    /// Card at `address`
    pub fn card(&self, address: &str) -> Option<Arc<PciCard>> {
        self.state.lock().slots.get(address).map(|s| Arc::clone(&s.card))
    }

    /// Every card on the bus, ordered by address
    pub fn cards(&self) -> Vec<Arc<PciCard>> {
        self.state
            .lock()
            .slots
            .values()
            .map(|s| Arc::clone(&s.card))
            .collect()
    }

    /// Name of the driver bound to the card at `address`
    pub fn bound_driver(&self, address: &str) -> Option<String> {
        self.state
            .lock()
            .slots
            .get(address)?
            .driver
            .as_ref()
            .map(|d| d.name().to_string())
    }

    /// Probe `slot` with `driver` if it matches. Returns whether it bound.
    fn try_bind(slot: &mut Slot, driver: &Arc<dyn PciDriver>) -> Result<bool> {
        let card = &slot.card;
        let Some(id) = driver
            .id_table()
            .iter()
            .find(|id| id.matches(card.vendor(), card.device()))
        else {
            return Ok(false);
        };

        match driver.probe(card, id) {
            Ok(()) => {
                slot.driver = Some(Arc::clone(driver));
                tracing::debug!("bus: {} bound to {}", card.address(), driver.name());
                Ok(true)
            }
            Err(e) => {
                card.release_devres();
                card.disable();
                Err(e)
            }
        }
    }

    fn unbind(slot: &mut Slot) {
        if let Some(driver) = slot.driver.take() {
            driver.remove(&slot.card);
            slot.card.release_devres();
            slot.card.disable();
            tracing::debug!("bus: {} unbound from {}", slot.card.address(), driver.name());
        }
    }
}
