//! Probe/remove controller and module lifecycle
//!
//! [`EidIomemDriver`] is the PCI driver bound to IOMEM cards. Probing a card
//! walks it through
//!
//! ```text
//! Unprobed → Enabling → ResourceRegistered → Registered
//! ```
//!
//! and any failure drops it back to `Unprobed` with everything acquired so far
//! undone. Removal takes the device stashed on the card and destroys it;
//! the card ends in `Removed`.
//!
//! [`EidIomemModule`] is module init/exit: it loads the registry, registers
//! the driver on a bus, and tears both down in reverse on drop.

use std::sync::Arc;

use eid_iomem_chip::bar::{P2P_BAR, P2P_OFFSET, P2P_SIZE};
use eid_iomem_chip::node::DevT;
use eid_iomem_chip::pcie::{PciDeviceId, DRIVER_NAME, ID_TABLE};

use crate::bus::{PciBus, PciDriver};
use crate::card::{PciCard, ProbeState};
use crate::config::ModuleParams;
use crate::device::IomemDevice;
use crate::error::{IomemError, Result};
use crate::file::IomemFile;
use crate::p2pdma::P2pMemory;
use crate::registry::Registry;

/// PCI driver for Eideticom IOMEM cards
#[derive(Debug)]
pub struct EidIomemDriver {
    registry: Arc<Registry>,
    p2p: Arc<dyn P2pMemory>,
}

impl EidIomemDriver {
    /// Driver over an already loaded registry
    pub fn new(registry: Arc<Registry>, p2p: Arc<dyn P2pMemory>) -> Self {
        Self { registry, p2p }
    }

    /// Driver-global state
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// P2P memory provider
    pub const fn p2p(&self) -> &Arc<dyn P2pMemory> {
        &self.p2p
    }

    /// Open the node with device number `devt`
    ///
    /// # Errors
    ///
    /// Returns `IomemError::NoSuchDevice` if nothing is bound to `devt`.
    pub fn open(&self, devt: DevT) -> Result<IomemFile> {
        IomemFile::open(&self.registry, &self.p2p, devt)
    }

    /// Open a node by name (`eid-iomem0` or `/dev/eid-iomem0`)
    ///
    /// # Errors
    ///
    /// Returns `IomemError::NoSuchDevice` if the node does not exist.
    pub fn open_node(&self, name: &str) -> Result<IomemFile> {
        let devt = self.registry.node_devt(name).ok_or_else(|| IomemError::NoSuchDevice {
            devt: name.to_string(),
        })?;
        self.open(devt)
    }

    /// Names of all visible nodes
    pub fn nodes(&self) -> Vec<String> {
        self.registry.nodes()
    }

    fn add_p2p_resource(&self, card: &Arc<PciCard>) -> Result<()> {
        self.p2p
            .add_resource(card, P2P_BAR, P2P_SIZE, P2P_OFFSET)
            .map_err(|e| match e {
                IomemError::ResourceAddFailure { .. } => e,
                other => IomemError::resource_add(card.address(), other.to_string()),
            })?;

        let p2p = Arc::clone(&self.p2p);
        let weak = Arc::downgrade(card);
        card.devm_add_action("p2pdma", move || {
            if let Some(card) = weak.upgrade() {
                p2p.release(&card);
            }
        });
        Ok(())
    }
}

impl PciDriver for EidIomemDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn id_table(&self) -> &[PciDeviceId] {
        ID_TABLE
    }

    fn probe(&self, card: &Arc<PciCard>, id: &PciDeviceId) -> Result<()> {
        let address = card.address();
        tracing::debug!("{address}: probing ({id})");

        card.set_probe_state(ProbeState::Enabling);
        if let Err(e) = card.enable() {
            tracing::error!("{address}: unable to enable device: {e}");
            card.set_probe_state(ProbeState::Unprobed);
            return Err(e);
        }

        if let Err(e) = self.add_p2p_resource(card) {
            tracing::error!("{address}: unable to add p2p resource: {e}");
            card.disable();
            card.set_probe_state(ProbeState::Unprobed);
            return Err(e);
        }
        self.p2p.publish(card, true);
        card.set_probe_state(ProbeState::ResourceRegistered);

        let dev = match IomemDevice::create(&self.registry, card) {
            Ok(dev) => dev,
            Err(e) => {
                tracing::error!("{address}: unable to create device: {e}");
                card.disable();
                card.set_probe_state(ProbeState::Unprobed);
                return Err(e);
            }
        };

        if let Err(dev) = card.set_drvdata(dev) {
            tracing::error!("{address}: driver data already set, not binding {}", dev.name());
            dev.destroy(&self.registry);
            card.disable();
            card.set_probe_state(ProbeState::Unprobed);
            return Err(IomemError::registration(address, "driver data already set"));
        }
        card.set_probe_state(ProbeState::Registered);
        Ok(())
    }

    fn remove(&self, card: &Arc<PciCard>) {
        match card.take_drvdata::<IomemDevice>() {
            Some(dev) => dev.destroy(&self.registry),
            None => tracing::warn!("{}: remove without a bound device", card.address()),
        }
        card.set_probe_state(ProbeState::Removed);
    }
}

/// Loaded driver: registry plus bus registration
///
/// Dropping the module unregisters the driver (removing every bound card)
/// and then releases the registry.
#[derive(Debug)]
pub struct EidIomemModule {
    bus: Arc<PciBus>,
    driver: Arc<EidIomemDriver>,
}

impl EidIomemModule {
    /// Module init: class, chrdev region, then driver registration
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters are invalid, no major number is
    /// free, or the driver is already registered on `bus`. Whatever was set
    /// up before the failure is torn down.
    pub fn load(bus: &Arc<PciBus>, params: ModuleParams, p2p: Arc<dyn P2pMemory>) -> Result<Self> {
        let registry = Arc::new(Registry::load(params)?);
        let driver = Arc::new(EidIomemDriver::new(registry, p2p));

        bus.register_driver(Arc::clone(&driver) as Arc<dyn PciDriver>)?;

        tracing::info!("{DRIVER_NAME}: module loaded (max_devices = {})", params.max_devices);

        Ok(Self {
            bus: Arc::clone(bus),
            driver,
        })
    }

    /// The registered driver
    pub const fn driver(&self) -> &Arc<EidIomemDriver> {
        &self.driver
    }

    /// Module exit
    pub fn unload(self) {
        drop(self);
    }
}

impl Drop for EidIomemModule {
    fn drop(&mut self) {
        self.bus.unregister_driver(self.driver.name());
        tracing::info!("{DRIVER_NAME}: module unloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::BarInfo;
    use crate::p2pdma::HostP2pMemory;

    fn setup(max: u32) -> (Arc<HostP2pMemory>, EidIomemDriver) {
        let host = Arc::new(HostP2pMemory::new());
        let registry = Arc::new(Registry::load(ModuleParams::new(max)).unwrap());
        let driver = EidIomemDriver::new(registry, host.clone());
        (host, driver)
    }

    fn iomem(address: &str, bar0: BarInfo) -> Arc<PciCard> {
        Arc::new(PciCard::new(address, 0x1de5, 0x1000).with_bar(0, bar0))
    }

    #[test]
    fn probe_and_remove() {
        let (host, driver) = setup(2);
        let card = iomem("0000:01:00.0", BarInfo::memory(0, 1 << 20));

        driver.probe(&card, &ID_TABLE[0]).unwrap();
        assert_eq!(card.probe_state(), ProbeState::Registered);
        assert!(card.is_enabled());
        assert!(host.is_published(&card));
        assert_eq!(driver.nodes(), vec!["eid-iomem0".to_string()]);

        driver.remove(&card);
        assert_eq!(card.probe_state(), ProbeState::Removed);
        assert!(driver.nodes().is_empty());
        assert!(!card.has_drvdata());
    }

    #[test]
    fn enable_failure_leaves_nothing_behind() {
        let (host, driver) = setup(2);
        let card = iomem("0000:01:00.0", BarInfo::memory(0, 1 << 20));
        card.set_present(false);

        let err = driver.probe(&card, &ID_TABLE[0]).unwrap_err();
        assert!(matches!(err, IomemError::PciEnableFailure { .. }));
        assert_eq!(card.probe_state(), ProbeState::Unprobed);
        assert!(!host.has_resource(&card));
        assert!(driver.nodes().is_empty());
    }

    #[test]
    fn resource_failure_disables_card() {
        let (host, driver) = setup(2);
        let card = iomem("0000:01:00.0", BarInfo::io(0x7000, 128));

        let err = driver.probe(&card, &ID_TABLE[0]).unwrap_err();
        assert!(matches!(err, IomemError::ResourceAddFailure { .. }));
        assert!(!card.is_enabled());
        assert!(!host.has_resource(&card));
        assert_eq!(card.probe_state(), ProbeState::Unprobed);
    }

    #[test]
    fn create_failure_disables_card_and_keeps_resource_for_bus() {
        let (host, driver) = setup(1);
        let first = iomem("0000:01:00.0", BarInfo::memory(0, 1 << 20));
        let second = iomem("0000:02:00.0", BarInfo::memory(0, 1 << 20));
        driver.probe(&first, &ID_TABLE[0]).unwrap();

        let err = driver.probe(&second, &ID_TABLE[0]).unwrap_err();
        assert!(matches!(err, IomemError::ResourceExhausted { .. }));
        assert!(!second.is_enabled());
        assert!(host.has_resource(&second));
        assert_eq!(Arc::strong_count(&second), 1);

        second.release_devres();
        assert!(!host.has_resource(&second));

        driver.remove(&first);
    }

    #[test]
    fn occupied_drvdata_fails_probe_and_unbinds_node() {
        let (_host, driver) = setup(2);
        let card = iomem("0000:01:00.0", BarInfo::memory(0, 1 << 20));
        card.set_drvdata("foreign").unwrap();

        let err = driver.probe(&card, &ID_TABLE[0]).unwrap_err();
        assert!(matches!(err, IomemError::DeviceRegistrationFailure { .. }));
        assert!(driver.nodes().is_empty());
        assert_eq!(driver.registry().ida().in_use(), 0);
        assert!(!card.is_enabled());
        assert_eq!(card.probe_state(), ProbeState::Unprobed);
        assert_eq!(card.take_drvdata::<&'static str>(), Some("foreign"));
    }

    #[test]
    fn open_node_by_name() {
        let (_host, driver) = setup(2);
        let card = iomem("0000:01:00.0", BarInfo::memory(0, 1 << 20));
        driver.probe(&card, &ID_TABLE[0]).unwrap();

        let file = driver.open_node("/dev/eid-iomem0").unwrap();
        assert_eq!(file.device().name(), "eid-iomem0");
        assert!(matches!(
            driver.open_node("eid-iomem1"),
            Err(IomemError::NoSuchDevice { .. })
        ));

        drop(file);
        driver.remove(&card);
    }
}
