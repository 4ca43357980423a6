//! Process-wide driver state
//!
//! Everything the kernel keeps in module-level globals lives here: the device
//! class, the reserved character-device region, the id pool and the cdev map.
//!
//! Initialization order is class → chrdev region → id pool; teardown runs in
//! exactly the reverse order (field drop order below is load-bearing).

use std::sync::Arc;

use eid_iomem_chip::node::{parse_node_name, DevT, CLASS_NAME, REGION_NAME};

use crate::chrdev::{CdevMap, CharDevRegion};
use crate::class::DeviceClass;
use crate::config::ModuleParams;
use crate::device::DeviceRef;
use crate::error::Result;
use crate::ida::IdAllocator;

/// Driver-global state shared by the lifecycle manager and probe/remove
#[derive(Debug)]
pub struct Registry {
    params: ModuleParams,
    cdevs: CdevMap<DeviceRef>,
    ida: Arc<IdAllocator>,
    region: CharDevRegion,
    class: DeviceClass,
}

impl Registry {
    /// Create the class, reserve the minor range and set up the id pool
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters are invalid or no major number is
    /// available. Anything created before the failure is torn down again.
    pub fn load(params: ModuleParams) -> Result<Self> {
        params.validate()?;

        let class = DeviceClass::create(CLASS_NAME);
        let region = CharDevRegion::alloc(REGION_NAME, params.max_devices)?;
        let ida = Arc::new(IdAllocator::new(params.max_devices));

        tracing::debug!(
            "registry: class {}, region {}:0..{}",
            class.name(),
            region.major(),
            region.count()
        );

        Ok(Self {
            params,
            cdevs: CdevMap::new(),
            ida,
            region,
            class,
        })
    }

    /// Parameters the registry was loaded with
    pub const fn params(&self) -> &ModuleParams {
        &self.params
    }

    /// Id pool
    pub const fn ida(&self) -> &Arc<IdAllocator> {
        &self.ida
    }

    /// Reserved character-device region
    pub const fn region(&self) -> &CharDevRegion {
        &self.region
    }

    /// Device class
    pub const fn class(&self) -> &DeviceClass {
        &self.class
    }

    /// Resolve a device number to a new reference on its device
    pub fn lookup(&self, devt: DevT) -> Option<DeviceRef> {
        if !self.region.contains(devt) {
            return None;
        }
        self.cdevs.lookup(devt)
    }

    /// Device number behind a node name (`eid-iomem0` or `/dev/eid-iomem0`)
    pub fn node_devt(&self, name: &str) -> Option<DevT> {
        let devt = self.region.devt(parse_node_name(name)?)?;
        let base = name.rsplit('/').next().unwrap_or(name);
        (self.class.lookup(base) == Some(devt)).then_some(devt)
    }

    /// Names of all visible nodes
    pub fn nodes(&self) -> Vec<String> {
        self.class.device_names()
    }

    /// Bind the device's cdev, then make its node visible (`cdev_device_add`)
    pub(crate) fn cdev_device_add(&self, dev: &DeviceRef) -> Result<()> {
        self.cdevs.add(dev.devt(), dev.clone())?;

        if let Err(e) = self.class.add_device(dev.name(), dev.devt()) {
            drop(self.cdevs.remove(dev.devt()));
            return Err(e);
        }
        Ok(())
    }

    /// Hide the node, then unbind the cdev (`cdev_device_del`)
    ///
    /// Returns once no new `open` can reach the device.
    pub(crate) fn cdev_device_del(&self, dev: &DeviceRef) {
        self.class.remove_device(dev.name());
        let binding = self.cdevs.remove(dev.devt());
        drop(binding);
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if !self.cdevs.is_empty() {
            tracing::warn!("registry: {} device(s) still bound at teardown", self.cdevs.len());
        }
    }
}
