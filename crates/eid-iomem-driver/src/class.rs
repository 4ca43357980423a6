//! Device class
//!
//! Groups every visible node under one class name (`class_create`). Adding a
//! device to the class is what makes `/dev/eid-iomem<id>` appear; the class is
//! also how a node name is resolved back to its device number.

use std::collections::BTreeMap;

use eid_iomem_chip::node::DevT;
use parking_lot::RwLock;

use crate::error::{IomemError, Result};

/// Named collection of device nodes
#[derive(Debug)]
pub struct DeviceClass {
    name: String,
    devices: RwLock<BTreeMap<String, DevT>>,
}

impl DeviceClass {
    /// Create an empty class
    pub fn create(name: &str) -> Self {
        tracing::debug!("class {name}: created");
        Self {
            name: name.to_string(),
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make node `name` visible (`device_add`)
    pub(crate) fn add_device(&self, name: &str, devt: DevT) -> Result<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(name) {
            return Err(IomemError::registration(name, "name already exists in class"));
        }
        devices.insert(name.to_string(), devt);
        Ok(())
    }

    /// Hide node `name` (`device_del`)
    pub(crate) fn remove_device(&self, name: &str) -> Option<DevT> {
        self.devices.write().remove(name)
    }

    /// Device number behind node `name`
    pub fn lookup(&self, name: &str) -> Option<DevT> {
        self.devices.read().get(name).copied()
    }

    /// Names of all visible nodes, ordered by device number
    pub fn device_names(&self) -> Vec<String> {
        let devices = self.devices.read();
        let mut named: Vec<(&String, &DevT)> = devices.iter().collect();
        named.sort_by_key(|&(_, devt)| *devt);
        named.into_iter().map(|(name, _)| name.clone()).collect()
    }
}

impl Drop for DeviceClass {
    fn drop(&mut self) {
        tracing::debug!("class {}: destroyed", self.name);
    }
}
