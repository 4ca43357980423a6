//! Character-device numbers and the cdev map
//!
//! [`CharDevRegion`] reserves a major number and a contiguous minor range
//! (`alloc_chrdev_region`). [`CdevMap`] is the table an `open` on a device
//! number is resolved through (`cdev_add` / `cdev_del` / `kobj_lookup`).
//!
//! Lookups run under the map's read lock and clone the stored reference
//! before the lock is dropped, so a concurrent removal either sees the lookup
//! finish first or makes it fail. Removal takes the write lock and therefore
//! waits for lookups already in flight.

use std::collections::{BTreeMap, BTreeSet};

use eid_iomem_chip::node::DevT;
use parking_lot::{const_mutex, Mutex, RwLock};

use crate::error::{IomemError, Result};

/// Majors handed out to regions in this process.
static MAJORS: Mutex<BTreeSet<u32>> = const_mutex(BTreeSet::new());

/// Dynamic major ranges, searched from the top down like the kernel does.
const DYNAMIC_MAJORS: [(u32, u32); 2] = [(234, 254), (384, 511)];

/// A reserved range of character-device numbers
#[derive(Debug)]
pub struct CharDevRegion {
    name: String,
    major: u32,
    count: u32,
}

impl CharDevRegion {
    /// Reserve `count` minors under a dynamically chosen major
    ///
    /// # Errors
    ///
    /// Returns `IomemError::DeviceRegistrationFailure` if every dynamic major
    /// is taken.
    pub fn alloc(name: &str, count: u32) -> Result<Self> {
        let mut majors = MAJORS.lock();

        let major = DYNAMIC_MAJORS
            .iter()
            .flat_map(|&(lo, hi)| (lo..=hi).rev())
            .find(|major| !majors.contains(major))
            .ok_or_else(|| IomemError::registration(name, "no free dynamic major"))?;

        majors.insert(major);
        tracing::debug!("{name}: reserved {major}:0..{count}");

        Ok(Self {
            name: name.to_string(),
            major,
            count,
        })
    }

    /// Region name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Major number shared by every node in the region
    pub const fn major(&self) -> u32 {
        self.major
    }

    /// Number of reserved minors
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Device number for `minor`, if it lies inside the region
    pub const fn devt(&self, minor: u32) -> Option<DevT> {
        if minor < self.count {
            Some(DevT::new(self.major, minor))
        } else {
            None
        }
    }

    /// Whether `devt` belongs to this region
    pub const fn contains(&self, devt: DevT) -> bool {
        devt.major() == self.major && devt.minor() < self.count
    }
}

impl Drop for CharDevRegion {
    fn drop(&mut self) {
        MAJORS.lock().remove(&self.major);
        tracing::debug!("{}: released major {}", self.name, self.major);
    }
}

/// Device-number → object table consulted by `open`
#[derive(Debug)]
pub struct CdevMap<T> {
    entries: RwLock<BTreeMap<DevT, T>>,
}

impl<T> Default for CdevMap<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: Clone> CdevMap<T> {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `devt` to `value`
    ///
    /// # Errors
    ///
    /// Returns `IomemError::DeviceRegistrationFailure` if `devt` is already bound.
    pub fn add(&self, devt: DevT, value: T) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(&devt) {
            return Err(IomemError::registration(devt.to_string(), "device number busy"));
        }
        entries.insert(devt, value);
        Ok(())
    }

    /// Unbind `devt`, returning the stored value
    ///
    /// Blocks until lookups in progress have released the map. Once this
    /// returns, no lookup of `devt` can succeed.
    pub fn remove(&self, devt: DevT) -> Option<T> {
        self.entries.write().remove(&devt)
    }

    /// Resolve `devt` to a clone of its bound value
    pub fn lookup(&self, devt: DevT) -> Option<T> {
        self.entries.read().get(&devt).cloned()
    }

    /// Whether `devt` is bound
    pub fn contains(&self, devt: DevT) -> bool {
        self.entries.read().contains_key(&devt)
    }

    /// Number of bound device numbers
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is bound
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
