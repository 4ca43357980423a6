//! PCI card model
//!
//! A [`PciCard`] is the bus device this driver binds to. It is shared as
//! `Arc<PciCard>`: the bus holds one reference, every device object created
//! for it holds another (`pci_dev_get` / `pci_dev_put`).
//!
//! Cards discovered through sysfs carry their sysfs directory; enabling such a
//! card writes its `enable` attribute. Cards built in-process are enabled by
//! flipping a flag.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use eid_iomem_chip::bar::{flags, BarKind, BAR_COUNT};
use parking_lot::Mutex;

use crate::error::{IomemError, Result};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Identity of one card object
///
/// Unlike the PCI address, which a replacement card inherits, an instance id
/// is never reused within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CardId(u64);

impl std::fmt::Display for CardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "card#{}", self.0)
    }
}

/// Binding state of a card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Not bound (initial, or after a failed probe)
    Unprobed,
    /// Being enabled on the bus
    Enabling,
    /// Window registered and published as P2P memory
    ResourceRegistered,
    /// Device node live
    Registered,
    /// Device torn down after departure
    Removed,
}

/// One Base Address Register as decoded from config space / sysfs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarInfo {
    /// Bus address of the BAR
    pub start: u64,
    /// Length in bytes
    pub len: u64,
    /// `IORESOURCE_*` flag bits
    pub flags: u64,
}

impl BarInfo {
    /// A prefetchable memory BAR of `len` bytes at `start`
    #[must_use]
    pub const fn memory(start: u64, len: u64) -> Self {
        Self {
            start,
            len,
            flags: flags::MEM | flags::PREFETCH,
        }
    }

    /// An I/O port BAR
    #[must_use]
    pub const fn io(start: u64, len: u64) -> Self {
        Self {
            start,
            len,
            flags: flags::IO,
        }
    }

    /// Address space this BAR decodes
    #[must_use]
    pub const fn kind(&self) -> BarKind {
        if self.flags & flags::IO != 0 {
            BarKind::Io
        } else {
            BarKind::Memory
        }
    }
}

type DevresAction = Box<dyn FnOnce() + Send>;

/// A PCI function seen on the bus
pub struct PciCard {
    instance: CardId,
    address: String,
    vendor: u16,
    device: u16,
    bars: [Option<BarInfo>; BAR_COUNT],
    sysfs: Option<PathBuf>,
    present: AtomicBool,
    enabled: AtomicBool,
    state: Mutex<ProbeState>,
    drvdata: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    devres: Mutex<Vec<(&'static str, DevresAction)>>,
}

impl std::fmt::Debug for PciCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PciCard")
            .field("instance", &self.instance)
            .field("address", &self.address)
            .field("id", &format_args!("{:04x}:{:04x}", self.vendor, self.device))
            .field("bars", &self.bars)
            .field("sysfs", &self.sysfs)
            .field("present", &self.is_present())
            .field("enabled", &self.is_enabled())
            .field("state", &self.probe_state())
            .finish_non_exhaustive()
    }
}

impl PciCard {
    /// Create a card at PCI address `address` (e.g. `0000:01:00.0`)
    pub fn new(address: impl Into<String>, vendor: u16, device: u16) -> Self {
        Self {
            instance: CardId(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)),
            address: address.into(),
            vendor,
            device,
            bars: [None; BAR_COUNT],
            sysfs: None,
            present: AtomicBool::new(true),
            enabled: AtomicBool::new(false),
            state: Mutex::new(ProbeState::Unprobed),
            drvdata: Mutex::new(None),
            devres: Mutex::new(Vec::new()),
        }
    }

    /// Attach BAR `index`. Indices past the last BAR are ignored.
    #[must_use]
    pub fn with_bar(mut self, index: usize, bar: BarInfo) -> Self {
        if let Some(slot) = self.bars.get_mut(index) {
            *slot = Some(bar);
        }
        self
    }

    /// Back this card by a sysfs device directory
    #[must_use]
    pub fn with_sysfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.sysfs = Some(path.into());
        self
    }

    /// Process-unique identity of this card object
    pub const fn instance(&self) -> CardId {
        self.instance
    }

    /// PCI address (domain:bus:device.function)
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Vendor ID
    pub const fn vendor(&self) -> u16 {
        self.vendor
    }

    /// Device ID
    pub const fn device(&self) -> u16 {
        self.device
    }

    /// BAR `index`, if the card implements it
    pub fn bar(&self, index: usize) -> Option<&BarInfo> {
        self.bars.get(index).and_then(Option::as_ref)
    }

    /// Sysfs directory backing this card, if any
    pub fn sysfs_path(&self) -> Option<&Path> {
        self.sysfs.as_deref()
    }

    /// Whether the card is still physically present
    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    /// Mark the card as (not) present. Cleared by the bus on departure.
    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::Release);
    }

    /// Whether the card is enabled for memory decoding / bus mastering
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable the card (`pci_enable_device`)
    ///
    /// # Errors
    ///
    /// Returns `IomemError::PciEnableFailure` if the card is gone, has no BARs
    /// assigned, or its sysfs `enable` attribute cannot be written.
    pub fn enable(&self) -> Result<()> {
        if !self.is_present() {
            return Err(IomemError::pci_enable(&self.address, "device not present"));
        }
        if self.bars.iter().all(Option::is_none) {
            return Err(IomemError::pci_enable(&self.address, "no BARs assigned"));
        }
        if let Some(dir) = &self.sysfs {
            let path = dir.join("enable");
            std::fs::write(&path, "1").map_err(|e| {
                IomemError::pci_enable(&self.address, format!("{}: {e}", path.display()))
            })?;
        }

        self.enabled.store(true, Ordering::Release);
        tracing::debug!("{}: enabled", self.address);
        Ok(())
    }

    /// Disable the card (`pci_disable_device`). Idempotent.
    pub fn disable(&self) {
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(dir) = &self.sysfs {
            if let Err(e) = std::fs::write(dir.join("enable"), "0") {
                tracing::warn!("{}: failed to disable via sysfs: {e}", self.address);
            }
        }
        tracing::debug!("{}: disabled", self.address);
    }

    /// Current driver binding state
    pub fn probe_state(&self) -> ProbeState {
        *self.state.lock()
    }

    pub(crate) fn set_probe_state(&self, state: ProbeState) {
        let mut current = self.state.lock();
        tracing::trace!("{}: {:?} -> {state:?}", self.address, *current);
        *current = state;
    }

    /// Stash driver-private data on the card (`pci_set_drvdata`)
    ///
    /// # Errors
    ///
    /// Hands `data` back if the slot is already occupied; the stored value is
    /// left in place.
    pub fn set_drvdata<T: Any + Send + Sync>(&self, data: T) -> std::result::Result<(), T> {
        let mut slot = self.drvdata.lock();
        if slot.is_some() {
            tracing::warn!("{}: driver data already set", self.address);
            return Err(data);
        }
        *slot = Some(Box::new(data));
        Ok(())
    }

    /// Take driver-private data back, if it is a `T`
    pub fn take_drvdata<T: Any + Send + Sync>(&self) -> Option<T> {
        let mut slot = self.drvdata.lock();
        match slot.take()?.downcast::<T>() {
            Ok(data) => Some(*data),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }

    /// Whether driver-private data is attached
    pub fn has_drvdata(&self) -> bool {
        self.drvdata.lock().is_some()
    }

    /// Register a managed release action (`devm_add_action`)
    ///
    /// Actions run in reverse registration order when the bus detaches the
    /// driver or a probe fails.
    pub fn devm_add_action(&self, name: &'static str, action: impl FnOnce() + Send + 'static) {
        self.devres.lock().push((name, Box::new(action)));
    }

    /// Run and drop all managed release actions
    pub fn release_devres(&self) {
        let actions = std::mem::take(&mut *self.devres.lock());
        for (name, action) in actions.into_iter().rev() {
            tracing::debug!("{}: devres release {name}", self.address);
            action();
        }
    }
}
