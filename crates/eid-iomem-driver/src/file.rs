//! Open file on a device node
//!
//! `open` resolves the node's device number through the registry and keeps a
//! reference to the device for as long as the file stays open. `mmap` hands
//! the request to the P2P provider for the device's card.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eid_iomem_chip::node::DevT;

use crate::device::DeviceRef;
use crate::error::{IomemError, Result};
use crate::p2pdma::{P2pMapping, P2pMemory, VmArea};
use crate::registry::Registry;

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an open file, used by the P2P provider to track it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(u64);

impl FileId {
    /// A fresh, process-unique id
    pub fn next() -> Self {
        Self(NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// An open `/dev/eid-iomem*` file
///
/// Holds a device reference (released on drop) and a reference on the
/// registry, so driver state outlives every open file.
#[derive(Debug)]
pub struct IomemFile {
    id: FileId,
    device: DeviceRef,
    p2p: Arc<dyn P2pMemory>,
    _registry: Arc<Registry>,
}

impl IomemFile {
    /// Open the node with device number `devt`
    ///
    /// # Errors
    ///
    /// Returns `IomemError::NoSuchDevice` if no device is bound to `devt`
    /// (for example because the card was removed), or the P2P provider's
    /// open-time error.
    pub fn open(registry: &Arc<Registry>, p2p: &Arc<dyn P2pMemory>, devt: DevT) -> Result<Self> {
        let device = registry
            .lookup(devt)
            .ok_or_else(|| IomemError::no_such_device(devt))?;

        let id = FileId::next();
        p2p.file_open(device.card(), id)?;

        tracing::debug!("{}: opened as {id}", device.name());

        Ok(Self {
            id,
            device,
            p2p: Arc::clone(p2p),
            _registry: Arc::clone(registry),
        })
    }

    /// Map part of the card's P2P window
    ///
    /// # Errors
    ///
    /// Returns `IomemError::InvalidArgument` if `vma` does not fit the window,
    /// or `IomemError::NotSupported` if the provider declines the mapping.
    pub fn mmap(&self, vma: &VmArea) -> Result<Box<dyn P2pMapping>> {
        self.p2p.mmap(self.device.card(), self.id, vma)
    }

    /// File identity
    pub const fn id(&self) -> FileId {
        self.id
    }

    /// Device this file is bound to
    pub const fn device(&self) -> &DeviceRef {
        &self.device
    }
}

impl Drop for IomemFile {
    fn drop(&mut self) {
        self.p2p.file_release(self.device.card(), self.id);
        tracing::debug!("{}: closed {}", self.device.name(), self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{BarInfo, PciCard};
    use crate::config::ModuleParams;
    use crate::device::IomemDevice;
    use crate::p2pdma::HostP2pMemory;

    const WINDOW: u64 = 1 << 20;

    struct Fixture {
        registry: Arc<Registry>,
        host: Arc<HostP2pMemory>,
        p2p: Arc<dyn P2pMemory>,
        card: Arc<PciCard>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::load(ModuleParams::new(4)).unwrap());
        let host = Arc::new(HostP2pMemory::new());
        let p2p: Arc<dyn P2pMemory> = host.clone();
        let card = Arc::new(PciCard::new("0000:01:00.0", 0x1de5, 0x1000).with_bar(0, BarInfo::memory(0, WINDOW)));
        p2p.add_resource(&card, 0, 0, 0).unwrap();
        Fixture {
            registry,
            host,
            p2p,
            card,
        }
    }

    #[test]
    fn open_takes_a_device_reference() {
        let fx = fixture();
        let dev = IomemDevice::create(&fx.registry, &fx.card).unwrap();

        let file = IomemFile::open(&fx.registry, &fx.p2p, dev.devt()).unwrap();
        assert_eq!(file.device().id(), dev.id());
        assert_eq!(dev.refcount(), 3);
        assert_eq!(fx.host.open_files(&fx.card), vec![file.id()]);

        drop(file);
        assert_eq!(dev.refcount(), 2);
        assert!(fx.host.open_files(&fx.card).is_empty());
        dev.destroy(&fx.registry);
    }

    #[test]
    fn open_after_destroy_fails() {
        let fx = fixture();
        let dev = IomemDevice::create(&fx.registry, &fx.card).unwrap();
        let devt = dev.devt();
        dev.destroy(&fx.registry);

        let err = IomemFile::open(&fx.registry, &fx.p2p, devt).unwrap_err();
        assert!(matches!(err, IomemError::NoSuchDevice { .. }));
    }

    #[test]
    fn mmap_is_confined_to_the_window() {
        let fx = fixture();
        let dev = IomemDevice::create(&fx.registry, &fx.card).unwrap();
        let file = IomemFile::open(&fx.registry, &fx.p2p, dev.devt()).unwrap();

        let map = file.mmap(&VmArea::shared(0, WINDOW as usize)).unwrap();
        assert_eq!(map.len(), WINDOW as usize);

        let err = file.mmap(&VmArea::shared(0, WINDOW as usize + 1)).unwrap_err();
        assert!(matches!(err, IomemError::InvalidArgument { .. }));

        drop(file);
        dev.destroy(&fx.registry);
    }

    #[test]
    fn file_outlives_destroy() {
        let fx = fixture();
        let dev = IomemDevice::create(&fx.registry, &fx.card).unwrap();
        let file = IomemFile::open(&fx.registry, &fx.p2p, dev.devt()).unwrap();
        dev.destroy(&fx.registry);

        assert!(fx.registry.ida().is_allocated(0));
        let map = file.mmap(&VmArea::shared(0, 4096)).unwrap();
        map.write_u32(0, 7).unwrap();

        drop(file);
        assert!(!fx.registry.ida().is_allocated(0));
        assert_eq!(map.read_u32(0).unwrap(), 7);
    }
}
