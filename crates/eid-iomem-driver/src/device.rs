//! Device lifecycle
//!
//! One [`IomemDevice`] exists per bound card. Its reference count is the
//! strong count of the shared [`DeviceRef`]: the registry holds one reference
//! (the `IomemDevice` itself), the cdev binding holds one, and every open file
//! holds one. When the last reference drops, the release path runs exactly
//! once: the id goes back to the pool and the card reference is put.

use std::sync::Arc;

use eid_iomem_chip::node::{node_name, DevT};

use crate::card::PciCard;
use crate::error::{IomemError, Result};
use crate::ida::IdAllocator;
use crate::registry::Registry;

#[derive(Debug)]
struct DeviceInner {
    id: u32,
    name: String,
    devt: DevT,
    card: Arc<PciCard>,
    ida: Arc<IdAllocator>,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        tracing::debug!("{}: released", self.name);
        self.ida.release(self.id);
    }
}

/// Counted reference to a live device (`get_device`)
#[derive(Debug, Clone)]
pub struct DeviceRef(Arc<DeviceInner>);

impl DeviceRef {
    /// Allocator id (also the minor number)
    pub fn id(&self) -> u32 {
        self.0.id
    }

    /// Node name, `eid-iomem<id>`
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Character-device number
    pub fn devt(&self) -> DevT {
        self.0.devt
    }

    /// Card backing this device
    pub fn card(&self) -> &Arc<PciCard> {
        &self.0.card
    }

    /// Number of live references to the device
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// The registry's reference to a device created for a card
///
/// Not cloneable: there is exactly one per registered device, and it is
/// consumed by [`IomemDevice::destroy`].
#[derive(Debug)]
pub struct IomemDevice {
    dev: DeviceRef,
}

impl IomemDevice {
    /// Create and register the device for `card`
    ///
    /// Takes a card reference, allocates an id, and binds the character
    /// device. Every step taken is undone if a later one fails.
    ///
    /// # Errors
    ///
    /// Returns `IomemError::ResourceExhausted` if no id is free, or
    /// `IomemError::DeviceRegistrationFailure` if the node cannot be bound.
    pub fn create(registry: &Registry, card: &Arc<PciCard>) -> Result<Self> {
        let card = Arc::clone(card);
        let id = registry.ida().allocate()?;
        let Some(devt) = registry.region().devt(id) else {
            registry.ida().release(id);
            return Err(IomemError::ResourceExhausted {
                max: registry.region().count(),
            });
        };

        let dev = DeviceRef(Arc::new(DeviceInner {
            id,
            name: node_name(id),
            devt,
            card,
            ida: Arc::clone(registry.ida()),
        }));

        // On failure `dev` is the only reference; dropping it releases the id and the card.
        registry.cdev_device_add(&dev)?;

        tracing::info!("{}: registered ({} @ {})", dev.name(), devt, dev.card().address());

        Ok(Self { dev })
    }

    /// Unregister the device and drop the registry's reference
    ///
    /// Blocks until no new `open` can reach the device. Files already open
    /// keep the device alive; it is released when the last one closes.
    pub fn destroy(self, registry: &Registry) {
        tracing::info!("{}: unregistered", self.dev.name());
        registry.cdev_device_del(&self.dev);
    }

    /// Take an additional reference
    pub fn get(&self) -> DeviceRef {
        self.dev.clone()
    }

    /// Allocator id (also the minor number)
    pub fn id(&self) -> u32 {
        self.dev.id()
    }

    /// Node name, `eid-iomem<id>`
    pub fn name(&self) -> &str {
        self.dev.name()
    }

    /// Character-device number
    pub fn devt(&self) -> DevT {
        self.dev.devt()
    }

    /// Card backing this device
    pub fn card(&self) -> &Arc<PciCard> {
        self.dev.card()
    }

    /// Number of live references to the device
    pub fn refcount(&self) -> usize {
        self.dev.refcount()
    }
}
