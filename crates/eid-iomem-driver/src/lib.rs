//! Device lifecycle for Eideticom IOMEM PCIe cards.
//!
//! Each IOMEM card's on-board memory is published as peer-to-peer DMA memory
//! and exposed through a character-device node, `/dev/eid-iomem<id>`.
//! Opening the node and mapping it puts the card's memory window straight
//! into the caller's address space.
//!
//! # Layers
//!
//! ```text
//! PciBus ──probe/remove──▶ EidIomemDriver ──create/destroy──▶ IomemDevice
//!                               │                                  │
//!                               ▼                                  ▼
//!                          P2pMemory ◀──────mmap────────── IomemFile (open)
//! ```
//!
//! - [`IdAllocator`]: bounded pool of node ids
//! - [`Registry`]: class, chrdev region, id pool and cdev map
//! - [`IomemDevice`] / [`DeviceRef`]: reference-counted device object
//! - [`IomemFile`]: open/mmap control path
//! - [`EidIomemDriver`] / [`EidIomemModule`]: probe/remove and module init/exit
//! - [`P2pMemory`]: P2P memory provider ([`HostP2pMemory`], [`SysfsP2pMemory`])
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//! use eid_iomem_driver::{BarInfo, EidIomemModule, HostP2pMemory, ModuleParams, PciBus, PciCard, VmArea};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(PciBus::new());
//! let module = EidIomemModule::load(&bus, ModuleParams::default(), Arc::new(HostP2pMemory::new()))?;
//!
//! let card = PciCard::new("0000:01:00.0", 0x1de5, 0x1000).with_bar(0, BarInfo::memory(0, 1 << 20));
//! bus.add_card(Arc::new(card))?;
//!
//! let file = module.driver().open_node("/dev/eid-iomem0")?;
//! let map = file.mmap(&VmArea::shared(0, 4096))?;
//! map.write_u32(0, 0xfeed_f00d)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod bus;
mod card;
mod chrdev;
mod class;
mod config;
mod device;
pub mod discovery;
mod driver;
mod error;
mod file;
mod ida;
pub mod p2pdma;
mod registry;

/// Hardware identification constants (re-exported from eid-iomem-chip).
pub mod pcie_ids {
    pub use eid_iomem_chip::pcie::{
        device_id, is_supported, lspci_filter, PciDeviceId, DRIVER_NAME, EIDETICOM_VENDOR_ID,
        ID_TABLE,
    };
}

pub use bus::{PciBus, PciDriver};
pub use card::{BarInfo, CardId, PciCard, ProbeState};
pub use chrdev::{CdevMap, CharDevRegion};
pub use class::DeviceClass;
pub use config::{ModuleParams, MAX_DEVICES_ENV};
pub use device::{DeviceRef, IomemDevice};
pub use driver::{EidIomemDriver, EidIomemModule};
pub use eid_iomem_chip::node::{node_name, DevT};
pub use error::{IomemError, Result};
pub use file::{FileId, IomemFile};
pub use ida::IdAllocator;
pub use p2pdma::{HostP2pMemory, P2pMapping, P2pMemory, SysfsP2pMemory, VmArea};
pub use registry::Registry;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        DevT, EidIomemDriver, EidIomemModule, HostP2pMemory, IomemError, IomemFile, ModuleParams,
        P2pMapping, P2pMemory, PciBus, PciCard, Result, SysfsP2pMemory, VmArea,
    };
}
