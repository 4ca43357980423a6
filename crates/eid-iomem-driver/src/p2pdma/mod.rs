//! Peer-to-peer memory subsystem interface
//!
//! The driver never touches card memory itself. It hands the card's BAR
//! window to a [`P2pMemory`] implementation and forwards `open` and `mmap`
//! to it. Two implementations are provided:
//!
//! - **Host**: window backed by host memory (no hardware, used by tests and
//!   the demo)
//! - **Sysfs**: window backed by `/sys/bus/pci/devices/<bdf>/resource<n>`
//!   (real cards, requires root)
//!
//! Mappings handed out by either implementation stay valid after the device
//! is removed; they end when the mapping is dropped.

pub mod host;
pub mod sysfs;

pub use host::HostP2pMemory;
pub use sysfs::SysfsP2pMemory;

use std::fmt::Debug;
use std::sync::Arc;

use rustix::mm::{MapFlags, ProtFlags};

use crate::card::PciCard;
use crate::error::{IomemError, Result};
use crate::file::FileId;

/// P2P memory provider (`pci_p2pdma_*` / `pci_mmap_p2pmem`)
///
/// Resources are tracked per card object ([`PciCard::instance`]), not per
/// PCI address: a card that replaces a removed one at the same address starts
/// with no files and its own window.
pub trait P2pMemory: Debug + Send + Sync {
    /// Register `size` bytes at `offset` of BAR `bar` as P2P memory
    ///
    /// A `size` of zero means "the rest of the BAR".
    ///
    /// # Errors
    ///
    /// Returns an error if the BAR is missing, not a memory BAR, too small,
    /// or the window cannot be set up.
    fn add_resource(&self, card: &Arc<PciCard>, bar: usize, size: u64, offset: u64) -> Result<()>;

    /// Make the card's P2P memory (un)available to other devices
    fn publish(&self, card: &PciCard, publish: bool);

    /// Whether the card's P2P memory is published
    fn is_published(&self, card: &PciCard) -> bool;

    /// Length of the card's registered window
    fn window_len(&self, card: &PciCard) -> Option<u64>;

    /// Associate an open file with the card's P2P memory
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot track the file.
    fn file_open(&self, card: &PciCard, file: FileId) -> Result<()>;

    /// Forget an open file. Mappings it created are unaffected.
    fn file_release(&self, card: &PciCard, file: FileId);

    /// Map part of the card's window on behalf of `file`
    ///
    /// # Errors
    ///
    /// Returns `IomemError::InvalidArgument` if `vma` does not fit the window
    /// and `IomemError::NotSupported` for private mappings or cards without
    /// P2P memory.
    fn mmap(&self, card: &PciCard, file: FileId, vma: &VmArea) -> Result<Box<dyn P2pMapping>>;

    /// Drop everything registered for the card (managed release)
    fn release(&self, card: &PciCard);
}

/// A mapping of card memory into the caller's address space
pub trait P2pMapping: Debug + Send + Sync {
    /// Mapped length in bytes
    fn len(&self) -> usize;

    /// Whether the mapping is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of the mapping inside the card's window
    fn window_offset(&self) -> u64;

    /// Protection the mapping was created with
    fn prot(&self) -> ProtFlags;

    /// Copy `buffer.len()` bytes from `offset` into `buffer`
    ///
    /// # Errors
    ///
    /// Returns an error if the read would leave the mapping.
    fn read_bytes(&self, offset: usize, buffer: &mut [u8]) -> Result<()>;

    /// Copy `data` into the mapping at `offset`
    ///
    /// # Errors
    ///
    /// Returns an error if the write would leave the mapping or the mapping
    /// is read-only.
    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()>;

    /// Read a little-endian `u32` at `offset`
    ///
    /// # Errors
    ///
    /// Returns an error if the read would leave the mapping.
    fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read_bytes(offset, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Write a little-endian `u32` at `offset`
    ///
    /// # Errors
    ///
    /// Returns an error if the write would leave the mapping or the mapping
    /// is read-only.
    fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }
}

/// Requested virtual memory area for an `mmap` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmArea {
    /// Byte offset into the window (`vm_pgoff << PAGE_SHIFT`)
    pub offset: u64,
    /// Length in bytes
    pub len: usize,
    /// Page protection
    pub prot: ProtFlags,
    /// Mapping flags
    pub flags: MapFlags,
}

impl VmArea {
    /// Read/write shared mapping of `len` bytes at `offset`
    #[must_use]
    pub const fn shared(offset: u64, len: usize) -> Self {
        Self {
            offset,
            len,
            prot: ProtFlags::READ.union(ProtFlags::WRITE),
            flags: MapFlags::SHARED,
        }
    }

    /// Replace the protection bits
    #[must_use]
    pub const fn with_prot(mut self, prot: ProtFlags) -> Self {
        self.prot = prot;
        self
    }

    /// Replace the mapping flags
    #[must_use]
    pub const fn with_flags(mut self, flags: MapFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Check this area against a window of `window_len` bytes
    ///
    /// # Errors
    ///
    /// `NotSupported` for private mappings; `InvalidArgument` for empty areas,
    /// offsets that are not page aligned, or areas extending past the window.
    pub fn check(&self, window_len: u64) -> Result<()> {
        if !self.flags.contains(MapFlags::SHARED) {
            return Err(IomemError::not_supported("attempted private mapping"));
        }
        if self.len == 0 {
            return Err(IomemError::invalid_argument("zero-length mapping"));
        }
        let page = rustix::param::page_size() as u64;
        if self.offset % page != 0 {
            return Err(IomemError::invalid_argument(format!(
                "offset {:#x} is not page aligned",
                self.offset
            )));
        }
        let fits = u64::try_from(self.len)
            .ok()
            .and_then(|len| self.offset.checked_add(len))
            .is_some_and(|end| end <= window_len);
        if !fits {
            return Err(IomemError::invalid_argument(format!(
                "region {:#x}+{:#x} exceeds window of {window_len:#x} bytes",
                self.offset, self.len
            )));
        }
        Ok(())
    }
}

/// Bounds check shared by the mapping implementations
pub(crate) fn check_access(len: usize, offset: usize, size: usize, op: &str) -> Result<()> {
    if offset.checked_add(size).map_or(true, |end| end > len) {
        return Err(IomemError::invalid_argument(format!(
            "Out of bounds {op}: offset={offset:#x}, size={size}, limit={len:#x}"
        )));
    }
    Ok(())
}
