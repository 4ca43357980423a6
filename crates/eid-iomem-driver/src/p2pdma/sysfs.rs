//! Sysfs P2P backend
//!
//! Maps the card's BAR through `/sys/bus/pci/devices/<bdf>/resource<n>`.
//! Each open file gets its own descriptor on the resource file; `mmap` maps
//! the requested part of the window from that descriptor with `rustix`.
//!
//! Requires root (or `CAP_SYS_ADMIN`) and a card whose memory decoding is
//! enabled.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Arc;

use eid_iomem_chip::bar::{window_len, BarKind};
use parking_lot::Mutex;
use rustix::mm::{mmap, munmap, ProtFlags};

use super::{check_access, P2pMapping, P2pMemory, VmArea};
use crate::card::{CardId, PciCard};
use crate::error::{IomemError, Result};
use crate::file::FileId;

#[derive(Debug)]
struct Resource {
    path: PathBuf,
    bar: usize,
    offset: u64,
    len: u64,
    published: bool,
    files: HashMap<FileId, File>,
}

/// P2P memory provider backed by sysfs BAR resource files
#[derive(Debug, Default)]
pub struct SysfsP2pMemory {
    resources: Mutex<HashMap<CardId, Resource>>,
}

impl SysfsP2pMemory {
    /// Provider with no registered resources
    pub fn new() -> Self {
        Self::default()
    }
}

impl P2pMemory for SysfsP2pMemory {
    fn add_resource(&self, card: &Arc<PciCard>, bar: usize, size: u64, offset: u64) -> Result<()> {
        let address = card.address();
        let dir = card
            .sysfs_path()
            .ok_or_else(|| IomemError::resource_add(address, "card has no sysfs directory"))?;
        let info = card
            .bar(bar)
            .ok_or_else(|| IomemError::resource_add(address, format!("BAR{bar} not present")))?;
        if info.kind() != BarKind::Memory {
            return Err(IomemError::resource_add(
                address,
                format!("BAR{bar} is not a memory BAR"),
            ));
        }

        let path = dir.join(format!("resource{bar}"));
        let bar_len = std::fs::metadata(&path)
            .map_err(|e| IomemError::resource_add(address, format!("{}: {e}", path.display())))?
            .len();
        let len = window_len(bar_len, size, offset).ok_or_else(|| {
            IomemError::resource_add(
                address,
                format!("{size:#x}@{offset:#x} does not fit BAR{bar} ({bar_len:#x} bytes)"),
            )
        })?;

        let mut resources = self.resources.lock();
        if resources.contains_key(&card.instance()) {
            return Err(IomemError::resource_add(address, "P2P memory already registered"));
        }
        resources.insert(
            card.instance(),
            Resource {
                path,
                bar,
                offset,
                len,
                published: false,
                files: HashMap::new(),
            },
        );

        tracing::debug!(
            "{address}: added {} MB of P2P memory from BAR{bar}",
            len / (1024 * 1024)
        );
        Ok(())
    }

    fn publish(&self, card: &PciCard, publish: bool) {
        if let Some(resource) = self.resources.lock().get_mut(&card.instance()) {
            resource.published = publish;
        }
    }

    fn is_published(&self, card: &PciCard) -> bool {
        self.resources
            .lock()
            .get(&card.instance())
            .is_some_and(|r| r.published)
    }

    fn window_len(&self, card: &PciCard) -> Option<u64> {
        self.resources.lock().get(&card.instance()).map(|r| r.len)
    }

    fn file_open(&self, card: &PciCard, file: FileId) -> Result<()> {
        let mut resources = self.resources.lock();
        let Some(resource) = resources.get_mut(&card.instance()) else {
            return Ok(());
        };

        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&resource.path)?;
        resource.files.insert(file, fd);
        Ok(())
    }

    fn file_release(&self, card: &PciCard, file: FileId) {
        if let Some(resource) = self.resources.lock().get_mut(&card.instance()) {
            resource.files.remove(&file);
        }
    }

    fn mmap(&self, card: &PciCard, file: FileId, vma: &VmArea) -> Result<Box<dyn P2pMapping>> {
        let resources = self.resources.lock();
        let resource = resources.get(&card.instance()).ok_or_else(|| {
            IomemError::not_supported(format!("{} has no P2P memory", card.address()))
        })?;
        vma.check(resource.len)?;

        let fd = resource
            .files
            .get(&file)
            .ok_or_else(|| IomemError::invalid_argument(format!("{file} is not open on this card")))?
            .try_clone()?;

        BarMapping::map(fd, card.address(), resource.bar, resource.offset, vma)
            .map(|m| Box::new(m) as Box<dyn P2pMapping>)
    }

    fn release(&self, card: &PciCard) {
        if let Some(resource) = self.resources.lock().remove(&card.instance()) {
            tracing::debug!(
                "{}: released P2P memory ({} file(s) still open)",
                card.address(),
                resource.files.len()
            );
        }
    }
}

/// Memory-mapped slice of a PCIe BAR
///
/// Bounds-checked access to card memory; the unsafe parts are confined to
/// `map`, the copy routines and `Drop`.
#[derive(Debug)]
pub struct BarMapping {
    ptr: NonNull<u8>,
    len: usize,
    window_offset: u64,
    prot: ProtFlags,
    _file: File,
    pcie_address: String,
    bar_index: usize,
}

impl BarMapping {
    fn map(file: File, pcie_address: &str, bar_index: usize, base: u64, vma: &VmArea) -> Result<Self> {
        // SAFETY: mmap is unsafe but we validate all preconditions:
        // - File descriptor is valid (opened by file_open, cloned above)
        // - Length is non-zero and the range lies inside the BAR (VmArea::check)
        // - Offset is page aligned (VmArea::check) and the window base comes from the BAR
        // - We store the file in the struct to keep the fd open for the lifetime of the mapping
        // - We unmap in Drop
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                vma.len,
                vma.prot,
                vma.flags,
                file.as_fd(),
                base + vma.offset,
            )
        }
        .map_err(|e| IomemError::not_supported(format!("mmap of BAR{bar_index} failed: {e}")))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| IomemError::not_supported("mmap returned a null mapping"))?;

        tracing::info!(
            "Mapped BAR{bar_index} for {pcie_address} ({:#x}+{:#x} at {ptr:p})",
            vma.offset,
            vma.len
        );

        Ok(Self {
            ptr,
            len: vma.len,
            window_offset: vma.offset,
            prot: vma.prot,
            _file: file,
            pcie_address: pcie_address.to_string(),
            bar_index,
        })
    }
}

impl P2pMapping for BarMapping {
    fn len(&self) -> usize {
        self.len
    }

    fn window_offset(&self) -> u64 {
        self.window_offset
    }

    fn prot(&self) -> ProtFlags {
        self.prot
    }

    fn read_bytes(&self, offset: usize, buffer: &mut [u8]) -> Result<()> {
        check_access(self.len, offset, buffer.len(), "read")?;
        if !self.prot.contains(ProtFlags::READ) {
            return Err(IomemError::not_supported("mapping is not readable"));
        }

        // SAFETY: copy_nonoverlapping requires valid, non-overlapping src/dst:
        // - Bounds validated above: offset + buffer.len() <= self.len
        // - src lies inside the live mapping (ptr from successful mmap, not yet unmapped)
        // - dst is a valid mutable slice; device memory and the user buffer cannot overlap
        // - u8 has alignment 1
        unsafe {
            let src = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(src, buffer.as_mut_ptr(), buffer.len());
        }
        Ok(())
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        check_access(self.len, offset, data.len(), "write")?;
        if !self.prot.contains(ProtFlags::WRITE) {
            return Err(IomemError::not_supported("mapping is read-only"));
        }

        // SAFETY: same invariants as read_bytes, with src = data and dst inside the mapping.
        // The mapping was created with PROT_WRITE (checked above).
        unsafe {
            let dst = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }
}

impl Drop for BarMapping {
    fn drop(&mut self) {
        tracing::debug!(
            "Unmapping BAR{} for {} ({:#x} bytes)",
            self.bar_index,
            self.pcie_address,
            self.len
        );

        // SAFETY: ptr and len are exactly what mmap returned/was given in map(),
        // and Drop runs at most once.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.len) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
    }
}

// SAFETY: Send - BarMapping owns its mapping exclusively; moving it between threads
// does not invalidate the mapping (mmap'd memory is process-wide).
unsafe impl Send for BarMapping {}

// SAFETY: Sync - every access is bounds-checked and copies through raw pointers;
// concurrent accesses race only on device memory, which is what P2P memory is for.
unsafe impl Sync for BarMapping {}
