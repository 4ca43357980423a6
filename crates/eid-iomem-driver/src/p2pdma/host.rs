// SPDX-License-Identifier: AGPL-3.0-only

//! Host-memory P2P backend
//!
//! Backs each card's window with a zeroed host allocation of the window's
//! size. Nothing here needs hardware, which makes it the backend for CI and
//! for exercising the probe/remove protocol end to end.
//!
//! A mapping holds its own reference to the window storage, so it keeps
//! working after the card is removed and its resource released. The storage
//! is freed when the last mapping goes away.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use eid_iomem_chip::bar::{window_len, BarKind};
use parking_lot::{Mutex, RwLock};
use rustix::mm::ProtFlags;

use super::{check_access, P2pMapping, P2pMemory, VmArea};
use crate::card::{CardId, PciCard};
use crate::error::{IomemError, Result};
use crate::file::FileId;

#[derive(Debug)]
struct Window {
    bytes: RwLock<Box<[u8]>>,
}

#[derive(Debug)]
struct Resource {
    window: Arc<Window>,
    len: u64,
    published: bool,
    files: BTreeSet<FileId>,
}

/// P2P memory provider backed by host allocations
#[derive(Debug, Default)]
pub struct HostP2pMemory {
    resources: Mutex<HashMap<CardId, Resource>>,
}

impl HostP2pMemory {
    /// Provider with no registered resources
    pub fn new() -> Self {
        Self::default()
    }

    /// Files currently associated with the card
    pub fn open_files(&self, card: &PciCard) -> Vec<FileId> {
        self.resources
            .lock()
            .get(&card.instance())
            .map(|r| r.files.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether a window is registered for the card
    pub fn has_resource(&self, card: &PciCard) -> bool {
        self.resources.lock().contains_key(&card.instance())
    }

    fn allocate(len: u64) -> Result<Box<[u8]>> {
        let len = usize::try_from(len)
            .map_err(|_| IomemError::allocation(format!("window of {len} bytes")))?;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|e| IomemError::allocation(format!("window of {len} bytes: {e}")))?;
        bytes.resize(len, 0);
        Ok(bytes.into_boxed_slice())
    }
}

impl P2pMemory for HostP2pMemory {
    fn add_resource(&self, card: &Arc<PciCard>, bar: usize, size: u64, offset: u64) -> Result<()> {
        let address = card.address();
        let info = card
            .bar(bar)
            .ok_or_else(|| IomemError::resource_add(address, format!("BAR{bar} not present")))?;
        if info.kind() != BarKind::Memory {
            return Err(IomemError::resource_add(
                address,
                format!("BAR{bar} is not a memory BAR"),
            ));
        }
        let len = window_len(info.len, size, offset).ok_or_else(|| {
            IomemError::resource_add(
                address,
                format!("{size:#x}@{offset:#x} does not fit BAR{bar} ({:#x} bytes)", info.len),
            )
        })?;

        let mut resources = self.resources.lock();
        if resources.contains_key(&card.instance()) {
            return Err(IomemError::resource_add(address, "P2P memory already registered"));
        }

        let window = Arc::new(Window {
            bytes: RwLock::new(Self::allocate(len)?),
        });
        resources.insert(
            card.instance(),
            Resource {
                window,
                len,
                published: false,
                files: BTreeSet::new(),
            },
        );

        tracing::debug!("{address}: added {len:#x} bytes of P2P memory from BAR{bar}");
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
        match self.resources.lock().get_mut(&card.instance()) {
            Some(resource) => {
                resource.files.insert(file);
            }
            None => tracing::trace!("{}: {file} opened without P2P memory", card.address()),
        }
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

        tracing::debug!(
            "{}: {file} mapped {:#x}+{:#x}",
            card.address(),
            vma.offset,
            vma.len
        );

        Ok(Box::new(HostMapping {
            window: Arc::clone(&resource.window),
            start: usize::try_from(vma.offset)
                .map_err(|_| IomemError::invalid_argument("offset exceeds address space"))?,
            len: vma.len,
            prot: vma.prot,
        }))
    }

    fn release(&self, card: &PciCard) {
        if let Some(resource) = self.resources.lock().remove(&card.instance()) {
            tracing::debug!(
                "{}: released P2P memory ({} mapping(s) outstanding)",
                card.address(),
                Arc::strong_count(&resource.window) - 1
            );
        }
    }
}

/// Mapping of a host-backed window
#[derive(Debug)]
pub struct HostMapping {
    window: Arc<Window>,
    start: usize,
    len: usize,
    prot: ProtFlags,
}

impl P2pMapping for HostMapping {
    fn len(&self) -> usize {
        self.len
    }

    fn window_offset(&self) -> u64 {
        self.start as u64
    }

    fn prot(&self) -> ProtFlags {
        self.prot
    }

    fn read_bytes(&self, offset: usize, buffer: &mut [u8]) -> Result<()> {
        check_access(self.len, offset, buffer.len(), "read")?;
        if !self.prot.contains(ProtFlags::READ) {
            return Err(IomemError::not_supported("mapping is not readable"));
        }
        let at = self.start + offset;
        buffer.copy_from_slice(&self.window.bytes.read()[at..at + buffer.len()]);
        Ok(())
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        check_access(self.len, offset, data.len(), "write")?;
        if !self.prot.contains(ProtFlags::WRITE) {
            return Err(IomemError::not_supported("mapping is read-only"));
        }
        let at = self.start + offset;
        self.window.bytes.write()[at..at + data.len()].copy_from_slice(data);
        Ok(())
    }
}
