//! PCIe BAR layout for the IOMEM card.
//!
//! ```text
//! BAR  Type                   Purpose
//! ──── ────────────────────── ─────────────────────────────────────────
//!  0   64-bit prefetchable    On-board memory, published as P2P memory
//! ```
//!
//! The whole of BAR0 is handed to the P2P memory subsystem: size `0` means
//! "the entire BAR" and the window starts at offset `0`.

/// BAR index carrying the P2P memory window.
pub const P2P_BAR: usize = 0;

/// Window size requested from the P2P subsystem (`0` = whole BAR).
pub const P2P_SIZE: u64 = 0;

/// Offset of the window inside the BAR.
pub const P2P_OFFSET: u64 = 0;

/// Number of standard BARs on a type-0 PCI header.
pub const BAR_COUNT: usize = 6;

/// Kind of address space a BAR decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    /// Memory space (MMIO or prefetchable memory).
    Memory,
    /// I/O port space.
    Io,
}

/// Flag bits from a sysfs `resource` line (`IORESOURCE_*`).
pub mod flags {
    /// `IORESOURCE_IO`.
    pub const IO: u64 = 0x0000_0100;
    /// `IORESOURCE_MEM`.
    pub const MEM: u64 = 0x0000_0200;
    /// `IORESOURCE_PREFETCH`.
    pub const PREFETCH: u64 = 0x0000_2000;
}

/// Resolve the requested window against a BAR of `bar_len` bytes.
///
/// Returns the window length, or `None` if `offset`/`size` do not fit.
#[must_use]
pub const fn window_len(bar_len: u64, size: u64, offset: u64) -> Option<u64> {
    if offset >= bar_len {
        return None;
    }
    let avail = bar_len - offset;
    if size == 0 {
        Some(avail)
    } else if size <= avail {
        Some(size)
    } else {
        None
    }
}
