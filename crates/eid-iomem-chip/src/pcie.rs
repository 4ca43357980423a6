//! PCIe identifiers and the driver match table.

/// Eideticom vendor ID (PCI-SIG assigned).
pub const EIDETICOM_VENDOR_ID: u16 = 0x1DE5;

/// Device IDs for the Eideticom family handled by this driver.
pub mod device_id {
    /// IOMEM card exposing its on-board memory as P2P DMA memory (`lspci: 1de5:1000`).
    pub const IOMEM: u16 = 0x1000;
}

/// Name the driver registers with the PCI bus.
pub const DRIVER_NAME: &str = "eid_iomem_pci";

/// One entry of a PCI match table (`struct pci_device_id` without the
/// subsystem fields, which this driver never matches on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciDeviceId {
    /// Vendor ID to match.
    pub vendor: u16,
    /// Device ID to match.
    pub device: u16,
}

impl PciDeviceId {
    /// Build an entry matching exactly `vendor:device`.
    #[must_use]
    pub const fn new(vendor: u16, device: u16) -> Self {
        Self { vendor, device }
    }

    /// Whether a card reporting `vendor:device` matches this entry.
    #[must_use]
    pub const fn matches(&self, vendor: u16, device: u16) -> bool {
        self.vendor == vendor && self.device == device
    }
}

impl std::fmt::Display for PciDeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.device)
    }
}

/// Cards bound by the driver.
pub const ID_TABLE: &[PciDeviceId] = &[PciDeviceId::new(EIDETICOM_VENDOR_ID, device_id::IOMEM)];

/// Whether `vendor:device` is in [`ID_TABLE`].
#[must_use]
pub fn is_supported(vendor: u16, device: u16) -> bool {
    ID_TABLE.iter().any(|id| id.matches(vendor, device))
}

/// Format a `vendor:device` string for use with `lspci -d`.
#[must_use]
pub fn lspci_filter() -> String {
    ID_TABLE[0].to_string()
}
