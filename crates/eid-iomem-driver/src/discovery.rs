//! Runtime card discovery
//!
//! Scans PCIe sysfs for IOMEM cards and builds [`PciCard`]s backed by their
//! sysfs directories, with BARs read from the `resource` attribute. No
//! hardcoded device lists; everything comes from the running system.

use std::path::{Path, PathBuf};

use eid_iomem_chip::bar::BAR_COUNT;
use eid_iomem_chip::pcie::is_supported;

use crate::card::{BarInfo, PciCard};
use crate::error::{IomemError, Result};

/// Default location of PCI devices in sysfs
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Discover all supported cards under `/sys/bus/pci/devices`
///
/// # Errors
///
/// Returns an error if the sysfs directory cannot be read.
pub fn discover() -> Result<Vec<PciCard>> {
    discover_in(Path::new(SYSFS_PCI_DEVICES))
}

/// Discover all supported cards under `root`
///
/// Entries whose `vendor`/`device` cannot be read are skipped. Cards are
/// returned sorted by PCI address.
///
/// # Errors
///
/// Returns an error if `root` cannot be read.
pub fn discover_in(root: &Path) -> Result<Vec<PciCard>> {
    tracing::info!("Discovering IOMEM cards in {}...", root.display());

    let entries = std::fs::read_dir(root)?;
    let mut matches: Vec<(String, PathBuf)> = Vec::new();

    for entry in entries.flatten() {
        let path = entry.path();

        let vendor_id = read_hex_sysfs(&path.join("vendor")).ok();
        let device_id = read_hex_sysfs(&path.join("device")).ok();

        if let (Some(vendor), Some(device)) = (vendor_id, device_id) {
            if is_supported(vendor, device) {
                let address = entry.file_name().to_string_lossy().to_string();
                tracing::debug!("Found {vendor:04x}:{device:04x} at {address}");
                matches.push((address, path));
            }
        }
    }

    // Sort to ensure consistent ordering
    matches.sort();

    let mut cards = Vec::with_capacity(matches.len());
    for (address, path) in matches {
        let vendor = read_hex_sysfs(&path.join("vendor"))?;
        let device = read_hex_sysfs(&path.join("device"))?;
        let mut card = PciCard::new(&address, vendor, device);

        match read_resources(&path.join("resource")) {
            Ok(bars) => {
                for (index, bar) in bars.into_iter().enumerate() {
                    if let Some(bar) = bar {
                        card = card.with_bar(index, bar);
                    }
                }
            }
            Err(e) => tracing::warn!("{address}: cannot read BARs: {e}"),
        }

        cards.push(card.with_sysfs(path));
    }

    tracing::info!("Discovered {} IOMEM card(s)", cards.len());
    Ok(cards)
}

/// Read a hexadecimal value from sysfs
fn read_hex_sysfs(path: &Path) -> Result<u16> {
    let content = std::fs::read_to_string(path)?;
    let trimmed = content.trim().trim_start_matches("0x");

    u16::from_str_radix(trimmed, 16).map_err(|e| {
        IomemError::invalid_argument(format!("{}: invalid hex value: {e}", path.display()))
    })
}

/// Parse the sysfs `resource` attribute: one `start end flags` line per
/// resource, the first [`BAR_COUNT`] of which are the BARs.
fn read_resources(path: &Path) -> Result<Vec<Option<BarInfo>>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .take(BAR_COUNT)
        .map(parse_resource_line)
        .collect()
}

fn parse_resource_line(line: &str) -> Result<Option<BarInfo>> {
    let fields = line
        .split_whitespace()
        .map(|f| u64::from_str_radix(f.trim_start_matches("0x"), 16))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| IomemError::invalid_argument(format!("resource line {line:?}: {e}")))?;

    let &[start, end, flags] = fields.as_slice() else {
        return Err(IomemError::invalid_argument(format!(
            "resource line {line:?}: expected 3 fields"
        )));
    };

    if start == 0 && end == 0 {
        return Ok(None);
    }
    let len = end
        .checked_sub(start)
        .and_then(|span| span.checked_add(1))
        .ok_or_else(|| {
            IomemError::invalid_argument(format!("resource line {line:?}: bad range"))
        })?;
    Ok(Some(BarInfo { start, len, flags }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eid_iomem_chip::bar::BarKind;

    fn fake_device(root: &Path, address: &str, vendor: &str, device: &str, resource: &str) {
        let dir = root.join(address);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("vendor"), vendor).unwrap();
        std::fs::write(dir.join("device"), device).unwrap();
        std::fs::write(dir.join("resource"), resource).unwrap();
    }

    const IOMEM_RESOURCE: &str = "\
0x0000004000000000 0x00000040000fffff 0x000000000014220c
0x0000000000000000 0x0000000000000000 0x0000000000000000
0x0000000000007000 0x000000000000707f 0x0000000000040101
";

    #[test]
    fn finds_matching_cards_sorted() {
        let root = tempfile::tempdir().unwrap();
        fake_device(root.path(), "0000:02:00.0", "0x1de5\n", "0x1000\n", IOMEM_RESOURCE);
        fake_device(root.path(), "0000:01:00.0", "0x1de5\n", "0x1000\n", IOMEM_RESOURCE);
        fake_device(root.path(), "0000:03:00.0", "0x8086\n", "0x1000\n", IOMEM_RESOURCE);

        let cards = discover_in(root.path()).unwrap();
        let addresses: Vec<_> = cards.iter().map(PciCard::address).collect();
        assert_eq!(addresses, ["0000:01:00.0", "0000:02:00.0"]);

        let card = &cards[0];
        assert_eq!(card.sysfs_path(), Some(root.path().join("0000:01:00.0").as_path()));
        let bar0 = card.bar(0).unwrap();
        assert_eq!(bar0.len, 1 << 20);
        assert_eq!(bar0.kind(), BarKind::Memory);
        assert!(card.bar(1).is_none());
        assert_eq!(card.bar(2).map(BarInfo::kind), Some(BarKind::Io));
    }

    #[test]
    fn skips_unreadable_entries() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("0000:05:00.0")).unwrap();
        assert!(discover_in(root.path()).unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_resource_lines() {
        assert!(parse_resource_line("0x1 0x2").is_err());
        assert!(parse_resource_line("zz 0x2 0x3").is_err());
        assert!(parse_resource_line("0x2000 0x1000 0x200").is_err());
        assert_eq!(parse_resource_line("0x0 0x0 0x0").unwrap(), None);
    }
}
