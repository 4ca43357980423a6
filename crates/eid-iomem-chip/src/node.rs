//! Character-device numbering and naming.
//!
//! Every registered card appears as `/dev/eid-iomem<id>`. The major number is
//! chosen once when the region is reserved; the minor is the allocator id.

/// Prefix of every device node name.
pub const NODE_PREFIX: &str = "eid-iomem";

/// Name of the device class grouping all nodes.
pub const CLASS_NAME: &str = "eid_iomem_device";

/// Name the character-device region is reserved under.
pub const REGION_NAME: &str = "eid-iomem";

/// Bits used for the minor number (`MINORBITS`).
pub const MINOR_BITS: u32 = 20;

/// Largest minor number (`MINORMASK`).
pub const MINOR_MASK: u32 = (1 << MINOR_BITS) - 1;

/// Default value of the `max_devices` parameter.
pub const DEFAULT_MAX_DEVICES: u32 = 16;

/// Node name for device `id`.
#[must_use]
pub fn node_name(id: u32) -> String {
    format!("{NODE_PREFIX}{id}")
}

/// Parse a node name back into its id. Accepts `eid-iomem3` and `/dev/eid-iomem3`.
#[must_use]
pub fn parse_node_name(name: &str) -> Option<u32> {
    let base = name.rsplit('/').next()?;
    let digits = base.strip_prefix(NODE_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Character-device number (`dev_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevT {
    major: u32,
    minor: u32,
}

impl DevT {
    /// `MKDEV(major, minor)`. The minor is truncated to [`MINOR_MASK`].
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor: minor & MINOR_MASK,
        }
    }

    /// Major number.
    #[must_use]
    pub const fn major(&self) -> u32 {
        self.major
    }

    /// Minor number.
    #[must_use]
    pub const fn minor(&self) -> u32 {
        self.minor
    }
}

impl std::fmt::Display for DevT {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}
