//! Module parameters
//!
//! The driver takes a single load-time parameter, `max_devices`, which bounds
//! both the id pool and the minor range reserved for `/dev/eid-iomem*`.

use eid_iomem_chip::node::{DEFAULT_MAX_DEVICES, MINOR_MASK};

use crate::error::{IomemError, Result};

/// Environment variable overriding `max_devices`.
pub const MAX_DEVICES_ENV: &str = "EID_IOMEM_MAX_DEVICES";

/// Load-time parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleParams {
    /// Maximum number of eid-iomem devices
    pub max_devices: u32,
}

impl Default for ModuleParams {
    fn default() -> Self {
        Self {
            max_devices: DEFAULT_MAX_DEVICES,
        }
    }
}

impl ModuleParams {
    /// Parameters with an explicit device limit
    #[must_use]
    pub const fn new(max_devices: u32) -> Self {
        Self { max_devices }
    }

    /// Read parameters from the environment, falling back to defaults
    ///
    /// # Errors
    ///
    /// Returns `IomemError::InvalidParameter` if `EID_IOMEM_MAX_DEVICES` is set
    /// but is not a valid device count.
    pub fn from_env() -> Result<Self> {
        let params = match std::env::var(MAX_DEVICES_ENV) {
            Ok(raw) => Self::new(raw.trim().parse().map_err(|e| IomemError::InvalidParameter {
                name: "max_devices",
                reason: format!("{raw:?}: {e}"),
            })?),
            Err(_) => Self::default(),
        };
        params.validate()?;
        Ok(params)
    }

    /// Check the parameters against the character-device minor range
    ///
    /// # Errors
    ///
    /// Returns `IomemError::InvalidParameter` if `max_devices` is zero or
    /// larger than the number of available minors.
    pub fn validate(&self) -> Result<()> {
        if self.max_devices == 0 || self.max_devices > MINOR_MASK + 1 {
            return Err(IomemError::InvalidParameter {
                name: "max_devices",
                reason: format!("{} not in 1..={}", self.max_devices, MINOR_MASK + 1),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_sixteen() {
        assert_eq!(ModuleParams::default().max_devices, 16);
        assert!(ModuleParams::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(ModuleParams::new(0).validate().is_err());
        assert!(ModuleParams::new(MINOR_MASK + 2).validate().is_err());
        assert!(ModuleParams::new(MINOR_MASK + 1).validate().is_ok());
    }
}
