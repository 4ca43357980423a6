//! Error types for eid-iomem operations

use eid_iomem_chip::node::DevT;
use rustix::io::Errno;
use thiserror::Error;

/// Result type alias for eid-iomem operations
pub type Result<T> = std::result::Result<T, IomemError>;

/// Errors that can occur while probing, registering, opening or mapping a card
#[derive(Debug, Error)]
pub enum IomemError {
    /// Memory for a device object or window could not be allocated
    #[error("Allocation failed: {what}")]
    AllocationFailure {
        /// What was being allocated
        what: String,
    },

    /// Every id in `[0, max_devices)` is in use
    #[error("No free device id (max_devices = {max})")]
    ResourceExhausted {
        /// Size of the id pool
        max: u32,
    },

    /// Character-device, class or driver registration failed
    #[error("Registration of {name} failed: {reason}")]
    DeviceRegistrationFailure {
        /// Name of the object being registered
        name: String,
        /// Reason for failure
        reason: String,
    },

    /// The card's memory window could not be registered as P2P memory
    #[error("Unable to add P2P resource for {address}: {reason}")]
    ResourceAddFailure {
        /// PCI address of the card
        address: String,
        /// Reason for failure
        reason: String,
    },

    /// The card could not be enabled on the bus
    #[error("Unable to enable PCI device {address}: {reason}")]
    PciEnableFailure {
        /// PCI address of the card
        address: String,
        /// Reason for failure
        reason: String,
    },

    /// The device node is no longer bound to a device
    #[error("No such device: {devt}")]
    NoSuchDevice {
        /// Device number that was looked up
        devt: String,
    },

    /// A request was malformed (region outside the window, bad alignment, ...)
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason for failure
        reason: String,
    },

    /// The P2P subsystem declined the request
    #[error("Operation not supported: {reason}")]
    NotSupported {
        /// Reason for failure
        reason: String,
    },

    /// A module parameter is out of range
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name
        name: &'static str,
        /// Reason for failure
        reason: String,
    },

    /// I/O error while talking to sysfs or a resource file
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl IomemError {
    /// Create an allocation failure error
    pub fn allocation(what: impl Into<String>) -> Self {
        Self::AllocationFailure { what: what.into() }
    }

    /// Create a registration failure error
    pub fn registration(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeviceRegistrationFailure {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a resource add failure error
    pub fn resource_add(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResourceAddFailure {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a PCI enable failure error
    pub fn pci_enable(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PciEnableFailure {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a no such device error
    pub fn no_such_device(devt: DevT) -> Self {
        Self::NoSuchDevice {
            devt: devt.to_string(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a not supported error
    pub fn not_supported(reason: impl Into<String>) -> Self {
        Self::NotSupported {
            reason: reason.into(),
        }
    }

    /// Kernel errno equivalent of this error.
    pub fn errno(&self) -> Errno {
        match self {
            Self::AllocationFailure { .. } => Errno::NOMEM,
            Self::ResourceExhausted { .. } => Errno::NOSPC,
            Self::DeviceRegistrationFailure { .. } => Errno::BUSY,
            Self::ResourceAddFailure { .. }
            | Self::InvalidArgument { .. }
            | Self::InvalidParameter { .. } => Errno::INVAL,
            Self::PciEnableFailure { .. } => Errno::IO,
            Self::NoSuchDevice { .. } => Errno::NODEV,
            Self::NotSupported { .. } => Errno::OPNOTSUPP,
            Self::Io { source } => source
                .raw_os_error()
                .map_or(Errno::IO, Errno::from_raw_os_error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(IomemError::ResourceExhausted { max: 16 }.errno(), Errno::NOSPC);
        assert_eq!(
            IomemError::no_such_device(DevT::new(240, 1)).errno(),
            Errno::NODEV
        );
        assert_eq!(IomemError::invalid_argument("x").errno(), Errno::INVAL);
        assert_eq!(IomemError::not_supported("x").errno(), Errno::OPNOTSUPP);
    }

    #[test]
    fn display_names_the_device() {
        let err = IomemError::no_such_device(DevT::new(240, 1));
        assert_eq!(err.to_string(), "No such device: 240:1");
    }
}
