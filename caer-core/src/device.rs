//! Device collaborator interfaces.
//!
//! The acquisition loop never talks to a transport directly. Anything that
//! can open a device and hand back event packet containers implements
//! [`DeviceOpener`] and [`Device`]: a USB driver binding, a network bridge, or
//! the file-backed [`crate::replay::ReplayDevice`].

use crate::container::EventPacketContainer;
use crate::types::{DeviceDescriptor, DeviceKind};
use thiserror::Error;

/// Host-side configuration module for data exchange.
pub const HOST_CONFIG_DATAEXCHANGE: i8 = -2;
/// Parameter of [`HOST_CONFIG_DATAEXCHANGE`] switching `data_get` to blocking.
pub const HOST_CONFIG_DATAEXCHANGE_BLOCKING: u8 = 1;

/// Errors reported by a device collaborator.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("no matching device: {0}")]
    NotFound(String),

    #[error("device rejected the request: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Selection criteria for opening a device.
///
/// Zero restrictions and an empty serial number match any device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    /// ID assigned to the opened device, stamped into its event sources
    pub device_id: u16,
    pub kind: DeviceKind,
    pub bus_restriction: u8,
    pub address_restriction: u8,
    pub serial_number: String,
}

impl OpenRequest {
    /// Matches the first device of `kind`.
    pub fn any(device_id: u16, kind: DeviceKind) -> Self {
        Self {
            device_id,
            kind,
            bus_restriction: 0,
            address_restriction: 0,
            serial_number: String::new(),
        }
    }

    pub fn serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = serial_number.into();
        self
    }
}

/// An opened device handle.
///
/// Methods take `&mut self`: a handle belongs to exactly one acquisition
/// loop at a time.
pub trait Device {
    /// Static device information.
    fn descriptor(&self) -> DeviceDescriptor;

    /// Uploads the device's default configuration.
    fn send_default_config(&mut self) -> Result<(), DeviceError>;

    /// Sets one configuration parameter.
    fn config_set(&mut self, module: i8, param: u8, value: u32) -> Result<(), DeviceError>;

    /// Starts the data transfer.
    fn data_start(&mut self) -> Result<(), DeviceError>;

    /// Returns the next container, or `None` on timeout or transfer stop.
    ///
    /// Blocks when blocking data exchange is enabled.
    fn data_get(&mut self) -> Option<EventPacketContainer>;

    /// Stops the data transfer.
    fn data_stop(&mut self);

    /// Releases the device.
    fn close(&mut self);
}

/// Opens devices matching an [`OpenRequest`].
pub trait DeviceOpener {
    type Device: Device;

    fn open(&self, request: &OpenRequest) -> Result<Self::Device, DeviceError>;
}
