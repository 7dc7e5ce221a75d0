pub mod manager;
pub mod profile;

pub use manager::DeviceManager;
pub use profile::{
    find_matching_port, profile_for, DeviceFactory, HardwareProfile, ManufacturerContains,
    PortMatcher, PROFILES,
};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("No port matches the hardware profile")]
    NoMatchingPort,

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
