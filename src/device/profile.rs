use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::logging::UiLogger;
use crate::serial::{
    FrameDecoder, FramingConfig, NativePort, Parity, PortDescriptor, PortSettings, SerialDevice,
    CLASSROOM_FRAMING,
};

/// Pure predicate deciding whether a discovered port belongs to a hardware
/// kind. No state, no I/O.
pub trait PortMatcher: Send + Sync {
    fn is_match(&self, descriptor: &PortDescriptor) -> bool;
}

/// Case-insensitive substring test against the descriptor manufacturer.
/// Ports without a manufacturer never match.
pub struct ManufacturerContains {
    keyword: String,
}

impl ManufacturerContains {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into().to_lowercase(),
        }
    }
}

impl PortMatcher for ManufacturerContains {
    fn is_match(&self, descriptor: &PortDescriptor) -> bool {
        descriptor
            .manufacturer
            .as_deref()
            .map(|manufacturer| manufacturer.to_lowercase().contains(&self.keyword))
            .unwrap_or(false)
    }
}

/// Builds an opening `SerialDevice` for a path.
pub trait DeviceFactory: Send + Sync {
    fn open_device(&self, path: &str, logger: Arc<dyn UiLogger>) -> Arc<SerialDevice>;
}

/// Everything one hardware kind needs: how to recognize its port, how to
/// configure the line and whether reads are framed.
pub struct HardwareProfile {
    pub name: &'static str,
    pub manufacturer_keyword: &'static str,
    pub settings: PortSettings,
    pub framing: Option<FramingConfig>,
}

impl PortMatcher for HardwareProfile {
    fn is_match(&self, descriptor: &PortDescriptor) -> bool {
        ManufacturerContains::new(self.manufacturer_keyword).is_match(descriptor)
    }
}

impl DeviceFactory for HardwareProfile {
    fn open_device(&self, path: &str, logger: Arc<dyn UiLogger>) -> Arc<SerialDevice> {
        let device = Arc::new(SerialDevice::new(logger));
        let port = NativePort::new(path, self.settings);
        let decoder = self.framing.map(FrameDecoder::new);
        // Fresh device, arming cannot fail.
        let _ = device.spawn_open(Box::new(port), decoder);
        device
    }
}

/// Known hardware kinds; `profile_for` returns the first match.
pub static PROFILES: Lazy<Vec<HardwareProfile>> = Lazy::new(|| {
    vec![
        HardwareProfile {
            name: "classroom-kit",
            manufacturer_keyword: "wch.cn",
            settings: PortSettings {
                baud_rate: 115_200,
                parity: Parity::None,
            },
            framing: Some(CLASSROOM_FRAMING),
        },
        HardwareProfile {
            name: "arduino-raw",
            manufacturer_keyword: "arduino",
            settings: PortSettings {
                baud_rate: 115_200,
                parity: Parity::None,
            },
            framing: None,
        },
    ]
});

/// First registered profile whose matcher accepts the descriptor.
pub fn profile_for(descriptor: &PortDescriptor) -> Option<&'static HardwareProfile> {
    PROFILES.iter().find(|profile| profile.is_match(descriptor))
}

/// First descriptor the matcher accepts.
pub fn find_matching_port<'a>(
    matcher: &dyn PortMatcher,
    ports: &'a [PortDescriptor],
) -> Option<&'a PortDescriptor> {
    ports.iter().find(|descriptor| matcher.is_match(descriptor))
}
