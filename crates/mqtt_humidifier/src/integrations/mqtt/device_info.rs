use crate::engine::DeviceInfo;

/// Device-info capability: exposes the configured device block, if usable
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfoProvider {
    device: Option<DeviceInfo>,
}

impl DeviceInfoProvider {
    pub fn new(device: Option<DeviceInfo>) -> Self {
        Self { device }
    }

    /// The device block, unless it carries neither identifiers nor connections
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device.as_ref().filter(|d| d.is_identifiable())
    }

    pub fn update(&mut self, device: Option<DeviceInfo>) {
        self.device = device;
    }
}
