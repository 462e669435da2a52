//! Device identity.

use core::fmt;

/// The kind of device a resource manager drives.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum DeviceKind {
    Cpu,
    Ascend,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "CPU",
            DeviceKind::Ascend => "Ascend",
        }
    }

    pub fn from_name(name: &str) -> Option<DeviceKind> {
        match name {
            "CPU" => Some(DeviceKind::Cpu),
            "Ascend" => Some(DeviceKind::Ascend),
            _ => None,
        }
    }
}

/// A concrete device: a kind plus a card index. Devices compare by both
/// fields.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Device {
    pub kind: DeviceKind,
    pub index: u16,
}

impl Device {
    pub const CPU: Device = Device { kind: DeviceKind::Cpu, index: 0 };

    pub fn new(kind: DeviceKind, index: u16) -> Device {
        Device { kind, index }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.index)
    }
}
