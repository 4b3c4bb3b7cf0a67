use std::fmt;

use super::service::FileService;

/// Notifications from the device enumeration layer.
pub enum DeviceEvent {
    Attached(AttachedDevice),
    /// Carries the device id.
    Detached(String),
}

/// A freshly paired device and the file-service clients opened for it.
pub struct AttachedDevice {
    pub id: String,
    pub label: String,
    pub primary: Box<dyn FileService>,
    /// Secondary root filesystem view, when the device exposes one.
    pub alternate: Option<Box<dyn FileService>>,
}

impl fmt::Debug for AttachedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedDevice")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("alternate", &self.alternate.is_some())
            .finish()
    }
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attached(device) => f.debug_tuple("Attached").field(device).finish(),
            Self::Detached(id) => f.debug_tuple("Detached").field(id).finish(),
        }
    }
}
