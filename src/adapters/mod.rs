//! File-service backends.

pub mod local;
pub mod simulated;

pub use local::LocalDirService;
pub use simulated::{SimulatedDevice, SimulatedService};

use std::path::{Path, PathBuf};

use crate::core::device::AttachedDevice;
use crate::core::error::{Result, TransferError};
use crate::core::service::FileService;

/// Where a device's file services come from.
pub enum DeviceSource {
    /// A mounted device exposed as local directories.
    Local {
        root: PathBuf,
        alternate_root: Option<PathBuf>,
    },
    Simulated(SimulatedDevice),
}

/// Open the file-service clients for a device.
pub fn connect(id: &str, source: DeviceSource) -> Result<AttachedDevice> {
    match source {
        DeviceSource::Local {
            root,
            alternate_root,
        } => {
            ensure_dir(&root)?;
            let alternate: Option<Box<dyn FileService>> = match alternate_root {
                Some(alt) => {
                    ensure_dir(&alt)?;
                    Some(Box::new(LocalDirService::new(alt)))
                }
                None => None,
            };
            Ok(AttachedDevice {
                id: id.to_string(),
                label: root.display().to_string(),
                primary: Box::new(LocalDirService::new(root)),
                alternate,
            })
        }
        DeviceSource::Simulated(device) => Ok(AttachedDevice {
            id: id.to_string(),
            label: "Simulated device".to_string(),
            primary: Box::new(device.service()),
            alternate: Some(Box::new(device.service())),
        }),
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(TransferError::DeviceUnavailable(format!(
            "{} is not a mounted directory",
            path.display()
        )))
    }
}
