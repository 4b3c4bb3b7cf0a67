pub mod device;
pub mod error;
pub mod export;
pub mod gateway;
pub mod orchestrator;
pub mod registry;
pub mod service;
pub mod session;
pub mod stream;

pub use device::{AttachedDevice, DeviceEvent};
pub use error::{ErrorKind, Result, TransferError};
pub use export::{
    ExportEvent, ExportItem, ExportJob, ExportJobEngine, ExportJobSummary, ExportRequest,
    ExportResult, JobState,
};
pub use gateway::{Channel, DeviceChannelGateway, FileChannelHandle};
pub use orchestrator::Orchestrator;
pub use registry::StreamBridgeRegistry;
pub use service::{DirEntry, FileService, FileStat, OpenMode};
pub use session::DeviceSession;
pub use stream::{BridgeOptions, BridgeState, StreamBridge};
