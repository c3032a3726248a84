pub mod block;
pub mod command;
pub mod error;
pub mod fat;
pub mod remote;
pub mod session;
pub mod transfer;

pub use block::{BlockDevice, FileDisk, MemoryDisk, Sector};
pub use error::{CorruptVolume, Error, TransportError};
pub use session::Session;
pub use transfer::{FileTransferEngine, VolumeInfo};

pub const SECTOR_SIZE: usize = 512;
