pub mod device;
pub mod error;
pub mod options;
pub mod test_utils;

pub use device::{BlockDevice, FileDevice, MemoryDevice};
pub use error::StrataError;
pub use options::MountOptions;
