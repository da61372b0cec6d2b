// The ext family. Only the ext2 on-disk format is implemented.

pub mod ext2_native;

pub use self::ext2_native::{Ext2Fs, FilesystemParams};
