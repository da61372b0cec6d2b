use crate::StrataError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Mount-time policy for a volume.
///
/// Every field has a default, so a JSON document only needs to name the
/// options it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MountOptions {
    /// Write bitmaps and spliced pointers through to the device immediately
    pub sync: bool,
    /// Write directory metadata through immediately
    pub dirsync: bool,
    /// New inodes take the parent directory's group id
    pub grpid: bool,
    /// Place directories with the simple "most free blocks" policy instead of Orlov
    pub old_alloc: bool,
    /// Overrides the superblock's reserved-blocks owner
    pub resuid: Option<u32>,
    /// Overrides the superblock's reserved-blocks group
    pub resgid: Option<u32>,
    /// Seed for group-spreading randomness; OS entropy when absent
    pub random_seed: Option<u64>,
    /// Soft limit on clean buffers kept in the block cache
    pub cache_capacity: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            sync: false,
            dirsync: false,
            grpid: false,
            old_alloc: false,
            resuid: None,
            resgid: None,
            random_seed: None,
            cache_capacity: 4096,
        }
    }
}

impl MountOptions {
    pub fn from_json(text: &str) -> Result<Self, StrataError> {
        let options: MountOptions = serde_json::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StrataError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), StrataError> {
        if self.cache_capacity == 0 {
            return Err(StrataError::Configuration(
                "cache_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let opts = MountOptions::from_json(r#"{ "sync": true, "random_seed": 7 }"#).unwrap();
        assert!(opts.sync);
        assert_eq!(opts.random_seed, Some(7));
        assert!(!opts.dirsync);
        assert_eq!(opts.cache_capacity, MountOptions::default().cache_capacity);
    }

    #[test]
    fn zero_cache_is_rejected() {
        let err = MountOptions::from_json(r#"{ "cache_capacity": 0 }"#).unwrap_err();
        assert!(matches!(err, StrataError::Configuration(_)));
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        let err = MountOptions::from_json("{ sync: yes").unwrap_err();
        assert!(matches!(err, StrataError::SerializationError(_)));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mount.json");
        std::fs::write(&path, r#"{ "grpid": true, "resuid": 1000 }"#).unwrap();

        let opts = MountOptions::from_file(&path).unwrap();
        assert!(opts.grpid);
        assert_eq!(opts.resuid, Some(1000));
    }
}
