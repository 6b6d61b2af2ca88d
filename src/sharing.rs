//! Named directory trees exposed by the server
//!
//! Sharings are built once from configuration at startup and are immutable
//! for the process lifetime, so sessions can hold `Arc<Sharing>` handles
//! without any locking.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::message::{FileType, SharingInfo};

#[derive(Debug)]
pub struct Sharing {
    pub name: String,
    /// Canonical absolute root; the sandbox compares against this
    pub root: PathBuf,
    pub read_only: bool,
}

/// Sharing names travel on the wire and double as path-ish labels, so the
/// charset stays narrow.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl Sharing {
    pub fn new(name: &str, root: &Path, read_only: bool) -> Result<Self> {
        if !valid_name(name) {
            bail!("invalid sharing name: {:?}", name);
        }
        if !root.is_dir() {
            bail!("sharing root is not a directory: {}", root.display());
        }
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("canonicalize sharing root {}", root.display()))?;
        Ok(Self {
            name: name.to_string(),
            root,
            read_only,
        })
    }
}

#[derive(Debug, Default)]
pub struct SharingRegistry {
    sharings: Vec<Arc<Sharing>>,
}

impl SharingRegistry {
    pub fn new(sharings: Vec<Sharing>) -> Result<Self> {
        let mut reg = SharingRegistry::default();
        for s in sharings {
            reg.add(s)?;
        }
        Ok(reg)
    }

    pub fn add(&mut self, sharing: Sharing) -> Result<()> {
        if self.lookup(&sharing.name).is_some() {
            bail!("duplicate sharing name: {}", sharing.name);
        }
        self.sharings.push(Arc::new(sharing));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Sharing>> {
        self.sharings.iter().find(|s| s.name == name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.sharings.is_empty()
    }

    /// Advertised view used by `list`, `info` and discovery responses
    pub fn snapshot(&self) -> Vec<SharingInfo> {
        self.sharings
            .iter()
            .map(|s| SharingInfo {
                name: s.name.clone(),
                ftype: FileType::Dir,
                read_only: s.read_only,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_valid_names() {
        assert!(valid_name("docs"));
        assert!(valid_name("my-share_2"));
        assert!(!valid_name(""));
        assert!(!valid_name("has space"));
        assert!(!valid_name("slash/y"));
        assert!(!valid_name("dollar$"));
    }

    #[test]
    fn test_root_must_be_directory() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();

        assert!(Sharing::new("ok", tmp.path(), false).is_ok());
        assert!(Sharing::new("bad", &file, false).is_err());
        assert!(Sharing::new("gone", &tmp.path().join("missing"), false).is_err());
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let tmp = TempDir::new().unwrap();
        let a = Sharing::new("docs", tmp.path(), false).unwrap();
        let b = Sharing::new("docs", tmp.path(), true).unwrap();
        let mut reg = SharingRegistry::new(vec![a]).unwrap();
        assert!(reg.add(b).is_err());
        assert!(reg.lookup("docs").is_some());
        assert!(reg.lookup("other").is_none());
    }
}
