//! Server configuration: TOML file plus command-line sharing specs

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Optional config file shape. Everything here can also come from flags;
/// flags win when both are given.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileConfig {
    pub name: Option<String>,
    pub bind: Option<String>,
    pub discovery_port: Option<u16>,
    /// Stored secret: plaintext or a `scrypt$salt$hash` triple
    pub password: Option<String>,
    pub rexec: Option<bool>,
    #[serde(default)]
    pub sharing: Vec<SharingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SharingConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

pub fn load(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
}

/// Parse a command-line sharing spec: `NAME=PATH` or `NAME=PATH:ro`
pub fn parse_sharing_spec(spec: &str) -> Result<SharingConfig> {
    let (name, rest) = spec
        .split_once('=')
        .with_context(|| format!("sharing spec missing '=': {:?}", spec))?;
    let (path, read_only) = match rest.strip_suffix(":ro") {
        Some(p) => (p, true),
        None => (rest, false),
    };
    if name.is_empty() || path.is_empty() {
        bail!("empty name or path in sharing spec: {:?}", spec);
    }
    Ok(SharingConfig {
        name: name.to_string(),
        path: PathBuf::from(path),
        read_only,
    })
}
