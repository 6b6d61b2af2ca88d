//! Per-connection session state machine
//!
//! A session starts unset, becomes connected after a successful CONNECT
//! (sharing lookup + credential check) and moves to disconnected either
//! explicitly or when the control socket dies. Navigation and listing all
//! go through the path sandbox; `rcwd` only ever changes on success.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::auth::Auth;
use crate::message::{FileInfo, FileType};
use crate::protocol::ErrorCode;
use crate::sandbox;
use crate::sharing::{Sharing, SharingRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unset,
    Connected,
    Disconnected,
}

pub struct Session {
    pub endpoint: SocketAddr,
    phase: Phase,
    sharing: Option<Arc<Sharing>>,
    rcwd: PathBuf,
}

impl Session {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            phase: Phase::Unset,
            sharing: None,
            rcwd: PathBuf::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    /// The connected sharing and current remote directory, for handlers
    /// that hand work to the transfer engine.
    pub fn view(&self) -> Result<(Arc<Sharing>, PathBuf), ErrorCode> {
        match (&self.phase, &self.sharing) {
            (Phase::Connected, Some(s)) => Ok((s.clone(), self.rcwd.clone())),
            _ => Err(ErrorCode::NotConnected),
        }
    }

    /// CONNECT: idempotent once connected; on auth failure the session
    /// stays where it was.
    pub fn connect(
        &mut self,
        registry: &SharingRegistry,
        auth: &Auth,
        sharing_name: &str,
        credential: Option<&str>,
    ) -> Result<Value, ErrorCode> {
        if self.phase == Phase::Connected {
            return Ok(Value::Null);
        }
        let sharing = registry
            .lookup(sharing_name)
            .ok_or(ErrorCode::SharingNotFound)?;
        if !auth.authenticate(credential) {
            return Err(ErrorCode::AuthenticationFailed);
        }
        self.phase = Phase::Connected;
        self.sharing = Some(sharing);
        self.rcwd = PathBuf::new();
        Ok(Value::Null)
    }

    /// DISCONNECT: idempotent; repeating it only warrants a warning.
    pub fn disconnect(&mut self) -> Result<Value, ErrorCode> {
        if self.phase == Phase::Disconnected {
            eprintln!("session {}: already disconnected", self.endpoint);
        }
        self.phase = Phase::Disconnected;
        self.sharing = None;
        self.rcwd = PathBuf::new();
        Ok(Value::Null)
    }

    pub fn ping(&self) -> Result<Value, ErrorCode> {
        Ok(json!("pong"))
    }

    /// Change the remote working directory. Mutates `rcwd` only when the
    /// target resolves to an existing directory inside the sharing.
    pub fn rcd(&mut self, path: &str) -> Result<Value, ErrorCode> {
        let (sharing, rcwd) = self.view()?;
        let resolved = sandbox::resolve(&sharing.root, &rcwd, path)?;
        if !resolved.abs.is_dir() {
            return Err(ErrorCode::InvalidPath);
        }
        self.rcwd = resolved.rel.clone();
        Ok(json!({ "rcwd": format!("/{}", resolved.rel.display()) }))
    }

    /// List a directory (the current one when no path is given),
    /// sorted by name.
    pub fn rls(&self, path: Option<&str>) -> Result<Value, ErrorCode> {
        let (sharing, rcwd) = self.view()?;
        let resolved = sandbox::resolve(&sharing.root, &rcwd, path.unwrap_or("."))?;
        if !resolved.abs.is_dir() {
            return Err(ErrorCode::InvalidPath);
        }
        let rd = std::fs::read_dir(&resolved.abs)
            .map_err(|_| ErrorCode::CommandExecutionFailed)?;
        let mut entries: Vec<FileInfo> = Vec::new();
        for entry in rd.flatten() {
            let Ok(md) = std::fs::metadata(entry.path()) else {
                continue; // unreadable entries are skipped, not fatal
            };
            let (ftype, size) = if md.is_dir() {
                (FileType::Dir, 0)
            } else {
                (FileType::File, md.len())
            };
            entries.push(FileInfo {
                name: entry.file_name().to_string_lossy().to_string(),
                ftype,
                size,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        serde_json::to_value(entries).map_err(|_| ErrorCode::CommandExecutionFailed)
    }

    /// Create a directory inside the sharing. Refused on read-only
    /// sharings.
    pub fn rmkdir(&self, path: &str) -> Result<Value, ErrorCode> {
        let (sharing, rcwd) = self.view()?;
        if sharing.read_only {
            return Err(ErrorCode::CommandExecutionFailed);
        }
        let resolved = sandbox::resolve(&sharing.root, &rcwd, path)?;
        crate::protocol_core::ensure_dir_exists(&resolved.abs)
            .map_err(|_| ErrorCode::CommandExecutionFailed)?;
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_setup() -> (TempDir, SharingRegistry, Auth, Session) {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("a.txt"), "hello world!").unwrap();
        std::fs::write(tmp.path().join("sub/b.txt"), "bytes").unwrap();
        let registry = SharingRegistry::new(vec![
            Sharing::new("docs", tmp.path(), false).unwrap(),
        ])
        .unwrap();
        let session = Session::new("127.0.0.1:5000".parse().unwrap());
        (tmp, registry, Auth::None, session)
    }

    #[test]
    fn test_unset_rejects_gated_ops() {
        let (_tmp, _reg, _auth, mut session) = test_setup();
        assert_eq!(session.phase(), Phase::Unset);
        assert_eq!(session.rcd("sub").unwrap_err(), ErrorCode::NotConnected);
        assert_eq!(session.rls(None).unwrap_err(), ErrorCode::NotConnected);
        assert_eq!(session.rmkdir("x").unwrap_err(), ErrorCode::NotConnected);
        assert!(session.ping().is_ok());
    }

    #[test]
    fn test_connect_unknown_sharing() {
        let (_tmp, reg, auth, mut session) = test_setup();
        assert_eq!(
            session.connect(&reg, &auth, "nope", None).unwrap_err(),
            ErrorCode::SharingNotFound
        );
        assert_eq!(session.phase(), Phase::Unset);
    }

    #[test]
    fn test_connect_auth_failure_keeps_unset() {
        let (_tmp, reg, _auth, mut session) = test_setup();
        let auth = Auth::from_stored(Some("hunter2"));
        assert_eq!(
            session.connect(&reg, &auth, "docs", Some("wrong")).unwrap_err(),
            ErrorCode::AuthenticationFailed
        );
        assert_eq!(session.phase(), Phase::Unset);
        assert!(session
            .connect(&reg, &auth, "docs", Some("hunter2"))
            .is_ok());
        assert_eq!(session.phase(), Phase::Connected);
    }

    #[test]
    fn test_connect_idempotent_without_reauth() {
        let (_tmp, reg, _auth, mut session) = test_setup();
        let auth = Auth::from_stored(Some("pw"));
        session.connect(&reg, &auth, "docs", Some("pw")).unwrap();
        // Second connect succeeds even with a bad credential
        assert!(session.connect(&reg, &auth, "docs", Some("bad")).is_ok());
    }

    #[test]
    fn test_disconnect_idempotent() {
        let (_tmp, reg, auth, mut session) = test_setup();
        session.connect(&reg, &auth, "docs", None).unwrap();
        assert!(session.disconnect().is_ok());
        assert_eq!(session.phase(), Phase::Disconnected);
        assert!(session.disconnect().is_ok());
        assert_eq!(session.rls(None).unwrap_err(), ErrorCode::NotConnected);
    }

    #[test]
    fn test_rls_root_listing() {
        let (_tmp, reg, auth, mut session) = test_setup();
        session.connect(&reg, &auth, "docs", None).unwrap();
        let listing: Vec<FileInfo> =
            serde_json::from_value(session.rls(None).unwrap()).unwrap();
        let summary: Vec<(String, FileType, u64)> = listing
            .iter()
            .map(|f| (f.name.clone(), f.ftype, f.size))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a.txt".to_string(), FileType::File, 12),
                ("sub".to_string(), FileType::Dir, 0),
            ]
        );
    }

    #[test]
    fn test_rcd_and_escape() {
        let (_tmp, reg, auth, mut session) = test_setup();
        session.connect(&reg, &auth, "docs", None).unwrap();

        let moved = session.rcd("sub").unwrap();
        assert_eq!(moved["rcwd"], "/sub");

        // Escape attempt fails and leaves rcwd unchanged
        assert_eq!(
            session.rcd("../../etc").unwrap_err(),
            ErrorCode::InvalidPath
        );
        let listing: Vec<FileInfo> =
            serde_json::from_value(session.rls(None).unwrap()).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "b.txt");
        assert_eq!(listing[0].size, 5);
    }

    #[test]
    fn test_rcd_into_file_rejected() {
        let (_tmp, reg, auth, mut session) = test_setup();
        session.connect(&reg, &auth, "docs", None).unwrap();
        assert_eq!(session.rcd("a.txt").unwrap_err(), ErrorCode::InvalidPath);
    }

    #[test]
    fn test_rmkdir_read_only_refused() {
        let tmp = TempDir::new().unwrap();
        let reg = SharingRegistry::new(vec![
            Sharing::new("ro", tmp.path(), true).unwrap(),
        ])
        .unwrap();
        let mut session = Session::new("127.0.0.1:5001".parse().unwrap());
        session.connect(&reg, &Auth::None, "ro", None).unwrap();
        assert_eq!(
            session.rmkdir("newdir").unwrap_err(),
            ErrorCode::CommandExecutionFailed
        );
        assert!(!tmp.path().join("newdir").exists());
    }

    #[test]
    fn test_rmkdir_creates_nested() {
        let (tmp, reg, auth, mut session) = test_setup();
        session.connect(&reg, &auth, "docs", None).unwrap();
        session.rmkdir("fresh/deep").unwrap();
        assert!(tmp.path().join("fresh/deep").is_dir());
        assert_eq!(
            session.rmkdir("/../side").unwrap_err(),
            ErrorCode::InvalidPath
        );
    }
}
