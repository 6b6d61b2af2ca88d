use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;

pub trait Logger: Send + Sync {
    fn session_open(&self, _peer: SocketAddr) {}
    fn session_close(&self, _peer: SocketAddr) {}
    fn connected(&self, _peer: SocketAddr, _sharing: &str) {}
    fn transfer_start(&self, _peer: SocketAddr, _direction: &str, _transaction: &str) {}
    fn file_done(&self, _transaction: &str, _name: &str, _bytes: u64) {}
    fn file_skipped(&self, _transaction: &str, _name: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn transfer_done(&self, _transaction: &str, _files: u64, _bytes: u64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn session_open(&self, peer: SocketAddr) {
        self.line(&format!("OPEN peer={}", peer));
    }
    fn session_close(&self, peer: SocketAddr) {
        self.line(&format!("CLOSE peer={}", peer));
    }
    fn connected(&self, peer: SocketAddr, sharing: &str) {
        self.line(&format!("CONNECT peer={} sharing={}", peer, sharing));
    }
    fn transfer_start(&self, peer: SocketAddr, direction: &str, transaction: &str) {
        self.line(&format!(
            "TRANSFER dir={} txn={} peer={}",
            direction, transaction, peer
        ));
    }
    fn file_done(&self, transaction: &str, name: &str, bytes: u64) {
        self.line(&format!("FILE txn={} name={} bytes={}", transaction, name, bytes));
    }
    fn file_skipped(&self, transaction: &str, name: &str) {
        self.line(&format!("SKIP txn={} name={}", transaction, name));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} msg={}", context, msg));
    }
    fn transfer_done(&self, transaction: &str, files: u64, bytes: u64) {
        self.line(&format!(
            "DONE txn={} files={} bytes={}",
            transaction, files, bytes
        ));
    }
}
