//! Control-channel client and transfer drivers
//!
//! The client owns one framed control connection and, per transfer, one
//! plain side-channel socket. GET pulls one file per `get_next`
//! round-trip so a caller can stop between files; PUT announces each
//! file over the control channel and only puts bytes on the side channel
//! once the server has accepted it.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::checksum::{parse_trailer, TransferChecksum, CRC_TRAILER_LEN};
use crate::message::{Request, Response};
use crate::protocol::timeouts::CONNECT_MS;
use crate::protocol::{api, frame, TRANSFER_CHUNK};
use crate::protocol_core::{read_frame, write_frame, BoxedStream};
use crate::tls;
use crate::transfer::{FileOutcome, OverwritePolicy};

pub struct Client {
    stream: BoxedStream,
    host: String,
}

impl Client {
    /// Open a plain control connection.
    pub async fn connect_plain(host: &str, port: u16) -> Result<Self> {
        let stream = dial(host, port).await?;
        Ok(Self {
            stream: Box::new(stream),
            host: host.to_string(),
        })
    }

    /// Open a TLS control connection with trust-on-first-use pinning.
    pub async fn connect_tls(host: &str, port: u16) -> Result<Self> {
        Self::connect_tls_with_known_hosts(host, port, tls::known_hosts_path()).await
    }

    pub async fn connect_tls_with_known_hosts(
        host: &str,
        port: u16,
        known_hosts: PathBuf,
    ) -> Result<Self> {
        let tcp = dial(host, port).await?;
        let config = tls::build_client_config_tofu_at(host, port, known_hosts);
        let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(config));
        let stream = connector
            .connect(tls::server_name_for(host), tcp)
            .await
            .context("tls handshake")?;
        Ok(Self {
            stream: Box::new(stream),
            host: host.to_string(),
        })
    }

    /// One request/response round-trip. The raw envelope comes back so
    /// callers can inspect error codes.
    pub async fn call(&mut self, req: Request) -> Result<Response> {
        let payload = serde_json::to_vec(&req).context("encode request")?;
        write_frame(&mut self.stream, frame::REQUEST, &payload).await?;
        let (typ, body) = read_frame(&mut self.stream).await?;
        if typ != frame::RESPONSE {
            bail!("unexpected frame type {} in response", typ);
        }
        serde_json::from_slice(&body).context("decode response")
    }

    /// Round-trip that treats a failure envelope as an error.
    pub async fn expect(&mut self, req: Request) -> Result<Value> {
        let api_name = req.api.clone();
        let resp = self.call(req).await?;
        if !resp.success {
            bail!(
                "{} failed: error code {}",
                api_name,
                resp.error.map(|e| e.to_string()).unwrap_or_default()
            );
        }
        Ok(resp.data.unwrap_or(Value::Null))
    }

    pub async fn connect_sharing(&mut self, sharing: &str, password: Option<&str>) -> Result<()> {
        let mut req = Request::new(api::CONNECT).with("sharing", json!(sharing));
        if let Some(pw) = password {
            req = req.with("password", json!(pw));
        }
        self.expect(req).await.map(|_| ())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.expect(Request::new(api::DISCONNECT)).await.map(|_| ())
    }

    pub async fn ping(&mut self) -> Result<Value> {
        self.expect(Request::new(api::PING)).await
    }

    pub async fn info(&mut self) -> Result<Value> {
        self.expect(Request::new(api::INFO)).await
    }

    pub async fn list(&mut self) -> Result<Value> {
        self.expect(Request::new(api::LIST)).await
    }

    pub async fn rcd(&mut self, path: &str) -> Result<Value> {
        self.expect(Request::new(api::RCD).with("path", json!(path)))
            .await
    }

    pub async fn rls(&mut self, path: Option<&str>) -> Result<Value> {
        let mut req = Request::new(api::RLS);
        if let Some(p) = path {
            req = req.with("path", json!(p));
        }
        self.expect(req).await
    }

    pub async fn rmkdir(&mut self, path: &str) -> Result<Value> {
        self.expect(Request::new(api::RMKDIR).with("path", json!(path)))
            .await
    }

    /// Download `paths` (server-side, empty means the remote cwd) into
    /// `dest`. Returns the server's per-file summary.
    pub async fn get(&mut self, paths: &[&str], dest: &Path) -> Result<Vec<FileOutcome>> {
        let data = self
            .expect(Request::new(api::GET).with("paths", json!(paths)))
            .await?;
        let (txn, port) = txn_endpoint(&data)?;
        let mut side = dial(&self.host, port).await.context("side channel")?;

        loop {
            let data = self
                .expect(Request::new(api::GET_NEXT).with("transaction", json!(txn)))
                .await?;
            if data.get("done").and_then(Value::as_bool).unwrap_or(false) {
                return parse_outcomes(&data);
            }
            let name = data
                .get("name")
                .and_then(Value::as_str)
                .context("file metadata missing name")?;
            let size = data
                .get("size")
                .and_then(Value::as_u64)
                .context("file metadata missing size")?;

            let target = join_under(dest, name)?;
            crate::protocol_core::ensure_parent_exists(&target)?;
            recv_side_file(&mut side, &target, size)
                .await
                .with_context(|| format!("receive {}", name))?;
        }
    }

    /// Abort a running GET/PUT by transaction id.
    pub async fn abort(&mut self, api_name: &str, txn: &str) -> Result<Vec<FileOutcome>> {
        let data = self
            .expect(
                Request::new(api_name)
                    .with("transaction", json!(txn))
                    .with("abort", json!(true)),
            )
            .await?;
        parse_outcomes(&data)
    }

    /// Upload local files/directories into the remote cwd. `ask` answers
    /// the server's per-file overwrite question when the transaction
    /// policy defers to the caller.
    pub async fn put<F>(
        &mut self,
        sources: &[PathBuf],
        overwrite: OverwritePolicy,
        mut ask: F,
    ) -> Result<Vec<FileOutcome>>
    where
        F: FnMut(&str) -> bool,
    {
        let policy = match overwrite {
            OverwritePolicy::Prompt => "prompt",
            OverwritePolicy::Always => "always",
            OverwritePolicy::Never => "never",
        };
        let data = self
            .expect(Request::new(api::PUT).with("overwrite", json!(policy)))
            .await?;
        let (txn, port) = txn_endpoint(&data)?;
        let mut side = dial(&self.host, port).await.context("side channel")?;

        for (local, name, is_dir) in enumerate_sources(sources)? {
            let size = if is_dir {
                0
            } else {
                std::fs::metadata(&local)
                    .with_context(|| format!("stat {}", local.display()))?
                    .len()
            };
            let file_desc = json!({ "name": name, "size": size, "dir": is_dir });
            let data = self
                .expect(
                    Request::new(api::PUT_NEXT)
                        .with("transaction", json!(txn))
                        .with("file", file_desc.clone()),
                )
                .await?;
            let mut status = data
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();

            if status == "ask" {
                let decision = ask(&name);
                let data = self
                    .expect(
                        Request::new(api::PUT_NEXT)
                            .with("transaction", json!(txn))
                            .with("file", file_desc)
                            .with("overwrite", json!(decision)),
                    )
                    .await?;
                status = data
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
            }

            if status == "accepted" && !is_dir {
                send_side_file(&mut side, &local, size)
                    .await
                    .with_context(|| format!("send {}", local.display()))?;
            }
        }

        let data = self
            .expect(
                Request::new(api::PUT_NEXT)
                    .with("transaction", json!(txn))
                    .with("end", json!(true)),
            )
            .await?;
        parse_outcomes(&data)
    }
}

async fn dial(host: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    let stream = timeout(
        Duration::from_millis(CONNECT_MS),
        TcpStream::connect(&addr),
    )
    .await
    .map_err(|_| anyhow::anyhow!("connect {} timed out", addr))?
    .with_context(|| format!("connect {}", addr))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

fn txn_endpoint(data: &Value) -> Result<(String, u16)> {
    let txn = data
        .get("transaction")
        .and_then(Value::as_str)
        .context("missing transaction id")?
        .to_string();
    let port = data
        .get("port")
        .and_then(Value::as_u64)
        .context("missing side-channel port")? as u16;
    Ok((txn, port))
}

fn parse_outcomes(data: &Value) -> Result<Vec<FileOutcome>> {
    match data.get("outcomes") {
        Some(v) => serde_json::from_value(v.clone()).context("decode outcomes"),
        None => Ok(Vec::new()),
    }
}

/// Keep server-supplied names under the local destination.
fn join_under(dest: &Path, name: &str) -> Result<PathBuf> {
    let mut out = dest.to_path_buf();
    for comp in Path::new(name).components() {
        match comp {
            std::path::Component::Normal(s) => out.push(s),
            std::path::Component::CurDir => {}
            _ => bail!("refusing server-supplied path {:?}", name),
        }
    }
    Ok(out)
}

/// Expand sources into (local path, wire name, is_dir) entries.
/// Directory sources keep their own name as the prefix; walk order puts
/// each directory before its contents.
fn enumerate_sources(sources: &[PathBuf]) -> Result<Vec<(PathBuf, String, bool)>> {
    let mut out = Vec::new();
    for src in sources {
        let md = std::fs::metadata(src).with_context(|| format!("stat {}", src.display()))?;
        let base_name = src
            .file_name()
            .with_context(|| format!("source has no name: {}", src.display()))?
            .to_string_lossy()
            .to_string();
        if md.is_file() {
            out.push((src.clone(), base_name, false));
            continue;
        }
        let parent = src.parent().unwrap_or(Path::new(""));
        for entry in walkdir::WalkDir::new(src).follow_links(false) {
            let entry = entry.with_context(|| format!("walk {}", src.display()))?;
            let rel = entry
                .path()
                .strip_prefix(parent)
                .context("walk escaped its prefix")?;
            let name = rel.to_string_lossy().to_string();
            if entry.file_type().is_dir() {
                out.push((entry.path().to_path_buf(), name, true));
            } else if entry.file_type().is_file() {
                out.push((entry.path().to_path_buf(), name, false));
            }
            // Symlinks are not carried over
        }
    }
    Ok(out)
}

/// Stream one local file onto the side channel: bytes, then trailer.
async fn send_side_file(side: &mut TcpStream, local: &Path, size: u64) -> Result<()> {
    let mut file = tokio::fs::File::open(local).await?;
    let mut checksum = TransferChecksum::new();
    let mut buf = vec![0u8; TRANSFER_CHUNK];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            bail!("{} truncated while sending", local.display());
        }
        checksum.update(&buf[..n]);
        side.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    side.write_all(&checksum.trailer()).await?;
    Ok(())
}

/// Receive one file from the side channel and verify its trailer.
async fn recv_side_file(side: &mut TcpStream, target: &Path, size: u64) -> Result<()> {
    let mut file = tokio::fs::File::create(target).await?;
    let mut checksum = TransferChecksum::new();
    let mut buf = vec![0u8; TRANSFER_CHUNK];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        side.read_exact(&mut buf[..want]).await?;
        checksum.update(&buf[..want]);
        file.write_all(&buf[..want]).await?;
        remaining -= want as u64;
    }
    let mut trailer = [0u8; CRC_TRAILER_LEN];
    side.read_exact(&mut trailer).await?;
    if parse_trailer(&trailer) != checksum.value() {
        bail!("checksum mismatch for {}", target.display());
    }
    file.flush().await?;
    Ok(())
}
