//! GET/PUT transfer engine
//!
//! A transaction pairs one control-channel conversation with one dedicated
//! side-channel socket. The control side pulls work (one file per
//! round-trip); the side channel carries nothing but file bytes and a
//! CRC32 trailer per file. Side-channel I/O runs on its own task, fed
//! through a command queue, so a stalled transfer never blocks the
//! control loop.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration, Instant};

use crate::checksum::{parse_trailer, TransferChecksum, CRC_TRAILER_LEN};
use crate::logger::Logger;
use crate::protocol::timeouts::{read_deadline_ms, write_deadline_ms, SIDE_ACCEPT_MS};
use crate::protocol::{ErrorCode, TRANSFER_CHUNK};
use crate::sandbox;
use crate::sharing::Sharing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Get,
    Put,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Get => "get",
            Direction::Put => "put",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwritePolicy {
    /// Defer the decision to the caller per file
    #[default]
    Prompt,
    Always,
    Never,
}

impl OverwritePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prompt" => Some(Self::Prompt),
            "always" => Some(Self::Always),
            "never" => Some(Self::Never),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Skipped,
    Error,
}

/// Per-file result, aggregated into the transaction summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub name: String,
    pub status: OutcomeStatus,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Metadata reported over the control channel before a file's bytes move
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub abs: PathBuf,
    pub name: String,
    pub size: u64,
}

/// What a `put_next` request should do, decided against the overwrite
/// policy before any side-channel byte is consumed
#[derive(Debug)]
pub enum PutPlan {
    Accepted { abs: PathBuf, name: String, size: u64 },
    DirCreated,
    Skipped,
    Ask,
}

enum SideCmd {
    Send { abs: PathBuf, name: String, size: u64 },
    Recv { abs: PathBuf, name: String, size: u64 },
    Finish { reply: oneshot::Sender<()> },
    Abort,
}

struct TxnState {
    worklist: VecDeque<PathBuf>,
    aborted: bool,
}

pub struct Transaction {
    pub id: String,
    pub direction: Direction,
    pub owner: SocketAddr,
    pub sharing: Arc<Sharing>,
    pub port: u16,
    pub overwrite: OverwritePolicy,
    /// rcwd at creation; PUT names resolve against it
    base: PathBuf,
    state: Mutex<TxnState>,
    outcomes: Mutex<Vec<FileOutcome>>,
    cmd_tx: mpsc::Sender<SideCmd>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("owner", &self.owner)
            .field("port", &self.port)
            .field("overwrite", &self.overwrite)
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    fn record(&self, outcome: FileOutcome) {
        self.outcomes.lock().push(outcome);
    }

    fn summary(&self) -> Vec<FileOutcome> {
        self.outcomes.lock().clone()
    }

    /// Queue one file for the side-channel task. Callers must have
    /// written the corresponding control response first.
    pub async fn enqueue_send(&self, meta: FileMeta) {
        let _ = self
            .cmd_tx
            .send(SideCmd::Send {
                abs: meta.abs,
                name: meta.name,
                size: meta.size,
            })
            .await;
    }

    pub async fn enqueue_recv(&self, abs: PathBuf, name: String, size: u64) {
        let _ = self.cmd_tx.send(SideCmd::Recv { abs, name, size }).await;
    }
}

pub struct TransferEngine {
    side_ip: IpAddr,
    transactions: Mutex<HashMap<String, Arc<Transaction>>>,
    logger: Arc<dyn Logger>,
}

impl TransferEngine {
    pub fn new(side_ip: IpAddr, logger: Arc<dyn Logger>) -> Self {
        Self {
            side_ip,
            transactions: Mutex::new(HashMap::new()),
            logger,
        }
    }

    async fn open_transaction(
        &self,
        direction: Direction,
        owner: SocketAddr,
        sharing: Arc<Sharing>,
        base: PathBuf,
        overwrite: OverwritePolicy,
        worklist: VecDeque<PathBuf>,
    ) -> Result<Arc<Transaction>, ErrorCode> {
        let listener = TcpListener::bind((self.side_ip, 0))
            .await
            .map_err(|_| ErrorCode::CommandExecutionFailed)?;
        let port = listener
            .local_addr()
            .map_err(|_| ErrorCode::CommandExecutionFailed)?
            .port();

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let txn = Arc::new(Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            owner,
            sharing,
            port,
            overwrite,
            base,
            state: Mutex::new(TxnState {
                worklist,
                aborted: false,
            }),
            outcomes: Mutex::new(Vec::new()),
            cmd_tx,
        });

        self.transactions.lock().insert(txn.id.clone(), txn.clone());
        tokio::spawn(side_task(txn.clone(), listener, cmd_rx, self.logger.clone()));
        self.logger.transfer_start(owner, direction.label(), &txn.id);
        Ok(txn)
    }

    /// Start a GET. Empty path set defaults to the current directory;
    /// entries failing the sandbox are skipped with a warning, not fatal.
    pub async fn begin_get(
        &self,
        owner: SocketAddr,
        sharing: Arc<Sharing>,
        rcwd: PathBuf,
        paths: Vec<String>,
    ) -> Result<Arc<Transaction>, ErrorCode> {
        let paths = if paths.is_empty() {
            vec![".".to_string()]
        } else {
            paths
        };
        let mut worklist = VecDeque::new();
        for p in &paths {
            match sandbox::resolve(&sharing.root, &rcwd, p) {
                Ok(r) if r.abs.exists() => worklist.push_back(r.abs),
                _ => eprintln!("get: skipping invalid path {:?}", p),
            }
        }
        self.open_transaction(
            Direction::Get,
            owner,
            sharing,
            rcwd,
            OverwritePolicy::default(),
            worklist,
        )
        .await
    }

    /// Start a PUT. Refused on read-only sharings.
    pub async fn begin_put(
        &self,
        owner: SocketAddr,
        sharing: Arc<Sharing>,
        rcwd: PathBuf,
        overwrite: OverwritePolicy,
    ) -> Result<Arc<Transaction>, ErrorCode> {
        if sharing.read_only {
            return Err(ErrorCode::CommandExecutionFailed);
        }
        self.open_transaction(
            Direction::Put,
            owner,
            sharing,
            rcwd,
            overwrite,
            VecDeque::new(),
        )
        .await
    }

    /// Look up a live transaction; ids are scoped to their owner.
    pub fn lookup(&self, id: &str, owner: SocketAddr) -> Result<Arc<Transaction>, ErrorCode> {
        self.transactions
            .lock()
            .get(id)
            .filter(|t| t.owner == owner)
            .cloned()
            .ok_or(ErrorCode::InvalidTransaction)
    }

    /// Pop the next file off a GET worklist, expanding directories
    /// depth-first (parent before children). Returns None when drained.
    pub fn next_get_file(&self, txn: &Transaction) -> Option<FileMeta> {
        let mut st = txn.state.lock();
        if st.aborted {
            return None;
        }
        while let Some(abs) = st.worklist.pop_front() {
            if !contained(&txn.sharing.root, &abs) {
                eprintln!("get {}: skipping out-of-sandbox entry {:?}", txn.id, abs);
                continue;
            }
            let Ok(md) = std::fs::metadata(&abs) else {
                eprintln!("get {}: skipping unreadable entry {:?}", txn.id, abs);
                continue;
            };
            if md.is_dir() {
                match std::fs::read_dir(&abs) {
                    Ok(rd) => {
                        let mut children: Vec<PathBuf> = rd.flatten().map(|e| e.path()).collect();
                        children.sort();
                        for child in children.into_iter().rev() {
                            st.worklist.push_front(child);
                        }
                    }
                    Err(e) => {
                        eprintln!("get {}: cannot list {:?}: {}", txn.id, abs, e);
                    }
                }
                continue;
            }
            let Ok(rel) = sandbox::relativize(&txn.sharing.root, &abs) else {
                continue;
            };
            return Some(FileMeta {
                name: rel.to_string_lossy().to_string(),
                size: md.len(),
                abs,
            });
        }
        None
    }

    /// Decide what to do with one incoming PUT file, before any
    /// side-channel byte is consumed. An explicit per-file decision
    /// (the answer to a previous "ask") overrides the transaction policy.
    pub fn plan_put(
        &self,
        txn: &Transaction,
        name: &str,
        size: u64,
        is_dir: bool,
        decision: Option<bool>,
    ) -> Result<PutPlan, ErrorCode> {
        if txn.direction != Direction::Put {
            return Err(ErrorCode::InvalidTransaction);
        }
        let resolved = sandbox::resolve(&txn.sharing.root, &txn.base, name)?;
        if is_dir {
            crate::protocol_core::ensure_dir_exists(&resolved.abs)
                .map_err(|_| ErrorCode::CommandExecutionFailed)?;
            return Ok(PutPlan::DirCreated);
        }
        if resolved.abs.exists() {
            let accept = match decision {
                Some(d) => d,
                None => match txn.overwrite {
                    OverwritePolicy::Always => true,
                    OverwritePolicy::Never => false,
                    OverwritePolicy::Prompt => return Ok(PutPlan::Ask),
                },
            };
            if !accept {
                self.logger.file_skipped(&txn.id, name);
                txn.record(FileOutcome {
                    name: name.to_string(),
                    status: OutcomeStatus::Skipped,
                    bytes: 0,
                    reason: None,
                });
                return Ok(PutPlan::Skipped);
            }
        }
        Ok(PutPlan::Accepted {
            abs: resolved.abs,
            name: name.to_string(),
            size,
        })
    }

    /// Wait for the side task to drain, then close out the transaction
    /// and return the per-file summary.
    pub async fn finish(&self, txn: &Arc<Transaction>) -> Vec<FileOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if txn
            .cmd_tx
            .send(SideCmd::Finish { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
        self.close(txn)
    }

    /// Cooperative cancel: clears pending work and wakes the side task.
    /// Never kills a chunk mid-write.
    pub async fn abort(&self, txn: &Arc<Transaction>) -> Vec<FileOutcome> {
        {
            let mut st = txn.state.lock();
            st.aborted = true;
            st.worklist.clear();
        }
        let _ = txn.cmd_tx.send(SideCmd::Abort).await;
        self.close(txn)
    }

    /// Abort every live transaction owned by a closing connection.
    pub async fn abort_owned_by(&self, owner: SocketAddr) {
        let owned: Vec<Arc<Transaction>> = self
            .transactions
            .lock()
            .values()
            .filter(|t| t.owner == owner)
            .cloned()
            .collect();
        for txn in owned {
            let _ = self.abort(&txn).await;
        }
    }

    fn close(&self, txn: &Arc<Transaction>) -> Vec<FileOutcome> {
        self.transactions.lock().remove(&txn.id);
        let outcomes = txn.summary();
        let files = outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Success)
            .count() as u64;
        let bytes = outcomes.iter().map(|o| o.bytes).sum();
        self.logger.transfer_done(&txn.id, files, bytes);
        outcomes
    }
}

/// Symlink re-check for entries picked up mid-walk
fn contained(root: &std::path::Path, abs: &std::path::Path) -> bool {
    match std::fs::canonicalize(abs) {
        Ok(canon) => canon.starts_with(root),
        Err(_) => false,
    }
}

#[inline]
async fn read_exact_timed(stream: &mut TcpStream, buf: &mut [u8], ms: u64) -> Result<()> {
    match timeout(Duration::from_millis(ms), stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => bail!("side channel read timeout ({} ms)", ms),
    }
}

#[inline]
async fn write_all_timed(stream: &mut TcpStream, buf: &[u8], ms: u64) -> Result<()> {
    match timeout(Duration::from_millis(ms), stream.write_all(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => bail!("side channel write timeout ({} ms)", ms),
    }
}

/// Owns the side-channel socket for one transaction: accepts exactly one
/// connection, then serves queued file commands until finish or abort.
/// Finish and abort are honored even while still waiting for the peer,
/// so a transaction that never gets its side connection can still be
/// closed out promptly.
async fn side_task(
    txn: Arc<Transaction>,
    listener: TcpListener,
    mut rx: mpsc::Receiver<SideCmd>,
    logger: Arc<dyn Logger>,
) {
    let accept_deadline = Instant::now() + Duration::from_millis(SIDE_ACCEPT_MS);
    let mut pending: VecDeque<SideCmd> = VecDeque::new();
    let mut stream = loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((s, _peer)) => {
                        let _ = s.set_nodelay(true);
                        break Some(s);
                    }
                    Err(e) => {
                        logger.error("side-accept", &format!("txn {}: {}", txn.id, e));
                        break None;
                    }
                }
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(SideCmd::Finish { reply }) => {
                        let _ = reply.send(());
                        return;
                    }
                    Some(SideCmd::Abort) | None => return,
                    // Data work waits until the peer shows up
                    Some(other) => pending.push_back(other),
                }
            }
            _ = tokio::time::sleep_until(accept_deadline) => {
                logger.error("side-accept", &format!("txn {}: no peer connected", txn.id));
                break None;
            }
        }
    };
    // At most one side-channel connection per transaction
    drop(listener);

    loop {
        let cmd = match pending.pop_front() {
            Some(c) => c,
            None => match rx.recv().await {
                Some(c) => c,
                None => break,
            },
        };
        match cmd {
            SideCmd::Send { abs, name, size } => {
                let result = match stream.as_mut() {
                    Some(s) => send_file(s, &abs, size).await,
                    None => Err(anyhow::anyhow!("side channel closed")),
                };
                match result {
                    Ok(()) => {
                        logger.file_done(&txn.id, &name, size);
                        txn.record(FileOutcome {
                            name,
                            status: OutcomeStatus::Success,
                            bytes: size,
                            reason: None,
                        });
                    }
                    Err(e) => {
                        logger.error("send", &format!("txn {} {}: {:#}", txn.id, name, e));
                        txn.record(FileOutcome {
                            name,
                            status: OutcomeStatus::Error,
                            bytes: 0,
                            reason: Some(format!("{:#}", e)),
                        });
                        // The byte stream is no longer aligned with file
                        // boundaries once a send fails partway
                        stream = None;
                    }
                }
            }
            SideCmd::Recv { abs, name, size } => {
                let result = match stream.as_mut() {
                    Some(s) => recv_file(s, &abs, size).await,
                    None => Err(RecvError::Fatal(anyhow::anyhow!("side channel closed"))),
                };
                match result {
                    Ok(()) => {
                        logger.file_done(&txn.id, &name, size);
                        txn.record(FileOutcome {
                            name,
                            status: OutcomeStatus::Success,
                            bytes: size,
                            reason: None,
                        });
                    }
                    Err(err) => {
                        let (fatal, e) = match err {
                            RecvError::Fatal(e) => (true, e),
                            RecvError::PerFile(e) => (false, e),
                        };
                        logger.error("recv", &format!("txn {} {}: {:#}", txn.id, name, e));
                        txn.record(FileOutcome {
                            name,
                            status: OutcomeStatus::Error,
                            bytes: 0,
                            reason: Some(format!("{:#}", e)),
                        });
                        if fatal {
                            stream = None;
                        }
                    }
                }
            }
            SideCmd::Finish { reply } => {
                let _ = reply.send(());
                break;
            }
            SideCmd::Abort => break,
        }
    }
    // Dropping the stream closes the channel
}

/// Stream exactly `size` content bytes plus the CRC trailer.
async fn send_file(stream: &mut TcpStream, abs: &std::path::Path, size: u64) -> Result<()> {
    let mut file = tokio::fs::File::open(abs)
        .await
        .with_context(|| format!("open {}", abs.display()))?;
    let mut checksum = TransferChecksum::new();
    let mut buf = vec![0u8; TRANSFER_CHUNK];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file
            .read(&mut buf[..want])
            .await
            .with_context(|| format!("read {}", abs.display()))?;
        if n == 0 {
            // File shrank under us; the receiver still expects `size`
            // bytes, so this connection can not be reused
            bail!("{} truncated mid-transfer", abs.display());
        }
        checksum.update(&buf[..n]);
        write_all_timed(stream, &buf[..n], write_deadline_ms(n)).await?;
        remaining -= n as u64;
    }
    write_all_timed(stream, &checksum.trailer(), write_deadline_ms(CRC_TRAILER_LEN)).await
}

enum RecvError {
    /// Socket-level failure; the stream is desynchronized and dead
    Fatal(anyhow::Error),
    /// Local failure; the wire bytes were fully consumed, the stream
    /// stays usable for the next file
    PerFile(anyhow::Error),
}

/// Read exactly `size` content bytes plus the CRC trailer into `abs`.
/// Disk failures keep consuming wire bytes so the stream stays aligned
/// with file boundaries.
async fn recv_file(stream: &mut TcpStream, abs: &std::path::Path, size: u64) -> Result<(), RecvError> {
    crate::protocol_core::ensure_parent_exists(abs).map_err(RecvError::PerFile)?;
    let mut file = None;
    let mut disk_error: Option<anyhow::Error> = None;
    match tokio::fs::File::create(abs).await {
        Ok(f) => file = Some(f),
        Err(e) => {
            disk_error = Some(
                anyhow::Error::from(e).context(format!("create {}", abs.display())),
            )
        }
    }

    let mut checksum = TransferChecksum::new();
    let mut buf = vec![0u8; TRANSFER_CHUNK];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        read_exact_timed(stream, &mut buf[..want], read_deadline_ms(want))
            .await
            .map_err(RecvError::Fatal)?;
        checksum.update(&buf[..want]);
        if disk_error.is_none() {
            if let Some(f) = file.as_mut() {
                if let Err(e) = f.write_all(&buf[..want]).await {
                    disk_error = Some(e.into());
                }
            }
        }
        remaining -= want as u64;
    }

    let mut trailer = [0u8; CRC_TRAILER_LEN];
    read_exact_timed(stream, &mut trailer, read_deadline_ms(CRC_TRAILER_LEN))
        .await
        .map_err(RecvError::Fatal)?;

    if let Some(e) = disk_error {
        return Err(RecvError::PerFile(e));
    }
    if parse_trailer(&trailer) != checksum.value() {
        return Err(RecvError::PerFile(anyhow::anyhow!(
            "checksum mismatch for {}",
            abs.display()
        )));
    }
    if let Some(f) = file.as_mut() {
        f.flush().await.map_err(|e| RecvError::PerFile(e.into()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use tempfile::TempDir;

    fn sharing_with_tree() -> (TempDir, Arc<Sharing>) {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub/deep")).unwrap();
        std::fs::write(tmp.path().join("a.txt"), "aaaa").unwrap();
        std::fs::write(tmp.path().join("sub/b.txt"), "bb").unwrap();
        std::fs::write(tmp.path().join("sub/deep/c.txt"), "c").unwrap();
        let sharing = Arc::new(Sharing::new("t", tmp.path(), false).unwrap());
        (tmp, sharing)
    }

    fn engine() -> TransferEngine {
        TransferEngine::new("127.0.0.1".parse().unwrap(), Arc::new(NoopLogger))
    }

    fn owner() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_overwrite_policy_parse() {
        assert_eq!(OverwritePolicy::parse("always"), Some(OverwritePolicy::Always));
        assert_eq!(OverwritePolicy::parse("never"), Some(OverwritePolicy::Never));
        assert_eq!(OverwritePolicy::parse("prompt"), Some(OverwritePolicy::Prompt));
        assert_eq!(OverwritePolicy::parse("sometimes"), None);
    }

    #[tokio::test]
    async fn test_get_walk_depth_first() {
        let (_tmp, sharing) = sharing_with_tree();
        let eng = engine();
        let txn = eng
            .begin_get(owner(), sharing, PathBuf::new(), vec![])
            .await
            .unwrap();

        let mut names = Vec::new();
        while let Some(meta) = eng.next_get_file(&txn) {
            names.push(meta.name);
        }
        assert_eq!(names, vec!["a.txt", "sub/b.txt", "sub/deep/c.txt"]);
        assert!(eng.next_get_file(&txn).is_none());
    }

    #[tokio::test]
    async fn test_get_invalid_paths_skipped() {
        let (_tmp, sharing) = sharing_with_tree();
        let eng = engine();
        let txn = eng
            .begin_get(
                owner(),
                sharing,
                PathBuf::new(),
                vec!["../etc".into(), "missing".into(), "a.txt".into()],
            )
            .await
            .unwrap();
        let meta = eng.next_get_file(&txn).unwrap();
        assert_eq!(meta.name, "a.txt");
        assert_eq!(meta.size, 4);
        assert!(eng.next_get_file(&txn).is_none());
    }

    #[tokio::test]
    async fn test_lookup_scoped_to_owner() {
        let (_tmp, sharing) = sharing_with_tree();
        let eng = engine();
        let txn = eng
            .begin_get(owner(), sharing, PathBuf::new(), vec![])
            .await
            .unwrap();
        assert!(eng.lookup(&txn.id, owner()).is_ok());
        assert_eq!(
            eng.lookup(&txn.id, "127.0.0.1:4001".parse().unwrap())
                .unwrap_err(),
            ErrorCode::InvalidTransaction
        );
        assert_eq!(
            eng.lookup("no-such-txn", owner()).unwrap_err(),
            ErrorCode::InvalidTransaction
        );
    }

    #[tokio::test]
    async fn test_abort_clears_worklist_and_unregisters() {
        let (_tmp, sharing) = sharing_with_tree();
        let eng = engine();
        let txn = eng
            .begin_get(owner(), sharing, PathBuf::new(), vec![])
            .await
            .unwrap();
        let _ = eng.abort(&txn).await;
        assert!(eng.next_get_file(&txn).is_none());
        assert!(eng.lookup(&txn.id, owner()).is_err());
    }

    #[tokio::test]
    async fn test_put_refused_on_read_only() {
        let tmp = TempDir::new().unwrap();
        let sharing = Arc::new(Sharing::new("ro", tmp.path(), true).unwrap());
        let eng = engine();
        assert_eq!(
            eng.begin_put(owner(), sharing, PathBuf::new(), OverwritePolicy::Always)
                .await
                .unwrap_err(),
            ErrorCode::CommandExecutionFailed
        );
    }

    #[tokio::test]
    async fn test_plan_put_policies() {
        let (tmp, sharing) = sharing_with_tree();
        let eng = engine();
        let txn = eng
            .begin_put(owner(), sharing, PathBuf::new(), OverwritePolicy::Prompt)
            .await
            .unwrap();

        // New file: no collision, always accepted
        assert!(matches!(
            eng.plan_put(&txn, "new.bin", 3, false, None).unwrap(),
            PutPlan::Accepted { .. }
        ));
        // Existing file under Prompt defers
        assert!(matches!(
            eng.plan_put(&txn, "a.txt", 3, false, None).unwrap(),
            PutPlan::Ask
        ));
        // Explicit decision overrides
        assert!(matches!(
            eng.plan_put(&txn, "a.txt", 3, false, Some(true)).unwrap(),
            PutPlan::Accepted { .. }
        ));
        assert!(matches!(
            eng.plan_put(&txn, "a.txt", 3, false, Some(false)).unwrap(),
            PutPlan::Skipped
        ));
        // Directory entries are created immediately
        assert!(matches!(
            eng.plan_put(&txn, "made/here", 0, true, None).unwrap(),
            PutPlan::DirCreated
        ));
        assert!(tmp.path().join("made/here").is_dir());
        // Sandbox still guards destinations
        assert_eq!(
            eng.plan_put(&txn, "../out.txt", 3, false, None).unwrap_err(),
            ErrorCode::InvalidPath
        );
    }

    #[tokio::test]
    async fn test_skip_recorded_in_summary() {
        let (_tmp, sharing) = sharing_with_tree();
        let eng = engine();
        let txn = eng
            .begin_put(owner(), sharing, PathBuf::new(), OverwritePolicy::Never)
            .await
            .unwrap();
        assert!(matches!(
            eng.plan_put(&txn, "a.txt", 3, false, None).unwrap(),
            PutPlan::Skipped
        ));
        let outcomes = eng.finish(&txn).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, OutcomeStatus::Skipped);
        assert_eq!(outcomes[0].name, "a.txt");
    }
}
