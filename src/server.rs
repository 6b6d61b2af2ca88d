//! Control-channel server: accept loop, session map, request dispatcher
//!
//! One task per accepted connection. Each request frame is decoded into
//! the `{api, params}` envelope and routed through an ordered middleware
//! chain (route lookup, unix gate, rexec gate, require-connected) before
//! its handler runs. Handler failures become coded response envelopes and
//! the connection lives on; only stream-level failures end a connection,
//! and they take that session's live transactions with them.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::auth::Auth;
use crate::discovery;
use crate::logger::Logger;
use crate::message::{
    param_opt_bool, param_opt_str, param_str, param_str_list, param_u64, Request, Response,
    ServerInfo,
};
use crate::protocol::{api, frame, ErrorCode};
use crate::protocol_core::{read_frame, write_frame, BoxedStream};
use crate::session::Session;
use crate::sharing::SharingRegistry;
use crate::transfer::{
    Direction, FileMeta, OverwritePolicy, PutPlan, Transaction, TransferEngine,
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Advertised server name
    pub name: String,
    /// Control-channel bind address, host:port
    pub bind: String,
    /// UDP discovery port; None disables the responder
    pub discovery_port: Option<u16>,
    /// Allow the rexec api (unix only)
    pub rexec_enabled: bool,
}

/// The process context: registry, auth, transfer engine, live sessions.
/// Construction and teardown are explicit; nothing here is a global.
pub struct Server {
    opts: ServerOptions,
    advertised: SocketAddr,
    registry: SharingRegistry,
    auth: Auth,
    engine: TransferEngine,
    sessions: Mutex<HashMap<SocketAddr, Arc<Mutex<Session>>>>,
    logger: Arc<dyn Logger>,
    tls: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(
        opts: ServerOptions,
        registry: SharingRegistry,
        auth: Auth,
        logger: Arc<dyn Logger>,
        tls_config: Option<rustls::ServerConfig>,
    ) -> Result<Arc<Self>> {
        let advertised: SocketAddr = opts
            .bind
            .parse()
            .with_context(|| format!("parse bind address {}", opts.bind))?;
        let engine = TransferEngine::new(advertised.ip(), logger.clone());
        Ok(Arc::new(Self {
            opts,
            advertised,
            registry,
            auth,
            engine,
            sessions: Mutex::new(HashMap::new()),
            logger,
            tls: tls_config.map(|c| TlsAcceptor::from(Arc::new(c))),
        }))
    }

    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            name: self.opts.name.clone(),
            ip: self.advertised.ip().to_string(),
            port: self.advertised.port(),
            auth_required: self.auth.required(),
            ssl_enabled: self.tls.is_some(),
            sharings: self.registry.snapshot(),
        }
    }

    /// Accept control connections forever. Also runs the discovery
    /// responder when a discovery port is configured.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.opts.bind)
            .await
            .with_context(|| format!("bind {}", self.opts.bind))?;
        eprintln!(
            "ferryd listening on {} ({} sharings, tls={})",
            self.opts.bind,
            self.registry.snapshot().len(),
            self.tls.is_some()
        );

        if let Some(port) = self.opts.discovery_port {
            let me = self.clone();
            let bind = SocketAddr::new(self.advertised.ip(), port);
            tokio::spawn(async move {
                let source = me.clone();
                if let Err(e) = discovery::serve_responder(bind, move || source.server_info()).await
                {
                    eprintln!("discovery responder failed: {:#}", e);
                }
            });
        }

        loop {
            let (stream, peer) = listener.accept().await?;
            let _ = stream.set_nodelay(true);
            let me = self.clone();
            tokio::spawn(async move {
                me.handle_connection(stream, peer).await;
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, tcp: TcpStream, peer: SocketAddr) {
        let mut stream: BoxedStream = match &self.tls {
            Some(acceptor) => match acceptor.accept(tcp).await {
                Ok(s) => Box::new(s),
                Err(e) => {
                    eprintln!("tls handshake with {} failed: {}", peer, e);
                    return;
                }
            },
            None => Box::new(tcp),
        };

        let session = Arc::new(Mutex::new(Session::new(peer)));
        self.sessions.lock().insert(peer, session.clone());
        self.logger.session_open(peer);

        if let Err(e) = self.connection_loop(&mut stream, peer, &session).await {
            eprintln!("connection {} closed: {:#}", peer, e);
        }

        self.sessions.lock().remove(&peer);
        self.engine.abort_owned_by(peer).await;
        self.logger.session_close(peer);
    }

    async fn connection_loop(
        &self,
        stream: &mut BoxedStream,
        peer: SocketAddr,
        session: &Arc<Mutex<Session>>,
    ) -> Result<()> {
        loop {
            let (typ, payload) = match read_frame(stream).await {
                Ok(f) => f,
                Err(e) => {
                    // Peer gone or stream garbled; either way this
                    // connection is done
                    return Err(e);
                }
            };
            if typ != frame::REQUEST {
                write_response(stream, &Response::fail(ErrorCode::InvalidRequest)).await?;
                continue;
            }
            let req: Request = match serde_json::from_slice(&payload) {
                Ok(r) => r,
                Err(_) => {
                    write_response(stream, &Response::fail(ErrorCode::InvalidRequest)).await?;
                    continue;
                }
            };

            match self.dispatch(peer, session, req).await {
                Outcome::Reply(resp) => write_response(stream, &resp).await?,
                Outcome::ReplyThen(resp, follow) => {
                    // The metadata response must be on the wire before the
                    // corresponding bytes can appear on the side channel
                    write_response(stream, &resp).await?;
                    match follow {
                        FollowUp::SendFile { txn, meta } => txn.enqueue_send(meta).await,
                        FollowUp::RecvFile {
                            txn,
                            abs,
                            name,
                            size,
                        } => txn.enqueue_recv(abs, name, size).await,
                    }
                }
            }
        }
    }

    /// Middleware-ordered dispatch. Every path out of here is a definite
    /// response; handler error codes never kill the connection.
    async fn dispatch(
        &self,
        peer: SocketAddr,
        session: &Arc<Mutex<Session>>,
        req: Request,
    ) -> Outcome {
        let Some(route) = route_for(&req.api) else {
            return Outcome::Reply(Response::fail(ErrorCode::UnknownApi));
        };
        if route.unix_only && !cfg!(unix) {
            return Outcome::Reply(Response::fail(ErrorCode::SupportedOnlyForUnix));
        }
        if route.requires_rexec && !self.opts.rexec_enabled {
            return Outcome::Reply(Response::fail(ErrorCode::RexecDisabled));
        }
        if route.requires_connected && !session.lock().is_connected() {
            return Outcome::Reply(Response::fail(ErrorCode::NotConnected));
        }

        match self.handle(peer, session, &req).await {
            Ok(outcome) => outcome,
            Err(code) => Outcome::Reply(Response::fail(code)),
        }
    }

    async fn handle(
        &self,
        peer: SocketAddr,
        session: &Arc<Mutex<Session>>,
        req: &Request,
    ) -> Result<Outcome, ErrorCode> {
        let p = &req.params;
        let reply = |v: Value| {
            Ok(Outcome::Reply(if v.is_null() {
                Response::ok_empty()
            } else {
                Response::ok(v)
            }))
        };

        match req.api.as_str() {
            api::CONNECT => {
                let sharing = param_str(p, "sharing")?;
                let credential = param_opt_str(p, "password");
                let out = session
                    .lock()
                    .connect(&self.registry, &self.auth, sharing, credential)?;
                self.logger.connected(peer, sharing);
                reply(out)
            }
            api::DISCONNECT => reply(session.lock().disconnect()?),
            api::LIST => reply(
                serde_json::to_value(self.registry.snapshot())
                    .map_err(|_| ErrorCode::CommandExecutionFailed)?,
            ),
            api::INFO => reply(
                serde_json::to_value(self.server_info())
                    .map_err(|_| ErrorCode::CommandExecutionFailed)?,
            ),
            api::PING => reply(session.lock().ping()?),
            api::RCD => {
                let path = param_str(p, "path")?;
                reply(session.lock().rcd(path)?)
            }
            api::RLS => reply(session.lock().rls(param_opt_str(p, "path"))?),
            api::RMKDIR => {
                let path = param_str(p, "path")?;
                reply(session.lock().rmkdir(path)?)
            }
            api::GET => {
                let paths = param_str_list(p, "paths")?;
                let (sharing, rcwd) = session.lock().view()?;
                let txn = self.engine.begin_get(peer, sharing, rcwd, paths).await?;
                reply(json!({ "transaction": txn.id, "port": txn.port }))
            }
            api::GET_NEXT => {
                let txn = self.lookup_txn(p, peer)?;
                if txn.direction != Direction::Get {
                    return Err(ErrorCode::InvalidTransaction);
                }
                if param_opt_bool(p, "abort").unwrap_or(false) {
                    let outcomes = self.engine.abort(&txn).await;
                    return reply(done_payload(outcomes));
                }
                match self.engine.next_get_file(&txn) {
                    Some(meta) => Ok(Outcome::ReplyThen(
                        Response::ok(json!({ "name": meta.name.clone(), "size": meta.size })),
                        FollowUp::SendFile { txn, meta },
                    )),
                    None => {
                        let outcomes = self.engine.finish(&txn).await;
                        reply(done_payload(outcomes))
                    }
                }
            }
            api::PUT => {
                let overwrite = match param_opt_str(p, "overwrite") {
                    Some(s) => {
                        OverwritePolicy::parse(s).ok_or(ErrorCode::InvalidCommandSyntax)?
                    }
                    None => OverwritePolicy::default(),
                };
                let (sharing, rcwd) = session.lock().view()?;
                let txn = self
                    .engine
                    .begin_put(peer, sharing, rcwd, overwrite)
                    .await?;
                reply(json!({ "transaction": txn.id, "port": txn.port }))
            }
            api::PUT_NEXT => {
                let txn = self.lookup_txn(p, peer)?;
                if param_opt_bool(p, "abort").unwrap_or(false) {
                    let outcomes = self.engine.abort(&txn).await;
                    return reply(done_payload(outcomes));
                }
                if param_opt_bool(p, "end").unwrap_or(false) {
                    let outcomes = self.engine.finish(&txn).await;
                    return reply(done_payload(outcomes));
                }
                let file = p
                    .get("file")
                    .and_then(|v| v.as_object())
                    .ok_or(ErrorCode::InvalidCommandSyntax)?;
                let name = param_str(file, "name")?;
                let is_dir = param_opt_bool(file, "dir").unwrap_or(false);
                let size = if is_dir { 0 } else { param_u64(file, "size")? };
                let decision = param_opt_bool(p, "overwrite");
                match self.engine.plan_put(&txn, name, size, is_dir, decision)? {
                    PutPlan::Ask => reply(json!({ "status": "ask" })),
                    PutPlan::Skipped => reply(json!({ "status": "skipped" })),
                    PutPlan::DirCreated => reply(json!({ "status": "accepted" })),
                    PutPlan::Accepted { abs, name, size } => Ok(Outcome::ReplyThen(
                        Response::ok(json!({ "status": "accepted" })),
                        FollowUp::RecvFile {
                            txn,
                            abs,
                            name,
                            size,
                        },
                    )),
                }
            }
            api::REXEC => {
                let cmd = param_str(p, "cmd")?;
                reply(run_rexec(cmd).await?)
            }
            _ => Err(ErrorCode::UnknownApi),
        }
    }

    fn lookup_txn(
        &self,
        params: &serde_json::Map<String, Value>,
        peer: SocketAddr,
    ) -> Result<Arc<Transaction>, ErrorCode> {
        let id = param_str(params, "transaction")?;
        self.engine.lookup(id, peer)
    }
}

fn done_payload(outcomes: Vec<crate::transfer::FileOutcome>) -> Value {
    json!({
        "done": true,
        "outcomes": serde_json::to_value(outcomes).unwrap_or_default(),
    })
}

enum Outcome {
    Reply(Response),
    /// Response first, side-channel work after (ordering guarantee)
    ReplyThen(Response, FollowUp),
}

enum FollowUp {
    SendFile {
        txn: Arc<Transaction>,
        meta: FileMeta,
    },
    RecvFile {
        txn: Arc<Transaction>,
        abs: PathBuf,
        name: String,
        size: u64,
    },
}

struct Route {
    requires_connected: bool,
    unix_only: bool,
    requires_rexec: bool,
}

const fn route(requires_connected: bool, unix_only: bool, requires_rexec: bool) -> Route {
    Route {
        requires_connected,
        unix_only,
        requires_rexec,
    }
}

/// The dispatcher table. INFO/LIST/PING stay unauthenticated so clients
/// can browse before connecting; callers wanting a stricter policy gate
/// here.
fn route_for(api_name: &str) -> Option<Route> {
    Some(match api_name {
        api::CONNECT | api::DISCONNECT | api::LIST | api::INFO | api::PING => {
            route(false, false, false)
        }
        api::RCD | api::RLS | api::RMKDIR => route(true, false, false),
        api::GET | api::GET_NEXT | api::PUT | api::PUT_NEXT => route(true, false, false),
        api::REXEC => route(false, true, true),
        _ => return None,
    })
}

async fn write_response(stream: &mut BoxedStream, resp: &Response) -> Result<()> {
    let payload = serde_json::to_vec(resp).context("encode response")?;
    write_frame(stream, frame::RESPONSE, &payload).await
}

#[cfg(unix)]
async fn run_rexec(cmd: &str) -> Result<Value, ErrorCode> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .map_err(|_| ErrorCode::CommandExecutionFailed)?;
    let mut out = String::from_utf8_lossy(&output.stdout).to_string();
    out.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(json!({ "out": out, "exit": output.status.code().unwrap_or(-1) }))
}

#[cfg(not(unix))]
async fn run_rexec(_cmd: &str) -> Result<Value, ErrorCode> {
    // The unix gate in the dispatcher rejects these before we get here
    Err(ErrorCode::SupportedOnlyForUnix)
}
