//! Shared CLI helpers and small reusable Clap fragments

use clap::Parser;
use std::path::PathBuf;

/// Daemon options used by ferryd
#[derive(Clone, Debug, Parser)]
pub struct DaemonOpts {
    /// Optional TOML config file; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address (host:port); default 0.0.0.0:9040
    #[arg(long)]
    pub bind: Option<String>,

    /// Advertised server name (defaults to the machine hostname)
    #[arg(long)]
    pub name: Option<String>,

    /// UDP discovery port
    #[arg(long)]
    pub discovery_port: Option<u16>,

    /// Access secret: plaintext or a scrypt$salt$hash triple
    #[arg(long)]
    pub password: Option<String>,

    /// Sharing to expose, NAME=PATH or NAME=PATH:ro (repeatable)
    #[arg(short = 's', long = "sharing", value_name = "NAME=PATH[:ro]")]
    pub sharings: Vec<String>,

    /// Allow remote command execution (unix only)
    #[arg(long)]
    pub rexec: bool,

    /// Disable TLS on the control channel
    #[arg(long)]
    pub no_tls: bool,

    /// Custom TLS certificate (PEM); requires --tls-key
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Custom TLS private key (PEM)
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Append activity to this log file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}
