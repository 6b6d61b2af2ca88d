use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use ferry::auth::Auth;
use ferry::cli::DaemonOpts;
use ferry::config;
use ferry::logger::{Logger, NoopLogger, TextLogger};
use ferry::protocol::DEFAULT_DISCOVERY_PORT;
use ferry::server::{Server, ServerOptions};
use ferry::sharing::{Sharing, SharingRegistry};
use ferry::tls;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    let file_cfg = match &opts.config {
        Some(path) => config::load(path)?,
        None => config::FileConfig::default(),
    };

    // Flags override the config file
    let name = opts
        .name
        .clone()
        .or(file_cfg.name)
        .or_else(|| hostname::get().ok().map(|h| h.to_string_lossy().to_string()))
        .unwrap_or_else(|| "ferry".to_string());
    let bind = opts
        .bind
        .clone()
        .or(file_cfg.bind)
        .unwrap_or_else(|| format!("0.0.0.0:{}", ferry::protocol::DEFAULT_PORT));
    let discovery_port = opts
        .discovery_port
        .or(file_cfg.discovery_port)
        .unwrap_or(DEFAULT_DISCOVERY_PORT);
    let password = opts.password.clone().or(file_cfg.password);
    let rexec_enabled = opts.rexec || file_cfg.rexec.unwrap_or(false);

    // Collect sharings from both sources
    let mut specs = file_cfg.sharing;
    for raw in &opts.sharings {
        specs.push(config::parse_sharing_spec(raw)?);
    }
    if specs.is_empty() {
        anyhow::bail!("no sharings configured; pass --sharing NAME=PATH or a config file");
    }
    let mut sharings = Vec::new();
    for spec in &specs {
        sharings.push(
            Sharing::new(&spec.name, &spec.path, spec.read_only)
                .with_context(|| format!("sharing {:?}", spec.name))?,
        );
    }
    let registry = SharingRegistry::new(sharings)?;

    let auth = Auth::from_stored(password.as_deref());

    println!("Starting ferry daemon:");
    println!("  Name: {}", name);
    println!("  Bind: {}", bind);
    println!("  Discovery: udp/{}", discovery_port);
    for spec in &specs {
        println!(
            "  Sharing: {} -> {}{}",
            spec.name,
            spec.path.display(),
            if spec.read_only { " (read-only)" } else { "" }
        );
    }
    if !auth.required() {
        eprintln!("WARNING: no password configured; anyone on the network can connect");
    }
    if rexec_enabled {
        eprintln!("WARNING: rexec enabled; connected peers can run shell commands");
    }
    if bind.starts_with("0.0.0.0") {
        eprintln!("NOTE: binding to 0.0.0.0 exposes the daemon on all interfaces");
    }

    let tls_config = if opts.no_tls {
        eprintln!("WARNING: TLS disabled; control traffic travels in plain text");
        None
    } else {
        if let Some(ref cert_path) = opts.tls_cert {
            println!("  TLS: custom certificate {}", cert_path.display());
        } else {
            println!(
                "  TLS: self-signed certificate at {}/server-cert.pem",
                tls::config_dir().display()
            );
        }
        Some(
            tls::load_or_generate_server_config(opts.tls_cert.clone(), opts.tls_key.clone())
                .context("set up TLS configuration")?,
        )
    };

    let logger: Arc<dyn Logger> = match &opts.log_file {
        Some(path) => Arc::new(TextLogger::new(path)?),
        None => Arc::new(NoopLogger),
    };

    let server = Server::new(
        ServerOptions {
            name,
            bind,
            discovery_port: Some(discovery_port),
            rexec_enabled,
        },
        registry,
        auth,
        logger,
        tls_config,
    )?;

    ctrlc::set_handler(|| {
        eprintln!("ferryd: interrupted, shutting down");
        std::process::exit(0);
    })
    .context("install signal handler")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(server.serve())
}
