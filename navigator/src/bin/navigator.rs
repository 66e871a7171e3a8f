//! Main entry point for the Navigator executable.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Arg, ArgAction, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use navigator::config::ConfigSnapshot;
use navigator::hooks;
use navigator::logging::{self, LogFormat};
use navigator::server::{self, Navigator};

const SERVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const POOL_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn cli() -> Command {
    Command::new("navigator")
        .about("Multi-tenant HTTP front-end with on-demand backend processes")
        .arg(
            Arg::new("config")
                .index(1)
                .value_name("FILE")
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .short('l')
                .value_name("ADDR")
                .help("Override the configured listen address"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("Log output format: 'plain' or 'json'"),
        )
        .arg(
            Arg::new("pid-file")
                .long("pid-file")
                .value_name("FILE")
                .help("Override the PID file path"),
        )
        .arg(
            Arg::new("validate")
                .long("validate")
                .action(ArgAction::SetTrue)
                .help("Parse and validate the configuration, then exit"),
        )
        .arg(
            Arg::new("send-reload")
                .long("send-reload")
                .short('s')
                .action(ArgAction::SetTrue)
                .help("Tell a running navigator (via its PID file) to reload"),
        )
}

fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(Utf8PathBuf::from);
    let snapshot = match &config_path {
        Some(path) => ConfigSnapshot::load(path)?,
        None => ConfigSnapshot::parse_and_validate("")?,
    };

    if matches.get_flag("validate") {
        println!("configuration OK");
        return Ok(());
    }

    let pid_file = matches
        .get_one::<String>("pid-file")
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| snapshot.pid_file.clone());

    if matches.get_flag("send-reload") {
        return server::send_reload_signal(&pid_file);
    }

    let log_format: LogFormat = match matches.get_one::<String>("log-format") {
        Some(s) => s.parse()?,
        None => snapshot.log_format,
    };
    logging::init(log_format)?;

    let listen: SocketAddr = match matches.get_one::<String>("listen") {
        Some(addr) => addr
            .parse()
            .with_context(|| format!("invalid listen address {addr:?}"))?,
        None => snapshot.listen,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(run(snapshot, config_path, listen, pid_file))
}

async fn run(
    snapshot: std::sync::Arc<ConfigSnapshot>,
    config_path: Option<Utf8PathBuf>,
    listen: SocketAddr,
    pid_file: Utf8PathBuf,
) -> anyhow::Result<()> {
    let navigator = Navigator::new(snapshot.clone(), config_path.clone())?;

    server::write_pid_file(&pid_file)?;

    match hooks::execute(
        &snapshot.server_hooks.start,
        &Default::default(),
        "server-start",
        config_path.as_deref(),
    )
    .await
    {
        Ok(outcome) => {
            if let Some(path) = outcome.reload_config {
                info!(%path, "start hook rewrote the configuration, reloading");
                navigator.adopt(ConfigSnapshot::load(&path)?)?;
            }
        }
        Err(e) => warn!("server start hook failed: {e:#}"),
    }

    let listener = std::net::TcpListener::bind(listen)
        .with_context(|| format!("binding listener on {listen}"))?;
    info!(%listen, pid = std::process::id(), "navigator is listening");

    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server::serve(
        navigator.clone(),
        listener,
        shutdown.clone(),
    ));

    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                if let Err(e) = navigator.reload() {
                    error!("reload failed, keeping the old configuration: {e:#}");
                }
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                break;
            }
        }
    }

    // Stop accepting, drain in-flight requests, then take the pool down.
    shutdown.cancel();
    match tokio::time::timeout(SERVER_SHUTDOWN_GRACE, server_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("server error during shutdown: {e:#}"),
        Ok(Err(e)) => error!("server task panicked: {e}"),
        Err(_) => warn!("timed out draining in-flight requests"),
    }
    navigator.shutdown(Some(POOL_SHUTDOWN_GRACE)).await;

    if let Err(e) = hooks::execute(
        &navigator.config().server_hooks.stop,
        &Default::default(),
        "server-stop",
        config_path.as_deref(),
    )
    .await
    {
        warn!("server stop hook failed: {e:#}");
    }

    server::remove_pid_file(&pid_file);
    info!("navigator has shut down");
    Ok(())
}
