#![forbid(unsafe_code)]

//! `storyloop` binary: runs the execution engine against a workspace.
//!
//! Bootstraps configuration, resolves orphans from previous sessions,
//! starts the queue observer and the IPC server for `storyloop-ctl`, then
//! drives the scheduler to a terminal state. The process exit code reports
//! that state.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use storyloop::engine::scheduler::Scheduler;
use storyloop::engine::FATAL_EXIT_CODE;
use storyloop::executor::process::ProcessExecutor;
use storyloop::ipc::server::{spawn_ipc_server, IpcContext};
use storyloop::observer::spawn_observer;
use storyloop::registry::{SessionRegistry, DEFAULT_GRACE};
use storyloop::store::JobStore;
use storyloop::{AppError, EngineConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "storyloop", about = "Autonomous story execution loop", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "storyloop.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured workspace root.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Override the configured iteration cap.
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Terminate orphaned executor processes from previous sessions.
    #[arg(long)]
    kill_orphans: bool,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("{err}");
        return ExitCode::from(FATAL_EXIT_CODE);
    }
    info!("storyloop bootstrap");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to build tokio runtime");
            return ExitCode::from(FATAL_EXIT_CODE);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(%err, "storyloop failed");
            ExitCode::from(FATAL_EXIT_CODE)
        }
    }
}

async fn run(args: Cli) -> Result<u8> {
    // ── Load configuration ──────────────────────────────
    let mut config = EngineConfig::load_from_path(&args.config)?;
    if let Some(ws) = args.workspace {
        config = config.with_workspace_root(ws)?;
    }
    if let Some(max) = args.max_iterations {
        config = config.with_max_iterations(max)?;
    }
    let config = Arc::new(config);
    info!(
        workspace = %config.workspace_root.display(),
        state_dir = %config.state_path().display(),
        "configuration loaded"
    );

    // ── Open the job store ──────────────────────────────
    let store = JobStore::init(config.state_path())?;

    // ── Session registry & orphan recovery ──────────────
    let registry = Arc::new(SessionRegistry::new(config.registry_path()));
    let auto_kill = args.kill_orphans || config.registry.auto_kill_orphans;
    match registry.resolve_orphans(auto_kill, DEFAULT_GRACE).await {
        Ok(orphans) if !orphans.is_empty() => {
            warn!(count = orphans.len(), auto_kill, "orphaned processes found");
        }
        Ok(_) => {}
        Err(err) => warn!(%err, "orphan check failed"),
    }
    if let Err(err) = registry.record_engine() {
        warn!(%err, "failed to record engine in session registry");
    }

    let ct = CancellationToken::new();

    // ── Background observer (read-only) ─────────────────
    let (snapshot, observer_handle) = match spawn_observer(config.state_path(), ct.clone()) {
        Ok((rx, handle)) => (Some(rx), Some(handle)),
        Err(err) => {
            warn!(%err, "queue observer unavailable");
            (None, None)
        }
    };

    // ── Scheduler ───────────────────────────────────────
    let executor = Arc::new(ProcessExecutor::new(&config, Some(Arc::clone(&registry))));
    let (control_tx, control_rx) = mpsc::channel(16);
    let mut scheduler = Scheduler::new(Arc::clone(&config), store, executor, ct.clone())?
        .with_controls(control_rx);

    // ── IPC server for storyloop-ctl ────────────────────
    let ipc_ctx = IpcContext {
        controls: control_tx,
        status: scheduler.status(),
        snapshot,
    };
    let ipc_handle = match spawn_ipc_server(&config.ipc_name, ipc_ctx, ct.clone()) {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(%err, "IPC server unavailable; interactive controls disabled");
            None
        }
    };

    // ── Signals cancel the loop ─────────────────────────
    let signal_ct = ct.clone();
    let signal_handle = tokio::spawn(async move {
        tokio::select! {
            () = shutdown_signal() => {
                info!("shutdown signal received");
                signal_ct.cancel();
            }
            () = signal_ct.cancelled() => {}
        }
    });

    let result = scheduler.run().await;

    ct.cancel();
    let _ = signal_handle.await;
    if let Some(handle) = observer_handle {
        let _ = handle.await;
    }
    if let Some(handle) = ipc_handle {
        let _ = handle.await;
    }

    // Children were killed with their futures.
    match registry.clear_session() {
        Ok(dropped) => debug!(dropped, "session records cleared"),
        Err(err) => warn!(%err, "failed to clear session records"),
    }

    let terminal = result?;
    info!(?terminal, "storyloop shut down");
    Ok(terminal.exit_code())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
