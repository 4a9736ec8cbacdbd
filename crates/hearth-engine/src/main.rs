//! Hearth Engine - engine-side host for the editor process link.
//!
//! Connects to the editor, announces itself with a handshake and executes the
//! long operations the editor requests until it is told to shut down, the
//! editor goes away or the process is interrupted.

mod workers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use hearth_core::ipc::ProcessHandshakeMsg;
use hearth_core::task::WorkerStats;
use hearth_core::{
    Channel, ChannelMode, IpcConfig, LongOpConfig, LongOpWorkerManager, MessageKind, MessageLoop,
    ProcessCommunicationChannel, ProcessMessage, TaskConfig, TaskSystem, TaskSystemConfig,
    TransportKind, WorkerPoolConfig, WorkerThreadType,
};
use serde::Serialize;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// How long one pump iteration blocks waiting for traffic.
const PUMP_INTERVAL: Duration = Duration::from_millis(50);
/// How often worker utilization windows are rolled over.
const UTILIZATION_WINDOW: Duration = Duration::from_secs(1);
/// How long canceled operations get to report before the process exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "hearth-engine")]
#[command(about = "Engine host for the Hearth editor link")]
struct Args {
    /// Pipe name or host:port of the editor link
    #[arg(short, long, default_value = "hearth-engine")]
    address: String,

    /// Transport to use (pipe or network)
    #[arg(short, long, default_value = "pipe")]
    transport: TransportKind,

    /// Whether this process listens or connects
    #[arg(short, long, value_enum, default_value_t = Mode::Client)]
    mode: Mode,

    /// Seconds to wait for the editor to connect
    #[arg(long, default_value = "30")]
    connect_timeout_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines (honours RUST_LOG)
    #[arg(long)]
    json_logs: bool,

    /// Long task worker threads (defaults to half the cores)
    #[arg(long)]
    long_workers: Option<usize>,

    /// Smallest progress change forwarded to the editor (0 forwards all)
    #[arg(long, default_value = "0")]
    progress_min_delta: f32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Server,
    Client,
}

impl From<Mode> for ChannelMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Server => ChannelMode::Server,
            Mode::Client => ChannelMode::Client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum ExitReason {
    ShutdownRequested,
    PeerDisconnected,
    Interrupted,
}

/// Printed to stdout as one JSON line when the engine exits.
#[derive(Debug, Serialize)]
struct RunSummary {
    exit_reason: ExitReason,
    address: String,
    transport: TransportKind,
    canceled_operations: usize,
    drained: bool,
    long_tasks: Vec<WorkerStats>,
}

fn init_logging(args: &Args) {
    if args.json_logs {
        let fallback = if args.debug { "debug" } else { "info" };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_names(true)
            .init();
    } else {
        let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
        FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .init();
    }
}

fn task_config(args: &Args) -> TaskSystemConfig {
    let mut config = TaskSystemConfig::default();
    if let Some(long_workers) = args.long_workers {
        config.long_tasks =
            WorkerPoolConfig::new(long_workers.max(1), TaskConfig::DEFAULT_RESERVE_WORKERS);
    }
    config
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting Hearth engine host (pid {})", std::process::id());

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    let message_loop = MessageLoop::new()?;
    let comm = Arc::new(ProcessCommunicationChannel::new());
    let channel = Arc::new(Channel::new(
        &message_loop,
        args.transport,
        args.address.clone(),
        args.mode.into(),
    ));
    comm.connect_to(Arc::clone(&channel))
        .with_context(|| format!("failed to open {} channel {}", args.transport, args.address))?;

    if let Some(bound) = channel.bound_address() {
        // Read by the editor when it spawned us with an ephemeral address.
        println!("HEARTH_ADDRESS={bound}");
    }

    comm.wait_for_connection(Some(Duration::from_secs(args.connect_timeout_secs)))
        .context("editor did not connect")?;

    // Nothing but the handshake may go out first.
    comm.set_first_allowed_message_type(Some(MessageKind::Handshake));
    comm.send_message(&ProcessHandshakeMsg::for_current_process("hearth-engine").into())?;

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let lifecycle = {
        let shutdown_requested = Arc::clone(&shutdown_requested);
        comm.events()
            .subscribe_scoped(move |message: &ProcessMessage| match message {
                ProcessMessage::Handshake(handshake) => {
                    if handshake.protocol_version != IpcConfig::PROTOCOL_VERSION {
                        warn!(
                            "Peer '{}' speaks protocol {}, expected {}",
                            handshake.process_name,
                            handshake.protocol_version,
                            IpcConfig::PROTOCOL_VERSION
                        );
                    }
                    info!(
                        "Connected to '{}' (pid {})",
                        handshake.process_name, handshake.process_id
                    );
                }
                ProcessMessage::Shutdown(_) => {
                    info!("Shutdown requested by peer");
                    shutdown_requested.store(true, Ordering::SeqCst);
                }
                _ => {}
            })
    };

    let tasks = Arc::new(TaskSystem::new(task_config(&args))?);
    let manager = LongOpWorkerManager::new(
        Arc::clone(&comm),
        Arc::clone(&tasks),
        workers::builtin_registry(),
        LongOpConfig {
            progress_min_delta: args.progress_min_delta.clamp(0.0, 1.0),
        },
    );

    info!("Engine ready on {} ({})", args.address, args.transport);

    let mut window_start = Instant::now();
    let exit_reason = loop {
        if interrupted.load(Ordering::SeqCst) {
            break ExitReason::Interrupted;
        }
        if shutdown_requested.load(Ordering::SeqCst) {
            break ExitReason::ShutdownRequested;
        }
        if !comm.is_connected() {
            break ExitReason::PeerDisconnected;
        }

        comm.wait_for_messages(Some(PUMP_INTERVAL));

        let elapsed = window_start.elapsed();
        if elapsed >= UTILIZATION_WINDOW {
            tasks.update_thread_utilization(elapsed);
            window_start = Instant::now();
        }
    };
    info!("Engine stopping: {:?}", exit_reason);

    let canceled_operations = manager.cancel_all();
    let drained = manager.wait_until_idle(SHUTDOWN_GRACE);
    if !drained {
        warn!(
            "{} long operations still running after {:?}",
            manager.active_count(),
            SHUTDOWN_GRACE
        );
    }

    drop(lifecycle);
    comm.disconnect();
    tasks.shutdown();

    let summary = RunSummary {
        exit_reason,
        address: args.address,
        transport: args.transport,
        canceled_operations,
        drained,
        long_tasks: tasks.worker_stats(WorkerThreadType::LongTasks),
    };
    println!("{}", serde_json::to_string(&summary)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["hearth-engine"]);
        assert_eq!(args.transport, TransportKind::Pipe);
        assert!(matches!(args.mode, Mode::Client));
        assert_eq!(args.connect_timeout_secs, 30);
        assert_eq!(args.progress_min_delta, 0.0);
    }

    #[test]
    fn test_args_network_server() {
        let args = Args::parse_from([
            "hearth-engine",
            "--transport",
            "network",
            "--mode",
            "server",
            "--address",
            "127.0.0.1:0",
            "--long-workers",
            "3",
        ]);
        assert_eq!(args.transport, TransportKind::Network);
        assert_eq!(ChannelMode::from(args.mode), ChannelMode::Server);
        assert_eq!(task_config(&args).long_tasks.max_workers_to_use, 3);
    }

    #[test]
    fn test_unknown_transport_is_rejected() {
        assert!(Args::try_parse_from(["hearth-engine", "--transport", "carrier-pigeon"]).is_err());
    }

    #[test]
    fn test_summary_serializes_snake_case() {
        let summary = RunSummary {
            exit_reason: ExitReason::PeerDisconnected,
            address: "hearth-engine".to_string(),
            transport: TransportKind::Pipe,
            canceled_operations: 0,
            drained: true,
            long_tasks: Vec::new(),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["exit_reason"], "peer_disconnected");
        assert_eq!(json["transport"], "pipe");
    }
}
