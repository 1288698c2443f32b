use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use outbox::config::Config;
use outbox::connectivity::{Connectivity, Prober};
use outbox::http::{ApiClient, Method, ReqwestTransport, Transport};
use outbox::logging;
use outbox::sync::{ReplayOutcome, SyncEvent, SyncHandle, SyncLayer};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "outbox")]
#[command(about = "Offline cache and write queue for HTTP API clients")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/outbox/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Treat the network as unreachable for this session
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// GET a resource through the sync layer
  Get { path: String },
  /// Send a mutating request through the sync layer
  Send {
    method: String,
    path: String,
    /// JSON request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Replay the write queue once
  Replay,
  /// Show connectivity, sync state and queue depth
  Status,
  /// List queued writes
  Queue,
  /// Probe connectivity, replay on reconnect and print events until Ctrl-C
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let network: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(config.api.timeout())?);
  let connectivity = Connectivity::new();
  let prober = Prober::new(
    Arc::clone(&network),
    config.connectivity.probe_url(&config.api)?,
    config.connectivity.probe_interval(),
    connectivity.clone(),
  );

  if args.offline {
    connectivity.set_online(false);
  } else {
    prober.probe_once().await;
  }

  let sync = SyncLayer::install(
    network,
    config.storage.open()?,
    connectivity,
    config.sync.options(),
  )?;
  let api = ApiClient::new(&config.api.base_url, sync.transport());

  match args.command {
    Command::Watch => watch(&sync, prober, args.offline).await,
    command => run_once(&sync, &api, command).await,
  }
}

/// Flush writes left over from an earlier run, then run a one-shot command.
async fn run_once(sync: &SyncHandle, api: &ApiClient, command: Command) -> Result<()> {
  let startup = sync.start().await?;

  match command {
    Command::Get { path } => {
      log_outcome(&startup);
      let response = api.send(Method::GET, &path, None).await?;
      println!("{}", response.status);
      println!("{}", response.body);
    }
    Command::Send { method, path, data } => {
      log_outcome(&startup);
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let body: Option<Value> = data
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| eyre!("--data is not valid JSON: {}", e))?;
      let response = api.send(method, &path, body.as_ref()).await?;
      println!("{}", response.status);
      println!("{}", response.body);
    }
    Command::Replay => print_outcome(startup),
    Command::Status => {
      log_outcome(&startup);
      println!("{}", serde_json::to_string(&sync.status()?)?);
    }
    Command::Queue => {
      log_outcome(&startup);
      for entry in sync.queue().snapshot()? {
        println!(
          "{}  {:<6} {}  attempts={}  queued={}",
          entry.id,
          entry.method,
          entry.url,
          entry.attempts,
          entry.created_at.to_rfc3339()
        );
      }
    }
    Command::Watch => return Err(eyre!("watch is not a one-shot command")),
  }

  Ok(())
}

async fn watch(sync: &SyncHandle, prober: Prober, offline: bool) -> Result<()> {
  let mut events = sync.subscribe();
  let watcher = sync.spawn_watcher();
  let probe = (!offline).then(|| prober.spawn());

  print_outcome(sync.start().await?);

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => match event {
        Ok(event) => print_event(&event)?,
        Err(RecvError::Lagged(skipped)) => eprintln!("(skipped {} events)", skipped),
        Err(RecvError::Closed) => break,
      },
    }
  }

  watcher.abort();
  if let Some(probe) = probe {
    probe.abort();
  }
  Ok(())
}

fn print_event(event: &SyncEvent) -> Result<()> {
  println!("{}", serde_json::to_string(event)?);
  Ok(())
}

fn print_outcome(outcome: ReplayOutcome) {
  match outcome {
    ReplayOutcome::Completed(report) => println!(
      "replayed: {} delivered, {} still queued",
      report.delivered, report.retained
    ),
    ReplayOutcome::Skipped(reason) => println!("replay skipped: {:?}", reason),
  }
}

fn log_outcome(outcome: &ReplayOutcome) {
  match outcome {
    ReplayOutcome::Completed(report) => info!(
      delivered = report.delivered,
      retained = report.retained,
      "Replayed writes from an earlier session"
    ),
    ReplayOutcome::Skipped(reason) => info!(?reason, "Startup replay skipped"),
  }
}
