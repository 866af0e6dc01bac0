//! drover CLI - run the job dispatch daemon and talk to it

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod format;
mod logging;

use commands::{
  Target, cmd_daemon, cmd_drop, cmd_list, cmd_past, cmd_push, cmd_route, cmd_stats, cmd_subscribe,
};
use logging::{init_cli_logging, init_daemon_logging};

#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Dispatch jobs to pools of worker processes")]
#[command(after_help = "\
QUICK START:
  drover daemon --foreground               # Start the daemon in this terminal
  drover push echo run '{\"n\": 1}'          # Run a job and wait for its result
  drover past echo/run                     # Show results recorded for a driver
  drover subscribe                         # Follow results as they are recorded

SIGNALS:
  SIGHUP   reload the config file
  SIGUSR1  forget every history
  SIGTERM  stop the daemon")]
struct Cli {
  /// Config file (default: ~/.config/drover/config.toml)
  #[arg(long, global = true, value_name = "FILE")]
  config: Option<PathBuf>,

  /// Control socket address (default: core.control from the config)
  #[arg(long, global = true, value_name = "ADDR")]
  control: Option<String>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Start the daemon
  Daemon {
    /// Run in foreground (don't daemonize)
    #[arg(long)]
    foreground: bool,
    /// Run as the detached daemon process
    #[arg(long, hide = true)]
    background: bool,
  },
  /// Push a job to an engine and wait for its result
  Push {
    engine: String,
    method: String,
    /// JSON arguments (default: {})
    args: Option<String>,
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
  /// Stop an engine and forget its port
  Drop { engine: String },
  /// Show the recorded results of a driver (`engine/method`)
  Past {
    driver: String,
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
  /// Show running engines, queues and workers
  Stats {
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
  /// List configured engines and the endpoints of running ones
  List {
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
  /// Pick the backend of a routing group
  Route {
    group: String,
    /// Routing key (default: a random backend)
    key: Option<String>,
  },
  /// Follow results as they are recorded
  Subscribe {
    /// Only show results of this driver
    #[arg(long)]
    driver: Option<String>,
    /// Publication socket address (default: core.publish from the config)
    #[arg(long, value_name = "ADDR")]
    publish: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  // File logging for the detached daemon, console for everything else
  let _guard = match &cli.command {
    Commands::Daemon { background, .. } => init_daemon_logging(cli.config.as_deref(), !*background),
    _ => {
      init_cli_logging();
      None
    }
  };

  let target = Target {
    config: cli.config,
    control: cli.control,
  };

  match cli.command {
    Commands::Daemon { foreground, background } => cmd_daemon(&target, foreground, background).await,
    Commands::Push {
      engine,
      method,
      args,
      json,
    } => cmd_push(&target, &engine, &method, args.as_deref(), json).await,
    Commands::Drop { engine } => cmd_drop(&target, &engine).await,
    Commands::Past { driver, json } => cmd_past(&target, &driver, json).await,
    Commands::Stats { json } => cmd_stats(&target, json).await,
    Commands::List { json } => cmd_list(&target, json).await,
    Commands::Route { group, key } => cmd_route(&target, &group, key.as_deref()).await,
    Commands::Subscribe { driver, publish } => cmd_subscribe(&target, publish.as_deref(), driver.as_deref()).await,
  }
}
