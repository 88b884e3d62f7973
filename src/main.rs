use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

use swcache::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use swcache::config::{Config, WorkerConfig};
use swcache::net::{HttpNetwork, Network, Request};
use swcache::worker::{FetchOutcome, Interceptor};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Network-first request interceptor with versioned offline stores")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to intercept, e.g. http://localhost:8503
  #[arg(long)]
  origin: Option<String>,

  /// Version-tagged store name to use as the current store
  #[arg(long)]
  cache_name: Option<String>,

  /// Keep stores in memory only
  #[arg(long)]
  ephemeral: bool,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Open the current store and seed it with the static assets
  Install,
  /// Delete stores from other versions
  Activate,
  /// Fetch paths or URLs through the interceptor
  Fetch {
    /// Paths (resolved against the origin) or absolute URLs
    #[arg(required = true)]
    targets: Vec<String>,

    /// Request method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
  },
  /// List stores and the requests they hold
  Stores,
  /// Delete every store
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.log_file.as_deref())?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override origin and store name if specified on command line
  let config = Config {
    origin: args.origin.unwrap_or(config.origin),
    cache_name: args.cache_name.unwrap_or(config.cache_name),
    ..config
  };
  let worker_config = config.worker_config()?;

  if args.ephemeral {
    run(args.command, worker_config, MemoryStorage::new()).await
  } else {
    let path = match &config.database {
      Some(path) => path.clone(),
      None => SqliteStorage::default_path()?,
    };
    run(args.command, worker_config, SqliteStorage::open(&path)?).await
  }
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("swcache=info"));

  let Some(path) = log_file else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  };

  let dir = path
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("."));
  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::never(dir, file_name);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}

async fn run<S: CacheStorage>(command: Command, config: WorkerConfig, storage: S) -> Result<()> {
  let network = HttpNetwork::new()?;
  let interceptor = Interceptor::new(config, storage, network.clone());

  match command {
    Command::Install => {
      let report = interceptor.install().await?;
      for url in &report.cached {
        println!("cached  {}", url);
      }
      for (asset, reason) in &report.failed {
        println!("skipped {}  ({})", asset, reason);
      }
    }
    Command::Activate => {
      let report = interceptor.activate().await?;
      for name in &report.deleted {
        println!("deleted {}", name);
      }
      for (name, reason) in &report.failed {
        println!("kept    {}  ({})", name, reason);
      }
    }
    Command::Fetch { targets, method } => {
      let client = interceptor.clients().open()?;

      for target in &targets {
        let url = resolve_target(interceptor.config(), target)?;
        let request = Request::new(&method, url);

        match interceptor.handle_fetch(request.clone()).await {
          FetchOutcome::Responded(intercepted) => {
            println!(
              "{} {:?} {}",
              intercepted.response.status, intercepted.source, request.url
            );
            println!("{}", intercepted.response.text());
          }
          FetchOutcome::PassThrough => {
            // Not intercepted: the request goes out as-is
            let response = network.send(&request).await?;
            println!("{} PassThrough {}", response.status, request.url);
            println!("{}", response.text());
          }
        }
      }

      interceptor.clients().close(client)?;
    }
    Command::Stores => {
      let storage = interceptor.storage();
      for name in storage.keys()? {
        let current = if name == interceptor.config().cache_name {
          " (current)"
        } else {
          ""
        };
        println!("{}{}", name, current);
        for request in storage.entries(&name)? {
          println!("  {}", request);
        }
      }
    }
    Command::Clear => {
      let storage = interceptor.storage();
      for name in storage.keys()? {
        storage.delete(&name)?;
        println!("deleted {}", name);
      }
    }
  }

  Ok(())
}

/// Paths resolve against the origin; anything parseable as a URL is used as-is.
fn resolve_target(config: &WorkerConfig, target: &str) -> Result<Url> {
  match Url::parse(target) {
    Ok(url) => Ok(url),
    Err(_) => config.resolve(target),
  }
}
