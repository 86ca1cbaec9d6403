use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use feedgate::api::Params;
use feedgate::pagination::PageRequest;
use feedgate::{CacheConfig, CacheResult, Config, Gateway};
use serde_json::Value;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_ENV: &str = "FEEDGATE_LOG";

#[derive(Parser, Debug)]
#[command(name = "feedgate")]
#[command(about = "Session-aware caching client for the feed backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/feedgate/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the configured backend URL
  #[arg(long)]
  base_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Log in (password is read from FEEDGATE_PASSWORD)
  Login { username: String },
  /// Log out and drop cached responses
  Logout,
  /// Show the cached user
  Whoami,
  /// Set the cached user's verification flag
  Verify {
    #[arg(action = clap::ArgAction::Set)]
    verified: bool,
  },
  /// Delete the account (password is read from FEEDGATE_PASSWORD)
  DeleteAccount,
  /// Fetch one resource through the cache
  Get {
    path: String,
    /// Query parameter as key=value, repeatable
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
    /// Cache TTL in minutes (default from config)
    #[arg(long)]
    ttl: Option<u32>,
    /// Ignore any cached copy but store the new response
    #[arg(long)]
    force: bool,
    /// Bypass the cache entirely
    #[arg(long, conflicts_with = "force")]
    no_cache: bool,
  },
  /// Walk every page of a paged listing
  GetAll {
    path: String,
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
    #[arg(long, default_value_t = feedgate::pagination::DEFAULT_PAGE_SIZE)]
    page_size: usize,
    /// Send the page size in this query parameter
    #[arg(long)]
    page_size_param: Option<String>,
    #[arg(long)]
    ttl: Option<u32>,
  },
  /// Manage cached responses
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Remove every cached response
  Clear,
  /// Remove cached responses for one path
  Invalidate { path: String },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
  raw
    .split_once('=')
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

/// Log to a file so stdout stays clean for command output.
fn init_tracing() -> Result<WorkerGuard> {
  let dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("feedgate");
  std::fs::create_dir_all(&dir)?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
    dir,
    "feedgate.log",
  ));

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")))
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();

  Ok(guard)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn print_result(result: &CacheResult<Value>) -> Result<()> {
  if let Some(at) = result.cached_at {
    eprintln!("(cached {})", at.to_rfc3339());
  }
  print_json(&result.data)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_tracing()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(base_url) = args.base_url {
    config.api.base_url = base_url;
  }

  let gateway = Gateway::open(&config)?;

  match args.command {
    Command::Login { username } => {
      let password = Config::get_password()?;
      let user = gateway.log_in(&username, &password).await?;
      print_json(&user)?;
    }
    Command::Logout => gateway.log_out().await?,
    Command::Whoami => match gateway.session().user()? {
      Some(user) => print_json(&user)?,
      None => return Err(eyre!("Not logged in")),
    },
    Command::Verify { verified } => {
      let user = gateway.session().set_user_verify(verified)?;
      print_json(&user)?;
    }
    Command::DeleteAccount => {
      let password = Config::get_password()?;
      gateway.delete_account(&password).await?;
    }
    Command::Get {
      path,
      params,
      ttl,
      force,
      no_cache,
    } => {
      let cache = gateway
        .default_cache()
        .with_ttl_minutes(ttl.unwrap_or(config.cache.default_ttl_minutes))
        .with_force_refresh(force)
        .with_skip_cache(no_cache);
      let params: Params = params.into_iter().collect();
      let result = gateway.get(&path, &params, cache).await?;
      print_result(&result)?;
    }
    Command::GetAll {
      path,
      params,
      page_size,
      page_size_param,
      ttl,
    } => {
      let cache = ttl.map_or(gateway.default_cache(), CacheConfig::ttl);
      let mut request = PageRequest::default().with_page_size(page_size);
      if let Some(param) = page_size_param {
        request = request.with_page_size_param(param);
      }
      let params: Params = params.into_iter().collect();

      let all = gateway
        .fetch_all::<Value>(&path, &params, cache, &request)
        .await?;
      if all.truncated {
        eprintln!("(stopped after {} pages, result truncated)", all.pages);
      }
      print_json(&all.items)?;
    }
    Command::Cache { action } => match action {
      CacheAction::Clear => {
        let removed = gateway.teardown()?;
        eprintln!("removed {} cached responses", removed);
      }
      CacheAction::Invalidate { path } => {
        let removed = gateway.cache().invalidate_path(&path)?;
        eprintln!("removed {} cached responses", removed);
      }
    },
  }

  Ok(())
}
