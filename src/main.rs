use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use reposnap::github::resolve_token;
use reposnap::scheduler::{run_until_ctrl_c, start_backup};
use reposnap::{BackupExecutor, Config, GitClient, GitHubApi, RunMode};

#[derive(Parser)]
#[command(name = "reposnap")]
#[command(about = "Rolling backups of GitHub repositories")]
#[command(version)]
#[command(after_help = "\
Settings are read from the config file, then REPOSNAP_* environment variables \
(also loaded from ./.env), then command-line flags.

ENVIRONMENT:
    REPOSNAP_OUTPUT                  Output directory
    REPOSNAP_GITHUB_TOKEN            GitHub token
    REPOSNAP_GITHUB_AUTH_METHOD      auto, gh_cli or token
    REPOSNAP_GITHUB_USERNAMES        Comma-separated usernames
    REPOSNAP_GITHUB_ORGANIZATIONS    Comma-separated organizations
    REPOSNAP_GITHUB_INCLUDE_STARRED  true or false
    REPOSNAP_GITHUB_API_URL          API base URL
    REPOSNAP_BACKUP_RUN_TYPE         clone, fetch or dry-run
    REPOSNAP_SCHEDULE_INTERVAL       Interval for continuous mode
    REPOSNAP_SCHEDULE_MAX_BACKUPS    Snapshots to keep
    REPOSNAP_NOTIFY_URL              ntfy topic URL
    REPOSNAP_LOG_LEVEL               Log level")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Backup output directory
        #[arg(short, long)]
        output: Option<String>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Run a single backup
    Backup {
        #[command(flatten)]
        args: BackupArgs,
    },

    /// Run backups on an interval into rotating snapshot directories
    Continuous {
        #[command(flatten)]
        args: BackupArgs,

        /// Time between backups, e.g. 24h, 1h30m, 90s
        #[arg(short, long)]
        interval: Option<String>,

        /// Number of snapshot directories to keep
        #[arg(short = 'n', long)]
        max_backups: Option<usize>,
    },
}

/// Flags shared by `backup` and `continuous`; each overrides the config file
#[derive(Args)]
struct BackupArgs {
    /// GitHub user to back up (repeatable)
    #[arg(short, long = "username", value_name = "USER")]
    usernames: Vec<String>,

    /// Back up every member of this organization (repeatable)
    #[arg(long = "in-org", value_name = "ORG")]
    organizations: Vec<String>,

    /// Include starred repositories
    #[arg(short = 's', long)]
    include_starred: bool,

    /// Output directory, or a .json file in fetch mode
    #[arg(short, long)]
    output: Option<String>,

    /// One of clone, fetch or dry-run
    #[arg(long)]
    run_type: Option<String>,

    /// ntfy topic URL notified after every run
    #[arg(long)]
    ntfy_url: Option<String>,

    /// GitHub token (defaults to GITHUB_TOKEN or the GitHub CLI)
    #[arg(long)]
    token: Option<String>,
}

impl BackupArgs {
    fn apply(self, config: &mut Config) -> Result<()> {
        if !self.usernames.is_empty() {
            config.github.usernames = self.usernames;
        }
        if !self.organizations.is_empty() {
            config.github.organizations = self.organizations;
        }
        if self.include_starred {
            config.github.include_starred = true;
        }
        if let Some(output) = self.output {
            config.output = output;
            config.expand_paths()?;
        }
        if let Some(run_type) = self.run_type {
            config.backup.run_type = run_type;
        }
        if let Some(url) = self.ntfy_url {
            config.notify.url = Some(url);
        }
        if let Some(token) = self.token {
            config.github.token = Some(token);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output, force } => {
            init_logging(cli.verbose, "info")?;
            cmd_init(cli.config, output, force)
        }
        Commands::Backup { args } => {
            let config = prepare_config(cli.config.as_deref(), cli.verbose, args)?;
            cmd_backup(config, false).await
        }
        Commands::Continuous {
            args,
            interval,
            max_backups,
        } => {
            let mut config = prepare_config(cli.config.as_deref(), cli.verbose, args)?;
            if let Some(interval) = interval {
                config.schedule.interval = interval;
            }
            if let Some(max_backups) = max_backups {
                config.schedule.max_backups = max_backups;
            }
            cmd_backup(config, true).await
        }
    }
}

/// Initialize logging on stderr; stdout is reserved for dry-run output
fn init_logging(verbose: bool, level: &str) -> Result<()> {
    let default_level = if verbose { "debug" } else { level };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)
            .with_context(|| format!("Invalid log level: {}", default_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

fn prepare_config(config_path: Option<&Path>, verbose: bool, args: BackupArgs) -> Result<Config> {
    let mut config = load_config(config_path)?;
    config.apply_env_overrides()?;
    init_logging(verbose, &config.logging.level)?;
    info!("Starting reposnap v{}", env!("CARGO_PKG_VERSION"));

    args.apply(&mut config)?;
    Ok(config)
}

/// Write a fresh configuration file
fn cmd_init(config_path: Option<PathBuf>, output: Option<String>, force: bool) -> Result<()> {
    let config_path = match config_path {
        Some(path) => path,
        None => Config::default_config_path()?,
    };

    if config_path.exists() && !force {
        bail!(
            "Configuration already exists at {}; use --force to overwrite it",
            config_path.display()
        );
    }

    let mut config = Config::default();
    if let Some(output) = output {
        config.output = output;
    }

    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    config.save(&config_path)?;

    info!("Configuration saved to: {:?}", config_path);

    println!("✅ reposnap initialized successfully!");
    println!("   Config: {}", config_path.display());
    println!("   Output: {}", config.output);
    println!("   Next: add usernames to the config and run 'reposnap backup'");

    Ok(())
}

/// Run one backup, or keep running them on the configured schedule
async fn cmd_backup(config: Config, continuous: bool) -> Result<()> {
    let token = resolve_token(&config.github)?;
    let backup_config = config.backup_config(token.clone())?;
    debug!("Backup configuration: {:?}", backup_config);

    if backup_config.run_mode == RunMode::Clone {
        let version = GitClient::version().await?;
        debug!("Using {}", version);
    }

    let forge = GitHubApi::new(&token, config.github.api_url.as_deref())?;
    let executor = Arc::new(BackupExecutor::new(
        Arc::new(forge),
        Arc::new(GitClient::new()),
    ));

    let (interval, max_backups) = if continuous {
        (config.schedule.interval.clone(), config.schedule.max_backups)
    } else {
        (String::new(), 0)
    };

    run_until_ctrl_c(start_backup(executor, backup_config, &interval, max_backups)).await?;

    info!("reposnap finished");
    Ok(())
}
