use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use releasewatch::config::LoggingConfig;
use releasewatch::daemon::build_sync;
use releasewatch::github::detect_authentication;
use releasewatch::notify::{latest_releases, sender_from_config, short_message};
use releasewatch::state::SubscribeStatus;
use releasewatch::sync::SubscribeOutcome;
use releasewatch::{
    Composer, Config, Credential, Daemon, Recipient, RecipientId, RecipientKind, ReleaseStore, RepoId,
};

#[derive(Parser)]
#[command(name = "releasewatch")]
#[command(about = "GitHub release notification daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the configuration file and check GitHub authentication
    Init,

    /// Run the polling daemon in the foreground
    Run,

    /// Run one polling cycle and deliver its notifications
    Poll {
        /// Poll subscriptions with each recipient's private credential
        #[arg(long)]
        private: bool,

        /// Print notifications instead of sending and recording them
        #[arg(long)]
        dry_run: bool,
    },

    /// Subscribe a chat to a repository (owner/name or GitHub URL)
    Subscribe {
        #[arg(allow_negative_numbers = true)]
        recipient: RecipientId,
        repo: String,

        /// The recipient is a group chat
        #[arg(long)]
        group: bool,
    },

    /// Remove a chat's subscription
    Unsubscribe {
        #[arg(allow_negative_numbers = true)]
        recipient: RecipientId,
        repo: String,
    },

    /// Set or clear a chat's private GitHub token
    Token {
        #[arg(allow_negative_numbers = true)]
        recipient: RecipientId,
        token: Option<String>,

        /// Remove the stored token
        #[arg(long, conflicts_with = "token")]
        clear: bool,
    },

    /// List tracked repositories, or one chat's subscriptions
    List {
        #[arg(allow_negative_numbers = true)]
        recipient: Option<RecipientId>,
    },

    /// Show the latest stored releases of a repository
    Releases { repo: String },

    /// Stop tracking a repository and drop its subscriptions
    Remove { repo: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = load_config(cli.config).await?;

    init_logging(cli.verbose, &config.logging)?;
    info!("Starting releasewatch v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Init => cmd_init(&config).await,
        Commands::Run => cmd_run(config).await,
        Commands::Poll { private, dry_run } => cmd_poll(private, dry_run, &config).await,
        Commands::Subscribe {
            recipient,
            repo,
            group,
        } => cmd_subscribe(recipient, &repo, group, &config).await,
        Commands::Unsubscribe { recipient, repo } => cmd_unsubscribe(recipient, &repo, &config),
        Commands::Token {
            recipient,
            token,
            clear,
        } => cmd_token(recipient, token, clear, &config),
        Commands::List { recipient } => cmd_list(recipient, &config),
        Commands::Releases { repo } => cmd_releases(&repo, &config),
        Commands::Remove { repo } => cmd_remove(&repo, &config),
    }
}

/// Initialize logging from RUST_LOG, the verbose flag or the config level
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)
            .with_context(|| format!("Invalid log level: {}", default_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(logging.color))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
async fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    let config = match config_path {
        Some(path) => Config::load_or_create(&path)?,
        None => Config::load_or_default()?,
    };

    config.validate()?;
    Ok(config)
}

fn open_store(config: &Config) -> Result<ReleaseStore> {
    ReleaseStore::open_at(config.store_path(), config.busy_timeout()).context("Failed to open release store")
}

fn parse_repo(input: &str) -> Result<RepoId> {
    RepoId::parse(input).ok_or_else(|| anyhow!("Expected owner/name or a GitHub URL, got '{}'", input))
}

async fn cmd_init(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let tracked = store.list_tracked_repositories()?.len();

    println!("✅ releasewatch initialized");
    println!("   Store: {} ({} repositories tracked)", config.store.path, tracked);

    match detect_authentication(&config.github) {
        Ok((strategy, _)) => println!("   GitHub authentication: {:?}", strategy),
        Err(e) => {
            println!("⚠️  GitHub authentication not found");
            for line in e.to_string().lines() {
                println!("   {}", line);
            }
        }
    }

    if config.notify.telegram_token.is_none() {
        println!("   Notifications go to the log until notify.telegram_token is set");
    }

    Ok(())
}

async fn cmd_run(config: Config) -> Result<()> {
    let daemon = Daemon::new(config)?;
    println!("🖥️  Watching releases (Ctrl+C to stop)");
    daemon.run().await
}

async fn cmd_poll(private: bool, dry_run: bool, config: &Config) -> Result<()> {
    let sync = build_sync(config)?;

    let summary = match (private, dry_run) {
        (false, false) => sync.poll_public().await?,
        (true, false) => sync.poll_private().await?,
        (false, true) => sync.preview_public().await?,
        (true, true) => sync.preview_private().await?,
    };

    println!(
        "🔍 Polled {} repositories in {:.2}s: {} updated, {} inaccessible",
        summary.repositories,
        summary.duration.as_secs_f64(),
        summary.updates.len(),
        summary.inaccessible
    );

    if dry_run {
        for update in &summary.updates {
            for release in &update.releases {
                println!("\n{}", short_message(&update.repo, release));
            }
            println!("   → {} recipients", update.watched_users.len());
        }
        return Ok(());
    }

    let sender = sender_from_config(&config.notify)?;
    let composer = Composer::new(config.notify.max_message_length);
    let report = composer.deliver(sender.as_ref(), &summary.updates).await;

    println!(
        "📨 {} messages delivered, {} recipients failed",
        report.delivered, report.failed
    );
    Ok(())
}

async fn cmd_subscribe(recipient: RecipientId, repo: &str, group: bool, config: &Config) -> Result<()> {
    let repo = parse_repo(repo)?;
    let kind = if group {
        RecipientKind::Group
    } else {
        RecipientKind::Individual
    };

    let sync = build_sync(config)?;
    match sync.subscribe(&Recipient::new(recipient, kind), &repo).await? {
        SubscribeOutcome::Subscribed(SubscribeStatus::NewRepository) => {
            println!("✅ Subscribed {} to {} (now tracked)", recipient, repo)
        }
        SubscribeOutcome::Subscribed(SubscribeStatus::ExistingRepository) => {
            println!("✅ Subscribed {} to {}", recipient, repo)
        }
        SubscribeOutcome::NotAccessible => {
            println!("❌ {} was not found or is not readable with the available token", repo)
        }
    }

    Ok(())
}

fn cmd_unsubscribe(recipient: RecipientId, repo: &str, config: &Config) -> Result<()> {
    let repo = parse_repo(repo)?;
    let store = open_store(config)?;

    if store.unsubscribe(recipient, &repo)? {
        println!("✅ Unsubscribed {} from {}", recipient, repo);
    } else {
        println!("⚠️  {} was not subscribed to {}", recipient, repo);
    }
    Ok(())
}

fn cmd_token(recipient: RecipientId, token: Option<String>, clear: bool, config: &Config) -> Result<()> {
    let store = open_store(config)?;
    store.ensure_recipient(&Recipient::new(recipient, RecipientKind::Individual))?;

    let credential = match (token, clear) {
        (_, true) => None,
        (Some(token), false) if !token.trim().is_empty() => Some(Credential::new(token.trim())),
        _ => return Err(anyhow!("Provide a token or --clear")),
    };

    store.set_credential(recipient, credential.as_ref())?;

    match credential {
        Some(_) => println!("🔑 Private token stored for {}", recipient),
        None => println!("🔑 Private token removed for {}", recipient),
    }
    Ok(())
}

fn cmd_list(recipient: Option<RecipientId>, config: &Config) -> Result<()> {
    let store = open_store(config)?;

    match recipient {
        Some(id) => {
            let subscriptions = store.list_subscriptions(id)?;
            println!("Subscriptions of {} ({}):", id, subscriptions.len());
            for repo in subscriptions {
                println!("  📁 {} ({} releases, {} tags)", repo.id, repo.releases.len(), repo.tags.len());
            }
        }
        None => {
            let repos = store.list_tracked_repositories()?;
            println!("Tracked repositories ({}):", repos.len());
            for repo in repos {
                println!("  📁 {}", repo);
            }
        }
    }

    Ok(())
}

fn cmd_releases(repo: &str, config: &Config) -> Result<()> {
    let repo = parse_repo(repo)?;
    let store = open_store(config)?;

    let Some(stored) = store.get_repository(&repo)? else {
        println!("⚠️  {} is not tracked", repo);
        return Ok(());
    };

    let latest = latest_releases(&stored);
    if latest.is_empty() {
        println!("{} has no releases yet", repo);
    }
    for release in latest {
        println!("{}\n", short_message(&repo, &release));
    }

    Ok(())
}

fn cmd_remove(repo: &str, config: &Config) -> Result<()> {
    let repo = parse_repo(repo)?;
    let store = open_store(config)?;

    if store.remove_repository(&repo)? {
        println!("🗑️  Removed {}", repo);
    } else {
        println!("⚠️  {} is not tracked", repo);
    }
    Ok(())
}
