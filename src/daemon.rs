//! Daemon Infrastructure - long-running release watcher
//!
//! Wires the store, fetch client and message sender together, registers the
//! public and private polling jobs with the scheduler and fans every job
//! result out to the watchers of each updated repository.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::github::{FetchClient, FetchOptions, OctocrabTransport};
use crate::notify::{sender_from_config, Composer, MessageSender};
use crate::scheduler::Scheduler;
use crate::state::ReleaseStore;
use crate::sync::{PollSummary, ReleaseSync};

/// Job polling every tracked repository with the default credential
pub const PUBLIC_JOB: &str = "releases";
/// Job polling subscriptions with each recipient's own credential
pub const PRIVATE_JOB: &str = "privateReleases";

pub struct Daemon {
    config: Arc<Config>,
    sync: ReleaseSync,
    sender: Arc<dyn MessageSender>,
    composer: Arc<Composer>,
    scheduler: Scheduler<PollSummary>,
}

/// Open the store and build the fetch client described by `config`
pub fn build_sync(config: &Config) -> Result<ReleaseSync> {
    let store = ReleaseStore::open_at(config.store_path(), config.busy_timeout())
        .context("Failed to open release store")?;

    let transport = OctocrabTransport::from_config(config).context("Failed to set up GitHub access")?;
    let fetcher = FetchClient::new(Arc::new(transport), FetchOptions::from_config(config));

    Ok(ReleaseSync::new(
        Arc::new(store),
        Arc::new(fetcher),
        config.polling.depth,
    ))
}

impl Daemon {
    /// Create a daemon with the services named in `config`
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let sync = build_sync(&config)?;
        let sender: Arc<dyn MessageSender> = Arc::from(sender_from_config(&config.notify)?);

        Ok(Self::with_parts(config, sync, sender))
    }

    pub fn with_parts(config: Config, sync: ReleaseSync, sender: Arc<dyn MessageSender>) -> Self {
        let composer = Arc::new(Composer::new(config.notify.max_message_length));

        Self {
            config: Arc::new(config),
            sync,
            sender,
            composer,
            scheduler: Scheduler::new(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler<PollSummary> {
        &self.scheduler
    }

    /// Register both polling jobs and their notification handlers
    pub fn start(&self) -> Result<()> {
        let public_interval = self.config.public_interval()?;
        let private_interval = self.config.private_interval()?;

        let sync = self.sync.clone();
        self.scheduler.schedule(
            PUBLIC_JOB,
            move || {
                let sync = sync.clone();
                async move { sync.poll_public().await }
            },
            public_interval,
        );

        let sync = self.sync.clone();
        self.scheduler.schedule(
            PRIVATE_JOB,
            move || {
                let sync = sync.clone();
                async move { sync.poll_private().await }
            },
            private_interval,
        );

        for job in [PUBLIC_JOB, PRIVATE_JOB] {
            let composer = self.composer.clone();
            let sender = self.sender.clone();
            self.scheduler.subscribe(job, move |summary: Arc<PollSummary>| {
                let composer = composer.clone();
                let sender = sender.clone();
                async move {
                    composer.deliver(sender.as_ref(), &summary.updates).await;
                    Ok(())
                }
            });
        }

        if self.config.polling.run_on_start {
            debug!("Running both jobs on start");
            self.scheduler.trigger(PUBLIC_JOB);
            self.scheduler.trigger(PRIVATE_JOB);
        }

        info!(
            "Watching releases every {:?} (private every {:?})",
            public_interval, private_interval
        );
        Ok(())
    }

    /// Start the daemon in the foreground until Ctrl+C
    pub async fn run(&self) -> Result<()> {
        info!("Starting releasewatch daemon");

        self.start().context("Failed to start polling jobs")?;

        Self::wait_for_shutdown_signal().await;
        info!("Shutdown signal received, stopping daemon...");

        self.scheduler.shutdown().await;
        info!("Daemon stopped");
        Ok(())
    }

    /// Wait for Ctrl+C
    async fn wait_for_shutdown_signal() {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        debug!("Ctrl+C received");
    }
}
