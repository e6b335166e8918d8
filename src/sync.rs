//! Sync Engine - one polling cycle from fetch to persisted updates
//!
//! A cycle fetches snapshots, diffs them against the store, persists the
//! diff and reports only what the store actually wrote. The public and the
//! private cycle can run at the same time; whichever writes a release first
//! reports it, so each release is announced once.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::diff::compute_diffs;
use crate::github::FetchClient;
use crate::model::{Recipient, RepoId, RepoSnapshot, UpdateRecord};
use crate::state::{ReleaseStore, SubscribeStatus};

/// Results from one polling cycle
#[derive(Debug, Clone, Default)]
pub struct PollSummary {
    pub repositories: usize,
    pub inaccessible: usize,
    /// Repositories skipped because the store failed
    pub skipped: usize,
    /// Recipients whose private fetch failed
    pub failed_recipients: usize,
    pub updates: Vec<UpdateRecord>,
    pub duration: Duration,
}

impl PollSummary {
    fn absorb(&mut self, other: PollSummary) {
        self.repositories += other.repositories;
        self.inaccessible += other.inaccessible;
        self.skipped += other.skipped;
        self.failed_recipients += other.failed_recipients;
        self.updates.extend(other.updates);
    }
}

/// Outcome of a subscribe request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed(SubscribeStatus),
    /// The recipient's credential (or the default one) cannot read the repository
    NotAccessible,
}

#[derive(Clone)]
pub struct ReleaseSync {
    store: Arc<ReleaseStore>,
    fetcher: Arc<FetchClient>,
    depth: u32,
}

/// Whether a cycle records what it finds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleMode {
    Persist,
    /// Compute updates against the store without writing them
    Preview,
}

impl CycleMode {
    fn label(self) -> &'static str {
        match self {
            CycleMode::Persist => "poll",
            CycleMode::Preview => "preview",
        }
    }
}

impl ReleaseSync {
    pub fn new(store: Arc<ReleaseStore>, fetcher: Arc<FetchClient>, depth: u32) -> Self {
        Self {
            store,
            fetcher,
            depth,
        }
    }

    pub fn store(&self) -> &Arc<ReleaseStore> {
        &self.store
    }

    /// Poll every tracked repository with the default credential
    pub async fn poll_public(&self) -> Result<PollSummary> {
        self.public_cycle(CycleMode::Persist).await
    }

    /// Updates the next public poll would report; the store is left untouched
    pub async fn preview_public(&self) -> Result<PollSummary> {
        self.public_cycle(CycleMode::Preview).await
    }

    /// Poll each recipient's subscriptions with that recipient's own credential.
    ///
    /// A failing recipient is logged and counted; the others still run.
    pub async fn poll_private(&self) -> Result<PollSummary> {
        self.private_cycle(CycleMode::Persist).await
    }

    /// Updates the next private poll would report; the store is left untouched
    pub async fn preview_private(&self) -> Result<PollSummary> {
        self.private_cycle(CycleMode::Preview).await
    }

    async fn public_cycle(&self, mode: CycleMode) -> Result<PollSummary> {
        let start = Instant::now();

        let repos = self
            .store
            .list_tracked_repositories()
            .context("Failed to list tracked repositories")?;

        if repos.is_empty() {
            debug!("No tracked repositories, skipping public {}", mode.label());
            return Ok(PollSummary::default());
        }

        let snapshots = self
            .fetcher
            .fetch_many(&repos, self.depth, None)
            .await
            .context("Failed to fetch releases")?;

        let mut summary = self.apply_snapshots(snapshots, mode);
        summary.duration = start.elapsed();

        info!(
            "Public {} completed in {:.2}s: {} repositories, {} updated, {} inaccessible, {} skipped",
            mode.label(),
            summary.duration.as_secs_f64(),
            summary.repositories,
            summary.updates.len(),
            summary.inaccessible,
            summary.skipped
        );

        Ok(summary)
    }

    async fn private_cycle(&self, mode: CycleMode) -> Result<PollSummary> {
        let start = Instant::now();

        let recipients = self
            .store
            .list_recipients_with_credentials()
            .context("Failed to list recipients with credentials")?;

        let mut summary = PollSummary::default();

        for (recipient, repos) in recipients {
            let Some(credential) = recipient.credential.as_ref() else {
                continue;
            };
            if repos.is_empty() {
                continue;
            }

            match self.fetcher.fetch_many(&repos, self.depth, Some(credential)).await {
                Ok(snapshots) => {
                    let partial = self.apply_snapshots(snapshots, mode);
                    if !partial.updates.is_empty() {
                        debug!(
                            "Recipient {}: {} repositories updated",
                            recipient.id,
                            partial.updates.len()
                        );
                    }
                    summary.absorb(partial);
                }
                Err(e) => {
                    warn!("Private {} for recipient {} failed: {:#}", mode.label(), recipient.id, e);
                    summary.failed_recipients += 1;
                }
            }
        }

        // Persisted cycles are deduplicated by the store; previews by repository
        if mode == CycleMode::Preview {
            let mut seen = HashSet::new();
            summary.updates.retain(|update| seen.insert(update.repo.clone()));
        }

        summary.duration = start.elapsed();

        info!(
            "Private {} completed in {:.2}s: {} repositories, {} updated, {} recipients failed",
            mode.label(),
            summary.duration.as_secs_f64(),
            summary.repositories,
            summary.updates.len(),
            summary.failed_recipients
        );

        Ok(summary)
    }

    /// Diff snapshots against the store and, when persisting, record the result.
    ///
    /// Repositories removed while the cycle ran are left alone.
    fn apply_snapshots(&self, snapshots: Vec<RepoSnapshot>, mode: CycleMode) -> PollSummary {
        let mut summary = PollSummary {
            repositories: snapshots.len(),
            ..Default::default()
        };

        let mut stored = HashMap::new();
        let mut candidates = Vec::with_capacity(snapshots.len());

        for snapshot in snapshots {
            if !snapshot.accessible {
                summary.inaccessible += 1;
                continue;
            }

            match self.store.get_repository(&snapshot.repo) {
                Ok(Some(existing)) => {
                    stored.insert(snapshot.repo.clone(), existing);
                    candidates.push(snapshot);
                }
                Ok(None) => debug!("{} is no longer tracked", snapshot.repo),
                Err(e) => {
                    error!("Failed to load {}: {:#}", snapshot.repo, e);
                    summary.skipped += 1;
                }
            }
        }

        for diff in compute_diffs(&candidates, &stored) {
            if mode == CycleMode::Preview {
                summary.updates.extend(diff.into_update());
                continue;
            }

            match self.store.apply_diff(&diff) {
                Ok(applied) => {
                    if let Some(update) = applied.into_update() {
                        summary.updates.push(update);
                    }
                }
                Err(e) => {
                    error!("Failed to store updates for {}: {:#}", diff.repo, e);
                    summary.skipped += 1;
                }
            }
        }

        summary
    }

    /// Subscribe a recipient after checking the repository is readable.
    ///
    /// One fetch both checks access and supplies the current releases. A
    /// repository tracked for the first time is stored together with that
    /// history, so subscribers only hear about what comes next. A credential
    /// carried by `recipient` is used for the check and stored with it.
    pub async fn subscribe(&self, recipient: &Recipient, repo: &RepoId) -> Result<SubscribeOutcome> {
        let known = self.store.get_recipient(recipient.id)?;
        let credential = recipient
            .credential
            .as_ref()
            .or_else(|| known.as_ref().and_then(|r| r.credential.as_ref()));

        let snapshot = match self
            .fetcher
            .fetch_many(std::slice::from_ref(repo), self.depth, credential)
            .await
        {
            Ok(snapshots) => snapshots.into_iter().next().filter(|s| s.accessible),
            Err(e) => {
                warn!("Could not check access to {}: {:#}", repo, e);
                None
            }
        };

        let Some(snapshot) = snapshot else {
            return Ok(SubscribeOutcome::NotAccessible);
        };

        let status =
            self.store
                .subscribe_with_history(recipient, repo, &snapshot.releases, &snapshot.tags)?;

        Ok(SubscribeOutcome::Subscribed(status))
    }
}
