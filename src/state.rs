//! Repository Store - SQLite-based persistence for tracked repositories
//!
//! This module provides persistent storage for:
//! - Tracked repositories and their release/tag history
//! - Recipients and their optional private credentials
//! - Subscriptions linking recipients to repositories
//!
//! Subscriptions live in a single join table, so a repository's watchers and
//! a recipient's subscriptions are the same rows and can never disagree.
//! All release writes are idempotent upserts keyed by repository, kind and
//! release name.
//!
//! The database location comes from `store.path` in the configuration
//! (XDG_DATA_HOME/releasewatch/state.db by default).

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::diff::RepoDiff;
use crate::model::{
    Credential, Recipient, RecipientId, RecipientKind, Release, RepoId, StoredRepository,
};

/// Which history list a stored entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    Release,
    Tag,
}

impl ReleaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseKind::Release => "release",
            ReleaseKind::Tag => "tag",
        }
    }
}

/// Outcome of a subscribe request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStatus {
    /// The repository was not tracked before
    NewRepository,
    /// The repository was already tracked
    ExistingRepository,
}

/// Repository store manager
pub struct ReleaseStore {
    conn: Mutex<Connection>,
}

impl ReleaseStore {
    /// Open or create the store at a specific path
    pub fn open_at(path: PathBuf, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.busy_timeout(busy_timeout)
            .context("Failed to set database busy timeout")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;

        info!("Release store opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Release store connection lock poisoned"))
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                r#"
                PRAGMA foreign_keys = ON;

                CREATE TABLE IF NOT EXISTS repositories (
                    owner TEXT NOT NULL,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (owner, name)
                );

                -- Release and tag history, insertion order = discovery order
                CREATE TABLE IF NOT EXISTS releases (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner TEXT NOT NULL,
                    name TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    release_name TEXT NOT NULL,
                    url TEXT NOT NULL DEFAULT '',
                    description TEXT NOT NULL DEFAULT '',
                    is_prerelease INTEGER NOT NULL DEFAULT 0,
                    discovered_at TEXT NOT NULL,
                    UNIQUE (owner, name, kind, release_name),
                    FOREIGN KEY (owner, name) REFERENCES repositories(owner, name) ON DELETE CASCADE
                );

                CREATE TABLE IF NOT EXISTS recipients (
                    id INTEGER PRIMARY KEY,
                    kind TEXT NOT NULL,
                    display_name TEXT,
                    token TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS subscriptions (
                    recipient_id INTEGER NOT NULL,
                    owner TEXT NOT NULL,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (recipient_id, owner, name),
                    FOREIGN KEY (recipient_id) REFERENCES recipients(id) ON DELETE CASCADE,
                    FOREIGN KEY (owner, name) REFERENCES repositories(owner, name) ON DELETE CASCADE
                );

                CREATE INDEX IF NOT EXISTS idx_releases_repo ON releases(owner, name, kind, id);
                CREATE INDEX IF NOT EXISTS idx_subscriptions_repo ON subscriptions(owner, name);
                "#,
            )
            .context("Failed to initialize database schema")?;

        debug!("Database schema initialized");
        Ok(())
    }

    // =========================================================================
    // Repository Operations
    // =========================================================================

    /// Track a repository; returns whether it was new
    pub fn add_repository(&self, repo: &RepoId) -> Result<SubscribeStatus> {
        let conn = self.lock()?;
        Self::ensure_repository(&conn, repo)
    }

    fn ensure_repository(conn: &Connection, repo: &RepoId) -> Result<SubscribeStatus> {
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO repositories (owner, name, created_at) VALUES (?1, ?2, ?3)",
                params![repo.owner, repo.name, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("Failed to add repository {}", repo))?;

        Ok(if inserted > 0 {
            SubscribeStatus::NewRepository
        } else {
            SubscribeStatus::ExistingRepository
        })
    }

    /// Manually stop tracking a repository, with its history and subscriptions
    pub fn remove_repository(&self, repo: &RepoId) -> Result<bool> {
        let removed = self
            .lock()?
            .execute(
                "DELETE FROM repositories WHERE owner = ?1 AND name = ?2",
                params![repo.owner, repo.name],
            )
            .with_context(|| format!("Failed to remove repository {}", repo))?;

        Ok(removed > 0)
    }

    /// All tracked repository identifiers, sorted by owner then name
    pub fn list_tracked_repositories(&self) -> Result<Vec<RepoId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT owner, name FROM repositories ORDER BY owner, name")?;

        let repos = stmt
            .query_map([], |row| {
                Ok(RepoId {
                    owner: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .context("Failed to query repositories")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect repositories")?;

        Ok(repos)
    }

    /// Get a repository with its history and watchers
    pub fn get_repository(&self, repo: &RepoId) -> Result<Option<StoredRepository>> {
        let conn = self.lock()?;
        Self::load_repository(&conn, repo)
    }

    fn load_repository(conn: &Connection, repo: &RepoId) -> Result<Option<StoredRepository>> {
        let exists = conn
            .query_row(
                "SELECT 1 FROM repositories WHERE owner = ?1 AND name = ?2",
                params![repo.owner, repo.name],
                |_| Ok(()),
            )
            .optional()
            .with_context(|| format!("Failed to query repository {}", repo))?
            .is_some();

        if !exists {
            return Ok(None);
        }

        Ok(Some(StoredRepository {
            id: repo.clone(),
            releases: Self::load_history(conn, repo, ReleaseKind::Release)?,
            tags: Self::load_history(conn, repo, ReleaseKind::Tag)?,
            watched_users: Self::load_watchers(conn, repo)?,
        }))
    }

    fn load_history(conn: &Connection, repo: &RepoId, kind: ReleaseKind) -> Result<Vec<Release>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT release_name, url, description, is_prerelease
            FROM releases
            WHERE owner = ?1 AND name = ?2 AND kind = ?3
            ORDER BY id
            "#,
        )?;

        let releases = stmt
            .query_map(params![repo.owner, repo.name, kind.as_str()], |row| {
                Ok(Release {
                    name: row.get(0)?,
                    url: row.get(1)?,
                    description: row.get(2)?,
                    is_prerelease: row.get::<_, i32>(3)? != 0,
                })
            })
            .with_context(|| format!("Failed to query {} history for {}", kind.as_str(), repo))?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect release history")?;

        Ok(releases)
    }

    fn load_watchers(conn: &Connection, repo: &RepoId) -> Result<Vec<RecipientId>> {
        let mut stmt = conn.prepare(
            "SELECT recipient_id FROM subscriptions WHERE owner = ?1 AND name = ?2 ORDER BY created_at, recipient_id",
        )?;

        let watchers = stmt
            .query_map(params![repo.owner, repo.name], |row| row.get(0))
            .with_context(|| format!("Failed to query watchers for {}", repo))?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect watchers")?;

        Ok(watchers)
    }

    // =========================================================================
    // Release Operations
    // =========================================================================

    /// Append new releases and tags. Names already present are skipped.
    ///
    /// Returns the releases and tags that were actually inserted.
    pub fn upsert_releases(
        &self,
        repo: &RepoId,
        new_releases: &[Release],
        new_tags: &[Release],
    ) -> Result<(Vec<Release>, Vec<Release>)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        Self::ensure_repository(&tx, repo)?;
        let releases = Self::insert_history(&tx, repo, ReleaseKind::Release, new_releases)?;
        let tags = Self::insert_history(&tx, repo, ReleaseKind::Tag, new_tags)?;

        tx.commit().context("Failed to commit release upsert")?;
        Ok((releases, tags))
    }

    fn insert_history(
        tx: &Transaction<'_>,
        repo: &RepoId,
        kind: ReleaseKind,
        items: &[Release],
    ) -> Result<Vec<Release>> {
        let now = Utc::now().to_rfc3339();
        let mut stmt = tx.prepare(
            r#"
            INSERT OR IGNORE INTO releases (owner, name, kind, release_name, url, description, is_prerelease, discovered_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )?;

        let mut inserted = Vec::new();
        for item in items {
            let changes = stmt
                .execute(params![
                    repo.owner,
                    repo.name,
                    kind.as_str(),
                    item.name,
                    item.url,
                    item.description,
                    item.is_prerelease as i32,
                    now,
                ])
                .with_context(|| format!("Failed to insert {} {} for {}", kind.as_str(), item.name, repo))?;

            if changes > 0 {
                inserted.push(item.clone());
            }
        }

        Ok(inserted)
    }

    /// Overwrite a stored release with fresh content.
    ///
    /// Returns false when no stored release has that name or nothing differs.
    pub fn apply_changed_release(&self, repo: &RepoId, release: &Release) -> Result<bool> {
        let conn = self.lock()?;
        Self::update_release(&conn, repo, release)
    }

    fn update_release(conn: &Connection, repo: &RepoId, release: &Release) -> Result<bool> {
        let changes = conn
            .execute(
                r#"
                UPDATE releases
                SET description = ?5, is_prerelease = ?6, url = ?7
                WHERE owner = ?1 AND name = ?2 AND kind = ?3 AND release_name = ?4
                  AND (description != ?5 OR is_prerelease != ?6)
                "#,
                params![
                    repo.owner,
                    repo.name,
                    ReleaseKind::Release.as_str(),
                    release.name,
                    release.description,
                    release.is_prerelease as i32,
                    release.url,
                ],
            )
            .with_context(|| format!("Failed to update release {} for {}", release.name, repo))?;

        Ok(changes > 0)
    }

    /// Persist a cycle's diff for one repository in a single transaction.
    ///
    /// The returned diff holds only what this call actually wrote, so a
    /// concurrent job that already stored the same items yields an empty diff.
    pub fn apply_diff(&self, diff: &RepoDiff) -> Result<RepoDiff> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        Self::ensure_repository(&tx, &diff.repo)?;
        let new_releases = Self::insert_history(&tx, &diff.repo, ReleaseKind::Release, &diff.new_releases)?;
        let new_tags = Self::insert_history(&tx, &diff.repo, ReleaseKind::Tag, &diff.new_tags)?;

        let mut changed_releases = Vec::new();
        for release in &diff.changed_releases {
            if Self::update_release(&tx, &diff.repo, release)? {
                changed_releases.push(release.clone());
            }
        }

        tx.commit()
            .with_context(|| format!("Failed to commit updates for {}", diff.repo))?;

        debug!(
            "Stored {}: {} new releases, {} new tags, {} changed",
            diff.repo,
            new_releases.len(),
            new_tags.len(),
            changed_releases.len()
        );

        Ok(RepoDiff {
            repo: diff.repo.clone(),
            new_releases,
            new_tags,
            changed_releases,
            watched_users: diff.watched_users.clone(),
        })
    }

    // =========================================================================
    // Recipient and Subscription Operations
    // =========================================================================

    /// Create a recipient if unknown.
    ///
    /// Existing recipients keep their kind and name; a credential carried by
    /// `recipient` replaces the stored one, an absent credential leaves it.
    pub fn ensure_recipient(&self, recipient: &Recipient) -> Result<()> {
        let conn = self.lock()?;
        Self::insert_recipient(&conn, recipient)
    }

    fn insert_recipient(conn: &Connection, recipient: &Recipient) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO recipients (id, kind, display_name, token, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (id) DO UPDATE SET token = excluded.token
            WHERE excluded.token IS NOT NULL
            "#,
            params![
                recipient.id,
                recipient.kind.as_str(),
                recipient.display_name,
                recipient.credential.as_ref().map(|c| c.token().to_string()),
                Utc::now().to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to create recipient {}", recipient.id))?;
        Ok(())
    }

    pub fn get_recipient(&self, id: RecipientId) -> Result<Option<Recipient>> {
        let result = self
            .lock()?
            .query_row(
                "SELECT id, kind, display_name, token FROM recipients WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Recipient {
                        id: row.get(0)?,
                        kind: RecipientKind::parse(&row.get::<_, String>(1)?),
                        display_name: row.get(2)?,
                        credential: row.get::<_, Option<String>>(3)?.map(Credential::new),
                    })
                },
            )
            .optional()
            .context("Failed to query recipient")?;

        Ok(result)
    }

    /// Set or clear a recipient's private credential
    pub fn set_credential(&self, id: RecipientId, credential: Option<&Credential>) -> Result<bool> {
        let changes = self
            .lock()?
            .execute(
                "UPDATE recipients SET token = ?2 WHERE id = ?1",
                params![id, credential.map(|c| c.token().to_string())],
            )
            .context("Failed to update recipient credential")?;

        Ok(changes > 0)
    }

    /// Recipients holding a private credential, with their subscriptions
    pub fn list_recipients_with_credentials(&self) -> Result<Vec<(Recipient, Vec<RepoId>)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, display_name, token FROM recipients WHERE token IS NOT NULL AND token != '' ORDER BY id",
        )?;

        let recipients = stmt
            .query_map([], |row| {
                Ok(Recipient {
                    id: row.get(0)?,
                    kind: RecipientKind::parse(&row.get::<_, String>(1)?),
                    display_name: row.get(2)?,
                    credential: row.get::<_, Option<String>>(3)?.map(Credential::new),
                })
            })
            .context("Failed to query recipients")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect recipients")?;

        let mut result = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let repos = Self::load_subscription_ids(&conn, recipient.id)?;
            result.push((recipient, repos));
        }

        Ok(result)
    }

    /// Subscribe a recipient to a repository, tracking it if needed.
    ///
    /// Creates the recipient if unknown. Runs as one transaction.
    pub fn subscribe(&self, recipient: &Recipient, repo: &RepoId) -> Result<SubscribeStatus> {
        self.subscribe_with_history(recipient, repo, &[], &[])
    }

    /// Subscribe like [`subscribe`](Self::subscribe), recording `releases`
    /// and `tags` as already known when the repository is tracked for the
    /// first time. Nothing is written unless everything is.
    pub fn subscribe_with_history(
        &self,
        recipient: &Recipient,
        repo: &RepoId,
        releases: &[Release],
        tags: &[Release],
    ) -> Result<SubscribeStatus> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let status = Self::ensure_repository(&tx, repo)?;
        if status == SubscribeStatus::NewRepository {
            let seeded_releases = Self::insert_history(&tx, repo, ReleaseKind::Release, releases)?;
            let seeded_tags = Self::insert_history(&tx, repo, ReleaseKind::Tag, tags)?;
            debug!(
                "Seeded {} with {} releases and {} tags",
                repo,
                seeded_releases.len(),
                seeded_tags.len()
            );
        }
        Self::insert_recipient(&tx, recipient)?;
        tx.execute(
            r#"
            INSERT OR IGNORE INTO subscriptions (recipient_id, owner, name, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![recipient.id, repo.owner, repo.name, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("Failed to subscribe {} to {}", recipient.id, repo))?;

        tx.commit().context("Failed to commit subscription")?;

        info!("Recipient {} subscribed to {}", recipient.id, repo);
        Ok(status)
    }

    /// Remove a subscription; the repository stays tracked
    pub fn unsubscribe(&self, id: RecipientId, repo: &RepoId) -> Result<bool> {
        let removed = self
            .lock()?
            .execute(
                "DELETE FROM subscriptions WHERE recipient_id = ?1 AND owner = ?2 AND name = ?3",
                params![id, repo.owner, repo.name],
            )
            .with_context(|| format!("Failed to unsubscribe {} from {}", id, repo))?;

        if removed > 0 {
            info!("Recipient {} unsubscribed from {}", id, repo);
        }
        Ok(removed > 0)
    }

    /// Repositories a recipient watches, with their history
    pub fn list_subscriptions(&self, id: RecipientId) -> Result<Vec<StoredRepository>> {
        let conn = self.lock()?;
        let ids = Self::load_subscription_ids(&conn, id)?;

        let mut repos = Vec::with_capacity(ids.len());
        for repo in ids {
            if let Some(stored) = Self::load_repository(&conn, &repo)? {
                repos.push(stored);
            }
        }

        Ok(repos)
    }

    fn load_subscription_ids(conn: &Connection, id: RecipientId) -> Result<Vec<RepoId>> {
        let mut stmt = conn.prepare(
            "SELECT owner, name FROM subscriptions WHERE recipient_id = ?1 ORDER BY owner, name",
        )?;

        let repos = stmt
            .query_map(params![id], |row| {
                Ok(RepoId {
                    owner: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .context("Failed to query subscriptions")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect subscriptions")?;

        Ok(repos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> RepoId {
        RepoId::new("owner", "repo")
    }

    fn release(name: &str, description: &str) -> Release {
        Release {
            name: name.to_string(),
            url: format!("https://github.com/owner/repo/releases/tag/{}", name),
            description: description.to_string(),
            is_prerelease: false,
        }
    }

    #[test]
    fn test_db_initialization() {
        let store = ReleaseStore::open_in_memory().unwrap();
        assert!(store.list_tracked_repositories().unwrap().is_empty());
    }

    #[test]
    fn test_subscribe_creates_both_sides() {
        let store = ReleaseStore::open_in_memory().unwrap();
        let alice = Recipient::new(42, RecipientKind::Individual);

        let status = store.subscribe(&alice, &repo()).unwrap();
        assert_eq!(status, SubscribeStatus::NewRepository);

        let stored = store.get_repository(&repo()).unwrap().unwrap();
        assert_eq!(stored.watched_users, vec![42]);

        let subs = store.list_subscriptions(42).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, repo());

        let second = store.subscribe(&Recipient::new(7, RecipientKind::Group), &repo()).unwrap();
        assert_eq!(second, SubscribeStatus::ExistingRepository);
    }

    #[test]
    fn test_subscribe_twice_is_noop() {
        let store = ReleaseStore::open_in_memory().unwrap();
        let alice = Recipient::new(42, RecipientKind::Individual);

        store.subscribe(&alice, &repo()).unwrap();
        store.subscribe(&alice, &repo()).unwrap();

        let stored = store.get_repository(&repo()).unwrap().unwrap();
        assert_eq!(stored.watched_users, vec![42]);
    }

    #[test]
    fn test_unsubscribe_keeps_repository() {
        let store = ReleaseStore::open_in_memory().unwrap();
        store.subscribe(&Recipient::new(42, RecipientKind::Individual), &repo()).unwrap();

        assert!(store.unsubscribe(42, &repo()).unwrap());
        assert!(!store.unsubscribe(42, &repo()).unwrap());

        let stored = store.get_repository(&repo()).unwrap().unwrap();
        assert!(stored.watched_users.is_empty());
        assert!(store.list_subscriptions(42).unwrap().is_empty());
        assert_eq!(store.list_tracked_repositories().unwrap(), vec![repo()]);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = ReleaseStore::open_in_memory().unwrap();
        let releases = vec![release("v1", "a"), release("v2", "b")];
        let tags = vec![Release::from_tag("v1")];

        let (inserted, inserted_tags) = store.upsert_releases(&repo(), &releases, &tags).unwrap();
        assert_eq!(inserted.len(), 2);
        assert_eq!(inserted_tags.len(), 1);

        let (again, again_tags) = store.upsert_releases(&repo(), &releases, &tags).unwrap();
        assert!(again.is_empty());
        assert!(again_tags.is_empty());

        let stored = store.get_repository(&repo()).unwrap().unwrap();
        assert_eq!(stored.releases, releases);
        assert_eq!(stored.tags, tags);
    }

    #[test]
    fn test_history_keeps_discovery_order() {
        let store = ReleaseStore::open_in_memory().unwrap();
        store.upsert_releases(&repo(), &[release("v2", "")], &[]).unwrap();
        store.upsert_releases(&repo(), &[release("v10", "")], &[]).unwrap();
        store.upsert_releases(&repo(), &[release("v1", "")], &[]).unwrap();

        let names: Vec<_> = store
            .get_repository(&repo())
            .unwrap()
            .unwrap()
            .releases
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["v2", "v10", "v1"]);
    }

    #[test]
    fn test_apply_changed_release() {
        let store = ReleaseStore::open_in_memory().unwrap();
        store.upsert_releases(&repo(), &[release("v1", "a")], &[]).unwrap();

        assert!(store.apply_changed_release(&repo(), &release("v1", "a-updated")).unwrap());
        // Same content again changes nothing
        assert!(!store.apply_changed_release(&repo(), &release("v1", "a-updated")).unwrap());
        // Unknown names are not inserted
        assert!(!store.apply_changed_release(&repo(), &release("v9", "x")).unwrap());

        let stored = store.get_repository(&repo()).unwrap().unwrap();
        assert_eq!(stored.releases, vec![release("v1", "a-updated")]);
    }

    #[test]
    fn test_apply_diff_reports_only_written_items() {
        let store = ReleaseStore::open_in_memory().unwrap();
        store.upsert_releases(&repo(), &[release("v1", "a")], &[]).unwrap();

        let diff = RepoDiff {
            repo: repo(),
            new_releases: vec![release("v1", "a"), release("v2", "b")],
            new_tags: vec![Release::from_tag("v2")],
            changed_releases: vec![release("v1", "a")],
            watched_users: vec![1],
        };

        let applied = store.apply_diff(&diff).unwrap();
        assert_eq!(applied.new_releases, vec![release("v2", "b")]);
        assert_eq!(applied.new_tags, vec![Release::from_tag("v2")]);
        assert!(applied.changed_releases.is_empty());
        assert_eq!(applied.watched_users, vec![1]);

        let replay = store.apply_diff(&diff).unwrap();
        assert!(replay.is_empty());
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        let store = ReleaseStore::open_in_memory().unwrap();
        store.add_repository(&RepoId::new("Owner", "Repo")).unwrap();
        store.add_repository(&RepoId::new("owner", "repo")).unwrap();

        assert_eq!(store.list_tracked_repositories().unwrap().len(), 2);
    }

    #[test]
    fn test_remove_repository_cascades() {
        let store = ReleaseStore::open_in_memory().unwrap();
        store.subscribe(&Recipient::new(42, RecipientKind::Individual), &repo()).unwrap();
        store.upsert_releases(&repo(), &[release("v1", "a")], &[]).unwrap();

        assert!(store.remove_repository(&repo()).unwrap());
        assert!(store.get_repository(&repo()).unwrap().is_none());
        assert!(store.list_subscriptions(42).unwrap().is_empty());

        // Re-adding starts from an empty history
        store.add_repository(&repo()).unwrap();
        assert!(store.get_repository(&repo()).unwrap().unwrap().releases.is_empty());
    }

    #[test]
    fn test_credentials() {
        let store = ReleaseStore::open_in_memory().unwrap();
        store.subscribe(&Recipient::new(42, RecipientKind::Individual), &repo()).unwrap();
        store.ensure_recipient(&Recipient::new(7, RecipientKind::Group)).unwrap();

        assert!(store.list_recipients_with_credentials().unwrap().is_empty());

        let token = Credential::new("ghp_private");
        assert!(store.set_credential(42, Some(&token)).unwrap());

        let with_tokens = store.list_recipients_with_credentials().unwrap();
        assert_eq!(with_tokens.len(), 1);
        assert_eq!(with_tokens[0].0.credential, Some(token));
        assert_eq!(with_tokens[0].1, vec![repo()]);

        store.set_credential(42, None).unwrap();
        assert!(store.get_recipient(42).unwrap().unwrap().credential.is_none());
    }

    #[test]
    fn test_ensure_recipient_keeps_existing_data() {
        let store = ReleaseStore::open_in_memory().unwrap();
        let mut named = Recipient::new(7, RecipientKind::Group);
        named.display_name = Some("release-chat".to_string());
        store.ensure_recipient(&named).unwrap();

        store.ensure_recipient(&Recipient::new(7, RecipientKind::Individual)).unwrap();

        let loaded = store.get_recipient(7).unwrap().unwrap();
        assert_eq!(loaded.kind, RecipientKind::Group);
        assert_eq!(loaded.display_name.as_deref(), Some("release-chat"));
    }

    #[test]
    fn test_subscribe_with_history_seeds_only_new_repositories() {
        let store = ReleaseStore::open_in_memory().unwrap();
        let first = Recipient::new(1, RecipientKind::Individual);
        let second = Recipient::new(2, RecipientKind::Individual);

        let status = store
            .subscribe_with_history(&first, &repo(), &[Release::from_tag("v1")], &[Release::from_tag("v1")])
            .unwrap();
        assert_eq!(status, SubscribeStatus::NewRepository);

        let status = store
            .subscribe_with_history(&second, &repo(), &[Release::from_tag("v2")], &[])
            .unwrap();
        assert_eq!(status, SubscribeStatus::ExistingRepository);

        let stored = store.get_repository(&repo()).unwrap().unwrap();
        let names: Vec<_> = stored.releases.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["v1"]);
        assert_eq!(stored.tags.len(), 1);
        assert_eq!(stored.watched_users, vec![1, 2]);
    }

    #[test]
    fn test_subscribe_stores_supplied_credential() {
        let store = ReleaseStore::open_in_memory().unwrap();
        store.ensure_recipient(&Recipient::new(42, RecipientKind::Individual)).unwrap();

        let mut with_token = Recipient::new(42, RecipientKind::Individual);
        with_token.credential = Some(Credential::new("ghp_new"));
        store.subscribe(&with_token, &repo()).unwrap();
        assert_eq!(
            store.get_recipient(42).unwrap().unwrap().credential,
            Some(Credential::new("ghp_new"))
        );

        // Without a credential the stored one is kept
        store
            .subscribe(&Recipient::new(42, RecipientKind::Individual), &RepoId::new("o", "other"))
            .unwrap();
        assert_eq!(
            store.get_recipient(42).unwrap().unwrap().credential,
            Some(Credential::new("ghp_new"))
        );
    }

    #[test]
    fn test_open_at_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        {
            let store = ReleaseStore::open_at(path.clone(), Duration::from_secs(1)).unwrap();
            store.add_repository(&repo()).unwrap();
        }

        assert!(path.exists());
        let reopened = ReleaseStore::open_at(path, Duration::from_secs(1)).unwrap();
        assert_eq!(reopened.list_tracked_repositories().unwrap(), vec![repo()]);
    }
}
