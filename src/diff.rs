//! Diff Engine - classify freshly fetched releases against stored state
//!
//! Releases and tags are compared by `name` only. A fetched item is *new* when
//! no stored item carries its name, and *changed* when one does but the
//! description or pre-release flag differs. URLs are never compared.

use std::collections::{HashMap, HashSet};

use crate::model::{RecipientId, Release, RepoId, RepoSnapshot, StoredRepository, UpdateRecord};

/// Items of `new_list` whose name does not appear in `old_list`.
pub fn classify_new(old_list: &[Release], new_list: &[Release]) -> Vec<Release> {
    let known: HashSet<&str> = old_list.iter().map(|r| r.name.as_str()).collect();

    new_list
        .iter()
        .filter(|release| !known.contains(release.name.as_str()))
        .cloned()
        .collect()
}

/// Items of `new_list` that share a name with an item of `old_list` but differ
/// in description or pre-release flag.
pub fn classify_changed(old_list: &[Release], new_list: &[Release]) -> Vec<Release> {
    let known: HashMap<&str, &Release> = old_list.iter().map(|r| (r.name.as_str(), r)).collect();

    new_list
        .iter()
        .filter(|release| {
            known.get(release.name.as_str()).is_some_and(|old| {
                old.description != release.description || old.is_prerelease != release.is_prerelease
            })
        })
        .cloned()
        .collect()
}

/// Drop unnamed entries and repeated names (first occurrence wins).
pub fn normalize(list: &[Release]) -> Vec<Release> {
    let mut seen = HashSet::new();
    list.iter()
        .filter(|release| !release.name.is_empty())
        .filter(|release| seen.insert(release.name.clone()))
        .cloned()
        .collect()
}

/// Everything that changed for one repository in one cycle, kept apart so the
/// store can apply each part on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoDiff {
    pub repo: RepoId,
    pub new_releases: Vec<Release>,
    pub new_tags: Vec<Release>,
    pub changed_releases: Vec<Release>,
    /// Recipients captured at diff time
    pub watched_users: Vec<RecipientId>,
}

impl RepoDiff {
    pub fn is_empty(&self) -> bool {
        self.new_releases.is_empty() && self.new_tags.is_empty() && self.changed_releases.is_empty()
    }

    /// Merge the parts into one update.
    ///
    /// Changed releases come first since they predate anything new. New tags
    /// are appended after new releases, skipping names already in the merged
    /// list so a tag that became a release in the same cycle is reported once.
    pub fn into_update(self) -> Option<UpdateRecord> {
        if self.is_empty() {
            return None;
        }

        let mut releases = Vec::with_capacity(
            self.changed_releases.len() + self.new_releases.len() + self.new_tags.len(),
        );
        let mut merged_names = HashSet::new();

        for release in self
            .changed_releases
            .into_iter()
            .chain(self.new_releases)
            .chain(self.new_tags)
        {
            if merged_names.insert(release.name.clone()) {
                releases.push(release);
            }
        }

        Some(UpdateRecord {
            repo: self.repo,
            releases,
            watched_users: self.watched_users,
        })
    }
}

/// Compare one fetched snapshot against its stored counterpart.
pub fn diff_repository(stored: &StoredRepository, snapshot: &RepoSnapshot) -> RepoDiff {
    let fetched_releases = normalize(&snapshot.releases);
    let fetched_tags = normalize(&snapshot.tags);

    RepoDiff {
        repo: snapshot.repo.clone(),
        new_releases: classify_new(&stored.releases, &fetched_releases),
        new_tags: classify_new(&stored.tags, &fetched_tags),
        changed_releases: classify_changed(&stored.releases, &fetched_releases),
        watched_users: stored.watched_users.clone(),
    }
}

/// Per-repository diffs for a whole cycle, in snapshot order.
///
/// Inaccessible snapshots are skipped: their empty lists say nothing about
/// the repository. Repositories missing from `stored` are diffed against an
/// empty history.
pub fn compute_diffs(
    snapshots: &[RepoSnapshot],
    stored: &HashMap<RepoId, StoredRepository>,
) -> Vec<RepoDiff> {
    snapshots
        .iter()
        .filter(|snapshot| snapshot.accessible)
        .map(|snapshot| match stored.get(&snapshot.repo) {
            Some(existing) => diff_repository(existing, snapshot),
            None => diff_repository(&StoredRepository::empty(snapshot.repo.clone()), snapshot),
        })
        .filter(|diff| !diff.is_empty())
        .collect()
}

/// One update record per repository with any qualifying change.
pub fn compute_updates(
    snapshots: &[RepoSnapshot],
    stored: &HashMap<RepoId, StoredRepository>,
) -> Vec<UpdateRecord> {
    compute_diffs(snapshots, stored)
        .into_iter()
        .filter_map(RepoDiff::into_update)
        .collect()
}
