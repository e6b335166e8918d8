//! Domain types shared by the store, fetch client, diff engine and composer.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Repository identity. Both parts are case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `owner/name` or a `https://github.com/owner/name` URL.
    pub fn parse(input: &str) -> Option<Self> {
        static GITHUB_URL: OnceLock<Option<Regex>> = OnceLock::new();
        let url_regex = GITHUB_URL
            .get_or_init(|| Regex::new(r"(?i)^https?://github\.com/([^/]+)/([^/]+?)/?$").ok());

        let trimmed = input.trim();

        let (owner, name) = match url_regex.as_ref().and_then(|re| re.captures(trimmed)) {
            Some(caps) => (caps[1].to_string(), caps[2].to_string()),
            None => {
                let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
                let mut parts = compact.splitn(2, '/');
                let owner = parts.next().unwrap_or_default().to_string();
                let name = parts.next().unwrap_or_default().to_string();
                (owner, name)
            }
        };

        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }

        Some(Self { owner, name })
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A published release, or a tag presented as one.
///
/// `name` is the identity used for diffing. Tag-derived entries have an empty
/// `url` and `description` and are never pre-releases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    pub url: String,
    pub description: String,
    pub is_prerelease: bool,
}

impl Release {
    /// Pseudo-release for a bare tag
    pub fn from_tag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: String::new(),
            description: String::new(),
            is_prerelease: false,
        }
    }
}

/// Chat or account identifier. Group chats may be negative.
pub type RecipientId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecipientKind {
    #[default]
    Individual,
    Group,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientKind::Individual => "individual",
            RecipientKind::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "group" => RecipientKind::Group,
            _ => RecipientKind::Individual,
        }
    }
}

/// Access token used to read repositories on a recipient's behalf.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// A notification target and its optional private credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub id: RecipientId,
    pub kind: RecipientKind,
    pub display_name: Option<String>,
    pub credential: Option<Credential>,
}

impl Recipient {
    pub fn new(id: RecipientId, kind: RecipientKind) -> Self {
        Self {
            id,
            kind,
            display_name: None,
            credential: None,
        }
    }
}

/// Stored state for one tracked repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRepository {
    pub id: RepoId,
    /// Oldest first, in discovery order
    pub releases: Vec<Release>,
    pub tags: Vec<Release>,
    pub watched_users: Vec<RecipientId>,
}

impl StoredRepository {
    pub fn empty(id: RepoId) -> Self {
        Self {
            id,
            releases: Vec::new(),
            tags: Vec::new(),
            watched_users: Vec::new(),
        }
    }
}

/// Typed result of fetching one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSnapshot {
    pub repo: RepoId,
    /// Newest last
    pub releases: Vec<Release>,
    /// Newest last
    pub tags: Vec<Release>,
    /// False when the credential could not read the repository. Both lists
    /// are empty in that case, which means "no update", not "gone".
    pub accessible: bool,
}

impl RepoSnapshot {
    pub fn inaccessible(repo: RepoId) -> Self {
        Self {
            repo,
            releases: Vec::new(),
            tags: Vec::new(),
            accessible: false,
        }
    }
}

/// New or changed releases of one repository, plus who should hear about them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    pub repo: RepoId,
    pub releases: Vec<Release>,
    pub watched_users: Vec<RecipientId>,
}
