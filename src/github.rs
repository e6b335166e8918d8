//! Remote Fetch Client - batched release and tag lookups over GitHub GraphQL
//!
//! One GraphQL request per batch of repositories fetches both the most recent
//! releases and the most recent tags. Owners and names travel as query
//! variables, never spliced into the query text. Batches run with bounded
//! parallelism and are reassembled in input order.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use octocrab::Octocrab;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::env;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Config, GitHubConfig};
use crate::model::{Credential, Release, RepoId, RepoSnapshot};

/// GitHub authentication strategies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Token set in the configuration file
    ConfigToken,
    /// Use GitHub CLI authentication
    GitHubCLI,
    /// Use environment variable token
    EnvironmentToken,
}

/// Detect and obtain the default GitHub credential
pub fn detect_authentication(config: &GitHubConfig) -> Result<(AuthStrategy, Credential)> {
    if let Some(token) = config.token.as_deref().filter(|t| !t.trim().is_empty()) {
        return Ok((AuthStrategy::ConfigToken, Credential::new(token.trim())));
    }

    match config.auth_method.as_str() {
        "auto" => {
            // Try GitHub CLI first, then environment token
            if let Ok(token) = try_github_cli() {
                Ok((AuthStrategy::GitHubCLI, Credential::new(token)))
            } else if let Ok(token) = try_environment_token() {
                Ok((AuthStrategy::EnvironmentToken, Credential::new(token)))
            } else {
                Err(anyhow!(
                    "No GitHub authentication found. Please either:\n\
                     1. Install and authenticate GitHub CLI: gh auth login\n\
                     2. Set GITHUB_TOKEN environment variable\n\
                     3. Set github.token in the configuration file"
                ))
            }
        }
        "gh_cli" => {
            let token = try_github_cli().context("GitHub CLI authentication failed. Run: gh auth login")?;
            Ok((AuthStrategy::GitHubCLI, Credential::new(token)))
        }
        "token" => {
            let token = try_environment_token()
                .context("GITHUB_TOKEN environment variable not found or invalid")?;
            Ok((AuthStrategy::EnvironmentToken, Credential::new(token)))
        }
        other => Err(anyhow!("Unknown auth method: {}", other)),
    }
}

/// Try to get token from GitHub CLI
fn try_github_cli() -> Result<String> {
    debug!("Attempting GitHub CLI authentication");

    let token_output = Command::new("gh")
        .args(["auth", "token"])
        .output()
        .context("Failed to run GitHub CLI (gh)")?;

    if !token_output.status.success() {
        return Err(anyhow!(
            "Failed to retrieve token from GitHub CLI: {}",
            String::from_utf8_lossy(&token_output.stderr)
        ));
    }

    let token = String::from_utf8(token_output.stdout)
        .context("GitHub CLI token is not valid UTF-8")?
        .trim()
        .to_string();

    if token.is_empty() {
        return Err(anyhow!("GitHub CLI returned empty token"));
    }

    debug!("Successfully obtained token from GitHub CLI");
    Ok(token)
}

/// Try to get token from environment variable
fn try_environment_token() -> Result<String> {
    debug!("Attempting environment variable authentication");

    let token = env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable not set")?;

    if token.is_empty() {
        return Err(anyhow!("GITHUB_TOKEN is empty"));
    }

    if !token.starts_with("ghp_") && !token.starts_with("gho_") && !token.starts_with("ghs_") {
        warn!("GITHUB_TOKEN doesn't look like a valid GitHub token (should start with ghp_, gho_, or ghs_)");
    }

    Ok(token)
}

/// Sends one GraphQL document and returns the raw response envelope.
///
/// `credential` overrides the transport's default authentication.
#[async_trait]
pub trait GraphQlTransport: Send + Sync {
    async fn query(
        &self,
        query: &str,
        variables: Value,
        credential: Option<&Credential>,
    ) -> Result<Value>;
}

/// GraphQL transport backed by octocrab.
///
/// Clients for per-recipient credentials are built on first use and reused.
pub struct OctocrabTransport {
    api_url: String,
    default_client: Octocrab,
    credential_clients: Mutex<HashMap<String, Octocrab>>,
}

impl OctocrabTransport {
    pub fn new(api_url: &str, default_credential: Option<&Credential>) -> Result<Self> {
        let default_client = Self::build_client(api_url, default_credential)?;

        Ok(Self {
            api_url: api_url.to_string(),
            default_client,
            credential_clients: Mutex::new(HashMap::new()),
        })
    }

    /// Build a transport using the configured authentication strategy
    pub fn from_config(config: &Config) -> Result<Self> {
        let (strategy, credential) = detect_authentication(&config.github)?;
        info!("Using authentication strategy: {:?}", strategy);

        Self::new(&config.github.api_url, Some(&credential))
    }

    fn build_client(api_url: &str, credential: Option<&Credential>) -> Result<Octocrab> {
        let mut builder = Octocrab::builder()
            .base_uri(api_url)
            .with_context(|| format!("Invalid GitHub API URL: {}", api_url))?;

        if let Some(credential) = credential {
            builder = builder.personal_token(credential.token().to_string());
        }

        builder.build().context("Failed to create GitHub client")
    }

    fn client_for(&self, credential: &Credential) -> Result<Octocrab> {
        let mut clients = self
            .credential_clients
            .lock()
            .map_err(|_| anyhow!("GitHub client cache lock poisoned"))?;

        if let Some(client) = clients.get(credential.token()) {
            return Ok(client.clone());
        }

        let client = Self::build_client(&self.api_url, Some(credential))?;
        clients.insert(credential.token().to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl GraphQlTransport for OctocrabTransport {
    async fn query(
        &self,
        query: &str,
        variables: Value,
        credential: Option<&Credential>,
    ) -> Result<Value> {
        let client = match credential {
            Some(credential) => self.client_for(credential)?,
            None => self.default_client.clone(),
        };

        let payload = json!({ "query": query, "variables": variables });
        let response: Value = client
            .graphql(&payload)
            .await
            .context("GitHub GraphQL request failed")?;

        Ok(response)
    }
}

/// Batching and timeout knobs for [`FetchClient`]
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub batch_size: usize,
    pub max_parallel: usize,
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_parallel: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

impl FetchOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.polling.batch_size,
            max_parallel: config.polling.max_parallel,
            timeout: config.fetch_timeout(),
        }
    }
}

/// Release and tag fetcher
pub struct FetchClient {
    transport: Arc<dyn GraphQlTransport>,
    options: FetchOptions,
}

impl FetchClient {
    pub fn new(transport: Arc<dyn GraphQlTransport>, options: FetchOptions) -> Self {
        Self { transport, options }
    }

    /// Fetch up to `depth` most recent releases and tags for every repository.
    ///
    /// Snapshots come back in input order. A repository the credential cannot
    /// read yields an inaccessible snapshot; any transport failure, timeout or
    /// response without data fails the whole call.
    pub async fn fetch_many(
        &self,
        repos: &[RepoId],
        depth: u32,
        credential: Option<&Credential>,
    ) -> Result<Vec<RepoSnapshot>> {
        if repos.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = self.options.batch_size.max(1);
        let max_parallel = self.options.max_parallel.max(1);
        let depth = depth.max(1);

        // Build the futures up front so the stream holds no borrowing closure
        let pending: Vec<_> = repos
            .chunks(batch_size)
            .enumerate()
            .map(|(index, batch)| self.fetch_batch(index, batch, depth, credential))
            .collect();

        let batches: Vec<Vec<RepoSnapshot>> = stream::iter(pending)
            .buffered(max_parallel)
            .try_collect()
            .await?;

        let snapshots: Vec<RepoSnapshot> = batches.into_iter().flatten().collect();
        debug!(
            "Fetched {} repositories ({} inaccessible)",
            snapshots.len(),
            snapshots.iter().filter(|s| !s.accessible).count()
        );

        Ok(snapshots)
    }

    /// Whether `credential` can read `repo`. Any failure counts as no.
    pub async fn can_access(&self, repo: &RepoId, credential: Option<&Credential>) -> bool {
        match self.fetch_many(std::slice::from_ref(repo), 1, credential).await {
            Ok(snapshots) => snapshots.first().is_some_and(|s| s.accessible),
            Err(e) => {
                debug!("Access probe for {} failed: {:#}", repo, e);
                false
            }
        }
    }

    async fn fetch_batch(
        &self,
        index: usize,
        repos: &[RepoId],
        depth: u32,
        credential: Option<&Credential>,
    ) -> Result<Vec<RepoSnapshot>> {
        debug!("Fetching batch {} ({} repositories)", index, repos.len());

        let query = batch_query(repos.len());
        let variables = batch_variables(repos, depth);

        let response = tokio::time::timeout(
            self.options.timeout,
            self.transport.query(&query, variables, credential),
        )
        .await
        .map_err(|_| anyhow!("GitHub request for batch {} timed out after {:?}", index, self.options.timeout))?
        .with_context(|| format!("GitHub request for batch {} failed", index))?;

        parse_batch(repos, response).with_context(|| format!("Invalid response for batch {}", index))
    }
}

const REPOSITORY_FIELDS: &str = r#"fragment repositoryVersions on Repository {
  releases(last: $depth) {
    nodes {
      url
      isPrerelease
      description
      tag { name }
    }
  }
  refs(last: $depth, refPrefix: "refs/tags/") {
    nodes { name }
  }
}"#;

/// Query text for a batch of `len` repositories, aliased `repo_0..repo_{len-1}`
fn batch_query(len: usize) -> String {
    let mut params = vec!["$depth: Int!".to_string()];
    let mut fields = Vec::with_capacity(len);

    for i in 0..len {
        params.push(format!("$o{i}: String!, $n{i}: String!"));
        fields.push(format!(
            "  repo_{i}: repository(owner: $o{i}, name: $n{i}) {{ ...repositoryVersions }}"
        ));
    }

    format!(
        "query({}) {{\n{}\n}}\n{}",
        params.join(", "),
        fields.join("\n"),
        REPOSITORY_FIELDS
    )
}

fn batch_variables(repos: &[RepoId], depth: u32) -> Value {
    let mut variables = Map::new();
    variables.insert("depth".to_string(), json!(depth));

    for (i, repo) in repos.iter().enumerate() {
        variables.insert(format!("o{i}"), json!(repo.owner));
        variables.insert(format!("n{i}"), json!(repo.name));
    }

    Value::Object(variables)
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<HashMap<String, Option<RawRepository>>>,
    #[serde(default)]
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawRepository {
    releases: Option<RawConnection<RawRelease>>,
    refs: Option<RawConnection<RawRef>>,
}

#[derive(Debug, Deserialize)]
struct RawConnection<T> {
    nodes: Option<Vec<Option<T>>>,
}

impl<T> RawConnection<T> {
    fn into_nodes(self) -> impl Iterator<Item = T> {
        self.nodes.unwrap_or_default().into_iter().flatten()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRelease {
    url: Option<String>,
    is_prerelease: Option<bool>,
    description: Option<String>,
    tag: Option<RawRef>,
}

#[derive(Debug, Deserialize)]
struct RawRef {
    name: Option<String>,
}

impl RawRepository {
    fn into_snapshot(self, repo: RepoId) -> RepoSnapshot {
        let releases = self
            .releases
            .map(|c| c.into_nodes().filter_map(RawRelease::into_release).collect())
            .unwrap_or_default();

        let tags = self
            .refs
            .map(|c| {
                c.into_nodes()
                    .filter_map(|r| r.name.filter(|n| !n.is_empty()))
                    .map(Release::from_tag)
                    .collect()
            })
            .unwrap_or_default();

        RepoSnapshot {
            repo,
            releases,
            tags,
            accessible: true,
        }
    }
}

impl RawRelease {
    /// Releases are named after their tag; untagged drafts are dropped.
    fn into_release(self) -> Option<Release> {
        let name = self.tag.and_then(|t| t.name).filter(|n| !n.is_empty())?;

        Some(Release {
            name,
            url: self.url.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            is_prerelease: self.is_prerelease.unwrap_or(false),
        })
    }
}

fn parse_batch(repos: &[RepoId], response: Value) -> Result<Vec<RepoSnapshot>> {
    let envelope: GraphQlResponse =
        serde_json::from_value(response).context("Malformed GitHub GraphQL response")?;

    let messages: Vec<String> = envelope
        .errors
        .unwrap_or_default()
        .into_iter()
        .map(|e| e.message)
        .collect();

    let mut data = match envelope.data {
        Some(data) => data,
        None => return Err(anyhow!("GitHub response has no data: {}", messages.join("; "))),
    };

    if !messages.is_empty() {
        debug!("GitHub reported partial errors: {}", messages.join("; "));
    }

    let snapshots = repos
        .iter()
        .enumerate()
        .map(|(i, repo)| match data.remove(&format!("repo_{i}")).flatten() {
            Some(raw) => raw.into_snapshot(repo.clone()),
            None => {
                warn!("Repository {} is not accessible", repo);
                RepoSnapshot::inaccessible(repo.clone())
            }
        })
        .collect();

    Ok(snapshots)
}
