//! Common test utilities and helpers for releasewatch tests
#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use releasewatch::{
    Credential, FetchClient, FetchOptions, OctocrabTransport, ReleaseStore, ReleaseSync,
};

/// Release data served by the mock GitHub API
#[derive(Debug, Clone)]
pub struct MockRelease {
    pub tag: String,
    pub description: String,
    pub is_prerelease: bool,
}

impl MockRelease {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            description: format!("Notes for {}", tag),
            is_prerelease: false,
        }
    }

    pub fn prerelease(mut self) -> Self {
        self.is_prerelease = true;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    fn to_node(&self, full_name: &str) -> Value {
        json!({
            "url": format!("https://github.com/{}/releases/tag/{}", full_name, self.tag),
            "isPrerelease": self.is_prerelease,
            "description": self.description,
            "tag": { "name": self.tag },
        })
    }
}

/// GraphQL repository object listing `releases` and matching tags
pub fn repository_node(full_name: &str, releases: &[MockRelease]) -> Value {
    json!({
        "releases": { "nodes": releases.iter().map(|r| r.to_node(full_name)).collect::<Vec<_>>() },
        "refs": { "nodes": releases.iter().map(|r| json!({ "name": r.tag })).collect::<Vec<_>>() },
    })
}

/// Answer every GraphQL query with the first repository alias set to `repository`
pub async fn serve_repository(server: &MockServer, repository: Value) {
    server.reset().await;

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "repo_0": repository }
        })))
        .mount(server)
        .await;
}

/// Sync engine backed by an in-memory store and the mock GitHub server
pub fn sync_against(server: &MockServer) -> ReleaseSync {
    let store = Arc::new(ReleaseStore::open_in_memory().expect("Failed to open in-memory store"));
    let transport = OctocrabTransport::new(&server.uri(), Some(&Credential::new("test-token")))
        .expect("Failed to create transport");
    let fetcher = FetchClient::new(Arc::new(transport), FetchOptions::default());

    ReleaseSync::new(store, Arc::new(fetcher), 1)
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
