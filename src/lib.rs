//! releasewatch - GitHub release notification daemon
//!
//! releasewatch polls watched GitHub repositories for new releases and tags
//! and notifies every subscribed chat when something new appears.
//!
//! ## Core Features
//!
//! - **Batched GraphQL Fetching**: Releases and tags for many repositories per request
//! - **Change Detection**: New and edited releases, with tag-only repositories covered
//! - **Private Repositories**: Per-recipient credentials polled on their own schedule
//! - **Fan-out**: Markdown messages split to the chat service's length limit
//! - **Configuration Management**: YAML-based configuration with XDG compliance
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`github`]: GitHub GraphQL fetch client and authentication
//! - [`diff`]: Release classification against stored history
//! - [`state`]: SQLite repository, release and subscription store
//! - [`scheduler`]: Named repeating jobs with result subscribers
//! - [`sync`]: Polling cycles from fetch to persisted updates
//! - [`notify`]: Message composition and delivery
//! - [`daemon`]: Long-running service wiring

pub mod config;
pub mod daemon;
pub mod diff;
pub mod github;
pub mod model;
pub mod notify;
pub mod scheduler;
pub mod state;
pub mod sync;

pub use config::Config;
pub use daemon::Daemon;
pub use github::{FetchClient, FetchOptions, GraphQlTransport, OctocrabTransport};
pub use model::{Credential, Recipient, RecipientId, RecipientKind, Release, RepoId, UpdateRecord};
pub use notify::{Composer, DeliveryReport, MessageSender};
pub use scheduler::Scheduler;
pub use state::ReleaseStore;
pub use sync::{PollSummary, ReleaseSync};
