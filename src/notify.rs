//! Fan-out / Message Composer
//!
//! Turns update records into chat messages and delivers them to every
//! watcher. Messages use Telegram's legacy Markdown and are split so no
//! piece exceeds the chat service's length limit.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::NotifyConfig;
use crate::model::{RecipientId, Release, RepoId, StoredRepository, UpdateRecord};

/// Delivers one message to one recipient
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, recipient: RecipientId, text: &str) -> Result<()>;
}

/// Sender backed by the Telegram Bot API `sendMessage` method
pub struct TelegramSender {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
}

impl TelegramSender {
    pub fn new(api_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.token, method)
    }
}

#[async_trait]
impl MessageSender for TelegramSender {
    async fn send(&self, recipient: RecipientId, text: &str) -> Result<()> {
        let body = json!({
            "chat_id": recipient,
            "text": text,
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        });

        // Request URLs carry the bot token, keep them out of errors
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow!("sendMessage to {} failed: {}", recipient, e.without_url()))?;

        let result: TelegramResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Invalid sendMessage response: {}", e.without_url()))?;

        if !result.ok {
            return Err(anyhow!(
                "Telegram rejected message to {}: {}",
                recipient,
                result.description.unwrap_or_default()
            ));
        }

        Ok(())
    }
}

/// Writes messages to the log; used when no bot token is configured
pub struct LogSender;

#[async_trait]
impl MessageSender for LogSender {
    async fn send(&self, recipient: RecipientId, text: &str) -> Result<()> {
        info!(recipient, "{}", text);
        Ok(())
    }
}

/// Pick the sender the notify configuration asks for
pub fn sender_from_config(config: &NotifyConfig) -> Result<Box<dyn MessageSender>> {
    match config.telegram_token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => Ok(Box::new(TelegramSender::new(
            &config.telegram_api_url,
            token,
            Duration::from_secs(config.timeout),
        )?)),
        None => {
            info!("No Telegram token configured, notifications go to the log");
            Ok(Box::new(LogSender))
        }
    }
}

fn prerelease_marker(release: &Release) -> &'static str {
    if release.is_prerelease {
        "*Pre-release* "
    } else {
        ""
    }
}

/// Drop Markdown emphasis markers and escape underscores
pub fn sanitize_description(description: &str) -> String {
    description.replace('*', "").replace('_', "\\_").trim().to_string()
}

/// Escape the characters that open a Markdown entity outside of one
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Repository, pre-release marker and release name
pub fn short_message(repo: &RepoId, release: &Release) -> String {
    format!(
        "*{}*\n{}{}",
        repo,
        prerelease_marker(release),
        escape_markdown(&release.name)
    )
}

/// Repository, pre-release marker, linked name and release notes
pub fn full_message(repo: &RepoId, release: &Release) -> String {
    let title = if release.url.is_empty() {
        escape_markdown(&release.name)
    } else {
        format!("[{}]({})", release.name, release.url)
    };

    let mut message = format!("*{}*\n{}{}", repo, prerelease_marker(release), title);

    let description = sanitize_description(&release.description);
    if !description.is_empty() {
        message.push('\n');
        message.push_str(&description);
    }

    message
}

/// Split `text` into pieces of at most `max` characters.
///
/// Each piece ends after the last line break that fits, else after the last
/// whitespace, else at the limit, moved back one character when that would
/// separate a `\` from what it escapes. Concatenating the pieces gives back
/// `text`.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    let max = max.max(1);
    let mut pieces = Vec::new();
    let mut rest = text;

    loop {
        let window_end = match rest.char_indices().nth(max) {
            Some((index, _)) => index,
            None => {
                pieces.push(rest.to_string());
                break;
            }
        };

        let window = &rest[..window_end];
        let cut = window
            .rfind(|c: char| c == '\n' || c == '\r')
            .map(|index| index + 1)
            .or_else(|| {
                window
                    .char_indices()
                    .rev()
                    .find(|(_, c)| c.is_whitespace())
                    .map(|(index, c)| index + c.len_utf8())
            })
            .unwrap_or_else(|| hard_break(window));

        pieces.push(rest[..cut].to_string());
        rest = &rest[cut..];

        if rest.is_empty() {
            break;
        }
    }

    pieces
}

/// Cut at the end of `window`, but never between an escape and the
/// character it escapes.
fn hard_break(window: &str) -> usize {
    match window.strip_suffix('\\') {
        Some(head) if !head.is_empty() => head.len(),
        _ => window.len(),
    }
}

/// The most recent stored release, preceded by the most recent stable one
/// when the latest is a pre-release.
pub fn latest_releases(repo: &StoredRepository) -> Vec<Release> {
    let Some(last) = repo.releases.last() else {
        return Vec::new();
    };

    if last.is_prerelease {
        if let Some(stable) = repo.releases.iter().rev().find(|r| !r.is_prerelease) {
            return vec![stable.clone(), last.clone()];
        }
    }

    vec![last.clone()]
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Messages accepted by the sender
    pub delivered: usize,
    /// Recipients abandoned partway through a record
    pub failed: usize,
}

impl DeliveryReport {
    pub fn merge(&mut self, other: DeliveryReport) {
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

pub struct Composer {
    max_message_length: usize,
}

impl Composer {
    pub fn new(max_message_length: usize) -> Self {
        Self {
            max_message_length: max_message_length.max(1),
        }
    }

    /// Every message piece of a record, release by release
    pub fn messages_for(&self, record: &UpdateRecord) -> Vec<String> {
        record
            .releases
            .iter()
            .flat_map(|release| split_message(&full_message(&record.repo, release), self.max_message_length))
            .collect()
    }

    /// Send each record to all its watchers, one message at a time.
    ///
    /// A failed send skips the rest of that record for that recipient only.
    pub async fn deliver(&self, sender: &dyn MessageSender, updates: &[UpdateRecord]) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for record in updates {
            let messages = self.messages_for(record);
            debug!(
                "Delivering {} messages for {} to {} recipients",
                messages.len(),
                record.repo,
                record.watched_users.len()
            );

            for &recipient in &record.watched_users {
                for message in &messages {
                    match sender.send(recipient, message).await {
                        Ok(()) => report.delivered += 1,
                        Err(e) => {
                            warn!("Failed to notify {} about {}: {:#}", recipient, record.repo, e);
                            report.failed += 1;
                            break;
                        }
                    }
                }
            }
        }

        if report.delivered > 0 || report.failed > 0 {
            info!(
                "Notifications: {} delivered, {} recipients failed",
                report.delivered, report.failed
            );
        }

        report
    }
}
