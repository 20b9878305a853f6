//! Rating providers: the external scoring oracles behind the quality gate.
//!
//! A provider receives the plan content and the rubric and answers with a
//! JSON object:
//!
//! ```json
//! {"ok": true, "score": 8, "breakdown": {"completeness": 8, "feasibility": 7}, "feedback": "..."}
//! ```
//!
//! `ok` defaults to true. Either `score` or `breakdown` must carry at least
//! one number; a provider that returns neither counts as failed.

use super::rubric::Rubric;
use crate::config::{ProviderConfig, ProviderKind};
use crate::util::{extract_json_object, tail};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Parsed answer of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRating {
    #[serde(default = "default_ok")]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, alias = "scores", alias = "score_breakdown")]
    pub breakdown: BTreeMap<String, f64>,
    #[serde(default)]
    pub feedback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn default_ok() -> bool {
    true
}

impl ProviderRating {
    /// A successful rating with a single top-level score.
    pub fn scored(score: f64, feedback: impl Into<String>) -> Self {
        Self {
            ok: true,
            score: Some(score),
            breakdown: BTreeMap::new(),
            feedback: feedback.into(),
            reason: None,
        }
    }

    /// Numeric sub-scores: the breakdown when present, otherwise the top-level score.
    pub fn sub_scores(&self) -> Vec<f64> {
        if self.breakdown.is_empty() {
            self.score.into_iter().collect()
        } else {
            self.breakdown.values().copied().collect()
        }
    }

    /// Breakdown as stored in the rating record.
    pub fn score_breakdown(&self) -> BTreeMap<String, f64> {
        if self.breakdown.is_empty() {
            self.score
                .map(|s| BTreeMap::from([("overall".to_string(), s)]))
                .unwrap_or_default()
        } else {
            self.breakdown.clone()
        }
    }
}

/// Payload sent to every provider.
#[derive(Debug, Serialize)]
pub struct RatingPayload<'a> {
    pub content: &'a str,
    pub rubric: &'a Rubric,
}

#[async_trait]
pub trait RatingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Rate `content` against `rubric`. Timeouts are applied by the caller.
    async fn rate(&self, content: &str, rubric: &Rubric) -> Result<ProviderRating>;
}

fn parse_rating(provider: &str, text: &str) -> Result<ProviderRating> {
    let json = extract_json_object(text).with_context(|| {
        format!(
            "Provider '{}' returned no JSON object: {}",
            provider,
            tail(text.trim(), 200)
        )
    })?;
    serde_json::from_str(&json)
        .with_context(|| format!("Provider '{}' returned malformed rating JSON", provider))
}

/// Local subprocess provider: payload on stdin, rating on stdout.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    name: String,
    command: String,
    args: Vec<String>,
}

impl CommandProvider {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl RatingProvider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn rate(&self, content: &str, rubric: &Rubric) -> Result<ProviderRating> {
        let payload = serde_json::to_string(&RatingPayload { content, rubric })
            .context("Failed to serialize rating payload")?;

        // `sh -c 'cmd "$@"' sh args...` keeps args out of shell parsing.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(format!("{} \"$@\"", self.command))
            .arg("sh")
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn rating provider: {}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A provider that ignores stdin may close it early.
            let _ = stdin.write_all(payload.as_bytes()).await;
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for rating provider '{}'", self.name))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Provider '{}' exited with {}: {}",
                self.name,
                output.status,
                tail(stderr.trim(), 500)
            );
        }
        parse_rating(&self.name, &String::from_utf8_lossy(&output.stdout))
    }
}

/// Remote provider: payload POSTed as JSON.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    name: String,
    url: String,
    headers: BTreeMap<String, String>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(name: impl Into<String>, url: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            headers,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RatingProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn rate(&self, content: &str, rubric: &Rubric) -> Result<ProviderRating> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Accept", "application/json")
            .json(&RatingPayload { content, rubric });
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let body = request
            .send()
            .await
            .with_context(|| format!("Failed to reach rating provider '{}'", self.name))?
            .error_for_status()
            .with_context(|| format!("Rating provider '{}' returned error status", self.name))?
            .text()
            .await
            .with_context(|| format!("Failed to read response from provider '{}'", self.name))?;
        parse_rating(&self.name, &body)
    }
}

/// Named providers available to gate steps.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn RatingProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(configs: &[ProviderConfig]) -> Self {
        let mut registry = Self::new();
        for config in configs {
            let provider: Arc<dyn RatingProvider> = match &config.kind {
                ProviderKind::Command { command, args } => Arc::new(CommandProvider::new(
                    &config.name,
                    command,
                    args.clone(),
                )),
                ProviderKind::Http { url, headers } => {
                    Arc::new(HttpProvider::new(&config.name, url, headers.clone()))
                }
            };
            registry.insert(provider);
        }
        registry
    }

    pub fn insert(&mut self, provider: Arc<dyn RatingProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RatingProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.providers.keys().cloned().collect()
    }
}
