//! Plan quality gate.
//!
//! A gate sends the plan artifact to every configured rating provider at
//! once, each call bounded by its own timeout. Providers that time out or
//! error are recorded as failed without holding up the rest. With no
//! successful provider the gate fails outright (`AllProvidersFailed`);
//! otherwise the overall score is the mean of every numeric sub-score from
//! the successful providers, and the plan passes when that mean reaches the
//! minimum score.

pub mod cache;
pub mod provider;
pub mod rubric;
pub mod threshold;

pub use cache::{CacheKey, CachedRating, RatingCache};
pub use provider::{
    CommandProvider, HttpProvider, ProviderRating, ProviderRegistry, RatingProvider,
};
pub use rubric::{Criterion, DEFAULT_RUBRIC, Rubric};
pub use threshold::minimum_score;

use crate::errors::StepError;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One provider's contribution to a rating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub ok: bool,
    #[serde(default)]
    pub score_breakdown: BTreeMap<String, f64>,
    #[serde(default)]
    pub feedback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ProviderResult {
    fn failed(reason: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            ok: false,
            score_breakdown: BTreeMap::new(),
            feedback: String::new(),
            reason: Some(reason.into()),
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

/// A provider that did not produce a usable rating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
}

/// Output of one gate round for one plan artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingResult {
    pub plan_artifact: String,
    pub rubric_id: String,
    pub provider_results: BTreeMap<String, ProviderResult>,
    pub overall_score: f64,
    pub minimum_score: f64,
    pub passed: bool,
    pub attempt: u32,
    #[serde(default)]
    pub cache_hit: bool,
    pub rated_at: DateTime<Utc>,
}

impl RatingResult {
    /// Per-provider feedback, one block per provider, for the re-planning step.
    pub fn aggregated_feedback(&self) -> String {
        let mut out = format!(
            "Plan '{}' scored {:.2} (minimum {:.2}).",
            self.plan_artifact, self.overall_score, self.minimum_score
        );
        for (name, result) in &self.provider_results {
            if result.ok {
                let scores = result
                    .score_breakdown
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push_str(&format!("\n\n[{}] {}", name, scores));
                if !result.feedback.trim().is_empty() {
                    out.push_str(&format!("\n{}", result.feedback.trim()));
                }
            } else if let Some(reason) = &result.reason {
                out.push_str(&format!("\n\n[{}] unavailable: {}", name, reason));
            }
        }
        out
    }

    /// Where the record of `round` for `plan_artifact` lives inside a run directory.
    pub fn record_path(run_dir: &Path, plan_artifact: &str, round: u32) -> PathBuf {
        run_dir
            .join("plans")
            .join(format!("{}-rating-r{}.json", plan_artifact.replace('@', "-"), round))
    }

    /// Persist this result. Each round gets its own file; existing records are
    /// never rewritten.
    pub fn write_record(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;
        if path.exists() {
            anyhow::bail!("Rating record {} already exists", path.display());
        }
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize rating")?;
        crate::util::write_atomic(path, &json)
            .with_context(|| format!("Failed to write rating record {}", path.display()))
    }
}

/// Inputs of one rating call.
pub struct RatingRequest<'a> {
    pub plan_artifact: &'a str,
    pub content: &'a str,
    pub rubric: &'a Rubric,
    pub providers: Vec<Arc<dyn RatingProvider>>,
    pub minimum_score: f64,
    pub per_provider_timeout: Duration,
    pub attempt: u32,
}

/// The gate itself. One instance per run; the cache lives with it.
#[derive(Debug, Default, Clone)]
pub struct PlanQualityGate {
    cache: Arc<RatingCache>,
}

impl PlanQualityGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(cache: Arc<RatingCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> Arc<RatingCache> {
        self.cache.clone()
    }

    pub async fn rate(&self, request: RatingRequest<'_>) -> Result<RatingResult, StepError> {
        let key = CacheKey::new(request.content, &request.rubric.id);
        if let Some(cached) = self.cache.get(&key) {
            debug!(plan = request.plan_artifact, "Rating cache hit");
            return Ok(RatingResult {
                plan_artifact: request.plan_artifact.to_string(),
                rubric_id: request.rubric.id.clone(),
                provider_results: cached.provider_results,
                overall_score: cached.overall_score,
                minimum_score: request.minimum_score,
                passed: cached.overall_score >= request.minimum_score,
                attempt: request.attempt,
                cache_hit: true,
                rated_at: Utc::now(),
            });
        }

        let timeout = request.per_provider_timeout;
        let calls = request.providers.iter().map(|provider| {
            let provider = provider.clone();
            let content = request.content;
            let rubric = request.rubric;
            async move {
                let started = Instant::now();
                let name = provider.name().to_string();
                let outcome = tokio::time::timeout(timeout, provider.rate(content, rubric)).await;
                let elapsed = started.elapsed();
                let result = match outcome {
                    Err(_) => ProviderResult::failed(
                        format!("timed out after {}s", timeout.as_secs()),
                        elapsed,
                    ),
                    Ok(Err(e)) => ProviderResult::failed(format!("{:#}", e), elapsed),
                    Ok(Ok(rating)) if !rating.ok => ProviderResult::failed(
                        rating
                            .reason
                            .unwrap_or_else(|| "provider reported ok=false".to_string()),
                        elapsed,
                    ),
                    Ok(Ok(rating)) if rating.sub_scores().is_empty() => {
                        ProviderResult::failed("no numeric scores in rating", elapsed)
                    }
                    Ok(Ok(rating)) => ProviderResult {
                        ok: true,
                        score_breakdown: rating.score_breakdown(),
                        feedback: rating.feedback,
                        reason: None,
                        duration_ms: elapsed.as_millis() as u64,
                    },
                };
                (name, result)
            }
        });
        let provider_results: BTreeMap<String, ProviderResult> =
            join_all(calls).await.into_iter().collect();

        let scores: Vec<f64> = provider_results
            .values()
            .filter(|r| r.ok)
            .flat_map(|r| r.score_breakdown.values().copied())
            .collect();

        if scores.is_empty() {
            let failures: Vec<ProviderFailure> = provider_results
                .iter()
                .map(|(name, r)| ProviderFailure {
                    provider: name.clone(),
                    reason: r.reason.clone().unwrap_or_default(),
                })
                .collect();
            warn!(
                plan = request.plan_artifact,
                providers = failures.len(),
                "Every rating provider failed"
            );
            return Err(StepError::AllProvidersFailed { failures });
        }

        for (name, result) in provider_results.iter().filter(|(_, r)| !r.ok) {
            warn!(provider = %name, reason = ?result.reason, "Rating provider failed");
        }

        let overall_score = scores.iter().sum::<f64>() / scores.len() as f64;
        let passed = overall_score >= request.minimum_score;
        info!(
            plan = request.plan_artifact,
            overall_score,
            minimum_score = request.minimum_score,
            passed,
            attempt = request.attempt,
            "Plan rated"
        );

        self.cache.insert(
            key,
            CachedRating {
                provider_results: provider_results.clone(),
                overall_score,
            },
        );

        Ok(RatingResult {
            plan_artifact: request.plan_artifact.to_string(),
            rubric_id: request.rubric.id.clone(),
            provider_results,
            overall_score,
            minimum_score: request.minimum_score,
            passed,
            attempt: request.attempt,
            cache_hit: false,
            rated_at: Utc::now(),
        })
    }
}
