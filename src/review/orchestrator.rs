//! Drives one review run across the enabled analysis domains.
//!
//! Progress is checkpointed after every domain, so an interrupted review
//! resumes from its pending domains without re-spending budget. Results of
//! completed domains are cached per `(configHash, fileHashes, domain)`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::cache::ReviewCache;
use super::checkpoint::{CheckpointStatus, CheckpointStore, ReviewCheckpoint};
use super::findings::{
    DomainFailure, FileSkip, Improvement, ReviewDomainResult, dedup_improvements, normalize_title,
};
use super::fingerprint::{FileHashes, ScopeFile, ScopeFilter, config_hash, scan_scope};
use crate::budget::{Allowance, BudgetLimits, BudgetTracker, ChargeOutcome};
use crate::errors::{MasonError, MasonResult};
use crate::mason_config::{DomainConfig, MasonConfigFile};
use crate::priority::{Discovered, rank};
use crate::store::BacklogStore;
use crate::store::models::BacklogItem;

/// Everything a provider needs to analyze one domain.
#[derive(Debug, Clone)]
pub struct DomainAnalysisRequest {
    pub domain: DomainConfig,
    pub stack: Option<String>,
    pub project_dir: PathBuf,
    /// Files admitted for this domain, already filtered by size and count.
    pub files: Vec<ScopeFile>,
    pub allowance: Allowance,
}

/// Produces improvements for one domain.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn analyze(&self, request: DomainAnalysisRequest) -> Result<ReviewDomainResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Completed,
    BudgetExceeded,
    /// Some domains failed or the review was cancelled; the checkpoint stays resumable.
    Partial,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Partial => "partial",
        }
    }
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one `review` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewOutcome {
    pub status: ReviewStatus,
    pub checkpoint_id: String,
    pub resumed: bool,
    /// Domains analyzed by the provider in this invocation.
    pub domains_analyzed: usize,
    pub cache_hits: usize,
    /// Spend of this invocation only.
    pub tokens_used: u64,
    pub cost: f64,
    pub item_ids: Vec<i64>,
    pub duplicates_skipped: usize,
    pub pending_domains: Vec<String>,
    pub failures: Vec<DomainFailure>,
}

/// Progress events for the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReviewEvent {
    ReviewStarted {
        checkpoint_id: String,
        resumed: bool,
        files: usize,
        pending: Vec<String>,
    },
    DomainStarted {
        domain: String,
        files: usize,
    },
    DomainCompleted {
        domain: String,
        improvements: usize,
        tokens_used: u64,
        cost: f64,
        from_cache: bool,
    },
    DomainFailed {
        domain: String,
        message: String,
    },
    BudgetWarning {
        cost: f64,
    },
    ReviewCompleted {
        outcome: Box<ReviewOutcome>,
    },
}

pub struct DomainAnalysisOrchestrator {
    provider: Arc<dyn AnalysisProvider>,
    backlog: Arc<dyn BacklogStore>,
    checkpoints: CheckpointStore,
    cache: ReviewCache,
    config: MasonConfigFile,
    project_dir: PathBuf,
    fresh: bool,
    event_tx: Option<mpsc::Sender<ReviewEvent>>,
    cancel: CancellationToken,
}

impl DomainAnalysisOrchestrator {
    pub fn new(
        provider: Arc<dyn AnalysisProvider>,
        backlog: Arc<dyn BacklogStore>,
        checkpoints: CheckpointStore,
        cache: ReviewCache,
        config: MasonConfigFile,
        project_dir: PathBuf,
    ) -> Self {
        Self {
            provider,
            backlog,
            checkpoints,
            cache,
            config,
            project_dir,
            fresh: false,
            event_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Ignore any live checkpoint and start over.
    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    /// Set an event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<ReviewEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Stop before the next domain when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    async fn emit(&self, event: ReviewEvent) {
        if let Some(tx) = &self.event_tx {
            tx.send(event).await.ok();
        }
    }

    fn save(&self, checkpoint: &ReviewCheckpoint) -> MasonResult<()> {
        self.checkpoints.save(checkpoint).map_err(MasonError::storage)
    }

    /// Pick up a matching checkpoint or start a fresh one.
    fn open_checkpoint(
        &self,
        hash: &str,
        file_hashes: &FileHashes,
    ) -> MasonResult<(ReviewCheckpoint, bool)> {
        let existing = self.checkpoints.load().map_err(MasonError::storage)?;

        if let Some(checkpoint) = existing {
            if !self.fresh && checkpoint.is_resumable(hash, file_hashes) {
                tracing::info!(
                    checkpoint = %checkpoint.id,
                    pending = checkpoint.pending_domains.len(),
                    tokens_used = checkpoint.tokens_used,
                    "resuming review checkpoint"
                );
                return Ok((checkpoint, true));
            }
            if !checkpoint.status.is_terminal() {
                tracing::info!(checkpoint = %checkpoint.id, fresh = self.fresh, "abandoning stale review checkpoint");
                self.checkpoints.abandon().map_err(MasonError::storage)?;
            }
        }

        let domains = self
            .config
            .enabled_domains()
            .into_iter()
            .map(|d| d.name.clone())
            .collect();
        let checkpoint = ReviewCheckpoint::new(hash, file_hashes.clone(), domains);
        self.save(&checkpoint)?;
        Ok((checkpoint, false))
    }

    /// Run the review to completion, budget exhaustion, or cancellation.
    pub async fn run(&self) -> MasonResult<ReviewOutcome> {
        self.config.check()?;
        let filter = ScopeFilter::from_config(&self.config)
            .map_err(|e| MasonError::ConfigInvalid(format!("{e:#}")))?;

        let root = self.project_dir.clone();
        let scope = tokio::task::spawn_blocking(move || scan_scope(&root, &filter))
            .await
            .map_err(|e| MasonError::Other(anyhow::anyhow!("scope scan panicked: {e}")))??;
        let file_hashes = scope.file_hashes();
        let hash = config_hash(&self.config);

        match self.cache.prune(Utc::now()) {
            Ok(0) => {}
            Ok(n) => tracing::debug!(removed = n, "pruned expired cache entries"),
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "failed to prune review cache"),
        }

        let (mut checkpoint, resumed) = self.open_checkpoint(&hash, &file_hashes)?;
        self.emit(ReviewEvent::ReviewStarted {
            checkpoint_id: checkpoint.id.clone(),
            resumed,
            files: scope.len(),
            pending: checkpoint.pending_domains.clone(),
        })
        .await;

        // A resumed checkpoint keeps spending against the same ceilings.
        let mut budget = BudgetTracker::new(BudgetLimits::for_review(&self.config.limits))
            .with_spent(checkpoint.tokens_used, checkpoint.cost_so_far);
        let (tokens_before, cost_before) = (checkpoint.tokens_used, checkpoint.cost_so_far);
        let mut domains_analyzed = 0;
        let mut cache_hits = 0;
        let mut failures = Vec::new();

        for domain_name in checkpoint.pending_domains.clone() {
            if self.cancel.is_cancelled() {
                tracing::info!("review cancelled");
                break;
            }
            if budget.is_exceeded() {
                break;
            }

            let Some(domain) = self
                .config
                .domains
                .iter()
                .find(|d| d.name == domain_name)
                .cloned()
            else {
                let message = "domain is no longer configured".to_string();
                checkpoint.record_failure(&domain_name, &message);
                self.save(&checkpoint)?;
                continue;
            };

            let key = ReviewCache::key(&hash, &file_hashes, &domain_name);
            if let Some(entry) = self.cache.get(&key, Utc::now()) {
                tracing::info!(domain = %domain_name, "review cache hit");
                let result = ReviewDomainResult {
                    from_cache: true,
                    tokens_used: 0,
                    cost: 0.0,
                    ..entry.results
                };
                let found = result.improvements.len();
                checkpoint.complete_domain(result);
                self.save(&checkpoint)?;
                cache_hits += 1;
                self.emit(ReviewEvent::DomainCompleted {
                    domain: domain_name,
                    improvements: found,
                    tokens_used: 0,
                    cost: 0.0,
                    from_cache: true,
                })
                .await;
                continue;
            }

            budget.reset_files();
            let (files, skipped) = admit_files(&scope.files, &mut budget);
            self.emit(ReviewEvent::DomainStarted {
                domain: domain_name.clone(),
                files: files.len(),
            })
            .await;

            let request = DomainAnalysisRequest {
                domain,
                stack: self.config.stack.clone(),
                project_dir: self.project_dir.clone(),
                files,
                allowance: budget.allowance(),
            };
            let file_count = request.files.len();

            match self.provider.analyze(request).await {
                Ok(mut result) => {
                    result.domain = domain_name.clone();
                    result.from_cache = false;
                    result.files_analyzed = file_count;
                    result.skipped.extend(skipped);

                    if budget.charge(result.tokens_used, result.cost) == ChargeOutcome::Warn {
                        self.emit(ReviewEvent::BudgetWarning {
                            cost: budget.cost(),
                        })
                        .await;
                    }
                    // Spend is persisted before the cache write; a later cache hit adds none.
                    checkpoint.add_usage(result.tokens_used, result.cost);
                    self.save(&checkpoint)?;
                    if let Err(e) = self.cache.put(&key, &result, Utc::now()) {
                        tracing::warn!(domain = %domain_name, error = %format!("{e:#}"), "failed to write review cache");
                    }

                    let event = ReviewEvent::DomainCompleted {
                        domain: domain_name.clone(),
                        improvements: result.improvements.len(),
                        tokens_used: result.tokens_used,
                        cost: result.cost,
                        from_cache: false,
                    };
                    checkpoint.complete_domain(result);
                    self.save(&checkpoint)?;
                    domains_analyzed += 1;
                    self.emit(event).await;
                }
                Err(e) => {
                    let failure = MasonError::DomainAnalysisFailed {
                        domain: domain_name.clone(),
                        message: format!("{e:#}"),
                    };
                    tracing::warn!("{failure}");
                    checkpoint.record_failure(&domain_name, &format!("{e:#}"));
                    self.save(&checkpoint)?;
                    if let Some(recorded) = checkpoint.failures.last() {
                        failures.push(recorded.clone());
                    }
                    self.emit(ReviewEvent::DomainFailed {
                        domain: domain_name,
                        message: format!("{e:#}"),
                    })
                    .await;
                }
            }
        }

        let status = if checkpoint.pending_domains.is_empty() {
            ReviewStatus::Completed
        } else if budget.is_exceeded() {
            let exceeded = MasonError::BudgetExceeded {
                tokens_used: budget.tokens_used(),
                cost: budget.cost(),
            };
            tracing::warn!("{exceeded}; keeping partial results");
            ReviewStatus::BudgetExceeded
        } else {
            ReviewStatus::Partial
        };

        let (item_ids, duplicates_skipped) =
            self.persist_backlog(&checkpoint, &file_hashes).await?;

        if status == ReviewStatus::Completed {
            checkpoint.mark(CheckpointStatus::Completed);
            self.save(&checkpoint)?;
            self.checkpoints
                .archive(&checkpoint)
                .map_err(MasonError::storage)?;
        }

        let outcome = ReviewOutcome {
            status,
            checkpoint_id: checkpoint.id.clone(),
            resumed,
            domains_analyzed,
            cache_hits,
            tokens_used: budget.tokens_used().saturating_sub(tokens_before),
            cost: (budget.cost() - cost_before).max(0.0),
            item_ids,
            duplicates_skipped,
            pending_domains: checkpoint.pending_domains.clone(),
            failures,
        };
        tracing::info!(
            status = %outcome.status,
            items = outcome.item_ids.len(),
            tokens = outcome.tokens_used,
            cost = outcome.cost,
            "review finished"
        );
        self.emit(ReviewEvent::ReviewCompleted {
            outcome: Box::new(outcome.clone()),
        })
        .await;
        Ok(outcome)
    }

    /// Rank, dedupe, and store every improvement held by the checkpoint.
    ///
    /// Titles already present in the backlog are skipped, so persisting the
    /// same checkpoint twice adds nothing.
    async fn persist_backlog(
        &self,
        checkpoint: &ReviewCheckpoint,
        file_hashes: &FileHashes,
    ) -> MasonResult<(Vec<i64>, usize)> {
        let found: Vec<Improvement> = checkpoint
            .partial_results
            .iter()
            .flat_map(|r| r.improvements.iter().cloned())
            .collect();
        let total = found.len();

        let existing: HashSet<String> = self
            .backlog
            .list_items(None)
            .await
            .map_err(MasonError::storage)?
            .iter()
            .map(|item| normalize_title(&item.title))
            .collect();

        let mut discovered: Vec<Discovered> = dedup_improvements(found)
            .into_iter()
            .filter(|imp| !existing.contains(&imp.dedup_key()))
            .enumerate()
            .map(|(order, improvement)| Discovered {
                order: order as i64,
                improvement,
            })
            .collect();
        rank(&mut discovered);
        let duplicates = total - discovered.len();

        if discovered.is_empty() {
            return Ok((Vec::new(), duplicates));
        }

        let base = self
            .backlog
            .next_discovery_order()
            .await
            .map_err(MasonError::storage)?;
        let items: Vec<BacklogItem> = discovered
            .iter()
            .map(|d| BacklogItem::from_improvement(&d.improvement, file_hashes, base + d.order))
            .collect();
        let ids = self
            .backlog
            .insert_items(items)
            .await
            .map_err(MasonError::storage)?;
        Ok((ids, duplicates))
    }
}

/// Split the scope into files handed to a domain and files skipped.
fn admit_files(files: &[ScopeFile], budget: &mut BudgetTracker) -> (Vec<ScopeFile>, Vec<FileSkip>) {
    let max_size = budget.limits().max_file_size;
    let mut admitted = Vec::new();
    let mut skipped = Vec::new();
    for file in files {
        if file.size > max_size {
            skipped.push(FileSkip::too_large(&file.path));
        } else if budget.reserve_files(1) == 0 {
            skipped.push(FileSkip::file_limit(&file.path));
        } else {
            admitted.push(file.clone());
        }
    }
    (admitted, skipped)
}
