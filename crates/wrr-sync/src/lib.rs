//! Change detection, fan-out store updates and throttled batch processing for ingested works.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};
use wrr_core::Work;
use wrr_ingest::{best_effort_work_id, price_history_entry, RawWorkPayload, WorkMapper};
use wrr_storage::{StoreError, StoreHandles};

pub const CRATE_NAME: &str = "wrr-sync";

/// Error prefix for failures that happen before any store is touched.
pub const PIPELINE_ERROR_LABEL: &str = "統合処理エラー";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    /// Star difference above which a rating change counts as significant.
    pub rating_change_threshold: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            chunk_delay: Duration::from_millis(100),
            rating_change_threshold: 1.0,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chunk_size: std::env::var("WRR_BATCH_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .filter(|size: &usize| *size > 0)
                .unwrap_or(defaults.chunk_size),
            chunk_delay: std::env::var("WRR_BATCH_DELAY_MS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.chunk_delay),
            rating_change_threshold: std::env::var("WRR_RATING_THRESHOLD")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .filter(|t: &f64| t.is_finite() && *t >= 0.0)
                .unwrap_or(defaults.rating_change_threshold),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingOptions {
    pub force_update: bool,
    pub skip_price_history: bool,
}

/// Which sub-systems must be written (or, inside a result, were written) this cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub work: bool,
    pub circle: bool,
    pub creators: bool,
    pub price_history: bool,
}

impl ChangeSet {
    pub fn all() -> Self {
        Self {
            work: true,
            circle: true,
            creators: true,
            price_history: true,
        }
    }

    pub fn any(&self) -> bool {
        self.work || self.circle || self.creators || self.price_history
    }

    pub fn get(&self, subsystem: Subsystem) -> bool {
        match subsystem {
            Subsystem::Work => self.work,
            Subsystem::Circle => self.circle,
            Subsystem::Creators => self.creators,
            Subsystem::PriceHistory => self.price_history,
        }
    }

    fn set(&mut self, subsystem: Subsystem, value: bool) {
        match subsystem {
            Subsystem::Work => self.work = value,
            Subsystem::Circle => self.circle = value,
            Subsystem::Creators => self.creators = value,
            Subsystem::PriceHistory => self.price_history = value,
        }
    }
}

/// Compares a freshly mapped work against the stored one.
///
/// Without a stored record every sub-system is flagged. Circle and creator
/// membership are only written on first store (or a forced update).
pub fn detect_changes(incoming: &Work, stored: Option<&Work>, config: &SyncConfig) -> ChangeSet {
    let Some(stored) = stored else {
        debug!(work_id = %incoming.product_id, "no stored record; full write");
        return ChangeSet::all();
    };
    let work_id = incoming.product_id.as_str();
    let mut changes = ChangeSet::default();

    if stored.title != incoming.title {
        info!(work_id, "title changed");
        changes.work = true;
    }

    if stored.sales_status != incoming.sales_status {
        if !stored.sales_status.is_sold_out && incoming.sales_status.is_sold_out {
            info!(work_id, "work sold out");
        } else {
            info!(
                work_id,
                was_on_sale = stored.sales_status.is_sale,
                on_sale = incoming.sales_status.is_sale,
                "sales status changed"
            );
        }
        changes.work = true;
    }

    let (old_stars, new_stars) = (stored.stars(), incoming.stars());
    if (new_stars - old_stars).abs() > config.rating_change_threshold {
        info!(work_id, old_stars, new_stars, "rating changed");
        changes.work = true;
    }

    if incoming.genres.iter().any(|genre| !stored.genres.contains(genre)) {
        info!(work_id, "genre added");
        changes.work = true;
    }

    if stored.price.current != incoming.price.current {
        info!(
            work_id,
            old_price = stored.price.current,
            new_price = incoming.price.current,
            "price changed"
        );
        changes.work = true;
        changes.price_history = true;
    }

    if !changes.any() {
        debug!(work_id, "no significant changes");
    }
    changes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Work,
    Circle,
    Creators,
    PriceHistory,
}

impl Subsystem {
    pub const ALL: [Subsystem; 4] = [
        Subsystem::Work,
        Subsystem::Circle,
        Subsystem::Creators,
        Subsystem::PriceHistory,
    ];

    pub fn error_label(&self) -> &'static str {
        match self {
            Self::Work => "Work更新エラー",
            Self::Circle => "Circle更新エラー",
            Self::Creators => "Creator更新エラー",
            Self::PriceHistory => "PriceHistory更新エラー",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubsystemOutcome {
    Skipped,
    Applied,
    /// The write was accepted but the store reported nothing to save.
    NotApplied,
    Failed(String),
}

impl SubsystemOutcome {
    fn from_write(result: Result<bool, StoreError>) -> Self {
        match result {
            Ok(true) => Self::Applied,
            Ok(false) => Self::NotApplied,
            Err(err) => Self::Failed(err.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemOutcomes {
    pub work: SubsystemOutcome,
    pub circle: SubsystemOutcome,
    pub creators: SubsystemOutcome,
    pub price_history: SubsystemOutcome,
}

impl SubsystemOutcomes {
    pub fn get(&self, subsystem: Subsystem) -> &SubsystemOutcome {
        match subsystem {
            Subsystem::Work => &self.work,
            Subsystem::Circle => &self.circle,
            Subsystem::Creators => &self.creators,
            Subsystem::PriceHistory => &self.price_history,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingResult {
    pub success: bool,
    pub work_id: String,
    pub updates: ChangeSet,
    pub errors: Vec<String>,
}

impl ProcessingResult {
    pub fn failed(work_id: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            success: false,
            work_id: work_id.into(),
            updates: ChangeSet::default(),
            errors: vec![format!("{PIPELINE_ERROR_LABEL}: {error}")],
        }
    }
}

/// Merges per-sub-system outcomes into one result.
///
/// Only the primary sub-systems (work, circle, creators) failing together
/// marks the result as unsuccessful.
pub fn reduce_outcomes(work_id: impl Into<String>, outcomes: &SubsystemOutcomes) -> ProcessingResult {
    let mut updates = ChangeSet::default();
    let mut errors = Vec::new();
    for subsystem in Subsystem::ALL {
        match outcomes.get(subsystem) {
            SubsystemOutcome::Applied => updates.set(subsystem, true),
            SubsystemOutcome::Failed(message) => {
                errors.push(format!("{}: {message}", subsystem.error_label()))
            }
            SubsystemOutcome::Skipped | SubsystemOutcome::NotApplied => {}
        }
    }
    let primary_all_failed =
        outcomes.work.is_failed() && outcomes.circle.is_failed() && outcomes.creators.is_failed();
    ProcessingResult {
        success: !primary_all_failed,
        work_id: work_id.into(),
        updates,
        errors,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
}

impl BatchSummary {
    pub fn from_results(results: &[ProcessingResult]) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            succeeded,
            failed: results.len() - succeeded,
            total: results.len(),
        }
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} succeeded ({} failed)",
            self.succeeded, self.total, self.failed
        )
    }
}

/// Maps payloads and fans the resulting writes out to the four stores.
pub struct UnifiedProcessor {
    mapper: Arc<dyn WorkMapper>,
    stores: StoreHandles,
    config: SyncConfig,
}

impl UnifiedProcessor {
    pub fn new(mapper: Arc<dyn WorkMapper>, stores: StoreHandles, config: SyncConfig) -> Self {
        Self {
            mapper,
            stores,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn process(&self, payload: &RawWorkPayload, options: ProcessingOptions) -> ProcessingResult {
        let work = match self.mapper.to_work(payload) {
            Ok(work) => work,
            Err(err) => {
                let work_id = best_effort_work_id(payload);
                warn!(work_id = %work_id, error = %err, "payload mapping failed");
                return ProcessingResult::failed(work_id, err);
            }
        };

        let mut changes = if options.force_update {
            ChangeSet::all()
        } else {
            match self.stores.works.get_work(&work.product_id).await {
                Ok(stored) => detect_changes(&work, stored.as_ref(), &self.config),
                Err(err) => {
                    warn!(work_id = %work.product_id, error = %err, "stored work lookup failed");
                    return ProcessingResult::failed(work.product_id.clone(), err);
                }
            }
        };
        if options.skip_price_history {
            changes.price_history = false;
        }

        let outcomes = self.apply_changes(&work, changes).await;
        let result = reduce_outcomes(work.product_id.clone(), &outcomes);
        if !result.errors.is_empty() {
            warn!(
                work_id = %result.work_id,
                updates = ?result.updates,
                errors = ?result.errors,
                "partial update failure"
            );
        }
        result
    }

    async fn apply_changes(&self, work: &Work, changes: ChangeSet) -> SubsystemOutcomes {
        let work_id = work.product_id.as_str();

        let save_work = async {
            if !changes.work {
                return SubsystemOutcome::Skipped;
            }
            SubsystemOutcome::from_write(
                self.stores
                    .works
                    .save_works(std::slice::from_ref(work))
                    .await
                    .map(|()| true),
            )
        };
        let link_circle = async {
            if !changes.circle {
                return SubsystemOutcome::Skipped;
            }
            SubsystemOutcome::from_write(
                self.stores
                    .circles
                    .update_circle_with_work(
                        &work.circle_id,
                        work_id,
                        &work.circle_name,
                        work.circle_name_en.as_deref(),
                    )
                    .await
                    .map(|_| true),
            )
        };
        let map_creators = async {
            if !changes.creators {
                return SubsystemOutcome::Skipped;
            }
            let outcome = self
                .stores
                .creators
                .update_creator_work_mapping(work_id, &work.circle_id, &work.creators)
                .await;
            if let Ok(update) = &outcome {
                debug!(work_id, added = update.added, removed = update.removed, "creator mapping updated");
            }
            SubsystemOutcome::from_write(outcome.map(|_| true))
        };
        let record_price = async {
            if !changes.price_history {
                return SubsystemOutcome::Skipped;
            }
            let entry = price_history_entry(work, Utc::now().date_naive());
            SubsystemOutcome::from_write(
                self.stores
                    .price_history
                    .save_price_history(work_id, &entry)
                    .await,
            )
        };

        let (work, circle, creators, price_history) =
            tokio::join!(save_work, link_circle, map_creators, record_price);
        SubsystemOutcomes {
            work,
            circle,
            creators,
            price_history,
        }
    }

    /// Processes payloads in chunks, pausing `chunk_delay` between chunks.
    /// Results keep input order.
    pub async fn process_batch(
        &self,
        payloads: &[RawWorkPayload],
        options: ProcessingOptions,
    ) -> Vec<ProcessingResult> {
        let chunk_size = self.config.chunk_size.max(1);
        let chunk_count = payloads.len().div_ceil(chunk_size);
        let mut results = Vec::with_capacity(payloads.len());

        for (index, chunk) in payloads.chunks(chunk_size).enumerate() {
            let chunk_results = join_all(chunk.iter().map(|payload| self.process(payload, options))).await;
            results.extend(chunk_results);
            debug!(chunk = index + 1, chunks = chunk_count, "batch chunk processed");

            if index + 1 < chunk_count && !self.config.chunk_delay.is_zero() {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
        }

        let summary = BatchSummary::from_results(&results);
        info!(
            succeeded = summary.succeeded,
            total = summary.total,
            "batch processing finished: {summary}"
        );
        results
    }
}
