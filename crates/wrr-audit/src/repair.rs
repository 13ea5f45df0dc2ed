use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};
use wrr_core::{discounted_price, is_valid_discount_rate, PriceHistoryEntry};
use wrr_storage::{StoreError, StoreHandles, WorkPatch};

use crate::{repricing_rate, IssueType};

#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Compute and report without writing.
    pub dry_run: bool,
    /// History entries consulted when estimating a replacement price.
    pub estimate_window: usize,
    pub item_delay: Duration,
    pub report_top_n: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            estimate_window: 10,
            item_delay: Duration::from_millis(100),
            report_top_n: 10,
        }
    }
}

impl RepairConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            item_delay: std::env::var("WRR_FIX_DELAY_MS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.item_delay),
            ..defaults
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for FixStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        })
    }
}

/// Field value before or after a fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FixValue {
    Price(i64),
    Rate(f64),
}

impl fmt::Display for FixValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Price(price) => write!(f, "{price}"),
            Self::Rate(rate) => write!(f, "{rate}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FixResult {
    pub work_id: String,
    pub issue_type: IssueType,
    pub status: FixStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<FixValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<FixValue>,
    /// Failure message, or the reason a fix was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FixResult {
    fn new(work_id: &str, issue_type: IssueType, status: FixStatus) -> Self {
        Self {
            work_id: work_id.to_string(),
            issue_type,
            status,
            old_value: None,
            new_value: None,
            error: None,
        }
    }

    fn success(work_id: &str, issue_type: IssueType, old: FixValue, new: FixValue) -> Self {
        Self {
            old_value: Some(old),
            new_value: Some(new),
            ..Self::new(work_id, issue_type, FixStatus::Success)
        }
    }

    fn skipped(work_id: &str, issue_type: IssueType, reason: &str) -> Self {
        Self {
            error: Some(reason.to_string()),
            ..Self::new(work_id, issue_type, FixStatus::Skipped)
        }
    }

    fn failed(work_id: &str, issue_type: IssueType, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(work_id, issue_type, FixStatus::Failed)
        }
    }

    fn with_values(mut self, old: Option<FixValue>, new: Option<FixValue>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }
}

const WORK_NOT_FOUND: &str = "work not found";

/// Most frequent positive price across regular and discount prices.
/// Ties resolve to the lowest price.
pub fn estimate_price_by_majority(history: &[PriceHistoryEntry]) -> Option<i64> {
    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    for entry in history {
        let prices = std::iter::once(entry.regular_price).chain(entry.discount_price);
        for price in prices.filter(|price| *price > 0) {
            *counts.entry(price).or_insert(0) += 1;
        }
    }
    let top = *counts.values().max()?;
    counts
        .into_iter()
        .find(|(_, count)| *count == top)
        .map(|(price, _)| price)
}

/// Issue-specific corrections for stored works. In dry-run mode every
/// routine computes its result but leaves the stores untouched.
pub struct PriceRepairer {
    stores: StoreHandles,
    config: RepairConfig,
}

impl PriceRepairer {
    pub fn new(stores: StoreHandles, config: RepairConfig) -> Self {
        info!(dry_run = config.dry_run, "price repairer ready");
        Self { stores, config }
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Empty summary matching this repairer's mode.
    pub fn summary(&self) -> RepairSummary {
        RepairSummary::new(self.config.dry_run, self.config.report_top_n)
    }

    pub async fn fix_double_discount_issue(&self, work_id: &str) -> FixResult {
        self.try_fix_double_discount(work_id)
            .await
            .unwrap_or_else(|err| store_failure(work_id, IssueType::DoubleDiscount, err))
    }

    async fn try_fix_double_discount(&self, work_id: &str) -> Result<FixResult, StoreError> {
        let kind = IssueType::DoubleDiscount;
        let Some(work) = self.stores.works.get_work(work_id).await? else {
            return Ok(FixResult::failed(work_id, kind, WORK_NOT_FOUND));
        };
        let current = work.price.current;
        let (Some(rate), Some(official)) = (repricing_rate(&work), work.positive_official_price()) else {
            return Ok(FixResult::skipped(work_id, kind, "no active double discount"));
        };
        if current == 0 {
            return Ok(FixResult::skipped(work_id, kind, "no active double discount"));
        }

        let target = discounted_price(official, rate);
        if (current - target).abs() <= 1 {
            return Ok(FixResult::skipped(work_id, kind, "price already correct")
                .with_values(Some(FixValue::Price(current)), Some(FixValue::Price(target))));
        }

        info!(work_id, current, target, official, rate, dry_run = self.config.dry_run, "correcting double discount");
        if !self.config.dry_run {
            self.stores
                .works
                .update_work(work_id, &WorkPatch::set_price(target))
                .await?;
            if let Some(amendment) = self
                .stores
                .price_history
                .update_latest_discount_price(work_id, target)
                .await?
            {
                info!(
                    work_id,
                    date = %amendment.date,
                    old = amendment.old_discount_price,
                    new = amendment.new_discount_price,
                    "latest price history amended"
                );
            }
        }
        Ok(FixResult::success(work_id, kind, FixValue::Price(current), FixValue::Price(target)))
    }

    pub async fn fix_negative_price_issue(&self, work_id: &str) -> FixResult {
        self.try_fix_negative_price(work_id)
            .await
            .unwrap_or_else(|err| store_failure(work_id, IssueType::NegativePrice, err))
    }

    async fn try_fix_negative_price(&self, work_id: &str) -> Result<FixResult, StoreError> {
        let kind = IssueType::NegativePrice;
        let Some(work) = self.stores.works.get_work(work_id).await? else {
            return Ok(FixResult::failed(work_id, kind, WORK_NOT_FOUND));
        };
        let current = work.price.current;
        if current >= 0 {
            return Ok(FixResult::skipped(work_id, kind, "price is not negative")
                .with_values(Some(FixValue::Price(current)), None));
        }

        let history = self
            .stores
            .price_history
            .recent_price_history(work_id, self.config.estimate_window)
            .await?;
        let Some(estimate) = estimate_price_by_majority(&history) else {
            return Ok(FixResult::failed(work_id, kind, "cannot estimate a price from history")
                .with_values(Some(FixValue::Price(current)), None));
        };

        info!(work_id, current, estimate, dry_run = self.config.dry_run, "replacing negative price");
        if !self.config.dry_run {
            self.stores
                .works
                .update_work(work_id, &WorkPatch::set_price(estimate))
                .await?;
        }
        Ok(FixResult::success(work_id, kind, FixValue::Price(current), FixValue::Price(estimate)))
    }

    pub async fn fix_invalid_discount_rate_issue(&self, work_id: &str) -> FixResult {
        self.try_fix_invalid_discount_rate(work_id)
            .await
            .unwrap_or_else(|err| store_failure(work_id, IssueType::InvalidDiscountRate, err))
    }

    async fn try_fix_invalid_discount_rate(&self, work_id: &str) -> Result<FixResult, StoreError> {
        let kind = IssueType::InvalidDiscountRate;
        let Some(work) = self.stores.works.get_work(work_id).await? else {
            return Ok(FixResult::failed(work_id, kind, WORK_NOT_FOUND));
        };
        let Some(rate) = work.discount_rate.filter(|rate| !is_valid_discount_rate(*rate)) else {
            return Ok(FixResult::skipped(work_id, kind, "discount rate is valid")
                .with_values(work.discount_rate.map(FixValue::Rate), None));
        };

        let corrected = 0.0;
        info!(work_id, rate, corrected, dry_run = self.config.dry_run, "resetting invalid discount rate");
        if !self.config.dry_run {
            self.stores
                .works
                .update_work(work_id, &WorkPatch::reset_discount(corrected))
                .await?;
        }
        Ok(FixResult::success(work_id, kind, FixValue::Rate(rate), FixValue::Rate(corrected)))
    }

    /// Runs the fixer for `issue_type`, or `None` when the type has no fixer.
    pub async fn fix(&self, work_id: &str, issue_type: IssueType) -> Option<FixResult> {
        match issue_type {
            IssueType::DoubleDiscount => Some(self.fix_double_discount_issue(work_id).await),
            IssueType::NegativePrice => Some(self.fix_negative_price_issue(work_id).await),
            IssueType::InvalidDiscountRate => Some(self.fix_invalid_discount_rate_issue(work_id).await),
            IssueType::PriceInconsistency | IssueType::MissingOfficialPrice | IssueType::PriceSpike => {
                None
            }
        }
    }

    /// Fixes works one at a time, pausing `item_delay` between them.
    /// Unknown or non-repairable issue types produce no results.
    pub async fn batch_fix(&self, work_ids: &[String], issue_type: &str) -> RepairSummary {
        let kind = issue_type.parse::<IssueType>().ok();
        info!(works = work_ids.len(), issue_type, dry_run = self.config.dry_run, "batch repair started");

        let mut summary = self.summary();
        for (index, work_id) in work_ids.iter().enumerate() {
            if index > 0 && !self.config.item_delay.is_zero() {
                tokio::time::sleep(self.config.item_delay).await;
            }
            let result = match kind {
                Some(kind) => self.fix(work_id, kind).await,
                None => None,
            };
            match result {
                Some(result) => summary.push(result),
                None => warn!(work_id = %work_id, issue_type, "unsupported issue type; skipped"),
            }
        }

        info!(
            success = summary.success_count(),
            failed = summary.failed_count(),
            skipped = summary.skipped_count(),
            "batch repair finished"
        );
        summary
    }
}

fn store_failure(work_id: &str, issue_type: IssueType, err: StoreError) -> FixResult {
    warn!(work_id, %issue_type, error = %err, "repair failed");
    FixResult::failed(work_id, issue_type, err.to_string())
}

/// Accumulated fix results with a console rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairSummary {
    pub dry_run: bool,
    pub report_top_n: usize,
    pub results: Vec<FixResult>,
}

impl RepairSummary {
    pub fn new(dry_run: bool, report_top_n: usize) -> Self {
        Self {
            dry_run,
            report_top_n,
            results: Vec::new(),
        }
    }

    pub fn push(&mut self, result: FixResult) {
        self.results.push(result);
    }

    fn count(&self, status: FixStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn success_count(&self) -> usize {
        self.count(FixStatus::Success)
    }

    pub fn failed_count(&self) -> usize {
        self.count(FixStatus::Failed)
    }

    pub fn skipped_count(&self) -> usize {
        self.count(FixStatus::Skipped)
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }
}

impl fmt::Display for RepairSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(80);
        let mode = if self.dry_run { "DRY RUN" } else { "LIVE" };
        writeln!(f, "{rule}")?;
        writeln!(f, "Price repair report ({mode})")?;
        writeln!(f, "{rule}")?;
        writeln!(f, "Success: {}", self.success_count())?;
        writeln!(f, "Failed: {}", self.failed_count())?;
        writeln!(f, "Skipped: {}", self.skipped_count())?;
        writeln!(f, "Total: {}", self.total())?;

        let failures: Vec<&FixResult> = self
            .results
            .iter()
            .filter(|r| r.status == FixStatus::Failed)
            .collect();
        if !failures.is_empty() {
            writeln!(f, "\nFailed ({}):", failures.len())?;
            for result in failures {
                writeln!(
                    f,
                    "  {}: {}",
                    result.work_id,
                    result.error.as_deref().unwrap_or("unknown error")
                )?;
            }
        }

        let successes: Vec<&FixResult> = self
            .results
            .iter()
            .filter(|r| r.status == FixStatus::Success)
            .collect();
        if !successes.is_empty() {
            writeln!(f, "\nSucceeded ({}):", successes.len())?;
            for result in successes.iter().take(self.report_top_n) {
                writeln!(
                    f,
                    "  {}: {} -> {}",
                    result.work_id,
                    display_or_dash(result.old_value),
                    display_or_dash(result.new_value)
                )?;
            }
            if successes.len() > self.report_top_n {
                writeln!(f, "  ... {} more", successes.len() - self.report_top_n)?;
            }
        }
        write!(f, "{rule}")
    }
}

fn display_or_dash(value: Option<FixValue>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use wrr_core::{SalesStatus, Work, WorkPrice};
    use wrr_storage::{InMemoryStore, PriceHistoryStore, WorkStore};

    fn work(id: &str, current: i64, official: Option<i64>, rate: Option<f64>) -> Work {
        Work {
            product_id: id.to_string(),
            title: format!("work {id}"),
            circle_id: "RG10001".into(),
            circle_name: "circle".into(),
            circle_name_en: None,
            price: WorkPrice { current },
            official_price: official,
            discount_rate: rate,
            sales_status: SalesStatus::default(),
            rating: None,
            genres: vec![],
            creators: vec![],
            updated_at: None,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).expect("date")
    }

    fn live() -> RepairConfig {
        RepairConfig {
            dry_run: false,
            item_delay: Duration::ZERO,
            ..RepairConfig::default()
        }
    }

    async fn store_with(works: &[Work]) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store.save_works(works).await.expect("seed");
        store
    }

    #[test]
    fn majority_vote_prefers_most_frequent_then_lowest_price() {
        let history: Vec<_> = [500, 500, 500, 600]
            .into_iter()
            .enumerate()
            .map(|(i, price)| PriceHistoryEntry::new(day(i as u32 + 1), price, None))
            .collect();
        assert_eq!(estimate_price_by_majority(&history), Some(500));

        let tie = vec![
            PriceHistoryEntry::new(day(1), 600, None),
            PriceHistoryEntry::new(day(2), 500, None),
        ];
        assert_eq!(estimate_price_by_majority(&tie), Some(500));

        let discounts_count = vec![
            PriceHistoryEntry::new(day(1), 1000, Some(700)),
            PriceHistoryEntry::new(day(2), 900, Some(700)),
        ];
        assert_eq!(estimate_price_by_majority(&discounts_count), Some(700));

        assert_eq!(estimate_price_by_majority(&[]), None);
        assert_eq!(
            estimate_price_by_majority(&[PriceHistoryEntry::new(day(1), 0, None)]),
            None
        );
    }

    #[tokio::test]
    async fn double_discount_fix_rewrites_price_and_latest_history() {
        let store = store_with(&[work("RJ1", 750, Some(1000), Some(0.2))]).await;
        store
            .save_price_history("RJ1", &PriceHistoryEntry::new(day(1), 1000, Some(700)))
            .await
            .expect("older");
        store
            .save_price_history("RJ1", &PriceHistoryEntry::new(day(2), 1000, Some(750)))
            .await
            .expect("latest");
        let repairer = PriceRepairer::new(StoreHandles::from_shared(store.clone()), live());

        let result = repairer.fix_double_discount_issue("RJ1").await;
        assert_eq!(result.status, FixStatus::Success);
        assert_eq!(result.old_value, Some(FixValue::Price(750)));
        assert_eq!(result.new_value, Some(FixValue::Price(800)));

        let stored = store.get_work("RJ1").await.expect("get").expect("stored");
        assert_eq!(stored.price.current, 800);
        let history = store.recent_price_history("RJ1", 2).await.expect("history");
        assert_eq!(history[0].discount_price, Some(800));
        assert_eq!(history[1].discount_price, Some(700));

        let again = repairer.fix_double_discount_issue("RJ1").await;
        assert_eq!(again.status, FixStatus::Skipped);
        assert_eq!(again.error.as_deref(), Some("price already correct"));
    }

    #[tokio::test]
    async fn dry_run_computes_fixes_without_writing() {
        let store = store_with(&[
            work("RJ1", 1000, Some(1200), Some(1.5)),
            work("RJ2", 750, Some(1000), Some(0.2)),
        ])
        .await;
        let writes_before = store.write_count();
        let repairer = PriceRepairer::new(
            StoreHandles::from_shared(store.clone()),
            RepairConfig::default(),
        );
        assert!(repairer.is_dry_run());

        let rate = repairer.fix_invalid_discount_rate_issue("RJ1").await;
        assert_eq!(rate.status, FixStatus::Success);
        assert_eq!(rate.old_value, Some(FixValue::Rate(1.5)));
        assert_eq!(rate.new_value, Some(FixValue::Rate(0.0)));

        let price = repairer.fix_double_discount_issue("RJ2").await;
        assert_eq!(price.status, FixStatus::Success);
        assert_eq!(price.new_value, Some(FixValue::Price(800)));

        assert_eq!(store.write_count(), writes_before);
        let untouched = store.get_work("RJ1").await.expect("get").expect("stored");
        assert_eq!(untouched.discount_rate, Some(1.5));
        assert_eq!(untouched.official_price, Some(1200));
    }

    #[tokio::test]
    async fn invalid_rate_fix_drops_official_price() {
        let store = store_with(&[
            work("RJ1", 1000, Some(1200), Some(-0.3)),
            work("RJ2", 1000, None, Some(0.3)),
        ])
        .await;
        let repairer = PriceRepairer::new(StoreHandles::from_shared(store.clone()), live());

        assert_eq!(
            repairer.fix_invalid_discount_rate_issue("RJ1").await.status,
            FixStatus::Success
        );
        let stored = store.get_work("RJ1").await.expect("get").expect("stored");
        assert_eq!(stored.discount_rate, Some(0.0));
        assert_eq!(stored.official_price, None);

        let valid = repairer.fix_invalid_discount_rate_issue("RJ2").await;
        assert_eq!(valid.status, FixStatus::Skipped);
        assert_eq!(valid.old_value, Some(FixValue::Rate(0.3)));
    }

    #[tokio::test]
    async fn negative_price_is_estimated_from_history() {
        let store = store_with(&[work("RJ1", -500, None, None), work("RJ2", -500, None, None)]).await;
        for (d, price) in [(1, 500), (2, 500), (3, 500), (4, 600)] {
            store
                .save_price_history("RJ1", &PriceHistoryEntry::new(day(d), price, None))
                .await
                .expect("history");
        }
        let repairer = PriceRepairer::new(StoreHandles::from_shared(store.clone()), live());

        let fixed = repairer.fix_negative_price_issue("RJ1").await;
        assert_eq!(fixed.status, FixStatus::Success);
        assert_eq!(fixed.new_value, Some(FixValue::Price(500)));
        let stored = store.get_work("RJ1").await.expect("get").expect("stored");
        assert_eq!(stored.price.current, 500);

        let no_history = repairer.fix_negative_price_issue("RJ2").await;
        assert_eq!(no_history.status, FixStatus::Failed);
        assert_eq!(
            no_history.error.as_deref(),
            Some("cannot estimate a price from history")
        );

        assert_eq!(
            repairer.fix_negative_price_issue("RJ1").await.status,
            FixStatus::Skipped
        );
    }

    #[tokio::test]
    async fn out_of_range_rate_blocks_double_discount_fix() {
        let store = store_with(&[work("RJ1", 1000, Some(1000), Some(1.5))]).await;
        let writes_before = store.write_count();
        let repairer = PriceRepairer::new(StoreHandles::from_shared(store.clone()), live());

        let result = repairer.fix_double_discount_issue("RJ1").await;
        assert_eq!(result.status, FixStatus::Skipped);
        assert_eq!(result.new_value, None);
        assert_eq!(store.write_count(), writes_before);
        let stored = store.get_work("RJ1").await.expect("get").expect("stored");
        assert_eq!(stored.price.current, 1000);
    }

    #[tokio::test]
    async fn negative_price_estimate_uses_recent_window_only() {
        let store = store_with(&[work("RJ1", -1, None, None)]).await;
        let mut all = Vec::new();
        for d in 1..=12u32 {
            let price = if d <= 2 || d % 2 == 0 { 600 } else { 500 };
            let entry = PriceHistoryEntry::new(day(d), price, None);
            store.save_price_history("RJ1", &entry).await.expect("history");
            all.push(entry);
        }
        assert_eq!(estimate_price_by_majority(&all), Some(600));

        let repairer = PriceRepairer::new(StoreHandles::from_shared(store.clone()), live());
        let fixed = repairer.fix_negative_price_issue("RJ1").await;
        assert_eq!(fixed.status, FixStatus::Success);
        assert_eq!(fixed.new_value, Some(FixValue::Price(500)));
    }

    #[tokio::test]
    async fn negative_price_dry_run_leaves_store_alone() {
        let store = store_with(&[work("RJ1", -500, None, None)]).await;
        store
            .save_price_history("RJ1", &PriceHistoryEntry::new(day(1), 500, None))
            .await
            .expect("history");
        let writes_before = store.write_count();
        let repairer = PriceRepairer::new(
            StoreHandles::from_shared(store.clone()),
            RepairConfig::default(),
        );

        let result = repairer.fix_negative_price_issue("RJ1").await;
        assert_eq!(result.status, FixStatus::Success);
        assert_eq!(result.new_value, Some(FixValue::Price(500)));
        assert_eq!(store.write_count(), writes_before);
        let stored = store.get_work("RJ1").await.expect("get").expect("stored");
        assert_eq!(stored.price.current, -500);
    }

    #[tokio::test]
    async fn missing_work_and_unmet_preconditions() {
        let store = store_with(&[work("RJ1", 1000, None, None)]).await;
        let repairer = PriceRepairer::new(StoreHandles::from_shared(store), live());

        let missing = repairer.fix_double_discount_issue("RJ404").await;
        assert_eq!(missing.status, FixStatus::Failed);
        assert_eq!(missing.error.as_deref(), Some(WORK_NOT_FOUND));

        let no_discount = repairer.fix_double_discount_issue("RJ1").await;
        assert_eq!(no_discount.status, FixStatus::Skipped);
    }

    struct OfflineWorks;

    #[async_trait]
    impl WorkStore for OfflineWorks {
        async fn get_work(&self, _: &str) -> Result<Option<Work>, StoreError> {
            Err(StoreError::Unavailable("works offline".into()))
        }

        async fn save_works(&self, _: &[Work]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("works offline".into()))
        }

        async fn list_works(&self) -> Result<Vec<Work>, StoreError> {
            Err(StoreError::Unavailable("works offline".into()))
        }

        async fn update_work(&self, _: &str, _: &WorkPatch) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("works offline".into()))
        }
    }

    #[tokio::test]
    async fn store_errors_become_failed_results() {
        let mut handles = StoreHandles::from_shared(Arc::new(InMemoryStore::new()));
        handles.works = Arc::new(OfflineWorks);
        let repairer = PriceRepairer::new(handles, live());

        let result = repairer.fix_negative_price_issue("RJ1").await;
        assert_eq!(result.status, FixStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("store unavailable: works offline"));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_fix_runs_sequentially_with_pauses() {
        let store = store_with(&[
            work("RJ1", 1000, Some(1200), Some(1.5)),
            work("RJ2", 1000, None, Some(0.5)),
        ])
        .await;
        let config = RepairConfig {
            dry_run: false,
            ..RepairConfig::default()
        };
        let repairer = PriceRepairer::new(StoreHandles::from_shared(store), config);
        let ids: Vec<String> = ["RJ1", "RJ2", "RJ404"].into_iter().map(String::from).collect();

        let started = tokio::time::Instant::now();
        let summary = repairer.batch_fix(&ids, "invalid_discount_rate").await;
        assert!(started.elapsed() >= Duration::from_millis(200));

        assert_eq!(summary.total(), 3);
        assert_eq!(summary.success_count(), 1);
        assert_eq!(summary.skipped_count(), 1);
        assert_eq!(summary.failed_count(), 1);
        let rendered = summary.to_string();
        assert!(rendered.contains("Price repair report (LIVE)"));
        assert!(rendered.contains("RJ404: work not found"));
        assert!(rendered.contains("RJ1: 1.5 -> 0"));
    }

    #[tokio::test]
    async fn batch_fix_ignores_unsupported_issue_types() {
        let store = store_with(&[work("RJ1", 1000, None, None)]).await;
        let repairer = PriceRepairer::new(StoreHandles::from_shared(store), live());
        let ids = vec!["RJ1".to_string()];

        assert_eq!(repairer.batch_fix(&ids, "price_spike").await.total(), 0);
        assert_eq!(repairer.batch_fix(&ids, "no_such_issue").await.total(), 0);
    }

    #[test]
    fn summary_lists_first_successes_and_counts_the_rest() {
        let mut summary = RepairSummary::new(true, 2);
        for n in 1..=4 {
            summary.push(FixResult::success(
                &format!("RJ{n}"),
                IssueType::NegativePrice,
                FixValue::Price(-1),
                FixValue::Price(500),
            ));
        }
        let rendered = summary.to_string();
        assert!(rendered.contains("(DRY RUN)"));
        assert!(rendered.contains("RJ2: -1 -> 500"));
        assert!(!rendered.contains("RJ3: -1 -> 500"));
        assert!(rendered.contains("... 2 more"));
    }
}
