//! Price integrity auditing over stored works and their price history.
//!
//! Detection is pure ([`audit_work`]); [`PriceAuditor`] only gathers records
//! from the stores and folds the findings into an [`AuditRun`].

mod repair;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use wrr_core::{discounted_price, is_valid_discount_rate, PriceHistoryEntry, Work};
use wrr_storage::{StoreError, StoreHandles};

pub use repair::{
    estimate_price_by_majority, FixResult, FixStatus, FixValue, PriceRepairer, RepairConfig,
    RepairSummary,
};

pub const CRATE_NAME: &str = "wrr-audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    DoubleDiscount,
    PriceInconsistency,
    MissingOfficialPrice,
    InvalidDiscountRate,
    PriceSpike,
    NegativePrice,
}

impl IssueType {
    pub const ALL: [IssueType; 6] = [
        IssueType::DoubleDiscount,
        IssueType::PriceInconsistency,
        IssueType::MissingOfficialPrice,
        IssueType::InvalidDiscountRate,
        IssueType::PriceSpike,
        IssueType::NegativePrice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DoubleDiscount => "double_discount",
            Self::PriceInconsistency => "price_inconsistency",
            Self::MissingOfficialPrice => "missing_official_price",
            Self::InvalidDiscountRate => "invalid_discount_rate",
            Self::PriceSpike => "price_spike",
            Self::NegativePrice => "negative_price",
        }
    }

    /// Whether [`PriceRepairer`] has a correction routine for this type.
    pub fn is_repairable(&self) -> bool {
        matches!(
            self,
            Self::DoubleDiscount | Self::NegativePrice | Self::InvalidDiscountRate
        )
    }

    pub fn fix_recommendation(&self) -> &'static str {
        match self {
            Self::DoubleDiscount => {
                "Derive the sale price from official_price x (1 - discount_rate) instead of re-discounting the listed price, then repair affected works."
            }
            Self::PriceInconsistency => {
                "Review the ingest run that produced the record and recompute the price history."
            }
            Self::MissingOfficialPrice => {
                "Backfill official_price from the listing detail payload while the sale is active."
            }
            Self::InvalidDiscountRate => "Validate and sanitize discount_rate at ingest time.",
            Self::PriceSpike => "Investigate the cause of the price jump and correct the history entries.",
            Self::NegativePrice => "Critical: correct the price immediately.",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown issue type `{0}`")]
pub struct UnknownIssueType(pub String);

impl FromStr for IssueType {
    type Err = UnknownIssueType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| UnknownIssueType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// High and critical issues are the ones queued for repair.
    pub fn needs_fix(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceIssue {
    pub work_id: String,
    pub issue_type: IssueType,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_price: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_price: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub official_price: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_dates: Vec<NaiveDate>,
}

impl PriceIssue {
    fn new(work: &Work, issue_type: IssueType, severity: Severity, description: String) -> Self {
        Self {
            work_id: work.product_id.clone(),
            issue_type,
            severity,
            description,
            current_price: None,
            expected_price: None,
            discount_rate: None,
            official_price: None,
            affected_dates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Most recent history entries inspected per work.
    pub history_window: usize,
    pub spike_threshold: f64,
    pub discount_rate_tolerance: f64,
    pub price_tolerance: i64,
    pub report_top_n: usize,
    pub progress_every: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            history_window: 30,
            spike_threshold: 0.5,
            discount_rate_tolerance: 0.05,
            price_tolerance: 1,
            report_top_n: 10,
            progress_every: 100,
        }
    }
}

impl AuditConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            history_window: std::env::var("WRR_AUDIT_HISTORY_WINDOW")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .filter(|window: &usize| *window > 0)
                .unwrap_or(defaults.history_window),
            ..defaults
        }
    }
}

/// Runs every detector against one work. `history` must be ordered newest first.
pub fn audit_work(work: &Work, history: &[PriceHistoryEntry], config: &AuditConfig) -> Vec<PriceIssue> {
    let mut issues = Vec::new();
    check_current_price(work, config, &mut issues);

    let window = &history[..history.len().min(config.history_window)];
    check_price_spikes(work, window, config, &mut issues);
    check_latest_history(work, window, config, &mut issues);

    check_discount_logic(work, config, &mut issues);
    issues
}

fn check_current_price(work: &Work, config: &AuditConfig, issues: &mut Vec<PriceIssue>) {
    let current = work.price.current;

    if current < 0 {
        let mut issue = PriceIssue::new(
            work,
            IssueType::NegativePrice,
            Severity::Critical,
            format!("price is negative: {current}"),
        );
        issue.current_price = Some(current);
        issues.push(issue);
    }

    if let Some(rate) = work.discount_rate.filter(|rate| !is_valid_discount_rate(*rate)) {
        let mut issue = PriceIssue::new(
            work,
            IssueType::InvalidDiscountRate,
            Severity::High,
            format!("discount rate out of range: {}%", rate * 100.0),
        );
        issue.discount_rate = Some(rate);
        issue.current_price = Some(current);
        issues.push(issue);
    }

    if let (Some(rate), Some(official)) = (repricing_rate(work), work.positive_official_price()) {
        if current != 0 {
            let expected = discounted_price(official, rate);
            if (current - expected).abs() > config.price_tolerance {
                let mut issue = PriceIssue::new(
                    work,
                    IssueType::DoubleDiscount,
                    Severity::High,
                    format!("discount looks applied twice: expected {expected}, found {current}"),
                );
                issue.current_price = Some(current);
                issue.expected_price = Some(expected);
                issue.discount_rate = Some(rate);
                issue.official_price = Some(official);
                issues.push(issue);
            }
        }
    }

    if let Some(rate) = active_rate(work) {
        if work.positive_official_price().is_none() {
            let mut issue = PriceIssue::new(
                work,
                IssueType::MissingOfficialPrice,
                Severity::Medium,
                "discount is active but official_price is not set".to_string(),
            );
            issue.current_price = Some(current);
            issue.discount_rate = Some(rate);
            issues.push(issue);
        }
    }
}

fn active_rate(work: &Work) -> Option<f64> {
    work.discount_rate.filter(|rate| *rate > 0.0)
}

/// Active discount rate that can price a work from its official price.
/// Out-of-range rates are left to the invalid rate check.
pub(crate) fn repricing_rate(work: &Work) -> Option<f64> {
    active_rate(work).filter(|rate| is_valid_discount_rate(*rate))
}

fn check_price_spikes(
    work: &Work,
    history: &[PriceHistoryEntry],
    config: &AuditConfig,
    issues: &mut Vec<PriceIssue>,
) {
    for pair in history.windows(2) {
        let (newer, older) = (&pair[0], &pair[1]);
        if older.regular_price == 0 {
            continue;
        }
        let change = (newer.regular_price - older.regular_price).abs() as f64
            / older.regular_price as f64;
        if change > config.spike_threshold {
            let mut issue = PriceIssue::new(
                work,
                IssueType::PriceSpike,
                Severity::Medium,
                format!(
                    "sudden price change: {} -> {} ({}%)",
                    older.regular_price,
                    newer.regular_price,
                    (change * 100.0).round()
                ),
            );
            issue.current_price = Some(newer.regular_price);
            issue.expected_price = Some(older.regular_price);
            issue.affected_dates = vec![newer.date, older.date];
            issues.push(issue);
        }
    }
}

fn check_latest_history(
    work: &Work,
    history: &[PriceHistoryEntry],
    config: &AuditConfig,
    issues: &mut Vec<PriceIssue>,
) {
    let current = work.price.current;
    let Some(latest) = history.first() else {
        return;
    };
    if current == 0 || (latest.regular_price - current).abs() <= config.price_tolerance {
        return;
    }
    let mut issue = PriceIssue::new(
        work,
        IssueType::PriceInconsistency,
        Severity::Low,
        format!(
            "current price {current} differs from latest history price {}",
            latest.regular_price
        ),
    );
    issue.current_price = Some(current);
    issue.expected_price = Some(latest.regular_price);
    issue.affected_dates = vec![latest.date];
    issues.push(issue);
}

fn check_discount_logic(work: &Work, config: &AuditConfig, issues: &mut Vec<PriceIssue>) {
    let current = work.price.current;
    let (Some(rate), Some(official)) = (repricing_rate(work), work.positive_official_price()) else {
        return;
    };
    if current == 0 {
        return;
    }
    let actual = (official - current) as f64 / official as f64;
    if (actual - rate).abs() > config.discount_rate_tolerance {
        let mut issue = PriceIssue::new(
            work,
            IssueType::PriceInconsistency,
            Severity::Medium,
            format!(
                "actual discount {}% differs from reported discount {}%",
                (actual * 100.0).round(),
                (rate * 100.0).round()
            ),
        );
        issue.current_price = Some(current);
        issue.official_price = Some(official);
        issue.discount_rate = Some(rate);
        issues.push(issue);
    }
}

/// Scans every stored work.
pub struct PriceAuditor {
    stores: StoreHandles,
    config: AuditConfig,
}

impl PriceAuditor {
    pub fn new(stores: StoreHandles, config: AuditConfig) -> Self {
        Self { stores, config }
    }

    /// Fails only when the work listing itself cannot be read.
    pub async fn check_all_works(&self) -> Result<AuditRun, StoreError> {
        let works = self.stores.works.list_works().await?;
        let total = works.len();
        info!(total, "price audit started");

        let mut issues = Vec::new();
        for (index, work) in works.iter().enumerate() {
            let history = match self
                .stores
                .price_history
                .recent_price_history(&work.product_id, self.config.history_window)
                .await
            {
                Ok(history) => history,
                Err(err) => {
                    warn!(work_id = %work.product_id, error = %err, "price history unavailable; history checks skipped");
                    Vec::new()
                }
            };
            issues.extend(audit_work(work, &history, &self.config));

            let checked = index + 1;
            if self.config.progress_every > 0 && checked % self.config.progress_every == 0 {
                info!(checked, total, percent = checked * 100 / total, "audit progress");
            }
        }

        info!(checked = total, issues = issues.len(), "price audit finished");
        Ok(AuditRun {
            checked_works: total,
            issues,
            report_top_n: self.config.report_top_n,
        })
    }
}

/// Findings of one full scan.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRun {
    pub checked_works: usize,
    pub issues: Vec<PriceIssue>,
    pub report_top_n: usize,
}

impl AuditRun {
    pub fn generate_report(&self) -> AuditReport {
        let urgent: Vec<&PriceIssue> = self
            .issues
            .iter()
            .filter(|issue| issue.severity.needs_fix())
            .collect();
        AuditReport {
            checked_works: self.checked_works,
            total_issues: self.issues.len(),
            by_type: ranked(self.count_by(|issue| issue.issue_type)),
            by_severity: ranked(self.count_by(|issue| issue.severity)),
            top_issues: urgent
                .iter()
                .take(self.report_top_n)
                .map(|issue| (*issue).clone())
                .collect(),
            omitted: urgent.len().saturating_sub(self.report_top_n),
        }
    }

    /// Distinct ids of works with high or critical issues, in first-seen order.
    pub fn works_needing_fix(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for issue in self.issues.iter().filter(|i| i.severity.needs_fix()) {
            if !ids.contains(&issue.work_id) {
                ids.push(issue.work_id.clone());
            }
        }
        ids
    }

    pub fn export_detailed_report(&self, generated_at: DateTime<Utc>) -> DetailedReport {
        DetailedReport {
            metadata: ReportMetadata {
                generated_at,
                checked_works: self.checked_works,
                total_issues: self.issues.len(),
            },
            summary: ReportSummary {
                issue_types: self.count_by(|issue| issue.issue_type),
                severities: self.count_by(|issue| issue.severity),
            },
            issues: self.issues.clone(),
            fix_recommendations: IssueType::ALL
                .into_iter()
                .map(|kind| (kind, kind.fix_recommendation().to_string()))
                .collect(),
        }
    }

    fn count_by<K: Ord>(&self, key: impl Fn(&PriceIssue) -> K) -> BTreeMap<K, usize> {
        let mut counts = BTreeMap::new();
        for issue in &self.issues {
            *counts.entry(key(issue)).or_insert(0) += 1;
        }
        counts
    }
}

/// Count descending, then name ascending.
fn ranked<K: fmt::Display>(counts: BTreeMap<K, usize>) -> Vec<(K, usize)> {
    let mut rows: Vec<(K, usize)> = counts.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.to_string().cmp(&b.0.to_string())));
    rows
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditReport {
    pub checked_works: usize,
    pub total_issues: usize,
    pub by_type: Vec<(IssueType, usize)>,
    pub by_severity: Vec<(Severity, usize)>,
    pub top_issues: Vec<PriceIssue>,
    pub omitted: usize,
}

impl fmt::Display for AuditReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(80);
        writeln!(f, "{rule}")?;
        writeln!(f, "Price data audit report")?;
        writeln!(f, "{rule}")?;
        writeln!(f, "Checked works: {}", self.checked_works)?;
        writeln!(f, "Issues found: {}", self.total_issues)?;

        writeln!(f, "\nBy issue type:")?;
        for (kind, count) in &self.by_type {
            writeln!(f, "  {kind}: {count}")?;
        }
        writeln!(f, "\nBy severity:")?;
        for (severity, count) in &self.by_severity {
            writeln!(f, "  {severity}: {count}")?;
        }

        writeln!(f, "\nHigh/critical issues:")?;
        if self.top_issues.is_empty() {
            writeln!(f, "  none")?;
        }
        for (index, issue) in self.top_issues.iter().enumerate() {
            writeln!(
                f,
                "  {}. [{}] {} ({})",
                index + 1,
                issue.severity.as_str().to_uppercase(),
                issue.work_id,
                issue.issue_type
            )?;
            writeln!(f, "     {}", issue.description)?;
            if let Some(current) = issue.current_price {
                writeln!(f, "     current price: {current}")?;
            }
            if let Some(expected) = issue.expected_price {
                writeln!(f, "     expected price: {expected}")?;
            }
        }
        if self.omitted > 0 {
            writeln!(f, "  ... {} more", self.omitted)?;
        }
        write!(f, "{rule}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailedReport {
    pub metadata: ReportMetadata,
    pub summary: ReportSummary,
    pub issues: Vec<PriceIssue>,
    pub fix_recommendations: BTreeMap<IssueType, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportMetadata {
    pub generated_at: DateTime<Utc>,
    pub checked_works: usize,
    pub total_issues: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub issue_types: BTreeMap<IssueType, usize>,
    pub severities: BTreeMap<Severity, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use wrr_core::{SalesStatus, WorkPrice};
    use wrr_storage::{HistoryAmendment, InMemoryStore, PriceHistoryStore, WorkStore};

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

    fn kinds(issues: &[PriceIssue]) -> Vec<(IssueType, Severity)> {
        issues.iter().map(|i| (i.issue_type, i.severity)).collect()
    }

    #[test]
    fn double_discount_reports_expected_sale_price() {
        let issues = audit_work(&work("RJ1", 750, Some(1000), Some(0.2)), &[], &AuditConfig::default());
        let double = issues
            .iter()
            .find(|i| i.issue_type == IssueType::DoubleDiscount)
            .expect("double discount flagged");
        assert_eq!(double.severity, Severity::High);
        assert_eq!(double.current_price, Some(750));
        assert_eq!(double.expected_price, Some(800));
        assert_eq!(double.official_price, Some(1000));

        let correct = audit_work(&work("RJ2", 800, Some(1000), Some(0.2)), &[], &AuditConfig::default());
        assert!(correct.is_empty());
    }

    #[test]
    fn spike_detection_uses_adjacent_entries() {
        let config = AuditConfig::default();
        let spiking = vec![
            PriceHistoryEntry::new(day(2), 1600, None),
            PriceHistoryEntry::new(day(1), 1000, None),
        ];
        let issues = audit_work(&work("RJ1", 1600, None, None), &spiking, &config);
        assert_eq!(kinds(&issues), vec![(IssueType::PriceSpike, Severity::Medium)]);
        assert_eq!(issues[0].affected_dates, vec![day(2), day(1)]);
        assert_eq!(issues[0].expected_price, Some(1000));

        let moderate = vec![
            PriceHistoryEntry::new(day(2), 1400, None),
            PriceHistoryEntry::new(day(1), 1000, None),
        ];
        assert!(audit_work(&work("RJ1", 1400, None, None), &moderate, &config).is_empty());

        let from_zero = vec![
            PriceHistoryEntry::new(day(2), 1000, None),
            PriceHistoryEntry::new(day(1), 0, None),
        ];
        assert!(audit_work(&work("RJ1", 1000, None, None), &from_zero, &config).is_empty());
    }

    #[test]
    fn history_window_limits_spike_scan() {
        let history = vec![
            PriceHistoryEntry::new(day(3), 1000, None),
            PriceHistoryEntry::new(day(2), 1000, None),
            PriceHistoryEntry::new(day(1), 100, None),
        ];
        let narrow = AuditConfig {
            history_window: 2,
            ..AuditConfig::default()
        };
        assert!(audit_work(&work("RJ1", 1000, None, None), &history, &narrow).is_empty());
        assert_eq!(
            kinds(&audit_work(&work("RJ1", 1000, None, None), &history, &AuditConfig::default())),
            vec![(IssueType::PriceSpike, Severity::Medium)]
        );
    }

    #[test]
    fn corrupt_fields_get_their_severity() {
        let config = AuditConfig::default();
        assert_eq!(
            kinds(&audit_work(&work("RJ1", -100, None, None), &[], &config)),
            vec![(IssueType::NegativePrice, Severity::Critical)]
        );
        assert_eq!(
            kinds(&audit_work(&work("RJ1", 1000, None, Some(1.5)), &[], &config)),
            vec![
                (IssueType::InvalidDiscountRate, Severity::High),
                (IssueType::MissingOfficialPrice, Severity::Medium),
            ]
        );
        assert_eq!(
            kinds(&audit_work(&work("RJ1", 800, None, Some(0.2)), &[], &config)),
            vec![(IssueType::MissingOfficialPrice, Severity::Medium)]
        );
    }

    #[test]
    fn inconsistencies_against_rate_and_latest_history() {
        let config = AuditConfig::default();
        let issues = audit_work(&work("RJ1", 500, Some(1000), Some(0.2)), &[], &config);
        assert_eq!(
            kinds(&issues),
            vec![
                (IssueType::DoubleDiscount, Severity::High),
                (IssueType::PriceInconsistency, Severity::Medium),
            ]
        );

        let history = vec![PriceHistoryEntry::new(day(1), 1200, None)];
        let issues = audit_work(&work("RJ1", 1000, None, None), &history, &config);
        assert_eq!(kinds(&issues), vec![(IssueType::PriceInconsistency, Severity::Low)]);
        assert_eq!(issues[0].expected_price, Some(1200));
        assert_eq!(issues[0].affected_dates, vec![day(1)]);

        let free = audit_work(&work("RJ1", 0, None, None), &history, &config);
        assert!(free.is_empty());
    }

    #[test]
    fn out_of_range_rate_is_not_repriced() {
        let config = AuditConfig::default();
        let issues = audit_work(&work("RJ1", 1000, Some(1000), Some(1.5)), &[], &config);
        assert_eq!(
            kinds(&issues),
            vec![(IssueType::InvalidDiscountRate, Severity::High)]
        );
        assert!(issues.iter().all(|issue| issue.expected_price.is_none()));
    }

    #[test]
    fn issue_type_parses_its_wire_name() {
        assert_eq!("double_discount".parse::<IssueType>(), Ok(IssueType::DoubleDiscount));
        assert!("triple_discount".parse::<IssueType>().is_err());
        assert!(IssueType::NegativePrice.is_repairable());
        assert!(!IssueType::PriceSpike.is_repairable());
    }

    async fn seeded_store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store
            .save_works(&[
                work("RJ1", 750, Some(1000), Some(0.2)),
                work("RJ2", -10, None, Some(1.5)),
                work("RJ3", 1000, None, None),
                work("RJ4", 1600, None, None),
            ])
            .await
            .expect("seed works");
        for entry in [
            PriceHistoryEntry::new(day(1), 1000, None),
            PriceHistoryEntry::new(day(2), 1600, None),
        ] {
            store.save_price_history("RJ4", &entry).await.expect("seed history");
        }
        store
    }

    #[tokio::test]
    async fn full_scan_aggregates_counts_and_fix_queue() {
        let store = seeded_store().await;
        let auditor = PriceAuditor::new(StoreHandles::from_shared(store), AuditConfig::default());
        let run = auditor.check_all_works().await.expect("audit");

        assert_eq!(run.checked_works, 4);
        assert_eq!(run.works_needing_fix(), vec!["RJ1", "RJ2"]);

        let report = run.generate_report();
        assert_eq!(report.total_issues, 5);
        assert_eq!(report.by_severity[0], (Severity::High, 2));
        assert_eq!(report.top_issues.len(), 3);
        assert_eq!(report.omitted, 0);
        let rendered = report.to_string();
        assert!(rendered.contains("Checked works: 4"));
        assert!(rendered.contains("[CRITICAL] RJ2 (negative_price)"));
        assert!(rendered.contains("expected price: 800"));
    }

    #[tokio::test]
    async fn report_truncates_urgent_issue_listing() {
        let store = Arc::new(InMemoryStore::new());
        let works: Vec<Work> = (1..=13)
            .map(|n| work(&format!("RJ{n:02}"), -1, None, None))
            .collect();
        store.save_works(&works).await.expect("seed");
        let auditor = PriceAuditor::new(StoreHandles::from_shared(store), AuditConfig::default());

        let report = auditor.check_all_works().await.expect("audit").generate_report();
        assert_eq!(report.top_issues.len(), 10);
        assert_eq!(report.omitted, 3);
        assert!(report.to_string().contains("... 3 more"));
    }

    #[tokio::test]
    async fn detailed_report_serializes_summary_and_guidance() {
        let store = seeded_store().await;
        let auditor = PriceAuditor::new(StoreHandles::from_shared(store), AuditConfig::default());
        let run = auditor.check_all_works().await.expect("audit");
        let generated_at = Utc.with_ymd_and_hms(2025, 7, 1, 9, 0, 0).single().expect("timestamp");

        let value = serde_json::to_value(run.export_detailed_report(generated_at)).expect("json");
        assert_eq!(value["metadata"]["checked_works"], 4);
        assert_eq!(value["metadata"]["total_issues"], 5);
        assert_eq!(value["summary"]["issue_types"]["double_discount"], 1);
        assert_eq!(value["summary"]["severities"]["critical"], 1);
        assert_eq!(value["issues"][0]["work_id"], "RJ1");
        assert_eq!(value["issues"][0]["expected_price"], 800);
        assert_eq!(
            value["fix_recommendations"]
                .as_object()
                .expect("recommendations")
                .len(),
            6
        );
    }

    struct BrokenHistory;

    #[async_trait]
    impl PriceHistoryStore for BrokenHistory {
        async fn save_price_history(&self, _: &str, _: &PriceHistoryEntry) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("history offline".into()))
        }

        async fn recent_price_history(&self, _: &str, _: usize) -> Result<Vec<PriceHistoryEntry>, StoreError> {
            Err(StoreError::Unavailable("history offline".into()))
        }

        async fn update_latest_discount_price(
            &self,
            _: &str,
            _: i64,
        ) -> Result<Option<HistoryAmendment>, StoreError> {
            Err(StoreError::Unavailable("history offline".into()))
        }
    }

    #[tokio::test]
    async fn history_failures_only_skip_history_checks() {
        let store = seeded_store().await;
        let mut handles = StoreHandles::from_shared(store);
        handles.price_history = Arc::new(BrokenHistory);
        let run = PriceAuditor::new(handles, AuditConfig::default())
            .check_all_works()
            .await
            .expect("audit");

        assert_eq!(run.checked_works, 4);
        assert!(run.issues.iter().all(|i| i.issue_type != IssueType::PriceSpike));
        assert!(run.issues.iter().any(|i| i.issue_type == IssueType::DoubleDiscount));
    }
}
