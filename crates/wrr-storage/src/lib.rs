//! Store contracts for the four WRR collections, the in-memory store, and snapshot files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;
use wrr_core::{Circle, Creator, CreatorCredit, CreatorWorkRelation, PriceHistoryEntry, Work};

pub const CRATE_NAME: &str = "wrr-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{collection} record not found: {key}")]
    NotFound {
        collection: &'static str,
        key: String,
    },
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Field-level update applied to a stored work. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkPatch {
    pub price_current: Option<i64>,
    pub discount_rate: Option<f64>,
    pub clear_official_price: bool,
}

impl WorkPatch {
    pub fn set_price(price: i64) -> Self {
        Self {
            price_current: Some(price),
            ..Default::default()
        }
    }

    /// Reset the discount rate; a zero rate also drops the official price.
    pub fn reset_discount(rate: f64) -> Self {
        Self {
            price_current: None,
            discount_rate: Some(rate),
            clear_official_price: rate == 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.price_current.is_none() && self.discount_rate.is_none() && !self.clear_official_price
    }

    pub fn apply_to(&self, work: &mut Work) {
        if let Some(price) = self.price_current {
            work.price.current = price;
        }
        if let Some(rate) = self.discount_rate {
            work.discount_rate = Some(rate);
        }
        if self.clear_official_price {
            work.official_price = None;
        }
        work.updated_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreatorMappingUpdate {
    pub added: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryAmendment {
    pub date: NaiveDate,
    pub old_discount_price: i64,
    pub new_discount_price: i64,
}

#[async_trait]
pub trait WorkStore: Send + Sync {
    async fn get_work(&self, work_id: &str) -> Result<Option<Work>, StoreError>;
    async fn save_works(&self, works: &[Work]) -> Result<(), StoreError>;
    /// All works ordered by product id.
    async fn list_works(&self) -> Result<Vec<Work>, StoreError>;
    async fn update_work(&self, work_id: &str, patch: &WorkPatch) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CircleStore: Send + Sync {
    /// Links `work_id` to the circle, creating the circle on first reference.
    /// Returns whether the work was newly linked.
    async fn update_circle_with_work(
        &self,
        circle_id: &str,
        work_id: &str,
        name: &str,
        name_en: Option<&str>,
    ) -> Result<bool, StoreError>;
    async fn remove_work_from_circle(&self, circle_id: &str, work_id: &str) -> Result<bool, StoreError>;
    async fn circle_work_count(&self, circle_id: &str) -> Result<usize, StoreError>;
    async fn get_circle(&self, circle_id: &str) -> Result<Option<Circle>, StoreError>;
}

#[async_trait]
pub trait CreatorStore: Send + Sync {
    /// Differential update: upserts the given credits and drops relations of
    /// creators no longer credited on `work_id`.
    async fn update_creator_work_mapping(
        &self,
        work_id: &str,
        circle_id: &str,
        credits: &[CreatorCredit],
    ) -> Result<CreatorMappingUpdate, StoreError>;
    async fn works_for_creator(&self, creator_id: &str) -> Result<Vec<CreatorWorkRelation>, StoreError>;
}

#[async_trait]
pub trait PriceHistoryStore: Send + Sync {
    /// Upserts the entry for its date. Returns `false` when an identical entry already exists.
    async fn save_price_history(&self, work_id: &str, entry: &PriceHistoryEntry) -> Result<bool, StoreError>;
    /// Most recent entries first.
    async fn recent_price_history(&self, work_id: &str, limit: usize) -> Result<Vec<PriceHistoryEntry>, StoreError>;
    /// Rewrites `discount_price` of the latest entry when that entry carries one.
    async fn update_latest_discount_price(
        &self,
        work_id: &str,
        price: i64,
    ) -> Result<Option<HistoryAmendment>, StoreError>;
}

/// The four collections as independently injectable handles.
#[derive(Clone)]
pub struct StoreHandles {
    pub works: Arc<dyn WorkStore>,
    pub circles: Arc<dyn CircleStore>,
    pub creators: Arc<dyn CreatorStore>,
    pub price_history: Arc<dyn PriceHistoryStore>,
}

impl StoreHandles {
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: WorkStore + CircleStore + CreatorStore + PriceHistoryStore + 'static,
    {
        Self {
            works: store.clone(),
            circles: store.clone(),
            creators: store.clone(),
            price_history: store,
        }
    }
}

/// Serializable image of an [`InMemoryStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub works: Vec<Work>,
    #[serde(default)]
    pub circles: Vec<Circle>,
    #[serde(default)]
    pub creators: Vec<Creator>,
    #[serde(default)]
    pub price_history: BTreeMap<String, Vec<PriceHistoryEntry>>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    works: RwLock<BTreeMap<String, Work>>,
    circles: RwLock<BTreeMap<String, Circle>>,
    creators: RwLock<BTreeMap<String, Creator>>,
    price_history: RwLock<BTreeMap<String, BTreeMap<NaiveDate, PriceHistoryEntry>>>,
    writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let works = snapshot
            .works
            .into_iter()
            .map(|w| (w.product_id.clone(), w))
            .collect();
        let circles = snapshot
            .circles
            .into_iter()
            .map(|c| (c.circle_id.clone(), c))
            .collect();
        let creators = snapshot
            .creators
            .into_iter()
            .map(|c| (c.creator_id.clone(), c))
            .collect();
        let price_history = snapshot
            .price_history
            .into_iter()
            .map(|(work_id, entries)| {
                (
                    work_id,
                    entries.into_iter().map(|e| (e.date, e)).collect::<BTreeMap<_, _>>(),
                )
            })
            .collect();
        Self {
            works: RwLock::new(works),
            circles: RwLock::new(circles),
            creators: RwLock::new(creators),
            price_history: RwLock::new(price_history),
            writes: AtomicUsize::new(0),
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            works: self.works.read().await.values().cloned().collect(),
            circles: self.circles.read().await.values().cloned().collect(),
            creators: self.creators.read().await.values().cloned().collect(),
            price_history: self
                .price_history
                .read()
                .await
                .iter()
                .map(|(id, entries)| (id.clone(), entries.values().cloned().collect()))
                .collect(),
        }
    }

    /// Number of mutating calls accepted since construction.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkStore for InMemoryStore {
    async fn get_work(&self, work_id: &str) -> Result<Option<Work>, StoreError> {
        Ok(self.works.read().await.get(work_id).cloned())
    }

    async fn save_works(&self, works: &[Work]) -> Result<(), StoreError> {
        if let Some(bad) = works.iter().find(|w| w.product_id.trim().is_empty()) {
            return Err(StoreError::InvalidRecord(format!(
                "work without product id: {}",
                bad.title
            )));
        }
        let now = Utc::now();
        let mut map = self.works.write().await;
        for work in works {
            let mut stored = work.clone();
            stored.updated_at = Some(now);
            map.insert(stored.product_id.clone(), stored);
        }
        self.record_write();
        Ok(())
    }

    async fn list_works(&self) -> Result<Vec<Work>, StoreError> {
        Ok(self.works.read().await.values().cloned().collect())
    }

    async fn update_work(&self, work_id: &str, patch: &WorkPatch) -> Result<(), StoreError> {
        let mut map = self.works.write().await;
        let work = map.get_mut(work_id).ok_or_else(|| StoreError::NotFound {
            collection: "works",
            key: work_id.to_string(),
        })?;
        patch.apply_to(work);
        self.record_write();
        Ok(())
    }
}

#[async_trait]
impl CircleStore for InMemoryStore {
    async fn update_circle_with_work(
        &self,
        circle_id: &str,
        work_id: &str,
        name: &str,
        name_en: Option<&str>,
    ) -> Result<bool, StoreError> {
        if circle_id.trim().is_empty() {
            return Err(StoreError::InvalidRecord(format!(
                "circle id missing for work {work_id}"
            )));
        }
        let now = Utc::now();
        let mut map = self.circles.write().await;
        let circle = map.entry(circle_id.to_string()).or_insert_with(|| Circle {
            circle_id: circle_id.to_string(),
            name: name.to_string(),
            name_en: name_en.map(str::to_string),
            work_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        });

        if circle.name != name {
            debug!(circle_id, old = %circle.name, new = name, "circle renamed");
            circle.name = name.to_string();
        }
        if let Some(name_en) = name_en.filter(|n| !n.is_empty()) {
            circle.name_en = Some(name_en.to_string());
        }

        let linked = if circle.work_ids.iter().any(|id| id == work_id) {
            false
        } else {
            circle.work_ids.push(work_id.to_string());
            true
        };
        circle.updated_at = now;
        self.record_write();
        Ok(linked)
    }

    async fn remove_work_from_circle(&self, circle_id: &str, work_id: &str) -> Result<bool, StoreError> {
        let mut map = self.circles.write().await;
        let Some(circle) = map.get_mut(circle_id) else {
            return Ok(false);
        };
        let before = circle.work_ids.len();
        circle.work_ids.retain(|id| id != work_id);
        if circle.work_ids.len() == before {
            return Ok(false);
        }
        circle.updated_at = Utc::now();
        self.record_write();
        Ok(true)
    }

    async fn circle_work_count(&self, circle_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .circles
            .read()
            .await
            .get(circle_id)
            .map(|c| c.work_ids.len())
            .unwrap_or(0))
    }

    async fn get_circle(&self, circle_id: &str) -> Result<Option<Circle>, StoreError> {
        Ok(self.circles.read().await.get(circle_id).cloned())
    }
}

#[async_trait]
impl CreatorStore for InMemoryStore {
    async fn update_creator_work_mapping(
        &self,
        work_id: &str,
        circle_id: &str,
        credits: &[CreatorCredit],
    ) -> Result<CreatorMappingUpdate, StoreError> {
        if let Some(bad) = credits.iter().find(|c| c.creator_id.trim().is_empty()) {
            return Err(StoreError::InvalidRecord(format!(
                "creator without id credited on {work_id}: {}",
                bad.name
            )));
        }
        let now = Utc::now();
        let mut map = self.creators.write().await;

        for credit in credits {
            let creator = map
                .entry(credit.creator_id.clone())
                .or_insert_with(|| Creator {
                    creator_id: credit.creator_id.clone(),
                    name: credit.name.clone(),
                    works: BTreeMap::new(),
                    created_at: now,
                    updated_at: now,
                });
            creator.name = credit.name.clone();
            creator.updated_at = now;
            creator.works.insert(
                work_id.to_string(),
                CreatorWorkRelation {
                    work_id: work_id.to_string(),
                    roles: credit.roles.clone(),
                    circle_id: circle_id.to_string(),
                    updated_at: now,
                },
            );
        }

        let mut removed = 0;
        for (creator_id, creator) in map.iter_mut() {
            let still_credited = credits.iter().any(|c| &c.creator_id == creator_id);
            if !still_credited && creator.works.remove(work_id).is_some() {
                debug!(creator_id = %creator_id, work_id, "creator mapping removed");
                creator.updated_at = now;
                removed += 1;
            }
        }

        self.record_write();
        Ok(CreatorMappingUpdate {
            added: credits.len(),
            removed,
        })
    }

    async fn works_for_creator(&self, creator_id: &str) -> Result<Vec<CreatorWorkRelation>, StoreError> {
        Ok(self
            .creators
            .read()
            .await
            .get(creator_id)
            .map(|c| c.works.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl PriceHistoryStore for InMemoryStore {
    async fn save_price_history(&self, work_id: &str, entry: &PriceHistoryEntry) -> Result<bool, StoreError> {
        if !entry.is_consistent() {
            return Err(StoreError::InvalidRecord(format!(
                "price history for {work_id} on {}: discount {:?} exceeds regular {}",
                entry.date, entry.discount_price, entry.regular_price
            )));
        }
        let mut map = self.price_history.write().await;
        let series = map.entry(work_id.to_string()).or_default();
        if let Some(existing) = series.get(&entry.date) {
            if existing.regular_price == entry.regular_price
                && existing.discount_price == entry.discount_price
            {
                return Ok(false);
            }
        }
        let mut stored = entry.clone();
        stored.updated_at = Some(Utc::now());
        series.insert(stored.date, stored);
        self.record_write();
        Ok(true)
    }

    async fn recent_price_history(&self, work_id: &str, limit: usize) -> Result<Vec<PriceHistoryEntry>, StoreError> {
        Ok(self
            .price_history
            .read()
            .await
            .get(work_id)
            .map(|series| series.values().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn update_latest_discount_price(
        &self,
        work_id: &str,
        price: i64,
    ) -> Result<Option<HistoryAmendment>, StoreError> {
        let mut map = self.price_history.write().await;
        let Some(latest) = map.get_mut(work_id).and_then(|s| s.values_mut().next_back()) else {
            return Ok(None);
        };
        let Some(old) = latest.discount_price else {
            return Ok(None);
        };
        latest.discount_price = Some(price);
        latest.updated_at = Some(Utc::now());
        self.record_write();
        Ok(Some(HistoryAmendment {
            date: latest.date,
            old_discount_price: old,
            new_discount_price: price,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct SavedSnapshot {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub unchanged: bool,
}

/// JSON snapshot of a store on disk, written via temp file + atomic rename.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Loads the snapshot, or an empty one when the file does not exist yet.
    pub async fn load(&self) -> anyhow::Result<StoreSnapshot> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking snapshot path {}", self.path.display()))?
        {
            return Ok(StoreSnapshot::default());
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }

    pub async fn save(&self, snapshot: &StoreSnapshot) -> anyhow::Result<SavedSnapshot> {
        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing store snapshot")?;
        let content_hash = Self::sha256_hex(&bytes);

        if let Ok(existing) = fs::read(&self.path).await {
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(SavedSnapshot {
                    content_hash,
                    path: self.path.clone(),
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        Ok(SavedSnapshot {
            content_hash,
            path: self.path.clone(),
            byte_size: bytes.len(),
            unchanged: false,
        })
    }
}
