//! Ingest mapping: raw marketplace listing payloads into canonical works.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use wrr_core::{
    CreatorCredit, CreatorRole, PriceHistoryEntry, Rating, SalesStatus, Work, WorkPrice,
};

pub const CRATE_NAME: &str = "wrr-ingest";

pub const UNKNOWN_ID: &str = "UNKNOWN";

/// Listing record as published by the marketplace API. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawWorkPayload {
    #[serde(default)]
    pub workno: String,
    #[serde(default)]
    pub work_name: Option<String>,
    #[serde(default)]
    pub maker_id: Option<String>,
    #[serde(default)]
    pub maker_name: Option<String>,
    #[serde(default)]
    pub maker_name_en: Option<String>,
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub official_price: Option<i64>,
    /// Whole percent, e.g. `30` for 30% off.
    #[serde(default)]
    pub discount_rate: Option<f64>,
    #[serde(default)]
    pub sales_status: Option<RawSalesStatus>,
    #[serde(default, alias = "rate_average")]
    pub rate_average_star: Option<f64>,
    #[serde(default)]
    pub rate_count: Option<u32>,
    #[serde(default)]
    pub genres: Vec<RawGenre>,
    #[serde(default)]
    pub creaters: Option<RawCreators>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSalesStatus {
    #[serde(default)]
    pub is_sale: bool,
    #[serde(default)]
    pub is_sold_out: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawGenre {
    #[serde(default)]
    pub name: String,
}

/// The API sends an empty array instead of an object when nobody is credited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawCreators {
    Roles(RawCreatorRoles),
    Empty(Vec<JsonValue>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCreatorRoles {
    #[serde(default)]
    pub voice_by: Vec<RawCreator>,
    #[serde(default)]
    pub illust_by: Vec<RawCreator>,
    #[serde(default)]
    pub scenario_by: Vec<RawCreator>,
    #[serde(default)]
    pub music_by: Vec<RawCreator>,
    #[serde(default)]
    pub others_by: Vec<RawCreator>,
    #[serde(default)]
    pub directed_by: Vec<RawCreator>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCreator {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("payload is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Converts raw payloads into canonical works.
pub trait WorkMapper: Send + Sync {
    fn to_work(&self, payload: &RawWorkPayload) -> Result<Work, IngestError>;
}

/// Default mapper for marketplace listing payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListingMapper;

impl WorkMapper for ListingMapper {
    fn to_work(&self, payload: &RawWorkPayload) -> Result<Work, IngestError> {
        let product_id = payload.workno.trim().to_string();
        if product_id.is_empty() {
            return Err(IngestError::MissingField("workno"));
        }
        if !product_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(IngestError::InvalidValue {
                field: "workno",
                reason: format!("`{product_id}` is not an alphanumeric product id"),
            });
        }

        let current = payload.price.unwrap_or(0);
        let discount_rate = payload
            .discount_rate
            .filter(|rate| *rate != 0.0)
            .map(|percent| percent / 100.0);
        let official_price = payload.official_price.filter(|official| *official != current);

        Ok(Work {
            title: text_or_none(payload.work_name.as_deref())
                .unwrap_or_else(|| format!("Unknown Work {product_id}")),
            circle_id: text_or_none(payload.maker_id.as_deref())
                .unwrap_or_else(|| UNKNOWN_ID.to_string()),
            circle_name: text_or_none(payload.maker_name.as_deref())
                .unwrap_or_else(|| "Unknown Maker".to_string()),
            circle_name_en: text_or_none(payload.maker_name_en.as_deref()),
            price: WorkPrice { current },
            official_price,
            discount_rate,
            sales_status: payload
                .sales_status
                .map(|s| SalesStatus {
                    is_sale: s.is_sale,
                    is_sold_out: s.is_sold_out,
                })
                .unwrap_or_default(),
            rating: to_rating(payload),
            genres: distinct_genres(&payload.genres),
            creators: extract_creator_credits(payload),
            updated_at: None,
            product_id,
        })
    }
}

fn text_or_none(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn to_rating(payload: &RawWorkPayload) -> Option<Rating> {
    let stars = payload.rate_average_star.filter(|s| *s > 0.0)?;
    let count = payload.rate_count.filter(|c| *c > 0)?;
    Some(Rating { stars, count })
}

fn distinct_genres(genres: &[RawGenre]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(genres.len());
    for genre in genres {
        let name = genre.name.trim();
        if !name.is_empty() && !out.iter().any(|g| g == name) {
            out.push(name.to_string());
        }
    }
    out
}

pub fn is_valid_creator_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Role-merged credits in first-seen order. Entries with unusable ids are skipped.
pub fn extract_creator_credits(payload: &RawWorkPayload) -> Vec<CreatorCredit> {
    let Some(RawCreators::Roles(roles)) = &payload.creaters else {
        return Vec::new();
    };

    let by_role: [(&[RawCreator], CreatorRole); 6] = [
        (roles.voice_by.as_slice(), CreatorRole::Voice),
        (roles.illust_by.as_slice(), CreatorRole::Illustration),
        (roles.scenario_by.as_slice(), CreatorRole::Scenario),
        (roles.music_by.as_slice(), CreatorRole::Music),
        (roles.others_by.as_slice(), CreatorRole::Other),
        (roles.directed_by.as_slice(), CreatorRole::Other),
    ];

    let mut order: Vec<String> = Vec::new();
    let mut credits: BTreeMap<String, CreatorCredit> = BTreeMap::new();
    for (creators, role) in by_role {
        for creator in creators {
            let Some(id) = creator.id.as_deref().map(str::trim).filter(|id| is_valid_creator_id(id))
            else {
                continue;
            };
            let entry = credits.entry(id.to_string()).or_insert_with(|| {
                order.push(id.to_string());
                CreatorCredit {
                    creator_id: id.to_string(),
                    name: text_or_none(creator.name.as_deref())
                        .unwrap_or_else(|| "Unknown Creator".to_string()),
                    roles: Vec::new(),
                }
            });
            if !entry.roles.contains(&role) {
                entry.roles.push(role);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| credits.remove(&id))
        .collect()
}

/// Price history row for `date` derived from a mapped work.
pub fn price_history_entry(work: &Work, date: NaiveDate) -> PriceHistoryEntry {
    let current = work.price.current;
    let regular = match work.positive_official_price() {
        Some(official) if work.has_active_discount() => official,
        _ => current,
    };
    let discount = (work.has_active_discount() && current < regular).then_some(current);
    PriceHistoryEntry::new(date, regular, discount)
}

pub fn best_effort_work_id(payload: &RawWorkPayload) -> String {
    text_or_none(Some(payload.workno.as_str())).unwrap_or_else(|| UNKNOWN_ID.to_string())
}

/// Reads a JSON file holding either one payload or an array of payloads.
pub fn load_payloads(path: impl AsRef<Path>) -> Result<Vec<RawWorkPayload>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: JsonValue =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    let payloads = match value {
        JsonValue::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                serde_json::from_value(item)
                    .with_context(|| format!("decoding payload #{i} in {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?,
        other => vec![serde_json::from_value(other)
            .with_context(|| format!("decoding payload in {}", path.display()))?],
    };
    Ok(payloads)
}
