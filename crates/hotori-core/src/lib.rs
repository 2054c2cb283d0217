//! Core domain model and deal-list query contract for Hotori.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hotori-core";

/// Hard cap on rows returned by the deal list query, whatever the filters.
pub const DEAL_LIST_LIMIT: usize = 200;

/// Metrics snapshots returned with a deal detail.
pub const DETAIL_METRICS_LIMIT: usize = 10;

pub const RAW_SHOP_NAMES_DEFAULT_LIMIT: usize = 200;
pub const RAW_SHOP_NAMES_MIN_LIMIT: usize = 50;
pub const RAW_SHOP_NAMES_MAX_LIMIT: usize = 500;

/// Category name reported for deals whose category row is missing.
pub const UNKNOWN_CATEGORY: &str = "UNKNOWN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Shipping terms as published by the source site. Unrecognized values are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ShippingType {
    Free,
    Paid,
    #[default]
    Unknown,
    Other(String),
}

impl ShippingType {
    pub fn as_str(&self) -> &str {
        match self {
            ShippingType::Free => "FREE",
            ShippingType::Paid => "PAID",
            ShippingType::Unknown => "UNKNOWN",
            ShippingType::Other(raw) => raw,
        }
    }
}

impl From<String> for ShippingType {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "FREE" => ShippingType::Free,
            "PAID" => ShippingType::Paid,
            "UNKNOWN" | "" => ShippingType::Unknown,
            _ => ShippingType::Other(raw),
        }
    }
}

impl From<ShippingType> for String {
    fn from(value: ShippingType) -> Self {
        match value {
            ShippingType::Other(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for ShippingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-site capture of a deal posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealSource {
    pub source: String,
    pub post_url: String,
    pub title: String,
    pub thumb_url: Option<String>,
}

/// Outbound purchase link attached to a deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealLink {
    pub url: String,
    pub domain: String,
    pub is_affiliate: bool,
}

/// Point-in-time view/vote/comment counts for a deal on one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealMetricSnapshot {
    pub views: Option<i64>,
    pub votes: Option<i64>,
    pub comments: Option<i64>,
    pub captured_at: DateTime<Utc>,
    pub source: String,
}

/// Deal summary row of the list view, carrying at most one representative child per relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealListItem {
    pub id: i64,
    pub category_id: i64,
    pub category_name: String,
    pub title: String,
    pub shop_name: Option<String>,
    pub subcategory: Option<String>,
    pub price: Option<String>,
    pub shipping_type: ShippingType,
    pub sold_out: bool,
    pub thumbnail_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub source: Option<DealSource>,
    pub buy_link: Option<DealLink>,
    pub metrics: Option<DealMetricSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealDetail {
    pub id: i64,
    pub category_id: i64,
    pub category_name: String,
    pub title: String,
    pub shop_name: Option<String>,
    pub subcategory: Option<String>,
    pub price: Option<String>,
    pub shipping_type: ShippingType,
    pub sold_out: bool,
    pub thumbnail_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sources: Vec<DealSource>,
    pub links: Vec<DealLink>,
    pub metrics_history: Vec<DealMetricSnapshot>,
}

pub fn category_name_or_unknown(name: Option<String>) -> String {
    name.unwrap_or_else(|| UNKNOWN_CATEGORY.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DealSortKey {
    #[default]
    Latest,
    Views,
    Votes,
    Comments,
}

impl DealSortKey {
    /// Unknown or missing keys fall back to `Latest`.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("views") => DealSortKey::Views,
            Some("votes") => DealSortKey::Votes,
            Some("comments") => DealSortKey::Comments,
            _ => DealSortKey::Latest,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DealSortKey::Latest => "latest",
            DealSortKey::Views => "views",
            DealSortKey::Votes => "votes",
            DealSortKey::Comments => "comments",
        }
    }

    /// Metric value the key sorts on; `None` for `Latest` or when the deal has no snapshot.
    pub fn metric_value(self, item: &DealListItem) -> Option<i64> {
        let metrics = item.metrics.as_ref()?;
        match self {
            DealSortKey::Latest => None,
            DealSortKey::Views => metrics.views,
            DealSortKey::Votes => metrics.votes,
            DealSortKey::Comments => metrics.comments,
        }
    }
}

impl fmt::Display for DealSortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DealListFilters {
    pub query: Option<String>,
    pub source: Option<String>,
    pub category_ids: Vec<i64>,
    /// When set, sold-out deals are left out of the result.
    pub exclude_sold_out: bool,
    pub sort: DealSortKey,
}

impl DealListFilters {
    /// Trims text filters, drops empty ones and de-duplicates category ids (first occurrence kept).
    pub fn normalized(self) -> Self {
        let mut seen = HashSet::new();
        let category_ids = self
            .category_ids
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();
        Self {
            query: non_empty_trimmed(self.query.as_deref()),
            source: non_empty_trimmed(self.source.as_deref()),
            category_ids,
            exclude_sold_out: self.exclude_sold_out,
            sort: self.sort,
        }
    }

    /// Case-insensitive substring match against the free-text query.
    pub fn matches_title(&self, title: &str) -> bool {
        match self.query.as_deref() {
            Some(query) => title.to_lowercase().contains(&query.to_lowercase()),
            None => true,
        }
    }

    pub fn matches_category(&self, category_id: i64) -> bool {
        self.category_ids.is_empty() || self.category_ids.contains(&category_id)
    }

    pub fn matches_sold_out(&self, sold_out: bool) -> bool {
        !(self.exclude_sold_out && sold_out)
    }
}

/// Builds an `ILIKE` pattern matching `query` as a literal substring (escape char `\`).
pub fn ilike_substring_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for ch in query.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

/// Re-orders an already latest-first list by the sort key's metric, descending.
///
/// Deals without a value go after every deal with one; the sort is stable, so
/// deals with equal (or both missing) values keep their incoming order.
pub fn sort_by_metric(items: &mut [DealListItem], sort: DealSortKey) {
    if sort == DealSortKey::Latest {
        return;
    }
    items.sort_by(|a, b| compare_metric_desc(sort.metric_value(a), sort.metric_value(b)));
}

fn compare_metric_desc(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => b.cmp(&a),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCategory {
    pub id: i64,
    pub source: String,
    pub source_key: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCategoryRef {
    pub id: i64,
    pub source: String,
    pub source_key: String,
    pub name: String,
}

/// Admin-curated link from a site-specific category to a canonical one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryMapping {
    pub source_category_id: i64,
    pub category_id: i64,
    pub created_at: DateTime<Utc>,
    pub source_categories: Option<SourceCategoryRef>,
    pub categories: Option<Category>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopName {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopNameRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopNameMapping {
    pub id: i64,
    pub source: String,
    pub raw_name: String,
    pub shop_name_id: i64,
    pub created_at: DateTime<Utc>,
    pub shop_name_master: Option<ShopNameRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopDomainMapping {
    pub id: i64,
    pub domain: String,
    pub shop_name_id: i64,
    pub created_at: DateTime<Utc>,
    pub shop_name_master: Option<ShopNameRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawShopName {
    pub source: String,
    pub shop_name_raw: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Keeps the first `(source, shop_name_raw)` occurrence of a newest-first list and drops empty names.
pub fn dedupe_raw_shop_names(rows: Vec<RawShopName>) -> Vec<RawShopName> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| match row.shop_name_raw.as_deref() {
            Some(raw) if !raw.is_empty() => seen.insert((row.source.clone(), raw.to_string())),
            _ => false,
        })
        .collect()
}

/// Parses the raw-shop-name window size. Blank input counts as zero and is
/// clamped up; non-numeric or non-finite input means the default.
pub fn clamp_raw_shop_names_limit(raw: Option<&str>) -> usize {
    let Some(raw) = raw else {
        return RAW_SHOP_NAMES_DEFAULT_LIMIT;
    };
    let raw = raw.trim();
    let value = if raw.is_empty() {
        0.0
    } else {
        match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => value,
            _ => return RAW_SHOP_NAMES_DEFAULT_LIMIT,
        }
    };
    value
        .clamp(RAW_SHOP_NAMES_MIN_LIMIT as f64, RAW_SHOP_NAMES_MAX_LIMIT as f64)
        .floor() as usize
}

pub fn normalize_domain(raw: &str) -> Option<String> {
    non_empty_trimmed(Some(raw)).map(|d| d.to_lowercase())
}

fn non_empty_trimmed(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Rejected admin input. The message is user-facing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct InputError(pub &'static str);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewName(String);

impl NewName {
    pub fn parse(raw: Option<&str>) -> Result<Self, InputError> {
        non_empty_trimmed(raw)
            .map(Self)
            .ok_or(InputError("name is required"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewCategoryMapping {
    pub source_category_id: i64,
    pub category_id: i64,
}

impl NewCategoryMapping {
    pub fn parse(source_category_id: Option<i64>, category_id: Option<i64>) -> Result<Self, InputError> {
        match (positive(source_category_id), positive(category_id)) {
            (Some(source_category_id), Some(category_id)) => Ok(Self {
                source_category_id,
                category_id,
            }),
            _ => Err(InputError("sourceCategoryId and categoryId are required")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewShopNameMapping {
    pub source: String,
    pub raw_name: String,
    pub shop_name_id: i64,
}

impl NewShopNameMapping {
    pub fn parse(
        source: Option<&str>,
        raw_name: Option<&str>,
        shop_name_id: Option<i64>,
    ) -> Result<Self, InputError> {
        match (
            non_empty_trimmed(source),
            non_empty_trimmed(raw_name),
            positive(shop_name_id),
        ) {
            (Some(source), Some(raw_name), Some(shop_name_id)) => Ok(Self {
                source,
                raw_name,
                shop_name_id,
            }),
            _ => Err(InputError("source, rawName, shopNameId are required")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewShopDomainMapping {
    pub domain: String,
    pub shop_name_id: i64,
}

impl NewShopDomainMapping {
    pub fn parse(domain: Option<&str>, shop_name_id: Option<i64>) -> Result<Self, InputError> {
        match (domain.and_then(normalize_domain), positive(shop_name_id)) {
            (Some(domain), Some(shop_name_id)) => Ok(Self {
                domain,
                shop_name_id,
            }),
            _ => Err(InputError("domain and shopNameId are required")),
        }
    }
}

/// Identifies a shop-name mapping to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShopNameMappingKey {
    Id(i64),
    SourceRawName { source: String, raw_name: String },
}

impl ShopNameMappingKey {
    /// An id wins over the `(source, raw_name)` pair.
    pub fn parse(
        id: Option<i64>,
        source: Option<&str>,
        raw_name: Option<&str>,
    ) -> Result<Self, InputError> {
        if let Some(id) = id {
            return Ok(ShopNameMappingKey::Id(id));
        }
        match (non_empty_trimmed(source), non_empty_trimmed(raw_name)) {
            (Some(source), Some(raw_name)) => Ok(ShopNameMappingKey::SourceRawName { source, raw_name }),
            _ => Err(InputError("id or (source, rawName) is required")),
        }
    }
}

fn positive(value: Option<i64>) -> Option<i64> {
    value.filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn mk_item(id: i64, views: Option<i64>, with_metrics: bool) -> DealListItem {
        DealListItem {
            id,
            category_id: 1,
            category_name: "디지털".into(),
            title: format!("deal {id}"),
            shop_name: None,
            subcategory: None,
            price: None,
            shipping_type: ShippingType::Unknown,
            sold_out: false,
            thumbnail_url: None,
            created_at: ts(12),
            source: None,
            buy_link: None,
            metrics: with_metrics.then(|| DealMetricSnapshot {
                views,
                votes: Some(1),
                comments: None,
                captured_at: ts(13),
                source: "ppomppu".into(),
            }),
        }
    }

    fn ids(items: &[DealListItem]) -> Vec<i64> {
        items.iter().map(|i| i.id).collect()
    }

    #[test]
    fn metric_sort_is_descending_with_missing_values_last() {
        let mut items = vec![
            mk_item(1, Some(10), true),
            mk_item(2, None, true),
            mk_item(3, Some(30), true),
            mk_item(4, None, false),
            mk_item(5, Some(20), true),
        ];
        sort_by_metric(&mut items, DealSortKey::Views);
        assert_eq!(ids(&items), vec![3, 5, 1, 2, 4]);
    }

    #[test]
    fn metric_sort_keeps_incoming_order_for_ties_and_nulls() {
        let mut items = vec![
            mk_item(7, None, false),
            mk_item(8, Some(5), true),
            mk_item(9, None, true),
            mk_item(10, Some(5), true),
        ];
        sort_by_metric(&mut items, DealSortKey::Views);
        assert_eq!(ids(&items), vec![8, 10, 7, 9]);
    }

    #[test]
    fn latest_sort_leaves_order_untouched() {
        let mut items = vec![mk_item(2, Some(1), true), mk_item(1, Some(100), true)];
        sort_by_metric(&mut items, DealSortKey::Latest);
        assert_eq!(ids(&items), vec![2, 1]);
    }

    #[test]
    fn sort_key_parsing_falls_back_to_latest() {
        assert_eq!(DealSortKey::parse_lenient(Some("views")), DealSortKey::Views);
        assert_eq!(DealSortKey::parse_lenient(Some("comments")), DealSortKey::Comments);
        assert_eq!(DealSortKey::parse_lenient(Some("VOTES")), DealSortKey::Latest);
        assert_eq!(DealSortKey::parse_lenient(Some("price")), DealSortKey::Latest);
        assert_eq!(DealSortKey::parse_lenient(None), DealSortKey::Latest);
    }

    #[test]
    fn filters_normalize_blank_text_and_duplicate_categories() {
        let filters = DealListFilters {
            query: Some("   ".into()),
            source: Some(" ppomppu ".into()),
            category_ids: vec![3, 1, 3],
            ..Default::default()
        }
        .normalized();
        assert_eq!(filters.query, None);
        assert_eq!(filters.source.as_deref(), Some("ppomppu"));
        assert_eq!(filters.category_ids, vec![3, 1]);
    }

    #[test]
    fn title_match_is_case_insensitive_substring() {
        let filters = DealListFilters {
            query: Some("ssd".into()),
            ..Default::default()
        };
        assert!(filters.matches_title("삼성 SSD 1TB"));
        assert!(!filters.matches_title("삼성 HDD 1TB"));
    }

    #[test]
    fn sold_out_flag_excludes_only_when_set() {
        let mut filters = DealListFilters::default();
        assert!(filters.matches_sold_out(true));
        filters.exclude_sold_out = true;
        assert!(!filters.matches_sold_out(true));
        assert!(filters.matches_sold_out(false));
    }

    #[test]
    fn ilike_pattern_escapes_wildcards() {
        assert_eq!(ilike_substring_pattern("50%_off"), "%50\\%\\_off%");
        assert_eq!(ilike_substring_pattern("a\\b"), "%a\\\\b%");
        assert_eq!(ilike_substring_pattern("라면"), "%라면%");
    }

    #[test]
    fn raw_shop_names_are_deduplicated_by_source_and_name() {
        let rows = vec![
            RawShopName { source: "ppomppu".into(), shop_name_raw: Some("쿠팡".into()), created_at: ts(10) },
            RawShopName { source: "ruliweb".into(), shop_name_raw: Some("쿠팡".into()), created_at: ts(9) },
            RawShopName { source: "ppomppu".into(), shop_name_raw: Some("쿠팡".into()), created_at: ts(8) },
            RawShopName { source: "ppomppu".into(), shop_name_raw: None, created_at: ts(7) },
            RawShopName { source: "ppomppu".into(), shop_name_raw: Some(String::new()), created_at: ts(6) },
        ];
        let unique = dedupe_raw_shop_names(rows);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].created_at, ts(10));
        assert_eq!(unique[1].source, "ruliweb");
    }

    #[test]
    fn raw_shop_name_limit_is_clamped() {
        assert_eq!(clamp_raw_shop_names_limit(None), 200);
        assert_eq!(clamp_raw_shop_names_limit(Some("abc")), 200);
        assert_eq!(clamp_raw_shop_names_limit(Some("10")), 50);
        assert_eq!(clamp_raw_shop_names_limit(Some("120")), 120);
        assert_eq!(clamp_raw_shop_names_limit(Some("9000")), 500);
        assert_eq!(clamp_raw_shop_names_limit(Some("-3")), 50);
        assert_eq!(clamp_raw_shop_names_limit(Some("")), 50);
        assert_eq!(clamp_raw_shop_names_limit(Some("12.5")), 50);
        assert_eq!(clamp_raw_shop_names_limit(Some("120.9")), 120);
        assert_eq!(clamp_raw_shop_names_limit(Some("inf")), 200);
    }

    #[test]
    fn admin_inputs_are_validated() {
        assert_eq!(NewName::parse(Some("  쿠팡 ")).unwrap().as_str(), "쿠팡");
        assert!(NewName::parse(Some("  ")).is_err());
        assert!(NewCategoryMapping::parse(Some(0), Some(1)).is_err());
        assert_eq!(
            NewShopDomainMapping::parse(Some(" WWW.Coupang.com "), Some(4)).unwrap().domain,
            "www.coupang.com"
        );
        assert_eq!(
            NewShopNameMapping::parse(Some("ppomppu"), Some(" 쿠팡 "), Some(2)).unwrap().raw_name,
            "쿠팡"
        );
        assert_eq!(
            ShopNameMappingKey::parse(Some(5), Some("ppomppu"), None).unwrap(),
            ShopNameMappingKey::Id(5)
        );
        assert_eq!(
            ShopNameMappingKey::parse(None, Some("ppomppu"), None).unwrap_err().to_string(),
            "id or (source, rawName) is required"
        );
    }

    #[test]
    fn shipping_type_round_trips_unknown_values() {
        let json = serde_json::to_string(&ShippingType::Other("CONDITIONAL".into())).unwrap();
        assert_eq!(json, "\"CONDITIONAL\"");
        let parsed: ShippingType = serde_json::from_str("\"FREE\"").unwrap();
        assert_eq!(parsed, ShippingType::Free);
    }
}
