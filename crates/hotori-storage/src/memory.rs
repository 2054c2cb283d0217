//! In-memory deal store loaded from a JSON table snapshot.

use std::cmp::Ordering;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hotori_core::{
    category_name_or_unknown, dedupe_raw_shop_names, Category, CategoryMapping, CategoryRecord,
    DealDetail, DealLink, DealListFilters, DealListItem, DealMetricSnapshot, DealSource,
    NewCategoryMapping, NewName, NewShopDomainMapping, NewShopNameMapping, RawShopName,
    ShippingType, ShopDomainMapping, ShopName, ShopNameMapping, ShopNameMappingKey, ShopNameRef,
    SourceCategory, SourceCategoryRef, DEAL_LIST_LIMIT, DETAIL_METRICS_LIMIT,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{DealStore, StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRow {
    pub id: i64,
    pub category_id: i64,
    pub title: String,
    pub shop_name: Option<String>,
    pub subcategory: Option<String>,
    pub price: Option<String>,
    #[serde(default)]
    pub shipping_type: ShippingType,
    #[serde(default)]
    pub sold_out: bool,
    pub thumbnail_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealSourceRow {
    pub id: i64,
    pub deal_id: i64,
    pub source: String,
    pub post_url: String,
    pub title: String,
    pub thumb_url: Option<String>,
    pub shop_name_raw: Option<String>,
    pub source_category_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealLinkRow {
    pub id: i64,
    pub deal_id: i64,
    pub url: String,
    pub domain: String,
    #[serde(default)]
    pub is_affiliate: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealMetricRow {
    pub id: i64,
    pub deal_id: i64,
    pub source: String,
    pub views: Option<i64>,
    pub votes: Option<i64>,
    pub comments: Option<i64>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryMappingRow {
    pub source_category_id: i64,
    pub category_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShopNameMappingRow {
    pub id: i64,
    pub source: String,
    pub raw_name: String,
    pub shop_name_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShopDomainMappingRow {
    pub id: i64,
    pub domain: String,
    pub shop_name_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Table-per-field dump of the deals database. Missing tables load as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureSnapshot {
    #[serde(default)]
    pub categories: Vec<CategoryRecord>,
    #[serde(default)]
    pub deals: Vec<DealRow>,
    #[serde(default)]
    pub deal_sources: Vec<DealSourceRow>,
    #[serde(default)]
    pub deal_links: Vec<DealLinkRow>,
    #[serde(default)]
    pub deal_metrics_history: Vec<DealMetricRow>,
    #[serde(default)]
    pub source_categories: Vec<SourceCategory>,
    #[serde(default)]
    pub category_mappings: Vec<CategoryMappingRow>,
    #[serde(default)]
    pub shop_name_master: Vec<ShopName>,
    #[serde(default)]
    pub shop_name_mappings: Vec<ShopNameMappingRow>,
    #[serde(default)]
    pub shop_domain_mappings: Vec<ShopDomainMappingRow>,
}

fn newest_first(a: (DateTime<Utc>, i64), b: (DateTime<Utc>, i64)) -> Ordering {
    b.0.cmp(&a.0).then(b.1.cmp(&a.1))
}

impl FixtureSnapshot {
    fn category_name(&self, category_id: i64) -> Option<String> {
        self.categories
            .iter()
            .find(|c| c.id == category_id)
            .map(|c| c.name.clone())
    }

    /// Source records of a deal, newest first, optionally restricted to one source name.
    fn sources_for(&self, deal_id: i64, source: Option<&str>) -> Vec<&DealSourceRow> {
        let mut rows: Vec<_> = self
            .deal_sources
            .iter()
            .filter(|s| s.deal_id == deal_id && source.map_or(true, |name| s.source == name))
            .collect();
        rows.sort_by(|a, b| newest_first((a.created_at, a.id), (b.created_at, b.id)));
        rows
    }

    /// Links of a deal, affiliate links first, then newest first.
    fn links_for(&self, deal_id: i64) -> Vec<&DealLinkRow> {
        let mut rows: Vec<_> = self.deal_links.iter().filter(|l| l.deal_id == deal_id).collect();
        rows.sort_by(|a, b| {
            b.is_affiliate
                .cmp(&a.is_affiliate)
                .then_with(|| newest_first((a.created_at, a.id), (b.created_at, b.id)))
        });
        rows
    }

    fn metrics_for(&self, deal_id: i64) -> Vec<&DealMetricRow> {
        let mut rows: Vec<_> = self
            .deal_metrics_history
            .iter()
            .filter(|m| m.deal_id == deal_id)
            .collect();
        rows.sort_by(|a, b| newest_first((a.captured_at, a.id), (b.captured_at, b.id)));
        rows
    }

    fn shop_name_ref(&self, shop_name_id: i64) -> Option<ShopNameRef> {
        self.shop_name_master
            .iter()
            .find(|s| s.id == shop_name_id)
            .map(|s| ShopNameRef {
                id: s.id,
                name: s.name.clone(),
            })
    }

    fn category_mapping(&self, row: &CategoryMappingRow) -> CategoryMapping {
        CategoryMapping {
            source_category_id: row.source_category_id,
            category_id: row.category_id,
            created_at: row.created_at,
            source_categories: self
                .source_categories
                .iter()
                .find(|sc| sc.id == row.source_category_id)
                .map(|sc| SourceCategoryRef {
                    id: sc.id,
                    source: sc.source.clone(),
                    source_key: sc.source_key.clone(),
                    name: sc.name.clone(),
                }),
            categories: self
                .categories
                .iter()
                .find(|c| c.id == row.category_id)
                .map(|c| Category {
                    id: c.id,
                    name: c.name.clone(),
                }),
        }
    }

    fn shop_name_mapping(&self, row: &ShopNameMappingRow) -> ShopNameMapping {
        ShopNameMapping {
            id: row.id,
            source: row.source.clone(),
            raw_name: row.raw_name.clone(),
            shop_name_id: row.shop_name_id,
            created_at: row.created_at,
            shop_name_master: self.shop_name_ref(row.shop_name_id),
        }
    }

    fn shop_domain_mapping(&self, row: &ShopDomainMappingRow) -> ShopDomainMapping {
        ShopDomainMapping {
            id: row.id,
            domain: row.domain.clone(),
            shop_name_id: row.shop_name_id,
            created_at: row.created_at,
            shop_name_master: self.shop_name_ref(row.shop_name_id),
        }
    }

    fn require_shop_name(&self, shop_name_id: i64) -> StoreResult<()> {
        if self.shop_name_master.iter().any(|s| s.id == shop_name_id) {
            Ok(())
        } else {
            Err(StoreError::UnknownReference(format!(
                "shop name {shop_name_id} does not exist"
            )))
        }
    }
}

fn next_id(ids: impl Iterator<Item = i64>) -> i64 {
    ids.max().unwrap_or(0) + 1
}

fn to_source(row: &DealSourceRow) -> DealSource {
    DealSource {
        source: row.source.clone(),
        post_url: row.post_url.clone(),
        title: row.title.clone(),
        thumb_url: row.thumb_url.clone(),
    }
}

fn to_link(row: &DealLinkRow) -> DealLink {
    DealLink {
        url: row.url.clone(),
        domain: row.domain.clone(),
        is_affiliate: row.is_affiliate,
    }
}

fn to_metric(row: &DealMetricRow) -> DealMetricSnapshot {
    DealMetricSnapshot {
        views: row.views,
        votes: row.votes,
        comments: row.comments,
        captured_at: row.captured_at,
        source: row.source.clone(),
    }
}

/// Deal store over an in-memory [`FixtureSnapshot`]; writes stay in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: RwLock<FixtureSnapshot>,
}

impl MemoryStore {
    pub fn new(snapshot: FixtureSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    pub async fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| StoreError::FixtureIo {
                path: path.display().to_string(),
                source,
            })?;
        let snapshot: FixtureSnapshot =
            serde_json::from_str(&text).map_err(|source| StoreError::FixtureParse {
                path: path.display().to_string(),
                source,
            })?;
        debug!(
            path = %path.display(),
            deals = snapshot.deals.len(),
            "loaded fixture snapshot"
        );
        Ok(Self::new(snapshot))
    }

    pub async fn snapshot(&self) -> FixtureSnapshot {
        self.snapshot.read().await.clone()
    }
}

#[async_trait]
impl DealStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn list_categories(&self) -> StoreResult<Vec<Category>> {
        Ok(self
            .list_category_records()
            .await?
            .into_iter()
            .map(|c| Category { id: c.id, name: c.name })
            .collect())
    }

    async fn fetch_deal_window(&self, filters: &DealListFilters) -> StoreResult<Vec<DealListItem>> {
        let snap = self.snapshot.read().await;
        let mut deals: Vec<_> = snap
            .deals
            .iter()
            .filter(|d| {
                filters.matches_title(&d.title)
                    && filters.matches_category(d.category_id)
                    && filters.matches_sold_out(d.sold_out)
            })
            .collect();
        deals.sort_by(|a, b| newest_first((a.created_at, a.id), (b.created_at, b.id)));

        let source_filter = filters.source.as_deref();
        let mut out = Vec::new();
        for deal in deals {
            let source = snap.sources_for(deal.id, source_filter).first().map(|s| to_source(s));
            if source_filter.is_some() && source.is_none() {
                continue;
            }
            out.push(DealListItem {
                id: deal.id,
                category_id: deal.category_id,
                category_name: category_name_or_unknown(snap.category_name(deal.category_id)),
                title: deal.title.clone(),
                shop_name: deal.shop_name.clone(),
                subcategory: deal.subcategory.clone(),
                price: deal.price.clone(),
                shipping_type: deal.shipping_type.clone(),
                sold_out: deal.sold_out,
                thumbnail_url: deal.thumbnail_url.clone(),
                created_at: deal.created_at,
                source,
                buy_link: snap.links_for(deal.id).first().map(|l| to_link(l)),
                metrics: snap.metrics_for(deal.id).first().map(|m| to_metric(m)),
            });
            if out.len() == DEAL_LIST_LIMIT {
                break;
            }
        }
        Ok(out)
    }

    async fn deal_detail(&self, deal_id: i64) -> StoreResult<Option<DealDetail>> {
        let snap = self.snapshot.read().await;
        let Some(deal) = snap.deals.iter().find(|d| d.id == deal_id) else {
            return Ok(None);
        };
        Ok(Some(DealDetail {
            id: deal.id,
            category_id: deal.category_id,
            category_name: category_name_or_unknown(snap.category_name(deal.category_id)),
            title: deal.title.clone(),
            shop_name: deal.shop_name.clone(),
            subcategory: deal.subcategory.clone(),
            price: deal.price.clone(),
            shipping_type: deal.shipping_type.clone(),
            sold_out: deal.sold_out,
            thumbnail_url: deal.thumbnail_url.clone(),
            created_at: deal.created_at,
            sources: snap.sources_for(deal.id, None).into_iter().map(to_source).collect(),
            links: snap.links_for(deal.id).into_iter().map(to_link).collect(),
            metrics_history: snap
                .metrics_for(deal.id)
                .into_iter()
                .take(DETAIL_METRICS_LIMIT)
                .map(to_metric)
                .collect(),
        }))
    }

    async fn list_category_records(&self) -> StoreResult<Vec<CategoryRecord>> {
        let snap = self.snapshot.read().await;
        let mut rows = snap.categories.clone();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn create_category(&self, name: &NewName) -> StoreResult<CategoryRecord> {
        let mut guard = self.snapshot.write().await;
        let snap = &mut *guard;
        if snap.categories.iter().any(|c| c.name == name.as_str()) {
            return Err(StoreError::Conflict("category already exists".into()));
        }
        let record = CategoryRecord {
            id: next_id(snap.categories.iter().map(|c| c.id)),
            name: name.as_str().to_string(),
            created_at: Utc::now(),
        };
        snap.categories.push(record.clone());
        Ok(record)
    }

    async fn list_source_categories(&self) -> StoreResult<Vec<SourceCategory>> {
        let snap = self.snapshot.read().await;
        let mut rows = snap.source_categories.clone();
        rows.sort_by(|a, b| {
            a.source
                .cmp(&b.source)
                .then_with(|| a.name.cmp(&b.name))
                .then(a.id.cmp(&b.id))
        });
        Ok(rows)
    }

    async fn list_category_mappings(&self) -> StoreResult<Vec<CategoryMapping>> {
        let snap = self.snapshot.read().await;
        let mut rows: Vec<_> = snap.category_mappings.iter().collect();
        rows.sort_by(|a, b| {
            newest_first(
                (a.created_at, a.source_category_id),
                (b.created_at, b.source_category_id),
            )
        });
        Ok(rows.into_iter().map(|r| snap.category_mapping(r)).collect())
    }

    async fn upsert_category_mapping(&self, mapping: NewCategoryMapping) -> StoreResult<CategoryMapping> {
        let mut guard = self.snapshot.write().await;
        let snap = &mut *guard;
        if !snap
            .source_categories
            .iter()
            .any(|sc| sc.id == mapping.source_category_id)
        {
            return Err(StoreError::UnknownReference(format!(
                "source category {} does not exist",
                mapping.source_category_id
            )));
        }
        if !snap.categories.iter().any(|c| c.id == mapping.category_id) {
            return Err(StoreError::UnknownReference(format!(
                "category {} does not exist",
                mapping.category_id
            )));
        }

        let row = match snap
            .category_mappings
            .iter_mut()
            .find(|m| m.source_category_id == mapping.source_category_id)
        {
            Some(existing) => {
                existing.category_id = mapping.category_id;
                existing.clone()
            }
            None => {
                let row = CategoryMappingRow {
                    source_category_id: mapping.source_category_id,
                    category_id: mapping.category_id,
                    created_at: Utc::now(),
                };
                snap.category_mappings.push(row.clone());
                row
            }
        };
        Ok(snap.category_mapping(&row))
    }

    async fn delete_category_mapping(&self, source_category_id: i64) -> StoreResult<()> {
        let mut guard = self.snapshot.write().await;
        let snap = &mut *guard;
        snap.category_mappings
            .retain(|m| m.source_category_id != source_category_id);
        Ok(())
    }

    async fn list_shop_names(&self) -> StoreResult<Vec<ShopName>> {
        let snap = self.snapshot.read().await;
        let mut rows = snap.shop_name_master.clone();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn create_shop_name(&self, name: &NewName) -> StoreResult<ShopName> {
        let mut guard = self.snapshot.write().await;
        let snap = &mut *guard;
        if snap.shop_name_master.iter().any(|s| s.name == name.as_str()) {
            return Err(StoreError::Conflict("shop name already exists".into()));
        }
        let record = ShopName {
            id: next_id(snap.shop_name_master.iter().map(|s| s.id)),
            name: name.as_str().to_string(),
            created_at: Utc::now(),
        };
        snap.shop_name_master.push(record.clone());
        Ok(record)
    }

    async fn list_shop_name_mappings(&self) -> StoreResult<Vec<ShopNameMapping>> {
        let snap = self.snapshot.read().await;
        let mut rows: Vec<_> = snap.shop_name_mappings.iter().collect();
        rows.sort_by(|a, b| newest_first((a.created_at, a.id), (b.created_at, b.id)));
        Ok(rows.into_iter().map(|r| snap.shop_name_mapping(r)).collect())
    }

    async fn upsert_shop_name_mapping(&self, mapping: &NewShopNameMapping) -> StoreResult<ShopNameMapping> {
        let mut guard = self.snapshot.write().await;
        let snap = &mut *guard;
        snap.require_shop_name(mapping.shop_name_id)?;

        let next = next_id(snap.shop_name_mappings.iter().map(|m| m.id));
        let row = match snap
            .shop_name_mappings
            .iter_mut()
            .find(|m| m.source == mapping.source && m.raw_name == mapping.raw_name)
        {
            Some(existing) => {
                existing.shop_name_id = mapping.shop_name_id;
                existing.clone()
            }
            None => {
                let row = ShopNameMappingRow {
                    id: next,
                    source: mapping.source.clone(),
                    raw_name: mapping.raw_name.clone(),
                    shop_name_id: mapping.shop_name_id,
                    created_at: Utc::now(),
                };
                snap.shop_name_mappings.push(row.clone());
                row
            }
        };
        Ok(snap.shop_name_mapping(&row))
    }

    async fn delete_shop_name_mapping(&self, key: &ShopNameMappingKey) -> StoreResult<()> {
        let mut guard = self.snapshot.write().await;
        let snap = &mut *guard;
        match key {
            ShopNameMappingKey::Id(id) => snap.shop_name_mappings.retain(|m| m.id != *id),
            ShopNameMappingKey::SourceRawName { source, raw_name } => snap
                .shop_name_mappings
                .retain(|m| !(m.source == *source && m.raw_name == *raw_name)),
        }
        Ok(())
    }

    async fn list_raw_shop_names(&self, limit: usize) -> StoreResult<Vec<RawShopName>> {
        let snap = self.snapshot.read().await;
        let mut rows: Vec<_> = snap
            .deal_sources
            .iter()
            .filter(|s| s.shop_name_raw.is_some())
            .collect();
        rows.sort_by(|a, b| newest_first((a.created_at, a.id), (b.created_at, b.id)));
        let window = rows
            .into_iter()
            .take(limit)
            .map(|s| RawShopName {
                source: s.source.clone(),
                shop_name_raw: s.shop_name_raw.clone(),
                created_at: s.created_at,
            })
            .collect();
        Ok(dedupe_raw_shop_names(window))
    }

    async fn list_shop_domain_mappings(&self) -> StoreResult<Vec<ShopDomainMapping>> {
        let snap = self.snapshot.read().await;
        let mut rows: Vec<_> = snap.shop_domain_mappings.iter().collect();
        rows.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(rows.into_iter().map(|r| snap.shop_domain_mapping(r)).collect())
    }

    async fn upsert_shop_domain_mapping(&self, mapping: &NewShopDomainMapping) -> StoreResult<ShopDomainMapping> {
        let mut guard = self.snapshot.write().await;
        let snap = &mut *guard;
        snap.require_shop_name(mapping.shop_name_id)?;

        let next = next_id(snap.shop_domain_mappings.iter().map(|m| m.id));
        let row = match snap
            .shop_domain_mappings
            .iter_mut()
            .find(|m| m.domain == mapping.domain)
        {
            Some(existing) => {
                existing.shop_name_id = mapping.shop_name_id;
                existing.clone()
            }
            None => {
                let row = ShopDomainMappingRow {
                    id: next,
                    domain: mapping.domain.clone(),
                    shop_name_id: mapping.shop_name_id,
                    created_at: Utc::now(),
                };
                snap.shop_domain_mappings.push(row.clone());
                row
            }
        };
        Ok(snap.shop_domain_mapping(&row))
    }

    async fn delete_shop_domain_mapping(&self, domain: &str) -> StoreResult<()> {
        let mut guard = self.snapshot.write().await;
        let snap = &mut *guard;
        snap.shop_domain_mappings.retain(|m| m.domain != domain);
        Ok(())
    }
}
