//! Deal store contract plus its Postgres and fixture-backed implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use hotori_core::{
    sort_by_metric, Category, CategoryMapping, CategoryRecord, DealDetail, DealListFilters,
    DealListItem, NewCategoryMapping, NewName, NewShopDomainMapping, NewShopNameMapping,
    RawShopName, ShopDomainMapping, ShopName, ShopNameMapping, ShopNameMappingKey,
    SourceCategory,
};
use thiserror::Error;
use tracing::{info, warn};

mod memory;
mod postgres;

pub use memory::{
    CategoryMappingRow, DealLinkRow, DealMetricRow, DealRow, DealSourceRow, FixtureSnapshot,
    MemoryStore, ShopDomainMappingRow, ShopNameMappingRow,
};
pub use postgres::{build_deal_list_query, PgStore};

pub const CRATE_NAME: &str = "hotori-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    UnknownReference(String),
    #[error("reading fixture {path}: {source}")]
    FixtureIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing fixture {path}: {source}")]
    FixtureParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read and reconciliation operations over the deals database.
#[async_trait]
pub trait DealStore: Send + Sync {
    /// Short backend label for logs.
    fn backend(&self) -> &'static str;

    async fn list_categories(&self) -> StoreResult<Vec<Category>>;

    /// Latest-first window of at most `DEAL_LIST_LIMIT` deals matching `filters`.
    ///
    /// A source filter turns the source relation into an inner join: deals without a
    /// matching source record are dropped and the representative source is the newest
    /// record with that name.
    async fn fetch_deal_window(&self, filters: &DealListFilters) -> StoreResult<Vec<DealListItem>>;

    /// The deal list: the latest-first window, re-ordered by metric for non-`latest` sorts.
    async fn list_deals(&self, filters: &DealListFilters) -> StoreResult<Vec<DealListItem>> {
        let mut items = self.fetch_deal_window(filters).await?;
        sort_by_metric(&mut items, filters.sort);
        Ok(items)
    }

    async fn deal_detail(&self, deal_id: i64) -> StoreResult<Option<DealDetail>>;

    async fn list_category_records(&self) -> StoreResult<Vec<CategoryRecord>>;
    async fn create_category(&self, name: &NewName) -> StoreResult<CategoryRecord>;

    async fn list_source_categories(&self) -> StoreResult<Vec<SourceCategory>>;

    async fn list_category_mappings(&self) -> StoreResult<Vec<CategoryMapping>>;
    async fn upsert_category_mapping(&self, mapping: NewCategoryMapping) -> StoreResult<CategoryMapping>;
    async fn delete_category_mapping(&self, source_category_id: i64) -> StoreResult<()>;

    async fn list_shop_names(&self) -> StoreResult<Vec<ShopName>>;
    async fn create_shop_name(&self, name: &NewName) -> StoreResult<ShopName>;

    async fn list_shop_name_mappings(&self) -> StoreResult<Vec<ShopNameMapping>>;
    async fn upsert_shop_name_mapping(&self, mapping: &NewShopNameMapping) -> StoreResult<ShopNameMapping>;
    async fn delete_shop_name_mapping(&self, key: &ShopNameMappingKey) -> StoreResult<()>;

    /// Distinct `(source, shop_name_raw)` pairs among the newest `limit` source records.
    async fn list_raw_shop_names(&self, limit: usize) -> StoreResult<Vec<RawShopName>>;

    async fn list_shop_domain_mappings(&self) -> StoreResult<Vec<ShopDomainMapping>>;
    async fn upsert_shop_domain_mapping(&self, mapping: &NewShopDomainMapping) -> StoreResult<ShopDomainMapping>;
    async fn delete_shop_domain_mapping(&self, domain: &str) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub fixture_path: PathBuf,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            max_connections: std::env::var("HOTORI_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            fixture_path: std::env::var("HOTORI_FIXTURE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("fixtures/deals.json")),
        }
    }
}

/// Opens Postgres when a database URL is configured, otherwise the JSON fixture.
pub async fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn DealStore>> {
    if let Some(url) = &config.database_url {
        let store = PgStore::connect(url, config.max_connections)
            .await
            .context("connecting to DATABASE_URL")?;
        info!(backend = store.backend(), "deal store ready");
        return Ok(Arc::new(store));
    }

    warn!(
        path = %config.fixture_path.display(),
        "DATABASE_URL not set; serving fixture data"
    );
    let store = MemoryStore::load(&config.fixture_path).await?;
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_store_falls_back_to_fixture_without_database_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("deals.json");
        std::fs::write(&path, r#"{"categories": [{"id": 1, "name": "식품", "created_at": "2026-03-01T00:00:00Z"}]}"#)
            .expect("write fixture");

        let store = open_store(&StoreConfig {
            database_url: None,
            max_connections: 1,
            fixture_path: path,
        })
        .await
        .expect("open store");

        assert_eq!(store.backend(), "memory");
        let categories = store.list_categories().await.expect("categories");
        assert_eq!(categories, vec![Category { id: 1, name: "식품".into() }]);
    }

    #[tokio::test]
    async fn missing_fixture_is_reported_with_its_path() {
        let err = MemoryStore::load("/definitely/not/here.json").await.unwrap_err();
        assert!(matches!(err, StoreError::FixtureIo { .. }));
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }
}
