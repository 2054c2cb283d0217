//! Postgres-backed deal store.
//!
//! The list query picks one representative child row per relation with
//! `LATERAL` subqueries ordered and limited per deal. A source filter switches
//! the source subquery from `LEFT JOIN` to `JOIN`, so only deals with a
//! matching source record survive.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hotori_core::{
    category_name_or_unknown, dedupe_raw_shop_names, ilike_substring_pattern, Category,
    CategoryMapping, CategoryRecord, DealDetail, DealLink, DealListFilters, DealListItem,
    DealMetricSnapshot, DealSource, NewCategoryMapping, NewName, NewShopDomainMapping,
    NewShopNameMapping, RawShopName, ShippingType, ShopDomainMapping, ShopName, ShopNameMapping,
    ShopNameMappingKey, ShopNameRef, SourceCategory, SourceCategoryRef, DEAL_LIST_LIMIT,
    DETAIL_METRICS_LIMIT,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};

use crate::{DealStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool, e.g. one whose connections pin a `search_path`.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying schema migrations")
    }
}

const DEAL_COLUMNS: &str = r#"
SELECT d.id, d.category_id, d.title, d.shop_name, d.subcategory, d.price,
       d.shipping_type, d.sold_out, d.thumbnail_url, d.created_at,
       c.name AS category_name"#;

const DEAL_LIST_CHILD_COLUMNS: &str = r#",
       s.source AS source_source, s.post_url AS source_post_url,
       s.title AS source_title, s.thumb_url AS source_thumb_url,
       l.url AS link_url, l.domain AS link_domain, l.is_affiliate AS link_is_affiliate,
       m.views AS metric_views, m.votes AS metric_votes, m.comments AS metric_comments,
       m.captured_at AS metric_captured_at, m.source AS metric_source
  FROM deals d
  LEFT JOIN categories c ON c.id = d.category_id"#;

const SOURCE_LATERAL_HEAD: &str = r#" LATERAL (
       SELECT ds.source, ds.post_url, ds.title, ds.thumb_url
         FROM deal_sources ds
        WHERE ds.deal_id = d.id"#;

const SOURCE_LATERAL_TAIL: &str = r#"
        ORDER BY ds.created_at DESC, ds.id DESC
        LIMIT 1) s ON TRUE"#;

const LINK_AND_METRIC_LATERALS: &str = r#"
  LEFT JOIN LATERAL (
       SELECT dl.url, dl.domain, dl.is_affiliate
         FROM deal_links dl
        WHERE dl.deal_id = d.id
        ORDER BY dl.is_affiliate DESC, dl.created_at DESC, dl.id DESC
        LIMIT 1) l ON TRUE
  LEFT JOIN LATERAL (
       SELECT dm.views, dm.votes, dm.comments, dm.captured_at, dm.source
         FROM deal_metrics_history dm
        WHERE dm.deal_id = d.id
        ORDER BY dm.captured_at DESC, dm.id DESC
        LIMIT 1) m ON TRUE"#;

/// Builds the latest-first deal window query for `filters`.
pub fn build_deal_list_query(filters: &DealListFilters) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(DEAL_COLUMNS);
    qb.push(DEAL_LIST_CHILD_COLUMNS);

    match filters.source.as_deref() {
        Some(source) => {
            qb.push("\n  JOIN");
            qb.push(SOURCE_LATERAL_HEAD);
            qb.push(" AND ds.source = ");
            qb.push_bind(source.to_string());
        }
        None => {
            qb.push("\n  LEFT JOIN");
            qb.push(SOURCE_LATERAL_HEAD);
        }
    }
    qb.push(SOURCE_LATERAL_TAIL);
    qb.push(LINK_AND_METRIC_LATERALS);

    qb.push("\n WHERE TRUE");
    if let Some(query) = filters.query.as_deref() {
        qb.push(" AND d.title ILIKE ");
        qb.push_bind(ilike_substring_pattern(query));
        qb.push(r" ESCAPE '\'");
    }
    if !filters.category_ids.is_empty() {
        qb.push(" AND d.category_id = ANY(");
        qb.push_bind(filters.category_ids.clone());
        qb.push(")");
    }
    if filters.exclude_sold_out {
        qb.push(" AND d.sold_out = FALSE");
    }

    qb.push("\n ORDER BY d.created_at DESC, d.id DESC LIMIT ");
    qb.push_bind(DEAL_LIST_LIMIT as i64);
    qb
}

fn deal_list_item_from_row(row: &PgRow) -> Result<DealListItem, sqlx::Error> {
    let source = match row.try_get::<Option<String>, _>("source_source")? {
        Some(source) => Some(DealSource {
            source,
            post_url: row.try_get("source_post_url")?,
            title: row.try_get("source_title")?,
            thumb_url: row.try_get("source_thumb_url")?,
        }),
        None => None,
    };
    let buy_link = match row.try_get::<Option<String>, _>("link_url")? {
        Some(url) => Some(DealLink {
            url,
            domain: row.try_get("link_domain")?,
            is_affiliate: row.try_get("link_is_affiliate")?,
        }),
        None => None,
    };
    let metrics = match row.try_get::<Option<DateTime<Utc>>, _>("metric_captured_at")? {
        Some(captured_at) => Some(DealMetricSnapshot {
            views: row.try_get("metric_views")?,
            votes: row.try_get("metric_votes")?,
            comments: row.try_get("metric_comments")?,
            captured_at,
            source: row.try_get("metric_source")?,
        }),
        None => None,
    };

    Ok(DealListItem {
        id: row.try_get("id")?,
        category_id: row.try_get("category_id")?,
        category_name: category_name_or_unknown(row.try_get("category_name")?),
        title: row.try_get("title")?,
        shop_name: row.try_get("shop_name")?,
        subcategory: row.try_get("subcategory")?,
        price: row.try_get("price")?,
        shipping_type: ShippingType::from(row.try_get::<String, _>("shipping_type")?),
        sold_out: row.try_get("sold_out")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        created_at: row.try_get("created_at")?,
        source,
        buy_link,
        metrics,
    })
}

const CATEGORY_MAPPING_COLUMNS: &str = r#"
SELECT cm.source_category_id, cm.category_id, cm.created_at,
       sc.id AS sc_id, sc.source AS sc_source, sc.source_key AS sc_source_key, sc.name AS sc_name,
       c.id AS c_id, c.name AS c_name"#;

fn category_mapping_from_row(row: &PgRow) -> Result<CategoryMapping, sqlx::Error> {
    let source_categories = match row.try_get::<Option<i64>, _>("sc_id")? {
        Some(id) => Some(SourceCategoryRef {
            id,
            source: row.try_get("sc_source")?,
            source_key: row.try_get("sc_source_key")?,
            name: row.try_get("sc_name")?,
        }),
        None => None,
    };
    let categories = match row.try_get::<Option<i64>, _>("c_id")? {
        Some(id) => Some(Category {
            id,
            name: row.try_get("c_name")?,
        }),
        None => None,
    };
    Ok(CategoryMapping {
        source_category_id: row.try_get("source_category_id")?,
        category_id: row.try_get("category_id")?,
        created_at: row.try_get("created_at")?,
        source_categories,
        categories,
    })
}

fn shop_name_ref_from_row(row: &PgRow) -> Result<Option<ShopNameRef>, sqlx::Error> {
    Ok(match row.try_get::<Option<i64>, _>("sn_id")? {
        Some(id) => Some(ShopNameRef {
            id,
            name: row.try_get("sn_name")?,
        }),
        None => None,
    })
}

fn shop_name_mapping_from_row(row: &PgRow) -> Result<ShopNameMapping, sqlx::Error> {
    Ok(ShopNameMapping {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        raw_name: row.try_get("raw_name")?,
        shop_name_id: row.try_get("shop_name_id")?,
        created_at: row.try_get("created_at")?,
        shop_name_master: shop_name_ref_from_row(row)?,
    })
}

fn shop_domain_mapping_from_row(row: &PgRow) -> Result<ShopDomainMapping, sqlx::Error> {
    Ok(ShopDomainMapping {
        id: row.try_get("id")?,
        domain: row.try_get("domain")?,
        shop_name_id: row.try_get("shop_name_id")?,
        created_at: row.try_get("created_at")?,
        shop_name_master: shop_name_ref_from_row(row)?,
    })
}

/// Maps constraint violations on writes to their domain errors.
fn write_error(err: sqlx::Error, what: &str) -> StoreError {
    if let Some(db_err) = err.as_database_error() {
        if db_err.is_unique_violation() {
            return StoreError::Conflict(format!("{what} already exists"));
        }
        if db_err.is_foreign_key_violation() {
            return StoreError::UnknownReference(format!("{what} references a missing record"));
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl DealStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn list_categories(&self) -> StoreResult<Vec<Category>> {
        let rows = sqlx::query("SELECT id, name FROM categories ORDER BY name ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Category {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            });
        }
        Ok(out)
    }

    #[instrument(skip(self, filters), fields(source = ?filters.source, sort = %filters.sort))]
    async fn fetch_deal_window(&self, filters: &DealListFilters) -> StoreResult<Vec<DealListItem>> {
        let mut qb = build_deal_list_query(filters);
        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(deal_list_item_from_row(row)?);
        }
        debug!(rows = out.len(), "fetched deal window");
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn deal_detail(&self, deal_id: i64) -> StoreResult<Option<DealDetail>> {
        let sql = format!(
            "{DEAL_COLUMNS}\n  FROM deals d\n  LEFT JOIN categories c ON c.id = d.category_id\n WHERE d.id = $1"
        );
        // One snapshot for the parent row and its children.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let Some(row) = sqlx::query(&sql)
            .bind(deal_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        let source_rows = sqlx::query(
            r#"
            SELECT source, post_url, title, thumb_url
              FROM deal_sources
             WHERE deal_id = $1
             ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(deal_id)
        .fetch_all(&mut *tx)
        .await?;
        let mut sources = Vec::with_capacity(source_rows.len());
        for r in source_rows {
            sources.push(DealSource {
                source: r.try_get("source")?,
                post_url: r.try_get("post_url")?,
                title: r.try_get("title")?,
                thumb_url: r.try_get("thumb_url")?,
            });
        }

        let link_rows = sqlx::query(
            r#"
            SELECT url, domain, is_affiliate
              FROM deal_links
             WHERE deal_id = $1
             ORDER BY is_affiliate DESC, created_at DESC, id DESC
            "#,
        )
        .bind(deal_id)
        .fetch_all(&mut *tx)
        .await?;
        let mut links = Vec::with_capacity(link_rows.len());
        for r in link_rows {
            links.push(DealLink {
                url: r.try_get("url")?,
                domain: r.try_get("domain")?,
                is_affiliate: r.try_get("is_affiliate")?,
            });
        }

        let metric_rows = sqlx::query(
            r#"
            SELECT views, votes, comments, captured_at, source
              FROM deal_metrics_history
             WHERE deal_id = $1
             ORDER BY captured_at DESC, id DESC
             LIMIT $2
            "#,
        )
        .bind(deal_id)
        .bind(DETAIL_METRICS_LIMIT as i64)
        .fetch_all(&mut *tx)
        .await?;
        let mut metrics_history = Vec::with_capacity(metric_rows.len());
        for r in metric_rows {
            metrics_history.push(DealMetricSnapshot {
                views: r.try_get("views")?,
                votes: r.try_get("votes")?,
                comments: r.try_get("comments")?,
                captured_at: r.try_get("captured_at")?,
                source: r.try_get("source")?,
            });
        }

        tx.commit().await?;

        Ok(Some(DealDetail {
            id: row.try_get("id")?,
            category_id: row.try_get("category_id")?,
            category_name: category_name_or_unknown(row.try_get("category_name")?),
            title: row.try_get("title")?,
            shop_name: row.try_get("shop_name")?,
            subcategory: row.try_get("subcategory")?,
            price: row.try_get("price")?,
            shipping_type: ShippingType::from(row.try_get::<String, _>("shipping_type")?),
            sold_out: row.try_get("sold_out")?,
            thumbnail_url: row.try_get("thumbnail_url")?,
            created_at: row.try_get("created_at")?,
            sources,
            links,
            metrics_history,
        }))
    }

    async fn list_category_records(&self) -> StoreResult<Vec<CategoryRecord>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM categories ORDER BY name ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CategoryRecord {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    async fn create_category(&self, name: &NewName) -> StoreResult<CategoryRecord> {
        let row = sqlx::query("INSERT INTO categories (name) VALUES ($1) RETURNING id, name, created_at")
            .bind(name.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| write_error(e, "category"))?;
        Ok(CategoryRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn list_source_categories(&self) -> StoreResult<Vec<SourceCategory>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source, source_key, name, created_at
              FROM source_categories
             ORDER BY source ASC, name ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SourceCategory {
                id: row.try_get("id")?,
                source: row.try_get("source")?,
                source_key: row.try_get("source_key")?,
                name: row.try_get("name")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    async fn list_category_mappings(&self) -> StoreResult<Vec<CategoryMapping>> {
        let sql = format!(
            r#"{CATEGORY_MAPPING_COLUMNS}
  FROM category_mappings cm
  LEFT JOIN source_categories sc ON sc.id = cm.source_category_id
  LEFT JOIN categories c ON c.id = cm.category_id
 ORDER BY cm.created_at DESC, cm.source_category_id DESC"#
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(category_mapping_from_row(row)?);
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn upsert_category_mapping(&self, mapping: NewCategoryMapping) -> StoreResult<CategoryMapping> {
        let sql = format!(
            r#"WITH cm AS (
    INSERT INTO category_mappings (source_category_id, category_id)
    VALUES ($1, $2)
    ON CONFLICT (source_category_id) DO UPDATE SET category_id = EXCLUDED.category_id
    RETURNING source_category_id, category_id, created_at
){CATEGORY_MAPPING_COLUMNS}
  FROM cm
  LEFT JOIN source_categories sc ON sc.id = cm.source_category_id
  LEFT JOIN categories c ON c.id = cm.category_id"#
        );
        let row = sqlx::query(&sql)
            .bind(mapping.source_category_id)
            .bind(mapping.category_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| write_error(e, "category mapping"))?;
        Ok(category_mapping_from_row(&row)?)
    }

    async fn delete_category_mapping(&self, source_category_id: i64) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM category_mappings WHERE source_category_id = $1")
            .bind(source_category_id)
            .execute(&self.pool)
            .await?;
        debug!(source_category_id, deleted = result.rows_affected(), "category mapping delete");
        Ok(())
    }

    async fn list_shop_names(&self) -> StoreResult<Vec<ShopName>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM shop_name_master ORDER BY name ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ShopName {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    async fn create_shop_name(&self, name: &NewName) -> StoreResult<ShopName> {
        let row = sqlx::query("INSERT INTO shop_name_master (name) VALUES ($1) RETURNING id, name, created_at")
            .bind(name.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| write_error(e, "shop name"))?;
        Ok(ShopName {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn list_shop_name_mappings(&self) -> StoreResult<Vec<ShopNameMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.source, m.raw_name, m.shop_name_id, m.created_at,
                   sn.id AS sn_id, sn.name AS sn_name
              FROM shop_name_mappings m
              LEFT JOIN shop_name_master sn ON sn.id = m.shop_name_id
             ORDER BY m.created_at DESC, m.id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(shop_name_mapping_from_row(row)?);
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn upsert_shop_name_mapping(&self, mapping: &NewShopNameMapping) -> StoreResult<ShopNameMapping> {
        let row = sqlx::query(
            r#"
            WITH m AS (
                INSERT INTO shop_name_mappings (source, raw_name, shop_name_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (source, raw_name) DO UPDATE SET shop_name_id = EXCLUDED.shop_name_id
                RETURNING id, source, raw_name, shop_name_id, created_at
            )
            SELECT m.id, m.source, m.raw_name, m.shop_name_id, m.created_at,
                   sn.id AS sn_id, sn.name AS sn_name
              FROM m
              LEFT JOIN shop_name_master sn ON sn.id = m.shop_name_id
            "#,
        )
        .bind(&mapping.source)
        .bind(&mapping.raw_name)
        .bind(mapping.shop_name_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_error(e, "shop name mapping"))?;
        Ok(shop_name_mapping_from_row(&row)?)
    }

    async fn delete_shop_name_mapping(&self, key: &ShopNameMappingKey) -> StoreResult<()> {
        let result = match key {
            ShopNameMappingKey::Id(id) => {
                sqlx::query("DELETE FROM shop_name_mappings WHERE id = $1")
                    .bind(*id)
                    .execute(&self.pool)
                    .await?
            }
            ShopNameMappingKey::SourceRawName { source, raw_name } => {
                sqlx::query("DELETE FROM shop_name_mappings WHERE source = $1 AND raw_name = $2")
                    .bind(source)
                    .bind(raw_name)
                    .execute(&self.pool)
                    .await?
            }
        };
        debug!(?key, deleted = result.rows_affected(), "shop name mapping delete");
        Ok(())
    }

    async fn list_raw_shop_names(&self, limit: usize) -> StoreResult<Vec<RawShopName>> {
        let rows = sqlx::query(
            r#"
            SELECT source, shop_name_raw, created_at
              FROM deal_sources
             WHERE shop_name_raw IS NOT NULL
             ORDER BY created_at DESC, id DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RawShopName {
                source: row.try_get("source")?,
                shop_name_raw: row.try_get("shop_name_raw")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(dedupe_raw_shop_names(out))
    }

    async fn list_shop_domain_mappings(&self) -> StoreResult<Vec<ShopDomainMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.domain, m.shop_name_id, m.created_at,
                   sn.id AS sn_id, sn.name AS sn_name
              FROM shop_domain_mappings m
              LEFT JOIN shop_name_master sn ON sn.id = m.shop_name_id
             ORDER BY m.domain ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(shop_domain_mapping_from_row(row)?);
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn upsert_shop_domain_mapping(&self, mapping: &NewShopDomainMapping) -> StoreResult<ShopDomainMapping> {
        let row = sqlx::query(
            r#"
            WITH m AS (
                INSERT INTO shop_domain_mappings (domain, shop_name_id)
                VALUES ($1, $2)
                ON CONFLICT (domain) DO UPDATE SET shop_name_id = EXCLUDED.shop_name_id
                RETURNING id, domain, shop_name_id, created_at
            )
            SELECT m.id, m.domain, m.shop_name_id, m.created_at,
                   sn.id AS sn_id, sn.name AS sn_name
              FROM m
              LEFT JOIN shop_name_master sn ON sn.id = m.shop_name_id
            "#,
        )
        .bind(&mapping.domain)
        .bind(mapping.shop_name_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_error(e, "shop domain mapping"))?;
        Ok(shop_domain_mapping_from_row(&row)?)
    }

    async fn delete_shop_domain_mapping(&self, domain: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM shop_domain_mappings WHERE domain = $1")
            .bind(domain)
            .execute(&self.pool)
            .await?;
        debug!(domain, deleted = result.rows_affected(), "shop domain mapping delete");
        Ok(())
    }
}
