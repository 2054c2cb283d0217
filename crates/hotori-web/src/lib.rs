//! Axum JSON API for the Hotori deal viewer and admin console.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path as AxumPath, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use hotori_core::{
    clamp_raw_shop_names_limit, normalize_domain, Category, CategoryMapping, CategoryRecord,
    DealDetail, DealListFilters, DealListItem, DealSortKey, InputError, NewCategoryMapping,
    NewName, NewShopDomainMapping, NewShopNameMapping, RawShopName, ShopDomainMapping, ShopName,
    ShopNameMapping, ShopNameMappingKey, SourceCategory,
};
use hotori_storage::{DealStore, StoreError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "hotori-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DealStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn DealStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HOTORI_WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("HOTORI_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Not found")]
    NotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<InputError> for ApiError {
    fn from(err: InputError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Store(StoreError::UnknownReference(_)) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
struct Ack {
    ok: bool,
}

fn ack() -> ApiResult<Ack> {
    Ok(Json(Ack { ok: true }))
}

/// Query string of `GET /api/deals`.
///
/// Built from raw pairs so repeated keys never reject the request: scalar
/// keys keep their first value, every `categoryId` and `categoryIds` value is
/// collected.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DealListQuery {
    pub q: Option<String>,
    pub source: Option<String>,
    pub category_ids: Vec<String>,
    pub sold_out: Option<String>,
    pub sort: Option<String>,
}

impl DealListQuery {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut out = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_str() {
                "q" => &mut out.q,
                "source" => &mut out.source,
                "soldOut" => &mut out.sold_out,
                "sort" => &mut out.sort,
                "categoryId" | "categoryIds" => {
                    out.category_ids.push(value);
                    continue;
                }
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value);
            }
        }
        out
    }

    /// Comma-separated category values are split and merged; non-numeric ids are ignored.
    pub fn into_filters(self) -> DealListFilters {
        let category_ids = self
            .category_ids
            .iter()
            .flat_map(|raw| raw.split(','))
            .filter_map(|part| part.trim().parse::<i64>().ok())
            .collect();
        DealListFilters {
            query: self.q,
            source: self.source,
            category_ids,
            exclude_sold_out: matches!(self.sold_out.as_deref(), Some("1" | "true")),
            sort: DealSortKey::parse_lenient(self.sort.as_deref()),
        }
        .normalized()
    }
}

#[derive(Debug, Deserialize)]
struct NameBody {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CategoryMappingBody {
    source_category_id: Option<i64>,
    category_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShopNameMappingBody {
    source: Option<String>,
    raw_name: Option<String>,
    shop_name_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShopDomainMappingBody {
    domain: Option<String>,
    shop_name_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CategoryMappingDeleteQuery {
    source_category_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShopNameMappingDeleteQuery {
    id: Option<String>,
    source: Option<String>,
    raw_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ShopDomainMappingDeleteQuery {
    domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawShopNamesQuery {
    limit: Option<String>,
}

fn query<T>(extracted: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    Ok(extracted?.0)
}

fn body<T: DeserializeOwned>(extracted: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    Ok(extracted?.0)
}

fn parse_id(raw: Option<&str>) -> Option<i64> {
    raw.and_then(|v| v.trim().parse().ok())
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/deals", get(list_deals_handler))
        .route("/api/deals/{id}", get(deal_detail_handler))
        .route("/api/categories", get(categories_handler))
        .route(
            "/api/admin/categories",
            get(admin_categories_handler).post(create_category_handler),
        )
        .route("/api/admin/source-categories", get(source_categories_handler))
        .route(
            "/api/admin/category-mappings",
            get(category_mappings_handler)
                .post(upsert_category_mapping_handler)
                .delete(delete_category_mapping_handler),
        )
        .route(
            "/api/admin/shop-names",
            get(shop_names_handler).post(create_shop_name_handler),
        )
        .route(
            "/api/admin/shop-name-mappings",
            get(shop_name_mappings_handler)
                .post(upsert_shop_name_mapping_handler)
                .delete(delete_shop_name_mapping_handler),
        )
        .route("/api/admin/raw-shop-names", get(raw_shop_names_handler))
        .route(
            "/api/admin/shop-domain-mappings",
            get(shop_domain_mappings_handler)
                .post(upsert_shop_domain_mapping_handler)
                .delete(delete_shop_domain_mapping_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, config: WebConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!(
        address = %listener.local_addr()?,
        backend = state.store.backend(),
        "hotori web listening"
    );
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("hotori web stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("received ctrl-c, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(err) => {
                error!(%err, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn list_deals_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> ApiResult<Vec<DealListItem>> {
    let filters = DealListQuery::from_pairs(query(params)?).into_filters();
    Ok(Json(state.store.list_deals(&filters).await?))
}

async fn deal_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<DealDetail> {
    let deal_id = parse_id(Some(&id)).ok_or_else(|| ApiError::BadRequest("Invalid deal id".into()))?;
    match state.store.deal_detail(deal_id).await? {
        Some(detail) => Ok(Json(detail)),
        None => Err(ApiError::NotFound),
    }
}

async fn categories_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Category>> {
    Ok(Json(state.store.list_categories().await?))
}

async fn admin_categories_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<CategoryRecord>> {
    Ok(Json(state.store.list_category_records().await?))
}

async fn create_category_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NameBody>, JsonRejection>,
) -> ApiResult<CategoryRecord> {
    let name = NewName::parse(body(payload)?.name.as_deref())?;
    let created = state.store.create_category(&name).await?;
    info!(id = created.id, name = %created.name, "category created");
    Ok(Json(created))
}

async fn source_categories_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<SourceCategory>> {
    Ok(Json(state.store.list_source_categories().await?))
}

async fn category_mappings_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<CategoryMapping>> {
    Ok(Json(state.store.list_category_mappings().await?))
}

async fn upsert_category_mapping_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CategoryMappingBody>, JsonRejection>,
) -> ApiResult<CategoryMapping> {
    let payload = body(payload)?;
    let mapping = NewCategoryMapping::parse(payload.source_category_id, payload.category_id)?;
    Ok(Json(state.store.upsert_category_mapping(mapping).await?))
}

async fn delete_category_mapping_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<CategoryMappingDeleteQuery>, QueryRejection>,
) -> ApiResult<Ack> {
    let source_category_id = parse_id(query(params)?.source_category_id.as_deref())
        .ok_or_else(|| ApiError::BadRequest("sourceCategoryId is required".into()))?;
    state.store.delete_category_mapping(source_category_id).await?;
    ack()
}

async fn shop_names_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ShopName>> {
    Ok(Json(state.store.list_shop_names().await?))
}

async fn create_shop_name_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NameBody>, JsonRejection>,
) -> ApiResult<ShopName> {
    let name = NewName::parse(body(payload)?.name.as_deref())?;
    let created = state.store.create_shop_name(&name).await?;
    info!(id = created.id, name = %created.name, "shop name created");
    Ok(Json(created))
}

async fn shop_name_mappings_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<ShopNameMapping>> {
    Ok(Json(state.store.list_shop_name_mappings().await?))
}

async fn upsert_shop_name_mapping_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ShopNameMappingBody>, JsonRejection>,
) -> ApiResult<ShopNameMapping> {
    let payload = body(payload)?;
    let mapping = NewShopNameMapping::parse(
        payload.source.as_deref(),
        payload.raw_name.as_deref(),
        payload.shop_name_id,
    )?;
    Ok(Json(state.store.upsert_shop_name_mapping(&mapping).await?))
}

async fn delete_shop_name_mapping_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ShopNameMappingDeleteQuery>, QueryRejection>,
) -> ApiResult<Ack> {
    let params = query(params)?;
    let key = ShopNameMappingKey::parse(
        parse_id(params.id.as_deref()),
        params.source.as_deref(),
        params.raw_name.as_deref(),
    )?;
    state.store.delete_shop_name_mapping(&key).await?;
    ack()
}

async fn raw_shop_names_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<RawShopNamesQuery>, QueryRejection>,
) -> ApiResult<Vec<RawShopName>> {
    let limit = clamp_raw_shop_names_limit(query(params)?.limit.as_deref());
    Ok(Json(state.store.list_raw_shop_names(limit).await?))
}

async fn shop_domain_mappings_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<ShopDomainMapping>> {
    Ok(Json(state.store.list_shop_domain_mappings().await?))
}

async fn upsert_shop_domain_mapping_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ShopDomainMappingBody>, JsonRejection>,
) -> ApiResult<ShopDomainMapping> {
    let payload = body(payload)?;
    let mapping = NewShopDomainMapping::parse(payload.domain.as_deref(), payload.shop_name_id)?;
    Ok(Json(state.store.upsert_shop_domain_mapping(&mapping).await?))
}

async fn delete_shop_domain_mapping_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ShopDomainMappingDeleteQuery>, QueryRejection>,
) -> ApiResult<Ack> {
    let domain = query(params)?
        .domain
        .as_deref()
        .and_then(normalize_domain)
        .ok_or_else(|| ApiError::BadRequest("domain is required".into()))?;
    state.store.delete_shop_domain_mapping(&domain).await?;
    ack()
}
