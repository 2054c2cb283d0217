use std::path::{Path, PathBuf};

use chrono::{Duration, TimeZone, Utc};
use hotori_core::{
    DealListFilters, DealSortKey, NewCategoryMapping, NewName, NewShopDomainMapping,
    NewShopNameMapping, ShippingType, ShopNameMappingKey, DEAL_LIST_LIMIT,
};
use hotori_storage::{
    DealRow, DealSourceRow, DealStore, FixtureSnapshot, MemoryStore, StoreError,
};

fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/deals.json")
}

async fn fixture_store() -> MemoryStore {
    MemoryStore::load(fixture_path()).await.expect("fixture loads")
}

fn ids(items: &[hotori_core::DealListItem]) -> Vec<i64> {
    items.iter().map(|i| i.id).collect()
}

#[tokio::test]
async fn latest_sort_orders_by_creation_then_id() {
    let store = fixture_store().await;
    let deals = store.list_deals(&DealListFilters::default()).await.unwrap();
    assert_eq!(ids(&deals), vec![6, 5, 4, 3, 2, 1]);
}

#[tokio::test]
async fn representative_children_follow_relation_ordering() {
    let store = fixture_store().await;
    let deals = store.list_deals(&DealListFilters::default()).await.unwrap();
    let deal1 = deals.iter().find(|d| d.id == 1).unwrap();

    assert_eq!(deal1.source.as_ref().unwrap().source, "ruliweb");
    let link = deal1.buy_link.as_ref().unwrap();
    assert!(link.is_affiliate);
    assert_eq!(link.domain, "link.coupang.com");
    assert_eq!(deal1.metrics.as_ref().unwrap().views, Some(1200));

    let deal6 = deals.iter().find(|d| d.id == 6).unwrap();
    assert_eq!(
        deal6.buy_link.as_ref().unwrap().url,
        "https://www.coupang.com/vp/products/6002"
    );

    let deal4 = deals.iter().find(|d| d.id == 4).unwrap();
    assert!(deal4.source.is_none());
    assert!(deal4.buy_link.is_none());
    assert!(deal4.metrics.is_none());
}

#[tokio::test]
async fn missing_category_reports_unknown() {
    let store = fixture_store().await;
    let deals = store.list_deals(&DealListFilters::default()).await.unwrap();
    let deal5 = deals.iter().find(|d| d.id == 5).unwrap();
    assert_eq!(deal5.category_name, "UNKNOWN");
    assert_eq!(deal5.shipping_type, ShippingType::Other("CONDITIONAL".into()));
}

#[tokio::test]
async fn source_filter_uses_inner_join_semantics() {
    let store = fixture_store().await;
    let filters = DealListFilters {
        source: Some("ppomppu".into()),
        ..Default::default()
    };
    let deals = store.list_deals(&filters).await.unwrap();
    assert_eq!(ids(&deals), vec![6, 3, 2, 1]);
    // deal 1 has a newer ruliweb record; the filtered view must show the ppomppu one.
    let deal1 = deals.iter().find(|d| d.id == 1).unwrap();
    assert_eq!(deal1.source.as_ref().unwrap().source, "ppomppu");
    assert!(deals.iter().all(|d| d.source.as_ref().unwrap().source == "ppomppu"));
}

#[tokio::test]
async fn metric_sorts_put_missing_values_last_and_stay_stable() {
    let store = fixture_store().await;
    let by_views = store
        .list_deals(&DealListFilters {
            sort: DealSortKey::Views,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&by_views), vec![5, 1, 6, 2, 4, 3]);

    let by_votes = store
        .list_deals(&DealListFilters {
            sort: DealSortKey::Votes,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&by_votes), vec![5, 1, 6, 3, 4, 2]);
}

#[tokio::test]
async fn text_category_and_sold_out_filters_combine() {
    let store = fixture_store().await;

    let ssd = store
        .list_deals(&DealListFilters {
            query: Some("ssd".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&ssd), vec![1]);

    let food = store
        .list_deals(&DealListFilters {
            category_ids: vec![2],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&food), vec![6, 2]);

    let available_food = store
        .list_deals(&DealListFilters {
            category_ids: vec![2],
            exclude_sold_out: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&available_food), vec![6]);
}

#[tokio::test]
async fn repeated_calls_return_identical_output() {
    let store = fixture_store().await;
    let filters = DealListFilters {
        sort: DealSortKey::Comments,
        ..Default::default()
    };
    let first = store.list_deals(&filters).await.unwrap();
    let second = store.list_deals(&filters).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn window_is_capped_even_when_filtering_by_source() {
    let base = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
    let mut snapshot = FixtureSnapshot::default();
    for id in 1..=250 {
        let created_at = base + Duration::minutes(id);
        snapshot.deals.push(DealRow {
            id,
            category_id: 1,
            title: format!("deal {id}"),
            shop_name: None,
            subcategory: None,
            price: None,
            shipping_type: ShippingType::Unknown,
            sold_out: false,
            thumbnail_url: None,
            created_at,
        });
        snapshot.deal_sources.push(DealSourceRow {
            id,
            deal_id: id,
            source: "ppomppu".into(),
            post_url: format!("https://example.com/{id}"),
            title: format!("deal {id}"),
            thumb_url: None,
            shop_name_raw: None,
            source_category_id: None,
            created_at,
        });
    }
    let store = MemoryStore::new(snapshot);

    let all = store.list_deals(&DealListFilters::default()).await.unwrap();
    assert_eq!(all.len(), DEAL_LIST_LIMIT);
    assert_eq!(all[0].id, 250);
    assert_eq!(all.last().unwrap().id, 51);

    let filtered = store
        .list_deals(&DealListFilters {
            source: Some("ppomppu".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(filtered.len(), DEAL_LIST_LIMIT);
}

#[tokio::test]
async fn detail_carries_full_child_collections() {
    let store = fixture_store().await;
    let detail = store.deal_detail(1).await.unwrap().expect("deal 1 exists");
    let sources: Vec<_> = detail.sources.iter().map(|s| s.source.as_str()).collect();
    assert_eq!(sources, vec!["ruliweb", "ppomppu"]);
    assert!(detail.links[0].is_affiliate);
    assert_eq!(detail.links.len(), 2);
    assert_eq!(detail.metrics_history.len(), 2);
    assert_eq!(detail.metrics_history[0].views, Some(1200));

    assert!(store.deal_detail(404).await.unwrap().is_none());
}

#[tokio::test]
async fn category_mapping_upsert_replaces_by_source_category() {
    let store = fixture_store().await;
    let created = store
        .upsert_category_mapping(NewCategoryMapping {
            source_category_id: 3,
            category_id: 1,
        })
        .await
        .unwrap();
    assert_eq!(created.source_categories.as_ref().unwrap().source, "ruliweb");
    assert_eq!(created.categories.as_ref().unwrap().name, "디지털");

    let updated = store
        .upsert_category_mapping(NewCategoryMapping {
            source_category_id: 3,
            category_id: 3,
        })
        .await
        .unwrap();
    assert_eq!(updated.category_id, 3);
    assert_eq!(updated.created_at, created.created_at);

    let mappings = store.list_category_mappings().await.unwrap();
    assert_eq!(mappings.len(), 3);
    assert_eq!(mappings[0].source_category_id, 3);

    store.delete_category_mapping(3).await.unwrap();
    assert_eq!(store.list_category_mappings().await.unwrap().len(), 2);
}

#[tokio::test]
async fn upserts_reject_unknown_references() {
    let store = fixture_store().await;
    let err = store
        .upsert_category_mapping(NewCategoryMapping {
            source_category_id: 77,
            category_id: 1,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownReference(_)));

    let err = store
        .upsert_shop_domain_mapping(&NewShopDomainMapping {
            domain: "11st.co.kr".into(),
            shop_name_id: 42,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownReference(_)));
}

#[tokio::test]
async fn shop_name_mappings_upsert_on_source_and_raw_name() {
    let store = fixture_store().await;
    let mapping = NewShopNameMapping {
        source: "ppomppu".into(),
        raw_name: "쿠팡".into(),
        shop_name_id: 2,
    };
    let updated = store.upsert_shop_name_mapping(&mapping).await.unwrap();
    assert_eq!(updated.id, 1);
    assert_eq!(updated.shop_name_master.as_ref().unwrap().name, "11번가");

    store
        .delete_shop_name_mapping(&ShopNameMappingKey::SourceRawName {
            source: "ppomppu".into(),
            raw_name: "쿠팡".into(),
        })
        .await
        .unwrap();
    store
        .delete_shop_name_mapping(&ShopNameMappingKey::Id(2))
        .await
        .unwrap();
    assert!(store.list_shop_name_mappings().await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_master_names_conflict() {
    let store = fixture_store().await;
    let err = store
        .create_shop_name(&NewName::parse(Some("쿠팡")).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let created = store
        .create_category(&NewName::parse(Some("가전")).unwrap())
        .await
        .unwrap();
    assert_eq!(created.id, 4);
    let names: Vec<_> = store
        .list_category_records()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["가전", "디지털", "생활", "식품"]);
}

#[tokio::test]
async fn raw_shop_names_are_distinct_and_newest_first() {
    let store = fixture_store().await;
    let rows = store.list_raw_shop_names(200).await.unwrap();
    let pairs: Vec<_> = rows
        .iter()
        .map(|r| (r.source.as_str(), r.shop_name_raw.as_deref().unwrap()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("ppomppu", "쿠팡"),
            ("ruliweb", "LG전자"),
            ("ppomppu", "지마켓"),
            ("quasarzone", "G마켓"),
            ("ppomppu", "11번가"),
            ("ruliweb", "coupang"),
        ]
    );
}

#[tokio::test]
async fn domain_mappings_stay_sorted_by_domain() {
    let store = fixture_store().await;
    store
        .upsert_shop_domain_mapping(&NewShopDomainMapping::parse(Some(" 11ST.co.kr "), Some(2)).unwrap())
        .await
        .unwrap();
    let domains: Vec<_> = store
        .list_shop_domain_mappings()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.domain)
        .collect();
    assert_eq!(domains, vec!["11st.co.kr", "coupang.com", "gmarket.co.kr"]);

    store.delete_shop_domain_mapping("coupang.com").await.unwrap();
    assert_eq!(store.list_shop_domain_mappings().await.unwrap().len(), 2);
}
