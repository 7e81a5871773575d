use std::sync::Arc;

use viewcache_service::caching::shared_cache::PLAN_STORE_VERSION;
use viewcache_service::caching::{CacheError, Caches, ViewExecutionCacheKey};
use viewcache_service::config::Config;
use viewcache_service::types::{ProviderHint, UniqueId};
use viewcache_test::{setup, tempdir};

use crate::utils;

fn filesystem_config(path: &std::path::Path) -> Config {
    let yaml = format!(
        r#"
        caches:
          in_memory:
            plan_capacity: 100000
            time_to_idle: 10m
        shared_cache:
          backend: filesystem
          path: {}
        "#,
        path.display()
    );
    Config::from_reader(yaml.as_bytes()).unwrap()
}

#[test]
fn test_key_requires_hints() {
    let err = ViewExecutionCacheKey::of(UniqueId::of("DbCfg", "view-1"), vec![]).unwrap_err();
    assert!(matches!(err, CacheError::InvalidArgument(_)));

    let key = ViewExecutionCacheKey::of(
        UniqueId::of("DbCfg", "view-1"),
        vec![ProviderHint::from("bloomberg"), ProviderHint::from("reuters")],
    )
    .unwrap();
    insta::assert_snapshot!(key.metadata(), @r###"
    view: "DbCfg~view-1"
    hint: "bloomberg"
    hint: "reuters"
    "###);
}

#[tokio::test]
async fn test_provider_scenario() {
    setup();
    let cache_dir = tempdir();
    let config = filesystem_config(cache_dir.path());
    let caches = Caches::from_config(&config, utils::resolver(&["view-1"]));

    let a = utils::key("view-1", &["provider-x"]);
    let b = utils::key("view-1", &["provider-y"]);
    let plan_a = utils::plan("view-1", 1);

    caches.plans.put(&a, Arc::new(utils::plan("view-1", 1))).await;
    assert!(caches.plans.get(&b).await.is_none());
    assert_eq!(*caches.plans.get(&a).await.unwrap(), plan_a);

    caches.plans.clear().await;
    assert!(caches.plans.get(&a).await.is_none());
}

#[tokio::test]
async fn test_plans_are_shared_between_caches() {
    setup();
    let cache_dir = tempdir();
    let config = filesystem_config(cache_dir.path());

    let resolver = utils::resolver(&["view-1", "view-2"]);
    let first = Caches::from_config(&config, resolver.clone());
    let second = Caches::from_config(&config, resolver);

    let key = utils::key("view-2", &["provider-x", "provider-y"]);
    let plan = utils::plan("view-2", 7);
    first.plans.put(&key, Arc::new(utils::plan("view-2", 7))).await;

    let path = cache_dir.path().join(key.cache_path(PLAN_STORE_VERSION));
    assert!(path.is_file());

    let shared = second.plans.get(&key).await.unwrap();
    assert_eq!(*shared, plan);
    assert_eq!(shared.graph("Stressed").unwrap().len(), 5);
    assert_eq!(shared.resolved_identifiers().len(), 10);
    assert_eq!(shared.function_init_id(), 7);

    // the order of the hints matters
    let reversed = utils::key("view-2", &["provider-y", "provider-x"]);
    assert!(second.plans.get(&reversed).await.is_none());
}

#[tokio::test]
async fn test_entries_of_dropped_caches_are_misses() {
    setup();
    let cache_dir = tempdir();
    let config = filesystem_config(cache_dir.path());
    let key = utils::key("view-1", &["provider-x"]);

    let writer = Caches::from_config(&config, utils::resolver(&["view-1"]));
    writer.plans.put(&key, Arc::new(utils::plan("view-1", 1))).await;
    drop(writer);

    // the entry is still there, but nobody can rehydrate it anymore
    assert!(cache_dir.path().join(key.cache_path(PLAN_STORE_VERSION)).is_file());
    let reader = Caches::from_config(&config, utils::resolver(&["view-1"]));
    assert!(reader.plans.get(&key).await.is_none());
}

#[tokio::test]
async fn test_corrupt_files_are_misses() {
    setup();
    let cache_dir = tempdir();
    let config = filesystem_config(cache_dir.path());
    let caches = Caches::from_config(&config, utils::resolver(&["view-1"]));
    let key = utils::key("view-1", &["provider-x"]);

    let path = cache_dir.path().join(key.cache_path(PLAN_STORE_VERSION));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"VECP\x01\x00garbage").unwrap();
    assert!(caches.plans.get(&key).await.is_none());

    // and are overwritten by the next put
    caches.plans.put(&key, Arc::new(utils::plan("view-1", 1))).await;
    let other = Caches::from_config(&config, utils::resolver(&["view-1"]));
    assert!(other.plans.get(&key).await.is_some());
}
