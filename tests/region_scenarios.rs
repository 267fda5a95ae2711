//! End-to-end region behaviour through the public API, against the
//! in-memory store with paused time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use regioncache::{
    InMemoryKv, KvClient, KvValue, ReadWriteAccess, Region, RegionConfig, RegionProperties,
};
use serde_json::json;
use tokio::time::advance;

fn region(config: RegionConfig) -> (Arc<InMemoryKv>, Region<InMemoryKv>) {
    let kv = Arc::new(InMemoryKv::new());
    let region = Region::new(Arc::clone(&kv), config).unwrap();
    (kv, region)
}

#[tokio::test(start_paused = true)]
async fn products_value_expires_after_its_ttl() {
    let (_, products) = region(RegionConfig {
        cache_ttl: Duration::from_secs(5),
        ..RegionConfig::new("products")
    });

    assert!(products.set("p1", Duration::from_secs(5), "widget".into()).await.unwrap());
    assert_eq!(products.get("p1").await.unwrap(), Some(KvValue::from("widget")));

    advance(Duration::from_secs(6)).await;
    assert_eq!(products.get("p1").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn dogpile_lets_one_caller_refresh() {
    let (_, products) = region(RegionConfig {
        cache_ttl: Duration::from_secs(10),
        dogpile_enabled: true,
        dogpile_expiration_factor: 3.0,
        ..RegionConfig::new("products")
    });
    products.set_default("p1", "widget".into()).await.unwrap();

    advance(Duration::from_secs(12)).await;
    assert_eq!(products.get("p1").await.unwrap(), None);
    assert_eq!(products.get("p1").await.unwrap(), Some(KvValue::from("widget")));

    // the refresher's write arms a new token
    products.set_default("p1", "gadget".into()).await.unwrap();
    assert_eq!(products.get("p1").await.unwrap(), Some(KvValue::from("gadget")));

    advance(Duration::from_secs(31)).await;
    assert_eq!(products.get("p1").await.unwrap(), None);
    assert_eq!(products.get("p1").await.unwrap(), None);
}

#[tokio::test]
async fn clear_orphans_every_key_of_the_region_only() {
    let kv = Arc::new(InMemoryKv::new());
    let products = Region::new(
        Arc::clone(&kv),
        RegionConfig {
            clear_enabled: true,
            ..RegionConfig::new("products")
        },
    )
    .unwrap();
    let users = Region::new(
        Arc::clone(&kv),
        RegionConfig {
            clear_enabled: true,
            ..RegionConfig::new("users")
        },
    )
    .unwrap();

    products.set_default("p1", "widget".into()).await.unwrap();
    products.set_default("p2", "gadget".into()).await.unwrap();
    users.set_default("u1", "ada".into()).await.unwrap();

    assert!(products.clear().await);
    let found = products.get_multi(&["p1", "p2"]).await.unwrap();
    assert!(found.is_empty());
    assert_eq!(users.get("u1").await.unwrap(), Some(KvValue::from("ada")));

    // new writes land in the new generation
    products.set_default("p1", "widget-2".into()).await.unwrap();
    assert_eq!(products.get("p1").await.unwrap(), Some(KvValue::from("widget-2")));
}

#[tokio::test(start_paused = true)]
async fn write_lock_is_exclusive_across_tasks() {
    let (_, products) = region(RegionConfig::new("products"));
    let holders = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let products = products.clone();
        let holders = Arc::clone(&holders);
        let max_seen = Arc::clone(&max_seen);
        tasks.push(tokio::spawn(async move {
            assert!(products.acquire_write_lock("p1").await.unwrap());
            let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            holders.fetch_sub(1, Ordering::SeqCst);
            assert!(products.release_write_lock("p1").await.unwrap());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn readers_share_and_writers_wait() {
    let (_, products) = region(RegionConfig::new("products"));
    assert!(products.acquire_read_lock("p1").await.unwrap());
    assert!(products.acquire_read_lock("p1").await.unwrap());

    let writer = {
        let products = products.clone();
        tokio::spawn(async move { products.acquire_write_lock("p1").await.unwrap() })
    };
    advance(Duration::from_millis(200)).await;
    assert!(!writer.is_finished());

    products.release_read_lock("p1").await.unwrap();
    products.release_read_lock("p1").await.unwrap();
    assert!(writer.await.unwrap());
    assert!(products.release_write_lock("p1").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn soft_lock_round_trip() {
    let (_, products) = region(RegionConfig::new("products"));
    let access: ReadWriteAccess<_, String> = ReadWriteAccess::new(products.clone());

    let handle = access.lock_item("p1", Some(json!(1))).await.unwrap().unwrap();
    let ts = products.next_timestamp();
    assert!(
        !access
            .put_from_load("p1", "stale".to_owned(), ts, Some(json!(1)), false)
            .await
            .unwrap()
    );
    assert_eq!(access.get("p1", ts + 1).await.unwrap(), None);

    assert!(access.unlock_item("p1", &handle).await.unwrap());
    assert!(!access.unlock_item("p1", &handle).await.unwrap());

    let ts = products.next_timestamp() + 1;
    assert!(
        access
            .put_from_load("p1", "widget".to_owned(), ts, Some(json!(2)), false)
            .await
            .unwrap()
    );
    let read_ts = products.next_timestamp() + 1;
    assert_eq!(access.get("p1", read_ts).await.unwrap(), Some("widget".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn region_configured_from_properties() {
    let props: RegionProperties = [
        ("regioncache.cacheTimeSeconds", "30"),
        ("regioncache.dogpilePrevention", "true"),
        ("regioncache.products.cacheTimeSeconds", "5"),
        ("regioncache.products.dogpilePrevention", "false"),
        ("regioncache.products.keyEncodingStrategy", "identity"),
    ]
    .into_iter()
    .collect();

    let config = props.region_config("products").unwrap();
    assert_eq!(config.cache_ttl, Duration::from_secs(5));
    assert!(!config.dogpile_enabled);

    let (kv, products) = region(config);
    products.set_default("p1", "widget".into()).await.unwrap();
    assert_eq!(kv.get("products:0:p1").await.unwrap(), Some(KvValue::from("widget")));

    advance(Duration::from_secs(6)).await;
    assert_eq!(products.get("p1").await.unwrap(), None);

    let users = props.region_config("users").unwrap();
    assert_eq!(users.cache_ttl, Duration::from_secs(30));
    assert!(users.dogpile_enabled);
}
