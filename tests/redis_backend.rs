//! Redis-backed remote cache and write-behind stream.
//!
//! These tests start a Redis container with testcontainers:
//! ```bash
//! cargo test --test redis_backend -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};
use tiered_orm::cache::RemoteCommand;
use tiered_orm::{
    EntitySchema, EventBus, FieldDescriptor, InMemoryPool, LazyFlushConfig, RedisCache, RedisStreamBus, Registry,
    RemoteCache,
};

fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

fn redis_url(container: &Container<'_, GenericImage>) -> String {
    format!("redis://127.0.0.1:{}", container.get_host_port_ipv4(6379))
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_cache_hash_set_and_list_commands() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let cache = RedisCache::new("default", &redis_url(&redis), Some("t:")).await.unwrap();

    assert!(cache.hset_nx("User:Email", "a@b.c", b"7").await.unwrap());
    assert!(!cache.hset_nx("User:Email", "a@b.c", b"8").await.unwrap());
    assert_eq!(cache.hget("User:Email", "a@b.c").await.unwrap(), Some(b"7".to_vec()));

    cache
        .pipeline(&[
            RemoteCommand::HSet { key: "User".into(), field: "1".into(), value: vec![1, 2, 3] },
            RemoteCommand::SAdd { key: "Product:Category:5".into(), members: vec!["Y".into(), "3".into()] },
        ])
        .await
        .unwrap();
    let values = cache.hmget("User", &["1".to_string(), "2".to_string()]).await.unwrap();
    assert_eq!(values, vec![Some(vec![1, 2, 3]), None]);

    let mut members = cache.smembers("Product:Category:5").await.unwrap();
    members.sort();
    assert_eq!(members, vec!["3", "Y"]);

    assert_eq!(cache.hincr_by("_orm_ids", "User", 5).await.unwrap(), 5);
    assert_eq!(cache.hincr_by("_orm_ids", "User", 1).await.unwrap(), 6);

    cache.rpush("errors", &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]).await.unwrap();
    cache.ltrim("errors", -2, -1).await.unwrap();
    assert_eq!(cache.lrange("errors", 0, -1).await.unwrap(), vec![b"b".to_vec(), b"c".to_vec()]);

    cache.del(&["User".to_string()]).await.unwrap();
    assert_eq!(cache.hget("User", "1").await.unwrap(), None);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_stream_redelivers_unacked_events() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let bus = RedisStreamBus::new(&redis_url(&redis), None).await.unwrap();

    bus.ensure_group("orm-lazy", "g").await.unwrap();
    // second call on an existing group is a no-op
    bus.ensure_group("orm-lazy", "g").await.unwrap();
    bus.publish("orm-lazy", b"one").await.unwrap();
    bus.publish("orm-lazy", b"two").await.unwrap();

    let first = bus.read("orm-lazy", "g", "c1", 10, Some(Duration::from_millis(50))).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].payload, b"one");

    // not acked: the same consumer sees them again
    let again = bus.read("orm-lazy", "g", "c1", 10, Some(Duration::from_millis(50))).await.unwrap();
    assert_eq!(again.iter().map(|e| &e.id).collect::<Vec<_>>(), first.iter().map(|e| &e.id).collect::<Vec<_>>());

    let ids: Vec<String> = first.iter().map(|e| e.id.clone()).collect();
    bus.ack("orm-lazy", "g", &ids).await.unwrap();
    assert_eq!(bus.stream_len("orm-lazy").await.unwrap(), 0);
    assert!(bus
        .read("orm-lazy", "g", "c1", 10, Some(Duration::from_millis(50)))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_lazy_flush_end_to_end() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = redis_url(&redis);
    let cache = RedisCache::new("default", &url, None).await.unwrap();
    let bus = RedisStreamBus::from_connection(cache.connection(), None);

    let mut registry = Registry::new();
    registry.register_storage_pool(Arc::new(InMemoryPool::new("default")));
    registry.register_remote_cache(Arc::new(cache));
    registry.register_event_bus(Arc::new(bus));
    registry.set_lazy_flush_config(LazyFlushConfig { block_ms: 50, ..Default::default() });
    registry.register_entity(
        EntitySchema::new("User")
            .field(FieldDescriptor::text("Name"))
            .field(FieldDescriptor::text("Email").nullable())
            .unique("Email", &["Email"])
            .remote_cache("default")
            .local_cache(100),
    );
    let engine = registry.validate().unwrap();

    let mut ctx = engine.context();
    let user = ctx.new_record("User").await.unwrap();
    user.set("Name", "John").unwrap();
    user.set("Email", "john@example.com").unwrap();
    let id = user.id();
    ctx.flush_lazy().await.unwrap();

    let stats = engine.lazy_statistics().unwrap();
    assert_eq!(stats.events_count().await.unwrap(), 1);
    assert_eq!(engine.lazy_consumer().unwrap().digest().await.unwrap(), 1);
    assert_eq!(stats.events_count().await.unwrap(), 0);
    assert_eq!(stats.errors_count().await.unwrap(), 0);

    engine.clear_local_caches();
    let stored = engine.context().get_by_id("User", id).await.unwrap().unwrap();
    assert_eq!(stored.get("Email").unwrap().as_str(), Some("john@example.com"));
}
