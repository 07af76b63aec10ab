use std::time::Duration;

use super::*;
use crate::test_support::{ids, private_message, public_message};

const ME: UserId = UserId(1);

async fn memory_cache() -> Arc<Storage> {
    Arc::new(Storage::new("sqlite::memory:").await.expect("db"))
}

/// Polls the cache until `check` accepts the loaded snapshot.
async fn wait_for_cache(
    cache: &Storage,
    owner: UserId,
    check: impl Fn(&ChannelSnapshot) -> bool,
) -> ChannelSnapshot {
    let mut snapshot = ChannelSnapshot::default();
    for _ in 0..200 {
        snapshot = ChatCache::load(cache, owner).await.expect("load");
        if check(&snapshot) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    snapshot
}

#[tokio::test]
async fn storage_round_trips_a_snapshot() {
    let cache = memory_cache().await;
    let mut snapshot = ChannelSnapshot {
        public: vec![public_message(1, 3, 0)],
        unread_public: 2,
        ..ChannelSnapshot::default()
    };
    snapshot
        .private
        .insert(UserId(7), vec![private_message(2, 7, 1, 0), private_message(3, 1, 7, 5)]);
    snapshot.unread_private.insert(UserId(7), 1);

    write_snapshot(&*cache, ME, &snapshot)
        .await
        .expect("write");

    assert_eq!(ChatCache::load(&*cache, ME).await.expect("load"), snapshot);
    assert_eq!(
        ChatCache::load(&*cache, UserId(2)).await.expect("load"),
        ChannelSnapshot::default()
    );
}

#[tokio::test]
async fn writer_mirrors_store_mutations() {
    let cache = memory_cache().await;
    let store = Arc::new(ChannelStore::default());
    let writer = spawn_cache_writer(Arc::clone(&store), cache.clone(), ME);
    let peer = ChannelKey::private(UserId(7));

    store.set_initial_public(vec![public_message(1, 3, 0)]);
    store.append(peer, private_message(2, 7, 1, 0), false);
    store.append(peer, private_message(3, 7, 1, 1), false);
    store.mark_read(peer);

    let snapshot = wait_for_cache(&cache, ME, |s| {
        s.private.get(&UserId(7)).map(Vec::len) == Some(2)
            && s.unread_private.get(&UserId(7)) == Some(&0)
    })
    .await;
    assert_eq!(ids(&snapshot.public), vec![1]);
    assert_eq!(ids(&snapshot.private[&UserId(7)]), vec![2, 3]);
    assert_eq!(snapshot.unread_private[&UserId(7)], 0);

    store.reset();
    let snapshot = wait_for_cache(&cache, ME, |s| *s == ChannelSnapshot::default()).await;
    assert_eq!(snapshot, ChannelSnapshot::default());
    writer.abort();
}

#[tokio::test]
async fn lagging_writer_rewrites_the_full_snapshot() {
    let cache = memory_cache().await;
    let store = Arc::new(ChannelStore::new(1));
    let writer = spawn_cache_writer(Arc::clone(&store), cache.clone(), ME);

    for id in 1..=6 {
        store.append(ChannelKey::Public, public_message(id, 3, id as u32), false);
    }

    let snapshot = wait_for_cache(&cache, ME, |s| s.public.len() == 6 && s.unread_public == 6).await;
    assert_eq!(ids(&snapshot.public), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(snapshot.unread_public, 6);
    writer.abort();
}

#[tokio::test]
async fn writer_stops_when_the_store_is_dropped() {
    let cache = memory_cache().await;
    let store = Arc::new(ChannelStore::default());
    let writer = spawn_cache_writer(Arc::clone(&store), cache, ME);

    drop(store);

    tokio::time::timeout(Duration::from_secs(1), writer)
        .await
        .expect("writer exits")
        .expect("join");
}
