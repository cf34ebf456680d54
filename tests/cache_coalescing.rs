//! Behavioural tests for the cache: coalesced refresh, hit/miss transport
//! discipline, invalidation, stale fallback, and joiner cancellation.

use std::{sync::Arc, time::Duration};

use hostlink::{AssemblyError, CommandKey, FieldValue, ScriptedTransport};

mod common;

use common::{cache_over, ok_reply};

#[tokio::test(start_paused = true)]
async fn concurrent_refreshes_coalesce_into_one_dispatch() {
    let transport = Arc::new(ScriptedTransport::new().with_reply(ok_reply()));
    let cache = cache_over(Arc::clone(&transport));
    let key = CommandKey::bare("status");

    let (first, second) = tokio::join!(cache.refresh(&key), cache.refresh(&key));

    let first = first.expect("leader outcome");
    let second = second.expect("joiner outcome");
    assert_eq!(first, second, "joined callers receive the identical result");
    assert_eq!(first.raw(), b"STATUS=OK\r\n");
    assert_eq!(transport.send_count(), 1, "exactly one assembler invocation");
}

#[tokio::test(start_paused = true)]
async fn a_swarm_of_concurrent_gets_dispatches_once() {
    let transport = Arc::new(ScriptedTransport::new().with_reply(ok_reply()));
    let cache = cache_over(Arc::clone(&transport));
    let key = CommandKey::bare("status");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            cache.get(&key, Duration::from_secs(60)).await
        }));
    }
    for joined in futures::future::join_all(handles).await {
        let response = joined.expect("task joins").expect("every caller succeeds");
        assert_eq!(
            response.field("STATUS"),
            Some(&FieldValue::Text("OK".into()))
        );
    }

    assert_eq!(transport.send_count(), 1);
    assert_eq!(cache.stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn fresh_hits_never_touch_the_transport() {
    let transport = Arc::new(ScriptedTransport::new().with_reply(ok_reply()));
    let cache = cache_over(Arc::clone(&transport));
    let key = CommandKey::bare("status");

    cache.refresh(&key).await.expect("priming refresh");
    assert_eq!(transport.send_count(), 1);

    for _ in 0..5 {
        cache
            .get(&key, Duration::from_secs(60))
            .await
            .expect("fresh hit");
    }

    assert_eq!(transport.send_count(), 1, "hits stay off the serial link");
    let stats = cache.stats();
    assert_eq!(stats.hits, 5);
    assert_eq!(stats.total_entries, 1);
}

#[tokio::test(start_paused = true)]
async fn invalidation_forces_exactly_one_new_dispatch() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_reply(ok_reply())
            .with_reply(ok_reply()),
    );
    let cache = cache_over(Arc::clone(&transport));
    let key = CommandKey::bare("status");

    cache.refresh(&key).await.expect("priming refresh");
    assert!(cache.invalidate(&key));
    assert!(cache.entry(&key).is_none());

    cache
        .get(&key, Duration::from_secs(60))
        .await
        .expect("refetch after invalidation");
    assert_eq!(transport.send_count(), 2);

    assert!(!cache.invalidate(&CommandKey::bare("missing")));
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_serves_the_stale_entry_and_keeps_it() {
    // One good reply, then silence: the second refresh times out.
    let transport = Arc::new(ScriptedTransport::new().with_reply(ok_reply()));
    let cache = cache_over(Arc::clone(&transport));
    let key = CommandKey::bare("status");

    cache.refresh(&key).await.expect("priming refresh");

    // Make the entry stale for a 1s staleness bound, then read through it.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let response = cache
        .get(&key, Duration::from_secs(1))
        .await
        .expect("stale value beats a refresh error");
    assert_eq!(response.raw(), b"STATUS=OK\r\n");
    assert_eq!(transport.send_count(), 2, "the failed refresh did dispatch");

    let entry = cache.entry(&key).expect("entry survives the failure");
    assert!(entry.last_refresh_failed());

    // An explicit refresh still reports the failure to its caller.
    let err = cache.refresh(&key).await.expect_err("no reply scripted");
    assert_eq!(err, AssemblyError::Timeout { key });
}

#[tokio::test(start_paused = true)]
async fn first_ever_fetch_failure_surfaces_the_error() {
    let transport = Arc::new(ScriptedTransport::new());
    let cache = cache_over(Arc::clone(&transport));
    let key = CommandKey::bare("status");

    let err = cache
        .get(&key, Duration::from_secs(60))
        .await
        .expect_err("nothing cached and nothing scripted");
    assert_eq!(err, AssemblyError::Timeout { key: key.clone() });
    assert!(cache.entry(&key).is_none(), "failures never create entries");
}

#[tokio::test(start_paused = true)]
async fn detaching_one_joiner_leaves_the_refresh_running() {
    let transport = Arc::new(ScriptedTransport::new().with_reply(vec![(
        Duration::from_millis(200),
        b"STATUS=OK\r\n".to_vec(),
    )]));
    let cache = cache_over(Arc::clone(&transport));
    let key = CommandKey::bare("status");

    let detaching = {
        let cache = cache.clone();
        let key = key.clone();
        tokio::spawn(async move { cache.refresh(&key).await })
    };
    let staying = {
        let cache = cache.clone();
        let key = key.clone();
        tokio::spawn(async move { cache.refresh(&key).await })
    };
    // Let both join the same in-flight refresh, then drop one of them.
    tokio::task::yield_now().await;
    detaching.abort();

    let response = staying
        .await
        .expect("task joins")
        .expect("surviving joiner still completes");
    assert_eq!(response.raw(), b"STATUS=OK\r\n");
    assert_eq!(transport.send_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn abandoning_every_joiner_cancels_the_assembly() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_reply(vec![(Duration::from_secs(5), b"LATE\r\n".to_vec())])
            .with_reply(ok_reply()),
    );
    let cache = cache_over(Arc::clone(&transport));
    let key = CommandKey::bare("status");

    let only_joiner = {
        let cache = cache.clone();
        let key = key.clone();
        tokio::spawn(async move { cache.refresh(&key).await })
    };
    tokio::task::yield_now().await;
    only_joiner.abort();

    // Give the cancelled driver time to unwind.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cache.entry(&key).is_none(), "cancelled refresh installs nothing");
    assert_eq!(cache.stats().in_flight, 0);

    // The key is free again; a later fetch starts a fresh assembly.
    cache
        .get(&key, Duration::from_secs(60))
        .await
        .expect("second script answers");
    assert_eq!(transport.send_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn predicate_invalidation_clears_only_matching_keys() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_reply(ok_reply())
            .with_reply(ok_reply())
            .with_reply(ok_reply()),
    );
    let cache = cache_over(Arc::clone(&transport));
    let port1 = CommandKey::new("status", "port1");
    let port2 = CommandKey::new("status", "port2");
    let summary = CommandKey::bare("status");

    cache.refresh(&port1).await.expect("port1 primed");
    cache.refresh(&port2).await.expect("port2 primed");
    cache.refresh(&summary).await.expect("summary primed");

    let removed = cache.invalidate_matching(|key| key.params().starts_with("port"));
    assert_eq!(removed, 2);
    assert!(cache.entry(&port1).is_none());
    assert!(cache.entry(&port2).is_none());
    assert!(cache.entry(&summary).is_some(), "non-matching keys survive");
}

#[tokio::test(start_paused = true)]
async fn entry_listing_reports_every_key_with_its_freshness() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_reply(ok_reply())
            .with_reply(ok_reply()),
    );
    let cache = cache_over(Arc::clone(&transport));
    let port1 = CommandKey::new("status", "port1");
    let port2 = CommandKey::new("status", "port2");

    cache.refresh(&port1).await.expect("first prime");
    cache.refresh(&port2).await.expect("second prime");

    let mut listing = cache.entries();
    listing.sort_by(|(a, _), (b, _)| a.cmp(b));
    let keys: Vec<_> = listing.iter().map(|(key, _)| key.clone()).collect();
    assert_eq!(keys, vec![port1, port2]);
    for (_, entry) in &listing {
        assert_eq!(entry.ttl(), Duration::from_secs(300));
        assert!(!entry.last_refresh_failed());
    }
}

#[tokio::test(start_paused = true)]
async fn invalidate_all_resets_every_key() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_reply(ok_reply())
            .with_reply(ok_reply()),
    );
    let cache = cache_over(Arc::clone(&transport));
    let port1 = CommandKey::new("status", "port1");
    let port2 = CommandKey::new("status", "port2");

    cache.refresh(&port1).await.expect("first prime");
    cache.refresh(&port2).await.expect("second prime");
    assert_eq!(cache.stats().total_entries, 2);

    cache.invalidate_all();
    assert_eq!(cache.stats().total_entries, 0);
}
