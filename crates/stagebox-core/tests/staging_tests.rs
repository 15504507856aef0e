//! End-to-end staging behaviour against a real in-process daemon.
//!
//! Every test binds its own daemon to a socket in a fresh temp directory.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use pretty_assertions::assert_eq;
use stagebox_core::ipc::SameUserVerifier;
use stagebox_core::protocol::address::current_uid;
use stagebox_core::protocol::{
    DeleteOptions, Entry, ErrorCode, Method, Request, Service, State, StateKey, TagEntry,
};
use stagebox_core::{IpcClient, ShutdownReason, StagingError, StagingStore};
use stagebox_test_utils::{InProcessSpawner, TestConfigBuilder, TestDaemon};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;

const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A daemon that stays up when the store empties.
async fn persistent_daemon() -> TestDaemon {
    TestDaemon::with_config(TestConfigBuilder::new().auto_shutdown(false).build_daemon()).await
}

#[test_log::test(tokio::test)]
async fn stage_then_get_round_trips() {
    let daemon = persistent_daemon().await;
    let store = daemon.staging("123456789012", "us-east-1");

    let entry = Entry::update("postgres://db:5432/app")
        .with_description("primary database")
        .with_base_modified_at(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
    store
        .stage_entry(Service::Param, "/app/db/url", entry.clone())
        .await
        .unwrap();

    let got = store.get_entry(Service::Param, "/app/db/url").await.unwrap();
    assert_eq!(got, entry);

    store.unstage_entry(Service::Param, "/app/db/url").await.unwrap();
    let err = store
        .get_entry(Service::Param, "/app/db/url")
        .await
        .unwrap_err();
    assert!(err.is_not_staged(), "{err}");
}

#[tokio::test]
async fn staged_delete_round_trips() {
    let daemon = TestDaemon::start().await;
    let store = daemon.staging("123456789012", "us-east-1");

    let entry = Entry::delete(DeleteOptions {
        force: false,
        recovery_window_days: Some(7),
    });
    store
        .stage_entry(Service::Secret, "legacy-token", entry.clone())
        .await
        .unwrap();
    assert_eq!(
        store.get_entry(Service::Secret, "legacy-token").await.unwrap(),
        entry
    );
}

#[tokio::test]
async fn tag_changes_round_trip() {
    let daemon = persistent_daemon().await;
    let store = daemon.staging("123456789012", "us-east-1");

    let tags = TagEntry::new().add("team", "payments").remove("deprecated");
    store
        .stage_tag(Service::Secret, "api-key", tags.clone())
        .await
        .unwrap();
    assert_eq!(store.get_tag(Service::Secret, "api-key").await.unwrap(), tags);

    let listed = store.list_tags(Some(Service::Secret)).await.unwrap();
    assert_eq!(listed[&Service::Secret].len(), 1);

    store.unstage_tag(Service::Secret, "api-key").await.unwrap();
    assert!(
        store
            .get_tag(Service::Secret, "api-key")
            .await
            .unwrap_err()
            .is_not_staged()
    );
}

#[tokio::test]
async fn unstaging_something_never_staged_is_not_staged() {
    let daemon = TestDaemon::start().await;
    let store = daemon.staging("1", "r");

    let err = store.unstage_entry(Service::Param, "/nope").await.unwrap_err();
    assert!(matches!(
        err,
        StagingError::NotStaged { service: Service::Param, ref name } if name == "/nope"
    ));
}

#[tokio::test]
async fn scopes_are_isolated() {
    let daemon = TestDaemon::start().await;
    let a = daemon.staging("111111111111", "us-east-1");
    let other_account = daemon.staging("222222222222", "us-east-1");
    let other_region = daemon.staging("111111111111", "eu-west-1");

    a.stage_entry(Service::Param, "/shared/name", Entry::create("a"))
        .await
        .unwrap();

    for store in [&other_account, &other_region] {
        assert!(
            store
                .get_entry(Service::Param, "/shared/name")
                .await
                .unwrap_err()
                .is_not_staged()
        );
        assert!(store.load().await.unwrap().is_empty());
    }
    assert_eq!(a.load().await.unwrap().entry_count(), 1);
}

#[tokio::test]
async fn emptiness_is_aggregate_across_scopes() {
    let daemon = persistent_daemon().await;
    let client = daemon.client();
    let a = daemon.staging("1", "us-east-1");
    let b = daemon.staging("2", "ap-northeast-1");

    assert!(client.is_empty().await.unwrap());

    a.stage_entry(Service::Param, "/a", Entry::create("1")).await.unwrap();
    b.stage_tag(Service::Secret, "s", TagEntry::new().add("k", "v"))
        .await
        .unwrap();
    assert!(!client.is_empty().await.unwrap());

    a.unstage_entry(Service::Param, "/a").await.unwrap();
    assert!(!client.is_empty().await.unwrap());

    b.unstage_tag(Service::Secret, "s").await.unwrap();
    assert!(client.is_empty().await.unwrap());
}

#[tokio::test]
async fn unstage_all_is_idempotent() {
    let daemon = persistent_daemon().await;
    let store = daemon.staging("1", "r");

    store.unstage_all(None).await.unwrap();
    store.unstage_all(Some(Service::Secret)).await.unwrap();
    assert!(store.load().await.unwrap().is_empty());

    store.stage_entry(Service::Param, "/p", Entry::create("1")).await.unwrap();
    store.stage_entry(Service::Secret, "s", Entry::create("2")).await.unwrap();
    store.unstage_all(Some(Service::Secret)).await.unwrap();

    let listed = store.list_entries(None).await.unwrap();
    assert_eq!(listed[&Service::Param].len(), 1);
    assert!(listed[&Service::Secret].is_empty());

    store.unstage_all(None).await.unwrap();
    store.unstage_all(None).await.unwrap();
    assert!(store.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn auto_shutdown_then_transparent_respawn() {
    stagebox_test_utils::tracing_setup::init_test_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("daemon.sock");
    let spawner = InProcessSpawner::new();
    let client = Arc::new(IpcClient::new(&path).with_spawner(spawner.clone()));
    let store = StagingStore::new(Arc::clone(&client), "1", "us-east-1");

    store.stage_entry(Service::Param, "/x", Entry::create("1")).await.unwrap();
    assert_eq!(spawner.spawn_count(), 1);

    store.unstage_entry(Service::Param, "/x").await.unwrap();
    let deadline = tokio::time::Instant::now() + EXIT_TIMEOUT;
    while client.is_running().await {
        assert!(tokio::time::Instant::now() < deadline, "daemon did not exit");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    store.stage_entry(Service::Param, "/y", Entry::create("2")).await.unwrap();
    assert_eq!(spawner.spawn_count(), 2);
    assert_eq!(store.get_entry(Service::Param, "/y").await.unwrap().value.as_deref(), Some("2"));

    spawner.shutdown_all();
}

#[tokio::test]
async fn auto_shutdown_reports_idle() {
    let mut daemon = TestDaemon::start().await;
    let store = daemon.staging("1", "r");

    store.stage_entry(Service::Param, "/x", Entry::create("1")).await.unwrap();
    store.unstage_all(None).await.unwrap();

    assert_eq!(
        daemon.wait_for_exit(EXIT_TIMEOUT).await,
        Some(ShutdownReason::Idle)
    );
    assert!(!daemon.socket_path().exists());
}

#[tokio::test]
async fn read_on_empty_store_does_not_leave_daemon_resident() {
    let mut daemon = TestDaemon::start().await;
    let spawner = InProcessSpawner::new();
    let client = Arc::new(daemon.auto_start_client(spawner.clone()));
    let store = StagingStore::new(Arc::clone(&client), "1", "r");

    let listed = store.list_entries(None).await.unwrap();
    assert!(listed.values().all(|entries| entries.is_empty()));

    let deadline = tokio::time::Instant::now() + EXIT_TIMEOUT;
    while !daemon.has_exited() {
        assert!(tokio::time::Instant::now() < deadline, "daemon stayed resident");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(daemon.wait_for_exit(EXIT_TIMEOUT).await, Some(ShutdownReason::Idle));
    assert_eq!(spawner.spawn_count(), 0);

    // The next command brings a daemon back.
    store.stage_entry(Service::Param, "/p", Entry::create("1")).await.unwrap();
    assert_eq!(spawner.spawn_count(), 1);
    assert_eq!(store.load().await.unwrap().entry_count(), 1);

    spawner.shutdown_all();
}

#[tokio::test]
async fn stalled_connection_is_cut_at_the_read_deadline() {
    let daemon =
        TestDaemon::with_config(TestConfigBuilder::new().timeouts_ms(100, 100).build_daemon()).await;

    let mut stalled = UnixStream::connect(daemon.socket_path()).await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(EXIT_TIMEOUT, stalled.read(&mut buf))
        .await
        .expect("daemon kept a silent connection open")
        .unwrap_or(0);
    assert_eq!(n, 0);

    // The daemon itself is unaffected.
    assert!(daemon.client().is_running().await);
    assert_eq!(daemon.stop().await, Some(ShutdownReason::Requested));
}

#[tokio::test]
async fn concurrent_stages_are_not_lost() {
    const N: usize = 32;
    let daemon = TestDaemon::start().await;

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..N {
        // One client per task: each client serializes its own requests.
        let store = daemon.staging("1", "us-east-1");
        tasks.spawn(async move {
            store
                .stage_entry(Service::Param, &format!("/p/{i}"), Entry::create(i.to_string()))
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    let listed = daemon.staging("1", "us-east-1").list_entries(Some(Service::Param)).await.unwrap();
    assert_eq!(listed[&Service::Param].len(), N);
}

#[tokio::test]
async fn concurrent_set_and_get_state_never_tear() {
    let daemon = persistent_daemon().await;

    let snapshot = |tag: &str| {
        let mut state = State::new();
        for i in 0..20 {
            state
                .entries_mut(Service::Param)
                .insert(format!("/{i}"), Entry::update(tag));
        }
        state
    };

    let mut tasks = tokio::task::JoinSet::new();
    for round in 0..8 {
        let writer = daemon.staging("1", "r");
        let state = snapshot(if round % 2 == 0 { "even" } else { "odd" });
        tasks.spawn(async move { writer.set_state(state).await.map(|_| None) });

        let reader = daemon.staging("1", "r");
        tasks.spawn(async move { reader.drain(true).await.map(Some) });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Some(state) = joined.unwrap().unwrap() {
            let values: std::collections::BTreeSet<_> = state
                .entries(Service::Param)
                .values()
                .map(|e| e.value.clone())
                .collect();
            // Empty (before any write) or exactly one writer's snapshot.
            assert!(values.len() <= 1, "torn state: {values:?}");
            assert!(state.entry_count() == 0 || state.entry_count() == 20);
        }
    }
}

#[tokio::test]
async fn drain_moves_or_copies() {
    let daemon = persistent_daemon().await;
    let store = daemon.staging("1", "r");
    store.stage_entry(Service::Param, "/a", Entry::create("1")).await.unwrap();
    store
        .stage_tag(Service::Secret, "s", TagEntry::new().add("k", "v"))
        .await
        .unwrap();
    let before = store.load().await.unwrap();

    let copied = store.drain(true).await.unwrap();
    assert_eq!(copied, before);
    assert_eq!(store.load().await.unwrap(), before);

    let moved = store.drain(false).await.unwrap();
    assert_eq!(moved, before);
    assert!(store.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn set_state_imports_into_another_scope() {
    let daemon = persistent_daemon().await;
    let source = daemon.staging("1", "us-east-1");
    let target = daemon.staging("1", "us-west-2");

    source.stage_entry(Service::Secret, "db", Entry::update("pw")).await.unwrap();
    let exported = source.drain(false).await.unwrap();
    target.set_state(exported.clone()).await.unwrap();

    assert_eq!(target.load().await.unwrap(), exported);
    assert!(source.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn set_state_without_payload_is_rejected() {
    let daemon = TestDaemon::start().await;
    let resp = daemon
        .client()
        .send_request(&Request::scoped(Method::SetState, &StateKey::new("1", "r")))
        .await
        .unwrap();
    assert!(!resp.success);
    assert_eq!(resp.code, Some(ErrorCode::MissingPayload));
}

#[tokio::test]
async fn rejected_peer_cannot_mutate_state() {
    let other = current_uid().wrapping_add(1);
    let daemon = TestDaemon::with_verifier(Box::new(SameUserVerifier::with_uid(other))).await;

    let resp = daemon
        .client()
        .send_request(
            &Request::scoped(Method::StageEntry, &StateKey::new("1", "r"))
                .with_service(Service::Param)
                .with_name("/x")
                .with_entry(Entry::create("1")),
        )
        .await;
    // The readiness ping is rejected too, so the client never gets as far
    // as the stage request.
    let err = resp.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::PeerRejected), "{err}");
    assert!(daemon.state_store().is_empty().unwrap());

    let stopped = daemon.stop().await;
    assert_eq!(stopped, Some(ShutdownReason::Requested));
}

#[tokio::test]
async fn ping_reports_daemon_identity() {
    let daemon = TestDaemon::start().await;
    let info = daemon.client().ping().await.unwrap();
    assert_eq!(info.pid, std::process::id());
    assert_eq!(info.version, stagebox_core::build_info::version_string());
}
