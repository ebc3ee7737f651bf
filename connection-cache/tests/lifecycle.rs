mod harness;

use connection_cache::{Config, JobError};
use harness::{cache, destination, direct, settle, Recorder};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn idle_connection_is_removed_after_timeout() {
    let (cache, connector) = cache(Config::default());
    let mut recorder = Recorder::new();
    let target = destination("https://example.test/");

    cache
        .acquire_connection(&target, &direct(), recorder.job("a"))
        .await
        .unwrap();
    let (_, lease) = recorder.next().await.started();
    let socket = lease.transport().socket().clone();
    cache.notify_job_finished(lease).await;
    settle().await;

    assert!(!socket.notifications_enabled(), "parked transports are quiet");
    let snapshot = cache.dump().await;
    let parked = &snapshot.buckets[0].connections[0];
    assert!(!parked.active);
    assert_eq!(parked.current_destination, None);

    tokio::time::sleep(Duration::from_secs(9)).await;
    settle().await;
    assert_eq!(cache.dump().await.connection_count(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert!(cache.dump().await.is_empty());
    assert_eq!(connector.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn job_arriving_before_timeout_keeps_connection() {
    let (cache, connector) = cache(Config::default());
    let mut recorder = Recorder::new();
    let target = destination("https://example.test/");

    cache
        .acquire_connection(&target, &direct(), recorder.job("a"))
        .await
        .unwrap();
    let (_, lease) = recorder.next().await.started();
    cache.notify_job_finished(lease).await;
    settle().await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    cache
        .acquire_connection(&target, &direct(), recorder.job("b"))
        .await
        .unwrap();
    let (name, lease) = recorder.next().await.started();
    assert_eq!(name, "b");
    assert_eq!(connector.opened(), 1);

    // Well past the original deadline, the connection is still busy with b.
    tokio::time::sleep(Duration::from_secs(20)).await;
    settle().await;
    assert_eq!(cache.dump().await.connection_count(), 1);

    cache.notify_job_finished(lease).await;
    tokio::time::sleep(Duration::from_secs(11)).await;
    settle().await;
    assert!(cache.dump().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn reuse_right_after_finish_skips_parking() {
    let (cache, connector) = cache(Config::default());
    let mut recorder = Recorder::new();
    let target = destination("http://example.test/");

    cache
        .acquire_connection(&target, &direct(), recorder.job("a"))
        .await
        .unwrap();
    let (_, lease) = recorder.next().await.started();
    cache.notify_job_finished(lease).await;

    // Submitted before the deferred parking step had a chance to run.
    cache
        .acquire_connection(&target, &direct(), recorder.job("b"))
        .await
        .unwrap();
    let (_, lease) = recorder.next().await.started();

    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;
    let snapshot = cache.dump().await;
    assert_eq!(snapshot.connection_count(), 1);
    assert!(snapshot.buckets[0].connections[0].active);
    assert_eq!(connector.opened(), 1);
    drop(lease);
}

#[tokio::test(start_paused = true)]
async fn failed_reconnect_fails_only_the_next_job() {
    let (cache, connector) = cache(Config::default().with_max_connections_per_destination(1));
    let mut recorder = Recorder::new();
    let target = destination("https://example.test/");

    for name in ["a", "b", "c"] {
        cache
            .acquire_connection(&target, &direct(), recorder.job(name))
            .await
            .unwrap();
    }

    let (_, lease) = recorder.next().await.started();
    lease.transport().socket().close_remote();
    connector.fail_next(1);
    cache.notify_job_finished(lease).await;

    let (name, reason) = recorder.next().await.failed();
    assert_eq!(name, "b");
    assert_eq!(reason, JobError::ConnectionFailed);

    let (name, lease) = recorder.next().await.started();
    assert_eq!(name, "c");
    assert_eq!(lease.transport().socket().serial, 2);

    // Two jobs were waiting behind a when the server hung up.
    assert_eq!(
        cache
            .server_profile("example.test")
            .requests_served_per_connection(),
        Some(3)
    );
}

#[tokio::test(start_paused = true)]
async fn cancelled_job_never_starts() {
    let (cache, _connector) = cache(Config::default().with_max_connections_per_destination(1));
    let mut recorder = Recorder::new();
    let target = destination("https://example.test/");

    cache
        .acquire_connection(&target, &direct(), recorder.job("a"))
        .await
        .unwrap();
    let b = recorder.job("b");
    let handle = cache
        .acquire_connection(&target, &direct(), b.clone())
        .await
        .unwrap();

    assert!(cache.cancel_queued_job(&handle, &b).await);
    assert!(!cache.cancel_queued_job(&handle, &b).await);

    let (_, lease) = recorder.next().await.started();
    cache.notify_job_finished(lease).await;
    settle().await;

    assert!(recorder.drain().is_empty());
    assert!(!cache.dump().await.buckets[0].connections[0].active);
}

#[tokio::test(start_paused = true)]
async fn preconnected_connection_is_reused() {
    let (cache, connector) = cache(Config::default());
    let mut recorder = Recorder::new();
    let target = destination("https://example.test/");

    let warm = cache.preconnect(&target, &direct()).await.unwrap();
    settle().await;
    assert_eq!(connector.opened(), 1);

    let again = cache.preconnect(&target, &direct()).await.unwrap();
    assert_eq!(again, warm);
    assert_eq!(connector.opened(), 1);

    let handle = cache
        .acquire_connection(&target, &direct(), recorder.job("a"))
        .await
        .unwrap();
    assert_eq!(handle, warm);
    let (_, lease) = recorder.next().await.started();
    assert_eq!(lease.connection(), warm);
    assert_eq!(connector.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_preconnect_leaves_no_connection() {
    let (cache, connector) = cache(Config::default());
    connector.refuse(true);

    assert!(cache
        .preconnect(&destination("https://down.test/"), &direct())
        .await
        .is_err());
    assert!(cache.dump().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn dump_reports_running_job() {
    let (cache, _connector) = cache(Config::default().with_max_connections_per_destination(1));
    let mut recorder = Recorder::new();
    let target = destination("https://example.test/running");

    cache
        .acquire_connection(&target, &direct(), recorder.job("a"))
        .await
        .unwrap();
    cache
        .acquire_connection(&target, &direct(), recorder.job("b"))
        .await
        .unwrap();
    let (_, _lease) = recorder.next().await.started();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let snapshot = cache.dump().await;
    let connection = &snapshot.buckets[0].connections[0];

    assert!(connection.active);
    assert_eq!(
        connection.current_destination.as_deref(),
        Some("https://example.test/running")
    );
    assert!(connection.elapsed_ms.unwrap() >= 1500);
    assert_eq!(connection.queued, 1);
    assert_eq!(connection.high_water_mark, 1);
    assert!(snapshot.to_string().contains("busy with https://example.test/running"));
}

#[tokio::test(start_paused = true)]
async fn periodic_dump_runs_alongside_jobs() {
    let (cache, _connector) = cache(Config::default());
    let mut recorder = Recorder::new();

    let handle = cache.spawn_periodic_dump(Duration::from_secs(1));
    cache
        .acquire_connection(&destination("http://example.test/"), &direct(), recorder.job("a"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    drop(handle);

    let (_, lease) = recorder.next().await.started();
    cache.notify_job_finished(lease).await;
    settle().await;
    assert_eq!(cache.dump().await.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn short_idle_timeout_from_config() {
    let config = Config::from_toml_str("idle_timeout_ms = 500\n").unwrap();
    let (cache, _connector) = cache(config);
    let mut recorder = Recorder::new();

    cache
        .acquire_connection(&destination("http://example.test/"), &direct(), recorder.job("a"))
        .await
        .unwrap();
    let (_, lease) = recorder.next().await.started();
    cache.notify_job_finished(lease).await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    settle().await;
    assert!(cache.dump().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn longer_idle_timeout_keeps_connection_past_default() {
    let config = Config::default().with_idle_timeout(Duration::from_secs(30));
    let (cache, connector) = cache(config);
    let mut recorder = Recorder::new();
    let target = destination("http://example.test/");
    assert_eq!(cache.config().idle_timeout(), Duration::from_secs(30));

    cache
        .acquire_connection(&target, &direct(), recorder.job("a"))
        .await
        .unwrap();
    let (_, lease) = recorder.next().await.started();
    cache.notify_job_finished(lease).await;

    tokio::time::sleep(Duration::from_secs(20)).await;
    settle().await;
    assert_eq!(cache.dump().await.connection_count(), 1);

    tokio::time::sleep(Duration::from_secs(11)).await;
    settle().await;
    assert!(cache.dump().await.is_empty());
    assert_eq!(connector.opened(), 1);
}
