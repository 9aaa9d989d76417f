use serde_json::json;
use std::time::Duration;
use vigil_agent::devtools::{AttachError, AttachPolicy, AttachState};
use vigil_agent::metrics::Intensity;
use vigil_agent::{ContextId, MonitorSettings};
use vigil_devkit::test_utils::SAMPLE_INTERVAL;
use vigil_devkit::{DevtoolsEventBuilder, MetricsReading, MockDevtools, TestHarness};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(start_paused = true)]
async fn watch_twice_keeps_one_session_and_one_loop() {
    let mut harness = TestHarness::new();
    let ctx = ContextId(1);

    let first = harness.monitor.watch(ctx).await.unwrap();
    let second = harness.monitor.watch(ctx).await.unwrap();
    assert_eq!(first.id(), second.id());

    harness.collect_snapshots(ctx, 5, WAIT).await.unwrap();

    assert_eq!(harness.devtools.attach_calls(ctx), 1);
    assert_eq!(harness.devtools.commands_named("Performance.enable").len(), 1);
    assert_eq!(harness.devtools.commands_named("Network.enable").len(), 1);
    assert_eq!(harness.devtools.commands_named("Performance.getMetrics").len(), 5);
}

#[tokio::test(start_paused = true)]
async fn attach_retries_until_the_context_is_ready() {
    let harness = TestHarness::new();
    let ctx = ContextId(2);
    harness.devtools.fail_attaches(ctx, 2);

    let session = harness.monitor.watch(ctx).await.unwrap();

    assert_eq!(session.attach_state(), AttachState::Attached);
    assert_eq!(harness.devtools.attach_calls(ctx), 3);
}

#[tokio::test(start_paused = true)]
async fn concurrent_watches_share_one_attach() {
    let harness = TestHarness::new();
    let ctx = ContextId(12);
    harness.devtools.fail_attaches(ctx, 2);

    let (first, second) = tokio::join!(harness.monitor.watch(ctx), harness.monitor.watch(ctx));
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.id(), second.id());
    assert_eq!(harness.devtools.attach_calls(ctx), 3);
    assert_eq!(harness.devtools.commands_named("Performance.enable").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn attach_gives_up_after_the_retry_budget() {
    let harness = TestHarness::new();
    let ctx = ContextId(3);
    harness.devtools.fail_attaches(ctx, 100);

    let err = harness.monitor.watch(ctx).await.unwrap_err();

    assert!(matches!(err, AttachError::Exhausted { attempts: 5, .. }));
    assert_eq!(harness.devtools.attach_calls(ctx), 5);
    assert!(harness.devtools.commands_named("Performance.getMetrics").is_empty());
}

#[tokio::test(start_paused = true)]
async fn foreign_debugger_does_not_block_monitoring() {
    let mut harness = TestHarness::new();
    let ctx = ContextId(4);
    harness.devtools.occupy(ctx);

    harness.monitor.watch(ctx).await.unwrap();

    assert!(harness.next_snapshot(ctx, WAIT).await.is_ok());
    assert_eq!(harness.devtools.attach_calls(ctx), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_sample_skips_tick_and_reattaches() {
    let mut harness = TestHarness::new();
    let ctx = ContextId(5);
    harness.devtools.script_metrics(ctx, [MetricsReading::new(1.0, 10.0)]);

    harness.monitor.watch(ctx).await.unwrap();
    harness.next_snapshot(ctx, WAIT).await.unwrap();

    harness.devtools.fail_samples(ctx, 1);
    let started = tokio::time::Instant::now();
    harness.next_snapshot(ctx, WAIT).await.unwrap();

    // The failing tick produced nothing, so the next snapshot is one interval late
    assert!(started.elapsed() >= SAMPLE_INTERVAL * 2);
    assert_eq!(harness.devtools.attach_calls(ctx), 2);
    assert_eq!(harness.devtools.commands_named("Performance.enable").len(), 2);
    assert_eq!(harness.devtools.commands_named("Network.enable").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn network_bytes_are_routed_to_their_own_context() {
    let mut harness = TestHarness::new();
    let ctx = ContextId(6);
    let other = ContextId(7);
    let unmonitored = ContextId(99);

    harness.monitor.watch(ctx).await.unwrap();
    harness.monitor.watch(other).await.unwrap();
    let baseline = harness.next_snapshot(ctx, WAIT).await.unwrap();
    assert_eq!(baseline.network_total_bytes, 0);

    harness.devtools.emit_event(DevtoolsEventBuilder::data_received(ctx, 500));
    harness.devtools.emit_event(DevtoolsEventBuilder::data_received(other, 999));
    harness.devtools.emit_event(DevtoolsEventBuilder::data_received(unmonitored, 10_000));
    harness
        .devtools
        .emit_event(DevtoolsEventBuilder::request_will_be_sent(ctx, json!({}), Some("abc")));
    harness.settle().await;

    let after = harness.next_snapshot(ctx, WAIT).await.unwrap();
    assert_eq!(after.network_delta_bytes, 505);
    assert_eq!(after.network_total_bytes, 505);

    let quiet = harness.next_snapshot(ctx, WAIT).await.unwrap();
    assert_eq!(quiet.network_delta_bytes, 0);
    assert_eq!(quiet.network_total_bytes, 505);

    let session = harness.monitor.manager().get(ctx).unwrap();
    assert_eq!(session.with_telemetry(|t| t.initial_load_bytes()), Some(500));
    let other_session = harness.monitor.manager().get(other).unwrap();
    assert_eq!(other_session.with_telemetry(|t| t.network_total_bytes()), 999);
}

#[tokio::test(start_paused = true)]
async fn heavy_page_is_classified_high() {
    let mut harness = TestHarness::with_settings(MonitorSettings {
        sample_interval: Duration::from_secs(1),
        alpha: 1.0,
        attach: AttachPolicy::default(),
    });
    let ctx = ContextId(8);
    // 0.9s of busy time per 1s tick is 90% CPU; 64MB heap
    harness.devtools.script_metrics(
        ctx,
        (0..10).map(|tick| MetricsReading::new(0.9 * tick as f64, 64.0).with_load_time_ms(250.0)),
    );

    harness.monitor.watch(ctx).await.unwrap();
    let snapshots = harness.collect_snapshots(ctx, 3, WAIT).await.unwrap();

    assert_eq!(snapshots[0].cpu_percent, 0.0);
    assert_eq!(snapshots[0].intensity, Intensity::High);
    assert!(snapshots[2].cpu_percent > 40.0);
    assert_eq!(harness.monitor.latest(ctx), Some(snapshots[2].clone()));
}

#[tokio::test(start_paused = true)]
async fn closing_a_context_stops_its_sampling() {
    let mut harness = TestHarness::new();
    let ctx = ContextId(9);

    let session = harness.monitor.watch(ctx).await.unwrap();
    harness.collect_snapshots(ctx, 2, WAIT).await.unwrap();

    harness.monitor.close(ctx).await;
    let reads_at_close = harness.devtools.commands_named("Performance.getMetrics").len();
    tokio::time::sleep(SAMPLE_INTERVAL * 10).await;

    assert!(session.is_closed());
    assert_eq!(session.attach_state(), AttachState::Detached);
    assert!(harness.monitor.manager().get(ctx).is_none());
    assert!(harness.monitor.latest(ctx).is_none());
    assert_eq!(harness.devtools.detach_calls(ctx), 1);
    assert_eq!(
        harness.devtools.commands_named("Performance.getMetrics").len(),
        reads_at_close
    );
}

#[tokio::test(start_paused = true)]
async fn release_stops_sampling_before_the_transport_detach() {
    let mut harness = TestHarness::new();
    let ctx = ContextId(10);

    let session = harness.monitor.watch(ctx).await.unwrap();
    harness.next_snapshot(ctx, WAIT).await.unwrap();

    let detach = harness.monitor.release(ctx).unwrap();
    assert!(session.is_closed());
    assert!(harness.monitor.manager().get(ctx).is_none());

    detach.await.unwrap();
    assert_eq!(session.attach_state(), AttachState::Detached);
    assert_eq!(harness.devtools.detach_calls(ctx), 1);
    assert!(harness.monitor.release(ctx).is_none());
}

#[tokio::test(start_paused = true)]
async fn lost_events_mark_the_snapshot_incomplete() {
    let mut harness = TestHarness::with_devtools(MockDevtools::with_event_capacity(4), TestHarness::fast_settings());
    let ctx = ContextId(11);

    harness.monitor.watch(ctx).await.unwrap();
    let baseline = harness.next_snapshot(ctx, WAIT).await.unwrap();
    assert!(!baseline.network_incomplete);

    for _ in 0..10 {
        harness.devtools.emit_event(DevtoolsEventBuilder::data_received(ctx, 100));
    }
    harness.settle().await;

    let after = harness.next_snapshot(ctx, WAIT).await.unwrap();
    assert_eq!(harness.monitor.dropped_events(), 6);
    assert_eq!(after.network_total_bytes, 400);
    assert!(after.network_incomplete);

    let session = harness.monitor.manager().get(ctx).unwrap();
    assert_eq!(session.with_telemetry(|t| t.dropped_events()), 6);
}
