use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use relaymon::agent::Agent;
use relaymon::confdiff::{Classification, ConfigDiffer};
use relaymon::config::{Config, ConfDiffConfig, EventsConfig, SamplerConfig};
use relaymon::control::{ControlEvent, ListenerPorts, Query, Reply, ScriptedChannel};
use relaymon::events::{EventNormalizer, Runlevel};
use relaymon::resolver::{Protocol, RawConnection, ScriptedStrategy, StrategyKind};
use relaymon::sampler::series::{BackfillPoint, Origin};
use relaymon::sampler::Sampler;
use relaymon::snapshot::{Snapshot, SnapshotHandle, StaleReason};

const TORRC: &str = "\
Nickname alpha
ORPort 9001
RelayBandwidthRate 5 MB
ExitPolicy reject *:*
";

const LIVE_CONFIG: &str = "\
Nickname alpha
ORPort 9050
RelayBandwidthRate 5242880
ExitPolicy reject *:*
ControlPort 9051
";

fn addr(s: &str) -> SocketAddr {
    s.parse().expect("socket address")
}

fn config() -> Config {
    let mut cfg = Config::default();
    cfg.health.addr = String::new();
    cfg.sampler.resources = false;
    cfg.sampler.interval = Duration::from_millis(100);
    cfg.resolver.interval = Duration::from_millis(100);
    cfg.resolver.resolve_apps = false;
    cfg.resolver.lookups = false;
    cfg.confdiff.interval = Duration::from_millis(100);
    cfg.snapshot.tick = Duration::from_millis(50);
    cfg.shutdown_grace = Duration::from_millis(500);
    cfg
}

fn scripted_daemon() -> Arc<ScriptedChannel> {
    let channel = Arc::new(ScriptedChannel::new());
    channel.set_reply(Query::Pid, Reply::Pid(4242));
    channel.set_reply(
        Query::ListenerPorts,
        Reply::ListenerPorts(ListenerPorts {
            or: Some(9001),
            control: Some(9051),
            ..ListenerPorts::default()
        }),
    );
    channel.set_reply(Query::RelayDirectory, Reply::RelayDirectory(Vec::new()));
    channel.set_reply(Query::ConfigText, Reply::ConfigText(LIVE_CONFIG.to_string()));
    channel
}

fn set_counters(channel: &ScriptedChannel, read: u64, written: u64) {
    channel.set_reply(Query::Counter("traffic/read".into()), Reply::Counter(read));
    channel.set_reply(Query::Counter("traffic/written".into()), Reply::Counter(written));
}

fn relay_strategy() -> ScriptedStrategy {
    let strategy = ScriptedStrategy::new(StrategyKind::Netstat);
    strategy.always(Ok(vec![
        RawConnection::new(addr("10.0.0.1:9001"), addr("192.0.2.7:41234"), Protocol::Tcp),
        RawConnection::new(addr("127.0.0.1:9051"), addr("127.0.0.1:53000"), Protocol::Tcp),
    ]));
    strategy
}

async fn wait_for(
    handle: &SnapshotHandle,
    what: &str,
    ready: impl Fn(&Snapshot) -> bool,
) -> Arc<Snapshot> {
    let mut updates = handle.subscribe();
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = handle.latest();
            if ready(&snapshot) {
                return snapshot;
            }
            if updates.changed().await.is_err() {
                return handle.latest();
            }
        }
    })
    .await;

    match found {
        Ok(snapshot) if ready(&snapshot) => snapshot,
        _ => panic!("timed out waiting for {what}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scripted_daemon_reaches_every_producer() {
    let dir = tempfile::tempdir().expect("temp dir");
    let torrc = dir.path().join("torrc");
    std::fs::write(&torrc, TORRC).expect("write torrc");

    let mut cfg = config();
    cfg.confdiff.torrc = Some(torrc);

    let channel = scripted_daemon();
    set_counters(&channel, 1_000, 2_000);
    for _ in 0..5 {
        channel.queue_event(ControlEvent::Log {
            runlevel: Runlevel::Notice,
            message: "Heartbeat: relay has been up for 1 day".to_string(),
            timestamp: None,
        });
    }
    channel.queue_event(ControlEvent::Log {
        runlevel: Runlevel::Debug,
        message: "below the subscribed runlevels".to_string(),
        timestamp: None,
    });

    let mut agent = Agent::with_channel(cfg, Arc::clone(&channel))
        .expect("agent")
        .with_strategies(vec![Box::new(relay_strategy())]);
    let handle = agent.handle();
    agent.start().await.expect("start");

    let snapshot = wait_for(&handle, "connections", |s| s.connections.len() == 2).await;
    assert_eq!(snapshot.stale.connections, None);

    let snapshot = wait_for(&handle, "heartbeat", |s| {
        s.events
            .iter()
            .any(|e| e.message.starts_with("Heartbeat") && e.repeat == 5)
    })
    .await;
    let heartbeat = snapshot
        .events
        .iter()
        .find(|e| e.message.starts_with("Heartbeat"))
        .expect("heartbeat");
    assert_eq!(heartbeat.repeat, 5);
    assert!(!snapshot.events.iter().any(|e| e.runlevel == Runlevel::Debug));

    let snapshot = wait_for(&handle, "config diff", |s| s.config.live_available).await;
    assert_eq!(snapshot.config.count(Classification::OverriddenInFile), 1);
    assert_eq!(snapshot.config.count(Classification::Default), 1);
    assert_eq!(snapshot.config.count(Classification::Match), 3);

    // Counters need two readings before a rate exists.
    set_counters(&channel, 3_000, 2_500);
    let snapshot = wait_for(&handle, "bandwidth samples", |s| {
        s.samples
            .series
            .iter()
            .any(|series| series.name == "bandwidth.read" && series.latest.is_some())
    })
    .await;
    assert_eq!(snapshot.stale.samples, None);

    agent.stop().await.expect("stop");
    assert!(channel.request_count(&Query::Pid) > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_producer_is_flagged_while_others_stay_fresh() {
    let channel = scripted_daemon();
    // No counter replies: every sampler metric fails.

    let mut agent = Agent::with_channel(config(), Arc::clone(&channel))
        .expect("agent")
        .with_strategies(vec![Box::new(relay_strategy())]);
    let handle = agent.handle();
    agent.start().await.expect("start");

    wait_for(&handle, "failed samples", |s| {
        s.stale.samples == Some(StaleReason::Failed)
    })
    .await;

    let snapshot = wait_for(&handle, "fresh connections", |s| {
        s.stale.connections.is_none() && !s.connections.is_empty()
    })
    .await;
    assert!(snapshot.stale.samples.is_some());
    assert_eq!(snapshot.stale.config, Some(StaleReason::NoData));

    let snapshot = wait_for(&handle, "events published", |s| s.stale.events.is_none()).await;
    assert!(snapshot.stale.samples.is_some());

    agent.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_daemon_keeps_last_connections() {
    let channel = scripted_daemon();
    set_counters(&channel, 0, 0);

    let mut cfg = config();
    cfg.resolver.failure_tolerance = 1_000;

    let strategy = relay_strategy();
    let mut agent = Agent::with_channel(cfg, Arc::clone(&channel))
        .expect("agent")
        .with_strategies(vec![Box::new(strategy.clone())]);
    let handle = agent.handle();
    agent.start().await.expect("start");

    wait_for(&handle, "connections", |s| s.connections.len() == 2).await;

    strategy.always(Err(relaymon::error::CollectError::Timeout {
        what: "netstat".to_string(),
        millis: 100,
    }));

    let snapshot = wait_for(&handle, "stale connections", |s| s.stale.connections.is_some()).await;
    assert_eq!(snapshot.connections.len(), 2);

    agent.stop().await.expect("stop");
}

#[test]
fn test_identical_events_collapse_within_window() {
    let mut normalizer = EventNormalizer::new(&EventsConfig::default());
    let start = Utc::now();

    for i in 0..4 {
        let event = ControlEvent::Log {
            runlevel: Runlevel::Warn,
            message: "Your system clock just jumped".to_string(),
            timestamp: Some(start + TimeDelta::seconds(i)),
        };
        normalizer.ingest(event, &start);
    }
    normalizer.ingest(
        ControlEvent::Log {
            runlevel: Runlevel::Warn,
            message: "Your system clock just jumped".to_string(),
            timestamp: Some(start + TimeDelta::minutes(10)),
        },
        &start,
    );

    let view = normalizer.view();
    assert_eq!(view.events.len(), 2);
    assert_eq!(view.events[0].repeat, 4);
    assert_eq!(view.events[1].repeat, 1);
    assert_eq!(view.stats.collapsed, 3);
}

#[test]
fn test_live_sample_wins_over_backfill() {
    let mut sampler = Sampler::new(&SamplerConfig::default(), Duration::from_secs(1));
    let now = Utc::now();

    sampler.record_value("bandwidth.read", now, 100.0);
    sampler.backfill(
        "bandwidth.read",
        &[
            BackfillPoint {
                at: now,
                value: 5.0,
                span: Duration::from_secs(1),
            },
            BackfillPoint {
                at: now - TimeDelta::seconds(30),
                value: 7.0,
                span: Duration::from_secs(1),
            },
        ],
    );

    let series = sampler.series("bandwidth.read").expect("series");
    assert_eq!(series.latest(), Some(100.0));

    let points = series.points();
    let live = points
        .iter()
        .filter(|p| p.origin == Some(Origin::Live))
        .count();
    let backfilled = points
        .iter()
        .filter(|p| p.origin == Some(Origin::Backfill))
        .count();
    assert_eq!(live, 1);
    assert_eq!(backfilled, 1);
}

#[test]
fn test_config_diff_is_stable_across_runs() {
    let differ = ConfigDiffer::from_config(&ConfDiffConfig::default());
    let first = differ.diff(Some(LIVE_CONFIG), TORRC);
    let second = differ.diff(Some(LIVE_CONFIG), TORRC);
    assert_eq!(first, second);

    let unavailable = differ.diff(None, TORRC);
    assert!(unavailable
        .iter()
        .all(|e| e.classification == Classification::Invalid));
}
