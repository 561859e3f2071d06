//! Producer worker loops. Each owns one collector core and publishes into
//! its slot; none of them ever propagates a failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::budget::{FailureBudget, DEFAULT_FAILURE_LIMIT};
use crate::confdiff::ConfigDiffer;
use crate::control::{ControlChannel, ControlEvent, EventSubscription, Guarded};
use crate::error::CollectError;
use crate::events::{
    daemon_log, Diagnostic, EventCommand, EventNormalizer, Ingested, InsertOutcome, Runlevel,
};
use crate::export::health::HealthMetrics;
use crate::resolver::{ConnectionResolver, RelayDirectory};
use crate::sampler::{History, Sampler};
use crate::snapshot::{ConnectionsView, Producers, Slot};

/// Capacity of the diagnostics channel feeding the event buffer.
pub const DIAGNOSTIC_BUFFER: usize = 256;

/// Capacity of the channel forwarding pushed bandwidth to the sampler.
pub const BANDWIDTH_BUFFER: usize = 64;

/// How often the relay directory is refetched.
const DIRECTORY_REFRESH: Duration = Duration::from_secs(600);

/// A multi-line record with no new input for this long is complete.
const IDLE_FLUSH: Duration = Duration::from_millis(500);

/// Pushed bandwidth: when, bytes read, bytes written.
pub type BandwidthReading = (DateTime<Utc>, u64, u64);

/// Non-blocking path for diagnostics into the internal event stream.
#[derive(Clone)]
pub struct DiagnosticSender {
    tx: mpsc::Sender<Diagnostic>,
}

impl DiagnosticSender {
    pub fn new(tx: mpsc::Sender<Diagnostic>) -> Self {
        Self { tx }
    }

    pub fn send(&self, diagnostic: Diagnostic) {
        if let Err(e) = self.tx.try_send(diagnostic) {
            debug!(error = %e, "diagnostic dropped");
        }
    }
}

/// Everything a producer worker shares with its siblings.
pub struct WorkerContext<C> {
    pub channel: Guarded<C>,
    pub producers: Arc<Producers>,
    pub diagnostics: DiagnosticSender,
    pub health: Option<Arc<HealthMetrics>>,
    pub cancel: CancellationToken,
}

impl<C> Clone for WorkerContext<C> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            producers: Arc::clone(&self.producers),
            diagnostics: self.diagnostics.clone(),
            health: self.health.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<C> WorkerContext<C> {
    fn control_failure(&self, query: &str, err: &CollectError) {
        if let Some(health) = &self.health {
            health
                .control_request_failures
                .with_label_values(&[query, err.kind()])
                .inc();
        }
    }

    /// Stop a worker for good: its slot stays stale from here on.
    fn terminate<T>(&self, worker: &'static str, slot: &Slot<T>) {
        error!(
            worker,
            producer = slot.name(),
            "collector failing in a tight loop, terminating it"
        );
        slot.terminate();
        self.diagnostics.send(Diagnostic::warn(format!(
            "The {worker} collector failed repeatedly and has stopped"
        )));
        if let Some(health) = &self.health {
            health
                .worker_terminations
                .with_label_values(&[worker])
                .inc();
        }
    }
}

/// Poll the connection resolver on its adaptive interval.
pub async fn run_resolver<C: ControlChannel>(
    ctx: WorkerContext<C>,
    mut resolver: ConnectionResolver,
    process_name: String,
) {
    let slot = &ctx.producers.connections;
    let mut budget = FailureBudget::new(resolver.interval(), DEFAULT_FAILURE_LIMIT);
    let mut directory_due = Instant::now();
    let mut delay = Duration::ZERO;

    info!(interval = ?resolver.interval(), "connection resolver started");

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = resolver.interval();
        slot.begin();

        let pid = match ctx.channel.pid().await {
            Ok(pid) => pid,
            Err(e) => {
                debug!(error = %e, "daemon pid unavailable");
                ctx.control_failure("pid", &e);
                slot.fail();
                if budget.record_failure() {
                    ctx.terminate("resolver", slot);
                    return;
                }
                continue;
            }
        };

        match ctx.channel.listener_ports().await {
            Ok(ports) => resolver.set_ports(ports),
            Err(e) => ctx.control_failure("listener_ports", &e),
        }

        if Instant::now() >= directory_due {
            directory_due = Instant::now() + DIRECTORY_REFRESH;
            match ctx.channel.relay_directory().await {
                Ok(entries) => resolver.set_directory(RelayDirectory::new(entries)),
                Err(e) => {
                    debug!(error = %e, "relay directory unavailable");
                    ctx.control_failure("relay_directory", &e);
                }
            }
        }

        let output = resolver.poll(pid, &process_name).await;
        for diagnostic in output.diagnostics {
            ctx.diagnostics.send(diagnostic);
        }

        if let Some(health) = &ctx.health {
            if let Some(took) = output.health.last_duration {
                health.resolver_lookup_duration.observe(took.as_secs_f64());
            }
            health
                .resolver_interval_seconds
                .set(output.health.interval.as_secs_f64());
            health
                .resolver_connections
                .set(output.connections.len() as f64);
            if output.switched {
                health.resolver_strategy_switches.inc();
            }
        }

        if output.added > 0 || output.removed > 0 {
            debug!(
                added = output.added,
                removed = output.removed,
                total = output.connections.len(),
                "connections changed",
            );
        }

        slot.set_interval(resolver.interval());
        let view = ConnectionsView {
            connections: output.connections,
            health: output.health,
        };
        if output.stale {
            slot.publish_stale(view);
            if budget.record_failure() {
                ctx.terminate("resolver", slot);
                return;
            }
        } else {
            budget.record_success();
            slot.publish(view);
        }
    }

    debug!("connection resolver stopped");
}

/// Inputs of the event worker besides the control channel.
pub struct EventsInputs {
    pub commands: mpsc::Receiver<EventCommand>,
    pub diagnostics: mpsc::Receiver<Diagnostic>,
    pub bandwidth: mpsc::Sender<BandwidthReading>,
}

#[derive(Debug, Clone)]
pub struct EventsSettings {
    pub runlevels: Vec<Runlevel>,
    pub reconnect: bool,
    pub reconnect_delay: Duration,
    /// Daemon log read once at startup to prepopulate the buffer.
    pub log_file: Option<PathBuf>,
    pub prepopulate_limit: usize,
    pub publish_every: Duration,
}

async fn next_event(subscription: &mut Option<EventSubscription>) -> Option<ControlEvent> {
    match subscription {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Consume the daemon's event subscription, the renderer's commands and
/// every worker's diagnostics into the event buffer.
pub async fn run_events<C: ControlChannel>(
    ctx: WorkerContext<C>,
    mut normalizer: EventNormalizer,
    mut inputs: EventsInputs,
    settings: EventsSettings,
) {
    let slot = &ctx.producers.events;

    if let Some(path) = &settings.log_file {
        match daemon_log::read_log_file(path, settings.prepopulate_limit, &Local::now()).await {
            Ok((events, read_to)) => {
                ctx.channel.log_read_up_to(path, read_to);
                let stored = normalizer.prepopulate(events);
                info!(
                    path = %path.display(),
                    stored,
                    "event buffer prepopulated from daemon log"
                );
                normalizer.push_diagnostic(
                    Diagnostic::notice(format!("Read {stored} entries from the daemon log")),
                    Utc::now(),
                );
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unable to prepopulate events");
                normalizer.push_diagnostic(
                    Diagnostic::notice(format!("Unable to read the daemon log ({e:#})")),
                    Utc::now(),
                );
            }
        }
    }
    slot.publish(normalizer.view());

    let mut subscription: Option<EventSubscription> = None;
    let mut retry_at = Some(Instant::now());
    let mut budget = FailureBudget::new(settings.publish_every, DEFAULT_FAILURE_LIMIT);
    let mut last_input = Instant::now();
    let mut evicted = normalizer.stats().evicted;

    let mut ticker = tokio::time::interval(settings.publish_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = sleep_until(retry_at), if subscription.is_none() => {
                retry_at = None;
                match ctx.channel.subscribe(&settings.runlevels).await {
                    Ok(rx) => {
                        info!("subscribed to daemon events");
                        subscription = Some(rx);
                    }
                    Err(e) => {
                        warn!(error = %e, "event subscription failed");
                        ctx.control_failure("subscribe", &e);
                        normalizer.push_diagnostic(
                            Diagnostic::warn(format!("Unable to subscribe to daemon events ({e})")),
                            Utc::now(),
                        );
                        if !settings.reconnect || budget.record_failure() {
                            slot.publish(normalizer.view());
                            ctx.terminate("events", slot);
                            return;
                        }
                        retry_at = Some(Instant::now() + settings.reconnect_delay);
                    }
                }
            }
            event = next_event(&mut subscription), if subscription.is_some() => match event {
                Some(event) => {
                    last_input = Instant::now();
                    let ingested = normalizer.ingest(event, &Local::now());
                    record_ingest(&ctx, &inputs.bandwidth, ingested);
                }
                None => {
                    subscription = None;
                    normalizer.flush_pending();

                    if !settings.reconnect {
                        error!(
                            "control channel closed and reconnecting is disabled, \
                             stopping event collection"
                        );
                        normalizer.push_diagnostic(
                            Diagnostic::warn("Control channel closed and reconnecting is disabled"),
                            Utc::now(),
                        );
                        slot.publish(normalizer.view());
                        ctx.terminate("events", slot);
                        return;
                    }

                    warn!(
                        delay = ?settings.reconnect_delay,
                        "event subscription ended, reconnecting"
                    );
                    normalizer.push_diagnostic(
                        Diagnostic::notice(format!(
                            "Control channel closed, reconnecting in {:?}",
                            settings.reconnect_delay
                        )),
                        Utc::now(),
                    );
                    if budget.record_failure() {
                        slot.publish(normalizer.view());
                        ctx.terminate("events", slot);
                        return;
                    }
                    retry_at = Some(Instant::now() + settings.reconnect_delay);
                }
            },
            Some(command) = inputs.commands.recv() => {
                normalizer.apply(command, Utc::now());
                slot.publish(normalizer.view());
            }
            Some(diagnostic) = inputs.diagnostics.recv() => {
                normalizer.push_diagnostic(diagnostic, Utc::now());
            }
            _ = ticker.tick() => {
                if last_input.elapsed() >= IDLE_FLUSH {
                    normalizer.flush_pending();
                }

                let stats = normalizer.stats();
                if let Some(health) = &ctx.health {
                    health
                        .events_evicted
                        .inc_by(stats.evicted.saturating_sub(evicted) as f64);
                }
                evicted = stats.evicted;

                slot.publish(normalizer.view());
            }
        }
    }

    normalizer.flush_pending();
    slot.publish(normalizer.view());
    debug!("event collection stopped");
}

fn record_ingest<C>(
    ctx: &WorkerContext<C>,
    bandwidth: &mpsc::Sender<BandwidthReading>,
    ingested: Ingested,
) {
    match ingested {
        Ingested::Stored(outcome) => {
            if let Some(health) = &ctx.health {
                health.events_received.inc();
                if outcome == InsertOutcome::Collapsed {
                    health.events_deduplicated.inc();
                }
            }
        }
        Ingested::Bandwidth { read, written } => {
            if bandwidth.try_send((Utc::now(), read, written)).is_err() {
                debug!("bandwidth reading dropped");
            }
        }
        Ingested::Status(status) => info!(?status, "control channel status changed"),
        Ingested::Pending | Ingested::Ignored => {}
    }
}

#[derive(Debug, Clone)]
pub struct SamplerSettings {
    pub interval: Duration,
    pub backfill: bool,
    pub history_path: Option<PathBuf>,
    pub persist_on_exit: bool,
    /// Daemon state file with bandwidth history.
    pub state_file: Option<PathBuf>,
}

async fn backfill(
    sampler: &mut Sampler,
    settings: &SamplerSettings,
    diagnostics: &DiagnosticSender,
) {
    if let Some(path) = &settings.history_path {
        match History::load(path).await {
            Ok(Some(history)) => {
                let points = sampler.backfill_history(&history);
                info!(path = %path.display(), points, "sampler history loaded");
                diagnostics.send(Diagnostic::notice(format!(
                    "Loaded {points} samples from the previous session"
                )));
            }
            Ok(None) => debug!(path = %path.display(), "no sampler history yet"),
            Err(e) => {
                warn!(error = %e, "unable to load sampler history");
                diagnostics.send(Diagnostic::notice(format!(
                    "Unable to load sampler history ({e:#})"
                )));
            }
        }
    }

    if let Some(path) = &settings.state_file {
        diagnostics.send(sampler.backfill_state_file(path).await);
    }
}

/// Sample numeric metrics on a fixed tick, folding in pushed bandwidth.
pub async fn run_sampler<C: ControlChannel>(
    ctx: WorkerContext<C>,
    mut sampler: Sampler,
    mut bandwidth: mpsc::Receiver<BandwidthReading>,
    settings: SamplerSettings,
) {
    let slot = &ctx.producers.samples;

    if settings.backfill {
        backfill(&mut sampler, &settings, &ctx.diagnostics).await;
    }
    slot.publish(sampler.view());

    let mut budget = FailureBudget::new(settings.interval, DEFAULT_FAILURE_LIMIT);
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(interval = ?settings.interval, metrics = sampler.metric_count(), "sampler started");

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            Some((at, read, written)) = bandwidth.recv() => {
                sampler.record_bandwidth(at, read, written);
            }
            _ = ticker.tick() => {
                slot.begin();
                let report = sampler.sample(&ctx.channel, Utc::now()).await;

                for diagnostic in report.diagnostics {
                    ctx.diagnostics.send(diagnostic);
                }
                for (metric, err) in &report.errors {
                    debug!(metric = %metric, error = %err, "sample failed");
                    if let Some(health) = &ctx.health {
                        health.sampler_errors.with_label_values(&[metric]).inc();
                    }
                }

                let failed =
                    !report.errors.is_empty() && report.errors.len() >= sampler.metric_count();
                if failed {
                    slot.publish_stale(sampler.view());
                    if budget.record_failure() {
                        ctx.terminate("sampler", slot);
                        return;
                    }
                } else {
                    budget.record_success();
                    slot.publish(sampler.view());
                }
            }
        }
    }

    if settings.persist_on_exit {
        if let Some(path) = &settings.history_path {
            match sampler.history().save(path).await {
                Ok(()) => info!(path = %path.display(), "sampler history persisted"),
                Err(e) => warn!(error = %e, "unable to persist sampler history"),
            }
        }
    }

    debug!("sampler stopped");
}

/// Re-validate the configuration file against the running daemon.
pub async fn run_confdiff<C: ControlChannel>(
    ctx: WorkerContext<C>,
    differ: ConfigDiffer,
    torrc: PathBuf,
    interval: Duration,
) {
    let slot = &ctx.producers.config;
    let mut budget = FailureBudget::new(interval, DEFAULT_FAILURE_LIMIT);
    let mut file_error_reported = false;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(path = %torrc.display(), interval = ?interval, "config differ started");

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {
                slot.begin();

                let file = match tokio::fs::read_to_string(&torrc).await {
                    Ok(text) => {
                        file_error_reported = false;
                        text
                    }
                    Err(e) => {
                        warn!(path = %torrc.display(), error = %e, "configuration file unreadable");
                        if !file_error_reported {
                            ctx.diagnostics.send(Diagnostic::notice(format!(
                                "Unable to read the configuration file ({}: {e})",
                                torrc.display()
                            )));
                            file_error_reported = true;
                        }
                        slot.fail();
                        if budget.record_failure() {
                            ctx.terminate("confdiff", slot);
                            return;
                        }
                        continue;
                    }
                };

                let live = match ctx.channel.config_text().await {
                    Ok(text) => Some(text),
                    Err(e) => {
                        debug!(error = %e, "running configuration unavailable");
                        ctx.control_failure("config_text", &e);
                        None
                    }
                };

                let view = differ.view(live.as_deref(), &file);
                debug!(
                    entries = view.entries.len(),
                    live = view.live_available,
                    "configuration validated",
                );
                if let Some(health) = &ctx.health {
                    health.confdiff_runs.inc();
                }

                budget.record_success();
                slot.publish(view);
            }
        }
    }

    debug!("config differ stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, EventsConfig};
    use crate::control::{ChannelStatus, Query, Reply, ScriptedChannel};
    use crate::snapshot::StaleReason;

    fn context(
        channel: Arc<ScriptedChannel>,
    ) -> (WorkerContext<ScriptedChannel>, mpsc::Receiver<Diagnostic>) {
        let cfg = Config::default();
        let (tx, rx) = mpsc::channel(DIAGNOSTIC_BUFFER);
        let ctx = WorkerContext {
            channel: Guarded::new(channel, Duration::from_secs(1)),
            producers: Arc::new(Producers::new(&cfg)),
            diagnostics: DiagnosticSender::new(tx),
            health: None,
            cancel: CancellationToken::new(),
        };
        (ctx, rx)
    }

    fn events_settings(reconnect: bool) -> EventsSettings {
        EventsSettings {
            runlevels: Runlevel::ALL.to_vec(),
            reconnect,
            reconnect_delay: Duration::from_secs(5),
            log_file: None,
            prepopulate_limit: 100,
            publish_every: Duration::from_millis(100),
        }
    }

    fn inputs() -> (
        EventsInputs,
        mpsc::Sender<EventCommand>,
        mpsc::Sender<Diagnostic>,
        mpsc::Receiver<BandwidthReading>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (diag_tx, diag_rx) = mpsc::channel(8);
        let (bw_tx, bw_rx) = mpsc::channel(8);
        (
            EventsInputs {
                commands: cmd_rx,
                diagnostics: diag_rx,
                bandwidth: bw_tx,
            },
            cmd_tx,
            diag_tx,
            bw_rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_terminate_without_reconnect() {
        let channel = Arc::new(ScriptedChannel::new());
        let (ctx, _diag) = context(Arc::clone(&channel));
        let (inputs, _cmd, _d, _bw) = inputs();
        let producers = Arc::clone(&ctx.producers);

        let task = tokio::spawn(run_events(
            ctx,
            EventNormalizer::new(&EventsConfig::default()),
            inputs,
            events_settings(false),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.subscription_count(), 1);
        channel.close_subscriptions();

        task.await.expect("events worker");
        let view = producers
            .events
            .read(Instant::now(), Duration::from_millis(250), 3);
        assert_eq!(view.reason, Some(StaleReason::Terminated));
        let events = view.value.expect("last view kept");
        assert!(events
            .events
            .iter()
            .any(|e| e.message.contains("reconnecting is disabled")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_resubscribe_after_delay() {
        let channel = Arc::new(ScriptedChannel::new());
        let (ctx, _diag) = context(Arc::clone(&channel));
        let cancel = ctx.cancel.clone();
        let (inputs, _cmd, _d, _bw) = inputs();

        let task = tokio::spawn(run_events(
            ctx,
            EventNormalizer::new(&EventsConfig::default()),
            inputs,
            events_settings(true),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.close_subscriptions();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(channel.subscription_count(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(channel.subscription_count(), 2);

        cancel.cancel();
        task.await.expect("events worker");
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_forward_bandwidth_and_diagnostics() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.queue_event(ControlEvent::StatusChanged(ChannelStatus::Connected));
        channel.queue_event(ControlEvent::Bandwidth {
            read: 10,
            written: 20,
        });
        let (ctx, _diag) = context(Arc::clone(&channel));
        let cancel = ctx.cancel.clone();
        let producers = Arc::clone(&ctx.producers);
        let (inputs, _cmd, diag_tx, mut bw_rx) = inputs();

        let task = tokio::spawn(run_events(
            ctx,
            EventNormalizer::new(&EventsConfig::default()),
            inputs,
            events_settings(true),
        ));

        let (_, read, written) = bw_rx.recv().await.expect("bandwidth forwarded");
        assert_eq!((read, written), (10, 20));

        diag_tx
            .send(Diagnostic::warn("All connection resolvers failed"))
            .await
            .expect("send diagnostic");
        tokio::time::sleep(Duration::from_millis(250)).await;

        let view = producers
            .events
            .read(Instant::now(), Duration::from_millis(250), 3);
        let events = view.value.expect("events published");
        let messages: Vec<&str> = events.events.iter().map(|e| e.message.as_str()).collect();
        assert!(messages.contains(&"Control channel connected"));
        assert!(messages.contains(&"All connection resolvers failed"));

        cancel.cancel();
        task.await.expect("events worker");
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_confdiff_reports_unavailable_live_config() {
        let dir = tempfile::tempdir().expect("temp dir");
        let torrc = dir.path().join("torrc");
        std::fs::write(&torrc, "ORPort 9001\nNickname alpha\n").expect("write torrc");

        let channel = Arc::new(ScriptedChannel::new());
        let (ctx, _diag) = context(Arc::clone(&channel));
        let cancel = ctx.cancel.clone();
        let producers = Arc::clone(&ctx.producers);
        let latest = {
            let producers = Arc::clone(&producers);
            move || {
                producers
                    .config
                    .read(Instant::now(), Duration::from_secs(1), 3)
                    .value
            }
        };

        let differ = ConfigDiffer::from_config(&Config::default().confdiff);
        let task = tokio::spawn(run_confdiff(ctx, differ, torrc, Duration::from_millis(50)));

        wait_for(|| latest().is_some()).await;
        let config = latest().expect("config published");
        assert!(!config.live_available);
        assert_eq!(config.entries.len(), 2);

        channel.set_reply(Query::ConfigText, Reply::ConfigText("ORPort 9001\n".into()));
        wait_for(|| latest().is_some_and(|c| c.live_available)).await;

        cancel.cancel();
        task.await.expect("confdiff worker");
    }

    #[tokio::test]
    async fn test_confdiff_missing_file_fails_slot() {
        let channel = Arc::new(ScriptedChannel::new());
        let (ctx, mut diag) = context(channel);
        let cancel = ctx.cancel.clone();
        let producers = Arc::clone(&ctx.producers);

        let differ = ConfigDiffer::from_config(&Config::default().confdiff);
        let task = tokio::spawn(run_confdiff(
            ctx,
            differ,
            PathBuf::from("/nonexistent/relaymon/torrc"),
            Duration::from_millis(50),
        ));

        let diagnostic = diag.recv().await.expect("diagnostic");
        assert!(diagnostic.message.contains("Unable to read the configuration file"));

        let view = producers
            .config
            .read(Instant::now(), Duration::from_secs(1), 3);
        assert_eq!(view.reason, Some(StaleReason::NoData));

        cancel.cancel();
        task.await.expect("confdiff worker");
    }
}
