pub mod budget;
pub mod workers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::confdiff::ConfigDiffer;
use crate::config::Config;
use crate::control::{ControlChannel, Guarded, LocalChannel};
use crate::events::{EventCommand, EventNormalizer, RunlevelStats};
use crate::export::health::HealthMetrics;
use crate::resolver::{ConnectionResolver, ResolverSettings, Strategy};
use crate::sampler::{ResourceTracker, Sampler};
use crate::snapshot::{Coordinator, Producers, SnapshotHandle};

use workers::{
    DiagnosticSender, EventsInputs, EventsSettings, SamplerSettings, WorkerContext,
    BANDWIDTH_BUFFER, DIAGNOSTIC_BUFFER,
};

/// Capacity of the renderer's command channel.
const COMMAND_BUFFER: usize = 32;

/// Agent runs one worker per producer plus the snapshot coordinator.
pub struct Agent<C = LocalChannel> {
    cfg: Config,
    channel: Arc<C>,
    health: Option<Arc<HealthMetrics>>,
    producers: Arc<Producers>,
    handle: SnapshotHandle,
    coordinator: Option<Coordinator>,
    resolver: Option<ConnectionResolver>,
    resources: Option<Option<ResourceTracker>>,
    commands: mpsc::Sender<EventCommand>,
    command_rx: Option<mpsc::Receiver<EventCommand>>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    coordinator_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    coordinator_cancel: CancellationToken,
}

impl Agent<LocalChannel> {
    /// Creates an agent reading the daemon through local facilities only.
    pub fn new(cfg: Config) -> Result<Self> {
        let channel = Arc::new(LocalChannel::new(&cfg.process));
        Self::with_channel(cfg, channel)
    }
}

impl<C: ControlChannel + 'static> Agent<C> {
    /// Creates an agent over the given control channel, initializing
    /// health metrics when an address is configured.
    pub fn with_channel(cfg: Config, channel: Arc<C>) -> Result<Self> {
        let health = if cfg.health.addr.is_empty() {
            None
        } else {
            Some(Arc::new(
                HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?,
            ))
        };

        let producers = Arc::new(Producers::new(&cfg));
        let (coordinator, handle) = Coordinator::new(Arc::clone(&producers), &cfg);
        let coordinator = coordinator.with_health(health.clone());
        let resolver = ConnectionResolver::from_config(&cfg);
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);

        Ok(Self {
            cfg,
            channel,
            health,
            producers,
            handle,
            coordinator: Some(coordinator),
            resolver: Some(resolver),
            resources: None,
            commands,
            command_rx: Some(command_rx),
            tasks: Vec::new(),
            coordinator_task: None,
            cancel: CancellationToken::new(),
            coordinator_cancel: CancellationToken::new(),
        })
    }

    /// Resolve connections with `strategies` instead of the configured ones.
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn Strategy>>) -> Self {
        self.resolver = Some(ConnectionResolver::new(
            ResolverSettings::from_config(&self.cfg),
            strategies,
        ));
        self
    }

    /// Replace the sampler's resource tracker. `None` disables it.
    pub fn with_resource_tracker(mut self, tracker: Option<ResourceTracker>) -> Self {
        self.resources = Some(tracker);
        self
    }

    /// Renderer access to published snapshots.
    pub fn handle(&self) -> SnapshotHandle {
        self.handle.clone()
    }

    /// Sender for renderer requests to the event buffer.
    pub fn commands(&self) -> mpsc::Sender<EventCommand> {
        self.commands.clone()
    }

    pub fn health(&self) -> Option<Arc<HealthMetrics>> {
        self.health.clone()
    }

    /// Start every producer worker and the coordinator.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server so probes respond early.
        if let Some(health) = &self.health {
            health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        let resolver = self.resolver.take().context("agent already started")?;
        let command_rx = self.command_rx.take().context("agent already started")?;
        let coordinator = self.coordinator.take().context("agent already started")?;

        let (diag_tx, diag_rx) = mpsc::channel(DIAGNOSTIC_BUFFER);
        let (bandwidth_tx, bandwidth_rx) = mpsc::channel(BANDWIDTH_BUFFER);

        let ctx = WorkerContext {
            channel: Guarded::new(Arc::clone(&self.channel), self.cfg.control.timeout),
            producers: Arc::clone(&self.producers),
            diagnostics: DiagnosticSender::new(diag_tx),
            health: self.health.clone(),
            cancel: self.cancel.clone(),
        };

        // 1. Connection resolver.
        self.spawn(
            "resolver",
            workers::run_resolver(ctx.clone(), resolver, self.cfg.process.name.clone()),
        );

        // 2. Event subscription.
        let normalizer = EventNormalizer::new(&self.cfg.events);
        self.spawn_runlevel_reporter(normalizer.runlevel_stats());
        let events = EventsSettings {
            runlevels: self.cfg.events.runlevels.clone(),
            reconnect: self.cfg.control.reconnect,
            reconnect_delay: self.cfg.control.reconnect_delay,
            log_file: self.cfg.process.log_file.clone(),
            prepopulate_limit: self.cfg.events.capacity,
            publish_every: self.cfg.snapshot.tick,
        };
        self.spawn(
            "events",
            workers::run_events(
                ctx.clone(),
                normalizer,
                EventsInputs {
                    commands: command_rx,
                    diagnostics: diag_rx,
                    bandwidth: bandwidth_tx,
                },
                events,
            ),
        );

        // 3. Sampler.
        let mut sampler = Sampler::new(&self.cfg.sampler, self.cfg.resolver.timeout);
        if let Some(tracker) = self.resources.take() {
            sampler = sampler.with_resources(tracker);
        }
        let sampling = SamplerSettings {
            interval: self.cfg.sampler.interval,
            backfill: self.cfg.sampler.backfill,
            history_path: self.cfg.sampler.history_path.clone(),
            persist_on_exit: self.cfg.sampler.persist_on_exit,
            state_file: self.cfg.process.state_file.clone(),
        };
        self.spawn(
            "sampler",
            workers::run_sampler(ctx.clone(), sampler, bandwidth_rx, sampling),
        );

        // 4. Config differ, only with a file to compare.
        match self.cfg.confdiff.torrc.clone() {
            Some(torrc) => {
                let differ = ConfigDiffer::from_config(&self.cfg.confdiff);
                self.spawn(
                    "confdiff",
                    workers::run_confdiff(ctx, differ, torrc, self.cfg.confdiff.interval),
                );
            }
            None => info!("no configuration file set, config diff disabled"),
        }

        // 5. Snapshot coordinator.
        self.coordinator_task = Some(tokio::spawn(
            coordinator.run(self.cfg.snapshot.tick, self.coordinator_cancel.clone()),
        ));

        info!(workers = self.tasks.len(), "agent fully started");

        Ok(())
    }

    /// Stop every worker within the shutdown grace, then publish a final
    /// snapshot and export it when configured.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all producers to stop.
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + self.cfg.shutdown_grace;
        for (name, mut task) in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => debug!(worker = name, "worker stopped"),
                Ok(Err(e)) => error!(worker = name, error = %e, "worker failed"),
                Err(_) => {
                    warn!(worker = name, "worker did not stop within grace period, aborting");
                    task.abort();
                    // Dropping the worker's future kills its child processes.
                    let _ = task.await;
                }
            }
        }

        // The coordinator stops last so its final frame sees every producer's
        // last publication.
        self.coordinator_cancel.cancel();
        if let Some(task) = self.coordinator_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "snapshot coordinator failed");
            }
        }

        if let Some(path) = &self.cfg.snapshot.export_path {
            let snapshot = self.handle.latest();
            crate::export::write_snapshot(path, &snapshot)
                .await
                .context("exporting final snapshot")?;
            info!(
                path = %path.display(),
                generation = snapshot.generation,
                "final snapshot exported"
            );
        }

        // Stop health metrics server.
        if let Some(health) = &self.health {
            health.stop().await?;
        }

        Ok(())
    }

    fn spawn<F>(&mut self, name: &'static str, worker: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(worker = name, "spawning worker");
        self.tasks.push((name, tokio::spawn(worker)));
    }

    /// Spawn background per-runlevel event reporter.
    fn spawn_runlevel_reporter(&mut self, stats: Arc<RunlevelStats>) {
        let cancel = self.cancel.clone();

        self.spawn("runlevel_stats", async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = stats.snapshot();
                        let total: u64 = snapshot.iter().map(|(_, n)| n).sum();

                        if total == 0 {
                            continue;
                        }

                        debug!(events = total, "daemon events (60s)");

                        for (runlevel, count) in &snapshot {
                            debug!(
                                runlevel = %runlevel,
                                count,
                                "  by runlevel (60s)",
                            );
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::control::{ListenerPorts, Query, Reply, ScriptedChannel};
    use crate::resolver::{Protocol, RawConnection, ScriptedStrategy, StrategyKind};

    fn addr(s: &str) -> SocketAddr {
        s.parse().expect("socket address")
    }

    fn config() -> Config {
        let mut cfg = Config::default();
        cfg.health.addr = String::new();
        cfg.sampler.resources = false;
        cfg.resolver.resolve_apps = false;
        cfg.resolver.lookups = false;
        cfg.resolver.interval = Duration::from_millis(100);
        cfg.snapshot.tick = Duration::from_millis(50);
        cfg.shutdown_grace = Duration::from_millis(500);
        cfg
    }

    #[tokio::test]
    async fn test_agent_publishes_and_stops() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.set_reply(Query::Pid, Reply::Pid(4242));
        channel.set_reply(
            Query::ListenerPorts,
            Reply::ListenerPorts(ListenerPorts {
                or: Some(9001),
                ..ListenerPorts::default()
            }),
        );
        channel.set_reply(Query::Counter("traffic/read".into()), Reply::Counter(10));
        channel.set_reply(Query::Counter("traffic/written".into()), Reply::Counter(20));

        let strategy = ScriptedStrategy::new(StrategyKind::Netstat);
        strategy.always(Ok(vec![RawConnection::new(
            addr("10.0.0.1:9001"),
            addr("192.0.2.7:41234"),
            Protocol::Tcp,
        )]));

        let mut agent = Agent::with_channel(config(), channel)
            .expect("agent")
            .with_strategies(vec![Box::new(strategy)]);
        let handle = agent.handle();
        let mut updates = handle.subscribe();

        agent.start().await.expect("start");

        let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                updates.changed().await.expect("coordinator alive");
                let snapshot = handle.latest();
                if !snapshot.connections.is_empty() {
                    return snapshot;
                }
            }
        })
        .await
        .expect("connections within timeout");

        assert_eq!(snapshot.connections.len(), 1);
        assert_eq!(snapshot.stale.connections, None);

        agent.stop().await.expect("stop");
        assert!(agent.start().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_abandons_hung_worker_within_grace() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.set_reply(Query::Pid, Reply::Pid(4242));

        let strategy = ScriptedStrategy::new(StrategyKind::Netstat);
        strategy.set_delay(Some(Duration::from_secs(60)));

        let mut cfg = config();
        cfg.resolver.timeout = Duration::from_secs(60);
        cfg.shutdown_grace = Duration::from_millis(300);

        let mut agent = Agent::with_channel(cfg, channel)
            .expect("agent")
            .with_strategies(vec![Box::new(strategy.clone())]);
        agent.start().await.expect("start");

        tokio::time::timeout(Duration::from_secs(5), async {
            while strategy.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("resolver reached the strategy");

        let started = std::time::Instant::now();
        agent.stop().await.expect("stop");
        let took = started.elapsed();

        assert!(took >= Duration::from_millis(300), "stopped after {took:?}");
        assert!(took < Duration::from_millis(1_500), "stopped after {took:?}");
    }

    #[tokio::test]
    async fn test_stop_exports_final_snapshot() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("snapshot.json");

        let mut cfg = config();
        cfg.snapshot.export_path = Some(path.clone());

        let channel = Arc::new(ScriptedChannel::new());
        let mut agent = Agent::with_channel(cfg, channel)
            .expect("agent")
            .with_strategies(Vec::new());
        agent.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(200)).await;
        agent.stop().await.expect("stop");

        let data = std::fs::read_to_string(&path).expect("snapshot written");
        let json: serde_json::Value = serde_json::from_str(&data).expect("valid json");
        assert!(json["generation"].as_u64().expect("generation") >= 1);
        assert!(json["stale"].is_object());
    }
}
