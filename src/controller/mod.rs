pub mod clock;
pub mod rebalance;
pub mod site;
pub mod status;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::domain::{BatteryState, ConsumerState};
use crate::hardware::dispatcher::CommandDispatcher;
use crate::hardware::{Command, CommandChannel, TelemetryEvent};
use crate::repo::persistence::Persister;
use crate::repo::{load_typed, StateStore};

pub use clock::{Clock, ManualClock, SystemClock};
pub use rebalance::{Action, Decision, RebalanceEngine, TickOutcome};
pub use site::{Route, Site};
pub use status::{EntityStatus, LoggingMetricsSink, MetricsSink, SiteStatus, StatusPublisher};

pub const CONSUMER_NAMESPACE: &str = "consumer";
pub const BATTERY_NAMESPACE: &str = "battery";

const INBOX_CAPACITY: usize = 1024;

/// Collaborators every component is built against.
#[derive(Clone)]
pub struct Environment {
    pub clock: Arc<dyn Clock>,
    pub commands: Arc<dyn CommandChannel>,
    pub store: Arc<dyn StateStore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub timezone: Tz,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Site controller is not running")]
    Stopped,
}

/// What one rebalance pass decided.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub at: DateTime<Utc>,
    pub decisions: Vec<Decision>,
    pub commands: Vec<Command>,
}

enum ControlMessage {
    Telemetry(TelemetryEvent),
    Tick(oneshot::Sender<TickReport>),
    Status(oneshot::Sender<SiteStatus>),
}

/// Single owner of the site model.
///
/// Telemetry, rebalance passes and persistence flushes all run on one task,
/// so every pass sees a consistent view and no entity needs a lock.
pub struct SiteController {
    env: Environment,
    site: Site,
    routes: HashMap<String, Vec<Route>>,
    engine: RebalanceEngine,
    persister: Persister,
    publisher: StatusPublisher,
    rebalance_every: Duration,
    persist_every: Duration,
    command_timeout: Duration,
    last_tick: Option<DateTime<Utc>>,
}

impl SiteController {
    pub fn new(cfg: &Config, env: Environment) -> Result<Self, ConfigError> {
        let engine = RebalanceEngine::from_config(&cfg.controller)?;
        let site = Site::from_config(cfg, env.timezone, env.clock.now());
        let routes = site.routes();
        Ok(Self {
            engine,
            persister: Persister::new(env.store.clone()),
            publisher: StatusPublisher::new(env.metrics.clone()),
            rebalance_every: Duration::from_secs(cfg.controller.rebalance_interval_seconds.max(1)),
            persist_every: Duration::from_secs(cfg.controller.persist_interval_seconds.max(1)),
            command_timeout: Duration::from_secs(cfg.controller.command_timeout_seconds.max(1)),
            last_tick: None,
            env,
            site,
            routes,
        })
    }

    pub fn site(&self) -> &Site {
        &self.site
    }

    /// Rehydrate persisted entity records. Unreadable records are logged and
    /// the entity starts fresh.
    pub async fn restore(&mut self) {
        let store = self.env.store.clone();
        let mut restored = 0usize;

        for consumer in &mut self.site.consumers {
            match load_typed::<ConsumerState>(store.as_ref(), CONSUMER_NAMESPACE, consumer.id()).await {
                Ok(Some(saved)) => {
                    consumer.restore(saved);
                    restored += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(consumer = %consumer.id(), error = %e, "persisted state unreadable, starting fresh"),
            }
        }
        for battery in &mut self.site.batteries {
            match load_typed::<BatteryState>(store.as_ref(), BATTERY_NAMESPACE, battery.id()).await {
                Ok(Some(saved)) => {
                    battery.restore(saved);
                    restored += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(battery = %battery.id(), error = %e, "persisted state unreadable, starting fresh"),
            }
        }
        info!(records = restored, "entity state restored");
    }

    pub fn spawn(self, cancel: CancellationToken) -> SiteHandle {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let (dispatcher, worker) =
            CommandDispatcher::spawn(self.env.commands.clone(), self.command_timeout, cancel.clone());
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            self.run(rx, dispatcher, task_cancel).await;
            if let Err(e) = worker.await {
                warn!(error = %e, "command worker failed");
            }
        });
        SiteHandle {
            tx,
            cancel,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<ControlMessage>,
        dispatcher: CommandDispatcher,
        cancel: CancellationToken,
    ) {
        let start = Instant::now();
        let mut rebalance = interval_at(start + self.rebalance_every, self.rebalance_every);
        rebalance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut persist = interval_at(start + self.persist_every, self.persist_every);
        persist.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            consumers = self.site.consumers.len(),
            batteries = self.site.batteries.len(),
            rebalance_every_s = self.rebalance_every.as_secs(),
            "site controller started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = rebalance.tick() => {
                    self.rebalance(&dispatcher);
                }
                _ = persist.tick() => self.persister.flush(),
                message = inbox.recv() => match message {
                    Some(ControlMessage::Telemetry(event)) => self.ingest(event),
                    Some(ControlMessage::Tick(reply)) => {
                        let report = self.rebalance(&dispatcher);
                        reply.send(report).ok();
                    }
                    Some(ControlMessage::Status(reply)) => {
                        reply.send(self.status()).ok();
                    }
                    None => break,
                },
            }
        }

        self.persister.flush_now().await;
        info!("site controller stopped");
    }

    fn ingest(&mut self, event: TelemetryEvent) {
        let Some(routes) = self.routes.get(&event.entity_id) else {
            debug!(entity = %event.entity_id, "no entity listens to this sensor");
            return;
        };
        let now = self.env.clock.now();

        for route in routes {
            match *route {
                Route::Grid(signal) => {
                    self.site
                        .grid
                        .ingest(signal, event.value.as_numeric(), event.timestamp);
                }
                Route::Battery(idx, signal) => {
                    let battery = &mut self.site.batteries[idx];
                    if battery.ingest(signal, event.value.as_numeric()) {
                        self.persister
                            .mark_dirty(BATTERY_NAMESPACE, battery.id(), battery.state());
                    }
                }
                Route::Consumer(idx, signal) => {
                    let consumer = &mut self.site.consumers[idx];
                    consumer.ingest(signal, &event.entity_id, &event.value, event.timestamp);
                    if consumer.refresh(now) {
                        self.persister
                            .mark_dirty(CONSUMER_NAMESPACE, consumer.id(), consumer.state());
                    }
                }
            }
        }
    }

    fn rebalance(&mut self, dispatcher: &CommandDispatcher) -> TickReport {
        let now = self.env.clock.now();
        let outcome = self.engine.tick(&mut self.site, now);

        for &idx in &outcome.dirty_consumers {
            let consumer = &self.site.consumers[idx];
            self.persister
                .mark_dirty(CONSUMER_NAMESPACE, consumer.id(), consumer.state());
        }
        for &idx in &outcome.dirty_batteries {
            let battery = &self.site.batteries[idx];
            self.persister
                .mark_dirty(BATTERY_NAMESPACE, battery.id(), battery.state());
        }

        dispatcher.dispatch(outcome.commands.clone());
        self.publisher.publish(status::entity_statuses(&self.site, now));
        self.last_tick = Some(now);

        TickReport {
            at: now,
            decisions: outcome.decisions,
            commands: outcome.commands,
        }
    }

    fn status(&self) -> SiteStatus {
        let now = self.env.clock.now();
        SiteStatus {
            at: now,
            grid: self.site.grid.snapshot(),
            last_tick: self.last_tick,
            entities: status::entity_statuses(&self.site, now),
        }
    }
}

/// Cloneable front door to a running [`SiteController`].
#[derive(Clone)]
pub struct SiteHandle {
    tx: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SiteHandle {
    pub async fn push(&self, event: TelemetryEvent) -> Result<(), ControllerError> {
        self.tx
            .send(ControlMessage::Telemetry(event))
            .await
            .map_err(|_| ControllerError::Stopped)
    }

    /// Run a rebalance pass now, outside the regular interval.
    pub async fn tick(&self) -> Result<TickReport, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlMessage::Tick(reply))
            .await
            .map_err(|_| ControllerError::Stopped)?;
        rx.await.map_err(|_| ControllerError::Stopped)
    }

    pub async fn status(&self) -> Result<SiteStatus, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlMessage::Status(reply))
            .await
            .map_err(|_| ControllerError::Stopped)?;
        rx.await.map_err(|_| ControllerError::Stopped)
    }

    /// Stop the controller and wait for the final state flush.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "site controller task failed");
            }
        }
    }
}
