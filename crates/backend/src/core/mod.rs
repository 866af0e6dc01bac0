//! The dispatch core.
//!
//! A single task owns every piece of mutable daemon state: the engine map,
//! the per-driver histories, the pending jobs and the recurring drivers.
//! Everything else talks to it through a [`CoreHandle`].
//!
//! # Lifecycle
//!
//! ```text
//! new() ──► run(): recover ──► schedule drivers ──► loop ──► shutdown
//!                                                  ▲
//!        control requests, signals, job outcomes, driver ticks
//! ```
//!
//! Engines are started lazily on the first push that names them and
//! recorded in the recovery manifest, so a restarted daemon brings them
//! back on the same ports.
//!
//! # History
//!
//! Every finished job, whether completed or aborted, goes through
//! [`Core::event`], the only writer of histories and publications.

use std::{
  collections::{BTreeMap, HashMap},
  path::PathBuf,
  sync::Arc,
};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub mod driver;
pub mod history;
pub mod job;
pub mod recovery;
pub mod signals;

#[cfg(test)]
mod __tests__;

pub use self::{
  driver::{DriverTick, Drivers},
  history::{Histories, History, HistoryEntry, Timestamp},
  job::{Job, JobState, driver_id},
  recovery::{Manifest, ManifestEntry, ManifestStore},
  signals::CoreSignal,
};
use crate::{
  domain::config::Config,
  engine::{Engine, EngineContext, EngineHandle, ExternalSupervisor, JobOutcome, Outcome, Supervisor, Ticket},
  io::{ExecutionUnit, PortMapper},
  ipc::{
    Action, ControlError, DropReply, ListReply, PastReply, Publication, PushReply, Request, RouteReply, StatsReply,
    render_reply,
  },
  routing::GroupRouter,
  security::{AllowAll, KnownUsers, Verifier},
};

const CONTROL_QUEUE: usize = 256;
const PUBLICATION_BUFFER: usize = 1024;

type ReplyTx = oneshot::Sender<Result<Value, ControlError>>;

struct ControlRequest {
  request: Request,
  reply: ReplyTx,
}

// ============================================================================
// Handle
// ============================================================================

/// Cheap, cloneable access to a running [`Core`].
#[derive(Clone)]
pub struct CoreHandle {
  requests: mpsc::Sender<ControlRequest>,
  signals: mpsc::UnboundedSender<CoreSignal>,
  publications: broadcast::Sender<Publication>,
  router: Arc<GroupRouter>,
}

impl CoreHandle {
  /// Run one control request. Push requests resolve once the job is done.
  pub async fn request(&self, request: Request) -> Result<Value, ControlError> {
    let (reply, rx) = oneshot::channel();
    self
      .requests
      .send(ControlRequest { request, reply })
      .await
      .map_err(|_| ControlError::Shutdown)?;

    rx.await.unwrap_or(Err(ControlError::Shutdown))
  }

  /// Answer one raw control line. Never fails: errors become error replies.
  pub async fn handle_line(&self, line: &str) -> Value {
    match Request::parse(line) {
      Ok(request) => {
        let id = request.id.clone();
        let result = self.request(request).await;
        render_reply(id.as_ref(), result)
      }
      Err(rejection) => {
        debug!(error = %rejection.error, "Rejected control line");
        render_reply(rejection.id.as_ref(), Err(rejection.error))
      }
    }
  }

  /// Deliver a lifecycle signal. Returns false once the core has stopped.
  pub fn signal(&self, signal: CoreSignal) -> bool {
    self.signals.send(signal).is_ok()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Publication> {
    self.publications.subscribe()
  }

  /// Group routing without a round trip through the core.
  pub fn router(&self) -> &Arc<GroupRouter> {
    &self.router
  }
}

// ============================================================================
// Core
// ============================================================================

pub struct CoreOptions {
  pub config: Config,
  /// Re-read on reload; the default location is used when unset
  pub config_path: Option<PathBuf>,
  pub verifier: Arc<dyn Verifier>,
  pub supervisor: Arc<dyn Supervisor>,
}

impl CoreOptions {
  /// Requests are gated by `core.users` when it lists anyone.
  pub fn new(config: Config) -> Self {
    let verifier: Arc<dyn Verifier> = if config.core.users.is_empty() {
      Arc::new(AllowAll)
    } else {
      Arc::new(KnownUsers::new(config.core.users.iter().cloned()))
    };

    Self {
      config,
      config_path: None,
      verifier,
      supervisor: Arc::new(ExternalSupervisor),
    }
  }
}

struct Pending {
  job: Job,
  /// None for driver-initiated jobs
  reply: Option<ReplyTx>,
}

pub struct Core {
  config: Config,
  config_path: Option<PathBuf>,
  engines: HashMap<String, EngineHandle>,
  histories: Histories,
  pending: HashMap<Ticket, Pending>,
  router: Arc<GroupRouter>,
  verifier: Arc<dyn Verifier>,
  context: EngineContext,
  manifest: ManifestStore,
  drivers: Drivers,
  publications: broadcast::Sender<Publication>,
  requests: mpsc::Receiver<ControlRequest>,
  signals: mpsc::UnboundedReceiver<CoreSignal>,
  outcomes: mpsc::UnboundedReceiver<JobOutcome>,
  ticks: mpsc::UnboundedReceiver<DriverTick>,
  cancel: CancellationToken,
}

impl Core {
  /// Build the core. Must be called from within a tokio runtime: worker
  /// sessions run on the runtime current at this point.
  pub fn new(options: CoreOptions, cancel: CancellationToken) -> (Self, CoreHandle) {
    let CoreOptions {
      config,
      config_path,
      verifier,
      supervisor,
    } = options;

    let (requests_tx, requests) = mpsc::channel(CONTROL_QUEUE);
    let (signals_tx, signals) = mpsc::unbounded_channel();
    let (outcomes_tx, outcomes) = mpsc::unbounded_channel();
    let (publications, _) = broadcast::channel(PUBLICATION_BUFFER);
    let (drivers, ticks) = Drivers::new(cancel.child_token());

    let router = Arc::new(GroupRouter::from_groups(&config.groups));
    let context = EngineContext {
      network: config.network.clone(),
      mapper: Arc::new(PortMapper::new(config.network.ports)),
      unit: Arc::new(ExecutionUnit::current()),
      supervisor,
      outcomes: outcomes_tx,
      cancel: cancel.child_token(),
    };

    let handle = CoreHandle {
      requests: requests_tx,
      signals: signals_tx,
      publications: publications.clone(),
      router: router.clone(),
    };

    let core = Self {
      histories: Histories::new(config.history_limit()),
      manifest: ManifestStore::new(&config.state_dir()),
      config,
      config_path,
      engines: HashMap::new(),
      pending: HashMap::new(),
      router,
      verifier,
      context,
      drivers,
      publications,
      requests,
      signals,
      outcomes,
      ticks,
      cancel,
    };

    (core, handle)
  }

  pub async fn run(mut self) {
    info!(configured = self.config.engines.len(), "Core starting");

    self.recover();
    self.drivers.rebuild(&self.config.engines);

    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          debug!("Core cancelled");
          break;
        }

        Some(signal) = self.signals.recv() => match signal {
          CoreSignal::Terminate => {
            info!("Terminating");
            break;
          }
          CoreSignal::Reload => self.reload(),
          CoreSignal::Purge => self.purge(),
        },

        Some(outcome) = self.outcomes.recv() => self.complete(outcome),

        Some(ControlRequest { request, reply }) = self.requests.recv() => self.handle_request(request, reply),

        Some(tick) = self.ticks.recv() => self.fire(tick),

        else => break,
      }
    }

    self.shutdown();
  }

  // --------------------------------------------------------------------------
  // Control
  // --------------------------------------------------------------------------

  fn handle_request(&mut self, request: Request, reply: ReplyTx) {
    let action = request.action.name();

    if let Err(reason) = self.verifier.verify(&request) {
      warn!(action, reason = %reason, "Request rejected");
      let _ = reply.send(Err(ControlError::Unauthorized(reason)));
      return;
    }

    trace!(action, "Control request");

    let result = match request.action {
      Action::Push { engine, method, args } => match self.push(&engine, &method, args) {
        Ok(job) => {
          self.pending.insert(job.ticket(), Pending { job, reply: Some(reply) });
          return;
        }
        Err(e) => Err(e),
      },
      Action::Drop { engine } => self.drop_engine(&engine),
      Action::Past { driver_id } => self.past(&driver_id),
      Action::Stats => encode(&self.stats()),
      Action::List => encode(&self.list()),
      Action::Route { group, key } => self
        .router
        .route(&group, key.as_deref())
        .map_err(ControlError::from)
        .and_then(|backend| encode(&RouteReply { backend })),
    };

    if let Err(e) = &result {
      debug!(action, error = %e, "Control request failed");
    }
    let _ = reply.send(result);
  }

  /// Create a job for `engine` and hand it over. The caller tracks it.
  fn push(&mut self, engine: &str, method: &str, args: Value) -> Result<Job, ControlError> {
    let handle = self.engine(engine)?;
    let mut job = Job::new(engine, method, args);

    if let Err(e) = job.enqueue(&handle) {
      warn!(engine, error = %e, "Engine stopped underneath the core");
      self.engines.remove(engine);
      self.save_manifest();
      return Err(e.into());
    }

    Ok(job)
  }

  /// The running engine called `name`, started on first use.
  fn engine(&mut self, name: &str) -> Result<EngineHandle, ControlError> {
    if let Some(handle) = self.engines.get(name) {
      if !handle.is_stopped() {
        return Ok(handle.clone());
      }
      self.engines.remove(name);
    }

    let Some(config) = self.config.engines.get(name).cloned() else {
      return Err(ControlError::UnknownEngine(name.to_string()));
    };

    let handle = Engine::spawn(name, config, &self.context)?;

    self.engines.insert(name.to_string(), handle.clone());
    self.save_manifest();
    Ok(handle)
  }

  fn drop_engine(&mut self, name: &str) -> Result<Value, ControlError> {
    let Some(handle) = self.engines.remove(name) else {
      return Err(ControlError::UnknownEngine(name.to_string()));
    };

    handle.shutdown();
    self.save_manifest();
    info!(engine = name, "Engine dropped");
    encode(&DropReply { ok: true })
  }

  fn past(&self, driver: &str) -> Result<Value, ControlError> {
    let history = self
      .histories
      .get(driver)
      .ok_or_else(|| ControlError::NoHistory(driver.to_string()))?;

    encode(&PastReply {
      entries: history.entries(),
    })
  }

  fn stats(&self) -> StatsReply {
    let mut engines: Vec<String> = self.engines.keys().cloned().collect();
    engines.sort();

    StatsReply {
      queue_depths: self
        .engines
        .iter()
        .map(|(name, handle)| (name.clone(), handle.queue_depth()))
        .collect(),
      workers: self
        .engines
        .iter()
        .map(|(name, handle)| (name.clone(), handle.workers()))
        .collect(),
      engines,
      pending_jobs: self.pending.len(),
      histories: self.histories.len(),
    }
  }

  fn list(&self) -> ListReply {
    ListReply {
      engines: self.config.engines.keys().cloned().collect(),
      running: self
        .engines
        .iter()
        .map(|(name, handle)| (name.clone(), handle.endpoints().to_vec()))
        .collect::<BTreeMap<_, _>>(),
    }
  }

  // --------------------------------------------------------------------------
  // Jobs
  // --------------------------------------------------------------------------

  fn complete(&mut self, outcome: JobOutcome) {
    let Some(Pending { mut job, reply }) = self.pending.remove(&outcome.ticket) else {
      debug!(ticket = %outcome.ticket, engine = %outcome.engine, "Outcome for an unknown job");
      return;
    };

    let result = match outcome.outcome {
      Outcome::Completed(body) => job.respond(&body),
      Outcome::Aborted { code, message } => {
        warn!(driver = %job.driver(), code, message = %message, "Job aborted");
        job.abort(code, &message)
      }
    };

    self.event(job.driver(), result.clone());

    if let Some(reply) = reply {
      let _ = reply.send(encode(&PushReply {
        ticket: job.ticket(),
        driver: job.driver().to_string(),
        result,
      }));
    }
  }

  fn fire(&mut self, tick: DriverTick) {
    match self.push(&tick.engine, &tick.method, tick.args) {
      Ok(job) => {
        trace!(driver = %job.driver(), "Driver fired");
        self.pending.insert(job.ticket(), Pending { job, reply: None });
      }
      Err(e) => warn!(engine = %tick.engine, method = %tick.method, error = %e, "Driver failed to push"),
    }
  }

  /// Record a result for `driver` and publish it.
  fn event(&mut self, driver: &str, result: Value) {
    self.histories.record(driver, now(), result.clone());

    // No subscribers is not an error
    let _ = self.publications.send(Publication {
      driver: driver.to_string(),
      result,
    });
  }

  // --------------------------------------------------------------------------
  // Signals
  // --------------------------------------------------------------------------

  fn reload(&mut self) {
    let loaded = match &self.config_path {
      Some(path) => Config::load(path),
      None => Config::load_default(),
    };

    let config = match loaded {
      Ok(config) => config,
      Err(e) => {
        error!(error = %e, "Reload failed, keeping the current configuration");
        return;
      }
    };

    let removed: Vec<String> = self
      .engines
      .keys()
      .filter(|name| !config.engines.contains_key(*name))
      .cloned()
      .collect();

    for name in &removed {
      if let Some(handle) = self.engines.remove(name) {
        handle.shutdown();
      }
    }

    if config.network.ports != self.config.network.ports {
      warn!("Port range changes take effect after a restart");
    }
    self.context.network = config.network.clone();
    self.histories.set_limit(config.history_limit());
    self.router.replace_all(&config.groups);
    self.drivers.rebuild(&config.engines);
    self.config = config;
    self.save_manifest();

    info!(
      dropped = removed.len(),
      configured = self.config.engines.len(),
      "Configuration reloaded"
    );
  }

  fn purge(&mut self) {
    let count = self.histories.len();
    self.histories.clear();
    info!(histories = count, "Histories purged");
  }

  /// Bring back the engines listed in the recovery manifest.
  fn recover(&mut self) {
    let manifest = match self.manifest.load() {
      Ok(manifest) => manifest,
      Err(e) => {
        warn!(path = ?self.manifest.path(), error = %e, "Unable to read the recovery manifest");
        return;
      }
    };

    for entry in manifest.engines {
      if !self.config.engines.contains_key(&entry.name) {
        warn!(engine = %entry.name, "Engine is no longer configured, not recovering it");
        continue;
      }

      if entry.port != 0 {
        self.context.mapper.pin(&entry.name, entry.port);
      }

      match self.engine(&entry.name) {
        Ok(handle) => info!(engine = %entry.name, port = ?handle.port(), "Engine recovered"),
        Err(e) => warn!(engine = %entry.name, error = %e, "Unable to recover engine"),
      }
    }

    self.save_manifest();
  }

  fn shutdown(&mut self) {
    self.drivers.stop();

    for (name, handle) in self.engines.drain() {
      debug!(engine = %name, "Stopping engine");
      handle.shutdown();
    }

    for (_, pending) in self.pending.drain() {
      if let Some(reply) = pending.reply {
        let _ = reply.send(Err(ControlError::Shutdown));
      }
    }

    info!("Core stopped");
  }

  fn save_manifest(&self) {
    let mut engines: Vec<ManifestEntry> = self
      .engines
      .iter()
      .map(|(name, handle)| ManifestEntry {
        name: name.clone(),
        port: handle.port().unwrap_or(0),
      })
      .collect();
    engines.sort_by(|a, b| a.name.cmp(&b.name));

    if let Err(e) = self.manifest.save(&Manifest { engines }) {
      warn!(path = ?self.manifest.path(), error = %e, "Unable to save the recovery manifest");
    }
  }
}

fn now() -> Timestamp {
  Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn encode<T: Serialize>(reply: &T) -> Result<Value, ControlError> {
  serde_json::to_value(reply).map_err(|e| ControlError::Internal(e.to_string()))
}
