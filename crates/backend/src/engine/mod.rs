//! Engines: named pools of worker processes.
//!
//! Every engine is a single task owning its job queue, its workers and the
//! [`Actor`] that accepts worker connections. The core enqueues jobs
//! through an [`EngineHandle`]; results come back as [`JobOutcome`]s on the
//! channel handed to [`Engine::spawn`].
//!
//! # Job flow
//!
//! ```text
//! Enqueue ──► queue ──► idle worker: invoke(method, payload)
//!                          chunk*  ──► body
//!                          choke   ──► Completed(body)
//!                          error   ──► Aborted { code, message }
//! ```
//!
//! A worker is idle as soon as it attaches. Any command it sends counts as
//! a sign of life; workers silent for longer than `heartbeat_timeout_secs`
//! are dropped, as are workers whose session closes. Their running job is
//! aborted in both cases.

use std::{
  collections::{HashMap, VecDeque},
  net::SocketAddr,
  sync::Arc,
  time::{Duration, Instant},
};

use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub mod handle;
pub mod message;
pub mod supervisor;
pub mod worker;

pub use handle::{EngineHandle, EngineStats};
pub use message::{EngineMessage, JobOutcome, JobRequest, Outcome, Ticket, codes};
pub use supervisor::{ExternalSupervisor, Supervisor};

use self::{handle::EngineDispatch, worker::Worker};
use crate::{
  domain::config::{EngineConfig, NetworkConfig},
  io::{Actor, ActorError, Attach, PortMapper, SessionId},
  rpc::RpcCommand,
};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  #[error("Engine {0} has stopped")]
  Stopped(String),
  #[error(transparent)]
  Bind(#[from] ActorError),
}

/// Everything an engine shares with its siblings.
#[derive(Clone)]
pub struct EngineContext {
  pub network: NetworkConfig,
  pub mapper: Arc<PortMapper>,
  pub unit: Arc<dyn Attach>,
  pub supervisor: Arc<dyn Supervisor>,
  pub outcomes: mpsc::UnboundedSender<JobOutcome>,
  pub cancel: CancellationToken,
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine {
  name: String,
  config: EngineConfig,
  actor: Actor,
  endpoints: Vec<SocketAddr>,
  supervisor: Arc<dyn Supervisor>,
  outcomes: mpsc::UnboundedSender<JobOutcome>,
  rx: mpsc::UnboundedReceiver<EngineMessage>,
  cancel: CancellationToken,
  stats: Arc<EngineStats>,
  queue: VecDeque<JobRequest>,
  workers: HashMap<SessionId, Worker>,
}

impl Engine {
  /// Start listening for workers and spawn the engine task.
  ///
  /// Fails only when the listener cannot be bound.
  pub fn spawn(name: &str, config: EngineConfig, context: &EngineContext) -> Result<EngineHandle, EngineError> {
    let (tx, rx) = mpsc::unbounded_channel();

    let prototype = Arc::new(EngineDispatch::new(name, tx.clone()));
    let mut actor = Actor::new(
      context.network.clone(),
      Arc::clone(&context.mapper),
      Arc::clone(&context.unit),
      prototype,
    );
    actor.run()?;

    let endpoints = actor.endpoints();
    let stats = Arc::new(EngineStats::default());
    let handle = EngineHandle::new(name, tx, Arc::clone(&stats), endpoints.clone());

    info!(
      engine = name,
      endpoints = ?endpoints,
      queue_limit = config.queue_limit,
      "Engine started"
    );

    let engine = Self {
      name: name.to_string(),
      config,
      actor,
      endpoints,
      supervisor: Arc::clone(&context.supervisor),
      outcomes: context.outcomes.clone(),
      rx,
      cancel: context.cancel.child_token(),
      stats,
      queue: VecDeque::new(),
      workers: HashMap::new(),
    };

    tokio::spawn(engine.run());
    Ok(handle)
  }

  fn heartbeat_timeout(&self) -> Option<Duration> {
    (self.config.heartbeat_timeout_secs > 0).then(|| Duration::from_secs(self.config.heartbeat_timeout_secs))
  }

  async fn run(mut self) {
    let period = self
      .heartbeat_timeout()
      .map(|timeout| timeout / 2)
      .unwrap_or(Duration::from_secs(60));
    let mut sweep = tokio::time::interval(period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          debug!(engine = %self.name, "Engine cancelled");
          break;
        }

        message = self.rx.recv() => match message {
          Some(EngineMessage::Shutdown) | None => break,
          Some(message) => self.handle_message(message),
        },

        _ = sweep.tick() => self.sweep(),
      }

      self.publish_stats();
    }

    self.stop();
  }

  fn handle_message(&mut self, message: EngineMessage) {
    match message {
      EngineMessage::Enqueue(job) => self.enqueue(job),
      EngineMessage::WorkerAttached { session, outbound } => {
        debug!(engine = %self.name, session, "Worker attached");
        self.workers.insert(session, Worker::new(session, outbound));
        self.pump();
      }
      EngineMessage::WorkerCommand { session, command } => self.handle_worker_command(session, command),
      EngineMessage::WorkerDetached { session } => {
        if let Some(worker) = self.workers.remove(&session) {
          debug!(engine = %self.name, session, "Worker detached");
          self.abort_running(worker, codes::WORKER_LOST, "worker disconnected");
        }
      }
      // Handled by the run loop.
      EngineMessage::Shutdown => {}
    }
  }

  fn enqueue(&mut self, job: JobRequest) {
    trace!(engine = %self.name, ticket = %job.ticket, method = %job.method, "Job enqueued");
    self.queue.push_back(job);
    self.pump();

    if self.queue.len() > self.config.queue_limit
      && let Some(job) = self.queue.pop_back()
    {
      warn!(engine = %self.name, ticket = %job.ticket, limit = self.config.queue_limit, "Queue full, rejecting job");
      self.report(job.ticket, Outcome::aborted(codes::QUEUE_FULL, "the queue is full"));
      return;
    }

    if !self.queue.is_empty() {
      self.supervisor.spawn(&self.name, &self.endpoints);
    }
  }

  /// Hand queued jobs to idle workers, oldest job first.
  fn pump(&mut self) {
    while !self.queue.is_empty() {
      let Some(session) = self.workers.values().find(|w| w.is_idle()).map(Worker::session) else {
        break;
      };
      let Some(job) = self.queue.pop_front() else {
        break;
      };
      let Some(worker) = self.workers.get_mut(&session) else {
        break;
      };

      let ticket = job.ticket;
      match worker.assign(job) {
        Ok(()) => trace!(engine = %self.name, ticket = %ticket, session, "Job dispatched"),
        Err(job) => {
          debug!(engine = %self.name, session, "Worker session gone, requeueing job");
          self.workers.remove(&session);
          self.queue.push_front(job);
        }
      }
    }
  }

  fn handle_worker_command(&mut self, session: SessionId, command: RpcCommand) {
    let Some(worker) = self.workers.get_mut(&session) else {
      trace!(engine = %self.name, session, kind = %command.kind(), "Command from unknown worker");
      return;
    };

    worker.touch();

    match command {
      RpcCommand::Heartbeat => {
        worker.send(RpcCommand::Heartbeat);
      }
      RpcCommand::Chunk { payload } => {
        if !worker.push_chunk(&payload) {
          warn!(engine = %self.name, session, "Chunk from an idle worker");
        }
      }
      RpcCommand::Choke => {
        if let Some((ticket, body)) = worker.finish() {
          self.report(ticket, Outcome::Completed(body));
          self.pump();
        }
      }
      RpcCommand::Error { code, message } => {
        if let Some((ticket, _)) = worker.finish() {
          self.report(ticket, Outcome::Aborted { code, message });
          self.pump();
        } else {
          warn!(engine = %self.name, session, code, message = %message, "Error from an idle worker");
        }
      }
      RpcCommand::Terminate => {
        if let Some(worker) = self.workers.remove(&session) {
          info!(engine = %self.name, session, "Worker is leaving");
          self.abort_running(worker, codes::WORKER_LOST, "worker terminated");
        }
      }
      RpcCommand::Invoke { event, .. } => {
        warn!(engine = %self.name, session, event = %event, "Unexpected invoke from worker");
      }
    }
  }

  /// Drop workers that went silent.
  fn sweep(&mut self) {
    let Some(timeout) = self.heartbeat_timeout() else {
      return;
    };

    let now = Instant::now();
    let expired: Vec<SessionId> = self
      .workers
      .values()
      .filter(|w| w.is_expired(now, timeout))
      .map(Worker::session)
      .collect();

    for session in expired {
      if let Some(worker) = self.workers.remove(&session) {
        warn!(engine = %self.name, session, "Worker missed its heartbeat, dropping");
        worker.send(RpcCommand::Terminate);
        self.abort_running(worker, codes::HEARTBEAT_TIMEOUT, "worker missed its heartbeat");
      }
    }
  }

  fn abort_running(&mut self, mut worker: Worker, code: i32, message: &str) {
    if let Some((ticket, _)) = worker.finish() {
      self.report(ticket, Outcome::aborted(code, message));
    }
  }

  fn report(&self, ticket: Ticket, outcome: Outcome) {
    let outcome = JobOutcome {
      engine: self.name.clone(),
      ticket,
      outcome,
    };
    if self.outcomes.send(outcome).is_err() {
      debug!(engine = %self.name, ticket = %ticket, "Core gone, dropping job outcome");
    }
  }

  fn publish_stats(&self) {
    let busy = self.workers.values().filter(|w| !w.is_idle()).count();
    self.stats.store(self.queue.len(), busy, self.workers.len());
  }

  /// Abort everything, ask workers to leave and stop listening.
  fn stop(&mut self) {
    let queued = self.queue.len();
    for job in std::mem::take(&mut self.queue) {
      self.report(job.ticket, Outcome::aborted(codes::ENGINE_STOPPED, "the engine is shutting down"));
    }

    let workers = std::mem::take(&mut self.workers);
    let count = workers.len();
    for (_, worker) in workers {
      worker.send(RpcCommand::Terminate);
      self.abort_running(worker, codes::ENGINE_STOPPED, "the engine is shutting down");
    }

    self.supervisor.terminate(&self.name);

    if self.actor.is_active()
      && let Err(e) = self.actor.terminate()
    {
      warn!(engine = %self.name, error = %e, "Unable to stop listening");
    }

    self.publish_stats();
    info!(engine = %self.name, aborted = queued, workers = count, "Engine stopped");
  }
}

#[cfg(test)]
mod tests {
  use bytes::Bytes;
  use tokio::net::TcpStream;
  use uuid::Uuid;

  use super::*;
  use crate::{io::ExecutionUnit, rpc::Channel};

  fn context() -> (EngineContext, mpsc::UnboundedReceiver<JobOutcome>) {
    let (outcomes, rx) = mpsc::unbounded_channel();
    let context = EngineContext {
      network: NetworkConfig {
        endpoint: "127.0.0.1".to_string(),
        ..NetworkConfig::default()
      },
      mapper: Arc::new(PortMapper::ephemeral()),
      unit: Arc::new(ExecutionUnit::current()),
      supervisor: Arc::new(ExternalSupervisor),
      outcomes,
      cancel: CancellationToken::new(),
    };
    (context, rx)
  }

  fn job(method: &str) -> JobRequest {
    JobRequest {
      ticket: Uuid::new_v4(),
      method: method.to_string(),
      payload: Bytes::from_static(b"{}"),
    }
  }

  async fn worker(handle: &EngineHandle) -> Channel<TcpStream> {
    let stream = TcpStream::connect(handle.endpoints()[0]).await.unwrap();
    Channel::new(stream)
  }

  async fn next_invoke(channel: &mut Channel<TcpStream>) -> String {
    loop {
      match channel.recv_command().await.unwrap() {
        RpcCommand::Invoke { event, .. } => return event,
        RpcCommand::Heartbeat => continue,
        other => panic!("Expected invoke, got {other:?}"),
      }
    }
  }

  #[tokio::test]
  async fn test_job_completes_with_concatenated_chunks() {
    let (context, mut outcomes) = context();
    let handle = Engine::spawn("echo", EngineConfig::default(), &context).unwrap();

    let mut channel = worker(&handle).await;
    let request = job("run");
    let ticket = request.ticket;
    handle.enqueue(request).unwrap();

    assert_eq!(next_invoke(&mut channel).await, "run");
    channel.send_command(&RpcCommand::chunk(&b"{\"a\":"[..])).await;
    channel.send_command(&RpcCommand::chunk(&b"1}"[..])).await;
    channel.send_command(&RpcCommand::Choke).await;

    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.engine, "echo");
    assert_eq!(outcome.ticket, ticket);
    assert_eq!(outcome.outcome, Outcome::Completed(Bytes::from_static(b"{\"a\":1}")));

    handle.shutdown();
  }

  #[tokio::test]
  async fn test_worker_error_aborts_job() {
    let (context, mut outcomes) = context();
    let handle = Engine::spawn("echo", EngineConfig::default(), &context).unwrap();

    let mut channel = worker(&handle).await;
    handle.enqueue(job("fail")).unwrap();

    assert_eq!(next_invoke(&mut channel).await, "fail");
    channel.send_command(&RpcCommand::error(42, "boom")).await;
    channel.send_command(&RpcCommand::Choke).await;

    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.outcome, Outcome::aborted(42, "boom"));

    handle.shutdown();
  }

  #[tokio::test]
  async fn test_queue_limit_rejects_overflow() {
    let (context, mut outcomes) = context();
    let config = EngineConfig {
      queue_limit: 1,
      ..EngineConfig::default()
    };
    let handle = Engine::spawn("busy", config, &context).unwrap();

    handle.enqueue(job("first")).unwrap();
    let second = job("second");
    let rejected = second.ticket;
    handle.enqueue(second).unwrap();

    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.ticket, rejected);
    assert!(matches!(outcome.outcome, Outcome::Aborted { code: codes::QUEUE_FULL, .. }));

    handle.shutdown();
  }

  #[tokio::test]
  async fn test_disconnect_aborts_running_job() {
    let (context, mut outcomes) = context();
    let handle = Engine::spawn("echo", EngineConfig::default(), &context).unwrap();

    let mut channel = worker(&handle).await;
    handle.enqueue(job("run")).unwrap();
    assert_eq!(next_invoke(&mut channel).await, "run");
    drop(channel);

    let outcome = outcomes.recv().await.unwrap();
    assert!(matches!(outcome.outcome, Outcome::Aborted { code: codes::WORKER_LOST, .. }));

    handle.shutdown();
  }

  #[tokio::test]
  async fn test_shutdown_aborts_queue_and_terminates_workers() {
    let (context, mut outcomes) = context();
    let handle = Engine::spawn("echo", EngineConfig::default(), &context).unwrap();

    let mut channel = worker(&handle).await;
    handle.enqueue(job("running")).unwrap();
    assert_eq!(next_invoke(&mut channel).await, "running");
    handle.enqueue(job("queued")).unwrap();

    handle.shutdown();

    for _ in 0..2 {
      let outcome = outcomes.recv().await.unwrap();
      assert!(matches!(outcome.outcome, Outcome::Aborted { code: codes::ENGINE_STOPPED, .. }));
    }

    assert_eq!(channel.recv_command().await.unwrap(), RpcCommand::Terminate);
  }

  #[tokio::test]
  async fn test_heartbeat_is_answered() {
    let (context, _outcomes) = context();
    let handle = Engine::spawn("echo", EngineConfig::default(), &context).unwrap();

    let mut channel = worker(&handle).await;
    channel.send_command(&RpcCommand::Heartbeat).await;
    assert_eq!(channel.recv_command().await.unwrap(), RpcCommand::Heartbeat);

    handle.shutdown();
  }

  #[tokio::test]
  async fn test_silent_worker_is_dropped() {
    let (context, mut outcomes) = context();
    let config = EngineConfig {
      heartbeat_timeout_secs: 1,
      ..EngineConfig::default()
    };
    let handle = Engine::spawn("echo", config, &context).unwrap();

    let mut channel = worker(&handle).await;
    handle.enqueue(job("slow")).unwrap();
    assert_eq!(next_invoke(&mut channel).await, "slow");

    let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
      .await
      .unwrap()
      .unwrap();
    assert!(matches!(outcome.outcome, Outcome::Aborted { code: codes::HEARTBEAT_TIMEOUT, .. }));
    assert_eq!(channel.recv_command().await.unwrap(), RpcCommand::Terminate);

    handle.shutdown();
  }
}
