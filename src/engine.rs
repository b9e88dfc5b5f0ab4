//! # Execution Engine
//!
//! The engine context object: graph construction (`connect`), emission
//! (`emit`), the close/teardown protocol, the worker pool, the affinity
//! policy, and the driver (`run`).
//!
//! ## Scheduling model
//!
//! N fixed worker threads (default: logical CPU count, overridable via
//! [`EngineConfig`] or the `STREAMLOOM_WORKERS` environment variable) each
//! drain one private FIFO queue, plus one I/O bridge thread
//! ([`crate::reactor`]), plus the caller's thread acting as driver. A
//! scheduled callback always runs to completion before its worker looks at
//! the queue again; a stage that wants to keep producing reschedules itself
//! through `emit`'s continuation argument instead of recursing, which bounds
//! stack depth and interleaves fairly with other streams on the same workers.
//!
//! ## Pinning
//!
//! A node is assigned to a worker the first time it is scheduled and stays
//! there for life. All callbacks for one node therefore execute in strict
//! FIFO order on one thread, and per-node state needs no cross-worker
//! coordination.
//!
//! ## Shutdown detection
//!
//! A global counter tracks live producer pipelines: incremented when a
//! producer's first edge is connected, decremented by the pipeline-finish
//! unit its close schedules. The driver terminates only on the drain
//! invariant checked in [`Engine::run`] — counter at zero AND every worker
//! queue empty AND no outstanding readiness watches — because the counter
//! reaching zero and the last queued side effects draining are not atomic
//! with each other.

use crate::error::EngineError;
use crate::node::{Mode, Node, StepFn, Task};
use crate::queue::TaskQueue;
use crate::reactor::Reactor;
use crate::value::Value;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

/// Environment variable overriding the worker count. Non-positive or
/// unparsable values fall back to the detected CPU count.
pub const WORKERS_ENV: &str = "STREAMLOOM_WORKERS";

/// Engine construction options.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
  workers: Option<usize>,
}

impl EngineConfig {
  /// Creates the default configuration.
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets an explicit worker count, taking precedence over the environment
  /// override and CPU detection. Zero is ignored.
  pub fn workers(mut self, count: usize) -> Self {
    self.workers = Some(count);
    self
  }

  fn resolve_workers(&self) -> usize {
    if let Some(count) = self.workers {
      if count > 0 {
        return count;
      }
    }
    if let Ok(raw) = std::env::var(WORKERS_ENV) {
      match raw.trim().parse::<i64>() {
        Ok(count) if count > 0 => return count as usize,
        _ => warn!(value = %raw, "ignoring unusable {} override", WORKERS_ENV),
      }
    }
    num_cpus::get().max(1)
  }
}

struct LifecycleState {
  /// Live producer pipelines: started but not yet finished.
  live: usize,
  /// Whether any pipeline was ever started; `run` returns immediately
  /// otherwise.
  ever_started: bool,
}

/// The pipeline counter and its condition variable — the only shared mutable
/// state outside the worker queues themselves.
pub(crate) struct Lifecycle {
  state: Mutex<LifecycleState>,
  drained: Condvar,
}

impl Lifecycle {
  fn new() -> Self {
    Self {
      state: Mutex::new(LifecycleState {
        live: 0,
        ever_started: false,
      }),
      drained: Condvar::new(),
    }
  }

  fn pipeline_started(&self) {
    let mut state = self.state.lock();
    state.live += 1;
    state.ever_started = true;
  }

  pub(crate) fn pipeline_finished(&self) {
    let mut state = self.state.lock();
    state.live = state.live.saturating_sub(1);
    if state.live == 0 {
      self.drained.notify_all();
    }
  }

  fn ever_started(&self) -> bool {
    self.state.lock().ever_started
  }

  /// Worker-side shutdown hint: wake the driver if the counter is zero. The
  /// driver re-checks the full drain invariant under this same lock.
  pub(crate) fn hint_drained(&self) {
    let state = self.state.lock();
    if state.live == 0 {
      self.drained.notify_all();
    }
  }

  fn wait_drained(&self, mut queues_quiet: impl FnMut() -> bool) {
    let mut state = self.state.lock();
    loop {
      if state.live == 0 && queues_quiet() {
        return;
      }
      self.drained.wait(&mut state);
    }
  }
}

pub(crate) struct Pool {
  pub(crate) queues: Vec<Arc<TaskQueue>>,
  handles: Mutex<Vec<JoinHandle<()>>>,
}

pub(crate) struct Core {
  config: EngineConfig,
  init: Mutex<()>,
  pool: OnceLock<Pool>,
  pub(crate) reactor: OnceLock<Reactor>,
  pub(crate) lifecycle: Lifecycle,
}

/// The execution engine: one per process (or per embedding), shared by
/// cloning. All graph construction and scheduling goes through this handle.
#[derive(Clone)]
pub struct Engine {
  pub(crate) core: Arc<Core>,
}

impl Default for Engine {
  fn default() -> Self {
    Self::new(EngineConfig::new())
  }
}

impl Engine {
  /// Creates an engine. Worker threads and the I/O bridge start lazily, on
  /// the first producer connection (or the first `run`/`watch`).
  pub fn new(config: EngineConfig) -> Self {
    Self {
      core: Arc::new(Core {
        config,
        init: Mutex::new(()),
        pool: OnceLock::new(),
        reactor: OnceLock::new(),
        lifecycle: Lifecycle::new(),
      }),
    }
  }

  /// Connects `src`'s output to `dst`.
  ///
  /// Fails with [`EngineError::Topology`] when `dst` is a producer —
  /// producers may never be connection targets — leaving the graph
  /// unchanged. When `src` is a producer and this is its first connection,
  /// the pool is started (lazily, once), the pipeline counter is
  /// incremented, and `src`'s start callback is scheduled immediately.
  pub fn connect(&self, src: &Arc<Node>, dst: &Arc<Node>) -> Result<(), EngineError> {
    if dst.mode() == Mode::Producer {
      return Err(EngineError::Topology(format!(
        "cannot connect '{}' into producer '{}'",
        src.name(),
        dst.name()
      )));
    }
    let starts_pipeline = {
      let mut inner = src.inner.lock();
      inner.dests.push(dst.clone());
      if src.mode() == Mode::Producer && !inner.started {
        inner.started = true;
        true
      } else {
        false
      }
    };
    if starts_pipeline {
      self.ensure_pool()?;
      self.core.lifecycle.pipeline_started();
      debug!(producer = src.name(), "pipeline started");
      if let Some(start) = src.current_callback() {
        self.schedule(src, start, Value::Nil, None);
      }
    }
    Ok(())
  }

  /// Emits `value` from `node` to every live destination, in connection
  /// order.
  ///
  /// Nil is the "no data" sentinel: emitting it schedules nothing
  /// downstream. Destinations that have closed are skipped silently.
  /// Destinations are spread round-robin from the emitter's own worker when
  /// first assigned, so a fan-out chain lands on distinct workers.
  ///
  /// When `continuation` is supplied the emitting node reschedules *itself*
  /// with that callback and a nil payload. This is how a producer keeps
  /// running: each production step is one discrete scheduled unit, not a
  /// recursive call.
  pub fn emit(&self, node: &Arc<Node>, value: Value, continuation: Option<StepFn>) {
    if !value.is_nil() {
      let (dests, base) = {
        let inner = node.inner.lock();
        (inner.dests.clone(), inner.affinity.unwrap_or(0))
      };
      for (i, dest) in dests.iter().enumerate() {
        if dest.is_closing() {
          trace!(from = node.name(), to = dest.name(), "emit to closed destination dropped");
          continue;
        }
        let Some(func) = dest.current_callback() else {
          warn!(to = dest.name(), "destination has no callback; value dropped");
          continue;
        };
        self.schedule(dest, func, value.clone(), Some(base + 1 + i));
      }
    }
    if let Some(cont) = continuation {
      self.schedule(node, cont, Value::Nil, None);
    }
  }

  /// Closes `node`. Idempotent; closing twice is observably the same as
  /// closing once.
  ///
  /// Order matters here: (1) the node's finalizer runs synchronously first,
  /// while the destination list is still intact, so a reduce-style stage can
  /// emit its result; (2) a close unit is scheduled — not recursed — to each
  /// live destination, preserving order relative to data already emitted;
  /// (3) the destination list is discarded; (4) a producer schedules the
  /// pipeline-finish unit that decrements the live counter; (5) the node is
  /// marked closed. Pending and future scheduled callbacks against the node
  /// are dropped at dispatch from the moment close began.
  pub fn close(&self, node: &Arc<Node>) {
    {
      let mut inner = node.inner.lock();
      if inner.closing || inner.closed {
        return;
      }
      inner.closing = true;
    }
    let finalizer = node.inner.lock().finalizer.take();
    if let Some(finalizer) = finalizer {
      if let Err(err) = finalizer(self, node, Value::Nil) {
        error!(node = node.name(), error = %err, "finalizer failed");
        node.record_error(err);
      }
    }
    // Cancel any outstanding readiness watch so the bridge cannot deliver
    // into a closed node and the driver's drain check does not wait on a
    // descriptor that no longer matters.
    let watch_token = node.inner.lock().watch_token.take();
    if let Some(token) = watch_token {
      if let Some(reactor) = self.core.reactor.get() {
        reactor.cancel(self, token);
      }
    }
    let (dests, was_producer) = {
      let mut inner = node.inner.lock();
      let was_producer = node.mode() == Mode::Producer && inner.started;
      (std::mem::take(&mut inner.dests), was_producer)
    };
    for dest in dests {
      self.schedule_close(&dest);
    }
    if was_producer {
      match self.ensure_pool() {
        Ok(pool) => {
          let worker = Self::assign_worker(pool, node, None);
          pool.queues[worker].push(Task::PipelineFinish);
        }
        Err(err) => error!(node = node.name(), error = %err, "close propagation failed"),
      }
    }
    node.inner.lock().closed = true;
    debug!(node = node.name(), "closed");
  }

  /// Runs every started pipeline to completion.
  ///
  /// Returns immediately when no pipeline was ever started. Otherwise blocks
  /// until the drain invariant holds: the live-pipeline counter is zero AND
  /// every worker queue is empty AND no readiness watches are outstanding. A
  /// node's close unit or a late emit can still be in flight after the
  /// counter hits zero, which is why the counter alone is not enough.
  pub fn run(&self) -> Result<(), EngineError> {
    if !self.core.lifecycle.ever_started() {
      return Ok(());
    }
    let pool = self.ensure_pool()?;
    self.core.lifecycle.wait_drained(|| {
      pool.queues.iter().all(|queue| queue.is_quiet()) && self.outstanding_watches() == 0
    });
    Ok(())
  }

  /// Stops the worker pool and the I/O bridge thread and joins them. Any
  /// tasks still queued ahead of the stop units are drained first.
  pub fn shutdown(&self) {
    if let Some(reactor) = self.core.reactor.get() {
      reactor.stop();
    }
    if let Some(pool) = self.core.pool.get() {
      for queue in &pool.queues {
        queue.push(Task::Shutdown);
      }
      let handles = std::mem::take(&mut *pool.handles.lock());
      for handle in handles {
        let _ = handle.join();
      }
    }
    debug!("engine shut down");
  }

  /// Registers one-shot readiness interest in `fd` on behalf of `node`; when
  /// the descriptor becomes ready, `callback` is pushed straight to the
  /// node's pinned worker. See [`crate::reactor`] for the one-shot and
  /// NOWAIT degradation contracts.
  pub fn watch(
    &self,
    node: &Arc<Node>,
    fd: std::os::fd::RawFd,
    interest: crate::reactor::WatchInterest,
    callback: StepFn,
  ) -> Result<(), EngineError> {
    self.ensure_pool()?;
    match self.core.reactor.get() {
      Some(reactor) => reactor.watch(self, node, fd, interest, callback),
      None => Err(EngineError::Topology("reactor not running".into())),
    }
  }

  fn outstanding_watches(&self) -> usize {
    self.core.reactor.get().map_or(0, Reactor::outstanding)
  }

  /// Schedules a close unit on `node`'s pinned worker, so teardown runs
  /// serialized with the node's own callbacks instead of racing them from
  /// another thread. No-op for nodes already closing.
  pub(crate) fn schedule_close(&self, node: &Arc<Node>) {
    if node.is_closing() {
      return;
    }
    match self.ensure_pool() {
      Ok(pool) => {
        let worker = Self::assign_worker(pool, node, None);
        pool.queues[worker].push(Task::Close { node: node.clone() });
      }
      Err(err) => error!(node = node.name(), error = %err, "close scheduling failed"),
    }
  }

  /// Schedules `func(node, value)` on the node's pinned worker, assigning
  /// one first via the affinity policy when unassigned.
  pub(crate) fn schedule(&self, node: &Arc<Node>, func: StepFn, value: Value, hint: Option<usize>) {
    let pool = match self.ensure_pool() {
      Ok(pool) => pool,
      Err(err) => {
        error!(node = node.name(), error = %err, "scheduling failed; task dropped");
        return;
      }
    };
    let worker = Self::assign_worker(pool, node, hint);
    trace!(node = node.name(), worker, "scheduled");
    pool.queues[worker].push(Task::Step {
      node: node.clone(),
      func,
      value,
    });
  }

  /// Affinity policy: an explicit hint wins; otherwise the first worker with
  /// an empty queue; otherwise the worker with the deepest queue, on the
  /// best-effort assumption that the busiest worker is making the most
  /// progress and will free up soonest. Once assigned, the choice is
  /// permanent for the node's lifetime.
  fn assign_worker(pool: &Pool, node: &Arc<Node>, hint: Option<usize>) -> usize {
    let mut inner = node.inner.lock();
    if let Some(worker) = inner.affinity {
      return worker;
    }
    let worker = match hint {
      Some(hint) => hint % pool.queues.len(),
      None => Self::pick_worker(&pool.queues),
    };
    inner.affinity = Some(worker);
    debug!(node = node.name(), worker, "pinned to worker");
    worker
  }

  fn pick_worker(queues: &[Arc<TaskQueue>]) -> usize {
    let mut deepest = 0usize;
    let mut max_depth = 0usize;
    for (i, queue) in queues.iter().enumerate() {
      let depth = queue.len();
      if depth == 0 {
        return i;
      }
      if depth > max_depth {
        max_depth = depth;
        deepest = i;
      }
    }
    deepest
  }

  fn ensure_pool(&self) -> Result<&Pool, EngineError> {
    if let Some(pool) = self.core.pool.get() {
      return Ok(pool);
    }
    let _init = self.core.init.lock();
    if self.core.pool.get().is_none() {
      let workers = self.core.config.resolve_workers();
      debug!(workers, "starting scheduler pool");
      let queues: Vec<Arc<TaskQueue>> =
        (0..workers).map(|_| Arc::new(TaskQueue::new())).collect();
      let mut handles = Vec::with_capacity(workers);
      for (index, queue) in queues.iter().enumerate() {
        let engine = self.clone();
        let queue = queue.clone();
        let handle = thread::Builder::new()
          .name(format!("streamloom-worker-{index}"))
          .spawn(move || worker_loop(engine, queue, index))?;
        handles.push(handle);
      }
      let reactor = Reactor::start(self.clone())?;
      let _ = self.core.reactor.set(reactor);
      let _ = self.core.pool.set(Pool {
        queues,
        handles: Mutex::new(handles),
      });
    }
    match self.core.pool.get() {
      Some(pool) => Ok(pool),
      // Unreachable: the pool was set above under the init lock.
      None => Err(EngineError::Topology("scheduler pool failed to start".into())),
    }
  }
}

fn worker_loop(engine: Engine, queue: Arc<TaskQueue>, index: usize) {
  trace!(worker = index, "worker started");
  loop {
    match queue.pop() {
      Task::Shutdown => {
        queue.mark_idle();
        break;
      }
      Task::Step { node, func, value } => {
        if node.is_closing() {
          trace!(node = node.name(), "dropping step for closing node");
        } else {
          match func(&engine, &node, value) {
            Ok(()) => node.clear_error(),
            Err(err) => {
              error!(worker = index, node = node.name(), error = %err, "stage callback failed");
              node.record_error(err);
            }
          }
        }
      }
      Task::Close { node } => engine.close(&node),
      Task::PipelineFinish => engine.core.lifecycle.pipeline_finished(),
    }
    queue.mark_idle();
    if queue.is_empty() {
      engine.core.lifecycle.hint_drained();
    }
  }
  trace!(worker = index, "worker stopped");
}
