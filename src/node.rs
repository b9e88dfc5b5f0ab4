//! # Stream Nodes
//!
//! The dataflow graph vertex. A node is one stage of a pipeline — producer,
//! filter, or consumer — and owns its destination list, its current callback,
//! its opaque per-stage state, and its lifecycle flag.
//!
//! ## Concurrency by partitioning
//!
//! Once a node is assigned to a worker it stays there for life, so every
//! callback against one node runs in strict FIFO order on one thread. The
//! interior mutex below exists to make that partitioning expressible in safe
//! Rust; on the scheduling fast path it is uncontended. Helpers like
//! [`Node::with_state`] hold the lock for the duration of the closure, so
//! stage code must not call back into the engine against the *same* node from
//! inside one (collect first, emit after).

use crate::engine::Engine;
use crate::error::StageError;
use crate::value::Value;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

/// Result of one stage callback step.
pub type StepResult = Result<(), StageError>;

/// A stage callback: invoked with the engine, the target node, and the
/// payload value; returns success or a stage error that lands in the node's
/// error slot.
pub type StepFn = Arc<dyn Fn(&Engine, &Arc<Node>, Value) -> StepResult + Send + Sync>;

/// What role a node plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  /// Generates values; may never be a connection target.
  Producer,
  /// Receives values and may emit transformed ones.
  Filter,
  /// Receives values; has no emit targets by convention.
  Consumer,
}

/// One unit of work on a worker queue.
///
/// `Step` is the ordinary scheduled-callback triple. `Close` and
/// `PipelineFinish` are the engine's own lifecycle units: close propagation
/// is scheduled rather than recursive so it stays ordered behind data already
/// emitted, and the pipeline-finish unit is exempt from the closed-node drop
/// check so a producer's own close cannot swallow its counter decrement.
pub(crate) enum Task {
  /// Run `func(engine, node, value)` unless the node has closed meanwhile.
  Step {
    node: Arc<Node>,
    func: StepFn,
    value: Value,
  },
  /// Close the target node (idempotent).
  Close { node: Arc<Node> },
  /// Decrement the live-pipeline counter; always runs.
  PipelineFinish,
  /// Stop the worker thread.
  Shutdown,
}

pub(crate) struct NodeInner {
  /// Permanent worker assignment; `None` until first scheduled.
  pub affinity: Option<usize>,
  /// Downstream nodes, in connection order. Closed entries are skipped at
  /// emit time, not removed.
  pub dests: Vec<Arc<Node>>,
  /// The callback that runs the next time this node is scheduled.
  pub callback: Option<StepFn>,
  /// Run synchronously when the node closes, before close propagation.
  pub finalizer: Option<StepFn>,
  /// Opaque per-stage state, private to the stage's callbacks.
  pub state: Option<Box<dyn Any + Send>>,
  /// Set when close begins; guards against double-finalize.
  pub closing: bool,
  /// Terminal: pending and future scheduled callbacks are dropped.
  pub closed: bool,
  /// Producer only: first outgoing edge has been connected.
  pub started: bool,
  /// Registration failed with NotPollable; watch requests reschedule
  /// immediately instead of waiting for readiness.
  pub nowait: bool,
  /// Token of the outstanding readiness watch, if any.
  pub watch_token: Option<usize>,
  /// Last stage failure; cleared on the next successful step.
  pub error: Option<StageError>,
}

/// A stage in the dataflow graph.
pub struct Node {
  name: String,
  mode: Mode,
  pub(crate) inner: Mutex<NodeInner>,
}

impl Node {
  fn new(name: &str, mode: Mode, callback: StepFn) -> Arc<Self> {
    Arc::new(Self {
      name: name.to_string(),
      mode,
      inner: Mutex::new(NodeInner {
        affinity: None,
        dests: Vec::new(),
        callback: Some(callback),
        finalizer: None,
        state: None,
        closing: false,
        closed: false,
        started: false,
        nowait: false,
        watch_token: None,
        error: None,
      }),
    })
  }

  /// Creates a producer node. `start` runs when the producer's first edge is
  /// connected, and again whenever the node reschedules itself.
  pub fn producer(name: &str, start: StepFn) -> Arc<Self> {
    Self::new(name, Mode::Producer, start)
  }

  /// Creates a filter node; `callback` runs once per value emitted to it.
  pub fn filter(name: &str, callback: StepFn) -> Arc<Self> {
    Self::new(name, Mode::Filter, callback)
  }

  /// Creates a consumer node; `callback` runs once per value emitted to it.
  pub fn consumer(name: &str, callback: StepFn) -> Arc<Self> {
    Self::new(name, Mode::Consumer, callback)
  }

  /// The node's human-readable name, used in logs and error reports.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// The node's role in the graph.
  pub fn mode(&self) -> Mode {
    self.mode
  }

  /// True once the node has closed (terminal).
  pub fn is_closed(&self) -> bool {
    self.inner.lock().closed
  }

  pub(crate) fn is_closing(&self) -> bool {
    let inner = self.inner.lock();
    inner.closing || inner.closed
  }

  /// The worker this node is pinned to, once assigned.
  pub fn affinity(&self) -> Option<usize> {
    self.inner.lock().affinity
  }

  /// Installs the per-stage state value, replacing any previous state.
  pub fn set_state(&self, state: impl Any + Send) {
    self.inner.lock().state = Some(Box::new(state));
  }

  /// Runs `f` against the per-stage state, if present and of type `T`.
  ///
  /// Holds the node's lock for the duration of `f`; do not call engine
  /// operations against this same node from inside.
  pub fn with_state<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
    let mut inner = self.inner.lock();
    inner
      .state
      .as_mut()
      .and_then(|state| state.downcast_mut::<T>())
      .map(f)
  }

  /// Replaces the callback that runs the next time this node is scheduled.
  /// Stage callbacks use this to advance their private state machine.
  pub fn set_callback(&self, callback: StepFn) {
    self.inner.lock().callback = Some(callback);
  }

  /// Installs a finalizer that runs synchronously when the node closes,
  /// before close propagation. A reduce-style stage emits its result here.
  pub fn set_finalizer(&self, finalizer: StepFn) {
    self.inner.lock().finalizer = Some(finalizer);
  }

  /// The last stage failure recorded against this node, if any.
  pub fn last_error(&self) -> Option<StageError> {
    self.inner.lock().error.clone()
  }

  /// Takes the last stage failure, clearing the slot. An embedding layer
  /// that treats the failure as fatal promotes it to
  /// [`EngineError::Runtime`](crate::error::EngineError) via `From`.
  pub fn take_error(&self) -> Option<StageError> {
    self.inner.lock().error.take()
  }

  pub(crate) fn record_error(&self, error: StageError) {
    self.inner.lock().error = Some(error);
  }

  pub(crate) fn clear_error(&self) {
    self.inner.lock().error = None;
  }

  pub(crate) fn current_callback(&self) -> Option<StepFn> {
    self.inner.lock().callback.clone()
  }
}

impl std::fmt::Debug for Node {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Node")
      .field("name", &self.name)
      .field("mode", &self.mode)
      .finish_non_exhaustive()
  }
}
