//! # Latch / Channel and Multi-Stream Combinators
//!
//! A latch is a consumer-mode node wrapping a rendezvous structure of two
//! lock-free queues: buffered values not yet claimed, and pending receivers
//! not yet satisfied. A push either satisfies a waiting receiver or buffers;
//! a receive either consumes a buffered value or registers as a waiter. The
//! pairing decision itself is serialized by a mutex held only for the queue
//! operations — never across scheduling — which keeps the invariant exact: at
//! most one of the two queues is non-empty at any instant, so a value and a
//! waiter can never be stranded together.
//!
//! Closing a latch drains every pending receiver with a nil value, the
//! latch's end-of-stream signal (values themselves are never nil: `emit`
//! suppresses nil before it can reach a latch).
//!
//! The combinators built on latches pull one value at a time from several
//! independently-scheduled producers:
//!
//! - [`Engine::zip`] assembles one tuple per round, pulling latch 0, then
//!   latch 1, …; the first latch to report end-of-stream ends the zip, so the
//!   output is bounded by the shortest input.
//! - [`Engine::concat`] drains latch *i* to exhaustion before moving to latch
//!   *i + 1*, emitting every value unmodified in source order.

use crate::engine::Engine;
use crate::error::{EngineError, StageError};
use crate::node::{Node, StepFn, StepResult};
use crate::rendezvous::RendezvousQueue;
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Waiter {
  node: Arc<Node>,
  cont: StepFn,
}

/// The rendezvous structure pairing buffered values with pending receivers.
pub struct Latch {
  buffer: RendezvousQueue<Value>,
  waiters: RendezvousQueue<Waiter>,
  closed: AtomicBool,
  /// Serializes the pair-or-enqueue decision between the two queues. Held
  /// only for the queue operations; scheduling happens after release, so no
  /// lock is ever held across an engine call.
  pairing: Mutex<()>,
}

impl Latch {
  fn new() -> Self {
    Self {
      buffer: RendezvousQueue::new(),
      waiters: RendezvousQueue::new(),
      closed: AtomicBool::new(false),
      pairing: Mutex::new(()),
    }
  }

  /// Delivers `value` to a pending receiver, or buffers it. Nil values are
  /// ignored (nil is reserved as the end-of-stream signal).
  pub fn push(&self, engine: &Engine, value: Value) {
    if value.is_nil() {
      return;
    }
    let delivery = {
      let _pairing = self.pairing.lock();
      match self.waiters.pop() {
        Some(waiter) => Some((waiter, value)),
        None => {
          self.buffer.push(value);
          None
        }
      }
    };
    if let Some((waiter, value)) = delivery {
      engine.schedule(&waiter.node, waiter.cont, value, None);
    }
  }

  /// Delivers a buffered value to `cont` on the requester's worker, or
  /// registers `(requester, cont)` as a pending receiver. A receive against
  /// a closed, drained latch is satisfied immediately with nil.
  pub fn receive(&self, engine: &Engine, requester: &Arc<Node>, cont: StepFn) {
    let value = {
      let _pairing = self.pairing.lock();
      match self.buffer.pop() {
        Some(value) => value,
        None if self.closed.load(Ordering::Acquire) => Value::Nil,
        None => {
          self.waiters.push(Waiter {
            node: requester.clone(),
            cont,
          });
          return;
        }
      }
    };
    engine.schedule(requester, cont, value, None);
  }

  /// Marks the latch finished and drains every pending receiver with nil.
  /// Buffered values remain receivable (concat relies on draining a closed
  /// latch to exhaustion).
  pub fn close(&self, engine: &Engine) {
    let stranded = {
      let _pairing = self.pairing.lock();
      self.closed.store(true, Ordering::Release);
      let mut waiters = Vec::new();
      while let Some(waiter) = self.waiters.pop() {
        waiters.push(waiter);
      }
      waiters
    };
    for waiter in stranded {
      engine.schedule(&waiter.node, waiter.cont, Value::Nil, None);
    }
  }
}

/// Creates a consumer-mode node wrapping a fresh latch. Values emitted to
/// the node are pushed into the latch; the node's close drains it.
pub fn latch_node(name: &str) -> (Arc<Node>, Arc<Latch>) {
  let latch = Arc::new(Latch::new());
  let node = Node::consumer(name, Arc::new(latch_push_step));
  node.set_state(latch.clone());
  node.set_finalizer(Arc::new(latch_close_step));
  (node, latch)
}

fn latch_of(node: &Arc<Node>) -> Result<Arc<Latch>, StageError> {
  node
    .with_state(|latch: &mut Arc<Latch>| latch.clone())
    .ok_or_else(|| StageError::new("latch state missing"))
}

fn latch_push_step(engine: &Engine, node: &Arc<Node>, value: Value) -> StepResult {
  latch_of(node)?.push(engine, value);
  Ok(())
}

fn latch_close_step(engine: &Engine, node: &Arc<Node>, _value: Value) -> StepResult {
  latch_of(node)?.close(engine);
  Ok(())
}

struct FanIn {
  latches: Vec<(Arc<Node>, Arc<Latch>)>,
  /// zip: values collected for the tuple in progress.
  partial: Vec<Value>,
  /// concat: the input currently being drained.
  index: usize,
}

impl Engine {
  /// Zips `inputs` into a stream of tuples (arrays), one element per input
  /// per round, bounded by the shortest input. When any input ends before a
  /// tuple completes, the coordinator closes all latches and itself.
  ///
  /// The returned node is a producer; connect it to a destination to start
  /// it.
  pub fn zip(&self, name: &str, inputs: &[Arc<Node>]) -> Result<Arc<Node>, EngineError> {
    let coordinator = Node::producer(name, Arc::new(zip_start));
    coordinator.set_state(self.fan_in(name, inputs)?);
    Ok(coordinator)
  }

  /// Concatenates `inputs`: every value of input 0 in order, then input 1,
  /// and so on, unmodified.
  ///
  /// The returned node is a producer; connect it to a destination to start
  /// it.
  pub fn concat(&self, name: &str, inputs: &[Arc<Node>]) -> Result<Arc<Node>, EngineError> {
    let coordinator = Node::producer(name, Arc::new(concat_start));
    coordinator.set_state(self.fan_in(name, inputs)?);
    Ok(coordinator)
  }

  fn fan_in(&self, name: &str, inputs: &[Arc<Node>]) -> Result<FanIn, EngineError> {
    if inputs.is_empty() {
      return Err(EngineError::Topology(format!(
        "combinator '{name}' needs at least one input"
      )));
    }
    let mut latches = Vec::with_capacity(inputs.len());
    for (i, input) in inputs.iter().enumerate() {
      let (node, latch) = latch_node(&format!("{name}.latch{i}"));
      self.connect(input, &node)?;
      latches.push((node, latch));
    }
    Ok(FanIn {
      latches,
      partial: Vec::new(),
      index: 0,
    })
  }
}

fn fan_in_latch(node: &Arc<Node>, index: usize) -> Result<Arc<Latch>, StageError> {
  node
    .with_state(|state: &mut FanIn| state.latches[index].1.clone())
    .ok_or_else(|| StageError::new("combinator state missing"))
}

/// Closes every latch node and the coordinator itself. The latch nodes live
/// on their own pinned workers, so their close is scheduled there rather than
/// run inline from the coordinator's worker; the coordinator closes itself
/// directly (this callback already runs on its pinned worker).
fn fan_in_finish(engine: &Engine, node: &Arc<Node>) -> StepResult {
  let latch_nodes = node
    .with_state(|state: &mut FanIn| {
      state
        .latches
        .iter()
        .map(|(node, _)| node.clone())
        .collect::<Vec<_>>()
    })
    .ok_or_else(|| StageError::new("combinator state missing"))?;
  for latch_node in latch_nodes {
    engine.schedule_close(&latch_node);
  }
  engine.close(node);
  Ok(())
}

fn zip_start(engine: &Engine, node: &Arc<Node>, _value: Value) -> StepResult {
  fan_in_latch(node, 0)?.receive(engine, node, Arc::new(zip_on_value));
  Ok(())
}

fn zip_on_value(engine: &Engine, node: &Arc<Node>, value: Value) -> StepResult {
  if value.is_nil() {
    return fan_in_finish(engine, node);
  }
  let (next_latch, tuple) = node
    .with_state(|state: &mut FanIn| {
      state.partial.push(value);
      if state.partial.len() == state.latches.len() {
        let tuple = std::mem::take(&mut state.partial);
        (state.latches[0].1.clone(), Some(tuple))
      } else {
        (state.latches[state.partial.len()].1.clone(), None)
      }
    })
    .ok_or_else(|| StageError::new("combinator state missing"))?;
  if let Some(tuple) = tuple {
    engine.emit(node, Value::array(tuple), None);
  }
  next_latch.receive(engine, node, Arc::new(zip_on_value));
  Ok(())
}

fn concat_start(engine: &Engine, node: &Arc<Node>, _value: Value) -> StepResult {
  fan_in_latch(node, 0)?.receive(engine, node, Arc::new(concat_on_value));
  Ok(())
}

fn concat_on_value(engine: &Engine, node: &Arc<Node>, value: Value) -> StepResult {
  if value.is_nil() {
    // Current input exhausted; move on or finish.
    let next = node
      .with_state(|state: &mut FanIn| {
        state.index += 1;
        if state.index < state.latches.len() {
          Some(state.latches[state.index].1.clone())
        } else {
          None
        }
      })
      .ok_or_else(|| StageError::new("combinator state missing"))?;
    match next {
      Some(latch) => latch.receive(engine, node, Arc::new(concat_on_value)),
      None => return fan_in_finish(engine, node),
    }
    return Ok(());
  }
  let latch = node
    .with_state(|state: &mut FanIn| state.latches[state.index].1.clone())
    .ok_or_else(|| StageError::new("combinator state missing"))?;
  engine.emit(node, value, None);
  latch.receive(engine, node, Arc::new(concat_on_value));
  Ok(())
}
