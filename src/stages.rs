//! # Stage Constructors
//!
//! Ready-made stages for embedding and tests: an iterator-backed producer, a
//! closure filter/consumer, a fold (reduce) filter, and a collecting
//! consumer. The full operator library of the language (map/filter/reduce/
//! sort/csv/...) lives in the evaluator layer; these are the engine-level
//! building blocks it composes.

use crate::engine::Engine;
use crate::error::StageError;
use crate::node::{Node, StepResult};
use crate::value::Value;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

struct IterState {
  iter: Box<dyn Iterator<Item = Value> + Send>,
}

fn iter_step(engine: &Engine, node: &Arc<Node>, _value: Value) -> StepResult {
  let next = node
    .with_state(|state: &mut IterState| state.iter.next())
    .ok_or_else(|| StageError::new("iterator source state missing"))?;
  match next {
    Some(value) => {
      // One value per scheduled step: the continuation reschedules this
      // node instead of looping, so long streams interleave fairly.
      engine.emit(node, value, Some(Arc::new(iter_step)));
      Ok(())
    }
    None => {
      engine.close(node);
      Ok(())
    }
  }
}

/// Creates a producer emitting each value of `values`, one per scheduled
/// step, then closing itself.
pub fn iter_source<I>(name: &str, values: I) -> Arc<Node>
where
  I: IntoIterator<Item = Value>,
  I::IntoIter: Send + 'static,
{
  let node = Node::producer(name, Arc::new(iter_step));
  node.set_state(IterState {
    iter: Box::new(values.into_iter()),
  });
  node
}

/// Creates a filter node from a closure. The closure decides what (if
/// anything) to emit downstream; emitting nil emits nothing.
pub fn filter_fn<F>(name: &str, f: F) -> Arc<Node>
where
  F: Fn(&Engine, &Arc<Node>, Value) -> StepResult + Send + Sync + 'static,
{
  Node::filter(name, Arc::new(f))
}

/// Creates a consumer node from a closure.
pub fn consumer_fn<F>(name: &str, f: F) -> Arc<Node>
where
  F: Fn(&Engine, &Arc<Node>, Value) -> StepResult + Send + Sync + 'static,
{
  Node::consumer(name, Arc::new(f))
}

/// Creates a reduce-style filter: `step` folds each incoming value into the
/// accumulator, and `finish` turns the accumulator into the single value
/// emitted downstream when the stage closes.
pub fn fold_filter<S, F, G>(name: &str, init: S, step: F, finish: G) -> Arc<Node>
where
  S: Any + Send,
  F: Fn(&mut S, &Value) + Send + Sync + 'static,
  G: Fn(&mut S) -> Value + Send + Sync + 'static,
{
  let node = Node::filter(
    name,
    Arc::new(move |_engine: &Engine, node: &Arc<Node>, value: Value| {
      node
        .with_state(|state: &mut S| step(state, &value))
        .ok_or_else(|| StageError::new("fold state missing"))
    }),
  );
  node.set_state(init);
  node.set_finalizer(Arc::new(
    move |engine: &Engine, node: &Arc<Node>, _value: Value| {
      let result = node
        .with_state(|state: &mut S| finish(state))
        .ok_or_else(|| StageError::new("fold state missing"))?;
      engine.emit(node, result, None);
      Ok(())
    },
  ));
  node
}

/// Creates a consumer that appends every received value to a shared vector.
/// Returns the node and the vector handle.
pub fn collector(name: &str) -> (Arc<Node>, Arc<Mutex<Vec<Value>>>) {
  let sink = Arc::new(Mutex::new(Vec::new()));
  let captured = sink.clone();
  let node = Node::consumer(
    name,
    Arc::new(move |_engine: &Engine, _node: &Arc<Node>, value: Value| {
      captured.lock().push(value);
      Ok(())
    }),
  );
  (node, sink)
}
