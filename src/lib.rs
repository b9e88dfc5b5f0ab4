//! # streamloom
//!
//! The execution engine of a small dataflow/streaming language: a graph of
//! connected stream stages (producers, filters, consumers) turned into
//! scheduled units of work executed across a pool of pinned worker threads,
//! with a dedicated bridge thread translating OS readiness notifications into
//! scheduled callbacks.
//!
//! ## Key pieces
//!
//! - **Pinned workers**: every node is permanently assigned to one worker,
//!   so its callbacks run in strict FIFO order on one thread and its private
//!   state needs no cross-worker coordination.
//! - **Continuation-passing production**: a producer keeps running by
//!   rescheduling itself one step at a time through `emit`, never by
//!   recursing — stack depth stays O(1) no matter how long the stream.
//! - **Readiness bridge**: blocking I/O never happens on a worker; stages
//!   register one-shot interest and resume when the bridge delivers their
//!   callback. Non-pollable descriptors degrade to immediate rescheduling.
//! - **Latches**: a lock-free rendezvous between independently-scheduled
//!   streams, powering the `zip` and `concat` combinators.
//! - **Drain protocol**: the driver returns only when the live-pipeline
//!   counter is zero, every worker queue is quiet, and no readiness watches
//!   are outstanding.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use streamloom::{stages, Engine, Value};
//!
//! let engine = Engine::default();
//! let numbers = stages::iter_source("numbers", (1..=10).map(Value::from));
//! let (sink, seen) = stages::collector("sink");
//! engine.connect(&numbers, &sink)?;
//! engine.run()?;
//! assert_eq!(seen.lock().len(), 10);
//! engine.shutdown();
//! # Ok::<(), streamloom::EngineError>(())
//! ```
//!
//! The language front end (lexer, parser, evaluator) and the stream operator
//! library are separate layers; they drive this crate exclusively through
//! `connect`, `emit`, `close`, `watch`, and `run`.

/// Engine context: connect/emit/close, worker pool, affinity, driver.
pub mod engine;
/// Error taxonomy: topology, runtime (stage), and resource errors.
pub mod error;
/// Latch/channel rendezvous and the zip/concat combinators.
pub mod latch;
/// Line-oriented descriptor source.
pub mod lines;
/// Stream nodes, modes, callbacks, and scheduled tasks.
pub mod node;
/// Readiness backend abstraction and the I/O bridge thread.
pub mod reactor;
/// Lock-free Michael–Scott rendezvous queue.
pub mod rendezvous;
/// Ready-made stage constructors.
pub mod stages;
/// Tagged payload values and string interning.
pub mod value;

mod queue;

pub use engine::{Engine, EngineConfig, WORKERS_ENV};
pub use error::{EngineError, SourceLocation, StageError};
pub use latch::{latch_node, Latch};
pub use node::{Mode, Node, StepFn, StepResult};
pub use reactor::WatchInterest;
pub use value::{Value, ValueArray, INTERN_MAX_LEN};

#[cfg(test)]
mod engine_test;
#[cfg(test)]
mod error_test;
#[cfg(test)]
mod lines_test;
#[cfg(test)]
mod queue_test;
#[cfg(test)]
mod rendezvous_test;
