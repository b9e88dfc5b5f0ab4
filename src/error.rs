//! # Error Handling
//!
//! Error types for the streamloom engine, split along the boundary the engine
//! actually enforces:
//!
//! - **EngineError**: errors the engine reports synchronously to its caller
//!   (illegal topology, resource failures from the readiness backend, or a
//!   stage failure surfaced through the API).
//! - **StageError**: a failure raised by a stage callback. The engine records
//!   it in the failing node's error slot and moves on; whether the failure
//!   shuts the stream down, is ignored, or becomes emitted data is the
//!   embedding language's decision, not the engine's.
//!
//! The error slot on a node holds the last `StageError` until the next
//! successful step clears it, so a top-level printer can read location and
//! message after the pipeline drains.

use crate::value::Value;
use std::fmt;
use thiserror::Error;

/// Source location attached to a stage failure, in the embedding language's
/// coordinates. The engine never interprets it; it only carries it to the
/// error slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
  /// 1-based line in the originating script.
  pub line: u32,
  /// 1-based column in the originating script.
  pub column: u32,
}

impl fmt::Display for SourceLocation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.line, self.column)
  }
}

/// A failure raised by a stage callback.
///
/// Carries a human-readable message, an optional payload value (the value the
/// stage was processing, or a value the stage chose to attach), and an
/// optional source location.
#[derive(Debug, Clone)]
pub struct StageError {
  /// What went wrong.
  pub message: String,
  /// The value involved in the failure, if the stage attached one.
  pub payload: Option<Value>,
  /// Where in the originating script the failing stage was defined.
  pub location: Option<SourceLocation>,
}

impl StageError {
  /// Creates a stage error from a message alone.
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      payload: None,
      location: None,
    }
  }

  /// Attaches the payload value involved in the failure.
  pub fn with_payload(mut self, payload: Value) -> Self {
    self.payload = Some(payload);
    self
  }

  /// Attaches a source location.
  pub fn with_location(mut self, location: SourceLocation) -> Self {
    self.location = Some(location);
    self
  }
}

impl fmt::Display for StageError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.location {
      Some(loc) => write!(f, "{}: {}", loc, self.message)?,
      None => write!(f, "{}", self.message)?,
    }
    if let Some(payload) = &self.payload {
      write!(f, " (value: {})", payload)?;
    }
    Ok(())
  }
}

impl std::error::Error for StageError {}

impl From<StageError> for EngineError {
  fn from(err: StageError) -> Self {
    EngineError::Runtime(err)
  }
}

/// Errors reported synchronously by the engine's own API surface.
#[derive(Debug, Error)]
pub enum EngineError {
  /// An illegal graph mutation, e.g. connecting into a producer.
  #[error("topology error: {0}")]
  Topology(String),

  /// A stage callback failed; carries the stage's own error report. The
  /// engine itself records stage failures in the node error slot and keeps
  /// going; the embedding layer promotes a slot it decides is fatal into
  /// this variant (via `From`, typically after [`crate::node::Node::take_error`]).
  #[error("runtime error: {0}")]
  Runtime(StageError),

  /// The readiness backend or thread pool could not allocate a resource.
  #[error("resource error: {0}")]
  Resource(#[from] std::io::Error),
}
