//! # Error Test Suite
//!
//! Display formats for stage errors and the conversions onto `EngineError`.

use crate::error::{EngineError, SourceLocation, StageError};
use crate::value::Value;

#[test]
fn stage_error_display_includes_location() {
  let err =
    StageError::new("division by zero").with_location(SourceLocation { line: 3, column: 14 });
  assert_eq!(err.to_string(), "3:14: division by zero");
}

#[test]
fn stage_error_display_includes_payload() {
  let err = StageError::new("bad record").with_payload(Value::from(42i64));
  assert_eq!(err.to_string(), "bad record (value: 42)");
}

#[test]
fn engine_error_wraps_io() {
  let io = std::io::Error::other("epoll_create failed");
  let err = EngineError::from(io);
  assert!(matches!(err, EngineError::Resource(_)));
}

#[test]
fn stage_error_promotes_to_runtime_error() {
  let stage = StageError::new("unknown column").with_location(SourceLocation { line: 7, column: 2 });
  let err = EngineError::from(stage);
  assert!(matches!(err, EngineError::Runtime(_)));
  assert_eq!(err.to_string(), "runtime error: 7:2: unknown column");
}
