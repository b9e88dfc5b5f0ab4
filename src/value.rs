//! # Tagged Payload Values
//!
//! The value type flowing through the dataflow graph: a tagged union of nil,
//! booleans, integers, floats, strings, arrays, and opaque stage-private
//! payloads.
//!
//! ## The nil sentinel
//!
//! `Value::Nil` is a distinguished "no data" sentinel: emitting nil schedules
//! nothing downstream. This is a deliberate contract, not an artifact — it
//! lets a stage emit conditionally without branching at every call site, and
//! the latch close protocol uses nil as its end-of-stream signal. See
//! [`Engine::emit`](crate::engine::Engine::emit).
//!
//! ## String interning
//!
//! Strings at or below [`INTERN_MAX_LEN`] bytes are interned into a global
//! table under a lock, so pointer equality substitutes for content equality
//! once interned. Longer strings are allocated per value. [`Value::string`]
//! is the interning constructor; `PartialEq` takes the pointer fast path
//! before falling back to content comparison.
//!
//! ## Arrays
//!
//! Arrays are fixed-length once built, optionally carrying a parallel header
//! row (named-field / table-row semantics) and a namespace tag.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Strings at or below this byte length are interned.
pub const INTERN_MAX_LEN: usize = 32;

static INTERN_TABLE: OnceLock<Mutex<HashSet<Arc<str>>>> = OnceLock::new();

fn intern(s: &str) -> Arc<str> {
  let table = INTERN_TABLE.get_or_init(|| Mutex::new(HashSet::new()));
  let mut table = table.lock();
  if let Some(existing) = table.get(s) {
    return existing.clone();
  }
  let arc: Arc<str> = Arc::from(s);
  table.insert(arc.clone());
  arc
}

/// A fixed-length array value, optionally carrying a header row and a
/// namespace tag (table-row semantics).
#[derive(Debug)]
pub struct ValueArray {
  /// The element values, in order.
  pub values: Box<[Value]>,
  /// Optional parallel header row naming each element.
  pub headers: Option<Box<[Arc<str>]>>,
  /// Optional namespace tag for the row as a whole.
  pub namespace: Option<Arc<str>>,
}

/// The payload flowing through the graph.
#[derive(Clone)]
pub enum Value {
  /// The "no data" sentinel; never scheduled downstream by `emit`.
  Nil,
  /// A boolean.
  Bool(bool),
  /// A signed integer.
  Int(i64),
  /// A double-precision float.
  Float(f64),
  /// A string; short strings are interned (see module docs).
  Str(Arc<str>),
  /// A fixed-length array, optionally with headers and a namespace tag.
  Array(Arc<ValueArray>),
  /// An opaque stage-private payload, compared by identity.
  Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
  /// Builds a string value, interning it when short enough.
  pub fn string(s: impl AsRef<str>) -> Self {
    let s = s.as_ref();
    if s.len() <= INTERN_MAX_LEN {
      Value::Str(intern(s))
    } else {
      Value::Str(Arc::from(s))
    }
  }

  /// Builds a plain array value with no headers or namespace.
  pub fn array(values: Vec<Value>) -> Self {
    Value::Array(Arc::new(ValueArray {
      values: values.into_boxed_slice(),
      headers: None,
      namespace: None,
    }))
  }

  /// Builds a table-row array: values plus a parallel header row and an
  /// optional namespace tag.
  pub fn row(
    values: Vec<Value>,
    headers: Vec<Arc<str>>,
    namespace: Option<Arc<str>>,
  ) -> Self {
    Value::Array(Arc::new(ValueArray {
      values: values.into_boxed_slice(),
      headers: Some(headers.into_boxed_slice()),
      namespace,
    }))
  }

  /// Builds an opaque value compared by identity.
  pub fn opaque(payload: impl Any + Send + Sync) -> Self {
    Value::Opaque(Arc::new(payload))
  }

  /// True for the nil sentinel.
  pub fn is_nil(&self) -> bool {
    matches!(self, Value::Nil)
  }

  /// The integer payload, if this is an integer.
  pub fn as_int(&self) -> Option<i64> {
    match self {
      Value::Int(n) => Some(*n),
      _ => None,
    }
  }

  /// The float payload, if this is a float.
  pub fn as_float(&self) -> Option<f64> {
    match self {
      Value::Float(x) => Some(*x),
      _ => None,
    }
  }

  /// The string payload, if this is a string.
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Str(s) => Some(s),
      _ => None,
    }
  }

  /// The array payload, if this is an array.
  pub fn as_array(&self) -> Option<&ValueArray> {
    match self {
      Value::Array(a) => Some(a),
      _ => None,
    }
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self {
    Value::Bool(b)
  }
}

impl From<i64> for Value {
  fn from(n: i64) -> Self {
    Value::Int(n)
  }
}

impl From<f64> for Value {
  fn from(x: f64) -> Self {
    Value::Float(x)
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::string(s)
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::string(&s)
  }
}

impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Value::Nil, Value::Nil) => true,
      (Value::Bool(a), Value::Bool(b)) => a == b,
      (Value::Int(a), Value::Int(b)) => a == b,
      (Value::Float(a), Value::Float(b)) => a == b,
      (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b) || a == b,
      (Value::Array(a), Value::Array(b)) => {
        Arc::ptr_eq(a, b)
          || (a.values == b.values
            && a.headers == b.headers
            && a.namespace == b.namespace)
      }
      (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(a, b),
      _ => false,
    }
  }
}

impl fmt::Debug for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Nil => write!(f, "Nil"),
      Value::Bool(b) => write!(f, "Bool({})", b),
      Value::Int(n) => write!(f, "Int({})", n),
      Value::Float(x) => write!(f, "Float({})", x),
      Value::Str(s) => write!(f, "Str({:?})", s),
      Value::Array(a) => f.debug_tuple("Array").field(a).finish(),
      Value::Opaque(_) => write!(f, "Opaque(..)"),
    }
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Nil => write!(f, "nil"),
      Value::Bool(b) => write!(f, "{}", b),
      Value::Int(n) => write!(f, "{}", n),
      Value::Float(x) => write!(f, "{}", x),
      Value::Str(s) => write!(f, "{}", s),
      Value::Array(a) => {
        if let Some(ns) = &a.namespace {
          write!(f, "{}", ns)?;
        }
        write!(f, "[")?;
        for (i, v) in a.values.iter().enumerate() {
          if i > 0 {
            write!(f, ", ")?;
          }
          write!(f, "{}", v)?;
        }
        write!(f, "]")
      }
      Value::Opaque(_) => write!(f, "<opaque>"),
    }
  }
}
