//! # Line-Oriented Descriptor Source
//!
//! A producer stage that reads a descriptor (stdin, a socket, a pipe, or a
//! regular file) and emits one record per delimiter-terminated line.
//!
//! The stage keeps a fixed-size buffer with head/tail cursors. On each
//! readable event it reads once, scans for the delimiter, emits a record per
//! complete line, compacts the leftover to the front of the buffer, and
//! re-arms its readiness watch. On end-of-stream a non-empty leftover is
//! emitted once as a final record and the node closes itself. Records carry
//! the line content without the delimiter byte.
//!
//! Non-pollable descriptors degrade transparently: the watch call marks the
//! node NOWAIT and reschedules immediately, so a regular file is busy-stepped
//! one buffer at a time through the same callback.

use crate::engine::Engine;
use crate::error::StageError;
use crate::node::{Node, StepResult};
use crate::reactor::WatchInterest;
use crate::value::Value;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

/// Read buffer size per line source. A line longer than this is flushed as
/// one oversized record so the stage keeps making progress.
const BUFFER_CAP: usize = 8192;

struct LineState {
  file: File,
  buf: Vec<u8>,
  head: usize,
  tail: usize,
  delimiter: u8,
}

enum Next {
  Rearm,
  Close,
  Fail(StageError),
}

/// Creates a producer emitting newline-separated records read from `fd`.
pub fn fd_source(name: &str, fd: OwnedFd) -> Arc<Node> {
  fd_source_with_delimiter(name, fd, b'\n')
}

/// Creates a producer emitting `delimiter`-separated records read from `fd`.
pub fn fd_source_with_delimiter(name: &str, fd: OwnedFd, delimiter: u8) -> Arc<Node> {
  let node = Node::producer(name, Arc::new(arm));
  node.set_state(LineState {
    file: File::from(fd),
    buf: vec![0u8; BUFFER_CAP],
    head: 0,
    tail: 0,
    delimiter,
  });
  node
}

fn arm(engine: &Engine, node: &Arc<Node>, _value: Value) -> StepResult {
  let fd = node
    .with_state(|state: &mut LineState| state.file.as_raw_fd())
    .ok_or_else(|| StageError::new("line source state missing"))?;
  engine
    .watch(node, fd, WatchInterest::Readable, Arc::new(on_readable))
    .map_err(|err| StageError::new(format!("watch failed: {err}")))
}

fn on_readable(engine: &Engine, node: &Arc<Node>, _value: Value) -> StepResult {
  let mut records: Vec<Value> = Vec::new();
  let next = node
    .with_state(|state: &mut LineState| read_step(state, &mut records))
    .unwrap_or_else(|| Next::Fail(StageError::new("line source state missing")));
  for record in records {
    engine.emit(node, record, None);
  }
  match next {
    Next::Rearm => arm(engine, node, Value::Nil),
    Next::Close => {
      engine.close(node);
      Ok(())
    }
    Next::Fail(err) => {
      engine.close(node);
      Err(err)
    }
  }
}

fn read_step(state: &mut LineState, records: &mut Vec<Value>) -> Next {
  let n = match state.file.read(&mut state.buf[state.tail..]) {
    Ok(n) => n,
    Err(err)
      if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted =>
    {
      return Next::Rearm;
    }
    Err(err) => return Next::Fail(StageError::new(format!("read failed: {err}"))),
  };
  if n == 0 {
    // End of stream: a non-empty leftover becomes the final record.
    if state.head < state.tail {
      records.push(record(&state.buf[state.head..state.tail]));
      state.head = state.tail;
    }
    return Next::Close;
  }
  state.tail += n;
  while let Some(pos) = state.buf[state.head..state.tail]
    .iter()
    .position(|&b| b == state.delimiter)
  {
    let end = state.head + pos;
    records.push(record(&state.buf[state.head..end]));
    state.head = end + 1;
  }
  // Compact the leftover so the next read has room.
  if state.head > 0 {
    state.buf.copy_within(state.head..state.tail, 0);
    state.tail -= state.head;
    state.head = 0;
  }
  if state.tail == state.buf.len() {
    // No delimiter in a full buffer: flush it as one oversized record.
    records.push(record(&state.buf[..state.tail]));
    state.tail = 0;
  }
  Next::Rearm
}

fn record(bytes: &[u8]) -> Value {
  Value::string(String::from_utf8_lossy(bytes))
}
