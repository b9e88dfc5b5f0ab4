//! # Line Source Test Suite
//!
//! Drives the descriptor line source over both a pollable stream (a socket
//! pair, exercising the readiness bridge) and a regular file (exercising the
//! NOWAIT degradation path), plus the delimiter and oversized-line behavior.

use crate::lines;
use crate::stages;
use crate::{Engine, EngineConfig, Value};
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

fn engine() -> Engine {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();
  Engine::new(EngineConfig::new().workers(4))
}

fn strings(values: &[&str]) -> Vec<Value> {
  values.iter().map(|s| Value::string(s)).collect()
}

#[test]
fn socket_stream_yields_one_record_per_line_and_a_final_leftover() {
  let engine = engine();
  let (mut tx, rx) = UnixStream::pair().unwrap();
  tx.write_all(b"a\nb\nc").unwrap();
  drop(tx);

  let src = lines::fd_source("lines", OwnedFd::from(rx));
  let (sink, seen) = stages::collector("sink");
  engine.connect(&src, &sink).unwrap();
  engine.run().unwrap();
  // "c" has no trailing delimiter; end-of-stream flushes it as the last record.
  assert_eq!(*seen.lock(), strings(&["a", "b", "c"]));
  engine.shutdown();
}

#[test]
fn regular_file_degrades_to_nowait_stepping() {
  let engine = engine();
  let mut file = tempfile::tempfile().unwrap();
  file.write_all(b"x\ny\n").unwrap();
  file.seek(SeekFrom::Start(0)).unwrap();

  // epoll refuses regular files, so the watch call marks the node NOWAIT and
  // the source busy-steps through the same callback.
  let src = lines::fd_source("file", OwnedFd::from(file));
  let (sink, seen) = stages::collector("sink");
  engine.connect(&src, &sink).unwrap();
  engine.run().unwrap();
  assert_eq!(*seen.lock(), strings(&["x", "y"]));
  engine.shutdown();
}

#[test]
fn custom_delimiter_splits_records() {
  let engine = engine();
  let mut file = tempfile::tempfile().unwrap();
  file.write_all(b"one,two,three").unwrap();
  file.seek(SeekFrom::Start(0)).unwrap();

  let src = lines::fd_source_with_delimiter("csvish", OwnedFd::from(file), b',');
  let (sink, seen) = stages::collector("sink");
  engine.connect(&src, &sink).unwrap();
  engine.run().unwrap();
  assert_eq!(*seen.lock(), strings(&["one", "two", "three"]));
  engine.shutdown();
}

#[test]
fn line_longer_than_the_buffer_is_flushed_in_chunks() {
  let engine = engine();
  let mut file = tempfile::tempfile().unwrap();
  let long = vec![b'x'; 9000];
  file.write_all(&long).unwrap();
  file.seek(SeekFrom::Start(0)).unwrap();

  let src = lines::fd_source("long", OwnedFd::from(file));
  let (sink, seen) = stages::collector("sink");
  engine.connect(&src, &sink).unwrap();
  engine.run().unwrap();

  // A full buffer with no delimiter is flushed as one oversized record; the
  // remainder arrives with the end-of-stream flush.
  let seen = seen.lock();
  assert_eq!(seen.len(), 2);
  assert_eq!(seen[0].as_str().map(str::len), Some(8192));
  assert_eq!(seen[1].as_str().map(str::len), Some(9000 - 8192));
  assert!(seen
    .iter()
    .all(|v| v.as_str().is_some_and(|s| s.bytes().all(|b| b == b'x'))));
  engine.shutdown();
}

#[test]
fn empty_stream_emits_nothing_and_closes() {
  let engine = engine();
  let (tx, rx) = UnixStream::pair().unwrap();
  drop(tx);

  let src = lines::fd_source("empty", OwnedFd::from(rx));
  let (sink, seen) = stages::collector("sink");
  engine.connect(&src, &sink).unwrap();
  engine.run().unwrap();
  assert!(seen.lock().is_empty());
  assert!(src.is_closed());
  engine.shutdown();
}
