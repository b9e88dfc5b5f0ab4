//! # Worker Queue Test Suite

use crate::node::Task;
use crate::queue::TaskQueue;
use std::sync::Arc;
use std::thread;

#[test]
fn pop_blocks_until_push() {
  let queue = Arc::new(TaskQueue::new());
  let popper = {
    let queue = queue.clone();
    thread::spawn(move || matches!(queue.pop(), Task::Shutdown))
  };
  thread::sleep(std::time::Duration::from_millis(20));
  queue.push(Task::Shutdown);
  assert!(popper.join().unwrap());
}

#[test]
fn fifo_order() {
  let queue = TaskQueue::new();
  queue.push(Task::PipelineFinish);
  queue.push(Task::Shutdown);
  assert!(matches!(queue.pop(), Task::PipelineFinish));
  assert!(matches!(queue.pop(), Task::Shutdown));
}

#[test]
fn quiet_tracks_in_flight_dispatch() {
  let queue = TaskQueue::new();
  assert!(queue.is_quiet());
  queue.push(Task::PipelineFinish);
  assert!(!queue.is_quiet());
  let _task = queue.pop();
  // Popped but not yet finished: still occupied.
  assert!(queue.is_empty());
  assert!(!queue.is_quiet());
  queue.mark_idle();
  assert!(queue.is_quiet());
}
