//! # Blocking Worker Queue
//!
//! The per-worker FIFO of scheduled callbacks: a mutex-protected deque plus a
//! condition variable. Each queue is genuinely multi-producer (any worker,
//! the I/O bridge thread, or the driver may push) and single-consumer (only
//! the owning worker pops), which is why a plain lock is the right tool here
//! — contrast with the lock-free queue in [`crate::rendezvous`], which exists
//! for the one place a lock could deadlock.

use crate::node::Task;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// A FIFO queue of scheduled callbacks owned by one worker thread.
///
/// Occupancy covers both queued tasks and the task the worker has popped but
/// not yet finished: a callback in flight can still emit, so the driver's
/// drain check must not treat "queue empty, callback running" as quiet.
pub(crate) struct TaskQueue {
  tasks: Mutex<VecDeque<Task>>,
  ready: Condvar,
  busy: AtomicBool,
}

impl TaskQueue {
  pub(crate) fn new() -> Self {
    Self {
      tasks: Mutex::new(VecDeque::new()),
      ready: Condvar::new(),
      busy: AtomicBool::new(false),
    }
  }

  /// Pushes a task and wakes the owning worker.
  pub(crate) fn push(&self, task: Task) {
    let mut tasks = self.tasks.lock();
    tasks.push_back(task);
    self.ready.notify_one();
  }

  /// Blocks until a task is available, then pops it in FIFO order. The queue
  /// counts as occupied until the worker calls [`mark_idle`](Self::mark_idle).
  pub(crate) fn pop(&self) -> Task {
    let mut tasks = self.tasks.lock();
    loop {
      if let Some(task) = tasks.pop_front() {
        self.busy.store(true, Ordering::Release);
        return task;
      }
      self.ready.wait(&mut tasks);
    }
  }

  /// Marks the popped task finished; called by the worker after dispatch.
  pub(crate) fn mark_idle(&self) {
    self.busy.store(false, Ordering::Release);
  }

  /// Current queue depth. Advisory only: the depth can change the moment the
  /// lock is released.
  pub(crate) fn len(&self) -> usize {
    self.tasks.lock().len()
  }

  /// True when the queue is empty right now. Advisory, like [`len`](Self::len).
  pub(crate) fn is_empty(&self) -> bool {
    self.tasks.lock().is_empty()
  }

  /// True when the queue is empty and no popped task is still running.
  pub(crate) fn is_quiet(&self) -> bool {
    !self.busy.load(Ordering::Acquire) && self.is_empty()
  }
}
