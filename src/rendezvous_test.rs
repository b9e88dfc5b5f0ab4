//! # Rendezvous Queue Test Suite
//!
//! Single-threaded FIFO behavior, the empty observation, drop of a non-empty
//! queue, and a concurrent producers/consumers run checking that every value
//! is delivered exactly once.

use crate::rendezvous::RendezvousQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn fifo_order_single_thread() {
  let queue = RendezvousQueue::new();
  for i in 0..100 {
    queue.push(i);
  }
  for i in 0..100 {
    assert_eq!(queue.pop(), Some(i));
  }
  assert_eq!(queue.pop(), None);
}

#[test]
fn pop_on_empty_returns_none() {
  let queue: RendezvousQueue<u32> = RendezvousQueue::new();
  assert!(queue.is_empty());
  assert_eq!(queue.pop(), None);
  queue.push(1);
  assert!(!queue.is_empty());
  assert_eq!(queue.pop(), Some(1));
  assert!(queue.is_empty());
  assert_eq!(queue.pop(), None);
}

#[test]
fn interleaved_push_pop_keeps_order() {
  let queue = RendezvousQueue::new();
  queue.push(1);
  queue.push(2);
  assert_eq!(queue.pop(), Some(1));
  queue.push(3);
  assert_eq!(queue.pop(), Some(2));
  assert_eq!(queue.pop(), Some(3));
  assert_eq!(queue.pop(), None);
}

struct DropProbe(Arc<AtomicUsize>);

impl Drop for DropProbe {
  fn drop(&mut self) {
    self.0.fetch_add(1, Ordering::SeqCst);
  }
}

#[test]
fn dropping_a_nonempty_queue_drops_every_value() {
  let drops = Arc::new(AtomicUsize::new(0));
  let queue = RendezvousQueue::new();
  for _ in 0..10 {
    queue.push(DropProbe(drops.clone()));
  }
  drop(queue);
  assert_eq!(drops.load(Ordering::SeqCst), 10);
}

#[test]
fn concurrent_producers_and_consumers_deliver_exactly_once() {
  const PRODUCERS: usize = 4;
  const CONSUMERS: usize = 4;
  const PER_PRODUCER: usize = 1000;
  const TOTAL: usize = PRODUCERS * PER_PRODUCER;

  let queue = Arc::new(RendezvousQueue::new());
  let popped = Arc::new(AtomicUsize::new(0));
  let seen = Arc::new(Mutex::new(Vec::with_capacity(TOTAL)));

  let mut handles = Vec::new();
  for p in 0..PRODUCERS {
    let queue = queue.clone();
    handles.push(thread::spawn(move || {
      for i in 0..PER_PRODUCER {
        queue.push(p * PER_PRODUCER + i);
      }
    }));
  }
  for _ in 0..CONSUMERS {
    let queue = queue.clone();
    let popped = popped.clone();
    let seen = seen.clone();
    handles.push(thread::spawn(move || {
      while popped.load(Ordering::SeqCst) < TOTAL {
        match queue.pop() {
          Some(value) => {
            seen.lock().push(value);
            popped.fetch_add(1, Ordering::SeqCst);
          }
          None => thread::yield_now(),
        }
      }
    }));
  }
  for handle in handles {
    handle.join().unwrap();
  }

  let mut seen = seen.lock();
  seen.sort_unstable();
  let expected: Vec<usize> = (0..TOTAL).collect();
  assert_eq!(*seen, expected);
  assert!(queue.is_empty());
}
