//! # Lock-Free Rendezvous Queue
//!
//! An unbounded multi-producer/multi-consumer FIFO built from compare-and-swap
//! in the Michael–Scott style: a linked list with a permanent sentinel head,
//! a lazily-swung tail, and helping on tail lag.
//!
//! The latch/channel layer uses this queue where a blocking queue could
//! deadlock: a producer pushing into a latch may share a worker with the
//! consumer waiting on that latch, so neither side may ever hold a lock the
//! other needs. Reclamation uses crossbeam's epoch GC — a popped sentinel is
//! deferred-destroyed under the popping thread's guard, so concurrent readers
//! chasing `next` pointers never observe freed memory.

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

struct Link<T> {
  /// Uninitialized in the sentinel; read exactly once by the pop that
  /// promotes the link to sentinel.
  value: MaybeUninit<T>,
  next: Atomic<Link<T>>,
}

/// An unbounded lock-free MPMC FIFO.
pub struct RendezvousQueue<T> {
  head: CachePadded<Atomic<Link<T>>>,
  tail: CachePadded<Atomic<Link<T>>>,
}

unsafe impl<T: Send> Send for RendezvousQueue<T> {}
unsafe impl<T: Send> Sync for RendezvousQueue<T> {}

impl<T> RendezvousQueue<T> {
  /// Creates an empty queue with its sentinel link in place.
  pub fn new() -> Self {
    let queue = Self {
      head: CachePadded::new(Atomic::null()),
      tail: CachePadded::new(Atomic::null()),
    };
    let sentinel = Owned::new(Link {
      value: MaybeUninit::uninit(),
      next: Atomic::null(),
    });
    // No other thread can see the queue yet.
    let guard = unsafe { epoch::unprotected() };
    let sentinel = sentinel.into_shared(guard);
    queue.head.store(sentinel, Relaxed);
    queue.tail.store(sentinel, Relaxed);
    queue
  }

  /// Enqueues a value at the tail.
  pub fn push(&self, value: T) {
    let guard = &epoch::pin();
    let new = Owned::new(Link {
      value: MaybeUninit::new(value),
      next: Atomic::null(),
    })
    .into_shared(guard);
    loop {
      let tail = self.tail.load(Acquire, guard);
      // Tail is never null after construction.
      let tail_ref = unsafe { tail.deref() };
      let next = tail_ref.next.load(Acquire, guard);
      if !next.is_null() {
        // Tail is lagging; help swing it and retry.
        let _ = self
          .tail
          .compare_exchange(tail, next, Release, Relaxed, guard);
        continue;
      }
      if tail_ref
        .next
        .compare_exchange(Shared::null(), new, Release, Relaxed, guard)
        .is_ok()
      {
        let _ = self
          .tail
          .compare_exchange(tail, new, Release, Relaxed, guard);
        return;
      }
    }
  }

  /// Dequeues the oldest value, or `None` when the queue is observed empty.
  pub fn pop(&self) -> Option<T> {
    let guard = &epoch::pin();
    unsafe { self.pop_with(guard) }
  }

  /// True when the queue is observed empty. Advisory under concurrency.
  pub fn is_empty(&self) -> bool {
    let guard = &epoch::pin();
    let head = self.head.load(Acquire, guard);
    let head_ref = unsafe { head.deref() };
    head_ref.next.load(Acquire, guard).is_null()
  }

  /// # Safety
  ///
  /// `guard` must be a valid pin of the current thread (or the unprotected
  /// guard during exclusive access in `drop`).
  unsafe fn pop_with(&self, guard: &Guard) -> Option<T> {
    loop {
      let head = self.head.load(Acquire, guard);
      let head_ref = unsafe { head.deref() };
      let next = head_ref.next.load(Acquire, guard);
      let next_ref = match unsafe { next.as_ref() } {
        Some(next_ref) => next_ref,
        None => return None,
      };
      // Keep the tail from pointing at the link we are about to retire.
      let tail = self.tail.load(Relaxed, guard);
      if tail == head {
        let _ = self
          .tail
          .compare_exchange(tail, next, Release, Relaxed, guard);
      }
      if self
        .head
        .compare_exchange(head, next, Release, Relaxed, guard)
        .is_ok()
      {
        // We won the head CAS, so we are the only reader of this value.
        // The link itself becomes the new sentinel and is freed by a later
        // pop; only the old sentinel is retired here.
        let value = unsafe { ptr::read(next_ref.value.as_ptr()) };
        unsafe { guard.defer_destroy(head) };
        return Some(value);
      }
    }
  }
}

impl<T> Default for RendezvousQueue<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Drop for RendezvousQueue<T> {
  fn drop(&mut self) {
    // Exclusive access: drain remaining values, then free the sentinel.
    unsafe {
      let guard = epoch::unprotected();
      while self.pop_with(guard).is_some() {}
      let sentinel = self.head.load(Relaxed, guard);
      drop(sentinel.into_owned());
    }
  }
}
