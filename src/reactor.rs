//! # I/O Bridge
//!
//! One dedicated thread owns the readiness backend (epoll/kqueue via mio) and
//! translates descriptor readiness into scheduled callbacks. Worker threads
//! never block on I/O: a stage that wants to wait for a descriptor stops
//! being scheduled, registers one-shot interest with its callback embedded in
//! the registration, and resumes when the bridge pushes that callback
//! straight to the node's pinned worker queue.
//!
//! ## One-shot semantics
//!
//! Interest is consumed on firing: the bridge deregisters the descriptor
//! before delivering the callback, and re-arming is the registering stage's
//! responsibility. (mio has no native one-shot mode; deregister-then-deliver
//! is observationally equivalent.)
//!
//! ## Degradation for non-pollable descriptors
//!
//! Registering a regular file fails with a distinguishable "not pollable"
//! error. The node is then marked NOWAIT and its callback is pushed
//! immediately instead — the stage busy-steps its reads one chunk at a time,
//! each chunk's completion scheduling the next step. Registration failures
//! *other* than NotPollable are fatal to that single node (it is closed), not
//! to the process.
//!
//! ## Outstanding-watch counting
//!
//! Every live registration counts toward the driver's drain invariant, so
//! `run` cannot return while the bridge could still deliver work.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::node::{Node, StepFn};
use crate::value::Value;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Token reserved for the bridge's own wakeup channel.
const WAKE_TOKEN: usize = 0;

/// Readiness events delivered per wait call.
const MAX_EVENTS: usize = 64;

/// Which readiness a watch waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchInterest {
  /// The descriptor has bytes to read (or EOF).
  Readable,
  /// The descriptor can accept bytes.
  Writable,
}

impl WatchInterest {
  fn to_mio(self) -> Interest {
    match self {
      WatchInterest::Readable => Interest::READABLE,
      WatchInterest::Writable => Interest::WRITABLE,
    }
  }
}

/// Registration failure, with "this descriptor cannot be polled" kept
/// distinguishable from real I/O errors — the engine treats the former as a
/// recoverable signal, the latter as fatal to the registering node.
pub(crate) enum BackendError {
  NotPollable,
  Io(io::Error),
}

/// The four-call readiness-backend contract the bridge consumes. Constructing
/// a backend is the implementation's own affair; the engine only needs
/// register/modify/remove plus a blocking wait that reports ready tags.
pub(crate) trait ReadinessBackend: Send + Sync {
  fn add(&self, fd: RawFd, interest: WatchInterest, token: usize) -> Result<(), BackendError>;
  fn modify(&self, fd: RawFd, interest: WatchInterest, token: usize) -> Result<(), BackendError>;
  fn remove(&self, fd: RawFd) -> Result<(), BackendError>;
  fn wait(&self, max_events: usize, timeout: Option<Duration>) -> io::Result<Vec<usize>>;
}

/// epoll on Linux, kqueue on the BSDs, via mio. Registration goes through a
/// cloned registry so any thread can add interest while the bridge blocks in
/// `poll`.
struct MioBackend {
  registry: Registry,
  poll: Mutex<Poll>,
}

fn not_pollable(err: &io::Error) -> bool {
  // epoll reports EPERM for regular files; kqueue reports EINVAL.
  matches!(
    err.kind(),
    io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput
  )
}

impl MioBackend {
  fn classify(err: io::Error) -> BackendError {
    if not_pollable(&err) {
      BackendError::NotPollable
    } else {
      BackendError::Io(err)
    }
  }
}

impl ReadinessBackend for MioBackend {
  fn add(&self, fd: RawFd, interest: WatchInterest, token: usize) -> Result<(), BackendError> {
    self
      .registry
      .register(&mut SourceFd(&fd), Token(token), interest.to_mio())
      .map_err(Self::classify)
  }

  fn modify(&self, fd: RawFd, interest: WatchInterest, token: usize) -> Result<(), BackendError> {
    self
      .registry
      .reregister(&mut SourceFd(&fd), Token(token), interest.to_mio())
      .map_err(Self::classify)
  }

  fn remove(&self, fd: RawFd) -> Result<(), BackendError> {
    self
      .registry
      .deregister(&mut SourceFd(&fd))
      .map_err(Self::classify)
  }

  fn wait(&self, max_events: usize, timeout: Option<Duration>) -> io::Result<Vec<usize>> {
    let mut events = Events::with_capacity(max_events);
    let mut poll = self.poll.lock();
    poll.poll(&mut events, timeout)?;
    Ok(events.iter().map(|event| event.token().0).collect())
  }
}

/// A registration: the scheduled-callback triple embedded as the
/// registration's tag, plus the descriptor for the one-shot deregister.
struct Watch {
  fd: RawFd,
  node: Arc<Node>,
  func: StepFn,
  value: Value,
}

struct ReactorShared {
  backend: Arc<dyn ReadinessBackend>,
  waker: Waker,
  watches: Mutex<HashMap<usize, Watch>>,
  next_token: AtomicUsize,
  outstanding: AtomicUsize,
  stop: AtomicBool,
}

/// Handle to the I/O bridge thread and its registration table.
pub(crate) struct Reactor {
  shared: Arc<ReactorShared>,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
  /// Creates the readiness backend and spawns the bridge thread.
  pub(crate) fn start(engine: Engine) -> io::Result<Self> {
    let poll = Poll::new()?;
    let waker = Waker::new(poll.registry(), Token(WAKE_TOKEN))?;
    let registry = poll.registry().try_clone()?;
    let backend: Arc<dyn ReadinessBackend> = Arc::new(MioBackend {
      registry,
      poll: Mutex::new(poll),
    });
    let shared = Arc::new(ReactorShared {
      backend,
      waker,
      watches: Mutex::new(HashMap::new()),
      next_token: AtomicUsize::new(WAKE_TOKEN + 1),
      outstanding: AtomicUsize::new(0),
      stop: AtomicBool::new(false),
    });
    let handle = thread::Builder::new()
      .name("streamloom-io".to_string())
      .spawn({
        let shared = shared.clone();
        move || bridge_loop(engine, shared)
      })?;
    Ok(Self {
      shared,
      handle: Mutex::new(Some(handle)),
    })
  }

  /// Registers one-shot interest in `fd` on behalf of `node`. See the module
  /// docs for the one-shot, NOWAIT, and failure contracts.
  pub(crate) fn watch(
    &self,
    engine: &Engine,
    node: &Arc<Node>,
    fd: RawFd,
    interest: WatchInterest,
    callback: StepFn,
  ) -> Result<(), EngineError> {
    if node.is_closing() {
      return Ok(());
    }
    if node.inner.lock().nowait {
      engine.schedule(node, callback, Value::Nil, None);
      return Ok(());
    }
    let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
    self.shared.watches.lock().insert(
      token,
      Watch {
        fd,
        node: node.clone(),
        func: callback.clone(),
        value: Value::Nil,
      },
    );
    // Count and link before registering: the event can fire (and the bridge
    // consume the watch) before `add` even returns.
    node.inner.lock().watch_token = Some(token);
    self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
    let registered = match self.shared.backend.add(fd, interest, token) {
      // A previous one-shot on this descriptor may not have been consumed
      // yet (explicit re-arm before firing); fall back to rearming in place.
      Err(BackendError::Io(err)) if err.kind() == io::ErrorKind::AlreadyExists => {
        self.shared.backend.modify(fd, interest, token)
      }
      other => other,
    };
    match registered {
      Ok(()) => {
        trace!(node = node.name(), fd, token, "watch registered");
        Ok(())
      }
      Err(BackendError::NotPollable) => {
        self.unlink(node, token);
        node.inner.lock().nowait = true;
        debug!(
          node = node.name(),
          fd, "descriptor not pollable; switching node to immediate reschedule"
        );
        engine.schedule(node, callback, Value::Nil, None);
        Ok(())
      }
      Err(BackendError::Io(err)) => {
        self.unlink(node, token);
        error!(node = node.name(), fd, error = %err, "readiness registration failed; closing node");
        engine.close(node);
        Err(EngineError::Resource(err))
      }
    }
  }

  /// Drops an outstanding watch without delivering it (node closed early).
  pub(crate) fn cancel(&self, engine: &Engine, token: usize) {
    let watch = self.shared.watches.lock().remove(&token);
    if let Some(watch) = watch {
      let _ = self.shared.backend.remove(watch.fd);
      self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
      trace!(node = watch.node.name(), token, "watch cancelled");
      engine.core.lifecycle.hint_drained();
    }
  }

  /// Registrations not yet fired or cancelled; part of the driver's drain
  /// invariant.
  pub(crate) fn outstanding(&self) -> usize {
    self.shared.outstanding.load(Ordering::Acquire)
  }

  /// Stops and joins the bridge thread.
  pub(crate) fn stop(&self) {
    self.shared.stop.store(true, Ordering::Release);
    let _ = self.shared.waker.wake();
    if let Some(handle) = self.handle.lock().take() {
      let _ = handle.join();
    }
  }

  fn unlink(&self, node: &Arc<Node>, token: usize) {
    if self.shared.watches.lock().remove(&token).is_some() {
      self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
    let mut inner = node.inner.lock();
    if inner.watch_token == Some(token) {
      inner.watch_token = None;
    }
  }
}

fn bridge_loop(engine: Engine, shared: Arc<ReactorShared>) {
  trace!("io bridge started");
  loop {
    let tokens = match shared.backend.wait(MAX_EVENTS, None) {
      Ok(tokens) => tokens,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) => {
        error!(error = %err, "readiness wait failed; io bridge exiting");
        break;
      }
    };
    if shared.stop.load(Ordering::Acquire) {
      break;
    }
    for token in tokens {
      if token == WAKE_TOKEN {
        continue;
      }
      let watch = shared.watches.lock().remove(&token);
      let Some(watch) = watch else {
        // Cancelled between firing and delivery.
        continue;
      };
      // One-shot: consume the registration before delivery; the stage
      // re-arms explicitly if it wants more.
      let _ = shared.backend.remove(watch.fd);
      {
        let mut inner = watch.node.inner.lock();
        if inner.watch_token == Some(token) {
          inner.watch_token = None;
        }
      }
      shared.outstanding.fetch_sub(1, Ordering::AcqRel);
      if watch.node.is_closed() {
        trace!(node = watch.node.name(), "dropping readiness for closed node");
      } else {
        // The registration already targeted exactly one node, so this
        // bypasses the emit fan-out path and goes straight to the node's
        // pinned worker.
        engine.schedule(&watch.node, watch.func, watch.value, None);
      }
      engine.core.lifecycle.hint_drained();
    }
  }
  trace!("io bridge stopped");
}
