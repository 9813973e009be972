//! Blocking work on a dedicated thread, pollable from the caller
//!
//! A [`BlockingTask`] runs one closure on its own OS thread and parks the
//! result in a shared slot. The caller either waits on it with a bounded
//! timeout or, on unix, selects on a [`WaitHandle`] that becomes readable
//! once the result is ready.
//!
//! Threads cannot be killed. Cancelling a task sets a flag the closure may
//! observe, detaches the thread and drops whatever it eventually produces.

use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use lodestar_core::{Error, Result};

use crate::budget;

/// Cancellation flag handed to the worker closure
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

enum Slot<T> {
    Running,
    Finished(T),
    Panicked,
    Taken,
}

impl<T> Slot<T> {
    fn is_running(&self) -> bool {
        matches!(self, Slot::Running)
    }
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// Result of a closure running on a dedicated thread
pub struct BlockingTask<T> {
    name: String,
    shared: Arc<Shared<T>>,
    cancel: CancelFlag,
    thread: Option<JoinHandle<()>>,
    wake: wake::Receiver,
}

impl<T: Send + 'static> BlockingTask<T> {
    pub fn spawn<F>(name: &str, f: F) -> Result<Self>
    where
        F: FnOnce(&CancelFlag) -> T + Send + 'static,
    {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Running),
            ready: Condvar::new(),
        });
        let cancel = CancelFlag::default();
        let (wake, mut notifier) = wake::pair()?;

        let worker_shared = Arc::clone(&shared);
        let worker_cancel = cancel.clone();
        let worker_name = name.to_string();

        let thread = thread::Builder::new()
            .name(format!("lodestar-{}", name))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&worker_cancel)));

                if worker_cancel.is_cancelled() {
                    debug!(task = %worker_name, "Task finished after cancellation, dropping result");
                    drop(outcome);
                    return;
                }

                // the wake byte goes out before the slot flips, so a caller
                // that sees a finished slot can always drain it
                notifier.notify();

                let mut slot = worker_shared.slot.lock();
                *slot = match outcome {
                    Ok(value) => Slot::Finished(value),
                    Err(_) => {
                        warn!(task = %worker_name, "Task panicked");
                        Slot::Panicked
                    }
                };
                worker_shared.ready.notify_all();
            })?;

        debug!(task = %name, "Spawned blocking task");

        Ok(Self {
            name: name.to_string(),
            shared,
            cancel,
            thread: Some(thread),
            wake,
        })
    }
}

impl<T> BlockingTask<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until the result is ready.
    ///
    /// `None` waits without bound; `Some(Duration::ZERO)` only checks.
    /// Returns whether the task has finished.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut slot = self.shared.slot.lock();
        match budget::deadline_after(timeout) {
            None => {
                while slot.is_running() {
                    self.shared.ready.wait(&mut slot);
                }
            }
            Some(deadline) => {
                while slot.is_running() {
                    if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        !slot.is_running()
    }

    pub fn is_finished(&self) -> bool {
        !self.shared.slot.lock().is_running()
    }

    /// Readiness handle, readable once the task has finished
    pub fn wait_handle(&self) -> Option<WaitHandle> {
        self.wake.handle()
    }

    /// Join the thread and take its result, blocking until it is ready.
    pub fn join(mut self) -> Result<T> {
        self.wait(None);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.wake.drain();

        match std::mem::replace(&mut *self.shared.slot.lock(), Slot::Taken) {
            Slot::Finished(value) => Ok(value),
            Slot::Panicked => Err(Error::InvalidState(format!(
                "task {} panicked",
                self.name
            ))),
            Slot::Running | Slot::Taken => Err(Error::InvalidState(format!(
                "task {} has no result",
                self.name
            ))),
        }
    }

    /// Abandon the task. The thread is detached; a late result is dropped.
    pub fn cancel(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.cancel.set();

        // a finished result is released here, otherwise by the worker
        let finished = std::mem::replace(&mut *self.shared.slot.lock(), Slot::Taken);
        if finished.is_running() {
            debug!(task = %self.name, "Detaching running task");
        }
        drop(finished);
        drop(thread);
    }
}

impl<T> Drop for BlockingTask<T> {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Readiness handle a caller can hand to its own event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitHandle {
    #[cfg(unix)]
    fd: std::os::unix::io::RawFd,
}

#[cfg(unix)]
impl WaitHandle {
    pub(crate) fn from_raw_fd(fd: std::os::unix::io::RawFd) -> Self {
        Self { fd }
    }
}

#[cfg(unix)]
impl std::os::unix::io::AsRawFd for WaitHandle {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.fd
    }
}

#[cfg(unix)]
pub(crate) mod wake {
    use std::io::{self, Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::WaitHandle;

    pub(crate) struct Receiver(UnixStream);

    pub(crate) struct Notifier(UnixStream);

    pub(crate) fn pair() -> io::Result<(Receiver, Notifier)> {
        let (rx, tx) = UnixStream::pair()?;
        Ok((Receiver(rx), Notifier(tx)))
    }

    impl Receiver {
        pub(crate) fn handle(&self) -> Option<WaitHandle> {
            Some(WaitHandle::from_raw_fd(self.0.as_raw_fd()))
        }

        /// Consume the single readiness byte
        pub(crate) fn drain(&mut self) {
            let mut byte = [0u8; 1];
            let _ = self.0.read_exact(&mut byte);
        }
    }

    impl Notifier {
        pub(crate) fn notify(&mut self) {
            let _ = self.0.write_all(&[1]);
        }
    }
}

#[cfg(not(unix))]
pub(crate) mod wake {
    use std::io;

    use super::WaitHandle;

    pub(crate) struct Receiver;

    pub(crate) struct Notifier;

    pub(crate) fn pair() -> io::Result<(Receiver, Notifier)> {
        Ok((Receiver, Notifier))
    }

    impl Receiver {
        pub(crate) fn handle(&self) -> Option<WaitHandle> {
            None
        }

        pub(crate) fn drain(&mut self) {}
    }

    impl Notifier {
        pub(crate) fn notify(&mut self) {}
    }
}
