//! The stepping thread: a single worker thread that drives a [`Core`](crate::Core) through
//! repeated steps, controlled by two atomics rather than a channel or async runtime.
//!
//! Grounded directly in the `SteppingThread` pattern from the system this emulator is modeled on:
//! `running` gates whether the worker loop keeps stepping at all, and `update_flag` is raised by
//! the worker itself after every step, so that an owning thread (a debugger UI) can cheaply poll
//! "has at least one step happened since I last checked?" without synchronizing on every single
//! step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Shared flags a [`SteppingThread`] and its owner use to coordinate.
#[derive(Debug, Default)]
pub struct Flags {
    /// Whether the worker should keep executing steps. Checked with `SeqCst` on every iteration,
    /// since this needs to be observed promptly and accurately from an arbitrary calling thread,
    /// not just eventually.
    running: AtomicBool,
    /// Raised by the worker, `Release`-ordered, immediately after every completed step; cleared
    /// by the owner via [`Flags::check_and_clear_update_flag`] with an `Acquire` swap. No other
    /// state visibility guarantees are promised beyond this one flag — the owner is expected to
    /// tolerate racy snapshots of register values read independently of it.
    update_flag: AtomicBool,
}

impl Flags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn raise_update_flag(&self) {
        self.update_flag.store(true, Ordering::Release);
    }

    /// Swaps the update flag back to `false`, returning whether it had been raised. This is the
    /// operation a debugger UI polls to decide whether to refresh its view of the hart's state.
    pub fn check_and_clear_update_flag(&self) -> bool {
        self.update_flag.swap(false, Ordering::Acquire)
    }
}

/// A worker thread that repeatedly calls a step function while `flags.is_running()` holds,
/// raising the update flag after every call.
pub struct SteppingThread {
    flags: Arc<Flags>,
    handle: Option<JoinHandle<()>>,
}

impl SteppingThread {
    /// Spawns the worker thread. `step` is called repeatedly until [`Self::stop`] is invoked or
    /// `step` itself returns `false` (e.g. because the core aborted).
    pub fn spawn<F>(mut step: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let flags = Flags::new();
        let worker_flags = flags.clone();
        worker_flags.running.store(true, Ordering::SeqCst);

        let handle = std::thread::spawn(move || {
            while worker_flags.is_running() {
                let keep_going = step();
                worker_flags.raise_update_flag();
                if !keep_going {
                    break;
                }
            }
            worker_flags.running.store(false, Ordering::SeqCst);
        });

        Self {
            flags,
            handle: Some(handle),
        }
    }

    /// Returns a handle to the shared flags, so an owner can poll
    /// [`Flags::check_and_clear_update_flag`] without holding a reference to the whole
    /// `SteppingThread` (e.g. after it has been moved into a `Core`).
    pub fn flags(&self) -> Arc<Flags> {
        self.flags.clone()
    }

    /// Stops the worker and joins its thread. Idempotent: calling this more than once, or from
    /// inside the step callback itself, must never be attempted — doing the latter would
    /// deadlock, since the worker thread would be joining itself.
    pub fn stop(&mut self) {
        self.flags.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.flags.is_running()
    }
}

impl Drop for SteppingThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_runs_until_stopped() {
        let counter = Arc::new(AtomicU32::new(0));
        let worker_counter = counter.clone();
        let mut thread = SteppingThread::spawn(move || {
            worker_counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        thread.stop();
        assert!(counter.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_step_returning_false_halts_worker() {
        let mut thread = SteppingThread::spawn(|| false);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!thread.is_running());
        thread.stop();
    }

    #[test]
    fn test_update_flag_raised_after_step_and_cleared_on_check() {
        let mut thread = SteppingThread::spawn(|| true);
        let flags = thread.flags();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(flags.check_and_clear_update_flag());
        assert!(!flags.check_and_clear_update_flag());
        thread.stop();
    }
}
