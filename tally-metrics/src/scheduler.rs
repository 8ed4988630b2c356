use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Condvar, Mutex};

/// The default interval between flushes.
///
/// The agent aggregates over 10 second windows. The interval must divide the window evenly so
/// that every window receives the same number of counter flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Name of the thread running flush cycles.
const THREAD_NAME: &str = "tally-flush";

type Callback = Box<dyn FnMut() + Send>;

struct Hook {
    /// Held for the duration of every invocation.
    callback: Mutex<Option<Callback>>,
    cancelled: AtomicBool,
}

#[derive(Default)]
struct Hooks {
    next_id: u64,
    entries: BTreeMap<u64, Arc<Hook>>,
}

#[derive(Debug, Default)]
struct Epoch {
    started: u64,
    completed: u64,
    stopped: bool,
}

struct Shared {
    epoch: Mutex<Epoch>,
    completed: Condvar,
    hooks: Mutex<Hooks>,
    thread: OnceLock<ThreadId>,
}

impl Shared {
    fn on_flush_thread(&self) -> bool {
        self.thread.get() == Some(&thread::current().id())
    }

    fn run_hooks(&self) {
        let hooks: Vec<_> = self.hooks.lock().entries.values().cloned().collect();

        for hook in hooks {
            let mut callback = hook.callback.lock();
            if !hook.cancelled.load(Ordering::Acquire) {
                if let Some(ref mut f) = *callback {
                    f();
                }
            }
            // The hook may have cancelled itself while running.
            if hook.cancelled.load(Ordering::Acquire) {
                *callback = None;
            }
        }
    }

    fn run_cycle(&self, cycle: &mut dyn FnMut()) {
        let number = {
            let mut epoch = self.epoch.lock();
            epoch.started += 1;
            epoch.started
        };

        tally_log::trace!(cycle = number, "running flush cycle");
        self.run_hooks();
        cycle();

        let mut epoch = self.epoch.lock();
        epoch.completed = number;
        self.completed.notify_all();
    }
}

/// Releases blocked callers when the flush thread exits, including by panic.
struct StopGuard<'a>(&'a Shared);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.0.epoch.lock().stopped = true;
        self.0.completed.notify_all();
    }
}

/// Runs flush cycles on a dedicated thread.
///
/// A cycle runs all registered hooks in registration order, then the cycle function given to
/// [`spawn`](Self::spawn). Cycles run periodically, on demand through [`flush`](Self::flush), and
/// once more when the scheduler is closed. Only one cycle runs at a time.
pub struct FlushScheduler {
    shared: Arc<Shared>,
    trigger: Sender<()>,
    shutdown: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FlushScheduler {
    /// Spawns the flush thread, running `cycle` every `interval`.
    pub fn spawn<F>(interval: Duration, mut cycle: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            epoch: Mutex::new(Epoch::default()),
            completed: Condvar::new(),
            hooks: Mutex::new(Hooks::default()),
            thread: OnceLock::new(),
        });

        let (trigger, trigger_rx) = crossbeam_channel::bounded(1);
        let (shutdown, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let interval = interval.max(Duration::from_millis(1));

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || {
                let shared = &*thread_shared;
                let _ = shared.thread.set(thread::current().id());
                let _guard = StopGuard(shared);

                let ticker = crossbeam_channel::tick(interval);
                loop {
                    crossbeam_channel::select! {
                        recv(ticker) -> _ => shared.run_cycle(&mut cycle),
                        recv(trigger_rx) -> _ => shared.run_cycle(&mut cycle),
                        recv(shutdown_rx) -> _ => {
                            shared.run_cycle(&mut cycle);
                            break;
                        }
                    }
                }

                tally_log::debug!("flush thread stopped");
            })?;

        Ok(Self {
            shared,
            trigger,
            shutdown: Mutex::new(Some(shutdown)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Registers a callback to run at the start of every flush cycle.
    ///
    /// Callbacks run on the flush thread and delay publishing, so they should be cheap. The
    /// callback stays registered until [`FlushHook::cancel`] is called.
    pub fn every_flush<F>(&self, f: F) -> FlushHook
    where
        F: FnMut() + Send + 'static,
    {
        let hook = Arc::new(Hook {
            callback: Mutex::new(Some(Box::new(f))),
            cancelled: AtomicBool::new(false),
        });

        let mut hooks = self.shared.hooks.lock();
        let id = hooks.next_id;
        hooks.next_id += 1;
        hooks.entries.insert(id, Arc::clone(&hook));

        FlushHook {
            id,
            hook,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Triggers a flush cycle and blocks until a cycle that started after this call completed.
    ///
    /// Returns immediately after the scheduler has been closed, or when called from the flush
    /// thread itself.
    pub fn flush(&self) {
        if self.shared.on_flush_thread() {
            tally_log::debug!("ignoring flush request from the flush thread");
            return;
        }

        let mut epoch = self.shared.epoch.lock();
        if epoch.stopped {
            return;
        }

        let target = epoch.started + 1;
        match self.trigger.try_send(()) {
            // A pending trigger starts a new cycle just the same.
            Ok(()) | Err(TrySendError::Full(())) => (),
            Err(TrySendError::Disconnected(())) => return,
        }

        while epoch.completed < target && !epoch.stopped {
            self.shared.completed.wait(&mut epoch);
        }
    }

    /// Runs a final flush cycle and stops the flush thread.
    ///
    /// Blocks until the final cycle has completed. Subsequent calls have no effect.
    pub fn close(&self) {
        drop(self.shutdown.lock().take());

        let Some(handle) = self.handle.lock().take() else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            // Closed from a hook. The thread exits after the current cycle.
            return;
        }

        if handle.join().is_err() {
            tally_log::error!("flush thread panicked");
        }
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for FlushScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("epoch", &*self.shared.epoch.lock())
            .field("hooks", &self.shared.hooks.lock().entries.len())
            .finish()
    }
}

/// Handle to a callback registered with [`FlushScheduler::every_flush`].
///
/// Dropping the handle keeps the callback registered.
#[must_use = "dropping the handle does not cancel the hook"]
pub struct FlushHook {
    id: u64,
    hook: Arc<Hook>,
    shared: Weak<Shared>,
}

impl FlushHook {
    /// Unregisters the callback.
    ///
    /// Blocks until a concurrent invocation of the callback has finished. Once this returns, the
    /// callback is never invoked again. The callback may cancel its own hook.
    pub fn cancel(self) {
        self.hook.cancelled.store(true, Ordering::Release);

        let mut on_flush_thread = false;
        if let Some(shared) = self.shared.upgrade() {
            shared.hooks.lock().entries.remove(&self.id);
            on_flush_thread = shared.on_flush_thread();
        }

        if on_flush_thread {
            // Hooks run serially on this thread, so the only invocation that can be in flight is
            // the caller's own. It is dropped by the runner once it returns.
            if let Some(mut callback) = self.hook.callback.try_lock() {
                *callback = None;
            }
        } else {
            *self.hook.callback.lock() = None;
        }
    }
}

impl fmt::Debug for FlushHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushHook").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use super::*;

    /// An interval long enough to never tick during a test.
    const NEVER: Duration = Duration::from_secs(3600);

    fn counting_scheduler(interval: Duration) -> (FlushScheduler, Arc<AtomicUsize>) {
        let cycles = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cycles);
        let scheduler = FlushScheduler::spawn(interval, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        (scheduler, cycles)
    }

    #[test]
    fn test_flush_waits_for_cycle() {
        let (scheduler, cycles) = counting_scheduler(NEVER);

        scheduler.flush();
        assert_eq!(cycles.load(Ordering::SeqCst), 1);

        scheduler.flush();
        assert_eq!(cycles.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_periodic_cycles() {
        let (scheduler, cycles) = counting_scheduler(Duration::from_millis(5));

        let deadline = Instant::now() + Duration::from_secs(10);
        while cycles.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline, "no periodic flush");
            thread::sleep(Duration::from_millis(5));
        }

        drop(scheduler);
    }

    #[test]
    fn test_concurrent_flush_observes_writes() {
        let pending = Arc::new(Mutex::new(Vec::new()));
        let published = Arc::new(Mutex::new(Vec::new()));

        let scheduler = {
            let pending = Arc::clone(&pending);
            let published = Arc::clone(&published);
            FlushScheduler::spawn(Duration::from_millis(1), move || {
                let drained: Vec<usize> = pending.lock().drain(..).collect();
                published.lock().extend(drained);
            })
            .unwrap()
        };

        thread::scope(|s| {
            for i in 0..8 {
                let scheduler = &scheduler;
                let pending = &pending;
                let published = &published;
                s.spawn(move || {
                    for j in 0..20 {
                        let value = i * 100 + j;
                        pending.lock().push(value);
                        scheduler.flush();
                        assert!(published.lock().contains(&value));
                    }
                });
            }
        });
    }

    #[test]
    fn test_hooks_run_before_cycle() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let cycle_log = Arc::clone(&log);
        let scheduler = FlushScheduler::spawn(NEVER, move || cycle_log.lock().push("publish"))
            .unwrap();

        let hook_log = Arc::clone(&log);
        let first = scheduler.every_flush(move || hook_log.lock().push("first"));
        let hook_log = Arc::clone(&log);
        let second = scheduler.every_flush(move || hook_log.lock().push("second"));

        scheduler.flush();
        assert_eq!(*log.lock(), ["first", "second", "publish"]);

        first.cancel();
        scheduler.flush();
        assert_eq!(
            *log.lock(),
            ["first", "second", "publish", "second", "publish"]
        );

        second.cancel();
    }

    #[test]
    fn test_cancel_waits_for_invocation() {
        let (scheduler, _) = counting_scheduler(NEVER);

        let running = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let hook = {
            let running = Arc::clone(&running);
            let calls = Arc::clone(&calls);
            scheduler.every_flush(move || {
                running.store(true, Ordering::SeqCst);
                calls.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                running.store(false, Ordering::SeqCst);
            })
        };

        thread::scope(|s| {
            s.spawn(|| scheduler.flush());

            while !running.load(Ordering::SeqCst) {
                thread::yield_now();
            }

            hook.cancel();
            assert!(!running.load(Ordering::SeqCst));
        });

        scheduler.flush();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_cancels_itself() {
        let (scheduler, _) = counting_scheduler(NEVER);

        let slot: Arc<Mutex<Option<FlushHook>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let hook = {
            let slot = Arc::clone(&slot);
            let calls = Arc::clone(&calls);
            scheduler.every_flush(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(hook) = slot.lock().take() {
                    hook.cancel();
                }
            })
        };
        *slot.lock() = Some(hook);

        scheduler.flush();
        scheduler.flush();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flush_from_hook() {
        let scheduler = Arc::new(counting_scheduler(NEVER).0);

        let inner = Arc::downgrade(&scheduler);
        let hook = scheduler.every_flush(move || {
            if let Some(scheduler) = inner.upgrade() {
                scheduler.flush();
            }
        });

        scheduler.flush();
        hook.cancel();
    }

    #[test]
    fn test_close_runs_final_cycle() {
        let (scheduler, cycles) = counting_scheduler(NEVER);

        scheduler.close();
        assert_eq!(cycles.load(Ordering::SeqCst), 1);

        scheduler.flush();
        scheduler.close();
        assert_eq!(cycles.load(Ordering::SeqCst), 1);
    }
}
