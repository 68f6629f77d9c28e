//! Host for one scheduler instance on a dedicated thread.
//!
//! `run` starts the context thread: it installs the scheduler, spawns the
//! `"io_loop"` fiber that drives the reactor, and then runs the dispatcher
//! on the thread's own frame until every fiber has terminated. The call
//! returns once the startup task has run inside the reactor, so callers can
//! immediately submit work.
//!
//! Parallelism comes from running one `IoContext` per OS thread; instances
//! share no scheduler state. Cross-thread submission goes through the
//! reactor's thread-safe `post`, or through [`spawn_fiber`](IoContext::spawn_fiber).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::Cancellable;
use crate::config::SchedulerConfig;
use crate::error::Error;
use crate::reactor::Reactor;
use crate::runtime::{self, JoinHandle, RuntimeShared, SpawnOptions};
use crate::sched::{self, MAIN_NICE_LEVEL};
use crate::sync::BlockingCounter;
use crate::tracing_compat::{debug, error, trace};
use crate::types::FiberKind;

struct CancellableEntry {
    work: Arc<dyn Cancellable>,
    joiner: JoinHandle,
}

/// Scheduler statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Times the loop fiber was forcibly resumed by the switch bound.
    pub main_resumes: u64,
    /// Ready worker fibers at the time of the snapshot.
    pub ready_fibers: usize,
}

/// One scheduler instance bound to one OS thread.
pub struct IoContext {
    reactor: Reactor,
    config: SchedulerConfig,
    rt: Mutex<Option<Arc<RuntimeShared>>>,
    host: Mutex<Option<std::thread::JoinHandle<()>>>,
    cancellables: Mutex<Vec<CancellableEntry>>,
}

impl IoContext {
    /// Creates a context with its own reactor.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            reactor: Reactor::new(),
            config,
            rt: Mutex::new(None),
            host: Mutex::new(None),
            cancellables: Mutex::new(Vec::new()),
        }
    }

    /// Starts the context thread and blocks until its reactor loop is live.
    pub fn run(&self) -> Result<(), Error> {
        let mut host = self.host.lock();
        if host.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let rt = RuntimeShared::new(self.reactor.clone(), self.config.clone());
        *self.rt.lock() = Some(Arc::clone(&rt));

        let started = BlockingCounter::new(1);
        let thread_started = started.clone();
        let reactor = self.reactor.clone();
        let cleanup_passes = self.config.cleanup_passes;
        let spawned = std::thread::Builder::new()
            .name("io_context".to_string())
            .spawn(move || start_loop(&rt, &reactor, thread_started, cleanup_passes));
        match spawned {
            Ok(handle) => *host = Some(handle),
            Err(err) => {
                *self.rt.lock() = None;
                return Err(err.into());
            }
        }
        drop(host);

        started.wait();
        Ok(())
    }

    /// Enqueues `handler` to run in the context thread's reactor.
    /// Thread-safe; usable before `run`, in which case the handler runs once
    /// the loop starts.
    pub fn post<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reactor.post(handler);
    }

    /// Spawns a fiber scheduled by this context.
    pub fn spawn_fiber<F>(&self, options: SpawnOptions, body: F) -> Result<JoinHandle, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let rt = self.rt.lock().clone().ok_or(Error::NotStarted)?;
        rt.spawn(FiberKind::Worker, options, Box::new(body))
    }

    /// Registers `work` for orderly shutdown and spawns its worker fiber.
    ///
    /// At [`stop`](Self::stop) time every registration is cancelled and its
    /// worker joined before the reactor is stopped.
    pub fn attach_cancellable(&self, work: Arc<dyn Cancellable>) -> Result<(), Error> {
        let body = Arc::clone(&work);
        let joiner = self.spawn_fiber(SpawnOptions::new().name("cancellable"), move || {
            body.run();
        })?;
        self.cancellables.lock().push(CancellableEntry { work, joiner });
        Ok(())
    }

    /// Whether the calling thread belongs to this context (the context
    /// thread itself or any of its fiber threads).
    #[must_use]
    pub fn in_context_thread(&self) -> bool {
        self.rt
            .lock()
            .as_ref()
            .is_some_and(|rt| rt.on_context_thread())
    }

    /// Scheduler statistics snapshot.
    ///
    /// # Errors
    ///
    /// Fails before `run`.
    pub fn stats(&self) -> Result<SchedulerStats, Error> {
        let rt = self.rt.lock().clone().ok_or(Error::NotStarted)?;
        Ok(SchedulerStats {
            main_resumes: rt.main_resumes(),
            ready_fibers: rt.active_fiber_count(),
        })
    }

    /// Shuts the context down: cancels registered work, joins its workers,
    /// stops the reactor and joins the context thread.
    ///
    /// Must be called from outside the context; calling it from one of the
    /// context's own fibers would deadlock on the join.
    pub fn stop(&self) {
        let entries: Vec<_> = {
            let mut cancellables = self.cancellables.lock();
            cancellables.drain(..).collect()
        };

        if !entries.is_empty() {
            debug!(count = entries.len(), "cancelling registered work");
            let cancel_done = BlockingCounter::new(entries.len());
            for entry in &entries {
                let work = Arc::clone(&entry.work);
                let done = cancel_done.clone();
                let spawned = self.spawn_fiber(SpawnOptions::new().name("cancel"), move || {
                    work.cancel();
                    done.dec();
                });
                if spawned.is_err() {
                    // Context never started; the worker fiber never ran
                    // either, so there is nothing to cancel.
                    cancel_done.dec();
                }
            }
            cancel_done.wait();
            for entry in entries {
                entry.joiner.join();
            }
        }

        self.reactor.stop();
        if let Some(host) = self.host.lock().take() {
            if host.join().is_err() {
                error!("io context thread panicked");
            }
        }
        debug!("io context stopped");
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        let running = self.host.lock().is_some();
        if running {
            self.stop();
        }
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("running", &self.host.lock().is_some())
            .finish_non_exhaustive()
    }
}

/// Body of the context thread.
fn start_loop(
    rt: &Arc<RuntimeShared>,
    reactor: &Reactor,
    started: BlockingCounter,
    cleanup_passes: u32,
) {
    let loop_rt = Arc::clone(rt);
    let loop_reactor = reactor.clone();
    let startup = started.clone();
    let spawned = rt.spawn(
        FiberKind::Main,
        SpawnOptions::new().name("io_loop").nice_level(MAIN_NICE_LEVEL),
        Box::new(move || {
            // The startup task signals the caller from inside the reactor:
            // by the time it runs, the loop is demonstrably turning.
            loop_reactor.post(move || startup.dec());

            sched::main_loop::run(&loop_rt);

            // Drain stragglers: handlers admitted by restart() during the
            // first pass are caught by the second.
            for pass in 0..cleanup_passes {
                trace!(pass, "cleanup drain");
                while loop_reactor.poll() > 0 || loop_rt.has_ready_fibers() {
                    runtime::yield_now();
                }
                loop_reactor.restart();
            }

            debug!(resumes = loop_rt.main_resumes(), "io loop finished");
        }),
    );

    match spawned {
        Ok(_) => rt.dispatch(),
        Err(err) => {
            error!(%err, "failed to spawn io loop fiber");
            // Unblock the caller waiting on the startup barrier.
            started.dec();
        }
    }
}
