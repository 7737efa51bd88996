//! Shared worker plumbing: context, stop signal and the thread loop.
//!
//! Every worker runs on its own thread. A pass starts only while the store is
//! connected; between passes the thread sleeps on its [`StopSignal`] so that
//! shutdown interrupts the wait.

use crate::config::{BuilderConfig, ConfigSource};
use crate::images::ImageStore;
use crate::provider::ProviderManagers;
use anyhow::{Context, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Poll interval while the store is suspended or lost.
pub const SUSPEND_WAIT: Duration = Duration::from_secs(30);
/// Pause after a pass fails with an error.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// Cooperative stop flag that sleepers can wait on.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSignal")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`. Returns true if stopped.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            stopped = cvar
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *stopped
    }
}

/// State shared by every worker of one builder process.
#[derive(Clone)]
pub struct WorkerContext {
    pub builder_id: String,
    pub hostname: String,
    pub images: ImageStore,
    pub config: ConfigSource,
    pub providers: Arc<dyn ProviderManagers>,
    pub suspend_wait: Duration,
    pub error_backoff: Duration,
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("builder_id", &self.builder_id)
            .field("hostname", &self.hostname)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkerContext {
    pub fn new(
        builder_id: &str,
        images: ImageStore,
        config: ConfigSource,
        providers: Arc<dyn ProviderManagers>,
    ) -> Self {
        Self {
            builder_id: builder_id.to_string(),
            hostname: hostname(),
            images,
            config,
            providers,
            suspend_wait: SUSPEND_WAIT,
            error_backoff: ERROR_BACKOFF,
        }
    }

    /// Shorten the suspend poll and error backoff (tests, embedders).
    pub fn with_waits(mut self, suspend_wait: Duration, error_backoff: Duration) -> Self {
        self.suspend_wait = suspend_wait;
        self.error_backoff = error_backoff;
        self
    }

    pub fn load_config(&self) -> Result<BuilderConfig> {
        self.config.load().context("reloading builder config")
    }

    /// Block while the store is suspended or lost. Returns false if the
    /// worker was stopped while waiting.
    pub fn wait_for_connection(&self, stop: &StopSignal) -> bool {
        if self.images.is_connected() {
            return !stop.is_stopped();
        }
        tracing::info!("coordination store unavailable, waiting");
        while !self.images.is_connected() {
            if stop.wait(self.suspend_wait) {
                return false;
            }
        }
        tracing::info!("coordination store available, resuming");
        !stop.is_stopped()
    }
}

/// Local hostname, recorded on builds as the producing host.
pub fn hostname() -> String {
    let name = gethostname::gethostname().to_string_lossy().into_owned();
    if name.is_empty() {
        return "localhost".to_string();
    }
    name
}

/// One kind of worker loop body.
pub trait Worker: Send + 'static {
    /// Thread and span name, e.g. `BuildWorker.0`.
    fn name(&self) -> &str;

    fn context(&self) -> &WorkerContext;

    fn stop_signal(&self) -> &StopSignal;

    /// Wait between passes, taken from the last loaded configuration.
    fn interval(&self) -> Duration;

    /// Run one pass.
    fn run_once(&mut self) -> Result<()>;
}

/// A worker running on its own thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    stop: StopSignal,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn<W: Worker>(worker: W) -> Result<Self> {
        let name = worker.name().to_string();
        let stop = worker.stop_signal().clone();
        let running = Arc::new(AtomicBool::new(false));
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn({
                let running = Arc::clone(&running);
                move || run_loop(worker, &running)
            })
            .with_context(|| format!("spawning worker thread '{name}'"))?;
        Ok(Self {
            name,
            stop,
            running,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the thread has exited (or was never started).
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

fn run_loop<W: Worker>(mut worker: W, running: &AtomicBool) {
    let span = tracing::info_span!("worker", name = %worker.name());
    let _entered = span.enter();
    let stop = worker.stop_signal().clone();
    let context = worker.context().clone();

    running.store(true, Ordering::SeqCst);
    tracing::info!("worker started");
    while !stop.is_stopped() {
        if !context.wait_for_connection(&stop) {
            break;
        }
        if let Err(err) = worker.run_once() {
            tracing::error!(error = %format!("{err:#}"), "worker pass failed");
            if stop.wait(context.error_backoff) {
                break;
            }
        }
        if stop.wait(worker.interval()) {
            break;
        }
    }
    running.store(false, Ordering::SeqCst);
    tracing::info!("worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::CommandProviders;
    use crate::store::{ConnectionState, MemoryStore};
    use std::sync::atomic::AtomicUsize;

    fn context(store: &MemoryStore) -> WorkerContext {
        let config = BuilderConfig::from_toml_str(
            "images_dir = \"/tmp/images\"\n[store]\nroot = \"/tmp/store\"\n",
        )
        .unwrap();
        WorkerContext::new(
            "builder-1",
            ImageStore::new(Arc::new(store.clone())),
            ConfigSource::shared(config),
            Arc::new(CommandProviders),
        )
        .with_waits(Duration::from_millis(10), Duration::from_millis(10))
    }

    struct Counting {
        context: WorkerContext,
        stop: StopSignal,
        passes: Arc<AtomicUsize>,
    }

    impl Worker for Counting {
        fn name(&self) -> &str {
            "Counting.0"
        }
        fn context(&self) -> &WorkerContext {
            &self.context
        }
        fn stop_signal(&self) -> &StopSignal {
            &self.stop
        }
        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }
        fn run_once(&mut self) -> Result<()> {
            let n = self.passes.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                anyhow::bail!("first pass fails");
            }
            Ok(())
        }
    }

    #[test]
    fn stop_wakes_waiters() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            std::thread::spawn(move || stop.wait(Duration::from_secs(30)))
        };
        stop.stop();
        assert!(waiter.join().unwrap());
        assert!(!StopSignal::new().wait(Duration::from_millis(1)));
    }

    #[test]
    fn loop_survives_errors_and_pauses_while_disconnected() {
        let store = MemoryStore::new();
        let passes = Arc::new(AtomicUsize::new(0));
        let mut handle = WorkerHandle::spawn(Counting {
            context: context(&store),
            stop: StopSignal::new(),
            passes: Arc::clone(&passes),
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while passes.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_running());
        assert!(passes.load(Ordering::SeqCst) >= 3);

        store.set_connection_state(ConnectionState::Suspended);
        std::thread::sleep(Duration::from_millis(50));
        let paused_at = passes.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert!(passes.load(Ordering::SeqCst) <= paused_at + 1);

        store.set_connection_state(ConnectionState::Connected);
        handle.stop();
        handle.join();
        assert!(!handle.is_running());
        assert!(handle.is_finished());
    }

    #[test]
    fn hostname_is_not_empty() {
        assert!(!hostname().is_empty());
    }
}
