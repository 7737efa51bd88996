//! Builder orchestrator: identity, worker startup and shutdown.

use crate::build_worker::BuildWorker;
use crate::cleanup_worker::CleanupWorker;
use crate::config::ConfigSource;
use crate::images::ImageStore;
use crate::preflight::check_builder;
use crate::provider::ProviderManagers;
use crate::store::CoordinationStore;
use crate::upload_worker::UploadWorker;
use crate::worker::{StopSignal, WorkerContext, WorkerHandle, ERROR_BACKOFF, SUSPEND_WAIT};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const BUILDER_ID_FILE: &str = "builder_id.txt";

const STARTUP_POLL: Duration = Duration::from_millis(100);

pub fn builder_id_path(images_dir: &Path) -> PathBuf {
    images_dir.join(BUILDER_ID_FILE)
}

/// Read the persisted builder identity, creating it on first start.
pub fn load_or_create_builder_id(images_dir: &Path) -> Result<String> {
    let path = builder_id_path(images_dir);
    match fs::read_to_string(&path) {
        Ok(raw) if !raw.trim().is_empty() => return Ok(raw.trim().to_string()),
        Ok(_) => tracing::warn!(path = %path.display(), "empty builder id file, regenerating"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("reading '{}'", path.display()));
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    let tmp = path.with_extension("txt.tmp");
    fs::write(&tmp, &id).with_context(|| format!("writing '{}'", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("moving '{}' -> '{}'", tmp.display(), path.display()))?;
    tracing::info!(builder_id = %id, "created builder identity");
    Ok(id)
}

#[derive(Debug)]
struct Running {
    builder_id: String,
    stop: StopSignal,
    build_workers: Vec<WorkerHandle>,
    upload_workers: Vec<WorkerHandle>,
    cleanup_worker: Option<WorkerHandle>,
}

impl Running {
    fn handles(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.build_workers
            .iter()
            .chain(&self.upload_workers)
            .chain(&self.cleanup_worker)
    }
}

/// Runs the build, upload and cleanup workers of one builder process.
#[derive(Debug)]
pub struct Builder {
    store: Arc<dyn CoordinationStore>,
    config: ConfigSource,
    providers: Arc<dyn ProviderManagers>,
    suspend_wait: Duration,
    error_backoff: Duration,
    running: Option<Running>,
}

impl Builder {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: ConfigSource,
        providers: Arc<dyn ProviderManagers>,
    ) -> Self {
        Self {
            store,
            config,
            providers,
            suspend_wait: SUSPEND_WAIT,
            error_backoff: ERROR_BACKOFF,
            running: None,
        }
    }

    pub fn with_waits(mut self, suspend_wait: Duration, error_backoff: Duration) -> Self {
        self.suspend_wait = suspend_wait;
        self.error_backoff = error_backoff;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Identity of the running builder.
    pub fn builder_id(&self) -> Option<&str> {
        self.running.as_ref().map(|r| r.builder_id.as_str())
    }

    /// Validate configuration and start every worker. Returns once all of
    /// them report running.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            bail!("builder already started");
        }
        let config = self
            .config
            .load()
            .and_then(|config| config.normalized())
            .context("loading builder config")?;
        check_builder(&config).context("builder preflight failed")?;
        let builder_id = load_or_create_builder_id(&config.images_dir)?;

        let context = WorkerContext::new(
            &builder_id,
            ImageStore::new(Arc::clone(&self.store)),
            self.config.clone(),
            Arc::clone(&self.providers),
        )
        .with_waits(self.suspend_wait, self.error_backoff);
        let stop = StopSignal::new();
        let settings = &config.builder;

        let mut running = Running {
            builder_id: builder_id.clone(),
            stop: stop.clone(),
            build_workers: Vec::new(),
            upload_workers: Vec::new(),
            cleanup_worker: None,
        };
        let spawned = (|| -> Result<()> {
            for i in 0..settings.build_workers {
                running.build_workers.push(WorkerHandle::spawn(BuildWorker::new(
                    i,
                    context.clone(),
                    stop.clone(),
                ))?);
            }
            for i in 0..settings.upload_workers {
                running.upload_workers.push(WorkerHandle::spawn(UploadWorker::new(
                    i,
                    context.clone(),
                    stop.clone(),
                ))?);
            }
            if settings.cleanup_interval_secs > 0 {
                running.cleanup_worker = Some(WorkerHandle::spawn(CleanupWorker::new(
                    0,
                    context.clone(),
                    stop.clone(),
                ))?);
            }
            Ok(())
        })();
        if let Err(err) = spawned {
            stop.stop();
            return Err(err);
        }

        // A worker that finished before ever running means its thread died.
        while !running.handles().all(WorkerHandle::is_running) {
            if let Some(dead) = running
                .handles()
                .find(|h| !h.is_running() && h.is_finished())
            {
                let name = dead.name().to_string();
                stop.stop();
                bail!("worker '{name}' exited during startup");
            }
            std::thread::sleep(STARTUP_POLL);
        }

        tracing::info!(
            builder_id = %builder_id,
            build_workers = running.build_workers.len(),
            upload_workers = running.upload_workers.len(),
            cleanup = running.cleanup_worker.is_some(),
            "builder started"
        );
        self.running = Some(running);
        Ok(())
    }

    /// Signal every worker, then wait for the build and cleanup workers.
    /// Upload workers finish their current upload on their own.
    pub fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        tracing::info!("stopping builder");
        running.stop.stop();
        for handle in &mut running.build_workers {
            handle.join();
        }
        if let Some(handle) = &mut running.cleanup_worker {
            handle.join();
        }
        tracing::info!("builder stopped");
    }
}

impl Drop for Builder {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.stop.stop();
        }
    }
}
