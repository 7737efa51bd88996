//! Builds diskimages when they age out, change formats, or are requested.

use crate::config::{BuilderConfig, DiskImage};
use crate::dib::{build_log_path, prune_build_logs, run_build, BuildOutcome, DibCommand};
use crate::dib_file::delete_local_build;
use crate::model::{BuildState, ImageBuild};
use crate::stats;
use crate::store::is_lock_contention;
use crate::worker::{StopSignal, Worker, WorkerContext};
use anyhow::{Context, Result};
use std::fs;
use std::time::{Duration, Instant};

/// Whether `latest` (the most recent READY build) is missing, too old, or
/// lacks a configured format.
pub fn needs_rebuild(image: &DiskImage, latest: Option<&ImageBuild>) -> bool {
    match latest {
        None => true,
        Some(build) => {
            build.age() >= image.rebuild_age_secs as f64 || !build.has_formats(&image.formats)
        }
    }
}

#[derive(Debug)]
pub struct BuildWorker {
    name: String,
    context: WorkerContext,
    stop: StopSignal,
    interval: Duration,
}

impl BuildWorker {
    pub fn new(index: usize, context: WorkerContext, stop: StopSignal) -> Self {
        Self {
            name: format!("BuildWorker.{index}"),
            context,
            stop,
            interval: Duration::from_secs(10),
        }
    }

    fn should_continue(&self) -> bool {
        !self.stop.is_stopped() && self.context.images.is_connected()
    }

    fn config_changed(&self, config: &BuilderConfig) -> Result<bool> {
        Ok(self.context.load_config()? != *config)
    }

    /// Scheduled rebuild check for every configured diskimage.
    pub fn check_scheduled_builds(&self, config: &BuilderConfig) -> Result<()> {
        for image in &config.diskimages {
            if !self.should_continue() || self.config_changed(config)? {
                return Ok(());
            }
            if let Err(err) = self.check_image_scheduled(config, image) {
                tracing::error!(image = %image.name, error = %format!("{err:#}"),
                    "scheduled build check failed");
            }
        }
        Ok(())
    }

    /// Manual build request check for every configured diskimage.
    pub fn check_manual_requests(&self, config: &BuilderConfig) -> Result<()> {
        for image in &config.diskimages {
            if !self.should_continue() || self.config_changed(config)? {
                return Ok(());
            }
            if let Err(err) = self.check_image_manual(config, image) {
                tracing::error!(image = %image.name, error = %format!("{err:#}"),
                    "manual build check failed");
            }
        }
        Ok(())
    }

    fn buildable(&self, image: &DiskImage) -> Result<bool> {
        if image.pause || image.formats.is_empty() {
            return Ok(false);
        }
        Ok(!self.context.images.get_image_paused(&image.name)?)
    }

    fn check_image_scheduled(
        &self,
        config: &BuilderConfig,
        image: &DiskImage,
    ) -> Result<Option<ImageBuild>> {
        if !self.buildable(image)? {
            return Ok(None);
        }
        let images = &self.context.images;
        let seen = images.get_most_recent_builds(1, &image.name, Some(BuildState::Ready))?;
        if !needs_rebuild(image, seen.first()) {
            return Ok(None);
        }

        let _lock = match images.image_build_lock(&image.name, false) {
            Ok(lock) => lock,
            Err(err) if is_lock_contention(&err) => return Ok(None),
            Err(err) => return Err(err),
        };
        // Another builder may have finished a build between the check and the lock.
        let current = images.get_most_recent_builds(1, &image.name, Some(BuildState::Ready))?;
        if current.first().map(|b| &b.id) != seen.first().map(|b| &b.id) {
            return Ok(None);
        }

        tracing::info!(image = %image.name, "building image");
        self.build(config, image).map(Some)
    }

    fn check_image_manual(
        &self,
        config: &BuilderConfig,
        image: &DiskImage,
    ) -> Result<Option<ImageBuild>> {
        if !self.buildable(image)? {
            return Ok(None);
        }
        let images = &self.context.images;
        if !images.has_build_request(&image.name)? {
            return Ok(None);
        }

        let _lock = match images.image_build_lock(&image.name, false) {
            Ok(lock) => lock,
            Err(err) if is_lock_contention(&err) => return Ok(None),
            Err(err) => return Err(err),
        };
        if !images.has_build_request(&image.name)? {
            return Ok(None);
        }

        tracing::info!(image = %image.name, "manual build request");
        let build = self.build(config, image)?;
        if build.state == BuildState::Ready {
            images.remove_build_request(&image.name)?;
        }
        Ok(Some(build))
    }

    /// Record a BUILDING build, run the tool, record the result.
    ///
    /// Must be called with the image's build lock held.
    fn build(&self, config: &BuilderConfig, image: &DiskImage) -> Result<ImageBuild> {
        let images = &self.context.images;
        let mut building = ImageBuild::new(&image.name, BuildState::Building);
        building.builder_id = Some(self.context.builder_id.clone());
        building.builder = Some(self.context.hostname.clone());
        building.formats = image.formats.clone();
        let build_id = images.store_build(&image.name, &building, None)?;
        building.id = build_id.clone();

        let mut result = match self.run_tool(config, image, &build_id) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(image = %image.name, build = %build_id,
                    error = %format!("{err:#}"), "image build failed");
                let mut failed = building.clone();
                failed.set_state(BuildState::Failed);
                failed
            }
        };
        result.id = build_id.clone();

        // A lost session means cleanup may already have removed the record.
        if let Err(err) = images.store_build(&image.name, &result, Some(&build_id)) {
            tracing::error!(image = %image.name, build = %build_id,
                error = %format!("{err:#}"), "unable to update build record");
            if let Err(err) = delete_local_build(&config.images_dir, &image.name, &build_id) {
                tracing::error!(image = %image.name, build = %build_id,
                    error = %format!("{err:#}"), "unable to remove leaked build files");
            }
            result.state = BuildState::Failed;
            return Ok(result);
        }

        Ok(images.get_build(&image.name, &build_id)?.unwrap_or(result))
    }

    fn run_tool(&self, config: &BuilderConfig, image: &DiskImage, build_id: &str) -> Result<ImageBuild> {
        let output = config.images_dir.join(format!("{}-{build_id}", image.name));
        let cmd = DibCommand::new(config, image, &output)?;

        fs::create_dir_all(&config.build_log_dir).with_context(|| {
            format!("creating build log directory '{}'", config.build_log_dir.display())
        })?;
        prune_build_logs(&config.build_log_dir, &image.name, config.build_log_retention)?;
        let log_path = build_log_path(&config.build_log_dir, &image.name, build_id);

        tracing::info!(image = %image.name, build = %build_id, command = %cmd.display(),
            log = %log_path.display(), "running build tool");
        let started = Instant::now();
        let outcome = run_build(&cmd, &log_path, image.build_timeout(), &self.stop)?;
        stats::record_build(&image.name, started.elapsed(), outcome.return_code());

        let reconnected = self.context.wait_for_connection(&self.stop);

        let mut result = ImageBuild::new(&image.name, BuildState::Failed);
        result.builder_id = Some(self.context.builder_id.clone());
        result.builder = Some(self.context.hostname.clone());
        result.username = Some(image.username.clone());
        result.python_path = Some(image.python_path.clone());
        result.shell_type = image.shell_type.clone();

        let backend = self.context.images.backend();
        if backend.did_lose_connection() {
            tracing::info!(image = %image.name, build = %build_id,
                "coordination store session lost while building");
            backend.reset_lost_flag();
        } else if !reconnected {
            tracing::info!(image = %image.name, build = %build_id,
                "stopped while the coordination store was unavailable");
        } else if outcome.succeeded() {
            tracing::info!(image = %image.name, build = %build_id, "image is built");
            result.set_state(BuildState::Ready);
            result.formats = image.formats.clone();
            for format in &image.formats {
                let file = config.images_dir.join(format!("{}-{build_id}.{format}", image.name));
                if let Err(err) = stats::record_image_size(&image.name, format, &file) {
                    tracing::warn!(image = %image.name, file = %file.display(), error = %err,
                        "unable to measure built image");
                }
            }
        } else {
            match outcome {
                BuildOutcome::TimedOut => tracing::error!(image = %image.name,
                    build = %build_id, log = %log_path.display(), "build timed out"),
                other => tracing::info!(image = %image.name, build = %build_id,
                    outcome = ?other, "build tool failed"),
            }
        }
        Ok(result)
    }
}

impl Worker for BuildWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn context(&self) -> &WorkerContext {
        &self.context
    }

    fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run_once(&mut self) -> Result<()> {
        let config = self.context.load_config()?;
        self.interval = config.builder.build_interval();
        self.check_scheduled_builds(&config)?;
        self.check_manual_requests(&config)
    }
}
