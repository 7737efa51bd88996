//! Removes obsolete builds and uploads, remotely and locally.
//!
//! Per image the two newest READY builds are kept, and per (image, provider)
//! the two newest READY uploads. Everything else is marked DELETING, removed
//! from the provider, and finally dropped from the store. Local files are
//! removed only after the build record is DELETING, and the record only after
//! the files are gone.

use crate::config::{BuilderConfig, Provider};
use crate::dib_file::delete_local_build;
use crate::model::{BuildState, ImageBuild, ImageUpload, UploadState};
use crate::store::is_lock_contention;
use crate::worker::{StopSignal, Worker, WorkerContext};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

const KEEP_BUILDS: usize = 2;
const KEEP_UPLOADS: usize = 2;

#[derive(Debug, Clone, PartialEq)]
struct RecentUpload {
    build_id: String,
    upload_id: String,
    state_time: f64,
}

/// image -> provider -> newest READY uploads across READY builds.
type RecencyTable = BTreeMap<String, BTreeMap<String, Vec<RecentUpload>>>;

#[derive(Debug)]
pub struct CleanupWorker {
    name: String,
    context: WorkerContext,
    stop: StopSignal,
    interval: Duration,
    recency: RecencyTable,
}

impl CleanupWorker {
    pub fn new(index: usize, context: WorkerContext, stop: StopSignal) -> Self {
        Self {
            name: format!("CleanupWorker.{index}"),
            context,
            stop,
            interval: Duration::from_secs(60),
            recency: RecencyTable::new(),
        }
    }

    /// One full cleanup pass over every image in the store.
    pub fn cleanup(&mut self, config: &BuilderConfig) -> Result<()> {
        let image_names = self.context.images.get_image_names()?;
        self.build_recency_table()?;
        for image in image_names {
            if self.stop.is_stopped() || !self.context.images.is_connected() {
                return Ok(());
            }
            if let Err(err) = self.cleanup_image(config, &image) {
                tracing::error!(image = %image, error = %format!("{err:#}"),
                    "exception cleaning up image");
            }
        }
        Ok(())
    }

    fn build_recency_table(&mut self) -> Result<()> {
        let images = &self.context.images;
        let mut table = RecencyTable::new();
        for image in images.get_image_names()? {
            let providers = table.entry(image.clone()).or_default();
            for build in images.get_builds(&image, &[BuildState::Ready])? {
                for provider in images.get_build_providers(&image, &build.id)? {
                    let recent = images.get_most_recent_build_image_uploads(
                        KEEP_UPLOADS,
                        &image,
                        &build.id,
                        &provider,
                        UploadState::Ready,
                    )?;
                    providers
                        .entry(provider)
                        .or_default()
                        .extend(recent.into_iter().map(|upload| RecentUpload {
                            build_id: build.id.clone(),
                            upload_id: upload.id,
                            state_time: upload.state_time,
                        }));
                }
            }
        }
        for uploads in table.values_mut().flat_map(|p| p.values_mut()) {
            uploads.sort_by(|a, b| b.state_time.total_cmp(&a.state_time));
            uploads.truncate(KEEP_UPLOADS);
        }
        self.recency = table;
        Ok(())
    }

    fn is_recent_upload(&self, upload: &ImageUpload) -> bool {
        self.recency
            .get(&upload.image_name)
            .and_then(|providers| providers.get(&upload.provider_name))
            .is_some_and(|recent| {
                recent
                    .iter()
                    .any(|r| r.build_id == upload.build_id && r.upload_id == upload.id)
            })
    }

    /// Recency against the store right now, not the table from pass start.
    fn is_currently_recent(&self, upload: &ImageUpload) -> Result<bool> {
        let current = self.context.images.get_most_recent_image_uploads(
            KEEP_UPLOADS,
            &upload.image_name,
            &upload.provider_name,
            UploadState::Ready,
        )?;
        Ok(current
            .iter()
            .any(|u| u.build_id == upload.build_id && u.id == upload.id))
    }

    fn in_progress_upload(&self, upload: &ImageUpload) -> Result<bool> {
        if upload.state != UploadState::Uploading {
            return Ok(false);
        }
        match self.context.images.image_upload_lock(
            &upload.image_name,
            &upload.build_id,
            &upload.provider_name,
            false,
        ) {
            Ok(_lock) => Ok(false),
            Err(err) if is_lock_contention(&err) => Ok(true),
            Err(err) => Err(err),
        }
    }

    fn in_progress_build(&self, build: &ImageBuild) -> Result<bool> {
        if build.state != BuildState::Building {
            return Ok(false);
        }
        let images = &self.context.images;
        let _lock = match images.image_build_lock(&build.image_name, false) {
            Ok(lock) => lock,
            Err(err) if is_lock_contention(&err) => return Ok(true),
            Err(err) => return Err(err),
        };
        // A changed state means the build moved on since it was listed; look
        // at it again next pass.
        match images.get_build(&build.image_name, &build.id)? {
            Some(current) => Ok(current.state != BuildState::Building),
            None => Ok(false),
        }
    }

    /// Mark an upload DELETING, delete it remotely, then drop its record.
    fn delete_upload(&self, config: &BuilderConfig, upload: &ImageUpload) -> Result<()> {
        let images = &self.context.images;
        let mut upload = upload.clone();
        if upload.state != UploadState::Deleting {
            if self.in_progress_upload(&upload)? {
                return Ok(());
            }
            let _lock = match images.image_upload_number_lock(
                &upload.image_name,
                &upload.build_id,
                &upload.provider_name,
                &upload.id,
                false,
            ) {
                Ok(lock) => lock,
                Err(err) if is_lock_contention(&err) => {
                    tracing::debug!(upload = %upload.id, "unable to lock image upload");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            // The listing may be stale; an upload that finished since then
            // carries an external id the snapshot lacks.
            let Some(fresh) = images.get_image_upload(
                &upload.image_name,
                &upload.build_id,
                &upload.provider_name,
                &upload.id,
            )?
            else {
                return Ok(());
            };
            if fresh.state != upload.state {
                tracing::debug!(upload = %upload.id, was = %upload.state, now = %fresh.state,
                    "image upload changed state; skipping");
                return Ok(());
            }
            if fresh.state == UploadState::Ready && self.is_currently_recent(&fresh)? {
                return Ok(());
            }
            upload = fresh;
            upload.state = UploadState::Deleting;
            images.store_image_upload(
                &upload.image_name,
                &upload.build_id,
                &upload.provider_name,
                &upload,
                Some(&upload.id),
            )?;
        }

        let Some(provider) = config.provider(&upload.provider_name) else {
            tracing::warn!(provider = %upload.provider_name, upload = %upload.id,
                "provider no longer configured; leaving upload marked deleting");
            return Ok(());
        };
        if let Some(external_id) = &upload.external_id {
            let external_name = upload.external_name.as_deref().unwrap_or_default();
            tracing::info!(image = %upload.image_name, build = %upload.build_id,
                provider = %provider.name, external_id = %external_id,
                "deleting image from provider");
            let deleted = self
                .context
                .providers
                .manager(provider)
                .and_then(|manager| manager.delete_image(external_name, external_id));
            if let Err(err) = deleted {
                tracing::error!(provider = %provider.name, external_name,
                    error = %format!("{err:#}"), "unable to delete image from provider");
                return Ok(());
            }
        }

        match images.image_upload_number_lock(
            &upload.image_name,
            &upload.build_id,
            &upload.provider_name,
            &upload.id,
            false,
        ) {
            Ok(_lock) => images.delete_upload(
                &upload.image_name,
                &upload.build_id,
                &upload.provider_name,
                &upload.id,
            ),
            Err(err) if is_lock_contention(&err) => {
                tracing::debug!(upload = %upload.id, "unable to lock image upload");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Delete uploads of a build that the provider no longer lists.
    fn cleanup_obsolete_provider_uploads(
        &self,
        config: &BuilderConfig,
        provider: &Provider,
        image: &str,
        build_id: &str,
    ) -> Result<()> {
        if provider.diskimage(image).is_some() {
            return Ok(());
        }
        for upload in self
            .context
            .images
            .get_uploads(image, build_id, &provider.name, &[])?
        {
            tracing::debug!(image, build = build_id, provider = %provider.name,
                upload = %upload.id, "deleting obsolete image upload");
            self.delete_upload(config, &upload)?;
        }
        Ok(())
    }

    /// Remove failed, orphaned and pending-delete uploads of a kept build.
    fn cleanup_current_provider_uploads(
        &self,
        config: &BuilderConfig,
        provider: &str,
        image: &str,
        build_id: &str,
    ) -> Result<()> {
        let images = &self.context.images;
        let cruft = images.get_uploads(
            image,
            build_id,
            provider,
            &[UploadState::Uploading, UploadState::Deleting, UploadState::Failed],
        )?;
        for upload in cruft {
            match upload.state {
                UploadState::Uploading => {
                    if self.in_progress_upload(&upload)? {
                        continue;
                    }
                    // The upload may have finished between listing and the lock check.
                    let Some(current) = images.get_image_upload(image, build_id, provider, &upload.id)?
                    else {
                        tracing::warn!(upload = %upload.id, "ignoring invalid or empty image upload");
                        continue;
                    };
                    if current.state != upload.state {
                        continue;
                    }
                    tracing::debug!(image, build = build_id, provider, upload = %upload.id,
                        "removing orphaned upload record");
                    images.delete_upload(image, build_id, provider, &upload.id)?;
                }
                UploadState::Deleting | UploadState::Failed => {
                    tracing::debug!(image, build = build_id, provider, upload = %upload.id,
                        state = %upload.state, "removing upload and record");
                    self.delete_upload(config, &upload)?;
                }
                UploadState::Ready => {}
            }
        }
        Ok(())
    }

    /// Delete every upload of a build that is not among the recent ones.
    fn cleanup_provider(
        &self,
        config: &BuilderConfig,
        provider: &Provider,
        image: &str,
        build_id: &str,
    ) -> Result<()> {
        for upload in self
            .context
            .images
            .get_uploads(image, build_id, &provider.name, &[])?
        {
            if self.is_recent_upload(&upload) {
                continue;
            }
            if upload.state == UploadState::Ready && self.is_currently_recent(&upload)? {
                continue;
            }
            tracing::debug!(image, build = build_id, provider = %provider.name,
                upload = %upload.id, "deleting non-recent image upload");
            self.delete_upload(config, &upload)?;
        }
        Ok(())
    }

    fn cleanup_image(&self, config: &BuilderConfig, image: &str) -> Result<()> {
        let images = &self.context.images;
        let builder_id = &self.context.builder_id;
        let all_builds = images.get_builds(image, &[])?;

        let mut ready: Vec<&ImageBuild> = all_builds
            .iter()
            .filter(|b| b.state == BuildState::Ready)
            .collect();
        ready.sort_by(|a, b| b.state_time.total_cmp(&a.state_time));
        let mut keep: BTreeSet<&str> = ready
            .iter()
            .take(KEEP_BUILDS)
            .map(|b| b.id.as_str())
            .collect();
        let local: BTreeSet<&str> = all_builds
            .iter()
            .filter(|b| b.is_local_to(builder_id))
            .map(|b| b.id.as_str())
            .collect();

        let diskimage = config.diskimage(image);
        if diskimage.is_none() && local.is_empty() {
            return Ok(());
        }
        if diskimage.map_or(true, |d| d.formats.is_empty()) {
            keep.retain(|id| !local.contains(id));
        }

        let managed: Vec<&Provider> = config.providers.iter().filter(|p| p.manage_images).collect();

        for build in &all_builds {
            for provider in &managed {
                let result = self
                    .cleanup_obsolete_provider_uploads(config, provider, image, &build.id)
                    .and_then(|()| {
                        if keep.contains(build.id.as_str()) {
                            self.cleanup_current_provider_uploads(config, &provider.name, image, &build.id)
                        } else {
                            Ok(())
                        }
                    });
                if let Err(err) = result {
                    tracing::error!(image, build = %build.id, provider = %provider.name,
                        error = %format!("{err:#}"), "exception cleaning up uploads");
                }
            }

            if build.state != BuildState::Deleting
                && (keep.contains(build.id.as_str()) || self.in_progress_build(build)?)
            {
                continue;
            }

            for provider in &managed {
                if let Err(err) = self.cleanup_provider(config, provider, image, &build.id) {
                    tracing::error!(image, build = %build.id, provider = %provider.name,
                        error = %format!("{err:#}"), "exception cleaning up build");
                }
            }

            let mut uploads = Vec::new();
            for provider in images.get_build_providers(image, &build.id)? {
                uploads.extend(images.get_uploads(image, &build.id, &provider, &[])?);
            }
            let all_deleting = uploads.iter().all(|u| u.state == UploadState::Deleting);
            let is_local = build.is_local_to(builder_id);

            // Local files go as soon as every upload is on its way out.
            if all_deleting && is_local {
                if build.state != BuildState::Deleting {
                    let _lock = match images.image_build_number_lock(image, &build.id, false) {
                        Ok(lock) => lock,
                        Err(err) if is_lock_contention(&err) => continue,
                        Err(err) => return Err(err),
                    };
                    let mut deleting = build.clone();
                    deleting.state = BuildState::Deleting;
                    images.store_build(image, &deleting, Some(&build.id))?;
                }
                delete_local_build(&config.images_dir, image, &build.id)?;
            }

            if uploads.is_empty() && is_local && !images.delete_build(image, &build.id)? {
                tracing::error!(image, build = %build.id,
                    "unable to delete build because uploads still remain");
            }
        }
        Ok(())
    }
}

impl Worker for CleanupWorker {
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
        self.interval = config.builder.cleanup_interval();
        self.cleanup(&config)
    }
}
