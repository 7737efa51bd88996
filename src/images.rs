//! Image bookkeeping on top of a [`CoordinationStore`].
//!
//! Path layout:
//!
//! ```text
//! images/{image}
//! images/{image}/pause
//! images/{image}/request-build
//! images/{image}/builds/{build}
//! images/{image}/builds/{build}/providers/{provider}/images/{upload}
//! ```
//!
//! Lock names: the build lock is `images/{image}/builds`, the build-number
//! lock is the build record's path, the upload lock is
//! `.../providers/{provider}/images` and the upload-number lock is the upload
//! record's path.

use crate::model::{BuildState, ImageBuild, ImageUpload, UploadState};
use crate::store::{join_path, CoordinationStore, LockGuard};
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use std::cmp::Ordering;
use std::sync::Arc;

const ROOT: &str = "images";
const PAUSE: &str = "pause";
const REQUEST_BUILD: &str = "request-build";
const BUILDS: &str = "builds";
const PROVIDERS: &str = "providers";
const UPLOADS: &str = "images";

/// Typed access to builds, uploads, pause flags and build requests.
#[derive(Debug, Clone)]
pub struct ImageStore {
    store: Arc<dyn CoordinationStore>,
}

fn builds_path(image: &str) -> String {
    join_path(&[ROOT, image, BUILDS])
}

fn build_path(image: &str, build_id: &str) -> String {
    join_path(&[ROOT, image, BUILDS, build_id])
}

fn providers_path(image: &str, build_id: &str) -> String {
    join_path(&[ROOT, image, BUILDS, build_id, PROVIDERS])
}

fn uploads_path(image: &str, build_id: &str, provider: &str) -> String {
    join_path(&[ROOT, image, BUILDS, build_id, PROVIDERS, provider, UPLOADS])
}

fn upload_path(image: &str, build_id: &str, provider: &str, upload_id: &str) -> String {
    join_path(&[
        ROOT, image, BUILDS, build_id, PROVIDERS, provider, UPLOADS, upload_id,
    ])
}

fn last_segment(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn newest_first(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

impl ImageStore {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub fn backend(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    fn read_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(record) = self
            .store
            .read_record(path)
            .with_context(|| format!("reading record '{path}'"))?
        else {
            return Ok(None);
        };
        // Parents created implicitly are empty.
        if record.data.is_empty() {
            return Ok(None);
        }
        match serde_json::from_slice(&record.data) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                tracing::warn!(path, error = %err, "skipping unparseable record");
                Ok(None)
            }
        }
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        self.store
            .list_children(path)
            .with_context(|| format!("listing children of '{path}'"))
    }

    // Images

    pub fn get_image_names(&self) -> Result<Vec<String>> {
        self.children(ROOT)
    }

    pub fn get_image_paused(&self, image: &str) -> Result<bool> {
        let path = join_path(&[ROOT, image, PAUSE]);
        self.store
            .exists(&path)
            .with_context(|| format!("reading pause flag for '{image}'"))
    }

    pub fn set_image_paused(&self, image: &str, paused: bool) -> Result<()> {
        let path = join_path(&[ROOT, image, PAUSE]);
        if paused {
            if !self.store.exists(&path)? {
                self.store
                    .create_record(&path, b"", false)
                    .with_context(|| format!("pausing image '{image}'"))?;
            }
        } else {
            self.store
                .delete_record(&path, false)
                .with_context(|| format!("unpausing image '{image}'"))?;
        }
        Ok(())
    }

    pub fn has_build_request(&self, image: &str) -> Result<bool> {
        let path = join_path(&[ROOT, image, REQUEST_BUILD]);
        self.store
            .exists(&path)
            .with_context(|| format!("reading build request for '{image}'"))
    }

    pub fn submit_build_request(&self, image: &str) -> Result<()> {
        let path = join_path(&[ROOT, image, REQUEST_BUILD]);
        if self.store.exists(&path)? {
            return Ok(());
        }
        match self.store.create_record(&path, b"", false) {
            Ok(_) | Err(crate::store::StoreError::AlreadyExists { .. }) => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("submitting build request for '{image}'"))
            }
        }
    }

    pub fn remove_build_request(&self, image: &str) -> Result<()> {
        let path = join_path(&[ROOT, image, REQUEST_BUILD]);
        self.store
            .delete_record(&path, false)
            .with_context(|| format!("removing build request for '{image}'"))
    }

    // Builds

    pub fn get_build_ids(&self, image: &str) -> Result<Vec<String>> {
        self.children(&builds_path(image))
    }

    pub fn get_build(&self, image: &str, build_id: &str) -> Result<Option<ImageBuild>> {
        let build: Option<ImageBuild> = self.read_json(&build_path(image, build_id))?;
        Ok(build.map(|mut build| {
            build.id = build_id.to_string();
            build.image_name = image.to_string();
            build
        }))
    }

    /// Builds of `image` in any of `states`; every build when `states` is empty.
    pub fn get_builds(&self, image: &str, states: &[BuildState]) -> Result<Vec<ImageBuild>> {
        let mut builds = Vec::new();
        for build_id in self.get_build_ids(image)? {
            if let Some(build) = self.get_build(image, &build_id)? {
                if states.is_empty() || states.contains(&build.state) {
                    builds.push(build);
                }
            }
        }
        Ok(builds)
    }

    /// Up to `count` builds ordered by newest `state_time`.
    pub fn get_most_recent_builds(
        &self,
        count: usize,
        image: &str,
        state: Option<BuildState>,
    ) -> Result<Vec<ImageBuild>> {
        let states: Vec<BuildState> = state.into_iter().collect();
        let mut builds = self.get_builds(image, &states)?;
        builds.sort_by(|a, b| newest_first(a.state_time, b.state_time));
        builds.truncate(count);
        Ok(builds)
    }

    /// Create (`build_id` = None) or overwrite a build record. Returns the id.
    pub fn store_build(
        &self,
        image: &str,
        build: &ImageBuild,
        build_id: Option<&str>,
    ) -> Result<String> {
        let data = serde_json::to_vec(build).context("serializing build record")?;
        match build_id {
            None => {
                let path = self
                    .store
                    .create_record(&builds_path(image), &data, true)
                    .with_context(|| format!("creating build record for '{image}'"))?;
                Ok(last_segment(&path))
            }
            Some(build_id) => {
                let path = build_path(image, build_id);
                self.store
                    .update_record(&path, &data, None)
                    .with_context(|| format!("updating build record '{path}'"))?;
                Ok(build_id.to_string())
            }
        }
    }

    /// Delete a build record. Returns false while any upload record remains.
    pub fn delete_build(&self, image: &str, build_id: &str) -> Result<bool> {
        for provider in self.get_build_providers(image, build_id)? {
            if !self.get_upload_ids(image, build_id, &provider)?.is_empty() {
                return Ok(false);
            }
        }
        let path = build_path(image, build_id);
        self.store
            .delete_record(&path, true)
            .with_context(|| format!("deleting build record '{path}'"))?;
        Ok(true)
    }

    // Uploads

    pub fn get_build_providers(&self, image: &str, build_id: &str) -> Result<Vec<String>> {
        self.children(&providers_path(image, build_id))
    }

    pub fn get_upload_ids(&self, image: &str, build_id: &str, provider: &str) -> Result<Vec<String>> {
        self.children(&uploads_path(image, build_id, provider))
    }

    pub fn get_image_upload(
        &self,
        image: &str,
        build_id: &str,
        provider: &str,
        upload_id: &str,
    ) -> Result<Option<ImageUpload>> {
        let upload: Option<ImageUpload> =
            self.read_json(&upload_path(image, build_id, provider, upload_id))?;
        Ok(upload.map(|mut upload| {
            upload.id = upload_id.to_string();
            upload.build_id = build_id.to_string();
            upload.image_name = image.to_string();
            upload.provider_name = provider.to_string();
            upload
        }))
    }

    /// Uploads of a build to `provider` in any of `states`; all when empty.
    pub fn get_uploads(
        &self,
        image: &str,
        build_id: &str,
        provider: &str,
        states: &[UploadState],
    ) -> Result<Vec<ImageUpload>> {
        let mut uploads = Vec::new();
        for upload_id in self.get_upload_ids(image, build_id, provider)? {
            if let Some(upload) = self.get_image_upload(image, build_id, provider, &upload_id)? {
                if states.is_empty() || states.contains(&upload.state) {
                    uploads.push(upload);
                }
            }
        }
        Ok(uploads)
    }

    /// Up to `count` uploads of one build, newest first.
    pub fn get_most_recent_build_image_uploads(
        &self,
        count: usize,
        image: &str,
        build_id: &str,
        provider: &str,
        state: UploadState,
    ) -> Result<Vec<ImageUpload>> {
        let mut uploads = self.get_uploads(image, build_id, provider, &[state])?;
        uploads.sort_by(|a, b| newest_first(a.state_time, b.state_time));
        uploads.truncate(count);
        Ok(uploads)
    }

    /// Up to `count` uploads to `provider` across every READY build, newest first.
    pub fn get_most_recent_image_uploads(
        &self,
        count: usize,
        image: &str,
        provider: &str,
        state: UploadState,
    ) -> Result<Vec<ImageUpload>> {
        let mut uploads = Vec::new();
        for build in self.get_builds(image, &[BuildState::Ready])? {
            uploads.extend(self.get_most_recent_build_image_uploads(
                count, image, &build.id, provider, state,
            )?);
        }
        uploads.sort_by(|a, b| newest_first(a.state_time, b.state_time));
        uploads.truncate(count);
        Ok(uploads)
    }

    /// Create (`upload_id` = None) or overwrite an upload record.
    ///
    /// Fails when the parent build record no longer exists.
    pub fn store_image_upload(
        &self,
        image: &str,
        build_id: &str,
        provider: &str,
        upload: &ImageUpload,
        upload_id: Option<&str>,
    ) -> Result<String> {
        let build = build_path(image, build_id);
        if !self.store.exists(&build)? {
            bail!("cannot store upload: build record '{build}' does not exist");
        }
        let data = serde_json::to_vec(upload).context("serializing upload record")?;
        match upload_id {
            None => {
                let path = self
                    .store
                    .create_record(&uploads_path(image, build_id, provider), &data, true)
                    .with_context(|| {
                        format!("creating upload record for '{image}-{build_id}' on '{provider}'")
                    })?;
                Ok(last_segment(&path))
            }
            Some(upload_id) => {
                let path = upload_path(image, build_id, provider, upload_id);
                self.store
                    .update_record(&path, &data, None)
                    .with_context(|| format!("updating upload record '{path}'"))?;
                Ok(upload_id.to_string())
            }
        }
    }

    pub fn delete_upload(
        &self,
        image: &str,
        build_id: &str,
        provider: &str,
        upload_id: &str,
    ) -> Result<()> {
        let path = upload_path(image, build_id, provider, upload_id);
        self.store
            .delete_record(&path, true)
            .with_context(|| format!("deleting upload record '{path}'"))
    }

    // Locks

    pub fn image_build_lock(&self, image: &str, blocking: bool) -> Result<LockGuard> {
        let path = builds_path(image);
        self.store
            .acquire_lock(&path, blocking)
            .with_context(|| format!("locking builds of '{image}'"))
    }

    pub fn image_build_number_lock(
        &self,
        image: &str,
        build_id: &str,
        blocking: bool,
    ) -> Result<LockGuard> {
        self.store
            .acquire_lock(&build_path(image, build_id), blocking)
            .with_context(|| format!("locking build '{image}-{build_id}'"))
    }

    pub fn image_upload_lock(
        &self,
        image: &str,
        build_id: &str,
        provider: &str,
        blocking: bool,
    ) -> Result<LockGuard> {
        self.store
            .acquire_lock(&uploads_path(image, build_id, provider), blocking)
            .with_context(|| format!("locking uploads of '{image}-{build_id}' to '{provider}'"))
    }

    pub fn image_upload_number_lock(
        &self,
        image: &str,
        build_id: &str,
        provider: &str,
        upload_id: &str,
        blocking: bool,
    ) -> Result<LockGuard> {
        self.store
            .acquire_lock(&upload_path(image, build_id, provider, upload_id), blocking)
            .with_context(|| {
                format!("locking upload {upload_id} of '{image}-{build_id}' to '{provider}'")
            })
    }
}
