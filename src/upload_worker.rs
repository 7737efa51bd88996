//! Uploads the newest READY build of each image to the providers that list it.

use crate::config::{BuilderConfig, Provider, ProviderDiskImage};
use crate::dib_file::DibImageFile;
use crate::model::{now, BuildState, ImageBuild, ImageUpload, UploadState};
use crate::provider::UploadRequest;
use crate::stats;
use crate::store::{is_lock_contention, CoordinationStore};
use crate::worker::{StopSignal, Worker, WorkerContext};
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct UploadWorker {
    name: String,
    context: WorkerContext,
    stop: StopSignal,
    interval: Duration,
}

impl UploadWorker {
    pub fn new(index: usize, context: WorkerContext, stop: StopSignal) -> Self {
        Self {
            name: format!("UploadWorker.{index}"),
            context,
            stop,
            interval: Duration::from_secs(10),
        }
    }

    /// Attempt at most one upload; the pass ends after any attempt so the
    /// next one starts from a freshly loaded configuration.
    pub fn check_for_provider_uploads(&self, config: &BuilderConfig) {
        for provider in config.providers.iter().filter(|p| p.manage_images) {
            for image in &provider.diskimages {
                if self.stop.is_stopped() || !self.context.images.is_connected() {
                    return;
                }
                match self.check_provider_image_upload(config, provider, image) {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(err) => tracing::error!(image = %image.name, provider = %provider.name,
                        error = %format!("{err:#}"), "error uploading image"),
                }
            }
        }
    }

    /// Returns whether an upload was attempted.
    fn check_provider_image_upload(
        &self,
        config: &BuilderConfig,
        provider: &Provider,
        image: &ProviderDiskImage,
    ) -> Result<bool> {
        if image.pause {
            return Ok(false);
        }
        let images = &self.context.images;
        let Some(build) = images
            .get_most_recent_builds(1, &image.name, Some(BuildState::Ready))?
            .into_iter()
            .next()
        else {
            return Ok(false);
        };

        let local = DibImageFile::from_image_id(&config.images_dir, &build.file_base())?;
        if local.is_empty() {
            return Ok(false);
        }
        if self.has_ready_upload(&build, provider)? {
            return Ok(false);
        }
        if !build.formats.contains(&provider.image_type) {
            return Ok(false);
        }

        let _lock = match images.image_upload_lock(&image.name, &build.id, &provider.name, false) {
            Ok(lock) => lock,
            Err(err) if is_lock_contention(&err) => return Ok(false),
            Err(err) => return Err(err),
        };
        if self.has_ready_upload(&build, provider)? {
            return Ok(false);
        }
        // Cleanup may be deleting this build under a newer configuration.
        match images.get_build(&image.name, &build.id)? {
            Some(current) if current.state != BuildState::Deleting => {}
            _ => return Ok(false),
        }

        let uploading = ImageUpload::new(&build, &provider.name, UploadState::Uploading);
        let upload_id =
            images.store_image_upload(&image.name, &build.id, &provider.name, &uploading, None)?;

        let mut result = self.upload_image(config, provider, image, &build, &upload_id, &local);

        if !self.wait_for_store() {
            tracing::error!(image = %image.name, build = %build.id, provider = %provider.name,
                upload = %upload_id, external_id = ?result.external_id,
                "stopped while the store was unavailable; upload result not recorded");
            return Ok(true);
        }
        let backend = images.backend();
        if backend.did_lose_connection() {
            backend.reset_lost_flag();
            tracing::warn!(image = %image.name, build = %build.id, provider = %provider.name,
                upload = %upload_id, "store session lost during upload; recording it as failed");
            // The external id stays on the record so cleanup removes the remote image.
            result.set_state(UploadState::Failed);
        }
        self.record_result(&image.name, &build.id, &provider.name, &upload_id, &result)?;
        Ok(true)
    }

    /// Block until the store is connected again. Returns false only if the
    /// worker was stopped while it was still unavailable.
    fn wait_for_store(&self) -> bool {
        let images = &self.context.images;
        if images.is_connected() {
            return true;
        }
        tracing::info!("coordination store unavailable, holding upload result");
        while !images.is_connected() {
            if self.stop.wait(self.context.suspend_wait) && !images.is_connected() {
                return false;
            }
        }
        true
    }

    /// Final write of an attempt under the upload-number lock.
    fn record_result(
        &self,
        image: &str,
        build_id: &str,
        provider: &str,
        upload_id: &str,
        result: &ImageUpload,
    ) -> Result<()> {
        let images = &self.context.images;
        let _number_lock = images.image_upload_number_lock(image, build_id, provider, upload_id, true)?;
        if images.get_image_upload(image, build_id, provider, upload_id)?.is_some() {
            images.store_image_upload(image, build_id, provider, result, Some(upload_id))?;
            return Ok(());
        }
        // Cleanup took the UPLOADING record for an orphan while the session
        // was gone. A fresh FAILED record keeps the remote image reachable.
        if let Some(external_id) = &result.external_id {
            tracing::warn!(image, build = build_id, provider, upload = upload_id,
                external_id = %external_id, "upload record vanished; recording remote image as failed");
            let mut failed = result.clone();
            failed.set_state(UploadState::Failed);
            images
                .store_image_upload(image, build_id, provider, &failed, None)
                .with_context(|| format!("recording orphaned remote image '{external_id}'"))?;
        }
        Ok(())
    }

    fn has_ready_upload(&self, build: &ImageBuild, provider: &Provider) -> Result<bool> {
        let uploads = self.context.images.get_most_recent_build_image_uploads(
            1,
            &build.image_name,
            &build.id,
            &provider.name,
            UploadState::Ready,
        )?;
        Ok(!uploads.is_empty())
    }

    /// Upload one build; every failure resolves to a FAILED record.
    fn upload_image(
        &self,
        config: &BuilderConfig,
        provider: &Provider,
        image: &ProviderDiskImage,
        build: &ImageBuild,
        upload_id: &str,
        local: &[DibImageFile],
    ) -> ImageUpload {
        let mut failed = ImageUpload::new(build, &provider.name, UploadState::Failed);
        failed.id = upload_id.to_string();

        let Some(file) = local.iter().find(|f| f.extension == provider.image_type) else {
            tracing::error!(image = %image.name, build = %build.id, format = %provider.image_type,
                "no local image file of the provider's type");
            return failed;
        };
        let path = file.to_path(&config.images_dir);
        let external_name = provider.external_name(&image.name, now() as u64);

        let manager = match self.context.providers.manager(provider) {
            Ok(manager) => manager,
            Err(err) => {
                tracing::error!(provider = %provider.name, error = %format!("{err:#}"),
                    "no provider manager");
                return failed;
            }
        };

        let mut metadata = image.meta.clone();
        metadata.insert("nodepool_build_id".to_string(), build.id.clone());
        metadata.insert("nodepool_upload_id".to_string(), upload_id.to_string());

        tracing::info!(image = %image.name, build = %build.id, provider = %provider.name,
            file = %path.display(), "uploading image");
        let request = UploadRequest {
            external_name: &external_name,
            file: &path,
            image_type: &file.extension,
            metadata: &metadata,
            md5: file.md5.as_deref(),
            sha256: file.sha256.as_deref(),
        };
        let started = Instant::now();
        let external_id = match manager.upload_image(&request) {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(image = %image.name, build = %build.id, provider = %provider.name,
                    error = %format!("{err:#}"), "failed to upload image");
                return failed;
            }
        };

        if let Some(hook) = &provider.post_upload_hook {
            if let Err(err) = run_post_upload_hook(hook, &provider.name, &external_id, &path) {
                tracing::error!(provider = %provider.name, external_id = %external_id,
                    error = %format!("{err:#}"), "post upload hook failed");
                if let Err(err) = manager.delete_image(&external_name, &external_id) {
                    tracing::error!(provider = %provider.name, external_name = %external_name,
                        error = %format!("{err:#}"), "unable to delete image");
                }
                return failed;
            }
        }

        stats::record_upload(&image.name, &provider.name, started.elapsed());
        tracing::info!(image = %image.name, build = %build.id, provider = %provider.name,
            external_id = %external_id, "image upload is ready");
        let mut ready = ImageUpload::new(build, &provider.name, UploadState::Ready);
        ready.id = upload_id.to_string();
        ready.external_id = Some(external_id);
        ready.external_name = Some(external_name);
        ready.format = Some(file.extension.clone());
        ready
    }
}

/// `hook <provider> <external_id> <file>`; non-zero exit is failure.
fn run_post_upload_hook(hook: &Path, provider: &str, external_id: &str, file: &Path) -> Result<()> {
    tracing::info!(hook = %hook.display(), provider, external_id, "running post upload hook");
    let output = Command::new(hook)
        .arg(provider)
        .arg(external_id)
        .arg(file)
        .output()
        .with_context(|| format!("running post upload hook '{}'", hook.display()))?;
    if !output.status.success() {
        bail!(
            "post upload hook exited with {}\nstdout:\n{}\nstderr:\n{}",
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

impl Worker for UploadWorker {
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
        self.interval = config.builder.upload_interval();
        self.check_for_provider_uploads(&config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSource;
    use crate::images::ImageStore;
    use crate::provider::{ProviderManager, ProviderManagers};
    use crate::store::{ConnectionState, CoordinationStore, MemoryStore};
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct Recorder {
        fail_upload: bool,
        /// Store state to switch to during the upload; reconnects 200ms later.
        outage: Option<(MemoryStore, ConnectionState)>,
        uploads: Mutex<Vec<(String, BTreeMap<String, String>)>>,
        deletes: Mutex<Vec<String>>,
    }

    impl ProviderManager for Recorder {
        fn upload_image(&self, request: &UploadRequest<'_>) -> Result<String> {
            if self.fail_upload {
                bail!("cloud unavailable");
            }
            if let Some((store, state)) = &self.outage {
                store.set_connection_state(*state);
                let store = store.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(200));
                    store.set_connection_state(ConnectionState::Connected);
                });
            }
            let mut uploads = self.uploads.lock().unwrap();
            uploads.push((request.external_name.to_string(), request.metadata.clone()));
            Ok(format!("ext-{}", uploads.len()))
        }

        fn delete_image(&self, _external_name: &str, external_id: &str) -> Result<()> {
            self.deletes.lock().unwrap().push(external_id.to_string());
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Registry(Arc<Recorder>);

    impl ProviderManagers for Registry {
        fn manager(&self, _provider: &Provider) -> Result<Arc<dyn ProviderManager>> {
            Ok(self.0.clone())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        worker: UploadWorker,
        recorder: Arc<Recorder>,
        images: ImageStore,
    }

    fn fixture(provider_extra: &str, recorder: Recorder) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let raw = format!(
            r#"
images_dir = "{root}/images"
[store]
root = "{root}/store"
[[diskimages]]
name = "base"
formats = ["qcow2"]
[[providers]]
name = "cloud"
{provider_extra}
[[providers.diskimages]]
name = "base"
meta = {{ team = "infra" }}
"#,
            root = root.display()
        );
        let config = BuilderConfig::from_toml_str(&raw).unwrap();
        fs::create_dir_all(&config.images_dir).unwrap();
        let store = match &recorder.outage {
            Some((store, _)) => store.clone(),
            None => MemoryStore::new(),
        };
        let images = ImageStore::new(Arc::new(store));
        let recorder = Arc::new(recorder);
        let context = WorkerContext::new(
            "builder-1",
            images.clone(),
            ConfigSource::shared(config),
            Arc::new(Registry(recorder.clone())),
        )
        .with_waits(Duration::from_millis(10), Duration::from_millis(10));
        Fixture {
            worker: UploadWorker::new(0, context, StopSignal::new()),
            recorder,
            images,
            _tmp: tmp,
        }
    }

    fn ready_build(fx: &Fixture, with_file: bool) -> String {
        let mut build = ImageBuild::new("base", BuildState::Ready);
        build.formats = vec!["qcow2".to_string()];
        build.builder_id = Some("builder-1".to_string());
        let id = fx.images.store_build("base", &build, None).unwrap();
        if with_file {
            let config = fx.worker.context.load_config().unwrap();
            fs::write(config.images_dir.join(format!("base-{id}.qcow2")), "image").unwrap();
        }
        id
    }

    #[test]
    fn uploads_ready_build_once() {
        let mut fx = fixture("", Recorder::default());
        let build_id = ready_build(&fx, true);
        fx.worker.run_once().unwrap();
        fx.worker.run_once().unwrap();

        let uploads = fx.images.get_uploads("base", &build_id, "cloud", &[]).unwrap();
        assert_eq!(uploads.len(), 1);
        let upload = &uploads[0];
        assert_eq!(upload.state, UploadState::Ready);
        assert_eq!(upload.external_id.as_deref(), Some("ext-1"));
        assert_eq!(upload.format.as_deref(), Some("qcow2"));
        assert!(upload.external_name.as_deref().unwrap().starts_with("base-"));

        let recorded = fx.recorder.uploads.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].1["team"], "infra");
        assert_eq!(recorded[0].1["nodepool_build_id"], build_id);
        assert_eq!(recorded[0].1["nodepool_upload_id"], upload.id);
    }

    #[test]
    fn provider_errors_record_failed() {
        let mut fx = fixture(
            "",
            Recorder {
                fail_upload: true,
                ..Recorder::default()
            },
        );
        let build_id = ready_build(&fx, true);
        fx.worker.run_once().unwrap();
        let uploads = fx.images.get_uploads("base", &build_id, "cloud", &[]).unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].state, UploadState::Failed);
    }

    #[test]
    fn failing_hook_rolls_back_remote_image() {
        let mut fx = fixture("post_upload_hook = \"false\"", Recorder::default());
        let build_id = ready_build(&fx, true);
        fx.worker.run_once().unwrap();

        let uploads = fx.images.get_uploads("base", &build_id, "cloud", &[]).unwrap();
        assert_eq!(uploads[0].state, UploadState::Failed);
        assert_eq!(*fx.recorder.deletes.lock().unwrap(), vec!["ext-1".to_string()]);
    }

    #[test]
    fn skips_without_local_files_or_matching_format() {
        let mut fx = fixture("", Recorder::default());
        let build_id = ready_build(&fx, false);
        fx.worker.run_once().unwrap();
        assert!(fx.images.get_uploads("base", &build_id, "cloud", &[]).unwrap().is_empty());

        let mut fx = fixture("image_type = \"vhd\"", Recorder::default());
        let build_id = ready_build(&fx, true);
        fx.worker.run_once().unwrap();
        assert!(fx.images.get_uploads("base", &build_id, "cloud", &[]).unwrap().is_empty());
    }

    #[test]
    fn deleting_build_is_not_uploaded() {
        let mut fx = fixture("", Recorder::default());
        let build_id = ready_build(&fx, true);
        let mut build = fx.images.get_build("base", &build_id).unwrap().unwrap();
        build.set_state(BuildState::Deleting);
        fx.images.store_build("base", &build, Some(&build_id)).unwrap();

        fx.worker.run_once().unwrap();
        assert!(fx.images.get_uploads("base", &build_id, "cloud", &[]).unwrap().is_empty());
    }

    #[test]
    fn suspension_during_upload_still_records_ready() {
        let store = MemoryStore::new();
        let mut fx = fixture(
            "",
            Recorder {
                outage: Some((store.clone(), ConnectionState::Suspended)),
                ..Recorder::default()
            },
        );
        let build_id = ready_build(&fx, true);
        fx.worker.run_once().unwrap();

        let uploads = fx.images.get_uploads("base", &build_id, "cloud", &[]).unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].state, UploadState::Ready);
        assert_eq!(uploads[0].external_id.as_deref(), Some("ext-1"));
    }

    #[test]
    fn lost_session_during_upload_keeps_remote_id_on_failed_record() {
        let store = MemoryStore::new();
        let mut fx = fixture(
            "",
            Recorder {
                outage: Some((store.clone(), ConnectionState::Lost)),
                ..Recorder::default()
            },
        );
        let build_id = ready_build(&fx, true);
        fx.worker.run_once().unwrap();

        let uploads = fx.images.get_uploads("base", &build_id, "cloud", &[]).unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].state, UploadState::Failed);
        assert_eq!(uploads[0].external_id.as_deref(), Some("ext-1"));
        assert!(!store.did_lose_connection());
    }

    #[test]
    fn vanished_record_is_recreated_with_remote_id() {
        let fx = fixture("", Recorder::default());
        let build_id = ready_build(&fx, true);
        let build = fx.images.get_build("base", &build_id).unwrap().unwrap();
        let uploading = ImageUpload::new(&build, "cloud", UploadState::Uploading);
        let upload_id = fx
            .images
            .store_image_upload("base", &build_id, "cloud", &uploading, None)
            .unwrap();
        fx.images.delete_upload("base", &build_id, "cloud", &upload_id).unwrap();

        let mut ready = ImageUpload::new(&build, "cloud", UploadState::Ready);
        ready.external_id = Some("ext-9".to_string());
        fx.worker
            .record_result("base", &build_id, "cloud", &upload_id, &ready)
            .unwrap();

        let uploads = fx.images.get_uploads("base", &build_id, "cloud", &[]).unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].state, UploadState::Failed);
        assert_eq!(uploads[0].external_id.as_deref(), Some("ext-9"));
    }
}
