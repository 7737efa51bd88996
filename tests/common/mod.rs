#![allow(dead_code)]

use anyhow::{bail, Result};
use image_builder::config::{BuilderConfig, ConfigSource, Provider};
use image_builder::images::ImageStore;
use image_builder::model::BuildState;
use image_builder::provider::{ProviderManager, ProviderManagers, UploadRequest};
use image_builder::store::MemoryStore;
use image_builder::worker::WorkerContext;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Stand-in for disk-image-create: writes one file per `-t` format plus
/// checksum sidecars and a manifest directory.
pub const FAKE_DIB: &str = r#"
out=""
types=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    -t) types="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "building $out ($types)"
[ -n "$FAKE_DIB_SLEEP" ] && sleep "$FAKE_DIB_SLEEP"
[ -n "$FAKE_DIB_FAIL" ] && exit 1
mkdir -p "$out.d"
for fmt in $(echo "$types" | tr ',' ' '); do
  echo image > "$out.$fmt"
  echo d41d8cd98f00b204e9800998ecf8427e > "$out.$fmt.md5"
  echo e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855 > "$out.$fmt.sha256"
done
"#;

/// Provider manager that records calls and hands out `ext-N` ids.
#[derive(Debug, Default)]
pub struct FakeCloud {
    pub uploads: Mutex<Vec<String>>,
    pub deletes: Mutex<Vec<String>>,
}

impl ProviderManager for FakeCloud {
    fn upload_image(&self, request: &UploadRequest<'_>) -> Result<String> {
        if !request.file.is_file() {
            bail!("no such image file '{}'", request.file.display());
        }
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push(request.external_name.to_string());
        Ok(format!("ext-{}", uploads.len()))
    }

    fn delete_image(&self, _external_name: &str, external_id: &str) -> Result<()> {
        self.deletes.lock().unwrap().push(external_id.to_string());
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeClouds(pub Arc<FakeCloud>);

impl ProviderManagers for FakeClouds {
    fn manager(&self, _provider: &Provider) -> Result<Arc<dyn ProviderManager>> {
        Ok(self.0.clone())
    }
}

/// One simulated deployment: scratch dirs, a shared store and config.
pub struct Harness {
    pub tmp: TempDir,
    pub store: MemoryStore,
    pub images: ImageStore,
    pub source: ConfigSource,
    pub cloud: Arc<FakeCloud>,
}

impl Harness {
    /// `image_extra` is appended to the `base` diskimage table.
    pub fn new(image_extra: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("fake-dib.sh");
        fs::write(&script, FAKE_DIB).unwrap();
        let raw = format!(
            r#"
images_dir = "{root}/images"
build_log_dir = "{root}/logs"
[store]
root = "{root}/store"
[builder]
build_interval_secs = 1
upload_interval_secs = 1
cleanup_interval_secs = 1
[[diskimages]]
name = "base"
formats = ["qcow2"]
rebuild_age_secs = 3600
dib_cmd = "sh {script}"
{image_extra}
[[providers]]
name = "cloud"
image_type = "qcow2"
[[providers.diskimages]]
name = "base"
"#,
            root = tmp.path().display(),
            script = script.display(),
        );
        let config = BuilderConfig::from_toml_str(&raw).unwrap();
        fs::create_dir_all(&config.images_dir).unwrap();
        let store = MemoryStore::new();
        Self {
            images: ImageStore::new(Arc::new(store.clone())),
            store,
            source: ConfigSource::shared(config),
            cloud: Arc::new(FakeCloud::default()),
            tmp,
        }
    }

    pub fn config(&self) -> BuilderConfig {
        self.source.load().unwrap()
    }

    pub fn images_dir(&self) -> PathBuf {
        self.tmp.path().join("images")
    }

    pub fn context(&self, builder_id: &str) -> WorkerContext {
        WorkerContext::new(
            builder_id,
            self.images.clone(),
            self.source.clone(),
            Arc::new(FakeClouds(self.cloud.clone())),
        )
        .with_waits(Duration::from_millis(20), Duration::from_millis(20))
    }

    pub fn image_file(&self, build_id: &str) -> PathBuf {
        self.images_dir().join(format!("base-{build_id}.qcow2"))
    }

    /// Push a build's `state_time` into the past.
    pub fn age_build(&self, build_id: &str, secs: f64) {
        let mut build = self.images.get_build("base", build_id).unwrap().unwrap();
        build.state_time -= secs;
        self.images.store_build("base", &build, Some(build_id)).unwrap();
    }

    pub fn builds_in(&self, state: BuildState) -> Vec<String> {
        self.images
            .get_builds("base", &[state])
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect()
    }

    /// A record that is not DELETING must have its local files.
    pub fn assert_deletion_ordering(&self, builder_id: &str) {
        for build in self.images.get_builds("base", &[]).unwrap() {
            if build.state == BuildState::Ready && build.is_local_to(builder_id) {
                assert!(
                    self.image_file(&build.id).is_file(),
                    "READY build {} has no local file",
                    build.id
                );
            }
        }
    }
}

pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    done()
}
