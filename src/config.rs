//! Builder configuration, loaded from TOML.
//!
//! Workers reload their configuration at the start of every pass through a
//! [`ConfigSource`], so edits to the file take effect without a restart.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

pub const DEFAULT_BUILD_LOG_DIR: &str = "/var/log/image-builder/builds";
pub const DEFAULT_DIB_CMD: &str = "disk-image-create";
pub const DEFAULT_IMAGE_NAME_FORMAT: &str = "{image_name}-{timestamp}";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuilderConfig {
    pub images_dir: PathBuf,
    #[serde(default = "default_build_log_dir")]
    pub build_log_dir: PathBuf,
    /// Build logs kept per diskimage; negative disables pruning.
    #[serde(default = "default_build_log_retention")]
    pub build_log_retention: i64,
    #[serde(default)]
    pub elements_dir: Option<PathBuf>,
    pub store: StoreConfig,
    #[serde(default)]
    pub builder: WorkerSettings,
    #[serde(default)]
    pub diskimages: Vec<DiskImage>,
    #[serde(default)]
    pub providers: Vec<Provider>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerSettings {
    pub build_workers: usize,
    pub upload_workers: usize,
    pub build_interval_secs: u64,
    pub upload_interval_secs: u64,
    /// 0 disables the cleanup worker.
    pub cleanup_interval_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            build_workers: 1,
            upload_workers: 4,
            build_interval_secs: 10,
            upload_interval_secs: 10,
            cleanup_interval_secs: 60,
        }
    }
}

impl WorkerSettings {
    pub fn build_interval(&self) -> Duration {
        Duration::from_secs(self.build_interval_secs)
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskImage {
    pub name: String,
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub elements: Vec<String>,
    #[serde(default)]
    pub release: Option<String>,
    #[serde(default = "default_rebuild_age")]
    pub rebuild_age_secs: u64,
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
    #[serde(default = "default_dib_cmd")]
    pub dib_cmd: String,
    #[serde(default)]
    pub pause: bool,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_python_path")]
    pub python_path: String,
    #[serde(default)]
    pub shell_type: Option<String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

impl DiskImage {
    pub fn rebuild_age(&self) -> Duration {
        Duration::from_secs(self.rebuild_age_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Provider {
    pub name: String,
    #[serde(default = "default_true")]
    pub manage_images: bool,
    #[serde(default = "default_image_type")]
    pub image_type: String,
    #[serde(default = "default_image_name_format")]
    pub image_name_format: String,
    #[serde(default)]
    pub post_upload_hook: Option<PathBuf>,
    #[serde(default)]
    pub upload_command: Option<String>,
    #[serde(default)]
    pub delete_command: Option<String>,
    #[serde(default)]
    pub diskimages: Vec<ProviderDiskImage>,
}

impl Provider {
    pub fn diskimage(&self, name: &str) -> Option<&ProviderDiskImage> {
        self.diskimages.iter().find(|image| image.name == name)
    }

    /// Remote name for an upload made at `timestamp` (unix seconds).
    pub fn external_name(&self, image_name: &str, timestamp: u64) -> String {
        self.image_name_format
            .replace("{image_name}", image_name)
            .replace("{timestamp}", &timestamp.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderDiskImage {
    pub name: String,
    #[serde(default)]
    pub pause: bool,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

fn default_build_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_BUILD_LOG_DIR)
}

fn default_build_log_retention() -> i64 {
    7
}

fn default_rebuild_age() -> u64 {
    86_400
}

fn default_build_timeout() -> u64 {
    8 * 60 * 60
}

fn default_dib_cmd() -> String {
    DEFAULT_DIB_CMD.to_string()
}

fn default_username() -> String {
    "zuul".to_string()
}

fn default_python_path() -> String {
    "auto".to_string()
}

fn default_true() -> bool {
    true
}

fn default_image_type() -> String {
    "qcow2".to_string()
}

fn default_image_name_format() -> String {
    DEFAULT_IMAGE_NAME_FORMAT.to_string()
}

impl BuilderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading builder config '{}'", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("loading builder config '{}'", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let parsed: Self = toml::from_str(raw).context("parsing builder config")?;
        parsed.normalized()
    }

    /// Sort/dedup formats and validate names. Unknown provider images only warn.
    pub fn normalized(mut self) -> Result<Self> {
        if self.images_dir.as_os_str().is_empty() {
            bail!("invalid builder config: images_dir must not be empty");
        }
        if self.store.root.as_os_str().is_empty() {
            bail!("invalid builder config: store.root must not be empty");
        }

        let mut seen = BTreeSet::new();
        for image in &mut self.diskimages {
            if image.name.trim().is_empty() {
                bail!("invalid builder config: diskimage with empty name");
            }
            if !seen.insert(image.name.clone()) {
                bail!("invalid builder config: duplicate diskimage '{}'", image.name);
            }
            if image.dib_cmd.trim().is_empty() {
                bail!(
                    "invalid builder config: diskimage '{}' has an empty dib_cmd",
                    image.name
                );
            }
            image.formats.sort();
            image.formats.dedup();
        }

        let mut providers = BTreeSet::new();
        for provider in &self.providers {
            if !providers.insert(provider.name.clone()) {
                bail!("invalid builder config: duplicate provider '{}'", provider.name);
            }
            for image in &provider.diskimages {
                if !seen.contains(&image.name) {
                    tracing::warn!(
                        provider = %provider.name,
                        image = %image.name,
                        "provider lists an unknown diskimage"
                    );
                }
            }
        }
        Ok(self)
    }

    pub fn diskimage(&self, name: &str) -> Option<&DiskImage> {
        self.diskimages.iter().find(|image| image.name == name)
    }

    pub fn provider(&self, name: &str) -> Option<&Provider> {
        self.providers.iter().find(|provider| provider.name == name)
    }
}

/// Split a configured command line into program and leading arguments.
///
/// Follows POSIX shell quoting, so paths with spaces can be quoted.
pub fn split_command(command: &str) -> Result<(String, Vec<String>)> {
    let Some(parts) = shlex::split(command) else {
        bail!("unbalanced quoting in command line '{command}'");
    };
    let mut parts = parts.into_iter();
    let Some(program) = parts.next() else {
        bail!("empty command line");
    };
    Ok((program, parts.collect()))
}

/// Where workers get a fresh configuration from on every pass.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    /// In-memory configuration shared with the embedder; edits are seen on
    /// the next pass.
    Shared(Arc<RwLock<BuilderConfig>>),
}

impl ConfigSource {
    pub fn shared(config: BuilderConfig) -> Self {
        ConfigSource::Shared(Arc::new(RwLock::new(config)))
    }

    pub fn load(&self) -> Result<BuilderConfig> {
        match self {
            ConfigSource::File(path) => BuilderConfig::load(path),
            ConfigSource::Shared(config) => Ok(config
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()),
        }
    }

    /// Replace a shared configuration. File sources are edited on disk instead.
    pub fn update(&self, edit: impl FnOnce(&mut BuilderConfig)) -> Result<()> {
        match self {
            ConfigSource::File(path) => bail!(
                "config '{}' is file-backed; edit the file instead",
                path.display()
            ),
            ConfigSource::Shared(config) => {
                let mut guard = config.write().unwrap_or_else(PoisonError::into_inner);
                edit(&mut *guard);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
images_dir = "/opt/images"

[store]
root = "/var/lib/image-builder/store"

[[diskimages]]
name = "base"
formats = ["raw", "qcow2", "qcow2"]
elements = ["ubuntu-minimal", "vm"]

[[providers]]
name = "cloud-a"
[[providers.diskimages]]
name = "base"
meta = { team = "infra" }
"#;

    #[test]
    fn defaults_are_applied() {
        let config = BuilderConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.build_log_dir, PathBuf::from(DEFAULT_BUILD_LOG_DIR));
        assert_eq!(config.build_log_retention, 7);
        assert_eq!(config.builder, WorkerSettings::default());
        let image = config.diskimage("base").unwrap();
        assert_eq!(image.formats, vec!["qcow2".to_string(), "raw".to_string()]);
        assert_eq!(image.rebuild_age(), Duration::from_secs(86_400));
        assert_eq!(image.dib_cmd, DEFAULT_DIB_CMD);
        assert_eq!(image.username, "zuul");
        let provider = config.provider("cloud-a").unwrap();
        assert!(provider.manage_images);
        assert_eq!(provider.image_type, "qcow2");
        assert_eq!(provider.diskimage("base").unwrap().meta["team"], "infra");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = format!("{MINIMAL}\nbogus = 1\n");
        assert!(BuilderConfig::from_toml_str(&raw).is_err());
    }

    #[test]
    fn duplicate_diskimages_are_rejected() {
        let raw = r#"
images_dir = "/opt/images"
[store]
root = "/tmp/store"
[[diskimages]]
name = "base"
[[diskimages]]
name = "base"
"#;
        let err = BuilderConfig::from_toml_str(raw).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate diskimage 'base'"));
    }

    #[test]
    fn empty_images_dir_is_rejected() {
        let raw = "images_dir = \"\"\n[store]\nroot = \"/tmp/store\"\n";
        assert!(BuilderConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn external_name_substitutes_placeholders() {
        let config = BuilderConfig::from_toml_str(MINIMAL).unwrap();
        let provider = config.provider("cloud-a").unwrap();
        assert_eq!(provider.external_name("base", 1700000000), "base-1700000000");
    }

    #[test]
    fn command_lines_split_on_whitespace() {
        let (program, args) = split_command("sh /opt/fake-dib.sh").unwrap();
        assert_eq!(program, "sh");
        assert_eq!(args, vec!["/opt/fake-dib.sh".to_string()]);
        assert!(split_command("   ").is_err());
    }

    #[test]
    fn command_lines_honor_shell_quoting() {
        let (program, args) =
            split_command(r#""/opt/dib tools/create" -x 'two words' plain\ escaped"#).unwrap();
        assert_eq!(program, "/opt/dib tools/create");
        assert_eq!(args, vec!["-x", "two words", "plain escaped"]);
        assert!(split_command("sh 'unterminated").is_err());
    }

    #[test]
    fn sources_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("builder.toml");
        fs::write(&path, MINIMAL).unwrap();
        let source = ConfigSource::File(path.clone());
        assert_eq!(source.load().unwrap().diskimages.len(), 1);
        assert!(source.update(|_| {}).is_err());

        let shared = ConfigSource::shared(BuilderConfig::load(&path).unwrap());
        shared.update(|config| config.diskimages.clear()).unwrap();
        assert!(shared.load().unwrap().diskimages.is_empty());
    }
}
