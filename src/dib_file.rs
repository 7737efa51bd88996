//! Local build artifacts in the images directory.
//!
//! A build `{image}-{build}` produces one file per format,
//! `{image}-{build}.{ext}`, each optionally paired with `.md5` and `.sha256`
//! sidecars, plus a `{image}-{build}.d` manifest directory.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// One artifact file of a build, identified by `{image}-{build}` and extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DibImageFile {
    pub image_id: String,
    pub extension: String,
    pub md5: Option<String>,
    pub md5_file: Option<PathBuf>,
    pub sha256: Option<String>,
    pub sha256_file: Option<PathBuf>,
}

impl DibImageFile {
    pub fn new(image_id: &str, extension: &str) -> Self {
        Self {
            image_id: image_id.to_string(),
            extension: extension.to_string(),
            md5: None,
            md5_file: None,
            sha256: None,
            sha256_file: None,
        }
    }

    /// Split `{image_id}.{ext}` at the last dot. None for names without one.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let (image_id, extension) = name.rsplit_once('.')?;
        if image_id.is_empty() || extension.is_empty() {
            return None;
        }
        Some(Self::new(image_id, extension))
    }

    /// Every artifact file of `image_id` in `images_dir`, sorted by extension.
    ///
    /// Checksum sidecars and the manifest directory are not artifacts.
    pub fn from_image_id(images_dir: &Path, image_id: &str) -> Result<Vec<Self>> {
        let entries = match fs::read_dir(images_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("reading images directory '{}'", images_dir.display())
                })
            }
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("iterating images directory '{}'", images_dir.display()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(mut file) = Self::from_path(&path) {
                if file.image_id == image_id {
                    file.load_checksums(images_dir)?;
                    files.push(file);
                }
            }
        }
        files.sort_by(|a, b| a.extension.cmp(&b.extension));
        Ok(files)
    }

    pub fn to_path(&self, images_dir: &Path) -> PathBuf {
        images_dir.join(format!("{}.{}", self.image_id, self.extension))
    }

    /// Read `.md5`/`.sha256` sidecars; checksum tools append the file name,
    /// so only the leading hex digest is kept.
    fn load_checksums(&mut self, images_dir: &Path) -> Result<()> {
        let path = self.to_path(images_dir);
        let md5_path = sidecar(&path, "md5");
        if let Some(digest) = read_digest(&md5_path, 32)? {
            self.md5 = Some(digest);
            self.md5_file = Some(md5_path);
        }
        let sha256_path = sidecar(&path, "sha256");
        if let Some(digest) = read_digest(&sha256_path, 64)? {
            self.sha256 = Some(digest);
            self.sha256_file = Some(sha256_path);
        }
        Ok(())
    }
}

fn sidecar(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

fn read_digest(path: &Path, len: usize) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let digest: String = raw.trim().chars().take(len).collect();
            Ok((!digest.is_empty()).then_some(digest))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading checksum '{}'", path.display())),
    }
}

/// Manifest directory written next to a build's artifacts.
pub fn manifest_dir(images_dir: &Path, image_id: &str) -> PathBuf {
    images_dir.join(format!("{image_id}.d"))
}

/// Remove every local file of `{image}-{build}`: artifacts, sidecars and
/// manifest directory. Returns whether anything was found.
pub fn delete_local_build(images_dir: &Path, image: &str, build_id: &str) -> Result<bool> {
    let image_id = format!("{image}-{build_id}");
    let files = DibImageFile::from_image_id(images_dir, &image_id)?;
    let manifest = manifest_dir(images_dir, &image_id);
    if files.is_empty() && !manifest.exists() {
        return Ok(false);
    }
    tracing::info!(image, build = build_id, "deleting local build files");
    for file in &files {
        let items = [
            Some(file.to_path(images_dir)),
            file.md5_file.clone(),
            file.sha256_file.clone(),
        ];
        for item in items.into_iter().flatten() {
            remove_if_exists(&item)?;
        }
    }
    match fs::remove_dir_all(&manifest) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e)
                .with_context(|| format!("removing manifest directory '{}'", manifest.display()))
        }
    }
    Ok(true)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing '{}'", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn finds_artifacts_and_checksums() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        write(dir, "base-0000000001.qcow2", "image");
        write(
            dir,
            "base-0000000001.qcow2.md5",
            "d41d8cd98f00b204e9800998ecf8427e  base-0000000001.qcow2\n",
        );
        write(dir, "base-0000000001.raw", "image");
        write(dir, "base-0000000002.qcow2", "other build");
        write(dir, "base-00000000011.qcow2", "prefix collision");
        fs::create_dir(dir.join("base-0000000001.d")).unwrap();

        let files = DibImageFile::from_image_id(dir, "base-0000000001").unwrap();
        let exts: Vec<&str> = files.iter().map(|f| f.extension.as_str()).collect();
        assert_eq!(exts, vec!["qcow2", "raw"]);
        assert_eq!(
            files[0].md5.as_deref(),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
        assert!(files[0].sha256.is_none());
        assert!(files[1].md5.is_none());
    }

    #[test]
    fn delete_local_build_removes_everything() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        write(dir, "base-0000000001.qcow2", "image");
        write(dir, "base-0000000001.qcow2.sha256", "abc");
        fs::create_dir(dir.join("base-0000000001.d")).unwrap();
        write(&dir.join("base-0000000001.d"), "packages", "");
        write(dir, "base-0000000002.qcow2", "keep");

        assert!(delete_local_build(dir, "base", "0000000001").unwrap());
        assert!(!dir.join("base-0000000001.qcow2").exists());
        assert!(!dir.join("base-0000000001.qcow2.sha256").exists());
        assert!(!dir.join("base-0000000001.d").exists());
        assert!(dir.join("base-0000000002.qcow2").exists());
        assert!(!delete_local_build(dir, "base", "0000000001").unwrap());
    }

    #[test]
    fn missing_images_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let files = DibImageFile::from_image_id(&tmp.path().join("nope"), "base-1").unwrap();
        assert!(files.is_empty());
    }
}
