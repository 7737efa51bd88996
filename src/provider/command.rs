//! Provider manager backed by external commands.
//!
//! `upload_command <external_name> <file> <image_type>` must print the
//! provider's image id as the last line of stdout. Checksums and metadata are
//! passed in `IMAGE_MD5`, `IMAGE_SHA256` and `IMAGE_METADATA` (JSON).
//! `delete_command <external_name> <external_id>` removes the image.

use super::{ProviderManager, ProviderManagers, UploadRequest};
use crate::config::{split_command, Provider};
use anyhow::{bail, Context, Result};
use std::process::Command;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CommandProviderManager {
    provider: String,
    upload_command: Option<String>,
    delete_command: Option<String>,
}

impl CommandProviderManager {
    pub fn new(provider: &Provider) -> Self {
        Self {
            provider: provider.name.clone(),
            upload_command: provider.upload_command.clone(),
            delete_command: provider.delete_command.clone(),
        }
    }

    fn command(&self, line: Option<&str>, kind: &str) -> Result<Command> {
        let Some(line) = line else {
            bail!("provider '{}' has no {kind}_command configured", self.provider);
        };
        let (program, args) = split_command(line)
            .with_context(|| format!("parsing {kind}_command of provider '{}'", self.provider))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

impl ProviderManager for CommandProviderManager {
    fn upload_image(&self, request: &UploadRequest<'_>) -> Result<String> {
        let mut cmd = self.command(self.upload_command.as_deref(), "upload")?;
        cmd.arg(request.external_name)
            .arg(request.file)
            .arg(request.image_type)
            .env(
                "IMAGE_METADATA",
                serde_json::to_string(request.metadata).context("encoding image metadata")?,
            );
        if let Some(md5) = request.md5 {
            cmd.env("IMAGE_MD5", md5);
        }
        if let Some(sha256) = request.sha256 {
            cmd.env("IMAGE_SHA256", sha256);
        }

        let output = cmd.output().with_context(|| {
            format!(
                "running upload command for '{}' on provider '{}'",
                request.external_name, self.provider
            )
        })?;
        if !output.status.success() {
            bail!(
                "upload of '{}' to provider '{}' failed with {}: {}",
                request.external_name,
                self.provider,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.lines().rev().map(str::trim).find(|line| !line.is_empty()) {
            Some(external_id) => Ok(external_id.to_string()),
            None => bail!(
                "upload command for provider '{}' printed no image id",
                self.provider
            ),
        }
    }

    fn delete_image(&self, external_name: &str, external_id: &str) -> Result<()> {
        let mut cmd = self.command(self.delete_command.as_deref(), "delete")?;
        cmd.arg(external_name).arg(external_id);
        let output = cmd.output().with_context(|| {
            format!(
                "running delete command for '{external_name}' on provider '{}'",
                self.provider
            )
        })?;
        if !output.status.success() {
            bail!(
                "delete of '{external_name}' ({external_id}) on provider '{}' failed with {}: {}",
                self.provider,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Registry building a [`CommandProviderManager`] from each provider's config.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandProviders;

impl ProviderManagers for CommandProviders {
    fn manager(&self, provider: &Provider) -> Result<Arc<dyn ProviderManager>> {
        Ok(Arc::new(CommandProviderManager::new(provider)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn provider(dir: &Path, upload: &str, delete: &str) -> Provider {
        let up = dir.join("upload.sh");
        let del = dir.join("delete.sh");
        fs::write(&up, upload).unwrap();
        fs::write(&del, delete).unwrap();
        Provider {
            name: "cloud".to_string(),
            manage_images: true,
            image_type: "qcow2".to_string(),
            image_name_format: "{image_name}-{timestamp}".to_string(),
            post_upload_hook: None,
            upload_command: Some(format!("sh {}", up.display())),
            delete_command: Some(format!("sh {}", del.display())),
            diskimages: Vec::new(),
        }
    }

    #[test]
    fn upload_returns_last_stdout_line() {
        let tmp = TempDir::new().unwrap();
        let record = tmp.path().join("record");
        let script = format!(
            "echo progress\necho \"$1 $3 $IMAGE_MD5 $IMAGE_METADATA\" > {}\necho ext-$1\n",
            record.display()
        );
        let manager = CommandProviderManager::new(&provider(tmp.path(), &script, "exit 0\n"));
        let metadata = BTreeMap::from([("team".to_string(), "infra".to_string())]);
        let id = manager
            .upload_image(&UploadRequest {
                external_name: "base-1",
                file: Path::new("/tmp/base-0000000001.qcow2"),
                image_type: "qcow2",
                metadata: &metadata,
                md5: Some("abc"),
                sha256: None,
            })
            .unwrap();
        assert_eq!(id, "ext-base-1");
        let seen = fs::read_to_string(record).unwrap();
        assert_eq!(seen.trim(), r#"base-1 qcow2 abc {"team":"infra"}"#);
    }

    #[test]
    fn failing_commands_are_errors() {
        let tmp = TempDir::new().unwrap();
        let manager = CommandProviderManager::new(&provider(
            tmp.path(),
            "echo quota exceeded >&2\nexit 3\n",
            "exit 1\n",
        ));
        let metadata = BTreeMap::new();
        let err = manager
            .upload_image(&UploadRequest {
                external_name: "base-1",
                file: Path::new("/tmp/x.qcow2"),
                image_type: "qcow2",
                metadata: &metadata,
                md5: None,
                sha256: None,
            })
            .unwrap_err();
        assert!(format!("{err:#}").contains("quota exceeded"));
        assert!(manager.delete_image("base-1", "ext-1").is_err());
    }

    #[test]
    fn missing_delete_command_is_reported() {
        let tmp = TempDir::new().unwrap();
        let mut config = provider(tmp.path(), "echo id\n", "exit 0\n");
        config.delete_command = None;
        let manager = CommandProviders.manager(&config).unwrap();
        let err = manager.delete_image("base-1", "id").unwrap_err();
        assert!(err.to_string().contains("no delete_command"));
    }
}
