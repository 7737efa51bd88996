//! Provider managers: the narrow interface to cloud image services.
//!
//! Workers never talk to a cloud directly. They resolve a
//! [`ProviderManager`] for a configured [`Provider`] through a
//! [`ProviderManagers`] registry and call `upload_image` / `delete_image`.

mod command;

pub use command::{CommandProviderManager, CommandProviders};

use crate::config::Provider;
use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Everything a provider needs to upload one image file.
#[derive(Debug, Clone)]
pub struct UploadRequest<'a> {
    pub external_name: &'a str,
    pub file: &'a Path,
    pub image_type: &'a str,
    pub metadata: &'a BTreeMap<String, String>,
    pub md5: Option<&'a str>,
    pub sha256: Option<&'a str>,
}

pub trait ProviderManager: Send + Sync + fmt::Debug {
    /// Upload an image; returns the provider's id for it.
    fn upload_image(&self, request: &UploadRequest<'_>) -> Result<String>;

    fn delete_image(&self, external_name: &str, external_id: &str) -> Result<()>;
}

/// Resolves the manager responsible for a configured provider.
pub trait ProviderManagers: Send + Sync + fmt::Debug {
    fn manager(&self, provider: &Provider) -> Result<Arc<dyn ProviderManager>>;
}
