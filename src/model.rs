//! Build and upload records as stored in the coordination store.
//!
//! Records are JSON. Identity fields (`id`, the image and provider names) come
//! from the record's path and are not part of the payload.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Building,
    Ready,
    Failed,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Uploading,
    Ready,
    Failed,
    Deleting,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            BuildState::Building => "building",
            BuildState::Ready => "ready",
            BuildState::Failed => "failed",
            BuildState::Deleting => "deleting",
        })
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            UploadState::Uploading => "uploading",
            UploadState::Ready => "ready",
            UploadState::Failed => "failed",
            UploadState::Deleting => "deleting",
        })
    }
}

/// One build attempt of a diskimage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBuild {
    #[serde(skip)]
    pub id: String,
    #[serde(skip)]
    pub image_name: String,
    pub state: BuildState,
    /// Unix seconds of the last state transition.
    pub state_time: f64,
    /// Hostname of the producing builder.
    #[serde(default)]
    pub builder: Option<String>,
    #[serde(default)]
    pub builder_id: Option<String>,
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub python_path: Option<String>,
    #[serde(default)]
    pub shell_type: Option<String>,
}

impl ImageBuild {
    pub fn new(image_name: &str, state: BuildState) -> Self {
        Self {
            id: String::new(),
            image_name: image_name.to_string(),
            state,
            state_time: now(),
            builder: None,
            builder_id: None,
            formats: Vec::new(),
            username: None,
            python_path: None,
            shell_type: None,
        }
    }

    pub fn set_state(&mut self, state: BuildState) {
        self.state = state;
        self.state_time = now();
    }

    /// Whether the local files of this build belong to `builder_id`.
    pub fn is_local_to(&self, builder_id: &str) -> bool {
        self.builder_id.as_deref() == Some(builder_id)
    }

    /// Seconds since the last state transition.
    pub fn age(&self) -> f64 {
        (now() - self.state_time).max(0.0)
    }

    /// `{image}-{build}`, the base name of the build's local files.
    pub fn file_base(&self) -> String {
        format!("{}-{}", self.image_name, self.id)
    }

    pub fn has_formats(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|format| self.formats.contains(format))
    }
}

/// One upload of a build to one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUpload {
    #[serde(skip)]
    pub id: String,
    #[serde(skip)]
    pub build_id: String,
    #[serde(skip)]
    pub image_name: String,
    #[serde(skip)]
    pub provider_name: String,
    pub state: UploadState,
    pub state_time: f64,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub external_name: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub python_path: Option<String>,
    #[serde(default)]
    pub shell_type: Option<String>,
}

impl ImageUpload {
    pub fn new(build: &ImageBuild, provider_name: &str, state: UploadState) -> Self {
        Self {
            id: String::new(),
            build_id: build.id.clone(),
            image_name: build.image_name.clone(),
            provider_name: provider_name.to_string(),
            state,
            state_time: now(),
            external_id: None,
            external_name: None,
            format: None,
            username: build.username.clone(),
            python_path: build.python_path.clone(),
            shell_type: build.shell_type.clone(),
        }
    }

    pub fn set_state(&mut self, state: UploadState) {
        self.state = state;
        self.state_time = now();
    }
}

/// Current time as fractional unix seconds.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_payload_omits_path_identity() {
        let mut build = ImageBuild::new("base", BuildState::Ready);
        build.id = "0000000003".to_string();
        build.formats = vec!["qcow2".to_string()];
        let json = serde_json::to_value(&build).unwrap();
        assert_eq!(json["state"], "ready");
        assert!(json.get("id").is_none());
        assert!(json.get("image_name").is_none());
        assert_eq!(build.file_base(), "base-0000000003");
    }

    #[test]
    fn missing_optional_fields_default() {
        let upload: ImageUpload =
            serde_json::from_str(r#"{"state":"uploading","state_time":12.5}"#).unwrap();
        assert_eq!(upload.state, UploadState::Uploading);
        assert!(upload.external_id.is_none());
        assert!(upload.id.is_empty());
    }

    #[test]
    fn format_superset_check() {
        let mut build = ImageBuild::new("base", BuildState::Ready);
        build.formats = vec!["qcow2".to_string(), "raw".to_string()];
        assert!(build.has_formats(&["qcow2".to_string()]));
        assert!(!build.has_formats(&["vhd".to_string()]));
        assert!(build.has_formats(&[]));
    }
}
