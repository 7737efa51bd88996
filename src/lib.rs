//! Coordinated disk image build, upload and cleanup workers.
//!
//! Several builder processes share one coordination store. Each runs build
//! workers that invoke an external image tool, upload workers that push
//! finished images to cloud providers, and a cleanup worker that retires old
//! builds and uploads. Exclusive locks in the store keep the processes from
//! duplicating work.
//!
//! # Architecture
//!
//! ```text
//! Builder (orchestrator)
//!     │
//!     ├── BuildWorker.N ──── dib (subprocess) ── images_dir/{image}-{build}.{fmt}
//!     ├── UploadWorker.N ─── ProviderManager::upload_image
//!     └── CleanupWorker.0 ── ProviderManager::delete_image, local files
//!             │
//!             └── ImageStore ── CoordinationStore (FsStore | MemoryStore)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use image_builder::{Builder, ConfigSource, FsStore, CommandProviders};
//! use std::sync::Arc;
//!
//! let config = ConfigSource::File("/etc/image-builder.toml".into());
//! let store = FsStore::open("/var/lib/image-builder/store".as_ref())?;
//! let mut builder = Builder::new(Arc::new(store), config, Arc::new(CommandProviders));
//! builder.start()?;
//! // ...
//! builder.stop();
//! ```

pub mod build_worker;
pub mod builder;
pub mod cleanup_worker;
pub mod config;
pub mod dib;
pub mod dib_file;
pub mod images;
pub mod model;
pub mod preflight;
pub mod provider;
pub mod stats;
pub mod store;
pub mod upload_worker;
pub mod worker;

pub use builder::Builder;
pub use config::{BuilderConfig, ConfigSource};
pub use images::ImageStore;
pub use model::{BuildState, ImageBuild, ImageUpload, UploadState};
pub use provider::{CommandProviders, ProviderManager, ProviderManagers};
pub use store::{CoordinationStore, FsStore, MemoryStore};
