use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use image_builder::config::{BuilderConfig, ConfigSource};
use image_builder::images::ImageStore;
use image_builder::model::{now, BuildState};
use image_builder::provider::CommandProviders;
use image_builder::store::{is_lock_contention, FsStore};
use image_builder::Builder;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:\n  image-builder run <config>\n  image-builder image-build <config> <image>\n  image-builder image-pause <config> <image>\n  image-builder image-unpause <config> <image>\n  image-builder dib-image-list <config>\n  image-builder image-list <config>\n  image-builder dib-image-delete <config> <image>-<build>"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, config] if cmd == "run" => run(Path::new(config)),
        [cmd, config, image] if cmd == "image-build" => {
            let images = open_images(Path::new(config))?.1;
            images.submit_build_request(image)?;
            println!("build requested for '{image}'");
            Ok(())
        }
        [cmd, config, image] if cmd == "image-pause" || cmd == "image-unpause" => {
            let images = open_images(Path::new(config))?.1;
            let paused = cmd == "image-pause";
            images.set_image_paused(image, paused)?;
            println!("'{image}' {}", if paused { "paused" } else { "unpaused" });
            Ok(())
        }
        [cmd, config] if cmd == "dib-image-list" => dib_image_list(Path::new(config)),
        [cmd, config] if cmd == "image-list" => image_list(Path::new(config)),
        [cmd, config, id] if cmd == "dib-image-delete" => {
            dib_image_delete(Path::new(config), id)
        }
        _ => bail!(usage()),
    }
}

fn open_images(config_path: &Path) -> Result<(BuilderConfig, ImageStore)> {
    let config = BuilderConfig::load(config_path)?;
    let store = FsStore::open(&config.store.root)
        .with_context(|| format!("opening store '{}'", config.store.root.display()))?;
    Ok((config, ImageStore::new(Arc::new(store))))
}

fn run(config_path: &Path) -> Result<()> {
    let config = BuilderConfig::load(config_path)?;
    let store = FsStore::open(&config.store.root)
        .with_context(|| format!("opening store '{}'", config.store.root.display()))?;

    // Handlers are installed before the workers start.
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("installing signal handlers")?;
    image_builder::stats::register();

    let mut builder = Builder::new(
        Arc::new(store),
        ConfigSource::File(config_path.to_path_buf()),
        Arc::new(CommandProviders),
    );
    builder.start()?;

    if let Some(signal) = signals.forever().next() {
        tracing::info!(signal, "shutdown requested");
    }
    builder.stop();
    Ok(())
}

fn format_time(ts: f64) -> String {
    match OffsetDateTime::from_unix_timestamp(ts as i64) {
        Ok(t) => format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
            t.year(),
            t.month() as u8,
            t.day(),
            t.hour(),
            t.minute(),
            t.second()
        ),
        Err(_) => "-".to_string(),
    }
}

fn format_age(state_time: f64) -> String {
    let secs = (now() - state_time).max(0.0) as u64;
    format!(
        "{:02}:{:02}:{:02}:{:02}",
        secs / 86_400,
        secs / 3600 % 24,
        secs / 60 % 60,
        secs % 60
    )
}

fn dib_image_list(config_path: &Path) -> Result<()> {
    let (_, images) = open_images(config_path)?;
    println!(
        "{:<24} {:<12} {:<10} {:<20} {:<20} {:<12}",
        "ID", "IMAGE", "STATE", "BUILDER", "FORMATS", "AGE"
    );
    for image in images.get_image_names()? {
        for build in images.get_builds(&image, &[])? {
            println!(
                "{:<24} {:<12} {:<10} {:<20} {:<20} {:<12}",
                build.file_base(),
                image,
                build.state,
                build.builder.as_deref().unwrap_or("-"),
                build.formats.join(","),
                format_age(build.state_time)
            );
        }
    }
    Ok(())
}

fn image_list(config_path: &Path) -> Result<()> {
    let (_, images) = open_images(config_path)?;
    println!(
        "{:<12} {:<12} {:<10} {:<12} {:<28} {:<24} {:<10} {:<20}",
        "BUILD", "UPLOAD", "PROVIDER", "IMAGE", "EXTERNAL NAME", "EXTERNAL ID", "STATE", "UPDATED"
    );
    for image in images.get_image_names()? {
        for build_id in images.get_build_ids(&image)? {
            for provider in images.get_build_providers(&image, &build_id)? {
                for upload in images.get_uploads(&image, &build_id, &provider, &[])? {
                    println!(
                        "{:<12} {:<12} {:<10} {:<12} {:<28} {:<24} {:<10} {:<20}",
                        build_id,
                        upload.id,
                        provider,
                        image,
                        upload.external_name.as_deref().unwrap_or("-"),
                        upload.external_id.as_deref().unwrap_or("-"),
                        upload.state,
                        format_time(upload.state_time)
                    );
                }
            }
        }
    }
    Ok(())
}

fn dib_image_delete(config_path: &Path, id: &str) -> Result<()> {
    let Some((image, build_id)) = id.rsplit_once('-') else {
        bail!("expected <image>-<build>, got '{id}'");
    };
    let (_, images) = open_images(config_path)?;

    let _lock = match images.image_build_number_lock(image, build_id, false) {
        Ok(lock) => lock,
        Err(err) if is_lock_contention(&err) => {
            bail!("build '{id}' is locked by another process; try again")
        }
        Err(err) => return Err(err),
    };
    let Some(mut build) = images.get_build(image, build_id)? else {
        bail!("build '{id}' not found");
    };
    if build.state == BuildState::Building {
        bail!("build '{id}' is still building");
    }
    build.set_state(BuildState::Deleting);
    images.store_build(image, &build, Some(build_id))?;
    println!("build '{id}' marked for deletion");
    Ok(())
}
