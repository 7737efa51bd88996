//! Running the external image build tool.
//!
//! Output from stdout and stderr is drained by reader threads into a channel
//! and written to the per-build log. The runner polls the channel with a
//! bounded timeout and checks the build deadline after every drained chunk
//! and after every poll timeout, so a chatty build cannot starve the check.

use crate::config::{split_command, BuilderConfig, DiskImage};
use crate::worker::StopSignal;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const QEMU_IMG_COMPAT: &str = "compat=0.10";

/// Fully resolved build tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DibCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl DibCommand {
    /// `{dib_cmd} -x -t {types} --checksum --no-tmpfs [--qemu-img-options ..] -o {output} {elements}`
    pub fn new(config: &BuilderConfig, image: &DiskImage, output: &Path) -> Result<Self> {
        let (program, mut args) = split_command(&image.dib_cmd)
            .with_context(|| format!("parsing dib_cmd of diskimage '{}'", image.name))?;
        args.extend([
            "-x".to_string(),
            "-t".to_string(),
            image.formats.join(","),
            "--checksum".to_string(),
            "--no-tmpfs".to_string(),
        ]);
        if image.formats.iter().any(|format| format == "qcow2") {
            args.extend([
                "--qemu-img-options".to_string(),
                QEMU_IMG_COMPAT.to_string(),
            ]);
        }
        args.extend(["-o".to_string(), output.display().to_string()]);
        args.extend(image.elements.iter().cloned());

        let mut env = Vec::new();
        if let Some(release) = &image.release {
            env.push(("DIB_RELEASE".to_string(), release.clone()));
        }
        env.push(("DIB_IMAGE_NAME".to_string(), image.name.clone()));
        env.push((
            "DIB_IMAGE_FILENAME".to_string(),
            output.display().to_string(),
        ));
        if let Some(elements) = &config.elements_dir {
            env.push(("ELEMENTS_PATH".to_string(), elements.display().to_string()));
        }
        env.extend(image.env_vars.iter().map(|(k, v)| (k.clone(), v.clone())));

        Ok(Self { program, args, env })
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a build subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Exited on its own; `None` when killed by a signal.
    Exited(Option<i32>),
    TimedOut,
    /// Killed because the worker is shutting down.
    Stopped,
}

impl BuildOutcome {
    pub fn succeeded(self) -> bool {
        self == BuildOutcome::Exited(Some(0))
    }

    /// Exit status as reported in metrics; -1 when there is none.
    pub fn return_code(self) -> i32 {
        match self {
            BuildOutcome::Exited(Some(code)) => code,
            _ => -1,
        }
    }
}

/// Run `cmd`, logging combined output to `log_path`.
///
/// Spawn failures are errors; everything after spawn resolves to an outcome.
pub fn run_build(
    cmd: &DibCommand,
    log_path: &Path,
    timeout: Duration,
    stop: &StopSignal,
) -> Result<BuildOutcome> {
    let mut log = File::create(log_path)
        .with_context(|| format!("creating build log '{}'", log_path.display()))?;

    let mut child = Command::new(&cmd.program)
        .args(&cmd.args)
        .envs(cmd.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to exec '{}'", cmd.display()))?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, tx.clone());
    }
    drop(tx);

    let start = Instant::now();
    let expired = || start.elapsed() > timeout;

    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(chunk) => {
                log.write_all(&chunk)
                    .with_context(|| format!("writing build log '{}'", log_path.display()))?;
                if expired() {
                    return kill(&mut child, BuildOutcome::TimedOut);
                }
                if stop.is_stopped() {
                    return kill(&mut child, BuildOutcome::Stopped);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if expired() {
                    return kill(&mut child, BuildOutcome::TimedOut);
                }
                if stop.is_stopped() {
                    return kill(&mut child, BuildOutcome::Stopped);
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = child.wait().context("waiting for build process")?;
    let code = status.code();
    let shown = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
    writeln!(log, "Exit code: {shown}")
        .with_context(|| format!("writing build log '{}'", log_path.display()))?;
    Ok(BuildOutcome::Exited(code))
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R, tx: mpsc::Sender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

fn kill(child: &mut Child, outcome: BuildOutcome) -> Result<BuildOutcome> {
    let _ = child.kill();
    child.wait().context("reaping killed build process")?;
    Ok(outcome)
}

/// `{log_dir}/{name}-{build_id}.log`
pub fn build_log_path(log_dir: &Path, name: &str, build_id: &str) -> PathBuf {
    log_dir.join(format!("{name}-{build_id}.log"))
}

/// Keep the newest `retention` (at least 1) build logs of `name`.
/// Negative retention disables pruning.
pub fn prune_build_logs(log_dir: &Path, name: &str, retention: i64) -> Result<()> {
    if retention < 0 {
        return Ok(());
    }
    let keep = usize::try_from(retention.max(1)).unwrap_or(1);
    let mut logs = Vec::new();
    for entry in fs::read_dir(log_dir)
        .with_context(|| format!("reading build log directory '{}'", log_dir.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating build log directory '{}'", log_dir.display()))?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if is_build_log_of(file_name, name) {
            logs.push(file_name.to_string());
        }
    }
    logs.sort();
    let excess = logs.len().saturating_sub(keep);
    for file_name in logs.into_iter().take(excess) {
        let path = log_dir.join(&file_name);
        tracing::info!(path = %path.display(), "deleting old build log");
        fs::remove_file(&path)
            .with_context(|| format!("removing build log '{}'", path.display()))?;
    }
    Ok(())
}

fn is_build_log_of(file_name: &str, name: &str) -> bool {
    file_name
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|rest| rest.strip_suffix(".log"))
        .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
}
