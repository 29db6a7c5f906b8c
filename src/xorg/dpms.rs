use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use crate::xorg::procfs::FIELD_CAP;

/// Server-side refusal signature that marks an attempt as [`DpmsOutcome::Rejected`].
pub const REJECTION_SIGNATURE: &str = "No protocol specified";

/// Hidden subcommand under which the helper re-executes this binary.
pub const HELPER_SUBCOMMAND: &str = "x11-dpms";

const DISPLAY_ENV: &str = "DISPLAY";
const XAUTHORITY_ENV: &str = "XAUTHORITY";

/// What one helper invocation is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperRequest {
    pub display: String,
    pub authority: Option<PathBuf>,
    pub power_on: bool,
}

/// Exit status and bounded stderr of a finished helper.
#[derive(Debug, Clone)]
pub struct HelperOutput {
    pub success: bool,
    pub stderr: String,
}

type HelperRunner = Arc<dyn Fn(&HelperRequest) -> Result<HelperOutput> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpmsOutcome {
    Applied,
    Rejected,
    Failed,
}

/// One classified helper invocation; the diagnostic is the captured stderr.
#[derive(Debug, Clone)]
pub struct DpmsAttempt {
    pub outcome: DpmsOutcome,
    pub diagnostic: String,
}

/// Changes a session's DPMS level through an isolated helper process.
#[derive(Clone)]
pub struct DpmsInvoker {
    runner: HelperRunner,
}

impl Default for DpmsInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl DpmsInvoker {
    pub fn new() -> Self {
        Self {
            runner: Arc::new(spawn_helper),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_runner(runner: HelperRunner) -> Self {
        Self { runner }
    }

    pub fn invoke(&self, display_name: &str, authority: Option<&Path>, power_on: bool) -> DpmsAttempt {
        let request = HelperRequest {
            display: display_name.to_string(),
            authority: authority.map(Path::to_path_buf),
            power_on,
        };
        match (self.runner)(&request) {
            Ok(output) => DpmsAttempt {
                outcome: classify(output.success, &output.stderr),
                diagnostic: output.stderr,
            },
            Err(err) => {
                warn!(display = display_name, error = %err, "X11 helper could not be run");
                DpmsAttempt {
                    outcome: DpmsOutcome::Failed,
                    diagnostic: String::new(),
                }
            }
        }
    }
}

/// The refusal signature dominates the exit status: the server can reject the
/// connection while the helper still manages an orderly exit.
fn classify(success: bool, stderr: &str) -> DpmsOutcome {
    if stderr.contains(REJECTION_SIGNATURE) {
        DpmsOutcome::Rejected
    } else if success {
        DpmsOutcome::Applied
    } else {
        DpmsOutcome::Failed
    }
}

/// Re-execute this binary under [`HELPER_SUBCOMMAND`] with the session
/// environment prepared: neutral locale, target display, credential file set
/// or removed. Stderr is piped back and clamped to [`FIELD_CAP`].
fn spawn_helper(request: &HelperRequest) -> Result<HelperOutput> {
    let exe = env::current_exe().context("failed to locate own executable")?;
    let mut command = Command::new(exe);
    command
        .arg(HELPER_SUBCOMMAND)
        .arg(if request.power_on { "on" } else { "off" })
        .env("LANG", "C")
        .env(DISPLAY_ENV, &request.display)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    match &request.authority {
        Some(path) => {
            command.env(XAUTHORITY_ENV, path);
        }
        None => {
            command.env_remove(XAUTHORITY_ENV);
        }
    }

    let mut child = command.spawn().context("failed to spawn X11 helper")?;
    let stderr = match child.stderr.take() {
        Some(pipe) => read_bounded(pipe, FIELD_CAP),
        None => String::new(),
    };
    let status = child.wait().context("failed to wait for X11 helper")?;
    Ok(HelperOutput {
        success: status.success(),
        stderr,
    })
}

/// Drain `pipe` to EOF, keeping at most `cap` bytes.
fn read_bounded(mut pipe: impl Read, cap: usize) -> String {
    let mut kept: Vec<u8> = Vec::with_capacity(cap);
    let mut scratch = [0u8; 256];
    loop {
        match pipe.read(&mut scratch) {
            Ok(0) => break,
            Ok(n) => {
                let keep = n.min(cap - kept.len());
                kept.extend_from_slice(&scratch[..keep]);
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}
