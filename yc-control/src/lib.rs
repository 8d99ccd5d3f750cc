//! Async wrapper around the Yandex Cloud CLI (`yc`).
//!
//! Every subprocess call to the control plane goes through [`YcCli`]. Callers
//! that only need to observe and restart instances should depend on the
//! [`ControlPlane`] trait so the CLI can be swapped for another provider.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

mod status;
mod version;

pub use status::{classify, parse_status, Health, VmStatus};
pub use version::Version;

/// Default upper bound for a single non-interactive CLI call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("`{command}` did not finish within {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("`{command}` failed ({status}): {output}")]
    CommandFailed {
        command: String,
        status: ExitStatus,
        output: String,
    },
    #[error("VM {0} is absent: no output from control plane")]
    NoOutput(String),
    #[error("VM {0} has no status line in control plane output")]
    MissingStatus(String),
    #[error("Could not parse version from: {0}")]
    VersionParse(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Narrow view of the control plane used by the monitor loop.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Query the current status of a VM.
    async fn query_status(&self, vm: &str) -> Result<VmStatus>;

    /// Ask the control plane to start a VM.
    async fn start_instance(&self, vm: &str) -> Result<()>;
}

/// Handle to the `yc` binary.
#[derive(Debug, Clone)]
pub struct YcCli {
    binary: PathBuf,
    global_args: Vec<OsString>,
    timeout: Duration,
    start_async: bool,
}

impl Default for YcCli {
    fn default() -> Self {
        Self::new("yc")
    }
}

impl YcCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            global_args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            start_async: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a named CLI profile for every call.
    pub fn with_profile(self, profile: &str) -> Self {
        self.with_global_arg("--profile").with_global_arg(profile)
    }

    /// Scope every call to a folder.
    pub fn with_folder_id(self, folder_id: &str) -> Self {
        self.with_global_arg("--folder-id").with_global_arg(folder_id)
    }

    /// Extra argument placed before every subcommand.
    pub fn with_global_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.global_args.push(arg.into());
        self
    }

    /// Whether `start` returns as soon as the operation is accepted.
    pub fn with_async_start(mut self, start_async: bool) -> Self {
        self.start_async = start_async;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `yc compute instance show <vm>`, returning stdout and stderr combined.
    pub async fn show_instance(&self, vm: &str) -> Result<(ExitStatus, String)> {
        let output = self.output(&["compute", "instance", "show", vm]).await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        trace!("yc compute instance show {vm}: {text:?}");
        Ok((output.status, text))
    }

    /// `yc compute instance start <vm>`. A non-zero exit is an error.
    pub async fn start(&self, vm: &str) -> Result<()> {
        let mut args = vec!["compute", "instance", "start", vm];
        if self.start_async {
            args.push("--async");
        }
        let output = self.output(&args).await?;
        check_status(&args, output).map(|_| ())
    }

    /// `yc version`.
    pub async fn version(&self) -> Result<Version> {
        let output = check_status(&["version"], self.output(&["version"]).await?)?;
        let text = String::from_utf8_lossy(&output.stdout);
        Version::find_in(&text).ok_or_else(|| Error::VersionParse(text.trim().to_string()))
    }

    /// `yc config list`: whether the active profile holds any settings.
    ///
    /// A freshly installed CLI lists nothing until `yc init` has run.
    pub async fn is_configured(&self) -> Result<bool> {
        let output = self.output(&["config", "list"]).await?;
        let listed = String::from_utf8_lossy(&output.stdout);
        Ok(output.status.success() && !listed.trim().is_empty())
    }

    /// `yc init`. Interactive: stdio is inherited and no timeout applies.
    pub async fn init(&self) -> Result<()> {
        let status = self
            .command(&["init"])
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command: "yc init".to_string(),
                status,
                output: String::new(),
            })
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.global_args).args(args);
        cmd
    }

    /// Run a non-interactive command, killing it if it outlives the timeout.
    async fn output(&self, args: &[&str]) -> Result<Output> {
        debug!("Running yc {}", args.join(" "));
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(Error::Timeout {
                command: describe(args),
                after: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl ControlPlane for YcCli {
    async fn query_status(&self, vm: &str) -> Result<VmStatus> {
        let (status, text) = self.show_instance(vm).await?;
        match parse_status(vm, &text) {
            Err(Error::MissingStatus(_)) if !status.success() => Err(Error::CommandFailed {
                command: describe(&["compute", "instance", "show", vm]),
                status,
                output: text.trim().to_string(),
            }),
            result => result,
        }
    }

    async fn start_instance(&self, vm: &str) -> Result<()> {
        self.start(vm).await
    }
}

fn check_status(args: &[&str], output: Output) -> Result<Output> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(Error::CommandFailed {
            command: describe(args),
            status: output.status,
            output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn describe(args: &[&str]) -> String {
    format!("yc {}", args.join(" "))
}
