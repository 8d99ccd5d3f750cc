//! Installation of missing host packages and of the `yc` CLI.

use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::Output;

use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, warn};
use yc_control::YcCli;

use crate::error::{Error, Result};
use crate::host_checks::find_executable;

/// Install packages with the host package manager.
///
/// `installer` is the argv prefix (e.g. `apt-get install -y`); packages are
/// appended. The installer's output goes to the log.
pub async fn install_packages(installer: &[String], packages: &[String]) -> Result<()> {
    let (program, args) = installer
        .split_first()
        .ok_or_else(|| Error::Dependency("package manager command is empty".to_string()))?;

    info!("Installing packages: {}", packages.join(" "));
    let output = Command::new(program)
        .args(args)
        .args(packages)
        .output()
        .await
        .map_err(|e| Error::Dependency(format!("Failed to run '{program}': {e}")))?;
    log_output(program, &output);

    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Dependency(format!(
            "'{}' failed ({}): {}",
            installer.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Download the `yc` installer script into a temporary file.
pub async fn download_installer(url: &str) -> Result<NamedTempFile> {
    info!("Downloading yc installer from {}", url);
    let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::Setup(format!("Failed to download installer: {e}")))?;
    let script = response
        .bytes()
        .await
        .map_err(|e| Error::Setup(format!("Failed to read installer: {e}")))?;

    let mut file = tempfile::Builder::new()
        .prefix("yc-install-")
        .suffix(".sh")
        .tempfile()?;
    file.write_all(&script)?;
    file.flush()?;
    debug!("Saved installer ({} bytes) to {}", script.len(), file.path().display());
    Ok(file)
}

/// Run the installer script into `install_dir` without touching shell rc files.
pub async fn run_installer(script: &Path, install_dir: &Path) -> Result<()> {
    info!("Running yc installer into {}", install_dir.display());
    let output = Command::new("bash")
        .arg(script)
        .arg("-i")
        .arg(install_dir)
        .arg("-n")
        .output()
        .await
        .map_err(|e| Error::Setup(format!("Failed to run installer: {e}")))?;
    log_output("install.sh", &output);

    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Setup(format!(
            "yc installer failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Download and install `yc`, returning the path of the installed binary.
pub async fn install_yc(url: &str, install_dir: &Path) -> Result<PathBuf> {
    let script = download_installer(url).await?;
    run_installer(script.path(), install_dir).await?;

    let binary = install_dir.join("bin").join("yc");
    find_executable(&binary).ok_or_else(|| {
        Error::Setup(format!(
            "yc installer finished but {} is missing",
            binary.display()
        ))
    })
}

/// Run the interactive `yc init`.
///
/// Needs a terminal; without one this is a setup failure for the operator to
/// resolve by running `yc init` manually.
pub async fn run_init(cli: &YcCli) -> Result<()> {
    if !std::io::stdin().is_terminal() {
        return Err(Error::Setup(format!(
            "yc has no configured profile and needs interactive setup; run '{} init' in a terminal",
            cli.binary().display()
        )));
    }

    info!("Running yc init");
    cli.init()
        .await
        .map_err(|e| Error::Setup(format!("yc init failed: {e}")))
}

fn log_output(program: &str, output: &Output) {
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!("[{}] {}", program, line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        warn!("[{}] {}", program, line);
    }
}
