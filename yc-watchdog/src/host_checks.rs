//! Host environment checks for the watchdog.
//!
//! Validates that required executables are reachable and that the
//! control-plane CLI is recent enough.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use yc_control::Version;

use crate::error::{Error, Result};

/// Resolve an executable the way a shell would.
///
/// Names containing a path separator are checked as-is; bare names are
/// searched for in each `PATH` entry.
pub fn find_executable(name: &Path) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    find_executable_in(name, &path_var)
}

/// Resolve an executable against an explicit `PATH` value.
pub fn find_executable_in(name: &Path, path_var: &OsStr) -> Option<PathBuf> {
    if name.components().count() > 1 || name.is_absolute() {
        return is_executable(name).then(|| name.to_path_buf());
    }

    std::env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Commands from `commands` that cannot be found on PATH.
pub fn missing_commands(commands: &[String]) -> Vec<&str> {
    commands
        .iter()
        .filter(|cmd| find_executable(Path::new(cmd.as_str())).is_none())
        .map(String::as_str)
        .collect()
}

/// Check that the detected CLI version is not below the required one.
pub fn check_tool_version(found: Version, required: Version) -> Result<()> {
    if found < required {
        Err(Error::Version { found, required })
    } else {
        Ok(())
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
