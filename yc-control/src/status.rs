//! Parsing of `yc compute instance show` output.
//!
//! This is the only place that knows the text layout of the CLI output.

use std::fmt;

use crate::{Error, Result};

/// Instance status values that count as healthy.
const ACCEPTABLE: [&str; 2] = ["RUNNING", "STARTING"];

/// Status of a compute instance as reported for a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStatus {
    Running,
    Starting,
    Stopped,
    Error,
    /// Any other value, kept verbatim (e.g. `PROVISIONING`, `STOPPING`, `CRASHED`).
    Unknown(String),
}

impl VmStatus {
    /// Build a status from the raw value of a `status:` line.
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "RUNNING" => VmStatus::Running,
            "STARTING" => VmStatus::Starting,
            "STOPPED" => VmStatus::Stopped,
            "ERROR" => VmStatus::Error,
            other => VmStatus::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            VmStatus::Running => "RUNNING",
            VmStatus::Starting => "STARTING",
            VmStatus::Stopped => "STOPPED",
            VmStatus::Error => "ERROR",
            VmStatus::Unknown(raw) => raw,
        }
    }

    pub fn health(&self) -> Health {
        classify(self.as_str())
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a VM needs a corrective start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Acceptable,
    Unacceptable,
}

impl Health {
    pub fn is_acceptable(self) -> bool {
        self == Health::Acceptable
    }
}

/// Classify a raw status value. Matching is exact and case-sensitive.
pub fn classify(raw_status: &str) -> Health {
    if ACCEPTABLE.contains(&raw_status) {
        Health::Acceptable
    } else {
        Health::Unacceptable
    }
}

/// Extract the instance status from `yc compute instance show` output.
///
/// Only a top-level `status: <value>` line counts; indented `status:` keys
/// belong to nested objects (disks, network interfaces) and are skipped.
/// Output with no text at all means the instance is absent, which is reported
/// separately from output that lacks a status line.
pub fn parse_status(vm: &str, output: &str) -> Result<VmStatus> {
    if output.trim().is_empty() {
        return Err(Error::NoOutput(vm.to_string()));
    }

    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("status:") {
            let value = rest.trim();
            if !value.is_empty() {
                return Ok(VmStatus::from_raw(value));
            }
        }
    }

    Err(Error::MissingStatus(vm.to_string()))
}
