//! Requirements checker run once before monitoring starts.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};
use yc_control::Version;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::host_checks::{check_tool_version, find_executable, missing_commands};
use crate::install;

/// Environment confirmed by a successful bootstrap.
#[derive(Debug, Clone)]
pub struct Bootstrapped {
    /// Resolved `yc` binary
    pub binary: PathBuf,
    /// Version reported by `yc version`
    pub version: Version,
}

/// Verifies host dependencies, the `yc` CLI and its version.
pub struct RequirementsChecker<'a> {
    config: &'a Config,
}

impl<'a> RequirementsChecker<'a> {
    /// Run every check eagerly, in order: host dependencies, external tool,
    /// tool version.
    pub async fn check(config: &'a Config) -> Result<Bootstrapped> {
        info!("Check requirements..");
        let checker = Self { config };

        checker.verify_dependencies().await?;
        let binary = checker.verify_external_tool().await?;
        let version = checker.verify_runtime_version(&binary).await?;

        info!("All requirements are OK (yc {} at {})", version, binary.display());
        Ok(Bootstrapped { binary, version })
    }

    /// [`check`](Self::check), repeated while it fails with a retryable error
    /// and attempts remain.
    pub async fn check_with_retries(config: &'a Config) -> Result<Bootstrapped> {
        let mut attempt = 1;
        loop {
            match Self::check(config).await {
                Ok(bootstrapped) => return Ok(bootstrapped),
                Err(e) if e.is_retryable() && attempt < config.setup_attempts => {
                    warn!(
                        "Setup attempt {}/{} failed: {}. Retrying in {:?}...",
                        attempt,
                        config.setup_attempts,
                        e,
                        config.setup_retry_delay()
                    );
                    tokio::time::sleep(config.setup_retry_delay()).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Requirements check failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Ensure required host commands exist, installing them if needed.
    pub async fn verify_dependencies(&self) -> Result<()> {
        let requirements = &self.config.requirements;
        let missing = missing_commands(&requirements.commands);
        if missing.is_empty() {
            debug!("Host commands present: {:?}", requirements.commands);
            return Ok(());
        }

        info!("Missing host commands {:?}, trying to install them", missing);
        install::install_packages(&requirements.installer, requirements.packages()).await?;

        let still_missing = missing_commands(&requirements.commands);
        if still_missing.is_empty() {
            info!("Host dependencies installed");
            Ok(())
        } else {
            Err(Error::Dependency(format!(
                "still missing after install: {}",
                still_missing.join(", ")
            )))
        }
    }

    /// Resolve the `yc` binary, installing it when absent, and make sure it
    /// has been initialized.
    pub async fn verify_external_tool(&self) -> Result<PathBuf> {
        let binary = self.resolve_tool().await?;
        self.verify_initialized(&binary).await?;
        Ok(binary)
    }

    /// Run `yc init` unless the CLI already has a configured profile.
    ///
    /// Checked on every bootstrap, not only right after an install, so an
    /// interrupted setup keeps failing until it is completed.
    pub async fn verify_initialized(&self, binary: &Path) -> Result<()> {
        let cli = self.config.control_plane(binary);
        if cli.is_configured().await? {
            debug!("yc profile is configured");
            return Ok(());
        }

        warn!("yc has no configured profile");
        install::run_init(&cli).await?;
        if cli.is_configured().await? {
            info!("yc initialized");
            Ok(())
        } else {
            Err(Error::Setup("yc init finished but no profile is configured".to_string()))
        }
    }

    async fn resolve_tool(&self) -> Result<PathBuf> {
        let yc = &self.config.yc;
        if let Some(binary) = find_executable(&yc.binary) {
            debug!("yc found at {}", binary.display());
            return Ok(binary);
        }

        let install_dir = yc.install_dir();
        // A previous run may have installed it outside PATH
        if let Some(binary) = find_executable(&install_dir.join("bin").join("yc")) {
            info!("yc found in install dir {}", binary.display());
            return Ok(binary);
        }

        info!("yc tool is absent.. trying to install it");
        let binary = install::install_yc(&yc.installer_url, &install_dir).await?;
        info!("yc installed at {}", binary.display());
        Ok(binary)
    }

    /// Check the CLI reports at least the configured minimum version.
    pub async fn verify_runtime_version(&self, binary: &Path) -> Result<Version> {
        let required = self.config.yc.min_version()?;
        let version = self
            .config
            .control_plane(binary)
            .version()
            .await
            .map_err(|e| Error::Setup(format!("Failed to determine yc version: {e}")))?;
        debug!("yc version is {}", version);

        check_tool_version(version, required)?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::{
        Figment,
        providers::{Format, Yaml},
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(yaml: &str) -> Config {
        Config::from_figment(Figment::from(Yaml::string(yaml))).unwrap()
    }

    /// Installer writing a `yc` that lists a profile once
    /// `<install_dir>/profile` exists. Any other subcommand, `init`
    /// included, fails.
    const FAKE_INSTALLER: &str = r#"
while [ $# -gt 0 ]; do
  case "$1" in
    -i) dir="$2"; shift 2 ;;
    *) shift ;;
  esac
done
mkdir -p "$dir/bin"
cat > "$dir/bin/yc" <<'SCRIPT'
#!/bin/sh
root="$(dirname "$0")/.."
case "$1" in
  version) echo 'Yandex Cloud CLI 0.125.0 linux/amd64' ;;
  config) if [ -f "$root/profile" ]; then cat "$root/profile"; fi ;;
  *) exit 1 ;;
esac
SCRIPT
chmod +x "$dir/bin/yc"
"#;

    /// Serve `body` over HTTP on a local port, returning its URL.
    async fn serve_installer(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/install.sh")
    }

    #[tokio::test]
    async fn test_dependencies_already_satisfied() {
        let config = config("vms: [a]\nrequirements:\n  commands: [sh]\n  installer: ['false']");
        // The failing installer is never run
        RequirementsChecker { config: &config }
            .verify_dependencies()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dependency_install_failure_is_fatal() {
        let config = config(
            "vms: [a]\nrequirements:\n  commands: [yc-watchdog-no-such-command]\n  installer: ['false']",
        );
        let err = RequirementsChecker { config: &config }
            .verify_dependencies()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dependency(_)), "{err}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_dependency_still_missing_after_install() {
        let config = config(
            "vms: [a]\nrequirements:\n  commands: [yc-watchdog-no-such-command]\n  installer: ['true']",
        );
        let err = RequirementsChecker { config: &config }
            .verify_dependencies()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("still missing"), "{err}");
    }

    #[tokio::test]
    async fn test_external_tool_found_and_configured() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve_installer(FAKE_INSTALLER).await;
        let binary = install::install_yc(&url, dir.path()).await.unwrap();
        std::fs::write(dir.path().join("profile"), "token: t1\n").unwrap();

        let config = config(&format!("vms: [a]\nyc:\n  binary: {}", binary.display()));
        let resolved = RequirementsChecker { config: &config }
            .verify_external_tool()
            .await
            .unwrap();
        assert_eq!(resolved, binary);
    }

    #[tokio::test]
    async fn test_external_tool_install_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&format!(
            "vms: [a]\nyc:\n  binary: yc-watchdog-no-such-yc\n  installer_url: http://127.0.0.1:9/install.sh\n  install_dir: {}",
            dir.path().display()
        ));
        let err = RequirementsChecker { config: &config }
            .verify_external_tool()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Setup(_)), "{err}");
    }

    #[tokio::test]
    async fn test_retries_setup_failures() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&format!(
            "vms: [a]\nsetup_attempts: 2\nsetup_retry_delay_secs: 0\nrequirements:\n  commands: []\nyc:\n  binary: yc-watchdog-no-such-yc\n  installer_url: http://127.0.0.1:9/install.sh\n  install_dir: {}",
            dir.path().display()
        ));
        let err = RequirementsChecker::check_with_retries(&config).await.unwrap_err();
        assert!(matches!(err, Error::Setup(_)), "{err}");
    }

    #[tokio::test]
    async fn test_setup_fails_until_init_has_run() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve_installer(FAKE_INSTALLER).await;
        let config = config(&format!(
            "vms: [a]\nsetup_attempts: 2\nsetup_retry_delay_secs: 0\nrequirements:\n  commands: []\nyc:\n  binary: yc-watchdog-no-such-yc\n  installer_url: {url}\n  install_dir: {}",
            dir.path().display()
        ));
        let binary = dir.path().join("bin").join("yc");

        // First attempt installs, the retry finds the binary but still no profile
        let err = RequirementsChecker::check_with_retries(&config).await.unwrap_err();
        assert!(matches!(err, Error::Setup(_)), "{err}");
        assert!(binary.exists());

        // A later run is refused too
        let err = RequirementsChecker::check(&config).await.unwrap_err();
        assert!(matches!(err, Error::Setup(_)), "{err}");

        // What `yc init` leaves behind
        std::fs::write(dir.path().join("profile"), "token: t1\n").unwrap();
        let bootstrapped = RequirementsChecker::check(&config).await.unwrap();
        assert_eq!(bootstrapped.binary, binary);
        assert_eq!(bootstrapped.version, Version::new(0, 125, 0));
    }
}
