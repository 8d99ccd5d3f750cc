//! Monitor loop - keeps every configured VM in an acceptable state.
//!
//! Each poll cycle queries every VM, classifies the reported status and
//! issues a start for anything that is not `RUNNING` or `STARTING`. Nothing
//! is remembered between cycles: a VM that was started is only confirmed
//! healthy by the next poll.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};
use yc_control::{ControlPlane, Health, VmStatus};

use crate::config::Config;
use crate::error::{Error, Result};

/// Default pause between poll cycles.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// What the monitor did about one VM in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Status acceptable, nothing to do
    None,
    /// Start command accepted by the control plane
    Started,
    /// Start command failed
    StartFailed(String),
}

/// Outcome of checking one VM.
#[derive(Debug, Clone)]
pub struct VmReport {
    pub vm: String,
    /// Reported status, or the reason it could not be determined
    pub status: std::result::Result<VmStatus, String>,
    pub action: Action,
}

impl VmReport {
    pub fn health(&self) -> Health {
        match self.status {
            Ok(ref status) => status.health(),
            Err(_) => Health::Unacceptable,
        }
    }
}

/// Outcome of one poll cycle, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub reports: Vec<VmReport>,
}

impl CycleReport {
    /// VMs a start was issued for (successfully or not).
    pub fn healed(&self) -> impl Iterator<Item = &str> {
        self.reports
            .iter()
            .filter(|r| r.action != Action::None)
            .map(|r| r.vm.as_str())
    }

    pub fn healthy_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.health().is_acceptable())
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.status.is_err() || matches!(r.action, Action::StartFailed(_)))
            .count()
    }
}

/// Polls VM status through a [`ControlPlane`] and restarts unhealthy VMs.
pub struct Monitor {
    /// VMs to watch, in check order
    vms: Vec<String>,
    /// Status provider and start command
    control: Arc<dyn ControlPlane>,
    /// Pause between the end of one cycle and the start of the next
    interval: Duration,
    /// Checks in flight at once within a cycle
    concurrency: usize,
}

impl Monitor {
    /// Create a monitor. An empty VM list is a fatal configuration error.
    pub fn new(vms: Vec<String>, control: Arc<dyn ControlPlane>) -> Result<Self> {
        if vms.is_empty() {
            return Err(Error::Config("VMs are not defined".to_string()));
        }
        Ok(Self {
            vms,
            control,
            interval: DEFAULT_INTERVAL,
            concurrency: 1,
        })
    }

    /// Create a monitor using the VM list, interval and concurrency from config.
    pub fn from_config(config: &Config, control: Arc<dyn ControlPlane>) -> Result<Self> {
        Ok(Self::new(config.vms.clone(), control)?
            .with_interval(config.interval())
            .with_concurrency(config.concurrency))
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn vms(&self) -> &[String] {
        &self.vms
    }

    /// Query the current status of a VM.
    pub async fn query_status(&self, vm: &str) -> yc_control::Result<VmStatus> {
        debug!("Checking state of VM {}", vm);
        let status = self.control.query_status(vm).await?;
        debug!("VM {} status: {}", vm, status);
        Ok(status)
    }

    /// Issue a start for a VM. The result is only confirmed by the next poll.
    pub async fn heal(&self, vm: &str) -> yc_control::Result<()> {
        self.control.start_instance(vm).await
    }

    /// Query, classify and (if needed) heal a single VM. Never fails:
    /// errors are logged and recorded in the report.
    pub async fn check_vm(&self, vm: &str) -> VmReport {
        let status = self.query_status(vm).await.map_err(|e| {
            error!("VM {}: status query failed: {}", vm, e);
            e.to_string()
        });

        let health = match status {
            Ok(ref s) => s.health(),
            Err(_) => Health::Unacceptable,
        };

        let action = match health {
            Health::Acceptable => Action::None,
            Health::Unacceptable => {
                match status {
                    Ok(ref s) => error!("VM: {} is {}, not RUNNING.. starting it", vm, s),
                    Err(_) => warn!("VM: {} state unknown.. starting it", vm),
                }
                match self.heal(vm).await {
                    Ok(()) => {
                        info!("Start issued for VM {}", vm);
                        Action::Started
                    }
                    Err(e) => {
                        error!("VM {}: start failed: {}", vm, e);
                        Action::StartFailed(e.to_string())
                    }
                }
            }
        };

        VmReport {
            vm: vm.to_string(),
            status,
            action,
        }
    }

    /// Run one poll cycle over all VMs.
    ///
    /// With concurrency 1 VMs are checked strictly in order; otherwise up to
    /// `concurrency` checks run at once. Reports are always in configuration
    /// order, and a failing VM never stops the others from being checked.
    pub async fn run_cycle(&self) -> CycleReport {
        let reports: Vec<VmReport> = if self.concurrency == 1 {
            let mut reports = Vec::with_capacity(self.vms.len());
            for vm in &self.vms {
                reports.push(self.check_vm(vm).await);
            }
            reports
        } else {
            stream::iter(&self.vms)
                .map(|vm| self.check_vm(vm))
                .buffered(self.concurrency)
                .collect()
                .await
        };

        let report = CycleReport { reports };
        info!(
            "Poll cycle complete: {} VMs, {} healthy, {} started, {} errors",
            report.reports.len(),
            report.healthy_count(),
            report.healed().count(),
            report.failed_count()
        );
        report
    }

    /// Run poll cycles until `shutdown` resolves. Returns the number of
    /// completed cycles.
    pub async fn run_until<F>(&self, shutdown: F) -> u64
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut cycles = 0;

        info!(
            "Monitoring {} VMs every {:?}: {:?}",
            self.vms.len(),
            self.interval,
            self.vms
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = self.run_cycle() => cycles += 1,
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Monitoring stopped after {} cycles", cycles);
        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    /// Scripted control plane recording every call.
    #[derive(Default)]
    struct MockControlPlane {
        statuses: HashMap<String, std::result::Result<String, &'static str>>,
        failing_starts: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl MockControlPlane {
        fn with(mut self, vm: &str, status: &str) -> Self {
            self.statuses.insert(vm.to_string(), Ok(status.to_string()));
            self
        }

        fn with_error(mut self, vm: &str, kind: &'static str) -> Self {
            self.statuses.insert(vm.to_string(), Err(kind));
            self
        }

        fn failing_start(mut self, vm: &str) -> Self {
            self.failing_starts.push(vm.to_string());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn starts(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| c.strip_prefix("start ").map(String::from))
                .collect()
        }
    }

    #[async_trait]
    impl ControlPlane for MockControlPlane {
        async fn query_status(&self, vm: &str) -> yc_control::Result<VmStatus> {
            self.calls.lock().unwrap().push(format!("show {vm}"));
            match self.statuses.get(vm) {
                Some(Ok(raw)) => yc_control::parse_status(vm, &format!("status: {raw}")),
                Some(Err("missing")) => Err(yc_control::Error::MissingStatus(vm.to_string())),
                _ => Err(yc_control::Error::NoOutput(vm.to_string())),
            }
        }

        async fn start_instance(&self, vm: &str) -> yc_control::Result<()> {
            self.calls.lock().unwrap().push(format!("start {vm}"));
            if self.failing_starts.iter().any(|v| v == vm) {
                return Err(yc_control::Error::Io(std::io::Error::other("start rejected")));
            }
            Ok(())
        }
    }

    fn vms(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn monitor(names: &[&str], mock: &Arc<MockControlPlane>) -> Monitor {
        let control: Arc<dyn ControlPlane> = mock.clone();
        Monitor::new(vms(names), control).unwrap()
    }

    #[test]
    fn test_empty_vm_list_is_fatal() {
        let control: Arc<dyn ControlPlane> = Arc::new(MockControlPlane::default());
        assert!(matches!(Monitor::new(Vec::new(), control), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_heals_only_unacceptable_vm() {
        let mock = Arc::new(
            MockControlPlane::default()
                .with("vm-a", "RUNNING")
                .with("vm-b", "STOPPED"),
        );
        let report = monitor(&["vm-a", "vm-b"], &mock).run_cycle().await;

        assert_eq!(mock.starts(), vec!["vm-b"]);
        assert_eq!(report.healed().collect::<Vec<_>>(), vec!["vm-b"]);
        assert_eq!(report.healthy_count(), 1);
        assert_eq!(report.reports[0].action, Action::None);
        assert_eq!(report.reports[1].action, Action::Started);
    }

    #[tokio::test]
    async fn test_heal_called_iff_unacceptable() {
        let statuses = ["RUNNING", "STARTING", "STOPPED", "ERROR", "PROVISIONING", "STOPPING"];
        let mut mock = MockControlPlane::default();
        for status in statuses {
            mock = mock.with(status, status);
        }
        let mock = Arc::new(mock);

        monitor(&statuses, &mock).run_cycle().await;

        assert_eq!(
            mock.starts(),
            vec!["STOPPED", "ERROR", "PROVISIONING", "STOPPING"]
        );
    }

    #[tokio::test]
    async fn test_query_failure_is_isolated() {
        let mock = Arc::new(
            MockControlPlane::default()
                .with_error("vm-a", "missing")
                .with_error("vm-b", "absent")
                .with("vm-c", "RUNNING"),
        );
        let report = monitor(&["vm-a", "vm-b", "vm-c"], &mock).run_cycle().await;

        // Every VM was still queried, in order
        assert_eq!(
            mock.calls(),
            vec!["show vm-a", "start vm-a", "show vm-b", "start vm-b", "show vm-c"]
        );
        assert!(report.reports[0].status.as_ref().unwrap_err().contains("no status line"));
        assert!(report.reports[1].status.as_ref().unwrap_err().contains("absent"));
        assert_eq!(report.reports[2].status, Ok(VmStatus::Running));
        assert_eq!(report.failed_count(), 2);
    }

    #[tokio::test]
    async fn test_start_failure_does_not_stop_cycle() {
        let mock = Arc::new(
            MockControlPlane::default()
                .with("vm-a", "STOPPED")
                .with("vm-b", "STOPPED")
                .failing_start("vm-a"),
        );
        let report = monitor(&["vm-a", "vm-b"], &mock).run_cycle().await;

        assert_eq!(mock.starts(), vec!["vm-a", "vm-b"]);
        assert!(matches!(
            report.reports[0].action,
            Action::StartFailed(ref e) if e.contains("start rejected")
        ));
        assert_eq!(report.reports[1].action, Action::Started);
    }

    #[tokio::test]
    async fn test_duplicate_vms_checked_twice() {
        let mock = Arc::new(MockControlPlane::default().with("vm-a", "RUNNING"));
        monitor(&["vm-a", "vm-a"], &mock).run_cycle().await;
        assert_eq!(mock.calls(), vec!["show vm-a", "show vm-a"]);
    }

    #[tokio::test]
    async fn test_concurrent_cycle_keeps_order() {
        let names: Vec<String> = (0..10).map(|i| format!("vm-{i}")).collect();
        let mut mock = MockControlPlane::default();
        for (i, name) in names.iter().enumerate() {
            mock = mock.with(name, if i % 3 == 0 { "STOPPED" } else { "RUNNING" });
        }
        let mock = Arc::new(mock);
        let control: Arc<dyn ControlPlane> = mock.clone();

        let report = Monitor::new(names.clone(), control)
            .unwrap()
            .with_concurrency(4)
            .run_cycle()
            .await;

        let reported: Vec<&str> = report.reports.iter().map(|r| r.vm.as_str()).collect();
        assert_eq!(reported, names.iter().map(String::as_str).collect::<Vec<_>>());

        let mut starts = mock.starts();
        starts.sort();
        assert_eq!(starts, vec!["vm-0", "vm-3", "vm-6", "vm-9"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_repeats_every_interval() {
        let mock = Arc::new(MockControlPlane::default().with("vm-a", "STOPPED"));
        let monitor = monitor(&["vm-a"], &mock).with_interval(Duration::from_secs(60));

        // Cycles at t=0, 60, 120; shutdown at 150 interrupts the third sleep
        let cycles = monitor
            .run_until(tokio::time::sleep(Duration::from_secs(150)))
            .await;

        assert_eq!(cycles, 3);
        // Status is re-queried every cycle, and healed every time it is still stopped
        assert_eq!(
            mock.calls(),
            vec![
                "show vm-a", "start vm-a", "show vm-a", "start vm-a", "show vm-a", "start vm-a"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_stops_immediately_on_shutdown() {
        let mock = Arc::new(MockControlPlane::default().with("vm-a", "RUNNING"));
        let cycles = monitor(&["vm-a"], &mock).run_until(async {}).await;

        assert_eq!(cycles, 0);
        assert!(mock.calls().is_empty());
    }
}
