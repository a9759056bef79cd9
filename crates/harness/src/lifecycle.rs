//! Lifecycle Controller.
//!
//! Validates the environment, raises resource limits, and owns the
//! process-wide machine-check polling interval for the duration of the
//! run — setting it high at startup so the OS doesn't steal or
//! auto-clear banks mid-test, and restoring it to a conservative value on
//! every exit path via an RAII guard. Also drives the pre-run MCA flush.
//! Grounded on
//! `original_source/system_config/SystemConfig.py::{_checkRoot,
//! _checkDependencies, _setResourceLimits, _setCheckInterval, clearMCEs}`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::Uid;

use crate::error::{HarnessError, Result};

const DEFAULT_CHECK_INTERVAL_PATH: &str =
    "/sys/devices/system/machinecheck/machinecheck0/check_interval";

/// Machine check polling interval set for the duration of the run, so
/// the kernel doesn't clear banks out from under the sampler.
const RUN_CHECK_INTERVAL: u64 = 1_000_000;
/// Value restored on exit, matching the original's `atexit` hook.
const RESTORE_CHECK_INTERVAL: u64 = 10_000;
/// Interval used to force a flush: draining any pending MCE quickly.
const FLUSH_CHECK_INTERVAL: u64 = 1;

/// Coarse state machine for the whole run, tracked for diagnostics and
/// exposed so the CLI entry point can report where a run aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Probe,
    Configured,
    Running,
    Sampling,
    Finished,
    Fault,
}

/// Restores the machine-check polling interval to [`RESTORE_CHECK_INTERVAL`]
/// when dropped — on normal completion, an early return via `?`, or a
/// caught signal, whichever comes first.
pub struct CheckIntervalGuard {
    path: PathBuf,
}

impl Drop for CheckIntervalGuard {
    fn drop(&mut self) {
        if let Err(e) = write_check_interval(&self.path, RESTORE_CHECK_INTERVAL) {
            tracing::warn!("failed to restore machine-check polling interval on exit: {e}");
        }
    }
}

fn write_check_interval(path: &Path, value: u64) -> std::io::Result<()> {
    std::fs::write(path, value.to_string())
}

pub struct Lifecycle {
    check_interval_path: PathBuf,
    state: RunState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::with_check_interval_path(DEFAULT_CHECK_INTERVAL_PATH)
    }

    /// Constructs a controller pointed at an arbitrary check-interval
    /// path — used by tests to avoid touching real `/sys`.
    pub fn with_check_interval_path(path: impl Into<PathBuf>) -> Self {
        Lifecycle {
            check_interval_path: path.into(),
            state: RunState::Init,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn mark_fault(&mut self) {
        self.state = RunState::Fault;
    }

    /// Root privilege, EDAC, and `numactl` checks are fatal; the sysctl
    /// hygiene checks only warn. Matches `_checkRoot`/`_checkDependencies`.
    pub fn validate_environment(&mut self, sysfs_root: &Path) -> Result<()> {
        if !Uid::effective().is_root() {
            self.state = RunState::Fault;
            return Err(HarnessError::EnvironmentUnmet(
                "must run as root to access MSR devices".into(),
            ));
        }

        if !edac_supported(sysfs_root) {
            self.state = RunState::Fault;
            return Err(HarnessError::EnvironmentUnmet(
                "no EDAC (Error Detection and Correction) kernel module found".into(),
            ));
        }

        if which("numactl").is_none() {
            self.state = RunState::Fault;
            return Err(HarnessError::EnvironmentUnmet(
                "'numactl' not found on $PATH".into(),
            ));
        }

        warn_unless_sysctl_reads(sysfs_root, "proc/sys/kernel/randomize_va_space", "0");
        warn_unless_sysctl_reads(sysfs_root, "proc/sys/kernel/print-fatal-signals", "1");
        warn_unless_sysctl_reads(sysfs_root, "proc/sys/kernel/numa_balancing", "0");

        self.state = RunState::Probe;
        Ok(())
    }

    /// Best-effort: raises every resource limit named in
    /// `_setResourceLimits` to infinity, logging a warning (not failing
    /// the run) when the kernel refuses.
    pub fn raise_resource_limits(&self) {
        const LIMITS: &[Resource] = &[
            Resource::RLIMIT_AS,
            Resource::RLIMIT_CORE,
            Resource::RLIMIT_CPU,
            Resource::RLIMIT_DATA,
            Resource::RLIMIT_FSIZE,
            Resource::RLIMIT_MEMLOCK,
            Resource::RLIMIT_NPROC,
            Resource::RLIMIT_RSS,
            Resource::RLIMIT_SIGPENDING,
            Resource::RLIMIT_STACK,
        ];
        for &limit in LIMITS {
            if let Err(e) = setrlimit(limit, u64::MAX, u64::MAX) {
                tracing::warn!("failed to raise resource limit {limit:?} to infinity: {e}");
            }
        }
    }

    /// Sets the run-duration polling interval and returns a guard that
    /// restores it on drop. Must be called (and the guard held) before
    /// entering the run loop.
    pub fn acquire_check_interval(&mut self) -> Result<CheckIntervalGuard> {
        write_check_interval(&self.check_interval_path, RUN_CHECK_INTERVAL)?;
        self.state = RunState::Configured;
        Ok(CheckIntervalGuard {
            path: self.check_interval_path.clone(),
        })
    }

    /// Pre-run MCA flush protocol: drop the polling interval to its
    /// fastest setting, sleep briefly so any pending MCE surfaces, then
    /// restore the run-duration interval.
    pub async fn flush_mces(&self) -> Result<()> {
        tracing::warn!("flushing MCEs: previously detected MCEs will surface in the OS's dmesg");
        write_check_interval(&self.check_interval_path, FLUSH_CHECK_INTERVAL)?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        write_check_interval(&self.check_interval_path, RUN_CHECK_INTERVAL)?;
        Ok(())
    }

    pub fn enter_running(&mut self) {
        self.state = RunState::Running;
    }

    pub fn enter_sampling(&mut self) {
        self.state = RunState::Sampling;
    }

    pub fn resume_running(&mut self) {
        self.state = RunState::Running;
    }

    pub fn finish(&mut self) {
        self.state = RunState::Finished;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

fn edac_supported(sysfs_root: &Path) -> bool {
    sysfs_root.join("sys/devices/system/edac/mc/mc0").is_dir()
}

fn which(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn warn_unless_sysctl_reads(sysfs_root: &Path, relative_path: &str, expected: &str) {
    let path = sysfs_root.join(relative_path);
    match std::fs::read_to_string(&path) {
        Ok(contents) if contents.trim() == expected => {}
        Ok(contents) => {
            tracing::warn!(
                "{} reads '{}', expected '{}'",
                path.display(),
                contents.trim(),
                expected
            );
        }
        Err(e) => {
            tracing::warn!("could not read {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_interval_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("check_interval");
        std::fs::write(&path, "0").unwrap();
        {
            let guard = CheckIntervalGuard { path: path.clone() };
            write_check_interval(&guard.path, RUN_CHECK_INTERVAL).unwrap();
            assert_eq!(std::fs::read_to_string(&path).unwrap(), "1000000");
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "10000");
    }

    #[test]
    fn acquire_check_interval_sets_run_value_and_advances_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("check_interval");
        std::fs::write(&path, "0").unwrap();
        let mut lifecycle = Lifecycle::with_check_interval_path(&path);
        let _guard = lifecycle.acquire_check_interval().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1000000");
        assert_eq!(lifecycle.state(), RunState::Configured);
    }

    #[test]
    fn edac_detection_via_sysfs_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sys/devices/system/edac/mc/mc0")).unwrap();
        assert!(edac_supported(dir.path()));
        assert!(!edac_supported(Path::new("/nonexistent-root")));
    }

    #[tokio::test]
    async fn flush_mces_cycles_interval_down_then_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("check_interval");
        std::fs::write(&path, "0").unwrap();
        let lifecycle = Lifecycle::with_check_interval_path(&path);
        // Sleep duration is 2s in the real protocol; we only assert the
        // final restored value here rather than waiting out the flush.
        let flush = lifecycle.flush_mces();
        tokio::time::pause();
        tokio::pin!(flush);
        tokio::time::advance(Duration::from_secs(3)).await;
        flush.await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1000000");
    }
}
