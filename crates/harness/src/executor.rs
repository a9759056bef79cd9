//! Executor.
//!
//! Fans a [`ScheduledCommand`] out across every core in its group,
//! pinning each process with `numactl --physcpubind=<core>`, and collects
//! per-core exit status/stdout/stderr. Grounded on
//! `original_source/tests/Test.py::execTestOnCore` (the original's
//! `multiprocessing.Pool.starmap`, reimplemented as a concurrent async
//! fan-out).

use futures::future::join_all;
use tokio::process::Command;

use crate::error::{HarnessError, Result};
use crate::scheduler::ScheduledCommand;

/// Outcome of running one command on one core.
#[derive(Debug, Clone)]
pub struct CoreResult {
    pub core: u32,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CoreResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Every per-core result for one scheduled command.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub command: ScheduledCommand,
    pub core_results: Vec<CoreResult>,
}

impl ExecutionResult {
    /// Cores whose process exited non-zero or failed to spawn — an
    /// Application/Correctness Failure (ACF) in the original's terms.
    pub fn failing_cores(&self) -> Vec<u32> {
        self.core_results
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| r.core)
            .collect()
    }

    pub fn is_acf(&self) -> bool {
        !self.failing_cores().is_empty()
    }
}

pub struct Executor {
    numactl_path: String,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            numactl_path: "numactl".to_string(),
        }
    }

    /// Override the `numactl` binary name/path — used by tests to pin to
    /// a stub script instead of the real tool.
    pub fn with_numactl(numactl_path: impl Into<String>) -> Self {
        Self {
            numactl_path: numactl_path.into(),
        }
    }

    /// Run `command` concurrently across every core in its group and
    /// collect all results before returning.
    pub async fn run(&self, command: ScheduledCommand) -> Result<ExecutionResult> {
        let futures = command.cores.iter().map(|&core| {
            let pinned = format!(
                "{} --physcpubind={} {}",
                self.numactl_path, core, command.command_line
            );
            async move {
                let output = Command::new("sh").arg("-c").arg(&pinned).output().await;
                match output {
                    Ok(out) => Ok(CoreResult {
                        core,
                        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                        exit_code: out.status.code(),
                    }),
                    Err(source) => Err(HarnessError::ExecSpawnFailed {
                        cmdline: pinned,
                        source,
                    }),
                }
            }
        });

        let core_results = join_all(futures).await.into_iter().collect::<Result<Vec<_>>>()?;

        Ok(ExecutionResult {
            command,
            core_results,
        })
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(cores: Vec<u32>, command_line: &str) -> ScheduledCommand {
        ScheduledCommand {
            sequence: 1,
            test_name: "stress".into(),
            command_line: command_line.into(),
            cores,
        }
    }

    /// A stand-in `numactl` that drops its own `--physcpubind=N` argument
    /// and execs the rest, so tests can assert on the wrapped command's
    /// own behavior without a real NUMA-aware host.
    fn fake_numactl() -> tempfile::TempDir {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("numactl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\nshift\nexec \"$@\"").unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        f.set_permissions(perms).unwrap();
        dir
    }

    #[tokio::test]
    async fn successful_command_has_no_failing_cores() {
        let dir = fake_numactl();
        let executor = Executor::with_numactl(dir.path().join("numactl").to_str().unwrap().to_string());
        let result = executor.run(cmd(vec![0, 1], "echo hello")).await.unwrap();
        assert_eq!(result.core_results.len(), 2);
        assert!(!result.is_acf());
        assert!(result.failing_cores().is_empty());
        assert_eq!(result.core_results[0].stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_acf() {
        let dir = fake_numactl();
        let executor = Executor::with_numactl(dir.path().join("numactl").to_str().unwrap().to_string());
        let result = executor.run(cmd(vec![0], "sh -c 'exit 3'")).await.unwrap();
        assert!(result.is_acf());
        assert_eq!(result.failing_cores(), vec![0]);
    }

    #[tokio::test]
    async fn runs_independently_per_core() {
        let dir = fake_numactl();
        let executor = Executor::with_numactl(dir.path().join("numactl").to_str().unwrap().to_string());
        let result = executor.run(cmd(vec![0, 1, 2], "echo $$")).await.unwrap();
        assert_eq!(result.core_results.len(), 3);
        let pids: std::collections::HashSet<_> =
            result.core_results.iter().map(|r| r.stdout.clone()).collect();
        // Each invocation ran in its own subshell, so distinct PIDs.
        assert_eq!(pids.len(), result.core_results.len());
    }
}
