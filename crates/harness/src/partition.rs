//! Partition Resolver.
//!
//! Turns each [`PartitionRequest`] from `Core_Config` into a concrete list
//! of logical core IDs by shelling out to `<run_dir>/list_cores.sh`, once
//! per thread offset, and concatenating the results. Grounded on
//! `original_source/system_config/SystemConfig.py::CoreConfig._getCoreList`.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::PartitionRequest;
use crate::error::{HarnessError, Result};
use crate::topology::Topology;

/// One resolved run group: the ordered logical core IDs a single test
/// invocation should be pinned across, one process per core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreGroup {
    pub cores: Vec<u32>,
}

pub struct PartitionResolver {
    helper_path: PathBuf,
    topology: Topology,
}

impl PartitionResolver {
    /// Build a resolver rooted at `run_dir`, validating the helper script
    /// exists up front rather than failing lazily on first use.
    pub fn new(run_dir: &str, topology: Topology) -> Result<Self> {
        let helper_path = Path::new(run_dir).join("list_cores.sh");
        if !helper_path.is_file() {
            return Err(HarnessError::ConfigInvalid(format!(
                "{} does not exist, please ensure Run_Directory is correct",
                helper_path.display()
            )));
        }
        Ok(Self {
            helper_path,
            topology,
        })
    }

    /// Resolve every request in `requests`, plus each explicit core as a
    /// singleton group, into ordered [`CoreGroup`]s. Request order is
    /// preserved so later stages can use list position as tie-break.
    pub fn resolve_all(
        &self,
        requests: &[PartitionRequest],
        explicit_cores: &[usize],
        thread_list: &[u32],
    ) -> Result<Vec<CoreGroup>> {
        let mut groups = Vec::with_capacity(requests.len() + explicit_cores.len());
        for req in requests {
            groups.push(self.resolve_one(req, thread_list)?);
        }
        for &core in explicit_cores {
            groups.push(CoreGroup {
                cores: vec![core as u32],
            });
        }
        Ok(groups)
    }

    fn resolve_one(&self, request: &PartitionRequest, thread_list: &[u32]) -> Result<CoreGroup> {
        let mut cores = Vec::new();
        for &thread in thread_list {
            let output = Command::new(&self.helper_path)
                .arg(self.topology.cores_per_ccd.to_string())
                .arg(self.topology.ccds_per_socket.to_string())
                .arg(self.topology.num_sockets.to_string())
                .arg(&request.partition)
                .arg(thread.to_string())
                .arg(&request.socket)
                .output()
                .map_err(|e| HarnessError::HelperFailed {
                    path: self.helper_path.clone(),
                    reason: e.to_string(),
                })?;

            if !output.status.success() {
                return Err(HarnessError::HelperFailed {
                    path: self.helper_path.clone(),
                    reason: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            for token in stdout.split_whitespace() {
                let core_id: u32 = token.parse().map_err(|_| HarnessError::HelperFailed {
                    path: self.helper_path.clone(),
                    reason: format!("non-numeric core id in output: '{token}'"),
                })?;
                cores.push(core_id);
            }
        }

        if cores.is_empty() {
            return Err(HarnessError::HelperFailed {
                path: self.helper_path.clone(),
                reason: format!(
                    "empty core list for partition='{}' socket='{}'",
                    request.partition, request.socket
                ),
            });
        }

        Ok(CoreGroup { cores })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn topo_2p() -> Topology {
        Topology {
            num_sockets: 2,
            ccds_per_socket: 4,
            cores_per_ccd: 2,
            num_physical_cores: 16,
            num_logical_cores: 16,
            smt_enabled: false,
        }
    }

    /// Writes a `list_cores.sh` stub that echoes canned core lists keyed
    /// by `$4 $6` (partition, socket), for the scenarios under test.
    fn stub_helper(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("list_cores.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{script}").unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        f.set_permissions(perms).unwrap();
        path
    }

    #[test]
    fn two_socket_half0_resolves_ordered_core_list() {
        let dir = tempfile::tempdir().unwrap();
        stub_helper(
            dir.path(),
            "#!/bin/sh\n\
             if [ \"$4\" = \"half0\" ] && [ \"$6\" = \"0\" ]; then echo \"0 1 2 3\"; fi\n",
        );
        let resolver = PartitionResolver::new(dir.path().to_str().unwrap(), topo_2p()).unwrap();
        let req = PartitionRequest {
            partition: "half0".into(),
            socket: "0".into(),
        };
        let group = resolver.resolve_one(&req, &[0]).unwrap();
        assert_eq!(group.cores, vec![0, 1, 2, 3]);
    }

    #[test]
    fn smt_thread_list_concatenates_both_thread_passes() {
        let dir = tempfile::tempdir().unwrap();
        stub_helper(
            dir.path(),
            "#!/bin/sh\n\
             if [ \"$5\" = \"0\" ]; then echo \"0 1\"; else echo \"16 17\"; fi\n",
        );
        let resolver = PartitionResolver::new(dir.path().to_str().unwrap(), topo_2p()).unwrap();
        let req = PartitionRequest {
            partition: "all".into(),
            socket: "all".into(),
        };
        let group = resolver.resolve_one(&req, &[0, 1]).unwrap();
        assert_eq!(group.cores, vec![0, 1, 16, 17]);
    }

    #[test]
    fn empty_helper_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        stub_helper(dir.path(), "#!/bin/sh\nexit 0\n");
        let resolver = PartitionResolver::new(dir.path().to_str().unwrap(), topo_2p()).unwrap();
        let req = PartitionRequest {
            partition: "quart2".into(),
            socket: "all".into(),
        };
        let err = resolver.resolve_one(&req, &[0]).unwrap_err();
        assert!(matches!(err, HarnessError::HelperFailed { .. }));
    }

    #[test]
    fn nonzero_exit_is_helper_failed() {
        let dir = tempfile::tempdir().unwrap();
        stub_helper(dir.path(), "#!/bin/sh\nexit 1\n");
        let resolver = PartitionResolver::new(dir.path().to_str().unwrap(), topo_2p()).unwrap();
        let req = PartitionRequest {
            partition: "all".into(),
            socket: "all".into(),
        };
        let err = resolver.resolve_one(&req, &[0]).unwrap_err();
        assert!(matches!(err, HarnessError::HelperFailed { .. }));
    }

    #[test]
    fn missing_helper_script_fails_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let err = PartitionResolver::new(dir.path().to_str().unwrap(), topo_2p()).unwrap_err();
        assert!(matches!(err, HarnessError::ConfigInvalid(_)));
    }

    #[test]
    fn explicit_cores_become_singleton_groups() {
        let dir = tempfile::tempdir().unwrap();
        stub_helper(dir.path(), "#!/bin/sh\necho \"0\"\n");
        let resolver = PartitionResolver::new(dir.path().to_str().unwrap(), topo_2p()).unwrap();
        let groups = resolver.resolve_all(&[], &[3, 7], &[0]).unwrap();
        assert_eq!(
            groups,
            vec![
                CoreGroup { cores: vec![3] },
                CoreGroup { cores: vec![7] },
            ]
        );
    }
}
