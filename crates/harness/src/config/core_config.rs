//! Core-partition configuration.
//!
//! Validates the `Core_Config` section against the probed [`Topology`]
//! and reduces it to an ordered list of partition requests that the
//! partition resolver turns into concrete logical-core lists by shelling
//! out to `list_cores.sh`. Grounded on
//! `original_source/system_config/SystemConfig.py::CoreConfig`.

use serde_json::Value;

use crate::error::{HarnessError, Result};
use crate::topology::Topology;

/// One `(partition tag, socket scope)` pair awaiting resolution by
/// `list_cores.sh`. `partition` is one of `all`, `half0`/`half1`,
/// `quart0`..`quart3`, or a CCD index as a decimal string. `socket` is
/// `all`, `0`, or `1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRequest {
    pub partition: String,
    pub socket: String,
}

/// Validated `Core_Config` section.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub smt: bool,
    pub requests: Vec<PartitionRequest>,
    /// Logical core ids named directly via the `Cores` key; each becomes
    /// its own single-core run group rather than going through the
    /// partition resolver.
    pub explicit_cores: Vec<usize>,
}

impl CoreConfig {
    pub fn parse(value: &Value, topology: &Topology) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            HarnessError::ConfigInvalid("'Core_Config' must be an object".into())
        })?;

        let smt = obj
            .get("SMT")
            .and_then(Value::as_bool)
            .ok_or_else(|| {
                HarnessError::ConfigInvalid(
                    "'Core_Config' requires a boolean 'SMT' field".into(),
                )
            })?;
        if smt && !topology.smt_enabled {
            return Err(HarnessError::SmtMismatch);
        }

        check_integrity(obj, topology)?;

        let sockets = parse_sockets(obj, topology)?;

        let mut partitions: Vec<String> = Vec::new();
        if let Some(all) = obj.get("All") {
            let enabled = all
                .as_bool()
                .ok_or_else(|| HarnessError::ConfigInvalid("'All' must be a boolean".into()))?;
            if enabled {
                partitions.push("all".to_string());
            }
        }
        if let Some(halfs) = obj.get("Halfs") {
            partitions.extend(parse_bool_or_index_list(halfs, 2, "half", "Halfs")?);
        }
        if let Some(quarters) = obj.get("Quarters") {
            partitions.extend(parse_bool_or_index_list(quarters, 4, "quart", "Quarters")?);
        }
        if let Some(ccds) = obj.get("CCDs") {
            partitions.extend(parse_ccds(ccds, topology)?);
        }

        let mut requests = Vec::with_capacity(sockets.len() * partitions.len().max(1));
        for socket in &sockets {
            for partition in &partitions {
                requests.push(PartitionRequest {
                    partition: partition.clone(),
                    socket: socket.clone(),
                });
            }
        }

        let explicit_cores = parse_explicit_cores(obj, topology)?;

        if requests.is_empty() && explicit_cores.is_empty() {
            return Err(HarnessError::ConfigInvalid(
                "at least one core division or explicit core is required in 'Core_Config'".into(),
            ));
        }

        Ok(CoreConfig {
            smt,
            requests,
            explicit_cores,
        })
    }

    /// The distinct thread offsets each partition request must resolve
    /// across: `[0, 1]` under SMT, `[0]` otherwise.
    pub fn thread_list(&self) -> Vec<u32> {
        if self.smt {
            vec![0, 1]
        } else {
            vec![0]
        }
    }
}

fn parse_sockets(
    obj: &serde_json::Map<String, Value>,
    topology: &Topology,
) -> Result<Vec<String>> {
    let Some(sockets_val) = obj.get("Sockets") else {
        return Ok(vec!["all".to_string()]);
    };
    let items = sockets_val.as_array().ok_or_else(|| {
        HarnessError::ConfigInvalid("'Sockets' configuration item can only be a list".into())
    })?;

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if let Some(pair) = item.as_array() {
            let nums: Vec<i64> = pair.iter().filter_map(Value::as_i64).collect();
            if pair.len() != 2 || !nums.contains(&0) || !nums.contains(&1) || topology.num_sockets != 2 {
                return Err(HarnessError::ConfigInvalid(format!(
                    "the only valid options for 'Sockets' are 0, 1, or [0,1] on a 2P system; got {item}"
                )));
            }
            out.push("all".to_string());
        } else if let Some(n) = item.as_i64() {
            if n + 1 > topology.num_sockets as i64 {
                return Err(HarnessError::ConfigInvalid(format!(
                    "socket {n} requested but only {} sockets are active",
                    topology.num_sockets
                )));
            }
            out.push(n.to_string());
        } else {
            return Err(HarnessError::ConfigInvalid(format!(
                "invalid 'Sockets' entry: {item}"
            )));
        }
    }
    Ok(out)
}

fn parse_bool_or_index_list(
    value: &Value,
    count: i64,
    tag_prefix: &str,
    field_name: &str,
) -> Result<Vec<String>> {
    if let Some(enabled) = value.as_bool() {
        return Ok(if enabled {
            (0..count).map(|n| format!("{tag_prefix}{n}")).collect()
        } else {
            Vec::new()
        });
    }
    if let Some(items) = value.as_array() {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let n = item.as_i64().ok_or_else(|| {
                HarnessError::ConfigInvalid(format!("'{field_name}' list entries must be integers"))
            })?;
            if n < 0 || n >= count {
                return Err(HarnessError::ConfigInvalid(format!(
                    "invalid '{field_name}' division {n}: valid range is 0..{count}"
                )));
            }
            out.push(format!("{tag_prefix}{n}"));
        }
        return Ok(out);
    }
    Err(HarnessError::ConfigInvalid(format!(
        "'{field_name}' division in 'Core_Config' only supports list or boolean values"
    )))
}

fn parse_ccds(value: &Value, topology: &Topology) -> Result<Vec<String>> {
    let ccds_per_socket = topology.ccds_per_socket as i64;
    if let Some(enabled) = value.as_bool() {
        return Ok(if enabled {
            (0..ccds_per_socket).map(|n| n.to_string()).collect()
        } else {
            Vec::new()
        });
    }
    if let Some(items) = value.as_array() {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let n = item
                .as_i64()
                .ok_or_else(|| HarnessError::ConfigInvalid("'CCDs' list entries must be integers".into()))?;
            if n >= ccds_per_socket {
                return Err(HarnessError::ConfigInvalid(format!(
                    "CCD {n} requested but the socket only has {ccds_per_socket} CCDs"
                )));
            }
            out.push(n.to_string());
        }
        return Ok(out);
    }
    Err(HarnessError::ConfigInvalid(
        "'CCDs' division in 'Core_Config' only supports list or boolean values".into(),
    ))
}

fn parse_explicit_cores(
    obj: &serde_json::Map<String, Value>,
    topology: &Topology,
) -> Result<Vec<usize>> {
    let Some(cores_val) = obj.get("Cores") else {
        return Ok(Vec::new());
    };
    if let Some(enabled) = cores_val.as_bool() {
        return Ok(if enabled {
            (0..topology.num_logical_cores).collect()
        } else {
            Vec::new()
        });
    }
    if let Some(items) = cores_val.as_array() {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let n = item
                .as_i64()
                .ok_or_else(|| HarnessError::ConfigInvalid("'Cores' list entries must be integers".into()))?;
            if n as usize >= topology.num_logical_cores {
                return Err(HarnessError::ConfigInvalid(format!(
                    "core {n} requested but only {} logical cores exist",
                    topology.num_logical_cores
                )));
            }
            out.push(n as usize);
        }
        return Ok(out);
    }
    Err(HarnessError::ConfigInvalid(
        "'Cores' configuration item can only be a list or boolean".into(),
    ))
}

/// Cross-checks `CCDs`/`Cores`/`Sockets` bounds against the topology
/// before the main parse, matching `_checkConfigIntegrity`'s early-bound
/// validation (which runs against physical core counts, distinct from
/// the later per-division logical bounds enforced while parsing).
fn check_integrity(obj: &serde_json::Map<String, Value>, topology: &Topology) -> Result<()> {
    if let Some(ccds) = obj.get("CCDs") {
        if let Some(items) = ccds.as_array() {
            for item in items {
                if let Some(n) = item.as_i64() {
                    if n >= topology.ccds_per_socket as i64 {
                        return Err(HarnessError::ConfigInvalid(format!(
                            "CCD {n} requested but the CPU only has {} CCDs",
                            topology.ccds_per_socket
                        )));
                    }
                }
            }
        } else if ccds.as_bool().is_none() {
            return Err(HarnessError::ConfigInvalid(
                "'CCDs' configuration item can only be a list or boolean".into(),
            ));
        }
    }
    if let Some(cores) = obj.get("Cores") {
        if let Some(items) = cores.as_array() {
            for item in items {
                if let Some(n) = item.as_i64() {
                    if n >= topology.num_physical_cores as i64 {
                        return Err(HarnessError::ConfigInvalid(format!(
                            "core {n} requested but the CPU only has {} physical cores",
                            topology.num_physical_cores
                        )));
                    }
                }
            }
        } else if cores.as_bool().is_none() {
            return Err(HarnessError::ConfigInvalid(
                "'Cores' configuration item can only be a list or boolean".into(),
            ));
        }
    }
    Ok(())
}
