//! Topology Probe.
//!
//! Reads `/proc/cpuinfo` and derives socket count, CCDs-per-socket,
//! cores-per-CCD, and SMT state. Grounded on
//! `original_source/system_config/cpuinfo.py::CpuInfo.Enumerate`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::error::{HarnessError, Result};

/// Per-logical-core fields pulled out of one `/proc/cpuinfo` record.
#[derive(Debug, Clone, Copy)]
struct CoreRecord {
    physical_id: u32,
    apic_id: u32,
    cpu_family: u32,
    model: u32,
    cpu_cores: u32,
}

/// Immutable CPU topology, derived once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub num_sockets: usize,
    pub ccds_per_socket: usize,
    pub cores_per_ccd: usize,
    pub num_physical_cores: usize,
    pub num_logical_cores: usize,
    pub smt_enabled: bool,
}

impl Topology {
    /// Probe topology from the standard `/proc/cpuinfo` path.
    pub fn probe() -> Result<Self> {
        Self::probe_from(Path::new("/proc/cpuinfo"))
    }

    /// Probe topology from an arbitrary `cpuinfo`-formatted file. Exposed
    /// so tests can point at a fixture instead of the real `/proc`.
    pub fn probe_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            HarnessError::TopologyUnavailable(format!("failed to read {}: {e}", path.display()))
        })?;

        let records = parse_cpuinfo(&text)?;
        if records.is_empty() {
            return Err(HarnessError::TopologyUnavailable(
                "no processor records found".into(),
            ));
        }

        // Group logical cores by socket (physical_id), preserving the
        // original's ordering-insensitive grouping.
        let mut by_socket: BTreeMap<u32, Vec<&CoreRecord>> = BTreeMap::new();
        for rec in records.values() {
            by_socket.entry(rec.physical_id).or_default().push(rec);
        }

        let num_sockets = by_socket.len();
        if num_sockets == 0 {
            return Err(HarnessError::TopologyInconsistent(
                "no sockets derived from cpuinfo".into(),
            ));
        }

        let socket0 = by_socket
            .get(by_socket.keys().next().unwrap())
            .expect("at least one socket present");
        let cpu_cores_field = socket0[0].cpu_cores;
        let smt_enabled = socket0.len() as u32 != cpu_cores_field;

        let num_logical_cores = records.len();
        let num_physical_cores = num_logical_cores / if smt_enabled { 2 } else { 1 };

        // CCD count: distinct high-order APIC-ID bits, derived per the
        // original's family/model-sensitive shift.
        let mut sorted_ids: Vec<u32> = records.keys().copied().collect();
        sorted_ids.sort_unstable();
        let apic0 = records[&sorted_ids[0]].apic_id as i64;
        let apic1 = records[&sorted_ids[1]].apic_id as i64;
        let div_fact = apic1 - apic0;

        let mut ccd_ids: std::collections::HashSet<u32> = std::collections::HashSet::new();
        for rec in records.values() {
            let shifted = if smt_enabled {
                (rec.apic_id >> 4) & 0x1F
            } else if rec.cpu_family == 25 && rec.model >= 1 {
                let shift = (1 + div_fact).max(0) as u32;
                (rec.apic_id >> shift) & 0x1F
            } else {
                (rec.apic_id >> 3) & 0x1F
            };
            ccd_ids.insert(shifted);
        }

        let ccds_per_socket = ccd_ids.len() / num_sockets;
        if ccds_per_socket == 0 {
            return Err(HarnessError::TopologyInconsistent(
                "derived 0 CCDs per socket".into(),
            ));
        }
        if num_physical_cores % (ccds_per_socket * num_sockets) != 0 {
            return Err(HarnessError::TopologyInconsistent(format!(
                "num_physical_cores ({num_physical_cores}) does not divide evenly by \
                 ccds_per_socket * num_sockets ({ccds_per_socket} * {num_sockets})"
            )));
        }
        let cores_per_ccd = num_physical_cores / (ccds_per_socket * num_sockets);

        let topo = Topology {
            num_sockets,
            ccds_per_socket,
            cores_per_ccd,
            num_physical_cores,
            num_logical_cores,
            smt_enabled,
        };

        if topo.num_logical_cores != topo.num_physical_cores * if topo.smt_enabled { 2 } else { 1 } {
            return Err(HarnessError::TopologyInconsistent(
                "num_logical_cores != num_physical_cores * (2 if smt else 1)".into(),
            ));
        }

        Ok(topo)
    }
}

/// Socket id for one logical core, from
/// `/sys/devices/system/cpu/cpu<n>/topology/physical_package_id`.
pub fn socket_id_for_core(core_id: usize, sysfs_root: &Path) -> Result<u32> {
    let path = sysfs_root
        .join(format!("cpu{core_id}"))
        .join("topology")
        .join("physical_package_id");
    let text = fs::read_to_string(&path).map_err(|e| {
        HarnessError::TopologyUnavailable(format!(
            "failed to get socket id for core {core_id} ({}): {e}",
            path.display()
        ))
    })?;
    text.trim()
        .parse()
        .map_err(|_| HarnessError::TopologyUnavailable(format!("malformed socket id at {}", path.display())))
}

fn parse_cpuinfo(text: &str) -> Result<HashMap<u32, CoreRecord>> {
    let mut raw: HashMap<u32, HashMap<String, String>> = HashMap::new();
    let mut core_id: u32 = 0;

    for line in text.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let Some(value) = parts.next() else { continue };
        if key.is_empty() {
            continue;
        }
        let value = value.trim().to_string();

        if key == "processor" {
            core_id = value.parse().map_err(|_| {
                HarnessError::TopologyUnavailable(format!("malformed processor id '{value}'"))
            })?;
            raw.entry(core_id).or_default();
        }
        raw.entry(core_id).or_default().insert(key.to_string(), value);
    }

    let mut out = HashMap::with_capacity(raw.len());
    for (id, fields) in raw {
        let get = |name: &str| -> Result<String> {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| HarnessError::TopologyUnavailable(format!("missing '{name}' field for cpu {id}")))
        };
        let parse_u32 = |name: &str, s: String| -> Result<u32> {
            s.parse().map_err(|_| {
                HarnessError::TopologyUnavailable(format!("malformed '{name}' field for cpu {id}: '{s}'"))
            })
        };

        let physical_id = parse_u32("physical id", get("physical id")?)?;
        let apic_id = parse_u32("apicid", get("apicid")?)?;
        let cpu_family = parse_u32("cpu family", get("cpu family")?)?;
        let model = parse_u32("model", get("model")?)?;
        let cpu_cores = parse_u32("cpu cores", get("cpu cores")?)?;

        out.insert(
            id,
            CoreRecord {
                physical_id,
                apic_id,
                cpu_family,
                model,
                cpu_cores,
            },
        );
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        f.flush().unwrap();
        f
    }

    fn core_block(
        processor: u32,
        physical_id: u32,
        apicid: u32,
        cpu_family: u32,
        model: u32,
        cpu_cores: u32,
    ) -> Vec<String> {
        vec![
            format!("processor\t: {processor}"),
            format!("cpu family\t: {cpu_family}"),
            format!("model\t\t: {model}"),
            format!("physical id\t: {physical_id}"),
            format!("cpu cores\t: {cpu_cores}"),
            format!("apicid\t\t: {apicid}"),
            String::new(),
        ]
    }

    #[test]
    fn single_socket_no_smt_single_ccd() {
        let mut lines = vec![];
        for p in 0..4u32 {
            lines.extend(core_block(p, 0, p * 8, 23, 1, 4));
        }
        let owned: Vec<String> = lines;
        let borrowed: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
        let f = write_fixture(&borrowed);

        let topo = Topology::probe_from(f.path()).unwrap();
        assert_eq!(topo.num_sockets, 1);
        assert!(!topo.smt_enabled);
        assert_eq!(topo.num_physical_cores, 4);
        assert_eq!(topo.num_logical_cores, 4);
    }

    #[test]
    fn smt_doubles_logical_over_physical() {
        // 2 physical cores, SMT on -> 4 logical cores, cpu_cores field == 2.
        let mut lines = vec![];
        // Two physical cores' worth of apicids spread 16 apart (>>4 distinguishes CCDs)
        for p in 0..4u32 {
            let apic = p * 2; // 0,2,4,6 -> low bits after >>4 collapse to same CCD
            lines.extend(core_block(p, 0, apic, 23, 1, 2));
        }
        let owned: Vec<String> = lines;
        let borrowed: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
        let f = write_fixture(&borrowed);

        let topo = Topology::probe_from(f.path()).unwrap();
        assert!(topo.smt_enabled);
        assert_eq!(topo.num_logical_cores, 4);
        assert_eq!(topo.num_physical_cores, 2);
    }

    #[test]
    fn missing_file_is_topology_unavailable() {
        let err = Topology::probe_from(Path::new("/nonexistent/cpuinfo")).unwrap_err();
        assert!(matches!(err, HarnessError::TopologyUnavailable(_)));
    }
}
