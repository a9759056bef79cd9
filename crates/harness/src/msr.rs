//! MSR Gateway.
//!
//! One scoped file handle per logical core to the platform's MSR device
//! node (`/dev/cpu/<n>/msr`), opened read/write at construction and
//! released on drop. Grounded on
//! `original_source/mce_read/MsrRegister.py`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use crate::error::{HarnessError, Result};

/// A single core's MSR device handle.
struct PerCoreMsr {
    core_id: usize,
    file: File,
}

impl PerCoreMsr {
    fn open(core_id: usize, device_root: &str) -> Result<Self> {
        let path = PathBuf::from(format!("{device_root}/cpu/{core_id}/msr"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| HarnessError::MsrUnavailable { core_id, source })?;
        Ok(Self { core_id, file })
    }

    fn read(&self, register: u32) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact_at(&mut buf, register as u64)
            .map_err(|source| HarnessError::MsrUnavailable {
                core_id: self.core_id,
                source,
            })?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// Gateway to every logical core's MSR device.
pub struct MsrGateway {
    handles: Vec<PerCoreMsr>,
}

impl MsrGateway {
    /// Open one handle per logical core under the standard `/dev` root.
    pub fn open(num_logical_cores: usize) -> Result<Self> {
        Self::open_under(num_logical_cores, "/dev")
    }

    /// Open handles under an arbitrary device root — used by tests to
    /// avoid touching real hardware.
    pub fn open_under(num_logical_cores: usize, device_root: &str) -> Result<Self> {
        let mut handles = Vec::with_capacity(num_logical_cores);
        for core_id in 0..num_logical_cores {
            handles.push(PerCoreMsr::open(core_id, device_root)?);
        }
        Ok(Self { handles })
    }

    pub fn num_cores(&self) -> usize {
        self.handles.len()
    }

    /// 64-bit little-endian read at `register` on `core_id`.
    pub fn read(&self, register: u32, core_id: usize) -> Result<u64> {
        let handle = self
            .handles
            .get(core_id)
            .ok_or(HarnessError::InvalidCore {
                core_id,
                num_logical_cores: self.handles.len(),
            })?;
        handle.read(register)
    }

    /// Write is specified but unimplemented upstream; preserved as a
    /// deliberate `NotSupported` stub rather than a silent no-op.
    pub fn write(&self, _register: u32, _data: u64, core_id: usize) -> Result<()> {
        if core_id >= self.handles.len() {
            return Err(HarnessError::InvalidCore {
                core_id,
                num_logical_cores: self.handles.len(),
            });
        }
        Err(HarnessError::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    /// Build a fake `<root>/cpu/<n>/msr` tree where reads simply return the
    /// byte offset itself encoded little-endian; good enough to exercise
    /// addressing and bounds-checking without real hardware.
    fn fixture_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for core in 0..2 {
            let core_dir = dir.path().join("cpu").join(core.to_string());
            fs::create_dir_all(&core_dir).unwrap();
            let msr_path = core_dir.join("msr");
            // Pre-size the file so pread at arbitrary offsets succeeds;
            // write a recognizable 8-byte pattern at offset 0x179.
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&msr_path)
                .unwrap();
            let mut data = vec![0u8; 0x200];
            data[0x179..0x179 + 8].copy_from_slice(&0xAABBu64.to_le_bytes());
            f.write_all(&data).unwrap();
        }
        dir
    }

    #[test]
    fn reads_little_endian_at_address() {
        let dir = fixture_root();
        let gw = MsrGateway::open_under(2, dir.path().to_str().unwrap()).unwrap();
        let val = gw.read(0x179, 0).unwrap();
        assert_eq!(val, 0xAABB);
    }

    #[test]
    fn invalid_core_errors() {
        let dir = fixture_root();
        let gw = MsrGateway::open_under(2, dir.path().to_str().unwrap()).unwrap();
        let err = gw.read(0x179, 5).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidCore { .. }));
    }

    #[test]
    fn write_is_not_supported() {
        let dir = fixture_root();
        let gw = MsrGateway::open_under(2, dir.path().to_str().unwrap()).unwrap();
        let err = gw.write(0x179, 0, 0).unwrap_err();
        assert!(matches!(err, HarnessError::NotSupported));
    }

    #[test]
    fn missing_device_is_msr_unavailable() {
        let err = MsrGateway::open_under(1, "/nonexistent").unwrap_err();
        assert!(matches!(err, HarnessError::MsrUnavailable { .. }));
    }
}
