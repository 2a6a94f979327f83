//! Cgroup v2 management for per-job resource limits.
//!
//! Each job gets its own leaf directly under the cgroup root, named
//! `<prefix>-<id>` where the prefix is the owning executor's UUID. Only leaf
//! cgroups may hold processes, so the layout stays intentionally flat.

use std::fs;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

const CPU_PERIOD: u64 = 100_000;

/// Smallest bytes-per-second value the kernel accepts in `io.max`.
/// Writing `rbps=1` fails with EINVAL, so 0 and 1 both mean "no limit".
const MIN_IO_BPS: u32 = 2;

#[cfg(target_os = "linux")]
const O_PATH: libc::c_int = libc::O_PATH;
// Off Linux the clone-time attach is a no-op anyway; a plain descriptor
// keeps the module compiling for the shim target.
#[cfg(not(target_os = "linux"))]
const O_PATH: libc::c_int = 0;

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("failed to create cgroup {path}: {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error("failed to open cgroup {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Resource limits applied to a job's cgroup. Zero values are "no limit"
/// and leave the corresponding control file untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct CgroupConfig {
    pub cpu_percent: u32,
    pub memory_mb: u64,
    pub read_bps: u32,
    pub write_bps: u32,
    pub device_major: u64,
}

/// Creates and configures the cgroup for job `id` under `base`, returning an
/// `O_PATH` descriptor usable for clone-time attach along with the directory
/// path for later removal.
pub fn create(
    base: &Path,
    prefix: &str,
    id: u64,
    config: &CgroupConfig,
) -> Result<(OwnedFd, PathBuf), CgroupError> {
    let path = base.join(format!("{prefix}-{id}"));
    fs::create_dir_all(&path).map_err(|source| CgroupError::Create {
        path: path.clone(),
        source,
    })?;

    // O_PATH is all clone3 needs to attach the child; the access mode is
    // ignored by the kernel when O_PATH is set.
    let fd: OwnedFd = fs::OpenOptions::new()
        .read(true)
        .custom_flags(O_PATH)
        .open(&path)
        .map_err(|source| CgroupError::Open {
            path: path.clone(),
            source,
        })?
        .into();

    if config.cpu_percent > 0 {
        let quota = CPU_PERIOD / 100 * u64::from(config.cpu_percent);
        write_control(&path, "cpu.max", &format!("{quota} {CPU_PERIOD}"))?;
    }

    if config.memory_mb > 0 {
        let bytes = format!("{}\n", config.memory_mb * 1024 * 1024);
        write_control(&path, "memory.max", &bytes)?;
        write_control(&path, "memory.high", &bytes)?;
    }

    // io.max is written only when there is at least one bounded value the
    // kernel will accept. Partitions are not valid targets, so minor is
    // always 0.
    if config.device_major > 1 && (config.read_bps >= MIN_IO_BPS || config.write_bps >= MIN_IO_BPS)
    {
        let mut line = format!("{}:0", config.device_major);
        if config.read_bps >= MIN_IO_BPS {
            line.push_str(&format!(" rbps={}", config.read_bps));
        }
        if config.write_bps >= MIN_IO_BPS {
            line.push_str(&format!(" wbps={}", config.write_bps));
        }
        write_control(&path, "io.max", &line)?;
    }

    Ok((fd, path))
}

/// Removes a job's cgroup directory. The kernel refuses while processes
/// remain, which callers treat as best-effort.
pub fn remove(path: &Path) -> io::Result<()> {
    fs::remove_dir(path)
}

fn write_control(dir: &Path, file: &str, content: &str) -> Result<(), CgroupError> {
    let path = dir.join(file);
    fs::write(&path, content).map_err(|source| CgroupError::Write { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use tempfile::tempdir;

    fn limits() -> CgroupConfig {
        CgroupConfig {
            cpu_percent: 10,
            memory_mb: 10,
            read_bps: 10,
            write_bps: 10,
            device_major: 200,
        }
    }

    fn read_trimmed(path: &Path) -> String {
        fs::read_to_string(path).unwrap().trim().to_string()
    }

    #[test]
    fn writes_cpu_max() {
        let tmp = tempdir().unwrap();
        let (_, dir) = create(tmp.path(), "test", 0, &limits()).unwrap();
        assert_eq!(read_trimmed(&dir.join("cpu.max")), "10000 100000");
    }

    #[test]
    fn writes_memory_files() {
        let tmp = tempdir().unwrap();
        let (_, dir) = create(tmp.path(), "test", 0, &limits()).unwrap();
        assert_eq!(read_trimmed(&dir.join("memory.max")), "10485760");
        assert_eq!(read_trimmed(&dir.join("memory.high")), "10485760");
    }

    #[test]
    fn writes_io_max() {
        let tmp = tempdir().unwrap();
        let (_, dir) = create(tmp.path(), "test", 0, &limits()).unwrap();
        assert_eq!(read_trimmed(&dir.join("io.max")), "200:0 rbps=10 wbps=10");
    }

    #[test]
    fn enforces_io_lower_bound() {
        // rbps=1 is below what the kernel accepts and must be dropped while
        // the valid wbps is kept.
        let config = CgroupConfig {
            read_bps: 1,
            write_bps: 2,
            device_major: 200,
            ..Default::default()
        };
        let tmp = tempdir().unwrap();
        let (_, dir) = create(tmp.path(), "test", 0, &config).unwrap();
        assert_eq!(read_trimmed(&dir.join("io.max")), "200:0 wbps=2");
    }

    #[test]
    fn skips_io_when_both_bps_below_bound() {
        let config = CgroupConfig {
            read_bps: 1,
            write_bps: 1,
            device_major: 200,
            ..Default::default()
        };
        let tmp = tempdir().unwrap();
        let (_, dir) = create(tmp.path(), "test", 0, &config).unwrap();
        assert!(!dir.join("io.max").exists());
    }

    #[test]
    fn skips_unset_limits() {
        let config = CgroupConfig {
            memory_mb: 5,
            ..Default::default()
        };
        let tmp = tempdir().unwrap();
        let (_, dir) = create(tmp.path(), "test", 0, &config).unwrap();
        assert!(dir.join("memory.max").exists());
        assert!(!dir.join("cpu.max").exists());
        assert!(!dir.join("io.max").exists());
    }

    #[test]
    fn returns_usable_descriptor_and_prefixed_path() {
        let tmp = tempdir().unwrap();
        let (fd, dir) = create(tmp.path(), "abc", 7, &CgroupConfig::default()).unwrap();
        assert!(fd.as_raw_fd() > 2);
        assert!(dir.ends_with("abc-7"));
    }

    #[test]
    fn remove_deletes_directory() {
        let tmp = tempdir().unwrap();
        let (_, dir) = create(tmp.path(), "test", 0, &CgroupConfig::default()).unwrap();
        remove(&dir).unwrap();
        assert!(!dir.exists());
    }
}
