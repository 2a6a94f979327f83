//! Root device discovery and mount hardening for the sandbox.
//!
//! The kernel mount table (`/proc/self/mountinfo`) is the source of truth for
//! the block device backing `/`; its major number is what `io.max` limits are
//! keyed on. `harden_mounts` runs inside the helper child, after the clone
//! into fresh namespaces and before the final exec.

use std::io::BufRead;

#[cfg(target_os = "linux")]
use std::os::fd::OwnedFd;

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("malformed mountinfo record: {0}")]
    Malformed(String),

    #[error("no root device found")]
    NoRootDevice,

    #[error("failed to mount {stage}: {source}")]
    MountFailed {
        stage: &'static str,
        source: nix::Error,
    },

    #[error("failed to read mountinfo: {0}")]
    Io(#[from] std::io::Error),
}

/// Discovers the device mounted at `/` and returns its major and minor.
pub fn root_device() -> Result<(u64, u64), MountError> {
    let file = std::fs::File::open("/proc/self/mountinfo")?;
    parse_root_device(std::io::BufReader::new(file))
}

/// Parses a mountinfo table, looking for the record whose root and mount
/// point are both `/`. The device identifier is the third field, in
/// `major:minor` form.
pub fn parse_root_device(reader: impl BufRead) -> Result<(u64, u64), MountError> {
    for line in reader.lines() {
        let line = line?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        // 6 mandatory fields per the kernel documentation
        if fields.len() < 6 {
            return Err(MountError::Malformed(format!(
                "found {} fields in mountinfo record",
                fields.len()
            )));
        }
        if fields[3] == "/" && fields[4] == "/" {
            let (major, minor) = fields[2]
                .split_once(':')
                .ok_or_else(|| MountError::Malformed(format!("device field {:?}", fields[2])))?;
            let major = major
                .parse::<u64>()
                .map_err(|_| MountError::Malformed(format!("device major {:?}", major)))?;
            let minor = minor
                .parse::<u64>()
                .map_err(|_| MountError::Malformed(format!("device minor {:?}", minor)))?;
            return Ok((major, minor));
        }
    }
    Err(MountError::NoRootDevice)
}

/// Clone-time attributes for the helper child: which namespaces to create
/// and which cgroup to join as part of the same kernel call.
///
/// On non-Linux targets this is an empty shell and spawning degrades to a
/// plain fork/exec with no isolation.
#[derive(Debug, Default)]
pub struct SpawnAttrs {
    #[cfg(target_os = "linux")]
    pub(crate) flags: u64,
    #[cfg(target_os = "linux")]
    pub(crate) cgroup: Option<OwnedFd>,
}

/// clone3 flag placing the child into the cgroup referenced by
/// `clone_args.cgroup` as part of process creation.
#[cfg(target_os = "linux")]
pub(crate) const CLONE_INTO_CGROUP: u64 = 0x200000000;

/// Builds the attributes for spawning the helper: new mount, PID and network
/// namespaces, attached to `cgroup` from its very first instruction.
#[cfg(target_os = "linux")]
pub fn clone_attrs(cgroup: Option<OwnedFd>) -> SpawnAttrs {
    let mut flags = (libc::CLONE_NEWNS | libc::CLONE_NEWPID | libc::CLONE_NEWNET) as u64;
    if cgroup.is_some() {
        flags |= CLONE_INTO_CGROUP;
    }
    SpawnAttrs { flags, cgroup }
}

#[cfg(not(target_os = "linux"))]
pub fn clone_attrs() -> SpawnAttrs {
    SpawnAttrs::default()
}

/// Makes all mount points private (`MS_PRIVATE | MS_REC`) so the child can
/// mount over `/proc` and `/tmp` without spilling into the host mount
/// namespace, then mounts a fresh proc and tmpfs.
#[cfg(target_os = "linux")]
pub fn harden_mounts() -> Result<(), MountError> {
    use nix::mount::{mount, MsFlags};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|source| MountError::MountFailed { stage: "/", source })?;

    mount(
        None::<&str>,
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|source| MountError::MountFailed {
        stage: "/proc",
        source,
    })?;

    mount(
        None::<&str>,
        "/tmp",
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|source| MountError::MountFailed {
        stage: "/tmp",
        source,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn harden_mounts() -> Result<(), MountError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    const MOUNT_INFO: &str = "\
27 20 0:24 / /sys/fs/pstore rw,nosuid,nodev,noexec,relatime shared:5 - pstore pstore rw,seclabel
28 20 0:25 / /sys/fs/bpf rw,nosuid,nodev,noexec,relatime shared:6 - bpf bpf rw,mode=700
59 1 202:1 / / rw,noatime shared:1 - xfs /dev/xvda1 rw,seclabel,attr2,inode64
30 20 0:17 / /sys/fs/selinux rw,nosuid,noexec,relatime shared:7 - selinuxfs selinuxfs rw
33 21 0:16 / /dev/mqueue rw,nosuid,nodev,noexec,relatime shared:15 - mqueue mqueue rw,seclabel
";

    #[test]
    fn parses_root_device() {
        let (major, minor) = parse_root_device(BufReader::new(MOUNT_INFO.as_bytes())).unwrap();
        assert_eq!(major, 202);
        assert_eq!(minor, 1);
    }

    #[test]
    fn fails_without_root_record() {
        let table = "\
27 20 0:24 / /sys/fs/pstore rw,nosuid,nodev,noexec,relatime shared:5 - pstore pstore rw
28 20 0:25 / /sys/fs/bpf rw,nosuid,nodev,noexec,relatime shared:6 - bpf bpf rw
";
        let err = parse_root_device(BufReader::new(table.as_bytes())).unwrap_err();
        assert!(matches!(err, MountError::NoRootDevice));
    }

    #[test]
    fn fails_on_short_record() {
        let table = "59 1 202:1 /\n";
        let err = parse_root_device(BufReader::new(table.as_bytes())).unwrap_err();
        assert!(matches!(err, MountError::Malformed(_)));
    }

    #[test]
    fn fails_on_bad_device_field() {
        let table = "59 1 wrong / / rw,noatime shared:1 - xfs /dev/xvda1 rw\n";
        let err = parse_root_device(BufReader::new(table.as_bytes())).unwrap_err();
        assert!(matches!(err, MountError::Malformed(_)));
    }

    #[test]
    fn rendered_record_round_trips() {
        let line = format!("59 1 {}:{} / / rw,noatime shared:1 - xfs /dev/nvme0n1p2 rw\n", 259, 2);
        let (major, minor) = parse_root_device(BufReader::new(line.as_bytes())).unwrap();
        assert_eq!((major, minor), (259, 2));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reads_live_mountinfo() {
        // Every Linux kernel exposes a root record; only sanity-check the call.
        let _ = root_device().unwrap();
    }
}
