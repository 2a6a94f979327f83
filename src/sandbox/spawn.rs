//! Low-level helper spawn.
//!
//! `std::process::Command` cannot request `CLONE_NEWPID` or a clone-time
//! cgroup, so the relevant slice of process creation is replicated here with
//! clone3(2). Everything the child touches (argv, envp, descriptors) is
//! prepared before the clone; the code between clone3 and execve performs no
//! allocation and calls only async-signal-safe functions.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
use std::os::fd::AsRawFd;

use crate::sandbox::mount::SpawnAttrs;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("executable {0:?} not found in PATH")]
    NotFound(String),

    #[error("environment entry contains an interior nul byte: {0}")]
    BadEnvironment(#[from] std::ffi::NulError),

    #[error("clone failed: {0}")]
    Clone(std::io::Error),
}

/// Resolves `cmd` against PATH the way execvp would, returning the absolute
/// path to hand to the helper. Commands containing a separator are only
/// checked for existence.
pub fn lookup_path(cmd: &str) -> Result<PathBuf, SpawnError> {
    if cmd.contains('/') {
        let path = PathBuf::from(cmd);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(SpawnError::NotFound(cmd.to_string()));
    }

    let search = std::env::var("PATH").unwrap_or_default();
    for dir in search.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(cmd);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(SpawnError::NotFound(cmd.to_string()))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Spawns the helper: a copy of the current executable inside the namespaces
/// and cgroup described by `attrs`, with stdout and stderr redirected to
/// `output` and `env` as its entire environment. Returns the child's OS PID.
#[cfg(target_os = "linux")]
pub fn spawn_helper(
    attrs: &SpawnAttrs,
    env: &[(String, String)],
    output: &File,
) -> Result<i32, SpawnError> {
    let exe = CString::new("/proc/self/exe").map_err(SpawnError::BadEnvironment)?;
    let argv: [*const libc::c_char; 2] = [exe.as_ptr(), std::ptr::null()];

    let env_strings: Vec<CString> = env
        .iter()
        .map(|(k, v)| CString::new(format!("{k}={v}")))
        .collect::<Result<_, _>>()?;
    let mut envp: Vec<*const libc::c_char> = env_strings.iter().map(|e| e.as_ptr()).collect();
    envp.push(std::ptr::null());

    let out_fd = output.as_raw_fd();

    let mut args = CloneArgs {
        flags: attrs.flags,
        exit_signal: libc::SIGCHLD as u64,
        cgroup: attrs
            .cgroup
            .as_ref()
            .map(|fd| fd.as_raw_fd() as u64)
            .unwrap_or(0),
        ..CloneArgs::default()
    };

    // Safety: the child branch runs in a fresh address-space copy and only
    // calls async-signal-safe functions on pre-built data before replacing
    // itself via execve.
    let pid = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            &mut args as *mut CloneArgs,
            std::mem::size_of::<CloneArgs>(),
        )
    };

    match pid {
        -1 => Err(SpawnError::Clone(std::io::Error::last_os_error())),
        0 => unsafe { exec_child(out_fd, exe.as_ptr(), argv.as_ptr(), envp.as_ptr()) },
        pid => Ok(pid as i32),
    }
}

/// Fallback for non-Linux targets: a plain fork/exec with no namespaces and
/// no cgroup. Keeps the helper protocol identical so the rest of the stack
/// is platform-independent.
#[cfg(not(target_os = "linux"))]
pub fn spawn_helper(
    _attrs: &SpawnAttrs,
    env: &[(String, String)],
    output: &File,
) -> Result<i32, SpawnError> {
    use std::os::fd::AsRawFd;

    let exe = CString::new("/proc/self/exe").map_err(SpawnError::BadEnvironment)?;
    let argv: [*const libc::c_char; 2] = [exe.as_ptr(), std::ptr::null()];

    let env_strings: Vec<CString> = env
        .iter()
        .map(|(k, v)| CString::new(format!("{k}={v}")))
        .collect::<Result<_, _>>()?;
    let mut envp: Vec<*const libc::c_char> = env_strings.iter().map(|e| e.as_ptr()).collect();
    envp.push(std::ptr::null());

    let out_fd = output.as_raw_fd();

    match unsafe { libc::fork() } {
        -1 => Err(SpawnError::Clone(std::io::Error::last_os_error())),
        0 => unsafe { exec_child(out_fd, exe.as_ptr(), argv.as_ptr(), envp.as_ptr()) },
        pid => Ok(pid),
    }
}

/// Child-side tail of the spawn. Never returns.
unsafe fn exec_child(
    out_fd: libc::c_int,
    exe: *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
) -> ! {
    libc::dup2(out_fd, libc::STDOUT_FILENO);
    libc::dup2(out_fd, libc::STDERR_FILENO);
    libc::execve(exe, argv, envp);
    // Exec failed; nothing sensible left to do in this address space.
    libc::_exit(127);
}

/// Argument block for clone3(2), mirroring `struct clone_args` from
/// linux/sched.h.
#[cfg(target_os = "linux")]
#[repr(C)]
#[derive(Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_commands_from_path() {
        // sh is guaranteed on any unix worth supporting
        let path = lookup_path("sh").unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("sh"));
    }

    #[test]
    fn passes_through_explicit_paths() {
        assert_eq!(lookup_path("/bin/sh").unwrap(), PathBuf::from("/bin/sh"));
    }

    #[test]
    fn rejects_unknown_commands() {
        let err = lookup_path("definitely-not-a-real-binary").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn rejects_missing_explicit_paths() {
        assert!(matches!(
            lookup_path("/does/not/exist").unwrap_err(),
            SpawnError::NotFound(_)
        ));
    }
}
