//! Helper-side bootstrap for the two-stage launch.
//!
//! Jobs are not spawned directly: the supervisor re-execs its own binary
//! (`/proc/self/exe`) into fresh namespaces and encodes the real command in
//! the environment. The re-execed copy, the helper, detects the marker
//! variable, hardens its mounts and finally execs the target, which keeps
//! the target as PID 1 inside its PID namespace.
//!
//! `maybe_exec_helper` must run at the very top of every binary's `main`,
//! before any runtime or CLI wiring.

use std::collections::HashMap;
use std::ffi::CString;

use crate::sandbox::mount::{self, MountError};

/// Marker: the current process is the re-execed helper.
pub const CHILD_ENV: &str = "JES_CHILD";
/// Absolute path of the target executable, resolved by the parent.
pub const CMD_ENV: &str = "JES_CMD";
/// Number of `JES_ARG_<i>` variables to collect.
pub const ARGC_ENV: &str = "JES_ARGC";
/// Prefix for the per-argument variables.
pub const ARG_PREFIX: &str = "JES_ARG_";

/// Upper bound on forwarded arguments.
pub const MAX_ARGS: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("{CMD_ENV} must be set to a non-empty string")]
    MissingCommand,

    #[error("{ARGC_ENV} is missing or not an integer")]
    BadArgCount,

    #[error("too many arguments, {MAX_ARGS} is the limit")]
    TooManyArgs,

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error("argument contains an interior nul byte: {0}")]
    BadArgument(#[from] std::ffi::NulError),

    #[error("error executing command {0}: {1}")]
    Exec(String, nix::Error),
}

/// Returns true when the marker variable says we are the helper child.
pub fn is_helper(env: &HashMap<String, String>) -> bool {
    env.get(CHILD_ENV).map(String::as_str) == Some("true")
}

/// Rebuilds the exec argv from the environment contract: the command first,
/// then up to `JES_ARGC` arguments. Variables that are missing or empty are
/// silently skipped.
pub fn exec_args(env: &HashMap<String, String>) -> Result<Vec<String>, BootstrapError> {
    let cmd = env
        .get(CMD_ENV)
        .filter(|v| !v.is_empty())
        .ok_or(BootstrapError::MissingCommand)?;

    let count: usize = env
        .get(ARGC_ENV)
        .and_then(|v| v.parse().ok())
        .ok_or(BootstrapError::BadArgCount)?;
    if count > MAX_ARGS {
        return Err(BootstrapError::TooManyArgs);
    }

    let mut args = Vec::with_capacity(count + 1);
    args.push(cmd.clone());
    for i in 0..count {
        if let Some(value) = env.get(&format!("{ARG_PREFIX}{i}")) {
            if !value.is_empty() {
                args.push(value.clone());
            }
        }
    }
    Ok(args)
}

/// Builds the helper environment for a resolved command: the per-argument
/// variables, the contract variables, and PATH so the helper's own re-exec
/// machinery keeps working.
pub fn helper_env(cmd_path: &str, args: &[String]) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = args
        .iter()
        .enumerate()
        .map(|(i, arg)| (format!("{ARG_PREFIX}{i}"), arg.clone()))
        .collect();
    env.push((CMD_ENV.to_string(), cmd_path.to_string()));
    env.push((CHILD_ENV.to_string(), "true".to_string()));
    env.push((ARGC_ENV.to_string(), args.len().to_string()));
    env.push((
        "PATH".to_string(),
        std::env::var("PATH").unwrap_or_default(),
    ));
    env
}

/// Entry-point dispatch. When the current process is the helper child this
/// never returns: it mounts the sandbox and execs the target, or reports the
/// failure on stderr and exits 1. The parent path falls straight through.
pub fn maybe_exec_helper() {
    let env: HashMap<String, String> = std::env::vars().collect();
    if !is_helper(&env) {
        return;
    }
    // Only reached on failure: exec replaces the process image on success.
    let err = run_helper(&env);
    eprintln!("error building sandbox: {err}");
    std::process::exit(1);
}

fn run_helper(env: &HashMap<String, String>) -> BootstrapError {
    let args = match exec_args(env) {
        Ok(args) => args,
        Err(err) => return err,
    };
    if let Err(err) = mount::harden_mounts() {
        return err.into();
    }

    let argv: Vec<CString> = match args.iter().map(|a| CString::new(a.as_str())).collect() {
        Ok(argv) => argv,
        Err(err) => return err.into(),
    };
    let envp: Vec<CString> = std::env::vars()
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect();

    match nix::unistd::execve(&argv[0], &argv, &envp) {
        Ok(infallible) => match infallible {},
        Err(err) => BootstrapError::Exec(args[0].clone(), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn detects_helper_marker() {
        assert!(!is_helper(&HashMap::new()));
        assert!(!is_helper(&env(&[(CHILD_ENV, "")])));
        assert!(!is_helper(&env(&[(CHILD_ENV, "1")])));
        assert!(is_helper(&env(&[(CHILD_ENV, "true")])));
    }

    #[test]
    fn rebuilds_command_and_args() {
        let env = env(&[
            (CMD_ENV, "/bin/echo"),
            (ARGC_ENV, "2"),
            ("JES_ARG_0", "hello"),
            ("JES_ARG_1", "world"),
        ]);
        assert_eq!(exec_args(&env).unwrap(), ["/bin/echo", "hello", "world"]);
    }

    #[test]
    fn zero_arg_count_execs_bare_command() {
        let env = env(&[(CMD_ENV, "/bin/true"), (ARGC_ENV, "0")]);
        assert_eq!(exec_args(&env).unwrap(), ["/bin/true"]);
    }

    #[test]
    fn skips_missing_and_empty_arguments() {
        let env = env(&[
            (CMD_ENV, "/bin/echo"),
            (ARGC_ENV, "3"),
            ("JES_ARG_1", ""),
            ("JES_ARG_2", "kept"),
        ]);
        assert_eq!(exec_args(&env).unwrap(), ["/bin/echo", "kept"]);
    }

    #[test]
    fn rejects_missing_command() {
        let err = exec_args(&env(&[(ARGC_ENV, "0")])).unwrap_err();
        assert!(matches!(err, BootstrapError::MissingCommand));
    }

    #[test]
    fn rejects_missing_or_bad_arg_count() {
        let err = exec_args(&env(&[(CMD_ENV, "/bin/true")])).unwrap_err();
        assert!(matches!(err, BootstrapError::BadArgCount));

        let err = exec_args(&env(&[(CMD_ENV, "/bin/true"), (ARGC_ENV, "nope")])).unwrap_err();
        assert!(matches!(err, BootstrapError::BadArgCount));
    }

    #[test]
    fn enforces_argument_limit() {
        let at_limit = env(&[(CMD_ENV, "/bin/true"), (ARGC_ENV, "50")]);
        assert_eq!(exec_args(&at_limit).unwrap(), ["/bin/true"]);

        let over = env(&[(CMD_ENV, "/bin/true"), (ARGC_ENV, "51")]);
        assert!(matches!(
            exec_args(&over).unwrap_err(),
            BootstrapError::TooManyArgs
        ));
    }

    #[test]
    fn helper_env_carries_the_contract() {
        let args = vec!["-c".to_string(), "echo hi".to_string()];
        let env: HashMap<String, String> = helper_env("/bin/bash", &args).into_iter().collect();

        assert_eq!(env.get(CHILD_ENV).map(String::as_str), Some("true"));
        assert_eq!(env.get(CMD_ENV).map(String::as_str), Some("/bin/bash"));
        assert_eq!(env.get(ARGC_ENV).map(String::as_str), Some("2"));
        assert_eq!(env.get("JES_ARG_0").map(String::as_str), Some("-c"));
        assert_eq!(env.get("JES_ARG_1").map(String::as_str), Some("echo hi"));
        assert!(env.contains_key("PATH"));

        assert_eq!(exec_args(&env).unwrap(), ["/bin/bash", "-c", "echo hi"]);
    }
}
