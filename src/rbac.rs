//! Role-based access control over the RPC surface.
//!
//! Identity is the common name of the client's leaf certificate; the mTLS
//! handshake has already proven possession of the matching key by the time a
//! request reaches a handler. Authorization dispatches on the shape of the
//! request: requests carrying a command are checked against the role's
//! whitelist, requests carrying a job ID are checked against the ownership
//! ledger. Everything else is rejected outright.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tonic::{Request, Status};

use crate::pb;

/// Role entry granting every command.
const WILDCARD: &str = "*";

/// Requests that name a command to execute (the Start shape).
pub trait CarriesCommand {
    fn command(&self) -> &str;
}

/// Requests that name an existing job (the Get/Stdout/Stop shape).
pub trait CarriesPid {
    fn pid(&self) -> u64;
}

impl CarriesCommand for pb::StartRequest {
    fn command(&self) -> &str {
        &self.cmd
    }
}

impl CarriesPid for pb::GetRequest {
    fn pid(&self) -> u64 {
        self.pid
    }
}

impl CarriesPid for pb::OutputRequest {
    fn pid(&self) -> u64 {
        self.pid
    }
}

impl CarriesPid for pb::StopRequest {
    fn pid(&self) -> u64 {
        self.pid
    }
}

/// Extracts the caller's identity from the TLS peer certificate. Requests
/// without TLS peer information are unauthenticated.
pub fn peer_identity<T>(request: &Request<T>) -> Result<String, Status> {
    let certs = request
        .peer_certs()
        .ok_or_else(|| Status::unauthenticated("no TLS peer information"))?;
    let leaf = certs
        .first()
        .ok_or_else(|| Status::unauthenticated("peer presented no certificate"))?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|err| Status::unauthenticated(format!("invalid peer certificate: {err}")))?;
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| Status::unauthenticated("peer certificate has no common name"));
    common_name
}

pub struct Rbac {
    // Users and roles never mutate after construction, so they need no lock.
    users: HashMap<String, String>,
    roles: HashMap<String, HashSet<String>>,
    /// Ownership ledger: user -> job IDs started by that user. Append-only
    /// for the lifetime of the service.
    owners: RwLock<HashMap<String, HashSet<u64>>>,
}

impl Rbac {
    /// Builds the interceptor with the template user database. A production
    /// deployment would back this with a directory service.
    pub fn new() -> Self {
        let users = [("user1", "admin"), ("user2", "user"), ("user3", "user")]
            .into_iter()
            .map(|(u, r)| (u.to_string(), r.to_string()))
            .collect();
        let mut roles: HashMap<String, HashSet<String>> = HashMap::new();
        let _ = roles.insert(
            "admin".to_string(),
            [WILDCARD].into_iter().map(str::to_string).collect(),
        );
        let _ = roles.insert(
            "user".to_string(),
            ["cat", "ls", "sleep", "echo"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        );
        Rbac {
            users,
            roles,
            owners: RwLock::new(HashMap::new()),
        }
    }

    /// Authorizes a command-shaped request: the user's role must whitelist
    /// the command, or hold the wildcard.
    pub fn authorize_command(&self, user: &str, request: &impl CarriesCommand) -> Result<(), Status> {
        let role = self.users.get(user).map(String::as_str).unwrap_or_default();
        let cmd = request.command();
        if self.command_allowed(role, cmd) {
            tracing::debug!(user, role, cmd, "command authorized");
            return Ok(());
        }
        tracing::warn!(user, role, cmd, "user unauthorized");
        Err(Status::permission_denied(format!(
            "user {user}/{role} not authorized to run {cmd}"
        )))
    }

    /// Authorizes a PID-shaped request: the user must own the job or be an
    /// admin.
    pub fn authorize_access(&self, user: &str, request: &impl CarriesPid) -> Result<(), Status> {
        let pid = request.pid();
        if self.owns(user, pid) || self.user_is_admin(user) {
            tracing::debug!(user, pid, "access authorized");
            return Ok(());
        }
        let role = self.users.get(user).map(String::as_str).unwrap_or_default();
        tracing::warn!(user, role, pid, "user unauthorized");
        Err(Status::permission_denied(format!(
            "user {user}/{role} not authorized"
        )))
    }

    /// Records that `user` started job `pid`.
    pub fn record_ownership(&self, user: &str, pid: u64) {
        let mut owners = self
            .owners
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        let _ = owners.entry(user.to_string()).or_default().insert(pid);
    }

    fn owns(&self, user: &str, pid: u64) -> bool {
        let owners = self
            .owners
            .read()
            .unwrap_or_else(|poison| poison.into_inner());
        owners.get(user).is_some_and(|pids| pids.contains(&pid))
    }

    fn command_allowed(&self, role: &str, cmd: &str) -> bool {
        let Some(granted) = self.roles.get(role) else {
            return false;
        };
        granted.contains(cmd) || granted.contains(WILDCARD)
    }

    fn user_is_admin(&self, user: &str) -> bool {
        self.users
            .get(user)
            .and_then(|role| self.roles.get(role))
            .is_some_and(|granted| granted.contains(WILDCARD))
    }
}

impl Default for Rbac {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_request(cmd: &str) -> pb::StartRequest {
        pb::StartRequest {
            cmd: cmd.to_string(),
            args: vec![],
            limits: None,
        }
    }

    #[test]
    fn admin_runs_anything() {
        let rbac = Rbac::new();
        assert!(rbac
            .authorize_command("user1", &start_request("anystring"))
            .is_ok());
    }

    #[test]
    fn user_is_limited_to_whitelist() {
        let rbac = Rbac::new();
        assert!(rbac.authorize_command("user2", &start_request("ls")).is_ok());
        let err = rbac
            .authorize_command("user2", &start_request("rm"))
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }

    #[test]
    fn unknown_users_are_denied() {
        let rbac = Rbac::new();
        let err = rbac
            .authorize_command("stranger", &start_request("ls"))
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }

    #[test]
    fn ownership_gates_pid_requests() {
        let rbac = Rbac::new();
        rbac.record_ownership("user2", 7);

        assert!(rbac
            .authorize_access("user2", &pb::GetRequest { pid: 7 })
            .is_ok());
        let err = rbac
            .authorize_access("user3", &pb::GetRequest { pid: 7 })
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }

    #[test]
    fn admin_bypasses_ownership() {
        let rbac = Rbac::new();
        rbac.record_ownership("user2", 7);
        assert!(rbac
            .authorize_access("user1", &pb::GetRequest { pid: 7 })
            .is_ok());
    }

    #[test]
    fn ownership_is_per_pid() {
        let rbac = Rbac::new();
        rbac.record_ownership("user2", 7);
        let err = rbac
            .authorize_access("user2", &pb::StopRequest { pid: 8 })
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }

    #[test]
    fn requests_without_tls_info_are_unauthenticated() {
        let request = Request::new(());
        let err = peer_identity(&request).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }
}
