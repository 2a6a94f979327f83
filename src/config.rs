//! Server and client configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Handshake/request deadline for the short request/response RPCs this
/// service serves.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer size for the output streaming channel.
pub const CHANNEL_BUFFER_SIZE: usize = 128;

/// Server configuration, populated from CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address in host:port format.
    pub listen: String,
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: "localhost:8080".to_string(),
            ca: PathBuf::from("ca/ca.crt"),
            cert: PathBuf::from("ca/server.crt"),
            key: PathBuf::from("ca/server.key"),
        }
    }
}

/// Client configuration, populated from CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address in host:port format.
    pub addr: String,
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "localhost:8080".to_string(),
            ca: PathBuf::from("ca/ca.crt"),
            cert: PathBuf::from("ca/client_user1.crt"),
            key: PathBuf::from("ca/client_user1.key"),
        }
    }
}
