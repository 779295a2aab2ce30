//! Configuration for Warden
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use uuid::Uuid;

use crate::types::{Result, WardenError};

/// Default rotation window for CA generations, in days.
pub const DEFAULT_ROTATION_DAYS: i64 = 365;

/// Warden - identity and access control server
#[derive(Parser, Debug, Clone)]
#[command(name = "warden")]
#[command(about = "Identity and access control server for infrastructure resources")]
pub struct Args {
    /// Unique node identifier for this server instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Plaintext API listen address
    #[arg(long, env = "LISTEN_HTTP", default_value = "127.0.0.1:8080")]
    pub listen_http: SocketAddr,

    /// TLS API listen address
    #[arg(long, env = "LISTEN_HTTPS", default_value = "127.0.0.1:8443")]
    pub listen_https: SocketAddr,

    /// Metrics/health listen address
    #[arg(long, env = "LISTEN_METRICS", default_value = "127.0.0.1:9090")]
    pub listen_metrics: SocketAddr,

    /// SQLite database path (":memory:" for an ephemeral store)
    #[arg(long, env = "DB_PATH", default_value = "warden.db")]
    pub db_path: String,

    /// Network encryption mode: "mtls" or "none"
    ///
    /// In mtls mode the TLS listener requires client certificates verified
    /// against the active CA pool. In "none" mode it serves per-hostname
    /// self-signed certificates generated on demand.
    #[arg(long, env = "NETWORK_ENCRYPTION", default_value = "mtls")]
    pub network_encryption: String,

    /// Hostnames/IPs placed in the server leaf certificate SANs
    /// (comma-separated)
    #[arg(long, env = "SERVER_HOSTS", default_value = "localhost,127.0.0.1")]
    pub server_hosts: String,

    /// Full CA key rotation window in days
    #[arg(long, env = "FULL_KEY_ROTATION_DAYS", default_value_t = DEFAULT_ROTATION_DAYS)]
    pub full_key_rotation_days: i64,

    /// Directory holding local root key material
    #[arg(long, env = "ROOT_KEY_DIR", default_value = ".warden/keys")]
    pub root_key_dir: PathBuf,

    /// Root key id used to wrap the database data key
    #[arg(long, env = "ROOT_KEY_ID", default_value = "default")]
    pub root_key_id: String,

    /// Pre-supplied root CA certificate (PEM), seeded before generating one
    #[arg(long, env = "INITIAL_ROOT_CA_CERT")]
    pub initial_root_ca_cert: Option<String>,

    /// Pre-supplied root CA public key (base64), paired with the cert above
    #[arg(long, env = "INITIAL_ROOT_CA_PUBLIC_KEY")]
    pub initial_root_ca_public_key: Option<String>,

    /// Externally trusted client public key (base64) seeded on first boot
    #[arg(long, env = "TRUST_INITIAL_CLIENT_PUBLIC_KEY")]
    pub trust_initial_client_public_key: Option<String>,

    /// Heartbeat interval in seconds
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value = "3600")]
    pub heartbeat_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Validate configuration before any subsystem starts.
    ///
    /// Configuration errors are fatal: the process must not begin serving
    /// traffic with a partially sensible trust setup.
    pub fn validate(&self) -> Result<()> {
        match self.network_encryption.as_str() {
            "mtls" | "none" => {}
            other => {
                return Err(WardenError::Config(format!(
                    "unknown network encryption mode {:?} (expected \"mtls\" or \"none\")",
                    other
                )));
            }
        }

        if self.full_key_rotation_days <= 0 {
            return Err(WardenError::Config(format!(
                "full key rotation window must be positive, got {}",
                self.full_key_rotation_days
            )));
        }

        if self.root_key_id.is_empty() {
            return Err(WardenError::Config("root key id must not be empty".into()));
        }

        // Initial CA material comes as a pair; half of it is a config error.
        if self.initial_root_ca_cert.is_some() != self.initial_root_ca_public_key.is_some() {
            return Err(WardenError::Config(
                "initial root CA cert and public key must be supplied together".into(),
            ));
        }

        if self.host_list().is_empty() {
            return Err(WardenError::Config("server hosts must not be empty".into()));
        }

        Ok(())
    }

    /// Server hostnames for leaf certificate SANs.
    pub fn host_list(&self) -> Vec<String> {
        self.server_hosts
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect()
    }

    /// Whether the TLS listener runs in mutual-TLS mode.
    pub fn mtls_enabled(&self) -> bool {
        self.network_encryption == "mtls"
    }
}
