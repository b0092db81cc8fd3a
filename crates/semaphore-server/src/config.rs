//! Server configuration: CLI flags with environment fallbacks.
//!
//! Every knob is a flag whose value can also come from the environment
//! variable the deployment tooling sets (`SERVER_HOST`, `CERT_FILE`, ...).
//! Validation runs once at startup; a failure is fatal and exits non-zero.

use clap::Parser;
use semaphore_core::{RelayError, RelayResult};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command line interface for the relay binary.
#[derive(Parser, Debug)]
#[command(name = "semaphore-server", version, about = "WebRTC signaling relay")]
pub struct Cli {
    /// Listen address
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0:9000")]
    pub host: String,

    /// TLS certificate (PEM)
    #[arg(long, env = "CERT_FILE")]
    pub cert_file: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Refuse to serve plaintext
    #[arg(long, env = "REQUIRE_TLS", default_value_t = true, action = clap::ArgAction::Set)]
    pub require_tls: bool,

    /// Generate a self-signed certificate when none exists (development only)
    #[arg(long, env = "AUTO_GENERATE_CERTS", default_value_t = false, action = clap::ArgAction::Set)]
    pub auto_generate_certs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Advisory client cap, reported by /stats
    #[arg(long, env = "MAX_CLIENTS", default_value_t = 1000)]
    pub max_clients: usize,

    /// Registration deadline for new connections, in seconds
    #[arg(long, env = "CONNECTION_TIMEOUT", default_value_t = 60)]
    pub connection_timeout: u64,

    /// Allowed WebSocket origins (comma-separated exact matches)
    #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Skip the Origin whitelist (development only)
    #[arg(long, env = "DISABLE_ORIGIN_CHECK", default_value_t = false, action = clap::ArgAction::Set)]
    pub disable_origin_check: bool,
}

/// Resolved process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub require_tls: bool,
    pub auto_generate_certs: bool,
    pub log_level: String,
    pub max_clients: usize,
    pub connection_timeout: u64,
    pub allowed_origins: Vec<String>,
    pub disable_origin_check: bool,
}

/// Origins accepted by default: the local dev servers and the desktop shell.
pub fn default_origins() -> Vec<String> {
    [
        "http://localhost:9000",
        "http://127.0.0.1:9000",
        "http://localhost:1420",
        "http://127.0.0.1:1420",
        "tauri://localhost",
    ]
    .map(str::to_owned)
    .to_vec()
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Config {
        let allowed_origins: Vec<String> = cli
            .allowed_origins
            .iter()
            .map(|origin| origin.trim().to_owned())
            .filter(|origin| !origin.is_empty())
            .collect();
        Config {
            host: cli.host,
            cert_file: cli.cert_file,
            key_file: cli.key_file,
            require_tls: cli.require_tls,
            auto_generate_certs: cli.auto_generate_certs,
            log_level: cli.log_level,
            max_clients: cli.max_clients,
            connection_timeout: cli.connection_timeout,
            allowed_origins: if allowed_origins.is_empty() {
                default_origins()
            } else {
                allowed_origins
            },
            disable_origin_check: cli.disable_origin_check,
        }
    }
}

impl Config {
    /// Check the configuration before anything binds or spawns.
    ///
    /// Certificate existence is checked after any self-signed generation has
    /// run, so `auto_generate_certs` is an accepted substitute for
    /// preprovisioned files.
    pub fn validate(&self) -> RelayResult<()> {
        if self.host.is_empty() {
            return Err(RelayError::Config("listen address must not be empty".into()));
        }
        self.host
            .parse::<SocketAddr>()
            .map_err(|e| RelayError::Config(format!("invalid listen address {:?}: {e}", self.host)))?;
        if self.max_clients == 0 {
            return Err(RelayError::Config("MAX_CLIENTS must be greater than zero".into()));
        }
        if self.connection_timeout == 0 {
            return Err(RelayError::Config(
                "CONNECTION_TIMEOUT must be greater than zero".into(),
            ));
        }

        if self.require_tls {
            let (cert, key) = match (&self.cert_file, &self.key_file) {
                (Some(cert), Some(key)) => (cert, key),
                _ => {
                    if self.auto_generate_certs {
                        return Ok(());
                    }
                    return Err(RelayError::Config(
                        "TLS is required but no certificate is configured; \
                         set CERT_FILE and KEY_FILE or enable AUTO_GENERATE_CERTS"
                            .into(),
                    ));
                }
            };
            if !cert.exists() {
                return Err(RelayError::Config(format!(
                    "certificate file not found: {}",
                    cert.display()
                )));
            }
            if !key.exists() {
                return Err(RelayError::Config(format!(
                    "private key file not found: {}",
                    key.display()
                )));
            }
        }

        Ok(())
    }
}
