//! Engine connection and cache directory configuration
//!
//! Connection settings resolve with CLI > environment > platform
//! default precedence. The cache directory holds fetched sources and
//! derived (patched) trees, keyed by content hash.

use crate::error::{KilnError, KilnResult};
use std::env;
use std::path::PathBuf;

/// Default engine socket on unix platforms
pub const DEFAULT_SOCKET: &str = "unix:///var/run/docker.sock";

/// Where the container engine listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineHost {
    /// Unix domain socket path
    Unix(PathBuf),
    /// TCP host and port
    Tcp { host: String, port: u16 },
}

/// TLS material for a TCP engine connection
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA bundle used to verify the engine certificate
    pub ca_file: Option<PathBuf>,
    /// Client certificate presented to the engine
    pub cert_file: Option<PathBuf>,
    /// Client private key
    pub key_file: Option<PathBuf>,
    /// Verify the engine's certificate chain
    pub verify: bool,
}

/// Resolved engine connection settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine endpoint
    pub host: EngineHost,
    /// TLS settings; `None` means plaintext
    pub tls: Option<TlsConfig>,
}

impl EngineConfig {
    /// Resolve connection settings: CLI flag, then `DOCKER_HOST`, then
    /// the platform default socket.
    pub fn resolve(cli_host: Option<&str>, tls: Option<TlsConfig>) -> KilnResult<Self> {
        let raw = match cli_host {
            Some(h) => h.to_string(),
            None => env::var("DOCKER_HOST").unwrap_or_else(|_| DEFAULT_SOCKET.to_string()),
        };
        let host = parse_host(&raw, tls.is_some())?;

        if matches!(host, EngineHost::Unix(_)) && tls.is_some() {
            return Err(KilnError::Tls(
                "TLS options require a tcp:// engine host".to_string(),
            ));
        }

        Ok(Self { host, tls })
    }
}

/// Parse an engine host url (`unix://...` or `tcp://host[:port]`)
pub fn parse_host(raw: &str, tls: bool) -> KilnResult<EngineHost> {
    if let Some(path) = raw.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(KilnError::InvalidHost(raw.to_string()));
        }
        return Ok(EngineHost::Unix(PathBuf::from(path)));
    }

    let rest = raw
        .strip_prefix("tcp://")
        .or_else(|| raw.strip_prefix("http://"))
        .or_else(|| raw.strip_prefix("https://"))
        .ok_or_else(|| KilnError::InvalidHost(raw.to_string()))?;

    let rest = rest.trim_end_matches('/');
    let default_port = if tls || raw.starts_with("https://") {
        2376
    } else {
        2375
    };

    let (host, port) = match rest.rsplit_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| KilnError::InvalidHost(raw.to_string()))?;
            (h.to_string(), port)
        }
        None => (rest.to_string(), default_port),
    };

    if host.is_empty() {
        return Err(KilnError::InvalidHost(raw.to_string()));
    }

    Ok(EngineHost::Tcp { host, port })
}

/// Resolve the source cache directory
///
/// An explicit override wins; otherwise `~/.cache/kiln`, falling back
/// to a temp-dir location when no home is available.
pub fn cache_dir(override_dir: Option<&PathBuf>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .map(|d| d.join("kiln"))
        .unwrap_or_else(|| env::temp_dir().join("kiln"))
}
