use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::auth::StaticIdentity;

const DEFAULT_USERS: &str = "guest:guest:*:guest,admin:slotward:*:admin";

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    Users(String),
    Tls(io::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid {var}: '{value}'"),
            ConfigError::Users(msg) => write!(f, "invalid SLOTWARD_USERS: {msg}"),
            ConfigError::Tls(e) => write!(f, "TLS setup failed: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Server settings, read once from `SLOTWARD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
    pub default_zone: Tz,
    pub users: String,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let users = match lookup("SLOTWARD_USERS") {
            Some(u) => u,
            None => {
                tracing::warn!("SLOTWARD_USERS not set, using built-in default accounts");
                DEFAULT_USERS.to_string()
            }
        };
        Ok(Self {
            port: parsed(&lookup, "SLOTWARD_PORT", 5433)?,
            bind: lookup("SLOTWARD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("SLOTWARD_DATA_DIR").unwrap_or_else(|| "./data".into())),
            max_connections: parsed(&lookup, "SLOTWARD_MAX_CONNECTIONS", 256)?,
            compact_threshold: parsed(&lookup, "SLOTWARD_COMPACT_THRESHOLD", 1000)?,
            lock_timeout: Duration::from_millis(parsed(&lookup, "SLOTWARD_LOCK_TIMEOUT_MS", 10_000)?),
            default_zone: match lookup("SLOTWARD_DEFAULT_TZ") {
                None => Tz::UTC,
                Some(name) => name.parse().map_err(|_| ConfigError::Invalid {
                    var: "SLOTWARD_DEFAULT_TZ",
                    value: name,
                })?,
            },
            users,
            tls_cert: lookup("SLOTWARD_TLS_CERT"),
            tls_key: lookup("SLOTWARD_TLS_KEY"),
            metrics_port: match lookup("SLOTWARD_METRICS_PORT") {
                None => None,
                Some(v) => Some(v.parse().map_err(|_| ConfigError::Invalid {
                    var: "SLOTWARD_METRICS_PORT",
                    value: v,
                })?),
            },
        })
    }

    pub fn identities(&self) -> Result<StaticIdentity, ConfigError> {
        StaticIdentity::parse(&self.users).map_err(ConfigError::Users)
    }

    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref()).map_err(ConfigError::Tls)
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both SLOTWARD_TLS_CERT and SLOTWARD_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.lock_timeout, Duration::from_millis(10_000));
        assert_eq!(cfg.default_zone, Tz::UTC);
        assert!(cfg.metrics_port.is_none());
        assert_eq!(cfg.identities().unwrap().len(), 2);
    }

    #[test]
    fn overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("SLOTWARD_PORT", "6000"),
            ("SLOTWARD_LOCK_TIMEOUT_MS", "250"),
            ("SLOTWARD_DEFAULT_TZ", "Asia/Singapore"),
            ("SLOTWARD_METRICS_PORT", "9100"),
            ("SLOTWARD_USERS", "desk:pw:gym:staff"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.lock_timeout, Duration::from_millis(250));
        assert_eq!(cfg.default_zone, chrono_tz::Asia::Singapore);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.identities().unwrap().len(), 1);
    }

    #[test]
    fn rejects_garbage() {
        let err = Config::from_lookup(lookup(&[("SLOTWARD_PORT", "http")])).unwrap_err();
        assert!(err.to_string().contains("SLOTWARD_PORT"));
        assert!(Config::from_lookup(lookup(&[("SLOTWARD_DEFAULT_TZ", "Mars/Olympus")])).is_err());
    }

    #[test]
    fn tls_requires_both_files() {
        let cfg = Config::from_lookup(lookup(&[("SLOTWARD_TLS_CERT", "/tmp/cert.pem")])).unwrap();
        assert!(matches!(cfg.tls_acceptor(), Err(ConfigError::Tls(_))));
    }
}
