//! Client configuration.

use crate::orchestrator::DomainSettings;
use flare_proto::{AddrInfo, Domain};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// `flarec` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shared secret for the rendezvous daemon
    pub secret: String,
    /// Nickname to announce (defaults to `$USER`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nick: Option<String>,
    /// Identity key file for the TCP domain
    #[serde(default = "default_identity_tcp")]
    pub identity_tcp: PathBuf,
    /// Identity key file for the UDP domain
    #[serde(default = "default_identity_udp")]
    pub identity_udp: PathBuf,
    /// Infrastructure per domain, keyed by domain tag
    #[serde(default)]
    pub domains: BTreeMap<String, DomainConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Infrastructure for one domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Rendezvous daemon, `<addr>/p2p/<id>`
    pub server: String,
    /// Relay, `<addr>/p2p/<id>`
    pub relay: String,
    /// Bootstrap peers, `<addr>/p2p/<id>`
    #[serde(default)]
    pub bootstrappers: Vec<String>,
    /// STUN servers used for NAT classification
    #[serde(default)]
    pub stun_servers: Vec<SocketAddr>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_identity_tcp() -> PathBuf {
    PathBuf::from("identity-tcp")
}

fn default_identity_udp() -> PathBuf {
    PathBuf::from("identity-udp")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DomainConfig {
    /// Resolve the configured addresses for `domain`
    ///
    /// # Errors
    ///
    /// Returns an error if any address is not a valid `<addr>/p2p/<id>`.
    pub fn settings(&self, domain: Domain, nick: &str) -> anyhow::Result<DomainSettings> {
        let parse = |what: &str, s: &str| -> anyhow::Result<AddrInfo> {
            s.parse()
                .map_err(|e| anyhow::anyhow!("{domain} {what} '{s}': {e}"))
        };

        Ok(DomainSettings {
            server: parse("server", &self.server)?,
            relay: parse("relay", &self.relay)?,
            bootstrappers: self
                .bootstrappers
                .iter()
                .map(|b| parse("bootstrapper", b))
                .collect::<anyhow::Result<_>>()?,
            nick: nick.to_string(),
            domain,
        })
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Nickname to announce
    #[must_use]
    pub fn nick(&self) -> String {
        self.nick
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "anonymous".to_string())
    }

    /// Identity key file for `domain`
    #[must_use]
    pub fn identity_path(&self, domain: &Domain) -> &Path {
        if *domain == Domain::tcp() {
            &self.identity_tcp
        } else {
            &self.identity_udp
        }
    }

    /// Resolved settings for `domain`, if configured
    ///
    /// # Errors
    ///
    /// Returns an error if the domain's addresses are invalid.
    pub fn domain(&self, domain: &Domain, nick: &str) -> anyhow::Result<Option<DomainSettings>> {
        self.domains
            .get(domain.as_str())
            .map(|d| d.settings(domain.clone(), nick))
            .transpose()
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.secret.is_empty() {
            anyhow::bail!("secret must not be empty");
        }

        for (tag, domain) in &self.domains {
            domain.settings(Domain::new(tag.as_str()), "")?;
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}
