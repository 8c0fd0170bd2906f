//! Configuration management

use crate::proto::DEFAULT_MAX_LINE_LENGTH;
use crate::proto::smtp::DEFAULT_HOSTNAME;
use crate::tls::Thumbprint;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port (default: 25)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Name announced in the HELO/EHLO greeting
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Directory that receives captured messages
    #[serde(default = "default_inbox_dir")]
    pub inbox_dir: String,
    /// Protocol transcript file; unset disables the transcript
    #[serde(default = "default_log_file")]
    pub log_file: Option<String>,
    /// Directory searched for TLS certificates
    #[serde(default = "default_cert_store")]
    pub cert_store: String,
    /// Thumbprint of the STARTTLS certificate; unset disables STARTTLS
    #[serde(default)]
    pub cert_thumbprint: Option<String>,
    /// Inactivity bound on every read, in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Longest accepted protocol line, in bytes
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            hostname: default_hostname(),
            inbox_dir: default_inbox_dir(),
            log_file: default_log_file(),
            cert_store: default_cert_store(),
            cert_thumbprint: None,
            read_timeout_ms: default_read_timeout_ms(),
            max_line_length: default_max_line_length(),
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    25
}
fn default_hostname() -> String {
    DEFAULT_HOSTNAME.to_string()
}
fn default_inbox_dir() -> String {
    "dummy-smtp-inbox".to_string()
}
fn default_log_file() -> Option<String> {
    Some("log.txt".to_string())
}
fn default_cert_store() -> String {
    "certs".to_string()
}
fn default_read_timeout_ms() -> u64 {
    6000
}
fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

impl ServerConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig =
            serde_yaml::from_str(&content).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get socket address to bind to
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("bind address {}:{}: {e}", self.host, self.port)))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Parsed certificate thumbprint, if STARTTLS is enabled
    pub fn thumbprint(&self) -> Result<Option<Thumbprint>> {
        match self.cert_thumbprint.as_deref() {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => s
                .parse()
                .map(Some)
                .map_err(|e| Error::InvalidConfig(format!("{e}"))),
        }
    }

    /// Check everything that can be checked before binding
    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        self.thumbprint()?;
        if self.read_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "read_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_line_length == 0 {
            return Err(Error::InvalidConfig(
                "max_line_length must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Generate example configuration
pub fn generate_example_config() -> String {
    r#"# Dummy SMTP Configuration

# Listen address (0.0.0.0 for all interfaces)
host: "0.0.0.0"

# SMTP port
port: 25

# Name announced in the HELO/EHLO greeting
hostname: "dummy-smtp-localhost"

# Captured messages land here, one .eml file per message
inbox_dir: "dummy-smtp-inbox"

# Timestamped transcript of every protocol line (remove to disable)
log_file: "log.txt"

# Directory holding <name>.crt / <name>.key pairs
cert_store: "certs"

# SHA-256 thumbprint of the STARTTLS certificate; omit to disable STARTTLS.
# dummy-smtp-gen-certs prints the thumbprint of the certificate it creates.
# cert_thumbprint: "3A:7F:..."

# Drop a connection after this long without input
read_timeout_ms: 6000

# Longest accepted protocol line in bytes
max_line_length: 65536
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 25);
        assert_eq!(config.hostname, "dummy-smtp-localhost");
        assert_eq!(config.read_timeout(), Duration::from_secs(6));
        assert!(config.thumbprint().unwrap().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_example_config_parses() {
        let config: ServerConfig = serde_yaml::from_str(&generate_example_config()).unwrap();
        assert_eq!(config.inbox_dir, "dummy-smtp-inbox");
        assert_eq!(config.log_file.as_deref(), Some("log.txt"));
        assert!(config.cert_thumbprint.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ServerConfig = serde_yaml::from_str("port: 2525\n").unwrap();
        assert_eq!(config.port, 2525);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.max_line_length, DEFAULT_MAX_LINE_LENGTH);
    }

    #[test]
    fn test_thumbprint_validation() {
        let mut config = ServerConfig {
            cert_thumbprint: Some("not-a-thumbprint".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.cert_thumbprint = Some("0f".repeat(32));
        assert!(config.thumbprint().unwrap().is_some());

        config.cert_thumbprint = Some("  ".to_string());
        assert!(config.thumbprint().unwrap().is_none());
    }

    #[test]
    fn test_invalid_bind_addr() {
        let config = ServerConfig {
            host: "not an address".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.bind_addr(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let config = ServerConfig {
            port: 2525,
            cert_thumbprint: Some("ab".repeat(32)),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();

        let loaded = ServerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.port, 2525);
        assert_eq!(loaded.cert_thumbprint, config.cert_thumbprint);
    }
}
