// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::{HashMap, HashSet},
    error::Error,
    fmt,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::commands::{Handle, HandledResult};

/// Config, along with its children Host, Polling, and Ssh, is the model for a monitored cluster
/// used in the configuration file. The config file is deserialized into a Config object.
///
/// The in-memory model (`cluster::Cluster`) is built from this, so the file format can stay stable
/// while the dynamic model changes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub name: String,
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub polling: Polling,
    #[serde(default)]
    pub ssh: Ssh,
}

impl Config {
    /// Read and deserialize the config file at `path`.
    pub fn from_file(path: &str) -> HandledResult<Self> {
        let config = std::fs::read_to_string(path).handle_err(|e| {
            eprintln!("Could not open config file \"{path}\": {e}");
        })?;
        Self::from_toml(&config).handle_err(|e| {
            eprintln!("Could not parse config file \"{path}\": {e}");
        })
    }

    pub fn from_toml(config: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(config)
    }

    /// Check the things serde cannot: the host list must be non-empty and unique, host ports must
    /// parse, and no polling interval may be zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::NoHosts);
        }

        let mut seen = HashSet::new();
        for host in self.hosts.iter() {
            let (name, _) = host.name_and_port()?;
            if !seen.insert(name.to_string()) {
                return Err(ConfigError::DuplicateHost(name.to_string()));
            }
        }

        for (field, value) in [
            ("retry_interval_ms", self.polling.retry_interval_ms),
            ("ping_timeout_ms", self.polling.ping_timeout_ms),
            ("kill_timeout_ms", self.polling.kill_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(field));
            }
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Host {
    /// "<address>" or "<address>:<ssh port>".
    pub hostname: String,
}

impl Host {
    /// Split the hostname into its address and optional port portions.
    pub fn name_and_port(&self) -> Result<(&str, Option<u16>), ConfigError> {
        match self.hostname.split_once(':') {
            None => Ok((&self.hostname, None)),
            Some((name, port)) => match port.parse::<u16>() {
                Ok(port) => Ok((name, Some(port))),
                Err(_) => Err(ConfigError::BadPort(self.hostname.clone())),
            },
        }
    }
}

/// Timing of the status polling loops, in milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Polling {
    /// How long a channel sleeps before reissuing its command after the command ended.
    pub retry_interval_ms: u64,
    /// How long the connectivity channel tolerates silence before marking its host disconnected.
    pub ping_timeout_ms: u64,
    /// How long `stop()` waits for a killed command to report its exit code.
    pub kill_timeout_ms: u64,
}

impl Default for Polling {
    fn default() -> Self {
        Polling {
            retry_interval_ms: 5000,
            ping_timeout_ms: 10000,
            kill_timeout_ms: 5000,
        }
    }
}

impl Polling {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

/// How the ssh client is invoked, and which remote command body each command id runs.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Ssh {
    pub user: Option<String>,
    /// Extra arguments passed to `ssh` before the host name.
    pub options: Vec<String>,
    /// Overrides of the remote command bodies, keyed by command id.
    pub commands: HashMap<String, String>,
}

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    NoHosts,
    DuplicateHost(String),
    BadPort(String),
    ZeroInterval(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoHosts => write!(f, "the cluster has no hosts"),
            ConfigError::DuplicateHost(name) => write!(f, "host '{name}' is listed twice"),
            ConfigError::BadPort(hostname) => write!(f, "invalid port in host '{hostname}'"),
            ConfigError::ZeroInterval(field) => write!(f, "polling.{field} must not be zero"),
        }
    }
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
name = "web"

[[hosts]]
hostname = "alice"

[[hosts]]
hostname = "bob:2222"

[polling]
retry_interval_ms = 100

[ssh]
user = "root"
[ssh.commands]
ClusterStatus = "/opt/helper cluster-status"
"#;

    #[test]
    fn parse_with_defaults() {
        let config = Config::from_toml(CONFIG).unwrap();
        assert_eq!(config.name, "web");
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.polling.retry_interval_ms, 100);
        assert_eq!(config.polling.ping_timeout_ms, 10000);
        assert_eq!(config.ssh.user.as_deref(), Some("root"));
        assert_eq!(
            config.ssh.commands.get("ClusterStatus").map(String::as_str),
            Some("/opt/helper cluster-status")
        );
        assert_eq!(config.hosts[1].name_and_port(), Ok(("bob", Some(2222))));
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_bad_configs() {
        let mut config = Config::from_toml(CONFIG).unwrap();
        config.hosts.push(Host {
            hostname: "alice:23".to_string(),
        });
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateHost("alice".to_string()))
        );

        config.hosts.pop();
        config.hosts.push(Host {
            hostname: "carol:ssh".to_string(),
        });
        assert_eq!(
            config.validate(),
            Err(ConfigError::BadPort("carol:ssh".to_string()))
        );

        config.hosts.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoHosts));

        let mut config = Config::from_toml(CONFIG).unwrap();
        config.polling.kill_timeout_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval("kill_timeout_ms"))
        );
    }
}
