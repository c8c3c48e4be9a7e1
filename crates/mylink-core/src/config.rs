//! `mylink.toml` configuration model.
//!
//! ```toml
//! server = "(address=db1,priority=100),(address=db2:3307,priority=50)"
//! user = "app"
//!
//! [pool]
//! max_size = 20
//! idle_timeout = "3m"
//!
//! [failover]
//! method = "priority"
//! connect_timeout = "5s"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::host::{FailoverMethod, HostEntry};

/// Account used to authenticate every link of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl Credentials {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            ..Self::default()
        }
    }

    pub fn with_password(self, password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            ..self
        }
    }

    pub fn with_database(self, database: &str) -> Self {
        Self {
            database: Some(database.to_string()),
            ..self
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Host list, see [`HostEntry::parse_list`].
    pub server: String,
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub failover: FailoverSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_size: u32,
    pub max_size: u32,
    pub acquire_timeout: String,
    pub idle_timeout: String,
    pub connection_lifetime: Option<String>,
    pub connection_reset: bool,
    pub validate_on_acquire: bool,
    pub maintenance_interval: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 100,
            acquire_timeout: "15s".to_string(),
            idle_timeout: "180s".to_string(),
            connection_lifetime: None,
            connection_reset: false,
            validate_on_acquire: true,
            maintenance_interval: "180s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverSettings {
    /// Explicit method; inferred from the host list when absent.
    pub method: Option<FailoverMethod>,
    pub connect_timeout: String,
    pub demote_timeout: String,
    pub dns_srv: bool,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            method: None,
            connect_timeout: "15s".to_string(),
            demote_timeout: "120s".to_string(),
            dns_srv: false,
        }
    }
}

impl LinkConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml(&content)?)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Parse and validate the host list, including the dns-srv restrictions.
    pub fn hosts(&self) -> ConfigResult<Vec<HostEntry>> {
        let hosts = HostEntry::parse_list(&self.server)?;
        if self.failover.dns_srv {
            if hosts.len() > 1 {
                return Err(ConfigError::MultipleHostsWithDnsSrv);
            }
            if hosts.iter().any(|h| h.port.is_some()) {
                return Err(ConfigError::PortWithDnsSrv);
            }
        }
        Ok(hosts)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.user.trim().to_string(),
            password: self.password.clone(),
            database: self
                .database
                .as_deref()
                .map(str::trim)
                .filter(|db| !db.is_empty())
                .map(str::to_string),
        }
    }

    /// The configured failover method, or the one inferred from `hosts`.
    pub fn failover_method(&self, hosts: &[HostEntry]) -> FailoverMethod {
        self.failover
            .method
            .unwrap_or_else(|| FailoverMethod::infer(hosts))
    }
}

/// Parse a duration string: `500ms`, `15s`, `3m`, `1h`, or bare seconds.
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());

    let parsed = if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    };

    parsed.ok_or_else(invalid)
}
