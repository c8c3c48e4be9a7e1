//! Candidate server addresses and failover host lists.
//!
//! A host list is written either as a plain comma list
//! (`"10.0.0.1, db2:3307, ::1"`) or as parenthesised groups carrying a
//! priority (`"(address=db1,priority=100),(address=db2,priority=50)"`).
//! Whitespace anywhere in the list is ignored.

use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Port used when a host entry does not name one.
pub const DEFAULT_PORT: u16 = 3306;

/// Highest priority a host may carry; the lowest is 0.
pub const MAX_PRIORITY: i64 = 100;

/// One candidate server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostEntry {
    /// Hostname, IPv4 literal, or IPv6 literal (without brackets).
    pub host: String,
    /// Explicit port, `None` means [`DEFAULT_PORT`].
    pub port: Option<u16>,
    /// Explicit priority in `0..=100`. Higher is attempted first.
    pub priority: Option<i64>,
}

impl HostEntry {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            port: None,
            priority: None,
        }
    }

    pub fn with_port(self, port: u16) -> Self {
        Self {
            port: Some(port),
            ..self
        }
    }

    pub fn with_priority(self, priority: i64) -> Self {
        Self {
            priority: Some(priority),
            ..self
        }
    }

    /// The port to connect to.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Whether the host is an IPv6 literal.
    pub fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }

    /// Parse a single address: `host`, `host:port`, `::1`, or `[::1]:port`.
    pub fn parse(input: &str) -> ConfigResult<Self> {
        let s = input.trim();
        if s.is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (addr, tail) = rest
                .split_once(']')
                .ok_or_else(|| ConfigError::InvalidHost(s.to_string()))?;
            if addr.is_empty() {
                return Err(ConfigError::EmptyHost);
            }
            let port = match tail {
                "" => None,
                t => {
                    let digits = t
                        .strip_prefix(':')
                        .ok_or_else(|| ConfigError::InvalidHost(s.to_string()))?;
                    Some(parse_port(digits)?)
                }
            };
            return Ok(Self {
                host: addr.to_string(),
                port,
                priority: None,
            });
        }

        // A bare IPv6 literal cannot carry a port.
        if s.parse::<Ipv6Addr>().is_ok() {
            return Ok(Self::new(s));
        }

        match s.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(ConfigError::EmptyHost);
                }
                Ok(Self::new(host).with_port(parse_port(port)?))
            }
            None => Ok(Self::new(s)),
        }
    }

    /// Parse a full host list in either the plain or the parenthesised form.
    ///
    /// The parsed list is validated with [`HostEntry::validate_list`].
    pub fn parse_list(input: &str) -> ConfigResult<Vec<Self>> {
        let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Err(ConfigError::NoHosts);
        }

        let hosts = if compact.starts_with('(') {
            split_groups(&compact)?
                .into_iter()
                .map(parse_group)
                .collect::<ConfigResult<Vec<_>>>()?
        } else {
            compact
                .split(',')
                .map(Self::parse)
                .collect::<ConfigResult<Vec<_>>>()?
        };

        Self::validate_list(&hosts)?;
        Ok(hosts)
    }

    /// Check the priority rules for a host list.
    ///
    /// Every explicit priority must be within `0..=100`, and priorities must be
    /// given for every host or for none of them.
    pub fn validate_list(hosts: &[HostEntry]) -> ConfigResult<()> {
        if hosts.is_empty() {
            return Err(ConfigError::NoHosts);
        }

        for entry in hosts {
            if let Some(priority) = entry.priority {
                if !(0..=MAX_PRIORITY).contains(&priority) {
                    return Err(ConfigError::PriorityOutOfRange { priority });
                }
            }
        }

        let with_priority = hosts.iter().filter(|h| h.priority.is_some()).count();
        if with_priority != 0 && with_priority != hosts.len() {
            return Err(ConfigError::MixedPriority);
        }

        Ok(())
    }

    /// Render a host list back into its canonical string form.
    pub fn render_list(hosts: &[HostEntry]) -> String {
        let with_priority = hosts.iter().any(|h| h.priority.is_some());
        hosts
            .iter()
            .map(|h| match (with_priority, h.priority) {
                (true, Some(p)) => format!("(address={h},priority={p})"),
                (true, None) => format!("(address={h})"),
                (false, _) => h.to_string(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.port, self.is_ipv6()) {
            (Some(port), true) => write!(f, "[{}]:{port}", self.host),
            (Some(port), false) => write!(f, "{}:{port}", self.host),
            (None, _) => write!(f, "{}", self.host),
        }
    }
}

/// How the attempt order over a host list is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverMethod {
    /// Hosts are attempted in the order they were listed.
    Sequential,
    /// Hosts are attempted by descending priority.
    Priority,
    /// Hosts are attempted in a fresh random order on every connect.
    #[default]
    Random,
}

impl FailoverMethod {
    /// Pick a method for a host list that did not name one.
    ///
    /// Lists whose hosts carry more than one distinct priority are ordered by
    /// priority, everything else is attempted randomly.
    pub fn infer(hosts: &[HostEntry]) -> Self {
        let mut distinct: Vec<Option<i64>> = hosts.iter().map(|h| h.priority).collect();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() > 1 {
            FailoverMethod::Priority
        } else {
            FailoverMethod::Random
        }
    }
}

impl fmt::Display for FailoverMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailoverMethod::Sequential => write!(f, "sequential"),
            FailoverMethod::Priority => write!(f, "priority"),
            FailoverMethod::Random => write!(f, "random"),
        }
    }
}

fn parse_port(s: &str) -> ConfigResult<u16> {
    s.parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| ConfigError::InvalidPort(s.to_string()))
}

/// Split `(a),(b),(c)` into `["a", "b", "c"]`.
fn split_groups(s: &str) -> ConfigResult<Vec<&str>> {
    let inner = s
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| ConfigError::InvalidHost(s.to_string()))?;
    Ok(inner.split("),(").collect())
}

/// Parse `address=host[:port][,priority=N]`.
fn parse_group(group: &str) -> ConfigResult<HostEntry> {
    let mut items = group.split(',');

    let address = items.next().unwrap_or_default();
    let host = match address.split_once('=') {
        Some((key, value)) if key.eq_ignore_ascii_case("address") => value,
        _ => return Err(ConfigError::KeywordNotFound("address".to_string())),
    };
    let mut entry = HostEntry::parse(host)?;

    if let Some(item) = items.next() {
        let value = match item.split_once('=') {
            Some((key, value)) if key.eq_ignore_ascii_case("priority") => value,
            _ => return Err(ConfigError::KeywordNotFound("priority".to_string())),
        };
        let priority = value
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidPriority(value.to_string()))?;
        entry.priority = Some(priority);
    }

    if items.next().is_some() {
        return Err(ConfigError::InvalidHost(group.to_string()));
    }

    Ok(entry)
}
