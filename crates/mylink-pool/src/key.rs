//! Normalised pool keys.
//!
//! Two configurations that differ only in whitespace, key case, or entry
//! order must share one pool, so keys are normalised before lookup.

use std::fmt;

/// Key identifying a connection pool inside a [`PoolRegistry`](crate::PoolRegistry).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey(String);

impl PoolKey {
    /// Normalise a `key=value;key=value` configuration string.
    ///
    /// Keys are trimmed and lower-cased, values trimmed, empty entries
    /// dropped, and the entries sorted by key.
    pub fn new(raw: &str) -> Self {
        let mut entries: Vec<(String, String)> = raw
            .split(';')
            .filter_map(|entry| {
                let entry = entry.trim();
                if entry.is_empty() {
                    return None;
                }
                let (key, value) = entry.split_once('=').unwrap_or((entry, ""));
                Some((key.trim().to_ascii_lowercase(), value.trim().to_string()))
            })
            .collect();
        entries.sort();

        let normalized = entries
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(";");
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_irrelevant() {
        let a = PoolKey::new("server=localhost;user=root;max_size=10");
        let b = PoolKey::new(" server = localhost ; user=root ;max_size= 10;");
        assert_eq!(a, b);
    }

    #[test]
    fn entry_order_and_key_case_are_irrelevant() {
        let a = PoolKey::new("Server=localhost;User=root");
        let b = PoolKey::new("user=root;server=localhost");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "server=localhost;user=root");
    }

    #[test]
    fn values_keep_their_case() {
        let a = PoolKey::new("database=Shop");
        let b = PoolKey::new("database=shop");
        assert_ne!(a, b);
    }

    #[test]
    fn different_values_are_different_pools() {
        assert_ne!(
            PoolKey::new("server=a;user=root"),
            PoolKey::new("server=b;user=root")
        );
    }
}
