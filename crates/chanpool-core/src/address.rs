//! Backend addresses and logical-name resolution.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// A `(host, port)` pair — the identity key for pooled channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = PoolError;

    /// Parses `host:port` or `[v6-host]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PoolError::InvalidAddress(s.to_string());

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = tail.strip_prefix(':').ok_or_else(invalid)?;
            (host, port)
        } else {
            let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
            if host.contains(':') {
                // bare IPv6 without brackets is ambiguous
                return Err(invalid());
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<&str> for Address {
    type Error = PoolError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Resolves a logical service name to a backend address.
///
/// Resolution happens upstream of the pool; the pool only ever sees
/// concrete addresses.
pub trait Resolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<Address, PoolError>;
}

/// Fixed name → address table.
///
/// Names that already look like `host:port` resolve to themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    table: HashMap<String, Address>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) a name.
    pub fn insert(&mut self, name: impl Into<String>, address: Address) -> &mut Self {
        self.table.insert(name.into(), address);
        self
    }

    pub fn with(mut self, name: impl Into<String>, address: Address) -> Self {
        self.insert(name, address);
        self
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, name: &str) -> Result<Address, PoolError> {
        if let Some(addr) = self.table.get(name) {
            return Ok(addr.clone());
        }
        name.parse::<Address>()
            .map_err(|_| PoolError::Resolve(name.to_string()))
    }
}
