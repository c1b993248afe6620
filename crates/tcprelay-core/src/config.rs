//! Startup configuration
//!
//! [`RelayOptions`] carries the raw host/port values from the command line or
//! environment. [`RelayOptions::resolve`] applies the self-loop guard and turns
//! them into the socket addresses the acceptor binds and the sessions dial.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::net::lookup_host;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Local address {address} is the same as the remote address, refusing to relay to itself")]
    SelfLoop { address: String },

    #[error("Failed to resolve {role} address {address}: {source}")]
    Resolve {
        role: &'static str,
        address: String,
        source: std::io::Error,
    },

    #[error("No {family} address found for {role} address {address}")]
    NoAddress {
        role: &'static str,
        address: String,
        family: AddressFamily,
    },
}

/// Address family used for resolving, binding and dialing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressFamily {
    #[default]
    Any,
    V4,
    V6,
}

impl AddressFamily {
    /// `-4` takes precedence when both flags are given.
    pub fn from_flags(ipv4: bool, ipv6: bool) -> Self {
        match (ipv4, ipv6) {
            (true, _) => AddressFamily::V4,
            (false, true) => AddressFamily::V6,
            (false, false) => AddressFamily::Any,
        }
    }

    pub fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Any => write!(f, "tcp"),
            AddressFamily::V4 => write!(f, "tcp4"),
            AddressFamily::V6 => write!(f, "tcp6"),
        }
    }
}

/// Unresolved relay options, after environment fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
    pub family: AddressFamily,
    /// `None` or empty binds every local address.
    pub local_host: Option<String>,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

/// Resolved relay configuration.
///
/// The address family is already applied to both addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub local_addr: SocketAddr,
    /// Bind `local_addr` (an IPv6 wildcard) so IPv4 peers are accepted too.
    pub dual_stack: bool,
    pub remote_addr: SocketAddr,
}

impl RelayOptions {
    fn local_host(&self) -> &str {
        self.local_host.as_deref().unwrap_or("")
    }

    /// `host:port` as given for the listener, for messages.
    pub fn local_address(&self) -> String {
        join_host_port(self.local_host(), self.local_port)
    }

    /// `host:port` as given for the remote, for messages.
    pub fn remote_address(&self) -> String {
        join_host_port(&self.remote_host, self.remote_port)
    }

    /// Reject a local address that literally equals the remote address.
    pub fn check_self_loop(&self) -> Result<(), ConfigError> {
        if self.local_host() == self.remote_host && self.local_port == self.remote_port {
            return Err(ConfigError::SelfLoop {
                address: self.local_address(),
            });
        }
        Ok(())
    }

    /// Validate and resolve both addresses. Nothing is bound here.
    pub async fn resolve(&self) -> Result<RelayConfig, ConfigError> {
        self.check_self_loop()?;

        let (local_addr, dual_stack) = if self.local_host().is_empty() {
            wildcard(self.family, self.local_port)
        } else {
            let addr = resolve_host("local", self.local_host(), self.local_port, self.family).await?;
            (addr, false)
        };

        let remote_addr =
            resolve_host("remote", &self.remote_host, self.remote_port, self.family).await?;

        debug!(
            "Resolved {} local {} and remote {}",
            self.family, local_addr, remote_addr
        );

        Ok(RelayConfig {
            local_addr,
            dual_stack,
            remote_addr,
        })
    }
}

fn wildcard(family: AddressFamily, port: u16) -> (SocketAddr, bool) {
    match family {
        AddressFamily::Any => (SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port), true),
        AddressFamily::V4 => (SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port), false),
        AddressFamily::V6 => (SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port), false),
    }
}

async fn resolve_host(
    role: &'static str,
    host: &str,
    port: u16,
    family: AddressFamily,
) -> Result<SocketAddr, ConfigError> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let address = join_host_port(host, port);

    let mut candidates = lookup_host((bare, port))
        .await
        .map_err(|source| ConfigError::Resolve {
            role,
            address: address.clone(),
            source,
        })?;

    candidates
        .find(|addr| family.matches(addr))
        .ok_or(ConfigError::NoAddress {
            role,
            address,
            family,
        })
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(local_host: Option<&str>, local_port: u16, remote_host: &str, remote_port: u16) -> RelayOptions {
        RelayOptions {
            family: AddressFamily::Any,
            local_host: local_host.map(str::to_string),
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
        }
    }

    #[test]
    fn test_self_loop_guard() {
        let looped = options(Some("127.0.0.1"), 9000, "127.0.0.1", 9000);
        assert!(matches!(
            looped.check_self_loop(),
            Err(ConfigError::SelfLoop { .. })
        ));

        // Different port, or a different literal host, is allowed.
        assert!(options(Some("127.0.0.1"), 9000, "127.0.0.1", 9001)
            .check_self_loop()
            .is_ok());
        assert!(options(None, 9000, "127.0.0.1", 9000).check_self_loop().is_ok());
        assert!(options(Some("localhost"), 9000, "127.0.0.1", 9000)
            .check_self_loop()
            .is_ok());
    }

    #[tokio::test]
    async fn test_self_loop_rejected_before_resolving() {
        let looped = options(Some("no-such-host.invalid"), 9000, "no-such-host.invalid", 9000);
        assert!(matches!(
            looped.resolve().await,
            Err(ConfigError::SelfLoop { .. })
        ));
    }

    #[test]
    fn test_family_from_flags() {
        assert_eq!(AddressFamily::from_flags(false, false), AddressFamily::Any);
        assert_eq!(AddressFamily::from_flags(true, false), AddressFamily::V4);
        assert_eq!(AddressFamily::from_flags(false, true), AddressFamily::V6);
        assert_eq!(AddressFamily::from_flags(true, true), AddressFamily::V4);

        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(AddressFamily::V4.matches(&v4));
        assert!(!AddressFamily::V4.matches(&v6));
        assert!(AddressFamily::V6.matches(&v6));
        assert!(AddressFamily::Any.matches(&v4));
    }

    #[tokio::test]
    async fn test_resolve_literal_addresses() {
        let config = options(Some("127.0.0.1"), 7000, "127.0.0.1", 7001)
            .resolve()
            .await
            .unwrap();
        assert_eq!(
            config,
            RelayConfig {
                local_addr: "127.0.0.1:7000".parse().unwrap(),
                dual_stack: false,
                remote_addr: "127.0.0.1:7001".parse().unwrap(),
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_wildcard_local() {
        let config = options(None, 7000, "127.0.0.1", 7001).resolve().await.unwrap();
        assert_eq!(config.local_addr.port(), 7000);
        assert!(config.local_addr.ip().is_unspecified());
        assert!(config.dual_stack);

        let mut v4_only = options(Some(""), 7000, "127.0.0.1", 7001);
        v4_only.family = AddressFamily::V4;
        let config = v4_only.resolve().await.unwrap();
        assert_eq!(config.local_addr, "0.0.0.0:7000".parse().unwrap());
        assert!(!config.dual_stack);
    }

    #[tokio::test]
    async fn test_resolve_family_mismatch() {
        let mut opts = options(Some("127.0.0.1"), 7000, "127.0.0.1", 7001);
        opts.family = AddressFamily::V6;
        assert!(matches!(
            opts.resolve().await,
            Err(ConfigError::NoAddress { role: "local", .. })
        ));
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("example.com", 80), "example.com:80");
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
        assert_eq!(join_host_port("[::1]", 80), "[::1]:80");
        assert_eq!(join_host_port("", 80), ":80");
    }
}
