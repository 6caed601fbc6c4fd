//! Startup configuration from command-line flags and environment variables.
//!
//! Every flag has a `TTLPROXY_*` environment variable equivalent; flags win.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::proxy::{ProxyTarget, Scheme};

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("upstream host must not be empty")]
    EmptyUpstreamHost,

    #[error("upstream port must be between 1 and 65535")]
    ZeroUpstreamPort,

    #[error("cache TTL must be at least one second")]
    ZeroTtl,

    #[error("upstream timeout must be at least one second")]
    ZeroTimeout,

    #[error("invalid upstream {host}: {source}")]
    InvalidUpstream {
        host: String,
        #[source]
        source: url::ParseError,
    },
}

/// Caching HTTP relay in front of a single upstream
#[derive(Parser, Debug, Clone)]
#[command(name = "ttlproxy")]
#[command(about = "Caching HTTP relay in front of a single upstream")]
#[command(version)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "TTLPROXY_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "TTLPROXY_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Directory holding cache records (created if missing)
    #[arg(long, env = "TTLPROXY_CACHE_DIR", default_value = "./cache")]
    pub cache_dir: PathBuf,

    /// Upstream host name or IP address
    #[arg(long, env = "TTLPROXY_UPSTREAM_HOST", default_value = "target-server.com")]
    pub upstream_host: String,

    /// Upstream port
    #[arg(long, env = "TTLPROXY_UPSTREAM_PORT", default_value_t = 443)]
    pub upstream_port: u16,

    /// Upstream scheme
    #[arg(long, env = "TTLPROXY_UPSTREAM_SCHEME", value_enum, default_value_t = Scheme::Https)]
    pub upstream_scheme: Scheme,

    /// Seconds a fetched response stays fresh
    #[arg(long = "ttl", env = "TTLPROXY_TTL", default_value_t = 60)]
    pub ttl_secs: u64,

    /// Seconds to wait for the upstream before answering 500
    #[arg(long = "upstream-timeout", env = "TTLPROXY_UPSTREAM_TIMEOUT", default_value_t = 30)]
    pub upstream_timeout_secs: u64,
}

impl Config {
    /// Checks that every value is present and well-formed.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_host.trim().is_empty() {
            return Err(ConfigError::EmptyUpstreamHost);
        }
        if self.upstream_port == 0 {
            return Err(ConfigError::ZeroUpstreamPort);
        }
        if self.ttl_secs == 0 {
            return Err(ConfigError::ZeroTtl);
        }
        if self.upstream_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        self.target()?;
        Ok(())
    }

    /// The upstream the relay forwards to.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUpstream`] if the host does not form a valid URL.
    pub fn target(&self) -> Result<ProxyTarget, ConfigError> {
        ProxyTarget::new(self.upstream_scheme, self.upstream_host.trim(), self.upstream_port)
            .map_err(|source| ConfigError::InvalidUpstream {
                host: self.upstream_host.clone(),
                source,
            })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}
