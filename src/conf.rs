//! Engine-wide configuration.
//!
//! Built once from parsed CLI arguments ([`crate::cli`]) and shared by
//! reference with the engine and every command; no command mutates it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// How a configured HTTP proxy should be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyMethod {
    /// Issue an absolute-URI GET through the proxy.
    Get,
    /// CONNECT-tunnel through the proxy, then speak the protocol directly.
    Tunnel,
}

#[derive(Clone, Debug)]
pub struct ProxyConf {
    pub addr: SocketAddr,
    pub method: ProxyMethod,
}

/// The global configuration for the download engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    /// Where to write the downloaded file(s). For a multi-file torrent this
    /// is the directory under which the torrent's own directory is created.
    pub output_path: PathBuf,

    /// Port this client listens on for inbound peer connections (swarm mode).
    pub listen_port: u16,

    /// Per-command idle timeout: a command that registers an interest and
    /// sees none of it fire within this many seconds raises `Retry`.
    pub timeout: Duration,

    /// Timeout for resolving a hostname before initiating a connection.
    pub dns_timeout: Duration,

    /// Maximum number of tries for a request before promoting retry to
    /// abort. Zero means unlimited.
    pub max_tries: u32,

    /// Seconds to wait before re-issuing a request after a retryable error.
    pub retry_wait: Duration,

    /// Number of concurrent commands (segments) per HTTP/FTP download.
    pub split: usize,

    pub proxy: Option<ProxyConf>,

    /// Swarm-mode peer pool bounds, see §6 of the engine specification.
    pub max_peers: usize,
    pub min_peers: usize,
    pub max_peer_list_size: usize,
    pub end_game_threshold: usize,
    pub max_peer_error_count: u32,
}

impl Conf {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            listen_port: 6881,
            timeout: Duration::from_secs(60),
            dns_timeout: Duration::from_secs(10),
            max_tries: 5,
            retry_wait: Duration::from_secs(5),
            split: 8,
            proxy: None,
            max_peers: 55,
            min_peers: 15,
            max_peer_list_size: 100,
            end_game_threshold: 20,
            max_peer_error_count: 5,
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new("out")
    }
}
