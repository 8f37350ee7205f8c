//! Command-line argument parsing.
//!
//! Grounded in the original single-flag `clap` struct; expanded to cover
//! both download modes (direct URL, `.torrent` metainfo) and the knobs the
//! engine actually reads out of [`crate::conf::Conf`].

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::conf::{Conf, ProxyConf, ProxyMethod};

#[derive(Parser, Debug)]
#[command(about = "Segmented HTTP/FTP downloader and BitTorrent-style swarm client")]
pub struct Cli {
    /// Direct HTTP/FTP URL to download. Mutually exclusive with `--file`.
    #[arg(long)]
    pub url: Option<String>,

    /// Path to a `.torrent` metainfo file. Mutually exclusive with `--url`.
    #[arg(short, long)]
    pub file: Option<String>,

    /// Path (or, for a multi-file torrent, directory) to write the download to.
    #[arg(short, long, default_value = "out")]
    pub out: String,

    /// Port this client listens on for inbound peer connections.
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Number of concurrent connections to split a direct-URL download across.
    #[arg(short = 's', long, default_value_t = 8)]
    pub split: usize,

    /// Per-command idle timeout, in seconds.
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,

    /// Maximum retry attempts per request before the segment is abandoned.
    #[arg(long, default_value_t = 5)]
    pub max_tries: u32,

    /// Seconds to wait between retry attempts.
    #[arg(long, default_value_t = 5)]
    pub retry_wait: u64,

    /// Optional HTTP proxy address, e.g. `127.0.0.1:8080`.
    #[arg(long)]
    pub proxy: Option<SocketAddr>,

    /// Proxy method: `get` for an absolute-URI GET, `tunnel` for CONNECT.
    #[arg(long, default_value = "get")]
    pub proxy_method: String,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn to_conf(&self) -> Conf {
        let mut conf = Conf::new(PathBuf::from(&self.out));
        conf.listen_port = self.port;
        conf.split = self.split.max(1);
        conf.timeout = std::time::Duration::from_secs(self.timeout);
        conf.max_tries = self.max_tries;
        conf.retry_wait = std::time::Duration::from_secs(self.retry_wait);
        if let Some(addr) = self.proxy {
            let method = if self.proxy_method.eq_ignore_ascii_case("tunnel") {
                ProxyMethod::Tunnel
            } else {
                ProxyMethod::Get
            };
            conf.proxy = Some(ProxyConf { addr, method });
        }
        conf
    }
}
