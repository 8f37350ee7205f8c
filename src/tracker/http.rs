//! HTTP tracker announce: wire types plus a non-blocking `Command` that
//! drives one GET request through `RESOLVE → CONNECT → REQUEST → HEADERS
//! → BODY → DONE`, the same shape as `http::commands::HttpTransferCommand`
//! but reading the whole body (no segment, no Range) and handing the
//! parsed peer list to the piece manager instead of to disk.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use httparse::Status;
use mio::net::TcpStream;
use mio::Interest;
use serde::{Deserialize, Serialize};
use urlencoding::encode_binary;

use crate::cuid::Cuid;
use crate::engine::command::{Command, CommandBase, Interests, StepOutcome};
use crate::engine::DownloadEngine;
use crate::error::{DlError, DlResult};
use crate::request::{ProtocolHint, Request};

#[derive(Debug, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: Option<u64>,
    pub downloaded: Option<u64>,
    pub left: Option<u64>,
    pub compact: Option<u8>,
    pub no_peer_id: Option<u8>,
    pub event: Option<String>,
    pub ip: Option<String>,
    pub numwant: Option<u64>,
    pub key: Option<String>,
    pub trackerid: Option<String>,
}

/// Decodes peers from the tracker's compact binary representation, for
/// both IPv4 (6 bytes/peer) and IPv6 (18 bytes/peer) blobs.
pub mod peers {
    use serde::de::{self, Deserialize, Deserializer, Visitor};
    use serde::ser::{Serialize, Serializer};
    use std::fmt;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

    #[derive(Debug, Clone)]
    pub struct Peers(pub Vec<SocketAddr>);
    struct PeersVisitor;

    impl<'de> Visitor<'de> for PeersVisitor {
        type Value = Peers;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("compact representation of peers")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let mut peers = Vec::new();
            let mut i = 0;
            while i < v.len() {
                if v.len() - i >= 18 && (v.len() - i) % 18 == 0 && (v.len() - i) % 6 != 0 {
                    let addr = Ipv6Addr::from(<[u8; 16]>::try_from(&v[i..i + 16]).unwrap());
                    let port = u16::from_be_bytes([v[i + 16], v[i + 17]]);
                    peers.push(SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0)));
                    i += 18;
                } else if v.len() - i >= 6 {
                    let addr = Ipv4Addr::new(v[i], v[i + 1], v[i + 2], v[i + 3]);
                    let port = u16::from_be_bytes([v[i + 4], v[i + 5]]);
                    peers.push(SocketAddr::V4(SocketAddrV4::new(addr, port)));
                    i += 6;
                } else {
                    return Err(E::custom("invalid peer blob length"));
                }
            }
            Ok(Peers(peers))
        }
    }

    impl<'de> Deserialize<'de> for Peers {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_bytes(PeersVisitor)
        }
    }

    impl Serialize for Peers {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let mut bytes = Vec::new();
            for peer in &self.0 {
                match peer {
                    SocketAddr::V4(addr) => {
                        bytes.extend(addr.ip().octets());
                        bytes.extend(addr.port().to_be_bytes());
                    }
                    SocketAddr::V6(addr) => {
                        bytes.extend(addr.ip().octets());
                        bytes.extend(addr.port().to_be_bytes());
                    }
                }
            }
            serializer.serialize_bytes(&bytes)
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnnounceResponse {
    pub failure_reason: Option<String>,
    pub warning_message: Option<String>,
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub tracker_id: Option<String>,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub peers: peers::Peers,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub info_hash: [u8; 20],
}

#[derive(Debug)]
pub struct ScrapeResponse {
    pub files: HashMap<Vec<u8>, ScrapeResponseFile>,
}

#[derive(Debug, Deserialize)]
pub struct ScrapeResponseFile {
    pub complete: u64,
    pub incomplete: u64,
    pub downloaded: u64,
}

struct ScrapeResponseVisitor;

impl<'de> serde::de::Visitor<'de> for ScrapeResponseVisitor {
    type Value = ScrapeResponse;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a bencoded dictionary")
    }

    fn visit_map<A>(self, mut map: A) -> Result<ScrapeResponse, A::Error>
    where
        A: serde::de::MapAccess<'de>,
    {
        let mut files = HashMap::new();
        while let Some(key) = map.next_key::<Vec<u8>>()? {
            let file = map.next_value::<ScrapeResponseFile>()?;
            files.insert(key, file);
        }
        Ok(ScrapeResponse { files })
    }
}

impl<'de> Deserialize<'de> for ScrapeResponse {
    fn deserialize<D>(deserializer: D) -> Result<ScrapeResponse, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(ScrapeResponseVisitor)
    }
}

/// Builds the announce query string for a GET request.
pub fn build_query(request: &AnnounceRequest) -> String {
    let mut query = format!(
        "?info_hash={}&peer_id={}&port={}&compact={}",
        encode_binary(&request.info_hash),
        encode_binary(&request.peer_id),
        request.port,
        request.compact.unwrap_or(1),
    );
    if let Some(uploaded) = request.uploaded {
        query.push_str(&format!("&uploaded={uploaded}"));
    }
    if let Some(downloaded) = request.downloaded {
        query.push_str(&format!("&downloaded={downloaded}"));
    }
    if let Some(left) = request.left {
        query.push_str(&format!("&left={left}"));
    }
    if let Some(event) = &request.event {
        query.push_str(&format!("&event={event}"));
    }
    query
}

fn split_headers_and_body(raw: &[u8]) -> DlResult<(usize, usize)> {
    let mut header_storage = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut header_storage);
    match response.parse(raw) {
        Ok(Status::Complete(used)) => Ok((response.code.unwrap_or(0) as usize, used)),
        Ok(Status::Partial) => Err(DlError::retry("tracker response headers incomplete")),
        Err(e) => Err(DlError::abort(format!("malformed tracker response headers: {e}"))),
    }
}

pub fn parse_announce_response(raw: &[u8]) -> DlResult<AnnounceResponse> {
    let (status, used) = split_headers_and_body(raw)?;
    if status >= 400 {
        return Err(DlError::abort(format!("tracker returned status {status}")));
    }
    serde_bencode::from_bytes(&raw[used..])
        .map_err(|e| DlError::abort(format!("malformed bencoded announce response: {e}")))
}

pub fn parse_scrape_response(raw: &[u8]) -> DlResult<ScrapeResponse> {
    let (status, used) = split_headers_and_body(raw)?;
    if status >= 400 {
        return Err(DlError::abort(format!("tracker returned status {status}")));
    }
    serde_bencode::from_bytes(&raw[used..])
        .map_err(|e| DlError::abort(format!("malformed bencoded scrape response: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connect,
    Request,
    Response,
}

/// Drives one tracker announce GET to completion and, on success, feeds
/// every discovered peer into the piece manager's peer pool.
pub struct AnnounceCommand {
    base: CommandBase,
    host: String,
    port: u16,
    query_path: String,
    stream: Option<TcpStream>,
    phase: Phase,
    out_buf: Vec<u8>,
    out_written: usize,
    in_buf: Vec<u8>,
}

impl AnnounceCommand {
    pub fn new(cuid: Cuid, announce_url: &url::Url, request: &AnnounceRequest, timeout: Duration) -> DlResult<Self> {
        let host = announce_url
            .host_str()
            .ok_or_else(|| DlError::abort("announce URL has no host"))?
            .to_string();
        let port = announce_url.port_or_known_default().unwrap_or(80);
        let query_path = format!("{}{}", announce_url.path(), build_query(request));
        let tracked = Request::new(announce_url.clone(), ProtocolHint::RequestResponse);
        Ok(Self {
            base: CommandBase::with_request(cuid, tracked, timeout),
            host,
            port,
            query_path,
            stream: None,
            phase: Phase::Connect,
            out_buf: Vec::new(),
            out_written: 0,
            in_buf: Vec::new(),
        })
    }

    fn do_connect(&mut self, engine: &mut DownloadEngine) -> DlResult<StepOutcome> {
        let addr: SocketAddr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| DlError::retry(format!("dns resolution failed: {e}")))?
            .next()
            .ok_or_else(|| DlError::abort("dns resolution returned no addresses"))?;
        let mut stream = TcpStream::connect(addr).map_err(|e| DlError::retry(format!("connect failed: {e}")))?;
        let token = engine.sockets.alloc_token();
        engine
            .sockets
            .register(&mut stream, token, Interest::WRITABLE)
            .map_err(|e| DlError::retry(format!("socket registration failed: {e}")))?;
        self.stream = Some(stream);
        self.base.token = Some(token);
        self.base.interests = Interests { write: true, read: false, resolver: false };
        self.out_buf = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.query_path, self.host
        )
        .into_bytes();
        self.phase = Phase::Request;
        Ok(StepOutcome::Yield)
    }

    fn do_request(&mut self, engine: &mut DownloadEngine) -> DlResult<StepOutcome> {
        let stream = self.stream.as_mut().unwrap();
        match stream.write(&self.out_buf[self.out_written..]) {
            Ok(n) => {
                self.out_written += n;
                if self.out_written >= self.out_buf.len() {
                    let token = self.base.token.unwrap();
                    engine
                        .sockets
                        .reregister(stream, token, Interest::READABLE)
                        .map_err(|e| DlError::retry(format!("reregister failed: {e}")))?;
                    self.base.interests = Interests { write: false, read: true, resolver: false };
                    self.phase = Phase::Response;
                }
                Ok(StepOutcome::Yield)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(StepOutcome::Yield),
            Err(e) => Err(DlError::retry(format!("tracker request write failed: {e}"))),
        }
    }

    fn do_response(&mut self, engine: &mut DownloadEngine) -> DlResult<StepOutcome> {
        let stream = self.stream.as_mut().unwrap();
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) => {
                let response = parse_announce_response(&self.in_buf)?;
                if let Some(pieces) = engine.pieces.as_mut() {
                    for addr in response.peers.0 {
                        pieces.add_peer(addr);
                    }
                }
                Ok(StepOutcome::Done)
            }
            Ok(n) => {
                self.in_buf.extend_from_slice(&chunk[..n]);
                Ok(StepOutcome::Yield)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(StepOutcome::Yield),
            Err(e) => Err(DlError::retry(format!("tracker response read failed: {e}"))),
        }
    }
}

impl Command for AnnounceCommand {
    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CommandBase {
        &mut self.base
    }

    fn step(&mut self, engine: &mut DownloadEngine) -> DlResult<StepOutcome> {
        match self.phase {
            Phase::Connect => self.do_connect(engine),
            Phase::Request => self.do_request(engine),
            Phase::Response => self.do_response(engine),
        }
    }

    fn on_failure(&mut self, engine: &mut DownloadEngine) {
        if let Some(stream) = self.stream.as_mut() {
            let _ = engine.sockets.deregister(stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_ipv4_peers_decode() {
        let blob = vec![127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2];
        let decoded = serde_bencode::from_bytes::<peers::Peers>(&{
            let mut encoded = vec![b'1', b'2', b':'];
            encoded.extend_from_slice(&blob);
            encoded
        })
        .unwrap();
        assert_eq!(decoded.0.len(), 2);
        assert_eq!(decoded.0[0].port(), 0x1AE1);
    }

    #[test]
    fn build_query_includes_required_fields() {
        let request = AnnounceRequest {
            info_hash: [1; 20],
            peer_id: [2; 20],
            port: 6881,
            uploaded: Some(0),
            downloaded: Some(0),
            left: Some(100),
            compact: Some(1),
            no_peer_id: None,
            event: Some("started".into()),
            ip: None,
            numwant: None,
            key: None,
            trackerid: None,
        };
        let query = build_query(&request);
        assert!(query.contains("port=6881"));
        assert!(query.contains("compact=1"));
        assert!(query.contains("event=started"));
    }

    #[test]
    fn parse_announce_response_rejects_error_status() {
        let raw = b"HTTP/1.1 500 Internal Server Error\r\n\r\n";
        assert!(parse_announce_response(raw).is_err());
    }
}
