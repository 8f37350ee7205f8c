//! UDP tracker announce (BEP 15), driven as a `Command` against the
//! engine's shared multiplexer instead of a private `Poll` loop.
//!
//! The wire format is raw big-endian binary, not bencoded — the values
//! here are hand-packed with `byteorder` rather than run through
//! `serde_bencode`, since BEP 15 never defines a bencode encoding.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use mio::net::UdpSocket;
use mio::Interest;
use rand::Rng;

use crate::cuid::Cuid;
use crate::engine::command::{Command, CommandBase, Interests, StepOutcome};
use crate::engine::DownloadEngine;
use crate::error::{DlError, DlResult};
use crate::request::{ProtocolHint, Request};

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

fn read_peers(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SendConnect,
    RecvConnect,
    SendAnnounce,
    RecvAnnounce,
}

/// One announce round-trip against a UDP tracker: CONNECT then ANNOUNCE,
/// each a send-then-await-datagram step. Retry-on-no-response is handled
/// by the dispatcher's ordinary retry machinery rather than a hand-rolled
/// attempt counter, since `CommandBase::timed_out` already covers it.
pub struct UdpTrackerCommand {
    base: CommandBase,
    socket: Option<UdpSocket>,
    tracker_addr: SocketAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    left: u64,
    phase: Phase,
    transaction_id: u32,
    connection_id: u64,
}

impl UdpTrackerCommand {
    pub fn new(
        cuid: Cuid,
        tracker_url: &url::Url,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        port: u16,
        left: u64,
        timeout: Duration,
    ) -> DlResult<Self> {
        let host = tracker_url.host_str().ok_or_else(|| DlError::abort("udp tracker URL has no host"))?;
        let tracker_port = tracker_url.port().ok_or_else(|| DlError::abort("udp tracker URL has no port"))?;
        let tracker_addr = (host, tracker_port)
            .to_socket_addrs_single()
            .map_err(|e| DlError::retry(format!("udp tracker dns resolution failed: {e}")))?;
        let request = Request::new(tracker_url.clone(), ProtocolHint::RequestResponse);
        Ok(Self {
            base: CommandBase::with_request(cuid, request, timeout),
            socket: None,
            tracker_addr,
            info_hash,
            peer_id,
            port,
            left,
            phase: Phase::SendConnect,
            transaction_id: 0,
            connection_id: 0,
        })
    }

    fn socket_mut(&mut self) -> &mut UdpSocket {
        self.socket.as_mut().expect("socket bound before first step")
    }

    fn ensure_bound(&mut self, engine: &mut DownloadEngine) -> DlResult<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let mut socket = UdpSocket::bind("0.0.0.0:0".parse().unwrap())
            .map_err(|e| DlError::retry(format!("udp socket bind failed: {e}")))?;
        let token = engine.sockets.alloc_token();
        engine
            .sockets
            .register(&mut socket, token, Interest::READABLE)
            .map_err(|e| DlError::retry(format!("udp socket registration failed: {e}")))?;
        self.socket = Some(socket);
        self.base.token = Some(token);
        self.base.interests = Interests { read: true, write: false, resolver: false };
        Ok(())
    }

    fn send_connect(&mut self) -> DlResult<()> {
        self.transaction_id = rand::thread_rng().gen();
        let mut buf = Vec::with_capacity(16);
        buf.write_u64::<BigEndian>(PROTOCOL_ID).unwrap();
        buf.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
        buf.write_u32::<BigEndian>(self.transaction_id).unwrap();
        self.socket_mut()
            .send_to(&buf, self.tracker_addr)
            .map_err(|e| DlError::retry(format!("udp connect send failed: {e}")))?;
        Ok(())
    }

    fn recv_connect(&mut self) -> DlResult<StepOutcome> {
        let mut buf = [0u8; 16];
        match self.socket_mut().recv_from(&mut buf) {
            Ok((len, _)) if len >= 16 => {
                let mut cursor = &buf[..];
                let action = cursor.read_u32::<BigEndian>().unwrap();
                let txn = cursor.read_u32::<BigEndian>().unwrap();
                if txn != self.transaction_id {
                    return Err(DlError::retry("udp connect transaction id mismatch"));
                }
                if action != ACTION_CONNECT {
                    return Err(DlError::retry("udp tracker returned an error action on connect"));
                }
                self.connection_id = cursor.read_u64::<BigEndian>().unwrap();
                self.phase = Phase::SendAnnounce;
                Ok(StepOutcome::Yield)
            }
            Ok(_) => Err(DlError::retry("udp connect response too short")),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(StepOutcome::Yield),
            Err(e) => Err(DlError::retry(format!("udp connect recv failed: {e}"))),
        }
    }

    fn send_announce(&mut self) -> DlResult<()> {
        self.transaction_id = rand::thread_rng().gen();
        let mut buf = Vec::with_capacity(98);
        buf.write_u64::<BigEndian>(self.connection_id).unwrap();
        buf.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
        buf.write_u32::<BigEndian>(self.transaction_id).unwrap();
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf.write_u64::<BigEndian>(0).unwrap(); // downloaded
        buf.write_u64::<BigEndian>(self.left).unwrap();
        buf.write_u64::<BigEndian>(0).unwrap(); // uploaded
        buf.write_u32::<BigEndian>(0).unwrap(); // event: none
        buf.write_u32::<BigEndian>(0).unwrap(); // ip_address: default
        buf.write_u32::<BigEndian>(rand::thread_rng().gen()).unwrap(); // key
        buf.write_i32::<BigEndian>(-1).unwrap(); // num_want: default
        buf.write_u16::<BigEndian>(self.port).unwrap();
        self.socket_mut()
            .send_to(&buf, self.tracker_addr)
            .map_err(|e| DlError::retry(format!("udp announce send failed: {e}")))?;
        Ok(())
    }

    fn recv_announce(&mut self, engine: &mut DownloadEngine) -> DlResult<StepOutcome> {
        let mut buf = [0u8; 2048];
        match self.socket_mut().recv_from(&mut buf) {
            Ok((len, _)) if len >= 20 => {
                let mut cursor = &buf[..20];
                let action = cursor.read_u32::<BigEndian>().unwrap();
                let txn = cursor.read_u32::<BigEndian>().unwrap();
                if txn != self.transaction_id {
                    return Err(DlError::retry("udp announce transaction id mismatch"));
                }
                if action != ACTION_ANNOUNCE {
                    return Err(DlError::abort("udp tracker rejected announce"));
                }
                let peers = read_peers(&buf[20..len]);
                if let Some(pieces) = engine.pieces.as_mut() {
                    for addr in peers {
                        pieces.add_peer(addr);
                    }
                }
                Ok(StepOutcome::Done)
            }
            Ok(_) => Err(DlError::retry("udp announce response too short")),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(StepOutcome::Yield),
            Err(e) => Err(DlError::retry(format!("udp announce recv failed: {e}"))),
        }
    }
}

/// Blocking hostname resolution is acceptable here: see DESIGN.md's
/// name-resolution decision. Kept as a local helper so the constructor
/// reads like a single fallible step.
trait ResolveOne {
    fn to_socket_addrs_single(&self) -> std::io::Result<SocketAddr>;
}

impl ResolveOne for (&str, u16) {
    fn to_socket_addrs_single(&self) -> std::io::Result<SocketAddr> {
        use std::net::ToSocketAddrs;
        self.to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, "no addresses found"))
    }
}

impl Command for UdpTrackerCommand {
    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CommandBase {
        &mut self.base
    }

    fn step(&mut self, engine: &mut DownloadEngine) -> DlResult<StepOutcome> {
        self.ensure_bound(engine)?;
        match self.phase {
            Phase::SendConnect => {
                self.send_connect()?;
                self.phase = Phase::RecvConnect;
                Ok(StepOutcome::Yield)
            }
            Phase::RecvConnect => self.recv_connect(),
            Phase::SendAnnounce => {
                self.send_announce()?;
                self.phase = Phase::RecvAnnounce;
                Ok(StepOutcome::Yield)
            }
            Phase::RecvAnnounce => self.recv_announce(engine),
        }
    }

    fn on_failure(&mut self, engine: &mut DownloadEngine) {
        if let Some(socket) = self.socket.as_mut() {
            let _ = engine.sockets.deregister(socket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_peers_decodes_compact_ipv4_list() {
        let buf = [127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2];
        let peers = read_peers(&buf);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].port(), 0x1AE1);
        assert_eq!(peers[1].port(), 0x1AE2);
    }

    #[test]
    fn new_command_starts_in_send_connect_phase() {
        let url = url::Url::parse("udp://tracker.example.com:1337/announce").unwrap();
        let command = UdpTrackerCommand::new(1 as Cuid, &url, [0u8; 20], [1u8; 20], 6881, 100, Duration::from_secs(30));
        assert!(command.is_ok());
    }
}
