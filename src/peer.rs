//! A remote swarm endpoint tracked by the peer/piece manager.

pub mod connection;
pub mod handshake;
pub mod message;

use std::net::SocketAddr;

use crate::bitfield::BitField;

pub const MAX_PEER_ERROR_COUNT: u32 = 5;

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: u64,
    pub addr: SocketAddr,
    pub bitfield: BitField,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub error_count: u32,
    pub active: bool,
    pub downloaded: u64,
    pub uploaded: u64,
    pub allowed_fast: Vec<usize>,
}

impl Peer {
    pub fn new(id: u64, addr: SocketAddr, num_pieces: usize) -> Self {
        Self {
            id,
            addr,
            bitfield: BitField::new_empty(num_pieces),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            error_count: 0,
            active: false,
            downloaded: 0,
            uploaded: 0,
            allowed_fast: Vec::new(),
        }
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.has_piece(index)
    }

    pub fn note_error(&mut self) {
        self.error_count += 1;
    }

    pub fn disqualified(&self) -> bool {
        self.error_count >= MAX_PEER_ERROR_COUNT
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Ranks a peer for retention when the known-peer pool is full; the
    /// lowest-scoring inactive peer is evicted first.
    pub fn score(&self) -> i64 {
        self.bitfield.count_set() as i64 - self.error_count as i64 * 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disqualified_at_error_threshold() {
        let mut peer = Peer::new(1, "127.0.0.1:6881".parse().unwrap(), 10);
        for _ in 0..MAX_PEER_ERROR_COUNT {
            assert!(!peer.disqualified());
            peer.note_error();
        }
        assert!(peer.disqualified());
    }
}
