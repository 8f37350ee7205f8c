//! Peer/piece manager (swarm mode): owns the local completion bitmap, the
//! used-piece set, the have-advertisement list, and the peer pool.
//!
//! Grounded in aria2's `TorrentMan`: piece selection, end-game, have
//! propagation, used-piece eviction, and peer-pool bounds are a direct
//! port of its semantics onto owned Rust collections instead of raw
//! pointers and `deque<Piece>`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};

use crate::bitfield::BitField;
use crate::cuid::Cuid;
use crate::peer::Peer;
use crate::piece::Piece;

pub const MAX_KNOWN_PEERS: usize = 100;
pub const MAX_ACTIVE_PEERS: usize = 55;
pub const MIN_ACTIVE_PEERS: usize = 15;
pub const END_GAME_PIECE_THRESHOLD: usize = 20;
const USED_PIECE_CAP: usize = 64;

struct HaveEntry {
    cuid: Cuid,
    index: usize,
    registered_at: Instant,
}

pub struct PieceManager {
    local_bitfield: BitField,
    piece_hashes: Vec<[u8; 20]>,
    piece_length: u64,
    total_length: u64,
    used_pieces: Vec<Piece>,
    haves: VecDeque<HaveEntry>,
    peers: Vec<Peer>,
    next_peer_id: u64,
}

impl PieceManager {
    pub fn new(piece_hashes: Vec<[u8; 20]>, piece_length: u64, total_length: u64) -> Self {
        let num_pieces = piece_hashes.len();
        Self {
            local_bitfield: BitField::new_empty(num_pieces),
            piece_hashes,
            piece_length,
            total_length,
            used_pieces: Vec::new(),
            haves: VecDeque::new(),
            peers: Vec::new(),
            next_peer_id: 0,
        }
    }

    pub fn local_bitfield(&self) -> &BitField {
        &self.local_bitfield
    }

    /// Replaces the local bitmap, e.g. when resuming from a sidecar file.
    pub fn set_bitfield(&mut self, bitfield: BitField) {
        self.local_bitfield = bitfield;
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.local_bitfield.has_piece(index)
    }

    pub fn has_all_pieces(&self) -> bool {
        self.local_bitfield.is_complete()
    }

    pub fn piece_length(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        self.piece_length.min(self.total_length.saturating_sub(start))
    }

    /// The nominal (non-final) piece length, for offset arithmetic.
    pub fn nominal_piece_length(&self) -> u64 {
        self.piece_length
    }

    fn missing_count(&self) -> usize {
        self.local_bitfield.count_missing()
    }

    pub fn is_end_game(&self) -> bool {
        self.missing_count() <= END_GAME_PIECE_THRESHOLD
    }

    fn find_used(&self, index: usize) -> Option<usize> {
        self.used_pieces.iter().position(|p| p.index == index)
    }

    /// Returns a fresh piece the peer has and we lack, not already used,
    /// unless end-game permits racing an in-progress piece.
    pub fn get_missing_piece(&mut self, peer: &Peer) -> Option<Piece> {
        self.get_missing_piece_from(peer, None)
    }

    /// Restricted to the peer's allowed-fast subset.
    pub fn get_missing_fast_piece(&mut self, peer: &Peer) -> Option<Piece> {
        if peer.allowed_fast.is_empty() {
            return None;
        }
        self.get_missing_piece_from(peer, Some(&peer.allowed_fast))
    }

    fn get_missing_piece_from(&mut self, peer: &Peer, allowed: Option<&[usize]>) -> Option<Piece> {
        let candidates: Vec<usize> = match allowed {
            Some(allowed) => allowed
                .iter()
                .copied()
                .filter(|&i| peer.has_piece(i) && !self.has_piece(i))
                .collect(),
            None => (0..self.piece_hashes.len())
                .filter(|&i| peer.has_piece(i) && !self.has_piece(i))
                .collect(),
        };
        if candidates.is_empty() {
            return None;
        }
        let end_game = self.is_end_game();
        let fresh: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|i| self.find_used(*i).is_none())
            .collect();
        let pool = if !fresh.is_empty() {
            fresh
        } else if end_game {
            candidates
        } else {
            return None;
        };
        let &index = pool.choose(&mut rand::thread_rng())?;
        if let Some(existing) = self.find_used(index) {
            return Some(self.used_pieces[existing].clone());
        }
        let piece = Piece::new(index, self.piece_length(index));
        self.used_pieces.push(piece.clone());
        Some(piece)
    }

    /// Verifies the piece digest; on match, marks the local bitmap bit
    /// set, drops it from the used set, and registers a
    /// have-advertisement. On mismatch, cancels it back to unused.
    pub fn complete_piece(&mut self, cuid: Cuid, index: usize, data: &[u8]) -> bool {
        let expected = self.piece_hashes.get(index).copied();
        let matches = match expected {
            None => true,
            Some(expected) => {
                let mut hasher = Sha1::new();
                hasher.update(data);
                let digest: [u8; 20] = hasher.finalize().into();
                digest == expected
            }
        };
        if matches {
            self.local_bitfield.set(index);
            self.used_pieces.retain(|p| p.index != index);
            self.advertise_piece(cuid, index);
        } else {
            self.cancel_piece(index);
        }
        matches
    }

    /// Clears the sub-bitfield and re-enters the piece as unused.
    pub fn cancel_piece(&mut self, index: usize) {
        if let Some(pos) = self.find_used(index) {
            self.used_pieces[pos].reset();
        }
    }

    pub fn update_piece(&mut self, piece: Piece) {
        if let Some(pos) = self.find_used(piece.index) {
            self.used_pieces[pos] = piece;
        } else {
            self.used_pieces.push(piece);
        }
    }

    pub fn count_used_pieces(&self) -> usize {
        self.used_pieces.len()
    }

    /// Every in-progress used piece, for sidecar persistence.
    pub fn used_pieces(&self) -> &[Piece] {
        &self.used_pieces
    }

    /// Re-enters a piece persisted by a prior session, e.g. resuming a
    /// swarm download from a sidecar file.
    pub fn restore_used_piece(&mut self, piece: Piece) {
        self.used_pieces.push(piece);
    }

    pub fn advertise_piece(&mut self, cuid: Cuid, index: usize) {
        self.haves.push_back(HaveEntry {
            cuid,
            index,
            registered_at: Instant::now(),
        });
    }

    /// Every index advertised by a CUID other than `my_cuid`, registered
    /// strictly after `since`.
    pub fn get_advertised_piece_indexes(&self, my_cuid: Cuid, since: Instant) -> Vec<usize> {
        self.haves
            .iter()
            .filter(|h| h.cuid != my_cuid && h.registered_at > since)
            .map(|h| h.index)
            .collect()
    }

    pub fn count_advertised_piece(&self) -> usize {
        self.haves.len()
    }

    pub fn remove_advertised_piece(&mut self, elapsed: Duration) {
        let now = Instant::now();
        self.haves
            .retain(|h| now.duration_since(h.registered_at) < elapsed);
    }

    /// Evicts in-progress used pieces with the lowest fill rate first
    /// until at most `max` remain.
    pub fn reduce_used_pieces(&mut self, max: usize) {
        if self.used_pieces.len() <= max {
            return;
        }
        self.used_pieces
            .sort_by(|a, b| a.fill_rate().partial_cmp(&b.fill_rate()).unwrap());
        let to_drop = self.used_pieces.len() - max;
        self.used_pieces.drain(0..to_drop);
    }

    pub fn enforce_used_piece_cap(&mut self) {
        self.reduce_used_pieces(USED_PIECE_CAP);
    }

    // --- peer pool -----------------------------------------------------

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn active_peer_count(&self) -> usize {
        self.peers.iter().filter(|p| p.active).count()
    }

    pub fn wants_more_active_peers(&self) -> bool {
        self.active_peer_count() < MIN_ACTIVE_PEERS
    }

    /// Adds a newly-discovered peer. If the known-peer pool is full, the
    /// lowest-scoring inactive peer is evicted to make room; if every
    /// peer is active, the new peer is dropped.
    pub fn add_peer(&mut self, addr: SocketAddr) -> Option<u64> {
        if self.peers.iter().any(|p| p.addr == addr) {
            return None;
        }
        if self.peers.len() >= MAX_KNOWN_PEERS {
            let victim = self
                .peers
                .iter()
                .enumerate()
                .filter(|(_, p)| !p.active)
                .min_by_key(|(_, p)| p.score())
                .map(|(i, _)| i);
            match victim {
                Some(i) => {
                    self.peers.remove(i);
                }
                None => return None,
            }
        }
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        self.peers.push(Peer::new(id, addr, self.piece_hashes.len()));
        Some(id)
    }

    /// Evicts the `n` lowest-scoring inactive peers.
    pub fn delete_unused_peer(&mut self, n: usize) {
        let mut indexes: Vec<usize> = self
            .peers
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.active)
            .map(|(i, _)| i)
            .collect();
        indexes.sort_by_key(|&i| self.peers[i].score());
        for &i in indexes.iter().take(n) {
            self.peers[i].error_count = u32::MAX;
        }
        self.peers.retain(|p| p.error_count != u32::MAX);
    }

    /// A not-yet-active peer whose error count is below the
    /// disqualification threshold.
    pub fn get_peer(&self) -> Option<&Peer> {
        self.peers.iter().find(|p| !p.active && !p.disqualified())
    }

    pub fn get_peer_mut(&mut self, id: u64) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.id == id)
    }

    pub fn activate_peer(&mut self, id: u64) {
        if let Some(peer) = self.get_peer_mut(id) {
            peer.activate();
        }
    }

    pub fn deactivate_peer(&mut self, id: u64) {
        if let Some(peer) = self.get_peer_mut(id) {
            peer.deactivate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::BLOCK_LENGTH;

    fn manager(num_pieces: usize) -> PieceManager {
        PieceManager::new(vec![[0u8; 20]; num_pieces], BLOCK_LENGTH, BLOCK_LENGTH * num_pieces as u64)
    }

    fn peer_with_all_pieces(mgr: &PieceManager, addr: &str) -> Peer {
        let mut peer = Peer::new(0, addr.parse().unwrap(), mgr.piece_hashes.len());
        for i in 0..mgr.piece_hashes.len() {
            peer.bitfield.set(i);
        }
        peer
    }

    #[test]
    fn missing_piece_respects_peer_and_local_bitfields() {
        let mut mgr = manager(5);
        let peer = peer_with_all_pieces(&mgr, "127.0.0.1:1");
        let piece = mgr.get_missing_piece(&peer).unwrap();
        assert!(piece.index < 5);
    }

    #[test]
    fn used_piece_not_reassigned_outside_end_game() {
        let mut mgr = manager(30);
        let peer = peer_with_all_pieces(&mgr, "127.0.0.1:1");
        let first = mgr.get_missing_piece(&peer).unwrap();
        // still far from end-game (30 missing > 20 threshold), so a
        // second pick must land on a different piece.
        let second = mgr.get_missing_piece(&peer).unwrap();
        assert_ne!(first.index, second.index);
    }

    #[test]
    fn end_game_allows_reassigning_used_piece() {
        let mut mgr = manager(1);
        let peer = peer_with_all_pieces(&mgr, "127.0.0.1:1");
        let first = mgr.get_missing_piece(&peer).unwrap();
        let second = mgr.get_missing_piece(&peer).unwrap();
        assert_eq!(first.index, second.index);
    }

    #[test]
    fn complete_piece_with_no_hash_check_always_matches() {
        let mut mgr = PieceManager::new(vec![], BLOCK_LENGTH, 0);
        assert!(mgr.complete_piece(1, 0, b"anything"));
    }

    #[test]
    fn complete_piece_sets_local_bit_and_advertises() {
        // a zero-length piece's SHA-1 is the hash of the empty string.
        let mut hasher = Sha1::new();
        hasher.update(b"");
        let hash: [u8; 20] = hasher.finalize().into();
        let mut mgr = PieceManager::new(vec![hash], 0, 0);
        let ok = mgr.complete_piece(3, 0, b"");
        assert!(ok);
        assert!(mgr.has_piece(0));
        let since = Instant::now() - Duration::from_secs(1);
        assert_eq!(mgr.get_advertised_piece_indexes(0, since), vec![0]);
    }

    #[test]
    fn peer_pool_evicts_lowest_scoring_when_full() {
        let mut mgr = manager(1);
        for i in 0..MAX_KNOWN_PEERS {
            mgr.add_peer(format!("127.0.0.1:{}", 2000 + i).parse().unwrap());
        }
        assert_eq!(mgr.peers().len(), MAX_KNOWN_PEERS);
        let added = mgr.add_peer("127.0.0.1:9999".parse().unwrap());
        assert!(added.is_some());
        assert_eq!(mgr.peers().len(), MAX_KNOWN_PEERS);
    }

    #[test]
    fn get_peer_skips_active_and_disqualified() {
        let mut mgr = manager(1);
        let id = mgr.add_peer("127.0.0.1:1".parse().unwrap()).unwrap();
        assert!(mgr.get_peer().is_some());
        mgr.activate_peer(id);
        assert!(mgr.get_peer().is_none());
    }
}
