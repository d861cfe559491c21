use std::{collections::HashMap, net::SocketAddr, time::{Duration, Instant}};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub len: usize,
    pub issued: Instant,
}

// Block requests sent and not yet answered, keyed by (piece, offset) then peer.
// The same block may be pending from several peers at once.
#[derive(Debug, Default)]
pub struct PendingRequests {
    blocks: HashMap<(usize, usize), HashMap<SocketAddr, PendingRequest>>,
}

impl PendingRequests {

    // Returns false if this peer already has the block pending.
    pub fn insert(&mut self, piece_idx: usize, offset: usize, len: usize, peer: SocketAddr, now: Instant) -> bool {
        let peers = self.blocks.entry((piece_idx, offset)).or_default();
        if peers.contains_key(&peer) {
            return false;
        }
        peers.insert(peer, PendingRequest { len, issued: now });
        true
    }

    pub fn remove(&mut self, piece_idx: usize, offset: usize, peer: SocketAddr) -> bool {
        let Some(peers) = self.blocks.get_mut(&(piece_idx, offset)) else {
            return false;
        };
        let removed = peers.remove(&peer).is_some();
        if peers.is_empty() {
            self.blocks.remove(&(piece_idx, offset));
        }
        removed
    }

    pub fn is_requested(&self, piece_idx: usize, offset: usize) -> bool {
        self.blocks.contains_key(&(piece_idx, offset))
    }

    pub fn get(&self, piece_idx: usize, offset: usize, peer: SocketAddr) -> Option<&PendingRequest> {
        self.blocks.get(&(piece_idx, offset)).and_then(|peers| peers.get(&peer))
    }

    // Drops every request for the piece, returns how many were dropped.
    pub fn clear_piece(&mut self, piece_idx: usize) -> usize {
        let mut cleared = 0;
        self.blocks.retain(|&(idx, _), peers| {
            if idx == piece_idx {
                cleared += peers.len();
                false
            } else {
                true
            }
        });
        cleared
    }

    pub fn clear_peer(&mut self, peer: SocketAddr) -> usize {
        let mut cleared = 0;
        self.blocks.retain(|_, peers| {
            if peers.remove(&peer).is_some() {
                cleared += 1;
            }
            !peers.is_empty()
        });
        cleared
    }

    // Removes requests issued at least `timeout` before `now`.
    pub fn sweep_expired(&mut self, now: Instant, timeout: Duration) -> Vec<(usize, usize, SocketAddr)> {
        let mut expired = Vec::new();
        self.blocks.retain(|&(idx, offset), peers| {
            peers.retain(|&peer, req| {
                let keep = now.saturating_duration_since(req.issued) < timeout;
                if !keep {
                    expired.push((idx, offset, peer));
                }
                keep
            });
            !peers.is_empty()
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.blocks.values().map(|peers| peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
