use std::{net::SocketAddr, time::{Duration, Instant}};
use rand::seq::SliceRandom;
use crate::{
    block::BlockInfo,
    info::TorrentInfo,
    store::{PieceStore, StoreError},
    Bitfield, Config, ID,
};

mod piece;
mod requests;

use piece::Piece;
pub use requests::PendingRequests;

#[derive(thiserror::Error, Debug)]
pub enum PickerError {

    #[error("piece index {0} out of range")]
    InvalidPiece(usize),

    #[error("no block at offset {offset} in piece {idx}")]
    InvalidBlock {
        idx: usize,
        offset: usize,
    },

    #[error("block at offset {offset} in piece {idx}: expected {expected} bytes, got {actual}")]
    BlockLength {
        idx: usize,
        offset: usize,
        expected: usize,
        actual: usize,
    },

    // Blocks are laid out at construction, so this is a bookkeeping bug.
    #[error("piece {idx} is missing data at offset {offset}")]
    AssemblyGap {
        idx: usize,
        offset: usize,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

}

type Result<T> = std::result::Result<T, PickerError>;

// Pieces considered for random selection, fewest holders first.
const RAREST_CANDIDATES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {

    // Duplicate or late block, nothing changed.
    Ignored,

    // Stored, the piece still has blocks outstanding.
    Stored,

    // Last block arrived, the piece verified and was saved.
    Completed,

    // Last block arrived but the piece failed verification and was reset.
    HashMismatch,

}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStats {
    pub total: usize,
    pub completed: usize,
    pub downloading: usize,
    pub pending_requests: usize,
    // Bytes of verified pieces.
    pub bytes_completed: u64,
}

// Owns all piece and block state for a torrent.
// Decides what to request next and verifies pieces as their last block arrives.
pub struct Picker {

    // All pieces in the torrent, idx aligned.
    pieces: Vec<Piece>,

    // The pieces that we have.
    have: Bitfield,

    requests: PendingRequests,

    store: Box<dyn PieceStore>,

    info: TorrentInfo,

    stuck_timeout: Duration,

    request_timeout: Duration,

    // Block bytes accepted, pieces that fail verification included.
    downloaded: u64,

}

impl Picker {

    pub fn new(info: TorrentInfo, hashes: Vec<ID>, store: Box<dyn PieceStore>, config: &Config) -> Self {
        debug_assert_eq!(hashes.len(), info.num_pieces);
        let pieces = hashes
            .into_iter()
            .enumerate()
            .map(|(idx, hash)| Piece::new(idx, info.piece_len(idx), hash))
            .collect();
        Self {
            pieces,
            have: Bitfield::repeat(false, info.num_pieces),
            requests: PendingRequests::default(),
            store,
            info,
            stuck_timeout: config.stuck_piece_timeout,
            request_timeout: config.request_timeout,
            downloaded: 0,
        }
    }

    // Marks pieces the store already holds as completed, returns how many.
    pub fn load_completed(&mut self) -> usize {
        let mut loaded = 0;
        for piece in self.pieces.iter_mut() {
            if !piece.completed && self.store.is_piece_complete(piece.idx) {
                piece.mark_completed();
                self.have.set(piece.idx, true);
                loaded += 1;
            }
        }
        loaded
    }

    pub fn store_mut(&mut self) -> &mut dyn PieceStore {
        self.store.as_mut()
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    // Availability.

    // Registers a peer's full bitfield, returns whether the peer has pieces we need.
    pub fn peer_bitfield(&mut self, bf: &Bitfield) -> bool {
        for idx in bf.iter_ones() {
            if let Some(piece) = self.pieces.get_mut(idx) {
                piece.frequency += 1;
            }
        }
        self.peer_needs(bf)
    }

    // Returns whether we need the piece.
    pub fn peer_have(&mut self, idx: usize) -> bool {
        match self.pieces.get_mut(idx) {
            Some(piece) => {
                piece.frequency += 1;
                !piece.completed
            },
            None => false,
        }
    }

    // Forgets a peer's availability and frees its pending requests.
    pub fn peer_disconnected(&mut self, peer: SocketAddr, bf: &Bitfield) {
        for idx in bf.iter_ones() {
            if let Some(piece) = self.pieces.get_mut(idx) {
                piece.frequency = piece.frequency.saturating_sub(1);
            }
        }
        self.release_peer_requests(peer);
    }

    pub fn release_peer_requests(&mut self, peer: SocketAddr) -> usize {
        self.requests.clear_peer(peer)
    }

    pub fn peer_needs(&self, bf: &Bitfield) -> bool {
        bf.iter_ones().any(|idx| self.pieces.get(idx).map_or(false, |p| !p.completed))
    }

    // Selection.

    // Picks a piece that is neither completed nor downloading, optionally
    // restricted to those in `peer`. Pieces no peer has are never picked.
    // Chosen uniformly among the RAREST_CANDIDATES rarest.
    pub fn next_piece_to_request(&mut self, peer: Option<&Bitfield>) -> Option<usize> {
        let mut candidates = self.pieces
            .iter()
            .filter(|p| !p.completed && !p.downloading && p.frequency > 0)
            .filter(|p| peer.map_or(true, |bf| bf.get(p.idx).map_or(false, |b| *b)))
            .map(|p| (p.idx, p.frequency))
            .collect::<Vec<_>>();

        // Shuffled first so pieces tied on availability share the top slots.
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        candidates.sort_by_key(|&(_, frequency)| frequency);
        candidates.truncate(RAREST_CANDIDATES);
        let (idx, frequency) = *candidates.choose(&mut rng)?;

        self.pieces[idx].start(Instant::now());
        tracing::trace!("picked piece {} (availability {})", idx, frequency);
        Some(idx)
    }

    // Marks a specific piece downloading, false if it is completed or already taken.
    pub fn start_piece(&mut self, idx: usize) -> bool {
        match self.pieces.get_mut(idx) {
            Some(piece) if !piece.completed && !piece.downloading => {
                piece.start(Instant::now());
                true
            },
            _ => false,
        }
    }

    // First block of the piece that is neither received nor pending from any peer.
    // Once every block is pending (end game) any block still missing is returned.
    pub fn next_block_to_request(&self, idx: usize) -> Option<BlockInfo> {
        let piece = self.pieces.get(idx).filter(|p| !p.completed)?;
        piece.blocks
            .iter()
            .find(|b| !b.is_complete() && !self.requests.is_requested(idx, b.info.offset))
            .or_else(|| piece.blocks.iter().find(|b| !b.is_complete()))
            .map(|b| b.info)
    }

    // Like `next_block_to_request`, but end game duplicates skip blocks this
    // peer already has pending.
    pub fn next_block_for_peer(&self, idx: usize, peer: SocketAddr) -> Option<BlockInfo> {
        let piece = self.pieces.get(idx).filter(|p| !p.completed)?;
        let fresh = piece.blocks
            .iter()
            .find(|b| !b.is_complete() && !self.requests.is_requested(idx, b.info.offset));
        fresh
            .or_else(|| {
                piece.blocks
                    .iter()
                    .find(|b| !b.is_complete() && self.requests.get(idx, b.info.offset, peer).is_none())
            })
            .map(|b| b.info)
    }

    // Records an outgoing request, false if it is invalid or a duplicate for this peer.
    pub fn record_request_sent(&mut self, idx: usize, offset: usize, len: usize, peer: SocketAddr) -> bool {
        let valid = self.pieces
            .get(idx)
            .filter(|p| !p.completed)
            .and_then(|p| p.block(offset))
            .map_or(false, |b| !b.is_complete() && b.info.len == len);
        valid && self.requests.insert(idx, offset, len, peer, Instant::now())
    }

    // Drops a request this peer gave up on, so the block can be asked of someone else.
    pub fn cancel_request(&mut self, idx: usize, offset: usize, peer: SocketAddr) -> bool {
        self.requests.remove(idx, offset, peer)
    }

    // Stores a received block. Once every block of the piece is present the piece
    // is assembled and verified, then saved or reset.
    pub fn record_block_received(&mut self, idx: usize, offset: usize, data: &[u8], peer: SocketAddr) -> Result<BlockOutcome> {
        let piece = self.pieces.get_mut(idx).ok_or(PickerError::InvalidPiece(idx))?;
        if piece.completed {
            self.requests.remove(idx, offset, peer);
            return Ok(BlockOutcome::Ignored);
        }

        let block = piece.block_mut(offset).ok_or(PickerError::InvalidBlock { idx, offset })?;
        if block.info.len != data.len() {
            return Err(PickerError::BlockLength {
                idx,
                offset,
                expected: block.info.len,
                actual: data.len(),
            });
        }
        self.requests.remove(idx, offset, peer);
        if block.is_complete() {
            return Ok(BlockOutcome::Ignored);
        }

        block.data = Some(data.to_vec());
        piece.last_activity = Some(Instant::now());
        self.downloaded += data.len() as u64;

        if !piece.all_blocks_received() {
            return Ok(BlockOutcome::Stored);
        }

        let bytes = piece.assemble()?;
        if !piece.verify_hash(&bytes) {
            tracing::warn!("piece {} failed hash check", idx);
            piece.reset();
            self.requests.clear_piece(idx);
            return Ok(BlockOutcome::HashMismatch);
        }

        if let Err(e) = self.store.save_piece(idx, &bytes) {
            piece.reset();
            self.requests.clear_piece(idx);
            return Err(e.into());
        }

        piece.mark_completed();
        self.have.set(idx, true);
        self.requests.clear_piece(idx);
        Ok(BlockOutcome::Completed)
    }

    // Recovery.

    // Hands back downloading pieces that have seen no block for the stuck timeout.
    // Received blocks are kept, only their pending requests are dropped.
    pub fn mark_stuck_pieces_available(&mut self, now: Instant) -> Vec<usize> {
        let mut stuck = Vec::new();
        for piece in self.pieces.iter_mut().filter(|p| p.downloading && !p.completed) {
            let idle = piece.last_activity.map_or(Duration::MAX, |t| now.saturating_duration_since(t));
            if idle >= self.stuck_timeout {
                piece.downloading = false;
                piece.last_activity = None;
                stuck.push(piece.idx);
            }
        }
        for &idx in stuck.iter() {
            self.requests.clear_piece(idx);
        }
        stuck
    }

    pub fn sweep_expired_requests(&mut self, now: Instant) -> usize {
        let expired = self.requests.sweep_expired(now, self.request_timeout);
        if !expired.is_empty() {
            tracing::debug!("dropped {} expired requests", expired.len());
        }
        expired.len()
    }

    // Discards all progress on a piece that is not yet completed.
    pub fn reset_piece(&mut self, idx: usize) {
        if let Some(piece) = self.pieces.get_mut(idx).filter(|p| !p.completed) {
            piece.reset();
            self.requests.clear_piece(idx);
        }
    }

    // Completed pieces the store no longer holds go back to missing.
    pub fn recheck_store(&mut self) -> Vec<usize> {
        let lost = self.pieces
            .iter()
            .filter(|p| p.completed && !self.store.is_piece_complete(p.idx))
            .map(|p| p.idx)
            .collect::<Vec<_>>();
        for &idx in lost.iter() {
            let piece = &mut self.pieces[idx];
            piece.completed = false;
            piece.reset();
            self.have.set(idx, false);
        }
        lost
    }

    // Queries.

    pub fn is_piece_complete(&self, idx: usize) -> bool {
        self.pieces.get(idx).map_or(false, |p| p.completed)
    }

    pub fn is_downloading(&self, idx: usize) -> bool {
        self.pieces.get(idx).map_or(false, |p| p.downloading)
    }

    pub fn missing_pieces(&self) -> Vec<usize> {
        self.pieces.iter().filter(|p| !p.completed).map(|p| p.idx).collect()
    }

    // Every piece flagged complete, the count agrees and nothing is still downloading.
    pub fn is_download_complete(&self) -> bool {
        self.pieces.iter().all(|p| p.completed)
            && self.have.count_ones() == self.pieces.len()
            && !self.pieces.iter().any(|p| p.downloading)
    }

    pub fn completion_stats(&self) -> CompletionStats {
        let mut stats = CompletionStats {
            total: self.pieces.len(),
            pending_requests: self.requests.len(),
            ..Default::default()
        };
        for piece in self.pieces.iter() {
            if piece.completed {
                stats.completed += 1;
                stats.bytes_completed += piece.len as u64;
            } else if piece.downloading {
                stats.downloading += 1;
            }
        }
        stats
    }
}
