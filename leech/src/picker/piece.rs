use std::time::Instant;
use sha1::{Digest, Sha1};
use crate::{block::{self, BlockInfo}, BLOCK_SIZE, ID};
use super::PickerError;

#[derive(Debug)]
pub struct Block {

    pub info: BlockInfo,

    // Set once the block has been received.
    pub data: Option<Vec<u8>>,

}

impl Block {
    pub fn is_complete(&self) -> bool {
        self.data.is_some()
    }
}

#[derive(Debug)]
pub struct Piece {

    pub idx: usize,

    pub len: usize,

    // Piece hash originally given in metainfo.
    pub hash: ID,

    // Fixed at construction, offset order.
    pub blocks: Vec<Block>,

    // Verified and saved.
    pub completed: bool,

    // Handed out to a peer and not yet finished.
    pub downloading: bool,

    // When the piece was started, or last received a block.
    pub last_activity: Option<Instant>,

    // Number of connected peers that have the piece.
    pub frequency: usize,

}

impl Piece {

    pub fn new(idx: usize, len: usize, hash: ID) -> Self {
        Self {
            idx,
            len,
            hash,
            blocks: block::piece_blocks(idx, len)
                .map(|info| Block { info, data: None })
                .collect(),
            completed: false,
            downloading: false,
            last_activity: None,
            frequency: 0,
        }
    }

    pub fn block(&self, offset: usize) -> Option<&Block> {
        if offset % BLOCK_SIZE != 0 {
            return None;
        }
        self.blocks.get(offset / BLOCK_SIZE)
    }

    pub fn block_mut(&mut self, offset: usize) -> Option<&mut Block> {
        if offset % BLOCK_SIZE != 0 {
            return None;
        }
        self.blocks.get_mut(offset / BLOCK_SIZE)
    }

    pub fn all_blocks_received(&self) -> bool {
        self.blocks.iter().all(Block::is_complete)
    }

    pub fn start(&mut self, now: Instant) {
        self.downloading = true;
        self.last_activity = Some(now);
    }

    // Concatenates block data in offset order.
    pub fn assemble(&self) -> Result<Vec<u8>, PickerError> {
        let mut data = Vec::with_capacity(self.len);
        for block in self.blocks.iter() {
            match &block.data {
                Some(bytes) if block.info.offset == data.len() => data.extend_from_slice(bytes),
                _ => return Err(PickerError::AssemblyGap { idx: self.idx, offset: data.len() }),
            }
        }
        if data.len() != self.len {
            return Err(PickerError::AssemblyGap { idx: self.idx, offset: data.len() });
        }
        Ok(data)
    }

    // Hash the piece data and compare with hash given in metainfo (computationally expensive).
    pub fn verify_hash(&self, data: &[u8]) -> bool {
        let hash: ID = Sha1::digest(data).into();
        hash == self.hash
    }

    // Back to a fresh, unstarted piece.
    pub fn reset(&mut self) {
        self.blocks.iter_mut().for_each(|b| b.data = None);
        self.downloading = false;
        self.last_activity = None;
    }

    // Block buffers are released, the data now lives in the store.
    pub fn mark_completed(&mut self) {
        self.blocks.iter_mut().for_each(|b| b.data = None);
        self.completed = true;
        self.downloading = false;
        self.last_activity = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_lookup() {
        let piece = Piece::new(0, BLOCK_SIZE + 10, [0; 20]);
        assert_eq!(piece.blocks.len(), 2);
        assert_eq!(piece.block(BLOCK_SIZE).map(|b| b.info.len), Some(10));
        assert!(piece.block(100).is_none());
        assert!(piece.block(BLOCK_SIZE * 2).is_none());
    }

    #[test]
    fn test_assemble_and_verify() {
        let data = vec![9u8; BLOCK_SIZE + 10];
        let hash: ID = Sha1::digest(&data).into();
        let mut piece = Piece::new(0, data.len(), hash);

        piece.blocks[1].data = Some(data[BLOCK_SIZE..].to_vec());
        assert!(matches!(piece.assemble(), Err(PickerError::AssemblyGap { idx: 0, offset: 0 })));

        piece.blocks[0].data = Some(data[..BLOCK_SIZE].to_vec());
        let assembled = piece.assemble().unwrap();
        assert_eq!(assembled, data);
        assert!(piece.verify_hash(&assembled));
        assert!(!piece.verify_hash(&assembled[1..]));
    }
}
