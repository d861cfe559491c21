use crate::BLOCK_SIZE;

// Position of a block inside its piece, as carried by request and cancel.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {

    pub piece_idx: usize,

    // Byte offset within the piece, a multiple of the block size.
    pub offset: usize,

    pub len: usize,

}

impl BlockInfo {

    #[inline]
    pub fn idx_in_piece(&self) -> usize {
        self.offset / BLOCK_SIZE
    }

    // One past the last byte of the block within the piece.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

// Payload of a piece message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {

    pub piece_idx: usize,

    pub offset: usize,

    pub data: Vec<u8>,

}

impl BlockData {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_idx: self.piece_idx,
            offset: self.offset,
            len: self.data.len(),
        }
    }
}

// Splits a piece of `piece_len` bytes into blocks, in offset order.
// Every block is full size except possibly the last.
pub fn piece_blocks(piece_idx: usize, piece_len: usize) -> impl Iterator<Item = BlockInfo> {
    (0..piece_len)
        .step_by(BLOCK_SIZE)
        .map(move |offset| BlockInfo {
            piece_idx,
            offset,
            len: BLOCK_SIZE.min(piece_len - offset),
        })
}
