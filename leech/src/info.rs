use std::{path::PathBuf, ops::Range};
use crate::metainfo::MetaInfo;

// A file of the torrent, laid out as if all files were one contiguous array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {

    // Path relative to the torrent root directory.
    pub path: PathBuf,

    pub length: u64,

    // Offset in bytes from start of torrent.
    pub offset: u64,

}

impl FileInfo {
    // Byte index range for whole torrent.
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..(self.offset + self.length)
    }
}

// Very widely used, often cloned but is cheap.
#[derive(Debug, Clone)]
pub struct TorrentInfo {

    pub total_len: u64,

    pub piece_len: usize,

    pub last_piece_len: usize,

    pub num_pieces: usize,

}

impl TorrentInfo {

    pub fn new(metainfo: &MetaInfo) -> Self {
        Self::from_lengths(metainfo.total_len(), metainfo.piece_len())
    }

    pub fn from_lengths(total_len: u64, piece_len: usize) -> Self {
        let num_pieces = ((total_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let last_piece_len = match num_pieces {
            0 => 0,
            n => (total_len - (piece_len as u64 * (n as u64 - 1))) as usize,
        };
        Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
        }
    }

    // Returns length of piece given its index.
    pub fn piece_len(&self, idx: usize) -> usize {
        if idx + 1 == self.num_pieces {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    // Offset of piece within the whole torrent.
    pub fn piece_offset(&self, idx: usize) -> u64 {
        idx as u64 * self.piece_len as u64
    }
}
