mod file;
#[cfg(test)]
pub(crate) mod memory;

pub use file::FileStore;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("piece {idx}: expected {expected} bytes, got {actual}")]
    IoSizeError {
        idx: usize,
        expected: usize,
        actual: usize,
    },

    #[error("piece index {0} out of range")]
    InvalidPiece(usize),

    #[error("piece {0} has not been stored")]
    MissingPiece(usize),

}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }
}

// Persistence for verified pieces and the final file layout.
// Only pieces that passed their hash check are ever saved.
pub trait PieceStore {

    // Prepares storage and discovers pieces saved by an earlier run.
    fn initialize(&mut self) -> Result<()>;

    fn save_piece(&mut self, idx: usize, data: &[u8]) -> Result<()>;

    fn is_piece_complete(&self, idx: usize) -> bool;

    // Writes the torrent's files from the saved pieces.
    fn reconstruct_files(&mut self) -> Result<()>;

    // Removes intermediate piece storage.
    fn cleanup(&mut self) -> Result<()>;

    fn progress(&self) -> Progress;

}
