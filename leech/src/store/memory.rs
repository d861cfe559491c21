use std::{cell::RefCell, collections::BTreeMap, rc::Rc};
use super::{PieceStore, Progress, Result, StoreError};

// Calls observed by a `MemoryStore`, shared with the test that created it.
#[derive(Debug, Default)]
pub struct StoreLog {
    pub pieces: BTreeMap<usize, Vec<u8>>,
    pub saves: Vec<usize>,
    pub reconstructed: bool,
    pub cleaned_up: bool,
}

pub struct MemoryStore {
    num_pieces: usize,
    log: Rc<RefCell<StoreLog>>,
    fail_saves: bool,
}

impl MemoryStore {

    pub fn new(num_pieces: usize) -> (Self, Rc<RefCell<StoreLog>>) {
        let log = Rc::new(RefCell::new(StoreLog::default()));
        (Self { num_pieces, log: log.clone(), fail_saves: false }, log)
    }

    // Store already holding `pieces`, as after an interrupted run.
    pub fn with_pieces(num_pieces: usize, pieces: &[usize]) -> (Self, Rc<RefCell<StoreLog>>) {
        let (store, log) = Self::new(num_pieces);
        for &idx in pieces {
            log.borrow_mut().pieces.insert(idx, Vec::new());
        }
        (store, log)
    }

    pub fn failing(num_pieces: usize) -> Self {
        let (mut store, _) = Self::new(num_pieces);
        store.fail_saves = true;
        store
    }
}

impl PieceStore for MemoryStore {

    fn initialize(&mut self) -> Result<()> { Ok(()) }

    fn save_piece(&mut self, idx: usize, data: &[u8]) -> Result<()> {
        if idx >= self.num_pieces {
            return Err(StoreError::InvalidPiece(idx));
        }
        if self.fail_saves {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
        }
        let mut log = self.log.borrow_mut();
        log.pieces.insert(idx, data.to_vec());
        log.saves.push(idx);
        Ok(())
    }

    fn is_piece_complete(&self, idx: usize) -> bool {
        self.log.borrow().pieces.contains_key(&idx)
    }

    fn reconstruct_files(&mut self) -> Result<()> {
        for idx in 0..self.num_pieces {
            if !self.is_piece_complete(idx) {
                return Err(StoreError::MissingPiece(idx));
            }
        }
        self.log.borrow_mut().reconstructed = true;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.log.borrow_mut().cleaned_up = true;
        Ok(())
    }

    fn progress(&self) -> Progress {
        Progress {
            completed: self.log.borrow().pieces.len(),
            total: self.num_pieces,
        }
    }
}
