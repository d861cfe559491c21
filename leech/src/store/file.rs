use std::{fs, io::Write, path::{Path, PathBuf}};
use crate::{info::{FileInfo, TorrentInfo}, metainfo::MetaInfo, Bitfield};
use super::{PieceStore, Progress, Result, StoreError};

// Directory under the download dir that holds in progress pieces.
const PIECES_DIR: &str = ".pieces";

// Saves each verified piece as its own file, then stitches the torrent's
// files together once every piece is present.
#[derive(Debug)]
pub struct FileStore {

    // Holds piece_<idx>.dat files.
    pieces_dir: PathBuf,

    // Files are written relative to this directory.
    output_dir: PathBuf,

    files: Vec<FileInfo>,

    info: TorrentInfo,

    completed: Bitfield,

}

impl FileStore {

    pub fn new<P: AsRef<Path>>(dir: P, metainfo: &MetaInfo) -> Self {
        let dir = dir.as_ref();
        let output_dir = if metainfo.is_multi_file() {
            dir.join(metainfo.name())
        } else {
            dir.to_path_buf()
        };
        Self::with_layout(
            dir.join(PIECES_DIR).join(metainfo.name()),
            output_dir,
            metainfo.files(),
            TorrentInfo::new(metainfo),
        )
    }

    pub fn with_layout(pieces_dir: PathBuf, output_dir: PathBuf, files: Vec<FileInfo>, info: TorrentInfo) -> Self {
        let completed = Bitfield::repeat(false, info.num_pieces);
        Self { pieces_dir, output_dir, files, info, completed }
    }

    fn piece_path(&self, idx: usize) -> PathBuf {
        self.pieces_dir.join(format!("piece_{}.dat", idx))
    }

    fn read_piece(&self, idx: usize) -> Result<Vec<u8>> {
        if !self.is_piece_complete(idx) {
            return Err(StoreError::MissingPiece(idx));
        }
        let data = fs::read(self.piece_path(idx))?;
        let expected = self.info.piece_len(idx);
        if data.len() != expected {
            return Err(StoreError::IoSizeError { idx, expected, actual: data.len() });
        }
        Ok(data)
    }

    fn write_file(&self, file: &FileInfo, cache: &mut Option<(usize, Vec<u8>)>) -> Result<()> {
        let path = self.output_dir.join(&file.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = std::io::BufWriter::new(fs::File::create(&path)?);

        let range = file.byte_range();
        let piece_len = self.info.piece_len as u64;
        let first = (range.start / piece_len) as usize;
        let last = ((range.end - 1) / piece_len) as usize;

        for idx in first..=last {
            // Pieces overlapping two files are read once.
            let data = match cache.take() {
                Some((cached, data)) if cached == idx => data,
                _ => self.read_piece(idx)?,
            };
            let piece_start = self.info.piece_offset(idx);
            let lo = (range.start.max(piece_start) - piece_start) as usize;
            let hi = (range.end.min(piece_start + data.len() as u64) - piece_start) as usize;
            out.write_all(&data[lo..hi])?;
            *cache = Some((idx, data));
        }

        out.flush()?;
        tracing::debug!("wrote file {:?} ({} bytes)", path, file.length);
        Ok(())
    }
}

impl PieceStore for FileStore {

    fn initialize(&mut self) -> Result<()> {
        fs::create_dir_all(&self.pieces_dir)?;

        for idx in 0..self.info.num_pieces {
            if let Ok(meta) = fs::metadata(self.piece_path(idx)) {
                // Partial writes from a crash are discarded.
                let complete = meta.len() == self.info.piece_len(idx) as u64;
                self.completed.set(idx, complete);
            }
        }

        let found = self.completed.count_ones();
        if found > 0 {
            tracing::info!("found {}/{} pieces from a previous run", found, self.info.num_pieces);
        }
        Ok(())
    }

    fn save_piece(&mut self, idx: usize, data: &[u8]) -> Result<()> {
        if idx >= self.info.num_pieces {
            return Err(StoreError::InvalidPiece(idx));
        }
        let expected = self.info.piece_len(idx);
        if data.len() != expected {
            return Err(StoreError::IoSizeError { idx, expected, actual: data.len() });
        }

        // Write then rename so a piece file is either whole or absent.
        let path = self.piece_path(idx);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        self.completed.set(idx, true);
        Ok(())
    }

    fn is_piece_complete(&self, idx: usize) -> bool {
        self.completed.get(idx).map(|b| *b).unwrap_or(false)
    }

    fn reconstruct_files(&mut self) -> Result<()> {
        if let Some(idx) = self.completed.iter_zeros().next() {
            return Err(StoreError::MissingPiece(idx));
        }
        let mut cache = None;
        for file in self.files.iter() {
            self.write_file(file, &mut cache)?;
        }
        tracing::info!("reconstructed {} file(s) in {:?}", self.files.len(), self.output_dir);
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.pieces_dir.exists() {
            fs::remove_dir_all(&self.pieces_dir)?;
        }
        // Only removed once no other torrent uses it.
        if let Some(parent) = self.pieces_dir.parent() {
            let _ = fs::remove_dir(parent);
        }
        Ok(())
    }

    fn progress(&self) -> Progress {
        Progress {
            completed: self.completed.count_ones(),
            total: self.info.num_pieces,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path, files: Vec<FileInfo>, piece_len: usize) -> FileStore {
        let total = files.iter().map(|f| f.length).sum();
        FileStore::with_layout(
            dir.join(PIECES_DIR).join("test"),
            dir.join("test"),
            files,
            TorrentInfo::from_lengths(total, piece_len),
        )
    }

    fn file(path: &str, length: u64, offset: u64) -> FileInfo {
        FileInfo { path: path.into(), length, offset }
    }

    #[test]
    fn test_reconstruct_across_files() {
        let dir = tempfile::tempdir().unwrap();
        // 3 files over 3 pieces of 8 bytes, piece 1 spans all 3 files.
        let mut store = store_in(dir.path(), vec![
            file("a.bin", 10, 0),
            file("sub/b.bin", 3, 10),
            file("c.bin", 7, 13),
        ], 8);
        store.initialize().unwrap();

        let data = (0u8..20).collect::<Vec<_>>();
        for (idx, chunk) in data.chunks(8).enumerate() {
            store.save_piece(idx, chunk).unwrap();
        }
        assert_eq!(store.progress(), Progress { completed: 3, total: 3 });

        store.reconstruct_files().unwrap();
        let root = dir.path().join("test");
        assert_eq!(fs::read(root.join("a.bin")).unwrap(), &data[..10]);
        assert_eq!(fs::read(root.join("sub/b.bin")).unwrap(), &data[10..13]);
        assert_eq!(fs::read(root.join("c.bin")).unwrap(), &data[13..]);

        store.cleanup().unwrap();
        assert!(!dir.path().join(PIECES_DIR).exists());
    }

    #[test]
    fn test_resume_from_saved_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![file("a.bin", 20, 0)];

        let mut store = store_in(dir.path(), files.clone(), 8);
        store.initialize().unwrap();
        store.save_piece(2, &[1, 2, 3, 4]).unwrap();
        // Truncated piece left by a crash.
        fs::write(store.piece_path(0), [0u8; 3]).unwrap();

        let mut resumed = store_in(dir.path(), files, 8);
        resumed.initialize().unwrap();
        assert!(resumed.is_piece_complete(2));
        assert!(!resumed.is_piece_complete(0));
        assert!(!resumed.is_piece_complete(1));
    }

    #[test]
    fn test_save_rejects_bad_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(dir.path(), vec![file("a.bin", 20, 0)], 8);
        store.initialize().unwrap();

        assert!(matches!(
            store.save_piece(0, &[0; 5]),
            Err(StoreError::IoSizeError { idx: 0, expected: 8, actual: 5 })
        ));
        assert!(matches!(store.save_piece(3, &[0; 8]), Err(StoreError::InvalidPiece(3))));
        assert!(matches!(store.reconstruct_files(), Err(StoreError::MissingPiece(0))));
    }
}
