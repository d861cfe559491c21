mod config;
mod metainfo;
mod info;
mod torrent;
mod tracker;
mod p2p;
mod store;
mod block;
mod picker;
mod de;
pub mod stats;

// Most commonly used block size - 16KB.
pub const BLOCK_SIZE: usize = 0x4000;

pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

// 20 byte SHA1 hash, also used for peer ids.
pub type ID = [u8; 20];

// Re-exports
pub use config::{Config, ClientIdentity};
pub use metainfo::{MetaInfo, MetaInfoError};
pub use info::{FileInfo, TorrentInfo};
pub use p2p::state::{SessionState, ConnState};
pub use store::{FileStore, PieceStore, Progress, StoreError};
pub use stats::DownloadStats;
pub use torrent::{Torrent, TorrentError, TorrentHandle, TorrentState};
