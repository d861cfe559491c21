use rand::seq::SliceRandom;
use serde_derive::Deserialize;
use sha1::Digest;
use url::Url;
use crate::{info::FileInfo, ID};

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("metainfo has no info dictionary")]
    MissingInfo,

    #[error("metainfo has no announce url")]
    MissingAnnounce,

    #[error("torrent name is empty")]
    MissingName,

    #[error("invalid piece length {0}, must be a power of two")]
    InvalidPieceLength(u64),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("expected {expected} piece hashes, found {found}")]
    PieceCountMismatch { expected: u64, found: u64 },

    #[error("torrent must have either a length or a files list")]
    InvalidLayout,

    #[error("file(s) with size 0")]
    FileNoSize,

    #[error("file(s) with no path")]
    FileEmptyPath,

    #[error("file has absolute path")]
    FileAbsolutePath,

    #[error("torrent name {0:?} is not a plain file name")]
    InvalidName(String),
}

type Result<T> = std::result::Result<T, MetaInfoError>;

// One entry of a multi file torrent.
#[derive(Debug, Clone, Deserialize)]
pub struct File {

    // Components relative to the torrent's root directory.
    pub path: Vec<String>,

    pub length: u64,

    #[serde(default)]
    pub md5sum: Option<String>,

}

#[derive(Clone, Deserialize)]
pub struct Info {

    // File name, or the root directory when `files` is set.
    pub name: String,

    // 20 byte SHA-1 digests back to back, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(rename = "piece length")]
    pub piece_length: u64,

    // Single file layout.
    #[serde(default)]
    pub length: Option<u64>,

    // Multi file layout.
    #[serde(default)]
    pub files: Option<Vec<File>>,

    // 1 restricts peer discovery to the listed trackers.
    #[serde(default)]
    pub private: Option<u8>,

}

#[derive(Deserialize, Clone)]
pub struct MetaInfo {

    #[serde(default, deserialize_with = "crate::de::opt_url_deserialize")]
    pub announce: Option<Url>,

    pub info: Info,

    // Filled in after decoding, see `from_bytes`.
    #[serde(skip)]
    pub info_hash: ID,

    #[serde(default)]
    pub encoding: Option<String>,

    #[serde(default, rename = "announce-list", deserialize_with = "crate::de::announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<Url>>>,

    // Unix timestamp.
    #[serde(default, rename = "creation date")]
    pub creation_date: Option<i64>,

    #[serde(default)]
    pub comment: Option<String>,

    #[serde(default, rename = "created by")]
    pub created_by: Option<String>,

}

const HASH_LEN: usize = 20;

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo> {
        let path = path.as_ref();
        if path.extension().map_or(true, |ext| ext != "torrent") {
            return Err(MetaInfoError::InvalidExtension);
        }
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<MetaInfo> {
        let mut metainfo: MetaInfo = bencode::decode_bytes(bytes)?;

        // Hash the canonical encoding of the generic value so keys we don't
        // model are still covered.
        let root = bencode::decode(bytes)?;
        let info = root.get(b"info").ok_or(MetaInfoError::MissingInfo)?;
        metainfo.info_hash = sha1::Sha1::digest(bencode::encode(info)?).into();

        metainfo.validate()?;
        tracing::debug!("loaded metainfo {:?}", metainfo);
        Ok(metainfo)
    }

    fn validate(&self) -> Result<()> {
        let info = &self.info;

        if self.announce.is_none() {
            return Err(MetaInfoError::MissingAnnounce);
        }
        if info.name.is_empty() {
            return Err(MetaInfoError::MissingName);
        }
        // The name becomes the file or root directory on disk.
        if escapes_root(&info.name) {
            return Err(MetaInfoError::InvalidName(info.name.clone()));
        }
        if !info.piece_length.is_power_of_two() {
            return Err(MetaInfoError::InvalidPieceLength(info.piece_length));
        }
        if info.pieces.is_empty() || info.pieces.len() % HASH_LEN != 0 {
            return Err(MetaInfoError::InvalidPiecesLength);
        }

        match (info.length, &info.files) {
            (Some(len), None) if len > 0 => {},
            (Some(_), None) => return Err(MetaInfoError::FileNoSize),
            (None, Some(files)) if !files.is_empty() => files.iter().try_for_each(validate_file)?,
            _ => return Err(MetaInfoError::InvalidLayout),
        }

        let expected = self.total_len().div_ceil(info.piece_length);
        let found = (info.pieces.len() / HASH_LEN) as u64;
        if expected != found {
            return Err(MetaInfoError::PieceCountMismatch { expected, found });
        }
        Ok(())
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.info.pieces
            .chunks_exact(HASH_LEN)
            .map(|digest| {
                let mut hash = [0; HASH_LEN];
                hash.copy_from_slice(digest);
                hash
            })
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> usize { self.info.pieces.len() / HASH_LEN }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        match &self.info.files {
            Some(files) => files.iter().map(|file| file.length).sum(),
            None => self.info.length.unwrap_or_default(),
        }
    }

    pub fn info_hash(&self) -> ID { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    // Tracker tiers, each shuffled. The announce url is kept as a tier of its own
    // when the announce list doesn't already contain it.
    pub fn trackers(&self) -> Vec<Vec<Url>> {
        let mut tiers = self.announce_list.clone().unwrap_or_default();
        let mut rng = rand::thread_rng();
        tiers.iter_mut().for_each(|tier| tier.shuffle(&mut rng));
        if let Some(announce) = &self.announce {
            if !tiers.iter().flatten().any(|url| url == announce) {
                tiers.insert(0, vec![announce.clone()]);
            }
        }
        tiers
    }

    // Files in torrent order with their offset into the concatenated data.
    pub fn files(&self) -> Vec<FileInfo> {
        let Some(files) = &self.info.files else {
            return vec![FileInfo {
                path: self.info.name.clone().into(),
                length: self.total_len(),
                offset: 0,
            }];
        };
        files
            .iter()
            .scan(0, |offset, file| {
                let start = *offset;
                *offset += file.length;
                Some(FileInfo { path: file.path.iter().collect(), length: file.length, offset: start })
            })
            .collect()
    }

    pub fn creation_date_fmt(&self) -> Option<String> {
        let secs = self.creation_date?;
        let date = chrono::DateTime::from_timestamp(secs, 0)
            .map(|date| date.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| format!("invalid timestamp {}", secs));
        Some(date)
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn size_fmt(&self) -> String {
        format_size(self.total_len())
    }
}

fn validate_file(file: &File) -> Result<()> {
    if file.length == 0 {
        return Err(MetaInfoError::FileNoSize);
    }
    if file.path.is_empty() || file.path.iter().any(|part| part.is_empty()) {
        return Err(MetaInfoError::FileEmptyPath);
    }
    if file.path.iter().any(|part| escapes_root(part)) {
        return Err(MetaInfoError::FileAbsolutePath);
    }
    Ok(())
}

// A path component that could point outside the download directory.
fn escapes_root(part: &str) -> bool {
    part == "." || part == ".." || part.contains(['/', '\\', '\0'])
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size > 1024.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tiers = self.announce_list.as_ref().map(|tiers| {
            tiers
                .iter()
                .map(|tier| tier.iter().map(Url::as_str).collect::<Vec<_>>())
                .collect::<Vec<_>>()
        });
        f.debug_struct("MetaInfo")
            .field("name", &self.info.name)
            .field("info_hash", &self.info_hash_hex())
            .field("size", &self.size_fmt())
            .field("pieces", &self.num_pieces())
            .field("piece_length", &self.info.piece_length)
            .field("files", &self.info.files.as_ref().map_or(1, Vec::len))
            .field("private", &(self.info.private == Some(1)))
            .field("announce", &self.announce.as_ref().map(Url::as_str))
            .field("announce_list", &tiers)
            .field("creation_date", &self.creation_date_fmt())
            .field("created_by", &self.created_by)
            .field("comment", &self.comment)
            .finish()
    }
}

// Builds a single file torrent for `data`, hashing each piece.
#[cfg(test)]
pub(crate) fn build_torrent(name: &str, piece_len: usize, data: &[u8], announce: &str) -> Vec<u8> {
    use std::collections::BTreeMap;
    use bencode::Value;

    let pieces = data
        .chunks(piece_len)
        .flat_map(|chunk| {
            let digest: [u8; 20] = sha1::Sha1::digest(chunk).into();
            digest
        })
        .collect::<Vec<u8>>();

    let mut info = BTreeMap::new();
    info.insert(b"name".to_vec(), Value::from(name));
    info.insert(b"piece length".to_vec(), Value::from(piece_len as i64));
    info.insert(b"length".to_vec(), Value::from(data.len() as i64));
    info.insert(b"pieces".to_vec(), Value::from(pieces));

    let mut root = BTreeMap::new();
    root.insert(b"announce".to_vec(), Value::from(announce));
    root.insert(b"info".to_vec(), Value::from(info));
    bencode::encode(&Value::from(root)).unwrap()
}
