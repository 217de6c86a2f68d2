use std::path::{Component, Path, PathBuf};
use rand::seq::SliceRandom;
use serde_derive::Deserialize;
use sha1::Digest;
use url::Url;
use crate::{store::FileInfo, TorrentID};

// Largest piece length we accept, 32 MiB.
const MAX_PIECE_LEN: u32 = 0x200_0000;

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

    #[error("invalid pieces length, must be a non-zero multiple of 20 matching the torrent length")]
    InvalidPiecesLength,

    #[error("invalid piece length {0}, must be between 1 and 32 MiB")]
    InvalidPieceLength(u32),

    #[error("info must contain exactly one of length or files")]
    InvalidLayout,

    #[error("file(s) with size 0")]
    FileNoSize,

    #[error("file(s) with no path")]
    FileEmptyPath,

    #[error("file has absolute or escaping path")]
    FileAbsolutePath,
}

#[derive(Debug, Clone, Deserialize)]
pub struct File {

    pub path: Vec<String>,

    pub length: u64,

    #[serde(default)]
    pub md5sum: Option<String>,

}

#[derive(Clone, Deserialize)]
pub struct Info {

    // Suggested name of the file, or the directory in multi file mode.
    pub name: String,

    // String consisting of the concatenation of all 20-byte SHA1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    // Number of bytes in each piece (integer).
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // Length of the file in bytes, single file mode only.
    #[serde(default)]
    pub length: Option<u64>,

    // A list of dictionaries, one for each file, multi file mode only.
    #[serde(default)]
    pub files: Option<Vec<File>>,

    // If set to 1 peers must only be obtained from the trackers listed in the metainfo.
    #[serde(default)]
    pub private: Option<u8>,

}

#[derive(Deserialize, Clone)]
pub struct MetaInfo {

    // The announce URL of the tracker (string).
    #[serde(deserialize_with = "crate::de::url_deserialize")]
    pub announce: Url,

    // A dictionary that describes the file(s) of the torrent.
    pub info: Info,

    // sha1 hash of the raw info dict.
    #[serde(skip)]
    pub info_hash: TorrentID,

    // (optional) the string encoding format used to generate the pieces part of the info dictionary.
    #[serde(default)]
    pub encoding: Option<String>,

    // (optional) tiers of tracker urls, extension to the official specification.
    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<Url>>>,

    // (optional) the creation time of the torrent, in standard UNIX epoch format.
    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    // (optional) free-form textual comments of the author (string).
    #[serde(default)]
    pub comment: Option<String>,

    // (optional) name and version of the program used to create the .torrent (string).
    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,

}

impl MetaInfo {

    pub fn new<P: AsRef<Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<MetaInfo, MetaInfoError> {
        let mut metainfo: MetaInfo = bencode::decode_bytes(raw)?;
        metainfo.validate()?;

        // Hash the info dict exactly as it appears in the file.
        let span = bencode::dict_value_span(raw, b"info")?.ok_or(MetaInfoError::MissingInfo)?;
        metainfo.info_hash = sha1::Sha1::digest(&raw[span]).into();

        tracing::debug!("metainfo created: {:#?}", metainfo);
        Ok(metainfo)
    }

    fn validate(&self) -> Result<(), MetaInfoError> {
        let info = &self.info;
        if info.piece_length == 0 || info.piece_length > MAX_PIECE_LEN {
            return Err(MetaInfoError::InvalidPieceLength(info.piece_length));
        }
        if info.name.is_empty() {
            return Err(MetaInfoError::FileEmptyPath);
        }
        if !Path::new(&info.name).components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(MetaInfoError::FileAbsolutePath);
        }

        match (&info.length, &info.files) {
            (Some(0), None) => return Err(MetaInfoError::FileNoSize),
            (Some(_), None) => {},
            (None, Some(files)) if !files.is_empty() => {
                for file in files {
                    if file.length == 0 {
                        return Err(MetaInfoError::FileNoSize);
                    }
                    if file.path.is_empty() || file.path.iter().any(|p| p.is_empty()) {
                        return Err(MetaInfoError::FileEmptyPath);
                    }
                    let path: PathBuf = file.path.iter().collect();
                    if !path.components().all(|c| matches!(c, Component::Normal(_))) {
                        return Err(MetaInfoError::FileAbsolutePath);
                    }
                }
            },
            _ => return Err(MetaInfoError::InvalidLayout),
        }

        let num_hashes = info.pieces.len() / 20;
        let expected = (self.total_len() + info.piece_length as u64 - 1) / info.piece_length as u64;
        if info.pieces.len() % 20 != 0 || num_hashes as u64 != expected {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        Ok(())
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info.pieces
            .chunks_exact(20)
            .map(|c| {
                let mut hash = [0; 20];
                hash.copy_from_slice(c);
                hash
            })
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> usize { self.info.pieces.len() / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> TorrentID { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    // Tracker tiers in priority order, urls are shuffled within each tier.
    pub fn trackers(&self) -> Vec<Vec<Url>> {
        match self.announce_list.clone() {
            Some(mut tiers) => {
                for tier in tiers.iter_mut() {
                    tier.shuffle(&mut rand::thread_rng());
                }
                tiers
            },
            None => vec![vec![self.announce.clone()]],
        }
    }

    // Files flattened into one contiguous byte array.
    pub fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files.iter().map(|f| {
                let file_info = FileInfo::new(f.path.iter().collect::<PathBuf>(), f.length, offset);
                offset += f.length;
                file_info
            }).collect()
        } else {
            vec![FileInfo::new(&self.info.name, self.total_len(), 0)]
        }
    }

    // Formatting methods.

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            chrono::DateTime::from_timestamp(v, 0)
                .map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn size_fmt(&self) -> String {
        format_size(self.total_len())
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size > 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_str())
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("encoding", &self.encoding)
            // Change urls to strings for printing.
            .field("announce_list", &self.announce_list.as_ref().map(|v|
                v.iter().map(|v|
                    v.iter().map(|v| v.as_str()).collect()
                ).collect::<Vec<Vec<&str>>>()
            ))
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// Dont want to print out the pieces field, so we implement Debug manually.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}
