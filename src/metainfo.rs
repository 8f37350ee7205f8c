//! Bencoded `.torrent` metainfo decoding.
//!
//! Parses a metainfo descriptor into piece length, concatenated per-piece
//! SHA-1 hashes, the 20-byte info-hash (SHA-1 over the re-encoded `info`
//! dictionary), and a single- or multi-file entry list with byte offsets
//! suitable for mapping a piece or segment onto the right file(s).

use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_bencode::{from_bytes, to_bytes};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

#[derive(Debug, Deserialize, Serialize)]
struct Node(String, i64);

/// A single file entry inside a multi-file torrent's `info.files` list.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawFile {
    pub path: Vec<String>,
    pub length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize, Serialize)]
pub struct Info {
    pub name: String,
    pub pieces: ByteBuf,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
    #[serde(default)]
    pub length: Option<i64>,
    #[serde(default)]
    pub files: Option<Vec<RawFile>>,
    #[serde(default)]
    pub private: Option<u8>,
    #[serde(default)]
    #[serde(rename = "root hash")]
    pub root_hash: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Metainfo {
    pub info: Info,
    #[serde(default)]
    announce: Option<String>,
    #[serde(default)]
    nodes: Option<Vec<Node>>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    httpseeds: Option<Vec<String>>,
    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    #[serde(default)]
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,
}

/// A file within the torrent, flattened to a byte offset in the overall
/// download, regardless of single- or multi-file mode.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub torrent_offset: u64,
}

impl FileEntry {
    pub fn end_offset(&self) -> u64 {
        self.torrent_offset + self.length
    }
}

impl Metainfo {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        from_bytes(bytes).context("failed to deserialize torrent metainfo")
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }

    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }

    /// SHA-1 over the re-encoded `info` dictionary, per BEP 3.
    pub fn info_hash(&self) -> [u8; 20] {
        let bytes = to_bytes(&self.info).expect("info dictionary always re-encodes");
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        hasher.finalize().into()
    }

    pub fn announce(&self) -> Option<&str> {
        self.announce.as_deref()
    }

    /// All announce URLs across every tier of the announce-list extension,
    /// falling back to the single `announce` field when absent.
    pub fn announce_urls(&self) -> Vec<String> {
        if let Some(tiers) = &self.announce_list {
            tiers.iter().flatten().cloned().collect()
        } else {
            self.announce.iter().cloned().collect()
        }
    }

    pub fn is_multi_file(&self) -> bool {
        self.info.files.is_some()
    }

    /// Total length of the download in bytes, single- or multi-file.
    pub fn length(&self) -> u64 {
        if let Some(length) = self.info.length {
            length as u64
        } else {
            self.info
                .files
                .as_ref()
                .map(|files| files.iter().map(|f| f.length as u64).sum())
                .unwrap_or(0)
        }
    }

    pub fn piece_length(&self) -> u64 {
        self.info.piece_length as u64
    }

    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info
            .pieces
            .chunks(20)
            .map(|chunk| {
                let mut array = [0u8; 20];
                array.copy_from_slice(chunk);
                array
            })
            .collect()
    }

    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.piece_hashes().get(index).copied()
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// The length, in bytes, of the piece at `index`, accounting for a
    /// shorter final piece when the total length isn't an exact multiple of
    /// `piece_length`.
    pub fn piece_len_at(&self, index: usize) -> u64 {
        let piece_length = self.piece_length();
        let total = self.length();
        let start = index as u64 * piece_length;
        piece_length.min(total.saturating_sub(start))
    }

    /// Flattened file list with torrent-relative byte offsets, suitable for
    /// the disk adaptor's offset-to-file mapping.
    pub fn files(&self) -> Vec<FileEntry> {
        match &self.info.files {
            None => vec![FileEntry {
                path: PathBuf::from(&self.info.name),
                length: self.info.length.unwrap_or(0) as u64,
                torrent_offset: 0,
            }],
            Some(files) => {
                let mut offset = 0u64;
                files
                    .iter()
                    .map(|f| {
                        let mut path = PathBuf::from(&self.info.name);
                        for part in &f.path {
                            path.push(part);
                        }
                        let entry = FileEntry {
                            path,
                            length: f.length as u64,
                            torrent_offset: offset,
                        };
                        offset += entry.length;
                        entry
                    })
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEBIAN_FILE;

    #[test]
    fn test_torrent_announce() {
        let torrent = Metainfo::from_file(DEBIAN_FILE).unwrap();
        assert_eq!(
            torrent.announce(),
            Some("http://bttracker.debian.org:6969/announce")
        );
    }

    #[test]
    fn single_file_layout_has_one_entry_at_offset_zero() {
        let torrent = Metainfo::from_file(DEBIAN_FILE).unwrap();
        let files = torrent.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].torrent_offset, 0);
        assert_eq!(files[0].length, torrent.length());
    }

    #[test]
    fn piece_len_at_shortens_last_piece() {
        let torrent = Metainfo::from_file(DEBIAN_FILE).unwrap();
        let last = torrent.piece_count() - 1;
        let expected = torrent.length() - torrent.piece_length() * last as u64;
        assert_eq!(torrent.piece_len_at(last), expected);
        assert_eq!(torrent.piece_len_at(0), torrent.piece_length());
    }

    #[test]
    fn info_hash_is_stable() {
        let a = Metainfo::from_file(DEBIAN_FILE).unwrap();
        let b = Metainfo::from_file(DEBIAN_FILE).unwrap();
        assert_eq!(a.info_hash(), b.info_hash());
        assert_eq!(a.info_hash().len(), 20);
    }
}
