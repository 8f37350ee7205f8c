//! Disk adaptor: maps piece- or byte-offset writes onto one or more
//! on-disk files, and verifies completed pieces against the metainfo's
//! per-piece SHA-1 hashes.
//!
//! Unlike a whole-buffer re-hash on every write, verification here only
//! ever hashes the single piece that just completed.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use sha1::{Digest, Sha1};

use crate::metainfo::{FileEntry, Metainfo};

/// One physical file backing a slice of the overall download.
struct OpenFile {
    entry: FileEntry,
    handle: File,
}

/// Maps a flat torrent-relative byte range onto the on-disk file(s) and
/// verifies completed pieces by hash. Handles both single-file downloads
/// (segmented HTTP/FTP, no piece hashes) and multi-file torrents.
pub struct DiskAdaptor {
    files: Vec<OpenFile>,
    piece_length: u64,
    total_length: u64,
    piece_hashes: Vec<[u8; 20]>,
}

impl DiskAdaptor {
    /// Opens (creating and pre-allocating as needed) every file named by
    /// `metainfo` under `base_dir`.
    pub fn from_metainfo(metainfo: &Metainfo, base_dir: &Path) -> io::Result<Self> {
        let entries = metainfo.files();
        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            let full_path = base_dir.join(&entry.path);
            if let Some(parent) = full_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&full_path)?;
            handle.set_len(entry.length)?;
            files.push(OpenFile { entry, handle });
        }
        Ok(Self {
            files,
            piece_length: metainfo.piece_length(),
            total_length: metainfo.length(),
            piece_hashes: metainfo.piece_hashes(),
        })
    }

    /// Opens a single flat output file, for plain segmented downloads with
    /// no piece structure (HTTP/FTP mode).
    pub fn from_single_file(path: &Path, length: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        handle.set_len(length)?;
        let entry = FileEntry {
            path: path.to_path_buf(),
            length,
            torrent_offset: 0,
        };
        Ok(Self {
            files: vec![OpenFile { entry, handle }],
            piece_length: length.max(1),
            total_length: length,
            piece_hashes: Vec::new(),
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Writes `data` at torrent-relative `offset`, splitting across file
    /// boundaries in a multi-file layout.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut remaining = data;
        let mut cursor = offset;
        while !remaining.is_empty() {
            let file = self
                .files
                .iter_mut()
                .find(|f| cursor < f.entry.end_offset() && cursor >= f.entry.torrent_offset)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "offset outside download range")
                })?;
            let file_offset = cursor - file.entry.torrent_offset;
            let available = file.entry.length - file_offset;
            let chunk_len = available.min(remaining.len() as u64) as usize;
            file.handle.seek(SeekFrom::Start(file_offset))?;
            file.handle.write_all(&remaining[..chunk_len])?;
            remaining = &remaining[chunk_len..];
            cursor += chunk_len as u64;
        }
        Ok(())
    }

    /// Reads `len` bytes starting at torrent-relative `offset`.
    pub fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        let mut cursor = offset;
        let mut written = 0usize;
        while written < len {
            let file = self
                .files
                .iter_mut()
                .find(|f| cursor < f.entry.end_offset() && cursor >= f.entry.torrent_offset)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "offset outside download range")
                })?;
            let file_offset = cursor - file.entry.torrent_offset;
            let available = (file.entry.length - file_offset) as usize;
            let chunk_len = available.min(len - written);
            file.handle.seek(SeekFrom::Start(file_offset))?;
            file.handle.read_exact(&mut out[written..written + chunk_len])?;
            written += chunk_len;
            cursor += chunk_len as u64;
        }
        Ok(out)
    }

    /// Writes a fully-assembled piece and checks it against the piece's
    /// SHA-1 hash. Returns `Ok(true)` if the hash matches, `Ok(false)` if
    /// it doesn't (the caller should treat the piece as uncompleted and
    /// re-request it); the bytes are written either way since a later
    /// `write_at` for the same range would otherwise have to re-seek.
    pub fn write_piece(&mut self, index: usize, data: &[u8]) -> io::Result<bool> {
        let expected = self.piece_hashes.get(index).copied();
        let offset = index as u64 * self.piece_length;
        self.write_at(offset, data)?;
        match expected {
            None => Ok(true),
            Some(expected) => Ok(Self::hash_matches(data, &expected)),
        }
    }

    fn hash_matches(data: &[u8], expected: &[u8; 20]) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest: [u8; 20] = hasher.finalize().into();
        digest == *expected
    }

    /// Re-reads and re-verifies piece `index` from disk, without requiring
    /// the caller to hold the assembled bytes in memory.
    pub fn verify_piece(&mut self, index: usize) -> io::Result<bool> {
        let Some(expected) = self.piece_hashes.get(index).copied() else {
            return Ok(true);
        };
        let offset = index as u64 * self.piece_length;
        let len = self.piece_length.min(self.total_length - offset) as usize;
        let data = self.read_at(offset, len)?;
        Ok(Self::hash_matches(&data, &expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEBIAN_FILE;
    use tempfile::tempdir;

    #[test]
    fn single_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut disk = DiskAdaptor::from_single_file(&path, 32).unwrap();
        disk.write_at(0, &[1u8; 16]).unwrap();
        disk.write_at(16, &[2u8; 16]).unwrap();
        let read = disk.read_at(0, 32).unwrap();
        assert_eq!(&read[..16], &[1u8; 16][..]);
        assert_eq!(&read[16..], &[2u8; 16][..]);
    }

    #[test]
    fn write_piece_detects_corruption() {
        let metainfo = Metainfo::from_file(DEBIAN_FILE).unwrap();
        let dir = tempdir().unwrap();
        let mut disk = DiskAdaptor::from_metainfo(&metainfo, dir.path()).unwrap();
        let piece_len = metainfo.piece_len_at(0) as usize;
        let garbage = vec![0xAAu8; piece_len];
        let ok = disk.write_piece(0, &garbage).unwrap();
        assert!(!ok);
    }

    #[test]
    fn write_at_spans_multiple_files() {
        let dir = tempdir().unwrap();
        let f1 = FileEntry {
            path: "a.bin".into(),
            length: 4,
            torrent_offset: 0,
        };
        let f2 = FileEntry {
            path: "b.bin".into(),
            length: 4,
            torrent_offset: 4,
        };
        let mut files = Vec::new();
        for entry in [f1, f2] {
            let full_path = dir.path().join(&entry.path);
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&full_path)
                .unwrap();
            handle.set_len(entry.length).unwrap();
            files.push(OpenFile { entry, handle });
        }
        let mut disk = DiskAdaptor {
            files,
            piece_length: 8,
            total_length: 8,
            piece_hashes: Vec::new(),
        };
        disk.write_at(2, &[9u8; 4]).unwrap();
        let read = disk.read_at(0, 8).unwrap();
        assert_eq!(read, vec![0, 0, 9, 9, 9, 9, 0, 0]);
    }
}
