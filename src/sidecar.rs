//! Persisted sidecar state: `<target>.aria2`.
//!
//! Layout: a header (magic + version), the target length, the segment
//! list (begin, end, cursor, finished), and, in swarm mode, the local
//! completion bitmap plus the used-piece sub-bitfields.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::bitfield::BitField;
use crate::segment::Segment;

const MAGIC: &[u8; 4] = b"A2SC";
const VERSION: u16 = 1;

/// A used piece's persisted sub-bitfield, keyed by piece index.
#[derive(Debug, Clone, PartialEq)]
pub struct UsedPieceRecord {
    pub index: usize,
    pub block_bitfield: Vec<u8>,
    pub num_blocks: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SidecarState {
    pub total_length: u64,
    pub segments: Vec<Segment>,
    pub swarm_bitfield: Option<BitField>,
    pub used_pieces: Vec<UsedPieceRecord>,
}

pub fn sidecar_path(target: &Path) -> std::path::PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".aria2");
    std::path::PathBuf::from(name)
}

impl SidecarState {
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(MAGIC)?;
        file.write_u16::<BigEndian>(VERSION)?;
        file.write_u64::<BigEndian>(self.total_length)?;

        file.write_u32::<BigEndian>(self.segments.len() as u32)?;
        for segment in &self.segments {
            file.write_u64::<BigEndian>(segment.begin)?;
            file.write_u64::<BigEndian>(segment.end)?;
            file.write_u64::<BigEndian>(segment.cursor)?;
            file.write_u8(segment.finished as u8)?;
        }

        match &self.swarm_bitfield {
            None => {
                file.write_u8(0)?;
            }
            Some(bitfield) => {
                file.write_u8(1)?;
                file.write_u64::<BigEndian>(bitfield.len() as u64)?;
                let bytes = bitfield.to_bytes();
                file.write_u32::<BigEndian>(bytes.len() as u32)?;
                file.write_all(&bytes)?;

                file.write_u32::<BigEndian>(self.used_pieces.len() as u32)?;
                for piece in &self.used_pieces {
                    file.write_u32::<BigEndian>(piece.index as u32)?;
                    file.write_u64::<BigEndian>(piece.num_blocks as u64)?;
                    file.write_u32::<BigEndian>(piece.block_bitfield.len() as u32)?;
                    file.write_all(&piece.block_bitfield)?;
                }
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad sidecar magic",
            ));
        }
        let version = file.read_u16::<BigEndian>()?;
        if version != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsupported sidecar version",
            ));
        }
        let total_length = file.read_u64::<BigEndian>()?;

        let segment_count = file.read_u32::<BigEndian>()?;
        let mut segments = Vec::with_capacity(segment_count as usize);
        for _ in 0..segment_count {
            let begin = file.read_u64::<BigEndian>()?;
            let end = file.read_u64::<BigEndian>()?;
            let cursor = file.read_u64::<BigEndian>()?;
            let finished = file.read_u8()? != 0;
            segments.push(Segment {
                begin,
                end,
                cursor,
                cuid: None,
                finished,
            });
        }

        let has_swarm = file.read_u8()? != 0;
        let (swarm_bitfield, used_pieces) = if has_swarm {
            let _num_bits = file.read_u64::<BigEndian>()?;
            let byte_len = file.read_u32::<BigEndian>()? as usize;
            let mut bytes = vec![0u8; byte_len];
            file.read_exact(&mut bytes)?;
            let bitfield = BitField::new(bytes);

            let piece_count = file.read_u32::<BigEndian>()?;
            let mut used_pieces = Vec::with_capacity(piece_count as usize);
            for _ in 0..piece_count {
                let index = file.read_u32::<BigEndian>()? as usize;
                let num_blocks = file.read_u64::<BigEndian>()? as usize;
                let byte_len = file.read_u32::<BigEndian>()? as usize;
                let mut block_bitfield = vec![0u8; byte_len];
                file.read_exact(&mut block_bitfield)?;
                used_pieces.push(UsedPieceRecord {
                    index,
                    block_bitfield,
                    num_blocks,
                });
            }
            (Some(bitfield), used_pieces)
        } else {
            (None, Vec::new())
        };

        Ok(Self {
            total_length,
            segments,
            swarm_bitfield,
            used_pieces,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_segment_only_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin.aria2");
        let state = SidecarState {
            total_length: 100,
            segments: vec![Segment {
                begin: 0,
                end: 50,
                cursor: 25,
                cuid: None,
                finished: false,
            }],
            swarm_bitfield: None,
            used_pieces: Vec::new(),
        };
        state.save(&path).unwrap();
        let loaded = SidecarState::load(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn round_trips_swarm_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torrent.out.aria2");
        let mut bitfield = BitField::new_empty(10);
        bitfield.set(2);
        bitfield.set(7);
        let state = SidecarState {
            total_length: 1000,
            segments: Vec::new(),
            swarm_bitfield: Some(bitfield),
            used_pieces: vec![UsedPieceRecord {
                index: 3,
                block_bitfield: vec![0b1000_0000],
                num_blocks: 4,
            }],
        };
        state.save(&path).unwrap();
        let loaded = SidecarState::load(&path).unwrap();
        assert_eq!(loaded.swarm_bitfield.unwrap().pieces(), vec![2, 7]);
        assert_eq!(loaded.used_pieces[0].index, 3);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.aria2");
        std::fs::write(&path, b"NOPE").unwrap();
        assert!(SidecarState::load(&path).is_err());
    }

    #[test]
    fn sidecar_path_appends_extension() {
        let p = sidecar_path(Path::new("/tmp/out.bin"));
        assert_eq!(p, Path::new("/tmp/out.bin.aria2"));
    }
}
