//! Owns the bitfield and piece data for one active torrent: SHA-1
//! verification, the piece-indexed data map, and final file assembly.
//! Spec §4.2/§5: the bitfield, piece map, and remaining counter mutate
//! as a single unit under one mutex, so concurrent `add_downloaded_piece`
//! callers racing over the same index see exactly one success.

use crate::bitfield::BitField;
use crate::error::CoreError;
use crate::torrent::Metainfo;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

struct Inner {
    bitfield: BitField,
    pieces: HashMap<usize, Vec<u8>>,
    remaining: usize,
}

pub struct PieceStore {
    metainfo: Metainfo,
    inner: Mutex<Inner>,
}

impl PieceStore {
    pub fn new(metainfo: Metainfo) -> PieceStore {
        let piece_count = metainfo.piece_count();
        PieceStore {
            metainfo,
            inner: Mutex::new(Inner {
                bitfield: BitField::new(piece_count),
                pieces: HashMap::with_capacity(piece_count),
                remaining: piece_count,
            }),
        }
    }

    /// Builds a store pre-populated from an on-disk source tree, for the
    /// Upload Server's read-only seeding path. Every piece is hashed once
    /// here, mirroring the construction-time verification described in
    /// spec §4.2's added notes — a seed never trusts a stale "complete"
    /// flag, it re-derives the bitfield from the bytes actually on disk.
    pub fn from_existing_file(metainfo: Metainfo, source_root: &Path) -> Result<PieceStore, CoreError> {
        let store = PieceStore::new(metainfo);
        for index in 0..store.metainfo.piece_count() {
            let range = store.metainfo.piece_range(index);
            let bytes = read_range(&store.metainfo, source_root, range)?;
            store.add_downloaded_piece(index, bytes)?;
        }
        Ok(store)
    }

    pub fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    pub fn verify_piece(&self, bytes: &[u8], index: usize) -> bool {
        let Some(expected) = self.metainfo.piece_hashes.get(index) else { return false };
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        let digest: [u8; 20] = hasher.finalize().into();
        &digest == expected
    }

    /// Requires `SHA1(bytes) == piece_hashes[index]`; fails with
    /// `DuplicatePiece` if the bit was already set. Exactly one concurrent
    /// caller for a given index observes success.
    pub fn add_downloaded_piece(&self, index: usize, bytes: Vec<u8>) -> Result<(), CoreError> {
        if !self.verify_piece(&bytes, index) {
            return Err(CoreError::VerificationFailure { index });
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.bitfield.is_set(index) {
            return Err(CoreError::DuplicatePiece { index });
        }
        inner.bitfield.set(index);
        inner.pieces.insert(index, bytes);
        inner.remaining -= 1;
        Ok(())
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.inner.lock().unwrap().bitfield.is_set(index)
    }

    pub fn get_piece_data(&self, index: usize) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().pieces.get(&index).cloned()
    }

    pub fn snapshot_bitfield(&self) -> Vec<u8> {
        self.inner.lock().unwrap().bitfield.to_bytes()
    }

    pub fn remaining(&self) -> usize {
        self.inner.lock().unwrap().remaining
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Concatenates pieces in index order and splits the result into the
    /// destination file tree, one file per `metainfo.files` entry in its
    /// authoritative order. Requires every piece to be present.
    pub fn assemble_to(&self, dest_dir: &Path) -> Result<(), CoreError> {
        let inner = self.inner.lock().unwrap();
        if inner.remaining != 0 {
            return Err(CoreError::other(format!(
                "cannot assemble: {} piece(s) still missing",
                inner.remaining
            )));
        }
        let mut concatenated = Vec::with_capacity(self.metainfo.total_size as usize);
        for index in 0..self.metainfo.piece_count() {
            concatenated.extend_from_slice(&inner.pieces[&index]);
        }
        drop(inner);

        let mut offset = 0usize;
        for file in &self.metainfo.files {
            let end = offset + file.length as usize;
            let path = if self.metainfo.is_single_file() {
                dest_dir.join(&file.relative_path)
            } else {
                dest_dir.join(&self.metainfo.name).join(&file.relative_path)
            };
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &concatenated[offset..end])?;
            offset = end;
        }
        Ok(())
    }
}

/// Reads the bytes covering `range` across the files rooted at
/// `source_root`, honoring the torrent's file-list concatenation order
/// (spec §4.1: "this concatenation order is authoritative").
fn read_range(metainfo: &Metainfo, source_root: &Path, range: std::ops::Range<u64>) -> Result<Vec<u8>, CoreError> {
    let mut out = vec![0u8; (range.end - range.start) as usize];
    for (file, file_range) in metainfo.file_ranges() {
        if file_range.end <= range.start || file_range.start >= range.end {
            continue;
        }
        let overlap_start = range.start.max(file_range.start);
        let overlap_end = range.end.min(file_range.end);
        let path: PathBuf = if metainfo.is_single_file() {
            source_root.to_path_buf()
        } else {
            source_root.join(&file.relative_path)
        };
        let mut fh = fs::File::open(&path)?;
        fh.seek(SeekFrom::Start(overlap_start - file_range.start))?;
        let mut buf = vec![0u8; (overlap_end - overlap_start) as usize];
        fh.read_exact(&mut buf)?;
        let out_start = (overlap_start - range.start) as usize;
        out[out_start..out_start + buf.len()].copy_from_slice(&buf);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Value;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::thread;

    fn bdict(pairs: Vec<(&str, Value)>) -> Value {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            map.insert(k.as_bytes().to_vec(), v);
        }
        Value::Dict(map)
    }

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn single_file_metainfo(content: &[u8], piece_size: u64) -> Metainfo {
        let mut pieces = Vec::new();
        for chunk in content.chunks(piece_size as usize) {
            pieces.extend_from_slice(&sha1(chunk));
        }
        let info = bdict(vec![
            ("length", Value::Int(content.len() as i64)),
            ("name", Value::Bytes(b"payload.bin".to_vec())),
            ("piece length", Value::Int(piece_size as i64)),
            ("pieces", Value::Bytes(pieces)),
        ]);
        let root = bdict(vec![("info", info)]);
        Metainfo::from_bytes(&root.encode()).unwrap()
    }

    #[test]
    fn add_downloaded_piece_rejects_bad_hash() {
        let metainfo = single_file_metainfo(&[1u8; 256], 256);
        let store = PieceStore::new(metainfo);
        let err = store.add_downloaded_piece(0, vec![0u8; 256]).unwrap_err();
        assert!(matches!(err, CoreError::VerificationFailure { index: 0 }));
    }

    #[test]
    fn add_downloaded_piece_rejects_duplicate() {
        let content = vec![1u8; 256];
        let metainfo = single_file_metainfo(&content, 256);
        let store = PieceStore::new(metainfo);
        store.add_downloaded_piece(0, content.clone()).unwrap();
        let err = store.add_downloaded_piece(0, content).unwrap_err();
        assert!(matches!(err, CoreError::DuplicatePiece { index: 0 }));
    }

    #[test]
    fn concurrent_inserts_for_the_same_index_succeed_exactly_once() {
        let content = vec![9u8; 256];
        let metainfo = single_file_metainfo(&content, 256);
        let store = Arc::new(PieceStore::new(metainfo));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let content = content.clone();
                thread::spawn(move || store.add_downloaded_piece(0, content).is_ok())
            })
            .collect();
        let successes = handles.into_iter().filter(|h| h.join().unwrap()).count();
        assert_eq!(successes, 1);
        assert_eq!(store.remaining(), 0);
    }

    #[test]
    fn assemble_to_splits_multi_file_layout_across_a_boundary_crossing_piece() {
        let file_a = vec![1u8; 300];
        let file_b = vec![2u8; 500];
        let concatenated: Vec<u8> = file_a.iter().chain(file_b.iter()).copied().collect();
        let piece_size = 256u64;
        let mut pieces = Vec::new();
        for chunk in concatenated.chunks(piece_size as usize) {
            pieces.extend_from_slice(&sha1(chunk));
        }
        let info = bdict(vec![
            (
                "files",
                Value::List(vec![
                    bdict(vec![
                        ("length", Value::Int(300)),
                        ("path", Value::List(vec![Value::Bytes(b"a.bin".to_vec())])),
                    ]),
                    bdict(vec![
                        ("length", Value::Int(500)),
                        ("path", Value::List(vec![Value::Bytes(b"b.bin".to_vec())])),
                    ]),
                ]),
            ),
            ("name", Value::Bytes(b"bundle".to_vec())),
            ("piece length", Value::Int(piece_size as i64)),
            ("pieces", Value::Bytes(pieces)),
        ]);
        let root = bdict(vec![("info", info)]);
        let metainfo = Metainfo::from_bytes(&root.encode()).unwrap();

        let store = PieceStore::new(metainfo.clone());
        for (index, chunk) in concatenated.chunks(piece_size as usize).enumerate() {
            store.add_downloaded_piece(index, chunk.to_vec()).unwrap();
        }
        assert!(store.is_complete());

        let dest = tempfile::tempdir().unwrap();
        store.assemble_to(dest.path()).unwrap();

        let written_a = fs::read(dest.path().join("bundle").join("a.bin")).unwrap();
        let written_b = fs::read(dest.path().join("bundle").join("b.bin")).unwrap();
        assert_eq!(written_a, file_a);
        assert_eq!(written_b, file_b);
    }

    #[test]
    fn from_existing_file_hashes_and_fully_seeds_a_single_file_source() {
        let content: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        let metainfo = single_file_metainfo(&content, 256);
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("payload.bin");
        fs::write(&source_path, &content).unwrap();

        let store = PieceStore::from_existing_file(metainfo, &source_path).unwrap();
        assert!(store.is_complete());
        assert_eq!(store.get_piece_data(0).unwrap().len(), 256);
        assert_eq!(store.get_piece_data(3).unwrap().len(), content.len() - 3 * 256);
    }
}
