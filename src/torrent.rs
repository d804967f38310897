//! Bencoded torrent metainfo parsing and the piece↔file byte mapping.
//!
//! `Metainfo` is immutable after parsing: every derived field (piece
//! count, infohash, per-file byte ranges) is computed once in
//! [`Metainfo::from_bytes`] rather than recomputed on each access.

use crate::bencode::{self, Value};
use sha1::{Digest, Sha1};
use std::fs;
use std::path::{Path, PathBuf};

/// One file in the torrent's layout, in the authoritative concatenation
/// order (single-file torrents have exactly one entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub relative_path: PathBuf,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct Metainfo {
    pub name: String,
    pub piece_size: u64,
    pub total_size: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub infohash: [u8; 20],
    pub announce: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] bencode::BencodeError),
    #[error("malformed metainfo: {0}")]
    Malformed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, MetainfoError>;

impl Metainfo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Metainfo> {
        let root = bencode::decode(bytes)?;
        let info = root.dict_require("info")?;

        let name = info.dict_require("name")?.as_str()
            .map_err(|_| MetainfoError::Malformed("name is not valid utf-8".into()))?
            .to_string();

        let piece_size = info.dict_require("piece length")?.as_int()?;
        if piece_size <= 0 {
            return Err(MetainfoError::Malformed("piece length must be positive".into()));
        }
        let piece_size = piece_size as u64;

        let pieces_raw = info.dict_require("pieces")?.as_bytes()?;
        if pieces_raw.len() % 20 != 0 {
            return Err(MetainfoError::Malformed("pieces is not a multiple of 20 bytes".into()));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces_raw
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = Self::parse_files(info)?;
        let total_size: u64 = files.iter().map(|f| f.length).sum();

        let expected_piece_count = if total_size == 0 {
            0
        } else {
            ((total_size + piece_size - 1) / piece_size) as usize
        };
        if piece_hashes.len() != expected_piece_count {
            return Err(MetainfoError::Malformed(format!(
                "piece hash count {} does not match expected {} for total size {}",
                piece_hashes.len(),
                expected_piece_count,
                total_size
            )));
        }

        let info_bytes = info.encode();
        let mut hasher = Sha1::new();
        hasher.update(&info_bytes);
        let infohash: [u8; 20] = hasher.finalize().into();

        let announce = root.dict_get("announce").and_then(|v| v.as_str().ok()).map(String::from);

        Ok(Metainfo { name, piece_size, total_size, piece_hashes, files, infohash, announce })
    }

    fn parse_files(info: &Value) -> Result<Vec<FileEntry>> {
        if let Some(length) = info.dict_get("length") {
            let length = length.as_int()?;
            if length < 0 {
                return Err(MetainfoError::Malformed("length must not be negative".into()));
            }
            let name = info.dict_require("name")?.as_str()
                .map_err(|_| MetainfoError::Malformed("name is not valid utf-8".into()))?;
            return Ok(vec![FileEntry { relative_path: PathBuf::from(name), length: length as u64 }]);
        }

        let files = info.dict_require("files")?.as_list()?;
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let length = file.dict_require("length")?.as_int()?;
            if length < 0 {
                return Err(MetainfoError::Malformed("length must not be negative".into()));
            }
            let path_segments = file.dict_require("path")?.as_list()?;
            let mut relative_path = PathBuf::new();
            for segment in path_segments {
                let segment = segment.as_str()
                    .map_err(|_| MetainfoError::Malformed("path segment is not valid utf-8".into()))?;
                relative_path.push(segment);
            }
            entries.push(FileEntry { relative_path, length: length as u64 });
        }
        if entries.is_empty() {
            return Err(MetainfoError::Malformed("multi-file torrent has no files".into()));
        }
        Ok(entries)
    }

    pub fn from_path(path: &Path) -> Result<Metainfo> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte range `[start, end)` within the concatenation of files that
    /// piece `index` covers. The last piece may be shorter than `piece_size`.
    pub fn piece_range(&self, index: usize) -> std::ops::Range<u64> {
        let start = index as u64 * self.piece_size;
        let end = (start + self.piece_size).min(self.total_size);
        start..end
    }

    pub fn piece_len(&self, index: usize) -> usize {
        let range = self.piece_range(index);
        (range.end - range.start) as usize
    }

    pub fn is_single_file(&self) -> bool {
        self.files.len() == 1 && self.files[0].relative_path == Path::new(&self.name)
    }

    /// Each file's `[start, end)` byte range within the concatenation of
    /// `files` in list order — the authoritative layout spec §4.1 requires
    /// piece boundaries and file writes alike to respect.
    pub fn file_ranges(&self) -> Vec<(&FileEntry, std::ops::Range<u64>)> {
        let mut offset = 0u64;
        self.files
            .iter()
            .map(|f| {
                let range = offset..offset + f.length;
                offset += f.length;
                (f, range)
            })
            .collect()
    }

    pub fn infohash_hex(&self) -> String {
        self.infohash.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Lists `.torrent` files in a torrent directory — the on-disk collaborator
/// the core consumes files from but does not otherwise manage.
pub fn list_torrent_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("torrent") {
            out.push(path);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

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

    fn single_file_torrent(name: &str, content: &[u8], piece_size: u64) -> Vec<u8> {
        let mut pieces = Vec::new();
        for chunk in content.chunks(piece_size as usize) {
            pieces.extend_from_slice(&sha1(chunk));
        }
        let info = bdict(vec![
            ("length", Value::Int(content.len() as i64)),
            ("name", Value::Bytes(name.as_bytes().to_vec())),
            ("piece length", Value::Int(piece_size as i64)),
            ("pieces", Value::Bytes(pieces)),
        ]);
        let root = bdict(vec![
            ("announce", Value::Bytes(b"http://tracker.example/announce".to_vec())),
            ("info", info),
        ]);
        root.encode()
    }

    fn multi_file_torrent(name: &str, files: &[(&str, &[u8])], piece_size: u64) -> Vec<u8> {
        let concatenated: Vec<u8> = files.iter().flat_map(|(_, data)| data.iter().copied()).collect();
        let mut pieces = Vec::new();
        for chunk in concatenated.chunks(piece_size as usize) {
            pieces.extend_from_slice(&sha1(chunk));
        }
        let file_list: Vec<Value> = files
            .iter()
            .map(|(path, data)| {
                bdict(vec![
                    ("length", Value::Int(data.len() as i64)),
                    ("path", Value::List(vec![Value::Bytes(path.as_bytes().to_vec())])),
                ])
            })
            .collect();
        let info = bdict(vec![
            ("files", Value::List(file_list)),
            ("name", Value::Bytes(name.as_bytes().to_vec())),
            ("piece length", Value::Int(piece_size as i64)),
            ("pieces", Value::Bytes(pieces)),
        ]);
        let root = bdict(vec![("info", info)]);
        root.encode()
    }

    #[test]
    fn parses_single_file_layout() {
        let content = vec![7u8; 1024];
        let bytes = single_file_torrent("payload.bin", &content, 256);
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(metainfo.name, "payload.bin");
        assert_eq!(metainfo.total_size, 1024);
        assert_eq!(metainfo.piece_count(), 4);
        assert_eq!(metainfo.files.len(), 1);
        assert_eq!(metainfo.files[0].length, 1024);
        assert_eq!(metainfo.announce.as_deref(), Some("http://tracker.example/announce"));
    }

    #[test]
    fn parses_multi_file_layout_with_boundary_crossing_piece() {
        let file_a = vec![1u8; 300 * 1024];
        let file_b = vec![2u8; 500 * 1024];
        let bytes = multi_file_torrent("bundle", &[("a.bin", &file_a), ("b.bin", &file_b)], 256 * 1024);
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(metainfo.total_size, 800 * 1024);
        assert_eq!(metainfo.piece_count(), 4);
        assert_eq!(metainfo.files[0].relative_path, PathBuf::from("a.bin"));
        assert_eq!(metainfo.files[1].relative_path, PathBuf::from("b.bin"));
        // Piece 1 covers [256KiB, 512KiB) which straddles the 300KiB file boundary.
        let range = metainfo.piece_range(1);
        assert!(range.start < 300 * 1024 && range.end > 300 * 1024);
    }

    #[test]
    fn infohash_is_sha1_of_canonical_info_dict() {
        let bytes = single_file_torrent("x", &[0u8; 16], 16);
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        let root = bencode::decode(&bytes).unwrap();
        let info = root.dict_require("info").unwrap();
        let expected = sha1(&info.encode());
        assert_eq!(metainfo.infohash, expected);
    }

    #[test]
    fn rejects_mismatched_piece_hash_count() {
        let bytes = single_file_torrent("x", &[0u8; 1024], 256);
        let root = bencode::decode(&bytes).unwrap();
        let info = root.dict_require("info").unwrap();
        let pieces = info.dict_require("pieces").unwrap().as_bytes().unwrap().to_vec();
        let short_pieces = pieces[..pieces.len() - 20].to_vec();
        let mut info_map = info.as_dict().unwrap().clone();
        info_map.insert(b"pieces".to_vec(), Value::Bytes(short_pieces));
        let mut root_map = root.as_dict().unwrap().clone();
        root_map.insert(b"info".to_vec(), Value::Dict(info_map));
        let corrupted = Value::Dict(root_map).encode();
        assert!(Metainfo::from_bytes(&corrupted).is_err());
    }

    #[test]
    fn piece_lengths_cover_the_whole_file_with_short_last_piece() {
        let bytes = single_file_torrent("x", &[0u8; 1000], 256);
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(metainfo.piece_count(), 4);
        assert_eq!(metainfo.piece_len(0), 256);
        assert_eq!(metainfo.piece_len(3), 1000 - 3 * 256);
    }
}
