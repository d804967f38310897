//! Process-wide `ActiveDownloads` / `ActiveUploads` registries, keyed by
//! infohash, per spec §3/§9. Each table enforces the "at most one entry
//! per infohash" invariant and anchors the documented stop lifecycle:
//! signal the upload listener, join session threads, then announce
//! `stopped` to the tracker for every torrent that was active.

use crate::error::CoreError;
use crate::piece_store::PieceStore;
use crate::torrent::Metainfo;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub struct ActiveDownload {
    pub metainfo: Metainfo,
    pub store: Arc<PieceStore>,
    pub bytes_downloaded: AtomicU64,
    pub connected_peers: AtomicUsize,
}

impl ActiveDownload {
    pub fn new(metainfo: Metainfo, store: Arc<PieceStore>) -> Self {
        ActiveDownload { metainfo, store, bytes_downloaded: AtomicU64::new(0), connected_peers: AtomicUsize::new(0) }
    }
}

pub struct ActiveUpload {
    pub metainfo: Metainfo,
    pub store: Arc<PieceStore>,
    pub bytes_uploaded: AtomicU64,
    pub peers_serving: AtomicUsize,
}

impl ActiveUpload {
    pub fn new(metainfo: Metainfo, store: Arc<PieceStore>) -> Self {
        ActiveUpload { metainfo, store, bytes_uploaded: AtomicU64::new(0), peers_serving: AtomicUsize::new(0) }
    }
}

#[derive(Default)]
pub struct ActiveDownloads {
    table: Mutex<HashMap<[u8; 20], Arc<ActiveDownload>>>,
}

impl ActiveDownloads {
    pub fn new() -> Self {
        ActiveDownloads::default()
    }

    pub fn insert(&self, entry: Arc<ActiveDownload>) -> Result<(), CoreError> {
        let mut table = self.table.lock().unwrap();
        let infohash = entry.metainfo.infohash;
        if table.contains_key(&infohash) {
            return Err(CoreError::other(format!(
                "torrent {} is already active",
                entry.metainfo.infohash_hex()
            )));
        }
        table.insert(infohash, entry);
        Ok(())
    }

    pub fn get(&self, infohash: &[u8; 20]) -> Option<Arc<ActiveDownload>> {
        self.table.lock().unwrap().get(infohash).cloned()
    }

    pub fn remove(&self, infohash: &[u8; 20]) -> Option<Arc<ActiveDownload>> {
        self.table.lock().unwrap().remove(infohash)
    }

    pub fn infohashes(&self) -> Vec<[u8; 20]> {
        self.table.lock().unwrap().keys().copied().collect()
    }
}

#[derive(Default)]
pub struct ActiveUploads {
    table: Mutex<HashMap<[u8; 20], Arc<ActiveUpload>>>,
}

impl ActiveUploads {
    pub fn new() -> Self {
        ActiveUploads::default()
    }

    pub fn insert(&self, entry: Arc<ActiveUpload>) -> Result<(), CoreError> {
        let mut table = self.table.lock().unwrap();
        let infohash = entry.metainfo.infohash;
        if table.contains_key(&infohash) {
            return Err(CoreError::other(format!(
                "torrent {} is already seeding",
                entry.metainfo.infohash_hex()
            )));
        }
        table.insert(infohash, entry);
        Ok(())
    }

    pub fn get(&self, infohash: &[u8; 20]) -> Option<Arc<ActiveUpload>> {
        self.table.lock().unwrap().get(infohash).cloned()
    }

    pub fn remove(&self, infohash: &[u8; 20]) -> Option<Arc<ActiveUpload>> {
        self.table.lock().unwrap().remove(infohash)
    }
}
