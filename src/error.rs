//! Typed error taxonomy for the swarm core, grouped per spec §7.
//!
//! `PeerError` covers everything that can go wrong on one peer
//! connection. `CoreError` is the superset surfaced by the pieces that
//! sit above a single connection (piece store, coordinator, tracker
//! client). `main.rs` converts both into `anyhow::Error` at the
//! process boundary.

use crate::bencode::BencodeError;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("read deadline expired after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error("framing error: {0}")]
    Framing(String),

    #[error("handshake mismatch: {0}")]
    HandshakeMismatch(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("piece {index} failed SHA-1 verification")]
    VerificationFailure { index: usize },

    #[error("piece {index} already present")]
    DuplicatePiece { index: usize },

    #[error("tracker announce failed: {0}")]
    AnnounceFailure(String),

    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    pub fn other(msg: impl fmt::Display) -> Self {
        CoreError::Other(msg.to_string())
    }
}

pub type PeerResult<T> = Result<T, PeerError>;
pub type CoreResult<T> = Result<T, CoreError>;
