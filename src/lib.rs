pub mod active;
pub mod bencode;
pub mod bitfield;
pub mod coordinator;
pub mod error;
pub mod piece_store;
pub mod torrent;
pub mod upload_server;
pub mod utils;

pub mod tracker {
    pub mod http;
}

pub mod peer {
    pub mod handshake;
    pub mod message;
    pub mod session;
}
