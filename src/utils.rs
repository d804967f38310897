//! Client identity. Spec §6 requires a 20-ASCII-byte `peer_id` in every
//! tracker query; an Azureus-style prefix keeps it human-readable in logs.

use rand::Rng;

const CLIENT_PREFIX: &[u8] = b"-SC0001-";
const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..CLIENT_PREFIX.len()].copy_from_slice(CLIENT_PREFIX);
    let mut rng = rand::thread_rng();
    for slot in &mut peer_id[CLIENT_PREFIX.len()..] {
        *slot = ALPHANUMERIC[rng.gen_range(0..ALPHANUMERIC.len())];
    }
    peer_id
}
