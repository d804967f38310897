//! Listens on a single TCP port for the life of the process and spawns
//! a [`PeerSession`] per incoming connection, serving piece requests
//! read-only from the matching Active Upload. Spec §4.5.

use crate::active::ActiveUploads;
use crate::error::{CoreError, CoreResult, PeerError};
use crate::peer::message::Message;
use crate::peer::session::{PeerSession, PendingPeerSession};
use mio::net::TcpListener as MioTcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const LISTENER_TOKEN: Token = Token(0);
/// How often the accept loop comes up for air to check the stop signal.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct UploadServer {
    my_id: [u8; 20],
    uploads: Arc<ActiveUploads>,
}

impl UploadServer {
    pub fn new(my_id: [u8; 20], uploads: Arc<ActiveUploads>) -> UploadServer {
        UploadServer { my_id, uploads }
    }

    /// Runs the accept loop until `stop` fires. Every connection gets its
    /// own detached thread; `run` joins them all before returning, so the
    /// documented stop order (signal listener, join sessions) holds.
    pub fn run(&self, addr: SocketAddr, stop: crossbeam::channel::Receiver<()>) -> CoreResult<()> {
        let mut listener = MioTcpListener::bind(addr).map_err(CoreError::IOError)?;
        let mut poll = Poll::new().map_err(CoreError::IOError)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(CoreError::IOError)?;
        let mut events = Events::with_capacity(64);
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        log::info!("upload server listening on {addr}");
        'accept: loop {
            if stop.try_recv().is_ok() {
                break;
            }
            poll.poll(&mut events, Some(ACCEPT_POLL_INTERVAL)).map_err(CoreError::IOError)?;
            for event in events.iter() {
                if event.token() != LISTENER_TOKEN {
                    continue;
                }
                loop {
                    if stop.try_recv().is_ok() {
                        break 'accept;
                    }
                    match listener.accept() {
                        Ok((stream, peer_addr)) => {
                            let my_id = self.my_id;
                            let uploads = self.uploads.clone();
                            handles.push(thread::spawn(move || {
                                if let Err(e) = serve_connection(stream, peer_addr, my_id, &uploads) {
                                    log::debug!("upload session with {peer_addr} ended: {e}");
                                }
                            }));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                            break;
                        }
                    }
                }
            }
        }

        log::info!("upload server stopping, joining {} session(s)", handles.len());
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn serve_connection(
    stream: mio::net::TcpStream,
    addr: SocketAddr,
    my_id: [u8; 20],
    uploads: &ActiveUploads,
) -> CoreResult<()> {
    let raw = into_std(stream)?;
    let pending = PendingPeerSession::accept(raw, addr)?;
    let entry = uploads
        .get(&pending.info_hash)
        .ok_or_else(|| CoreError::other(format!("no active upload for requested infohash from {addr}")))?;

    let max_message_len = PeerSession::framing_cap(entry.metainfo.piece_count());
    let mut session = pending.complete(my_id, max_message_len)?;
    log::info!("accepted {addr} for torrent {}", entry.metainfo.infohash_hex());

    session.send_message(&Message::Unchoke)?;
    session.peer_choked = false;
    wait_for_interested(&mut session)?;
    session.send_message(&Message::Bitfield(entry.store.snapshot_bitfield()))?;
    entry.peers_serving.fetch_add(1, Ordering::SeqCst);

    let result = serve_requests(&mut session, &entry);
    entry.peers_serving.fetch_sub(1, Ordering::SeqCst);
    let _ = session.close();
    result
}

/// Blocks until the peer sends `Interested`, per spec §4.3's incoming
/// state machine `sent_unchoke → recv_interested → sent_bitfield`.
/// Keep-alives and other out-of-order messages are tolerated, not fatal.
fn wait_for_interested(session: &mut PeerSession) -> CoreResult<()> {
    loop {
        match session.recv_message() {
            Ok(Message::Interested) => {
                session.peer_interested = true;
                return Ok(());
            }
            Ok(Message::KeepAlive) => continue,
            Ok(other) => {
                log::trace!("ignoring {other:?} from {} while awaiting interested", session.addr);
            }
            Err(e) => return Err(CoreError::Peer(e)),
        }
    }
}

fn serve_requests(session: &mut PeerSession, entry: &crate::active::ActiveUpload) -> CoreResult<()> {
    loop {
        match session.recv_message() {
            Ok(Message::Request(index)) => match entry.store.get_piece_data(index as usize) {
                Some(data) => {
                    session.serve_piece(index, &data)?;
                    entry.bytes_uploaded.fetch_add(data.len() as u64, Ordering::SeqCst);
                }
                None => {
                    return Err(CoreError::other(format!("peer requested unknown piece {index}")));
                }
            },
            Ok(Message::Interested) => session.peer_interested = true,
            Ok(Message::NotInterested) => session.peer_interested = false,
            Ok(Message::KeepAlive) | Ok(Message::Unknown(_, _)) => continue,
            Ok(other) => log::trace!("ignoring {other:?} from {}", session.addr),
            Err(PeerError::Timeout { .. }) | Err(PeerError::Transport(_)) => return Ok(()),
            Err(e) => return Err(CoreError::Peer(e)),
        }
    }
}

fn into_std(stream: mio::net::TcpStream) -> CoreResult<std::net::TcpStream> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{FromRawFd, IntoRawFd};
        Ok(unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) })
    }
    #[cfg(windows)]
    {
        use std::os::windows::io::{FromRawSocket, IntoRawSocket};
        Ok(unsafe { std::net::TcpStream::from_raw_socket(stream.into_raw_socket()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Value;
    use crate::peer::handshake::Handshake;
    use crate::piece_store::PieceStore;
    use crate::torrent::Metainfo;
    use sha1::{Digest, Sha1};
    use std::collections::BTreeMap;
    use std::net::TcpStream;
    use std::time::Duration;

    fn single_file_metainfo(content: &[u8], piece_size: u64) -> Metainfo {
        let mut pieces = Vec::new();
        for chunk in content.chunks(piece_size as usize) {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            pieces.extend_from_slice(&hasher.finalize());
        }
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Value::Int(content.len() as i64));
        info.insert(b"name".to_vec(), Value::Bytes(b"payload.bin".to_vec()));
        info.insert(b"piece length".to_vec(), Value::Int(piece_size as i64));
        info.insert(b"pieces".to_vec(), Value::Bytes(pieces));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        Metainfo::from_bytes(&Value::Dict(root).encode()).unwrap()
    }

    #[test]
    fn serves_a_whole_piece_to_a_connecting_leecher() {
        let content: Vec<u8> = (0u8..=255).cycle().take(1024).collect();
        let metainfo = single_file_metainfo(&content, 256);
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("payload.bin");
        std::fs::write(&source_path, &content).unwrap();
        let store = Arc::new(PieceStore::from_existing_file(metainfo.clone(), &source_path).unwrap());

        let uploads = Arc::new(ActiveUploads::new());
        uploads
            .insert(Arc::new(crate::active::ActiveUpload::new(metainfo.clone(), store)))
            .unwrap();

        let server = UploadServer::new([1u8; 20], uploads);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = std::net::TcpListener::bind(addr).unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);

        let (stop_tx, stop_rx) = crossbeam::channel::bounded(1);
        let server_handle = thread::spawn(move || server.run(bound, stop_rx));

        thread::sleep(Duration::from_millis(100));
        let mut stream = TcpStream::connect(bound).unwrap();
        stream.write_all(&Handshake::new(metainfo.infohash, [2u8; 20]).to_bytes()).unwrap();

        use std::io::{Read, Write};
        let mut reply = [0u8; crate::peer::handshake::HANDSHAKE_LEN];
        stream.read_exact(&mut reply).unwrap();
        let handshake = Handshake::from_bytes(&reply).unwrap();
        assert_eq!(handshake.info_hash, metainfo.infohash);

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).unwrap();
        let len = u32::from_be_bytes(len_buf);
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).unwrap();
        assert_eq!(Message::decode(body[0], &body[1..]).unwrap(), Message::Unchoke);

        // The server must not send its bitfield until we declare interest.
        stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let waited = stream.read_exact(&mut len_buf).is_err();
        assert!(waited, "server sent the bitfield before receiving Interested");

        stream.write_all(&Message::Interested.encode()).unwrap();
        stream.set_read_timeout(None).unwrap();

        stream.read_exact(&mut len_buf).unwrap();
        let len = u32::from_be_bytes(len_buf);
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).unwrap();
        assert!(matches!(Message::decode(body[0], &body[1..]).unwrap(), Message::Bitfield(_)));

        stream.write_all(&Message::Request(0).encode()).unwrap();

        let mut collected = Vec::new();
        loop {
            stream.read_exact(&mut len_buf).unwrap();
            let len = u32::from_be_bytes(len_buf);
            let mut body = vec![0u8; len as usize];
            stream.read_exact(&mut body).unwrap();
            let Message::Piece { is_last, data, .. } = Message::decode(body[0], &body[1..]).unwrap() else {
                panic!("expected a piece message")
            };
            collected.extend_from_slice(&data);
            if is_last {
                break;
            }
        }
        assert_eq!(collected, content[0..256]);

        drop(stream);
        let _ = stop_tx.send(());
        let _ = server_handle.join();
    }
}
