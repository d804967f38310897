//! One live TCP connection to a peer, running the framed wire protocol
//! from spec §4.3. The same type serves both roles: an outgoing
//! ([`PeerSession::connect`]) leecher session and, via
//! [`PendingPeerSession`], an incoming seeder session.

use crate::bitfield::BitField;
use crate::error::{PeerError, PeerResult};
use crate::peer::handshake::Handshake;
use crate::peer::message::{Message, BLOCK_SIZE};
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

const TOKEN: Token = Token(0);

/// Default read deadline per attempt (spec §4.3: "configurable deadline
/// (default 10 s)").
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bounded retry count before a read failure is surfaced.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Inter-block pacing delay applied by the sender of a chunked `piece`.
const INTER_BLOCK_PACING: Duration = Duration::from_micros(1500);
/// Per-peer send/recv buffer floor, spec §4.4/§5: "set socket send/recv
/// buffers to >= 1 MiB".
const SOCKET_BUFFER_SIZE: usize = 1 << 20;

/// Raises the socket's send/recv buffers to at least [`SOCKET_BUFFER_SIZE`].
/// The kernel is free to cap this lower than requested; we don't treat that
/// as fatal, only the `setsockopt` call itself failing is.
fn configure_buffers(stream: &TcpStream) -> PeerResult<()> {
    let sock = SockRef::from(stream);
    sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE).map_err(PeerError::Transport)?;
    sock.set_send_buffer_size(SOCKET_BUFFER_SIZE).map_err(PeerError::Transport)?;
    Ok(())
}

pub struct PeerSession {
    pub addr: SocketAddr,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub am_choked: bool,
    pub am_interested: bool,
    pub peer_choked: bool,
    pub peer_interested: bool,
    pub bitfield: Option<BitField>,
    stream: TcpStream,
    poll: Poll,
    read_timeout: Duration,
    max_retries: u32,
    max_message_len: u32,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("addr", &self.addr)
            .field("peer_id", &self.peer_id)
            .field("am_choked", &self.am_choked)
            .field("am_interested", &self.am_interested)
            .field("peer_choked", &self.peer_choked)
            .field("peer_interested", &self.peer_interested)
            .finish()
    }
}

impl PeerSession {
    /// Computes a framing cap wide enough for a bitfield message and a
    /// chunked piece block, per spec §4.3: "a length larger than a
    /// configured cap (e.g., piece_size + 32B) must fail".
    pub fn framing_cap(piece_count: usize) -> u32 {
        let bitfield_len = (piece_count + 7) / 8;
        (BLOCK_SIZE.max(bitfield_len) + 64) as u32
    }

    /// Connects outward, performs the handshake, and validates it against
    /// `info_hash` and (if the tracker supplied one) `expected_peer_id`.
    pub fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        my_id: [u8; 20],
        expected_peer_id: Option<[u8; 20]>,
        max_message_len: u32,
    ) -> PeerResult<PeerSession> {
        let stream = TcpStream::connect(addr).map_err(PeerError::Transport)?;
        configure_buffers(&stream)?;
        let poll = Poll::new().map_err(PeerError::Transport)?;
        let mut session = PeerSession {
            addr,
            info_hash,
            peer_id: [0; 20],
            am_choked: true,
            am_interested: false,
            peer_choked: true,
            peer_interested: false,
            bitfield: None,
            stream,
            poll,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            max_message_len,
        };
        session.register()?;

        session.write_all_deadline(&Handshake::new(info_hash, my_id).to_bytes())?;
        let reply = session.read_exact_deadline(crate::peer::handshake::HANDSHAKE_LEN)?;
        let handshake = Handshake::from_bytes(&reply)?;
        if !handshake.matches_infohash(&info_hash) {
            return Err(PeerError::HandshakeMismatch("infohash did not match ours".into()));
        }
        if let Some(expected) = expected_peer_id {
            if !handshake.matches_peer_id(&expected) {
                return Err(PeerError::HandshakeMismatch(
                    "peer id did not match the tracker-advertised id".into(),
                ));
            }
        }
        session.peer_id = handshake.peer_id;
        log::info!("handshake ok with {addr}");
        Ok(session)
    }

    fn register(&mut self) -> PeerResult<()> {
        self.poll
            .registry()
            .register(&mut self.stream, TOKEN, Interest::READABLE | Interest::WRITABLE)
            .map_err(PeerError::Transport)
    }

    fn wait(&mut self, interest: Interest) -> PeerResult<()> {
        self.poll
            .registry()
            .reregister(&mut self.stream, TOKEN, interest)
            .map_err(PeerError::Transport)?;
        let mut events = Events::with_capacity(4);
        self.poll
            .poll(&mut events, Some(self.read_timeout))
            .map_err(PeerError::Transport)?;
        Ok(())
    }

    fn read_exact_deadline(&mut self, len: usize) -> PeerResult<Vec<u8>> {
        let mut buf = BytesMut::zeroed(len);
        let mut filled = 0;
        let mut attempt = 0u32;
        while filled < len {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(PeerError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(PeerError::Timeout { attempts: attempt - 1 });
                    }
                    self.wait(Interest::READABLE)?;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(PeerError::Transport(e));
                    }
                }
            }
        }
        Ok(buf.to_vec())
    }

    fn write_all_deadline(&mut self, data: &[u8]) -> PeerResult<()> {
        let mut written = 0;
        let mut attempt = 0u32;
        while written < data.len() {
            match self.stream.write(&data[written..]) {
                Ok(0) => {
                    return Err(PeerError::Transport(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to peer",
                    )))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(PeerError::Timeout { attempts: attempt - 1 });
                    }
                    self.wait(Interest::WRITABLE)?;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(PeerError::Transport(e));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn send_message(&mut self, message: &Message) -> PeerResult<()> {
        self.write_all_deadline(&message.encode())?;
        log::trace!("sent {message:?} to {}", self.addr);
        Ok(())
    }

    pub fn recv_message(&mut self) -> PeerResult<Message> {
        let len_bytes = self.read_exact_deadline(4)?;
        let len = u32::from_be_bytes(len_bytes.try_into().unwrap());
        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        if len > self.max_message_len {
            return Err(PeerError::Framing(format!(
                "message length {len} exceeds the {} byte cap",
                self.max_message_len
            )));
        }
        let payload = self.read_exact_deadline(len as usize)?;
        let message = Message::decode(payload[0], &payload[1..]).map_err(PeerError::Framing)?;
        log::trace!("received {message:?} from {}", self.addr);
        Ok(message)
    }

    /// Issues a whole-piece request and assembles the chunked reply.
    /// Returns the piece index the peer actually answered with — the
    /// caller is responsible for rejecting a mismatched index per spec §7.
    pub fn request_piece(&mut self, index: u32) -> PeerResult<(u32, Vec<u8>)> {
        self.send_message(&Message::Request(index))?;
        let mut data = Vec::new();
        loop {
            match self.recv_message()? {
                Message::Piece { index: got, is_last, data: chunk } => {
                    data.extend_from_slice(&chunk);
                    if is_last {
                        return Ok((got, data));
                    }
                }
                Message::Choke => self.am_choked = true,
                Message::Unchoke => self.am_choked = false,
                Message::KeepAlive => continue,
                other => {
                    return Err(PeerError::Framing(format!(
                        "unexpected message while awaiting piece {index}: {other:?}"
                    )))
                }
            }
        }
    }

    /// Splits `data` into [`BLOCK_SIZE`] chunks and sends each as a
    /// `piece` message with the per-block last-chunk flag, pacing sends
    /// by [`INTER_BLOCK_PACING`] to bound short-term bursts.
    pub fn serve_piece(&mut self, index: u32, data: &[u8]) -> PeerResult<()> {
        let chunks: Vec<&[u8]> = if data.is_empty() { vec![&[][..]] } else { data.chunks(BLOCK_SIZE).collect() };
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            self.send_message(&Message::Piece { index, is_last: i == last, data: chunk.to_vec() })?;
            thread::sleep(INTER_BLOCK_PACING);
        }
        Ok(())
    }

    pub fn close(&mut self) -> PeerResult<()> {
        match self.stream.shutdown(std::net::Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(PeerError::Transport(e)),
        }
    }
}

/// An accepted incoming connection that has sent its handshake but not yet
/// received ours — the Upload Server must look up the requested infohash
/// against its Active Upload table before committing to a reply.
pub struct PendingPeerSession {
    addr: SocketAddr,
    stream: TcpStream,
    poll: Poll,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    read_timeout: Duration,
    max_retries: u32,
}

impl PendingPeerSession {
    pub fn accept(stream: std::net::TcpStream, addr: SocketAddr) -> PeerResult<PendingPeerSession> {
        stream.set_nonblocking(true).map_err(PeerError::Transport)?;
        let mut stream = TcpStream::from_std(stream);
        configure_buffers(&stream)?;
        let poll = Poll::new().map_err(PeerError::Transport)?;
        poll.registry()
            .register(&mut stream, TOKEN, Interest::READABLE)
            .map_err(PeerError::Transport)?;

        let mut pending = PendingPeerSession {
            addr,
            stream,
            poll,
            info_hash: [0; 20],
            peer_id: [0; 20],
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        };
        let raw = pending.read_exact_deadline(crate::peer::handshake::HANDSHAKE_LEN)?;
        let handshake = Handshake::from_bytes(&raw)?;
        pending.info_hash = handshake.info_hash;
        pending.peer_id = handshake.peer_id;
        Ok(pending)
    }

    fn read_exact_deadline(&mut self, len: usize) -> PeerResult<Vec<u8>> {
        let mut buf = BytesMut::zeroed(len);
        let mut filled = 0;
        let mut attempt = 0u32;
        while filled < len {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(PeerError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(PeerError::Timeout { attempts: attempt - 1 });
                    }
                    let mut events = Events::with_capacity(4);
                    self.poll.poll(&mut events, Some(self.read_timeout)).map_err(PeerError::Transport)?;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(PeerError::Transport(e));
                    }
                }
            }
        }
        Ok(buf.to_vec())
    }

    /// Sends our handshake reply and promotes this connection to a full
    /// session, ready for `sent_unchoke → recv_interested → sent_bitfield`.
    pub fn complete(mut self, my_id: [u8; 20], max_message_len: u32) -> PeerResult<PeerSession> {
        self.poll
            .registry()
            .reregister(&mut self.stream, TOKEN, Interest::READABLE | Interest::WRITABLE)
            .map_err(PeerError::Transport)?;
        let mut session = PeerSession {
            addr: self.addr,
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            am_choked: false,
            am_interested: false,
            peer_choked: true,
            peer_interested: false,
            bitfield: None,
            stream: self.stream,
            poll: self.poll,
            read_timeout: self.read_timeout,
            max_retries: self.max_retries,
            max_message_len,
        };
        session.write_all_deadline(&Handshake::new(self.info_hash, my_id).to_bytes())?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// A synthetic loopback peer that completes the handshake handed to
    /// it and then echoes back whatever it reads, used to exercise
    /// `PeerSession::connect` without a real BitTorrent peer.
    fn spawn_loopback_handshake_peer(info_hash: [u8; 20], peer_id: [u8; 20]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; crate::peer::handshake::HANDSHAKE_LEN];
            stream.read_exact(&mut buf).unwrap();
            let reply = Handshake::new(info_hash, peer_id).to_bytes();
            stream.write_all(&reply).unwrap();
        });
        addr
    }

    #[test]
    fn connect_performs_a_mutual_handshake() {
        let info_hash = [3u8; 20];
        let remote_peer_id = [4u8; 20];
        let addr = spawn_loopback_handshake_peer(info_hash, remote_peer_id);
        let session = PeerSession::connect(addr, info_hash, [5u8; 20], None, 8192).unwrap();
        assert_eq!(session.peer_id, remote_peer_id);
    }

    #[test]
    fn connect_rejects_mismatched_infohash() {
        let advertised = [3u8; 20];
        let wrong = [9u8; 20];
        let addr = spawn_loopback_handshake_peer(wrong, [4u8; 20]);
        let result = PeerSession::connect(addr, advertised, [5u8; 20], None, 8192);
        assert!(matches!(result, Err(PeerError::HandshakeMismatch(_))));
    }
}
