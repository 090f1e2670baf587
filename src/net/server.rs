//! TCP plumbing shared by the login and world servers.
//!
//! Every wire message is a u16 little-endian length followed by that many
//! body bytes. The accept loop hands each connection to a session closure on
//! its own thread; outbound packets go through a per-connection writer
//! thread so sends stay ordered and never block the engine.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error};

/// Largest frame body accepted from a client. Anything bigger is a protocol
/// error and closes the connection.
pub const MAX_FRAME_LEN: usize = 0xffff;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame length is zero")]
    EmptyFrame,
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    Oversized(usize),
    #[error("connection closed mid-frame")]
    Truncated,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Shared stop flag flipped by the signal handler; accept loops poll it.
#[derive(Debug, Default)]
pub struct ServerControl {
    stopped: AtomicBool,
}

impl ServerControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Reads one `LEN:u16 | BODY[LEN]` frame. `Ok(None)` means the peer closed
/// the connection cleanly between frames.
pub fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, FrameError> {
    let mut header = [0u8; 2];
    let mut filled = 0;
    while filled < header.len() {
        match stream.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(FrameError::Truncated),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    let len = u16::from_le_bytes(header) as usize;
    if len == 0 {
        return Err(FrameError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(len));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).map_err(|err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(err)
        }
    })?;
    Ok(Some(body))
}

/// Writes the length prefix and body in one buffer so partial frames never
/// hit the socket.
pub fn write_frame(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    debug_assert!(body.len() <= MAX_FRAME_LEN);
    let mut buffer = Vec::with_capacity(2 + body.len());
    buffer.extend_from_slice(&(body.len() as u16).to_le_bytes());
    buffer.extend_from_slice(body);
    stream.write_all(&buffer)?;
    stream.flush()
}

enum WriterCommand {
    Packet(Vec<u8>),
    Close,
}

/// Handle for pushing outbound packets to one connection. Clones share the
/// writer queue and the connected flag; once the flag drops every send is a
/// no-op, which lets engine-side notifications outlive the socket safely.
#[derive(Clone)]
pub struct PacketSink {
    id: ConnectionId,
    tx: Sender<WriterCommand>,
    connected: Arc<AtomicBool>,
    stream: Arc<TcpStream>,
}

impl PacketSink {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn send(&self, body: Vec<u8>) {
        if !self.is_connected() {
            return;
        }
        if self.tx.send(WriterCommand::Packet(body)).is_err() {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Closes after flushing queued packets, or immediately when `force` is
    /// set (queued packets are dropped on the floor). The writer thread is
    /// told to stop either way.
    pub fn close(&self, force: bool) {
        self.connected.store(false, Ordering::SeqCst);
        if force {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
        let _ = self.tx.send(WriterCommand::Close);
    }
}

/// Splits a connection into a sink plus the writer thread feeding it.
pub fn start_connection_writer(
    id: ConnectionId,
    stream: &TcpStream,
) -> std::io::Result<(PacketSink, thread::JoinHandle<()>)> {
    let writer_stream = stream.try_clone()?;
    let shutdown_handle = Arc::new(stream.try_clone()?);
    let (tx, rx) = mpsc::channel();
    let connected = Arc::new(AtomicBool::new(true));

    let sink = PacketSink {
        id,
        tx,
        connected: Arc::clone(&connected),
        stream: shutdown_handle,
    };
    let handle = thread::spawn(move || {
        run_connection_writer(id, writer_stream, rx, connected);
    });
    Ok((sink, handle))
}

fn run_connection_writer(
    id: ConnectionId,
    mut stream: TcpStream,
    rx: Receiver<WriterCommand>,
    connected: Arc<AtomicBool>,
) {
    while let Ok(command) = rx.recv() {
        match command {
            WriterCommand::Packet(body) => {
                if let Err(err) = write_frame(&mut stream, &body) {
                    debug!(connection = %id, "write failed: {}", err);
                    break;
                }
            }
            WriterCommand::Close => break,
        }
    }
    connected.store(false, Ordering::SeqCst);
    let _ = stream.shutdown(Shutdown::Both);
}

/// Accepts connections until the control flag stops, handing each one to
/// `on_connection` on a fresh thread with a monotonically assigned id.
pub fn run_acceptor<F>(
    listener: TcpListener,
    control: &Arc<ServerControl>,
    on_connection: F,
) -> std::io::Result<()>
where
    F: Fn(ConnectionId, TcpStream) + Send + Sync + 'static,
{
    listener.set_nonblocking(true)?;
    let on_connection = Arc::new(on_connection);

    while control.is_running() {
        match listener.accept() {
            Ok((stream, addr)) => {
                let id = next_connection_id();
                debug!(connection = %id, peer = %addr, "connected");
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(connection = %id, "nodelay failed: {}", err);
                }
                let on_connection = Arc::clone(&on_connection);
                thread::spawn(move || {
                    on_connection(id, stream);
                    debug!(connection = %id, "disconnected");
                });
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                error!("accept error: {}", err);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn frame_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, server)
    }

    #[test]
    fn frame_roundtrip() {
        let (mut client, mut server) = frame_pair();
        write_frame(&mut client, &[0x0a, 0x14, 0x64]).expect("write");
        let body = read_frame(&mut server).expect("read").expect("frame");
        assert_eq!(body, vec![0x0a, 0x14, 0x64]);
    }

    #[test]
    fn zero_length_frame_is_an_error() {
        let (mut client, mut server) = frame_pair();
        client.write_all(&[0x00, 0x00]).expect("write");
        assert!(matches!(read_frame(&mut server), Err(FrameError::EmptyFrame)));
    }

    #[test]
    fn clean_close_between_frames_yields_none() {
        let (client, mut server) = frame_pair();
        drop(client);
        assert!(read_frame(&mut server).expect("read").is_none());
    }

    #[test]
    fn close_mid_frame_is_truncated() {
        let (mut client, mut server) = frame_pair();
        client.write_all(&[0x10, 0x00, 0x01]).expect("write");
        drop(client);
        assert!(matches!(read_frame(&mut server), Err(FrameError::Truncated)));
    }

    #[test]
    fn sink_sends_are_ordered_and_framed() {
        let (client, mut server) = frame_pair();
        let (sink, handle) = start_connection_writer(ConnectionId(7), &client).expect("writer");
        sink.send(vec![0x01]);
        sink.send(vec![0x02, 0x03]);
        sink.close(false);
        handle.join().expect("join");

        assert_eq!(read_frame(&mut server).expect("read").expect("frame"), vec![0x01]);
        assert_eq!(
            read_frame(&mut server).expect("read").expect("frame"),
            vec![0x02, 0x03]
        );
        assert!(read_frame(&mut server).expect("read").is_none());
        assert!(!sink.is_connected());
    }

    #[test]
    fn sends_after_close_are_dropped() {
        let (client, mut server) = frame_pair();
        let (sink, handle) = start_connection_writer(ConnectionId(8), &client).expect("writer");
        sink.close(true);
        sink.send(vec![0xff]);
        handle.join().expect("join");
        assert!(read_frame(&mut server).expect("read").is_none());
    }
}
