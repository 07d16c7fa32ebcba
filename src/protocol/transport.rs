use std::{
    fmt, fs,
    io::{self, ErrorKind, Read, Write},
    net::{Ipv4Addr, Shutdown, SocketAddrV4, TcpStream},
    os::unix::{fs::FileTypeExt, net::UnixStream},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use thiserror::Error;

use super::{
    atomic::{CancelToken, Transfer, read_full, write_full},
    message::{HEADER_LEN, Message, MessageError},
};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("{}: backend daemon not running? ({source})", .path.display())]
    NotFound { path: PathBuf, source: io::Error },

    #[error("{}: not a unix socket", .path.display())]
    NotSocket { path: PathBuf },

    #[error(
        "connecting unix socket {}: {source}; client should be a member of the backend socket group",
        .path.display()
    )]
    PermissionDenied { path: PathBuf, source: io::Error },

    #[error("invalid IPv4 address '{0}'")]
    InvalidAddress(String),

    #[error("connecting {target}: {source}")]
    Connect { target: String, source: io::Error },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("header too short ({0} bytes)")]
    HeaderTooShort(usize),

    #[error("body too short ({received} of {expected} bytes)")]
    BodyTooShort { expected: usize, received: usize },

    #[error("declared length {0} is shorter than the header")]
    InvalidLength(u32),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("transport io error: {0}")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("transfer cancelled after {0} bytes")]
    Cancelled(usize),

    #[error("socket unexpected close")]
    UnexpectedClose,

    #[error(transparent)]
    Message(#[from] MessageError),
}

impl TransportError {
    /// Whether the channel can carry further messages after this error.
    ///
    /// Only a body that failed to parse leaves the stream in sync.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Message(MessageError::MalformedBody(_))
        )
    }
}

/// Where a backend listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Inet(SocketAddrV4),
}

impl Endpoint {
    pub fn connect(&self) -> Result<Channel, ConnectError> {
        match self {
            Endpoint::Unix(path) => connect_unix(path),
            Endpoint::Inet(addr) => connect_addr(*addr),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Inet(addr) => write!(f, "inet:{addr}"),
        }
    }
}

impl From<PathBuf> for Endpoint {
    fn from(path: PathBuf) -> Self {
        Endpoint::Unix(path)
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Endpoint::Inet(addr)
    }
}

/// A connected, blocking byte stream to a peer.
#[derive(Debug)]
pub enum Channel {
    Unix(UnixStream),
    Inet(TcpStream),
}

impl Channel {
    pub fn try_clone(&self) -> io::Result<Channel> {
        match self {
            Channel::Unix(s) => s.try_clone().map(Channel::Unix),
            Channel::Inet(s) => s.try_clone().map(Channel::Inet),
        }
    }

    /// Shuts down both directions, waking any thread blocked on this socket.
    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Channel::Unix(s) => s.shutdown(Shutdown::Both),
            Channel::Inet(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Channel::Unix(s) => s.read(buf),
            Channel::Inet(s) => s.read(buf),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Channel::Unix(s) => s.write(buf),
            Channel::Inet(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Channel::Unix(s) => s.flush(),
            Channel::Inet(s) => s.flush(),
        }
    }
}

/// Connects to a backend unix socket.
///
/// The path is checked first so a missing daemon or a stray regular file is
/// reported as such rather than as a bare connect failure.
pub fn connect_unix(path: &Path) -> Result<Channel, ConnectError> {
    let meta = fs::metadata(path).map_err(|source| match source.kind() {
        ErrorKind::PermissionDenied => ConnectError::PermissionDenied {
            path: path.to_path_buf(),
            source,
        },
        _ => ConnectError::NotFound {
            path: path.to_path_buf(),
            source,
        },
    })?;
    if !meta.file_type().is_socket() {
        return Err(ConnectError::NotSocket {
            path: path.to_path_buf(),
        });
    }

    debug!("connecting to {}", path.display());
    UnixStream::connect(path)
        .map(Channel::Unix)
        .map_err(|source| match source.kind() {
            ErrorKind::PermissionDenied => ConnectError::PermissionDenied {
                path: path.to_path_buf(),
                source,
            },
            _ => ConnectError::Connect {
                target: path.display().to_string(),
                source,
            },
        })
}

/// Connects to a backend TCP port. `addr` must be a dotted IPv4 address.
pub fn connect_inet(addr: &str, port: u16) -> Result<Channel, ConnectError> {
    let ip: Ipv4Addr = addr
        .parse()
        .map_err(|_| ConnectError::InvalidAddress(addr.to_string()))?;
    connect_addr(SocketAddrV4::new(ip, port))
}

fn connect_addr(addr: SocketAddrV4) -> Result<Channel, ConnectError> {
    debug!("connecting to {addr}");
    TcpStream::connect(addr)
        .map(Channel::Inet)
        .map_err(|source| ConnectError::Connect {
            target: addr.to_string(),
            source,
        })
}

/// Largest single body read; bigger bodies are read in several steps.
pub(crate) const READ_CHUNK: usize = 64 * 1024;

/// Sends and receives whole [`Message`]s over a byte stream.
pub struct ProtocolTransport<T> {
    stream: T,
    cancel: CancelToken,
}

impl<T> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self::with_cancel(stream, CancelToken::new())
    }

    pub fn with_cancel(stream: T, cancel: CancelToken) -> Self {
        Self { stream, cancel }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}

impl<T: Write> ProtocolTransport<T> {
    /// Writes the whole message or fails.
    pub fn send_message(&mut self, msg: &Message) -> Result<(), TransportError> {
        debug!("send msg len={}", msg.total_len());
        msg.dump("send");

        match write_full(&mut self.stream, msg.as_bytes(), &self.cancel)? {
            Transfer::Complete(_) => {}
            Transfer::Eof(sent) => {
                warn!(
                    "peer closed after {sent} of {} bytes: {:?}",
                    msg.total_len(),
                    msg
                );
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    format!("peer closed after {sent} of {} bytes", msg.total_len()),
                )
                .into());
            }
            Transfer::Cancelled(sent) => return Err(TransportError::Cancelled(sent)),
        }
        self.stream.flush()?;
        Ok(())
    }

    /// Sends `data` verbatim as a reply body.
    pub fn send_reply(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let reply = Message::from_body(data)?;
        self.send_message(&reply)
    }
}

impl<T: Read> ProtocolTransport<T> {
    /// Reads one message. `Ok(None)` means the peer closed the stream before
    /// sending anything; the channel cannot be used again.
    pub fn recv_message(&mut self) -> Result<Option<Message>, TransportError> {
        let mut header = [0u8; HEADER_LEN];
        match read_full(&mut self.stream, &mut header, &self.cancel)? {
            Transfer::Complete(_) => {}
            Transfer::Eof(0) => return Ok(None),
            Transfer::Cancelled(0) => return Err(TransportError::Cancelled(0)),
            Transfer::Eof(n) | Transfer::Cancelled(n) => {
                return Err(FramingError::HeaderTooShort(n).into());
            }
        }

        let total = u32::from_be_bytes(header);
        let body_len = (total as usize)
            .checked_sub(HEADER_LEN)
            .ok_or(FramingError::InvalidLength(total))?;
        debug!("rcv msg len={total}");

        // The declared length is untrusted; memory grows with what arrives.
        let mut body = Vec::new();
        while body.len() < body_len {
            let start = body.len();
            let step = (body_len - start).min(READ_CHUNK);
            body.try_reserve_exact(step)
                .map_err(|_| MessageError::Encoding(total as usize))?;
            body.resize(start + step, 0);

            match read_full(&mut self.stream, &mut body[start..], &self.cancel)? {
                Transfer::Complete(_) => {}
                Transfer::Eof(n) | Transfer::Cancelled(n) => {
                    return Err(FramingError::BodyTooShort {
                        expected: body_len,
                        received: start + n,
                    }
                    .into());
                }
            }
        }

        let msg = Message::from_wire(header, body);
        msg.dump("rcv");
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Cursor, Seek},
        net::TcpListener,
        os::unix::net::UnixListener,
        thread,
    };

    use tempdir::TempDir;

    use super::*;
    use crate::protocol::atomic::tests::{Scripted, Step};

    #[test]
    fn read_write_message() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        let msg = Message::encode("<rpc><get-config/></rpc>").unwrap();
        transport.send_message(&msg).unwrap();
        transport.stream.seek(io::SeekFrom::Start(0)).unwrap();

        let received = transport.recv_message().unwrap().unwrap();
        assert_eq!(received, msg);
    }

    #[test]
    fn read_sequence_then_eof() {
        let first = Message::encode("<a/>").unwrap();
        let second = Message::encode("<b/>").unwrap();
        let mut wire = first.as_bytes().to_vec();
        wire.extend_from_slice(second.as_bytes());

        let mut transport = ProtocolTransport::new(Cursor::new(wire));
        assert_eq!(transport.recv_message().unwrap(), Some(first));
        assert_eq!(transport.recv_message().unwrap(), Some(second));
        assert_eq!(transport.recv_message().unwrap(), None);
    }

    #[test]
    fn trickled_message_is_reassembled() {
        let msg = Message::encode("<notification/>").unwrap();
        let mut transport = ProtocolTransport::new(Scripted::new(msg.as_bytes(), &[]));

        assert_eq!(transport.recv_message().unwrap(), Some(msg));
    }

    #[test]
    fn short_header_is_framing_error() {
        let mut transport = ProtocolTransport::new(Cursor::new(vec![0u8, 0]));

        let err = transport.recv_message().unwrap_err();
        assert!(matches!(
            err,
            TransportError::Framing(FramingError::HeaderTooShort(2))
        ));
    }

    #[test]
    fn short_body_is_framing_error() {
        let msg = Message::encode("<rpc/>").unwrap();
        let truncated = msg.as_bytes()[..msg.as_bytes().len() - 2].to_vec();
        let mut transport = ProtocolTransport::new(Cursor::new(truncated));

        let err = transport.recv_message().unwrap_err();
        assert!(matches!(
            err,
            TransportError::Framing(FramingError::BodyTooShort {
                expected: 7,
                received: 5
            })
        ));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn declared_length_below_header_is_rejected() {
        let mut transport = ProtocolTransport::new(Cursor::new(2u32.to_be_bytes().to_vec()));

        let err = transport.recv_message().unwrap_err();
        assert!(matches!(
            err,
            TransportError::Framing(FramingError::InvalidLength(2))
        ));
    }

    #[test]
    fn cancelled_header_read() {
        let cancel = CancelToken::new();
        let stream = Scripted::new(b"\0\0\0\x09", &[Step::Interrupt]).with_cancel(&cancel);
        let mut transport = ProtocolTransport::with_cancel(stream, cancel);

        let err = transport.recv_message().unwrap_err();
        assert!(matches!(err, TransportError::Cancelled(0)));
    }

    #[test]
    fn cancelled_body_read_is_framing_error() {
        let cancel = CancelToken::new();
        let msg = Message::from_body(b"abcdef").unwrap();
        let stream = Scripted::new(msg.as_bytes(), &[Step::Bytes(4), Step::Bytes(2), Step::Interrupt])
            .with_cancel(&cancel);
        let mut transport = ProtocolTransport::with_cancel(stream, cancel);

        let err = transport.recv_message().unwrap_err();
        assert!(matches!(
            err,
            TransportError::Framing(FramingError::BodyTooShort {
                expected: 6,
                received: 2
            })
        ));
    }

    /// Cursor that remembers the largest buffer it was asked to fill.
    struct Watermark {
        inner: Cursor<Vec<u8>>,
        largest: usize,
    }

    impl Read for Watermark {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.largest = self.largest.max(buf.len());
            self.inner.read(buf)
        }
    }

    #[test]
    fn huge_declared_length_is_not_preallocated() {
        let mut wire = 0x4000_0000u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"<rpc/>");
        let mut transport = ProtocolTransport::new(Watermark {
            inner: Cursor::new(wire),
            largest: 0,
        });

        let err = transport.recv_message().unwrap_err();
        assert!(matches!(
            err,
            TransportError::Framing(FramingError::BodyTooShort {
                expected: 0x3fff_fffc,
                received: 6
            })
        ));
        assert!(transport.get_ref().largest <= READ_CHUNK);
    }

    #[test]
    fn body_larger_than_one_chunk() {
        let body = "x".repeat(3 * READ_CHUNK + 17);
        let msg = Message::encode(&format!("<data>{body}</data>")).unwrap();
        let mut transport = ProtocolTransport::new(Cursor::new(msg.as_bytes().to_vec()));

        let received = transport.recv_message().unwrap().unwrap();
        assert_eq!(received, msg);
        assert_eq!(received.decode().unwrap().find_body("data"), Some(body.as_str()));
    }

    #[test]
    fn round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let echo = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut transport = ProtocolTransport::new(stream);
            let msg = transport.recv_message().unwrap().unwrap();
            transport.send_message(&msg).unwrap();
        });

        let channel = connect_inet("127.0.0.1", port).unwrap();
        assert!(matches!(channel, Channel::Inet(_)));
        let mut transport = ProtocolTransport::new(channel);
        let msg = Message::encode("<rpc><get-config/></rpc>").unwrap();
        transport.send_message(&msg).unwrap();

        assert_eq!(transport.recv_message().unwrap(), Some(msg));
        echo.join().unwrap();
    }

    #[test]
    fn send_reply_is_verbatim() {
        let mut transport = ProtocolTransport::new(Vec::new());
        transport.send_reply(b"<ok/>").unwrap();

        let wire = transport.into_inner();
        assert_eq!(&wire[..HEADER_LEN], &9u32.to_be_bytes());
        assert_eq!(&wire[HEADER_LEN..], b"<ok/>");
    }

    #[test]
    fn send_to_closed_peer_fails() {
        let mut transport = ProtocolTransport::new(Scripted::new(&[], &[Step::Bytes(0)]));
        let msg = Message::encode("<rpc/>").unwrap();

        let err = transport.send_message(&msg).unwrap_err();
        assert!(matches!(err, TransportError::Io(ref e) if e.kind() == ErrorKind::WriteZero));
    }

    #[test]
    fn connect_unix_missing_path() {
        let temp = TempDir::new("connect").unwrap();
        let err = connect_unix(&temp.path().join("missing.sock")).unwrap_err();

        assert!(matches!(err, ConnectError::NotFound { .. }));
        assert!(err.to_string().contains("not running"));
    }

    #[test]
    fn connect_unix_regular_file() {
        let temp = TempDir::new("connect").unwrap();
        let path = temp.path().join("plain");
        fs::write(&path, b"not a socket").unwrap();

        let err = connect_unix(&path).unwrap_err();
        assert!(matches!(err, ConnectError::NotSocket { .. }));
    }

    #[test]
    fn connect_unix_listener() {
        let temp = TempDir::new("connect").unwrap();
        let path = temp.path().join("backend.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        let channel = Endpoint::from(path).connect().unwrap();
        assert!(matches!(channel, Channel::Unix(_)));
    }

    #[test]
    fn connect_inet_rejects_bad_address() {
        let err = connect_inet("not-an-address", 4535).unwrap_err();
        assert!(matches!(err, ConnectError::InvalidAddress(_)));
    }

    #[test]
    fn endpoint_display() {
        let unix = Endpoint::Unix(PathBuf::from("/run/backend.sock"));
        let inet = Endpoint::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4535));

        assert_eq!(unix.to_string(), "unix:/run/backend.sock");
        assert_eq!(inet.to_string(), "inet:127.0.0.1:4535");
    }
}
