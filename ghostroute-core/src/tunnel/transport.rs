//! Socket abstraction the tunnel runs over

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

/// Opaque socket identity as supplied by the interception layer
pub type SocketHandle = u64;

/// Result of issuing a non-blocking connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Connected,
    /// The connect is in flight; completion is signalled externally
    Pending,
}

/// Blocking mode and per-call timeouts of a socket
///
/// Captured before the handshake and put back afterwards, so the tunnel hands
/// the application the socket in the mode it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoState {
    pub nonblocking: bool,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

/// A stream socket that can be pointed at the proxy
pub trait ProxyTransport: Read + Write {
    fn handle(&self) -> SocketHandle;

    /// Connect, waiting at most `timeout`
    fn connect(&mut self, addr: SocketAddr, timeout: Duration) -> io::Result<()>;

    /// Issue a connect without waiting for it
    fn start_connect(&mut self, addr: SocketAddr) -> io::Result<ConnectProgress>;

    /// Confirm that a previously pending connect succeeded
    fn finish_connect(&mut self) -> io::Result<()>;

    /// Switch to blocking mode with the given per-call timeouts
    fn set_io_timeouts(&mut self, send: Duration, recv: Duration) -> io::Result<()>;

    /// Current blocking mode and timeouts
    fn io_state(&self) -> io::Result<IoState>;

    /// Put back a state captured by [`io_state`](Self::io_state)
    fn restore_io_state(&mut self, state: &IoState) -> io::Result<()>;
}

/// [`ProxyTransport`] over a `socket2::Socket`
#[derive(Debug)]
pub struct SocketTransport {
    socket: Socket,
    handle: SocketHandle,
}

impl SocketTransport {
    pub fn new(socket: Socket, handle: SocketHandle) -> Self {
        Self { socket, handle }
    }

    /// Open a TCP socket whose family matches `addr`
    pub fn tcp_for(addr: &SocketAddr, handle: SocketHandle) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
        Ok(Self::new(socket, handle))
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn into_socket(self) -> Socket {
        self.socket
    }
}

impl ProxyTransport for SocketTransport {
    fn handle(&self) -> SocketHandle {
        self.handle
    }

    fn connect(&mut self, addr: SocketAddr, timeout: Duration) -> io::Result<()> {
        self.socket.connect_timeout(&SockAddr::from(addr), timeout)
    }

    fn start_connect(&mut self, addr: SocketAddr) -> io::Result<ConnectProgress> {
        self.socket.set_nonblocking(true)?;
        match self.socket.connect(&SockAddr::from(addr)) {
            Ok(()) => Ok(ConnectProgress::Connected),
            Err(e) if connect_in_progress(&e) => Ok(ConnectProgress::Pending),
            Err(e) => Err(e),
        }
    }

    fn finish_connect(&mut self) -> io::Result<()> {
        if let Some(e) = self.socket.take_error()? {
            return Err(e);
        }
        // A socket that is still connecting has no peer yet
        self.socket.peer_addr().map(|_| ())
    }

    fn set_io_timeouts(&mut self, send: Duration, recv: Duration) -> io::Result<()> {
        self.socket.set_nonblocking(false)?;
        self.socket.set_write_timeout(Some(send))?;
        self.socket.set_read_timeout(Some(recv))
    }

    fn io_state(&self) -> io::Result<IoState> {
        Ok(IoState {
            nonblocking: is_nonblocking(&self.socket)?,
            read_timeout: self.socket.read_timeout()?,
            write_timeout: self.socket.write_timeout()?,
        })
    }

    fn restore_io_state(&mut self, state: &IoState) -> io::Result<()> {
        self.socket.set_read_timeout(state.read_timeout)?;
        self.socket.set_write_timeout(state.write_timeout)?;
        self.socket.set_nonblocking(state.nonblocking)
    }
}

impl Read for SocketTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.read(buf)
    }
}

impl Write for SocketTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.socket.flush()
    }
}

#[cfg(unix)]
impl std::os::fd::AsRawFd for SocketTransport {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        std::os::fd::AsRawFd::as_raw_fd(&self.socket)
    }
}

#[cfg(unix)]
fn is_nonblocking(socket: &Socket) -> io::Result<bool> {
    use std::os::fd::AsRawFd;

    // SAFETY: F_GETFL only reads the flags of a descriptor we own
    let flags = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::O_NONBLOCK != 0)
}

// Windows exposes no query for FIONBIO; sockets start out blocking
#[cfg(not(unix))]
fn is_nonblocking(_socket: &Socket) -> io::Result<bool> {
    Ok(false)
}

#[cfg(unix)]
fn connect_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}
