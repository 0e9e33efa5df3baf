//! TCP connection management: one peer, established once, never redialed.

use std::io::{self, Write};
use std::net::{Shutdown, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::info;
use socket2::{Domain, Socket, Type};

use crate::error::LinkError;
use crate::packet::Packet;

/// Which end of the cable this instance is. Master accepts the connection,
/// slave dials out; the role never changes once established.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionRole {
    #[default]
    Disabled,
    Master,
    Slave,
}

/// Validates and parses a peer address. The accepted form is deliberately
/// narrow: an IPv4 literal with exactly three dots, one colon, and a port.
pub fn parse_peer_address(addr: &str) -> Result<SocketAddrV4, LinkError> {
    if addr.matches('.').count() != 3 || addr.matches(':').count() != 1 {
        return Err(LinkError::AddressFormat);
    }
    addr.parse().map_err(|_| LinkError::AddressFormat)
}

/// The single peer connection. Cloning shares the underlying socket.
///
/// Writes from the tick loop and from the receiver thread both funnel
/// through one mutex so the fixed 8-byte packet framing can never be torn
/// by interleaved partial writes.
#[derive(Clone)]
pub struct LinkConnection {
    writer: Arc<Mutex<TcpStream>>,
    connected: Arc<AtomicBool>,
    role: ConnectionRole,
}

impl LinkConnection {
    /// Listens on `addr`, accepts exactly one peer, role = Master.
    pub fn bind_and_accept(addr: SocketAddrV4) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1)?;
        let listener: TcpListener = socket.into();
        info!("listening for link peer on {addr}");
        let (stream, peer) = listener.accept()?;
        info!("link peer connected from {peer}");
        Self::from_stream(stream, ConnectionRole::Master)
    }

    /// Dials out to `addr`, role = Slave.
    pub fn connect(addr: SocketAddrV4) -> io::Result<Self> {
        info!("connecting to link peer at {addr}");
        let stream = TcpStream::connect(addr)?;
        info!("connected to link peer");
        Self::from_stream(stream, ConnectionRole::Slave)
    }

    /// Wraps an already-established stream. The protocol exchanges many
    /// sub-millisecond packets, so Nagle coalescing must be off.
    pub fn from_stream(stream: TcpStream, role: ConnectionRole) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(stream)),
            connected: Arc::new(AtomicBool::new(true)),
            role,
        })
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Sends one packet, holding the write lock for the full 8 bytes.
    pub fn send(&self, packet: &Packet) -> io::Result<()> {
        let mut stream = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("link send lock poisoned"))?;
        stream.write_all(&packet.encode())
    }

    /// A separate handle for the receiver's blocking reads, so reads never
    /// contend with the send lock.
    pub fn reader(&self) -> io::Result<TcpStream> {
        let stream = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("link send lock poisoned"))?;
        stream.try_clone()
    }

    /// Shuts the socket down both ways and marks the link closed. Also the
    /// teardown trigger: the receiver's blocking read fails and its loop
    /// exits.
    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
        if let Ok(stream) = self.writer.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
