//! Transport handles stored in the registry

use parking_lot::Mutex;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;

/// Write side of an accepted connection
///
/// Replies from the commander and broadcasts from the fan-out consumer
/// share one socket, so every write goes through the mutex and a line is
/// never interleaved with another. Shutdown uses a separate handle and
/// does not wait for an in-flight write.
#[derive(Debug)]
pub struct PeerSocket {
    writer: Mutex<TcpStream>,
    control: TcpStream,
    peer: Option<SocketAddr>,
}

impl PeerSocket {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let control = stream.try_clone()?;
        let peer = stream.peer_addr().ok();
        Ok(Self {
            writer: Mutex::new(stream),
            control,
            peer,
        })
    }

    /// Write `text` in full
    pub fn send(&self, text: &str) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(text.as_bytes())?;
        writer.flush()
    }

    /// Close both directions; the peer's commander sees EOF and exits
    pub fn shutdown(&self) {
        if let Err(e) = self.control.shutdown(Shutdown::Both)
            && e.kind() != io::ErrorKind::NotConnected
        {
            log::debug!("Socket shutdown for {:?} failed: {}", self.peer, e);
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// How the broker reaches a client
#[derive(Debug, Clone)]
pub enum Transport {
    /// Accepted TCP connection
    Socket(Arc<PeerSocket>),
    /// In-process device registered at startup
    Local,
}

impl Transport {
    pub fn socket(&self) -> Option<&Arc<PeerSocket>> {
        match self {
            Transport::Socket(socket) => Some(socket),
            Transport::Local => None,
        }
    }

    pub fn shutdown(&self) {
        if let Transport::Socket(socket) = self {
            socket.shutdown();
        }
    }
}
