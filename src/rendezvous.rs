//! Out-of-band TCP channel used for the handshake and barriers
//!
//! Every exchange is a symmetric write-then-read of the same number of
//! bytes; both sides call it in the same order, so neither can deadlock as
//! long as the records fit in the socket buffers.

use crate::protocol::Barrier;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info};

/// A connected rendezvous socket
#[derive(Debug)]
pub struct RendezvousChannel {
    stream: TcpStream,
}

impl RendezvousChannel {
    /// Listen on `port` on every interface and accept exactly one peer.
    pub fn listen(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        Self::accept(&listener)
    }

    /// Accept one peer from an already bound listener.
    pub fn accept(listener: &TcpListener) -> io::Result<Self> {
        info!("Waiting for peer on {}", listener.local_addr()?);
        let (stream, peer) = listener.accept()?;
        info!("Accepted rendezvous connection from {}", peer);
        Self::from_stream(stream)
    }

    /// Connect to `host:port`, trying each resolved address in turn.
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    info!("Connected to {}", addr);
                    return Self::from_stream(stream);
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}:{} did not resolve", host, port),
            )
        }))
    }

    fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Send `local` then fill `remote` with the same number of bytes from the peer.
    pub fn exchange(&mut self, local: &[u8], remote: &mut [u8]) -> io::Result<()> {
        if local.len() != remote.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("exchange of {} bytes against {}", local.len(), remote.len()),
            ));
        }
        self.stream.write_all(local)?;
        self.stream.read_exact(remote)?;
        Ok(())
    }

    /// Exchange one barrier byte; the peer must answer with the same byte.
    pub fn sync(&mut self, barrier: Barrier) -> io::Result<()> {
        let mut answer = [0u8; 1];
        self.exchange(&[barrier.as_byte()], &mut answer)?;
        if answer[0] != barrier.as_byte() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "peer desynchronized: expected {}, got {:?}",
                    barrier,
                    answer[0] as char
                ),
            ));
        }
        debug!("Barrier {} passed", barrier);
        Ok(())
    }

    /// Close both directions; a peer that already went away is not an error.
    pub fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}
