//! Duplex control channel from a fork to its server.
//!
//! The [`Connector`] owns the TCP stream. It hands out one
//! [`MessageReceiver`] for the receive thread and a cloneable
//! [`MessageSender`] shared by the main thread and the consumer thread.
//! [`Connector::close`] shuts the socket down in both directions, which also
//! unblocks a receive thread parked in `read`.

use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testfork_common::{ControlMessage, ProtocolError, read_message, write_message};
use thiserror::Error;
use tracing::debug;

/// Errors opening the control channel.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("{host}:{port} resolved to no addresses")]
    NoAddress { host: String, port: u16 },

    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

pub struct Connector {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connector {
    /// Connect to `host:port`, trying each resolved address in turn.
    pub fn open(host: &str, port: u16, timeout: Duration) -> Result<Self, ConnectError> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|source| ConnectError::Resolve {
                host: host.to_string(),
                port,
                source,
            })?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    // Control messages are tiny; don't let Nagle batch them.
                    let _ = stream.set_nodelay(true);
                    debug!("Connected to control server at {}", addr);
                    return Ok(Self { stream, peer: addr });
                }
                Err(source) => last_err = Some(ConnectError::Connect { addr, source }),
            }
        }

        Err(last_err.unwrap_or_else(|| ConnectError::NoAddress {
            host: host.to_string(),
            port,
        }))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn sender(&self) -> std::io::Result<MessageSender> {
        Ok(MessageSender::new(self.stream.try_clone()?))
    }

    pub fn receiver(&self) -> std::io::Result<MessageReceiver> {
        Ok(MessageReceiver {
            reader: BufReader::new(self.stream.try_clone()?),
        })
    }

    /// Release the channel. Safe to call more than once.
    pub fn close(&self) {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => debug!("Control channel to {} closed", self.peer),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {}
            Err(e) => debug!("Shutdown of control channel to {} failed: {}", self.peer, e),
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.close();
    }
}

/// Outbound half; clones share one writer so frames never interleave.
#[derive(Clone)]
pub struct MessageSender {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl MessageSender {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(BufWriter::new(writer)))),
        }
    }

    pub fn send(&self, message: &ControlMessage) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().map_err(|_| {
            ProtocolError::Io(std::io::Error::other("control channel writer poisoned"))
        })?;
        write_message(&mut *writer, message)
    }
}

/// Inbound half, owned by the receive thread.
pub struct MessageReceiver {
    reader: BufReader<TcpStream>,
}

impl MessageReceiver {
    pub fn recv(&mut self) -> Result<Option<ControlMessage>, ProtocolError> {
        read_message(&mut self.reader)
    }
}
