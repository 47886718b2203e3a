//! Wire transport abstraction.
//!
//! The bridge treats inbound traffic as already-parsed [`Response`] values;
//! framing and the raw socket belong here. The production transport speaks
//! newline-delimited JSON over TCP.

use crate::error::Error;
use crate::protocol::Response;
use log::debug;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

/// One half of a message channel to the target.
pub trait Transport: Send {
    /// Transmit a single already-serialized message.
    fn send_message(&mut self, message: &str) -> Result<(), Error>;

    /// Block until the next inbound message is available and parse it.
    fn read_message(&mut self) -> Result<Response, Error>;

    /// Close the underlying channel. Any blocked reader observes EOF.
    fn disconnect(&mut self) -> Result<(), Error>;
}

/// Newline-delimited JSON over a TCP socket.
pub struct TcpTransport {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpTransport {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, Error> {
        Self::new(TcpStream::connect(addr)?)
    }

    pub fn new(stream: TcpStream) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }

    /// A second handle over the same socket, typically handed to the dispatch
    /// loop while this one keeps serving writers.
    pub fn try_clone(&self) -> Result<Self, Error> {
        Self::new(self.stream.try_clone()?)
    }
}

impl Transport for TcpTransport {
    fn send_message(&mut self, message: &str) -> Result<(), Error> {
        self.stream.write_all(message.as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_message(&mut self) -> Result<Response, Error> {
        loop {
            let mut line = String::new();
            let read_n = self.reader.read_line(&mut line)?;
            if read_n == 0 {
                return Err(Error::ConnectionClosed);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }
            debug!(target: "transport", "<- {line}");
            return Ok(serde_json::from_str(line)?);
        }
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        debug!(target: "transport", "shutting down connection to target");
        self.stream.shutdown(Shutdown::Both)?;
        Ok(())
    }
}
