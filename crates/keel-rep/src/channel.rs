//! Framed, bidirectional connections between two nodes.
//!
//! A [`Channel`] is split into a [`FrameSender`] and a [`FrameReceiver`] so
//! the two directions can be driven by different threads: the feeder output
//! thread owns the master's sender while the feeder input thread owns its
//! receiver, and symmetrically for the replica.
//!
//! Two transports are provided:
//!
//! - [`memory_channel_pair`]: bounded in-process queues carrying encoded frames
//! - [`TcpChannel`]: frames over a blocking `std::net::TcpStream`
//!
//! Both run every message through the same [`FrameEncoder`] / [`FrameDecoder`],
//! so byte counters and corruption checks behave identically.

use std::fmt::Debug;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::framing::{FrameDecoder, FrameEncoder, FramingError, HEADER_SIZE};
use crate::protocol::WireMessage;
use crate::{RepError, RepResult};

// ============================================================================
// Channel Halves
// ============================================================================

/// Sending half of a connection.
pub trait FrameSender: Send + Debug {
    /// Sends one message and returns the number of bytes written.
    fn send(&mut self, message: &WireMessage) -> RepResult<usize>;

    /// Closes the sending direction. The peer's receiver sees the channel closed.
    fn close(&mut self);
}

/// Receiving half of a connection.
pub trait FrameReceiver: Send + Debug {
    /// Waits up to `timeout` for one message.
    ///
    /// Returns `Ok(None)` on timeout, the message and its size in bytes
    /// otherwise, and [`RepError::ChannelClosed`] once the peer has gone.
    fn recv_timeout(&mut self, timeout: Duration) -> RepResult<Option<(WireMessage, usize)>>;
}

/// A connection to a peer.
#[derive(Debug)]
pub struct Channel {
    /// Human-readable peer description, for logging.
    pub peer: String,
    sender: Box<dyn FrameSender>,
    receiver: Box<dyn FrameReceiver>,
}

impl Channel {
    /// Assembles a channel from its halves.
    pub fn new(
        peer: impl Into<String>,
        sender: Box<dyn FrameSender>,
        receiver: Box<dyn FrameReceiver>,
    ) -> Self {
        Self {
            peer: peer.into(),
            sender,
            receiver,
        }
    }

    /// Sends a message.
    pub fn send(&mut self, message: &WireMessage) -> RepResult<usize> {
        self.sender.send(message)
    }

    /// Receives a message, or `None` on timeout.
    pub fn recv_timeout(&mut self, timeout: Duration) -> RepResult<Option<WireMessage>> {
        Ok(self.receiver.recv_timeout(timeout)?.map(|(message, _)| message))
    }

    /// Receives a message, treating a timeout as an error.
    pub fn recv_within(&mut self, timeout: Duration) -> RepResult<WireMessage> {
        self.recv_timeout(timeout)?.ok_or_else(|| {
            RepError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no message from {} within {timeout:?}", self.peer),
            ))
        })
    }

    /// Closes the sending direction.
    pub fn close(&mut self) {
        self.sender.close();
    }

    /// Splits the channel into its halves.
    pub fn split(self) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>) {
        (self.sender, self.receiver)
    }
}

// ============================================================================
// In-Memory Channels
// ============================================================================

#[derive(Debug)]
struct MemorySender {
    tx: Option<SyncSender<Vec<u8>>>,
    encoder: FrameEncoder,
}

impl FrameSender for MemorySender {
    fn send(&mut self, message: &WireMessage) -> RepResult<usize> {
        let tx = self.tx.as_ref().ok_or(RepError::ChannelClosed)?;
        let frame = self.encoder.encode(message)?;
        let len = frame.len();
        tx.send(frame).map_err(|_| RepError::ChannelClosed)?;
        Ok(len)
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

#[derive(Debug)]
struct MemoryReceiver {
    rx: Receiver<Vec<u8>>,
    decoder: FrameDecoder,
}

impl FrameReceiver for MemoryReceiver {
    fn recv_timeout(&mut self, timeout: Duration) -> RepResult<Option<(WireMessage, usize)>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                let len = frame.len();
                self.decoder.extend(&frame);
                match self.decoder.decode()? {
                    Some(message) => Ok(Some((message, len))),
                    None => Err(RepError::ProtocolViolation(
                        "partial frame on in-memory channel".to_string(),
                    )),
                }
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RepError::ChannelClosed),
        }
    }
}

/// Creates two connected in-memory channel ends.
///
/// Each direction buffers up to `capacity` frames; a full queue blocks the
/// sender until the peer catches up.
pub fn memory_channel_pair(
    capacity: usize,
    a: impl Into<String>,
    b: impl Into<String>,
) -> (Channel, Channel) {
    let (a_tx, b_rx) = mpsc::sync_channel(capacity);
    let (b_tx, a_rx) = mpsc::sync_channel(capacity);

    let a_end = Channel::new(
        b,
        Box::new(MemorySender {
            tx: Some(a_tx),
            encoder: FrameEncoder::new(),
        }),
        Box::new(MemoryReceiver {
            rx: a_rx,
            decoder: FrameDecoder::new(),
        }),
    );
    let b_end = Channel::new(
        a,
        Box::new(MemorySender {
            tx: Some(b_tx),
            encoder: FrameEncoder::new(),
        }),
        Box::new(MemoryReceiver {
            rx: b_rx,
            decoder: FrameDecoder::new(),
        }),
    );
    (a_end, b_end)
}

// ============================================================================
// TCP Channels
// ============================================================================

/// Constructors for channels over TCP.
#[derive(Debug)]
pub struct TcpChannel;

impl TcpChannel {
    /// Connects to `addr` within `timeout`.
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> RepResult<Channel> {
        let mut last_error = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(RepError::Io(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
        })))
    }

    /// Wraps an established stream, for example one returned by `accept`.
    pub fn from_stream(stream: TcpStream) -> RepResult<Channel> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
        let reader = stream.try_clone()?;
        debug!(peer = %peer, "tcp channel established");

        Ok(Channel::new(
            peer,
            Box::new(TcpSender {
                stream,
                encoder: FrameEncoder::new(),
                closed: false,
            }),
            Box::new(TcpReceiver {
                stream: reader,
                decoder: FrameDecoder::new(),
            }),
        ))
    }
}

#[derive(Debug)]
struct TcpSender {
    stream: TcpStream,
    encoder: FrameEncoder,
    closed: bool,
}

impl FrameSender for TcpSender {
    fn send(&mut self, message: &WireMessage) -> RepResult<usize> {
        if self.closed {
            return Err(RepError::ChannelClosed);
        }
        let frame = self.encoder.encode(message)?;
        self.stream.write_all(&frame).map_err(closed_or_io)?;
        self.stream.flush().map_err(closed_or_io)?;
        Ok(frame.len())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            // The peer may already be gone.
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

#[derive(Debug)]
struct TcpReceiver {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl FrameReceiver for TcpReceiver {
    fn recv_timeout(&mut self, timeout: Duration) -> RepResult<Option<(WireMessage, usize)>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;

            match self.decoder.read_message::<_, WireMessage>(&mut self.stream) {
                Ok(Some(message)) => {
                    let size = HEADER_SIZE
                        + bincode::serialized_size(&message)
                            .map_or(0, |n| usize::try_from(n).unwrap_or(usize::MAX));
                    return Ok(Some((message, size)));
                }
                Ok(None) if Instant::now() >= deadline => return Ok(None),
                Ok(None) => {}
                Err(FramingError::Io(e)) => return Err(closed_or_io(e)),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn closed_or_io(e: io::Error) -> RepError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected => RepError::ChannelClosed,
        _ => RepError::Io(e),
    }
}
