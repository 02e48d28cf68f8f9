//! Duplex message channel over a Unix socketpair.
//!
//! Each side owns one half of the pair. Reads append to a byte buffer that is
//! split on the newline delimiter; a trailing partial frame survives until
//! the rest of it arrives, so OS-level splitting and coalescing of the
//! stream never corrupts a message.

use crate::channel::message::{Message, Topic};
use crate::error::Result;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use tracing::trace;

const READ_CHUNK: usize = 8 * 1024;

/// One half of a parent/child communication channel.
#[derive(Debug)]
pub struct Channel {
    stream: Option<UnixStream>,
    read_buf: Vec<u8>,
    queue: VecDeque<Message>,
}

impl Channel {
    /// Create a connected channel pair. The first half conventionally goes to
    /// the child, the second to the parent.
    pub fn pair() -> Result<(Channel, Channel)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Channel::from_stream(a), Channel::from_stream(b)))
    }

    fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream: Some(stream),
            read_buf: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Serialize and write one message, delimiter included, then flush.
    ///
    /// Returns `Ok(false)` without writing if the channel is closed or the
    /// peer is gone; the caller's lifecycle layer deals with dead peers.
    pub fn send(&mut self, message: &Message) -> Result<bool> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(false);
        };
        let mut frame = message.encode()?.into_bytes();
        frame.push(b'\n');

        match stream.write_all(&frame).and_then(|_| stream.flush()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::BrokenPipe || e.kind() == ErrorKind::ConnectionReset => {
                trace!(topic = ?message.topic(), "send dropped, peer closed");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drain the transport and return decoded messages.
    ///
    /// With `wait` the read blocks and drains until the peer closes its half;
    /// without it a non-blocking pass takes whatever bytes are already
    /// available. If `topic` is given, only matching messages are returned
    /// and removed; everything else stays queued for later calls.
    pub fn receive(&mut self, wait: bool, topic: Option<Topic>) -> Result<Vec<Message>> {
        self.fill_from_transport(wait)?;

        match topic {
            None => Ok(self.queue.drain(..).collect()),
            Some(wanted) => {
                let mut matched = Vec::new();
                let mut rest = VecDeque::with_capacity(self.queue.len());
                for message in self.queue.drain(..) {
                    if message.topic() == wanted {
                        matched.push(message);
                    } else {
                        rest.push_back(message);
                    }
                }
                self.queue = rest;
                Ok(matched)
            }
        }
    }

    /// Close the underlying transport exactly once.
    ///
    /// Unless `ignore_pending` is set, a final non-blocking drain runs first
    /// so already-delivered messages are not lost; they remain readable via
    /// [`Channel::receive`] after the close. A second close is a no-op.
    pub fn close(&mut self, ignore_pending: bool) -> Result<()> {
        if self.stream.is_none() {
            return Ok(());
        }
        let drained = if ignore_pending {
            Ok(())
        } else {
            self.fill_from_transport(false)
        };
        self.stream = None;
        self.read_buf.clear();
        drained
    }

    /// Number of decoded messages waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn fill_from_transport(&mut self, wait: bool) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        let mut chunk = [0u8; READ_CHUNK];
        if wait {
            // Blocking drain: used once the peer has exited (or is about to),
            // so EOF terminates the loop.
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => break,
                    Err(e) => return Err(e.into()),
                }
            }
        } else {
            stream.set_nonblocking(true)?;
            let outcome = loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break Ok(()),
                    Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            stream.set_nonblocking(false)?;
            outcome?;
        }

        self.decode_complete_frames()
    }

    /// Split the byte buffer on the delimiter and decode every complete
    /// frame, keeping any trailing fragment for the next read.
    fn decode_complete_frames(&mut self) -> Result<()> {
        while let Some(pos) = self.read_buf.iter().position(|&b| b == b'\n') {
            let frame: Vec<u8> = self.read_buf.drain(..=pos).collect();
            let frame = &frame[..frame.len() - 1];
            if frame.is_empty() {
                continue;
            }
            let message = Message::decode(frame)?;
            trace!(topic = ?message.topic(), pending = self.queue.len(), "frame decoded");
            self.queue.push_back(message);
        }
        Ok(())
    }
}
