// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The persistent protocol: a sequenced, replay-capable message layer on
//! top of a [`RemoteSocket`](crate::socket::RemoteSocket).
//!
//! Every message carries a 13-byte big-endian header
//! `type:u8, id:u32, ack:u32, len:u32` followed by `len` payload bytes.
//! *Regular* messages are numbered with a monotonically increasing
//! sequence and kept in an outgoing buffer until the peer acknowledges
//! them; *control* messages are unsequenced and never replayed. When a
//! client reconnects, the underlying socket is swapped in place and all
//! unacknowledged regular messages are replayed on the new socket, which
//! together with duplicate filtering on the receive side gives
//! exactly-once effective delivery across reconnections.

use crate::socket::{self, RemoteSocket};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Size of the fixed message header.
const HEADER_SIZE: usize = 13;

/// Upper bound on a single message payload.
const MAX_MESSAGE_SIZE: u32 = 256 * 1024 * 1024;

/// Default upper bound on buffered unacknowledged bytes. A peer that
/// does not acknowledge this much data is considered gone for good.
const MAX_UNACKED_BYTES: usize = 16 * 1024 * 1024;

// Message types //////////////////////////////////////////////////////////////////////////////////

const MSG_REGULAR: u8 = 1;
const MSG_CONTROL: u8 = 2;
const MSG_ACK: u8 = 3;
const MSG_DISCONNECT: u8 = 5;
const MSG_KEEP_ALIVE: u8 = 9;

/// A message delivered by [`PersistentProtocol::read_message`].
#[derive(Debug)]
pub enum Message {
    /// A sequenced application message.
    Regular(BytesMut),
    /// An out-of-band control message (handshake traffic).
    Control(BytesMut),
    /// The peer sent an explicit disconnect.
    Disconnect,
    /// The socket is gone (EOF or I/O error); the session may live on
    /// and accept a reconnection.
    Closed
}

// Protocol ///////////////////////////////////////////////////////////////////////////////////////

/// One end of a persistent-protocol connection.
#[derive(Debug)]
pub struct PersistentProtocol<T> {
    socket: RemoteSocket<T>,
    socket_alive: bool,
    /// Decoded bytes not yet parsed into messages.
    incoming: BytesMut,
    /// Highest regular sequence delivered to the application.
    last_delivered: u32,
    /// Sequence of the most recently sent regular message.
    out_seq: u32,
    /// Encoded regular messages awaiting acknowledgement.
    unacked: VecDeque<Unacked>,
    unacked_bytes: usize,
    max_unacked_bytes: usize,
    /// A delivery happened and the peer has not been sent a bare ack yet.
    pending_ack: bool
}

#[derive(Debug)]
struct Unacked {
    id: u32,
    bytes: Vec<u8>
}

impl<T: AsyncRead + AsyncWrite + Unpin> PersistentProtocol<T> {
    /// Create a protocol over a freshly established socket.
    pub fn new(socket: RemoteSocket<T>) -> Self {
        PersistentProtocol {
            socket,
            socket_alive: true,
            incoming: BytesMut::new(),
            last_delivered: 0,
            out_seq: 0,
            unacked: VecDeque::new(),
            unacked_bytes: 0,
            max_unacked_bytes: MAX_UNACKED_BYTES,
            pending_ack: false
        }
    }

    /// Override the unacknowledged-bytes bound.
    pub fn set_max_unacked_bytes(&mut self, max: usize) -> &mut Self {
        self.max_unacked_bytes = max;
        self
    }

    /// Is the current socket still usable?
    pub fn is_alive(&self) -> bool {
        self.socket_alive
    }

    /// Number of regular messages awaiting acknowledgement.
    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// Whether the underlying socket skips websocket framing.
    pub fn skip_frames(&self) -> bool {
        self.socket.skip_frames()
    }

    /// Receive the next message.
    ///
    /// Acknowledgements and keep-alives are consumed internally. A dead
    /// socket yields [`Message::Closed`]; the protocol stays usable for
    /// a later [`PersistentProtocol::begin_accept_reconnection`].
    ///
    /// Cancel safe: a delivered message is returned without awaiting, so
    /// dropping the future between polls never loses one.
    pub async fn read_message(&mut self) -> Result<Message, Error> {
        loop {
            if self.pending_ack {
                // Bare ack for the previous delivery, unless an outbound
                // message has acked it in the meantime.
                self.write_header(MSG_ACK, 0, &[]).await;
                self.pending_ack = false
            }
            match self.parse_one()? {
                Some(Parsed::Deliver(msg)) => {
                    if matches!(msg, Message::Regular(_)) {
                        self.pending_ack = true
                    }
                    return Ok(msg)
                }
                Some(Parsed::Skip) => continue,
                None => ()
            }
            if !self.socket_alive {
                return Ok(Message::Closed)
            }
            match self.socket.receive(&mut self.incoming).await {
                Ok(0) => {
                    log::debug!("socket closed while reading");
                    self.socket_alive = false;
                    return Ok(Message::Closed)
                }
                Ok(_) => (),
                Err(e) => {
                    log::debug!("socket failed while reading: {}", e);
                    self.socket_alive = false;
                    return Ok(Message::Closed)
                }
            }
        }
    }

    /// Send a regular (sequenced, replayable) message.
    ///
    /// If the socket is currently dead the message is buffered and will
    /// be replayed after a reconnect. Exceeding the unacknowledged-bytes
    /// bound is fatal for the session.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        self.out_seq += 1;
        let msg = encode(MSG_REGULAR, self.out_seq, self.last_delivered, data);
        self.unacked_bytes += msg.len();
        self.unacked.push_back(Unacked { id: self.out_seq, bytes: msg });
        if self.unacked_bytes > self.max_unacked_bytes {
            return Err(Error::Overflow { buffered: self.unacked_bytes, maximum: self.max_unacked_bytes })
        }
        if self.socket_alive {
            // The bytes were buffered above; a write failure only marks
            // the socket dead.
            let bytes = self.unacked.back().map(|u| u.bytes.clone()).unwrap_or_default();
            if let Err(e) = self.socket.send(&bytes).await {
                log::debug!("socket failed while writing: {}", e);
                self.socket_alive = false
            }
        }
        Ok(())
    }

    /// Send an out-of-band control message. Not replayed on reconnect.
    pub async fn send_control(&mut self, data: &[u8]) -> Result<(), Error> {
        self.write_header(MSG_CONTROL, 0, data).await;
        Ok(())
    }

    /// Tell the peer this session is going away for good.
    pub async fn send_disconnect(&mut self) {
        self.write_header(MSG_DISCONNECT, 0, &[]).await
    }

    /// Heartbeat, sent when a session is idle.
    pub async fn send_keep_alive(&mut self) {
        self.write_header(MSG_KEEP_ALIVE, 0, &[]).await
    }

    /// Await the drain of pending socket writes.
    pub async fn drain(&mut self) -> Result<(), Error> {
        if self.socket_alive {
            self.socket.drain().await?
        }
        Ok(())
    }

    /// Drain all decoded-but-undelivered incoming bytes.
    ///
    /// Used to transfer residual protocol state to another process or
    /// protocol instance.
    pub fn read_entire_buffer(&mut self) -> BytesMut {
        std::mem::take(&mut self.incoming)
    }

    /// Dissolve into the underlying socket.
    pub fn into_socket(self) -> RemoteSocket<T> {
        self.socket
    }

    /// Swap in a freshly handshaken socket, feeding `residual` as if it
    /// had been received on it. Sequence state and the unacknowledged
    /// buffer are preserved; call
    /// [`PersistentProtocol::end_accept_reconnection`] to replay.
    pub fn begin_accept_reconnection(&mut self, socket: RemoteSocket<T>, residual: &[u8]) {
        self.socket = socket;
        self.socket_alive = true;
        self.incoming.extend_from_slice(residual)
    }

    /// Replay all unacknowledged regular messages on the new socket.
    pub async fn end_accept_reconnection(&mut self) -> Result<(), Error> {
        log::debug!("replaying {} unacknowledged messages", self.unacked.len());
        for i in 0 .. self.unacked.len() {
            let bytes = self.unacked[i].bytes.clone();
            if let Err(e) = self.socket.send(&bytes).await {
                log::debug!("socket failed during replay: {}", e);
                self.socket_alive = false;
                return Ok(())
            }
        }
        self.socket.drain().await?;
        Ok(())
    }

    // Write a payload-carrying header directly to the socket, bypassing
    // the replay buffer. Failures only mark the socket dead: callers of
    // the control path treat socket loss like any other disconnect.
    async fn write_header(&mut self, msg_type: u8, id: u32, data: &[u8]) {
        if !self.socket_alive {
            log::debug!("dropping message type {} on dead socket", msg_type);
            return
        }
        let msg = encode(msg_type, id, self.last_delivered, data);
        if let Err(e) = self.socket.send(&msg).await {
            log::debug!("socket failed while writing: {}", e);
            self.socket_alive = false
        }
    }

    // Parse one message out of `incoming`, if complete.
    fn parse_one(&mut self) -> Result<Option<Parsed>, Error> {
        if self.incoming.len() < HEADER_SIZE {
            return Ok(None)
        }
        let msg_type = self.incoming[0];
        let id = u32::from_be_bytes([self.incoming[1], self.incoming[2], self.incoming[3], self.incoming[4]]);
        let ack = u32::from_be_bytes([self.incoming[5], self.incoming[6], self.incoming[7], self.incoming[8]]);
        let len = u32::from_be_bytes([self.incoming[9], self.incoming[10], self.incoming[11], self.incoming[12]]);

        if len > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge { actual: len, maximum: MAX_MESSAGE_SIZE })
        }
        if self.incoming.len() < HEADER_SIZE + len as usize {
            return Ok(None)
        }

        self.incoming.advance(HEADER_SIZE);
        let payload = self.incoming.split_to(len as usize);

        // Acknowledgements piggyback on every message type.
        self.process_ack(ack);

        match msg_type {
            MSG_REGULAR => {
                if id <= self.last_delivered {
                    // Duplicate from a replay after reconnect.
                    log::trace!("dropping replayed message {} (delivered up to {})", id, self.last_delivered);
                    return Ok(Some(Parsed::Skip))
                }
                self.last_delivered = id;
                Ok(Some(Parsed::Deliver(Message::Regular(payload))))
            }
            MSG_CONTROL => Ok(Some(Parsed::Deliver(Message::Control(payload)))),
            MSG_ACK | MSG_KEEP_ALIVE => Ok(Some(Parsed::Skip)),
            MSG_DISCONNECT => Ok(Some(Parsed::Deliver(Message::Disconnect))),
            n => Err(Error::UnknownMessageType(n))
        }
    }

    fn process_ack(&mut self, ack: u32) {
        while let Some(front) = self.unacked.front() {
            if front.id > ack {
                break
            }
            self.unacked_bytes -= front.bytes.len();
            self.unacked.pop_front();
        }
    }

    /// Deliver a pending acknowledgement for everything read so far.
    ///
    /// Used before a hand-off so the peer's replay buffer is as small as
    /// possible.
    pub async fn flush_ack(&mut self) {
        self.write_header(MSG_ACK, 0, &[]).await
    }
}

#[derive(Debug)]
enum Parsed {
    Deliver(Message),
    Skip
}

// Encode one message with header.
fn encode(msg_type: u8, id: u32, ack: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + data.len());
    buf.put_u8(msg_type);
    buf.put_u32(id);
    buf.put_u32(ack);
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(data);
    buf
}

// Error type /////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
pub enum Error {
    /// The underlying socket failed.
    Socket(socket::Error),
    /// A message header announced an unreasonable payload length.
    MessageTooLarge { actual: u32, maximum: u32 },
    /// A message header carried an unknown type.
    UnknownMessageType(u8),
    /// The unacknowledged-bytes bound was exceeded; the session is dead.
    Overflow { buffered: usize, maximum: usize }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Socket(e) => write!(f, "socket error: {}", e),
            Error::MessageTooLarge { actual, maximum } =>
                write!(f, "message too large: len = {}, maximum = {}", actual, maximum),
            Error::UnknownMessageType(n) => write!(f, "unknown message type: {}", n),
            Error::Overflow { buffered, maximum } =>
                write!(f, "send buffer overflow: {} buffered, maximum = {}", buffered, maximum)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Error::Socket(e) = self {
            Some(e)
        } else {
            None
        }
    }
}

impl From<socket::Error> for Error {
    fn from(e: socket::Error) -> Self {
        Error::Socket(e)
    }
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::{encode, Message, PersistentProtocol, MSG_ACK, MSG_DISCONNECT, MSG_REGULAR, HEADER_SIZE};
    use crate::socket::{RawSocket, RemoteSocket};
    use assert_matches::assert_matches;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn protocol(stream: DuplexStream) -> PersistentProtocol<DuplexStream> {
        PersistentProtocol::new(RemoteSocket::Raw(RawSocket::new(stream, BytesMut::new())))
    }

    async fn read_raw(driver: &mut DuplexStream) -> (u8, u32, u32, Vec<u8>) {
        let mut header = [0_u8; HEADER_SIZE];
        driver.read_exact(&mut header).await.unwrap();
        let id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let ack = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
        let len = u32::from_be_bytes([header[9], header[10], header[11], header[12]]) as usize;
        let mut payload = vec![0_u8; len];
        driver.read_exact(&mut payload).await.unwrap();
        (header[0], id, ack, payload)
    }

    #[tokio::test]
    async fn regular_messages_are_sequenced_and_acked() {
        let (mut driver, server) = tokio::io::duplex(64 * 1024);
        let mut proto = protocol(server);

        driver.write_all(&encode(MSG_REGULAR, 1, 0, b"first")).await.unwrap();
        assert_matches!(proto.read_message().await.unwrap(), Message::Regular(p) if &p[..] == b"first");

        // The next protocol round flushes a bare acknowledgement.
        driver.write_all(&encode(MSG_REGULAR, 2, 0, b"second")).await.unwrap();
        assert_matches!(proto.read_message().await.unwrap(), Message::Regular(p) if &p[..] == b"second");

        let (t, _, ack, _) = read_raw(&mut driver).await;
        assert_eq!(t, MSG_ACK);
        assert_eq!(ack, 1);
    }

    #[tokio::test]
    async fn control_messages_are_unsequenced() {
        let (mut driver, server) = tokio::io::duplex(64 * 1024);
        let mut proto = protocol(server);

        proto.send_control(b"{\"type\":\"sign\"}").await.unwrap();
        let (t, id, _, payload) = read_raw(&mut driver).await;
        assert_eq!(t, super::MSG_CONTROL);
        assert_eq!(id, 0);
        assert_eq!(payload, b"{\"type\":\"sign\"}");
        assert_eq!(proto.unacked_len(), 0);
    }

    #[tokio::test]
    async fn acks_prune_the_replay_buffer() {
        let (mut driver, server) = tokio::io::duplex(64 * 1024);
        let mut proto = protocol(server);

        proto.send(b"one").await.unwrap();
        proto.send(b"two").await.unwrap();
        assert_eq!(proto.unacked_len(), 2);

        // Peer acknowledges the first message only.
        driver.write_all(&encode(MSG_ACK, 0, 1, &[])).await.unwrap();
        // An unrelated regular message flushes ack processing.
        driver.write_all(&encode(MSG_REGULAR, 1, 1, b"x")).await.unwrap();
        assert_matches!(proto.read_message().await.unwrap(), Message::Regular(_));
        assert_eq!(proto.unacked_len(), 1);

        driver.write_all(&encode(MSG_ACK, 0, 2, &[])).await.unwrap();
        driver.write_all(&encode(MSG_REGULAR, 2, 2, b"y")).await.unwrap();
        assert_matches!(proto.read_message().await.unwrap(), Message::Regular(_));
        assert_eq!(proto.unacked_len(), 0);
    }

    #[tokio::test]
    async fn reconnect_replays_unacked_messages() {
        let (driver, server) = tokio::io::duplex(64 * 1024);
        let mut proto = protocol(server);

        proto.send(b"kept").await.unwrap();
        drop(driver); // first socket dies

        assert_matches!(proto.read_message().await.unwrap(), Message::Closed);
        assert!(!proto.is_alive());
        assert_eq!(proto.unacked_len(), 1);

        let (mut driver2, server2) = tokio::io::duplex(64 * 1024);
        proto.begin_accept_reconnection(RemoteSocket::Raw(RawSocket::new(server2, BytesMut::new())), &[]);
        proto.end_accept_reconnection().await.unwrap();
        assert!(proto.is_alive());

        let (t, id, _, payload) = read_raw(&mut driver2).await;
        assert_eq!(t, MSG_REGULAR);
        assert_eq!(id, 1);
        assert_eq!(payload, b"kept");
    }

    #[tokio::test]
    async fn duplicates_after_reconnect_are_dropped() {
        let (mut driver, server) = tokio::io::duplex(64 * 1024);
        let mut proto = protocol(server);

        driver.write_all(&encode(MSG_REGULAR, 1, 0, b"original")).await.unwrap();
        assert_matches!(proto.read_message().await.unwrap(), Message::Regular(_));

        // The client replays id 1 after a reconnect, then continues with 2.
        driver.write_all(&encode(MSG_REGULAR, 1, 0, b"original")).await.unwrap();
        driver.write_all(&encode(MSG_REGULAR, 2, 0, b"fresh")).await.unwrap();
        assert_matches!(proto.read_message().await.unwrap(), Message::Regular(p) if &p[..] == b"fresh");
    }

    #[tokio::test]
    async fn disconnect_is_delivered() {
        let (mut driver, server) = tokio::io::duplex(64 * 1024);
        let mut proto = protocol(server);

        driver.write_all(&encode(MSG_DISCONNECT, 0, 0, &[])).await.unwrap();
        assert_matches!(proto.read_message().await.unwrap(), Message::Disconnect);
    }

    #[tokio::test]
    async fn overflow_declares_the_session_dead() {
        let (_driver, server) = tokio::io::duplex(1024 * 1024);
        let mut proto = protocol(server);
        proto.set_max_unacked_bytes(64);

        proto.send(b"0123456789012345678901234567890123456789").await.unwrap();
        assert_matches!(
            proto.send(b"0123456789012345678901234567890123456789").await,
            Err(super::Error::Overflow { .. })
        );
    }

    #[tokio::test]
    async fn read_entire_buffer_drains_residual_bytes() {
        let (mut driver, server) = tokio::io::duplex(64 * 1024);
        let mut proto = protocol(server);

        let mut bytes = encode(MSG_REGULAR, 1, 0, b"whole");
        bytes.extend_from_slice(&encode(MSG_REGULAR, 2, 0, b"partial")[.. 9]);
        driver.write_all(&bytes).await.unwrap();

        assert_matches!(proto.read_message().await.unwrap(), Message::Regular(p) if &p[..] == b"whole");
        let residual = proto.read_entire_buffer();
        assert_eq!(residual.len(), 9);
        assert_eq!(residual[0], MSG_REGULAR);
    }
}
