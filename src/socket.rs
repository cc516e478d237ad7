// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A framed bidirectional byte channel on top of a TCP stream.
//!
//! [`WsSocket`] speaks websocket frames after a successful upgrade:
//! fragmented messages are reassembled, pings are answered transparently
//! and `permessage-deflate` is applied when negotiated. [`RemoteSocket`]
//! additionally supports the unframed variant used when a client asked
//! for `skipWebSocketFrames` — the persistent protocol has its own length
//! prefixes and does not depend on websocket message boundaries.
//!
//! Both variants can be dissolved into their raw parts for the hand-off
//! of a connected socket to an extension-host worker.

use crate::base::{self, Codec, Frame, OpCode, CLOSE_INVALID_PAYLOAD, CLOSE_PROTOCOL_ERROR};
use crate::deflate::{DeflateConfig, DeflateContexts};
use bytes::BytesMut;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Allocation block size for socket reads.
const BLOCK_SIZE: usize = 8 * 1024;

/// Accumulated maximum size of a complete message.
const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

static_assertions::const_assert!(BLOCK_SIZE < MAX_MESSAGE_SIZE);

// WsSocket ///////////////////////////////////////////////////////////////////////////////////////

/// The server end of a websocket connection after the upgrade.
#[derive(Debug)]
pub struct WsSocket<T> {
    socket: T,
    codec: Codec,
    deflate: Option<DeflateContexts>,
    /// Raw bytes read off the socket, not yet decoded into frames.
    rbuf: BytesMut,
    /// Reassembly buffer for fragmented messages.
    message: BytesMut,
    /// Opcode and rsv1 bit of the first fragment currently in flight.
    first_fragment: Option<(OpCode, bool)>,
    /// Encode scratch buffer.
    wbuf: BytesMut,
    is_closed: bool
}

impl<T: AsyncRead + AsyncWrite + Unpin> WsSocket<T> {
    /// Wrap an upgraded socket.
    ///
    /// `leftover` are bytes the HTTP layer read past the request head;
    /// they belong to the frame stream.
    pub fn new(socket: T, deflate: Option<DeflateConfig>, leftover: BytesMut) -> Self {
        let mut codec = Codec::new();
        if deflate.is_some() {
            codec.allow_rsv1();
        }
        WsSocket {
            socket,
            codec,
            deflate: deflate.map(DeflateContexts::new),
            rbuf: leftover,
            message: BytesMut::new(),
            first_fragment: None,
            wbuf: BytesMut::new(),
            is_closed: false
        }
    }

    /// Receive the next data message, appending its payload to `out`.
    ///
    /// Control frames are handled transparently. Returns the number of
    /// payload bytes appended; 0 means the connection was closed by the
    /// peer (close frame or EOF).
    pub async fn receive(&mut self, out: &mut BytesMut) -> Result<usize, Error> {
        loop {
            if self.is_closed {
                return Ok(0)
            }

            let frame = loop {
                match self.codec.decode(&mut self.rbuf) {
                    Ok(Some(frame)) => break frame,
                    Ok(None) => {
                        if crate::read(&mut self.socket, &mut self.rbuf, BLOCK_SIZE).await? == 0 {
                            log::debug!("connection closed by peer without close frame");
                            self.is_closed = true;
                            return Ok(0)
                        }
                    }
                    Err(e) => {
                        self.send_close(e.close_code()).await;
                        return Err(Error::Base(e))
                    }
                }
            };
            log::trace!("recv: {} (fin = {}, len = {})", frame.opcode(), frame.is_fin(), frame.payload().len());

            match frame.opcode() {
                OpCode::Ping => {
                    let mut pong = Frame::new(OpCode::Pong);
                    pong.set_payload(frame.into_payload());
                    self.send_frame(pong).await?;
                    continue
                }
                OpCode::Pong => continue,
                OpCode::Close => {
                    self.send_close(1000).await;
                    self.is_closed = true;
                    return Ok(0)
                }
                _ => ()
            }

            if self.message.len() + frame.payload().len() > MAX_MESSAGE_SIZE {
                log::warn!("accumulated message length exceeds maximum");
                self.send_close(CLOSE_PROTOCOL_ERROR).await;
                return Err(Error::MessageTooLarge {
                    current: self.message.len() + frame.payload().len(),
                    maximum: MAX_MESSAGE_SIZE
                })
            }

            let fin = frame.is_fin();
            let rsv1 = frame.is_rsv1();
            let opcode = frame.opcode();
            self.message.unsplit(frame.into_payload());

            let compressed = match (fin, opcode) {
                (false, OpCode::Continue) => { // Intermediate message fragment.
                    if self.first_fragment.is_none() {
                        self.send_close(CLOSE_PROTOCOL_ERROR).await;
                        return Err(Error::UnexpectedOpCode(OpCode::Continue))
                    }
                    continue
                }
                (false, oc) => { // Initial message fragment.
                    if self.first_fragment.is_some() {
                        self.send_close(CLOSE_PROTOCOL_ERROR).await;
                        return Err(Error::UnexpectedOpCode(oc))
                    }
                    self.first_fragment = Some((oc, rsv1));
                    continue
                }
                (true, OpCode::Continue) => { // Last message fragment.
                    match self.first_fragment.take() {
                        Some((_, rsv1)) => rsv1,
                        None => {
                            self.send_close(CLOSE_PROTOCOL_ERROR).await;
                            return Err(Error::UnexpectedOpCode(OpCode::Continue))
                        }
                    }
                }
                (true, oc) => { // Regular unfragmented message.
                    if self.first_fragment.is_some() {
                        self.send_close(CLOSE_PROTOCOL_ERROR).await;
                        return Err(Error::UnexpectedOpCode(oc))
                    }
                    rsv1
                }
            };

            // The codec only admits rsv1 when deflate is on.
            if compressed {
                if let Some(contexts) = &mut self.deflate {
                    if let Err(e) = contexts.inflate(&mut self.message) {
                        self.send_close(CLOSE_INVALID_PAYLOAD).await;
                        return Err(Error::Deflate(e))
                    }
                }
            }

            let n = self.message.len();
            out.unsplit(std::mem::take(&mut self.message));
            return Ok(n)
        }
    }

    /// Send one binary message.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut payload = BytesMut::from(data);
        let mut frame = Frame::new(OpCode::Binary);
        if !data.is_empty() {
            if let Some(contexts) = &mut self.deflate {
                contexts.deflate(&mut payload).map_err(Error::Deflate)?;
                frame.set_rsv1(true);
            }
        }
        frame.set_payload(payload);
        self.send_frame(frame).await
    }

    /// Flush pending writes down to the OS socket.
    pub async fn drain(&mut self) -> Result<(), Error> {
        self.socket.flush().await?;
        Ok(())
    }

    /// Send a close frame with the given code. Best effort; errors are
    /// ignored since this always precedes dropping the socket.
    async fn send_close(&mut self, code: u16) {
        let mut frame = Frame::new(OpCode::Close);
        frame.set_payload(BytesMut::from(&code.to_be_bytes()[..]));
        if let Err(e) = self.send_frame(frame).await {
            log::debug!("failed to send close frame: {}", e)
        }
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), Error> {
        log::trace!("send: {} (len = {})", frame.opcode(), frame.payload().len());
        self.wbuf.clear();
        self.codec.encode(frame, &mut self.wbuf);
        self.socket.write_all(&self.wbuf).await?;
        self.socket.flush().await?;
        Ok(())
    }

    /// The recorded inflate tail for hand-off (empty without deflate).
    pub fn recorded_inflate_bytes(&self) -> &[u8] {
        self.deflate.as_ref().map(|d| d.recorded_inflate_bytes()).unwrap_or(&[])
    }

    /// Dissolve into the raw socket, the undecoded byte tail and the
    /// deflate contexts.
    pub fn into_parts(self) -> (T, BytesMut, Option<DeflateContexts>) {
        (self.socket, self.rbuf, self.deflate)
    }
}

// RawSocket //////////////////////////////////////////////////////////////////////////////////////

/// An unframed byte channel, used with `skipWebSocketFrames`.
#[derive(Debug)]
pub struct RawSocket<T> {
    socket: T,
    /// Bytes the HTTP layer read past the request head.
    leftover: BytesMut,
    is_closed: bool
}

impl<T: AsyncRead + AsyncWrite + Unpin> RawSocket<T> {
    pub fn new(socket: T, leftover: BytesMut) -> Self {
        RawSocket { socket, leftover, is_closed: false }
    }

    /// Append the next chunk of bytes to `out`; 0 means EOF.
    pub async fn receive(&mut self, out: &mut BytesMut) -> Result<usize, Error> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len();
            out.unsplit(std::mem::take(&mut self.leftover));
            return Ok(n)
        }
        if self.is_closed {
            return Ok(0)
        }
        let n = crate::read(&mut self.socket, out, BLOCK_SIZE).await?;
        if n == 0 {
            self.is_closed = true
        }
        Ok(n)
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        self.socket.write_all(data).await?;
        self.socket.flush().await?;
        Ok(())
    }

    pub async fn drain(&mut self) -> Result<(), Error> {
        self.socket.flush().await?;
        Ok(())
    }

    pub fn into_parts(self) -> (T, BytesMut) {
        (self.socket, self.leftover)
    }
}

// RemoteSocket ///////////////////////////////////////////////////////////////////////////////////

/// Either end of the framing decision made at upgrade time.
#[derive(Debug)]
pub enum RemoteSocket<T> {
    /// Websocket-framed traffic (browser clients).
    Ws(WsSocket<T>),
    /// Raw persistent-protocol bytes (`skipWebSocketFrames=true`).
    Raw(RawSocket<T>)
}

/// Everything required to transplant a live connection into another
/// process: the OS socket, bytes already read but not yet decoded, and
/// the state of the inflate context.
#[derive(Debug)]
pub struct Handoff<T> {
    pub socket: T,
    /// Raw bytes read off the socket but not decoded. Non-empty only if
    /// the peer transmitted while the hand-off was being prepared.
    pub undecoded: BytesMut,
    /// Recorded inflate tail; empty when deflate was not negotiated.
    pub inflate_bytes: Vec<u8>,
    pub permessage_deflate: bool,
    pub skip_frames: bool
}

impl<T: AsyncRead + AsyncWrite + Unpin> RemoteSocket<T> {
    /// Append the next chunk of decoded bytes to `out`; 0 means closed.
    pub async fn receive(&mut self, out: &mut BytesMut) -> Result<usize, Error> {
        match self {
            RemoteSocket::Ws(s) => s.receive(out).await,
            RemoteSocket::Raw(s) => s.receive(out).await
        }
    }

    /// Send one chunk (one websocket message in framed mode).
    pub async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        match self {
            RemoteSocket::Ws(s) => s.send(data).await,
            RemoteSocket::Raw(s) => s.send(data).await
        }
    }

    /// Await the drain of pending writes.
    pub async fn drain(&mut self) -> Result<(), Error> {
        match self {
            RemoteSocket::Ws(s) => s.drain().await,
            RemoteSocket::Raw(s) => s.drain().await
        }
    }

    /// Is this the unframed variant?
    pub fn skip_frames(&self) -> bool {
        matches!(self, RemoteSocket::Raw(_))
    }

    /// Dissolve into the hand-off parts for transfer to a worker.
    pub fn into_handoff(self) -> Handoff<T> {
        match self {
            RemoteSocket::Ws(s) => {
                let permessage_deflate = s.deflate.is_some();
                let (socket, undecoded, deflate) = s.into_parts();
                Handoff {
                    socket,
                    undecoded,
                    inflate_bytes: deflate.map(|d| d.recorded_inflate_bytes().to_vec()).unwrap_or_default(),
                    permessage_deflate,
                    skip_frames: false
                }
            }
            RemoteSocket::Raw(s) => {
                let (socket, leftover) = s.into_parts();
                Handoff {
                    socket,
                    undecoded: leftover,
                    inflate_bytes: Vec::new(),
                    permessage_deflate: false,
                    skip_frames: true
                }
            }
        }
    }
}

// Error type /////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred.
    Io(std::io::Error),
    /// A framing error occurred (the connection was closed with 1002).
    Base(base::Error),
    /// A compression error occurred (the connection was closed with 1007).
    Deflate(crate::deflate::Error),
    /// An opcode arrived that is invalid in the current fragmentation state.
    UnexpectedOpCode(OpCode),
    /// The reassembled message exceeded the configured maximum.
    MessageTooLarge { current: usize, maximum: usize }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::Base(e) => write!(f, "framing error: {}", e),
            Error::Deflate(e) => write!(f, "compression error: {}", e),
            Error::UnexpectedOpCode(oc) => write!(f, "unexpected opcode: {}", oc),
            Error::MessageTooLarge { current, maximum } =>
                write!(f, "message too large: len = {}, maximum = {}", current, maximum)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Base(e) => Some(e),
            Error::Deflate(e) => Some(e),
            _ => None
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::{RawSocket, RemoteSocket, WsSocket};
    use crate::base::{Codec, Frame, OpCode};
    use crate::deflate::{DeflateConfig, DeflateContexts};
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn pair() -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(64 * 1024)
    }

    // Encode one masked client frame.
    fn client_frame(opcode: OpCode, fin: bool, rsv1: bool, payload: &[u8]) -> BytesMut {
        let mut frame = Frame::new(opcode);
        frame.set_fin(fin);
        frame.set_rsv1(rsv1);
        frame.set_mask(0xCAFE_BABE);
        frame.set_payload(BytesMut::from(payload));
        let mut buf = BytesMut::new();
        Codec::new().encode(frame, &mut buf);
        buf
    }

    #[tokio::test]
    async fn receive_single_message() {
        let (client, server) = pair();
        let mut server = WsSocket::new(server, None, BytesMut::new());
        let mut client = client;

        client.write_all(&client_frame(OpCode::Binary, true, false, b"hello")).await.unwrap();

        let mut out = BytesMut::new();
        let n = server.receive(&mut out).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out[..], b"hello");
    }

    #[tokio::test]
    async fn receive_reassembles_fragments() {
        let (mut client, server) = pair();
        let mut server = WsSocket::new(server, None, BytesMut::new());

        client.write_all(&client_frame(OpCode::Binary, false, false, b"he")).await.unwrap();
        client.write_all(&client_frame(OpCode::Continue, false, false, b"ll")).await.unwrap();
        client.write_all(&client_frame(OpCode::Continue, true, false, b"o")).await.unwrap();

        let mut out = BytesMut::new();
        server.receive(&mut out).await.unwrap();
        assert_eq!(&out[..], b"hello");
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (mut client, server) = pair();
        let mut server = WsSocket::new(server, None, BytesMut::new());

        client.write_all(&client_frame(OpCode::Ping, true, false, b"abc")).await.unwrap();
        client.write_all(&client_frame(OpCode::Binary, true, false, b"data")).await.unwrap();

        let mut out = BytesMut::new();
        server.receive(&mut out).await.unwrap();
        assert_eq!(&out[..], b"data");

        // The server must have written a pong before the test frame was
        // processed; decode it from the client side.
        let mut buf = vec![0_u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        let mut bytes = BytesMut::from(&buf[.. n]);
        let mut codec = Codec::new();
        codec.accept_unmasked();
        let pong = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(pong.opcode(), OpCode::Pong);
        assert_eq!(pong.payload(), b"abc");
    }

    #[tokio::test]
    async fn close_frame_yields_zero() {
        let (mut client, server) = pair();
        let mut server = WsSocket::new(server, None, BytesMut::new());

        client.write_all(&client_frame(OpCode::Close, true, false, &1000_u16.to_be_bytes())).await.unwrap();

        let mut out = BytesMut::new();
        assert_eq!(server.receive(&mut out).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn compressed_message_is_inflated() {
        let (mut client, server) = pair();
        let config = DeflateConfig::default();
        let mut server = WsSocket::new(server, Some(config), BytesMut::new());

        // Compress "hello deflate" the way a client would: mirror
        // contexts and swap the window roles via the default config.
        let mut contexts = DeflateContexts::new(config);
        let mut payload = BytesMut::from(&b"hello deflate"[..]);
        contexts.deflate(&mut payload).unwrap();

        client.write_all(&client_frame(OpCode::Binary, true, true, &payload)).await.unwrap();

        let mut out = BytesMut::new();
        server.receive(&mut out).await.unwrap();
        assert_eq!(&out[..], b"hello deflate");
        assert_eq!(server.recorded_inflate_bytes(), b"hello deflate");
    }

    #[tokio::test]
    async fn raw_socket_passes_leftover_first() {
        let (mut client, server) = pair();
        let mut raw = RemoteSocket::Raw(RawSocket::new(server, BytesMut::from(&b"head"[..])));

        client.write_all(b"tail").await.unwrap();

        let mut out = BytesMut::new();
        raw.receive(&mut out).await.unwrap();
        assert_eq!(&out[..], b"head");
        raw.receive(&mut out).await.unwrap();
        assert_eq!(&out[..], b"headtail");
        assert!(raw.skip_frames());
    }

    #[tokio::test]
    async fn handoff_carries_inflate_tail() {
        let (mut client, server) = pair();
        let config = DeflateConfig::default();
        let mut server = WsSocket::new(server, Some(config), BytesMut::new());

        let mut contexts = DeflateContexts::new(config);
        let mut payload = BytesMut::from(&b"remembered"[..]);
        contexts.deflate(&mut payload).unwrap();
        client.write_all(&client_frame(OpCode::Binary, true, true, &payload)).await.unwrap();

        let mut out = BytesMut::new();
        server.receive(&mut out).await.unwrap();

        let handoff = RemoteSocket::Ws(server).into_handoff();
        assert!(handoff.permessage_deflate);
        assert!(!handoff.skip_frames);
        assert_eq!(&handoff.inflate_bytes[..], b"remembered");
        assert!(handoff.undecoded.is_empty());
    }
}
