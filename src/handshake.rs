// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The server side of the websocket [handshake].
//!
//! The HTTP request head has already been read and parsed by the time this
//! module runs; it validates the upgrade, negotiates `permessage-deflate`
//! and produces the `101 Switching Protocols` response bytes.
//!
//! [handshake]: https://tools.ietf.org/html/rfc6455#section-4

use crate::deflate::DeflateConfig;
use crate::http::RequestHead;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use smallvec::SmallVec;
use std::fmt;

// Defined in RFC 6455 and used to generate the `Sec-WebSocket-Accept`
// header in the server handshake response.
const KEY: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";

/// A validated upgrade request, ready to be accepted.
#[derive(Debug)]
pub struct Upgrade {
    /// The client's `Sec-WebSocket-Key` nonce.
    key: Vec<u8>,
    /// Negotiated deflate parameters, if the client offered the extension.
    deflate: Option<DeflateConfig>,
    /// The extension parameters echoed back to the client.
    echo: SmallVec<[(&'static str, Option<u8>); 4]>
}

impl Upgrade {
    /// The negotiated deflate parameters, if any.
    pub fn deflate(&self) -> Option<DeflateConfig> {
        self.deflate
    }

    /// Validate an upgrade request head.
    pub fn from_head(head: &RequestHead) -> Result<Upgrade, Error> {
        if head.method != "GET" {
            return Err(Error::InvalidRequestMethod)
        }
        expect_ascii_header(head, "Upgrade", "websocket")?;
        expect_ascii_header(head, "Connection", "upgrade")?;
        expect_ascii_header(head, "Sec-WebSocket-Version", "13")?;

        let key = match head.header("Sec-WebSocket-Key") {
            None => return Err(Error::MissingKey),
            Some(k) => {
                // The nonce is 16 random bytes, base64 encoded.
                match BASE64.decode(k.trim()) {
                    Ok(n) if n.len() == 16 => Vec::from(k.trim().as_bytes()),
                    _ => return Err(Error::MalformedKey)
                }
            }
        };

        let mut deflate = None;
        let mut echo = SmallVec::new();
        for value in head.headers("Sec-WebSocket-Extensions") {
            if let Some((config, params)) = configure_deflate(value) {
                deflate = Some(config);
                echo = params;
                break
            }
        }

        Ok(Upgrade { key, deflate, echo })
    }

    /// Encode the `101 Switching Protocols` response into `buf`.
    pub fn response_into(&self, buf: &mut BytesMut) {
        let accept_value = accept_key(&self.key);
        buf.extend_from_slice(b"HTTP/1.1 101 Switching Protocols");
        buf.extend_from_slice(b"\r\nServer: benchgate-");
        buf.extend_from_slice(GATEWAY_VERSION.as_bytes());
        buf.extend_from_slice(b"\r\nUpgrade: websocket\r\nConnection: upgrade");
        buf.extend_from_slice(b"\r\nSec-WebSocket-Accept: ");
        buf.extend_from_slice(accept_value.as_bytes());
        if self.deflate.is_some() {
            buf.extend_from_slice(b"\r\nSec-WebSocket-Extensions: ");
            buf.extend_from_slice(PERMESSAGE_DEFLATE.as_bytes());
            for (name, value) in &self.echo {
                buf.extend_from_slice(b"; ");
                buf.extend_from_slice(name.as_bytes());
                if let Some(v) = value {
                    buf.extend_from_slice(b"=");
                    buf.extend_from_slice(v.to_string().as_bytes())
                }
            }
        }
        buf.extend_from_slice(b"\r\n\r\n")
    }
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &[u8]) -> String {
    let mut digest = Sha1::new();
    digest.update(key);
    digest.update(KEY);
    BASE64.encode(digest.finalize())
}

// Parse one `Sec-WebSocket-Extensions` offer. Returns the negotiated
// configuration and the parameters to echo back, or `None` if the value
// contains no acceptable `permessage-deflate` offer.
fn configure_deflate(value: &str) -> Option<(DeflateConfig, SmallVec<[(&'static str, Option<u8>); 4]>)> {
    'offer: for offer in value.split(',') {
        let mut parts = offer.split(';').map(str::trim);
        if parts.next() != Some(PERMESSAGE_DEFLATE) {
            continue
        }

        let mut config = DeflateConfig::default();
        let mut echo: SmallVec<[(&'static str, Option<u8>); 4]> = SmallVec::new();
        for param in parts {
            let (name, value) = match param.split_once('=') {
                Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
                None => (param, None)
            };
            match name {
                CLIENT_MAX_WINDOW_BITS => {
                    // An offer without a value means "pick one"; we
                    // normalize it to the maximum window.
                    let bits = match value {
                        None => 15,
                        Some(v) => match v.parse::<u8>() {
                            // The RFC allows 8 to 15 bits, but due to zlib
                            // limitations we only support 9 to 15.
                            Ok(b) if (8 ..= 15).contains(&b) => b.max(9),
                            _ => {
                                log::debug!("invalid {}: {:?}", CLIENT_MAX_WINDOW_BITS, value);
                                continue 'offer
                            }
                        }
                    };
                    config.client_max_window_bits = bits;
                    echo.push((CLIENT_MAX_WINDOW_BITS, Some(bits)))
                }
                SERVER_MAX_WINDOW_BITS => {
                    let bits = match value.map(str::parse::<u8>) {
                        Some(Ok(b)) if (9 ..= 15).contains(&b) => b,
                        _ => {
                            log::debug!("invalid {}: {:?}", SERVER_MAX_WINDOW_BITS, value);
                            continue 'offer
                        }
                    };
                    config.server_max_window_bits = bits;
                    echo.push((SERVER_MAX_WINDOW_BITS, Some(bits)))
                }
                CLIENT_NO_CONTEXT_TAKEOVER => {
                    config.client_no_context_takeover = true;
                    echo.push((CLIENT_NO_CONTEXT_TAKEOVER, None))
                }
                SERVER_NO_CONTEXT_TAKEOVER => {
                    config.server_no_context_takeover = true;
                    echo.push((SERVER_NO_CONTEXT_TAKEOVER, None))
                }
                other => {
                    log::debug!("{}: unknown parameter: {}", PERMESSAGE_DEFLATE, other);
                    continue 'offer
                }
            }
        }
        return Some((config, echo))
    }
    None
}

// Check that a header is present and has the expected (case-insensitive) value.
fn expect_ascii_header(head: &RequestHead, name: &str, expected: &str) -> Result<(), Error> {
    for value in head.headers(name) {
        if value.split(',').any(|t| t.trim().eq_ignore_ascii_case(expected)) {
            return Ok(())
        }
    }
    Err(Error::UnexpectedHeader(name.to_string()))
}

// Error type /////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
pub enum Error {
    /// The request method is not GET.
    InvalidRequestMethod,
    /// The `Sec-WebSocket-Key` header is missing.
    MissingKey,
    /// The `Sec-WebSocket-Key` header is not a base64 encoded 16-byte nonce.
    MalformedKey,
    /// A required header is missing or has an unexpected value.
    UnexpectedHeader(String)
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidRequestMethod => f.write_str("invalid request method"),
            Error::MissingKey => f.write_str("missing Sec-WebSocket-Key header"),
            Error::MalformedKey => f.write_str("malformed Sec-WebSocket-Key header"),
            Error::UnexpectedHeader(name) => write!(f, "missing or unexpected header: {}", name)
        }
    }
}

impl std::error::Error for Error {}

// Tests //////////////////////////////////////////////////////////////////////////////////////////
