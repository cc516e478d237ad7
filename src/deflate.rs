// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Stateful `permessage-deflate` ([RFC 7692][rfc7692]) contexts.
//!
//! Unlike a plain per-message codec, both directions keep their zlib
//! stream alive across messages (context takeover), and the inflate side
//! records a bounded tail of its most recent output. When a socket is
//! handed over to an extension-host worker, that tail seeds the worker's
//! decompressor so compressed frames referring back into the LZ77 window
//! keep decoding correctly.
//!
//! [rfc7692]: https://tools.ietf.org/html/rfc7692

use bytes::BytesMut;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use std::fmt;

/// Allocation block size for (de)compression output.
const BLOCK_SIZE: usize = 8 * 1024;

/// Every deflate block flushed with `Z_SYNC_FLUSH` ends in this tail,
/// which RFC 7692 removes on the wire (sections 7.2.1/7.2.2).
const SYNC_FLUSH_TAIL: [u8; 4] = [0, 0, 0xFF, 0xFF];

/// Negotiated `permessage-deflate` parameters.
///
/// Window bits are from the server's point of view: `client_max_window_bits`
/// bounds the window of data the *client* compresses with (our inflate side),
/// `server_max_window_bits` bounds our deflate side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateConfig {
    pub client_max_window_bits: u8,
    pub server_max_window_bits: u8,
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool
}

impl Default for DeflateConfig {
    fn default() -> Self {
        DeflateConfig {
            client_max_window_bits: 15,
            server_max_window_bits: 15,
            client_no_context_takeover: false,
            server_no_context_takeover: false
        }
    }
}

/// The per-direction zlib streams of one websocket connection.
#[derive(Debug)]
pub struct DeflateContexts {
    config: DeflateConfig,
    inflater: Decompress,
    deflater: Compress,
    /// Tail of the most recent inflate output, bounded to the inflate window.
    recorded: BytesMut,
    /// Scratch output buffer, reused across messages.
    buffer: Vec<u8>
}

impl DeflateContexts {
    /// Create fresh contexts for the given negotiated parameters.
    pub fn new(config: DeflateConfig) -> Self {
        DeflateContexts {
            config,
            inflater: Decompress::new_with_window_bits(false, config.client_max_window_bits),
            deflater: Compress::new_with_window_bits(Compression::fast(), false, config.server_max_window_bits),
            recorded: BytesMut::new(),
            buffer: Vec::with_capacity(BLOCK_SIZE)
        }
    }

    /// The parameters these contexts were built with.
    pub fn config(&self) -> &DeflateConfig {
        &self.config
    }

    /// The bounded tail of recently inflated bytes, used to seed the
    /// decompressor of a process the socket is handed over to.
    pub fn recorded_inflate_bytes(&self) -> &[u8] {
        &self.recorded
    }

    /// Decompress one message payload in place.
    ///
    /// `data` is the concatenated payload of a compressed message; the
    /// 4-byte sync-flush tail removed on the wire is re-appended here,
    /// cf. RFC 7692, section 7.2.2.
    pub fn inflate(&mut self, data: &mut BytesMut) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(())
        }

        data.extend_from_slice(&SYNC_FLUSH_TAIL);

        self.buffer.clear();
        let before = self.inflater.total_in();
        let total = before + data.len() as u64;
        while self.inflater.total_in() < total {
            let off = (self.inflater.total_in() - before) as usize;
            if self.buffer.len() == self.buffer.capacity() {
                self.buffer.reserve(BLOCK_SIZE)
            }
            self.inflater
                .decompress_vec(&data[off ..], &mut self.buffer, FlushDecompress::Sync)
                .map_err(Error::Inflate)?;
        }

        let window = 1_usize << self.config.client_max_window_bits;
        record_tail(&mut self.recorded, &self.buffer, window);
        data.clear();
        data.extend_from_slice(&self.buffer);

        if self.config.client_no_context_takeover {
            self.inflater.reset(false)
        }
        Ok(())
    }

    /// Compress one message payload in place, removing the 4-byte
    /// sync-flush tail, cf. RFC 7692, section 7.2.1.
    pub fn deflate(&mut self, data: &mut BytesMut) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(())
        }

        self.buffer.clear();
        let before = self.deflater.total_in();
        let total = before + data.len() as u64;
        while self.deflater.total_in() < total {
            let off = (self.deflater.total_in() - before) as usize;
            if self.buffer.len() == self.buffer.capacity() {
                self.buffer.reserve(BLOCK_SIZE)
            }
            self.deflater
                .compress_vec(&data[off ..], &mut self.buffer, FlushCompress::Sync)
                .map_err(Error::Deflate)?;
        }
        // Keep flushing until the sync block is complete.
        loop {
            let n = self.buffer.len();
            if n == self.buffer.capacity() {
                self.buffer.reserve(BLOCK_SIZE)
            }
            self.deflater
                .compress_vec(&[], &mut self.buffer, FlushCompress::Sync)
                .map_err(Error::Deflate)?;
            if self.buffer.len() == n {
                break
            }
        }

        if !self.buffer.ends_with(&SYNC_FLUSH_TAIL) {
            return Err(Error::MissingFlushTail)
        }
        let n = self.buffer.len() - SYNC_FLUSH_TAIL.len();
        data.clear();
        data.extend_from_slice(&self.buffer[.. n]);

        if self.config.server_no_context_takeover {
            self.deflater.reset()
        }
        Ok(())
    }

}

// Append inflate output to the recorded tail, keeping at most one LZ77
// window of history.
fn record_tail(recorded: &mut BytesMut, output: &[u8], window: usize) {
    if output.len() >= window {
        recorded.clear();
        recorded.extend_from_slice(&output[output.len() - window ..]);
        return
    }
    let keep = window - output.len();
    if recorded.len() > keep {
        let drop = recorded.len() - keep;
        let _ = recorded.split_to(drop);
    }
    recorded.extend_from_slice(output)
}

// Error type /////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
pub enum Error {
    /// Decompression of an incoming message failed.
    Inflate(flate2::DecompressError),
    /// Compression of an outgoing message failed.
    Deflate(flate2::CompressError),
    /// The compressor did not produce a sync-flush tail.
    MissingFlushTail
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Inflate(e) => write!(f, "inflate error: {}", e),
            Error::Deflate(e) => write!(f, "deflate error: {}", e),
            Error::MissingFlushTail => f.write_str("compressor produced no sync-flush tail")
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Inflate(e) => Some(e),
            Error::Deflate(e) => Some(e),
            Error::MissingFlushTail => None
        }
    }
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////
