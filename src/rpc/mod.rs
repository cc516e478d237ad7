// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Named RPC channels multiplexed over one management connection.
//!
//! Regular persistent-protocol messages carry JSON requests:
//!
//! ```json
//! {"id": 7, "type": "promise",  "channel": "remotefilesystem", "name": "stat",  "arg": {...}}
//! {"id": 8, "type": "listen",   "channel": "remotefilesystem", "name": "readFileStream", "arg": {...}}
//! {"id": 8, "type": "unlisten"}
//! {"id": 7, "type": "cancel"}
//! ```
//!
//! and responses flow back as `reply`, `error` or `event` messages with
//! the request's id. A channel implements a promise-style `call` and a
//! stream-style `listen`; dropping the event receiver (because the last
//! listener went away or the session died) cancels the producer.

pub mod debug;
pub mod env;
pub mod extensions;
pub mod fs;
pub mod logger;
pub mod terminal;
pub mod uri;

use crate::rpc::uri::UriTransformer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Buffered events per listener before backpressure applies.
const EVENT_QUEUE_SIZE: usize = 64;

// Wire format ////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    Promise {
        id: u32,
        channel: String,
        name: String,
        #[serde(default)]
        arg: Value
    },
    Listen {
        id: u32,
        channel: String,
        name: String,
        #[serde(default)]
        arg: Value
    },
    Cancel { id: u32 },
    Unlisten { id: u32 }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Response {
    Reply { id: u32, data: Value },
    Error { id: u32, message: String },
    Event { id: u32, data: Value }
}

// Channel trait //////////////////////////////////////////////////////////////////////////////////

/// Per-call context: which session is calling and how its resources map.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// The `host[:port]` the client connected through.
    pub remote_authority: String,
    /// The session's reconnection token.
    pub session_id: String
}

impl CallContext {
    /// The URI transformer for this session's authority.
    pub fn transformer(&self) -> UriTransformer {
        UriTransformer::new(&self.remote_authority)
    }
}

/// A stream of events produced by [`Channel::listen`].
///
/// The producer must stop when the receiver is dropped.
pub type EventStream = mpsc::Receiver<Value>;

/// A named server channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Handle a promise-style command.
    async fn call(&self, ctx: &CallContext, name: &str, arg: Value) -> Result<Value, RpcError>;

    /// Subscribe to an event. The returned stream is cancelled by
    /// dropping it.
    fn listen(&self, ctx: &CallContext, name: &str, arg: Value) -> Result<EventStream, RpcError>;
}

/// Error surfaced to the calling client.
#[derive(Debug)]
pub struct RpcError {
    message: String
}

impl RpcError {
    pub fn new(message: impl Into<String>) -> Self {
        RpcError { message: message.into() }
    }

    pub fn unknown_command(channel: &str, name: &str) -> Self {
        RpcError::new(format!("unknown command: {}/{}", channel, name))
    }

    pub fn unknown_event(channel: &str, name: &str) -> Self {
        RpcError::new(format!("unknown event: {}/{}", channel, name))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::new(e.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::new(format!("malformed argument: {}", e))
    }
}

// Channel server /////////////////////////////////////////////////////////////////////////////////

/// The set of channels served to management sessions.
#[derive(Default)]
pub struct ChannelServer {
    channels: HashMap<String, Arc<dyn Channel>>
}

impl ChannelServer {
    pub fn new() -> Self {
        ChannelServer::default()
    }

    pub fn register(&mut self, name: &str, channel: Arc<dyn Channel>) -> &mut Self {
        self.channels.insert(name.to_string(), channel);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(name).cloned()
    }
}

// Dispatcher /////////////////////////////////////////////////////////////////////////////////////

/// Dispatches one session's requests onto the channel set.
///
/// Responses and events are serialized into the session's outbound
/// queue; the session task owns the protocol and does the writing.
pub struct Dispatcher {
    server: Arc<ChannelServer>,
    ctx: Arc<CallContext>,
    outbound: mpsc::Sender<Vec<u8>>,
    active: HashMap<u32, JoinHandle<()>>
}

impl Dispatcher {
    pub fn new(server: Arc<ChannelServer>, ctx: Arc<CallContext>, outbound: mpsc::Sender<Vec<u8>>) -> Self {
        Dispatcher { server, ctx, outbound, active: HashMap::new() }
    }

    /// Handle one regular message from the client.
    pub fn handle_message(&mut self, bytes: &[u8]) {
        let request = match serde_json::from_slice::<Request>(bytes) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("[{}] dropping malformed rpc request: {}", crate::token_prefix(&self.ctx.session_id), e);
                return
            }
        };
        self.purge_finished();
        match request {
            Request::Promise { id, channel, name, arg } => self.dispatch_call(id, channel, name, arg),
            Request::Listen { id, channel, name, arg } => self.dispatch_listen(id, channel, name, arg),
            Request::Cancel { id } | Request::Unlisten { id } => {
                if let Some(handle) = self.active.remove(&id) {
                    handle.abort()
                }
            }
        }
    }

    /// Abort everything in flight. Called when the session is disposed;
    /// afterwards no message reaches any channel handler.
    pub fn dispose(&mut self) {
        for (_, handle) in self.active.drain() {
            handle.abort()
        }
    }

    /// Number of in-flight calls and listeners (for tests/diagnostics).
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    fn dispatch_call(&mut self, id: u32, channel: String, name: String, arg: Value) {
        let outbound = self.outbound.clone();
        let ctx = self.ctx.clone();
        let response = match self.server.get(&channel) {
            Some(target) => {
                let handle = tokio::spawn(async move {
                    let response = match target.call(&ctx, &name, arg).await {
                        Ok(data) => Response::Reply { id, data },
                        Err(e) => Response::Error { id, message: e.message().to_string() }
                    };
                    let _ = send_response(&outbound, &response).await;
                });
                self.active.insert(id, handle);
                return
            }
            None => Response::Error { id, message: format!("unknown channel: {}", channel) }
        };
        let outbound = self.outbound.clone();
        let _ = tokio::spawn(async move { let _ = send_response(&outbound, &response).await; });
    }

    fn dispatch_listen(&mut self, id: u32, channel: String, name: String, arg: Value) {
        let outbound = self.outbound.clone();
        let response = match self.server.get(&channel) {
            Some(target) => match target.listen(&self.ctx, &name, arg) {
                Ok(mut events) => {
                    let handle = tokio::spawn(async move {
                        while let Some(data) = events.recv().await {
                            if send_response(&outbound, &Response::Event { id, data }).await.is_err() {
                                break
                            }
                        }
                        // Dropping `events` here cancels the producer.
                    });
                    self.active.insert(id, handle);
                    return
                }
                Err(e) => Response::Error { id, message: e.message().to_string() }
            },
            None => Response::Error { id, message: format!("unknown channel: {}", channel) }
        };
        let outbound = self.outbound.clone();
        let _ = tokio::spawn(async move { let _ = send_response(&outbound, &response).await; });
    }

    fn purge_finished(&mut self) {
        self.active.retain(|_, handle| !handle.is_finished())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.dispose()
    }
}

async fn send_response(outbound: &mpsc::Sender<Vec<u8>>, response: &Response) -> Result<(), ()> {
    match serde_json::to_vec(response) {
        Ok(bytes) => outbound.send(bytes).await.map_err(|_| ()),
        Err(e) => {
            log::error!("failed to serialize rpc response: {}", e);
            Ok(())
        }
    }
}

/// Create an event stream and its sending side.
pub fn event_stream() -> (mpsc::Sender<Value>, EventStream) {
    mpsc::channel(EVENT_QUEUE_SIZE)
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////
