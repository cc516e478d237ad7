// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Fan-out channel for extension-host debug messages. Nothing is
//! persisted: a message reaches the sessions listening at that moment.

use crate::rpc::{event_stream, CallContext, Channel, EventStream, RpcError};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

/// Buffered broadcast backlog per subscriber.
const BACKLOG: usize = 64;

pub struct ExtensionHostDebugChannel {
    tx: broadcast::Sender<Value>
}

impl ExtensionHostDebugChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BACKLOG);
        ExtensionHostDebugChannel { tx }
    }
}

impl Default for ExtensionHostDebugChannel {
    fn default() -> Self {
        ExtensionHostDebugChannel::new()
    }
}

#[async_trait]
impl Channel for ExtensionHostDebugChannel {
    async fn call(&self, _ctx: &CallContext, name: &str, arg: Value) -> Result<Value, RpcError> {
        match name {
            "broadcast" => {
                // No listeners is fine; the message is simply dropped.
                let receivers = self.tx.send(arg).unwrap_or(0);
                log::trace!("debug broadcast delivered to {} listeners", receivers);
                Ok(Value::Null)
            }
            _ => Err(RpcError::unknown_command("extensionHostDebugBroadcast", name))
        }
    }

    fn listen(&self, _ctx: &CallContext, name: &str, _arg: Value) -> Result<EventStream, RpcError> {
        match name {
            "message" => {
                let mut rx = self.tx.subscribe();
                let (tx, stream) = event_stream();
                tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(value) => {
                                if tx.send(value).await.is_err() {
                                    break
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("debug broadcast listener lagged, {} messages dropped", n)
                            }
                            Err(broadcast::error::RecvError::Closed) => break
                        }
                    }
                });
                Ok(stream)
            }
            _ => Err(RpcError::unknown_event("extensionHostDebugBroadcast", name))
        }
    }
}
