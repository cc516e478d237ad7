// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The remote terminal channel.
//!
//! This gateway does not allocate PTYs; the channel answers the
//! environment queries the workbench issues at startup and rejects
//! everything that would require a live terminal.

use crate::rpc::{CallContext, Channel, EventStream, RpcError};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

pub struct RemoteTerminalChannel;

#[async_trait]
impl Channel for RemoteTerminalChannel {
    async fn call(&self, _ctx: &CallContext, name: &str, _arg: Value) -> Result<Value, RpcError> {
        match name {
            "getDefaultSystemShell" => {
                let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
                Ok(json!(shell))
            }
            "getEnvironment" => {
                let mut vars = Map::new();
                for (k, v) in std::env::vars() {
                    vars.insert(k, Value::String(v));
                }
                Ok(Value::Object(vars))
            }
            "getProfiles" => Ok(json!([])),
            "getTerminalLayoutInfo" => Ok(Value::Null),
            _ => Err(RpcError::new(format!("terminals are not supported by this gateway: {}", name)))
        }
    }

    fn listen(&self, _ctx: &CallContext, name: &str, _arg: Value) -> Result<EventStream, RpcError> {
        Err(RpcError::unknown_event("remoteterminal", name))
    }
}

#[cfg(test)]
mod tests {
    use super::RemoteTerminalChannel;
    use crate::rpc::{CallContext, Channel};
    use serde_json::json;

    fn ctx() -> CallContext {
        CallContext { remote_authority: "gw".to_string(), session_id: "T".to_string() }
    }

    #[tokio::test]
    async fn environment_queries_are_answered() {
        let shell = RemoteTerminalChannel.call(&ctx(), "getDefaultSystemShell", json!(null)).await.unwrap();
        assert!(shell.as_str().unwrap().len() > 0);

        let env = RemoteTerminalChannel.call(&ctx(), "getEnvironment", json!(null)).await.unwrap();
        assert!(env.is_object());
    }

    #[tokio::test]
    async fn pty_operations_are_rejected() {
        assert!(RemoteTerminalChannel.call(&ctx(), "createProcess", json!({})).await.is_err());
    }
}
