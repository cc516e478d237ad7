// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Channels exposing the process logger: `logLevel` adjusts the global
//! filter, `logger` lets the client write into the gateway's log sink.

use crate::rpc::{CallContext, Channel, EventStream, RpcError};
use async_trait::async_trait;
use log::LevelFilter;
use serde::Deserialize;
use serde_json::{json, Value};

/// The `logLevel` channel.
pub struct LogLevelChannel;

#[derive(Debug, Deserialize)]
struct SetLevelArg {
    level: String
}

#[async_trait]
impl Channel for LogLevelChannel {
    async fn call(&self, _ctx: &CallContext, name: &str, arg: Value) -> Result<Value, RpcError> {
        match name {
            "getLevel" => Ok(json!(level_name(log::max_level()))),
            "setLevel" => {
                let arg: SetLevelArg = serde_json::from_value(arg)?;
                let level = parse_level(&arg.level)
                    .ok_or_else(|| RpcError::new(format!("unknown log level: {}", arg.level)))?;
                log::set_max_level(level);
                log::info!("log level set to {}", arg.level);
                Ok(Value::Null)
            }
            _ => Err(RpcError::unknown_command("logLevel", name))
        }
    }

    fn listen(&self, _ctx: &CallContext, name: &str, _arg: Value) -> Result<EventStream, RpcError> {
        Err(RpcError::unknown_event("logLevel", name))
    }
}

/// The `logger` channel.
pub struct LoggerChannel;

#[derive(Debug, Deserialize)]
struct LogArg {
    level: String,
    message: String
}

#[async_trait]
impl Channel for LoggerChannel {
    async fn call(&self, ctx: &CallContext, name: &str, arg: Value) -> Result<Value, RpcError> {
        match name {
            "log" => {
                let arg: LogArg = serde_json::from_value(arg)?;
                let level = parse_level(&arg.level).unwrap_or(LevelFilter::Info);
                if let Some(level) = level.to_level() {
                    log::log!(level, "[client {}] {}", crate::token_prefix(&ctx.session_id), arg.message)
                }
                Ok(Value::Null)
            }
            "flush" => Ok(Value::Null),
            _ => Err(RpcError::unknown_command("logger", name))
        }
    }

    fn listen(&self, _ctx: &CallContext, name: &str, _arg: Value) -> Result<EventStream, RpcError> {
        Err(RpcError::unknown_event("logger", name))
    }
}

fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None
    }
}

fn level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace"
    }
}
