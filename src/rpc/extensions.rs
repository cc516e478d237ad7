// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The `extensions` channel: extension-management operations delegated
//! to an [`ExtensionManagement`] service. The gateway ships a local
//! implementation that answers inventory queries from the user
//! extension root; mutating operations belong to an external installer
//! and are rejected here.

use crate::rpc::uri::UriParts;
use crate::rpc::{CallContext, Channel, EventStream, RpcError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// The management operations the channel delegates to.
#[async_trait]
pub trait ExtensionManagement: Send + Sync {
    async fn get_installed(&self, ctx: &CallContext) -> Result<Vec<Value>, RpcError>;
    async fn install(&self, ctx: &CallContext, location: UriParts) -> Result<Value, RpcError>;
    async fn uninstall(&self, ctx: &CallContext, id: &str) -> Result<(), RpcError>;
}

pub struct ExtensionManagementChannel {
    service: Arc<dyn ExtensionManagement>
}

impl ExtensionManagementChannel {
    pub fn new(service: Arc<dyn ExtensionManagement>) -> Self {
        ExtensionManagementChannel { service }
    }
}

#[derive(Debug, Deserialize)]
struct InstallArg {
    location: UriParts
}

#[derive(Debug, Deserialize)]
struct UninstallArg {
    id: String
}

#[async_trait]
impl Channel for ExtensionManagementChannel {
    async fn call(&self, ctx: &CallContext, name: &str, arg: Value) -> Result<Value, RpcError> {
        match name {
            "getInstalled" => Ok(Value::Array(self.service.get_installed(ctx).await?)),
            "install" => {
                let mut arg: InstallArg = serde_json::from_value(arg)?;
                ctx.transformer().transform_incoming(&mut arg.location);
                self.service.install(ctx, arg.location).await
            }
            "uninstall" => {
                let arg: UninstallArg = serde_json::from_value(arg)?;
                self.service.uninstall(ctx, &arg.id).await?;
                Ok(Value::Null)
            }
            _ => Err(RpcError::unknown_command("extensions", name))
        }
    }

    fn listen(&self, _ctx: &CallContext, name: &str, _arg: Value) -> Result<EventStream, RpcError> {
        Err(RpcError::unknown_event("extensions", name))
    }
}

/// Inventory-only implementation over the user extension root.
pub struct LocalExtensionManagement {
    user_extensions_dir: PathBuf
}

impl LocalExtensionManagement {
    pub fn new(user_extensions_dir: PathBuf) -> Self {
        LocalExtensionManagement { user_extensions_dir }
    }
}

#[async_trait]
impl ExtensionManagement for LocalExtensionManagement {
    async fn get_installed(&self, ctx: &CallContext) -> Result<Vec<Value>, RpcError> {
        Ok(super::env::scan_root(&self.user_extensions_dir, false, &ctx.transformer()).await)
    }

    async fn install(&self, _ctx: &CallContext, location: UriParts) -> Result<Value, RpcError> {
        Err(RpcError::new(format!("installing {} is not supported by this gateway", location)))
    }

    async fn uninstall(&self, _ctx: &CallContext, id: &str) -> Result<(), RpcError> {
        Err(RpcError::new(format!("uninstalling {} is not supported by this gateway", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::{ExtensionManagementChannel, LocalExtensionManagement};
    use crate::rpc::{CallContext, Channel};
    use serde_json::json;
    use std::sync::Arc;

    fn channel() -> ExtensionManagementChannel {
        let dir = std::env::temp_dir().join(format!("benchgate-ext-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        ExtensionManagementChannel::new(Arc::new(LocalExtensionManagement::new(dir)))
    }

    fn ctx() -> CallContext {
        CallContext { remote_authority: "gw".to_string(), session_id: "T".to_string() }
    }

    #[tokio::test]
    async fn get_installed_answers_with_an_array() {
        let installed = channel().call(&ctx(), "getInstalled", json!(null)).await.unwrap();
        assert!(installed.is_array());
    }

    #[tokio::test]
    async fn mutating_operations_are_delegated_and_rejected_locally() {
        let err = channel()
            .call(&ctx(), "install", json!({"location": {"scheme": "vscode-remote", "authority": "gw", "path": "/x.vsix"}}))
            .await
            .unwrap_err();
        assert!(err.message().contains("not supported"));

        let err = channel().call(&ctx(), "uninstall", json!({"id": "a.b"})).await.unwrap_err();
        assert!(err.message().contains("not supported"));
    }
}
