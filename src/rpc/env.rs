// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The `remoteextensionsenvironment` channel: static facts about the
//! gateway process plus the extension scanner that inventories the
//! built-in and user extension roots.

use crate::rpc::uri::{UriParts, UriTransformer};
use crate::rpc::{CallContext, Channel, EventStream, RpcError};
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Filesystem roots the environment channel reports to clients.
#[derive(Debug, Clone)]
pub struct EnvironmentPaths {
    pub app_root: PathBuf,
    pub user_data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub builtin_extensions_dir: PathBuf,
    pub user_extensions_dir: PathBuf
}

pub struct RemoteExtensionsEnvironmentChannel {
    paths: EnvironmentPaths
}

impl RemoteExtensionsEnvironmentChannel {
    pub fn new(paths: EnvironmentPaths) -> Self {
        RemoteExtensionsEnvironmentChannel { paths }
    }
}

#[derive(Debug, Deserialize)]
struct ScanSingleArg {
    #[serde(rename = "extensionLocation")]
    extension_location: UriParts,
    #[serde(rename = "isBuiltin", default)]
    is_builtin: bool
}

#[async_trait]
impl Channel for RemoteExtensionsEnvironmentChannel {
    async fn call(&self, ctx: &CallContext, name: &str, arg: Value) -> Result<Value, RpcError> {
        let transformer = ctx.transformer();
        match name {
            "getEnvironmentData" => Ok(self.environment_data(&transformer)),
            "scanExtensions" => {
                let mut extensions = scan_root(&self.paths.builtin_extensions_dir, true, &transformer).await;
                extensions.extend(scan_root(&self.paths.user_extensions_dir, false, &transformer).await);
                Ok(Value::Array(extensions))
            }
            "scanSingleExtension" => {
                let mut arg: ScanSingleArg = serde_json::from_value(arg)?;
                transformer.transform_incoming(&mut arg.extension_location);
                let path = arg
                    .extension_location
                    .as_file_path()
                    .ok_or_else(|| RpcError::new("extensionLocation is not a file resource"))?
                    .to_path_buf();
                match scan_extension(&path, arg.is_builtin, &transformer).await {
                    Some(description) => Ok(description),
                    None => Ok(Value::Null)
                }
            }
            _ => Err(RpcError::unknown_command("remoteextensionsenvironment", name))
        }
    }

    fn listen(&self, _ctx: &CallContext, name: &str, _arg: Value) -> Result<EventStream, RpcError> {
        Err(RpcError::unknown_event("remoteextensionsenvironment", name))
    }
}

impl RemoteExtensionsEnvironmentChannel {
    fn environment_data(&self, transformer: &UriTransformer) -> Value {
        let file_uri = |path: &Path| {
            let mut uri = UriParts::from_file_path(path);
            transformer.transform_outgoing(&mut uri);
            serde_json::to_value(uri).unwrap_or(Value::Null)
        };
        json!({
            "pid": std::process::id(),
            "connectionToken": fresh_connection_token(),
            "appRoot": file_uri(&self.paths.app_root),
            "settingsPath": file_uri(&self.paths.user_data_dir.join("Machine").join("settings.json")),
            "logsPath": file_uri(&self.paths.logs_dir),
            "extensionsPath": file_uri(&self.paths.user_extensions_dir),
            "globalStorageHome": file_uri(&self.paths.user_data_dir.join("globalStorage")),
            "workspaceStorageHome": file_uri(&self.paths.user_data_dir.join("workspaceStorage")),
            "os": operating_system(),
            "arch": std::env::consts::ARCH,
            "marks": [],
            "useHostProxy": false
        })
    }
}

/// A fresh opaque token, minted per environment query.
fn fresh_connection_token() -> String {
    let mut rng = rand::thread_rng();
    (0 .. 32).map(|_| format!("{:x}", rng.gen_range(0 .. 16))).collect()
}

// Operating system ids as the workbench encodes them.
fn operating_system() -> u8 {
    if cfg!(windows) {
        1
    } else if cfg!(target_os = "macos") {
        2
    } else {
        3
    }
}

// Extension scanning /////////////////////////////////////////////////////////////////////////////

/// Scan every extension directory under `root`.
pub async fn scan_root(root: &Path, builtin: bool, transformer: &UriTransformer) -> Vec<Value> {
    let mut extensions = Vec::new();
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("extension root {} not readable: {}", root.display(), e);
            return extensions
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.is_dir() {
            continue
        }
        if let Some(description) = scan_extension(&path, builtin, transformer).await {
            extensions.push(description)
        }
    }
    extensions
}

/// Read and validate one extension directory's `package.json`.
pub async fn scan_extension(dir: &Path, builtin: bool, transformer: &UriTransformer) -> Option<Value> {
    let manifest_path = dir.join("package.json");
    let raw = match tokio::fs::read(&manifest_path).await {
        Ok(raw) => raw,
        Err(_) => return None
    };
    let manifest: Value = match serde_json::from_slice(&raw) {
        Ok(manifest) => manifest,
        Err(e) => {
            log::warn!("ignoring {}: {}", manifest_path.display(), e);
            return None
        }
    };

    let name = manifest.get("name")?.as_str()?;
    let publisher = manifest.get("publisher")?.as_str()?;
    if manifest.get("version")?.as_str().is_none() {
        return None
    }

    let mut location = UriParts::from_file_path(dir);
    transformer.transform_outgoing(&mut location);

    Some(json!({
        "identifier": { "id": format!("{}.{}", publisher, name) },
        "extensionLocation": location,
        "isBuiltin": builtin,
        "packageJSON": manifest
    }))
}
