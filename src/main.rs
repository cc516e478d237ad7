// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Gateway entry point: parse flags, wire the channel set, bind the
//! listener and accept connections until interrupted.

use benchgate::broker::{self, GatewayConfig, Services};
use benchgate::http::{self, HttpConfig};
use benchgate::rpc::debug::ExtensionHostDebugChannel;
use benchgate::rpc::env::{EnvironmentPaths, RemoteExtensionsEnvironmentChannel};
use benchgate::rpc::extensions::{ExtensionManagementChannel, LocalExtensionManagement};
use benchgate::rpc::fs::DiskFileSystemChannel;
use benchgate::rpc::logger::{LogLevelChannel, LoggerChannel};
use benchgate::rpc::terminal::RemoteTerminalChannel;
use benchgate::rpc::ChannelServer;
use bytes::BytesMut;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Debug, Parser)]
#[command(name = "benchgate", about = "Remote workbench gateway", version)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Root directory of the workbench web assets.
    #[arg(long, default_value = "web")]
    web_root: PathBuf,

    /// Banner shown by the workbench on first load.
    #[arg(long)]
    welcome_banner: Option<String>,

    /// Extension host worker binary.
    #[arg(long, default_value = "node")]
    exthost_binary: PathBuf,

    /// Path handed to workers via --uriTransformerPath.
    #[arg(long, default_value = "out/uriTransformer.js")]
    uri_transformer_path: PathBuf,

    /// Product commit of the workbench build, if known.
    #[arg(long)]
    commit: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Per-user state directory.
    #[arg(long, default_value = ".benchgate/user-data")]
    user_data_dir: PathBuf,

    /// Gateway log directory, reported to clients.
    #[arg(long, default_value = ".benchgate/logs")]
    logs_dir: PathBuf,

    /// Built-in extensions root.
    #[arg(long, default_value = "extensions")]
    builtin_extensions_dir: PathBuf,

    /// User extensions root.
    #[arg(long, default_value = ".benchgate/extensions")]
    user_extensions_dir: PathBuf,

    /// Seconds a connection may take to complete the control handshake.
    #[arg(long, default_value_t = 30)]
    handshake_timeout: u64
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .parse_filters(&format!("info,benchgate={}", args.log_level))
        .init();

    // Keep serving other sessions when a task blows up; the hook is the
    // single sink for anything uncaught.
    std::panic::set_hook(Box::new(|info| {
        log::error!("uncaught panic: {}", info)
    }));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("failed to start runtime: {}", e);
            return ExitCode::FAILURE
        }
    };
    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("startup failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> std::io::Result<()> {
    let fs = Arc::new(DiskFileSystemChannel::new());
    let environment = EnvironmentPaths {
        app_root: args.web_root.clone(),
        user_data_dir: args.user_data_dir.clone(),
        logs_dir: args.logs_dir.clone(),
        builtin_extensions_dir: args.builtin_extensions_dir.clone(),
        user_extensions_dir: args.user_extensions_dir.clone()
    };

    let mut channels = ChannelServer::new();
    channels
        .register("logLevel", Arc::new(LogLevelChannel))
        .register("logger", Arc::new(LoggerChannel))
        .register("remoteextensionsenvironment", Arc::new(RemoteExtensionsEnvironmentChannel::new(environment)))
        .register("remotefilesystem", fs.clone())
        .register("remoteterminal", Arc::new(RemoteTerminalChannel))
        .register(
            "extensions",
            Arc::new(ExtensionManagementChannel::new(Arc::new(LocalExtensionManagement::new(
                args.user_extensions_dir.clone()
            ))))
        )
        .register("extensionHostDebugBroadcast", Arc::new(ExtensionHostDebugChannel::new()));

    let config = GatewayConfig {
        commit: args.commit.clone(),
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        exthost_binary: args.exthost_binary.clone(),
        uri_transformer_path: args.uri_transformer_path.clone(),
        log_level: args.log_level.clone()
    };
    let services = Services::new(config, channels, Some(fs));
    let http_config = Arc::new(HttpConfig { web_root: args.web_root.clone(), welcome_banner: args.welcome_banner.clone() });

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    std::env::set_var("VSCODE_PID", std::process::id().to_string());
    log::info!("gateway listening on {}:{}", args.host, args.port);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                        continue
                    }
                };
                log::debug!("connection from {}", peer);
                let services = services.clone();
                let http_config = http_config.clone();
                tokio::spawn(handle(stream, services, http_config));
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, shutting down");
                return Ok(())
            }
        }
    }
}

async fn handle(mut stream: tokio::net::TcpStream, services: Arc<Services>, http_config: Arc<HttpConfig>) {
    let mut buffer = BytesMut::new();
    let head = match http::read_request_head(&mut stream, &mut buffer).await {
        Ok(Some(head)) => head,
        Ok(None) => return,
        Err(e) => {
            log::debug!("dropping connection: {}", e);
            let _ = http::respond(&mut stream, 400, &[], b"malformed request").await;
            return
        }
    };

    if head.is_websocket_upgrade() {
        broker::handle_connection(head, stream, buffer, services).await
    } else if let Err(e) = http::serve(&head, &mut stream, &http_config).await {
        log::debug!("failed to serve {} {}: {}", head.method, head.path(), e)
    }
}
