// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The session broker: one state machine per upgraded socket.
//!
//! After the websocket upgrade the broker awaits the client's control
//! handshake in order — `auth` (answered with `sign`), then
//! `connectionType` — and routes the connection: management sessions
//! stay resident and carry the RPC channels, extension-host sessions are
//! handed to the worker supervisor, tunnels are accepted and idle.
//!
//! Sessions are keyed by the client's reconnection token. A reconnect
//! (`reconnection=true`) never creates a session; it swaps the socket of
//! the resident one and replays unacknowledged traffic.

use crate::http::{self, RequestHead};
use crate::handshake::Upgrade;
use crate::protocol::{Message, PersistentProtocol};
use crate::registry::Registry;
use crate::rpc::fs::DiskFileSystemChannel;
use crate::rpc::{CallContext, ChannelServer, Dispatcher};
use crate::socket::{RawSocket, RemoteSocket, WsSocket};
use crate::supervisor::{self, ExtHostCmd, ExtHostHandle, ExtHostStartParams, HandoffBundle};
use bytes::BytesMut;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Idle heartbeat on management connections.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Mailbox depth for per-session commands.
const SESSION_MAILBOX: usize = 4;

/// Queue depth for outbound RPC responses per session.
const OUTBOUND_QUEUE: usize = 256;

// Configuration //////////////////////////////////////////////////////////////////////////////////

/// Static gateway configuration shared by all sessions.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// The product commit this gateway was built from, if known.
    pub commit: Option<String>,
    /// How long a connection may dawdle before completing the control
    /// handshake.
    pub handshake_timeout: Duration,
    /// The extension-host worker binary.
    pub exthost_binary: PathBuf,
    /// Path handed to the worker via `--uriTransformerPath`.
    pub uri_transformer_path: PathBuf,
    /// Log level handed to workers via `VSCODE_LOG_LEVEL`.
    pub log_level: String
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            commit: None,
            handshake_timeout: Duration::from_secs(30),
            exthost_binary: PathBuf::from("node"),
            uri_transformer_path: PathBuf::from("uriTransformer.js"),
            log_level: "info".to_string()
        }
    }
}

/// Everything a connection needs to be brokered.
pub struct Services {
    pub config: GatewayConfig,
    pub management: Registry<MgmtHandle>,
    pub exthost: Registry<ExtHostHandle>,
    pub channels: Arc<ChannelServer>,
    /// The filesystem channel doubles as the owner of per-session watch
    /// and file-handle state; disposal goes through it.
    pub fs: Option<Arc<DiskFileSystemChannel>>
}

impl Services {
    pub fn new(config: GatewayConfig, channels: ChannelServer, fs: Option<Arc<DiskFileSystemChannel>>) -> Arc<Self> {
        Arc::new(Services {
            config,
            management: Registry::new("management"),
            exthost: Registry::new("exthost"),
            channels: Arc::new(channels),
            fs
        })
    }
}

/// Registry entry of a resident management session.
#[derive(Debug, Clone)]
pub struct MgmtHandle {
    pub cmd: mpsc::Sender<MgmtCmd>
}

/// Commands another connection may send to a resident session.
#[derive(Debug)]
pub enum MgmtCmd {
    /// A freshly handshaken socket replaces the session's current one.
    Reconnect { socket: RemoteSocket<TcpStream>, residual: BytesMut }
}

// Control messages ///////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientControl {
    #[serde(rename = "auth")]
    Auth {},
    #[serde(rename = "connectionType")]
    ConnectionType {
        #[serde(rename = "desiredConnectionType")]
        desired_connection_type: u8,
        #[serde(default)]
        commit: Option<String>,
        #[serde(default)]
        args: Option<Value>
    }
}

const CONNECTION_TYPE_MANAGEMENT: u8 = 1;
const CONNECTION_TYPE_EXTENSION_HOST: u8 = 2;
const CONNECTION_TYPE_TUNNEL: u8 = 3;

// Query //////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
struct Query {
    token: String,
    reconnection: bool,
    skip_frames: bool
}

fn parse_query(head: &RequestHead) -> Result<Query, &'static str> {
    let query = head.query().unwrap_or("");
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut tokens = pairs.iter().filter(|(k, _)| k == "reconnectionToken");
    let token = match (tokens.next(), tokens.next()) {
        (Some((_, t)), None) if !t.is_empty() => t.clone(),
        (Some(_), Some(_)) => return Err("more than one reconnectionToken provided"),
        _ => return Err("missing reconnectionToken")
    };

    let flag = |name: &str| pairs.iter().any(|(k, v)| k == name && v == "true");
    Ok(Query {
        token,
        reconnection: flag("reconnection"),
        skip_frames: flag("skipWebSocketFrames")
    })
}

// Entry point ////////////////////////////////////////////////////////////////////////////////////

/// Broker one upgraded connection. Consumes the socket.
pub async fn handle_connection(head: RequestHead, mut stream: TcpStream, leftover: BytesMut, services: Arc<Services>) {
    let query = match parse_query(&head) {
        Ok(query) => query,
        Err(reason) => {
            log::debug!("rejecting connection: {}", reason);
            let _ = http::respond(&mut stream, 400, &[], reason.as_bytes()).await;
            return
        }
    };

    let upgrade = match Upgrade::from_head(&head) {
        Ok(upgrade) => upgrade,
        Err(e) => {
            log::debug!("rejecting upgrade: {}", e);
            let _ = http::respond(&mut stream, 400, &[], e.to_string().as_bytes()).await;
            return
        }
    };
    let mut response = BytesMut::new();
    upgrade.response_into(&mut response);
    if let Err(e) = tokio::io::AsyncWriteExt::write_all(&mut stream, &response).await {
        log::debug!("failed to complete upgrade: {}", e);
        return
    }

    let prefix = crate::token_prefix(&query.token).to_string();
    let authority = http::remote_authority(&head).unwrap_or_else(|| "localhost".to_string());
    log::debug!(
        "[{}] new connection (reconnection = {}, skipWebSocketFrames = {}, deflate = {})",
        prefix,
        query.reconnection,
        query.skip_frames,
        upgrade.deflate().is_some()
    );

    let socket = if query.skip_frames {
        RemoteSocket::Raw(RawSocket::new(stream, leftover))
    } else {
        RemoteSocket::Ws(WsSocket::new(stream, upgrade.deflate(), leftover))
    };
    let mut protocol = PersistentProtocol::new(socket);

    let handshake = tokio::time::timeout(
        services.config.handshake_timeout,
        control_handshake(&mut protocol, &prefix, &services.config)
    )
    .await;
    let (connection_type, args) = match handshake {
        Ok(Ok(route)) => route,
        Ok(Err(reason)) => return abort(protocol, &prefix, &reason).await,
        Err(_) => return abort(protocol, &prefix, "Handshake timed out").await
    };

    match connection_type {
        CONNECTION_TYPE_MANAGEMENT => management_route(query, authority, protocol, services).await,
        CONNECTION_TYPE_EXTENSION_HOST => exthost_route(query, protocol, services, args).await,
        CONNECTION_TYPE_TUNNEL => tunnel_route(&prefix, protocol).await,
        n => abort(protocol, &prefix, &format!("Unknown initial data received: connection type {}", n)).await
    }
}

// Await `auth` and `connectionType`, in that order.
async fn control_handshake(
    protocol: &mut PersistentProtocol<TcpStream>,
    prefix: &str,
    config: &GatewayConfig
) -> Result<(u8, Option<Value>), String> {
    let mut authed = false;
    loop {
        let bytes = match protocol.read_message().await {
            Ok(Message::Control(bytes)) => bytes,
            Ok(Message::Regular(_)) => return Err("Unexpected regular message during handshake".to_string()),
            Ok(Message::Disconnect) | Ok(Message::Closed) => {
                return Err("Connection closed during handshake".to_string())
            }
            Err(e) => return Err(format!("Protocol error during handshake: {}", e))
        };
        let control = serde_json::from_slice::<ClientControl>(&bytes)
            .map_err(|e| format!("Malformed control message: {}", e))?;
        match control {
            ClientControl::Auth {} => {
                if authed {
                    return Err("Duplicate auth message".to_string())
                }
                authed = true;
                // No signing is performed; the sign step is a placeholder
                // in the current handshake contract.
                let sign = json!({ "type": "sign", "data": "" }).to_string();
                protocol
                    .send_control(sign.as_bytes())
                    .await
                    .map_err(|e| format!("Failed to send sign: {}", e))?
            }
            ClientControl::ConnectionType { desired_connection_type, commit, args } => {
                if !authed {
                    return Err("Received connectionType before auth".to_string())
                }
                if let (Some(ours), Some(theirs)) = (&config.commit, &commit) {
                    if ours != theirs {
                        log::warn!("[{}] client commit {} differs from gateway commit {}", prefix, theirs, ours)
                    }
                }
                return Ok((desired_connection_type, args))
            }
        }
    }
}

/// Write an error control message, drain and drop the connection.
async fn abort(mut protocol: PersistentProtocol<TcpStream>, prefix: &str, reason: &str) {
    log::warn!("[{}] aborting connection: {}", prefix, reason);
    let message = json!({ "type": "error", "reason": reason }).to_string();
    let _ = protocol.send_control(message.as_bytes()).await;
    let _ = protocol.drain().await;
}

// Management /////////////////////////////////////////////////////////////////////////////////////

async fn management_route(
    query: Query,
    authority: String,
    mut protocol: PersistentProtocol<TcpStream>,
    services: Arc<Services>
) {
    let prefix = crate::token_prefix(&query.token).to_string();
    match services.management.lookup(&query.token) {
        None if query.reconnection => {
            abort(protocol, &prefix, "Asking to reconnect but provided token is unknown").await
        }
        None => {
            let (cmd_tx, cmd_rx) = mpsc::channel(SESSION_MAILBOX);
            if !services.management.register(&query.token, MgmtHandle { cmd: cmd_tx }) {
                return abort(protocol, &prefix, "Duplicate reconnection token").await
            }
            let ok = json!({ "type": "ok" }).to_string();
            if protocol.send_control(ok.as_bytes()).await.is_err() || !protocol.is_alive() {
                services.management.remove(&query.token);
                return
            }
            log::info!("[{}] management session connected", prefix);
            run_management_session(query.token, authority, protocol, services, cmd_rx).await
        }
        Some(handle) => {
            // A resident session exists; hand it the fresh socket. The
            // resident task confirms with `ok` and replays unacked data.
            let residual = protocol.read_entire_buffer();
            let socket = protocol.into_socket();
            if handle.cmd.send(MgmtCmd::Reconnect { socket, residual }).await.is_err() {
                log::warn!("[{}] reconnect raced session disposal", prefix)
            }
        }
    }
}

async fn run_management_session(
    token: String,
    authority: String,
    mut protocol: PersistentProtocol<TcpStream>,
    services: Arc<Services>,
    mut cmd_rx: mpsc::Receiver<MgmtCmd>
) {
    let prefix = crate::token_prefix(&token).to_string();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
    let ctx = Arc::new(CallContext { remote_authority: authority, session_id: token.clone() });
    let mut dispatcher = Dispatcher::new(services.channels.clone(), ctx, out_tx);
    let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let disposal_reason = loop {
        tokio::select! {
            message = protocol.read_message(), if protocol.is_alive() => match message {
                Ok(Message::Regular(bytes)) => dispatcher.handle_message(&bytes),
                Ok(Message::Control(bytes)) => {
                    log::debug!("[{}] ignoring control message after handshake: {:?}", prefix, bytes)
                }
                Ok(Message::Disconnect) => break "client disconnected",
                Ok(Message::Closed) => {
                    // The socket is gone but the session survives; a
                    // reconnect may arrive on another connection.
                    log::info!("[{}] socket lost, awaiting reconnection", prefix)
                }
                Err(e) => {
                    log::warn!("[{}] protocol error: {}", prefix, e);
                    break "protocol error"
                }
            },
            command = cmd_rx.recv() => match command {
                Some(MgmtCmd::Reconnect { socket, residual }) => {
                    log::info!("[{}] management session reconnected", prefix);
                    protocol.begin_accept_reconnection(socket, &residual);
                    let ok = json!({ "type": "ok" }).to_string();
                    let _ = protocol.send_control(ok.as_bytes()).await;
                    if let Err(e) = protocol.end_accept_reconnection().await {
                        log::warn!("[{}] replay failed: {}", prefix, e)
                    }
                }
                None => break "registry entry dropped"
            },
            Some(bytes) = out_rx.recv() => {
                if let Err(e) = protocol.send(&bytes).await {
                    log::warn!("[{}] {}", prefix, e);
                    break "send buffer overflow"
                }
            },
            _ = keep_alive.tick() => protocol.send_keep_alive().await
        }
    };

    log::info!("[{}] management session disposed: {}", prefix, disposal_reason);
    services.management.remove(&token);
    dispatcher.dispose();
    if let Some(fs) = &services.fs {
        fs.dispose_owner(&token).await
    }
    protocol.send_disconnect().await;
    let _ = protocol.drain().await;
}

// Extension host /////////////////////////////////////////////////////////////////////////////////

async fn exthost_route(
    query: Query,
    mut protocol: PersistentProtocol<TcpStream>,
    services: Arc<Services>,
    args: Option<Value>
) {
    let prefix = crate::token_prefix(&query.token).to_string();
    let params = ExtHostStartParams::from_args(args);

    match services.exthost.lookup(&query.token) {
        None if query.reconnection => {
            abort(protocol, &prefix, "Asking to reconnect but provided token is unknown").await
        }
        None => {
            // Debug port 0 means "pick one for me".
            let debug_port = match params.port {
                Some(0) => match supervisor::find_free_debug_port().await {
                    Some(port) => Some(port),
                    None => return abort(protocol, &prefix, "Could not allocate a free debug port").await
                },
                other => other
            };

            let handle = match supervisor::spawn(&query.token, &services, &params, debug_port) {
                Ok(handle) => handle,
                Err(e) => {
                    return abort(protocol, &prefix, &format!("Could not start the extension host: {}", e)).await
                }
            };
            if !services.exthost.register(&query.token, handle.clone()) {
                // Dropping the handle shuts the fresh worker down.
                return abort(protocol, &prefix, "Duplicate reconnection token").await
            }
            log::info!("[{}] extension host session connected (debug port {:?})", prefix, debug_port);
            attach_exthost(protocol, &prefix, debug_port, handle).await
        }
        Some(handle) => {
            if handle.cmd.is_closed() {
                return abort(protocol, &prefix, "Extension host is not defined").await
            }
            log::info!("[{}] extension host session reconnected", prefix);
            attach_exthost(protocol, &prefix, params.port, handle).await
        }
    }
}

// Finish the extension-host handshake and pass the socket to the
// supervisor: `{debugPort}` control, `ok`, drain, then hand-off.
async fn attach_exthost(
    mut protocol: PersistentProtocol<TcpStream>,
    prefix: &str,
    debug_port: Option<u16>,
    handle: ExtHostHandle
) {
    let connect = match debug_port {
        Some(port) => json!({ "debugPort": port }),
        None => json!({})
    };
    let _ = protocol.send_control(connect.to_string().as_bytes()).await;
    let ok = json!({ "type": "ok" }).to_string();
    let _ = protocol.send_control(ok.as_bytes()).await;
    // Shrink the peer's replay buffer before the worker takes over.
    protocol.flush_ack().await;
    if protocol.drain().await.is_err() || !protocol.is_alive() {
        log::warn!("[{}] socket died before hand-off", prefix);
        return
    }

    let initial_data = protocol.read_entire_buffer();
    let handoff = protocol.into_socket().into_handoff();
    if handle.cmd.send(ExtHostCmd::Attach { bundle: HandoffBundle { handoff, initial_data } }).await.is_err() {
        log::warn!("[{}] extension host went away during attach", prefix)
    }
}

// Tunnel /////////////////////////////////////////////////////////////////////////////////////////

// Tunnels are accepted and ignored; the connection idles until the
// client goes away.
async fn tunnel_route(prefix: &str, mut protocol: PersistentProtocol<TcpStream>) {
    log::info!("[{}] tunnel connection accepted (tunnels are not served, idling)", prefix);
    let ok = json!({ "type": "ok" }).to_string();
    let _ = protocol.send_control(ok.as_bytes()).await;
    loop {
        match protocol.read_message().await {
            Ok(Message::Disconnect) | Ok(Message::Closed) | Err(_) => break,
            Ok(_) => ()
        }
    }
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::{GatewayConfig, Services};
    use crate::http;
    use crate::rpc::logger::LoggerChannel;
    use crate::rpc::ChannelServer;
    use bytes::{Buf, BufMut, BytesMut};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const MSG_REGULAR: u8 = 1;
    const MSG_CONTROL: u8 = 2;

    fn services() -> Arc<Services> {
        let mut channels = ChannelServer::new();
        channels.register("logger", Arc::new(LoggerChannel));
        Services::new(GatewayConfig::default(), channels, None)
    }

    async fn start_gateway(services: Arc<Services>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break
                };
                let services = services.clone();
                tokio::spawn(async move {
                    let mut buffer = BytesMut::new();
                    if let Ok(Some(head)) = http::read_request_head(&mut stream, &mut buffer).await {
                        if head.is_websocket_upgrade() {
                            super::handle_connection(head, stream, buffer, services).await
                        }
                    }
                });
            }
        });
        addr
    }

    /// A raw-protocol test client (skipWebSocketFrames=true).
    struct TestClient {
        stream: TcpStream,
        incoming: BytesMut
    }

    impl TestClient {
        async fn connect(addr: SocketAddr, token: &str, reconnection: bool) -> std::io::Result<TestClient> {
            let mut stream = TcpStream::connect(addr).await?;
            let request = format!(
                "GET /?reconnectionToken={}&reconnection={}&skipWebSocketFrames=true HTTP/1.1\r\n\
                 Host: localhost\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Version: 13\r\n\
                 Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
                token, reconnection
            );
            stream.write_all(request.as_bytes()).await?;

            // Read the upgrade response head.
            let mut response = Vec::new();
            let mut byte = [0_u8; 1];
            while !response.ends_with(b"\r\n\r\n") {
                stream.read_exact(&mut byte).await?;
                response.push(byte[0]);
            }
            let status = String::from_utf8_lossy(&response);
            assert!(status.starts_with("HTTP/1.1 101"), "unexpected response: {}", status);
            Ok(TestClient { stream, incoming: BytesMut::new() })
        }

        async fn expect_status(addr: SocketAddr, path_and_query: &str, status: &str) {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let request = format!(
                "GET {} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                 Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
                path_and_query
            );
            stream.write_all(request.as_bytes()).await.unwrap();
            let mut response = vec![0_u8; 512];
            let n = stream.read(&mut response).await.unwrap();
            let response = String::from_utf8_lossy(&response[.. n]).into_owned();
            assert!(response.starts_with(status), "expected {}, got: {}", status, response);
        }

        async fn send(&mut self, msg_type: u8, id: u32, payload: &[u8]) {
            let mut buf = BytesMut::with_capacity(13 + payload.len());
            buf.put_u8(msg_type);
            buf.put_u32(id);
            buf.put_u32(0); // ack: this client never acknowledges
            buf.put_u32(payload.len() as u32);
            buf.extend_from_slice(payload);
            self.stream.write_all(&buf).await.unwrap();
        }

        async fn send_control(&mut self, value: Value) {
            self.send(MSG_CONTROL, 0, value.to_string().as_bytes()).await
        }

        async fn send_regular(&mut self, id: u32, value: Value) {
            self.send(MSG_REGULAR, id, value.to_string().as_bytes()).await
        }

        /// Read the next message off the wire.
        async fn next_message(&mut self) -> std::io::Result<(u8, u32, Vec<u8>)> {
            loop {
                if self.incoming.len() >= 13 {
                    let len = u32::from_be_bytes([
                        self.incoming[9],
                        self.incoming[10],
                        self.incoming[11],
                        self.incoming[12]
                    ]) as usize;
                    if self.incoming.len() >= 13 + len {
                        let msg_type = self.incoming[0];
                        let id = u32::from_be_bytes([
                            self.incoming[1],
                            self.incoming[2],
                            self.incoming[3],
                            self.incoming[4]
                        ]);
                        self.incoming.advance(13);
                        let payload = self.incoming.split_to(len).to_vec();
                        return Ok((msg_type, id, payload))
                    }
                }
                let mut chunk = [0_u8; 4096];
                let n = self.stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(std::io::ErrorKind::UnexpectedEof.into())
                }
                self.incoming.extend_from_slice(&chunk[.. n]);
            }
        }

        /// The next control message, skipping acks and keep-alives.
        async fn next_control(&mut self) -> Value {
            loop {
                let (msg_type, _, payload) = self.next_message().await.unwrap();
                if msg_type == MSG_CONTROL {
                    return serde_json::from_slice(&payload).unwrap()
                }
            }
        }

        /// The next regular message, skipping acks and keep-alives.
        async fn next_regular(&mut self) -> (u32, Value) {
            loop {
                let (msg_type, id, payload) = self.next_message().await.unwrap();
                if msg_type == MSG_REGULAR {
                    return (id, serde_json::from_slice(&payload).unwrap())
                }
            }
        }

        /// Run the auth/connectionType handshake.
        async fn handshake(&mut self, connection_type: u8) -> Value {
            self.send_control(json!({ "type": "auth", "auth": "" })).await;
            let sign = self.next_control().await;
            assert_eq!(sign["type"], "sign");
            assert_eq!(sign["data"], "");
            self.send_control(json!({
                "type": "connectionType",
                "desiredConnectionType": connection_type,
                "commit": "abc"
            }))
            .await;
            self.next_control().await
        }
    }

    #[tokio::test]
    async fn fresh_management_handshake() {
        let services = services();
        let addr = start_gateway(services.clone()).await;

        let mut client = TestClient::connect(addr, "T1", false).await.unwrap();
        let reply = client.handshake(1).await;
        assert_eq!(reply, json!({ "type": "ok" }));

        // The session is registered exactly once.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(services.management.len(), 1);
        assert!(services.management.lookup("T1").is_some());
        assert!(services.exthost.lookup("T1").is_none());
    }

    #[tokio::test]
    async fn unknown_reconnect_is_aborted() {
        let services = services();
        let addr = start_gateway(services.clone()).await;

        let mut client = TestClient::connect(addr, "T99", true).await.unwrap();
        let reply = client.handshake(1).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["reason"], "Asking to reconnect but provided token is unknown");

        // The gateway closes the socket after the error.
        loop {
            match client.next_message().await {
                Ok(_) => continue,
                Err(_) => break
            }
        }
        assert!(services.management.lookup("T99").is_none());
    }

    #[tokio::test]
    async fn management_reconnect_replays_unacked_traffic() {
        let services = services();
        let addr = start_gateway(services.clone()).await;

        let mut first = TestClient::connect(addr, "T1", false).await.unwrap();
        assert_eq!(first.handshake(1).await["type"], "ok");

        // Provoke a reply that will stay unacknowledged.
        first
            .send_regular(1, json!({ "id": 1, "type": "promise", "channel": "logger", "name": "flush" }))
            .await;
        let (seq, reply) = first.next_regular().await;
        assert_eq!(reply, json!({ "id": 1, "type": "reply", "data": null }));
        drop(first);

        // Reconnect: ok first, then the replayed reply.
        let mut second = TestClient::connect(addr, "T1", true).await.unwrap();
        assert_eq!(second.handshake(1).await["type"], "ok");
        let (replayed_seq, replayed) = second.next_regular().await;
        assert_eq!(replayed_seq, seq);
        assert_eq!(replayed, reply);

        // Still exactly one session.
        assert_eq!(services.management.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_disposes_the_session() {
        let services = services();
        let addr = start_gateway(services.clone()).await;

        let mut client = TestClient::connect(addr, "T1", false).await.unwrap();
        assert_eq!(client.handshake(1).await["type"], "ok");
        client.send(5, 0, &[]).await; // disconnect

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while services.management.lookup("T1").is_some() {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await
            }
        })
        .await
        .expect("session should be removed after a disconnect");
    }

    #[tokio::test]
    async fn tunnel_connections_are_accepted() {
        let services = services();
        let addr = start_gateway(services.clone()).await;

        let mut client = TestClient::connect(addr, "T7", false).await.unwrap();
        let reply = client.handshake(3).await;
        assert_eq!(reply, json!({ "type": "ok" }));
    }

    #[tokio::test]
    async fn malformed_queries_are_rejected_before_the_upgrade() {
        let services = services();
        let addr = start_gateway(services).await;

        TestClient::expect_status(addr, "/", "HTTP/1.1 400").await;
        TestClient::expect_status(addr, "/?reconnectionToken=a&reconnectionToken=b", "HTTP/1.1 400").await;
    }
}
