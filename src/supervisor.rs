// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The extension-host supervisor: owns one worker subprocess per
//! extension-host session and performs the socket hand-off.
//!
//! The worker is forked with an IPC socketpair installed at fd 3
//! (announced via `NODE_CHANNEL_FD`); messages on it are
//! newline-delimited JSON. Once the worker reports
//! `VSCODE_EXTHOST_IPC_READY`, the supervisor transfers the client's
//! live TCP socket with `sendmsg` + `SCM_RIGHTS`, together with any
//! buffered protocol bytes (`initialDataChunk`) and the recorded inflate
//! tail (`inflateBytes`) that seeds the worker's decompressor. The
//! worker outlives any single socket: a reconnect repeats the hand-off
//! on a fresh socket without forking.
//!
//! States: `NEW → STARTED → ATTACHED ⇄ REATTACHING → DEAD`.

use crate::broker::Services;
use crate::socket::Handoff;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{self, BufRead, BufReader};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::mpsc;

/// The fd number the worker expects its IPC channel on.
const IPC_FD: RawFd = 3;

/// Random probes when hunting for a free debug port: 600 base points,
/// 10 consecutive ports each.
const PORT_BASE_ATTEMPTS: u32 = 600;
const PORT_RANGE_SPAN: u16 = 10;

// Start parameters ///////////////////////////////////////////////////////////////////////////////

/// Remote start parameters sent by the client with `connectionType`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtHostStartParams {
    #[serde(default = "default_language")]
    pub language: String,
    /// Requested inspector port; 0 asks the gateway to pick one.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(rename = "break", default)]
    pub break_on_entry: bool
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for ExtHostStartParams {
    fn default() -> Self {
        ExtHostStartParams { language: default_language(), port: None, break_on_entry: false }
    }
}

impl ExtHostStartParams {
    /// Merge the client's `args` with the defaults. Malformed args fall
    /// back to the defaults rather than failing the connection.
    pub fn from_args(args: Option<Value>) -> Self {
        args.and_then(|value| serde_json::from_value(value).ok()).unwrap_or_default()
    }
}

// Handles and commands ///////////////////////////////////////////////////////////////////////////

/// Registry entry of an extension-host session: the mailbox of its
/// supervisor task. Dropping the last handle shuts the worker down.
#[derive(Debug, Clone)]
pub struct ExtHostHandle {
    pub cmd: mpsc::Sender<ExtHostCmd>
}

#[derive(Debug)]
pub enum ExtHostCmd {
    /// Hand the worker a (re)connected socket.
    Attach { bundle: HandoffBundle }
}

/// Everything the worker needs to continue a client connection.
#[derive(Debug)]
pub struct HandoffBundle {
    pub handoff: Handoff<TcpStream>,
    /// Protocol bytes received but not consumed before the hand-off.
    pub initial_data: BytesMut
}

// Worker messages ////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WorkerMessage {
    #[serde(rename = "VSCODE_EXTHOST_IPC_READY")]
    Ready,
    #[serde(rename = "__$console")]
    Console {
        #[serde(default)]
        severity: String,
        /// A JSON array, encoded as a string.
        #[serde(default)]
        arguments: String
    }
}

// Spawn //////////////////////////////////////////////////////////////////////////////////////////

/// Fork the worker and start its supervisor task.
///
/// Returns once the OS has a PID; the IPC-ready handshake and the socket
/// hand-off happen asynchronously on the supervisor task.
pub fn spawn(
    token: &str,
    services: &Arc<Services>,
    params: &ExtHostStartParams,
    debug_port: Option<u16>
) -> io::Result<ExtHostHandle> {
    let prefix = crate::token_prefix(token).to_string();
    let (ipc, worker_ipc) = StdUnixStream::pair()?;

    let (program, args, envs) = worker_invocation(
        &services.config.exthost_binary,
        &services.config.uri_transformer_path,
        &services.config.log_level,
        params,
        debug_port
    );
    let mut command = Command::new(program);
    command
        .args(args)
        .envs(envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let worker_fd = worker_ipc.into_raw_fd();
    unsafe {
        command.pre_exec(move || {
            // Installing the channel at the well-known fd also clears
            // its close-on-exec flag.
            if libc::dup2(worker_fd, IPC_FD) == -1 {
                return Err(io::Error::last_os_error())
            }
            Ok(())
        });
    }

    let mut child = command.spawn()?;
    // The worker holds its own duplicate now.
    unsafe { libc::close(worker_fd) };

    let pid = child.id().unwrap_or(0);
    log::info!("[{}] forked extension host (pid {}, debug port {:?})", prefix, pid, debug_port);

    if let Some(stdout) = child.stdout.take() {
        pipe_logger(stdout, prefix.clone(), "stdout");
    }
    if let Some(stderr) = child.stderr.take() {
        pipe_logger(stderr, prefix.clone(), "stderr");
    }

    let (ipc_tx, ipc_rx) = mpsc::channel(16);
    let ipc_reader = ipc.try_clone()?;
    std::thread::spawn(move || ipc_read_loop(ipc_reader, ipc_tx));

    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    let token = token.to_string();
    let services = services.clone();
    tokio::spawn(supervise(token, prefix, services, child, ipc, cmd_rx, ipc_rx));

    Ok(ExtHostHandle { cmd: cmd_tx })
}

/// The worker's argv and environment, per the extension-host contract.
fn worker_invocation(
    binary: &PathBuf,
    uri_transformer_path: &PathBuf,
    log_level: &str,
    params: &ExtHostStartParams,
    debug_port: Option<u16>
) -> (PathBuf, Vec<String>, Vec<(String, String)>) {
    let mut args = Vec::new();
    if let Some(port) = debug_port {
        let flag = if params.break_on_entry { "--inspect-brk" } else { "--inspect" };
        args.push(format!("{}=0.0.0.0:{}", flag, port))
    }
    args.push("--type=extensionHost".to_string());
    args.push(format!("--uriTransformerPath={}", uri_transformer_path.display()));

    let nls = json!({ "locale": params.language, "availableLanguages": {} }).to_string();
    let envs = vec![
        ("VSCODE_AMD_ENTRYPOINT".to_string(), "vs/workbench/services/extensions/node/extensionHostProcess".to_string()),
        ("VSCODE_PIPE_LOGGING".to_string(), "true".to_string()),
        ("VSCODE_VERBOSE_LOGGING".to_string(), "true".to_string()),
        ("VSCODE_LOG_NATIVE".to_string(), "false".to_string()),
        ("VSCODE_EXTHOST_WILL_SEND_SOCKET".to_string(), "true".to_string()),
        ("VSCODE_HANDLES_UNCAUGHT_ERRORS".to_string(), "true".to_string()),
        ("VSCODE_LOG_STACK".to_string(), "true".to_string()),
        ("VSCODE_NLS_CONFIG".to_string(), nls),
        ("VSCODE_LOG_LEVEL".to_string(), log_level.to_string()),
        ("NODE_CHANNEL_FD".to_string(), IPC_FD.to_string()),
    ];
    (binary.clone(), args, envs)
}

// Supervision ////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Forked, awaiting `VSCODE_EXTHOST_IPC_READY`.
    Started,
    /// The worker owns a client socket.
    Attached
}

async fn supervise(
    token: String,
    prefix: String,
    services: Arc<Services>,
    mut child: tokio::process::Child,
    ipc: StdUnixStream,
    mut cmd_rx: mpsc::Receiver<ExtHostCmd>,
    mut ipc_rx: mpsc::Receiver<WorkerMessage>
) {
    let mut state = State::Started;
    let mut pending: Option<HandoffBundle> = None;

    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => log::info!("[{}] extension host exited: {}", prefix, status),
                    Err(e) => log::warn!("[{}] extension host wait failed: {}", prefix, e)
                }
                break
            },
            message = ipc_rx.recv() => match message {
                Some(WorkerMessage::Ready) => {
                    log::debug!("[{}] extension host ipc ready", prefix);
                    state = State::Attached;
                    if let Some(bundle) = pending.take() {
                        send_exthost_ipc_socket(&ipc, bundle, &prefix)
                    }
                }
                Some(WorkerMessage::Console { severity, arguments }) => {
                    forward_console(&prefix, &severity, &arguments)
                }
                None => {
                    log::warn!("[{}] extension host ipc channel closed", prefix);
                    break
                }
            },
            command = cmd_rx.recv() => match command {
                Some(ExtHostCmd::Attach { bundle }) => match state {
                    // Queue until the worker says it is ready.
                    State::Started => pending = Some(bundle),
                    // Reattach: the worker installs the new socket into
                    // its existing session.
                    State::Attached => send_exthost_ipc_socket(&ipc, bundle, &prefix)
                },
                None => {
                    log::info!("[{}] extension host session dropped, stopping worker", prefix);
                    break
                }
            }
        }
    }

    // Dispose: drop the table entry, make sure the worker is gone.
    services.exthost.remove(&token);
    if let Err(e) = child.kill().await {
        log::debug!("[{}] worker already gone: {}", prefix, e)
    }
    log::info!("[{}] extension host session disposed", prefix)
}

// Hand-off ///////////////////////////////////////////////////////////////////////////////////////

// Transfer a connected socket to the worker: one `VSCODE_EXTHOST_IPC_SOCKET`
// message with the fd as SCM_RIGHTS ancillary data.
fn send_exthost_ipc_socket(ipc: &StdUnixStream, bundle: HandoffBundle, prefix: &str) {
    let HandoffBundle { handoff, initial_data } = bundle;
    let Handoff { socket, undecoded, inflate_bytes, permessage_deflate, skip_frames } = handoff;

    if !undecoded.is_empty() {
        // The client is supposed to be quiet while awaiting the
        // handshake response; a partial frame here cannot be forwarded.
        log::warn!("[{}] {} undecoded bytes at hand-off are dropped", prefix, undecoded.len())
    }

    let message = json!({
        "type": "VSCODE_EXTHOST_IPC_SOCKET",
        "initialDataChunk": BASE64.encode(&initial_data),
        "skipWebSocketFrames": skip_frames,
        "permessageDeflate": permessage_deflate,
        "inflateBytes": BASE64.encode(&inflate_bytes)
    });
    let mut payload = message.to_string().into_bytes();
    payload.push(b'\n');

    let socket = match socket.into_std() {
        Ok(socket) => socket,
        Err(e) => {
            log::error!("[{}] could not detach socket for hand-off: {}", prefix, e);
            return
        }
    };
    if let Err(e) = socket.set_nonblocking(false) {
        log::warn!("[{}] could not restore blocking mode: {}", prefix, e)
    }
    let fd = socket.into_raw_fd();
    match send_with_fd(ipc, &payload, fd) {
        Ok(n) => log::debug!(
            "[{}] sent socket to extension host ({} bytes, {} initial, deflate = {})",
            prefix,
            n,
            initial_data.len(),
            permessage_deflate
        ),
        Err(e) => log::error!("[{}] socket hand-off failed: {}", prefix, e)
    }
    // The worker owns its duplicate; release ours.
    unsafe { libc::close(fd) };
}

/// Send `data` with `fd` attached as `SCM_RIGHTS` ancillary data in the
/// same `sendmsg` call.
fn send_with_fd(socket: &StdUnixStream, data: &[u8], fd: RawFd) -> io::Result<usize> {
    let fd_size = std::mem::size_of::<RawFd>();
    // CMSG_SPACE includes the cmsghdr overhead.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0_u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len()
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        let data_ptr = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
        *data_ptr = fd;
    }

    let sent = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, 0) };
    if sent < 0 {
        return Err(io::Error::last_os_error())
    }
    Ok(sent as usize)
}

// IPC reading ////////////////////////////////////////////////////////////////////////////////////

// Blocking newline-delimited JSON reader; runs on its own thread for
// the lifetime of the worker.
fn ipc_read_loop(stream: StdUnixStream, tx: mpsc::Sender<WorkerMessage>) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => ()
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue
        }
        match serde_json::from_str::<WorkerMessage>(trimmed) {
            Ok(message) => {
                if tx.blocking_send(message).is_err() {
                    return
                }
            }
            Err(_) => log::trace!("unhandled worker ipc message: {}", trimmed)
        }
    }
}

// Forward one worker console entry to the gateway log. `arguments` is a
// JSON array string; only the first element is forwarded.
fn forward_console(prefix: &str, severity: &str, arguments: &str) {
    let first = serde_json::from_str::<Value>(arguments)
        .ok()
        .and_then(|v| v.as_array().and_then(|a| a.first().cloned()));
    let message = match first {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => arguments.to_string()
    };
    match severity {
        "error" => log::error!("[exthost {}] {}", prefix, message),
        "warn" => log::warn!("[exthost {}] {}", prefix, message),
        _ => log::info!("[exthost {}] {}", prefix, message)
    }
}

// Log a worker output stream chunk by chunk.
fn pipe_logger<R>(stream: R, prefix: String, name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static
{
    tokio::spawn(async move {
        let mut stream = stream;
        let mut chunk = [0_u8; 4096];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&chunk[.. n]);
                    let text = text.trim_end();
                    if !text.is_empty() {
                        log::info!("[exthost {}] {}: {}", prefix, name, text)
                    }
                }
            }
        }
    });
}

// Debug ports ////////////////////////////////////////////////////////////////////////////////////

/// Find a free TCP port for the inspector: random base, a window of 10
/// consecutive candidates, up to 6000 probes in total.
pub async fn find_free_debug_port() -> Option<u16> {
    let mut rng_base = || {
        let mut rng = rand::thread_rng();
        rng.gen_range(1025 ..= u16::MAX - PORT_RANGE_SPAN)
    };
    for _ in 0 .. PORT_BASE_ATTEMPTS {
        let base = rng_base();
        for port in base .. base + PORT_RANGE_SPAN {
            if tokio::net::TcpListener::bind(("0.0.0.0", port)).await.is_ok() {
                return Some(port)
            }
        }
    }
    None
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::{find_free_debug_port, ipc_read_loop, send_with_fd, worker_invocation, ExtHostStartParams, WorkerMessage};
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    #[test]
    fn start_params_merge_defaults() {
        let params = ExtHostStartParams::from_args(None);
        assert_eq!(params.language, "en");
        assert_eq!(params.port, None);
        assert!(!params.break_on_entry);

        let params = ExtHostStartParams::from_args(Some(json!({ "language": "de", "port": 0, "break": true })));
        assert_eq!(params.language, "de");
        assert_eq!(params.port, Some(0));
        assert!(params.break_on_entry);

        // Malformed args fall back to the defaults.
        let params = ExtHostStartParams::from_args(Some(json!({ "port": "not a number" })));
        assert_eq!(params.language, "en");
    }

    #[test]
    fn worker_invocation_matches_the_contract() {
        let params = ExtHostStartParams { language: "fr".to_string(), port: Some(0), break_on_entry: true };
        let (program, args, envs) = worker_invocation(
            &PathBuf::from("/usr/bin/node"),
            &PathBuf::from("/srv/uriTransformer.js"),
            "debug",
            &params,
            Some(9229)
        );
        assert_eq!(program, PathBuf::from("/usr/bin/node"));
        assert_eq!(
            args,
            [
                "--inspect-brk=0.0.0.0:9229",
                "--type=extensionHost",
                "--uriTransformerPath=/srv/uriTransformer.js"
            ]
        );

        let env = |name: &str| envs.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone()).unwrap();
        assert_eq!(env("VSCODE_AMD_ENTRYPOINT"), "vs/workbench/services/extensions/node/extensionHostProcess");
        assert_eq!(env("VSCODE_EXTHOST_WILL_SEND_SOCKET"), "true");
        assert_eq!(env("VSCODE_PIPE_LOGGING"), "true");
        assert_eq!(env("VSCODE_LOG_LEVEL"), "debug");
        assert_eq!(env("NODE_CHANNEL_FD"), "3");
        let nls: serde_json::Value = serde_json::from_str(&env("VSCODE_NLS_CONFIG")).unwrap();
        assert_eq!(nls["locale"], "fr");

        // No debug port, no inspect flag.
        let (_, args, _) = worker_invocation(
            &PathBuf::from("node"),
            &PathBuf::from("t.js"),
            "info",
            &ExtHostStartParams::default(),
            None
        );
        assert_eq!(args[0], "--type=extensionHost");
    }

    #[tokio::test]
    async fn debug_port_allocation_yields_bindable_ports() {
        let a = find_free_debug_port().await.expect("a free port");
        let b = find_free_debug_port().await.expect("a free port");
        // Both must actually be bindable (and almost surely distinct,
        // since each probe starts from a fresh random base).
        let _la = std::net::TcpListener::bind(("0.0.0.0", a)).unwrap();
        let _lb = std::net::TcpListener::bind(("0.0.0.0", b)).unwrap();
    }

    #[tokio::test]
    async fn ipc_lines_are_parsed_and_forwarded() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        std::thread::spawn(move || ipc_read_loop(reader, tx));

        writer.write_all(b"{\"type\":\"VSCODE_EXTHOST_IPC_READY\"}\n").unwrap();
        writer
            .write_all(b"{\"type\":\"__$console\",\"severity\":\"warn\",\"arguments\":\"[\\\"hello\\\"]\"}\n")
            .unwrap();
        writer.write_all(b"{\"type\":\"something-else\"}\n").unwrap();
        drop(writer);

        assert_matches!(rx.recv().await, Some(WorkerMessage::Ready));
        assert_matches!(
            rx.recv().await,
            Some(WorkerMessage::Console { severity, arguments })
                if severity == "warn" && arguments == "[\"hello\"]"
        );
        // Unknown messages are skipped, then the channel closes on EOF.
        assert_matches!(rx.recv().await, None);
    }

    // Receive one message, extracting a single SCM_RIGHTS fd.
    fn recv_with_fd(socket: &UnixStream, buf: &mut [u8]) -> (usize, Option<RawFd>) {
        let fd_size = std::mem::size_of::<RawFd>();
        let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
        let mut cmsg_buf = vec![0_u8; cmsg_space];

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len()
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space as _;

        let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
        assert!(n >= 0);

        let mut fd = None;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if !cmsg.is_null()
                && (*cmsg).cmsg_level == libc::SOL_SOCKET
                && (*cmsg).cmsg_type == libc::SCM_RIGHTS
            {
                fd = Some(*(libc::CMSG_DATA(cmsg) as *const libc::c_int))
            }
        }
        (n as usize, fd)
    }

    #[test]
    fn fd_transfer_preserves_the_stream() {
        let (ipc_a, ipc_b) = UnixStream::pair().unwrap();
        // The "connection" being handed over.
        let (mut remote_peer, transferred) = UnixStream::pair().unwrap();

        let payload = b"{\"type\":\"VSCODE_EXTHOST_IPC_SOCKET\"}\n";
        let sent = send_with_fd(&ipc_a, payload, transferred.as_raw_fd()).unwrap();
        assert_eq!(sent, payload.len());
        drop(transferred);

        let mut buf = [0_u8; 256];
        let (n, fd) = recv_with_fd(&ipc_b, &mut buf);
        assert_eq!(&buf[.. n], payload);

        // The received fd is the same open socket: bytes written to it
        // arrive at the original peer.
        let mut inherited = unsafe { UnixStream::from_raw_fd(fd.expect("an fd was attached")) };
        inherited.write_all(b"continuity").unwrap();
        let mut read_back = [0_u8; 10];
        remote_peer.read_exact(&mut read_back).unwrap();
        assert_eq!(&read_back, b"continuity");
    }
}
