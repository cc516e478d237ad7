// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The remote filesystem channel.
//!
//! Resources arrive as URIs in the client's coordinate space and are
//! mapped through the session's transformer; only resources that land on
//! the `file` scheme touch the disk. File contents travel base64-encoded.
//! `readFileStream` is served as a cancellable event stream — dropping
//! the last listener stops the underlying read — and `filechange`
//! delivers events from polling watchers keyed by the client's watcher
//! session id.

use crate::rpc::uri::{UriParts, UriTransformer};
use crate::rpc::{event_stream, CallContext, Channel, EventStream, RpcError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Chunk size for streaming reads.
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Poll interval of the snapshot watcher.
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(800);

/// Broadcast backlog per watcher session.
const WATCH_BACKLOG: usize = 256;

// File type bits as the workbench encodes them.
const FILE_TYPE_FILE: u32 = 1;
const FILE_TYPE_DIRECTORY: u32 = 2;
const FILE_TYPE_SYMLINK: u32 = 64;

// File change kinds as the workbench encodes them.
const CHANGE_UPDATED: u32 = 0;
const CHANGE_ADDED: u32 = 1;
const CHANGE_DELETED: u32 = 2;

// Argument shapes ////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
struct ResourceArg {
    resource: UriParts
}

#[derive(Debug, Default, Deserialize)]
struct OverwriteOpts {
    #[serde(default)]
    overwrite: bool
}

#[derive(Debug, Deserialize)]
struct TransferArg {
    from: UriParts,
    to: UriParts,
    #[serde(default)]
    opts: OverwriteOpts
}

#[derive(Debug, Default, Deserialize)]
struct DeleteOpts {
    #[serde(default)]
    recursive: bool
}

#[derive(Debug, Deserialize)]
struct DeleteArg {
    resource: UriParts,
    #[serde(default)]
    opts: DeleteOpts
}

#[derive(Debug, Deserialize)]
struct WriteFileArg {
    resource: UriParts,
    /// Base64 file contents.
    content: String
}

#[derive(Debug, Deserialize)]
struct OpenArg {
    resource: UriParts,
    #[serde(default)]
    opts: OpenOpts
}

#[derive(Debug, Default, Deserialize)]
struct OpenOpts {
    #[serde(default)]
    create: bool
}

#[derive(Debug, Deserialize)]
struct CloseArg {
    fd: u32
}

#[derive(Debug, Deserialize)]
struct FdReadArg {
    fd: u32,
    pos: u64,
    length: usize
}

#[derive(Debug, Deserialize)]
struct FdWriteArg {
    fd: u32,
    pos: u64,
    /// Base64 data.
    content: String
}

#[derive(Debug, Deserialize)]
struct WatchArg {
    session: String,
    req: u32,
    resource: UriParts,
    #[serde(default)]
    opts: WatchOpts
}

#[derive(Debug, Default, Deserialize)]
struct WatchOpts {
    #[serde(default)]
    recursive: bool
}

#[derive(Debug, Deserialize)]
struct UnwatchArg {
    session: String,
    req: u32
}

#[derive(Debug, Deserialize)]
struct FileChangeArg {
    session: String
}

// Channel ////////////////////////////////////////////////////////////////////////////////////////

pub struct DiskFileSystemChannel {
    handles: Mutex<Handles>,
    watcher: WatcherService
}

#[derive(Default)]
struct Handles {
    next_fd: u32,
    open: HashMap<u32, OpenHandle>
}

struct OpenHandle {
    file: tokio::fs::File,
    /// Reconnection token of the owning session.
    owner: String
}

impl DiskFileSystemChannel {
    pub fn new() -> Self {
        DiskFileSystemChannel { handles: Mutex::new(Handles::default()), watcher: WatcherService::new() }
    }

    /// Release everything a disposed session left behind: open file
    /// handles and watcher registrations.
    pub async fn dispose_owner(&self, token: &str) {
        let mut handles = self.handles.lock().await;
        handles.open.retain(|_, h| h.owner != token);
        drop(handles);
        self.watcher.dispose_owner(token)
    }
}

impl Default for DiskFileSystemChannel {
    fn default() -> Self {
        DiskFileSystemChannel::new()
    }
}

// Map an incoming resource onto a local path.
fn resolve(ctx: &CallContext, mut resource: UriParts) -> Result<PathBuf, RpcError> {
    ctx.transformer().transform_incoming(&mut resource);
    resource
        .as_file_path()
        .map(Path::to_path_buf)
        .ok_or_else(|| RpcError::new(format!("resource {} is not on this machine", resource)))
}

#[async_trait]
impl Channel for DiskFileSystemChannel {
    async fn call(&self, ctx: &CallContext, name: &str, arg: Value) -> Result<Value, RpcError> {
        match name {
            "stat" => {
                let arg: ResourceArg = serde_json::from_value(arg)?;
                let path = resolve(ctx, arg.resource)?;
                stat(&path).await
            }
            "readdir" => {
                let arg: ResourceArg = serde_json::from_value(arg)?;
                let path = resolve(ctx, arg.resource)?;
                let mut entries = tokio::fs::read_dir(&path).await?;
                let mut listing = Vec::new();
                while let Some(entry) = entries.next_entry().await? {
                    let file_type = entry.file_type().await?;
                    let kind = if file_type.is_dir() { FILE_TYPE_DIRECTORY } else { FILE_TYPE_FILE }
                        | if file_type.is_symlink() { FILE_TYPE_SYMLINK } else { 0 };
                    listing.push(json!([entry.file_name().to_string_lossy(), kind]))
                }
                Ok(Value::Array(listing))
            }
            "mkdir" => {
                let arg: ResourceArg = serde_json::from_value(arg)?;
                tokio::fs::create_dir(resolve(ctx, arg.resource)?).await?;
                Ok(Value::Null)
            }
            "rename" => {
                let arg: TransferArg = serde_json::from_value(arg)?;
                let from = resolve(ctx, arg.from)?;
                let to = resolve(ctx, arg.to)?;
                if !arg.opts.overwrite && tokio::fs::metadata(&to).await.is_ok() {
                    return Err(RpcError::new(format!("target {} already exists", to.display())))
                }
                tokio::fs::rename(from, to).await?;
                Ok(Value::Null)
            }
            "copy" => {
                let arg: TransferArg = serde_json::from_value(arg)?;
                let from = resolve(ctx, arg.from)?;
                let to = resolve(ctx, arg.to)?;
                if !arg.opts.overwrite && tokio::fs::metadata(&to).await.is_ok() {
                    return Err(RpcError::new(format!("target {} already exists", to.display())))
                }
                copy_recursive(from, to).await?;
                Ok(Value::Null)
            }
            "delete" => {
                let arg: DeleteArg = serde_json::from_value(arg)?;
                let path = resolve(ctx, arg.resource)?;
                let meta = tokio::fs::symlink_metadata(&path).await?;
                if meta.is_dir() {
                    if arg.opts.recursive {
                        tokio::fs::remove_dir_all(&path).await?
                    } else {
                        tokio::fs::remove_dir(&path).await?
                    }
                } else {
                    tokio::fs::remove_file(&path).await?
                }
                Ok(Value::Null)
            }
            "readFile" => {
                let arg: ResourceArg = serde_json::from_value(arg)?;
                let contents = tokio::fs::read(resolve(ctx, arg.resource)?).await?;
                Ok(json!(BASE64.encode(contents)))
            }
            "writeFile" => {
                let arg: WriteFileArg = serde_json::from_value(arg)?;
                let path = resolve(ctx, arg.resource)?;
                let contents = BASE64
                    .decode(arg.content.as_bytes())
                    .map_err(|e| RpcError::new(format!("malformed file content: {}", e)))?;
                tokio::fs::write(path, contents).await?;
                Ok(Value::Null)
            }
            "open" => {
                let arg: OpenArg = serde_json::from_value(arg)?;
                let path = resolve(ctx, arg.resource)?;
                let file = tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(arg.opts.create)
                    .open(&path)
                    .await?;
                let mut handles = self.handles.lock().await;
                handles.next_fd += 1;
                let fd = handles.next_fd;
                handles.open.insert(fd, OpenHandle { file, owner: ctx.session_id.clone() });
                Ok(json!(fd))
            }
            "close" => {
                let arg: CloseArg = serde_json::from_value(arg)?;
                let mut handles = self.handles.lock().await;
                handles
                    .open
                    .remove(&arg.fd)
                    .map(|_| Value::Null)
                    .ok_or_else(|| RpcError::new(format!("unknown file handle: {}", arg.fd)))
            }
            "read" => {
                let arg: FdReadArg = serde_json::from_value(arg)?;
                let mut handles = self.handles.lock().await;
                let handle = handles
                    .open
                    .get_mut(&arg.fd)
                    .ok_or_else(|| RpcError::new(format!("unknown file handle: {}", arg.fd)))?;
                handle.file.seek(std::io::SeekFrom::Start(arg.pos)).await?;
                let mut buffer = vec![0_u8; arg.length];
                let mut read = 0;
                while read < arg.length {
                    let n = handle.file.read(&mut buffer[read ..]).await?;
                    if n == 0 {
                        break
                    }
                    read += n
                }
                buffer.truncate(read);
                Ok(json!({ "bytes": BASE64.encode(&buffer), "read": read }))
            }
            "write" => {
                let arg: FdWriteArg = serde_json::from_value(arg)?;
                let contents = BASE64
                    .decode(arg.content.as_bytes())
                    .map_err(|e| RpcError::new(format!("malformed file content: {}", e)))?;
                let mut handles = self.handles.lock().await;
                let handle = handles
                    .open
                    .get_mut(&arg.fd)
                    .ok_or_else(|| RpcError::new(format!("unknown file handle: {}", arg.fd)))?;
                handle.file.seek(std::io::SeekFrom::Start(arg.pos)).await?;
                handle.file.write_all(&contents).await?;
                Ok(json!(contents.len()))
            }
            "watch" => {
                let arg: WatchArg = serde_json::from_value(arg)?;
                let path = resolve(ctx, arg.resource)?;
                self.watcher.watch(
                    &arg.session,
                    &ctx.session_id,
                    arg.req,
                    path,
                    arg.opts.recursive,
                    ctx.transformer()
                );
                Ok(Value::Null)
            }
            "unwatch" => {
                let arg: UnwatchArg = serde_json::from_value(arg)?;
                self.watcher.unwatch(&arg.session, arg.req);
                Ok(Value::Null)
            }
            _ => Err(RpcError::unknown_command("remotefilesystem", name))
        }
    }

    fn listen(&self, ctx: &CallContext, name: &str, arg: Value) -> Result<EventStream, RpcError> {
        match name {
            "readFileStream" => {
                let arg: ResourceArg = serde_json::from_value(arg)?;
                let path = resolve(ctx, arg.resource)?;
                Ok(read_file_stream(path))
            }
            "filechange" => {
                let arg: FileChangeArg = serde_json::from_value(arg)?;
                Ok(self.watcher.subscribe(&arg.session, &ctx.session_id))
            }
            _ => Err(RpcError::unknown_event("remotefilesystem", name))
        }
    }
}

async fn stat(path: &Path) -> Result<Value, RpcError> {
    let symlink = tokio::fs::symlink_metadata(path).await?.is_symlink();
    let meta = tokio::fs::metadata(path).await?;
    let kind = if meta.is_dir() { FILE_TYPE_DIRECTORY } else { FILE_TYPE_FILE }
        | if symlink { FILE_TYPE_SYMLINK } else { 0 };
    let millis = |t: std::io::Result<std::time::SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    };
    Ok(json!({
        "type": kind,
        "ctime": millis(meta.created()),
        "mtime": millis(meta.modified()),
        "size": meta.len()
    }))
}

// Copy a file, or a directory tree. Directory trees walk on a blocking
// thread.
async fn copy_recursive(from: PathBuf, to: PathBuf) -> Result<(), RpcError> {
    let meta = tokio::fs::metadata(&from).await?;
    if !meta.is_dir() {
        tokio::fs::copy(&from, &to).await?;
        return Ok(())
    }
    tokio::task::spawn_blocking(move || copy_dir(&from, &to))
        .await
        .map_err(|e| RpcError::new(format!("copy task failed: {}", e)))??;
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> Result<(), RpcError> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// Streaming reads ////////////////////////////////////////////////////////////////////////////////

// Stream a file as base64 chunks. The producer stops as soon as the
// receiver is dropped, releasing the file handle.
fn read_file_stream(path: PathBuf) -> EventStream {
    let (tx, stream) = event_stream();
    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                let _ = tx.send(json!({ "error": e.to_string() })).await;
                return
            }
        };
        let mut chunk = vec![0_u8; STREAM_CHUNK_SIZE];
        loop {
            match file.read(&mut chunk).await {
                Ok(0) => {
                    let _ = tx.send(json!({ "end": true })).await;
                    return
                }
                Ok(n) => {
                    if tx.send(json!({ "data": BASE64.encode(&chunk[.. n]) })).await.is_err() {
                        log::debug!("readFileStream of {} cancelled", path.display());
                        return
                    }
                }
                Err(e) => {
                    let _ = tx.send(json!({ "error": e.to_string() })).await;
                    return
                }
            }
        }
    });
    stream
}

// Watching ///////////////////////////////////////////////////////////////////////////////////////

/// Polling snapshot watchers, grouped by the client's watcher session id.
struct WatcherService {
    inner: StdMutex<HashMap<String, SessionWatcher>>
}

struct SessionWatcher {
    /// Reconnection token of the owning connection, for disposal.
    owner: String,
    tx: broadcast::Sender<Value>,
    watches: HashMap<u32, JoinHandle<()>>
}

impl WatcherService {
    fn new() -> Self {
        WatcherService { inner: StdMutex::new(HashMap::new()) }
    }

    fn watch(&self, session: &str, owner: &str, req: u32, path: PathBuf, recursive: bool, transformer: UriTransformer) {
        let mut inner = self.lock();
        let watcher = inner.entry(session.to_string()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(WATCH_BACKLOG);
            SessionWatcher { owner: owner.to_string(), tx, watches: HashMap::new() }
        });
        let events = watcher.tx.clone();
        log::debug!("[{}] watching {} (req {}, recursive {})", crate::token_prefix(owner), path.display(), req, recursive);
        let handle = tokio::spawn(poll_watch(path, recursive, events, transformer));
        if let Some(previous) = watcher.watches.insert(req, handle) {
            previous.abort()
        }
    }

    fn unwatch(&self, session: &str, req: u32) {
        let mut inner = self.lock();
        if let Some(watcher) = inner.get_mut(session) {
            if let Some(handle) = watcher.watches.remove(&req) {
                handle.abort()
            }
        }
    }

    fn subscribe(&self, session: &str, owner: &str) -> EventStream {
        let mut inner = self.lock();
        let watcher = inner.entry(session.to_string()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(WATCH_BACKLOG);
            SessionWatcher { owner: owner.to_string(), tx, watches: HashMap::new() }
        });
        let mut rx = watcher.tx.subscribe();
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
                        log::warn!("file watcher listener lagged, {} change sets dropped", n)
                    }
                    Err(broadcast::error::RecvError::Closed) => break
                }
            }
        });
        stream
    }

    fn dispose_owner(&self, owner: &str) {
        let mut inner = self.lock();
        inner.retain(|_, watcher| {
            if watcher.owner != owner {
                return true
            }
            for (_, handle) in watcher.watches.drain() {
                handle.abort()
            }
            false
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionWatcher>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner()
        }
    }
}

type Snapshot = HashMap<PathBuf, (u64, bool)>;

async fn poll_watch(path: PathBuf, recursive: bool, events: broadcast::Sender<Value>, transformer: UriTransformer) {
    let mut interval = tokio::time::interval(WATCH_POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut previous = take_snapshot(path.clone(), recursive).await;
    loop {
        interval.tick().await;
        let current = take_snapshot(path.clone(), recursive).await;
        let changes = diff_snapshots(&previous, &current, &transformer);
        if !changes.is_empty() && events.send(Value::Array(changes)).is_err() {
            // All receivers are gone; keep polling anyway, a listener
            // may re-subscribe after a reconnect.
            log::trace!("change set for {} had no listeners", path.display())
        }
        previous = current
    }
}

async fn take_snapshot(path: PathBuf, recursive: bool) -> Snapshot {
    tokio::task::spawn_blocking(move || {
        let mut snapshot = Snapshot::new();
        let mut stack = vec![(path, 0_u32)];
        while let Some((path, depth)) = stack.pop() {
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(_) => continue
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            snapshot.insert(path.clone(), (mtime, meta.is_dir()));
            if meta.is_dir() && (recursive || depth == 0) {
                if let Ok(entries) = std::fs::read_dir(&path) {
                    for entry in entries.flatten() {
                        stack.push((entry.path(), depth + 1))
                    }
                }
            }
        }
        snapshot
    })
    .await
    .unwrap_or_default()
}

fn diff_snapshots(previous: &Snapshot, current: &Snapshot, transformer: &UriTransformer) -> Vec<Value> {
    let change = |path: &Path, kind: u32| {
        let mut uri = UriParts::from_file_path(path);
        transformer.transform_outgoing(&mut uri);
        json!({ "resource": uri, "type": kind })
    };
    let mut changes = Vec::new();
    for (path, (mtime, _)) in current {
        match previous.get(path) {
            None => changes.push(change(path, CHANGE_ADDED)),
            Some((m, _)) if m != mtime => changes.push(change(path, CHANGE_UPDATED)),
            Some(_) => ()
        }
    }
    for path in previous.keys() {
        if !current.contains_key(path) {
            changes.push(change(path, CHANGE_DELETED))
        }
    }
    changes
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::DiskFileSystemChannel;
    use crate::rpc::{CallContext, Channel};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::{json, Value};
    use std::path::{Path, PathBuf};

    fn ctx() -> CallContext {
        CallContext { remote_authority: "gw:8080".to_string(), session_id: "T1".to_string() }
    }

    // The client addresses gateway files as vscode-remote URIs.
    fn remote(path: &Path) -> Value {
        json!({ "scheme": "vscode-remote", "authority": "gw:8080", "path": path.to_str().unwrap() })
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("benchgate-fs-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn stat_and_readdir() {
        let dir = temp_dir("stat");
        std::fs::write(dir.join("a.txt"), b"abc").unwrap();
        std::fs::create_dir_all(dir.join("sub")).unwrap();

        let channel = DiskFileSystemChannel::new();
        let stat = channel.call(&ctx(), "stat", json!({ "resource": remote(&dir.join("a.txt")) })).await.unwrap();
        assert_eq!(stat["type"], 1);
        assert_eq!(stat["size"], 3);

        let listing = channel.call(&ctx(), "readdir", json!({ "resource": remote(&dir) })).await.unwrap();
        let mut names: Vec<String> = listing
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e[0].as_str().unwrap().to_string())
            .collect();
        names.sort();
        assert_eq!(names, ["a.txt", "sub"]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn read_write_roundtrip() {
        let dir = temp_dir("rw");
        let file = dir.join("data.bin");

        let channel = DiskFileSystemChannel::new();
        channel
            .call(&ctx(), "writeFile", json!({ "resource": remote(&file), "content": BASE64.encode(b"payload") }))
            .await
            .unwrap();
        let read = channel.call(&ctx(), "readFile", json!({ "resource": remote(&file) })).await.unwrap();
        assert_eq!(BASE64.decode(read.as_str().unwrap()).unwrap(), b"payload");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn open_read_write_close() {
        let dir = temp_dir("fd");
        let file = dir.join("f.txt");
        std::fs::write(&file, b"0123456789").unwrap();

        let channel = DiskFileSystemChannel::new();
        let fd = channel
            .call(&ctx(), "open", json!({ "resource": remote(&file), "opts": { "create": false } }))
            .await
            .unwrap();

        let read = channel.call(&ctx(), "read", json!({ "fd": fd, "pos": 2, "length": 4 })).await.unwrap();
        assert_eq!(read["read"], 4);
        assert_eq!(BASE64.decode(read["bytes"].as_str().unwrap()).unwrap(), b"2345");

        channel
            .call(&ctx(), "write", json!({ "fd": fd, "pos": 0, "content": BASE64.encode(b"XY") }))
            .await
            .unwrap();
        channel.call(&ctx(), "close", json!({ "fd": fd })).await.unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"XY23456789");

        // Closing twice is an error.
        assert!(channel.call(&ctx(), "close", json!({ "fd": fd })).await.is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn rename_respects_overwrite() {
        let dir = temp_dir("mv");
        std::fs::write(dir.join("src.txt"), b"src").unwrap();
        std::fs::write(dir.join("dst.txt"), b"dst").unwrap();

        let channel = DiskFileSystemChannel::new();
        let err = channel
            .call(&ctx(), "rename", json!({ "from": remote(&dir.join("src.txt")), "to": remote(&dir.join("dst.txt")) }))
            .await
            .unwrap_err();
        assert!(err.message().contains("already exists"));

        channel
            .call(
                &ctx(),
                "rename",
                json!({
                    "from": remote(&dir.join("src.txt")),
                    "to": remote(&dir.join("dst.txt")),
                    "opts": { "overwrite": true }
                })
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.join("dst.txt")).unwrap(), b"src");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn local_resources_are_refused() {
        let channel = DiskFileSystemChannel::new();
        // A plain file URI maps to vscode-local, i.e. the client machine.
        let err = channel
            .call(&ctx(), "stat", json!({ "resource": { "scheme": "file", "path": "/etc/hosts" } }))
            .await
            .unwrap_err();
        assert!(err.message().contains("not on this machine"));
    }

    #[tokio::test]
    async fn read_file_stream_delivers_chunks_then_end() {
        let dir = temp_dir("stream");
        let file = dir.join("big.bin");
        let payload: Vec<u8> = (0 .. 100_000_u32).map(|i| i as u8).collect();
        std::fs::write(&file, &payload).unwrap();

        let channel = DiskFileSystemChannel::new();
        let mut stream = channel.listen(&ctx(), "readFileStream", json!({ "resource": remote(&file) })).unwrap();

        let mut collected = Vec::new();
        loop {
            let event = stream.recv().await.unwrap();
            if event.get("end").is_some() {
                break
            }
            collected.extend(BASE64.decode(event["data"].as_str().unwrap()).unwrap())
        }
        assert_eq!(collected, payload);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn watch_reports_changes() {
        let dir = temp_dir("watch");
        let channel = DiskFileSystemChannel::new();

        let mut events = channel.listen(&ctx(), "filechange", json!({ "session": "w1" })).unwrap();
        channel
            .call(
                &ctx(),
                "watch",
                json!({ "session": "w1", "req": 1, "resource": remote(&dir), "opts": { "recursive": true } })
            )
            .await
            .unwrap();

        // Give the watcher a tick to take its base snapshot.
        tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
        std::fs::write(dir.join("new.txt"), b"x").unwrap();

        let changes = tokio::time::timeout(std::time::Duration::from_secs(10), events.recv())
            .await
            .expect("change event within the poll window")
            .unwrap();
        let added = changes
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c["type"] == 1 && c["resource"]["path"].as_str().unwrap().ends_with("new.txt"));
        assert!(added, "expected an added event, got {}", changes);

        channel.call(&ctx(), "unwatch", json!({ "session": "w1", "req": 1 })).await.unwrap();
        channel.dispose_owner("T1").await;

        std::fs::remove_dir_all(&dir).ok();
    }
}
