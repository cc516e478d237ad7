// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The plain HTTP surface of the gateway.
//!
//! Everything that is not a websocket upgrade is served here: the
//! workbench HTML (with its configuration placeholder filled in), static
//! assets with weak etags, and the remote-resource endpoint. The request
//! head parser is shared with the upgrade path.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Allocation block size for head reads.
const BLOCK_SIZE: usize = 8 * 1024;

/// Upper bound on the size of a request head.
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// How many HTTP headers do we support during parsing?
const MAX_NUM_HEADERS: usize = 64;

/// Placeholder replaced in the workbench HTML template.
const WEB_CONFIG_PLACEHOLDER: &str = "{{WORKBENCH_WEB_CONFIGURATION}}";

/// Status lines for the responses this server actually produces.
const STATUSCODES: &[(u16, &str)] = &[
    (200, "200 OK"),
    (304, "304 Not Modified"),
    (400, "400 Bad Request"),
    (404, "404 Not Found"),
    (500, "500 Internal Server Error")
];

// Request head ///////////////////////////////////////////////////////////////////////////////////

/// A parsed HTTP/1.1 request head.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>
}

impl RequestHead {
    pub fn new(method: &str, target: &str, headers: Vec<(String, String)>) -> Self {
        RequestHead { method: method.to_string(), target: target.to_string(), headers }
    }

    /// The first value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a header, case-insensitive.
    pub fn headers<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The request path, without the query string.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("")
    }

    /// The raw query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    /// Does this request ask for a websocket upgrade?
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers("Upgrade")
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("websocket")))
    }
}

/// Read and parse one request head from `socket`.
///
/// Bytes past the head remain in `buffer` — for an upgrade they belong
/// to the frame stream. Returns `None` if the peer closed the stream
/// before sending anything.
pub async fn read_request_head<T>(socket: &mut T, buffer: &mut BytesMut) -> Result<Option<RequestHead>, Error>
where
    T: AsyncRead + Unpin
{
    loop {
        let mut header_buf = [httparse::EMPTY_HEADER; MAX_NUM_HEADERS];
        let mut request = httparse::Request::new(&mut header_buf);
        match request.parse(buffer.as_ref()) {
            Ok(httparse::Status::Complete(offset)) => {
                let method = request.method.unwrap_or("").to_string();
                let target = request.path.unwrap_or("").to_string();
                let headers = request
                    .headers
                    .iter()
                    .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                    .collect();
                buffer.advance(offset);
                return Ok(Some(RequestHead { method, target, headers }))
            }
            Ok(httparse::Status::Partial) => {
                if buffer.len() > MAX_HEAD_SIZE {
                    return Err(Error::HeadTooLarge)
                }
            }
            Err(e) => return Err(Error::Parse(e))
        }
        if crate::read(socket, buffer, BLOCK_SIZE).await? == 0 {
            if buffer.is_empty() {
                return Ok(None)
            }
            return Err(Error::UnexpectedEof)
        }
    }
}

/// The `host[:port]` of the gateway as observed by the client.
///
/// A TLS-terminating proxy announces itself via `x-forwarded-proto`; in
/// that case a portless `Host` implies the default https port.
pub fn remote_authority(head: &RequestHead) -> Option<String> {
    let host = head.header("Host")?.trim();
    if host.is_empty() {
        return None
    }
    let https = head
        .header("x-forwarded-proto")
        .map(|v| v.trim().eq_ignore_ascii_case("https"))
        .unwrap_or(false);
    if https && !host.contains(':') {
        return Some(format!("{}:443", host))
    }
    Some(host.to_string())
}

// Serving ////////////////////////////////////////////////////////////////////////////////////////

/// Static-serving configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Root directory of the workbench web assets.
    pub web_root: PathBuf,
    /// Banner shown by the workbench on first load.
    pub welcome_banner: Option<String>
}

#[derive(Debug, Serialize)]
struct WorkbenchWebConfiguration<'a> {
    #[serde(rename = "remoteAuthority")]
    remote_authority: &'a str,
    #[serde(rename = "welcomeBanner", skip_serializing_if = "Option::is_none")]
    welcome_banner: Option<&'a str>
}

/// Serve one non-upgrade request and write the response to `socket`.
pub async fn serve<T>(head: &RequestHead, socket: &mut T, config: &HttpConfig) -> std::io::Result<()>
where
    T: AsyncWrite + Unpin
{
    match head.path() {
        "/" => serve_workbench(head, socket, config).await,
        "/favicon.ico" => serve_file(socket, &config.web_root.join("favicon.ico"), head, &[]).await,
        "/manifest.json" => {
            let manifest = concat!(
                "{\n",
                "  \"name\": \"Remote Workbench\",\n",
                "  \"short_name\": \"Workbench\",\n",
                "  \"start_url\": \"/\",\n",
                "  \"display\": \"fullscreen\",\n",
                "  \"description\": \"Edit your code in the browser.\"\n",
                "}\n"
            );
            respond(socket, 200, &[("Content-Type", "application/json")], manifest.as_bytes()).await
        }
        path if path.starts_with("/static/") => {
            match sanitize_path(&config.web_root, &path["/static/".len() ..]) {
                Some(target) => serve_file(socket, &target, head, &[]).await,
                None => respond(socket, 400, &[], b"invalid path").await
            }
        }
        "/vscode-remote-resource" => {
            let path = head.query().and_then(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .find(|(k, _)| k == "path")
                    .map(|(_, v)| v.into_owned())
            });
            match path {
                Some(p) => serve_file(socket, Path::new(&p), head, &[]).await,
                None => respond(socket, 400, &[], b"missing path").await
            }
        }
        _ => {
            log::debug!("no matching request: {} {}", head.method, head.path());
            respond(socket, 400, &[], b"no matching request").await
        }
    }
}

async fn serve_workbench<T>(head: &RequestHead, socket: &mut T, config: &HttpConfig) -> std::io::Result<()>
where
    T: AsyncWrite + Unpin
{
    let authority = match remote_authority(head) {
        Some(a) => a,
        None => return respond(socket, 400, &[], b"missing host header").await
    };
    let template = match tokio::fs::read_to_string(config.web_root.join("workbench.html")).await {
        Ok(t) => t,
        Err(e) => {
            log::error!("failed to read workbench template: {}", e);
            return respond(socket, 404, &[], b"not found").await
        }
    };
    let web_config = WorkbenchWebConfiguration {
        remote_authority: &authority,
        welcome_banner: config.welcome_banner.as_deref()
    };
    let json = serde_json::to_string(&web_config).unwrap_or_else(|_| "{}".to_string());
    let body = template.replace(WEB_CONFIG_PLACEHOLDER, &escape_attribute(&json));
    respond(
        socket,
        200,
        &[
            ("Content-Type", "text/html"),
            ("Content-Security-Policy", "require-trusted-types-for 'script';")
        ],
        body.as_bytes()
    )
    .await
}

// Join `rel` onto `root`, rejecting anything that would escape it.
fn sanitize_path(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    let mut target = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(c) => target.push(c),
            Component::CurDir => (),
            _ => return None
        }
    }
    Some(target)
}

/// Serve a file with a weak etag derived from inode, size and mtime.
async fn serve_file<T>(socket: &mut T, path: &Path, head: &RequestHead, extra: &[(&str, &str)]) -> std::io::Result<()>
where
    T: AsyncWrite + Unpin
{
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) if m.is_file() => m,
        _ => return respond(socket, 404, &[], b"not found").await
    };
    let etag = weak_etag(&meta);

    if head.header("If-None-Match") == Some(etag.as_str()) {
        return respond(socket, 304, &[("ETag", &etag)], &[]).await
    }

    let body = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) => {
            log::debug!("failed to read {}: {}", path.display(), e);
            return respond(socket, 404, &[], b"not found").await
        }
    };

    let mut headers: Vec<(&str, &str)> = vec![("Content-Type", content_type(path)), ("ETag", &etag)];
    headers.extend_from_slice(extra);
    respond(socket, 200, &headers, &body).await
}

fn weak_etag(meta: &std::fs::Metadata) -> String {
    #[cfg(unix)]
    let ino = std::os::unix::fs::MetadataExt::ino(meta);
    #[cfg(not(unix))]
    let ino = 0_u64;
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("W/\"{}-{}-{}\"", ino, meta.len(), mtime_ms)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("js" | "mjs") => "text/javascript",
        Some("css") => "text/css",
        Some("json" | "map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        Some("ttf") => "font/ttf",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream"
    }
}

/// Escape a string for use inside an HTML attribute value.
fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c)
        }
    }
    out
}

/// Write a complete response.
pub async fn respond<T>(socket: &mut T, status: u16, headers: &[(&str, &str)], body: &[u8]) -> std::io::Result<()>
where
    T: AsyncWrite + Unpin
{
    let status_line = STATUSCODES
        .iter()
        .find(|(n, _)| *n == status)
        .map(|(_, s)| *s)
        .unwrap_or("500 Internal Server Error");

    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(status_line.as_bytes());
    buf.extend_from_slice(b"\r\nConnection: close");
    for (name, value) in headers {
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes())
    }
    buf.extend_from_slice(b"\r\nContent-Length: ");
    buf.extend_from_slice(body.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n\r\n");
    buf.extend_from_slice(body);
    socket.write_all(&buf).await?;
    socket.flush().await
}

// Error type /////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// The request head could not be parsed.
    Parse(httparse::Error),
    /// The request head exceeded the configured maximum size.
    HeadTooLarge,
    /// The stream ended in the middle of a request head.
    UnexpectedEof
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::Parse(e) => write!(f, "malformed request: {}", e),
            Error::HeadTooLarge => f.write_str("request head too large"),
            Error::UnexpectedEof => f.write_str("connection closed mid-request")
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Error::Io(e) = self {
            Some(e)
        } else {
            None
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////
