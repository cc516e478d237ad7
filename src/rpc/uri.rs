// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! URI rewriting between the client's view of resources and the
//! gateway's local filesystem.
//!
//! Resources travel on the wire as their components. The client
//! addresses gateway files as `vscode-remote://<authority>/path`; the
//! gateway addresses client-local files as `vscode-local`. The mapping
//! is applied on every channel call boundary:
//!
//! | direction | scheme          | rewritten to                     |
//! |-----------|-----------------|----------------------------------|
//! | incoming  | `file`          | `vscode-local` (path kept)       |
//! | incoming  | `vscode-remote` | `file` (path kept)               |
//! | outgoing  | `file`          | `vscode-remote` with authority   |
//! | outgoing  | `vscode-local`  | `file`                           |
//!
//! Anything else passes through unchanged.

use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SCHEME_FILE: &str = "file";
pub const SCHEME_REMOTE: &str = "vscode-remote";
pub const SCHEME_LOCAL: &str = "vscode-local";

/// The components of a URI as they appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UriParts {
    pub scheme: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub authority: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fragment: String
}

impl UriParts {
    /// A `file://` URI for a local path.
    pub fn from_file_path(path: &Path) -> Self {
        UriParts {
            scheme: SCHEME_FILE.to_string(),
            authority: String::new(),
            path: path.to_string_lossy().into_owned(),
            query: String::new(),
            fragment: String::new()
        }
    }

    /// The local filesystem path, if this is a `file://` URI.
    pub fn as_file_path(&self) -> Option<&Path> {
        if self.scheme == SCHEME_FILE {
            Some(Path::new(&self.path))
        } else {
            None
        }
    }
}

impl std::fmt::Display for UriParts {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.path)
    }
}

/// Rewrites URIs crossing one session's channel boundary.
#[derive(Debug, Clone)]
pub struct UriTransformer {
    authority: String
}

impl UriTransformer {
    /// A transformer for the given remote authority.
    pub fn new(authority: &str) -> Self {
        UriTransformer { authority: authority.to_string() }
    }

    /// Rewrite a URI received from the client.
    pub fn transform_incoming(&self, uri: &mut UriParts) {
        match uri.scheme.as_str() {
            SCHEME_FILE => {
                uri.scheme = SCHEME_LOCAL.to_string();
            }
            SCHEME_REMOTE => {
                uri.scheme = SCHEME_FILE.to_string();
                uri.authority.clear();
            }
            _ => ()
        }
    }

    /// Rewrite a URI sent to the client.
    pub fn transform_outgoing(&self, uri: &mut UriParts) {
        match uri.scheme.as_str() {
            SCHEME_FILE => {
                uri.scheme = SCHEME_REMOTE.to_string();
                uri.authority = self.authority.clone();
            }
            SCHEME_LOCAL => {
                uri.scheme = SCHEME_FILE.to_string();
                uri.authority.clear();
            }
            _ => ()
        }
    }
}
