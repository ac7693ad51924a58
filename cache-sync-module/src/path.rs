// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Path resolution logic

use percent_encoding::percent_decode_str;
use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};

#[cfg(unix)]
fn path_from_bytes(bytes: &[u8]) -> &std::ffi::OsStr {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    OsStr::from_bytes(bytes)
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: &[u8]) -> String {
    // Non-Unicode file names will result in 404 here.
    String::from_utf8_lossy(bytes).into_owned()
}

/// Resolves the path from a URI against the path to a root directory.
///
/// This will return an error under the following conditions:
///
/// * Invalid path, not starting with a slash (/): results in [`ErrorKind::InvalidInput`]
/// * Resolved path outside the root directory: results in [`ErrorKind::InvalidData`]
/// * [`std::fs::canonicalize()`] failed: results in [`ErrorKind::NotFound`],
///   [`ErrorKind::PermissionDenied`] and other errors
pub fn resolve_uri(uri_path: &str, root: &Path) -> Result<PathBuf, Error> {
    let uri_path = uri_path.strip_prefix('/').ok_or(ErrorKind::InvalidInput)?;

    let uri_path = uri_path.strip_suffix('/').unwrap_or(uri_path);

    let mut path = root.to_path_buf();
    for component in uri_path.split('/') {
        let decoded = percent_decode_str(component).collect::<Vec<_>>();
        path.push(path_from_bytes(&decoded))
    }

    let path = path.canonicalize()?;

    if path.starts_with(root) {
        Ok(path)
    } else {
        Err(ErrorKind::InvalidData.into())
    }
}

/// Normalizes a URI path lexically: removes empty and `.` segments and applies `..` segments.
/// `..` segments never go above the root, `/../a` becomes `/a`. The result always starts with a
/// slash.
pub fn clean_uri_path(uri_path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in uri_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    let mut result = String::from("/");
    result.push_str(&segments.join("/"));
    result
}

/// Returns the directory part of a URI path including the trailing slash, e.g. `/dir/` for
/// `/dir/index.html`.
pub fn uri_directory(uri_path: &str) -> &str {
    match uri_path.rfind('/') {
        Some(index) => &uri_path[..=index],
        None => "/",
    }
}

/// Resolves a resource reference found in a document against the root directory. Absolute
/// references (starting with a slash) are relative to the root, other references relative to the
/// document’s directory `base_uri` (e.g. `/dir/`).
///
/// The combined path is cleaned via [`clean_uri_path`] first, so references cannot escape the
/// root directory. Errors are the same as for [`resolve_uri`].
pub fn resolve_reference(
    reference: &str,
    base_uri: &str,
    root: &Path,
) -> Result<PathBuf, Error> {
    let joined = if reference.starts_with('/') {
        reference.to_owned()
    } else {
        format!("{}/{reference}", base_uri.trim_end_matches('/'))
    };
    resolve_uri(&clean_uri_path(&joined), root)
}
