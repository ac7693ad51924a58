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

//! Discovery of local resources referenced by a document

use log::trace;
use std::path::{Path, PathBuf};

use crate::html::Document;
use crate::manifest::EtagManifest;
use crate::metadata::Metadata;
use crate::path::resolve_reference;

/// Elements whose references end up in the manifest
pub const SCANNED_ELEMENTS: &[&str] = &["img", "link", "script"];

/// A resource reference found in a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceReference {
    /// Name of the element containing the reference
    pub element: String,
    /// Attribute containing the reference, `src` or `href`
    pub attribute: &'static str,
    /// Attribute value as found in the document
    pub value: String,
    /// File system path, only set for local references resolving to an existing file or
    /// directory within the root
    pub path: Option<PathBuf>,
}

/// Checks whether a reference points to the page’s own server: either it mentions `localhost` or
/// it doesn’t look like a URL with an `http`/`https` scheme.
pub fn is_local(reference: &str) -> bool {
    let reference = reference.to_ascii_lowercase();
    reference.contains("localhost") || !reference.contains("http")
}

/// Turns a local reference into a URI path: the query string is removed and for `localhost` URLs
/// only the path following the host name is kept.
fn local_uri(reference: &str) -> &str {
    let reference = reference
        .split_once('?')
        .map_or(reference, |(path, _)| path);

    match reference.to_ascii_lowercase().find("localhost") {
        Some(index) => {
            let after_host = &reference[index + "localhost".len()..];
            after_host.find('/').map_or("/", |start| &after_host[start..])
        }
        None => reference,
    }
}

/// Lists the references of all `<img>`, `<link>` and `<script>` elements in document order,
/// including nested ones. The `src` attribute is used if present, `href` otherwise. Elements
/// without either attribute are skipped.
///
/// Local references are resolved against `root`, relative references against the document’s
/// directory `base_uri`.
pub fn find_references(
    document: &Document,
    base_uri: &str,
    root: &Path,
) -> Vec<ResourceReference> {
    document
        .find_elements(SCANNED_ELEMENTS)
        .into_iter()
        .filter_map(|element| {
            let (attribute, value) = ["src", "href"]
                .into_iter()
                .find_map(|name| Some((name, element.value().attr(name)?)))?;

            let path = if is_local(value) {
                resolve_reference(local_uri(value), base_uri, root).ok()
            } else {
                None
            };

            Some(ResourceReference {
                element: element.value().name().to_owned(),
                attribute,
                value: value.to_owned(),
                path,
            })
        })
        .collect()
}

/// Computes the ETags of all local files referenced by the document. Keys are the attribute
/// values as found in the document. References that cannot be resolved, point to directories or
/// to files without a meaningful modification time are left out.
pub fn scan(document: &Document, base_uri: &str, root: &Path) -> EtagManifest {
    find_references(document, base_uri, root)
        .into_iter()
        .filter_map(|reference| {
            let path = reference.path?;
            let meta = match Metadata::from_path(&path) {
                Ok(meta) => meta,
                Err(err) => {
                    trace!("skipping {}: {err}", reference.value);
                    return None;
                }
            };
            if meta.is_dir || meta.etag.is_empty() {
                trace!("skipping {}, no usable file", reference.value);
                return None;
            }
            Some((reference.value, meta.etag))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::{create_dir, File};
    use std::io::Write;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    use crate::metadata::calculate_etag;

    const MTIME: u64 = 1700000000;

    fn write_file(path: &Path, size: usize) {
        let mut file = File::create(path).unwrap();
        file.write_all(&vec![b'x'; size]).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(MTIME))
            .unwrap();
    }

    fn make_root() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        create_dir(&root).unwrap();
        let root = root.canonicalize().unwrap();
        create_dir(root.join("sub")).unwrap();
        write_file(&root.join("a.png"), 10);
        write_file(&root.join("b.js"), 20);
        write_file(&root.join("style.css"), 30);
        write_file(&root.join("sub").join("c.png"), 40);
        write_file(&dir.path().join("secret.txt"), 50);
        (dir, root)
    }

    fn etag(size: u64) -> String {
        calculate_etag(MTIME as i64, size)
    }

    #[test]
    fn locality() {
        assert!(!is_local("https://cdn.example.com/x.js"));
        assert!(!is_local("HTTP://cdn.example.com/x.js"));
        assert!(is_local("/local/x.js"));
        assert!(is_local("localhost:8080/x.js"));
        assert!(is_local("http://LocalHost:8080/x.js"));
        assert!(is_local("images/a.png"));
    }

    #[test]
    fn local_uris() {
        assert_eq!(local_uri("/a.png?v=2"), "/a.png");
        assert_eq!(local_uri("localhost:8080/x.js"), "/x.js");
        assert_eq!(local_uri("http://localhost/x.js?y"), "/x.js");
        assert_eq!(local_uri("http://localhost"), "/");
        assert_eq!(local_uri("sub/c.png"), "sub/c.png");
    }

    #[test]
    fn nested_elements() {
        let (_dir, root) = make_root();
        let document = Document::parse(
            b"<html><body><div><div><img src=\"/a.png\"></div></div>\
                <script src=\"/b.js\"></script></body></html>",
        )
        .unwrap();

        let manifest = scan(&document, "/", &root);
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.get("/a.png"), Some(etag(10).as_str()));
        assert_eq!(manifest.get("/b.js"), Some(etag(20).as_str()));
    }

    #[test]
    fn reference_selection() {
        let (_dir, root) = make_root();
        let document = Document::parse(
            b"<link rel=\"stylesheet\" href=\"style.css\">\
                <script href=\"/ignored.js\" src=\"/b.js\"></script>\
                <script>inline()</script>\
                <img src=\"https://cdn.example.com/x.png\">",
        )
        .unwrap();

        let references = find_references(&document, "/", &root);
        assert_eq!(references.len(), 3);
        assert_eq!(references[0].element, "link");
        assert_eq!(references[0].attribute, "href");
        assert_eq!(references[0].path, Some(root.join("style.css")));
        assert_eq!(references[1].attribute, "src");
        assert_eq!(references[1].value, "/b.js");
        assert_eq!(references[2].value, "https://cdn.example.com/x.png");
        assert_eq!(references[2].path, None);
    }

    #[test]
    fn resolution() {
        let (_dir, root) = make_root();
        let document = Document::parse(
            b"<img src=\"c.png?v=1\"><img src=\"../a.png\"><img src=\"http://localhost:8080/b.js\">\
                <img src=\"../../secret.txt\"><img src=\"missing.png\"><img src=\"/\">\
                <img src=\"https://cdn.example.com/x.js\">",
        )
        .unwrap();

        let manifest = scan(&document, "/sub/", &root);
        assert_eq!(
            manifest,
            EtagManifest::from_iter([
                ("c.png?v=1", etag(40)),
                ("../a.png", etag(10)),
                ("http://localhost:8080/b.js", etag(20)),
            ])
        );
    }

    #[test]
    fn placeholder_mtime_skipped() {
        let (_dir, root) = make_root();
        let file = File::create(root.join("old.png")).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH).unwrap();

        let document = Document::parse(b"<img src=\"/old.png\"><img src=\"/a.png\">").unwrap();
        let manifest = scan(&document, "/", &root);
        assert_eq!(manifest.len(), 1);
        assert!(manifest.get("/old.png").is_none());
    }
}
