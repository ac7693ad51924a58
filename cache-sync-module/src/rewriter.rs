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

//! Injection of the ETag manifest and the cache agent bootstrap into HTML pages

use log::debug;
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

use crate::agent::UnknownEntryPolicy;
use crate::html::{Document, HtmlParseError};
use crate::manifest::ManifestDecodeError;
use crate::registry::EtagRegistry;
use crate::scanner::scan;

/// The error type returned when a page cannot be rewritten
#[derive(Debug)]
pub enum RewriteError {
    /// The document could not be parsed
    Parse(HtmlParseError),
    /// The manifest could not be merged with the registry
    Manifest(ManifestDecodeError),
}

impl Display for RewriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::Parse(err) => write!(f, "Failed parsing page: {err}"),
            Self::Manifest(err) => write!(f, "Failed merging manifest: {err}"),
        }
    }
}

impl std::error::Error for RewriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            Self::Manifest(err) => Some(err),
        }
    }
}

impl From<HtmlParseError> for RewriteError {
    fn from(err: HtmlParseError) -> Self {
        Self::Parse(err)
    }
}

impl From<ManifestDecodeError> for RewriteError {
    fn from(err: ManifestDecodeError) -> Self {
        Self::Manifest(err)
    }
}

/// Result of a successful rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenPage {
    /// Page markup with the bootstrap script
    pub html: String,
    /// Merged ETag manifest as JSON, the value of the `X-Etag-Config` header
    pub manifest: String,
}

/// Rewrites HTML pages so that browsers install the cache agent and receive the ETags of the
/// page’s resources.
#[derive(Debug)]
pub struct PageRewriter {
    registry: Arc<EtagRegistry>,
    bootstrap: String,
}

impl PageRewriter {
    /// Creates a rewriter registering the agent script served under `agent_path`.
    pub fn new(
        registry: Arc<EtagRegistry>,
        agent_path: &str,
        unknown_entry_policy: UnknownEntryPolicy,
    ) -> Self {
        Self {
            registry,
            bootstrap: bootstrap_code(agent_path, unknown_entry_policy),
        }
    }

    /// JavaScript code of the bootstrap script
    pub fn bootstrap(&self) -> &str {
        &self.bootstrap
    }

    /// Scans the page for local resources, inserts the bootstrap script and merges the scan
    /// results with the registry. `base_uri` is the URI directory of the page, e.g. `/dir/`.
    pub fn rewrite(
        &self,
        html: &[u8],
        base_uri: &str,
        root: &Path,
    ) -> Result<RewrittenPage, RewriteError> {
        let mut document = Document::parse(html)?;
        let scanned = scan(&document, base_uri, root);
        debug!("found {} local resources in page", scanned.len());

        document.insert_script(&self.bootstrap);

        let manifest = self.registry.merge(&scanned.to_json())?;
        Ok(RewrittenPage {
            html: document.to_html(),
            manifest,
        })
    }
}

fn bootstrap_code(agent_path: &str, unknown_entry_policy: UnknownEntryPolicy) -> String {
    let url = format!("{agent_path}?unknown={unknown_entry_policy}");
    // A JSON string is a valid JavaScript string literal, `<` must not close the script element
    let url = serde_json::to_string(&url)
        .unwrap_or_else(|_| String::from("\"/sw.js\""))
        .replace('<', "\\u003c");

    format!(
        r#"
if ('serviceWorker' in navigator) {{
    navigator.serviceWorker.register({url}, {{scope: '/'}}).then(function() {{
        return navigator.serviceWorker.ready;
    }}).catch(function(error) {{
        console.log('Service worker registration failed: ', error);
    }});
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use scraper::{Html, Selector};
    use std::fs::{create_dir, File};
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    use crate::manifest::EtagManifest;

    fn make_root() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        create_dir(root.join("dir")).unwrap();
        for path in [root.join("logo.png"), root.join("dir").join("icon.png")] {
            let mut file = File::create(path).unwrap();
            file.write_all(&[0; 2048]).unwrap();
            file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1700000000))
                .unwrap();
        }
        (dir, root)
    }

    fn make_rewriter(registry: &Arc<EtagRegistry>) -> PageRewriter {
        PageRewriter::new(registry.clone(), "/sw.js", UnknownEntryPolicy::Serve)
    }

    fn first_body_child(html: &str) -> (String, String) {
        let document = Html::parse_document(html);
        let selector = Selector::parse("body > :first-child").unwrap();
        let element = document.select(&selector).next().unwrap();
        (
            element.value().name().to_owned(),
            element.text().collect(),
        )
    }

    #[test]
    fn injects_manifest_and_bootstrap() {
        let (_dir, root) = make_root();
        let registry = Arc::new(EtagRegistry::default());
        let rewriter = make_rewriter(&registry);

        let page = rewriter
            .rewrite(
                b"<html><head></head><body><p>Hi</p><img src=\"/logo.png\"></body></html>",
                "/",
                &root,
            )
            .unwrap();
        assert_eq!(page.manifest, r#"{"/logo.png":"\"s44we81kw\""}"#);

        let (name, text) = first_body_child(&page.html);
        assert_eq!(name, "script");
        assert_eq!(text, rewriter.bootstrap());
        assert!(page
            .html
            .ends_with("<p>Hi</p><img src=\"/logo.png\"></body></html>"));
    }

    #[test]
    fn bootstrap_registration() {
        let registry = Arc::new(EtagRegistry::default());
        let rewriter = make_rewriter(&registry);
        assert!(rewriter
            .bootstrap()
            .contains("register(\"/sw.js?unknown=serve\", {scope: '/'})"));

        let rewriter = PageRewriter::new(
            registry,
            "/agent</script>.js",
            UnknownEntryPolicy::Revalidate,
        );
        assert!(rewriter
            .bootstrap()
            .contains("register(\"/agent\\u003c/script>.js?unknown=revalidate\""));
    }

    #[test]
    fn relative_references() {
        let (_dir, root) = make_root();
        let registry = Arc::new(EtagRegistry::default());
        let page = make_rewriter(&registry)
            .rewrite(
                b"<body><img src=\"icon.png\"><img src=\"../logo.png\"></body>",
                "/dir/",
                &root,
            )
            .unwrap();
        let manifest = EtagManifest::from_json(&page.manifest).unwrap();
        assert_eq!(manifest.get("icon.png"), Some("\"s44we81kw\""));
        assert_eq!(manifest.get("../logo.png"), Some("\"s44we81kw\""));
    }

    #[test]
    fn registry_takes_precedence() {
        let (_dir, root) = make_root();
        let registry = Arc::new(EtagRegistry::default());
        registry.set("/logo.png", "\"registry\"");
        registry.set("https://cdn.example.com/x.js", "\"remote\"");

        let page = make_rewriter(&registry)
            .rewrite(
                b"<body><img src=\"/logo.png\"><script src=\"https://cdn.example.com/x.js\"></script></body>",
                "/",
                &root,
            )
            .unwrap();
        assert_eq!(
            page.manifest,
            r#"{"/logo.png":"\"registry\"","https://cdn.example.com/x.js":"\"remote\""}"#
        );
    }

    #[test]
    fn missing_body() {
        let (_dir, root) = make_root();
        let registry = Arc::new(EtagRegistry::default());
        let rewriter = make_rewriter(&registry);

        let page = rewriter
            .rewrite(b"<html><p>text</p></html>", "/", &root)
            .unwrap();
        assert_eq!(
            page.html,
            format!(
                "<html><head></head><body><script>{}</script><p>text</p></body></html>",
                rewriter.bootstrap()
            )
        );
        assert_eq!(page.manifest, "{}");

        let page = rewriter.rewrite(b"", "/", &root).unwrap();
        assert_eq!(
            page.html,
            format!(
                "<html><head></head><body><script>{}</script></body></html>",
                rewriter.bootstrap()
            )
        );
    }

    #[test]
    fn page_structure_preserved() {
        let (_dir, root) = make_root();
        let registry = Arc::new(EtagRegistry::default());
        let rewriter = make_rewriter(&registry);

        let page = rewriter
            .rewrite(
                b"<body><p>Intro<ul><li>a</ul><p>Next<div>box</div></body>",
                "/",
                &root,
            )
            .unwrap();
        assert!(page.html.ends_with(
            "</script><p>Intro</p><ul><li>a</li></ul><p>Next</p><div>box</div></body></html>"
        ));
        assert_eq!(page.html.matches("</p>").count(), 2);
    }

    #[test]
    fn invalid_documents() {
        let (_dir, root) = make_root();
        let registry = Arc::new(EtagRegistry::default());
        let result = make_rewriter(&registry).rewrite(b"<body>\xfe\xff</body>", "/", &root);
        assert!(matches!(result, Err(RewriteError::Parse(_))));
    }
}
