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

//! Handler for the `request_filter` phase.

use async_trait::async_trait;
use http::{header, Method, StatusCode};
use log::{debug, info, warn};
use module_utils::pingora::{Error, ErrorType, ResponseHeader, Session};
use module_utils::standard_response::error_response;
use module_utils::{RequestFilter, RequestFilterResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::configuration::CacheSyncConf;
use crate::file_writer::{file_response, read_file};
use crate::manifest::MANIFEST_HEADER;
use crate::metadata::Metadata;
use crate::path::{resolve_uri, uri_directory};
use crate::proxy::ProxyRelay;
use crate::registry::EtagRegistry;
use crate::revalidator::Revalidator;
use crate::rewriter::PageRewriter;

const AGENT_SCRIPT: &str = include_str!("../assets/sw.js");

/// Handler for Pingora’s `request_filter` phase
#[derive(Debug)]
pub struct CacheSyncHandler {
    conf: CacheSyncConf,
    root: PathBuf,
    registry: Arc<EtagRegistry>,
    rewriter: PageRewriter,
    relay: ProxyRelay,
    agent_script: String,
}

impl TryFrom<CacheSyncConf> for CacheSyncHandler {
    type Error = Box<Error>;

    /// Creates a new handler with given configuration. This will canonicalize the path to the
    /// root directory and might result in an error if that path isn’t accessible.
    fn try_from(conf: CacheSyncConf) -> Result<Self, Self::Error> {
        let root = conf
            .root
            .as_ref()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "No root path configured"))?;
        let root = root.canonicalize().map_err(|err| {
            Error::because(
                ErrorType::InternalError,
                format!("Failed accessing root path {root:?}"),
                err,
            )
        })?;

        let registry = Arc::new(EtagRegistry::new(conf.registry_capacity));
        let rewriter = PageRewriter::new(
            registry.clone(),
            &conf.agent_path,
            conf.unknown_entry_policy,
        );
        let relay = ProxyRelay::new(registry.clone())?;

        // JSON strings are valid JavaScript string literals
        let proxy_path = serde_json::to_string(&conf.proxy_path).map_err(|err| {
            Error::because(ErrorType::InternalError, "Invalid proxy path", err)
        })?;
        let agent_script = format!("const PROXY_PATH = {proxy_path};\n\n{AGENT_SCRIPT}");

        debug!("Initialized cache sync handler, settings: {conf:#?}");
        Ok(Self {
            conf,
            root,
            registry,
            rewriter,
            relay,
            agent_script,
        })
    }
}

impl CacheSyncHandler {
    /// Provides read-only access to the handler’s configuration.
    pub fn conf(&self) -> &CacheSyncConf {
        &self.conf
    }

    /// The ETag registry shared by this handler’s components
    pub fn registry(&self) -> &Arc<EtagRegistry> {
        &self.registry
    }

    /// Creates the background service revalidating the remote entries of this handler’s
    /// registry.
    pub fn revalidator(&self) -> Result<Revalidator, Box<Error>> {
        Revalidator::new(
            self.registry.clone(),
            Duration::from_secs(self.conf.revalidate_interval),
            Duration::from_secs(self.conf.revalidate_timeout),
        )
    }

    fn rewrite_enabled(&self, session: &Session) -> bool {
        session
            .req_header()
            .headers
            .get(&self.conf.enable_header)
            .is_some_and(|value| value.as_bytes() == b"true")
    }

    async fn check_method(&self, session: &mut Session) -> Result<bool, Box<Error>> {
        match session.req_header().method {
            Method::GET | Method::HEAD => Ok(true),
            _ => {
                warn!("Denying method {}", session.req_header().method);
                error_response(session, StatusCode::METHOD_NOT_ALLOWED).await?;
                Ok(false)
            }
        }
    }

    async fn serve_agent(&self, session: &mut Session) -> Result<(), Box<Error>> {
        if !self.check_method(session).await? {
            return Ok(());
        }

        let mut header = ResponseHeader::build(StatusCode::OK, Some(4))?;
        header.append_header(header::CONTENT_LENGTH, self.agent_script.len().to_string())?;
        header.append_header(header::CONTENT_TYPE, "application/javascript")?;
        header.append_header(header::CACHE_CONTROL, "no-cache")?;
        header.append_header("Service-Worker-Allowed", "/")?;
        session.write_response_header(Box::new(header)).await?;

        if session.req_header().method != Method::HEAD {
            session
                .write_response_body(self.agent_script.clone().into())
                .await?;
        }
        Ok(())
    }

    async fn serve_file(&self, session: &mut Session) -> Result<(), Box<Error>> {
        let uri = session.req_header().uri.clone();
        debug!("received URI path {}", uri.path());

        let mut path = match resolve_uri(uri.path(), &self.root) {
            Ok(path) => path,
            Err(err) => {
                let status = match err.kind() {
                    ErrorKind::InvalidInput => {
                        warn!("rejecting invalid path {}", uri.path());
                        StatusCode::BAD_REQUEST
                    }
                    ErrorKind::InvalidData => {
                        warn!("Requested path outside root directory: {}", uri.path());
                        StatusCode::BAD_REQUEST
                    }
                    ErrorKind::NotFound => {
                        debug!("canonicalizing resulted in NotFound error");
                        StatusCode::NOT_FOUND
                    }
                    ErrorKind::PermissionDenied => {
                        debug!("canonicalizing resulted in PermissionDenied error");
                        StatusCode::FORBIDDEN
                    }
                    _ => {
                        warn!("failed canonicalizing the path {}: {err}", uri.path());
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                error_response(session, status).await?;
                return Ok(());
            }
        };

        debug!("translated into file path {path:?}");

        if path.is_dir() {
            if let Some(candidate) = self
                .conf
                .index_file
                .iter()
                .map(|filename| path.join(filename))
                .find(|candidate| candidate.is_file())
            {
                debug!("using directory index file {candidate:?}");
                path = candidate;
            }
        }

        if !self.check_method(session).await? {
            return Ok(());
        }

        let meta = match Metadata::from_path(&path) {
            Ok(meta) if meta.is_dir => {
                warn!("Path {path:?} is a directory without index file, denying access");
                error_response(session, StatusCode::FORBIDDEN).await?;
                return Ok(());
            }
            Ok(meta) => meta,
            Err(err) => {
                warn!("failed retrieving metadata for path {path:?}: {err}");
                error_response(session, StatusCode::INTERNAL_SERVER_ERROR).await?;
                return Ok(());
            }
        };

        info!("successfully resolved request path: {path:?}");

        let is_html = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(".html"));
        if is_html && self.rewrite_enabled(session) {
            return self.serve_rewritten(session, &path, &meta, uri.path()).await;
        }

        let mut header = meta.to_response_header(
            usize::try_from(meta.size).unwrap_or(usize::MAX),
            None,
        )?;
        if is_html {
            header.append_header(header::VARY, self.conf.enable_header.as_str())?;
        }
        session.write_response_header(header).await?;

        if session.req_header().method == Method::GET {
            file_response(session, &path, meta.size).await?;
        }
        Ok(())
    }

    async fn serve_rewritten(
        &self,
        session: &mut Session,
        path: &Path,
        meta: &Metadata,
        uri_path: &str,
    ) -> Result<(), Box<Error>> {
        let original = read_file(path)?;

        let (body, manifest) =
            match self
                .rewriter
                .rewrite(&original, uri_directory(uri_path), &self.root)
            {
                Ok(page) => (page.html.into_bytes(), Some(page.manifest)),
                Err(err) => {
                    warn!("serving {path:?} without manifest: {err}");
                    (original, None)
                }
            };

        let mut header = meta.to_response_header(body.len(), Some("text/html; charset=utf-8"))?;
        header.append_header(header::VARY, self.conf.enable_header.as_str())?;
        if let Some(manifest) = manifest {
            // Rewritten markup isn't byte-identical to the file
            if !meta.etag.is_empty() {
                header.insert_header(header::ETAG, format!("W/{}", meta.etag))?;
            }
            header.append_header(MANIFEST_HEADER, manifest)?;
        }
        session.write_response_header(header).await?;

        if session.req_header().method == Method::GET {
            session.write_response_body(body.into()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RequestFilter for CacheSyncHandler {
    type Conf = CacheSyncConf;
    type CTX = ();

    fn new_ctx() -> Self::CTX {}

    async fn request_filter(
        &self,
        session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<RequestFilterResult, Box<Error>> {
        let path = session.req_header().uri.path();
        if path == self.conf.proxy_path {
            self.relay.handle(session).await?;
        } else if path == self.conf.agent_path {
            self.serve_agent(session).await?;
        } else {
            self.serve_file(session).await?;
        }
        Ok(RequestFilterResult::ResponseSent)
    }
}
