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

//! The cache-first protocol run by the browser-side cache agent
//!
//! Browsers run the JavaScript service worker served by the handler. This module implements the
//! same decisions over pluggable cache and network seams, so that the protocol can be used and
//! verified outside of a browser.

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use url::Url;

use crate::manifest::{EtagManifest, MANIFEST_HEADER};

/// What to do with a cached response for which the manifest has no entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UnknownEntryPolicy {
    /// Serve the cached response without contacting the network
    #[default]
    Serve,
    /// Fetch the resource from the network, using the cached response only if that fails
    Revalidate,
}

impl Display for UnknownEntryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::Serve => write!(f, "serve"),
            Self::Revalidate => write!(f, "revalidate"),
        }
    }
}

/// The error type returned when parsing an unknown policy name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedUnknownEntryPolicy(pub String);

impl Display for UnsupportedUnknownEntryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Unsupported unknown entry policy: {}", self.0)
    }
}

impl std::error::Error for UnsupportedUnknownEntryPolicy {}

impl FromStr for UnknownEntryPolicy {
    type Err = UnsupportedUnknownEntryPolicy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "serve" => Ok(Self::Serve),
            "revalidate" => Ok(Self::Revalidate),
            other => Err(UnsupportedUnknownEntryPolicy(other.to_owned())),
        }
    }
}

/// How a network request may use HTTP caches on the way
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Regular HTTP caching
    #[default]
    Default,
    /// Bypass HTTP caches entirely
    Reload,
}

/// How a network request handles redirects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RedirectMode {
    /// Follow redirects
    #[default]
    Follow,
    /// Fail on redirects
    Error,
    /// Return redirect responses as they are
    Manual,
}

/// A request intercepted by the agent
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Request method
    pub method: Method,
    /// Absolute request URL
    pub url: Url,
    /// Request headers
    pub headers: HeaderMap,
    /// HTTP cache usage
    pub cache_mode: CacheMode,
    /// Redirect handling
    pub redirect: RedirectMode,
}

impl AgentRequest {
    /// Creates a `GET` request without headers.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            cache_mode: CacheMode::default(),
            redirect: RedirectMode::default(),
        }
    }
}

/// A response produced by the network or the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl AgentResponse {
    /// Creates a response without headers.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Value of the `ETag` header if present
    pub fn etag(&self) -> Option<&str> {
        self.headers
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
    }

    fn service_unavailable() -> Self {
        let mut response = Self::new(StatusCode::SERVICE_UNAVAILABLE, "Network error");
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

/// The error type returned by [`Network`] implementations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError(pub String);

impl Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Network request failed: {}", self.0)
    }
}

impl std::error::Error for FetchError {}

/// Response storage keyed by request
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Looks up the response stored for a request.
    async fn get(&self, request: &AgentRequest) -> Option<AgentResponse>;

    /// Stores a response, replacing any response stored for the same request.
    async fn put(&self, request: &AgentRequest, response: AgentResponse);
}

/// Network access
#[async_trait]
pub trait Network: Send + Sync {
    /// Sends a request, only failing if no response could be received.
    async fn fetch(&self, request: AgentRequest) -> Result<AgentResponse, FetchError>;
}

/// In-memory [`ResponseCache`] keyed by method and URL
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<(Method, String), AgentResponse>>,
}

impl MemoryCache {
    /// Number of stored responses
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Checks whether no responses are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, request: &AgentRequest) -> Option<AgentResponse> {
        self.entries
            .lock()
            .get(&(request.method.clone(), request.url.to_string()))
            .cloned()
    }

    async fn put(&self, request: &AgentRequest, response: AgentResponse) {
        self.entries
            .lock()
            .insert((request.method.clone(), request.url.to_string()), response);
    }
}

#[derive(Debug)]
enum State {
    Lookup,
    Validate(AgentResponse),
    Fetch {
        mode: CacheMode,
        fallback: Option<AgentResponse>,
    },
    Done(AgentResponse),
}

/// Applies the cache-first protocol to intercepted requests
#[derive(Debug)]
pub struct CacheAgent<C, N> {
    origin: Url,
    proxy_path: String,
    policy: UnknownEntryPolicy,
    manifest: RwLock<EtagManifest>,
    cache: C,
    network: N,
}

impl<C: ResponseCache, N: Network> CacheAgent<C, N> {
    /// Creates an agent for pages of the given origin. Cross-origin requests are routed through
    /// the proxy relay at `proxy_path`.
    pub fn new(
        origin: Url,
        proxy_path: impl Into<String>,
        policy: UnknownEntryPolicy,
        cache: C,
        network: N,
    ) -> Self {
        Self {
            origin,
            proxy_path: proxy_path.into(),
            policy,
            manifest: RwLock::new(EtagManifest::new()),
            cache,
            network,
        }
    }

    /// Provides access to the response cache.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Returns a copy of the current manifest.
    pub fn manifest(&self) -> EtagManifest {
        self.manifest.read().clone()
    }

    /// Merges the value of an `X-Etag-Config` header into the manifest, new entries win. Keys
    /// are resolved against the origin, see [`CacheAgent::update_page_manifest`].
    pub fn update_manifest(&self, json: &str) {
        self.update_page_manifest(json, &self.origin);
    }

    /// Merges the manifest received with the page at `page`. Keys are kept as they are and, if
    /// they differ from the URL they resolve to relative to the page, under that URL as well.
    /// Invalid manifests are ignored.
    pub fn update_page_manifest(&self, json: &str, page: &Url) {
        let update = match EtagManifest::from_json(json) {
            Ok(update) => update,
            Err(err) => {
                debug!("ignoring manifest update: {err}");
                return;
            }
        };
        trace!("received {} manifest entries", update.len());

        let resolved: Vec<(String, String)> = update
            .iter()
            .filter_map(|(key, etag)| {
                let url = page.join(key).ok()?;
                (url.as_str() != key.as_str()).then(|| (String::from(url), etag.clone()))
            })
            .collect();

        let mut manifest = self.manifest.write();
        manifest.extend(update);
        for (url, etag) in resolved {
            manifest.insert(url, etag);
        }
    }

    fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    /// Looks up the expected ETag, by the full URL and for same-origin requests by the path as
    /// it would appear in markup.
    fn expected_etag(&self, url: &Url) -> Option<String> {
        let manifest = self.manifest.read();
        if let Some(etag) = manifest.get(url.as_str()) {
            return Some(etag.to_owned());
        }

        if self.is_same_origin(url) {
            let mut path = url.path().to_owned();
            if let Some(query) = url.query() {
                path.push('?');
                path.push_str(query);
            }
            manifest
                .get(&path)
                .or_else(|| manifest.get(url.path()))
                .map(str::to_owned)
        } else {
            None
        }
    }

    /// Produces the request actually sent: same-origin requests go out unchanged, cross-origin
    /// requests are rewritten to the proxy relay.
    fn network_request(&self, request: &AgentRequest, mode: CacheMode) -> AgentRequest {
        let mut outgoing = request.clone();
        outgoing.cache_mode = mode;

        if !self.is_same_origin(&request.url) {
            let mut url = self.origin.clone();
            url.set_path(&self.proxy_path);
            url.query_pairs_mut()
                .clear()
                .append_pair("url", request.url.as_str());
            url.set_fragment(None);
            outgoing.url = url;
        }
        outgoing
    }

    /// Handles an intercepted request. Returns `None` for requests the agent doesn’t intercept
    /// (anything but `GET`), these should go to the network unchanged.
    pub async fn handle(&self, request: AgentRequest) -> Option<AgentResponse> {
        if request.method != Method::GET {
            return None;
        }

        let mut state = State::Lookup;
        loop {
            state = match state {
                State::Lookup => match self.cache.get(&request).await {
                    Some(cached) => State::Validate(cached),
                    None => State::Fetch {
                        mode: CacheMode::Default,
                        fallback: None,
                    },
                },
                // Pages carry the manifest, serving them from cache would freeze it
                State::Validate(cached) if cached.headers.contains_key(MANIFEST_HEADER) => {
                    State::Fetch {
                        mode: CacheMode::Default,
                        fallback: Some(cached),
                    }
                }
                State::Validate(cached) => {
                    match (self.expected_etag(&request.url), self.policy) {
                        (Some(expected), _) if cached.etag() == Some(expected.as_str()) => {
                            trace!("serving {} from cache", request.url);
                            State::Done(cached)
                        }
                        (Some(_), _) => {
                            debug!("cached {} is outdated", request.url);
                            State::Fetch {
                                mode: CacheMode::Reload,
                                fallback: Some(cached),
                            }
                        }
                        (None, UnknownEntryPolicy::Serve) => State::Done(cached),
                        (None, UnknownEntryPolicy::Revalidate) => State::Fetch {
                            mode: CacheMode::Default,
                            fallback: Some(cached),
                        },
                    }
                }
                State::Fetch { mode, fallback } => {
                    let outgoing = self.network_request(&request, mode);
                    match self.network.fetch(outgoing).await {
                        Ok(response) => {
                            if let Some(json) = response
                                .headers
                                .get(MANIFEST_HEADER)
                                .and_then(|value| value.to_str().ok())
                            {
                                self.update_page_manifest(json, &request.url);
                            }
                            // Partial responses can't be replayed for other requests
                            if response.status.is_success()
                                && response.status != StatusCode::PARTIAL_CONTENT
                            {
                                self.cache.put(&request, response.clone()).await;
                            }
                            State::Done(response)
                        }
                        Err(err) => {
                            debug!("fetching {} failed: {err}", request.url);
                            State::Done(fallback.unwrap_or_else(AgentResponse::service_unavailable))
                        }
                    }
                }
                State::Done(response) => return Some(response),
            }
        }
    }
}
