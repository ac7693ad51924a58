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

//! Same-origin relay for cross-origin resources
//!
//! The cache agent cannot read the `ETag` header of most cross-origin responses. Instead it
//! fetches such resources via `/proxy-resource?url=<target>`, and the relay records the ETags it
//! sees in the registry.

use http::{header, HeaderMap, Method, StatusCode};
use log::{debug, error, info, warn};
use module_utils::pingora::{Error, ErrorType, ResponseHeader, Session};
use module_utils::standard_response::error_response;
use std::fmt::Display;
use std::sync::Arc;
use url::Url;

use crate::registry::EtagRegistry;

/// Request headers passed on to the target server
const FORWARDED_HEADERS: &[header::HeaderName] = &[header::USER_AGENT, header::ACCEPT];

/// Response headers never relayed to the client
const STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "transfer-encoding",
    "keep-alive",
    "trailer",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "set-cookie",
    "strict-transport-security",
    "server",
];

/// The error type returned when a resource cannot be relayed
#[derive(Debug)]
pub enum RelayError {
    /// No `url` query parameter
    MissingTarget,
    /// The `url` query parameter isn’t a valid URL
    InvalidTarget(url::ParseError),
    /// The target URL has a scheme other than `http` or `https`
    UnsupportedScheme(String),
    /// The target server could not be reached
    Upstream(reqwest::Error),
}

impl RelayError {
    /// HTTP status code to respond with
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingTarget | Self::InvalidTarget(_) | Self::UnsupportedScheme(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::MissingTarget => write!(f, "Missing url parameter"),
            Self::InvalidTarget(err) => write!(f, "Invalid target URL: {err}"),
            Self::UnsupportedScheme(scheme) => write!(f, "Unsupported URL scheme: {scheme}"),
            Self::Upstream(err) => write!(f, "Failed fetching target: {err}"),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidTarget(err) => Some(err),
            Self::Upstream(err) => Some(err),
            _ => None,
        }
    }
}

/// Extracts the target URL from the query string of a relay request. Returns the raw parameter
/// value along with the parsed URL.
pub fn parse_target(query: Option<&str>) -> Result<(String, Url), RelayError> {
    let raw = url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
        .find(|(name, _)| name == "url")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
        .ok_or(RelayError::MissingTarget)?;

    let url = Url::parse(&raw).map_err(RelayError::InvalidTarget)?;
    match url.scheme() {
        "http" | "https" => Ok((raw, url)),
        scheme => Err(RelayError::UnsupportedScheme(scheme.to_owned())),
    }
}

/// Checks whether a response header should be passed on to the client.
pub fn is_relayed_header(name: &header::HeaderName) -> bool {
    !STRIPPED_HEADERS.contains(&name.as_str())
}

/// Forwards requests to external servers and records the ETags of their responses
#[derive(Debug)]
pub struct ProxyRelay {
    client: reqwest::Client,
    registry: Arc<EtagRegistry>,
}

impl ProxyRelay {
    /// Creates a new relay recording ETags in the given registry.
    pub fn new(registry: Arc<EtagRegistry>) -> Result<Self, Box<Error>> {
        let client = reqwest::Client::builder().build().map_err(|err| {
            Error::because(
                ErrorType::InternalError,
                "failed creating proxy HTTP client",
                err,
            )
        })?;
        Ok(Self { client, registry })
    }

    /// Sends the request to the target server, forwarding only the `User-Agent` and `Accept`
    /// request headers. If the response has an `ETag` header, it is recorded in the registry
    /// under the raw target string.
    pub async fn fetch(
        &self,
        method: Method,
        raw_target: &str,
        target: Url,
        request_headers: &HeaderMap,
    ) -> Result<reqwest::Response, RelayError> {
        let mut headers = HeaderMap::new();
        for name in FORWARDED_HEADERS {
            if let Some(value) = request_headers.get(name) {
                headers.insert(name.clone(), value.clone());
            }
        }

        let response = self
            .client
            .request(method, target)
            .headers(headers)
            .send()
            .await
            .map_err(RelayError::Upstream)?;

        if let Some(etag) = response
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
        {
            self.registry.set(raw_target, etag);
        }

        Ok(response)
    }

    /// Handles a relay request: validates the target, fetches it and streams the response back.
    pub async fn handle(&self, session: &mut Session) -> Result<(), Box<Error>> {
        let method = session.req_header().method.clone();
        if method != Method::GET && method != Method::HEAD {
            warn!("Denying method {method} for proxy relay");
            error_response(session, StatusCode::METHOD_NOT_ALLOWED).await?;
            return Ok(());
        }

        let (raw_target, target) = match parse_target(session.req_header().uri.query()) {
            Ok(target) => target,
            Err(err) => {
                info!("rejecting proxy request: {err}");
                error_response(session, err.status()).await?;
                return Ok(());
            }
        };

        debug!("relaying {method} request to {raw_target}");
        let mut response = match self
            .fetch(method.clone(), &raw_target, target, &session.req_header().headers)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!("proxy request to {raw_target} failed: {err}");
                error_response(session, err.status()).await?;
                return Ok(());
            }
        };

        let mut header = ResponseHeader::build(response.status(), Some(response.headers().len()))?;
        for (name, value) in response.headers() {
            if is_relayed_header(name) {
                header.append_header(name.clone(), value.clone())?;
            }
        }
        session.write_response_header(Box::new(header)).await?;

        if method == Method::HEAD {
            return Ok(());
        }

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => session.write_response_body(chunk).await?,
                Ok(None) => break,
                Err(err) => {
                    error!("failed relaying response body of {raw_target}: {err}");
                    return Err(Error::new(ErrorType::HTTPStatus(
                        StatusCode::INTERNAL_SERVER_ERROR.into(),
                    )));
                }
            }
        }
        Ok(())
    }
}
