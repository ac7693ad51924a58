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

//! # Cache Sync Module for Pingora
//!
//! This crate allows extending [Pingora Proxy](https://github.com/cloudflare/pingora) with the
//! capability to serve static files in a way that lets browsers keep their caches in sync without
//! revalidating every resource.
//!
//! ## How it works
//!
//! * HTML pages requested with the `X-CacheV2-Extension-Enabled: true` header are scanned for
//!   `<img>`, `<link>` and `<script>` elements referencing local files. The ETags of these files
//!   are sent along with the page in the `X-Etag-Config` response header, and a bootstrap script
//!   installing the cache agent is inserted into the page.
//! * The cache agent is a service worker served under `/sw.js`. It keeps responses in the browser
//!   cache and serves them without any network access as long as their ETags match the manifest.
//! * Cross-origin resources are fetched via the proxy relay under `/proxy-resource?url=…`. The
//!   relay records the ETags of these resources in a registry, so that subsequent page loads can
//!   include them in the manifest. A background service revalidates the registry periodically.
//!
//! Other requests are served as static files from the root directory. Range and conditional
//! requests are not supported.
//!
//! ## Code example
//!
//! You will typically create a [`CacheSyncHandler`] instance and make your server call it during
//! the `request_filter` stage. It will handle all requests so that subsequent stages won’t be
//! reached at all. The revalidation sweep has to be added to the server as a background service.
//!
//! ```rust,no_run
//! use cache_sync_module::{CacheSyncConf, CacheSyncHandler, CacheSyncOpt};
//! use clap::Parser;
//! use module_utils::pingora::background_service;
//! use module_utils::{FromYaml, RequestFilter};
//!
//! let opt = CacheSyncOpt::parse();
//! let mut conf = CacheSyncConf::load_from_yaml("conf.yaml").unwrap();
//! conf.merge_with_opt(opt);
//!
//! let handler = CacheSyncHandler::new(conf).unwrap();
//! let revalidation = background_service("revalidation", handler.revalidator().unwrap());
//!
//! // Add handler and revalidation service to the server here
//! ```

pub mod agent;
mod configuration;
mod file_writer;
mod handler;
pub mod html;
pub mod manifest;
pub mod metadata;
pub mod path;
pub mod proxy;
pub mod registry;
pub mod revalidator;
pub mod rewriter;
pub mod scanner;

pub use agent::{CacheAgent, UnknownEntryPolicy};
pub use configuration::{CacheSyncConf, CacheSyncOpt};
pub use handler::CacheSyncHandler;
pub use manifest::{EtagManifest, MANIFEST_HEADER};
pub use registry::EtagRegistry;
pub use revalidator::Revalidator;
