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

//! # Cache sync server
//!
//! A web server exposing a directory with static content via `cache-sync-module`. It combines
//! the module’s command line options with the usual server command line options and its config
//! file settings with [Pingora’s](ServerConf). In addition, it provides the following setting:
//!
//! * `listen` (`--listen` as command line flag): A list of IP address/port combinations the server
//!   should listen on, e.g. `0.0.0.0:8080`.
//!
//! The ETag registry of the handler is revalidated periodically by a background service. You can
//! run the server with the following command:
//!
//! ```sh
//! cargo run --package cache-sync-server -- -c config.yaml
//! ```
//!
//! To enable debugging output you can use the `RUST_LOG` environment variable:
//!
//! ```sh
//! RUST_LOG=debug cargo run --package cache-sync-server -- -c config.yaml
//! ```

use async_trait::async_trait;
use cache_sync_module::{CacheSyncHandler, CacheSyncOpt};
use clap::{Args, Parser};
use log::error;
use module_utils::pingora::{
    background_service, http_proxy_service, Error, ErrorType, HttpPeer, ProxyHttp, Server,
    ServerConf, ServerOpt, Session,
};
use module_utils::{merge_conf, merge_opt, FromYaml, RequestFilter};
use serde::Deserialize;

/// The application implementing the Pingora Proxy interface
struct CacheSyncApp {
    handler: CacheSyncHandler,
}

impl CacheSyncApp {
    /// Creates a new application instance with the given handler.
    fn new(handler: CacheSyncHandler) -> Self {
        Self { handler }
    }
}

/// Command line options of this application
#[derive(Debug, Args)]
struct ServerAppOpt {
    /// Address and port to listen on, e.g. "127.0.0.1:8080". This command line flag can be
    /// specified multiple times.
    #[clap(short, long)]
    listen: Option<Vec<String>>,
    /// Use this flag to make the server run in the background.
    #[clap(short, long)]
    daemon: bool,
    /// Test the configuration and exit. This is useful to validate the configuration before
    /// restarting the process.
    #[clap(short, long)]
    test: bool,
    /// The path to the configuration file. This command line flag can be specified multiple times.
    #[clap(short, long)]
    conf: Option<Vec<String>>,
}

merge_opt! {
    /// Run a web server keeping browser caches in sync with a directory of static content.
    struct Opt {
        app: ServerAppOpt,
        cache_sync: CacheSyncOpt,
    }
}

/// Application-specific configuration settings
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerAppConf {
    /// List of address/port combinations to listen on, e.g. "127.0.0.1:8080".
    listen: Vec<String>,
}

merge_conf! {
    /// The combined configuration of Pingora server and [`CacheSyncHandler`].
    struct Conf {
        app: ServerAppConf,
        server: ServerConf,
        handler: <CacheSyncHandler as RequestFilter>::Conf,
    }
}

#[async_trait]
impl ProxyHttp for CacheSyncApp {
    type CTX = <CacheSyncHandler as RequestFilter>::CTX;

    fn new_ctx(&self) -> Self::CTX {
        CacheSyncHandler::new_ctx()
    }

    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<bool, Box<Error>> {
        self.handler.handle(session, ctx).await
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>, Box<Error>> {
        Err(Error::new(ErrorType::HTTPStatus(404)))
    }
}

fn main() {
    env_logger::init();

    let opt = Opt::parse();
    let mut conf = match Conf::load_from_files(opt.app.conf.unwrap_or_default()) {
        Ok(conf) => conf,
        Err(err) => {
            error!("{err}");
            Conf::default()
        }
    };

    if conf.app.listen.is_empty() {
        // Make certain we have a listening address
        conf.app.listen.push("127.0.0.1:8080".to_owned());
        conf.app.listen.push("[::1]:8080".to_owned());
    }

    let mut server = Server::new_with_opt_and_conf(
        ServerOpt {
            daemon: opt.app.daemon,
            test: opt.app.test,
            upgrade: false,
            nocapture: false,
            conf: None,
        },
        conf.server,
    );
    server.bootstrap();

    conf.handler.merge_with_opt(opt.cache_sync);

    let handler = match CacheSyncHandler::new(conf.handler) {
        Ok(handler) => handler,
        Err(err) => {
            error!("{err}");
            return;
        }
    };

    let revalidator = match handler.revalidator() {
        Ok(revalidator) => revalidator,
        Err(err) => {
            error!("{err}");
            return;
        }
    };
    server.add_service(background_service("revalidation", revalidator));

    let mut proxy = http_proxy_service(&server.configuration, CacheSyncApp::new(handler));
    for addr in opt.app.listen.unwrap_or(conf.app.listen) {
        proxy.add_tcp(&addr);
    }
    server.add_service(proxy);

    server.run_forever();
}
