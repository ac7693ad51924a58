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

//! Periodic revalidation of remote registry entries

use async_trait::async_trait;
use http::{header, StatusCode};
use log::{debug, info, trace};
use module_utils::pingora::{BackgroundService, Error, ErrorType, ShutdownWatch};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use url::Url;

use crate::registry::EtagRegistry;

/// Background service refreshing the ETags of all remote URLs in the registry
///
/// Each sweep sends a `HEAD` request for every registered `http://` or `https://` key. A `200 OK`
/// response with an `ETag` header replaces the registered value, any other outcome leaves the
/// entry unchanged.
#[derive(Debug)]
pub struct Revalidator {
    registry: Arc<EtagRegistry>,
    client: reqwest::Client,
    interval: Duration,
}

impl Revalidator {
    /// Creates a new revalidator sweeping every `interval`, each request limited to `timeout`.
    pub fn new(
        registry: Arc<EtagRegistry>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self, Box<Error>> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                Error::because(
                    ErrorType::InternalError,
                    "failed creating revalidation HTTP client",
                    err,
                )
            })?;

        Ok(Self {
            registry,
            client,
            interval,
        })
    }

    /// Starts revalidating all remote registry entries. Every request runs in its own task, the
    /// method returns immediately.
    pub fn sweep(&self) -> Vec<JoinHandle<()>> {
        let keys = self.registry.keys();
        debug!("revalidating {} registry entries", keys.len());

        keys.into_iter()
            .filter(|key| {
                Url::parse(key).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
            })
            .map(|key| {
                let client = self.client.clone();
                let registry = self.registry.clone();
                tokio::spawn(async move { revalidate(&client, &registry, &key).await })
            })
            .collect()
    }
}

async fn revalidate(client: &reqwest::Client, registry: &EtagRegistry, key: &str) {
    let response = match client.head(key).send().await {
        Ok(response) => response,
        Err(err) => {
            debug!("revalidating {key} failed: {err}");
            return;
        }
    };

    if response.status() != StatusCode::OK {
        debug!("revalidating {key} produced status {}", response.status());
        return;
    }

    let etag = response
        .headers()
        .get(header::ETAG)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if registry.refresh(key, etag) {
        trace!("refreshed ETag of {key}: {etag}");
    }
}

#[async_trait]
impl BackgroundService for Revalidator {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        info!(
            "starting ETag revalidation, interval {}s",
            self.interval.as_secs()
        );

        let mut ticks = interval_at(Instant::now() + self.interval, self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("stopping ETag revalidation");
                    return;
                }
                _ = ticks.tick() => {
                    // Tasks are left running, a slow server must not delay the next sweep.
                    let _ = self.sweep();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;
    use tokio::sync::watch;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn run_sweep(revalidator: &Revalidator) {
        for handle in revalidator.sweep() {
            handle.await.unwrap();
        }
    }

    fn make_revalidator(registry: &Arc<EtagRegistry>, timeout: Duration) -> Revalidator {
        Revalidator::new(registry.clone(), Duration::from_secs(600), timeout).unwrap()
    }

    #[test(tokio::test)]
    async fn refreshes_changed_etag() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/a.js"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"new\""))
            .expect(1)
            .mount(&server)
            .await;

        let registry = Arc::new(EtagRegistry::default());
        let key = format!("{}/a.js", server.uri());
        registry.set(&key, "\"old\"");

        run_sweep(&make_revalidator(&registry, Duration::from_secs(10))).await;
        assert_eq!(registry.get(&key).as_deref(), Some("\"new\""));
    }

    #[test(tokio::test)]
    async fn keeps_entry_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/gone.js"))
            .respond_with(ResponseTemplate::new(404).insert_header("ETag", "\"404\""))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/no-etag.js"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let registry = Arc::new(EtagRegistry::default());
        let gone = format!("{}/gone.js", server.uri());
        let no_etag = format!("{}/no-etag.js", server.uri());
        registry.set(&gone, "\"old\"");
        registry.set(&no_etag, "\"old\"");

        run_sweep(&make_revalidator(&registry, Duration::from_secs(10))).await;
        assert_eq!(registry.get(&gone).as_deref(), Some("\"old\""));
        assert_eq!(registry.get(&no_etag).as_deref(), Some("\"old\""));
    }

    #[test(tokio::test)]
    async fn times_out_slow_servers() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/slow.js"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"new\"")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let registry = Arc::new(EtagRegistry::default());
        let key = format!("{}/slow.js", server.uri());
        registry.set(&key, "\"old\"");

        run_sweep(&make_revalidator(&registry, Duration::from_millis(100))).await;
        assert_eq!(registry.get(&key).as_deref(), Some("\"old\""));
    }

    #[test(tokio::test)]
    async fn skips_local_keys() {
        let registry = Arc::new(EtagRegistry::default());
        registry.set("/logo.png", "\"local\"");
        registry.set("ftp://example.com/file", "\"ftp\"");

        let revalidator = make_revalidator(&registry, Duration::from_secs(10));
        assert!(revalidator.sweep().is_empty());
        assert_eq!(registry.get("/logo.png").as_deref(), Some("\"local\""));
    }

    #[test(tokio::test)]
    async fn background_service_sweeps_until_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/a.js"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"new\""))
            .mount(&server)
            .await;

        let registry = Arc::new(EtagRegistry::default());
        let key = format!("{}/a.js", server.uri());
        registry.set(&key, "\"old\"");

        let revalidator = Arc::new(
            Revalidator::new(
                registry.clone(),
                Duration::from_millis(50),
                Duration::from_secs(10),
            )
            .unwrap(),
        );
        let (sender, receiver) = watch::channel(false);
        let service = {
            let revalidator = revalidator.clone();
            tokio::spawn(async move { revalidator.start(receiver).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        sender.send(true).unwrap();
        service.await.unwrap();

        assert_eq!(registry.get(&key).as_deref(), Some("\"new\""));
    }
}
